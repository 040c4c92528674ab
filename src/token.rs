use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{RegistrationError, TokenError, TokenFailure};
use crate::form::schema::VerificationChannel;

const NONCE_LEN: usize = 24;

/// Where a verification payload was (or will be) dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDestination {
    pub channel: VerificationChannel,
    pub address: String,
}

/// Discriminator for [`TokenPayload`], used as the expected kind at redeem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    EmailOtp,
    FormState,
    DnReference,
}

/// Self-describing bearer payload. Exists only as an encrypted blob handed
/// to the client; any process holding the key can verify it, so no
/// server-side token table is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TokenPayload {
    /// A one-time code bound to a destination, nothing else.
    EmailOtp {
        destination: TokenDestination,
        code: String,
    },
    /// A one-time code plus the full workflow snapshot at issuance, so a
    /// deferred email link can resume the session it was issued from.
    FormState {
        destination: TokenDestination,
        code: String,
        profile_id: String,
        form_data: BTreeMap<String, String>,
        remote_input_data: Option<BTreeMap<String, String>>,
        completed_verification_fields: BTreeSet<String>,
        current_verification_field: Option<String>,
    },
    /// An opaque reference to a created entry's location.
    DnReference { location: String },
}

impl TokenPayload {
    pub fn kind(&self) -> TokenKind {
        match self {
            TokenPayload::EmailOtp { .. } => TokenKind::EmailOtp,
            TokenPayload::FormState { .. } => TokenKind::FormState,
            TokenPayload::DnReference { .. } => TokenKind::DnReference,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    issued_at: DateTime<Utc>,
    #[serde(flatten)]
    payload: TokenPayload,
}

/// Encrypts and decrypts self-contained workflow tokens with a service-held
/// symmetric key. Redemption failures all surface as the same generic
/// [`TokenError`]; the real cause is only logged.
pub struct TokenCodec {
    key: [u8; 32],
    max_age: Duration,
}

impl TokenCodec {
    pub fn new(key: [u8; 32], max_age_seconds: u64) -> Self {
        Self {
            key,
            max_age: Duration::seconds(max_age_seconds as i64),
        }
    }

    /// Encrypt a payload into an opaque bearer string.
    pub fn issue(&self, payload: TokenPayload) -> Result<String, RegistrationError> {
        self.issue_at(payload, Utc::now())
    }

    fn issue_at(
        &self,
        payload: TokenPayload,
        issued_at: DateTime<Utc>,
    ) -> Result<String, RegistrationError> {
        let envelope = Envelope { issued_at, payload };
        let plaintext = serde_json::to_vec(&envelope)
            .map_err(|e| RegistrationError::Configuration(format!("token encoding failed: {e}")))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| RegistrationError::Configuration("bad token key length".to_string()))?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|_| RegistrationError::Configuration("token encryption failed".to_string()))?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(wire))
    }

    /// Decrypt and validate an opaque bearer string.
    ///
    /// Structural damage, a wrong key, an unknown tag, a kind mismatch and
    /// an exceeded age window are all reported identically.
    pub fn redeem(&self, opaque: &str, expected: TokenKind) -> Result<TokenPayload, TokenError> {
        self.redeem_at(opaque, expected, Utc::now())
    }

    fn redeem_at(
        &self,
        opaque: &str,
        expected: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<TokenPayload, TokenError> {
        let wire = URL_SAFE_NO_PAD
            .decode(opaque)
            .map_err(|_| TokenFailure::Undecodable.conceal())?;
        if wire.len() <= NONCE_LEN {
            return Err(TokenFailure::Undecodable.conceal());
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| TokenFailure::Undecodable.conceal())?;
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenFailure::Undecodable.conceal())?;

        let envelope: Envelope =
            serde_json::from_slice(&plaintext).map_err(|_| TokenFailure::Undecodable.conceal())?;

        if now - envelope.issued_at > self.max_age {
            return Err(TokenFailure::Expired.conceal());
        }
        if envelope.payload.kind() != expected {
            return Err(TokenFailure::KindMismatch.conceal());
        }

        Ok(envelope.payload)
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("max_age", &self.max_age)
            .finish()
    }
}
