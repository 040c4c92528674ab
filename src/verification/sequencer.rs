use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ProfileConfig;
use crate::error::{RegistrationError, TokenError, TokenFailure};
use crate::external::NotificationSender;
use crate::form::schema::VerificationChannel;
use crate::state::WorkflowState;
use crate::token::{TokenCodec, TokenDestination, TokenKind, TokenPayload};

/// Drives token verification of contact fields, one field at a time in the
/// profile's form order.
///
/// Codes are never stored server-side. Each dispatched code lives inside an
/// encrypted bearer token; the session only holds the opaque ciphertext, so
/// entering the short code is enough to redeem it.
pub struct VerificationSequencer {
    codec: Arc<TokenCodec>,
    notifier: Arc<dyn NotificationSender>,
}

impl VerificationSequencer {
    pub fn new(codec: Arc<TokenCodec>, notifier: Arc<dyn NotificationSender>) -> Self {
        Self { codec, notifier }
    }

    /// The fields this submission obligates the user to prove: every
    /// verified field that actually received a value.
    pub fn compute_required(
        profile: &ProfileConfig,
        state: &WorkflowState,
    ) -> BTreeSet<String> {
        profile
            .verification_fields()
            .filter(|field| {
                state
                    .form_data
                    .get(&field.name)
                    .is_some_and(|value| !value.is_empty())
            })
            .map(|field| field.name.clone())
            .collect()
    }

    /// Issue and dispatch a code for the first still-pending field.
    ///
    /// Returns the destination the code went to, or `None` when nothing is
    /// pending. Sets `current_verification_field`, `token_sent` and
    /// `pending_token` on success.
    pub async fn issue_next(
        &self,
        profile: &ProfileConfig,
        state: &mut WorkflowState,
    ) -> Result<Option<TokenDestination>, RegistrationError> {
        let field_name = match state.pending_verification_fields(profile).next() {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };

        let field = profile.field(&field_name).ok_or_else(|| {
            RegistrationError::Sequencing(format!("unknown verification field '{field_name}'"))
        })?;
        let channel = field.field_type.channel().ok_or_else(|| {
            RegistrationError::Sequencing(format!(
                "field '{field_name}' has no verification channel"
            ))
        })?;
        let address = state
            .form_data
            .get(&field_name)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| {
                RegistrationError::Sequencing(format!(
                    "no submitted value for verification field '{field_name}'"
                ))
            })?;

        let code = generate_code();
        let destination = TokenDestination {
            channel,
            address: address.clone(),
        };

        // email tokens carry the full snapshot so a deferred link can resume
        // the session; sms tokens bind only the code to its destination
        let payload = match channel {
            VerificationChannel::Email => TokenPayload::FormState {
                destination: destination.clone(),
                code: code.clone(),
                profile_id: state.profile_id.clone().unwrap_or_default(),
                form_data: state.form_data.clone(),
                remote_input_data: state.remote_input_data.clone(),
                completed_verification_fields: state.completed_verification_fields.clone(),
                current_verification_field: Some(field_name.clone()),
            },
            VerificationChannel::Sms => TokenPayload::EmailOtp {
                destination: destination.clone(),
                code: code.clone(),
            },
        };

        let opaque = self.codec.issue(payload)?;
        let message = format!("Your verification code is {code}");
        self.notifier
            .send(channel, &address, &message)
            .await
            .map_err(|e| RegistrationError::Notification(e.to_string()))?;

        state.current_verification_field = Some(field_name.clone());
        state.token_sent = true;
        state.pending_token = Some(opaque);

        info!(field = %field_name, channel = ?channel, "verification code dispatched");
        Ok(Some(destination))
    }

    /// Redeem the in-flight code for the current field.
    ///
    /// On success the field moves to completed and the in-flight token is
    /// cleared. On failure the state is untouched, so the user may retry
    /// without a re-issue.
    pub fn redeem_code(
        &self,
        profile: &ProfileConfig,
        state: &mut WorkflowState,
        entered_code: &str,
    ) -> Result<(), TokenError> {
        let field_name = state
            .current_verification_field
            .clone()
            .ok_or_else(|| TokenFailure::KindMismatch.conceal())?;
        let opaque = state
            .pending_token
            .clone()
            .ok_or_else(|| TokenFailure::Undecodable.conceal())?;

        let channel = profile
            .field(&field_name)
            .and_then(|field| field.field_type.channel())
            .ok_or_else(|| TokenFailure::KindMismatch.conceal())?;
        let expected = match channel {
            VerificationChannel::Email => TokenKind::FormState,
            VerificationChannel::Sms => TokenKind::EmailOtp,
        };

        let payload = self.codec.redeem(&opaque, expected)?;
        match payload {
            TokenPayload::EmailOtp { destination, code } => {
                if code != entered_code {
                    return Err(TokenFailure::CodeIncorrect.conceal());
                }
                // the value the code was sent to must still be the value on
                // the form, otherwise an edit would launder an old proof
                if state.form_data.get(&field_name) != Some(&destination.address) {
                    return Err(TokenFailure::FormMismatch.conceal());
                }
            }
            TokenPayload::FormState {
                code, form_data, ..
            } => {
                if code != entered_code {
                    return Err(TokenFailure::CodeIncorrect.conceal());
                }
                if form_data != state.form_data {
                    debug!(field = %field_name, "form changed since issuance, restoring snapshot");
                    state.form_data = form_data;
                    // restored values may obligate a different field set
                    let required = Self::compute_required(profile, state);
                    state.required_verification_fields = required;
                }
            }
            TokenPayload::DnReference { .. } => {
                return Err(TokenFailure::KindMismatch.conceal());
            }
        }

        self.mark_complete(state, &field_name);
        Ok(())
    }

    /// Redeem an emailed deep link against a possibly fresh session.
    ///
    /// Possession of the full token is the proof; no short code is required.
    /// The snapshot inside the token rebuilds the workflow it was issued
    /// from, then the token's field is marked proven. The required field set
    /// is recomputed from the profile, never trusted from the token, so a
    /// link can only ever prove its own field.
    pub fn redeem_link(
        &self,
        profiles: &BTreeMap<String, ProfileConfig>,
        state: &mut WorkflowState,
        opaque: &str,
    ) -> Result<(), TokenError> {
        let payload = self.codec.redeem(opaque, TokenKind::FormState)?;
        let TokenPayload::FormState {
            profile_id,
            form_data,
            remote_input_data,
            completed_verification_fields,
            current_verification_field,
            ..
        } = payload
        else {
            return Err(TokenFailure::KindMismatch.conceal());
        };
        let profile = profiles
            .get(&profile_id)
            .ok_or_else(|| TokenFailure::Undecodable.conceal())?;
        let field_name = current_verification_field
            .ok_or_else(|| TokenFailure::KindMismatch.conceal())?;

        state.profile_id = Some(profile_id);
        state.form_passed = true;
        state.form_data = form_data;
        state.remote_input_data = remote_input_data;
        state.completed_verification_fields = completed_verification_fields;
        let required = Self::compute_required(profile, state);
        state.required_verification_fields = required;

        self.mark_complete(state, &field_name);
        info!(field = %field_name, "verification link redeemed");
        Ok(())
    }

    fn mark_complete(&self, state: &mut WorkflowState, field_name: &str) {
        state
            .required_verification_fields
            .insert(field_name.to_string());
        state
            .completed_verification_fields
            .insert(field_name.to_string());
        state.current_verification_field = None;
        state.token_sent = false;
        state.pending_token = None;
    }
}

pub(crate) fn generate_code() -> String {
    rand::rng().random_range(100_000..1_000_000).to_string()
}
