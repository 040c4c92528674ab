use thiserror::Error;
use tracing::debug;

/// Top-level error taxonomy for the registration workflow.
///
/// Recoverable variants (`Validation`, `Token`) re-render the current step;
/// they never unwind already-completed step flags. Everything else is
/// terminal for the request or for the workflow instance.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration is not available: {0}")]
    Configuration(String),

    #[error("caller is already authenticated")]
    AlreadyAuthenticated,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("request out of sequence: {0}")]
    Sequencing(String),

    #[error("account creation failed: {0}")]
    Creation(String),

    #[error("remote verification failed: {0}")]
    RemoteVerificationFailed(String),

    #[error("directory operation failed: {0}")]
    Directory(String),

    #[error("notification dispatch failed: {0}")]
    Notification(String),
}

/// Form and password validation failures. Attached to the current step only.
///
/// `DuplicateValue` names the conflicting field but never its value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field '{field}' is missing")]
    MissingRequired { field: String },

    #[error("field '{field}' has an invalid format")]
    BadFormat { field: String },

    #[error("the value for '{field}' is already in use")]
    DuplicateValue { field: String },

    #[error("field '{field}' is not defined in the form")]
    UnknownField { field: String },

    #[error("password does not meet policy: {reason}")]
    PolicyViolation { reason: String },

    #[error("passwords do not match")]
    PasswordMismatch,

    #[error("captcha response was not accepted")]
    BadCaptcha,
}

/// The only token failure callers ever see. The precise cause is logged at
/// the failure site and deliberately not carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("token is invalid or expired")]
pub struct TokenError;

/// Internal redemption failure causes. Collapsed to [`TokenError`] before
/// leaving the crate so a caller cannot distinguish a forged token from a
/// stale one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenFailure {
    Undecodable,
    Expired,
    KindMismatch,
    CodeIncorrect,
    FormMismatch,
}

impl TokenFailure {
    /// Log the real cause, hand back the generic error.
    pub(crate) fn conceal(self) -> TokenError {
        debug!(cause = ?self, "token redemption failed");
        TokenError
    }
}
