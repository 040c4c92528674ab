// Welcome Mat - Self-Registration Workflow Engine
// This exposes the core components for testing and integration

pub mod config;
pub mod creation;
pub mod engine;
pub mod error;
pub mod external;
pub mod form;
pub mod password;
pub mod progress;
pub mod state;
pub mod telemetry;
pub mod token;
pub mod verification;

// Re-export key types for easy access
pub use config::{config, ProfileConfig, WelcomeMatConfig};
pub use creation::AccountCreator;
pub use engine::{
    Action, ProfileSummary, RegistrationEngine, RenderTarget, RequestContext, Response,
};
pub use error::{RegistrationError, TokenError, ValidationError};
pub use external::{CaptchaVerifier, DirectoryError, DirectoryStore, NotificationSender};
pub use form::{FieldType, FormFieldConfig, FormSchema, FormValidator, VerificationChannel};
pub use password::{check_password, MatchStatus, PasswordPolicy, VerificationResult};
pub use progress::{progress, ProgressInfo};
pub use state::{derive_step, Step, WorkflowState};
pub use telemetry::init_telemetry;
pub use token::{TokenCodec, TokenDestination, TokenKind, TokenPayload};
pub use verification::{
    RemoteOutcome, RemotePrompt, RemoteVerificationState, RemoteVerifier, VerificationSequencer,
};
