use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::RegistrationError;

/// Terminal-state report from a remote verification backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteVerificationState {
    /// More responses are needed; the prompts should be shown again.
    Pending,
    Complete,
    /// Terminal for the workflow instance; the user must restart.
    Failed,
}

/// One question the backend wants answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePrompt {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome {
    pub state: RemoteVerificationState,
    pub error: Option<String>,
}

/// Pluggable proof-of-identity backend (external verification system).
///
/// The sequencer and engine only ever depend on this interface, never on a
/// concrete backend. The backend is driven to `Complete` or `Failed` before
/// token-based channels run.
#[async_trait]
pub trait RemoteVerifier: Send + Sync {
    /// Prompts to present for the in-progress form.
    async fn present(
        &self,
        form_data: &BTreeMap<String, String>,
    ) -> Result<Vec<RemotePrompt>, RegistrationError>;

    /// Submit collected answers and learn the verification state.
    async fn respond(
        &self,
        answers: &BTreeMap<String, String>,
    ) -> Result<RemoteOutcome, RegistrationError>;
}
