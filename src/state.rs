use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ProfileConfig;

/// Session-scoped state for one in-progress registration.
///
/// This is the single source of truth: the current step is always derived
/// from these fields, never stored. Every action takes the state by value
/// and returns the mutated version, so a request is one atomic
/// read-modify-write against the session store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub profile_id: Option<String>,
    /// Profile was pinned by the URL; suppresses the back-to-choice
    /// affordance and makes the selection immutable.
    pub url_specified_profile: bool,

    pub form_passed: bool,
    pub agreement_passed: bool,
    /// Remote-verification outcome; `None` until the verifier reports.
    pub external_responses_passed: Option<bool>,

    /// Last successfully validated submission, replaced wholesale.
    pub form_data: BTreeMap<String, String>,
    /// Pre-fill values from a signed upstream form; read-only once set.
    pub remote_input_data: Option<BTreeMap<String, String>>,

    /// Computed once from the profile when the form passes.
    pub required_verification_fields: BTreeSet<String>,
    /// Grows monotonically; membership means the field's channel was proven.
    pub completed_verification_fields: BTreeSet<String>,
    /// The one field currently awaiting a code; always pending.
    pub current_verification_field: Option<String>,
    /// Whether a code was dispatched for the current field.
    pub token_sent: bool,
    /// Opaque bearer token for the in-flight code, held so a short numeric
    /// code is enough to redeem it. Ciphertext only; no secret material.
    pub pending_token: Option<String>,

    /// Set exactly once when the directory write succeeds. Its presence is
    /// the sole signal that creation happened.
    pub create_start_time: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Verification fields still awaiting proof, in the profile's ordinal
    /// (form) order.
    pub fn pending_verification_fields<'a>(
        &'a self,
        profile: &'a ProfileConfig,
    ) -> impl Iterator<Item = &'a str> + 'a {
        profile
            .verification_fields()
            .map(|field| field.name.as_str())
            .filter(|name| {
                self.required_verification_fields.contains(*name)
                    && !self.completed_verification_fields.contains(*name)
            })
    }

    /// Discard everything; the only way any passed flag is ever unset.
    pub fn reset(&mut self) {
        *self = WorkflowState::default();
    }
}

/// The derived position in the workflow. Ordered: a valid completion never
/// moves to a lower step except through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    SelectingProfile,
    EnteringForm,
    VerifyingExternal,
    VerifyingToken,
    AcceptingAgreement,
    Creating,
    Waiting,
    Complete,
}

/// Recompute the next step from state. Evaluated fresh on every request;
/// first matching rule wins.
pub fn derive_step(
    state: &WorkflowState,
    profile: Option<&ProfileConfig>,
    now: DateTime<Utc>,
) -> Step {
    // a single configured profile is auto-selected by the engine before
    // derivation; reaching here without one means a choice is required
    let profile = match (state.profile_id.as_deref(), profile) {
        (Some(_), Some(profile)) => profile,
        _ => return Step::SelectingProfile,
    };

    if let Some(started) = state.create_start_time {
        let gate = started + chrono::Duration::seconds(profile.minimum_wait_seconds as i64);
        return if now >= gate { Step::Complete } else { Step::Waiting };
    }

    if !state.form_passed {
        return Step::EnteringForm;
    }

    if profile.external_verification && state.external_responses_passed != Some(true) {
        return Step::VerifyingExternal;
    }

    if state.pending_verification_fields(profile).next().is_some() {
        return Step::VerifyingToken;
    }

    if profile.agreement_text.is_some() && !state.agreement_passed {
        return Step::AcceptingAgreement;
    }

    Step::Creating
}
