use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ProfileConfig, WelcomeMatConfig};
use crate::creation::AccountCreator;
use crate::error::{RegistrationError, TokenFailure, ValidationError};
use crate::external::{CaptchaVerifier, DirectoryStore, NotificationSender};
use crate::form::schema::{FormSchema, VerificationChannel};
use crate::form::validator::FormValidator;
use crate::password::{self, MatchStatus, VerificationResult, FIELD_CONFIRM, FIELD_PASSWORD};
use crate::progress::{progress, ProgressInfo};
use crate::state::{derive_step, Step, WorkflowState};
use crate::token::{TokenCodec, TokenDestination, TokenKind, TokenPayload};
use crate::verification::remote::{RemotePrompt, RemoteVerificationState, RemoteVerifier};
use crate::verification::sequencer::{self, VerificationSequencer};

/// Per-request caller context, supplied by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// The caller already holds a session identity. Almost every action
    /// refuses such callers.
    pub authenticated: bool,
    /// Profile id pinned by the entry URL, if any.
    pub url_profile: Option<String>,
    /// Signed pre-fill values handed over by an upstream system. Applied
    /// once per workflow and read-only afterwards.
    pub remote_input: Option<BTreeMap<String, String>>,
}

/// Everything a caller can ask the workflow to do.
#[derive(Debug, Clone)]
pub enum Action {
    ProfileChoice {
        profile_id: String,
    },
    ProcessForm {
        fields: BTreeMap<String, String>,
        captcha_response: Option<String>,
    },
    /// Dry-run validation of a submission; mutates nothing.
    Validate {
        fields: BTreeMap<String, String>,
    },
    /// Redeem either the in-session short code or an emailed deep link.
    EnterCode {
        code: Option<String>,
        token: Option<String>,
    },
    ResendCode,
    EnterRemoteResponse {
        answers: BTreeMap<String, String>,
    },
    Agree,
    CheckProgress,
    Complete,
    Reset,
    /// Stateless email-ownership check, independent of any workflow.
    SendOtp {
        email: String,
    },
    VerifyOtp {
        token: String,
        code: String,
    },
    FormSchema {
        profile_id: Option<String>,
    },
    CheckUnique {
        field: String,
        value: String,
    },
    /// Evaluate a candidate password against the policy, with the submitted
    /// form as user-attribute context.
    CheckRules {
        fields: BTreeMap<String, String>,
    },
    DetermineRedirect {
        reference: String,
    },
    /// Single-call validate-and-create for non-interactive clients.
    CreateDirect {
        profile_id: String,
        fields: BTreeMap<String, String>,
    },
}

/// What the transport should do next.
#[derive(Debug, Clone)]
pub enum Response {
    Render(RenderTarget),
    Redirect(String),
    Logout { redirect_url: Option<String> },
    Progress(ProgressInfo),
    Validation(VerificationResult),
    Schema(FormSchema),
    Unique(bool),
    OtpIssued { token: String },
    OtpVerified { proof: String },
    CreatedReference { reference: String },
    RedirectTarget {
        location: String,
        redirect_url: Option<String>,
    },
}

/// The page (or page-equivalent) to show for the current step.
#[derive(Debug, Clone)]
pub enum RenderTarget {
    ProfileChoice { profiles: Vec<ProfileSummary> },
    Form { schema: FormSchema, show_back: bool },
    EnterCode { destination: TokenDestination },
    RemotePrompts { prompts: Vec<RemotePrompt> },
    Agreement { text: String },
    Wait { progress: ProgressInfo },
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSummary {
    pub id: String,
    pub display_name: String,
}

/// The registration workflow engine.
///
/// Owns no session storage: every call takes the caller's [`WorkflowState`]
/// and returns the successor state alongside the response. An error leaves
/// the caller's stored state untouched, so recoverable failures simply
/// re-render the step they occurred on.
pub struct RegistrationEngine {
    config: WelcomeMatConfig,
    validator: FormValidator,
    codec: Arc<TokenCodec>,
    sequencer: VerificationSequencer,
    creator: AccountCreator,
    notifier: Arc<dyn NotificationSender>,
    captcha: Option<Arc<dyn CaptchaVerifier>>,
    remote: Option<Arc<dyn RemoteVerifier>>,
}

impl RegistrationEngine {
    pub fn new(
        config: WelcomeMatConfig,
        token_key: [u8; 32],
        directory: Arc<dyn DirectoryStore>,
        notifier: Arc<dyn NotificationSender>,
    ) -> Self {
        let codec = Arc::new(TokenCodec::new(token_key, config.tokens.max_age_seconds));
        let validator = FormValidator::new(directory.clone(), &config.unique_cache);
        let sequencer = VerificationSequencer::new(codec.clone(), notifier.clone());
        let creator = AccountCreator::new(directory);
        Self {
            config,
            validator,
            codec,
            sequencer,
            creator,
            notifier,
            captcha: None,
            remote: None,
        }
    }

    pub fn with_captcha(mut self, verifier: Arc<dyn CaptchaVerifier>) -> Self {
        self.captcha = Some(verifier);
        self
    }

    pub fn with_remote_verifier(mut self, verifier: Arc<dyn RemoteVerifier>) -> Self {
        self.remote = Some(verifier);
        self
    }

    /// Handle one request against one workflow instance.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        action: Action,
        mut state: WorkflowState,
    ) -> Result<(Response, WorkflowState), RegistrationError> {
        if !self.config.enabled {
            return Err(RegistrationError::Configuration(
                "registration is disabled".to_string(),
            ));
        }
        if ctx.authenticated && !matches!(action, Action::Complete | Action::CheckProgress) {
            return Err(RegistrationError::AlreadyAuthenticated);
        }

        if let Some(id) = &ctx.url_profile {
            if !self.config.profiles.contains_key(id) {
                return Err(RegistrationError::Configuration(format!(
                    "unknown registration profile '{id}'"
                )));
            }
            if state.profile_id.as_deref() != Some(id) {
                state.reset();
                state.profile_id = Some(id.clone());
            }
            state.url_specified_profile = true;
        }
        if state.profile_id.is_none() && self.config.profiles.len() == 1 {
            state.profile_id = self.config.profiles.keys().next().cloned();
        }
        if let Some(input) = &ctx.remote_input {
            if state.remote_input_data.is_none() {
                state.remote_input_data = Some(input.clone());
            }
        }

        match action {
            Action::ProfileChoice { profile_id } => {
                if state.url_specified_profile {
                    return Err(RegistrationError::Sequencing(
                        "profile is fixed by the entry URL".to_string(),
                    ));
                }
                self.profile_by_id(&profile_id)?;
                if state.profile_id.as_deref() != Some(profile_id.as_str()) {
                    let remote_input = state.remote_input_data.clone();
                    state.reset();
                    state.remote_input_data = remote_input;
                    state.profile_id = Some(profile_id);
                }
                let response = self.render(&mut state).await?;
                Ok((response, state))
            }

            Action::ProcessForm {
                fields,
                captcha_response,
            } => {
                let profile = self.selected_profile(&state)?;
                if self.config.captcha_enabled && !state.form_passed {
                    self.check_captcha(captcha_response.as_deref()).await?;
                }

                let mut merged = fields;
                if let Some(remote_input) = &state.remote_input_data {
                    for (name, value) in remote_input {
                        merged.insert(name.clone(), value.clone());
                    }
                }

                let result = self.validator.validate(profile, &merged, true).await?;
                if !result.is_acceptable() {
                    return Err(result_to_error(&result).into());
                }

                // a changed value invalidates any proof issued against the
                // old one; an identical resubmission keeps the outstanding
                // code so the one already delivered still redeems
                let previous = std::mem::take(&mut state.form_data);
                state
                    .completed_verification_fields
                    .retain(|field| previous.get(field) == merged.get(field));
                if previous != merged {
                    state.current_verification_field = None;
                    state.token_sent = false;
                    state.pending_token = None;
                }
                state.form_data = merged;
                state.form_passed = true;
                let required = VerificationSequencer::compute_required(profile, &state);
                state.required_verification_fields = required;

                let response = self.render(&mut state).await?;
                Ok((response, state))
            }

            Action::Validate { fields } => {
                let profile = self.selected_profile(&state)?;
                let verdict = match self.validator.validate(profile, &fields, true).await {
                    Ok(result) => result,
                    Err(RegistrationError::Validation(e)) => VerificationResult {
                        passed: false,
                        strength: 0,
                        match_status: MatchStatus::Indeterminate,
                        message: Some(e.to_string()),
                    },
                    Err(other) => return Err(other),
                };
                Ok((Response::Validation(verdict), state))
            }

            Action::EnterCode { code, token } => {
                if let Some(token) = token.as_deref() {
                    self.sequencer
                        .redeem_link(&self.config.profiles, &mut state, token)?;
                    // the restored snapshot may be stale; re-check it against
                    // the store, bypassing the uniqueness cache
                    let profile = self.selected_profile(&state)?;
                    let result = self.validator.validate(profile, &state.form_data, false).await?;
                    if !result.is_acceptable() {
                        return Err(result_to_error(&result).into());
                    }
                } else {
                    let profile = self.selected_profile(&state)?;
                    let code = code.as_deref().ok_or_else(|| {
                        RegistrationError::Sequencing("no verification code supplied".to_string())
                    })?;
                    self.sequencer.redeem_code(profile, &mut state, code)?;
                }
                let response = self.render(&mut state).await?;
                Ok((response, state))
            }

            Action::ResendCode => {
                let profile = self.selected_profile(&state)?;
                if derive_step(&state, Some(profile), Utc::now()) != Step::VerifyingToken {
                    return Err(RegistrationError::Sequencing(
                        "no token verification in progress".to_string(),
                    ));
                }
                state.current_verification_field = None;
                state.token_sent = false;
                state.pending_token = None;
                let response = self.render(&mut state).await?;
                Ok((response, state))
            }

            Action::EnterRemoteResponse { answers } => {
                let profile = self.selected_profile(&state)?;
                if derive_step(&state, Some(profile), Utc::now()) != Step::VerifyingExternal {
                    return Err(RegistrationError::Sequencing(
                        "remote verification is not pending".to_string(),
                    ));
                }
                let remote = self.remote.as_ref().ok_or_else(|| {
                    RegistrationError::Configuration(
                        "no remote verification backend configured".to_string(),
                    )
                })?;
                let outcome = remote.respond(&answers).await?;
                match outcome.state {
                    RemoteVerificationState::Complete => {
                        state.external_responses_passed = Some(true);
                        let response = self.render(&mut state).await?;
                        Ok((response, state))
                    }
                    RemoteVerificationState::Failed => {
                        Err(RegistrationError::RemoteVerificationFailed(
                            outcome
                                .error
                                .unwrap_or_else(|| "responses were rejected".to_string()),
                        ))
                    }
                    RemoteVerificationState::Pending => {
                        let prompts = remote.present(&state.form_data).await?;
                        Ok((
                            Response::Render(RenderTarget::RemotePrompts { prompts }),
                            state,
                        ))
                    }
                }
            }

            Action::Agree => {
                let profile = self.selected_profile(&state)?;
                if derive_step(&state, Some(profile), Utc::now()) != Step::AcceptingAgreement {
                    return Err(RegistrationError::Sequencing(
                        "no agreement is pending".to_string(),
                    ));
                }
                state.agreement_passed = true;
                let response = self.render(&mut state).await?;
                Ok((response, state))
            }

            Action::CheckProgress => {
                let profile = self.selected_profile(&state)?;
                let started = state.create_start_time.ok_or_else(|| {
                    RegistrationError::Sequencing("no account creation in progress".to_string())
                })?;
                let info = progress(started, profile.minimum_wait_seconds, Utc::now());
                Ok((Response::Progress(info), state))
            }

            Action::Complete => {
                let profile = self.selected_profile(&state)?;
                let started = state.create_start_time.ok_or_else(|| {
                    RegistrationError::Sequencing(
                        "completion requested before creation".to_string(),
                    )
                })?;
                let info = progress(started, profile.minimum_wait_seconds, Utc::now());
                if !info.complete {
                    return Ok((
                        Response::Render(RenderTarget::Wait { progress: info }),
                        state,
                    ));
                }

                let redirect_url = profile.redirect_url.clone();
                let logout = profile.logout_after_creation;
                state.reset();
                info!("registration workflow completed");

                let response = if logout {
                    Response::Logout { redirect_url }
                } else if let Some(url) = redirect_url {
                    Response::Redirect(url)
                } else {
                    Response::Render(RenderTarget::Success)
                };
                Ok((response, state))
            }

            Action::Reset => {
                state.reset();
                if let Some(id) = &ctx.url_profile {
                    state.profile_id = Some(id.clone());
                    state.url_specified_profile = true;
                } else if self.config.profiles.len() == 1 {
                    state.profile_id = self.config.profiles.keys().next().cloned();
                }
                let response = self.render(&mut state).await?;
                Ok((response, state))
            }

            Action::SendOtp { email } => {
                let code = sequencer::generate_code();
                let destination = TokenDestination {
                    channel: VerificationChannel::Email,
                    address: email.clone(),
                };
                let token = self.codec.issue(TokenPayload::EmailOtp {
                    destination,
                    code: code.clone(),
                })?;
                self.notifier
                    .send(
                        VerificationChannel::Email,
                        &email,
                        &format!("Your verification code is {code}"),
                    )
                    .await
                    .map_err(|e| RegistrationError::Notification(e.to_string()))?;
                Ok((Response::OtpIssued { token }, state))
            }

            Action::VerifyOtp { token, code } => {
                let payload = self.codec.redeem(&token, TokenKind::EmailOtp)?;
                let TokenPayload::EmailOtp {
                    destination,
                    code: expected,
                } = payload
                else {
                    return Err(TokenFailure::KindMismatch.conceal().into());
                };
                if expected != code {
                    return Err(TokenFailure::CodeIncorrect.conceal().into());
                }
                let proof = self.codec.issue(TokenPayload::DnReference {
                    location: destination.address,
                })?;
                Ok((Response::OtpVerified { proof }, state))
            }

            Action::FormSchema { profile_id } => {
                let profile = match profile_id.as_deref() {
                    Some(id) => self.profile_by_id(id)?,
                    None => self.selected_profile(&state)?,
                };
                Ok((Response::Schema(schema_for(profile)), state))
            }

            Action::CheckUnique { field, value } => {
                let profile = self.selected_profile(&state)?;
                let unique = self
                    .validator
                    .check_unique_field(profile, &field, &value, true)
                    .await?;
                Ok((Response::Unique(unique), state))
            }

            Action::CheckRules { fields } => {
                let profile = self.selected_profile(&state)?;
                let candidate = fields.get(FIELD_PASSWORD).map(String::as_str).unwrap_or("");
                let confirmation = fields.get(FIELD_CONFIRM).map(String::as_str);
                let verdict = password::check_password(
                    candidate,
                    confirmation,
                    &profile.password_policy,
                    fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                );
                Ok((Response::Validation(verdict), state))
            }

            Action::DetermineRedirect { reference } => {
                let payload = self.codec.redeem(&reference, TokenKind::DnReference)?;
                let TokenPayload::DnReference { location } = payload else {
                    return Err(TokenFailure::KindMismatch.conceal().into());
                };
                let redirect_url = state
                    .profile_id
                    .as_deref()
                    .and_then(|id| self.config.profiles.get(id))
                    .and_then(|profile| profile.redirect_url.clone());
                Ok((
                    Response::RedirectTarget {
                        location,
                        redirect_url,
                    },
                    state,
                ))
            }

            Action::CreateDirect { profile_id, fields } => {
                let profile = self.profile_by_id(&profile_id)?;
                let result = self.validator.validate(profile, &fields, false).await?;
                if !result.is_acceptable() {
                    return Err(result_to_error(&result).into());
                }
                let direct = WorkflowState {
                    profile_id: Some(profile_id),
                    form_passed: true,
                    form_data: fields,
                    ..WorkflowState::default()
                };
                let location = self.creator.create(profile, &direct).await?;
                let reference = self.codec.issue(TokenPayload::DnReference { location })?;
                Ok((Response::CreatedReference { reference }, state))
            }
        }
    }

    /// Advance through steps that need no user input, then describe the
    /// first one that does. Bounded: each pass either returns or completes
    /// a step, and steps never repeat.
    async fn render(&self, state: &mut WorkflowState) -> Result<Response, RegistrationError> {
        for _ in 0..8 {
            let profile = state
                .profile_id
                .as_deref()
                .and_then(|id| self.config.profiles.get(id));
            let step = derive_step(state, profile, Utc::now());
            debug!(?step, "rendering workflow step");

            match step {
                Step::SelectingProfile => {
                    let profiles = self
                        .config
                        .profiles
                        .iter()
                        .map(|(id, profile)| ProfileSummary {
                            id: id.clone(),
                            display_name: profile.display_name.clone(),
                        })
                        .collect();
                    return Ok(Response::Render(RenderTarget::ProfileChoice { profiles }));
                }

                Step::EnteringForm => {
                    let profile = require_profile(profile)?;
                    if !profile.shows_form_page() {
                        // nothing to ask the user; submit the pre-supplied
                        // values straight through
                        let merged = state.remote_input_data.clone().unwrap_or_default();
                        let result = self.validator.validate(profile, &merged, true).await?;
                        if !result.is_acceptable() {
                            return Err(result_to_error(&result).into());
                        }
                        state.form_data = merged;
                        state.form_passed = true;
                        let required =
                            VerificationSequencer::compute_required(profile, state);
                        state.required_verification_fields = required;
                        continue;
                    }
                    let show_back =
                        !state.url_specified_profile && self.config.profiles.len() > 1;
                    return Ok(Response::Render(RenderTarget::Form {
                        schema: schema_for(profile),
                        show_back,
                    }));
                }

                Step::VerifyingExternal => {
                    let remote = self.remote.as_ref().ok_or_else(|| {
                        RegistrationError::Configuration(
                            "no remote verification backend configured".to_string(),
                        )
                    })?;
                    let prompts = remote.present(&state.form_data).await?;
                    return Ok(Response::Render(RenderTarget::RemotePrompts { prompts }));
                }

                Step::VerifyingToken => {
                    let profile = require_profile(profile)?;
                    if !state.token_sent {
                        self.sequencer.issue_next(profile, state).await?;
                    }
                    let destination = current_destination(profile, state)?;
                    return Ok(Response::Render(RenderTarget::EnterCode { destination }));
                }

                Step::AcceptingAgreement => {
                    let profile = require_profile(profile)?;
                    let text = profile.agreement_text.clone().ok_or_else(|| {
                        RegistrationError::Sequencing(
                            "agreement step without agreement text".to_string(),
                        )
                    })?;
                    return Ok(Response::Render(RenderTarget::Agreement { text }));
                }

                Step::Creating => {
                    let profile = require_profile(profile)?;
                    let location = self.creator.create(profile, state).await?;
                    debug!(%location, "entering post-creation wait window");
                    state.create_start_time = Some(Utc::now());
                    continue;
                }

                Step::Waiting => {
                    let profile = require_profile(profile)?;
                    let started = state.create_start_time.ok_or_else(|| {
                        RegistrationError::Sequencing(
                            "wait step without a creation time".to_string(),
                        )
                    })?;
                    let info = progress(started, profile.minimum_wait_seconds, Utc::now());
                    return Ok(Response::Render(RenderTarget::Wait { progress: info }));
                }

                Step::Complete => {
                    return Ok(Response::Render(RenderTarget::Success));
                }
            }
        }
        Err(RegistrationError::Sequencing(
            "workflow failed to settle on a step".to_string(),
        ))
    }

    async fn check_captcha(&self, response: Option<&str>) -> Result<(), RegistrationError> {
        let verifier = self.captcha.as_ref().ok_or_else(|| {
            RegistrationError::Configuration(
                "captcha is enabled but no verifier is configured".to_string(),
            )
        })?;
        if !verifier.verify(response.unwrap_or("")).await {
            return Err(ValidationError::BadCaptcha.into());
        }
        Ok(())
    }

    fn selected_profile(&self, state: &WorkflowState) -> Result<&ProfileConfig, RegistrationError> {
        state
            .profile_id
            .as_deref()
            .and_then(|id| self.config.profiles.get(id))
            .ok_or_else(|| {
                RegistrationError::Sequencing("no registration profile selected".to_string())
            })
    }

    fn profile_by_id(&self, id: &str) -> Result<&ProfileConfig, RegistrationError> {
        self.config.profiles.get(id).ok_or_else(|| {
            RegistrationError::Configuration(format!("unknown registration profile '{id}'"))
        })
    }
}

fn require_profile(profile: Option<&ProfileConfig>) -> Result<&ProfileConfig, RegistrationError> {
    profile.ok_or_else(|| {
        RegistrationError::Sequencing("no registration profile selected".to_string())
    })
}

fn current_destination(
    profile: &ProfileConfig,
    state: &WorkflowState,
) -> Result<TokenDestination, RegistrationError> {
    let field_name = state.current_verification_field.as_deref().ok_or_else(|| {
        RegistrationError::Sequencing("no verification field in flight".to_string())
    })?;
    let channel = profile
        .field(field_name)
        .and_then(|field| field.field_type.channel())
        .ok_or_else(|| {
            RegistrationError::Sequencing(format!(
                "field '{field_name}' has no verification channel"
            ))
        })?;
    let address = state
        .form_data
        .get(field_name)
        .cloned()
        .unwrap_or_default();
    Ok(TokenDestination { channel, address })
}

fn schema_for(profile: &ProfileConfig) -> FormSchema {
    FormSchema {
        fields: profile.form.clone(),
        password_rules: profile.password_policy.rule_descriptions(),
        prompt_for_password: profile.prompt_for_password,
        agreement_text: profile.agreement_text.clone(),
        redirect_url: profile.redirect_url.clone(),
        fields_for_verification: profile
            .verification_fields()
            .filter_map(|field| {
                field
                    .field_type
                    .channel()
                    .map(|channel| (field.name.clone(), channel))
            })
            .collect(),
    }
}

fn result_to_error(result: &VerificationResult) -> ValidationError {
    if result.match_status == MatchStatus::NoMatch {
        ValidationError::PasswordMismatch
    } else {
        ValidationError::PolicyViolation {
            reason: result
                .message
                .clone()
                .unwrap_or_else(|| "password was not accepted".to_string()),
        }
    }
}
