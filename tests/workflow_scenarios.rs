//! End-to-end workflow scenarios driven through the public engine API.

use std::collections::BTreeMap;
use std::sync::Arc;

use welcome_mat::external::mocks::{
    InMemoryDirectory, RecordingNotifier, ScriptedRemoteVerifier,
};
use welcome_mat::{
    Action, FieldType, FormFieldConfig, ProfileConfig, RegistrationEngine, RegistrationError,
    RenderTarget, RequestContext, Response, WelcomeMatConfig, WorkflowState,
};

fn build_engine(
    config: WelcomeMatConfig,
) -> (
    Arc<InMemoryDirectory>,
    Arc<RecordingNotifier>,
    RegistrationEngine,
) {
    let directory = Arc::new(InMemoryDirectory::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = RegistrationEngine::new(config, [42u8; 32], directory.clone(), notifier.clone());
    (directory, notifier, engine)
}

fn config_with_profile(profile: ProfileConfig) -> WelcomeMatConfig {
    let mut config = WelcomeMatConfig::default();
    config.profiles.insert("default".to_string(), profile);
    config
}

fn verified_email_profile() -> ProfileConfig {
    ProfileConfig {
        form: vec![
            FormFieldConfig::new("username", "Username", FieldType::Text)
                .required()
                .unique(),
            FormFieldConfig::new("email", "Email Address", FieldType::Email)
                .required()
                .unique()
                .verified(),
            FormFieldConfig::new("givenName", "First Name", FieldType::Text).required(),
            FormFieldConfig::new("sn", "Last Name", FieldType::Text).required(),
        ],
        ..ProfileConfig::default()
    }
}

fn valid_fields() -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("username".to_string(), "marisol".to_string());
    fields.insert("email".to_string(), "marisol@example.com".to_string());
    fields.insert("givenName".to_string(), "Marisol".to_string());
    fields.insert("sn".to_string(), "Reyes".to_string());
    fields.insert("password1".to_string(), "sturdy passw0rd".to_string());
    fields.insert("password2".to_string(), "sturdy passw0rd".to_string());
    fields
}

fn code_from(message: &str) -> String {
    message.rsplit(' ').next().expect("code").to_string()
}

#[tokio::test]
async fn single_profile_without_verification_completes_in_one_submission() {
    let (directory, _, engine) = build_engine(WelcomeMatConfig::default());
    let ctx = RequestContext::default();

    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");

    assert!(matches!(response, Response::Render(RenderTarget::Success)));
    assert!(directory.contains("username=marisol,ou=people"));

    let (response, state) = engine
        .handle(&ctx, Action::Complete, state)
        .await
        .expect("complete");
    assert!(matches!(response, Response::Render(RenderTarget::Success)));
    assert_eq!(state, WorkflowState::default());
}

#[tokio::test]
async fn multiple_profiles_require_an_explicit_choice() {
    let mut config = WelcomeMatConfig::default();
    config.profiles.insert(
        "guest".to_string(),
        ProfileConfig {
            display_name: "Guest Account".to_string(),
            ..ProfileConfig::default()
        },
    );
    let (_, _, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (response, state) = engine
        .handle(&ctx, Action::Reset, WorkflowState::default())
        .await
        .expect("initial render");
    let Response::Render(RenderTarget::ProfileChoice { profiles }) = response else {
        panic!("expected profile choice, got {response:?}");
    };
    assert_eq!(profiles.len(), 2);

    let err = engine
        .handle(
            &ctx,
            Action::ProfileChoice {
                profile_id: "does-not-exist".to_string(),
            },
            state.clone(),
        )
        .await
        .expect_err("invalid profile id");
    assert!(matches!(err, RegistrationError::Configuration(_)));

    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProfileChoice {
                profile_id: "guest".to_string(),
            },
            state,
        )
        .await
        .expect("choose profile");
    assert_eq!(state.profile_id.as_deref(), Some("guest"));
    let Response::Render(RenderTarget::Form { show_back, .. }) = response else {
        panic!("expected form, got {response:?}");
    };
    assert!(show_back);
}

#[tokio::test]
async fn email_verification_gates_creation() {
    let config = config_with_profile(verified_email_profile());
    let (directory, notifier, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");

    let Response::Render(RenderTarget::EnterCode { destination }) = response else {
        panic!("expected code entry, got {response:?}");
    };
    assert_eq!(destination.address, "marisol@example.com");
    assert!(!directory.contains("username=marisol,ou=people"));

    let code = code_from(&notifier.last().expect("code dispatched").message);

    // wrong guesses re-render the step without a re-issue
    for _ in 0..3 {
        let err = engine
            .handle(
                &ctx,
                Action::EnterCode {
                    code: Some("000000".to_string()),
                    token: None,
                },
                state.clone(),
            )
            .await
            .expect_err("wrong code");
        assert!(matches!(err, RegistrationError::Token(_)));
    }
    assert_eq!(notifier.sent().len(), 1);

    let (response, _) = engine
        .handle(
            &ctx,
            Action::EnterCode {
                code: Some(code),
                token: None,
            },
            state,
        )
        .await
        .expect("correct code");
    assert!(matches!(response, Response::Render(RenderTarget::Success)));
    assert!(directory.contains("username=marisol,ou=people"));
}

#[tokio::test]
async fn resend_dispatches_a_fresh_code() {
    let config = config_with_profile(verified_email_profile());
    let (_, notifier, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");

    let (response, state) = engine
        .handle(&ctx, Action::ResendCode, state)
        .await
        .expect("resend");
    assert!(matches!(
        response,
        Response::Render(RenderTarget::EnterCode { .. })
    ));
    assert_eq!(notifier.sent().len(), 2);

    let code = code_from(&notifier.last().expect("second code").message);
    let (response, _) = engine
        .handle(
            &ctx,
            Action::EnterCode {
                code: Some(code),
                token: None,
            },
            state,
        )
        .await
        .expect("redeem resent code");
    assert!(matches!(response, Response::Render(RenderTarget::Success)));
}

#[tokio::test]
async fn emailed_link_resumes_a_fresh_session() {
    let config = config_with_profile(verified_email_profile());
    let (directory, _, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");
    let link_token = state.pending_token.clone().expect("token in flight");

    // a brand new session, as if the link was opened in another browser
    let (response, resumed) = engine
        .handle(
            &ctx,
            Action::EnterCode {
                code: None,
                token: Some(link_token),
            },
            WorkflowState::default(),
        )
        .await
        .expect("redeem link");
    assert!(matches!(response, Response::Render(RenderTarget::Success)));
    assert!(resumed.completed_verification_fields.contains("email"));
    assert!(directory.contains("username=marisol,ou=people"));
}

#[tokio::test]
async fn emailed_link_proves_only_its_own_field() {
    let mut profile = verified_email_profile();
    profile.form.push(
        FormFieldConfig::new("mobile", "Mobile Number", FieldType::Phone).verified(),
    );
    let (directory, notifier, engine) = build_engine(config_with_profile(profile));
    let ctx = RequestContext::default();

    let mut fields = valid_fields();
    fields.insert("mobile".to_string(), "+1 555 0100".to_string());
    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields,
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");
    assert_eq!(state.current_verification_field.as_deref(), Some("email"));
    let link_token = state.pending_token.clone().expect("token in flight");

    // the link proves the email; the mobile obligation must survive it
    let (response, resumed) = engine
        .handle(
            &ctx,
            Action::EnterCode {
                code: None,
                token: Some(link_token),
            },
            WorkflowState::default(),
        )
        .await
        .expect("redeem link");
    assert!(!directory.contains("username=marisol,ou=people"));
    let Response::Render(RenderTarget::EnterCode { destination }) = response else {
        panic!("expected code entry for mobile, got {response:?}");
    };
    assert_eq!(destination.address, "+1 555 0100");
    assert!(resumed.required_verification_fields.contains("mobile"));

    let code = code_from(&notifier.last().expect("mobile code").message);
    let (response, _) = engine
        .handle(
            &ctx,
            Action::EnterCode {
                code: Some(code),
                token: None,
            },
            resumed,
        )
        .await
        .expect("verify mobile");
    assert!(matches!(response, Response::Render(RenderTarget::Success)));
    assert!(directory.contains("username=marisol,ou=people"));
}

#[tokio::test]
async fn identical_resubmission_keeps_the_outstanding_code() {
    let config = config_with_profile(verified_email_profile());
    let (_, notifier, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("first submission");
    let code = code_from(&notifier.last().expect("code").message);

    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            state,
        )
        .await
        .expect("identical resubmission");
    assert!(matches!(
        response,
        Response::Render(RenderTarget::EnterCode { .. })
    ));
    assert_eq!(notifier.sent().len(), 1);

    // the code from the first dispatch still redeems
    let (response, _) = engine
        .handle(
            &ctx,
            Action::EnterCode {
                code: Some(code),
                token: None,
            },
            state,
        )
        .await
        .expect("original code still valid");
    assert!(matches!(response, Response::Render(RenderTarget::Success)));
}

#[tokio::test]
async fn agreement_must_be_accepted_before_creation() {
    let config = config_with_profile(ProfileConfig {
        agreement_text: Some("I will be excellent to everyone.".to_string()),
        ..ProfileConfig::default()
    });
    let (directory, _, engine) = build_engine(config);
    let ctx = RequestContext::default();

    // agreeing before the form is out of sequence
    let err = engine
        .handle(&ctx, Action::Agree, WorkflowState::default())
        .await
        .expect_err("premature agree");
    assert!(matches!(err, RegistrationError::Sequencing(_)));

    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");
    let Response::Render(RenderTarget::Agreement { text }) = response else {
        panic!("expected agreement, got {response:?}");
    };
    assert!(text.contains("excellent"));
    assert!(!directory.contains("username=marisol,ou=people"));

    let (response, _) = engine
        .handle(&ctx, Action::Agree, state)
        .await
        .expect("agree");
    assert!(matches!(response, Response::Render(RenderTarget::Success)));
    assert!(directory.contains("username=marisol,ou=people"));
}

#[tokio::test]
async fn remote_verification_runs_before_token_verification() {
    let config = config_with_profile(ProfileConfig {
        external_verification: true,
        ..verified_email_profile()
    });
    let (_, notifier, engine) = build_engine(config);
    let engine = engine.with_remote_verifier(Arc::new(ScriptedRemoteVerifier {
        prompt: "What is your employee id?".to_string(),
        expected_answer: "e-1234".to_string(),
        fail_on_mismatch: false,
    }));
    let ctx = RequestContext::default();

    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");
    let Response::Render(RenderTarget::RemotePrompts { prompts }) = response else {
        panic!("expected remote prompts, got {response:?}");
    };
    assert_eq!(prompts.len(), 1);
    assert!(notifier.sent().is_empty());

    // a retryable wrong answer shows the prompts again
    let mut wrong = BTreeMap::new();
    wrong.insert("q1".to_string(), "nope".to_string());
    let (response, state) = engine
        .handle(
            &ctx,
            Action::EnterRemoteResponse { answers: wrong },
            state,
        )
        .await
        .expect("pending outcome");
    assert!(matches!(
        response,
        Response::Render(RenderTarget::RemotePrompts { .. })
    ));

    let mut right = BTreeMap::new();
    right.insert("q1".to_string(), "e-1234".to_string());
    let (response, _) = engine
        .handle(
            &ctx,
            Action::EnterRemoteResponse { answers: right },
            state,
        )
        .await
        .expect("complete outcome");
    assert!(matches!(
        response,
        Response::Render(RenderTarget::EnterCode { .. })
    ));
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test]
async fn failed_remote_verification_is_terminal() {
    let config = config_with_profile(ProfileConfig {
        external_verification: true,
        ..ProfileConfig::default()
    });
    let (_, _, engine) = build_engine(config);
    let engine = engine.with_remote_verifier(Arc::new(ScriptedRemoteVerifier {
        prompt: "What is your employee id?".to_string(),
        expected_answer: "e-1234".to_string(),
        fail_on_mismatch: true,
    }));
    let ctx = RequestContext::default();

    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");

    let mut wrong = BTreeMap::new();
    wrong.insert("q1".to_string(), "nope".to_string());
    let err = engine
        .handle(
            &ctx,
            Action::EnterRemoteResponse { answers: wrong },
            state,
        )
        .await
        .expect_err("terminal failure");
    assert!(matches!(err, RegistrationError::RemoteVerificationFailed(_)));
}

#[tokio::test]
async fn minimum_wait_window_defers_success() {
    let config = config_with_profile(ProfileConfig {
        minimum_wait_seconds: 60,
        ..ProfileConfig::default()
    });
    let (directory, _, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");

    // the entry exists but success is withheld until the window elapses
    assert!(directory.contains("username=marisol,ou=people"));
    let Response::Render(RenderTarget::Wait { progress }) = response else {
        panic!("expected wait, got {response:?}");
    };
    assert!(!progress.complete);

    let (response, state) = engine
        .handle(&ctx, Action::CheckProgress, state)
        .await
        .expect("check progress");
    let Response::Progress(info) = response else {
        panic!("expected progress, got {response:?}");
    };
    assert!(!info.complete);
    assert!(info.percent_complete < 100);

    let (response, _) = engine
        .handle(&ctx, Action::Complete, state)
        .await
        .expect("early complete");
    assert!(matches!(
        response,
        Response::Render(RenderTarget::Wait { .. })
    ));
}

#[tokio::test]
async fn completion_redirects_or_logs_out_per_profile() {
    let config = config_with_profile(ProfileConfig {
        redirect_url: Some("https://portal.example.com/home".to_string()),
        ..ProfileConfig::default()
    });
    let (_, _, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");
    let (response, _) = engine
        .handle(&ctx, Action::Complete, state)
        .await
        .expect("complete");
    assert!(
        matches!(response, Response::Redirect(ref url) if url == "https://portal.example.com/home")
    );

    let config = config_with_profile(ProfileConfig {
        logout_after_creation: true,
        ..ProfileConfig::default()
    });
    let (_, _, engine) = build_engine(config);
    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("process form");
    let (response, _) = engine
        .handle(&ctx, Action::Complete, state)
        .await
        .expect("complete");
    assert!(matches!(response, Response::Logout { .. }));
}

#[tokio::test]
async fn failed_creation_removes_the_partial_entry() {
    let (directory, _, engine) = build_engine(WelcomeMatConfig::default());
    directory.fail_creates(true);
    let ctx = RequestContext::default();

    let err = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect_err("creation fails");
    assert!(matches!(err, RegistrationError::Creation(_)));
    assert!(!directory.contains("username=marisol,ou=people"));
}

#[tokio::test]
async fn repeated_validation_reuses_cached_uniqueness_verdicts() {
    let (directory, _, engine) = build_engine(WelcomeMatConfig::default());
    let ctx = RequestContext::default();

    for _ in 0..3 {
        let (response, _) = engine
            .handle(
                &ctx,
                Action::Validate {
                    fields: valid_fields(),
                },
                WorkflowState::default(),
            )
            .await
            .expect("validate");
        let Response::Validation(verdict) = response else {
            panic!("expected validation verdict, got {response:?}");
        };
        assert!(verdict.is_acceptable());
    }

    // two unique fields, each probed against the store exactly once
    assert_eq!(directory.search_count(), 2);
}

#[tokio::test]
async fn url_pinned_profile_cannot_be_changed() {
    let mut config = WelcomeMatConfig::default();
    config.profiles.insert(
        "guest".to_string(),
        ProfileConfig::default(),
    );
    let (_, _, engine) = build_engine(config);
    let ctx = RequestContext {
        url_profile: Some("guest".to_string()),
        ..RequestContext::default()
    };

    let (response, state) = engine
        .handle(&ctx, Action::Reset, WorkflowState::default())
        .await
        .expect("pinned render");
    assert_eq!(state.profile_id.as_deref(), Some("guest"));
    let Response::Render(RenderTarget::Form { show_back, .. }) = response else {
        panic!("expected form, got {response:?}");
    };
    assert!(!show_back);

    let err = engine
        .handle(
            &ctx,
            Action::ProfileChoice {
                profile_id: "default".to_string(),
            },
            state,
        )
        .await
        .expect_err("pinned profile");
    assert!(matches!(err, RegistrationError::Sequencing(_)));
}

#[tokio::test]
async fn editing_a_verified_value_revokes_its_proof() {
    // the agreement keeps the workflow parked before creation
    let config = config_with_profile(ProfileConfig {
        agreement_text: Some("terms".to_string()),
        ..verified_email_profile()
    });
    let (_, notifier, engine) = build_engine(config);
    let ctx = RequestContext::default();

    let (_, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: valid_fields(),
                captcha_response: None,
            },
            WorkflowState::default(),
        )
        .await
        .expect("first submission");
    let code = code_from(&notifier.last().expect("code").message);
    let (_, state) = engine
        .handle(
            &ctx,
            Action::EnterCode {
                code: Some(code),
                token: None,
            },
            state,
        )
        .await
        .expect("verify email");
    assert!(state.completed_verification_fields.contains("email"));

    // resubmit with a different address: proof gone, new code required
    let mut edited = valid_fields();
    edited.insert("email".to_string(), "new-address@example.com".to_string());
    let (response, state) = engine
        .handle(
            &ctx,
            Action::ProcessForm {
                fields: edited,
                captcha_response: None,
            },
            state,
        )
        .await
        .expect("resubmission");
    assert!(!state.completed_verification_fields.contains("email"));
    let Response::Render(RenderTarget::EnterCode { destination }) = response else {
        panic!("expected code entry, got {response:?}");
    };
    assert_eq!(destination.address, "new-address@example.com");
}
