//! In-memory collaborator doubles for tests and local development.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{CaptchaVerifier, DirectoryError, DirectoryStore, NotificationSender, NotifyError};
use crate::form::schema::VerificationChannel;
use crate::verification::remote::{
    RemoteOutcome, RemotePrompt, RemoteVerificationState, RemoteVerifier,
};
use crate::error::RegistrationError;

/// Directory backed by a map, with counters so tests can assert how often
/// the store was actually queried.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    search_count: AtomicUsize,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing entry, e.g. to provoke a duplicate-value failure.
    pub fn seed(&self, location: &str, attributes: BTreeMap<String, String>) {
        self.entries
            .lock()
            .expect("directory lock")
            .insert(location.to_string(), attributes);
    }

    pub fn contains(&self, location: &str) -> bool {
        self.entries
            .lock()
            .expect("directory lock")
            .contains_key(location)
    }

    pub fn search_count(&self) -> usize {
        self.search_count.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectory {
    async fn create_entry(
        &self,
        location: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), DirectoryError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            // simulate a write that partially materialized before failing
            self.entries
                .lock()
                .expect("directory lock")
                .insert(location.to_string(), BTreeMap::new());
            return Err(DirectoryError::Unavailable("simulated outage".to_string()));
        }
        let mut entries = self.entries.lock().expect("directory lock");
        if entries.contains_key(location) {
            return Err(DirectoryError::AlreadyExists(location.to_string()));
        }
        entries.insert(location.to_string(), attributes.clone());
        Ok(())
    }

    async fn find_by_attribute(
        &self,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        self.search_count.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock().expect("directory lock");
        Ok(entries
            .iter()
            .filter(|(_, attrs)| attrs.get(attribute).map(String::as_str) == Some(value))
            .map(|(location, _)| location.clone())
            .collect())
    }

    async fn delete_entry(&self, location: &str) -> Result<(), DirectoryError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("simulated outage".to_string()));
        }
        self.entries
            .lock()
            .expect("directory lock")
            .remove(location);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: VerificationChannel,
    pub destination: String,
    pub message: String,
}

/// Records every dispatched message instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("notifier lock").clone()
    }

    pub fn last(&self) -> Option<SentMessage> {
        self.sent.lock().expect("notifier lock").last().cloned()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(
        &self,
        channel: VerificationChannel,
        destination: &str,
        message: &str,
    ) -> Result<(), NotifyError> {
        self.sent.lock().expect("notifier lock").push(SentMessage {
            channel,
            destination: destination.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

/// Captcha verifier with a fixed answer.
pub struct StaticCaptcha(pub bool);

#[async_trait]
impl CaptchaVerifier for StaticCaptcha {
    async fn verify(&self, _response: &str) -> bool {
        self.0
    }
}

/// Remote verifier that accepts one specific answer for one prompt.
pub struct ScriptedRemoteVerifier {
    pub prompt: String,
    pub expected_answer: String,
    /// When true, a wrong answer is terminal instead of retryable.
    pub fail_on_mismatch: bool,
}

#[async_trait]
impl RemoteVerifier for ScriptedRemoteVerifier {
    async fn present(
        &self,
        _form_data: &BTreeMap<String, String>,
    ) -> Result<Vec<RemotePrompt>, RegistrationError> {
        Ok(vec![RemotePrompt {
            id: "q1".to_string(),
            text: self.prompt.clone(),
        }])
    }

    async fn respond(
        &self,
        answers: &BTreeMap<String, String>,
    ) -> Result<RemoteOutcome, RegistrationError> {
        let correct = answers.get("q1").map(String::as_str) == Some(self.expected_answer.as_str());
        if correct {
            Ok(RemoteOutcome {
                state: RemoteVerificationState::Complete,
                error: None,
            })
        } else if self.fail_on_mismatch {
            Ok(RemoteOutcome {
                state: RemoteVerificationState::Failed,
                error: Some("remote verification rejected the responses".to_string()),
            })
        } else {
            Ok(RemoteOutcome {
                state: RemoteVerificationState::Pending,
                error: Some("answer not accepted".to_string()),
            })
        }
    }
}
