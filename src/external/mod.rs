//! External collaborator abstractions
//!
//! The engine never talks to a directory, a mail relay or a captcha service
//! directly; it depends on these traits so transports stay swappable and the
//! workflow is testable through dependency injection and mock implementations.

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::form::schema::VerificationChannel;

pub mod mocks;

#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("entry already exists at {0}")]
    AlreadyExists(String),
    #[error("directory rejected the operation: {0}")]
    Rejected(String),
}

/// The identity store the workflow registers accounts into.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Create an entry at `location` with the given attributes.
    async fn create_entry(
        &self,
        location: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), DirectoryError>;

    /// Locations of existing entries whose `attribute` equals `value`.
    async fn find_by_attribute(
        &self,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<String>, DirectoryError>;

    async fn delete_entry(&self, location: &str) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone, Error)]
#[error("notification dispatch failed: {0}")]
pub struct NotifyError(pub String);

/// Fire-and-forget dispatch of verification messages. Delivery confirmation
/// is out of scope.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        channel: VerificationChannel,
        destination: &str,
        message: &str,
    ) -> Result<(), NotifyError>;
}

/// Consulted once before the first form submission when enabled.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, response: &str) -> bool;
}
