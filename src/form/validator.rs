use moka::future::Cache;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{ProfileConfig, UniqueCacheConfig};
use crate::error::{RegistrationError, ValidationError};
use crate::external::DirectoryStore;
use crate::form::schema::FieldType;
use crate::password::{self, VerificationResult, FIELD_CONFIRM, FIELD_PASSWORD};

/// Validates submissions against a profile's form definition and checks
/// uniqueness against the external store.
///
/// Positive "is unique" verdicts are memoized for a bounded window so
/// repeated checks within one workflow avoid redundant store round-trips.
/// The cache keys on (field, value) and deliberately outlives any single
/// workflow; the TTL bounds staleness.
pub struct FormValidator {
    directory: Arc<dyn DirectoryStore>,
    unique_cache: Cache<(String, String), bool>,
}

impl FormValidator {
    pub fn new(directory: Arc<dyn DirectoryStore>, cache_config: &UniqueCacheConfig) -> Self {
        let unique_cache = Cache::builder()
            .max_capacity(cache_config.max_entries)
            .time_to_live(Duration::from_secs(cache_config.ttl_seconds))
            .build();
        Self {
            directory,
            unique_cache,
        }
    }

    /// Full form validation: local constraints, then uniqueness, then the
    /// password check (trivially passing when the profile collects none).
    ///
    /// Field and uniqueness failures are errors; password verdicts are
    /// returned in the result so the caller can distinguish a mismatch from
    /// a policy violation.
    pub async fn validate(
        &self,
        profile: &ProfileConfig,
        submitted: &BTreeMap<String, String>,
        allow_result_caching: bool,
    ) -> Result<VerificationResult, RegistrationError> {
        self.validate_local(profile, submitted)?;
        self.validate_uniqueness(profile, submitted, allow_result_caching)
            .await?;

        if !profile.prompt_for_password {
            return Ok(VerificationResult::trivially_passed());
        }

        let candidate = submitted.get(FIELD_PASSWORD).map(String::as_str).unwrap_or("");
        let confirmation = submitted.get(FIELD_CONFIRM).map(String::as_str);
        Ok(password::check_password(
            candidate,
            confirmation,
            &profile.password_policy,
            submitted.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }

    /// Per-field format and required checks. Local, no I/O.
    fn validate_local(
        &self,
        profile: &ProfileConfig,
        submitted: &BTreeMap<String, String>,
    ) -> Result<(), RegistrationError> {
        for name in submitted.keys() {
            if name == FIELD_PASSWORD || name == FIELD_CONFIRM {
                continue;
            }
            if profile.field(name).is_none() {
                return Err(ValidationError::UnknownField { field: name.clone() }.into());
            }
        }

        for field in &profile.form {
            let value = submitted.get(&field.name).map(String::as_str).unwrap_or("");

            if value.is_empty() {
                if field.required {
                    return Err(ValidationError::MissingRequired {
                        field: field.name.clone(),
                    }
                    .into());
                }
                continue;
            }

            let length = value.chars().count();
            if length < field.minimum_length || length > field.maximum_length {
                return Err(ValidationError::BadFormat {
                    field: field.name.clone(),
                }
                .into());
            }

            if !type_format_ok(field.field_type, value) {
                return Err(ValidationError::BadFormat {
                    field: field.name.clone(),
                }
                .into());
            }

            if let Some(pattern) = &field.pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    RegistrationError::Configuration(format!(
                        "bad pattern for field '{}': {e}",
                        field.name
                    ))
                })?;
                if !regex.is_match(value) {
                    return Err(ValidationError::BadFormat {
                        field: field.name.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    async fn validate_uniqueness(
        &self,
        profile: &ProfileConfig,
        submitted: &BTreeMap<String, String>,
        allow_result_caching: bool,
    ) -> Result<(), RegistrationError> {
        for field in profile.form.iter().filter(|f| f.unique) {
            let value = match submitted.get(&field.name) {
                Some(v) if !v.is_empty() => v,
                _ => continue,
            };
            if !self
                .is_unique(&field.name, value, allow_result_caching)
                .await?
            {
                return Err(ValidationError::DuplicateValue {
                    field: field.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Single-field uniqueness probe, used by the `check_unique` action.
    /// `Ok(false)` means a conflicting entry exists.
    pub async fn check_unique_field(
        &self,
        profile: &ProfileConfig,
        field_name: &str,
        value: &str,
        allow_result_caching: bool,
    ) -> Result<bool, RegistrationError> {
        if profile.field(field_name).is_none() {
            return Err(ValidationError::UnknownField {
                field: field_name.to_string(),
            }
            .into());
        }
        self.is_unique(field_name, value, allow_result_caching).await
    }

    async fn is_unique(
        &self,
        field_name: &str,
        value: &str,
        allow_result_caching: bool,
    ) -> Result<bool, RegistrationError> {
        let key = (field_name.to_string(), value.to_string());

        if allow_result_caching {
            if let Some(true) = self.unique_cache.get(&key).await {
                trace!(field = field_name, "uniqueness cache hit");
                return Ok(true);
            }
        }

        let matches = self
            .directory
            .find_by_attribute(field_name, value)
            .await
            .map_err(|e| RegistrationError::Directory(e.to_string()))?;

        if matches.is_empty() {
            if allow_result_caching {
                self.unique_cache.insert(key, true).await;
            }
            Ok(true)
        } else {
            // never cache a negative: the conflicting entry may be deleted
            debug!(field = field_name, "duplicate value found in directory");
            Ok(false)
        }
    }
}

fn type_format_ok(field_type: FieldType, value: &str) -> bool {
    match field_type {
        FieldType::Text | FieldType::Hidden => true,
        FieldType::Email => {
            let mut parts = value.splitn(2, '@');
            let local = parts.next().unwrap_or("");
            let domain = parts.next().unwrap_or("");
            !local.is_empty() && domain.contains('.') && !domain.ends_with('.')
        }
        FieldType::Phone => {
            let digits = value.chars().filter(char::is_ascii_digit).count();
            digits >= 7
                && value
                    .chars()
                    .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'))
        }
    }
}
