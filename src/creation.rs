use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ProfileConfig;
use crate::error::RegistrationError;
use crate::external::DirectoryStore;
use crate::password::FIELD_CONFIRM;
use crate::state::WorkflowState;

/// Writes validated registrations into the directory.
pub struct AccountCreator {
    directory: Arc<dyn DirectoryStore>,
}

impl AccountCreator {
    pub fn new(directory: Arc<dyn DirectoryStore>) -> Self {
        Self { directory }
    }

    /// Location the entry will be created at, built from the naming
    /// attribute's submitted value and the profile's base container.
    pub fn determine_location(
        &self,
        profile: &ProfileConfig,
        form_data: &BTreeMap<String, String>,
    ) -> Result<String, RegistrationError> {
        let value = form_data
            .get(&profile.naming_attribute)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                RegistrationError::Configuration(format!(
                    "naming attribute '{}' has no submitted value",
                    profile.naming_attribute
                ))
            })?;
        Ok(format!(
            "{}={},{}",
            profile.naming_attribute, value, profile.base_location
        ))
    }

    /// Create the directory entry for this workflow. Returns the new
    /// entry's location.
    ///
    /// On failure, when the profile asks for it, any partially materialized
    /// entry is deleted best-effort before the error is surfaced. A failed
    /// cleanup is logged, never raised over the original failure.
    pub async fn create(
        &self,
        profile: &ProfileConfig,
        state: &WorkflowState,
    ) -> Result<String, RegistrationError> {
        let location = self.determine_location(profile, &state.form_data)?;

        let attributes: BTreeMap<String, String> = state
            .form_data
            .iter()
            .filter(|(name, _)| name.as_str() != FIELD_CONFIRM)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let attribute_count = attributes.len();

        if let Err(cause) = self.directory.create_entry(&location, &attributes).await {
            error!(%location, %cause, "directory entry creation failed");
            if profile.delete_on_create_fail {
                match self.directory.delete_entry(&location).await {
                    Ok(()) => info!(%location, "removed partially created entry"),
                    Err(cleanup) => {
                        warn!(%location, %cleanup, "cleanup of partial entry failed")
                    }
                }
            }
            return Err(RegistrationError::Creation(cause.to_string()));
        }

        info!(%location, attribute_count, "directory entry created");
        Ok(location)
    }
}
