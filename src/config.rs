use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::form::schema::{FieldType, FormFieldConfig};
use crate::password::PasswordPolicy;

/// Main configuration structure for the registration service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WelcomeMatConfig {
    /// Master switch; every action fails with a configuration error when off.
    pub enabled: bool,
    /// Registration profiles keyed by profile id.
    pub profiles: BTreeMap<String, ProfileConfig>,
    /// Whether a captcha check gates the first form submission.
    pub captcha_enabled: bool,
    /// Token settings shared by all profiles.
    pub tokens: TokenConfig,
    /// Uniqueness-check memoization settings.
    pub unique_cache: UniqueCacheConfig,
}

/// One registration flow: form, policy, agreement and creation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileConfig {
    /// Name shown on the profile-choice page.
    pub display_name: String,
    /// Form definition; field order is the verification ordinal.
    pub form: Vec<FormFieldConfig>,
    pub password_policy: PasswordPolicy,
    /// When false, no password is collected and the password check
    /// trivially passes.
    pub prompt_for_password: bool,
    /// Agreement text; `None` skips the agreement step entirely.
    pub agreement_text: Option<String>,
    /// Minimum wait after creation before success is declared, masking
    /// directory replication lag.
    pub minimum_wait_seconds: u64,
    /// Best-effort delete of a partially created entry on creation failure.
    pub delete_on_create_fail: bool,
    /// Require the pluggable remote-verification system to complete.
    pub external_verification: bool,
    /// Form field whose value becomes the entry's relative name.
    pub naming_attribute: String,
    /// Container the new entry is created under.
    pub base_location: String,
    pub redirect_url: Option<String>,
    pub logout_after_creation: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Maximum age of an issued bearer token before redemption fails.
    pub max_age_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UniqueCacheConfig {
    /// How long a positive "is unique" verdict may be reused.
    pub ttl_seconds: u64,
    pub max_entries: u64,
}

impl Default for WelcomeMatConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("default".to_string(), ProfileConfig::default());
        Self {
            enabled: true,
            profiles,
            captcha_enabled: false,
            tokens: TokenConfig {
                max_age_seconds: 3600,
            },
            unique_cache: UniqueCacheConfig {
                ttl_seconds: 60,
                max_entries: 1000,
            },
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            display_name: "New User".to_string(),
            form: vec![
                FormFieldConfig::new("username", "Username", FieldType::Text)
                    .required()
                    .unique(),
                FormFieldConfig::new("email", "Email Address", FieldType::Email)
                    .required()
                    .unique(),
                FormFieldConfig::new("givenName", "First Name", FieldType::Text).required(),
                FormFieldConfig::new("sn", "Last Name", FieldType::Text).required(),
            ],
            password_policy: PasswordPolicy::default(),
            prompt_for_password: true,
            agreement_text: None,
            minimum_wait_seconds: 0,
            delete_on_create_fail: true,
            external_verification: false,
            naming_attribute: "username".to_string(),
            base_location: "ou=people".to_string(),
            redirect_url: None,
            logout_after_creation: false,
        }
    }
}

impl ProfileConfig {
    /// Whether the form page is rendered at all. Profiles with only hidden
    /// fields and no password prompt auto-validate and advance.
    pub fn shows_form_page(&self) -> bool {
        if self.prompt_for_password {
            return true;
        }
        self.form
            .iter()
            .any(|field| field.field_type != FieldType::Hidden)
    }

    pub fn field(&self, name: &str) -> Option<&FormFieldConfig> {
        self.form.iter().find(|field| field.name == name)
    }

    /// Fields whose values need out-of-band proof, in ordinal (form) order.
    pub fn verification_fields(&self) -> impl Iterator<Item = &FormFieldConfig> {
        self.form
            .iter()
            .filter(|field| field.verify && field.field_type.channel().is_some())
    }
}

impl WelcomeMatConfig {
    /// Load configuration with precedence: defaults, then `welcome-mat.toml`
    /// if present, then `WELCOME_MAT__`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        let defaults = Config::try_from(&WelcomeMatConfig::default())?;
        builder = builder.add_source(defaults);

        if Path::new("welcome-mat.toml").exists() {
            builder = builder.add_source(File::with_name("welcome-mat"));
        }

        builder = builder.add_source(
            Environment::with_prefix("WELCOME_MAT")
                .separator("__")
                .try_parsing(true),
        );

        let config: WelcomeMatConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }
}

/// Global configuration instance.
static CONFIG: std::sync::LazyLock<Result<WelcomeMatConfig, anyhow::Error>> =
    std::sync::LazyLock::new(WelcomeMatConfig::load);

/// Get the global configuration.
pub fn config() -> Result<&'static WelcomeMatConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
