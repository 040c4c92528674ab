use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Out-of-band channel a verification code travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationChannel {
    Email,
    Sms,
}

/// Declared type of a form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Email,
    Phone,
    Hidden,
}

impl FieldType {
    /// The proof channel implied by the field type, if any.
    pub fn channel(self) -> Option<VerificationChannel> {
        match self {
            FieldType::Email => Some(VerificationChannel::Email),
            FieldType::Phone => Some(VerificationChannel::Sms),
            FieldType::Text | FieldType::Hidden => None,
        }
    }
}

/// One field of a registration profile's form definition. Field order in the
/// profile is the verification ordinal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormFieldConfig {
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Value must not already exist in the directory.
    #[serde(default)]
    pub unique: bool,
    /// Value must be proven reachable via its channel before creation.
    #[serde(default)]
    pub verify: bool,
    /// Regex the value must fully match, beyond the type's own format check.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub minimum_length: usize,
    #[serde(default = "default_maximum_length")]
    pub maximum_length: usize,
}

fn default_maximum_length() -> usize {
    255
}

impl FormFieldConfig {
    pub fn new(name: &str, label: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            field_type,
            required: false,
            unique: false,
            verify: false,
            pattern: None,
            minimum_length: 0,
            maximum_length: default_maximum_length(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn verified(mut self) -> Self {
        self.verify = true;
        self
    }
}

/// Machine-readable description of a profile's registration form, returned
/// by the `form_schema` action so single-page clients can render locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSchema {
    pub fields: Vec<FormFieldConfig>,
    pub password_rules: Vec<String>,
    pub prompt_for_password: bool,
    pub agreement_text: Option<String>,
    pub redirect_url: Option<String>,
    /// Field name to the channel that will be used to prove it.
    pub fields_for_verification: BTreeMap<String, VerificationChannel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_field_maps_to_email_channel() {
        assert_eq!(FieldType::Email.channel(), Some(VerificationChannel::Email));
        assert_eq!(FieldType::Phone.channel(), Some(VerificationChannel::Sms));
        assert_eq!(FieldType::Hidden.channel(), None);
    }

    #[test]
    fn builder_sets_flags() {
        let field = FormFieldConfig::new("email", "Email Address", FieldType::Email)
            .required()
            .unique()
            .verified();
        assert!(field.required && field.unique && field.verify);
        assert_eq!(field.maximum_length, 255);
    }

    #[test]
    fn field_config_round_trips_through_toml() {
        let field = FormFieldConfig::new("mobile", "Mobile Number", FieldType::Phone).verified();
        let text = toml::to_string(&field).expect("serialize");
        let back: FormFieldConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(field, back);
    }
}
