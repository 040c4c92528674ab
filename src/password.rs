use serde::{Deserialize, Serialize};

/// Form field names the password checker reads from a submission.
pub const FIELD_PASSWORD: &str = "password1";
pub const FIELD_CONFIRM: &str = "password2";

/// Composition rules a candidate password is evaluated against.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PasswordPolicy {
    pub minimum_length: usize,
    pub maximum_length: usize,
    pub minimum_digits: usize,
    pub minimum_uppercase: usize,
    pub minimum_lowercase: usize,
    pub minimum_special: usize,
    /// Reject candidates equal to (or containing) any submitted form value.
    pub disallow_user_attributes: bool,
    /// Known-bad values (previous passwords, common words).
    pub disallowed_values: Vec<String>,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            minimum_length: 8,
            maximum_length: 64,
            minimum_digits: 1,
            minimum_uppercase: 0,
            minimum_lowercase: 1,
            minimum_special: 0,
            disallow_user_attributes: true,
            disallowed_values: Vec::new(),
        }
    }
}

impl PasswordPolicy {
    /// Human-readable rule list for the form-schema response.
    pub fn rule_descriptions(&self) -> Vec<String> {
        let mut rules = vec![format!(
            "Password must be {} to {} characters long",
            self.minimum_length, self.maximum_length
        )];
        if self.minimum_digits > 0 {
            rules.push(format!("At least {} digit(s)", self.minimum_digits));
        }
        if self.minimum_uppercase > 0 {
            rules.push(format!(
                "At least {} uppercase letter(s)",
                self.minimum_uppercase
            ));
        }
        if self.minimum_lowercase > 0 {
            rules.push(format!(
                "At least {} lowercase letter(s)",
                self.minimum_lowercase
            ));
        }
        if self.minimum_special > 0 {
            rules.push(format!(
                "At least {} special character(s)",
                self.minimum_special
            ));
        }
        if self.disallow_user_attributes {
            rules.push("Must not contain your own profile values".to_string());
        }
        rules
    }
}

/// Whether candidate and confirmation agree. Reported separately from
/// `passed` so a caller can show "passwords don't match" without conflating
/// it with a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Match,
    NoMatch,
    Indeterminate,
}

/// Uniform verdict shape returned by password and form validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub strength: u8,
    pub match_status: MatchStatus,
    pub message: Option<String>,
}

impl VerificationResult {
    pub fn trivially_passed() -> Self {
        Self {
            passed: true,
            strength: 0,
            match_status: MatchStatus::Match,
            message: None,
        }
    }

    pub fn is_acceptable(&self) -> bool {
        self.passed && self.match_status == MatchStatus::Match
    }
}

/// Evaluate a candidate password against a policy.
///
/// Callable before any identity exists: `user_attributes` is the in-progress
/// form itself. A confirmation mismatch alone does not clear `passed`.
pub fn check_password<'a, I>(
    candidate: &str,
    confirmation: Option<&str>,
    policy: &PasswordPolicy,
    user_attributes: I,
) -> VerificationResult
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let match_status = match confirmation {
        None => MatchStatus::Indeterminate,
        Some("") => MatchStatus::Indeterminate,
        Some(c) if c == candidate => MatchStatus::Match,
        Some(_) => MatchStatus::NoMatch,
    };

    if candidate.is_empty() {
        return VerificationResult {
            passed: false,
            strength: 0,
            match_status,
            message: Some("Password cannot be empty".to_string()),
        };
    }

    if let Some(reason) = first_violation(candidate, policy, user_attributes) {
        return VerificationResult {
            passed: false,
            strength: strength_of(candidate),
            match_status,
            message: Some(reason),
        };
    }

    VerificationResult {
        passed: true,
        strength: strength_of(candidate),
        match_status,
        message: None,
    }
}

fn first_violation<'a, I>(candidate: &str, policy: &PasswordPolicy, user_attributes: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let length = candidate.chars().count();
    if length < policy.minimum_length {
        return Some(format!(
            "too short, minimum length is {}",
            policy.minimum_length
        ));
    }
    if length > policy.maximum_length {
        return Some(format!(
            "too long, maximum length is {}",
            policy.maximum_length
        ));
    }

    let digits = candidate.chars().filter(|c| c.is_ascii_digit()).count();
    if digits < policy.minimum_digits {
        return Some(format!("needs at least {} digit(s)", policy.minimum_digits));
    }
    let upper = candidate.chars().filter(|c| c.is_uppercase()).count();
    if upper < policy.minimum_uppercase {
        return Some(format!(
            "needs at least {} uppercase letter(s)",
            policy.minimum_uppercase
        ));
    }
    let lower = candidate.chars().filter(|c| c.is_lowercase()).count();
    if lower < policy.minimum_lowercase {
        return Some(format!(
            "needs at least {} lowercase letter(s)",
            policy.minimum_lowercase
        ));
    }
    let special = candidate
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    if special < policy.minimum_special {
        return Some(format!(
            "needs at least {} special character(s)",
            policy.minimum_special
        ));
    }

    let lowered = candidate.to_lowercase();
    for banned in &policy.disallowed_values {
        if !banned.is_empty() && lowered == banned.to_lowercase() {
            return Some("password is on the disallowed list".to_string());
        }
    }

    if policy.disallow_user_attributes {
        for (name, value) in user_attributes {
            if name == FIELD_PASSWORD || name == FIELD_CONFIRM {
                continue;
            }
            // only meaningful for values long enough to matter
            if value.chars().count() >= 3 && lowered.contains(&value.to_lowercase()) {
                return Some(format!("password must not contain the value of '{name}'"));
            }
        }
    }

    None
}

/// Strength ordinal on a 0-100 scale from length and character variety.
/// The exact curve is not part of the contract; only ordering matters.
fn strength_of(candidate: &str) -> u8 {
    let length = candidate.chars().count();
    let mut score = (length.min(20) * 3) as u32;
    if candidate.chars().any(|c| c.is_ascii_digit()) {
        score += 10;
    }
    if candidate.chars().any(|c| c.is_uppercase()) {
        score += 10;
    }
    if candidate.chars().any(|c| c.is_lowercase()) {
        score += 10;
    }
    if candidate
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        score += 10;
    }
    score.min(100) as u8
}
