use std::fmt;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::ValueVerifier;

/// Longest hostname accepted by [`Validator::Domain`].
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_DEVICE_NAME_LEN: usize = 64;
const MAX_IDENTIFIER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    Trim,
    /// Trim, lowercase, drop scheme, `www.`, any path and a trailing dot.
    Domain,
}

impl Normalizer {
    pub fn apply(self, raw: &str) -> String {
        match self {
            Normalizer::Trim => raw.trim().to_string(),
            Normalizer::Domain => normalize_domain(raw),
        }
    }
}

fn normalize_domain(raw: &str) -> String {
    let mut value = raw.trim().to_ascii_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = value.strip_prefix(scheme) {
            value = rest.to_string();
            break;
        }
    }
    if let Some(end) = value.find(['/', '?', '#']) {
        value.truncate(end);
    }
    if let Some(rest) = value.strip_prefix("www.") {
        value = rest.to_string();
    }
    value.trim_end_matches('.').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    NonEmpty,
    Domain,
    MinLength(usize),
    /// AirPlay service name: 1-64 printable characters without `"` or `\`.
    DeviceName,
    /// SQL identifier: `[A-Za-z0-9_]`, 1-32 characters.
    Identifier,
}

impl Validator {
    /// Checks a normalized value; the error is shown to the user verbatim.
    pub fn check(self, value: &str) -> Result<(), String> {
        match self {
            Validator::NonEmpty => {
                if value.is_empty() {
                    Err("a value is required".to_string())
                } else {
                    Ok(())
                }
            }
            Validator::Domain => check_domain(value),
            Validator::MinLength(n) => {
                if value.chars().count() < n {
                    Err(format!("must be at least {n} characters long"))
                } else {
                    Ok(())
                }
            }
            Validator::DeviceName => check_device_name(value),
            Validator::Identifier => check_identifier(value),
        }
    }
}

fn check_domain(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("a domain is required, e.g. blog.example.com".to_string());
    }
    if value.len() > MAX_DOMAIN_LEN {
        return Err(format!("domain is longer than {MAX_DOMAIN_LEN} characters"));
    }
    let labels: Vec<&str> = value.split('.').collect();
    if labels.len() < 2 {
        return Err(format!("'{value}' is not a fully qualified domain, e.g. example.com"));
    }
    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(format!("'{value}' has an empty or overlong label"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("'{label}' may only contain letters, digits and '-'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("'{label}' must not start or end with '-'"));
        }
    }
    let tld = labels[labels.len() - 1];
    if tld.len() < 2 || !tld.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("'{tld}' is not a valid top-level domain"));
    }
    Ok(())
}

fn check_device_name(value: &str) -> Result<(), String> {
    let len = value.chars().count();
    if len == 0 || len > MAX_DEVICE_NAME_LEN {
        return Err(format!("must be 1-{MAX_DEVICE_NAME_LEN} characters long"));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err("must not contain control characters".to_string());
    }
    if value.contains(['"', '\\']) {
        return Err("must not contain '\"' or '\\'".to_string());
    }
    Ok(())
}

fn check_identifier(value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(format!("must be 1-{MAX_IDENTIFIER_LEN} characters long"));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("may only contain letters, digits and '_'".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub enum DefaultValue {
    Fixed(String),
    /// Produced on demand, e.g. a random password.
    Generated(fn() -> String),
}

impl DefaultValue {
    pub fn resolve(&self) -> String {
        match self {
            DefaultValue::Fixed(value) => value.clone(),
            DefaultValue::Generated(generate) => generate(),
        }
    }
}

/// One value the installer needs from the user.
#[derive(Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub prompt: String,
    pub sensitive: bool,
    /// Empty input is accepted and stored as an empty string.
    pub optional: bool,
    pub default: Option<DefaultValue>,
    pub normalizer: Normalizer,
    pub validator: Validator,
    pub verifier: Option<Arc<dyn ValueVerifier>>,
}

impl fmt::Debug for ParameterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSpec")
            .field("name", &self.name)
            .field("sensitive", &self.sensitive)
            .field("optional", &self.optional)
            .field("default", &self.default)
            .field("normalizer", &self.normalizer)
            .field("validator", &self.validator)
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

impl ParameterSpec {
    pub fn new(name: &str, prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            prompt: prompt.to_string(),
            sensitive: false,
            optional: false,
            default: None,
            normalizer: Normalizer::Trim,
            validator: Validator::NonEmpty,
            verifier: None,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(DefaultValue::Fixed(value.into()));
        self
    }

    pub fn generated(mut self, generate: fn() -> String) -> Self {
        self.default = Some(DefaultValue::Generated(generate));
        self
    }

    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn ValueVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Environment variable consulted before prompting.
    pub fn env_var(&self) -> String {
        format!("PIPROV_{}", self.name.to_ascii_uppercase())
    }

    /// Normalizes and validates raw input.
    pub fn accept(&self, raw: &str) -> Result<String, String> {
        let value = self.normalizer.apply(raw);
        if value.is_empty() && self.optional {
            return Ok(value);
        }
        self.validator.check(&value)?;
        Ok(value)
    }

    pub(crate) fn prompt_line(&self) -> String {
        match &self.default {
            Some(DefaultValue::Fixed(value)) if !self.sensitive => {
                format!("{} [{value}]: ", self.prompt)
            }
            Some(_) => format!("{} (leave blank for default): ", self.prompt),
            None if self.optional => format!("{} (optional): ", self.prompt),
            None => format!("{}: ", self.prompt),
        }
    }
}

/// Random alphanumeric string for generated passwords.
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_normalizer() {
        let n = Normalizer::Domain;
        assert_eq!(n.apply("  Example.COM "), "example.com");
        assert_eq!(n.apply("https://www.blog.example.com/wp-admin/"), "blog.example.com");
        assert_eq!(n.apply("http://example.com?x=1"), "example.com");
        assert_eq!(n.apply("example.com."), "example.com");
    }

    #[test]
    fn test_domain_validator() {
        let v = Validator::Domain;
        assert!(v.check("example.com").is_ok());
        assert!(v.check("my-blog.example.co.uk").is_ok());
        assert!(v.check("localhost").is_err());
        assert!(v.check("exa mple.com").is_err());
        assert!(v.check("-bad.example.com").is_err());
        assert!(v.check("example.123").is_err());
        assert!(v.check("example..com").is_err());
        assert!(v.check(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_device_name_validator() {
        let v = Validator::DeviceName;
        assert!(v.check("Living Room").is_ok());
        assert!(v.check("Küche").is_ok());
        assert!(v.check("").is_err());
        assert!(v.check("say \"hi\"").is_err());
        assert!(v.check("back\\slash").is_err());
        assert!(v.check(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_identifier_validator() {
        let v = Validator::Identifier;
        assert!(v.check("wordpress").is_ok());
        assert!(v.check("wp_user_2").is_ok());
        assert!(v.check("wp-user").is_err());
        assert!(v.check("drop table;").is_err());
        assert!(v.check(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_min_length_counts_chars() {
        assert!(Validator::MinLength(3).check("äöü").is_ok());
        assert!(Validator::MinLength(12).check("short").is_err());
    }

    #[test]
    fn test_optional_accepts_empty() {
        let spec = ParameterSpec::new("output_device", "ALSA card").optional();
        assert_eq!(spec.accept("   ").unwrap(), "");
        let required = ParameterSpec::new("device_name", "Name");
        assert!(required.accept("").is_err());
    }

    #[test]
    fn test_env_var_name() {
        let spec = ParameterSpec::new("cloudflare_api_token", "Token");
        assert_eq!(spec.env_var(), "PIPROV_CLOUDFLARE_API_TOKEN");
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password(24);
        let b = generate_password(24);
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_prompt_line_hides_sensitive_default() {
        let spec = ParameterSpec::new("db_password", "Database password")
            .sensitive()
            .generated(|| "secret".to_string());
        assert_eq!(spec.prompt_line(), "Database password (leave blank for default): ");

        let spec = ParameterSpec::new("db_name", "Database name").default_value("wordpress");
        assert_eq!(spec.prompt_line(), "Database name [wordpress]: ");
    }
}
