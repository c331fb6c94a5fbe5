use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Parsing error: {message}")]
    ParsingError { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a parsing error
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::ParsingError {
            message: message.into(),
        }
    }
}

/// Trait for validating configuration values
pub trait ConfigValidator<T: ?Sized> {
    /// Validate a configuration value
    fn validate(&self, value: &T) -> Result<(), ConfigError>;
}

/// Port number validator
pub struct PortValidator {
    pub min: u16,
    pub max: u16,
}

impl Default for PortValidator {
    fn default() -> Self {
        Self { min: 1, max: 65535 }
    }
}

impl ConfigValidator<u16> for PortValidator {
    fn validate(&self, value: &u16) -> Result<(), ConfigError> {
        if *value < self.min || *value > self.max {
            return Err(ConfigError::invalid_value(
                "port",
                value.to_string(),
                format!("port between {} and {}", self.min, self.max),
            ));
        }
        Ok(())
    }
}

/// Validates names that get interpolated into SQL as identifiers.
///
/// Accepts `name` or `schema.name`, each part starting with a letter or
/// underscore and continuing with ASCII alphanumerics or underscores.
pub struct IdentifierValidator {
    pub field: &'static str,
    pub max_length: usize,
}

impl IdentifierValidator {
    pub fn new(field: &'static str) -> Self {
        // PostgreSQL truncates identifiers at 63 bytes
        Self {
            field,
            max_length: 63,
        }
    }

    fn valid_part(&self, part: &str) -> bool {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
            _ => return false,
        }
        part.len() <= self.max_length && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

impl ConfigValidator<str> for IdentifierValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let parts: Vec<&str> = value.split('.').collect();
        if parts.len() > 2 || !parts.iter().all(|part| self.valid_part(part)) {
            return Err(ConfigError::invalid_value(
                self.field,
                value,
                "a SQL identifier such as `schema_migrations` or `public.schema_migrations`",
            ));
        }
        Ok(())
    }
}

/// Rejects empty values once secrets have been resolved
pub struct RequiredValidator {
    pub field: &'static str,
    pub hint: &'static str,
}

impl ConfigValidator<str> for RequiredValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::missing_required(self.field, self.hint));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_validator() {
        let validator = PortValidator::default();

        assert!(validator.validate(&80).is_ok());
        assert!(validator.validate(&5432).is_ok());
        assert!(validator.validate(&65535).is_ok());
        assert!(validator.validate(&0).is_err());
    }

    #[test]
    fn test_identifier_validator() {
        let validator = IdentifierValidator::new("table");

        assert!(validator.validate("schema_migrations").is_ok());
        assert!(validator.validate("public.schema_migrations").is_ok());
        assert!(validator.validate("_ledger2").is_ok());
        assert!(validator.validate("").is_err());
        assert!(validator.validate("2fast").is_err());
        assert!(validator.validate("a.b.c").is_err());
        assert!(validator.validate("users; DROP TABLE users").is_err());
        assert!(validator.validate(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_required_validator() {
        let validator = RequiredValidator {
            field: "host",
            hint: "set it",
        };

        assert!(validator.validate("localhost").is_ok());
        match validator.validate("   ") {
            Err(ConfigError::MissingRequired { field, .. }) => assert_eq!(field, "host"),
            other => panic!("expected missing field error, got {:?}", other),
        }
    }
}
