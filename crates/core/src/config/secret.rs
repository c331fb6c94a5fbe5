use serde::{Deserialize, Deserializer};
use std::env;
use std::fmt;

/// Prefix marking a value as a reference to an environment variable
pub const SECRET_PREFIX: &str = "SECRET:";

/// A configuration value that may point at an environment variable.
///
/// `SECRET:PGPASSWORD` resolves to the contents of `$PGPASSWORD` each time
/// [`Secret::value`] is called; anything else is returned as written. An unset
/// variable resolves to an empty string, which validation then reports as missing.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The value exactly as configured, before resolution
    pub fn raw(&self) -> &str {
        &self.0
    }

    /// Name of the referenced environment variable, if this is a reference
    pub fn env_var(&self) -> Option<&str> {
        self.0.strip_prefix(SECRET_PREFIX)
    }

    pub fn is_reference(&self) -> bool {
        self.env_var().is_some()
    }

    /// Resolve the secret at the point of use
    pub fn value(&self) -> String {
        match self.env_var() {
            Some(var) => env::var(var).unwrap_or_default(),
            None => self.0.clone(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reference() || self.0.is_empty() {
            f.debug_tuple("Secret").field(&self.0).finish()
        } else {
            f.debug_tuple("Secret").field(&"***").finish()
        }
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // `port = 5432` is as common in TOML as `port = "5432"`
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Integer(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Secret(text),
            Raw::Integer(number) => Secret(number.to_string()),
        })
    }
}
