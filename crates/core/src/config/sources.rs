use std::fmt;
use std::path::PathBuf;

/// Where a migrator setting was read from. Later sources override earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in default
    Default,
    /// A key in the TOML file at this path
    File(PathBuf),
    /// A `MIGRATOR_*` environment variable
    Env(String),
}

impl ConfigSource {
    pub fn is_default(&self) -> bool {
        matches!(self, ConfigSource::Default)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ConfigSource::File(_))
    }

    pub fn is_env(&self) -> bool {
        matches!(self, ConfigSource::Env(_))
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("default"),
            ConfigSource::File(path) => write!(f, "file {}", path.display()),
            ConfigSource::Env(var) => write!(f, "env {}", var),
        }
    }
}
