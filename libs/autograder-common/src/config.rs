// Environment configuration for the grader

use std::path::PathBuf;

pub const DEFAULT_BATCH_SIZE: usize = 30;
pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";
pub const DEFAULT_SCRATCH_DIR_NAME: &str = "autograder-scratch";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// How composed programs are isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStrategy {
    /// Fresh child process per run
    Process,
    /// Long-lived container per language, reused across runs
    Container,
}

impl std::str::FromStr for SandboxStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(SandboxStrategy::Process),
            "container" | "docker" => Ok(SandboxStrategy::Container),
            other => Err(other.to_string()),
        }
    }
}

/// Where the classroom API lives and how to log in
#[derive(Debug, Clone)]
pub struct ClassroomSettings {
    pub api_base_path: String,
    pub username: String,
    pub password: String,
    pub classroom_id: String,
}

impl ClassroomSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let require = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));

        let mut api_base_path = require("AUTOGRADER_API_BASE_PATH")?;
        if !api_base_path.ends_with('/') {
            api_base_path.push('/');
        }

        Ok(Self {
            api_base_path,
            username: require("AUTOGRADER_USERNAME")?,
            password: require("AUTOGRADER_PASSWORD")?,
            classroom_id: require("CLASSROOM_ID")?,
        })
    }
}

/// Settings for the grading worker itself
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub sandbox: SandboxStrategy,
    pub batch_size: usize,
    /// Regrade submissions that already carry a score
    pub overwrite: bool,
    pub languages_path: PathBuf,
    /// Host directory holding one scratch mount per warm container
    pub scratch_root: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            sandbox: SandboxStrategy::Container,
            batch_size: DEFAULT_BATCH_SIZE,
            overwrite: false,
            languages_path: PathBuf::from(DEFAULT_LANGUAGES_PATH),
            scratch_root: std::env::temp_dir().join(DEFAULT_SCRATCH_DIR_NAME),
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(value) = lookup("AUTOGRADER_SANDBOX") {
            settings.sandbox = value.parse().map_err(|value| ConfigError::Invalid {
                key: "AUTOGRADER_SANDBOX",
                value,
            })?;
        }

        if let Some(value) = lookup("AUTOGRADER_BATCH_SIZE") {
            settings.batch_size = match value.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "AUTOGRADER_BATCH_SIZE",
                        value,
                    })
                }
            };
        }

        if let Some(value) = lookup("AUTOGRADER_OVERWRITE") {
            settings.overwrite = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(value) = lookup("AUTOGRADER_LANGUAGES") {
            settings.languages_path = PathBuf::from(value);
        }

        if let Some(value) = lookup("AUTOGRADER_SCRATCH_DIR") {
            settings.scratch_root = PathBuf::from(value);
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_worker_defaults() {
        let settings = WorkerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.sandbox, SandboxStrategy::Container);
        assert_eq!(settings.batch_size, 30);
        assert!(!settings.overwrite);
        assert_eq!(settings.languages_path, PathBuf::from("config/languages.json"));
    }

    #[test]
    fn test_worker_overrides() {
        let settings = WorkerSettings::from_lookup(lookup(&[
            ("AUTOGRADER_SANDBOX", "process"),
            ("AUTOGRADER_BATCH_SIZE", "5"),
            ("AUTOGRADER_OVERWRITE", "true"),
            ("AUTOGRADER_SCRATCH_DIR", "/srv/grader"),
        ]))
        .unwrap();
        assert_eq!(settings.sandbox, SandboxStrategy::Process);
        assert_eq!(settings.batch_size, 5);
        assert!(settings.overwrite);
        assert_eq!(settings.scratch_root, PathBuf::from("/srv/grader"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = WorkerSettings::from_lookup(lookup(&[("AUTOGRADER_BATCH_SIZE", "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "AUTOGRADER_BATCH_SIZE",
                value: "0".to_string()
            }
        );
    }

    #[test]
    fn test_classroom_requires_credentials() {
        let err = ClassroomSettings::from_lookup(lookup(&[("AUTOGRADER_API_BASE_PATH", "http://x")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("AUTOGRADER_USERNAME"));
    }

    #[test]
    fn test_classroom_base_path_gets_trailing_slash() {
        let settings = ClassroomSettings::from_lookup(lookup(&[
            ("AUTOGRADER_API_BASE_PATH", "http://api.local/v1"),
            ("AUTOGRADER_USERNAME", "grader"),
            ("AUTOGRADER_PASSWORD", "secret"),
            ("CLASSROOM_ID", "12"),
        ]))
        .unwrap();
        assert_eq!(settings.api_base_path, "http://api.local/v1/");
    }
}
