// Language configuration management for the grading worker
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Placeholder in `execution.args` replaced by the path of the scratch source file
pub const FILE_PLACEHOLDER: &str = "{file}";

fn default_timeout_seconds() -> u64 {
    2
}

/// Which harness/evaluator family a language belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerFamily {
    /// Line-oriented text programs: testcode and testcases specs
    Text,
    /// Problem-config programs driving a simulated stage model
    Problem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    pub args: Vec<String>,
    /// Default scratch file name when the assignment declares none
    pub file_name: String,
}

impl LanguageExecution {
    /// Full argv for running `file_path`
    pub fn command_line(&self, file_path: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().map(|arg| arg.replace(FILE_PLACEHOLDER, file_path)));
        argv
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub family: RunnerFamily,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub execution: LanguageExecution,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    /// Problem stage types this language can run
    #[serde(default)]
    pub stage_types: Vec<String>,
}

impl LanguageConfig {
    pub fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read languages.json")?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)
            .context("Failed to parse languages.json")?;

        if languages_json.languages.is_empty() {
            bail!("languages.json declares no languages");
        }

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            if lang.execution.command.is_empty() {
                bail!("Language '{}' has an empty execution command", lang.name);
            }
            configs.insert(lang.name.to_lowercase(), lang);
        }

        Ok(Self { configs })
    }

    /// Get configuration for a language by name or alias
    pub fn get_config(&self, language: &str) -> Result<&LanguageConfig> {
        if let Some(config) = self.configs.get(&language.to_lowercase()) {
            return Ok(config);
        }
        self.configs
            .values()
            .find(|config| config.answers_to(language))
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    pub fn configs(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.configs.values()
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}
