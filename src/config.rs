// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::{ConfigOverride, LlmConfig, ProviderKind};
use crate::reflow::{DEFAULT_BORDER_ALLOWANCE, DEFAULT_FLUSH_THRESHOLD};

pub(crate) const APP_NAME: &str = "ask-ai";

const DEFAULT_CONTEXT_LENGTH: usize = 10;
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const MAX_TEMPERATURE: f32 = 2.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Key into `models` used when no model is given on the command line.
    pub default_model: String,
    /// Role applied when none is given on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_role: Option<String>,
    pub history_file: String,
    /// Number of prior messages sent with each request.
    pub context_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Overrides the model's temperature on every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Overrides the model's response token limit on every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the model for a one-line summary of each new conversation.
    pub summarize: bool,
    pub display: DisplayConfig,
    pub log: LogConfig,
    pub models: BTreeMap<String, ModelSettings>,
    pub roles: BTreeMap<String, RoleSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    pub flush_threshold: usize,
    pub border_allowance: u16,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            border_allowance: DEFAULT_BORDER_ALLOWANCE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: app_config_dir()
                .map(|dir| dir.join("ask-ai.log").display().to_string())
                .unwrap_or_else(|| "ask-ai.log".to_string()),
            level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    pub provider: ProviderKind,
    pub model_name: String,
    /// Other names accepted by `-m` and `/model`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// A literal key, or a shell command printing one if it contains
    /// whitespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ModelSettings {
    fn builtin(provider: ProviderKind, model_name: &str) -> Self {
        Self {
            provider,
            model_name: model_name.to_string(),
            aliases: Vec::new(),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            temperature: Some(DEFAULT_TEMPERATURE),
            api_key: None,
            base_url: None,
        }
    }
}

/// A role prompt is either one string or a list of lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RolePrompt {
    Text(String),
    Lines(Vec<String>),
}

impl RolePrompt {
    pub fn text(&self) -> String {
        match self {
            RolePrompt::Text(text) => text.clone(),
            RolePrompt::Lines(lines) => lines.join("\n"),
        }
    }
}

/// A named system prompt, optionally tied to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: RolePrompt,
}

fn builtin_models() -> BTreeMap<String, ModelSettings> {
    [
        ("chatgpt", ModelSettings::builtin(ProviderKind::OpenAi, "gpt-4o")),
        (
            "claude",
            ModelSettings::builtin(ProviderKind::Anthropic, "claude-sonnet-4-5"),
        ),
        ("grok", ModelSettings::builtin(ProviderKind::Xai, "grok-3")),
        (
            "deepseek",
            ModelSettings::builtin(ProviderKind::DeepSeek, "deepseek-chat"),
        ),
        ("ollama", ModelSettings::builtin(ProviderKind::Ollama, "llama3.2")),
    ]
    .into_iter()
    .map(|(name, settings)| (name.to_string(), settings))
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: "chatgpt".to_string(),
            default_role: None,
            history_file: dirs::data_dir()
                .map(|dir| dir.join(APP_NAME).join("history.jsonl").display().to_string())
                .unwrap_or_else(|| "history.jsonl".to_string()),
            context_length: DEFAULT_CONTEXT_LENGTH,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            summarize: true,
            display: DisplayConfig::default(),
            log: LogConfig::default(),
            models: builtin_models(),
            roles: BTreeMap::new(),
        }
    }
}

/// `$XDG_CONFIG_HOME/ask-ai`, or the platform equivalent.
pub(crate) fn app_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME))
}

pub(crate) fn default_config_path() -> Option<PathBuf> {
    app_config_dir().map(|dir| dir.join("config.toml"))
}

/// Expand a leading `~` to the home directory.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

impl Config {
    /// Load from `path`, or from the default location. A missing file at the
    /// default location yields the defaults; a missing explicit file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (default_config_path(), false),
        };

        let Some(path) = path else {
            return Ok(Self::default());
        };

        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config file. Models in the file replace or extend the
    /// built-in set.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        let mut models = builtin_models();
        models.extend(std::mem::take(&mut config.models));
        config.models = models;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.models.contains_key(&self.default_model) {
            return Err(Error::Config(format!(
                "unknown model '{}' (available: {})",
                self.default_model,
                self.model_names().join(", ")
            )));
        }
        if self.context_length == 0 {
            return Err(Error::Config(
                "context_length must be greater than zero".to_string(),
            ));
        }
        if self.display.flush_threshold == 0 {
            return Err(Error::Config(
                "display.flush_threshold must be greater than zero".to_string(),
            ));
        }
        if let Some(t) = self.temperature
            && !(0.0..=MAX_TEMPERATURE).contains(&t)
        {
            return Err(Error::Config(format!(
                "temperature must be between 0 and {MAX_TEMPERATURE}, got {t}"
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(Error::Config(
                "max_tokens must be greater than zero".to_string(),
            ));
        }

        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (name, settings) in &self.models {
            for alias in &settings.aliases {
                if self.models.contains_key(alias) {
                    return Err(Error::Config(format!(
                        "alias '{alias}' of model '{name}' is also a model name"
                    )));
                }
                if let Some(other) = seen.insert(alias.as_str(), name.as_str()) {
                    return Err(Error::Config(format!(
                        "alias '{alias}' is used by both '{other}' and '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a model by name or alias.
    pub fn resolve_model_name(&self, name: &str) -> Option<String> {
        if self.models.contains_key(name) {
            return Some(name.to_string());
        }
        self.models
            .iter()
            .find(|(_, settings)| settings.aliases.iter().any(|a| a == name))
            .map(|(key, _)| key.clone())
    }

    /// Apply a role: its prompt becomes the system prompt and its model, if
    /// set, the default model. With no name the configured `default_role`
    /// is used, if any.
    pub fn apply_role(&mut self, name: Option<&str>) -> Result<()> {
        let Some(name) = name.map(str::to_string).or_else(|| self.default_role.clone()) else {
            return Ok(());
        };
        let role = self.roles.get(&name).ok_or_else(|| {
            Error::Config(format!(
                "unknown role '{name}' (available: {})",
                self.roles.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        self.system_prompt = Some(role.prompt.text());
        if let Some(model) = &role.model {
            self.default_model = model.clone();
        }
        tracing::debug!(role = %name, "Applied role");
        Ok(())
    }

    /// Request settings that apply to every model, if any were set.
    pub fn request_override(&self) -> Option<ConfigOverride> {
        (self.temperature.is_some() || self.max_tokens.is_some()).then(|| ConfigOverride {
            model: None,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        })
    }

    /// Run `api_key` commands once and keep the keys they print, so no
    /// command runs while the terminal is in raw mode. Models whose key
    /// comes from the environment are skipped. A failing command leaves
    /// its model without a key.
    pub fn resolve_key_commands(&mut self) {
        self.resolve_key_commands_with(|var| std::env::var(var).ok());
    }

    fn resolve_key_commands_with<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, settings) in &mut self.models {
            if !settings.provider.requires_api_key() {
                continue;
            }
            let Some(command) = settings
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| is_key_command(k))
            else {
                continue;
            };
            if settings
                .provider
                .api_key_env()
                .and_then(&env)
                .is_some_and(|k| !k.trim().is_empty())
            {
                continue;
            }
            match run_key_command(settings.provider, command) {
                Ok(key) => {
                    tracing::debug!(model = %name, "Resolved API key from command");
                    settings.api_key = Some(key);
                }
                Err(e) => {
                    tracing::warn!(model = %name, "{e}");
                    settings.api_key = None;
                }
            }
        }
    }

    pub fn history_path(&self) -> PathBuf {
        expand_tilde(&self.history_file)
    }

    pub fn log_path(&self) -> PathBuf {
        expand_tilde(&self.log.file)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Resolve the settings for `model` into a request config, looking up
    /// its API key.
    pub fn llm_config(&self, model: &str) -> Result<LlmConfig> {
        let settings = self.models.get(model).ok_or_else(|| {
            Error::Config(format!(
                "unknown model '{model}' (available: {})",
                self.model_names().join(", ")
            ))
        })?;

        let key_dir = app_config_dir();
        let api_key = resolve_api_key(
            settings.provider,
            settings.api_key.as_deref(),
            |var| std::env::var(var).ok(),
            key_dir.as_deref(),
        )?;

        Ok(LlmConfig {
            provider: settings.provider,
            model: settings.model_name.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| settings.provider.default_base_url().to_string()),
        })
    }

    /// Render the effective configuration as TOML. Configured keys are
    /// masked unless `show_keys` is set.
    pub fn dump(&self, show_keys: bool) -> Result<String> {
        let mut config = self.clone();
        if !show_keys {
            for settings in config.models.values_mut() {
                if let Some(key) = settings.api_key.as_mut() {
                    *key = mask_key(key);
                }
            }
        }
        toml::to_string_pretty(&config).map_err(|e| Error::Config(e.to_string()))
    }
}

fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    if key.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("{prefix}****")
    }
}

/// Find the API key for a provider. The environment wins, then the
/// configured value, then a key file in `key_dir`.
pub(crate) fn resolve_api_key<F>(
    provider: ProviderKind,
    configured: Option<&str>,
    env: F,
    key_dir: Option<&Path>,
) -> Result<Option<String>>
where
    F: Fn(&str) -> Option<String>,
{
    if !provider.requires_api_key() {
        return Ok(None);
    }

    if let Some(var) = provider.api_key_env()
        && let Some(key) = env(var).filter(|k| !k.trim().is_empty())
    {
        return Ok(Some(key.trim().to_string()));
    }

    if let Some(configured) = configured.map(str::trim).filter(|k| !k.is_empty()) {
        if !is_key_command(configured) {
            return Ok(Some(configured.to_string()));
        }
        // Commands are run by `Config::resolve_key_commands` at startup.
        tracing::debug!(provider = %provider, "API key command was not resolved");
    }

    if let Some(dir) = key_dir {
        let path = dir.join(format!("{}-api-key", provider.id()));
        if let Ok(content) = fs::read_to_string(&path)
            && let Some(key) = content.lines().next().map(str::trim).filter(|k| !k.is_empty())
        {
            return Ok(Some(key.to_string()));
        }
    }

    Ok(None)
}

/// A configured key with whitespace in it is a shell command.
fn is_key_command(value: &str) -> bool {
    value.contains(char::is_whitespace)
}

fn run_key_command(provider: ProviderKind, command: &str) -> Result<String> {
    let output = Command::new("sh").arg("-c").arg(command).output()?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "API key command for {} failed: {}",
            provider.id(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if key.is_empty() {
        return Err(Error::Config(format!(
            "API key command for {} printed nothing",
            provider.id()
        )));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.context_length, 10);
        assert_eq!(config.display.flush_threshold, 30);
        assert_eq!(
            config.model_names(),
            vec!["chatgpt", "claude", "deepseek", "grok", "ollama"]
        );
    }

    #[test]
    fn test_file_models_extend_builtins() {
        let config = Config::from_toml(
            r#"
default_model = "local"
context_length = 4
system_prompt = "Be terse."

[display]
flush_threshold = 12

[models.local]
provider = "ollama"
model_name = "qwen2.5"
base_url = "http://gpu-box:11434/v1"

[models.chatgpt]
provider = "openai"
model_name = "gpt-4.1-mini"
"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.context_length, 4);
        assert_eq!(config.system_prompt.as_deref(), Some("Be terse."));
        assert_eq!(config.display.flush_threshold, 12);
        assert_eq!(config.display.border_allowance, 4);
        assert_eq!(config.models["chatgpt"].model_name, "gpt-4.1-mini");
        assert!(config.models.contains_key("claude"));

        let llm = config.llm_config("local").unwrap();
        assert_eq!(llm.provider, ProviderKind::Ollama);
        assert_eq!(llm.base_url, "http://gpu-box:11434/v1");
        assert!(llm.is_available());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            default_model: "gpt-99".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("gpt-99")));

        config.default_model = "claude".to_string();
        config.context_length = 0;
        assert!(config.validate().is_err());

        config.context_length = 5;
        config.display.flush_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_model_lookup() {
        let err = Config::default().llm_config("nope").unwrap_err();
        assert!(err.to_string().contains("available: chatgpt"));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(matches!(
            Config::from_toml("context_length = \"ten\""),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "default_model = \"grok\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.default_model, "grok");
    }

    #[test]
    fn test_key_precedence() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("openai-api-key"), "sk-file\nignored\n").unwrap();
        let env = |var: &str| (var == "OPENAI_API_KEY").then(|| "sk-env".to_string());

        let key =
            resolve_api_key(ProviderKind::OpenAi, Some("sk-config"), env, Some(dir.path())).unwrap();
        assert_eq!(key.as_deref(), Some("sk-env"));

        let key =
            resolve_api_key(ProviderKind::OpenAi, Some("sk-config"), no_env, Some(dir.path()))
                .unwrap();
        assert_eq!(key.as_deref(), Some("sk-config"));

        let key = resolve_api_key(ProviderKind::OpenAi, None, no_env, Some(dir.path())).unwrap();
        assert_eq!(key.as_deref(), Some("sk-file"));

        let key = resolve_api_key(ProviderKind::Xai, None, no_env, Some(dir.path())).unwrap();
        assert_eq!(key, None);
    }

    #[test]
    fn test_key_commands_resolved_up_front() {
        let mut config = Config::default();
        config.models.get_mut("deepseek").unwrap().api_key = Some("echo sk-from-command".to_string());
        config.models.get_mut("grok").unwrap().api_key = Some("exit 3; echo".to_string());
        config.models.get_mut("chatgpt").unwrap().api_key = Some("echo not-run".to_string());
        let env = |var: &str| (var == "OPENAI_API_KEY").then(|| "sk-env".to_string());

        config.resolve_key_commands_with(env);
        assert_eq!(
            config.models["deepseek"].api_key.as_deref(),
            Some("sk-from-command")
        );
        assert_eq!(config.models["grok"].api_key, None);
        // The environment wins, so the command is left alone.
        assert_eq!(
            config.models["chatgpt"].api_key.as_deref(),
            Some("echo not-run")
        );
    }

    #[test]
    fn test_unresolved_key_command_is_never_run() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let command = format!("touch {}", marker.display());
        let key =
            resolve_api_key(ProviderKind::DeepSeek, Some(command.as_str()), no_env, None).unwrap();
        assert_eq!(key, None);
        assert!(!marker.exists());
    }

    #[test]
    fn test_aliases_resolve_to_model() {
        let config = Config::from_toml(
            r#"
[models.claude]
provider = "anthropic"
model_name = "claude-sonnet-4-5"
aliases = ["sonnet", "c"]
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.resolve_model_name("sonnet").as_deref(), Some("claude"));
        assert_eq!(config.resolve_model_name("grok").as_deref(), Some("grok"));
        assert_eq!(config.resolve_model_name("gemini"), None);
    }

    #[test]
    fn test_conflicting_aliases_rejected() {
        let mut config = Config::default();
        config.models.get_mut("claude").unwrap().aliases = vec!["fast".to_string()];
        config.models.get_mut("grok").unwrap().aliases = vec!["fast".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'fast'"));

        config.models.get_mut("grok").unwrap().aliases = vec!["chatgpt".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roles() {
        let mut config = Config::from_toml(
            r#"
default_role = "terse"

[roles.terse]
description = "Short answers"
prompt = "Answer in one sentence."

[roles.reviewer]
model = "claude"
prompt = ["You review Rust code.", "Be specific."]
"#,
        )
        .unwrap();

        config.apply_role(None).unwrap();
        assert_eq!(config.system_prompt.as_deref(), Some("Answer in one sentence."));
        assert_eq!(config.default_model, "chatgpt");

        config.apply_role(Some("reviewer")).unwrap();
        assert_eq!(
            config.system_prompt.as_deref(),
            Some("You review Rust code.\nBe specific.")
        );
        assert_eq!(config.default_model, "claude");

        let err = config.apply_role(Some("poet")).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("available: reviewer, terse")));
    }

    #[test]
    fn test_request_override() {
        let mut config = Config::default();
        assert_eq!(config.request_override(), None);

        config.max_tokens = Some(50);
        let o = config.request_override().unwrap();
        assert_eq!(o.max_tokens, Some(50));
        assert_eq!(o.temperature, None);
        assert_eq!(o.model, None);
        config.validate().unwrap();

        config.temperature = Some(2.5);
        assert!(config.validate().is_err());
        config.temperature = Some(0.0);
        config.max_tokens = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let env = |_: &str| Some("unused".to_string());
        let key = resolve_api_key(ProviderKind::Ollama, Some("x"), env, None).unwrap();
        assert_eq!(key, None);
    }

    #[test]
    fn test_dump_masks_keys() {
        let mut config = Config::default();
        if let Some(m) = config.models.get_mut("chatgpt") {
            m.api_key = Some("sk-abcdefghijkl".to_string());
        }
        let masked = config.dump(false).unwrap();
        assert!(!masked.contains("sk-abcdefghijkl"));
        assert!(masked.contains("sk-a****"));

        let shown = config.dump(true).unwrap();
        assert!(shown.contains("sk-abcdefghijkl"));

        // The dump is itself a loadable config.
        let reparsed = Config::from_toml(&shown).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~/x/y.jsonl"), home.join("x/y.jsonl"));
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("~other/x"), PathBuf::from("~other/x"));
    }
}
