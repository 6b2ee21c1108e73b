/// Configuration: a TOML profile file for model/provider settings, plus a
/// small JSON settings file for runtime toggles the user flips between runs.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::client::ModelInfo;
use crate::cost::ModelPrices;

pub const DEFAULT_CONFIG_TOML: &str = r#"# pilot configuration
# Profiles select the model endpoint and pricing. The api key is read from
# the environment variable named by api_key_env.

default_profile = "anthropic"

# Maximum model requests per task before pilot asks to continue.
max_requests_per_task = 20

# Appended to the system prompt for every task.
# custom_instructions = ""

[profiles.anthropic]
endpoint = "https://api.anthropic.com"
model = "claude-3-5-sonnet-20240620"
context_window = 200000
api_key_env = "ANTHROPIC_API_KEY"
input_price = 3.0
output_price = 15.0
cache_writes_price = 3.75
cache_reads_price = 0.3
"#;

const DEFAULT_MAX_REQUESTS: u32 = 20;

// ── Config file ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub default_profile: Option<String>,
    pub max_requests_per_task: Option<u32>,
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub context_window: Option<u32>,
    pub api_key_env: Option<String>,
    pub input_price: Option<f64>,
    pub output_price: Option<f64>,
    pub cache_writes_price: Option<f64>,
    pub cache_reads_price: Option<f64>,
}

/// CLI flags that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub profile: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub max_requests: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoint: String,
    pub model: ModelInfo,
    pub api_key: Option<String>,
    pub max_requests: u32,
    pub custom_instructions: Option<String>,
}

pub fn config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(".config")
        })
        .join("pilot/config.toml")
}

/// A missing file means defaults; a malformed file is an error the user must
/// see, not silently ignore.
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("cannot parse config {}", path.display()))
}

pub fn resolve(file: &ConfigFile, overrides: &Overrides) -> Result<ResolvedConfig> {
    let profile_name = overrides
        .profile
        .as_deref()
        .or(file.default_profile.as_deref());
    let profile = match profile_name {
        Some(name) => match file.profiles.get(name) {
            Some(profile) => profile.clone(),
            None if overrides.profile.is_some() => bail!("unknown profile '{name}'"),
            None => Profile::default(),
        },
        None => Profile::default(),
    };

    let endpoint = overrides
        .endpoint
        .clone()
        .or(profile.endpoint)
        .unwrap_or_else(|| "https://api.anthropic.com".to_string());
    let model_id = overrides
        .model
        .clone()
        .or(profile.model)
        .unwrap_or_else(|| "claude-3-5-sonnet-20240620".to_string());

    let api_key = match overrides.api_key.clone() {
        Some(key) => Some(key),
        None => {
            let env_name = profile
                .api_key_env
                .unwrap_or_else(|| "ANTHROPIC_API_KEY".to_string());
            std::env::var(env_name).ok().filter(|k| !k.is_empty())
        }
    };

    Ok(ResolvedConfig {
        endpoint,
        model: ModelInfo {
            id: model_id,
            context_window: profile.context_window.unwrap_or(200_000),
            prices: ModelPrices {
                input: profile.input_price.unwrap_or(3.0),
                output: profile.output_price.unwrap_or(15.0),
                cache_writes: profile.cache_writes_price,
                cache_reads: profile.cache_reads_price,
            },
        },
        api_key,
        max_requests: overrides
            .max_requests
            .or(file.max_requests_per_task)
            .unwrap_or(DEFAULT_MAX_REQUESTS),
        custom_instructions: file.custom_instructions.clone(),
    })
}

// ── Runtime settings ───────────────────────────────────────────────────────────

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// When false, asks auto-approve and the task runs unattended.
    pub require_manual_confirmation: bool,
    /// When true, non-mutating tools (reads, listings, definition scans)
    /// notify instead of asking; writes and commands still gate.
    pub always_allow_read_only: bool,
    /// When true, a finished task immediately seeds a fresh one.
    pub auto_start_task: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            require_manual_confirmation: true,
            always_allow_read_only: false,
            auto_start_task: false,
        }
    }
}

impl Settings {
    /// Missing or unreadable settings fall back to defaults.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("cannot create {}", data_dir.display()))?;
        let path = data_dir.join(SETTINGS_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw).with_context(|| format!("cannot write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_template_parses() {
        let file: ConfigFile = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(file.default_profile.as_deref(), Some("anthropic"));
        let resolved = resolve(&file, &Overrides::default()).unwrap();
        assert_eq!(resolved.endpoint, "https://api.anthropic.com");
        assert_eq!(resolved.model.context_window, 200_000);
        assert_eq!(resolved.max_requests, 20);
        assert_eq!(resolved.model.prices.cache_reads, Some(0.3));
    }

    #[test]
    fn overrides_beat_the_profile() {
        let file: ConfigFile = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        let overrides = Overrides {
            endpoint: Some("http://localhost:8080".into()),
            model: Some("local-model".into()),
            max_requests: Some(5),
            ..Default::default()
        };
        let resolved = resolve(&file, &overrides).unwrap();
        assert_eq!(resolved.endpoint, "http://localhost:8080");
        assert_eq!(resolved.model.id, "local-model");
        assert_eq!(resolved.max_requests, 5);
    }

    #[test]
    fn unknown_explicit_profile_is_an_error() {
        let file: ConfigFile = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        let overrides = Overrides { profile: Some("nope".into()), ..Default::default() };
        assert!(resolve(&file, &overrides).is_err());
    }

    #[test]
    fn missing_config_file_resolves_to_defaults() {
        let resolved = resolve(&ConfigFile::default(), &Overrides::default()).unwrap();
        assert_eq!(resolved.model.id, "claude-3-5-sonnet-20240620");
        assert_eq!(resolved.max_requests, 20);
    }

    #[test]
    fn settings_round_trip_and_default() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = Settings::load(tmp.path());
        assert!(loaded.require_manual_confirmation);
        assert!(!loaded.always_allow_read_only);
        assert!(!loaded.auto_start_task);

        let settings = Settings {
            require_manual_confirmation: false,
            always_allow_read_only: true,
            auto_start_task: true,
        };
        settings.save(tmp.path()).unwrap();
        let reloaded = Settings::load(tmp.path());
        assert!(!reloaded.require_manual_confirmation);
        assert!(reloaded.always_allow_read_only);
        assert!(reloaded.auto_start_task);
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(SETTINGS_FILE), "{not json").unwrap();
        let loaded = Settings::load(tmp.path());
        assert!(loaded.require_manual_confirmation);
    }
}
