//! Configuration loader and validator for the school administration console.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    /// May be left out when the environment provides the URL and key.
    #[serde(default)]
    pub supabase: Supabase,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub session: Session,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Interval used by access watchers when polling subscriptions.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Hosted database project settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Supabase {
    pub url: String,
    pub anon_key: String,
    #[serde(default = "default_staff_function")]
    pub staff_account_function: String,
}

impl Default for Supabase {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            staff_account_function: default_staff_function(),
        }
    }
}

/// Read-through cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    pub ttl_seconds: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

/// Local session store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub profile_cache_ttl_seconds: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            profile_cache_ttl_seconds: 900,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

fn default_staff_function() -> String {
    "create-staff-account".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.app.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.app.data_dir.clone(),
            },
            None => self.app.data_dir.clone(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }

    pub fn profile_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.session.profile_cache_ttl_seconds)
    }

    /// Override the project URL and anon key from the environment. The
    /// `VITE_`-prefixed names used by the web console are accepted too.
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = env_first(&["SUPABASE_URL", "VITE_SUPABASE_URL"]) {
            self.supabase.url = url;
        }
        if let Some(key) = env_first(&["SUPABASE_ANON_KEY", "VITE_SUPABASE_ANON_KEY"]) {
            self.supabase.anon_key = key;
        }
    }
}

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

/// Load configuration from a YAML file, apply env overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    let url = cfg.supabase.url.trim();
    if url.is_empty() {
        return Err(ConfigError::Invalid("supabase.url must be non-empty"));
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ConfigError::Invalid("supabase.url must be an http(s) URL"));
    }
    if cfg.supabase.anon_key.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.anon_key must be non-empty"));
    }
    if cfg.supabase.staff_account_function.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "supabase.staff_account_function must be non-empty",
        ));
    }

    if cfg.cache.ttl_seconds == 0 {
        return Err(ConfigError::Invalid("cache.ttl_seconds must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML shipped with the CLI.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000

supabase:
  url: "https://YOUR_PROJECT.supabase.co"
  anon_key: "YOUR_SUPABASE_ANON_KEY"
  staff_account_function: "create-staff-account"

cache:
  ttl_seconds: 300

session:
  profile_cache_ttl_seconds: 900
"#
}
