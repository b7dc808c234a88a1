use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{FieldPolicy, DEFAULT_TTL_SECS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Default subject (user) whose tasks are shown
  pub subject: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub resources: Vec<ResourceConfig>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Spreadsheet API endpoint (e.g. a published Apps Script web app)
  pub url: String,
  /// Query parameter naming the sheet
  #[serde(default = "default_sheet_param")]
  pub sheet_param: String,
  /// Query parameter naming the subject
  #[serde(default = "default_subject_param")]
  pub subject_param: String,
}

fn default_sheet_param() -> String {
  "sheet".to_string()
}

fn default_subject_param() -> String {
  "user".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  #[serde(default = "default_refresh_secs")]
  pub refresh_secs: u64,
  #[serde(default = "default_fetch_timeout_secs")]
  pub fetch_timeout_secs: u64,
}

fn default_ttl_secs() -> u64 {
  DEFAULT_TTL_SECS as u64
}

fn default_refresh_secs() -> u64 {
  15 * 60
}

fn default_fetch_timeout_secs() -> u64 {
  30
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      refresh_secs: default_refresh_secs(),
      fetch_timeout_secs: default_fetch_timeout_secs(),
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.ttl_secs as i64)
  }

  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_secs.max(1))
  }

  /// Fetch deadline; zero disables it.
  pub fn fetch_timeout(&self) -> Option<Duration> {
    (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  /// Resource key, e.g. "delegation"
  pub name: String,
  /// Sheet name on the API side (defaults to `name`)
  pub sheet: Option<String>,
  /// How records of this resource are identified
  #[serde(default)]
  pub identity: FieldPolicy,
}

impl ResourceConfig {
  pub fn sheet(&self) -> &str {
    self.sheet.as_deref().unwrap_or(&self.name)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Write logs to a daily rolling file under the data directory
  #[serde(default)]
  pub file: bool,
  /// Default filter when TASKDASH_LOG is unset
  pub level: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./taskdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskdash/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/taskdash/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("taskdash.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for resource in &self.resources {
      if !seen.insert(resource.name.as_str()) {
        return Err(eyre!("Resource '{}' is configured twice", resource.name));
      }
    }
    Ok(())
  }

  pub fn resource(&self, name: &str) -> Result<&ResourceConfig> {
    self
      .resources
      .iter()
      .find(|r| r.name == name)
      .ok_or_else(|| eyre!("Unknown resource '{}'", name))
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks TASKDASH_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TASKDASH_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
