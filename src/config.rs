use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::SqliteStorage;
use crate::manifest::{AssetManifest, ManifestEntry};
use crate::worker::WorkerSpec;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL the application shell is served from
  pub origin: String,
  pub cache: CacheConfig,
  pub manifest: Vec<ManifestItem>,
  /// Document served when nothing else is available
  pub offline_fallback: String,
  /// Overlay catalog path, relative to the origin
  pub catalog: Option<String>,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub server: ServerConfig,
}

/// A manifest entry: either a bare path or a path with flags.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ManifestItem {
  Path(String),
  Detailed {
    path: String,
    #[serde(default)]
    optional: bool,
  },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Bucket name prefix, e.g. "salins-cartes"
  pub prefix: String,
  /// Bump whenever the manifest changes
  pub version: u32,
  /// Cap on write-through entries; null for no cap
  #[serde(default = "default_max_runtime_entries")]
  pub max_runtime_entries: Option<usize>,
  /// SQLite database path (defaults to $XDG_DATA_HOME/cartes/cache.db)
  pub database: Option<PathBuf>,
}

fn default_max_runtime_entries() -> Option<usize> {
  Some(256)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_user_agent() -> String {
  format!("cartes/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
      user_agent: default_user_agent(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
  /// Activate a new version as soon as it is installed
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
}

fn default_true() -> bool {
  true
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_listen")]
  pub listen: String,
}

fn default_listen() -> String {
  "127.0.0.1:8787".to_string()
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen: default_listen(),
    }
  }
}

impl CacheConfig {
  /// Versioned bucket name, e.g. "salins-cartes-v18".
  pub fn bucket_name(&self) -> String {
    format!("{}-v{}", self.prefix, self.version)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cartes.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cartes/config.yaml
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
        "No configuration file found. Create one at ~/.config/cartes/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cartes.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cartes").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got '{}'", self.origin));
    }
    if self.manifest.is_empty() {
      return Err(eyre!("manifest must list at least one asset"));
    }
    if self.cache.prefix.trim().is_empty() {
      return Err(eyre!("cache.prefix must not be empty"));
    }
    Ok(())
  }

  /// The origin as a directory URL, so relative manifest paths resolve
  /// beneath it.
  pub fn origin_url(&self) -> Result<Url> {
    let mut url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }
    Ok(url)
  }

  pub fn fallback_url(&self) -> Result<Url> {
    self
      .origin_url()?
      .join(&self.offline_fallback)
      .map_err(|e| eyre!("Invalid offline_fallback '{}': {}", self.offline_fallback, e))
  }

  pub fn catalog_url(&self) -> Result<Option<Url>> {
    match &self.catalog {
      Some(path) => {
        let url = self
          .origin_url()?
          .join(path)
          .map_err(|e| eyre!("Invalid catalog path '{}': {}", path, e))?;
        Ok(Some(url))
      }
      None => Ok(None),
    }
  }

  /// Configured manifest with the offline fallback forced in as required.
  pub fn manifest(&self) -> AssetManifest {
    let entries = self
      .manifest
      .iter()
      .map(|item| match item {
        ManifestItem::Path(path) => ManifestEntry::required(path.clone()),
        ManifestItem::Detailed { path, optional } => ManifestEntry {
          path: path.clone(),
          optional: *optional,
        },
      })
      .collect();

    let mut manifest = AssetManifest::new(entries);
    manifest.ensure_required(&self.offline_fallback);
    manifest
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Worker spec for the configured version, before catalog assets are added.
  pub fn worker_spec(&self) -> Result<WorkerSpec> {
    Ok(WorkerSpec {
      bucket: self.cache.bucket_name(),
      origin: self.origin_url()?,
      manifest: self.manifest(),
      fallback: self.fallback_url()?,
      max_runtime_entries: self.cache.max_runtime_entries,
      skip_waiting: self.worker.skip_waiting,
    })
  }
}
