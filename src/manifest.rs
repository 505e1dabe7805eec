//! The fixed list of first-party assets a worker version must hold offline.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use url::Url;

/// A single manifest path as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
  pub path: String,
  /// Optional entries are skipped (with a warning) when they cannot be fetched
  pub optional: bool,
}

impl ManifestEntry {
  pub fn required(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      optional: false,
    }
  }

  pub fn optional(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      optional: true,
    }
  }
}

/// A manifest entry resolved against the application origin.
#[derive(Debug, Clone)]
pub struct ResolvedAsset {
  pub path: String,
  pub url: Url,
  pub optional: bool,
}

/// Ordered asset manifest.
///
/// Entries up to `declared` come from configuration and make up the version
/// digest; later ones were discovered at install time (catalog assets).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
  entries: Vec<ManifestEntry>,
  declared: usize,
}

impl AssetManifest {
  pub fn new(entries: Vec<ManifestEntry>) -> Self {
    let declared = entries.len();
    Self { entries, declared }
  }

  /// Manifest where every path is required.
  #[cfg(test)]
  pub fn required<I, P>(paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<String>,
  {
    Self::new(paths.into_iter().map(ManifestEntry::required).collect())
  }

  #[cfg(test)]
  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Make sure `path` is present and required, appending it if missing.
  /// Another spelling of the same URL is promoted by `resolve`.
  pub fn ensure_required(&mut self, path: &str) {
    match self.entries.iter_mut().find(|e| e.path == path) {
      Some(entry) => entry.optional = false,
      None => {
        self.entries.insert(self.declared, ManifestEntry::required(path));
        self.declared += 1;
      }
    }
  }

  /// Append optional paths that are not already listed.
  pub fn extend_optional<I>(&mut self, paths: I)
  where
    I: IntoIterator<Item = String>,
  {
    for path in paths {
      if !self.entries.iter().any(|e| e.path == path) {
        self.entries.push(ManifestEntry::optional(path));
      }
    }
  }

  /// Resolve every path against `origin`. Paths resolving to the same URL are
  /// kept once, at their first position, and are required if any of them is.
  pub fn resolve(&self, origin: &Url) -> Result<Vec<ResolvedAsset>> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut assets: Vec<ResolvedAsset> = Vec::with_capacity(self.entries.len());

    for entry in &self.entries {
      let url = origin
        .join(&entry.path)
        .map_err(|e| eyre!("Invalid manifest path '{}': {}", entry.path, e))?;

      match seen.get(url.as_str()) {
        Some(&index) => assets[index].optional &= entry.optional,
        None => {
          seen.insert(url.to_string(), assets.len());
          assets.push(ResolvedAsset {
            path: entry.path.clone(),
            url,
            optional: entry.optional,
          });
        }
      }
    }

    Ok(assets)
  }

  /// Digest over the configured entries, recorded with each installed
  /// version. Discovered optional entries do not take part.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    for entry in &self.entries[..self.declared] {
      hasher.update(if entry.optional { b"?" } else { b"!" });
      hasher.update(entry.path.as_bytes());
      hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
  }
}
