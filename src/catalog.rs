//! Overlay catalog (`plans.json`): the georeferenced archival maps shown on
//! top of the base map.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use url::Url;

use crate::request::{classify, Party};

const DEFAULT_OPACITY: f64 = 0.75;

#[derive(Debug, Deserialize)]
struct RawCatalog {
  #[serde(default)]
  plans: Vec<RawOverlay>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOverlay {
  id: Option<String>,
  tile_url: Option<String>,
  default_opacity: Option<f64>,
  #[serde(default)]
  default_visible: bool,
  thumb: Option<String>,
  name: Option<String>,
  meta: Option<String>,
  info: Option<OverlayInfo>,
  /// Scan of the original archive document
  fichier: Option<String>,
}

/// Descriptive block shown in the overlay's info dialog.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct OverlayInfo {
  pub title: Option<String>,
  pub html: Option<String>,
}

/// A tile layer over the base map.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
  pub id: String,
  /// Tile URL template, e.g. `https://warper.example.org/maps/tile/{z}/{x}/{y}.png`
  pub tile_url: String,
  pub default_opacity: f64,
  pub default_visible: bool,
  pub thumb: Option<String>,
  pub name: Option<String>,
  pub meta: Option<String>,
  pub info: Option<OverlayInfo>,
  pub source_document: Option<String>,
}

impl Overlay {
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or(&self.id)
  }

  /// Title for the info dialog.
  pub fn info_title(&self) -> &str {
    self
      .info
      .as_ref()
      .and_then(|i| i.title.as_deref())
      .or(self.name.as_deref())
      .unwrap_or("Informations")
  }
}

/// Parsed overlay catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
  overlays: Vec<Overlay>,
}

impl Catalog {
  /// Parse a catalog document. Overlays without an `id` or `tileUrl` are
  /// skipped; a document without a `plans` array is an empty catalog.
  pub fn parse(bytes: &[u8]) -> Result<Self> {
    let raw: RawCatalog =
      serde_json::from_slice(bytes).map_err(|e| eyre!("Failed to parse overlay catalog: {}", e))?;

    let overlays = raw
      .plans
      .into_iter()
      .filter_map(|p| {
        let id = p.id.filter(|id| !id.is_empty())?;
        let tile_url = p.tile_url.filter(|url| !url.is_empty())?;
        Some(Overlay {
          id,
          tile_url,
          default_opacity: p.default_opacity.unwrap_or(DEFAULT_OPACITY).clamp(0.0, 1.0),
          default_visible: p.default_visible,
          thumb: p.thumb.filter(|t| !t.is_empty()),
          name: p.name,
          meta: p.meta,
          info: p.info,
          source_document: p.fichier.filter(|f| !f.is_empty()),
        })
      })
      .collect();

    Ok(Self { overlays })
  }

  pub fn overlays(&self) -> &[Overlay] {
    &self.overlays
  }

  /// Thumbnails and source documents hosted on the application's own origin,
  /// as paths relative to it. These are worth caching for offline use but
  /// never required.
  pub fn first_party_assets(&self, origin: &Url) -> Vec<String> {
    let mut assets: Vec<String> = Vec::new();

    for overlay in &self.overlays {
      for path in [&overlay.thumb, &overlay.source_document].into_iter().flatten() {
        let is_own = origin
          .join(path)
          .map(|url| classify(&url, origin) == Party::First)
          .unwrap_or(false);
        if is_own && !assets.contains(path) {
          assets.push(path.clone());
        }
      }
    }

    assets
  }
}
