//! Worker lifecycle states and the persisted worker record.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one worker version.
///
/// `Installing -> Waiting -> Active`, or `Redundant` when install fails or a
/// newer version takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
  Installing,
  /// Installed, waiting to activate
  Waiting,
  Active,
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for WorkerState {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "waiting" => Ok(Self::Waiting),
      "active" => Ok(Self::Active),
      "redundant" => Ok(Self::Redundant),
      other => Err(eyre!("Unknown worker state '{}'", other)),
    }
  }
}

/// Where a worker record is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSlot {
  /// The version that controls routing
  Active,
  /// A version being installed or waiting to activate
  Pending,
}

impl WorkerSlot {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Active => "active",
      Self::Pending => "pending",
    }
  }
}

/// Persisted description of a worker version. Enough to route requests for
/// it after a restart without reinstalling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRecord {
  pub bucket: String,
  pub origin: String,
  pub fallback: String,
  pub manifest_digest: String,
  pub state: WorkerState,
  pub updated_at: DateTime<Utc>,
}
