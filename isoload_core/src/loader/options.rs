//! Loader options.

use crate::envar;

use compact_str::CompactString;
use std::path::PathBuf;

#[derive(
  Debug,
  Copy,
  Clone,
  PartialEq,
  Eq,
  Hash,
  Default,
  strum_macros::Display,
  strum_macros::EnumString,
)]
/// Snapshot fast-path mode.
pub enum SnapshotMode {
  #[default]
  #[strum(serialize = "off")]
  /// Never read or write snapshots.
  Off,

  #[strum(serialize = "single")]
  /// Snapshot programs that consist of the entry resource only.
  Single,

  #[strum(serialize = "all")]
  /// Snapshot every program, whatever its dependencies.
  All,
}

impl SnapshotMode {
  pub fn is_enabled(&self) -> bool {
    *self != SnapshotMode::Off
  }
}

/// Default option values.
pub const SNAPSHOT_MODE_DEFAULT: SnapshotMode = SnapshotMode::Off;
pub const PACKAGE_ROOT_DEFAULT: Option<PathBuf> = None;
pub const CHARSET_DEFAULT: &str = "utf-8";

#[derive(Debug, Clone, PartialEq, Eq, derive_builder::Builder)]
/// Immutable configuration of a loader, read once at construction.
pub struct LoaderOptions {
  #[builder(default = SNAPSHOT_MODE_DEFAULT)]
  pub snapshot_mode: SnapshotMode,

  #[builder(default = PACKAGE_ROOT_DEFAULT)]
  // Resolves `package:` urls when set.
  pub package_root: Option<PathBuf>,

  #[builder(default = CompactString::const_new(CHARSET_DEFAULT))]
  pub charset: CompactString,
}

impl Default for LoaderOptions {
  fn default() -> Self {
    LoaderOptions {
      snapshot_mode: SNAPSHOT_MODE_DEFAULT,
      package_root: PACKAGE_ROOT_DEFAULT,
      charset: CompactString::const_new(CHARSET_DEFAULT),
    }
  }
}

impl LoaderOptions {
  /// Reads `ISOLOAD_SNAPSHOT_MODE` and `ISOLOAD_PACKAGE_ROOT`.
  pub fn from_env() -> Self {
    LoaderOptions {
      snapshot_mode: envar::SNAPSHOT_MODE(),
      package_root: envar::PACKAGE_ROOT(),
      ..Default::default()
    }
  }
}
