//! Environment variables.

#![allow(non_snake_case)]

use crate::loader::options::SnapshotMode;
use crate::prelude::*;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

/// Snapshot mode, one of `off`, `single`, `all`.
pub const ISOLOAD_SNAPSHOT_MODE: &str = "ISOLOAD_SNAPSHOT_MODE";

/// Directory that `package:` urls are resolved against.
pub const ISOLOAD_PACKAGE_ROOT: &str = "ISOLOAD_PACKAGE_ROOT";

/// Directory of the on-disk resource metadata cache.
pub const ISOLOAD_CACHE_DIR: &str = "ISOLOAD_CACHE_DIR";

/// Log filter, same syntax with `RUST_LOG`.
pub const ISOLOAD_LOG: &str = "ISOLOAD_LOG";

/// Buffer size for channels communication, by default is 1000.
///
/// NOTE: This constant can be configured through `ISOLOAD_CHANNEL_BUF_SIZE`
/// environment variable.
pub fn CHANNEL_BUF_SIZE() -> usize {
  static VALUE: OnceLock<usize> = OnceLock::new();

  *VALUE.get_or_init(|| {
    std::env::var("ISOLOAD_CHANNEL_BUF_SIZE")
      .map(|v| v.parse::<usize>().unwrap_or(1000_usize))
      .unwrap_or(1000_usize)
  })
}

/// Snapshot mode, by default is [`SnapshotMode::Off`].
///
/// NOTE: This is read every time it is called, a loader reads it once at
/// construction through
/// [`LoaderOptions::from_env`](crate::loader::options::LoaderOptions::from_env).
pub fn SNAPSHOT_MODE() -> SnapshotMode {
  match std::env::var(ISOLOAD_SNAPSHOT_MODE) {
    Ok(value) => SnapshotMode::from_str(value.trim()).unwrap_or_else(|_| {
      warn!("Unknown {ISOLOAD_SNAPSHOT_MODE} value {value:?}, fallback to off");
      SnapshotMode::Off
    }),
    Err(_) => SnapshotMode::Off,
  }
}

/// Package root override, by default is `None`, i.e. `package:` urls resolve
/// relative to the entry script.
pub fn PACKAGE_ROOT() -> Option<PathBuf> {
  std::env::var_os(ISOLOAD_PACKAGE_ROOT)
    .filter(|value| !value.is_empty())
    .map(PathBuf::from)
}

/// Metadata cache directory, i.e. `$ISOLOAD_CACHE_DIR` or
/// `$XDG_CACHE_HOME/isoload`.
pub fn CACHE_DIR_PATH() -> Option<PathBuf> {
  static VALUE: OnceLock<Option<PathBuf>> = OnceLock::new();

  VALUE
    .get_or_init(|| match std::env::var_os(ISOLOAD_CACHE_DIR) {
      Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
      _ => dirs::cache_dir().map(|dir| dir.join("isoload")),
    })
    .clone()
}
