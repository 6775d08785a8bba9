//! Snapshot fast-path.
//!
//! A snapshot is an opaque blob produced by the VM. It is stored in the fetch
//! layer's resource-metadata cache, keyed by the entry url and
//! [`SNAPSHOT_TYPE_TAG`].

use crate::loader::options::SnapshotMode;

/// Metadata type tag of compiled program snapshots.
pub const SNAPSHOT_TYPE_TAG: u32 = 0x534e_4150;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Inputs of the snapshot-write decision, collected when the entry point is
/// about to be invoked.
pub struct SnapshotDecision {
  pub mode: SnapshotMode,
  pub cacheable: bool,
  pub loaded_from_snapshot: bool,
  pub already_cached: bool,
}

impl SnapshotDecision {
  /// Whether a snapshot should be written for this run.
  pub fn should_write(&self) -> bool {
    match self.mode {
      SnapshotMode::Off => false,
      SnapshotMode::Single | SnapshotMode::All => {
        self.cacheable && !self.loaded_from_snapshot && !self.already_cached
      }
    }
  }
}

/// Whether a cached snapshot is looked up before parsing the entry.
pub fn should_read(mode: SnapshotMode) -> bool {
  mode.is_enabled()
}
