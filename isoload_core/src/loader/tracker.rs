//! Dependency tracker.
//!
//! It records which library urls and which source-includes are outstanding.
//! A source-include can be requested by several importing libraries before
//! its content arrives, each importer is parked in an [`ImporterArena`] and
//! referred to by a stable [`ImporterId`] until the content is dispatched.

use crate::prelude::*;
use crate::vm::Library;

use smallvec::SmallVec;

struct_id_impl!(ImporterId, usize);

#[derive(Debug, Default)]
/// Parked importer references.
pub struct ImporterArena {
  slots: Vec<Option<Library>>,
  free: Vec<usize>,
}

impl ImporterArena {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parks `importer`, returns its id.
  pub fn park(&mut self, importer: Library) -> ImporterId {
    match self.free.pop() {
      Some(index) => {
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(importer);
        ImporterId::new(index)
      }
      None => {
        self.slots.push(Some(importer));
        ImporterId::new(self.slots.len() - 1)
      }
    }
  }

  /// Releases a parked importer, its id can be reused afterwards.
  pub fn release(&mut self, id: ImporterId) -> Option<Library> {
    let importer = self.slots.get_mut(id.value())?.take()?;
    self.free.push(id.value());
    Some(importer)
  }

  /// Count of parked importers.
  pub fn len(&self) -> usize {
    self.slots.len() - self.free.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

pub type ImporterList = SmallVec<[ImporterId; 2]>;

#[derive(Debug, Default)]
/// Outstanding library loads and source-includes.
pub struct DependencyTracker {
  // Library urls requested from the fetch layer but not handed to the VM yet.
  pending_libraries: HashSet<String>,

  // Source-include url => importers, in registration order.
  pending_source_includes: HashMap<String, ImporterList>,

  importers: ImporterArena,
}

impl DependencyTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_library_pending(&self, url: &str) -> bool {
    self.pending_libraries.contains(url)
  }

  /// Returns `false` if `url` is already pending.
  pub fn add_library(&mut self, url: &str) -> bool {
    self.pending_libraries.insert(url.to_string())
  }

  /// Returns `false` if `url` was not pending.
  pub fn remove_library(&mut self, url: &str) -> bool {
    self.pending_libraries.remove(url)
  }

  pub fn is_source_include_pending(&self, url: &str) -> bool {
    self.pending_source_includes.contains_key(url)
  }

  /// Appends `importer` to the importers of `url`, returns `true` if `url`
  /// was not pending before, i.e. it needs a fetch.
  pub fn add_source_include(&mut self, url: &str, importer: Library) -> bool {
    let id = self.importers.park(importer);
    match self.pending_source_includes.get_mut(url) {
      Some(importers) => {
        importers.push(id);
        false
      }
      None => {
        let mut importers = ImporterList::new();
        importers.push(id);
        self.pending_source_includes.insert(url.to_string(), importers);
        true
      }
    }
  }

  /// Removes `url` and releases all its importers together, they are returned
  /// in registration order.
  pub fn take_source_include(&mut self, url: &str) -> Vec<Library> {
    match self.pending_source_includes.remove(url) {
      Some(ids) => ids
        .into_iter()
        .filter_map(|id| self.importers.release(id))
        .collect(),
      None => vec![],
    }
  }

  /// Count of importers waiting for `url`.
  pub fn source_include_importers(&self, url: &str) -> usize {
    self
      .pending_source_includes
      .get(url)
      .map(|importers| importers.len())
      .unwrap_or(0)
  }

  pub fn pending_libraries(&self) -> impl Iterator<Item = &String> {
    self.pending_libraries.iter()
  }

  pub fn pending_source_includes(&self) -> impl Iterator<Item = &String> {
    self.pending_source_includes.keys()
  }

  pub fn importers(&self) -> &ImporterArena {
    &self.importers
  }

  /// Both the pending libraries and the pending source-includes are empty.
  pub fn is_empty(&self) -> bool {
    self.pending_libraries.is_empty() && self.pending_source_includes.is_empty()
  }

  pub fn clear(&mut self) {
    self.pending_libraries.clear();
    for (_, ids) in self.pending_source_includes.drain() {
      for id in ids {
        self.importers.release(id);
      }
    }
  }
}
