use super::tracker::*;

use crate::vm::{Library, LibraryHandle};

fn lib(index: usize, url: &str) -> Library {
  Library::new(LibraryHandle::new(index), url)
}

#[cfg(test)]
mod test_arena {
  use super::*;

  #[test]
  fn park_release1() {
    let mut arena = ImporterArena::new();
    assert!(arena.is_empty());

    let a = arena.park(lib(0, "/a.dart"));
    let b = arena.park(lib(1, "/b.dart"));
    assert_ne!(a, b);
    assert_eq!(arena.len(), 2);

    assert_eq!(arena.release(a).unwrap().url, "/a.dart");
    assert!(arena.release(a).is_none());
    assert_eq!(arena.len(), 1);

    // Released slots are reused.
    let c = arena.park(lib(2, "/c.dart"));
    assert_eq!(c, a);
    assert_eq!(arena.len(), 2);
    assert_eq!(arena.release(b).unwrap().url, "/b.dart");
    assert_eq!(arena.release(c).unwrap().url, "/c.dart");
    assert!(arena.is_empty());
  }
}

#[cfg(test)]
mod test_tracker {
  use super::*;

  #[test]
  fn libraries1() {
    let mut tracker = DependencyTracker::new();
    assert!(tracker.is_empty());

    assert!(tracker.add_library("/util.dart"));
    assert!(!tracker.add_library("/util.dart"));
    assert!(tracker.is_library_pending("/util.dart"));
    assert!(!tracker.is_empty());
    assert_eq!(tracker.pending_libraries().count(), 1);

    assert!(tracker.remove_library("/util.dart"));
    assert!(!tracker.remove_library("/util.dart"));
    assert!(tracker.is_empty());
  }

  #[test]
  fn source_includes1() {
    let mut tracker = DependencyTracker::new();

    assert!(tracker.add_source_include("/part.dart", lib(0, "/a.dart")));
    assert!(!tracker.add_source_include("/part.dart", lib(1, "/b.dart")));
    assert!(!tracker.add_source_include("/part.dart", lib(2, "/c.dart")));
    assert!(tracker.is_source_include_pending("/part.dart"));
    assert_eq!(tracker.source_include_importers("/part.dart"), 3);
    assert_eq!(tracker.source_include_importers("/other.dart"), 0);
    assert_eq!(tracker.importers().len(), 3);

    let importers = tracker.take_source_include("/part.dart");
    let urls: Vec<&str> = importers.iter().map(|l| l.url.as_str()).collect();
    assert_eq!(urls, vec!["/a.dart", "/b.dart", "/c.dart"]);
    assert!(tracker.importers().is_empty());
    assert!(tracker.is_empty());
    assert!(tracker.take_source_include("/part.dart").is_empty());
  }

  #[test]
  fn mixed1() {
    let mut tracker = DependencyTracker::new();
    tracker.add_library("/lib.dart");
    tracker.add_source_include("/part.dart", lib(0, "/lib.dart"));

    tracker.remove_library("/lib.dart");
    assert!(!tracker.is_empty());
    assert_eq!(tracker.pending_source_includes().count(), 1);

    tracker.clear();
    assert!(tracker.is_empty());
    assert!(tracker.importers().is_empty());
  }
}
