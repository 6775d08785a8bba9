//! Isolate identity and the "current isolate" binding.
//!
//! A VM executes one isolate at a time on a native thread, and an isolate's
//! state can only be touched while it is entered, i.e. it is the *current*
//! isolate. [`IsolateTracker`] owns that binding and hands out scoped guards:
//!
//! - [`IsolateScope`]: enters an isolate, exits it on drop.
//! - [`ExitedScope`]: exits whatever isolate is current, re-enters it on drop.
//!
//! Entering an isolate while another one is current is a protocol violation
//! and panics, isolates are not reentrant on one thread.

use crate::prelude::*;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct_id_impl!(IsolateId, usize);
next_incremental_id_impl!(next_isolate_id, IsolateId, AtomicUsize, usize, 1);

#[derive(
  Debug,
  Copy,
  Clone,
  PartialEq,
  Eq,
  Hash,
  strum_macros::Display,
  strum_macros::EnumString,
)]
/// Why an isolate was created.
pub enum IsolateKind {
  #[strum(serialize = "main")]
  /// Runs the primary program of a document.
  Main,

  #[strum(serialize = "spawned")]
  /// Runs a program spawned by another program.
  Spawned,

  #[strum(serialize = "service")]
  /// VM service isolate, it never runs a user program.
  Service,
}

#[derive(Debug, Default)]
struct TrackerInner {
  current: Cell<Option<IsolateId>>,
  // Every isolate entered so far, in order. Only kept for diagnostics.
  history: RefCell<Vec<IsolateId>>,
}

#[derive(Debug, Clone, Default)]
/// Tracks the current isolate of the native thread.
pub struct IsolateTracker {
  inner: Rc<TrackerInner>,
}

impl IsolateTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// The isolate that is currently entered.
  pub fn current(&self) -> Option<IsolateId> {
    self.inner.current.get()
  }

  /// Isolates entered so far, oldest first.
  pub fn history(&self) -> Vec<IsolateId> {
    self.inner.history.borrow().clone()
  }

  /// Enters `isolate` until the returned guard is dropped.
  ///
  /// # Panics
  ///
  /// If another isolate is current.
  pub fn enter(&self, isolate: IsolateId) -> IsolateScope {
    let current = self.inner.current.get();
    assert!(
      current.is_none(),
      "Cannot enter isolate {isolate} while isolate {current:?} is current"
    );
    trace!("|IsolateTracker::enter| isolate:{isolate}");
    self.inner.current.set(Some(isolate));
    self.inner.history.borrow_mut().push(isolate);
    IsolateScope {
      tracker: self.clone(),
      isolate,
    }
  }

  /// Exits the current isolate (if any) until the returned guard is dropped.
  pub fn exit_current(&self) -> ExitedScope {
    let saved = self.inner.current.take();
    if let Some(saved) = saved {
      trace!("|IsolateTracker::exit_current| isolate:{saved}");
    }
    ExitedScope {
      tracker: self.clone(),
      saved,
    }
  }

  /// Runs `f` with `isolate` entered, the caller's isolate is exited before
  /// and re-entered after, regardless of what `f` returns.
  pub fn with_isolate<F, R>(&self, isolate: IsolateId, f: F) -> R
  where
    F: FnOnce() -> R,
  {
    let _exited = self.exit_current();
    let _scope = self.enter(isolate);
    f()
  }
}

/// Guard of an entered isolate.
pub struct IsolateScope {
  tracker: IsolateTracker,
  isolate: IsolateId,
}

impl IsolateScope {
  pub fn isolate(&self) -> IsolateId {
    self.isolate
  }
}

impl Drop for IsolateScope {
  fn drop(&mut self) {
    let current = self.tracker.inner.current.get();
    debug_assert_eq!(current, Some(self.isolate));
    trace!("|IsolateScope::drop| exit isolate:{}", self.isolate);
    self.tracker.inner.current.set(None);
  }
}

/// Guard of an exited isolate, the isolate is re-entered on drop.
pub struct ExitedScope {
  tracker: IsolateTracker,
  saved: Option<IsolateId>,
}

impl ExitedScope {
  /// The isolate that was current when this guard was created.
  pub fn saved(&self) -> Option<IsolateId> {
    self.saved
  }

  /// Don't re-enter the saved isolate on drop, i.e. it is destroyed.
  pub fn forget(&mut self) {
    self.saved = None;
  }
}

impl Drop for ExitedScope {
  fn drop(&mut self) {
    if let Some(saved) = self.saved {
      debug_assert!(self.tracker.inner.current.get().is_none());
      trace!("|ExitedScope::drop| re-enter isolate:{saved}");
      self.tracker.inner.current.set(Some(saved));
    }
  }
}
