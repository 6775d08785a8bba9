//! Process-wide runtime bootstrap.
//!
//! The VM is initialized once per process before the first isolate is
//! created, and shut down once at exit. [`Platform`] owns that state, the
//! VM's [`IsolateFactory`] and the current-isolate [`IsolateTracker`] of the
//! native thread, every
//! [`LifecycleController`](crate::controller::LifecycleController) of the
//! process shares one platform.

use crate::isolate::{IsolateId, IsolateKind, IsolateTracker};
use crate::prelude::*;
use crate::vm::{IsolateFactory, VmEmbeddingRc};

use std::cell::{Cell, RefCell};

#[derive(Debug, Clone, Default)]
/// Platform options.
pub struct PlatformOptions {
  /// Flags passed to the VM at initialization.
  pub vm_flags: Vec<String>,
}

/// Process-wide runtime bootstrap object.
pub struct Platform {
  options: PlatformOptions,
  factory: RefCell<Box<dyn IsolateFactory>>,
  vm_initialized: Cell<bool>,
  shut_down: Cell<bool>,
  tracker: IsolateTracker,
}

rc_ptr!(Platform);

impl Platform {
  pub fn new(options: PlatformOptions, factory: Box<dyn IsolateFactory>) -> Self {
    Platform {
      options,
      factory: RefCell::new(factory),
      vm_initialized: Cell::new(false),
      shut_down: Cell::new(false),
      tracker: IsolateTracker::new(),
    }
  }

  pub fn options(&self) -> &PlatformOptions {
    &self.options
  }

  pub fn tracker(&self) -> &IsolateTracker {
    &self.tracker
  }

  pub fn is_vm_initialized(&self) -> bool {
    self.vm_initialized.get()
  }

  pub fn is_shut_down(&self) -> bool {
    self.shut_down.get()
  }

  /// Initializes the VM on first call, later calls do nothing.
  pub fn ensure_vm_initialized(&self) -> AnyResult<()> {
    if self.shut_down.get() {
      anyhow::bail!("Platform is already shut down");
    }
    if self.vm_initialized.get() {
      return Ok(());
    }
    debug!("|Platform::ensure_vm_initialized| flags:{:?}", self.options.vm_flags);
    self
      .factory
      .borrow_mut()
      .initialize_vm(&self.options.vm_flags)?;
    self.vm_initialized.set(true);
    Ok(())
  }

  /// Allocates a new isolate, the VM is initialized first if needed.
  pub fn create_isolate(
    &self,
    id: IsolateId,
    kind: IsolateKind,
    url: &str,
    entry_name: &str,
  ) -> TheResult<VmEmbeddingRc> {
    self
      .ensure_vm_initialized()
      .map_err(|e| TheErr::IsolateCreationFailed(url.to_string(), e.to_string()))?;
    self
      .factory
      .borrow_mut()
      .create_isolate(id, kind, url, entry_name)
      .map_err(|message| TheErr::IsolateCreationFailed(url.to_string(), message))
  }

  /// Marks the platform as shut down, no isolate can be created afterwards.
  pub fn shutdown(&self) {
    if self.shut_down.replace(true) {
      return;
    }
    if let Some(current) = self.tracker.current() {
      warn!("Platform shut down while isolate {current} is current");
    }
    debug!("|Platform::shutdown| vm_initialized:{}", self.vm_initialized.get());
  }
}

impl std::fmt::Debug for Platform {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Platform")
      .field("options", &self.options)
      .field("vm_initialized", &self.vm_initialized.get())
      .field("shut_down", &self.shut_down.get())
      .finish()
  }
}
