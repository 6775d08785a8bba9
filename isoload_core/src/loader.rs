//! Application loader.
//!
//! # Terms
//!
//! - Entry: the top-level script of the program.
//! - Library: an independently compiled unit, the unit of `import`.
//! - Source-include: a file merged textually into an importing library.
//! - Deferred load: a dependency raised after the program started running.
//!
//! # Flow
//!
//! The loader asks the fetch layer for the entry, feeds the fetched text to
//! the VM, and the VM raises every unresolved import and source-include
//! through the library-tag handler while it parses. Each raised dependency is
//! registered in the [`DependencyTracker`] and fetched, and its text is fed
//! back to the VM when it arrives, which may raise more dependencies. Once
//! nothing is outstanding the loader fires `ready`, and [`load`] invokes the
//! program's entry point.
//!
//! ```text
//! Uninitialized -> Initialized -> Fetching -> Loading -> Ready -> Running
//!                                    |                    ^        |
//!                                    +----(snapshot)------+        v
//!                        Running <- DeferredReady <-> DeferredLoading
//! ```
//!
//! The snapshot is only used while no imported script is queued, it does not
//! contain them.
//!
//! Every state can fall into `Error`, it is terminal.
//!
//! The handler is re-entered by the VM at arbitrary depth, it only does
//! bookkeeping and issues fetches, and returns immediately.
//!
//! [`load`]: ApplicationLoader::load

use crate::fetch::{FetchClientRc, FetchOutcome, FetchRequest, FetchResponse, RequestId};
use crate::isolate::IsolateId;
use crate::loader::options::{LoaderOptions, SnapshotMode};
use crate::loader::snapshot::{SNAPSHOT_TYPE_TAG, SnapshotDecision};
use crate::loader::state::LoaderState;
use crate::loader::tracker::DependencyTracker;
use crate::prelude::*;
use crate::vm::{
  DependencyKind, Library, LibraryTagHandler, SYSTEM_SCHEME, TagResponse,
  VmEmbeddingRc, VmError, VmResult,
};

use std::collections::VecDeque;

pub mod options;
pub mod snapshot;
pub mod state;
pub mod tracker;

#[cfg(test)]
mod tracker_tests;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
/// Which transition fired `ready`.
pub enum ReadyKind {
  #[strum(serialize = "initial")]
  /// Loading => Ready.
  Initial,

  #[strum(serialize = "deferred")]
  /// DeferredLoading => DeferredReady.
  Deferred,
}

/// Observer of a loader, i.e. the hosting document.
pub trait LoaderCallback {
  /// Dependency graph is exhausted, fired exactly once per transition.
  fn ready(&mut self, kind: ReadyKind);

  /// A per-url error, e.g. failed fetch or compile error.
  fn report_error(&mut self, message: &str, url: Option<&str>, line: Option<u32>);

  /// Error event on the element that started the program, only for errors
  /// that put the loader into the error state.
  fn dispatch_error_event(&mut self, _message: &str) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
/// Why a url was requested.
pub enum RequestKind {
  #[strum(serialize = "entry")]
  Entry,
  #[strum(serialize = "library")]
  Library,
  #[strum(serialize = "source-include")]
  SourceInclude,
  #[strum(serialize = "imported-script")]
  ImportedScript,
}

#[derive(Debug, Clone)]
struct PendingRequest {
  url: String,
  kind: RequestKind,
}

#[derive(Debug, Clone)]
/// Extra script merged into the program before its first run.
struct ImportedScript {
  url: String,
  // Inline text, or `None` if it is fetched.
  text: Option<String>,
  requested: bool,
}

/// The part of the loader that the VM re-enters through the library-tag
/// handler.
struct LoaderCore {
  state: LoaderState,
  options: LoaderOptions,
  entry_url: String,
  isolate: Option<IsolateId>,

  tracker: DependencyTracker,

  // Legacy imported scripts, merged with the tracker only in the ready check.
  imported_scripts: VecDeque<ImportedScript>,

  // Outstanding fetches.
  requests: HashMap<RequestId, PendingRequest>,

  // Every url handed to the VM, or handed to the fetch layer as a library.
  loaded_urls: HashSet<String>,
  // Libraries whose fetch or compilation failed.
  failed_urls: HashSet<String>,

  // All loaded units come from the entry resource so far.
  cacheable: bool,
  loaded_from_snapshot: bool,

  fetch: FetchClientRc,
  callback: Box<dyn LoaderCallback>,
}

impl LoaderCore {
  fn transition(&mut self, next: LoaderState) {
    assert!(
      self.state.can_transition_to(next),
      "Illegal loader transition {} => {}",
      self.state,
      next
    );
    trace!("|ApplicationLoader| {} => {}", self.state, next);
    self.state = next;
  }

  fn request(&mut self, url: &str, kind: RequestKind) {
    let request = FetchRequest::new(url, &self.options.charset);
    let request_id = request.request_id;
    trace!("|ApplicationLoader::request| {kind} request:{request_id} url:{url:?}");
    self.requests.insert(
      request_id,
      PendingRequest {
        url: url.to_string(),
        kind,
      },
    );
    self.fetch.borrow_mut().fetch(request);
  }

  fn report(&mut self, message: &str, url: Option<&str>, line: Option<u32>) {
    error!("{message}");
    self.callback.report_error(message, url, line);
  }

  fn report_vm_error(&mut self, e: &VmError, fallback_url: &str) {
    let url = e.url.clone().unwrap_or_else(|| fallback_url.to_string());
    self.report(&e.to_string(), Some(&url), e.line);
  }

  // Moves to the error state. Outstanding requests are canceled, their
  // responses are still owned by this loader and dropped.
  fn fail(&mut self, message: &str) {
    if self.state.is_error() {
      return;
    }
    self.transition(LoaderState::Error);
    self.tracker.clear();
    self.imported_scripts.clear();
    if let Ok(mut fetch) = self.fetch.try_borrow_mut() {
      for request_id in self.requests.keys() {
        fetch.cancel(*request_id);
      }
    }
    self.callback.dispatch_error_event(message);
  }

  fn is_outstanding(&self) -> bool {
    !self.tracker.is_empty() || !self.imported_scripts.is_empty()
  }

  fn check_ready(&mut self) {
    if self.is_outstanding() {
      return;
    }
    match self.state {
      LoaderState::Loading => {
        self.transition(LoaderState::Ready);
        self.callback.ready(ReadyKind::Initial);
      }
      LoaderState::DeferredLoading => {
        self.transition(LoaderState::DeferredReady);
        self.callback.ready(ReadyKind::Deferred);
      }
      _ => {}
    }
  }

  fn canonicalize(&self, base: &str, url: &str) -> TheResult<String> {
    self.fetch.borrow().resolve_url(
      base,
      url,
      self.options.package_root.as_deref(),
    )
  }
}

impl LibraryTagHandler for LoaderCore {
  fn handle_library_tag(
    &mut self,
    kind: DependencyKind,
    importer: &Library,
    url: &str,
  ) -> VmResult<TagResponse> {
    trace!(
      "|ApplicationLoader::handle_library_tag| {kind} importer:{:?} url:{url:?}",
      importer.url
    );
    if self.state.is_error() {
      return Err(VmError::new(format!(
        "Cannot load `{url}`, the program failed to load"
      )));
    }

    if kind == DependencyKind::CanonicalizeUrl {
      return self
        .canonicalize(&importer.url, url)
        .map(TagResponse::Canonical)
        .map_err(|e| VmError::new(e.to_string()));
    }

    if url.starts_with(SYSTEM_SCHEME) {
      return Err(VmError::new(TheErr::SystemLibrary(url.to_string()).to_string()));
    }

    match kind {
      DependencyKind::Import => {
        if self.state.has_run() && self.failed_urls.contains(url) {
          let message = format!("Cannot load `{url}`, it failed to load before");
          self.report(&message, Some(url), None);
          return Err(VmError::compile(url, None, message));
        }
        if self.tracker.is_library_pending(url) || self.loaded_urls.contains(url) {
          debug!("|ApplicationLoader::handle_library_tag| dedup import {url:?}");
          return Ok(TagResponse::Acknowledged);
        }
      }
      DependencyKind::SourceInclude => {
        if self.tracker.is_source_include_pending(url) {
          debug!("|ApplicationLoader::handle_library_tag| dedup source-include {url:?}");
          self.tracker.add_source_include(url, importer.clone());
          return Ok(TagResponse::Acknowledged);
        }
      }
      DependencyKind::CanonicalizeUrl => unreachable!(),
    }

    match self.state {
      LoaderState::Loading | LoaderState::DeferredLoading => {}
      LoaderState::Running | LoaderState::DeferredReady => {
        self.transition(LoaderState::DeferredLoading);
      }
      state => {
        return Err(VmError::new(format!(
          "Cannot load `{url}` while the loader is {state}"
        )));
      }
    }

    if self.cacheable
      && url != self.entry_url
      && self.options.snapshot_mode != SnapshotMode::All
    {
      debug!("|ApplicationLoader::handle_library_tag| {url:?} makes the program uncacheable");
      self.cacheable = false;
    }

    match kind {
      DependencyKind::Import => {
        self.tracker.add_library(url);
        self.loaded_urls.insert(url.to_string());
        self.request(url, RequestKind::Library);
      }
      _ => {
        self.tracker.add_source_include(url, importer.clone());
        self.request(url, RequestKind::SourceInclude);
      }
    }
    Ok(TagResponse::Acknowledged)
  }
}

/// Drives the loading of one program into one isolate.
pub struct ApplicationLoader {
  vm: Option<VmEmbeddingRc>,
  core: LoaderCore,
}

impl ApplicationLoader {
  pub fn new(
    options: LoaderOptions,
    fetch: FetchClientRc,
    callback: Box<dyn LoaderCallback>,
  ) -> Self {
    ApplicationLoader {
      vm: None,
      core: LoaderCore {
        state: LoaderState::Uninitialized,
        options,
        entry_url: String::new(),
        isolate: None,
        tracker: DependencyTracker::new(),
        imported_scripts: VecDeque::new(),
        requests: HashMap::new(),
        loaded_urls: HashSet::new(),
        failed_urls: HashSet::new(),
        cacheable: true,
        loaded_from_snapshot: false,
        fetch,
        callback,
      },
    }
  }

  pub fn state(&self) -> LoaderState {
    self.core.state
  }

  pub fn options(&self) -> &LoaderOptions {
    &self.core.options
  }

  pub fn entry_url(&self) -> &str {
    &self.core.entry_url
  }

  pub fn isolate(&self) -> Option<IsolateId> {
    self.core.isolate
  }

  pub fn is_cacheable(&self) -> bool {
    self.core.cacheable
  }

  pub fn is_loaded_from_snapshot(&self) -> bool {
    self.core.loaded_from_snapshot
  }

  /// Whether `request_id` was issued by this loader and is not answered.
  pub fn owns_request(&self, request_id: RequestId) -> bool {
    self.core.requests.contains_key(&request_id)
  }

  pub fn has_outstanding_requests(&self) -> bool {
    !self.core.requests.is_empty()
  }

  /// Whether `url` is the entry or was requested as a library.
  pub fn graph_contains(&self, url: &str) -> bool {
    url == self.core.entry_url || self.core.loaded_urls.contains(url)
  }

  pub fn tracker(&self) -> &DependencyTracker {
    &self.core.tracker
  }

  /// Count of imported scripts not merged yet.
  pub fn pending_imported_scripts(&self) -> usize {
    self.core.imported_scripts.len()
  }

  fn vm(&self) -> VmEmbeddingRc {
    match &self.vm {
      Some(vm) => vm.clone(),
      None => panic!("Loader is not initialized"),
    }
  }

  /// Binds the loader to an isolate and installs the library-tag handler.
  ///
  /// # Panics
  ///
  /// If the loader is already initialized.
  pub fn initialize(
    &mut self,
    isolate: IsolateId,
    vm: VmEmbeddingRc,
    entry_url: &str,
  ) -> TheResult<()> {
    assert_eq!(
      self.core.state,
      LoaderState::Uninitialized,
      "Loader is already initialized"
    );
    let installed = vm.borrow_mut().install_library_tag_handler();
    if let Err(e) = installed {
      self.core.report_vm_error(&e, entry_url);
      return Err(e.into());
    }
    self.vm = Some(vm);
    self.core.isolate = Some(isolate);
    self.core.entry_url = entry_url.to_string();
    self.core.transition(LoaderState::Initialized);
    Ok(())
  }

  /// Registers an extra script that must be merged before the first run,
  /// `text` is `None` if it has to be fetched.
  pub fn queue_imported_script(
    &mut self,
    url: &str,
    text: Option<&str>,
  ) -> TheResult<()> {
    match self.core.state {
      LoaderState::Error => return Ok(()),
      LoaderState::Uninitialized
      | LoaderState::Initialized
      | LoaderState::Fetching
      | LoaderState::Loading => {}
      state => {
        return Err(TheErr::IllegalLoaderState {
          operation: "queue an imported script",
          state,
        });
      }
    }
    self.core.imported_scripts.push_back(ImportedScript {
      url: url.to_string(),
      text: text.map(|t| t.to_string()),
      requested: false,
    });
    if self.core.state == LoaderState::Loading {
      self.start_imported_scripts();
      self.core.check_ready();
    }
    Ok(())
  }

  /// Requests the entry, or loads it from a cached snapshot.
  pub fn process_requests(&mut self) -> TheResult<()> {
    match self.core.state {
      LoaderState::Error => return Ok(()),
      LoaderState::Initialized => {}
      state => {
        return Err(TheErr::IllegalLoaderState {
          operation: "process requests",
          state,
        });
      }
    }
    let entry_url = self.core.entry_url.clone();
    self.core.transition(LoaderState::Fetching);

    if snapshot::should_read(self.core.options.snapshot_mode) && self.load_snapshot(&entry_url) {
      return Ok(());
    }

    self.core.tracker.add_library(&entry_url);
    self.core.request(&entry_url, RequestKind::Entry);
    Ok(())
  }

  /// Loads an inline entry, there is nothing to fetch for it.
  pub fn process_single_request(&mut self, text: &str) -> TheResult<()> {
    match self.core.state {
      LoaderState::Error => return Ok(()),
      LoaderState::Initialized => {}
      state => {
        return Err(TheErr::IllegalLoaderState {
          operation: "process an inline request",
          state,
        });
      }
    }
    let entry_url = self.core.entry_url.clone();
    self.core.transition(LoaderState::Fetching);
    self.load_entry(&entry_url, text);
    self.core.check_ready();
    Ok(())
  }

  // Returns `true` if the program is restored from a cached snapshot.
  fn load_snapshot(&mut self, entry_url: &str) -> bool {
    if !self.core.imported_scripts.is_empty() {
      debug!(
        "|ApplicationLoader::load_snapshot| {} imported scripts are queued, snapshot is skipped",
        self.core.imported_scripts.len()
      );
      return false;
    }
    let cached = self
      .core
      .fetch
      .borrow()
      .cached_metadata(entry_url, SNAPSHOT_TYPE_TAG);
    let snapshot = match cached {
      Some(snapshot) => snapshot,
      None => return false,
    };
    let vm = self.vm();
    let result = vm.borrow_mut().load_from_snapshot(&snapshot);
    match result {
      Ok(_) => {
        debug!("|ApplicationLoader::load_snapshot| restored {entry_url:?}");
        self.core.loaded_from_snapshot = true;
        self.core.loaded_urls.insert(entry_url.to_string());
        self.core.transition(LoaderState::Ready);
        self.core.callback.ready(ReadyKind::Initial);
        true
      }
      Err(e) => {
        warn!("Failed to load snapshot of {entry_url:?}, fallback to source: {e}");
        false
      }
    }
  }

  // Fetching => Loading, the entry text goes to the VM.
  fn load_entry(&mut self, url: &str, text: &str) {
    self.core.transition(LoaderState::Loading);
    self.core.loaded_urls.insert(url.to_string());
    let vm = self.vm();
    let result = vm.borrow_mut().load_script(url, text, 0, &mut self.core);
    match result {
      Ok(handle) => {
        trace!("|ApplicationLoader::load_entry| {url:?} loaded as {handle}");
        self.start_imported_scripts();
      }
      Err(e) => {
        self.core.report_vm_error(&e, url);
        self.core.fail(&e.to_string());
      }
    }
  }

  // Merges inline imported scripts and requests the others.
  fn start_imported_scripts(&mut self) {
    let mut index = 0;
    while index < self.core.imported_scripts.len() {
      let script = self.core.imported_scripts[index].clone();
      if script.requested {
        index += 1;
        continue;
      }
      match script.text {
        Some(text) => {
          self.core.imported_scripts.remove(index);
          self.load_imported_script(&script.url, &text);
          if self.core.state.is_error() {
            return;
          }
        }
        None => {
          self.core.imported_scripts[index].requested = true;
          self.core.request(&script.url, RequestKind::ImportedScript);
          index += 1;
        }
      }
    }
  }

  fn load_imported_script(&mut self, url: &str, text: &str) {
    self.core.loaded_urls.insert(url.to_string());
    if self.core.options.snapshot_mode != SnapshotMode::All {
      self.core.cacheable = false;
    }
    let vm = self.vm();
    let result = vm.borrow_mut().load_library(url, text, 0, &mut self.core);
    if let Err(e) = result {
      self.core.report_vm_error(&e, url);
    }
  }

  /// Feeds a fetch response into the loader, returns `false` if the request
  /// is not owned by this loader.
  pub fn handle_fetch_response(&mut self, response: FetchResponse) -> bool {
    let pending = match self.core.requests.remove(&response.request_id) {
      Some(pending) => pending,
      None => return false,
    };
    trace!(
      "|ApplicationLoader::handle_fetch_response| {} request:{} url:{:?}",
      pending.kind,
      response.request_id,
      pending.url
    );
    if self.core.state.is_error() {
      trace!("|ApplicationLoader::handle_fetch_response| dropped in error state");
      return true;
    }

    match response.outcome {
      FetchOutcome::Success { final_url, text } => {
        if final_url != pending.url {
          debug!("|ApplicationLoader::handle_fetch_response| {:?} redirected to {final_url:?}", pending.url);
        }
        self.dispatch_success(&pending, &text);
      }
      FetchOutcome::Error(message) => {
        let e = TheErr::FetchFailed {
          url: pending.url.clone(),
          message,
        };
        self.dispatch_failure(&pending, e);
      }
      FetchOutcome::Canceled => {
        self.dispatch_failure(&pending, TheErr::FetchCanceled(pending.url.clone()));
      }
    }

    self.core.check_ready();
    true
  }

  fn dispatch_success(&mut self, pending: &PendingRequest, text: &str) {
    let url = pending.url.as_str();
    match pending.kind {
      RequestKind::Entry => {
        self.core.tracker.remove_library(url);
        self.load_entry(url, text);
      }
      RequestKind::Library => {
        // Removed before the VM sees the text, whatever the VM reports.
        self.core.tracker.remove_library(url);
        let vm = self.vm();
        let result = vm.borrow_mut().load_library(url, text, 0, &mut self.core);
        if let Err(e) = result {
          self.core.report_vm_error(&e, url);
          self.core.failed_urls.insert(url.to_string());
        }
      }
      RequestKind::SourceInclude => {
        let importers = self.core.tracker.take_source_include(url);
        let vm = self.vm();
        for importer in importers {
          let result = vm.borrow_mut().load_source(
            importer.handle,
            url,
            text,
            0,
            &mut self.core,
          );
          if let Err(e) = result {
            self.core.report_vm_error(&e, url);
          }
        }
      }
      RequestKind::ImportedScript => {
        self.remove_imported_script(url);
        self.load_imported_script(url, text);
      }
    }
  }

  fn dispatch_failure(&mut self, pending: &PendingRequest, e: TheErr) {
    let url = pending.url.as_str();
    let message = e.to_string();
    self.core.report(&message, Some(url), None);
    match pending.kind {
      RequestKind::Entry => {
        self.core.tracker.remove_library(url);
        self.core.fail(&message);
      }
      RequestKind::Library => {
        self.core.tracker.remove_library(url);
        self.core.failed_urls.insert(url.to_string());
      }
      RequestKind::SourceInclude => {
        self.core.tracker.take_source_include(url);
      }
      RequestKind::ImportedScript => {
        self.remove_imported_script(url);
      }
    }
  }

  fn remove_imported_script(&mut self, url: &str) {
    if let Some(index) = self
      .core
      .imported_scripts
      .iter()
      .position(|script| script.requested && script.url == url)
    {
      self.core.imported_scripts.remove(index);
    }
  }

  /// Raises a deferred import of a running program from outside a VM call.
  pub fn request_deferred_import(
    &mut self,
    importer: &Library,
    url: &str,
  ) -> TheResult<()> {
    match self.core.state {
      LoaderState::Error => return Ok(()),
      state if state.has_run() => {}
      state => {
        return Err(TheErr::IllegalLoaderState {
          operation: "request a deferred import",
          state,
        });
      }
    }
    let canonical = self.core.canonicalize(&importer.url, url)?;
    self
      .core
      .handle_library_tag(DependencyKind::Import, importer, &canonical)?;
    Ok(())
  }

  /// Invokes the program.
  ///
  /// - Ready: finalizes compilation, writes a snapshot if the program is
  ///   cacheable, and invokes the entry point.
  /// - DeferredReady: finalizes the deferred units, the entry point is not
  ///   invoked again.
  /// - Error: no-op.
  pub fn load(&mut self) -> TheResult<()> {
    match self.core.state {
      LoaderState::Error => Ok(()),
      LoaderState::Ready => {
        let vm = self.vm();
        let entry_url = self.core.entry_url.clone();
        let finalized = vm.borrow_mut().finalize_compilation(false);
        if let Err(e) = finalized {
          return Err(self.fail_with(e, &entry_url));
        }
        self.write_snapshot(&vm, &entry_url);

        // Running before invoking, deferred imports are raised while the
        // entry point runs.
        self.core.transition(LoaderState::Running);
        let invoked = vm.borrow_mut().invoke_entry_point(&mut self.core);
        if let Err(e) = invoked {
          return Err(self.fail_with(e, &entry_url));
        }
        Ok(())
      }
      LoaderState::DeferredReady => {
        let vm = self.vm();
        let entry_url = self.core.entry_url.clone();
        let finalized = vm.borrow_mut().finalize_compilation(true);
        if let Err(e) = finalized {
          return Err(self.fail_with(e, &entry_url));
        }
        self.core.transition(LoaderState::Running);
        Ok(())
      }
      state => Err(TheErr::IllegalLoaderState {
        operation: "load",
        state,
      }),
    }
  }

  fn fail_with(&mut self, e: VmError, url: &str) -> TheErr {
    self.core.report_vm_error(&e, url);
    self.core.fail(&e.to_string());
    TheErr::Vm(e)
  }

  fn write_snapshot(&mut self, vm: &VmEmbeddingRc, entry_url: &str) {
    let mode = self.core.options.snapshot_mode;
    if !mode.is_enabled() {
      return;
    }
    let already_cached = !self.core.loaded_from_snapshot
      && self.core.cacheable
      && self
        .core
        .fetch
        .borrow()
        .cached_metadata(entry_url, SNAPSHOT_TYPE_TAG)
        .is_some();
    let decision = SnapshotDecision {
      mode,
      cacheable: self.core.cacheable,
      loaded_from_snapshot: self.core.loaded_from_snapshot,
      already_cached,
    };
    debug!("|ApplicationLoader::write_snapshot| {decision:?}");
    if !decision.should_write() {
      return;
    }

    let created = vm.borrow_mut().create_snapshot();
    match created {
      Ok(snapshot) => self.core.fetch.borrow_mut().set_cached_metadata(
        entry_url,
        SNAPSHOT_TYPE_TAG,
        &snapshot,
      ),
      Err(e) => warn!("Failed to create snapshot of {entry_url:?}: {e}"),
    }
  }
}

impl Drop for ApplicationLoader {
  fn drop(&mut self) {
    if self.core.requests.is_empty() {
      return;
    }
    match self.core.fetch.try_borrow_mut() {
      Ok(mut fetch) => {
        for request_id in self.core.requests.keys() {
          trace!("|ApplicationLoader::drop| cancel request:{request_id}");
          fetch.cancel(*request_id);
        }
      }
      Err(_) => warn!("Fetch client is busy, outstanding requests are not canceled"),
    }
  }
}
