//! Isolate and program lifecycle of one embedding frame.
//!
//! A [`LifecycleController`] creates the frame's isolates, owns the loader of
//! the frame's primary document, and runs programs spawned by it in fresh
//! isolates with their own disposable loaders.
//!
//! Every call into a loader or an isolate happens while that isolate is the
//! current isolate of the thread, the controller enters and exits isolates
//! around each call through the platform's
//! [`IsolateTracker`](crate::isolate::IsolateTracker).

use crate::fetch::{FetchClientRc, FetchResponse};
use crate::isolate::{IsolateId, IsolateKind, next_isolate_id};
use crate::loader::options::LoaderOptions;
use crate::loader::state::LoaderState;
use crate::loader::{ApplicationLoader, LoaderCallback};
use crate::platform::PlatformRc;
use crate::prelude::*;
use crate::vm::{Library, VmEmbeddingRc};

/// Entry point of every program.
pub const DEFAULT_ENTRY_NAME: &str = "main";

/// Url of the service isolate.
pub const SERVICE_ISOLATE_URL: &str = "vm-service://isolate";

struct_id_impl!(DocumentId, usize);
next_incremental_id_impl!(next_document_id, DocumentId, AtomicUsize, usize, 1);

#[derive(Debug, Clone, PartialEq, Eq)]
/// A program-bearing element, i.e. a `<script>`.
pub struct SourceUnit {
  pub document: DocumentId,
  pub document_url: String,
  /// Url of the program, relative to the document.
  pub src: Option<String>,
  /// Inline program text, only used if `src` is `None`.
  pub inline: Option<String>,
}

impl SourceUnit {
  pub fn with_src(document: DocumentId, document_url: &str, src: &str) -> Self {
    SourceUnit {
      document,
      document_url: document_url.to_string(),
      src: Some(src.to_string()),
      inline: None,
    }
  }

  pub fn with_inline(document: DocumentId, document_url: &str, text: &str) -> Self {
    SourceUnit {
      document,
      document_url: document_url.to_string(),
      src: None,
      inline: Some(text.to_string()),
    }
  }

  // Label of the element in error messages.
  fn label(&self) -> String {
    match &self.src {
      Some(src) => src.clone(),
      None => format!("inline script of {}", self.document_url),
    }
  }
}

#[derive(Clone)]
/// A live isolate of the frame.
pub struct IsolateRecord {
  pub id: IsolateId,
  pub kind: IsolateKind,
  pub url: String,
  pub document: Option<DocumentId>,
  pub vm: VmEmbeddingRc,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
// Where the loader of an isolate lives.
enum LoaderSlot {
  Primary,
  Spawned,
}

/// Isolate and program bookkeeping of one frame.
pub struct LifecycleController {
  platform: PlatformRc,
  fetch: FetchClientRc,
  options: LoaderOptions,

  isolates: Vec<IsolateRecord>,

  // Loader of the primary document's isolate.
  loader: Option<ApplicationLoader>,
  primary_document: Option<DocumentId>,

  // Disposable loaders of spawned programs, dropped once they are run.
  spawned: Vec<ApplicationLoader>,

  // One program per document.
  documents_running: HashSet<DocumentId>,

  // Isolate => loader.
  registry: HashMap<IsolateId, LoaderSlot>,
}

impl LifecycleController {
  pub fn new(
    platform: PlatformRc,
    fetch: FetchClientRc,
    options: LoaderOptions,
  ) -> Self {
    LifecycleController {
      platform,
      fetch,
      options,
      isolates: vec![],
      loader: None,
      primary_document: None,
      spawned: vec![],
      documents_running: HashSet::new(),
      registry: HashMap::new(),
    }
  }

  pub fn platform(&self) -> &PlatformRc {
    &self.platform
  }

  pub fn isolates(&self) -> &Vec<IsolateRecord> {
    &self.isolates
  }

  /// Loader of the primary document.
  pub fn loader(&self) -> Option<&ApplicationLoader> {
    self.loader.as_ref()
  }

  pub fn primary_document(&self) -> Option<DocumentId> {
    self.primary_document
  }

  /// Count of spawned programs that are not run yet.
  pub fn spawned_count(&self) -> usize {
    self.spawned.len()
  }

  pub fn is_document_running(&self, document: DocumentId) -> bool {
    self.documents_running.contains(&document)
  }

  /// Loader of the current isolate.
  pub fn current_loader(&self) -> Option<&ApplicationLoader> {
    let current = self.platform.tracker().current()?;
    self.loader_of(current)
  }

  fn loader_of(&self, isolate: IsolateId) -> Option<&ApplicationLoader> {
    match self.registry.get(&isolate)? {
      LoaderSlot::Primary => self.loader.as_ref(),
      LoaderSlot::Spawned => self
        .spawned
        .iter()
        .find(|loader| loader.isolate() == Some(isolate)),
    }
  }

  /// Whether any loader waits for a fetch response.
  pub fn has_pending_requests(&self) -> bool {
    self
      .loader
      .as_ref()
      .map(|loader| loader.has_outstanding_requests())
      .unwrap_or(false)
      || self
        .spawned
        .iter()
        .any(|loader| loader.has_outstanding_requests())
  }

  fn create_isolate(
    &mut self,
    kind: IsolateKind,
    url: &str,
    entry_name: &str,
    document: Option<DocumentId>,
  ) -> TheResult<IsolateId> {
    let id = next_isolate_id();
    let vm = self.platform.create_isolate(id, kind, url, entry_name)?;
    debug!("|LifecycleController::create_isolate| {kind} isolate:{id} url:{url:?}");
    self.isolates.push(IsolateRecord {
      id,
      kind,
      url: url.to_string(),
      document,
      vm,
    });
    Ok(id)
  }

  // Shuts down an isolate whose program never started or failed, and forgets
  // its record.
  fn destroy_isolate(&mut self, isolate: IsolateId) {
    self.registry.remove(&isolate);
    let index = match self.isolates.iter().position(|record| record.id == isolate) {
      Some(index) => index,
      None => return,
    };
    let record = self.isolates.remove(index);
    debug!("|LifecycleController::destroy_isolate| isolate:{isolate} url:{:?}", record.url);
    let tracker = self.platform.tracker().clone();
    tracker.with_isolate(isolate, || match record.vm.try_borrow_mut() {
      Ok(mut vm) => vm.shutdown(),
      Err(_) => warn!("Isolate {isolate} is busy, it is not shut down"),
    });
  }

  // Drops the primary loader if it is in the error state, its document may
  // evaluate a program again.
  fn discard_failed_primary(&mut self) {
    let failed = self
      .loader
      .as_ref()
      .map(|loader| loader.state().is_error())
      .unwrap_or(false);
    if !failed {
      return;
    }
    let isolate = self.loader.take().and_then(|loader| loader.isolate());
    if let Some(document) = self.primary_document.take() {
      debug!("|LifecycleController::discard_failed_primary| document:{document}");
      self.documents_running.remove(&document);
    }
    if let Some(isolate) = isolate {
      self.destroy_isolate(isolate);
    }
  }

  fn isolate_vm(&self, isolate: IsolateId) -> Option<VmEmbeddingRc> {
    self
      .isolates
      .iter()
      .find(|record| record.id == isolate)
      .map(|record| record.vm.clone())
  }

  /// Creates an isolate for a program, the error carries the VM's message if
  /// the isolate cannot be allocated.
  pub fn create_program_isolate(
    &mut self,
    url: &str,
    entry_name: &str,
    document: Option<DocumentId>,
  ) -> TheResult<IsolateId> {
    let kind = match document {
      Some(_) => IsolateKind::Main,
      None => IsolateKind::Spawned,
    };
    self.create_isolate(kind, url, entry_name, document)
  }

  /// Creates the VM service isolate, it never gets a loader.
  pub fn create_service_isolate(&mut self) -> TheResult<IsolateId> {
    self.create_isolate(
      IsolateKind::Service,
      SERVICE_ISOLATE_URL,
      DEFAULT_ENTRY_NAME,
      None,
    )
  }

  fn resolve_src(&self, document_url: &str, src: &str) -> TheResult<String> {
    self.fetch.borrow().resolve_url(
      document_url,
      src,
      self.options.package_root.as_deref(),
    )
  }

  // Checks a program-bearing element of a document that already has a
  // program.
  fn check_existing_program(&self, unit: &SourceUnit) -> TheResult<()> {
    let running = self
      .loader
      .as_ref()
      .filter(|_| self.primary_document == Some(unit.document))
      .filter(|loader| loader.state().has_run());
    let loader = match running {
      Some(loader) => loader,
      None => return Err(TheErr::DuplicateProgram(unit.label())),
    };
    match &unit.src {
      Some(src) => {
        let url = self.resolve_src(&unit.document_url, src)?;
        if loader.graph_contains(&url) {
          debug!("|LifecycleController::evaluate_program| {url:?} is already loaded");
          Ok(())
        } else {
          Err(TheErr::ScriptAfterRunning(url))
        }
      }
      None => Err(TheErr::InlineScriptAfterRunning),
    }
  }

  /// Evaluates a program-bearing element of a document.
  ///
  /// Only the first element of a document starts a program. Once the program
  /// runs, later elements may only reference urls that are already part of
  /// its dependency graph. A program that failed to load is discarded, so the
  /// next element starts a fresh one. Errors are reported to `callback` and
  /// returned.
  pub fn evaluate_program(
    &mut self,
    unit: SourceUnit,
    mut callback: Box<dyn LoaderCallback>,
  ) -> TheResult<()> {
    self.discard_failed_primary();

    let checked = if self.documents_running.contains(&unit.document) {
      self.check_existing_program(&unit).map(|_| None)
    } else if self.loader.is_some() {
      Err(TheErr::FrameBusy(unit.label()))
    } else {
      let entry_url = match &unit.src {
        Some(src) => self.resolve_src(&unit.document_url, src),
        None => Ok(unit.document_url.clone()),
      };
      entry_url.and_then(|entry_url| {
        self
          .create_program_isolate(&entry_url, DEFAULT_ENTRY_NAME, Some(unit.document))
          .map(|isolate| Some((isolate, entry_url)))
      })
    };

    let (isolate, entry_url) = match checked {
      Ok(Some(created)) => created,
      Ok(None) => return Ok(()),
      Err(e) => {
        let url = unit.src.clone().unwrap_or_else(|| unit.document_url.clone());
        warn!("Program of document {} is rejected: {e}", unit.document);
        callback.report_error(&e.to_string(), Some(&url), None);
        return Err(e);
      }
    };

    // From here on errors are reported by the loader.
    let vm = match self.isolate_vm(isolate) {
      Some(vm) => vm,
      None => return Err(TheErr::IsolateNotFound(isolate)),
    };
    let mut loader =
      ApplicationLoader::new(self.options.clone(), self.fetch.clone(), callback);
    let tracker = self.platform.tracker().clone();
    let started = tracker.with_isolate(isolate, || -> TheResult<()> {
      loader.initialize(isolate, vm, &entry_url)?;
      match &unit.inline {
        Some(text) if unit.src.is_none() => loader.process_single_request(text),
        _ => loader.process_requests(),
      }
    });
    if let Err(e) = started {
      drop(loader);
      self.destroy_isolate(isolate);
      return Err(e);
    }

    trace!("|LifecycleController::evaluate_program| document:{} isolate:{isolate}", unit.document);
    self.documents_running.insert(unit.document);
    self.primary_document = Some(unit.document);
    self.registry.insert(isolate, LoaderSlot::Primary);
    self.loader = Some(loader);
    self.run_primary_if_ready();
    Ok(())
  }

  /// Runs a program in a new isolate with a disposable loader. The caller's
  /// isolate is exited before and re-entered after, whatever the outcome.
  pub fn spawn_program(
    &mut self,
    url: &str,
    callback: Box<dyn LoaderCallback>,
  ) -> TheResult<IsolateId> {
    let tracker = self.platform.tracker().clone();
    let exited = tracker.exit_current();
    trace!("|LifecycleController::spawn_program| url:{url:?} caller:{:?}", exited.saved());
    let spawned = self.start_spawned(url, callback);
    drop(exited);

    let isolate = spawned?;
    self.run_spawned_if_ready(isolate);
    Ok(isolate)
  }

  fn start_spawned(
    &mut self,
    url: &str,
    callback: Box<dyn LoaderCallback>,
  ) -> TheResult<IsolateId> {
    let isolate = self.create_program_isolate(url, DEFAULT_ENTRY_NAME, None)?;
    let vm = match self.isolate_vm(isolate) {
      Some(vm) => vm,
      None => return Err(TheErr::IsolateNotFound(isolate)),
    };
    let mut loader =
      ApplicationLoader::new(self.options.clone(), self.fetch.clone(), callback);
    let started = {
      let _scope = self.platform.tracker().enter(isolate);
      loader
        .initialize(isolate, vm, url)
        .and_then(|_| loader.process_requests())
    };
    if let Err(e) = started {
      drop(loader);
      self.destroy_isolate(isolate);
      return Err(e);
    }
    self.registry.insert(isolate, LoaderSlot::Spawned);
    self.spawned.push(loader);
    Ok(isolate)
  }

  // Invokes the primary program once it is ready, or finalizes its deferred
  // units.
  fn run_primary_if_ready(&mut self) {
    let tracker = self.platform.tracker().clone();
    if let Some(loader) = self.loader.as_mut() {
      if !matches!(loader.state(), LoaderState::Ready | LoaderState::DeferredReady) {
        return;
      }
      let isolate = match loader.isolate() {
        Some(isolate) => isolate,
        None => return,
      };
      if let Err(e) = tracker.with_isolate(isolate, || loader.load()) {
        debug!("|LifecycleController::run_primary_if_ready| load failed: {e}");
      }
    }
  }

  // Invokes a spawned program once it is ready, its loader is discarded
  // afterwards. Failed loaders are discarded with their isolate.
  fn run_spawned_if_ready(&mut self, isolate: IsolateId) {
    let index = match self
      .spawned
      .iter()
      .position(|loader| loader.isolate() == Some(isolate))
    {
      Some(index) => index,
      None => return,
    };
    let state = self.spawned[index].state();
    match state {
      LoaderState::Ready => {
        let tracker = self.platform.tracker().clone();
        let loader = &mut self.spawned[index];
        if let Err(e) = tracker.with_isolate(isolate, || loader.load()) {
          debug!("|LifecycleController::run_spawned_if_ready| load failed: {e}");
        }
      }
      LoaderState::Error => {}
      _ => return,
    }
    trace!("|LifecycleController::run_spawned_if_ready| discard loader of isolate:{isolate}");
    self.registry.remove(&isolate);
    let loader = self.spawned.remove(index);
    if loader.state().is_error() {
      drop(loader);
      self.destroy_isolate(isolate);
    }
  }

  /// Routes a fetch response to the loader that issued it, returns `false` if
  /// no loader owns it.
  pub fn handle_fetch_response(&mut self, response: FetchResponse) -> bool {
    let tracker = self.platform.tracker().clone();
    let request_id = response.request_id;

    if let Some(loader) = self.loader.as_mut() {
      if loader.owns_request(request_id) {
        let isolate = loader.isolate();
        match isolate {
          Some(isolate) => {
            tracker.with_isolate(isolate, || loader.handle_fetch_response(response));
          }
          None => {
            loader.handle_fetch_response(response);
          }
        }
        self.run_primary_if_ready();
        return true;
      }
    }

    let owner = self
      .spawned
      .iter_mut()
      .find(|loader| loader.owns_request(request_id));
    if let Some(loader) = owner {
      let isolate = loader.isolate();
      match isolate {
        Some(isolate) => {
          tracker.with_isolate(isolate, || loader.handle_fetch_response(response));
          self.run_spawned_if_ready(isolate);
        }
        None => {
          loader.handle_fetch_response(response);
        }
      }
      return true;
    }

    trace!("|LifecycleController::handle_fetch_response| request:{request_id} has no owner");
    false
  }

  /// Raises a deferred import of a running program from outside a VM call,
  /// routed to the loader of `isolate`.
  pub fn handle_deferred_import(
    &mut self,
    isolate: IsolateId,
    importer: &Library,
    url: &str,
  ) -> TheResult<()> {
    match self.registry.get(&isolate) {
      Some(LoaderSlot::Primary) => {}
      _ => return Err(TheErr::IsolateNotFound(isolate)),
    }
    let tracker = self.platform.tracker().clone();
    let loader = match self.loader.as_mut() {
      Some(loader) => loader,
      None => return Err(TheErr::IsolateNotFound(isolate)),
    };
    tracker.with_isolate(isolate, || loader.request_deferred_import(importer, url))?;
    self.run_primary_if_ready();
    Ok(())
  }

  /// Destroys every isolate of the frame.
  ///
  /// The current isolate is exited first and re-entered afterwards, unless
  /// it is one of the destroyed isolates. Isolates busy in a VM call are
  /// skipped with a warning.
  pub fn teardown(&mut self) {
    if self.isolates.is_empty() && self.loader.is_none() && self.spawned.is_empty() {
      return;
    }
    let tracker = self.platform.tracker().clone();
    let mut exited = tracker.exit_current();
    debug!(
      "|LifecycleController::teardown| isolates:{} current:{:?}",
      self.isolates.len(),
      exited.saved()
    );

    // Loaders go first, they cancel their outstanding requests.
    self.registry.clear();
    self.spawned.clear();
    self.loader = None;

    for record in self.isolates.drain(..) {
      let _scope = tracker.enter(record.id);
      match record.vm.try_borrow_mut() {
        Ok(mut vm) => vm.shutdown(),
        Err(_) => warn!("Isolate {} is busy, it is not shut down", record.id),
      }
      if exited.saved() == Some(record.id) {
        exited.forget();
      }
    }

    self.documents_running.clear();
    self.primary_document = None;
  }
}

impl Drop for LifecycleController {
  fn drop(&mut self) {
    self.teardown();
  }
}
