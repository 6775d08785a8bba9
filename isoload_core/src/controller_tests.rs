use super::controller::*;

use crate::fetch::FetchClientRc;
use crate::isolate::{IsolateId, IsolateKind};
use crate::loader::options::LoaderOptions;
use crate::loader::state::LoaderState;
use crate::platform::{Platform, PlatformOptions, PlatformRc};
use crate::prelude::*;
use crate::tests::callback::RecordingCallback;
use crate::tests::fetch::*;
use crate::tests::log::init as test_log_init;
use crate::vm::text_vm::{TextVmFactory, TextVmRc};
use crate::vm::{IsolateFactory, Library, LibraryHandle, VmEmbeddingRc};

use std::cell::RefCell;
use std::rc::Rc;

const DOCUMENT_URL: &str = "/app/index.html";
const MAIN_URL: &str = "/app/main.dart";

type CreatedIsolates = Rc<RefCell<Vec<(IsolateId, IsolateKind, TextVmRc)>>>;

struct Fixture {
  controller: LifecycleController,
  fetch: MemoryFetchClientRc,
  platform: PlatformRc,
  created: CreatedIsolates,
}

impl Fixture {
  fn vm(&self, isolate: IsolateId) -> TextVmRc {
    self
      .created
      .borrow()
      .iter()
      .find(|(id, _, _)| *id == isolate)
      .map(|(_, _, vm)| vm.clone())
      .unwrap()
  }

  fn primary_isolate(&self) -> IsolateId {
    self.controller.loader().unwrap().isolate().unwrap()
  }
}

// Pre-installs the library-tag handler of every isolate, so the loader
// cannot install its own.
struct HandlerTakenFactory(TextVmFactory);

impl IsolateFactory for HandlerTakenFactory {
  fn initialize_vm(&mut self, flags: &[String]) -> AnyResult<()> {
    self.0.initialize_vm(flags)
  }

  fn create_isolate(
    &mut self,
    id: IsolateId,
    kind: IsolateKind,
    url: &str,
    entry_name: &str,
  ) -> Result<VmEmbeddingRc, String> {
    let vm = self.0.create_isolate(id, kind, url, entry_name)?;
    vm.borrow_mut()
      .install_library_tag_handler()
      .map_err(|e| e.to_string())?;
    Ok(vm)
  }
}

fn make_fixture_with_factory(
  sources: Vec<(&str, &str)>,
  factory: TextVmFactory,
) -> Fixture {
  let created = factory.created();
  make_fixture_with_boxed_factory(sources, Box::new(factory), created)
}

fn make_fixture_with_boxed_factory(
  sources: Vec<(&str, &str)>,
  factory: Box<dyn IsolateFactory>,
  created: CreatedIsolates,
) -> Fixture {
  let platform = Platform::to_rc(Platform::new(PlatformOptions::default(), factory));
  let fetch = MemoryFetchClient::to_rc(MemoryFetchClient::with_sources(sources));
  let fetch_client: FetchClientRc = fetch.clone();
  let controller = LifecycleController::new(
    platform.clone(),
    fetch_client,
    LoaderOptions::default(),
  );
  Fixture {
    controller,
    fetch,
    platform,
    created,
  }
}

fn make_fixture(sources: Vec<(&str, &str)>) -> Fixture {
  make_fixture_with_factory(sources, TextVmFactory::new(false))
}

#[cfg(test)]
mod test_evaluate_program {
  use super::*;

  #[test]
  fn primary_program1() {
    test_log_init();

    let mut f = make_fixture(vec![
      (MAIN_URL, "import \"util.dart\";\nprint \"hello\";\nmain;"),
      ("/app/util.dart", "library util;"),
    ]);
    let document = next_document_id();
    let callback = RecordingCallback::new();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(document, DOCUMENT_URL, "main.dart"),
        callback.boxed(),
      )
      .unwrap();

    assert!(f.platform.is_vm_initialized());
    assert!(f.controller.is_document_running(document));
    assert_eq!(f.controller.primary_document(), Some(document));
    assert_eq!(f.controller.isolates().len(), 1);
    assert_eq!(f.controller.isolates()[0].kind, IsolateKind::Main);
    assert_eq!(f.controller.isolates()[0].document, Some(document));
    assert_eq!(f.controller.loader().unwrap().entry_url(), MAIN_URL);
    assert!(f.controller.has_pending_requests());
    // No isolate is left entered.
    assert_eq!(f.platform.tracker().current(), None);

    assert_eq!(pump_controller(&f.fetch, &mut f.controller), 2);
    assert_eq!(
      f.controller.loader().unwrap().state(),
      LoaderState::Running
    );
    assert!(!f.controller.has_pending_requests());
    assert_eq!(callback.ready_count(), 1);
    let vm = f.vm(f.primary_isolate());
    assert_eq!(vm.borrow().output(), &vec!["hello".to_string()]);
  }

  #[test]
  fn inline_program1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let document = next_document_id();
    let callback = RecordingCallback::new();
    f.controller
      .evaluate_program(
        SourceUnit::with_inline(document, DOCUMENT_URL, "print \"inline\";\nmain;"),
        callback.boxed(),
      )
      .unwrap();

    // Nothing to fetch, it runs at once.
    let loader = f.controller.loader().unwrap();
    assert_eq!(loader.state(), LoaderState::Running);
    assert_eq!(loader.entry_url(), DOCUMENT_URL);
    let vm = f.vm(f.primary_isolate());
    assert_eq!(vm.borrow().output(), &vec!["inline".to_string()]);
  }

  #[test]
  fn duplicate_program1() {
    test_log_init();

    let mut f = make_fixture(vec![(MAIN_URL, "main;"), ("/app/b.dart", "main;")]);
    let document = next_document_id();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(document, DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();

    // The first program is still loading.
    let callback = RecordingCallback::new();
    let result = f.controller.evaluate_program(
      SourceUnit::with_src(document, DOCUMENT_URL, "b.dart"),
      callback.boxed(),
    );
    assert!(matches!(result, Err(TheErr::DuplicateProgram(_))));
    assert_eq!(callback.error_urls(), vec![Some("b.dart".to_string())]);
    assert_eq!(f.controller.isolates().len(), 1);
    assert_eq!(f.fetch.borrow().fetch_count("/app/b.dart"), 0);
  }

  #[test]
  fn scripts_after_running1() {
    test_log_init();

    let mut f = make_fixture(vec![
      (MAIN_URL, "import \"util.dart\";\nmain;"),
      ("/app/util.dart", "library util;"),
    ]);
    let document = next_document_id();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(document, DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);

    // Already in the graph.
    f.controller
      .evaluate_program(
        SourceUnit::with_src(document, DOCUMENT_URL, "util.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();

    let callback = RecordingCallback::new();
    let result = f.controller.evaluate_program(
      SourceUnit::with_src(document, DOCUMENT_URL, "new.dart"),
      callback.boxed(),
    );
    match result {
      Err(TheErr::ScriptAfterRunning(url)) => assert_eq!(url, "/app/new.dart"),
      other => panic!("Unexpected result {other:?}"),
    }
    assert_eq!(callback.error_messages().len(), 1);

    let result = f.controller.evaluate_program(
      SourceUnit::with_inline(document, DOCUMENT_URL, "main;"),
      RecordingCallback::new().boxed(),
    );
    assert!(matches!(result, Err(TheErr::InlineScriptAfterRunning)));
    assert_eq!(f.controller.isolates().len(), 1);
    assert_eq!(f.fetch.borrow().requested_urls().len(), 2);
  }

  #[test]
  fn frame_busy1() {
    test_log_init();

    let mut f = make_fixture(vec![(MAIN_URL, "main;")]);
    f.controller
      .evaluate_program(
        SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();

    let other = next_document_id();
    let result = f.controller.evaluate_program(
      SourceUnit::with_src(other, "/other/index.html", "main.dart"),
      RecordingCallback::new().boxed(),
    );
    assert!(matches!(result, Err(TheErr::FrameBusy(_))));
    assert!(!f.controller.is_document_running(other));
  }

  #[test]
  fn entry_fetch_failure1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let callback = RecordingCallback::new();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "missing.dart"),
        callback.boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);

    assert_eq!(f.controller.loader().unwrap().state(), LoaderState::Error);
    assert_eq!(callback.ready_count(), 0);
    assert_eq!(callback.error_events().len(), 1);
  }

  #[test]
  fn retry_after_entry_failure1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let document = next_document_id();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(document, DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);
    assert_eq!(f.controller.loader().unwrap().state(), LoaderState::Error);
    let failed = f.primary_isolate();

    // The same document evaluates its program again.
    f.fetch.borrow_mut().add_source(MAIN_URL, "print \"hi\";\nmain;");
    let callback = RecordingCallback::new();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(document, DOCUMENT_URL, "main.dart"),
        callback.boxed(),
      )
      .unwrap();
    assert!(f.vm(failed).borrow().is_shut_down());
    assert_eq!(f.controller.isolates().len(), 1);
    assert_ne!(f.primary_isolate(), failed);
    assert!(f.controller.is_document_running(document));

    pump_controller(&f.fetch, &mut f.controller);
    assert_eq!(
      f.controller.loader().unwrap().state(),
      LoaderState::Running
    );
    assert_eq!(callback.ready_count(), 1);
    assert!(callback.error_messages().is_empty());
  }

  #[test]
  fn failed_program_frees_frame1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let first = next_document_id();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(first, DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);
    assert_eq!(f.controller.loader().unwrap().state(), LoaderState::Error);

    f.fetch.borrow_mut().add_source("/app/other.dart", "main;");
    let second = next_document_id();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(second, DOCUMENT_URL, "other.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    assert!(!f.controller.is_document_running(first));
    assert!(f.controller.is_document_running(second));
    assert_eq!(f.controller.primary_document(), Some(second));
    assert_eq!(f.controller.isolates().len(), 1);
  }

  #[test]
  fn handler_install_failure1() {
    test_log_init();

    let inner = TextVmFactory::new(false);
    let created = inner.created();
    let mut f = make_fixture_with_boxed_factory(
      vec![(MAIN_URL, "main;")],
      Box::new(HandlerTakenFactory(inner)),
      created,
    );
    let document = next_document_id();
    for _ in 0..2 {
      let callback = RecordingCallback::new();
      let result = f.controller.evaluate_program(
        SourceUnit::with_src(document, DOCUMENT_URL, "main.dart"),
        callback.boxed(),
      );
      assert!(matches!(result, Err(TheErr::Vm(_))));
      assert_eq!(callback.error_messages().len(), 1);
      // The isolate is destroyed, not leaked.
      assert!(f.controller.isolates().is_empty());
      assert!(f.controller.loader().is_none());
      assert!(!f.controller.is_document_running(document));
    }
    assert_eq!(f.created.borrow().len(), 2);
    assert!(
      f.created
        .borrow()
        .iter()
        .all(|(_, _, vm)| vm.borrow().is_shut_down())
    );
    assert_eq!(f.platform.tracker().current(), None);
  }

  #[test]
  fn isolate_creation_failure1() {
    test_log_init();

    let mut f = make_fixture_with_factory(
      vec![(MAIN_URL, "main;")],
      TextVmFactory::new(false).with_isolate_limit(0),
    );
    let document = next_document_id();
    let callback = RecordingCallback::new();
    let result = f.controller.evaluate_program(
      SourceUnit::with_src(document, DOCUMENT_URL, "main.dart"),
      callback.boxed(),
    );
    assert!(matches!(result, Err(TheErr::IsolateCreationFailed(..))));
    assert_eq!(callback.error_messages().len(), 1);
    assert!(f.controller.loader().is_none());
    assert!(!f.controller.is_document_running(document));
    assert!(f.fetch.borrow().requested_urls().is_empty());
  }

  #[test]
  fn invalid_src1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let callback = RecordingCallback::new();
    let result = f.controller.evaluate_program(
      SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "ftp://x/y.dart"),
      callback.boxed(),
    );
    assert!(matches!(result, Err(TheErr::InvalidUrl(..))));
    assert!(f.controller.isolates().is_empty());
  }
}

#[cfg(test)]
mod test_spawn_program {
  use super::*;

  #[test]
  fn spawn_restores_caller1() {
    test_log_init();

    let mut f = make_fixture(vec![
      (MAIN_URL, "main;"),
      ("/app/worker.dart", "print \"worker\";\nmain;"),
    ]);
    f.controller
      .evaluate_program(
        SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);
    let primary = f.primary_isolate();

    let tracker = f.platform.tracker().clone();
    let callback = RecordingCallback::new();
    let spawned = {
      let _scope = tracker.enter(primary);
      let spawned = f
        .controller
        .spawn_program("/app/worker.dart", callback.boxed())
        .unwrap();
      assert_eq!(tracker.current(), Some(primary));
      assert_eq!(
        f.controller.current_loader().unwrap().isolate(),
        Some(primary)
      );
      spawned
    };
    assert_ne!(spawned, primary);
    assert_eq!(f.controller.spawned_count(), 1);
    assert!(f.controller.has_pending_requests());
    assert!(tracker.history().contains(&spawned));

    pump_controller(&f.fetch, &mut f.controller);
    // Run and discarded.
    assert_eq!(f.controller.spawned_count(), 0);
    assert_eq!(callback.ready_count(), 1);
    let vm = f.vm(spawned);
    assert!(vm.borrow().entry_invoked());
    assert_eq!(vm.borrow().output(), &vec!["worker".to_string()]);

    let kinds: Vec<IsolateKind> =
      f.controller.isolates().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![IsolateKind::Main, IsolateKind::Spawned]);

    // No loader to route deferred imports to.
    let importer = Library::new(LibraryHandle::new(0), "/app/worker.dart");
    assert!(matches!(
      f.controller.handle_deferred_import(spawned, &importer, "late.dart"),
      Err(TheErr::IsolateNotFound(_))
    ));
  }

  #[test]
  fn spawn_failure_restores_caller1() {
    test_log_init();

    let mut f = make_fixture_with_factory(
      vec![(MAIN_URL, "main;")],
      TextVmFactory::new(false).with_isolate_limit(1),
    );
    f.controller
      .evaluate_program(
        SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    let primary = f.primary_isolate();

    let tracker = f.platform.tracker().clone();
    let _scope = tracker.enter(primary);
    let result = f
      .controller
      .spawn_program("/app/worker.dart", RecordingCallback::new().boxed());
    assert!(matches!(result, Err(TheErr::IsolateCreationFailed(..))));
    assert_eq!(tracker.current(), Some(primary));
    assert_eq!(f.controller.spawned_count(), 0);
  }

  #[test]
  fn spawned_handler_install_failure1() {
    test_log_init();

    let inner = TextVmFactory::new(false);
    let created = inner.created();
    let mut f = make_fixture_with_boxed_factory(
      vec![("/app/worker.dart", "main;")],
      Box::new(HandlerTakenFactory(inner)),
      created,
    );
    let result = f
      .controller
      .spawn_program("/app/worker.dart", RecordingCallback::new().boxed());
    assert!(matches!(result, Err(TheErr::Vm(_))));
    assert!(f.controller.isolates().is_empty());
    assert_eq!(f.controller.spawned_count(), 0);
    assert!(f.created.borrow()[0].2.borrow().is_shut_down());
  }

  #[test]
  fn spawned_fetch_failure1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let callback = RecordingCallback::new();
    f.controller
      .spawn_program("/app/missing.dart", callback.boxed())
      .unwrap();
    assert_eq!(f.controller.spawned_count(), 1);

    pump_controller(&f.fetch, &mut f.controller);
    assert_eq!(f.controller.spawned_count(), 0);
    assert_eq!(callback.ready_count(), 0);
    assert_eq!(callback.error_events().len(), 1);
    assert!(f.controller.loader().is_none());
  }
}

#[cfg(test)]
mod test_deferred_import {
  use super::*;

  #[test]
  fn raised_by_entry_point1() {
    test_log_init();

    let mut f = make_fixture(vec![
      (MAIN_URL, "deferred import \"plugin.dart\";\nmain;"),
      ("/app/plugin.dart", "library plugin;"),
    ]);
    let callback = RecordingCallback::new();
    f.controller
      .evaluate_program(
        SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "main.dart"),
        callback.boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);

    // Deferred units are finalized as soon as they are ready.
    assert_eq!(
      f.controller.loader().unwrap().state(),
      LoaderState::Running
    );
    assert_eq!(callback.ready_count(), 2);
    assert!(f.vm(f.primary_isolate()).borrow().is_loaded("/app/plugin.dart"));
  }

  #[test]
  fn raised_by_embedder1() {
    test_log_init();

    let mut f = make_fixture(vec![
      (MAIN_URL, "main;"),
      ("/app/late.dart", "library late;"),
    ]);
    f.controller
      .evaluate_program(
        SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);
    let primary = f.primary_isolate();

    let importer = Library::new(LibraryHandle::new(0), MAIN_URL);
    f.controller
      .handle_deferred_import(primary, &importer, "late.dart")
      .unwrap();
    assert_eq!(
      f.controller.loader().unwrap().state(),
      LoaderState::DeferredLoading
    );
    pump_controller(&f.fetch, &mut f.controller);
    assert_eq!(
      f.controller.loader().unwrap().state(),
      LoaderState::Running
    );

    assert!(matches!(
      f.controller
        .handle_deferred_import(IsolateId::new(usize::MAX), &importer, "x.dart"),
      Err(TheErr::IsolateNotFound(_))
    ));
  }
}

#[cfg(test)]
mod test_lifecycle {
  use super::*;

  #[test]
  fn service_isolate1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let service = f.controller.create_service_isolate().unwrap();
    assert_eq!(f.controller.isolates()[0].kind, IsolateKind::Service);
    assert_eq!(f.controller.isolates()[0].url, SERVICE_ISOLATE_URL);
    assert!(f.controller.loader().is_none());

    let tracker = f.platform.tracker().clone();
    let _scope = tracker.enter(service);
    assert!(f.controller.current_loader().is_none());
  }

  #[test]
  fn program_isolate_kind1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let spawned = f
      .controller
      .create_program_isolate("/a.dart", DEFAULT_ENTRY_NAME, None)
      .unwrap();
    let main = f
      .controller
      .create_program_isolate("/b.dart", DEFAULT_ENTRY_NAME, Some(next_document_id()))
      .unwrap();
    let kinds: Vec<(IsolateId, IsolateKind)> = f
      .created
      .borrow()
      .iter()
      .map(|(id, kind, _)| (*id, *kind))
      .collect();
    assert_eq!(
      kinds,
      vec![(spawned, IsolateKind::Spawned), (main, IsolateKind::Main)]
    );
    assert!(matches!(
      f.controller.create_program_isolate("", DEFAULT_ENTRY_NAME, None),
      Err(TheErr::IsolateCreationFailed(..))
    ));
  }

  #[test]
  fn platform_shut_down1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    f.platform.shutdown();
    assert!(matches!(
      f.controller.create_service_isolate(),
      Err(TheErr::IsolateCreationFailed(..))
    ));
  }

  #[test]
  fn controllers_share_platform1() {
    test_log_init();

    let factory = TextVmFactory::new(false);
    let created = factory.created();
    let platform = Platform::to_rc(Platform::new(
      PlatformOptions::default(),
      Box::new(factory),
    ));
    let fetch = MemoryFetchClient::to_rc(MemoryFetchClient::with_sources(vec![(
      MAIN_URL, "main;",
    )]));
    let fetch_client: FetchClientRc = fetch.clone();
    let mut a = LifecycleController::new(
      platform.clone(),
      fetch_client.clone(),
      LoaderOptions::default(),
    );
    let mut b =
      LifecycleController::new(platform.clone(), fetch_client, LoaderOptions::default());

    // Each controller gets its own isolate from the platform's factory.
    for controller in [&mut a, &mut b] {
      controller
        .evaluate_program(
          SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "main.dart"),
          RecordingCallback::new().boxed(),
        )
        .unwrap();
      pump_controller(&fetch, controller);
      assert_eq!(
        controller.loader().unwrap().state(),
        LoaderState::Running
      );
    }
    assert!(platform.is_vm_initialized());
    assert_eq!(created.borrow().len(), 2);
  }

  #[test]
  fn unowned_response1() {
    test_log_init();

    let mut f = make_fixture(vec![(MAIN_URL, "main;")]);
    let fetch_client: FetchClientRc = f.fetch.clone();
    let mut stray = crate::loader::ApplicationLoader::new(
      LoaderOptions::default(),
      fetch_client,
      RecordingCallback::new().boxed(),
    );
    let vm = crate::vm::text_vm::TextVm::to_rc(crate::vm::text_vm::TextVm::new(
      DEFAULT_ENTRY_NAME,
      false,
    ));
    stray.initialize(IsolateId::new(usize::MAX), vm, MAIN_URL).unwrap();
    stray.process_requests().unwrap();

    let response = f.fetch.borrow_mut().respond_next().unwrap();
    assert!(!f.controller.handle_fetch_response(response));
  }

  #[test]
  fn teardown1() {
    test_log_init();

    let mut f = make_fixture(vec![
      (MAIN_URL, "main;"),
      ("/app/worker.dart", "main;"),
    ]);
    f.controller
      .evaluate_program(
        SourceUnit::with_src(next_document_id(), DOCUMENT_URL, "main.dart"),
        RecordingCallback::new().boxed(),
      )
      .unwrap();
    pump_controller(&f.fetch, &mut f.controller);
    let primary = f.primary_isolate();
    f.controller.create_service_isolate().unwrap();

    // Outstanding when torn down.
    let spawned = f
      .controller
      .spawn_program("/app/worker.dart", RecordingCallback::new().boxed())
      .unwrap();
    let request_id = f.fetch.borrow().request_id("/app/worker.dart").unwrap();

    let tracker = f.platform.tracker().clone();
    let scope = tracker.enter(primary);
    f.controller.teardown();
    // The current isolate is destroyed, it is not re-entered.
    assert_eq!(tracker.current(), None);
    std::mem::forget(scope);

    assert!(f.controller.isolates().is_empty());
    assert!(f.controller.loader().is_none());
    assert_eq!(f.controller.spawned_count(), 0);
    assert!(f.controller.primary_document().is_none());
    assert!(f.fetch.borrow().canceled().contains(&request_id));
    for (_, _, vm) in f.created.borrow().iter() {
      assert!(vm.borrow().is_shut_down());
    }
    assert!(f.vm(spawned).borrow().is_shut_down());

    // Twice is fine.
    f.controller.teardown();
  }

  #[test]
  fn teardown_keeps_foreign_current1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    f.controller.create_service_isolate().unwrap();
    let tracker = f.platform.tracker().clone();
    let foreign = IsolateId::new(usize::MAX);
    let _scope = tracker.enter(foreign);
    f.controller.teardown();
    assert_eq!(tracker.current(), Some(foreign));
  }

  #[test]
  fn teardown_busy_isolate1() {
    test_log_init();

    let mut f = make_fixture(vec![]);
    let service = f.controller.create_service_isolate().unwrap();
    let vm = f.vm(service);
    {
      // A VM call is executing in the isolate.
      let _busy = vm.borrow_mut();
      f.controller.teardown();
    }
    assert!(f.controller.isolates().is_empty());
    assert!(!vm.borrow().is_shut_down());
  }
}
