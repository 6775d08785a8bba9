//! Loads and runs a program with the reference VM.
//!
//! See [isoload_core] for more details.

use isoload_core::controller::{LifecycleController, SourceUnit, next_document_id};
use isoload_core::envar;
use isoload_core::evloop::{EventLoop, ExitReason, fetch_channel};
use isoload_core::fetch::FetchClientRc;
use isoload_core::fetch::fs_fetch::FsFetchClient;
use isoload_core::loader::options::{LoaderOptions, LoaderOptionsBuilder, SnapshotMode};
use isoload_core::loader::{LoaderCallback, ReadyKind};
use isoload_core::log;
use isoload_core::platform::{Platform, PlatformOptions};
use isoload_core::prelude::*;
use isoload_core::vm::text_vm::TextVmFactory;

use clap::Parser;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Parser)]
#[command(name = "isoload", version, about = "Loads and runs a program with the reference VM")]
struct CliOpt {
  /// Entry script of the program.
  entry: PathBuf,

  /// Snapshot mode: off, single or all. Overrides `ISOLOAD_SNAPSHOT_MODE`.
  #[arg(long)]
  snapshot: Option<SnapshotMode>,

  /// Directory of `package:` urls. Overrides `ISOLOAD_PACKAGE_ROOT`.
  #[arg(long)]
  package_root: Option<PathBuf>,

  /// Metadata cache directory. Overrides `ISOLOAD_CACHE_DIR`.
  #[arg(long)]
  cache_dir: Option<PathBuf>,

  /// Charset of the fetched scripts.
  #[arg(long, default_value = "utf-8")]
  charset: String,

  /// Spawn another program after the entry, can be repeated.
  #[arg(long, value_name = "URL")]
  spawn: Vec<PathBuf>,

  /// Flags passed to the VM.
  #[arg(long = "vm-flag", value_name = "FLAG")]
  vm_flags: Vec<String>,

  /// Don't print the program output.
  #[arg(long)]
  no_echo: bool,
}

/// Prints loader events to the console, and counts the errors.
struct ConsoleCallback {
  label: String,
  errors: Rc<Cell<usize>>,
}

impl LoaderCallback for ConsoleCallback {
  fn ready(&mut self, kind: ReadyKind) {
    debug!("{} is ready ({kind})", self.label);
  }

  fn report_error(&mut self, message: &str, _url: Option<&str>, _line: Option<u32>) {
    eprintln!("error: {message}");
  }

  fn dispatch_error_event(&mut self, message: &str) {
    eprintln!("error: {} failed to load: {message}", self.label);
    self.errors.set(self.errors.get() + 1);
  }
}

fn absolute_url(path: &Path) -> AnyResult<String> {
  let cwd = std::env::current_dir()?;
  Ok(cwd.join(path).to_string_lossy().to_string())
}

fn loader_options(cli_opt: &CliOpt) -> AnyResult<LoaderOptions> {
  let env_options = LoaderOptions::from_env();
  let options = LoaderOptionsBuilder::default()
    .snapshot_mode(cli_opt.snapshot.unwrap_or(env_options.snapshot_mode))
    .package_root(cli_opt.package_root.clone().or(env_options.package_root))
    .charset(cli_opt.charset.as_str().into())
    .build()?;
  Ok(options)
}

async fn run(cli_opt: CliOpt) -> AnyResult<usize> {
  let options = loader_options(&cli_opt)?;
  let cache_dir = cli_opt.cache_dir.clone().or_else(envar::CACHE_DIR_PATH);
  trace!("options:{options:?} cache_dir:{cache_dir:?}");

  let (sender, receiver) = fetch_channel();
  let fs_fetch = Rc::new(RefCell::new(FsFetchClient::new(sender, cache_dir)));
  let fetch: FetchClientRc = fs_fetch.clone();
  let platform = Platform::to_rc(Platform::new(
    PlatformOptions {
      vm_flags: cli_opt.vm_flags.clone(),
    },
    Box::new(TextVmFactory::new(!cli_opt.no_echo)),
  ));
  let controller = LifecycleController::new(platform, fetch, options);
  let mut event_loop = EventLoop::new(controller, receiver);

  let errors = Rc::new(Cell::new(0_usize));
  let entry_url = absolute_url(&cli_opt.entry)?;
  let evaluated = event_loop.controller.evaluate_program(
    SourceUnit::with_src(next_document_id(), &entry_url, &entry_url),
    Box::new(ConsoleCallback {
      label: entry_url.clone(),
      errors: errors.clone(),
    }),
  );
  if evaluated.is_err() {
    errors.set(errors.get() + 1);
  }

  for spawn in cli_opt.spawn.iter() {
    let url = absolute_url(spawn)?;
    let callback = Box::new(ConsoleCallback {
      label: url.clone(),
      errors: errors.clone(),
    });
    if let Err(e) = event_loop.controller.spawn_program(&url, callback) {
      eprintln!("error: {e}");
      errors.set(errors.get() + 1);
    }
  }

  let reason = event_loop.run().await;
  if reason != ExitReason::Idle {
    warn!("Event loop exits with {reason}");
  }
  event_loop.shutdown();
  fs_fetch.borrow().shutdown().await;
  Ok(errors.get())
}

fn main() -> AnyResult<()> {
  log::init()?;
  let cli_opt = CliOpt::parse();
  trace!("cli_opt: {:?}", cli_opt);

  // Everything runs on the thread of the frame.
  let evloop_tokio_runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;
  let errors = evloop_tokio_runtime.block_on(run(cli_opt))?;
  if errors > 0 {
    std::process::exit(1);
  }
  Ok(())
}
