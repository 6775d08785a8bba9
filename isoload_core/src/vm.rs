//! The seam to the embedded script VM.
//!
//! The VM compiles script text into named libraries. While it parses a unit
//! it discovers unresolved imports and source-includes, and reports each of
//! them synchronously to the [`LibraryTagHandler`] passed into the call. The
//! handler is the loader that owns the isolate, it is passed explicitly on
//! every call instead of being recovered from isolate-local data.

use crate::isolate::{IsolateId, IsolateKind};
use crate::prelude::*;

use std::cell::RefCell;
use std::rc::Rc;

pub mod text_vm;


/// Url scheme of built-in system libraries.
pub const SYSTEM_SCHEME: &str = "dart:";

struct_id_impl!(LibraryHandle, usize);

#[derive(
  Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display,
)]
/// Kind of a library-tag request raised by the VM.
pub enum DependencyKind {
  #[strum(serialize = "import")]
  /// A library import, the imported url becomes its own library.
  Import,

  #[strum(serialize = "source-include")]
  /// A file merged textually into the importing library.
  SourceInclude,

  #[strum(serialize = "canonicalize-url")]
  /// Resolve a relative url against the importing library.
  CanonicalizeUrl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A library in the VM's library table.
pub struct Library {
  pub handle: LibraryHandle,
  pub url: String,
}

impl Library {
  pub fn new(handle: LibraryHandle, url: &str) -> Self {
    Library {
      handle,
      url: url.to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Answer to a library-tag request.
pub enum TagResponse {
  /// Dependency registered, its content arrives later.
  Acknowledged,
  /// Canonical form of the requested url.
  Canonical(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Opaque error object reported by the VM.
pub struct VmError {
  pub message: String,
  pub url: Option<String>,
  pub line: Option<u32>,
  pub exception: Option<String>,
}

impl VmError {
  pub fn new(message: impl Into<String>) -> Self {
    VmError {
      message: message.into(),
      url: None,
      line: None,
      exception: None,
    }
  }

  /// Compile error located in a unit.
  pub fn compile(url: &str, line: Option<u32>, message: impl Into<String>) -> Self {
    VmError {
      message: message.into(),
      url: Some(url.to_string()),
      line,
      exception: None,
    }
  }

  pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
    self.exception = Some(exception.into());
    self
  }

}

impl std::fmt::Display for VmError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match (&self.url, self.line) {
      (Some(url), Some(line)) => write!(f, "{url}:{line}: {}", self.message)?,
      (Some(url), None) => write!(f, "{url}: {}", self.message)?,
      _ => write!(f, "{}", self.message)?,
    }
    if let Some(exception) = &self.exception {
      write!(f, " ({exception})")?;
    }
    Ok(())
  }
}

impl std::error::Error for VmError {}

/// [`Result`] with `T` if ok, [`VmError`] if error.
pub type VmResult<T> = Result<T, VmError>;

/// Receives library-tag requests while the VM parses or runs a unit.
///
/// It can be invoked to arbitrary depth, every call must finish its
/// bookkeeping and return immediately.
pub trait LibraryTagHandler {
  fn handle_library_tag(
    &mut self,
    kind: DependencyKind,
    importer: &Library,
    url: &str,
  ) -> VmResult<TagResponse>;
}

/// VM embedding API of a single isolate.
pub trait VmEmbedding {
  /// Installs the isolate's library-tag handler, there is exactly one per
  /// isolate.
  fn install_library_tag_handler(&mut self) -> VmResult<()>;

  /// Loads the top-level script of the program.
  fn load_script(
    &mut self,
    url: &str,
    text: &str,
    line_offset: u32,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<LibraryHandle>;

  /// Loads an imported library.
  fn load_library(
    &mut self,
    url: &str,
    text: &str,
    line_offset: u32,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<LibraryHandle>;

  /// Merges a source-included file into `importer`.
  fn load_source(
    &mut self,
    importer: LibraryHandle,
    url: &str,
    text: &str,
    line_offset: u32,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<()>;

  /// Finishes compilation of everything loaded so far, including deferred
  /// units when `complete_deferred` is true.
  fn finalize_compilation(&mut self, complete_deferred: bool) -> VmResult<()>;

  /// Invokes the program's entry point. Deferred imports can be raised
  /// through `handler` while it runs.
  fn invoke_entry_point(
    &mut self,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<()>;

  /// Serializes the resolved program.
  fn create_snapshot(&mut self) -> VmResult<Vec<u8>>;

  /// Restores a program serialized by [`create_snapshot`](Self::create_snapshot).
  fn load_from_snapshot(&mut self, snapshot: &[u8]) -> VmResult<()>;

  /// Destroys the isolate.
  fn shutdown(&mut self) {}
}

pub type VmEmbeddingRc = Rc<RefCell<dyn VmEmbedding>>;

/// Creates isolates, i.e. VM instances.
pub trait IsolateFactory {
  /// One-time VM initialization, called by
  /// [`Platform`](crate::platform::Platform) before the first isolate.
  fn initialize_vm(&mut self, flags: &[String]) -> AnyResult<()>;

  /// Allocates a new isolate, the error is the VM's message.
  fn create_isolate(
    &mut self,
    id: IsolateId,
    kind: IsolateKind,
    url: &str,
    entry_name: &str,
  ) -> Result<VmEmbeddingRc, String>;
}
