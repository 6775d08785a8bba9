//! Results and errors.

use crate::isolate::IsolateId;
use crate::loader::state::LoaderState;
use crate::vm::VmError;

use compact_str::CompactString;

// anyhow {

/// [`anyhow::Error`]
pub type AnyErr = anyhow::Error;

/// [`anyhow::Result`] with `T` if ok, [`AnyErr`]([`anyhow::Error`]) if error.
pub type AnyResult<T> = anyhow::Result<T>;

// anyhow }

// std::io {

/// [`std::io::Error`]
pub type IoErr = std::io::Error;

/// [`std::io::ErrorKind`]
pub type IoErrKind = std::io::ErrorKind;

/// [`std::io::Result`] with `T` if ok.
pub type IoResult<T> = std::io::Result<T>;

// std::io }

// thiserror {

/// All error codes.
#[derive(Debug, thiserror::Error)]
pub enum TheErr {
  // loader {
  #[error("Cannot {operation} while the loader is {state}")]
  /// Operation is not legal in the loader's current state.
  IllegalLoaderState {
    operation: &'static str,
    state: LoaderState,
  },

  #[error("Failed to fetch `{url}`: {message}")]
  /// Fetch layer reported an error.
  FetchFailed { url: String, message: String },

  #[error("Fetch of `{0}` was canceled")]
  /// Fetch layer reported a cancellation.
  FetchCanceled(String),

  #[error("System library `{0}` cannot be fetched by the embedder")]
  /// Built-in system library requested from the fetch layer.
  SystemLibrary(String),

  #[error("Invalid url `{0}`: {1}")]
  /// Url cannot be resolved.
  InvalidUrl(String, CompactString),

  #[error("Unsupported charset `{0}`")]
  /// Fetched bytes cannot be decoded.
  UnsupportedCharset(CompactString),

  #[error("{0}")]
  /// Error object reported by the VM.
  Vm(#[from] VmError),
  // loader }

  // controller {
  #[error("Only one program is allowed per document, `{0}` is ignored")]
  /// Second program-bearing element in a single document.
  DuplicateProgram(String),

  #[error("Frame already hosts the program of another document, `{0}` is ignored")]
  /// Primary loader of the frame belongs to a different document.
  FrameBusy(String),

  #[error("Cannot add `{0}` to a running program, it is not part of its dependency graph")]
  /// New code referenced by markup after the program started running.
  ScriptAfterRunning(String),

  #[error("Inline scripts cannot be added to a running program")]
  /// Inline code after the program started running.
  InlineScriptAfterRunning,

  #[error("Failed to create isolate for `{0}`: {1}")]
  /// The VM could not allocate an isolate.
  IsolateCreationFailed(String, String),

  #[error("Isolate `{0}` has no program loader")]
  /// No loader is registered for the isolate.
  IsolateNotFound(IsolateId),
  // controller }

  #[error("Io error: {0}")]
  /// Io error.
  Io(#[from] IoErr),
}

/// [`Result`] with `T` if ok, [`TheErr`] if error.
pub type TheResult<T> = Result<T, TheErr>;

// thiserror }
