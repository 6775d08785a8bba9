//! Loader state.

#[derive(
  Debug,
  Copy,
  Clone,
  PartialEq,
  Eq,
  Hash,
  Default,
  strum_macros::Display,
  strum_macros::EnumString,
)]
/// State of an [`ApplicationLoader`](crate::loader::ApplicationLoader).
pub enum LoaderState {
  #[default]
  #[strum(serialize = "uninitialized")]
  /// Constructed, no isolate bound.
  Uninitialized,

  #[strum(serialize = "initialized")]
  /// Isolate bound, library-tag handler installed.
  Initialized,

  #[strum(serialize = "fetching")]
  /// Entry script requested from the fetch layer.
  Fetching,

  #[strum(serialize = "loading")]
  /// Entry handed to the VM, the dependency graph may still grow.
  Loading,

  #[strum(serialize = "ready")]
  /// Dependency graph exhausted, entry point not invoked yet.
  Ready,

  #[strum(serialize = "running")]
  /// Entry point invoked.
  Running,

  #[strum(serialize = "deferred-loading")]
  /// Running program raised deferred dependencies.
  DeferredLoading,

  #[strum(serialize = "deferred-ready")]
  /// Deferred dependency graph exhausted.
  DeferredReady,

  #[strum(serialize = "error")]
  /// Unrecoverable failure.
  Error,
}

impl LoaderState {
  /// Whether moving from `self` to `next` is legal.
  pub fn can_transition_to(&self, next: LoaderState) -> bool {
    use LoaderState::*;

    match (*self, next) {
      (Error, _) => false,
      (_, Error) => true,
      (Uninitialized, Initialized)
      | (Initialized, Fetching)
      | (Fetching, Loading)
      | (Fetching, Ready)
      | (Loading, Ready)
      | (Ready, Running)
      | (Running, DeferredLoading)
      | (DeferredLoading, DeferredReady)
      | (DeferredReady, DeferredLoading)
      | (DeferredReady, Running) => true,
      _ => false,
    }
  }

  /// Whether the program's entry point has been invoked.
  pub fn has_run(&self) -> bool {
    matches!(
      self,
      LoaderState::Running
        | LoaderState::DeferredLoading
        | LoaderState::DeferredReady
    )
  }

  pub fn is_error(&self) -> bool {
    *self == LoaderState::Error
  }
}
