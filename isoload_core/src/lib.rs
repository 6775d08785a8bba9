//! The core library for the isoload program loader.
//!
//! It drives an embedded script VM through program loading: the entry script
//! is fetched, every import and source-include the VM discovers while parsing
//! is fetched and fed back, and once the dependency graph is exhausted the
//! program's entry point is invoked.
//!
//! The main pieces are:
//!
//! - [`loader::ApplicationLoader`]: the per-program load state machine.
//! - [`controller::LifecycleController`]: isolate and program bookkeeping for
//!   one embedding frame.
//! - [`fetch::ResourceFetchClient`] and [`vm::VmEmbedding`]: the seams to the
//!   network/cache layer and to the VM.

pub mod controller;
pub mod envar;
pub mod evloop;
pub mod fetch;
pub mod isolate;
pub mod loader;
pub mod log;
pub mod platform;
pub mod prelude;
pub mod results;
pub mod util;
pub mod vm;

// Only for unit test.
#[cfg(test)]
mod controller_tests;
