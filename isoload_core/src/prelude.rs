//! Prelude.

// Re-export `log`.
pub use log::{debug, error, info, trace, warn};

// Re-export results.
pub use crate::results::*;

// Re-export pointer and id macros.
pub use crate::{
  next_incremental_id_impl, rc_ptr, rc_refcell_ptr, struct_id_impl,
};
pub use paste::paste;

// Re-export `ahash`.
pub use ahash::AHashMap as HashMap;
pub use ahash::AHashSet as HashSet;
