//! Common utils.

pub mod lock;
pub mod struct_id;
