//! Structured ID.

/// Generate a copyable, hashable new-type ID over an integer type.
#[macro_export]
macro_rules! struct_id_impl {
  ($name:tt,$ty:tt) => {
    #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct $name($ty);

    impl $name {
      pub const fn new(value: $ty) -> Self {
        Self(value)
      }

      pub const fn value(&self) -> $ty {
        self.0
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}({:?})", stringify!($name), self.0))
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
      }
    }

    impl From<$ty> for $name {
      fn from(value: $ty) -> Self {
        Self(value)
      }
    }

    impl From<$name> for $ty {
      fn from(value: $name) -> Self {
        value.0
      }
    }
  };
}

/// Generate a function that returns the next ID, it starts from `$initial`
/// and wraps back to `$initial` after the integer's max value.
#[macro_export]
macro_rules! next_incremental_id_impl {
  ($fn_name:ident,$name:tt,$atomic_int:tt,$plain_int:tt,$initial:expr) => {
    pub fn $fn_name() -> $name {
      use std::sync::atomic::$atomic_int;

      static VALUE: $atomic_int = $atomic_int::new($initial);
      let v = VALUE
        .fetch_update(
          std::sync::atomic::Ordering::Relaxed,
          std::sync::atomic::Ordering::Relaxed,
          |x| {
            Some(if x == $plain_int::MAX {
              $initial
            } else {
              x + 1
            })
          },
        )
        .unwrap();
      $name::from(v)
    }
  };
}
