//! Resource fetch layer.
//!
//! The loader never reads resources by itself, it asks a
//! [`ResourceFetchClient`] for the text of a url. The client answers later
//! with exactly one [`FetchResponse`] per request, which the embedder (the
//! [`EventLoop`](crate::evloop::EventLoop), or a test) feeds back into the
//! loader.
//!
//! The client also owns the resource-metadata cache, that's where compiled
//! program snapshots live.

use crate::prelude::*;
use crate::vm::SYSTEM_SCHEME;

use compact_str::{CompactString, ToCompactString};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

pub mod fs_fetch;


/// Url scheme of package urls.
pub const PACKAGE_SCHEME: &str = "package:";

/// Url scheme of local files.
pub const FILE_SCHEME: &str = "file://";

pub static REMOTE_SCHEMES: &[&str] = &["http://", "https://"];

struct_id_impl!(RequestId, usize);
next_incremental_id_impl!(next_request_id, RequestId, AtomicUsize, usize, 1);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Fetch request.
pub struct FetchRequest {
  pub request_id: RequestId,
  pub url: String,
  pub charset: CompactString,
}

impl FetchRequest {
  pub fn new(url: &str, charset: &str) -> Self {
    FetchRequest {
      request_id: next_request_id(),
      url: url.to_string(),
      charset: charset.to_compact_string(),
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
/// Handle of an outstanding fetch.
pub struct FetchHandle {
  pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of a fetch, exactly one per request.
pub enum FetchOutcome {
  /// Content arrived. `final_url` is the url after redirects.
  Success { final_url: String, text: String },
  /// Fetch failed with a message.
  Error(String),
  /// Fetch was canceled.
  Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Fetch response.
pub struct FetchResponse {
  pub request_id: RequestId,
  pub url: String,
  pub outcome: FetchOutcome,
}

impl FetchResponse {
  pub fn success(request: &FetchRequest, text: &str) -> Self {
    FetchResponse {
      request_id: request.request_id,
      url: request.url.clone(),
      outcome: FetchOutcome::Success {
        final_url: request.url.clone(),
        text: text.to_string(),
      },
    }
  }

  pub fn error(request: &FetchRequest, message: &str) -> Self {
    FetchResponse {
      request_id: request.request_id,
      url: request.url.clone(),
      outcome: FetchOutcome::Error(message.to_string()),
    }
  }

  pub fn canceled(request_id: RequestId, url: &str) -> Self {
    FetchResponse {
      request_id,
      url: url.to_string(),
      outcome: FetchOutcome::Canceled,
    }
  }
}

/// Asynchronous resource fetch service of an embedding document.
pub trait ResourceFetchClient {
  /// Starts fetching a resource, the response is delivered later.
  fn fetch(&mut self, request: FetchRequest) -> FetchHandle;

  /// Cancels an outstanding request. The client still delivers a
  /// [`FetchOutcome::Canceled`] response if the request was not finished.
  fn cancel(&mut self, request_id: RequestId);

  /// Resolves `relative` against `base`.
  fn resolve_url(
    &self,
    base: &str,
    relative: &str,
    package_root: Option<&Path>,
  ) -> TheResult<String> {
    resolve_url(base, relative, package_root)
  }

  /// Reads the resource-metadata cache.
  fn cached_metadata(&self, url: &str, type_tag: u32) -> Option<Vec<u8>>;

  /// Writes the resource-metadata cache.
  fn set_cached_metadata(&mut self, url: &str, type_tag: u32, data: &[u8]);
}

pub type FetchClientRc = Rc<RefCell<dyn ResourceFetchClient>>;

/// Decodes fetched bytes with the request's charset, a byte-order mark
/// overrides the charset.
pub fn decode_text(bytes: &[u8], charset: &str) -> TheResult<String> {
  let encoding = encoding_rs::Encoding::for_label(charset.trim().as_bytes())
    .ok_or_else(|| TheErr::UnsupportedCharset(charset.to_compact_string()))?;
  let (text, actual, had_errors) = encoding.decode(bytes);
  if had_errors {
    debug!(
      "|decode_text| malformed {} sequence replaced",
      actual.name()
    );
  }
  Ok(text.into_owned())
}

fn invalid_url(url: &str, reason: &str) -> TheErr {
  TheErr::InvalidUrl(url.to_string(), reason.to_compact_string())
}

fn has_scheme(url: &str) -> bool {
  url.starts_with(FILE_SCHEME)
    || REMOTE_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
}

// Splits `url` into its origin (`file://`, `https://host`, or empty for a
// plain path) and its path.
fn split_origin(url: &str) -> (&str, &str) {
  if url.starts_with(FILE_SCHEME) {
    return url.split_at(FILE_SCHEME.len());
  }
  for scheme in REMOTE_SCHEMES {
    if let Some(rest) = url.strip_prefix(scheme) {
      return match rest.find('/') {
        Some(slash) => url.split_at(scheme.len() + slash),
        None => (url, "/"),
      };
    }
  }
  ("", url)
}

// Directory part of a path, with the trailing slash.
fn dirname(path: &str) -> &str {
  match path.rfind('/') {
    Some(slash) => &path[..=slash],
    None => "",
  }
}

/// Lexically removes `.` and `..` segments and duplicated slashes.
pub fn normalize_path(path: &str) -> String {
  let absolute = path.starts_with('/');
  let mut segments: Vec<&str> = vec![];
  for segment in path.split('/') {
    match segment {
      "" | "." => {}
      ".." => match segments.last() {
        Some(&last) if last != ".." => {
          segments.pop();
        }
        _ => {
          if !absolute {
            segments.push("..");
          }
        }
      },
      _ => segments.push(segment),
    }
  }
  let joined = segments.join("/");
  if absolute { format!("/{joined}") } else { joined }
}

/// Resolves `relative` against `base`.
///
/// - `dart:` system urls are returned unchanged.
/// - `package:<name>/<path>` resolves to `<package_root>/<name>/<path>` if
///   the package root is set, otherwise to `packages/<name>/<path>` next to
///   `base`.
/// - `file://`, `http://` and `https://` urls are absolute.
/// - Paths starting with `/` keep the origin of `base`, other paths are
///   relative to the directory of `base`.
pub fn resolve_url(
  base: &str,
  relative: &str,
  package_root: Option<&Path>,
) -> TheResult<String> {
  let relative = relative.trim();
  if relative.is_empty() {
    return Err(invalid_url(relative, "empty url"));
  }

  if relative.starts_with(SYSTEM_SCHEME) {
    return Ok(relative.to_string());
  }

  if let Some(package) = relative.strip_prefix(PACKAGE_SCHEME) {
    if package.is_empty() || package.starts_with('/') {
      return Err(invalid_url(relative, "missing package name"));
    }
    return match package_root {
      Some(root) => {
        let root = root.to_string_lossy();
        Ok(normalize_path(&format!("{root}/{package}")))
      }
      None => {
        let (origin, path) = split_origin(base);
        let joined = format!("{}packages/{package}", dirname(path));
        Ok(format!("{origin}{}", normalize_path(&joined)))
      }
    };
  }

  if has_scheme(relative) {
    let (origin, path) = split_origin(relative);
    return Ok(format!("{origin}{}", normalize_path(path)));
  }
  if relative.contains("://") {
    return Err(invalid_url(relative, "unsupported scheme"));
  }

  let (origin, base_path) = split_origin(base);
  let joined = if relative.starts_with('/') {
    relative.to_string()
  } else {
    format!("{}{relative}", dirname(base_path))
  };
  Ok(format!("{origin}{}", normalize_path(&joined)))
}
