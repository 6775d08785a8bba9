//! Fs (filesystem) fetch client.
//!
//! Every request is read in a spawned tokio task, the response is sent back
//! through a channel to the event loop. Requests can be canceled until their
//! task finishes.
//!
//! The resource-metadata cache is a directory of zstd compressed files, one
//! file per (url, type tag) pair:
//!
//! ```text
//! +-----------------------+---------------------+
//! | u32 (little endian)   | zstd compressed     |
//! | uncompressed length   | payload             |
//! +-----------------------+---------------------+
//! ```

use crate::fetch::{
  FILE_SCHEME, FetchHandle, FetchOutcome, FetchRequest, FetchResponse,
  REMOTE_SCHEMES, RequestId, ResourceFetchClient, decode_text,
};
use crate::prelude::*;

use parking_lot::Mutex;
use path_absolutize::Absolutize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Zstd compression level of cached metadata.
pub const METADATA_COMPRESSION_LEVEL: i32 = 3;

/// Max decoded size of cached metadata, larger length prefixes are rejected.
pub const METADATA_MAX_LEN: usize = 256 * 1024 * 1024;

// Bytes of the url digest in a metadata file name.
const METADATA_KEY_LEN: usize = 16;

type InflightMap = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

/// Fs (filesystem) fetch client.
pub struct FsFetchClient {
  // Sender: fetch tasks => event loop.
  sender: Sender<FetchResponse>,

  // Metadata cache directory, metadata is disabled if `None`.
  cache_dir: Option<PathBuf>,

  inflight: InflightMap,

  // Parent of every request's token.
  cancellation_token: CancellationToken,
  tracker: TaskTracker,
}

fn url_to_path(url: &str) -> Result<PathBuf, String> {
  if REMOTE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
    return Err(format!("Remote url {url:?} is not supported"));
  }
  let path = Path::new(url.strip_prefix(FILE_SCHEME).unwrap_or(url));
  path
    .absolutize()
    .map(|p| p.to_path_buf())
    .map_err(|e| format!("Invalid path {url:?}: {e}"))
}

async fn read_text(url: &str, charset: &str) -> Result<String, String> {
  let path = url_to_path(url)?;
  let bytes = tokio::fs::read(&path)
    .await
    .map_err(|e| format!("Failed to read {path:?}: {e}"))?;
  decode_text(&bytes, charset).map_err(|e| e.to_string())
}

/// Encodes cached metadata, i.e. length prefix and zstd payload.
pub fn encode_metadata(data: &[u8]) -> IoResult<Vec<u8>> {
  let len = u32::try_from(data.len())
    .map_err(|_| IoErr::new(IoErrKind::InvalidInput, "metadata too large"))?;
  let compressed = zstd::bulk::compress(data, METADATA_COMPRESSION_LEVEL)?;
  let mut payload = Vec::with_capacity(4 + compressed.len());
  payload.extend_from_slice(&len.to_le_bytes());
  payload.extend_from_slice(&compressed);
  Ok(payload)
}

/// Decodes cached metadata written by [`encode_metadata`].
pub fn decode_metadata(payload: &[u8]) -> IoResult<Vec<u8>> {
  if payload.len() < 4 {
    return Err(IoErr::new(
      IoErrKind::UnexpectedEof,
      "metadata length prefix is truncated",
    ));
  }
  let mut prefix = [0_u8; 4];
  prefix.copy_from_slice(&payload[0..4]);
  let len = u32::from_le_bytes(prefix) as usize;
  if len > METADATA_MAX_LEN {
    return Err(IoErr::new(
      IoErrKind::InvalidData,
      format!("metadata length {len} exceeds {METADATA_MAX_LEN}"),
    ));
  }
  zstd::bulk::decompress(&payload[4..], len)
}

impl FsFetchClient {
  pub fn new(sender: Sender<FetchResponse>, cache_dir: Option<PathBuf>) -> Self {
    FsFetchClient {
      sender,
      cache_dir,
      inflight: Arc::new(Mutex::new(HashMap::new())),
      cancellation_token: CancellationToken::new(),
      tracker: TaskTracker::new(),
    }
  }

  pub fn cache_dir(&self) -> Option<&Path> {
    self.cache_dir.as_deref()
  }

  /// Count of requests whose task is not finished.
  pub fn inflight_count(&self) -> usize {
    self.inflight.lock().len()
  }

  /// Path of the metadata file of `url` and `type_tag`, named by the url's
  /// SHA-256 digest.
  pub fn metadata_path(&self, url: &str, type_tag: u32) -> Option<PathBuf> {
    let cache_dir = self.cache_dir.as_ref()?;
    let digest = Sha256::digest(url.as_bytes());
    let key: String = digest[..METADATA_KEY_LEN]
      .iter()
      .map(|b| format!("{b:02x}"))
      .collect();
    Some(cache_dir.join(format!("{key}-{type_tag:08x}.zst")))
  }

  /// Cancels every outstanding request and waits for their tasks.
  pub async fn shutdown(&self) {
    self.cancellation_token.cancel();
    self.tracker.close();
    self.tracker.wait().await;
  }
}

impl ResourceFetchClient for FsFetchClient {
  fn fetch(&mut self, request: FetchRequest) -> FetchHandle {
    let request_id = request.request_id;
    let token = self.cancellation_token.child_token();
    self.inflight.lock().insert(request_id, token.clone());
    trace!("|FsFetchClient::fetch| request:{request_id} url:{:?}", request.url);

    let sender = self.sender.clone();
    let inflight = self.inflight.clone();
    self.tracker.spawn(async move {
      let outcome = tokio::select! {
        _ = token.cancelled() => FetchOutcome::Canceled,
        result = read_text(&request.url, &request.charset) => match result {
          Ok(text) => FetchOutcome::Success {
            final_url: request.url.clone(),
            text,
          },
          Err(message) => FetchOutcome::Error(message),
        },
      };
      inflight.lock().remove(&request_id);
      let response = FetchResponse {
        request_id,
        url: request.url,
        outcome,
      };
      if sender.send(response).await.is_err() {
        trace!("|FsFetchClient::fetch| receiver closed, request:{request_id}");
      }
    });

    FetchHandle { request_id }
  }

  fn cancel(&mut self, request_id: RequestId) {
    if let Some(token) = self.inflight.lock().get(&request_id) {
      trace!("|FsFetchClient::cancel| request:{request_id}");
      token.cancel();
    }
  }

  fn cached_metadata(&self, url: &str, type_tag: u32) -> Option<Vec<u8>> {
    let path = self.metadata_path(url, type_tag)?;
    let payload = match std::fs::read(&path) {
      Ok(payload) => payload,
      Err(e) => {
        trace!("|FsFetchClient::cached_metadata| no metadata {path:?}: {e}");
        return None;
      }
    };
    match decode_metadata(&payload) {
      Ok(data) => Some(data),
      Err(e) => {
        warn!("Failed to decode cached metadata {path:?}: {e}");
        None
      }
    }
  }

  fn set_cached_metadata(&mut self, url: &str, type_tag: u32, data: &[u8]) {
    let path = match self.metadata_path(url, type_tag) {
      Some(path) => path,
      None => return,
    };
    let result = encode_metadata(data).and_then(|payload| {
      if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
      }
      std::fs::write(&path, payload)
    });
    match result {
      Ok(_) => debug!("|FsFetchClient::set_cached_metadata| wrote {path:?}"),
      Err(e) => warn!("Failed to write cached metadata {path:?}: {e}"),
    }
  }
}
