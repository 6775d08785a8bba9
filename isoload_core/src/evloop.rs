//! Event loop.
//!
//! Fetch tasks run in tokio's async tasks and send their responses back
//! through a channel. The event loop owns the receiving end and the
//! [`LifecycleController`], and feeds every response into the controller
//! until no loader waits for one.

use crate::controller::LifecycleController;
use crate::envar;
use crate::fetch::FetchResponse;
use crate::prelude::*;

use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio_util::sync::CancellationToken;

/// Creates the channel: fetch tasks => event loop.
pub fn fetch_channel() -> (Sender<FetchResponse>, Receiver<FetchResponse>) {
  channel(envar::CHANNEL_BUF_SIZE())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
/// Why [`EventLoop::run`] returned.
pub enum ExitReason {
  #[strum(serialize = "idle")]
  /// No loader has outstanding requests.
  Idle,

  #[strum(serialize = "canceled")]
  /// The cancellation token was canceled.
  Canceled,

  #[strum(serialize = "disconnected")]
  /// Every sender of the channel is dropped.
  Disconnected,
}

/// Drives a [`LifecycleController`] with fetch responses.
pub struct EventLoop {
  /// Controller of the frame.
  pub controller: LifecycleController,

  /// Receiver: event loop <= fetch tasks.
  pub master_recv_from_fetch: Receiver<FetchResponse>,

  /// Cancellation token to notify the main loop to exit.
  pub cancellation_token: CancellationToken,

  // Responses that no loader owned, i.e. their loader was discarded.
  unowned_count: usize,
}

impl EventLoop {
  pub fn new(
    controller: LifecycleController,
    master_recv_from_fetch: Receiver<FetchResponse>,
  ) -> Self {
    EventLoop {
      controller,
      master_recv_from_fetch,
      cancellation_token: CancellationToken::new(),
      unowned_count: 0,
    }
  }

  pub fn unowned_count(&self) -> usize {
    self.unowned_count
  }

  fn process_fetch_response(&mut self, response: FetchResponse) {
    trace!(
      "|EventLoop::process_fetch_response| request:{} url:{:?}",
      response.request_id,
      response.url
    );
    if !self.controller.handle_fetch_response(response) {
      self.unowned_count += 1;
    }
  }

  /// Running the loop, it repeatedly receives fetch responses and feeds them
  /// into the controller, until:
  ///
  /// 1. No loader has outstanding requests.
  /// 2. The cancellation token is canceled.
  /// 3. The channel is disconnected.
  pub async fn run(&mut self) -> ExitReason {
    loop {
      if !self.controller.has_pending_requests() {
        debug!("|EventLoop::run| idle");
        return ExitReason::Idle;
      }

      tokio::select! {
        // Receive fetch responses
        response = self.master_recv_from_fetch.recv() => {
          match response {
            Some(response) => self.process_fetch_response(response),
            None => {
              warn!("Fetch channel is disconnected with outstanding requests");
              return ExitReason::Disconnected;
            }
          }
        }
        // Receive cancellation notify
        _ = self.cancellation_token.cancelled() => {
          debug!("|EventLoop::run| canceled");
          return ExitReason::Canceled;
        }
      }
    }
  }

  /// Tears down the controller, i.e. destroys every isolate.
  pub fn shutdown(&mut self) {
    self.controller.teardown();
    self.controller.platform().shutdown();
  }
}
