// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Logical sessions multiplexed over one transport connection

// Lifetime stages:
//
// - an initiating packet (`request`/`connect`) creates the session in the registry
// - its deadline is armed in the supervisor, and any declared body in the accountant
// - replies and messages advance it through its kind's state machine
// - reaching a terminal state releases registry entry, counters and deadline together
//
// Sessions are addressed by identifier only; nothing outside the registry holds one.

pub mod accountant;
pub mod registry;
pub mod supervisor;

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{common::protocol::id::Identifier, util::cancellation::CancellationListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
  HttpExchange,
  SocketConnection,
}

impl std::fmt::Display for SessionKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SessionKind::HttpExchange => f.write_str("http-exchange"),
      SessionKind::SocketConnection => f.write_str("socket-connection"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpState {
  AwaitingRequestBody,
  Dispatched,
  AwaitingResponseBody,
  Complete,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
  Connecting,
  Open,
  Active,
  PendingMessage,
  Closing,
  Closed,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
  Http(HttpState),
  Socket(SocketState),
}

/// An event applied to a session's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
  /// The pending body or message has been fully delivered
  TransferComplete,
  Respond { body: bool },
  Open,
  Message { data: bool },
  Close,
  Closed,
  /// Error, timeout, overflow or connection loss
  Fail,
}

impl Step {
  /// The only session kind this step applies to, if it is kind-specific
  pub fn kind(&self) -> Option<SessionKind> {
    match self {
      Step::Respond { .. } => Some(SessionKind::HttpExchange),
      Step::Open | Step::Message { .. } | Step::Closed => Some(SessionKind::SocketConnection),
      Step::TransferComplete | Step::Close | Step::Fail => None,
    }
  }
}

impl SessionState {
  pub fn initial(kind: SessionKind) -> SessionState {
    match kind {
      SessionKind::HttpExchange => SessionState::Http(HttpState::AwaitingRequestBody),
      SessionKind::SocketConnection => SessionState::Socket(SocketState::Connecting),
    }
  }

  pub fn kind(&self) -> SessionKind {
    match self {
      SessionState::Http(_) => SessionKind::HttpExchange,
      SessionState::Socket(_) => SessionKind::SocketConnection,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      SessionState::Http(HttpState::Complete | HttpState::Failed)
        | SessionState::Socket(SocketState::Closed | SocketState::Failed)
    )
  }

  /// Whether a body or message is currently flowing for the session
  pub fn is_transferring(&self) -> bool {
    matches!(
      self,
      SessionState::Http(HttpState::AwaitingRequestBody | HttpState::AwaitingResponseBody)
        | SessionState::Socket(SocketState::PendingMessage)
    )
  }

  /// The state reached by applying `step`, or `None` if it is not reachable from here
  pub fn step(self, step: Step) -> Option<SessionState> {
    use HttpState as H;
    use SessionState::{Http, Socket};
    use SocketState as S;
    if self.is_terminal() {
      return None;
    }
    let next = match (self, step) {
      (_, Step::Fail) => match self {
        Http(_) => Http(H::Failed),
        Socket(_) => Socket(S::Failed),
      },
      (Http(H::AwaitingRequestBody), Step::TransferComplete) => Http(H::Dispatched),
      (Http(H::Dispatched), Step::Respond { body: true }) => Http(H::AwaitingResponseBody),
      (Http(H::Dispatched), Step::Respond { body: false }) => Http(H::Complete),
      (Http(H::AwaitingResponseBody), Step::TransferComplete) => Http(H::Complete),
      // Closing an exchange aborts it
      (Http(_), Step::Close) => Http(H::Failed),
      (Socket(S::Connecting), Step::Open) => Socket(S::Open),
      (Socket(S::Open | S::Active), Step::Message { data: true }) => Socket(S::PendingMessage),
      (Socket(S::Open | S::Active), Step::Message { data: false }) => Socket(S::Active),
      (Socket(S::PendingMessage), Step::TransferComplete) => Socket(S::Active),
      (Socket(_), Step::Close) => Socket(S::Closing),
      (Socket(S::Closing), Step::Closed) => Socket(S::Closed),
      _ => return None,
    };
    Some(next)
  }
}

/// Issues serial numbers distinguishing sessions that reuse a released identifier
#[derive(Debug)]
pub struct SerialGenerator {
  next: AtomicU64,
}

impl SerialGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> u64 {
    self.next.fetch_add(1, Ordering::Relaxed)
  }
}

impl Default for SerialGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}

/// A snapshot of a registered session
#[derive(Debug, Clone)]
pub struct SessionHandle {
  pub id: Identifier,
  pub kind: SessionKind,
  pub state: SessionState,
  pub serial: u64,
  pub created: Instant,
  pub deadline: Instant,
  cancellation: CancellationToken,
}

impl SessionHandle {
  pub(crate) fn new(
    id: Identifier,
    kind: SessionKind,
    serial: u64,
    created: Instant,
    deadline: Instant,
  ) -> Self {
    Self {
      id,
      kind,
      state: SessionState::initial(kind),
      serial,
      created,
      deadline,
      cancellation: CancellationToken::new(),
    }
  }

  /// Resolves once the session is released, for whatever reason
  pub fn released(&self) -> CancellationListener {
    CancellationListener::from(self.cancellation.clone())
  }

  pub(crate) fn cancel(&self) {
    self.cancellation.cancel();
  }
}
