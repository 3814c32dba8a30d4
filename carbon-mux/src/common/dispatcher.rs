// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection pipeline between the wire and the sessions multiplexed over it
//!
//! A [`Dispatcher`] owns the session registry, stream accountant and deadline tasks of
//! one transport connection. Raw inbound packets are decoded, checked against the
//! local [`Side`], applied to the addressed session and surfaced as [`SessionEvent`]s;
//! outbound packets produced by the application are checked and applied the same way
//! before being queued for the connection's single writer.
//!
//! Failures scoped to a session are reported to the peer as an `error` packet addressed
//! to that session and never disturb its siblings. Failures that cannot be attributed
//! to any session are reported under the nil identifier and close the connection.
use std::{
  marker::PhantomData,
  sync::{Arc, Weak},
};

use dashmap::DashMap;
use tokio::{
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
  task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    meta::ServerMeta,
    protocol::{
      error::{self, ErrorCode, Reportable},
      id::Identifier,
      packet::{self, Action, DecodeError, Protocol, Side},
    },
    session::{
      accountant::{AccountingError, Declared, Progress, StreamAccountant, TransferKind},
      registry::{Expiry, RegistryError, SessionRegistry},
      supervisor::{TimedOut, TimeoutSupervisor},
      SessionHandle, SessionKind, Step,
    },
    transport::{PacketSink, PacketSource, TransportError},
  },
  util::cancellation::CancellationListener,
};

/// Where a session failure was first observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureOrigin {
  /// Detected by this dispatcher: timeout, overflow or a rejected packet
  Local,
  /// Reported by the peer through an `error` packet
  Remote,
  /// The transport connection ended while the session was live
  Connection,
}

/// Notifications for the application collaborator performing the actual network I/O
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent<T> {
  /// The peer started an HTTP exchange or a socket connection
  Initiated {
    id: Identifier,
    kind: SessionKind,
    packet: T,
  },
  /// The peer answered a session this side started, with a `response` or `open`
  Replied { id: Identifier, packet: T },
  Message { id: Identifier, packet: T },
  /// Payload bytes were recorded for the session's current transfer
  Progress { id: Identifier, progress: Progress },
  Closed {
    id: Identifier,
    code: u16,
    reason: String,
  },
  /// The session is gone; any I/O still running for it must stop
  Failed {
    id: Identifier,
    code: ErrorCode,
    message: String,
    origin: FailureOrigin,
  },
  /// The peer reported an error for an identifier with no live session
  RemoteError {
    id: Identifier,
    code: ErrorCode,
    message: String,
  },
}

impl<T> SessionEvent<T> {
  pub fn id(&self) -> &Identifier {
    match self {
      SessionEvent::Initiated { id, .. }
      | SessionEvent::Replied { id, .. }
      | SessionEvent::Message { id, .. }
      | SessionEvent::Progress { id, .. }
      | SessionEvent::Closed { id, .. }
      | SessionEvent::Failed { id, .. }
      | SessionEvent::RemoteError { id, .. } => id,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
  #[error(transparent)]
  Packet(#[from] DecodeError),
  #[error(transparent)]
  Registry(#[from] RegistryError),
  #[error(transparent)]
  Accounting(#[from] AccountingError),
  #[error("A {side} does not accept {action} packets (session {id})")]
  Unexpected {
    id: Identifier,
    action: &'static str,
    side: Side,
  },
  #[error("Encoded packet for {id} is {size} bytes, exceeding the limit of {limit}")]
  PacketTooLarge {
    id: Identifier,
    size: usize,
    limit: usize,
  },
  #[error("Failed to encode packet: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("Connection is closed")]
  ConnectionClosed,
}

impl Reportable for DispatchError {
  fn code(&self) -> ErrorCode {
    match self {
      DispatchError::Packet(e) => e.code(),
      DispatchError::Registry(e) => e.code(),
      DispatchError::Accounting(e) => e.code(),
      DispatchError::Unexpected { .. } => ErrorCode::InvalidRequest,
      DispatchError::PacketTooLarge { .. } => ErrorCode::BodyTooLarge,
      DispatchError::Encode(_) | DispatchError::ConnectionClosed => ErrorCode::Unknown,
    }
  }
}

/// Faults that end the whole connection
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
  #[error("Transport failure: {0}")]
  Transport(#[from] TransportError),
  #[error("Received a packet that cannot be attributed to a session: {0}")]
  Unattributable(DecodeError),
  #[error("Received a packet of {size} bytes, exceeding the limit of {limit}")]
  PacketTooLarge { size: usize, limit: usize },
}

/// Encoded packets waiting for the connection's writer
#[derive(Debug)]
pub struct Outbound {
  receiver: UnboundedReceiver<Vec<u8>>,
}

impl Outbound {
  pub async fn recv(&mut self) -> Option<Vec<u8>> {
    self.receiver.recv().await
  }

  pub fn try_recv(&mut self) -> Option<Vec<u8>> {
    self.receiver.try_recv().ok()
  }
}

pub type Events<T> = UnboundedReceiver<SessionEvent<T>>;

/// Adapts a dispatcher's event receiver into a [`Stream`](futures::Stream)
pub fn event_stream<T>(events: Events<T>) -> UnboundedReceiverStream<SessionEvent<T>> {
  UnboundedReceiverStream::new(events)
}

/// State transition produced by applying one packet
#[derive(Debug)]
enum Applied {
  Initiated(SessionKind),
  Replied,
  Message,
  Closed { code: u16, reason: String },
  Failed { code: ErrorCode, message: String },
  UnknownError { code: ErrorCode, message: String },
  /// A close for an identifier with no live session
  Ignored,
}

struct Shared<P: Protocol> {
  side: Side,
  meta: Arc<ServerMeta>,
  max_packet_size: usize,
  registry: SessionRegistry,
  accountant: StreamAccountant,
  supervisor: TimeoutSupervisor,
  outbound: UnboundedSender<Vec<u8>>,
  /// Held per identifier from applying an outbound packet until it is queued
  emitting: DashMap<Identifier, ()>,
  events: UnboundedSender<SessionEvent<P::Packet>>,
  closed: CancellationToken,
  _protocol: PhantomData<fn() -> P>,
}

/// Multiplexes the sessions of one transport connection; cheap to clone
pub struct Dispatcher<P: Protocol> {
  shared: Arc<Shared<P>>,
}

impl<P: Protocol> Clone for Dispatcher<P> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<P: Protocol> std::fmt::Debug for Dispatcher<P> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dispatcher")
      .field("protocol", &P::NAME)
      .field("side", &self.shared.side)
      .field("sessions", &self.shared.registry.len())
      .finish()
  }
}

impl<P: Protocol> Dispatcher<P> {
  pub fn new(side: Side, meta: Arc<ServerMeta>) -> (Self, Outbound, Events<P::Packet>) {
    let (outbound, receiver) = mpsc::unbounded_channel();
    let (events, events_receiver) = mpsc::unbounded_channel();
    let shared = Shared {
      side,
      max_packet_size: usize::try_from(meta.max_packet_size).unwrap_or(usize::MAX),
      registry: SessionRegistry::new(meta.request_timeout()),
      accountant: StreamAccountant::new(&meta),
      supervisor: TimeoutSupervisor,
      meta,
      outbound,
      emitting: DashMap::new(),
      events,
      closed: CancellationToken::new(),
      _protocol: PhantomData,
    };
    let dispatcher = Self {
      shared: Arc::new(shared),
    };
    (dispatcher, Outbound { receiver }, events_receiver)
  }

  pub fn side(&self) -> Side {
    self.shared.side
  }

  pub fn meta(&self) -> &Arc<ServerMeta> {
    &self.shared.meta
  }

  pub fn session(&self, id: &Identifier) -> Option<SessionHandle> {
    self.shared.registry.lookup(id).ok()
  }

  pub fn live_sessions(&self) -> usize {
    self.shared.registry.len()
  }

  /// Resolves once the connection has been closed, from either end
  pub fn closed(&self) -> CancellationListener {
    CancellationListener::from(&self.shared.closed)
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.is_cancelled()
  }

  /// Stops the connection; [`run`](Self::run) drains queued packets, then fails every
  /// live session
  pub fn close(&self) {
    self.shared.closed.cancel();
  }

  /// Handles one raw packet from the peer.
  ///
  /// Session-scoped failures are answered with an `error` packet and return `Ok`; only
  /// faults that leave the connection unusable are returned.
  pub fn on_inbound_packet(&self, raw: &[u8]) -> Result<(), ConnectionError> {
    self.shared.on_inbound_packet(raw)
  }

  /// Checks, applies and queues a packet produced by the application.
  ///
  /// Concurrent producers may emit for the same identifier; packets reach the queue in
  /// the order their transitions were applied.
  pub fn emit_outbound(&self, packet: P::Packet) -> Result<(), DispatchError> {
    self.shared.emit_outbound(packet)
  }

  /// Records payload bytes moved for the current transfer of `id`.
  ///
  /// An error means the session is finished with and no more bytes may be read for it.
  pub fn record_transfer(&self, id: &Identifier, bytes: u64) -> Result<Progress, DispatchError> {
    self.shared.record_transfer(id, bytes)
  }

  /// Reports that the application could not carry out the session, such as a remote
  /// host refusing a connection with [`ErrorCode::ConnectionFailed`]
  pub fn report_failure(
    &self,
    id: &Identifier,
    code: ErrorCode,
    message: &str,
  ) -> Result<(), DispatchError> {
    let message = error::public_message(code, &message);
    self
      .shared
      .emit_outbound(P::error(id.clone(), code, message))
  }

  /// Drives the connection over a transport until either end finishes or `shutdown`
  /// fires, then fails whatever sessions remain.
  pub fn run<S, K>(
    &self,
    source: S,
    sink: K,
    outbound: Outbound,
    shutdown: CancellationListener,
  ) -> JoinHandle<Result<(), ConnectionError>>
  where
    S: PacketSource + 'static,
    K: PacketSink + 'static,
  {
    let shared = Arc::clone(&self.shared);
    let span = tracing::info_span!("connection", protocol = P::NAME, side = %shared.side);
    tokio::task::spawn(
      async move {
        let reader = {
          let shared = Arc::clone(&shared);
          async move {
            let result = shared.read_loop(source, shutdown).await;
            shared.closed.cancel();
            result
          }
        };
        let writer = write_loop(outbound, sink, shared.closed.clone());
        let (read_result, write_result) = futures::future::join(reader, writer).await;
        shared.cascade();
        match &read_result {
          Ok(()) => tracing::debug!("Connection finished"),
          Err(e) => tracing::warn!(error = %e, "Connection failed"),
        }
        read_result.and(write_result)
      }
      .instrument(span),
    )
  }
}

async fn write_loop<K: PacketSink>(
  mut outbound: Outbound,
  mut sink: K,
  closed: CancellationToken,
) -> Result<(), ConnectionError> {
  let result = async {
    loop {
      let raw = tokio::select! {
        biased;
        raw = outbound.recv() => match raw {
          Some(raw) => raw,
          None => break,
        },
        _ = closed.cancelled() => break,
      };
      sink.send_packet(raw).await?;
    }
    // Packets queued before the close still go out, including its cause
    while let Some(raw) = outbound.try_recv() {
      sink.send_packet(raw).await?;
    }
    sink.close().await?;
    Ok::<(), ConnectionError>(())
  }
  .await;
  if result.is_err() {
    closed.cancel();
  }
  result
}

impl<P: Protocol> Shared<P> {
  async fn read_loop<S: PacketSource>(
    self: &Arc<Self>,
    mut source: S,
    shutdown: CancellationListener,
  ) -> Result<(), ConnectionError> {
    loop {
      let next = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
          tracing::debug!("Shutdown requested");
          return Ok(());
        }
        _ = self.closed.cancelled() => return Ok(()),
        next = source.next_packet(self.max_packet_size) => next,
      };
      match next {
        Ok(Some(raw)) => self.on_inbound_packet(&raw)?,
        Ok(None) => {
          tracing::debug!("Peer finished the connection");
          return Ok(());
        }
        Err(TransportError::PacketTooLarge { limit, received }) => {
          self.send_error(None, ErrorCode::BodyTooLarge, &"Packet exceeds the maximum size");
          return Err(ConnectionError::PacketTooLarge {
            size: received,
            limit,
          });
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  fn on_inbound_packet(self: &Arc<Self>, raw: &[u8]) -> Result<(), ConnectionError> {
    if raw.len() > self.max_packet_size {
      self.send_error(None, ErrorCode::BodyTooLarge, &"Packet exceeds the maximum size");
      return Err(ConnectionError::PacketTooLarge {
        size: raw.len(),
        limit: self.max_packet_size,
      });
    }
    let packet = match packet::decode::<P>(raw, &self.meta) {
      Ok(packet) => packet,
      Err(e) => return self.reject_undecodable(e),
    };
    let id = P::session_id(&packet).clone();
    let action = P::action(&packet);
    tracing::trace!(%id, action = action.name(), "Inbound packet");
    if !self.side.accepts_inbound(&action) {
      let e = DispatchError::Unexpected {
        id: id.clone(),
        action: action.name(),
        side: self.side,
      };
      self.send(&error::report::<P, _>(Some(id), &e));
      return Ok(());
    }
    match self.apply(&id, &action) {
      Ok(applied) => self.surface(id, applied, packet),
      Err(e) => {
        tracing::debug!(%id, error = %e, "Rejected inbound packet");
        self.send(&error::report::<P, _>(Some(id), &e));
      }
    }
    Ok(())
  }

  fn reject_undecodable(&self, e: DecodeError) -> Result<(), ConnectionError> {
    let id = match e.identifier() {
      Some(id) => id.clone(),
      None => {
        self.send(&error::report::<P, _>(None, &e));
        return Err(ConnectionError::Unattributable(e));
      }
    };
    // An oversized continuation cannot be skipped without desynchronizing the session
    if let DecodeError::TooLarge {
      initiating: false, ..
    } = &e
    {
      if self.fail_session(&id, e.code(), e.to_string(), FailureOrigin::Local) {
        self.send(&error::report::<P, _>(Some(id), &e));
      }
      return Ok(());
    }
    self.send(&error::report::<P, _>(Some(id), &e));
    Ok(())
  }

  fn surface(&self, id: Identifier, applied: Applied, packet: P::Packet) {
    let event = match applied {
      Applied::Initiated(kind) => SessionEvent::Initiated { id, kind, packet },
      Applied::Replied => SessionEvent::Replied { id, packet },
      Applied::Message => SessionEvent::Message { id, packet },
      Applied::Closed { code, reason } => SessionEvent::Closed { id, code, reason },
      Applied::Failed { code, message } => SessionEvent::Failed {
        id,
        code,
        message,
        origin: FailureOrigin::Remote,
      },
      Applied::UnknownError { code, message } => {
        tracing::debug!(%id, %code, %message, "Peer reported an error for an unknown session");
        SessionEvent::RemoteError { id, code, message }
      }
      Applied::Ignored => return,
    };
    self.notify(event);
  }

  fn emit_outbound(self: &Arc<Self>, packet: P::Packet) -> Result<(), DispatchError> {
    if self.closed.is_cancelled() {
      return Err(DispatchError::ConnectionClosed);
    }
    let id = P::session_id(&packet).clone();
    let action = P::action(&packet);
    if !self.side.may_send(&action) {
      return Err(DispatchError::Unexpected {
        id,
        action: action.name(),
        side: self.side.peer(),
      });
    }
    packet::check::<P>(&packet, &self.meta)?;
    let raw = packet::encode::<P>(&packet)?;
    if raw.len() > self.max_packet_size {
      return Err(DispatchError::PacketTooLarge {
        id,
        size: raw.len(),
        limit: self.max_packet_size,
      });
    }
    // Queue order per identifier follows the order transitions were applied in
    let queued = {
      let _emitting = self.emitting.entry(id.clone()).or_default();
      self.apply(&id, &action).and_then(|_| {
        tracing::trace!(%id, action = action.name(), "Outbound packet");
        self
          .outbound
          .send(raw)
          .map_err(|_| DispatchError::ConnectionClosed)
      })
    };
    self.emitting.remove(&id);
    queued
  }

  /// Moves the addressed session according to `action`, in either direction
  fn apply(self: &Arc<Self>, id: &Identifier, action: &Action) -> Result<Applied, DispatchError> {
    match action {
      Action::Initiate { kind, body } => self.initiate(id, *kind, *body),
      Action::Respond { body } => {
        let declared = body.unwrap_or(0) > 0;
        let handle = self
          .registry
          .advance(id, Step::Respond { body: declared })?;
        if declared {
          self
            .declare(&handle, TransferKind::ResponseBody, *body)
            .map_err(|e| self.surface_failure(id, e))?;
        } else if handle.state.is_terminal() {
          self.finish(&handle);
        }
        Ok(Applied::Replied)
      }
      Action::Open => {
        self.registry.advance(id, Step::Open)?;
        Ok(Applied::Replied)
      }
      Action::Message { data } => {
        let declared = *data > 0;
        let handle = self
          .registry
          .advance(id, Step::Message { data: declared })?;
        if declared {
          self
            .declare(&handle, TransferKind::Message, Some(*data))
            .map_err(|e| self.surface_failure(id, e))?;
        }
        Ok(Applied::Message)
      }
      Action::Close { code, reason } => {
        let handle = match self.registry.advance(id, Step::Close) {
          Ok(handle) => handle,
          Err(RegistryError::NotRegistered(_) | RegistryError::InvalidTransition { .. }) => {
            tracing::trace!(%id, "Close for a session that is not live");
            return Ok(Applied::Ignored);
          }
          Err(e) => return Err(e.into()),
        };
        let handle = if handle.state.is_terminal() {
          handle
        } else {
          self.registry.advance(id, Step::Closed)?
        };
        self.finish(&handle);
        Ok(Applied::Closed {
          code: *code,
          reason: reason.clone(),
        })
      }
      Action::Error { code, message } => match self.registry.advance(id, Step::Fail) {
        Ok(handle) => {
          self.finish(&handle);
          Ok(Applied::Failed {
            code: *code,
            message: message.clone(),
          })
        }
        Err(_) => Ok(Applied::UnknownError {
          code: *code,
          message: message.clone(),
        }),
      },
    }
  }

  fn initiate(
    self: &Arc<Self>,
    id: &Identifier,
    kind: SessionKind,
    body: Option<u64>,
  ) -> Result<Applied, DispatchError> {
    let handle = self.registry.create_session(id.clone(), kind)?;
    if self.closed.is_cancelled() {
      self.registry.release_serial(id, handle.serial);
      return Err(DispatchError::ConnectionClosed);
    }
    if kind == SessionKind::HttpExchange {
      if let Declared::Empty = self.declare(&handle, TransferKind::RequestBody, body)? {
        self.registry.advance(id, Step::TransferComplete)?;
      }
    }
    let shared = Arc::downgrade(self);
    self
      .supervisor
      .arm(&handle, move |id, serial| on_deadline(&shared, id, serial));
    tracing::debug!(%id, %kind, "Session initiated");
    Ok(Applied::Initiated(kind))
  }

  /// Declares a transfer for a freshly advanced session, releasing it if refused
  fn declare(
    &self,
    handle: &SessionHandle,
    kind: TransferKind,
    length: Option<u64>,
  ) -> Result<Declared, DispatchError> {
    self
      .accountant
      .declare(&handle.id, kind, length)
      .map_err(|e| {
        self.registry.release_serial(&handle.id, handle.serial);
        self.accountant.release(&handle.id);
        e.into()
      })
  }

  fn record_transfer(&self, id: &Identifier, bytes: u64) -> Result<Progress, DispatchError> {
    let progress = match self.accountant.advance(id, bytes) {
      Ok(progress) => progress,
      Err(e @ AccountingError::Overflow { .. }) => {
        tracing::debug!(%id, error = %e, "Transfer overflowed its declaration");
        // Only the path that claims the session reports it; a timeout may have won
        if self.fail_session(id, e.code(), e.to_string(), FailureOrigin::Local) {
          self.send(&error::report::<P, _>(Some(id.clone()), &e));
        }
        return Err(e.into());
      }
      Err(e) => return Err(e.into()),
    };
    self.notify(SessionEvent::Progress {
      id: id.clone(),
      progress,
    });
    if progress.is_complete() {
      let handle = self.registry.advance(id, Step::TransferComplete)?;
      if handle.state.is_terminal() {
        self.finish(&handle);
      }
    }
    Ok(progress)
  }

  /// Called by a session's deadline task once its deadline passes
  fn expire(&self, id: &Identifier, serial: u64) -> Expiry {
    let expiry = self.registry.expire(id, serial);
    if let Expiry::Expired(handle) = &expiry {
      self.accountant.release(id);
      let e = TimedOut {
        id: id.clone(),
        timeout: self.registry.request_timeout(),
      };
      tracing::debug!(%id, kind = %handle.kind, "Session timed out");
      self.send(&error::report::<P, _>(Some(id.clone()), &e));
      self.notify(SessionEvent::Failed {
        id: id.clone(),
        code: e.code(),
        message: e.to_string(),
        origin: FailureOrigin::Local,
      });
    }
    expiry
  }

  /// Surfaces a session released by a refused declaration
  fn surface_failure(&self, id: &Identifier, e: DispatchError) -> DispatchError {
    self.notify(SessionEvent::Failed {
      id: id.clone(),
      code: e.code(),
      message: e.to_string(),
      origin: FailureOrigin::Local,
    });
    e
  }

  /// Fails a live session and surfaces it; returns whether one was live
  fn fail_session(
    &self,
    id: &Identifier,
    code: ErrorCode,
    message: String,
    origin: FailureOrigin,
  ) -> bool {
    match self.registry.advance(id, Step::Fail) {
      Ok(handle) => {
        self.finish(&handle);
        self.notify(SessionEvent::Failed {
          id: id.clone(),
          code,
          message,
          origin,
        });
        true
      }
      Err(_) => false,
    }
  }

  /// Releases a terminal session along with its counters and deadline
  fn finish(&self, handle: &SessionHandle) {
    self.registry.release_serial(&handle.id, handle.serial);
    self.accountant.release(&handle.id);
    tracing::trace!(id = %handle.id, state = ?handle.state, "Session finished");
  }

  /// Fails every session still live once the connection is gone
  fn cascade(&self) {
    let drained = self.registry.drain();
    if !drained.is_empty() {
      tracing::debug!(sessions = drained.len(), "Failing sessions of closed connection");
    }
    for handle in drained {
      self.accountant.release(&handle.id);
      self.notify(SessionEvent::Failed {
        id: handle.id,
        code: ErrorCode::Unknown,
        message: String::from("Transport connection closed"),
        origin: FailureOrigin::Connection,
      });
    }
  }

  fn send_error(&self, id: Option<Identifier>, code: ErrorCode, detail: &dyn std::fmt::Display) {
    self.send(&error::error_packet::<P>(id, code, detail));
  }

  fn send(&self, packet: &P::Packet) {
    match packet::encode::<P>(packet) {
      Ok(raw) => {
        if self.outbound.send(raw).is_err() {
          tracing::trace!("Writer is gone; dropping packet");
        }
      }
      Err(e) => tracing::error!(error = %e, "Failed to encode packet"),
    }
  }

  fn notify(&self, event: SessionEvent<P::Packet>) {
    if self.events.send(event).is_err() {
      tracing::trace!("Event receiver is gone; dropping event");
    }
  }
}

fn on_deadline<P: Protocol>(shared: &Weak<Shared<P>>, id: &Identifier, serial: u64) -> Expiry {
  match shared.upgrade() {
    Some(shared) => shared.expire(id, serial),
    None => Expiry::Gone,
  }
}

#[cfg(test)]
mod tests;
