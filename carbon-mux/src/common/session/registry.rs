// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;

use super::{SerialGenerator, SessionHandle, SessionKind, SessionState, Step};
use crate::common::protocol::{
  error::{ErrorCode, Reportable},
  id::Identifier,
};

/// Live sessions of one connection, keyed by identifier.
///
/// Each identifier's entry is its own critical section: mutations on one identifier are
/// serialized, while unrelated identifiers proceed in parallel on other shards. No
/// operation awaits while holding an entry.
#[derive(Debug)]
pub struct SessionRegistry {
  sessions: DashMap<Identifier, SessionHandle>,
  serials: SerialGenerator,
  request_timeout: Duration,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("Session {0} is already registered")]
  IdOccupied(Identifier),
  #[error("Session {0} is not registered")]
  NotRegistered(Identifier),
  #[error("Session {id} is a {actual}, which cannot take {step:?}")]
  KindMismatch {
    id: Identifier,
    actual: SessionKind,
    step: Step,
  },
  #[error("Session {id} cannot take {step:?} from {state:?}")]
  InvalidTransition {
    id: Identifier,
    state: SessionState,
    step: Step,
  },
}

/// Outcome of a deadline check on one session instance
#[derive(Debug, Clone)]
pub enum Expiry {
  /// The caller won the session; it is removed and failed
  Expired(SessionHandle),
  /// Activity moved the deadline; check again at this instant
  Extended(Instant),
  /// Completed, released, or replaced by a newer session under the same identifier
  Gone,
}

impl Expiry {
  pub fn is_expired(&self) -> bool {
    matches!(self, Expiry::Expired(_))
  }
}

impl Reportable for RegistryError {
  fn code(&self) -> ErrorCode {
    ErrorCode::UnknownRequest
  }
}

impl SessionRegistry {
  pub fn new(request_timeout: Duration) -> Self {
    Self {
      sessions: DashMap::new(),
      serials: SerialGenerator::default(),
      request_timeout,
    }
  }

  pub fn request_timeout(&self) -> Duration {
    self.request_timeout
  }

  /// Registers a new session in its kind's initial state, with its deadline set
  pub fn create_session(
    &self,
    id: Identifier,
    kind: SessionKind,
  ) -> Result<SessionHandle, RegistryError> {
    match self.sessions.entry(id) {
      Entry::Occupied(occupied) => Err(RegistryError::IdOccupied(occupied.key().clone())),
      Entry::Vacant(vacant) => {
        let created = Instant::now();
        let handle = SessionHandle::new(
          vacant.key().clone(),
          kind,
          self.serials.next(),
          created,
          created + self.request_timeout,
        );
        vacant.insert(handle.clone());
        tracing::trace!(id = %handle.id, %kind, serial = handle.serial, "Session registered");
        Ok(handle)
      }
    }
  }

  pub fn lookup(&self, id: &Identifier) -> Result<SessionHandle, RegistryError> {
    self
      .sessions
      .get(id)
      .map(|entry| entry.value().clone())
      .ok_or_else(|| RegistryError::NotRegistered(id.clone()))
  }

  pub fn contains(&self, id: &Identifier) -> bool {
    self.sessions.contains_key(id)
  }

  /// Applies a step to a session, returning a snapshot carrying its new state.
  ///
  /// An exchange's deadline stays fixed at creation plus the timeout; any step that
  /// leaves a socket connection live pushes its deadline a full timeout out.
  /// A session reaching a terminal state has its cancellation fired under the entry's
  /// lock, so a racing [`expire`](Self::expire) can no longer claim it; the caller is
  /// still responsible for [`release`](Self::release)-ing it.
  pub fn advance(&self, id: &Identifier, step: Step) -> Result<SessionHandle, RegistryError> {
    let mut entry = self
      .sessions
      .get_mut(id)
      .ok_or_else(|| RegistryError::NotRegistered(id.clone()))?;
    let session = entry.value_mut();
    if let Some(kind) = step.kind() {
      if kind != session.kind {
        return Err(RegistryError::KindMismatch {
          id: id.clone(),
          actual: session.kind,
          step,
        });
      }
    }
    let next = session
      .state
      .step(step)
      .ok_or_else(|| RegistryError::InvalidTransition {
        id: id.clone(),
        state: session.state,
        step,
      })?;
    tracing::trace!(%id, from = ?session.state, to = ?next, "Session advanced");
    session.state = next;
    if next.is_terminal() {
      session.cancel();
    } else if session.kind == SessionKind::SocketConnection {
      session.deadline = Instant::now() + self.request_timeout;
    }
    Ok(session.clone())
  }

  /// Removes a session regardless of its state; releasing an unknown id is a no-op
  pub fn release(&self, id: &Identifier) -> Option<SessionHandle> {
    let (_, handle) = self.sessions.remove(id)?;
    handle.cancel();
    tracing::trace!(%id, serial = handle.serial, "Session released");
    Some(handle)
  }

  /// Removes the session only if it is still the instance numbered `serial`
  pub fn release_serial(&self, id: &Identifier, serial: u64) -> Option<SessionHandle> {
    let (_, handle) = self.sessions.remove_if(id, |_, s| s.serial == serial)?;
    handle.cancel();
    tracing::trace!(%id, serial, "Session released");
    Some(handle)
  }

  /// Claims an expired session for the timeout path.
  ///
  /// Succeeds only if the session numbered `serial` is still registered, not terminal,
  /// and past its deadline; the removal is atomic, so at most one caller ever wins it.
  pub fn expire(&self, id: &Identifier, serial: u64) -> Expiry {
    let now = Instant::now();
    let expired = self.sessions.remove_if(id, |_, s| {
      s.serial == serial && !s.state.is_terminal() && s.deadline <= now
    });
    if let Some((_, mut handle)) = expired {
      if let Some(failed) = handle.state.step(Step::Fail) {
        handle.state = failed;
      }
      handle.cancel();
      return Expiry::Expired(handle);
    }
    match self.sessions.get(id) {
      Some(s) if s.serial == serial && !s.state.is_terminal() => Expiry::Extended(s.deadline),
      _ => Expiry::Gone,
    }
  }

  /// Removes every session, failing those not yet terminal
  pub fn drain(&self) -> Vec<SessionHandle> {
    let ids: Vec<Identifier> = self.ids();
    ids
      .iter()
      .filter_map(|id| self.sessions.remove(id))
      .map(|(_, mut handle)| {
        if let Some(failed) = handle.state.step(Step::Fail) {
          handle.state = failed;
        }
        handle.cancel();
        handle
      })
      .collect()
  }

  pub fn ids(&self) -> Vec<Identifier> {
    self.sessions.iter().map(|entry| entry.key().clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }
}
