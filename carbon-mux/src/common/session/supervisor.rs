// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use super::{registry::Expiry, SessionHandle};
use crate::common::protocol::{
  error::{ErrorCode, Reportable},
  id::Identifier,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Session {id} did not complete within {timeout:?}")]
pub struct TimedOut {
  pub id: Identifier,
  pub timeout: Duration,
}

impl Reportable for TimedOut {
  fn code(&self) -> ErrorCode {
    ErrorCode::RequestTimeout
  }
}

/// Arms one deadline task per session.
///
/// The task ends quietly when the session is released first. Otherwise, at each
/// deadline it calls `on_deadline`, which must claim the session through
/// [`SessionRegistry::expire`](super::registry::SessionRegistry::expire) before acting
/// and returns that outcome; an extended deadline re-arms the task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutSupervisor;

impl TimeoutSupervisor {
  pub fn arm<F>(&self, session: &SessionHandle, mut on_deadline: F) -> JoinHandle<()>
  where
    F: FnMut(&Identifier, u64) -> Expiry + Send + 'static,
  {
    let released = session.released();
    let mut deadline = session.deadline;
    let (id, serial) = (session.id.clone(), session.serial);
    let span = tracing::debug_span!("deadline", %id, serial);
    tokio::task::spawn(
      async move {
        loop {
          tokio::select! {
            biased;
            _ = released.cancelled() => {
              tracing::trace!("Session released before its deadline");
              return;
            }
            _ = tokio::time::sleep_until(deadline) => {}
          }
          match on_deadline(&id, serial) {
            Expiry::Extended(next) => deadline = next,
            Expiry::Expired(_) => {
              tracing::debug!("Session expired");
              return;
            }
            Expiry::Gone => return,
          }
        }
      }
      .instrument(span),
    )
  }
}
