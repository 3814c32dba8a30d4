// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use dashmap::{mapref::entry::Entry, DashMap};

use crate::common::{
  meta::ServerMeta,
  protocol::{
    error::{ErrorCode, Reportable},
    id::Identifier,
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
  RequestBody,
  ResponseBody,
  Message,
}

impl std::fmt::Display for TransferKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TransferKind::RequestBody => f.write_str("request body"),
      TransferKind::ResponseBody => f.write_str("response body"),
      TransferKind::Message => f.write_str("message"),
    }
  }
}

/// Byte counts of one declared transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
  pub kind: TransferKind,
  pub declared: u64,
  pub received: u64,
}

impl Progress {
  pub fn is_complete(&self) -> bool {
    self.received == self.declared
  }

  pub fn remaining(&self) -> u64 {
    self.declared - self.received
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declared {
  /// Nothing to transfer; the payload is complete already
  Empty,
  Pending(Progress),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountingError {
  #[error("Declared {kind} of {declared} bytes for {id} exceeds the limit of {limit}")]
  TooLarge {
    id: Identifier,
    kind: TransferKind,
    declared: u64,
    limit: u64,
  },
  #[error("{attempted} more bytes for {id} would exceed its declared {declared} ({received} received)")]
  Overflow {
    id: Identifier,
    declared: u64,
    received: u64,
    attempted: u64,
  },
  #[error("No transfer is declared for {0}")]
  NotDeclared(Identifier),
  #[error("A transfer is already in progress for {0}")]
  TransferInProgress(Identifier),
}

impl Reportable for AccountingError {
  fn code(&self) -> ErrorCode {
    match self {
      AccountingError::TooLarge { .. } | AccountingError::Overflow { .. } => ErrorCode::BodyTooLarge,
      AccountingError::NotDeclared(_) | AccountingError::TransferInProgress(_) => {
        ErrorCode::UnknownRequest
      }
    }
  }
}

/// Counts declared against delivered payload bytes for every session of a connection.
///
/// Holds no payload; its checks are the only flow-control gate between the wire and
/// the collaborator moving the bytes. `0 <= received <= declared <= limit` always holds.
#[derive(Debug)]
pub struct StreamAccountant {
  transfers: DashMap<Identifier, Progress>,
  max_body_size: u64,
  max_message_size: u64,
}

impl StreamAccountant {
  pub fn new(meta: &ServerMeta) -> Self {
    Self {
      transfers: DashMap::new(),
      max_body_size: meta.max_body_size,
      max_message_size: meta.max_message_size,
    }
  }

  pub fn limit(&self, kind: TransferKind) -> u64 {
    match kind {
      TransferKind::RequestBody | TransferKind::ResponseBody => self.max_body_size,
      TransferKind::Message => self.max_message_size,
    }
  }

  /// Announces a transfer before any of its bytes flow.
  ///
  /// An absent or zero length carries no payload and tracks nothing.
  pub fn declare(
    &self,
    id: &Identifier,
    kind: TransferKind,
    length: Option<u64>,
  ) -> Result<Declared, AccountingError> {
    let declared = length.unwrap_or(0);
    let limit = self.limit(kind);
    if declared > limit {
      return Err(AccountingError::TooLarge {
        id: id.clone(),
        kind,
        declared,
        limit,
      });
    }
    match self.transfers.entry(id.clone()) {
      Entry::Occupied(_) => Err(AccountingError::TransferInProgress(id.clone())),
      Entry::Vacant(_) if declared == 0 => Ok(Declared::Empty),
      Entry::Vacant(vacant) => {
        let progress = Progress {
          kind,
          declared,
          received: 0,
        };
        vacant.insert(progress);
        Ok(Declared::Pending(progress))
      }
    }
  }

  /// Records `bytes` more delivered for the session's current transfer.
  ///
  /// Overflowing the declaration changes nothing; a completed transfer is forgotten.
  pub fn advance(&self, id: &Identifier, bytes: u64) -> Result<Progress, AccountingError> {
    let progress = {
      let mut entry = self
        .transfers
        .get_mut(id)
        .ok_or_else(|| AccountingError::NotDeclared(id.clone()))?;
      let progress = entry.value_mut();
      let received = progress
        .received
        .checked_add(bytes)
        .filter(|received| *received <= progress.declared)
        .ok_or_else(|| AccountingError::Overflow {
          id: id.clone(),
          declared: progress.declared,
          received: progress.received,
          attempted: bytes,
        })?;
      progress.received = received;
      *progress
    };
    if progress.is_complete() {
      self.transfers.remove_if(id, |_, p| p.is_complete());
    }
    Ok(progress)
  }

  /// Whether the session has no transfer outstanding
  pub fn is_complete(&self, id: &Identifier) -> bool {
    self
      .transfers
      .get(id)
      .map(|progress| progress.is_complete())
      .unwrap_or(true)
  }

  pub fn progress(&self, id: &Identifier) -> Option<Progress> {
    self.transfers.get(id).map(|progress| *progress)
  }

  pub fn release(&self, id: &Identifier) -> Option<Progress> {
    self.transfers.remove(id).map(|(_, progress)| progress)
  }

  pub fn len(&self) -> usize {
    self.transfers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.transfers.is_empty()
  }
}
