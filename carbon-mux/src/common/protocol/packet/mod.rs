// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Protocol-independent packet handling
//!
//! Each protocol variant ([`Carbon`](super::carbon::Carbon) and
//! [`PSocket`](super::psocket::PSocket)) describes its wire packets as a serde-tagged
//! enum and implements [`Protocol`], which reduces every packet to an [`Action`] the
//! dispatcher can route without knowing which variant it is speaking.
//!
//! Size-bearing fields (`body`, `data`) are declared lengths; the payload bytes travel
//! on the collaborator's own channel and are never part of a packet.
use std::{collections::BTreeMap, fmt::Debug};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
  error::{ErrorCode, Reportable},
  id::Identifier,
};
use crate::common::{meta::ServerMeta, session::SessionKind};

pub type Headers = BTreeMap<String, String>;

pub const HTTP_METHODS: &[&str] = &[
  "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];
pub const HTTP_SCHEMES: &[&str] = &["http", "https"];
pub const SOCKET_SCHEMES: &[&str] = &["ws", "wss"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
  Text,
  Binary,
}

/// The end of a tunnel a dispatcher runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
  /// Initiates requests and connections
  Client,
  /// Performs network I/O on the client's behalf
  Server,
}

impl Side {
  pub fn peer(&self) -> Side {
    match self {
      Side::Client => Side::Server,
      Side::Server => Side::Client,
    }
  }

  /// Whether the peer of this side is allowed to originate packets of this action
  pub fn accepts_inbound(&self, action: &Action) -> bool {
    match (self, action) {
      (_, Action::Message { .. } | Action::Close { .. } | Action::Error { .. }) => true,
      (Side::Server, Action::Initiate { .. }) => true,
      (Side::Client, Action::Respond { .. } | Action::Open) => true,
      _ => false,
    }
  }

  pub fn may_send(&self, action: &Action) -> bool {
    self.peer().accepts_inbound(action)
  }
}

impl std::fmt::Display for Side {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Side::Client => f.write_str("client"),
      Side::Server => f.write_str("server"),
    }
  }
}

/// What a packet asks of the session it addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  /// Starts a new session; `body` is the declared request body, if any
  Initiate {
    kind: SessionKind,
    body: Option<u64>,
  },
  /// Answers an HTTP exchange; `body` is the declared response body, if any
  Respond { body: Option<u64> },
  /// Confirms a socket connection was opened by the remote
  Open,
  /// Announces a socket message of `data` bytes
  Message { data: u64 },
  Close { code: u16, reason: String },
  Error { code: ErrorCode, message: String },
}

impl Action {
  pub fn name(&self) -> &'static str {
    match self {
      Action::Initiate {
        kind: SessionKind::HttpExchange,
        ..
      } => "request",
      Action::Initiate {
        kind: SessionKind::SocketConnection,
        ..
      } => "connect",
      Action::Respond { .. } => "response",
      Action::Open => "open",
      Action::Message { .. } => "message",
      Action::Close { .. } => "close",
      Action::Error { .. } => "error",
    }
  }

  pub fn is_initiating(&self) -> bool {
    matches!(self, Action::Initiate { .. })
  }
}

/// A field-level problem with an otherwise well-formed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  Invalid(String),
  TooLarge { declared: u64, limit: u64 },
}

/// One of the tunneling protocol variants
pub trait Protocol: Send + Sync + 'static {
  type Packet: Serialize + DeserializeOwned + Clone + Debug + PartialEq + Send + Sync + 'static;

  const NAME: &'static str;

  /// Every `type` tag the variant understands
  const TYPES: &'static [&'static str];

  /// The identifier of the session a packet belongs to
  fn session_id(packet: &Self::Packet) -> &Identifier;

  fn action(packet: &Self::Packet) -> Action;

  /// The field naming the addressed session for packets of type `tag`, when it is
  /// not the packet's own `id`
  fn session_field(_tag: &str) -> Option<&'static str> {
    None
  }

  /// Semantic checks beyond what deserialization enforces
  fn validate(packet: &Self::Packet, meta: &ServerMeta) -> Result<(), Violation>;

  fn error(id: Identifier, code: ErrorCode, message: String) -> Self::Packet;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("Packet is not a JSON object: {reason}")]
  Malformed { reason: String },
  #[error("Packet identifier is missing or not a 32 character hex string")]
  MissingIdentifier,
  #[error("Packet {id} names no valid session in its {field:?} field")]
  InvalidSession { id: Identifier, field: &'static str },
  #[error("Packet {id} has unrecognized type {tag:?}")]
  UnknownType { id: Identifier, tag: Option<String> },
  #[error("Invalid packet for {id}: {reason}")]
  Invalid { id: Identifier, reason: String },
  #[error("Packet for {id} declares {declared} bytes, exceeding the limit of {limit}")]
  TooLarge {
    id: Identifier,
    declared: u64,
    limit: u64,
    /// Whether the oversized packet tried to start a session rather than continue one
    initiating: bool,
  },
}

impl DecodeError {
  /// The identifier errors for this packet should be addressed to, when recoverable
  pub fn identifier(&self) -> Option<&Identifier> {
    match self {
      DecodeError::Malformed { .. } | DecodeError::MissingIdentifier => None,
      DecodeError::InvalidSession { id, .. }
      | DecodeError::UnknownType { id, .. }
      | DecodeError::Invalid { id, .. }
      | DecodeError::TooLarge { id, .. } => Some(id),
    }
  }
}

impl Reportable for DecodeError {
  fn code(&self) -> ErrorCode {
    match self {
      DecodeError::Malformed { .. } => ErrorCode::Unknown,
      DecodeError::MissingIdentifier | DecodeError::InvalidSession { .. } => {
        ErrorCode::UnknownRequest
      }
      DecodeError::UnknownType { .. } | DecodeError::Invalid { .. } => ErrorCode::InvalidRequest,
      DecodeError::TooLarge { .. } => ErrorCode::BodyTooLarge,
    }
  }
}

/// Decodes and validates one raw packet against the active server limits
pub fn decode<P: Protocol>(raw: &[u8], meta: &ServerMeta) -> Result<P::Packet, DecodeError> {
  let value: serde_json::Value =
    serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed {
      reason: e.to_string(),
    })?;
  let id = {
    let object = value.as_object().ok_or_else(|| DecodeError::Malformed {
      reason: String::from("expected an object"),
    })?;
    let id = object
      .get("id")
      .and_then(serde_json::Value::as_str)
      .ok_or(DecodeError::MissingIdentifier)?;
    let id = Identifier::parse(id).map_err(|_| DecodeError::MissingIdentifier)?;
    let tag = match object.get("type").and_then(serde_json::Value::as_str) {
      Some(tag) if P::TYPES.iter().any(|known| *known == tag) => tag,
      other => {
        return Err(DecodeError::UnknownType {
          id,
          tag: other.map(String::from),
        })
      }
    };
    if let Some(field) = P::session_field(tag) {
      let named = object.get(field).and_then(serde_json::Value::as_str);
      if named.map_or(true, |raw| Identifier::parse(raw).is_err()) {
        return Err(DecodeError::InvalidSession { id, field });
      }
    }
    id
  };
  let packet: P::Packet = serde_json::from_value(value).map_err(|e| DecodeError::Invalid {
    id,
    reason: e.to_string(),
  })?;
  check::<P>(&packet, meta)?;
  Ok(packet)
}

/// Applies the variant's semantic checks, attributing failures to the packet's session
pub fn check<P: Protocol>(packet: &P::Packet, meta: &ServerMeta) -> Result<(), DecodeError> {
  P::validate(packet, meta).map_err(|violation| {
    let id = P::session_id(packet).clone();
    match violation {
      Violation::Invalid(reason) => DecodeError::Invalid { id, reason },
      Violation::TooLarge { declared, limit } => DecodeError::TooLarge {
        id,
        declared,
        limit,
        initiating: P::action(packet).is_initiating(),
      },
    }
  })
}

pub fn encode<P: Protocol>(packet: &P::Packet) -> Result<Vec<u8>, serde_json::Error> {
  serde_json::to_vec(packet)
}

pub(crate) fn check_method(method: &str) -> Result<(), Violation> {
  if HTTP_METHODS.iter().any(|known| *known == method) {
    Ok(())
  } else {
    Err(Violation::Invalid(format!("unsupported HTTP method {:?}", method)))
  }
}

pub(crate) fn check_url(raw: &str, schemes: &[&str]) -> Result<url::Url, Violation> {
  let url = url::Url::parse(raw)
    .map_err(|e| Violation::Invalid(format!("unparseable url {:?}: {}", raw, e)))?;
  if !schemes.iter().any(|scheme| *scheme == url.scheme()) {
    return Err(Violation::Invalid(format!(
      "url scheme {:?} is not one of {:?}",
      url.scheme(),
      schemes
    )));
  }
  Ok(url)
}

pub(crate) fn check_status(status: u16) -> Result<(), Violation> {
  if (100..=999).contains(&status) {
    Ok(())
  } else {
    Err(Violation::Invalid(format!("invalid HTTP status {}", status)))
  }
}

pub(crate) fn check_declared(length: Option<u64>, limit: u64) -> Result<(), Violation> {
  match length {
    Some(declared) if declared > limit => Err(Violation::TooLarge { declared, limit }),
    _ => Ok(()),
  }
}

pub(crate) fn is_socket_url(raw: &str) -> bool {
  url::Url::parse(raw)
    .map(|url| SOCKET_SCHEMES.iter().any(|scheme| *scheme == url.scheme()))
    .unwrap_or(false)
}
