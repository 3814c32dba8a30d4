// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Carbon, the variant without a dedicated connect packet
//!
//! A Carbon client opens a WebSocket by sending a `request` whose url has a `ws` or
//! `wss` scheme; the server answers with `open`. Messages carry their own identifier
//! and name the connection they travel on.
use serde::{Deserialize, Serialize};

use super::{
  error::ErrorCode,
  id::Identifier,
  packet::{
    self, check_declared, check_method, check_status, check_url, is_socket_url, Action, DataType,
    Headers, Protocol, Violation, HTTP_SCHEMES, SOCKET_SCHEMES,
  },
};
use crate::common::{meta::ServerMeta, session::SessionKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CarbonPacket {
  Request(CarbonRequest),
  Response(CarbonResponse),
  Open(CarbonOpen),
  Close(CarbonClose),
  Message(CarbonMessage),
  Error(CarbonError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarbonRequest {
  pub id: Identifier,
  pub method: String,
  pub url: String,
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarbonResponse {
  pub id: Identifier,
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarbonOpen {
  pub id: Identifier,
  pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarbonClose {
  pub id: Identifier,
  pub code: u16,
  pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarbonMessage {
  /// Names this message alone
  pub id: Identifier,
  /// The socket connection the message travels on
  pub connection: Identifier,
  pub data: u64,
  pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarbonError {
  pub id: Identifier,
  pub code: ErrorCode,
  pub message: String,
}

impl CarbonPacket {
  pub fn id(&self) -> &Identifier {
    match self {
      CarbonPacket::Request(p) => &p.id,
      CarbonPacket::Response(p) => &p.id,
      CarbonPacket::Open(p) => &p.id,
      CarbonPacket::Close(p) => &p.id,
      CarbonPacket::Message(p) => &p.id,
      CarbonPacket::Error(p) => &p.id,
    }
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Carbon;

impl Protocol for Carbon {
  type Packet = CarbonPacket;

  const NAME: &'static str = "carbon";

  const TYPES: &'static [&'static str] =
    &["request", "response", "open", "close", "message", "error"];

  fn session_id(packet: &CarbonPacket) -> &Identifier {
    match packet {
      CarbonPacket::Message(message) => &message.connection,
      other => other.id(),
    }
  }

  fn session_field(tag: &str) -> Option<&'static str> {
    match tag {
      "message" => Some("connection"),
      _ => None,
    }
  }

  fn action(packet: &CarbonPacket) -> Action {
    match packet {
      CarbonPacket::Request(request) if is_socket_url(&request.url) => Action::Initiate {
        kind: SessionKind::SocketConnection,
        body: None,
      },
      CarbonPacket::Request(request) => Action::Initiate {
        kind: SessionKind::HttpExchange,
        body: request.body,
      },
      CarbonPacket::Response(response) => Action::Respond {
        body: response.body,
      },
      CarbonPacket::Open(_) => Action::Open,
      CarbonPacket::Close(close) => Action::Close {
        code: close.code,
        reason: close.reason.clone(),
      },
      CarbonPacket::Message(message) => Action::Message { data: message.data },
      CarbonPacket::Error(error) => Action::Error {
        code: error.code,
        message: error.message.clone(),
      },
    }
  }

  fn validate(packet: &CarbonPacket, meta: &ServerMeta) -> Result<(), Violation> {
    match packet {
      CarbonPacket::Request(request) => {
        check_method(&request.method)?;
        let url = check_url(&request.url, &[HTTP_SCHEMES, SOCKET_SCHEMES].concat())?;
        if SOCKET_SCHEMES.iter().any(|scheme| *scheme == url.scheme()) {
          if request.body.unwrap_or(0) > 0 {
            return Err(Violation::Invalid(String::from(
              "socket connection requests cannot carry a body",
            )));
          }
          return Ok(());
        }
        check_declared(request.body, meta.max_body_size)
      }
      CarbonPacket::Response(response) => {
        check_status(response.status)?;
        check_declared(response.body, meta.max_body_size)
      }
      CarbonPacket::Message(message) => check_declared(Some(message.data), meta.max_message_size),
      CarbonPacket::Open(_) | CarbonPacket::Close(_) | CarbonPacket::Error(_) => Ok(()),
    }
  }

  fn error(id: Identifier, code: ErrorCode, message: String) -> CarbonPacket {
    CarbonPacket::Error(CarbonError { id, code, message })
  }
}

/// Decodes a Carbon packet; see [`packet::decode`]
pub fn decode(raw: &[u8], meta: &ServerMeta) -> Result<CarbonPacket, packet::DecodeError> {
  packet::decode::<Carbon>(raw, meta)
}
