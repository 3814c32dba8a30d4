// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! PSocket, the variant with explicit `connect` packets
//!
//! Unlike Carbon, responses report the final url reached after redirects, socket
//! connections are requested with `connect` and confirmed with `open`, and messages
//! are addressed by the connection's identifier directly.
use serde::{Deserialize, Serialize};

use super::{
  error::ErrorCode,
  id::Identifier,
  packet::{
    self, check_declared, check_method, check_status, check_url, Action, DataType, Headers,
    Protocol, Violation, HTTP_SCHEMES, SOCKET_SCHEMES,
  },
};
use crate::common::{meta::ServerMeta, session::SessionKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PSocketPacket {
  Request(PSocketRequest),
  Response(PSocketResponse),
  Connect(PSocketConnect),
  Open(PSocketOpen),
  Close(PSocketClose),
  Message(PSocketMessage),
  Error(PSocketError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PSocketRequest {
  pub id: Identifier,
  pub method: String,
  pub url: String,
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PSocketResponse {
  pub id: Identifier,
  pub status: u16,
  pub status_text: String,
  /// Final url of the exchange, after any redirects the server followed
  pub url: String,
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PSocketConnect {
  pub id: Identifier,
  pub url: String,
  pub protocols: Vec<String>,
  pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PSocketOpen {
  pub id: Identifier,
  pub url: String,
  /// Subprotocol selected by the remote, empty when none was negotiated
  pub protocol: String,
  pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PSocketClose {
  pub id: Identifier,
  pub code: u16,
  pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PSocketMessage {
  pub id: Identifier,
  pub data: u64,
  pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PSocketError {
  pub id: Identifier,
  pub code: ErrorCode,
  pub message: String,
}

impl PSocketPacket {
  pub fn id(&self) -> &Identifier {
    match self {
      PSocketPacket::Request(p) => &p.id,
      PSocketPacket::Response(p) => &p.id,
      PSocketPacket::Connect(p) => &p.id,
      PSocketPacket::Open(p) => &p.id,
      PSocketPacket::Close(p) => &p.id,
      PSocketPacket::Message(p) => &p.id,
      PSocketPacket::Error(p) => &p.id,
    }
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PSocket;

impl Protocol for PSocket {
  type Packet = PSocketPacket;

  const NAME: &'static str = "psocket";

  const TYPES: &'static [&'static str] = &[
    "request", "response", "connect", "open", "close", "message", "error",
  ];

  fn session_id(packet: &PSocketPacket) -> &Identifier {
    packet.id()
  }

  fn action(packet: &PSocketPacket) -> Action {
    match packet {
      PSocketPacket::Request(request) => Action::Initiate {
        kind: SessionKind::HttpExchange,
        body: request.body,
      },
      PSocketPacket::Connect(_) => Action::Initiate {
        kind: SessionKind::SocketConnection,
        body: None,
      },
      PSocketPacket::Response(response) => Action::Respond {
        body: response.body,
      },
      PSocketPacket::Open(_) => Action::Open,
      PSocketPacket::Close(close) => Action::Close {
        code: close.code,
        reason: close.reason.clone(),
      },
      PSocketPacket::Message(message) => Action::Message { data: message.data },
      PSocketPacket::Error(error) => Action::Error {
        code: error.code,
        message: error.message.clone(),
      },
    }
  }

  fn validate(packet: &PSocketPacket, meta: &ServerMeta) -> Result<(), Violation> {
    match packet {
      PSocketPacket::Request(request) => {
        check_method(&request.method)?;
        check_url(&request.url, HTTP_SCHEMES)?;
        check_declared(request.body, meta.max_body_size)
      }
      PSocketPacket::Response(response) => {
        check_status(response.status)?;
        check_url(&response.url, HTTP_SCHEMES)?;
        check_declared(response.body, meta.max_body_size)
      }
      PSocketPacket::Connect(connect) => {
        check_url(&connect.url, SOCKET_SCHEMES)?;
        if connect.protocols.iter().any(|p| p.is_empty()) {
          return Err(Violation::Invalid(String::from(
            "subprotocol names must not be empty",
          )));
        }
        Ok(())
      }
      PSocketPacket::Open(open) => check_url(&open.url, SOCKET_SCHEMES).map(|_| ()),
      PSocketPacket::Message(message) => check_declared(Some(message.data), meta.max_message_size),
      PSocketPacket::Close(_) | PSocketPacket::Error(_) => Ok(()),
    }
  }

  fn error(id: Identifier, code: ErrorCode, message: String) -> PSocketPacket {
    PSocketPacket::Error(PSocketError { id, code, message })
  }
}

/// Decodes a PSocket packet; see [`packet::decode`]
pub fn decode(raw: &[u8], meta: &ServerMeta) -> Result<PSocketPacket, packet::DecodeError> {
  packet::decode::<PSocket>(raw, meta)
}

#[cfg(test)]
mod tests {
  use assert_matches::assert_matches;

  use super::{
    decode, PSocket, PSocketClose, PSocketConnect, PSocketError, PSocketMessage, PSocketOpen,
    PSocketPacket, PSocketRequest, PSocketResponse,
  };
  use crate::common::{
    meta::ServerMeta,
    protocol::{
      error::ErrorCode,
      id::Identifier,
      packet::{encode, Action, DataType, DecodeError, Headers, Protocol},
    },
    session::SessionKind,
  };

  fn headers() -> Headers {
    let mut headers = Headers::new();
    headers.insert(String::from("user-agent"), String::from("carbon-mux"));
    headers
  }

  #[test]
  fn every_packet_kind_round_trips() {
    let meta = ServerMeta::default();
    let id = Identifier::generate();
    let packets = vec![
      PSocketPacket::Request(PSocketRequest {
        id: id.clone(),
        method: String::from("POST"),
        url: String::from("https://example.com/upload"),
        headers: headers(),
        body: Some(1024),
      }),
      PSocketPacket::Response(PSocketResponse {
        id: id.clone(),
        status: 301,
        status_text: String::from("Moved Permanently"),
        url: String::from("https://example.com/final"),
        headers: Headers::new(),
        body: None,
      }),
      PSocketPacket::Connect(PSocketConnect {
        id: id.clone(),
        url: String::from("wss://example.com/socket"),
        protocols: vec![String::from("chat")],
        headers: headers(),
      }),
      PSocketPacket::Open(PSocketOpen {
        id: id.clone(),
        url: String::from("wss://example.com/socket"),
        protocol: String::from("chat"),
        headers: Headers::new(),
      }),
      PSocketPacket::Message(PSocketMessage {
        id: id.clone(),
        data: 10,
        data_type: DataType::Text,
      }),
      PSocketPacket::Close(PSocketClose {
        id: id.clone(),
        code: 1000,
        reason: String::from("done"),
      }),
      PSocketPacket::Error(PSocketError {
        id,
        code: ErrorCode::ConnectionFailed,
        message: String::from("refused"),
      }),
    ];
    for packet in packets {
      let raw = encode::<PSocket>(&packet).unwrap();
      assert_eq!(decode(&raw, &meta).unwrap(), packet);
    }
  }

  #[test]
  fn connect_initiates_socket_sessions() {
    let raw = format!(
      r#"{{"id":"{}","type":"connect","url":"ws://example.com","protocols":[],"headers":{{}}}}"#,
      "c".repeat(32)
    );
    let packet = decode(raw.as_bytes(), &ServerMeta::default()).unwrap();
    assert_eq!(
      PSocket::action(&packet),
      Action::Initiate {
        kind: SessionKind::SocketConnection,
        body: None
      }
    );
  }

  #[test]
  fn schemes_are_bound_to_packet_kind() {
    let meta = ServerMeta::default();
    let raw = format!(
      r#"{{"id":"{}","type":"request","method":"GET","url":"ws://example.com","headers":{{}}}}"#,
      "c".repeat(32)
    );
    assert_matches!(decode(raw.as_bytes(), &meta), Err(DecodeError::Invalid { .. }));
    let raw = format!(
      r#"{{"id":"{}","type":"connect","url":"http://example.com","protocols":[],"headers":{{}}}}"#,
      "c".repeat(32)
    );
    assert_matches!(decode(raw.as_bytes(), &meta), Err(DecodeError::Invalid { .. }));
  }

  #[test]
  fn oversized_messages_continue_existing_sessions() {
    let meta = ServerMeta::default();
    let raw = format!(
      r#"{{"id":"{}","type":"message","data":{},"dataType":"text"}}"#,
      "c".repeat(32),
      meta.max_message_size + 1
    );
    assert_matches!(
      decode(raw.as_bytes(), &meta),
      Err(DecodeError::TooLarge {
        initiating: false,
        ..
      })
    );
  }

  #[test]
  fn response_requires_final_url() {
    let raw = format!(
      r#"{{"id":"{}","type":"response","status":200,"statusText":"OK","headers":{{}}}}"#,
      "c".repeat(32)
    );
    assert_matches!(
      decode(raw.as_bytes(), &ServerMeta::default()),
      Err(DecodeError::Invalid { .. })
    );
  }
}
