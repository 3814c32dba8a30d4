// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The closed set of error codes exchanged between peers, and construction of error packets
use serde::{Deserialize, Serialize};

use super::{id::Identifier, packet::Protocol};

/// Message carried by every [`ErrorCode::Unknown`] packet, whatever the underlying fault
pub const GENERIC_UNKNOWN_MESSAGE: &str = "An unknown error occurred";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
  /// Identifier missing, invalid, or not matching any live session
  UnknownRequest,
  /// Malformed method, URL, headers or packet shape
  InvalidRequest,
  /// The remote refused or failed a connection attempt
  ConnectionFailed,
  RequestTimeout,
  /// A declared or streamed size exceeds a configured maximum
  BodyTooLarge,
  Unknown,
}

impl ErrorCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorCode::UnknownRequest => "UNKNOWN_REQUEST",
      ErrorCode::InvalidRequest => "INVALID_REQUEST",
      ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
      ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
      ErrorCode::BodyTooLarge => "BODY_TOO_LARGE",
      ErrorCode::Unknown => "UNKNOWN",
    }
  }
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A failure that can be reported to the peer under one of the [`ErrorCode`]s
pub trait Reportable: std::error::Error {
  fn code(&self) -> ErrorCode;
}

/// Text sent to the peer for a fault; internal faults never expose their detail
pub fn public_message(code: ErrorCode, detail: &dyn std::fmt::Display) -> String {
  match code {
    ErrorCode::Unknown => GENERIC_UNKNOWN_MESSAGE.to_owned(),
    _ => detail.to_string(),
  }
}

/// Builds the error packet for a code, addressed to `id` or to the nil identifier
pub fn error_packet<P: Protocol>(
  id: Option<Identifier>,
  code: ErrorCode,
  detail: &dyn std::fmt::Display,
) -> P::Packet {
  let message = public_message(code, detail);
  P::error(id.unwrap_or_else(Identifier::nil), code, message)
}

/// Builds the error packet describing `fault`
pub fn report<P: Protocol, E: Reportable + ?Sized>(id: Option<Identifier>, fault: &E) -> P::Packet {
  let code = fault.code();
  match code {
    ErrorCode::Unknown => tracing::error!(error = %fault, "Reporting internal fault to peer"),
    _ => tracing::debug!(error = %fault, %code, "Reporting fault to peer"),
  }
  error_packet::<P>(id, code, &fault)
}
