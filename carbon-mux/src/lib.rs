// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Multiplexing engine for the Carbon and PSocket tunneling protocols
//!
//! One [`Dispatcher`] runs per transport connection on either end of a tunnel. It
//! interleaves any number of HTTP exchanges and WebSocket connections over that
//! connection, correlating them by [`Identifier`], enforcing the limits advertised in
//! [`ServerMeta`] and reporting failures with the protocols' closed set of error codes.
//! Moving the actual HTTP and WebSocket payload bytes is left to the application, which
//! only reports their progress back to the dispatcher.

pub mod common;
pub mod util;

pub use common::{
  dispatcher::{ConnectionError, DispatchError, Dispatcher, FailureOrigin, SessionEvent},
  meta::ServerMeta,
  protocol::{
    carbon::{Carbon, CarbonPacket},
    error::ErrorCode,
    id::Identifier,
    packet::{Protocol, Side},
    psocket::{PSocket, PSocketPacket},
  },
};
