// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire packets of the Carbon and PSocket tunneling protocols
//!
//! Both variants share one packet shape, `{ "id": ..., "type": ..., ... }`, with the
//! `type` tag selecting the kind. Every packet belongs to the session its identifier
//! names; sessions are started by `request` (and, for PSocket, `connect`) packets.

pub mod carbon;
pub mod error;
pub mod id;
pub mod packet;
pub mod psocket;
