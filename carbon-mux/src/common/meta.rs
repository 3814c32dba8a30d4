// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server metadata advertised to clients and shared by every session of a process
use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Describes the limits a server enforces and the implementation behind it.
///
/// Built once at startup and shared immutably (usually behind an `Arc`) with
/// every dispatcher, registry and accountant. Sizes are in bytes and
/// `request_timeout` is in milliseconds, as exchanged on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMeta {
  pub versions: Vec<u32>,
  pub request_timeout: u64,
  pub max_body_size: u64,
  pub max_message_size: u64,
  pub max_packet_size: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub maintainer: Option<Maintainer>,
  pub project: Project,
}

/// Contact information for reporting security issues to a server's operators
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
  pub email: String,
  pub website: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub website: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repository: Option<String>,
  pub version: String,
}

#[derive(thiserror::Error, Debug)]
pub enum MetaError {
  #[error("Failure deserializing server metadata: {0}")]
  Deserialization(#[from] serde_json::Error),
  #[error("Server metadata must advertise at least one protocol version")]
  NoVersions,
  #[error("Server metadata field {field} must be greater than zero")]
  ZeroLimit { field: &'static str },
}

impl Default for Project {
  fn default() -> Self {
    Self {
      name: env!("CARGO_PKG_NAME").to_owned(),
      description: Some(env!("CARGO_PKG_DESCRIPTION").to_owned()),
      email: None,
      website: None,
      repository: None,
      version: env!("CARGO_PKG_VERSION").to_owned(),
    }
  }
}

impl Default for ServerMeta {
  fn default() -> Self {
    Self {
      versions: vec![1],
      request_timeout: 30_000,
      max_body_size: 5_000_000,
      max_message_size: 1_000_000,
      max_packet_size: 64 * 1024,
      maintainer: None,
      project: Project::default(),
    }
  }
}

impl ServerMeta {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout)
  }

  pub fn supports_version(&self, version: u32) -> bool {
    self.versions.contains(&version)
  }

  pub fn validate(&self) -> Result<(), MetaError> {
    if self.versions.is_empty() {
      return Err(MetaError::NoVersions);
    }
    let limits = [
      ("requestTimeout", self.request_timeout),
      ("maxBodySize", self.max_body_size),
      ("maxMessageSize", self.max_message_size),
      ("maxPacketSize", self.max_packet_size),
    ];
    match limits.iter().find(|(_, value)| *value == 0) {
      Some((field, _)) => Err(MetaError::ZeroLimit { field: *field }),
      None => Ok(()),
    }
  }

  /// Parses and validates metadata from its JSON wire form
  pub fn from_json_slice(raw: &[u8]) -> Result<Self, MetaError> {
    let meta: ServerMeta = serde_json::from_slice(raw)?;
    meta.validate()?;
    Ok(meta)
  }

  pub fn to_json_vec(&self) -> Result<Vec<u8>, MetaError> {
    Ok(serde_json::to_vec(self)?)
  }

  /// Loads server metadata from a JSON file at startup
  pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
    let path = path.as_ref();
    let raw = std::fs::read(path)
      .with_context(|| format!("Reading server metadata from {}", path.display()))?;
    let meta = Self::from_json_slice(&raw)
      .with_context(|| format!("Parsing server metadata from {}", path.display()))?;
    tracing::debug!(path = %path.display(), versions = ?meta.versions, "Loaded server metadata");
    Ok(meta)
  }
}
