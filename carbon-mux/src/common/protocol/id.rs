// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{str::FromStr, sync::Arc};

use serde::{Deserializer, Serializer};

/// Number of hexadecimal characters in every [`Identifier`]
pub const IDENTIFIER_LENGTH: usize = 32;

/// A 32-character hexadecimal name for one logical request or connection.
///
/// Identifiers are chosen by the initiator of a session and reused by both ends
/// for every packet correlated with it. Cloning is cheap; the text is shared.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[repr(transparent)]
pub struct Identifier(Arc<str>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
  #[error("Identifier must be {IDENTIFIER_LENGTH} characters long, got {0}")]
  InvalidLength(usize),
  #[error("Identifier contains non-hexadecimal character {0:?}")]
  InvalidCharacter(char),
}

impl Identifier {
  /// Validates `raw`, normalizing it to lowercase so either case names the same session
  pub fn parse<T: AsRef<str>>(raw: T) -> Result<Identifier, IdentifierError> {
    let raw = raw.as_ref();
    if raw.len() != IDENTIFIER_LENGTH {
      return Err(IdentifierError::InvalidLength(raw.chars().count()));
    }
    if let Some(c) = raw.chars().find(|c| !c.is_ascii_hexdigit()) {
      return Err(IdentifierError::InvalidCharacter(c));
    }
    Ok(Identifier(raw.to_ascii_lowercase().into()))
  }

  /// Produces a fresh random identifier from a v4 UUID in its dashless form
  pub fn generate() -> Identifier {
    let mut buffer = uuid::Uuid::encode_buffer();
    let simple = uuid::Uuid::new_v4().simple().encode_lower(&mut buffer);
    Identifier((&*simple).into())
  }

  /// The all-zero identifier, addressing errors that belong to no session
  pub fn nil() -> Identifier {
    Identifier("0".repeat(IDENTIFIER_LENGTH).into())
  }

  pub fn is_nil(&self) -> bool {
    self.0.bytes().all(|b| b == b'0')
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl FromStr for Identifier {
  type Err = IdentifierError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Identifier::parse(s)
  }
}

impl TryFrom<String> for Identifier {
  type Error = IdentifierError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Identifier::parse(value)
  }
}

impl From<Identifier> for String {
  fn from(id: Identifier) -> Self {
    id.0.as_ref().to_owned()
  }
}

impl AsRef<str> for Identifier {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Identifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::fmt::Debug for Identifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Identifier").field(&&*self.0).finish()
  }
}

impl serde::Serialize for Identifier {
  fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> serde::de::Deserialize<'de> for Identifier {
  fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
  where
    D: Deserializer<'de>,
  {
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Identifier::parse(s).map_err(serde::de::Error::custom)
  }
}
