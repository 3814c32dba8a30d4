// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames: a big-endian `u32` byte count followed by that many bytes
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame of {received} bytes exceeds the limit of {limit}")]
  MaxLengthExceeded { limit: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum JsonReadError {
  #[error("Failure reading JSON from frame: {0}")]
  Read(#[from] ReadError),
  #[error("Stream ended before a JSON frame arrived")]
  Ended,
  #[error("Failure deserializing JSON from frame: {0}")]
  Deserialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame of {0} bytes cannot be described by its length prefix")]
  Unrepresentable(usize),
  #[error("Frame write failure: {0:?}")]
  Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum JsonWriteError {
  #[error("Failure writing JSON into frame: {0}")]
  Write(#[from] WriteError),
  #[error("Failure serializing JSON for frame: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Checked before anything is written, so the stream is never left mid-frame
  #[error("Frame length exceeded expectation of {limit} bytes with {produced}")]
  MaxLengthExceeded { limit: usize, produced: usize },
}

/// Reads one frame, or `None` if the stream ended cleanly between frames.
///
/// A frame announcing more than `max_length` bytes is refused before its content is read.
pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Option<Vec<u8>>, ReadError> {
  let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
  let mut filled = 0;
  while filled < prefix.len() {
    let read = s
      .read(&mut prefix[filled..])
      .await
      .map_err(|error| ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error,
      })?;
    if read == 0 {
      if filled == 0 {
        return Ok(None);
      }
      return Err(ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error: std::io::ErrorKind::UnexpectedEof.into(),
      });
    }
    filled += read;
  }
  let length = u32::from_be_bytes(prefix) as usize;
  if let Some(limit) = max_length {
    if length > limit {
      return Err(ReadError::MaxLengthExceeded {
        limit,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(Some(buffer))
}

pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> Result<(), WriteError> {
  let length = u32::try_from(buffer.len()).map_err(|_| WriteError::Unrepresentable(buffer.len()))?;
  s.write_u32(length).await?;
  s.write_all(buffer).await?;
  Ok(s.flush().await?)
}

pub async fn read_framed_json<TStream: AsyncRead + Unpin, TOutput: serde::de::DeserializeOwned>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, JsonReadError> {
  let buffer = read_frame(s, max_length).await?.ok_or(JsonReadError::Ended)?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

/// Writes `value` as one JSON frame; `max_length` bounds the frame including its prefix
pub async fn write_framed_json<TStream: AsyncWrite + Unpin, TInput: serde::Serialize>(
  s: TStream,
  value: TInput,
  max_length: Option<usize>,
) -> Result<(), JsonWriteError> {
  let buffer = serde_json::to_vec(&value)?;
  if let Some(limit) = max_length {
    let produced = buffer.len() + LENGTH_PREFIX_SIZE;
    if produced > limit {
      return Err(JsonWriteError::MaxLengthExceeded { limit, produced });
    }
  }
  Ok(write_frame(s, &buffer).await?)
}
