// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Framing strategies carrying raw packets between the two ends of a tunnel
//!
//! A transport only moves opaque byte buffers in order; it never interprets them. The
//! dispatcher reads through a [`PacketSource`], which must refuse anything beyond the
//! `max_len` it is given before buffering it, and writes through a [`PacketSink`].

pub mod channel;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
  common::meta::ServerMeta,
  util::framed::{self, JsonReadError, JsonWriteError, ReadError, WriteError},
};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Packet of {received} bytes exceeds the transport limit of {limit}")]
  PacketTooLarge { limit: usize, received: usize },
  #[error("Transport closed")]
  Closed,
  #[error("Transport I/O failure: {0}")]
  Io(#[from] std::io::Error),
}

impl From<ReadError> for TransportError {
  fn from(e: ReadError) -> Self {
    match e {
      ReadError::MaxLengthExceeded { limit, received } => {
        TransportError::PacketTooLarge { limit, received }
      }
      ReadError::UnexpectedEnd { error, .. } => TransportError::Io(error),
    }
  }
}

impl From<WriteError> for TransportError {
  fn from(e: WriteError) -> Self {
    match e {
      WriteError::Unrepresentable(size) => TransportError::PacketTooLarge {
        limit: u32::MAX as usize,
        received: size,
      },
      WriteError::Io(error) => TransportError::Io(error),
    }
  }
}

pub trait PacketSource: Send {
  /// The next packet in arrival order, or `None` once the remote has finished cleanly
  fn next_packet(&mut self, max_len: usize)
    -> BoxFuture<'_, Result<Option<Vec<u8>>, TransportError>>;
}

pub trait PacketSink: Send {
  fn send_packet(&mut self, raw: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>>;

  /// Signals the remote that no more packets follow
  fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
}

impl<T: PacketSource + ?Sized> PacketSource for Box<T> {
  fn next_packet(
    &mut self,
    max_len: usize,
  ) -> BoxFuture<'_, Result<Option<Vec<u8>>, TransportError>> {
    (**self).next_packet(max_len)
  }
}

impl<T: PacketSink + ?Sized> PacketSink for Box<T> {
  fn send_packet(&mut self, raw: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
    (**self).send_packet(raw)
  }

  fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    (**self).close()
  }
}

/// Reads [length-prefixed frames](crate::util::framed) from a byte stream
#[derive(Debug)]
pub struct FramedSource<R> {
  reader: R,
}

impl<R> FramedSource<R> {
  pub fn new(reader: R) -> Self {
    Self { reader }
  }

  pub fn into_inner(self) -> R {
    self.reader
  }
}

impl<R: AsyncRead + Unpin + Send> PacketSource for FramedSource<R> {
  fn next_packet(
    &mut self,
    max_len: usize,
  ) -> BoxFuture<'_, Result<Option<Vec<u8>>, TransportError>> {
    async move { Ok(framed::read_frame(&mut self.reader, Some(max_len)).await?) }.boxed()
  }
}

/// Writes [length-prefixed frames](crate::util::framed) to a byte stream
#[derive(Debug)]
pub struct FramedSink<W> {
  writer: W,
}

impl<W> FramedSink<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl<W: AsyncWrite + Unpin + Send> PacketSink for FramedSink<W> {
  fn send_packet(&mut self, raw: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
    async move { Ok(framed::write_frame(&mut self.writer, &raw).await?) }.boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    async move { Ok(self.writer.shutdown().await?) }.boxed()
  }
}

/// Splits a bidirectional byte stream into a framed source and sink
pub fn split_framed<S: AsyncRead + AsyncWrite + Send>(
  stream: S,
) -> (
  FramedSource<tokio::io::ReadHalf<S>>,
  FramedSink<tokio::io::WriteHalf<S>>,
) {
  let (reader, writer) = tokio::io::split(stream);
  (FramedSource::new(reader), FramedSink::new(writer))
}

#[derive(thiserror::Error, Debug)]
pub enum MetaExchangeError {
  #[error("Failed to read server metadata: {0}")]
  Read(#[from] JsonReadError),
  #[error("Failed to write server metadata: {0}")]
  Write(#[from] JsonWriteError),
  #[error("Server metadata was rejected: {0}")]
  Invalid(#[from] crate::common::meta::MetaError),
}

/// Upper bound for the metadata frame, which precedes any negotiated packet size
pub const MAX_META_FRAME: usize = 64 * 1024;

/// Sends the server's metadata as the first frame of a connection
pub async fn send_meta<W: AsyncWrite + Unpin>(
  writer: W,
  meta: &ServerMeta,
) -> Result<(), MetaExchangeError> {
  Ok(framed::write_framed_json(writer, meta, Some(MAX_META_FRAME)).await?)
}

/// Receives and validates the server's metadata from the first frame of a connection
pub async fn receive_meta<R: AsyncRead + Unpin>(reader: R) -> Result<ServerMeta, MetaExchangeError> {
  let meta: ServerMeta = framed::read_framed_json(reader, Some(MAX_META_FRAME)).await?;
  meta.validate()?;
  Ok(meta)
}
