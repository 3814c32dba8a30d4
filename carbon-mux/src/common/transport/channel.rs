// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory transport connecting two dispatchers in the same process
use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{PacketSink, PacketSource, TransportError};

#[derive(Debug)]
pub struct ChannelSource {
  incoming: UnboundedReceiver<Vec<u8>>,
}

impl PacketSource for ChannelSource {
  fn next_packet(
    &mut self,
    max_len: usize,
  ) -> BoxFuture<'_, Result<Option<Vec<u8>>, TransportError>> {
    async move {
      match self.incoming.recv().await {
        Some(raw) if raw.len() > max_len => Err(TransportError::PacketTooLarge {
          limit: max_len,
          received: raw.len(),
        }),
        other => Ok(other),
      }
    }
    .boxed()
  }
}

#[derive(Debug)]
pub struct ChannelSink {
  outgoing: Option<UnboundedSender<Vec<u8>>>,
}

impl PacketSink for ChannelSink {
  fn send_packet(&mut self, raw: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
    let sent = match &self.outgoing {
      Some(outgoing) => outgoing.send(raw).map_err(|_| TransportError::Closed),
      None => Err(TransportError::Closed),
    };
    future::ready(sent).boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    self.outgoing.take();
    future::ready(Ok(())).boxed()
  }
}

/// One end of an in-memory transport
#[derive(Debug)]
pub struct ChannelEnd {
  pub source: ChannelSource,
  pub sink: ChannelSink,
}

impl ChannelEnd {
  pub fn split(self) -> (ChannelSource, ChannelSink) {
    (self.source, self.sink)
  }
}

/// Two entangled ends; packets sent on either end arrive at the other's source
#[derive(Debug)]
pub struct EntangledEnds {
  pub client: ChannelEnd,
  pub server: ChannelEnd,
}

pub fn channel() -> EntangledEnds {
  let (client_up, server_down) = mpsc::unbounded_channel();
  let (server_up, client_down) = mpsc::unbounded_channel();
  EntangledEnds {
    client: ChannelEnd {
      source: ChannelSource {
        incoming: client_down,
      },
      sink: ChannelSink {
        outgoing: Some(client_up),
      },
    },
    server: ChannelEnd {
      source: ChannelSource {
        incoming: server_down,
      },
      sink: ChannelSink {
        outgoing: Some(server_up),
      },
    },
  }
}

#[cfg(test)]
mod tests {
  use assert_matches::assert_matches;

  use super::channel;
  use crate::common::transport::{PacketSink, PacketSource, TransportError};

  #[tokio::test]
  async fn ends_are_entangled() {
    let ends = channel();
    let (mut client_source, mut client_sink) = ends.client.split();
    let (mut server_source, mut server_sink) = ends.server.split();
    client_sink.send_packet(b"ping".to_vec()).await.unwrap();
    server_sink.send_packet(b"pong".to_vec()).await.unwrap();
    assert_eq!(server_source.next_packet(8).await.unwrap(), Some(b"ping".to_vec()));
    assert_eq!(client_source.next_packet(8).await.unwrap(), Some(b"pong".to_vec()));

    client_sink.close().await.unwrap();
    assert_eq!(server_source.next_packet(8).await.unwrap(), None);
    assert_matches!(
      client_sink.send_packet(Vec::new()).await,
      Err(TransportError::Closed)
    );
  }

  #[tokio::test]
  async fn sources_enforce_their_limit() {
    let ends = channel();
    let (_, mut sink) = ends.client.split();
    let (mut source, _) = ends.server.split();
    sink.send_packet(vec![0; 9]).await.unwrap();
    assert_matches!(
      source.next_packet(8).await,
      Err(TransportError::PacketTooLarge {
        limit: 8,
        received: 9
      })
    );
  }
}
