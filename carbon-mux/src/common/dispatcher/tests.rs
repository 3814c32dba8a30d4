// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{collections::HashSet, sync::Arc, time::Duration};

use assert_matches::assert_matches;
use futures::StreamExt;
use serde_json::json;

use super::{
  event_stream, ConnectionError, DispatchError, Dispatcher, Events, FailureOrigin, Outbound,
  SessionEvent,
};
use crate::{
  common::{
    meta::ServerMeta,
    protocol::{
      carbon::{
        Carbon, CarbonClose, CarbonMessage, CarbonOpen, CarbonPacket, CarbonRequest,
        CarbonResponse,
      },
      error::{ErrorCode, GENERIC_UNKNOWN_MESSAGE},
      id::Identifier,
      packet::{DataType, Headers, Side},
      psocket::{PSocket, PSocketMessage, PSocketOpen, PSocketPacket, PSocketRequest},
    },
    session::{
      accountant::AccountingError, HttpState, SessionKind, SessionState, SocketState,
    },
    transport::channel::channel,
  },
  util::{cancellation::CancellationListener, test_logging},
};

fn meta() -> Arc<ServerMeta> {
  Arc::new(ServerMeta {
    request_timeout: 1_000,
    ..ServerMeta::default()
  })
}

fn carbon(side: Side) -> (Dispatcher<Carbon>, Outbound, Events<CarbonPacket>) {
  test_logging();
  Dispatcher::new(side, meta())
}

fn id(c: char) -> Identifier {
  Identifier::parse(c.to_string().repeat(32)).unwrap()
}

fn raw(value: serde_json::Value) -> Vec<u8> {
  serde_json::to_vec(&value).unwrap()
}

fn request(id: &Identifier, method: &str, url: &str, body: Option<u64>) -> Vec<u8> {
  let mut packet = json!({
    "id": id.as_str(),
    "type": "request",
    "method": method,
    "url": url,
    "headers": {},
  });
  if let Some(body) = body {
    packet["body"] = json!(body);
  }
  raw(packet)
}

fn sent<T: serde::de::DeserializeOwned>(outbound: &mut Outbound) -> T {
  let raw = outbound.try_recv().expect("a packet should have been queued");
  serde_json::from_slice(&raw).unwrap()
}

/// Asserts the next queued packet is an error and returns its identifier, code and message
fn sent_error(outbound: &mut Outbound) -> (Identifier, ErrorCode, String) {
  match sent::<CarbonPacket>(outbound) {
    CarbonPacket::Error(error) => (error.id, error.code, error.message),
    other => panic!("expected an error packet, got {:?}", other),
  }
}

fn response(id: &Identifier, body: Option<u64>) -> CarbonPacket {
  CarbonPacket::Response(CarbonResponse {
    id: id.clone(),
    status: 200,
    status_text: String::from("OK"),
    headers: Headers::new(),
    body,
  })
}

fn state(dispatcher: &Dispatcher<Carbon>, id: &Identifier) -> Option<SessionState> {
  dispatcher.session(id).map(|handle| handle.state)
}

#[tokio::test]
async fn exchange_without_bodies_completes() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('a');
  server
    .on_inbound_packet(&request(&id, "GET", "http://example.com", None))
    .unwrap();
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Initiated {
      kind: SessionKind::HttpExchange,
      packet: CarbonPacket::Request(CarbonRequest { method, .. }),
      ..
    }) if method == "GET"
  );
  assert_eq!(
    state(&server, &id),
    Some(SessionState::Http(HttpState::Dispatched))
  );

  server.emit_outbound(response(&id, None)).unwrap();
  assert_matches!(sent::<CarbonPacket>(&mut outbound), CarbonPacket::Response(r) if r.status == 200);
  assert_eq!(server.live_sessions(), 0);
}

#[tokio::test]
async fn unsupported_methods_never_create_sessions() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('a');
  server
    .on_inbound_packet(&request(&id, "FOO", "http://example.com", None))
    .unwrap();
  let (error_id, code, _) = sent_error(&mut outbound);
  assert_eq!((error_id, code), (id, ErrorCode::InvalidRequest));
  assert_eq!(server.live_sessions(), 0);
  assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn messages_for_unknown_connections_are_unknown_requests() {
  test_logging();
  let (server, mut outbound, _events) = Dispatcher::<PSocket>::new(Side::Server, meta());
  let unknown = Identifier::generate();
  server
    .on_inbound_packet(&raw(json!({
      "id": unknown.as_str(),
      "type": "message",
      "data": 10,
      "dataType": "text",
    })))
    .unwrap();
  match sent::<PSocketPacket>(&mut outbound) {
    PSocketPacket::Error(error) => {
      assert_eq!(error.id, unknown);
      assert_eq!(error.code, ErrorCode::UnknownRequest);
    }
    other => panic!("expected an error packet, got {:?}", other),
  }
}

#[tokio::test]
async fn oversized_declarations_are_refused_before_any_bytes() {
  let (server, mut outbound, _events) = carbon(Side::Server);
  let id = id('b');
  server
    .on_inbound_packet(&request(&id, "POST", "http://example.com", Some(5_000_001)))
    .unwrap();
  let (error_id, code, _) = sent_error(&mut outbound);
  assert_eq!((error_id, code), (id.clone(), ErrorCode::BodyTooLarge));
  assert!(server.session(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn idle_socket_connections_time_out_once() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('c');
  server
    .on_inbound_packet(&request(&id, "GET", "wss://example.com/chat", None))
    .unwrap();
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Initiated {
      kind: SessionKind::SocketConnection,
      ..
    })
  );
  server
    .emit_outbound(CarbonPacket::Open(CarbonOpen {
      id: id.clone(),
      headers: Headers::new(),
    }))
    .unwrap();
  assert_matches!(sent::<CarbonPacket>(&mut outbound), CarbonPacket::Open(_));

  tokio::time::sleep(Duration::from_millis(2_500)).await;
  let (error_id, code, _) = sent_error(&mut outbound);
  assert_eq!((error_id, code), (id.clone(), ErrorCode::RequestTimeout));
  assert!(outbound.try_recv().is_none());
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Failed {
      code: ErrorCode::RequestTimeout,
      origin: FailureOrigin::Local,
      ..
    })
  );
  assert!(events.try_recv().is_err());
  assert_eq!(server.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn completion_within_the_timeout_is_never_timed_out() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('d');
  server
    .on_inbound_packet(&request(&id, "GET", "https://example.com", None))
    .unwrap();
  tokio::time::sleep(Duration::from_millis(990)).await;
  server.emit_outbound(response(&id, None)).unwrap();
  tokio::time::sleep(Duration::from_millis(2_000)).await;

  assert_matches!(sent::<CarbonPacket>(&mut outbound), CarbonPacket::Response(_));
  assert!(outbound.try_recv().is_none());
  assert_matches!(events.try_recv(), Ok(SessionEvent::Initiated { .. }));
  assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_identifiers_leave_the_first_session_alone() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('e');
  server
    .on_inbound_packet(&request(&id, "POST", "http://example.com", Some(10)))
    .unwrap();
  server
    .on_inbound_packet(&request(&id, "GET", "http://example.com", None))
    .unwrap();
  let (_, code, _) = sent_error(&mut outbound);
  assert_eq!(code, ErrorCode::UnknownRequest);
  assert_eq!(
    state(&server, &id),
    Some(SessionState::Http(HttpState::AwaitingRequestBody))
  );
  assert_matches!(events.try_recv(), Ok(SessionEvent::Initiated { .. }));
  assert!(events.try_recv().is_err());
  assert_eq!(server.record_transfer(&id, 10).unwrap().received, 10);
  assert_eq!(
    state(&server, &id),
    Some(SessionState::Http(HttpState::Dispatched))
  );
}

#[tokio::test]
async fn closing_is_idempotent() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('f');
  server
    .on_inbound_packet(&request(&id, "GET", "ws://example.com", None))
    .unwrap();
  let close = raw(json!({ "id": id.as_str(), "type": "close", "code": 1000, "reason": "bye" }));
  server.on_inbound_packet(&close).unwrap();
  server.on_inbound_packet(&close).unwrap();
  let stranger = raw(json!({
    "id": Identifier::generate().as_str(),
    "type": "close",
    "code": 1001,
    "reason": "",
  }));
  server.on_inbound_packet(&stranger).unwrap();

  assert_matches!(events.try_recv(), Ok(SessionEvent::Initiated { .. }));
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Closed { code: 1000, reason, .. }) if reason == "bye"
  );
  assert!(events.try_recv().is_err());
  assert!(outbound.try_recv().is_none());
  assert_eq!(server.live_sessions(), 0);
}

#[tokio::test]
async fn overflowing_a_declared_body_fails_the_session() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('1');
  server
    .on_inbound_packet(&request(&id, "PUT", "http://example.com", Some(10)))
    .unwrap();
  let progress = server.record_transfer(&id, 4).unwrap();
  assert_eq!((progress.received, progress.declared), (4, 10));
  assert_matches!(
    server.record_transfer(&id, 7),
    Err(DispatchError::Accounting(AccountingError::Overflow { .. }))
  );
  let (error_id, code, _) = sent_error(&mut outbound);
  assert_eq!((error_id, code), (id.clone(), ErrorCode::BodyTooLarge));
  assert_eq!(server.live_sessions(), 0);

  assert_matches!(events.try_recv(), Ok(SessionEvent::Initiated { .. }));
  assert_matches!(events.try_recv(), Ok(SessionEvent::Progress { .. }));
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Failed {
      code: ErrorCode::BodyTooLarge,
      origin: FailureOrigin::Local,
      ..
    })
  );
  assert_matches!(
    server.record_transfer(&id, 1),
    Err(DispatchError::Accounting(AccountingError::NotDeclared(_)))
  );
}

#[tokio::test]
async fn clients_track_response_bodies() {
  let (client, mut outbound, mut events) = carbon(Side::Client);
  let id = Identifier::generate();
  client
    .emit_outbound(CarbonPacket::Request(CarbonRequest {
      id: id.clone(),
      method: String::from("GET"),
      url: String::from("https://example.com/file"),
      headers: Headers::new(),
      body: None,
    }))
    .unwrap();
  assert_matches!(sent::<CarbonPacket>(&mut outbound), CarbonPacket::Request(_));

  client
    .on_inbound_packet(&serde_json::to_vec(&response(&id, Some(5))).unwrap())
    .unwrap();
  assert_matches!(events.try_recv(), Ok(SessionEvent::Replied { .. }));
  assert_eq!(
    state(&client, &id),
    Some(SessionState::Http(HttpState::AwaitingResponseBody))
  );
  client.record_transfer(&id, 2).unwrap();
  assert!(client.record_transfer(&id, 3).unwrap().is_complete());
  assert_eq!(client.live_sessions(), 0);
}

#[tokio::test]
async fn each_side_accepts_only_what_its_peer_originates() {
  let (server, mut outbound, _events) = carbon(Side::Server);
  let id = id('2');
  server
    .on_inbound_packet(&serde_json::to_vec(&response(&id, None)).unwrap())
    .unwrap();
  let (_, code, _) = sent_error(&mut outbound);
  assert_eq!(code, ErrorCode::InvalidRequest);

  let outgoing = CarbonPacket::Request(CarbonRequest {
    id,
    method: String::from("GET"),
    url: String::from("http://example.com"),
    headers: Headers::new(),
    body: None,
  });
  assert_matches!(
    server.emit_outbound(outgoing),
    Err(DispatchError::Unexpected {
      side: Side::Client,
      ..
    })
  );
  assert!(outbound.try_recv().is_none());
}

#[tokio::test]
async fn unattributable_packets_close_the_connection() {
  let (server, mut outbound, _events) = carbon(Side::Server);
  assert_matches!(
    server.on_inbound_packet(b"not json"),
    Err(ConnectionError::Unattributable(_))
  );
  let (error_id, code, message) = sent_error(&mut outbound);
  assert!(error_id.is_nil());
  assert_eq!(code, ErrorCode::Unknown);
  assert_eq!(message, GENERIC_UNKNOWN_MESSAGE);

  let oversized = vec![b' '; 64 * 1024 + 1];
  assert_matches!(
    server.on_inbound_packet(&oversized),
    Err(ConnectionError::PacketTooLarge { .. })
  );
  let (error_id, code, _) = sent_error(&mut outbound);
  assert!(error_id.is_nil());
  assert_eq!(code, ErrorCode::BodyTooLarge);
}

#[tokio::test]
async fn remote_errors_fail_known_sessions_only() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('3');
  server
    .on_inbound_packet(&request(&id, "GET", "http://example.com", None))
    .unwrap();
  let error = |id: &Identifier| {
    raw(json!({ "id": id.as_str(), "type": "error", "code": "UNKNOWN", "message": "gone" }))
  };
  server.on_inbound_packet(&error(&id)).unwrap();
  server.on_inbound_packet(&error(&id)).unwrap();

  assert_matches!(events.try_recv(), Ok(SessionEvent::Initiated { .. }));
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Failed {
      origin: FailureOrigin::Remote,
      ..
    })
  );
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::RemoteError { message, .. }) if message == "gone"
  );
  assert!(outbound.try_recv().is_none());
}

#[tokio::test]
async fn connection_failures_are_reported_to_the_peer() {
  let (server, mut outbound, _events) = carbon(Side::Server);
  let id = id('4');
  server
    .on_inbound_packet(&request(&id, "GET", "wss://unreachable.example", None))
    .unwrap();
  server
    .report_failure(&id, ErrorCode::ConnectionFailed, "connection refused")
    .unwrap();
  let (error_id, code, message) = sent_error(&mut outbound);
  assert_eq!(error_id, id);
  assert_eq!(code, ErrorCode::ConnectionFailed);
  assert_eq!(message, "connection refused");
  assert_eq!(server.live_sessions(), 0);
}

#[tokio::test]
async fn socket_messages_are_accounted_one_at_a_time() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let connection = id('5');
  server
    .on_inbound_packet(&request(&connection, "GET", "ws://example.com", None))
    .unwrap();
  server
    .emit_outbound(CarbonPacket::Open(CarbonOpen {
      id: connection.clone(),
      headers: Headers::new(),
    }))
    .unwrap();
  let message = |data: u64| {
    raw(json!({
      "id": Identifier::generate().as_str(),
      "type": "message",
      "connection": connection.as_str(),
      "data": data,
      "dataType": "binary",
    }))
  };
  server.on_inbound_packet(&message(10)).unwrap();
  assert_eq!(
    state(&server, &connection),
    Some(SessionState::Socket(SocketState::PendingMessage))
  );
  server.on_inbound_packet(&message(3)).unwrap();
  assert_matches!(sent::<CarbonPacket>(&mut outbound), CarbonPacket::Open(_));
  let (error_id, code, _) = sent_error(&mut outbound);
  assert_eq!((error_id, code), (connection.clone(), ErrorCode::UnknownRequest));

  server.record_transfer(&connection, 10).unwrap();
  assert_eq!(
    state(&server, &connection),
    Some(SessionState::Socket(SocketState::Active))
  );

  server.on_inbound_packet(&message(1_000_001)).unwrap();
  let (error_id, code, _) = sent_error(&mut outbound);
  assert_eq!((error_id, code), (connection.clone(), ErrorCode::BodyTooLarge));
  assert_eq!(server.live_sessions(), 0);

  let events: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
  assert_matches!(
    events.as_slice(),
    [
      SessionEvent::Initiated { .. },
      SessionEvent::Message { .. },
      SessionEvent::Progress { .. },
      SessionEvent::Failed {
        code: ErrorCode::BodyTooLarge,
        ..
      },
    ]
  );
}

#[tokio::test]
async fn dispatchers_converse_over_a_transport() {
  test_logging();
  let ends = channel();
  let (client_source, client_sink) = ends.client.split();
  let (server_source, server_sink) = ends.server.split();
  let (client, client_outbound, client_events) = Dispatcher::<Carbon>::new(Side::Client, meta());
  let (server, server_outbound, server_events) = Dispatcher::<Carbon>::new(Side::Server, meta());
  let (mut client_events, mut server_events) =
    (event_stream(client_events), event_stream(server_events));
  let client_task = client.run(
    client_source,
    client_sink,
    client_outbound,
    CancellationListener::default(),
  );
  let server_task = server.run(
    server_source,
    server_sink,
    server_outbound,
    CancellationListener::default(),
  );

  let exchange = Identifier::generate();
  client
    .emit_outbound(CarbonPacket::Request(CarbonRequest {
      id: exchange.clone(),
      method: String::from("GET"),
      url: String::from("http://example.com"),
      headers: Headers::new(),
      body: None,
    }))
    .unwrap();
  assert_matches!(
    server_events.next().await,
    Some(SessionEvent::Initiated { id, .. }) if id == exchange
  );
  server.emit_outbound(response(&exchange, None)).unwrap();
  assert_matches!(
    client_events.next().await,
    Some(SessionEvent::Replied { id, .. }) if id == exchange
  );
  assert_eq!(client.live_sessions(), 0);
  assert_eq!(server.live_sessions(), 0);

  let socket = Identifier::generate();
  client
    .emit_outbound(CarbonPacket::Request(CarbonRequest {
      id: socket.clone(),
      method: String::from("GET"),
      url: String::from("ws://example.com"),
      headers: Headers::new(),
      body: None,
    }))
    .unwrap();
  assert_matches!(server_events.next().await, Some(SessionEvent::Initiated { .. }));

  client.close();
  assert_matches!(client_task.await.unwrap(), Ok(()));
  assert_matches!(server_task.await.unwrap(), Ok(()));
  assert!(server.is_closed());
  for events in [&mut client_events, &mut server_events] {
    assert_matches!(
      events.next().await,
      Some(SessionEvent::Failed {
        origin: FailureOrigin::Connection,
        id,
        ..
      }) if id == socket
    );
  }
  assert_matches!(
    client.report_failure(&socket, ErrorCode::Unknown, "late"),
    Err(DispatchError::ConnectionClosed)
  );
}

#[tokio::test(start_paused = true)]
async fn exchanges_time_out_from_creation_despite_activity() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('6');
  server
    .on_inbound_packet(&request(&id, "POST", "http://example.com", Some(10)))
    .unwrap();
  tokio::time::sleep(Duration::from_millis(900)).await;
  server.record_transfer(&id, 10).unwrap();
  assert_eq!(
    state(&server, &id),
    Some(SessionState::Http(HttpState::Dispatched))
  );

  tokio::time::sleep(Duration::from_millis(600)).await;
  let (error_id, code, _) = sent_error(&mut outbound);
  assert_eq!((error_id, code), (id.clone(), ErrorCode::RequestTimeout));
  assert_eq!(server.live_sessions(), 0);
  assert_matches!(
    server.emit_outbound(response(&id, None)),
    Err(DispatchError::Registry(_))
  );
  assert!(outbound.try_recv().is_none());

  let events: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
  assert_matches!(
    events.as_slice(),
    [
      SessionEvent::Initiated { .. },
      SessionEvent::Progress { .. },
      SessionEvent::Failed {
        code: ErrorCode::RequestTimeout,
        ..
      },
    ]
  );
}

#[tokio::test]
async fn overflows_are_reported_only_by_the_path_that_claims_the_session() {
  let (server, mut outbound, mut events) = carbon(Side::Server);
  let id = id('7');
  server
    .on_inbound_packet(&request(&id, "PUT", "http://example.com", Some(10)))
    .unwrap();
  server.record_transfer(&id, 4).unwrap();
  // Another path (here standing in for the deadline) has already claimed the session
  server.shared.registry.release(&id).unwrap();
  assert_matches!(
    server.record_transfer(&id, 7),
    Err(DispatchError::Accounting(AccountingError::Overflow { .. }))
  );
  assert!(outbound.try_recv().is_none());

  let released = Identifier::generate();
  server
    .on_inbound_packet(&raw(json!({
      "id": Identifier::generate().as_str(),
      "type": "message",
      "connection": released.as_str(),
      "data": 1_000_001,
      "dataType": "binary",
    })))
    .unwrap();
  assert!(outbound.try_recv().is_none());

  assert_matches!(events.try_recv(), Ok(SessionEvent::Initiated { .. }));
  assert_matches!(events.try_recv(), Ok(SessionEvent::Progress { .. }));
  assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn psocket_connections_run_their_lifecycle() {
  test_logging();
  let (server, mut outbound, mut events) = Dispatcher::<PSocket>::new(Side::Server, meta());
  let connection = Identifier::generate();
  server
    .on_inbound_packet(&raw(json!({
      "id": connection.as_str(),
      "type": "connect",
      "url": "wss://example.com/feed",
      "protocols": ["chat"],
      "headers": {},
    })))
    .unwrap();
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Initiated {
      kind: SessionKind::SocketConnection,
      packet: PSocketPacket::Connect(connect),
      ..
    }) if connect.protocols == ["chat"]
  );

  server
    .emit_outbound(PSocketPacket::Open(PSocketOpen {
      id: connection.clone(),
      url: String::from("wss://example.com/feed"),
      protocol: String::from("chat"),
      headers: Headers::new(),
    }))
    .unwrap();
  assert_matches!(sent::<PSocketPacket>(&mut outbound), PSocketPacket::Open(open) if open.protocol == "chat");

  server
    .on_inbound_packet(&raw(json!({
      "id": connection.as_str(),
      "type": "message",
      "data": 4,
      "dataType": "text",
    })))
    .unwrap();
  assert_matches!(events.try_recv(), Ok(SessionEvent::Message { .. }));
  assert_eq!(
    server.session(&connection).map(|handle| handle.state),
    Some(SessionState::Socket(SocketState::PendingMessage))
  );
  assert!(server.record_transfer(&connection, 4).unwrap().is_complete());
  assert_matches!(events.try_recv(), Ok(SessionEvent::Progress { .. }));

  server
    .emit_outbound(PSocketPacket::Message(PSocketMessage {
      id: connection.clone(),
      data: 0,
      data_type: DataType::Binary,
    }))
    .unwrap();
  assert_matches!(sent::<PSocketPacket>(&mut outbound), PSocketPacket::Message(_));

  server
    .on_inbound_packet(&raw(json!({
      "id": connection.as_str(),
      "type": "close",
      "code": 1000,
      "reason": "done",
    })))
    .unwrap();
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Closed { code: 1000, .. })
  );
  assert_eq!(server.live_sessions(), 0);
  assert!(outbound.try_recv().is_none());
}

#[tokio::test]
async fn psocket_responses_carry_their_final_url() {
  test_logging();
  let (client, mut outbound, mut events) = Dispatcher::<PSocket>::new(Side::Client, meta());
  let id = Identifier::generate();
  client
    .emit_outbound(PSocketPacket::Request(PSocketRequest {
      id: id.clone(),
      method: String::from("GET"),
      url: String::from("http://example.com/old"),
      headers: Headers::new(),
      body: None,
    }))
    .unwrap();
  assert_matches!(sent::<PSocketPacket>(&mut outbound), PSocketPacket::Request(_));

  client
    .on_inbound_packet(&raw(json!({
      "id": id.as_str(),
      "type": "response",
      "status": 200,
      "statusText": "OK",
      "url": "https://example.com/new",
      "headers": {},
    })))
    .unwrap();
  assert_matches!(
    events.try_recv(),
    Ok(SessionEvent::Replied {
      packet: PSocketPacket::Response(response),
      ..
    }) if response.url == "https://example.com/new"
  );
  assert_eq!(client.live_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emission_keeps_per_session_order() {
  let (server, mut outbound, _events) = carbon(Side::Server);
  let connections: Vec<_> = (0..64).map(|_| Identifier::generate()).collect();
  for connection in &connections {
    server
      .on_inbound_packet(&request(connection, "GET", "ws://example.com", None))
      .unwrap();
    server
      .emit_outbound(CarbonPacket::Open(CarbonOpen {
        id: connection.clone(),
        headers: Headers::new(),
      }))
      .unwrap();
  }
  let tasks: Vec<_> = connections
    .iter()
    .flat_map(|connection| {
      let message = CarbonPacket::Message(CarbonMessage {
        id: Identifier::generate(),
        connection: connection.clone(),
        data: 0,
        data_type: DataType::Text,
      });
      let close = CarbonPacket::Close(CarbonClose {
        id: connection.clone(),
        code: 1000,
        reason: String::new(),
      });
      [message, close].map(|packet| {
        let server = server.clone();
        tokio::spawn(async move { server.emit_outbound(packet).is_ok() })
      })
    })
    .collect();
  futures::future::join_all(tasks).await;

  let mut closed = HashSet::new();
  while let Some(raw) = outbound.try_recv() {
    match serde_json::from_slice::<CarbonPacket>(&raw).unwrap() {
      CarbonPacket::Message(message) => assert!(
        !closed.contains(&message.connection),
        "message for {} queued after its close",
        message.connection
      ),
      CarbonPacket::Close(close) => {
        closed.insert(close.id);
      }
      _ => {}
    }
  }
  assert_eq!(closed.len(), connections.len());
  assert_eq!(server.live_sessions(), 0);
}

