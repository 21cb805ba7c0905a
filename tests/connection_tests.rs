//! Integration tests for `Connection`.
//!
//! Uses the scripted `MockTransport` from `tests/common` to drive the
//! connection through negotiation, message delivery, reconnection and stop,
//! and checks the exact event sequence a subscriber observes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use persistent_connection::{
    Backoff, ClientTransport, Connection, ConnectionConfig, ConnectionError, ConnectionEvent,
    ConnectionState, MessageId, ReconnectPolicy, StartMode,
};

use tokio_test::{assert_err, assert_ok};

use common::{
    expect_quiet, expect_received, expect_state, frame, handshake, init_tracing, next_event,
    MockTransport, StartBehavior,
};

use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

/// Config with instant reconnects and short timeouts.
fn fast_config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_transport_connect_timeout(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_millis(200))
        .with_reconnect_policy(
            ReconnectPolicy::default()
                .with_backoff(Backoff::Fixed(Duration::ZERO))
                .with_window(Duration::from_secs(5))
                .with_attempt_timeout(Duration::from_millis(200)),
        )
}

fn connection(config: ConnectionConfig) -> Connection {
    init_tracing();
    Connection::builder("http://localhost:8080/echo")
        .config(config)
        .build()
}

/// Drain the two transitions of a successful start.
async fn expect_started(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>) {
    expect_state(rx, Disconnected, Connecting).await;
    expect_state(rx, Connecting, Connected).await;
}

// ════════════════════════════════════════════════════════════════════
// Start / negotiation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn fresh_start_emits_connecting_then_connected() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));

    assert_ok!(conn.start_with_transport(transport).await);

    expect_started(&mut events).await;
    expect_quiet(&mut events);
    assert_eq!(conn.state(), Connected);
    assert_eq!(conn.connection_id().as_deref(), Some("c1"));
    assert_eq!(log.starts()[0].0, StartMode::Connect);

    conn.stop().await;
}

#[tokio::test]
async fn start_on_started_connection_is_a_no_op() {
    let conn = connection(fast_config());
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);

    let mut events = conn.events();
    let (second, _second_server, second_log) = MockTransport::new("second");
    assert_ok!(conn.start_with_transport(second).await);

    assert_eq!(conn.state(), Connected);
    assert_eq!(log.starts().len(), 1);
    assert!(second_log.starts().is_empty());
    expect_quiet(&mut events);

    conn.stop().await;
}

#[tokio::test]
async fn handshake_payloads_arrive_after_connected() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(r#"{"ConnectionId":"c1","MessageId":"1","Messages":["welcome"]}"#);

    assert_ok!(conn.start_with_transport(transport).await);

    expect_started(&mut events).await;
    expect_received(&mut events, "welcome").await;
    assert_eq!(conn.message_id(), Some(MessageId::new(1)));

    conn.stop().await;
}

#[tokio::test]
async fn negotiation_falls_back_to_next_candidate() {
    let conn = connection(fast_config());
    let mut events = conn.events();

    let (broken, _broken_server, broken_log) = MockTransport::new("broken");
    let broken = broken.with_starts(vec![StartBehavior::Fail("refused".into())]);
    let (working, server, working_log) = MockTransport::new("working");
    server.frame(handshake("c2"));

    conn.start_with_transports(vec![Box::new(broken), Box::new(working)])
        .await
        .unwrap();

    expect_started(&mut events).await;
    assert_eq!(conn.connection_id().as_deref(), Some("c2"));
    assert_eq!(broken_log.starts().len(), 1);
    assert!(broken_log.stops() >= 1, "failed candidate must be stopped");
    assert_eq!(working_log.starts().len(), 1);

    conn.stop().await;
}

#[tokio::test]
async fn negotiation_skips_candidate_that_never_handshakes() {
    let conn = connection(fast_config());

    let (hanging, _hanging_server, _) = MockTransport::new("hanging");
    let hanging = hanging.with_starts(vec![StartBehavior::Hang]);
    let (silent, _silent_server, _) = MockTransport::new("silent");
    let (working, server, _) = MockTransport::new("working");
    server.frame(handshake("c3"));

    conn.start_with_transports(vec![Box::new(hanging), Box::new(silent), Box::new(working)])
        .await
        .unwrap();

    assert_eq!(conn.connection_id().as_deref(), Some("c3"));
    conn.stop().await;
}

#[tokio::test]
async fn negotiation_failure_settles_disconnected_without_closed() {
    let conn = connection(fast_config());
    let mut events = conn.events();

    let (a, _sa, _) = MockTransport::new("a");
    let a = a.with_fallback(StartBehavior::Fail("refused".into()));
    let (b, sb, _) = MockTransport::new("b");
    sb.frame(r#"{"Messages":["no id"]}"#);

    let err = conn
        .start_with_transports(vec![Box::new(a), Box::new(b)])
        .await
        .unwrap_err();

    match &err {
        ConnectionError::NegotiationFailed { attempts } => {
            assert_eq!(attempts.len(), 2);
            assert!(attempts[0].starts_with("a: "));
            assert!(attempts[1].starts_with("b: "));
        }
        other => panic!("expected NegotiationFailed, got {other:?}"),
    }

    expect_state(&mut events, Disconnected, Connecting).await;
    expect_state(&mut events, Connecting, Disconnected).await;
    match next_event(&mut events).await {
        ConnectionEvent::Error(e) => {
            assert!(matches!(*e, ConnectionError::NegotiationFailed { .. }));
        }
        other => panic!("expected Error, got {other:?}"),
    }
    expect_quiet(&mut events);
    assert_eq!(conn.state(), Disconnected);
}

#[tokio::test]
async fn start_with_no_candidates_fails_immediately() {
    let conn = connection(fast_config());
    let err = assert_err!(conn.start_with_transports(Vec::new()).await);
    assert!(matches!(err, ConnectionError::NoTransports));
}

// ════════════════════════════════════════════════════════════════════
// Receiving
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn three_token_frame_is_delivered_in_order() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame(frame(5, &["a", "b", "c"]));

    expect_received(&mut events, "a").await;
    expect_received(&mut events, "b").await;
    expect_received(&mut events, "c").await;
    assert_eq!(conn.message_id(), Some(MessageId::new(5)));

    conn.stop().await;
}

#[tokio::test]
async fn object_payloads_are_delivered_as_compact_json() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame(r#"{"MessageId":1,"Messages":[{"a": 1}, 2]}"#);

    expect_received(&mut events, r#"{"a":1}"#).await;
    expect_received(&mut events, "2").await;

    conn.stop().await;
}

#[tokio::test]
async fn malformed_frame_is_reported_and_connection_continues() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame("{not json");
    server.frame(frame(1, &["after"]));

    match next_event(&mut events).await {
        ConnectionEvent::Error(e) => assert!(matches!(*e, ConnectionError::Decode(_))),
        other => panic!("expected Error, got {other:?}"),
    }
    expect_received(&mut events, "after").await;
    assert_eq!(conn.state(), Connected);

    conn.stop().await;
}

#[tokio::test]
async fn message_id_never_moves_backwards() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame(frame(9, &["x"]));
    server.frame(frame(4, &["y"]));
    server.frame(frame(10, &["z"]));
    expect_received(&mut events, "x").await;
    expect_received(&mut events, "z").await;

    assert_eq!(conn.message_id(), Some(MessageId::new(10)));
    conn.stop().await;
}

#[tokio::test]
async fn replayed_frame_is_delivered_once() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame(frame(1, &["m1"]));
    server.frame(frame(1, &["m1"]));
    server.frame(frame(2, &["m2"]));
    expect_received(&mut events, "m1").await;
    expect_received(&mut events, "m2").await;
    expect_quiet(&mut events);

    conn.stop().await;
}

#[tokio::test]
async fn group_deltas_and_connection_id_are_applied() {
    let conn = connection(fast_config());
    conn.set_groups(["lobby"]);
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame(
        r#"{"ConnectionId":"other","Groups":{"Added":["room-1"],"Removed":["lobby"]},"Messages":["m"]}"#,
    );
    expect_received(&mut events, "m").await;

    assert_eq!(conn.connection_id().as_deref(), Some("c1"));
    assert_eq!(conn.groups(), vec!["room-1".to_string()]);
    assert_eq!(log.starts()[0].1.groups, vec!["lobby".to_string()]);

    conn.stop().await;
}

#[tokio::test]
async fn failing_handler_is_rerouted_to_error() {
    let conn = connection(fast_config());
    conn.on_received(|text| {
        if text == "bad" {
            Err("cannot handle".into())
        } else {
            Ok(())
        }
    });
    let errors = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    conn.on_error(move |e| {
        sink.lock().unwrap().push(e.to_string());
        Ok(())
    });
    let mut events = conn.events();

    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame(frame(1, &["bad", "good"]));
    // The failure is queued behind the payloads already waiting for delivery.
    expect_received(&mut events, "bad").await;
    expect_received(&mut events, "good").await;
    match next_event(&mut events).await {
        ConnectionEvent::Error(e) => assert!(matches!(*e, ConnectionError::Handler(_))),
        other => panic!("expected Error, got {other:?}"),
    }

    assert_eq!(
        *errors.lock().unwrap(),
        vec!["event handler failed: cannot handle".to_string()]
    );
    conn.stop().await;
}

// ════════════════════════════════════════════════════════════════════
// Sending
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn send_before_start_fails() {
    let conn = connection(fast_config());
    let err = assert_err!(conn.send("x").await);
    assert!(matches!(err, ConnectionError::NotConnected));
}

#[tokio::test]
async fn send_reaches_transport() {
    let conn = connection(fast_config());
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);

    conn.send("hello").await.unwrap();
    conn.send_json(&serde_json::json!({ "n": 1 })).await.unwrap();

    assert_eq!(log.sent(), vec!["hello".to_string(), r#"{"n":1}"#.to_string()]);
    conn.stop().await;
}

#[tokio::test]
async fn send_as_parses_the_response() {
    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Reply {
        n: u32,
    }

    let conn = connection(fast_config());
    let (transport, server, _log) = MockTransport::new("mock");
    let transport = transport.with_send_replies(vec![Ok(Some(r#"{"n":7}"#.into())), Ok(None)]);
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);

    let reply: Reply = conn.send_as("q").await.unwrap();
    assert_eq!(reply, Reply { n: 7 });

    let err = assert_err!(conn.send_as::<Reply>("q").await);
    assert!(matches!(err, ConnectionError::EmptyResponse));

    conn.stop().await;
}

#[tokio::test]
async fn failed_send_does_not_drop_the_connection() {
    let conn = connection(fast_config());
    let (transport, server, _log) = MockTransport::new("mock");
    let transport = transport.with_send_replies(vec![Err(ConnectionError::TransportSend(
        "broken pipe".into(),
    ))]);
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);

    let err = assert_err!(conn.send("x").await);
    assert!(matches!(err, ConnectionError::TransportSend(_)));
    assert_eq!(conn.state(), Connected);
    conn.send("y").await.unwrap();

    conn.stop().await;
}

#[tokio::test]
async fn sends_during_reconnect_go_out_after_reconnected() {
    let config = fast_config().with_reconnect_policy(
        ReconnectPolicy::default()
            .with_backoff(Backoff::Fixed(Duration::from_millis(100)))
            .with_window(Duration::from_secs(5)),
    );
    let conn = Arc::new(connection(config));
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.fail("reset by peer");
    expect_state(&mut events, Connected, Reconnecting).await;

    let sender = Arc::clone(&conn);
    let pending = tokio::spawn(async move { sender.send("queued").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(log.sent().is_empty());

    expect_state(&mut events, Reconnecting, Connected).await;
    pending.await.unwrap().unwrap();
    assert_eq!(log.sent(), vec!["queued".to_string()]);

    conn.stop().await;
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reconnect_emits_reconnected_right_after_state_change() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;
    server.frame(frame(3, &["before"]));
    expect_received(&mut events, "before").await;

    server.fail("reset by peer");

    expect_state(&mut events, Connected, Reconnecting).await;
    expect_state(&mut events, Reconnecting, Connected).await;
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Reconnected
    ));

    let starts = log.starts();
    assert_eq!(starts.len(), 2);
    let (mode, session) = &starts[1];
    assert_eq!(*mode, StartMode::Reconnect);
    assert_eq!(session.connection_id.as_deref(), Some("c1"));
    assert_eq!(session.message_id, Some(MessageId::new(3)));

    server.frame(frame(4, &["after"]));
    expect_received(&mut events, "after").await;

    conn.stop().await;
}

#[tokio::test]
async fn failing_state_handler_does_not_split_reconnected() {
    let conn = connection(fast_config());
    conn.on_state_changed(|change| {
        if change.old_state == Reconnecting && change.new_state == Connected {
            return Err("state handler failed".into());
        }
        Ok(())
    });
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.fail("reset");

    expect_state(&mut events, Connected, Reconnecting).await;
    expect_state(&mut events, Reconnecting, Connected).await;
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Reconnected
    ));
    match next_event(&mut events).await {
        ConnectionEvent::Error(e) => assert!(matches!(&*e, ConnectionError::Handler(_))),
        other => panic!("expected handler Error, got {other:?}"),
    }

    conn.stop().await;
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.close();

    expect_state(&mut events, Connected, Reconnecting).await;
    expect_state(&mut events, Reconnecting, Connected).await;
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Reconnected
    ));

    conn.stop().await;
}

#[tokio::test]
async fn reconnect_retries_until_a_start_succeeds() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    let transport = transport.with_starts(vec![
        StartBehavior::Succeed,
        StartBehavior::Fail("down".into()),
        StartBehavior::Hang,
        StartBehavior::Succeed,
    ]);
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.fail("reset");

    expect_state(&mut events, Connected, Reconnecting).await;
    expect_state(&mut events, Reconnecting, Connected).await;
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Reconnected
    ));
    assert_eq!(log.starts().len(), 4);

    conn.stop().await;
}

#[tokio::test]
async fn reconnect_exhaustion_closes_the_connection() {
    let config = fast_config().with_reconnect_policy(
        ReconnectPolicy::default()
            .with_backoff(Backoff::Fixed(Duration::from_millis(50)))
            .with_window(Duration::from_millis(300))
            .with_attempt_timeout(Duration::from_millis(100)),
    );
    let conn = connection(config);
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    let transport = transport
        .with_starts(vec![StartBehavior::Succeed])
        .with_fallback(StartBehavior::Fail("down".into()));
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.fail("reset");

    expect_state(&mut events, Connected, Reconnecting).await;
    match next_event(&mut events).await {
        ConnectionEvent::Error(e) => match &*e {
            ConnectionError::ReconnectExhausted { attempts, .. } => assert!(*attempts >= 1),
            other => panic!("expected ReconnectExhausted, got {other:?}"),
        },
        other => panic!("expected Error, got {other:?}"),
    }
    expect_state(&mut events, Reconnecting, Disconnected).await;
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed));

    assert_eq!(conn.state(), Disconnected);
    assert!(log.starts().len() >= 2);
    assert!(matches!(
        conn.send("x").await.unwrap_err(),
        ConnectionError::NotConnected
    ));

    conn.stop().await;
    expect_quiet(&mut events);
}

#[tokio::test]
async fn keep_alive_timeout_counts_as_loss() {
    let config = fast_config().with_keep_alive_timeout(Duration::from_millis(100));
    let conn = connection(config);
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    expect_state(&mut events, Connected, Reconnecting).await;
    expect_state(&mut events, Reconnecting, Connected).await;

    conn.stop().await;
}

// ════════════════════════════════════════════════════════════════════
// Stop
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stop_emits_closed_last_and_is_idempotent() {
    let conn = connection(fast_config());
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    conn.on_closed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    conn.stop().await;

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    expect_state(&mut events, Connected, Disconnected).await;
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed));
    assert_eq!(log.aborts(), 1);

    conn.stop().await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    expect_quiet(&mut events);

    // The transport is released, so nothing can arrive after Closed.
    assert!(server.is_closed());
}

#[tokio::test]
async fn concurrent_stops_emit_one_closed() {
    let conn = Arc::new(connection(fast_config()));
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    let (a, b) = (Arc::clone(&conn), Arc::clone(&conn));
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.stop().await }),
        tokio::spawn(async move { b.stop().await }),
    );
    ra.unwrap();
    rb.unwrap();

    expect_state(&mut events, Connected, Disconnected).await;
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed));
    expect_quiet(&mut events);
}

#[tokio::test]
async fn stop_during_reconnect_aborts_it() {
    let config = fast_config().with_reconnect_policy(
        ReconnectPolicy::default()
            .with_backoff(Backoff::Fixed(Duration::from_secs(10)))
            .with_window(Duration::from_secs(60)),
    );
    let conn = connection(config);
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.fail("reset");
    expect_state(&mut events, Connected, Reconnecting).await;

    tokio::time::timeout(Duration::from_secs(1), conn.stop())
        .await
        .expect("stop must not wait for the backoff");

    expect_state(&mut events, Reconnecting, Disconnected).await;
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed));
    expect_quiet(&mut events);
    assert_eq!(log.starts().len(), 1);
    assert_eq!(log.aborts(), 1);
}

#[tokio::test]
async fn stop_during_negotiation_fails_start_with_aborted() {
    let conn = Arc::new(connection(
        fast_config().with_transport_connect_timeout(Duration::from_secs(10)),
    ));
    let mut events = conn.events();
    let (transport, _server, _log) = MockTransport::new("mock");
    let transport = transport.with_starts(vec![StartBehavior::Hang]);

    let starter = Arc::clone(&conn);
    let start = tokio::spawn(async move { starter.start_with_transport(transport).await });
    expect_state(&mut events, Disconnected, Connecting).await;

    conn.stop().await;

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectionError::Aborted));
    expect_state(&mut events, Connecting, Disconnected).await;
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed));
    assert_eq!(conn.state(), Disconnected);
}

#[tokio::test]
async fn server_disconnect_flag_closes_like_stop() {
    let conn = connection(fast_config());
    let mut events = conn.events();
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.frame(r#"{"Messages":["bye"],"Disconnect":true}"#);

    expect_received(&mut events, "bye").await;
    expect_state(&mut events, Connected, Disconnected).await;
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed));
    assert_eq!(conn.state(), Disconnected);
    assert_eq!(log.starts().len(), 1);

    conn.stop().await;
    expect_quiet(&mut events);
}

// ════════════════════════════════════════════════════════════════════
// Session lifetime
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn restart_begins_a_new_session_but_keeps_groups() {
    let conn = connection(fast_config());
    let (first, server, _) = MockTransport::new("first");
    server.frame(r#"{"ConnectionId":"c1","MessageId":"8","Groups":{"Added":["g"]}}"#);
    assert_ok!(conn.start_with_transport(first).await);
    assert_eq!(conn.message_id(), Some(MessageId::new(8)));
    conn.stop().await;

    let (second, server, log) = MockTransport::new("second");
    server.frame(handshake("c2"));
    assert_ok!(conn.start_with_transport(second).await);

    let (_, session) = &log.starts()[0];
    assert_eq!(session.connection_id, None);
    assert_eq!(session.message_id, None);
    assert_eq!(session.groups, vec!["g".to_string()]);
    assert_eq!(conn.connection_id().as_deref(), Some("c2"));
    assert_eq!(conn.message_id(), None);

    conn.stop().await;
}

#[tokio::test]
async fn dropping_the_connection_stops_the_driver() {
    let conn = connection(fast_config());
    let (transport, server, log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);

    drop(conn);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The driver aborted the transport and released it on its way out.
    assert_eq!(log.aborts(), 1);
    assert!(server.is_closed());
}

#[tokio::test]
async fn custom_transport_name_is_reported_in_failures() {
    let conn = connection(fast_config());
    let (transport, _server, _) = MockTransport::new("custom");
    let transport = transport.with_fallback(StartBehavior::Fail("nope".into()));
    assert_eq!(transport.name(), "custom");

    let err = assert_err!(conn.start_with_transport(transport).await);
    assert!(err.to_string().contains("custom: "));
}

#[tokio::test]
async fn typed_callbacks_see_reconnect_and_close() {
    let conn = connection(fast_config());
    let reconnects = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reconnects);
    conn.on_reconnected(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let counter = Arc::clone(&closes);
    let closed_id = conn.on_closed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let mut events = conn.events();
    let (transport, server, _log) = MockTransport::new("mock");
    server.frame(handshake("c1"));
    assert_ok!(conn.start_with_transport(transport).await);
    expect_started(&mut events).await;

    server.fail("reset");
    expect_state(&mut events, Connected, Reconnecting).await;
    expect_state(&mut events, Reconnecting, Connected).await;
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Reconnected
    ));
    assert_eq!(reconnects.load(Ordering::SeqCst), 1);

    conn.stop().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    assert!(conn.unsubscribe(closed_id));
    assert!(!conn.unsubscribe(closed_id));
}
