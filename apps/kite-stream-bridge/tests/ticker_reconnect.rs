//! Ticker Integration Tests
//!
//! Drives the ticker state machine against a scripted feed: subscription
//! replay on (re)connect, reconciliation while live, tick stamping,
//! malformed frame handling, staleness and reconnect backoff.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kite_stream_bridge::infrastructure::kite::StaticAccessToken;
use kite_stream_bridge::{
    BroadcastHub, ConnectionState, ControlMessage, Credentials, FeedSession, FeedTransport,
    InboundFrame, InstrumentToken, OutboundFrame, SubscriptionMode, SubscriptionRegistry, Ticker,
    TickerConfig, TransportError, WebSocketSettings,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{
    ServerSide, SessionFactory, WAIT, command_tokens, fast_websocket_settings, frame, ltp_packet,
    mode_command, quote_packet, scripted_transport, wait_for_state, wait_until,
};

struct Harness {
    registry: Arc<SubscriptionRegistry>,
    hub: Arc<BroadcastHub>,
    sessions: SessionFactory,
    transport: Arc<common::ScriptedTransport>,
    ticker: Option<Ticker>,
    cancel: CancellationToken,
}

fn harness(seed: &[(u32, SubscriptionMode)]) -> Harness {
    harness_with(&fast_websocket_settings(), seed)
}

fn harness_with(settings: &WebSocketSettings, seed: &[(u32, SubscriptionMode)]) -> Harness {
    let registry = Arc::new(SubscriptionRegistry::new(100));
    for (token, mode) in seed {
        registry.subscribe(InstrumentToken::new(*token), *mode).unwrap();
    }
    let hub = Arc::new(BroadcastHub::with_defaults());
    let (transport, sessions) = scripted_transport();
    let cancel = CancellationToken::new();
    let ticker = Ticker::new(
        TickerConfig::from_websocket_settings(settings),
        transport.clone(),
        Arc::new(StaticAccessToken::new(Credentials::new(
            "key".into(),
            "token".into(),
        ))),
        Arc::clone(&registry),
        Arc::clone(&hub),
        cancel.clone(),
    );

    Harness {
        registry,
        hub,
        sessions,
        transport,
        ticker: Some(ticker),
        cancel,
    }
}

/// Read a full replay of `count` commands.
async fn expect_replay(server: &mut ServerSide, count: usize) -> Vec<serde_json::Value> {
    let commands = server.commands(count).await;
    assert_eq!(
        commands.iter().filter(|c| c["a"] == "subscribe").count(),
        1,
        "one subscribe per replay: {commands:?}"
    );
    assert!(commands.iter().all(|c| c["a"] != "unsubscribe"));
    commands
}

#[tokio::test]
async fn reconnect_replays_registry_once_before_live() {
    let mut h = harness(&[(101, SubscriptionMode::Full), (102, SubscriptionMode::Ltp)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();

    let mut first = h.sessions.open();
    let task = tokio::spawn(ticker.run());

    first.accept();
    let commands = expect_replay(&mut first, 3).await;
    assert_eq!(command_tokens(&commands[0]), vec![101, 102]);
    assert_eq!(
        command_tokens(mode_command(&commands, "full").unwrap()),
        vec![101]
    );
    assert_eq!(
        command_tokens(mode_command(&commands, "ltp").unwrap()),
        vec![102]
    );
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    // Drop the connection from the server side.
    drop(first);
    let reconnecting = wait_until(&mut snapshots, |s| s.reconnects >= 1).await;
    assert_eq!(reconnecting.reconnects, 1);
    assert!(reconnecting.last_error.is_some());

    let mut second = h.sessions.open();
    second.accept();
    let commands = expect_replay(&mut second, 3).await;
    assert_eq!(command_tokens(&commands[0]), vec![101, 102]);
    wait_for_state(&mut snapshots, ConnectionState::Live).await;
    second.assert_no_command(Duration::from_millis(100)).await;
    assert_eq!(h.transport.connects(), 2);

    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(snapshots.borrow().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn mutations_while_reconnecting_replay_final_snapshot() {
    let mut h = harness(&[(101, SubscriptionMode::Full), (102, SubscriptionMode::Ltp)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();

    let mut first = h.sessions.open();
    let task = tokio::spawn(ticker.run());
    first.accept();
    expect_replay(&mut first, 3).await;
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    drop(first);
    wait_until(&mut snapshots, |s| s.reconnects >= 1).await;

    // Several edits land while no session is up.
    h.registry
        .subscribe(InstrumentToken::new(103), SubscriptionMode::Ltp)
        .unwrap();
    h.registry.unsubscribe(InstrumentToken::new(102));
    h.registry
        .change_mode(InstrumentToken::new(101), SubscriptionMode::Quote)
        .unwrap();
    h.registry
        .subscribe(InstrumentToken::new(104), SubscriptionMode::Quote)
        .unwrap();
    h.registry.unsubscribe(InstrumentToken::new(104));

    let mut second = h.sessions.open();
    second.accept();
    let commands = expect_replay(&mut second, 3).await;
    assert_eq!(command_tokens(&commands[0]), vec![101, 103]);
    assert_eq!(
        command_tokens(mode_command(&commands, "quote").unwrap()),
        vec![101]
    );
    assert_eq!(
        command_tokens(mode_command(&commands, "ltp").unwrap()),
        vec![103]
    );
    assert!(mode_command(&commands, "full").is_none());

    wait_for_state(&mut snapshots, ConnectionState::Live).await;
    second.assert_no_command(Duration::from_millis(100)).await;

    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn live_mutations_send_only_the_diff() {
    let mut h = harness(&[(101, SubscriptionMode::Quote)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();

    let mut server = h.sessions.open();
    let task = tokio::spawn(ticker.run());
    server.accept();
    expect_replay(&mut server, 2).await;
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    h.registry.unsubscribe(InstrumentToken::new(101));
    let unsubscribe = server.next_command().await;
    assert_eq!(unsubscribe["a"], "unsubscribe");
    assert_eq!(command_tokens(&unsubscribe), vec![101]);

    h.registry
        .subscribe(InstrumentToken::new(202), SubscriptionMode::Full)
        .unwrap();
    let commands = server.commands(2).await;
    assert_eq!(commands[0]["a"], "subscribe");
    assert_eq!(command_tokens(&commands[0]), vec![202]);
    assert_eq!(
        command_tokens(mode_command(&commands, "full").unwrap()),
        vec![202]
    );

    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn ticks_are_stamped_in_wire_order() {
    let mut h = harness(&[(256_265, SubscriptionMode::Quote)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();
    let sequence = ticker.sequence();
    let mut ticks = h.hub.ticks_rx("test");

    let mut server = h.sessions.open();
    let task = tokio::spawn(ticker.run());
    server.accept();
    expect_replay(&mut server, 2).await;
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    server.send_binary(frame(&[
        ltp_packet(256_265, 2_450_010),
        quote_packet(408_065, 150_025),
    ]));
    server.send_binary(frame(&[ltp_packet(256_265, 2_450_100)]));

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(WAIT, ticks.recv())
            .await
            .unwrap()
            .unwrap();
        received.push((event.sequence, event.token().get()));
    }
    assert_eq!(received, vec![(1, 256_265), (2, 408_065), (3, 256_265)]);
    assert_eq!(sequence.last(), 3);

    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_frame_is_skipped_and_next_frame_decodes() {
    let mut h = harness(&[(256_265, SubscriptionMode::Full)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();
    let mut ticks = h.hub.ticks_rx("test");

    let mut server = h.sessions.open();
    let task = tokio::spawn(ticker.run());
    server.accept();
    expect_replay(&mut server, 2).await;
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    // Full packet cut off inside the depth section.
    let mut truncated = frame(&[common::full_packet(256_265, 2_450_010)]);
    truncated.truncate(120);
    server.send_binary(truncated);
    server.send_binary(frame(&[ltp_packet(256_265, 2_450_020)]));

    let event = tokio::time::timeout(WAIT, ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.sequence, 1);
    assert_eq!(event.tick.last_price.to_string(), "24500.20");
    assert_eq!(snapshots.borrow().state, ConnectionState::Live);
    assert_eq!(snapshots.borrow().reconnects, 0);

    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_streak_forces_reconnect() {
    let mut settings = fast_websocket_settings();
    settings.max_consecutive_malformed = 3;
    let registry = Arc::new(SubscriptionRegistry::new(10));
    let hub = Arc::new(BroadcastHub::with_defaults());
    let (transport, sessions) = scripted_transport();
    let cancel = CancellationToken::new();
    let ticker = Ticker::new(
        TickerConfig::from_websocket_settings(&settings),
        transport,
        Arc::new(StaticAccessToken::new(Credentials::new(
            "key".into(),
            "token".into(),
        ))),
        registry,
        hub,
        cancel.clone(),
    );
    let mut snapshots = ticker.snapshots();

    let server = sessions.open();
    let task = tokio::spawn(ticker.run());
    server.accept();
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    for _ in 0..3 {
        server.send_binary(vec![0, 1, 0, 9, 1, 2, 3]);
    }
    let snapshot = wait_until(&mut snapshots, |s| s.reconnects >= 1).await;
    assert!(snapshot.last_error.unwrap().contains("malformed"));

    cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn error_as_first_frame_marks_degraded() {
    let mut h = harness(&[(101, SubscriptionMode::Ltp)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();

    let server = h.sessions.open();
    let task = tokio::spawn(ticker.run());
    server.send_text(r#"{"type": "error", "data": "Invalid access token"}"#);

    let snapshot = wait_until(&mut snapshots, |s| s.reconnects >= 1).await;
    assert!(snapshot.degraded);
    assert!(snapshot.last_error.unwrap().contains("Invalid access token"));

    // A healthy session clears the flag.
    let mut next = h.sessions.open();
    next.accept();
    expect_replay(&mut next, 2).await;
    let live = wait_for_state(&mut snapshots, ConnectionState::Live).await;
    assert!(!live.degraded);

    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn order_postbacks_reach_control_subscribers() {
    let mut h = harness(&[]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();
    let mut control = h.hub.control_rx();

    let server = h.sessions.open();
    let task = tokio::spawn(ticker.run());
    server.accept();
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    server.send_text(r#"{"type": "order", "data": {"order_id": "151220000000000", "status": "COMPLETE"}}"#);
    let message = tokio::time::timeout(WAIT, control.recv())
        .await
        .unwrap()
        .unwrap();
    match message {
        ControlMessage::OrderUpdate(data) => assert_eq!(data["status"], "COMPLETE"),
        other => panic!("unexpected control message: {other:?}"),
    }

    assert_eq!(h.transport.connects(), 1);
    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn stale_silence_forces_reconnect() {
    let settings = WebSocketSettings {
        ping_interval: Duration::from_millis(100),
        stale_timeout: Duration::from_millis(300),
        ..fast_websocket_settings()
    };
    let mut h = harness_with(&settings, &[(101, SubscriptionMode::Ltp)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();

    // The server acknowledges, then never sends another frame.
    let mut silent = h.sessions.open();
    let task = tokio::spawn(ticker.run());
    silent.accept();
    expect_replay(&mut silent, 2).await;
    wait_for_state(&mut snapshots, ConnectionState::Live).await;

    let snapshot = wait_until(&mut snapshots, |s| s.reconnects >= 1).await;
    assert!(snapshot.last_error.unwrap().contains("stale"));

    let mut next = h.sessions.open();
    next.accept();
    expect_replay(&mut next, 2).await;
    wait_for_state(&mut snapshots, ConnectionState::Live).await;
    assert_eq!(h.transport.connects(), 2);

    h.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    drop(silent);
}

/// Time from entering RECONNECTING to the next CONNECTING, for reconnect `n`.
async fn reconnect_delay(
    snapshots: &mut tokio::sync::watch::Receiver<kite_stream_bridge::ConnectionSnapshot>,
    n: u64,
) -> Duration {
    wait_until(snapshots, |s| {
        s.state == ConnectionState::Reconnecting && s.reconnects == n
    })
    .await;
    let started = Instant::now();
    wait_until(snapshots, |s| {
        s.state == ConnectionState::Connecting && s.reconnects == n
    })
    .await;
    started.elapsed()
}

/// Open a session once the ticker is waiting for it and bring it LIVE.
async fn go_live(
    h: &Harness,
    snapshots: &mut tokio::sync::watch::Receiver<kite_stream_bridge::ConnectionSnapshot>,
) -> ServerSide {
    let mut server = h.sessions.open();
    server.accept();
    expect_replay(&mut server, 2).await;
    wait_for_state(snapshots, ConnectionState::Live).await;
    server
}

#[tokio::test(start_paused = true)]
async fn backoff_resets_only_after_a_stable_session() {
    let settings = WebSocketSettings {
        ping_interval: Duration::from_secs(3600),
        stale_timeout: Duration::from_secs(3600),
        reconnect_delay_initial: Duration::from_secs(1),
        reconnect_delay_max: Duration::from_secs(60),
        stability_threshold: Duration::from_secs(10),
        ..fast_websocket_settings()
    };
    let mut h = harness_with(&settings, &[(101, SubscriptionMode::Ltp)]);
    let ticker = h.ticker.take().unwrap();
    let mut snapshots = ticker.snapshots();
    let task = tokio::spawn(ticker.run());

    // Short sessions keep growing the delay.
    drop(go_live(&h, &mut snapshots).await);
    let first = reconnect_delay(&mut snapshots, 1).await;
    assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1100));

    drop(go_live(&h, &mut snapshots).await);
    let second = reconnect_delay(&mut snapshots, 2).await;
    assert!(second >= Duration::from_secs(2) && second <= Duration::from_millis(2200));

    // A session that outlives the stability threshold starts the curve over.
    let stable = go_live(&h, &mut snapshots).await;
    tokio::time::sleep(Duration::from_secs(11)).await;
    drop(stable);
    let third = reconnect_delay(&mut snapshots, 3).await;
    assert!(third >= Duration::from_secs(1) && third <= Duration::from_millis(1100));

    h.cancel.cancel();
    task.await.unwrap();
}

struct StalledSession;

#[async_trait]
impl FeedSession for StalledSession {
    async fn send(&mut self, _frame: OutboundFrame) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        Some(Ok(InboundFrame::Binary(Bytes::from_static(&[0]))))
    }

    async fn close(&mut self) {
        std::future::pending::<()>().await;
    }
}

struct StalledTransport;

#[async_trait]
impl FeedTransport for StalledTransport {
    async fn connect(&self, _url: &str) -> Result<Box<dyn FeedSession>, TransportError> {
        Ok(Box::new(StalledSession))
    }
}

#[tokio::test]
async fn cancel_interrupts_a_stalled_replay() {
    let registry = Arc::new(SubscriptionRegistry::new(10));
    registry
        .subscribe(InstrumentToken::new(101), SubscriptionMode::Full)
        .unwrap();
    let cancel = CancellationToken::new();
    let ticker = Ticker::new(
        TickerConfig::from_websocket_settings(&fast_websocket_settings()),
        Arc::new(StalledTransport),
        Arc::new(StaticAccessToken::new(Credentials::new(
            "key".into(),
            "token".into(),
        ))),
        registry,
        Arc::new(BroadcastHub::with_defaults()),
        cancel.clone(),
    );
    let mut snapshots = ticker.snapshots();
    let task = tokio::spawn(ticker.run());

    wait_for_state(&mut snapshots, ConnectionState::Subscribing).await;
    cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(snapshots.borrow().state, ConnectionState::Disconnected);
    assert_eq!(snapshots.borrow().reconnects, 0);
}
