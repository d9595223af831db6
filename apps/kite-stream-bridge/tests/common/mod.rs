//! Shared fixtures for the integration tests.
//!
//! `ScriptedTransport` hands out sessions that the test drives from the
//! server side: frames pushed into `ServerSide::inbound` reach the ticker,
//! frames the ticker sends land in `ServerSide::outbound`.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;

use kite_stream_bridge::{
    ConnectionSnapshot, ConnectionState, FeedSession, FeedTransport, InboundFrame, OutboundFrame,
    TransportError, WebSocketSettings,
};

pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Scripted transport
// =============================================================================

/// Test end of one scripted connection.
pub struct ServerSide {
    pub inbound: mpsc::UnboundedSender<Result<InboundFrame, TransportError>>,
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl ServerSide {
    /// Send a binary frame.
    pub fn send_binary(&self, frame: Vec<u8>) {
        self.inbound
            .send(Ok(InboundFrame::Binary(Bytes::from(frame))))
            .unwrap();
    }

    /// Send a text frame.
    pub fn send_text(&self, text: &str) {
        self.inbound
            .send(Ok(InboundFrame::Text(text.to_string())))
            .unwrap();
    }

    /// Acknowledge the connection with a server heartbeat.
    pub fn accept(&self) {
        self.send_binary(vec![0]);
    }

    /// Next outbound command as JSON, skipping pings.
    pub async fn next_command(&mut self) -> Value {
        loop {
            let frame = timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for a command")
                .expect("session dropped");
            if let OutboundFrame::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Collect `count` commands.
    pub async fn commands(&mut self, count: usize) -> Vec<Value> {
        let mut commands = Vec::with_capacity(count);
        for _ in 0..count {
            commands.push(self.next_command().await);
        }
        commands
    }

    /// Assert nothing but pings was sent for `quiet`.
    pub async fn assert_no_command(&mut self, quiet: Duration) {
        let deadline = tokio::time::Instant::now() + quiet;
        loop {
            match tokio::time::timeout_at(deadline, self.outbound.recv()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(OutboundFrame::Ping)) => {}
                Ok(Some(OutboundFrame::Text(text))) => panic!("unexpected command: {text}"),
            }
        }
    }
}

struct ScriptedSession {
    inbound: mpsc::UnboundedReceiver<Result<InboundFrame, TransportError>>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

#[async_trait]
impl FeedSession for ScriptedSession {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Io("server side dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Transport whose `connect` waits for the test to open the next session.
pub struct ScriptedTransport {
    pending: Mutex<mpsc::UnboundedReceiver<ScriptedSession>>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    /// Completed connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSession>, TransportError> {
        assert!(url.contains("api_key=") && url.contains("access_token="));
        let session = self
            .pending
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::Connect("no more sessions".into()))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(session))
    }
}

/// Opens sessions for a `ScriptedTransport`.
pub struct SessionFactory {
    tx: mpsc::UnboundedSender<ScriptedSession>,
}

impl SessionFactory {
    /// Queue a session for the next `connect`.
    pub fn open(&self) -> ServerSide {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.tx
            .send(ScriptedSession {
                inbound: inbound_rx,
                outbound: outbound_tx,
            })
            .unwrap();
        ServerSide {
            inbound: inbound_tx,
            outbound: outbound_rx,
        }
    }
}

pub fn scripted_transport() -> (Arc<ScriptedTransport>, SessionFactory) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ScriptedTransport {
        pending: Mutex::new(rx),
        connects: AtomicUsize::new(0),
    });
    (transport, SessionFactory { tx })
}

// =============================================================================
// Settings and waiting
// =============================================================================

/// Ticker settings with short reconnect delays.
pub fn fast_websocket_settings() -> WebSocketSettings {
    WebSocketSettings {
        url: "wss://ticker.test".to_string(),
        reconnect_delay_initial: Duration::from_millis(10),
        reconnect_delay_max: Duration::from_millis(50),
        ..WebSocketSettings::default()
    }
}

/// Wait until the connection reaches `state`.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionSnapshot>,
    state: ConnectionState,
) -> ConnectionSnapshot {
    timeout(WAIT, rx.wait_for(|snapshot| snapshot.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .expect("ticker dropped")
        .clone()
}

/// Wait until a snapshot satisfies `predicate`.
///
/// Transient states can be overwritten before the receiver looks, so
/// predicates should test something that sticks (a counter, a flag).
pub async fn wait_until<F>(
    rx: &mut watch::Receiver<ConnectionSnapshot>,
    predicate: F,
) -> ConnectionSnapshot
where
    F: FnMut(&ConnectionSnapshot) -> bool,
{
    timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for connection snapshot")
        .expect("ticker dropped")
        .clone()
}

/// Poll `check` until it holds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Packet builders
// =============================================================================

/// Frame with the given packets.
pub fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&u16::try_from(packets.len()).unwrap().to_be_bytes());
    for packet in packets {
        out.extend_from_slice(&u16::try_from(packet.len()).unwrap().to_be_bytes());
        out.extend_from_slice(packet);
    }
    out
}

/// 8-byte LTP packet.
pub fn ltp_packet(token: u32, price: u32) -> Vec<u8> {
    words(&[token, price])
}

/// 44-byte quote packet.
pub fn quote_packet(token: u32, price: u32) -> Vec<u8> {
    // token, ltp, ltq, avg, volume, buy qty, sell qty, o, h, l, c
    words(&[
        token,
        price,
        5,
        price,
        10_000,
        300,
        400,
        price - 100,
        price + 200,
        price - 200,
        price - 50,
    ])
}

/// 184-byte full packet.
pub fn full_packet(token: u32, price: u32) -> Vec<u8> {
    let mut p = quote_packet(token, price);
    p.extend(words(&[1_700_000_000, 42, 50, 40, 1_700_000_001]));
    for i in 0..10u32 {
        p.extend_from_slice(&(100 + i).to_be_bytes());
        p.extend_from_slice(&(price + i).to_be_bytes());
        p.extend_from_slice(&u16::try_from(i + 1).unwrap().to_be_bytes());
        p.extend_from_slice(&[0, 0]);
    }
    p
}

pub fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

// =============================================================================
// Command helpers
// =============================================================================

/// Sorted tokens of a command.
pub fn command_tokens(command: &Value) -> Vec<u64> {
    let tokens = if command["a"] == "mode" {
        &command["v"][1]
    } else {
        &command["v"]
    };
    let mut tokens: Vec<u64> = tokens
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_u64().unwrap())
        .collect();
    tokens.sort_unstable();
    tokens
}

/// The `mode` command for `mode` among `commands`.
pub fn mode_command<'a>(commands: &'a [Value], mode: &str) -> Option<&'a Value> {
    commands
        .iter()
        .find(|c| c["a"] == "mode" && c["v"][0] == mode)
}
