//! Connection bridge: relays one client channel to one TCP endpoint.
//!
//! A [`BridgeSession`] owns a WebSocket for its whole lifetime and, once the
//! first payload frame arrives, exactly one outbound TCP connection. The TCP
//! leg is opened lazily and never re-established: when it ends, for any
//! reason, the session is done.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_tungstenite::WebSocketStream;
use hyper_tungstenite::tungstenite::Message;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::target::Target;

/// Default maximum wait for the outbound connection to open.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between keepalive pings sent to the client channel.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);

const READ_BUFFER_SIZE: usize = 4096;

/// The client-facing WebSocket, as produced by the upgrade handshake.
pub type ClientStream = WebSocketStream<TokioIo<Upgraded>>;

type ClientSink = Arc<Mutex<SplitSink<ClientStream, Message>>>;

/// Per-session tunables. Both durations must be non-zero.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum time to wait for the outbound TCP connection to open.
    pub connect_timeout: Duration,
    /// Interval between keepalive pings sent to the client channel.
    pub ping_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            ping_interval: PING_INTERVAL,
        }
    }
}

/// Lifecycle of a session's TCP leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    /// Channel open, no TCP connection requested yet.
    Idle = 0,
    /// Connect attempt in flight, watchdog armed.
    Connecting = 1,
    /// Duplex pumping active.
    Open = 2,
    /// Terminal; all resources released.
    Closed = 3,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Idle,
            1 => BridgeState::Connecting,
            2 => BridgeState::Open,
            _ => BridgeState::Closed,
        }
    }
}

/// Shared state cell. The channel loop, the relay task, and teardown all
/// mutate it, so every transition is a one-shot compare-and-swap: whichever
/// path loses the race observes the new state and backs off.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(BridgeState::Idle as u8))
    }

    fn get(&self) -> BridgeState {
        BridgeState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Returns false if another path moved the state first.
    fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to `Closed`, returning the state that was current before.
    fn close(&self) -> BridgeState {
        BridgeState::from_u8(self.0.swap(BridgeState::Closed as u8, Ordering::SeqCst))
    }
}

/// Handle to the relay task feeding the TCP leg. Dropping `frames` is the
/// teardown signal: the relay drains what was already queued, then releases
/// the connection.
struct RemoteHandle {
    frames: mpsc::UnboundedSender<Bytes>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// One client channel bridged to one TCP endpoint.
pub struct BridgeSession {
    target: Target,
    config: BridgeConfig,
    state: Arc<StateCell>,
    remote: Option<RemoteHandle>,
}

impl BridgeSession {
    pub fn new(target: Target, config: BridgeConfig) -> Self {
        Self {
            target,
            config,
            state: Arc::new(StateCell::new()),
            remote: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    /// Drive the session until the client channel ends.
    ///
    /// Returns once the channel closed or errored and both legs are released.
    /// The relay task may briefly outlive this call while it drains already
    /// queued frames; it holds no session state beyond the TCP stream it is
    /// about to drop.
    pub async fn run(mut self, ws: ClientStream) {
        let (sink, mut stream) = ws.split();
        let sink: ClientSink = Arc::new(Mutex::new(sink));

        let mut keepalive = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Binary(payload))) => {
                        self.handle_frame(payload, &sink);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let mut ws = sink.lock().await;
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        debug!(remote = %self.target, "dropping text frame (payloads are binary)");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(remote = %self.target, ?frame, "client closed channel");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(remote = %self.target, %error, "client channel error");
                        break;
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    let mut ws = sink.lock().await;
                    if ws.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.teardown(&sink).await;
    }

    /// Route one payload frame according to the session state.
    fn handle_frame(&mut self, payload: Bytes, sink: &ClientSink) {
        match self.state.get() {
            BridgeState::Idle => self.begin_connect(payload, sink),
            BridgeState::Connecting | BridgeState::Open => {
                let sent = self
                    .remote
                    .as_ref()
                    .is_some_and(|remote| remote.frames.send(payload).is_ok());
                if !sent {
                    // The relay ended between our state probe and the send.
                    debug!(remote = %self.target, "remote leg gone, dropping frame");
                }
            }
            BridgeState::Closed => {
                debug!(remote = %self.target, "session closed, dropping frame");
            }
        }
    }

    /// First payload frame: open the TCP leg and start the relay task.
    ///
    /// The triggering frame is queued before the task spawns so its bytes are
    /// the first written to the remote, ahead of anything that arrives while
    /// the connect is still in flight.
    fn begin_connect(&mut self, first: Bytes, sink: &ClientSink) {
        if !self
            .state
            .transition(BridgeState::Idle, BridgeState::Connecting)
        {
            return;
        }

        let (frames, queue) = mpsc::unbounded_channel();
        let _ = frames.send(first);
        let task = tokio::spawn(relay_remote(
            self.target.clone(),
            self.config.clone(),
            queue,
            Arc::clone(sink),
            Arc::clone(&self.state),
        ));
        self.remote = Some(RemoteHandle { frames, task });
    }

    /// Release both legs. Idempotent: every exit path funnels here, and the
    /// relay task may already have moved the state to `Closed` on its own.
    async fn teardown(&mut self, sink: &ClientSink) {
        let prior = self.state.close();
        self.remote.take();
        if prior != BridgeState::Closed {
            let mut ws = sink.lock().await;
            if let Err(error) = ws.close().await {
                debug!(remote = %self.target, %error, "error closing client channel");
            }
            debug!(remote = %self.target, state = ?prior, "session closed");
        }
    }
}

enum PumpEnd {
    RemoteEof,
    ChannelClosed,
    ReadError(io::Error),
    WriteError(io::Error),
}

enum ConnectError {
    TimedOut,
    Failed(BridgeError),
}

/// Relay task: owns the TCP leg for its entire lifetime.
///
/// Opens the connection under the watchdog, writes the queued client frames,
/// and pumps remote reads back to the client channel until either leg ends.
async fn relay_remote(
    target: Target,
    config: BridgeConfig,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    sink: ClientSink,
    state: Arc<StateCell>,
) {
    let stream = match open_remote(&target, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(ConnectError::TimedOut) => {
            // Watchdog path: operational log only, no frame to the client.
            warn!(
                status = "failed",
                remote.host = target.host(),
                remote.port = target.port_raw(),
                "remote connection timed out"
            );
            close_channel(&sink).await;
            state.close();
            return;
        }
        Err(ConnectError::Failed(error)) => {
            let mut ws = sink.lock().await;
            let _ = ws.send(failure_frame(&error.to_string())).await;
            let _ = ws.close().await;
            drop(ws);
            debug!(remote = %target, %error, "remote connection failed");
            state.close();
            return;
        }
    };

    if !state.transition(BridgeState::Connecting, BridgeState::Open) {
        // The session tore down while the connect was in flight; the fresh
        // connection is dropped without ever carrying a byte.
        debug!(remote = %target, "discarding connection opened after close");
        return;
    }
    debug!(remote = %target, "remote connection open");

    let (mut reader, mut writer) = stream.into_split();

    // The head of the queue is the frame that triggered the connect; it goes
    // out before the pump starts.
    match queue.recv().await {
        Some(payload) => {
            if let Err(error) = writer.write_all(&payload).await {
                warn!(remote = %target, %error, "write to remote failed");
                close_channel(&sink).await;
                state.close();
                return;
            }
        }
        None => {
            state.close();
            return;
        }
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let end = loop {
        tokio::select! {
            queued = queue.recv() => match queued {
                Some(payload) => {
                    if let Err(error) = writer.write_all(&payload).await {
                        break PumpEnd::WriteError(error);
                    }
                }
                // Sender dropped: the client channel is gone.
                None => break PumpEnd::ChannelClosed,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => break PumpEnd::RemoteEof,
                Ok(n) => {
                    let frame = Message::binary(Bytes::copy_from_slice(&buf[..n]));
                    if sink.lock().await.send(frame).await.is_err() {
                        break PumpEnd::ChannelClosed;
                    }
                }
                Err(error) => break PumpEnd::ReadError(error),
            },
        }
    };

    match end {
        PumpEnd::RemoteEof => {
            // Clean end-of-stream closes only the TCP leg; the client is
            // expected to notice the stream ending and close on its own.
            debug!(remote = %target, "remote closed the stream");
        }
        PumpEnd::ChannelClosed => {
            debug!(remote = %target, "client channel closed");
        }
        PumpEnd::ReadError(error) => {
            warn!(remote = %target, %error, "read from remote failed");
            close_channel(&sink).await;
        }
        PumpEnd::WriteError(error) => {
            warn!(remote = %target, %error, "write to remote failed");
            close_channel(&sink).await;
        }
    }
    state.close();
}

/// Open the TCP leg under the connect watchdog.
///
/// `timeout` drops the connect future when the watchdog fires, so an attempt
/// that never resolves cannot outlive the session. A port that does not parse
/// fails here and takes the same path as a refused connection.
async fn open_remote(target: &Target, connect_timeout: Duration) -> Result<TcpStream, ConnectError> {
    let port = target.port().map_err(ConnectError::Failed)?;
    match timeout(connect_timeout, TcpStream::connect((target.host(), port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(ConnectError::Failed(error.into())),
        Err(_) => Err(ConnectError::TimedOut),
    }
}

/// Close the client channel from the relay task. Guarded: a channel that is
/// already closed or mid-teardown must not surface an error here.
async fn close_channel(sink: &ClientSink) {
    let mut ws = sink.lock().await;
    if let Err(error) = ws.close().await {
        debug!(%error, "error closing client channel");
    }
}

#[derive(Debug, Serialize)]
struct FailureFrame<'a> {
    status: &'static str,
    error: &'a str,
}

/// Control frame sent when the TCP leg cannot be established.
fn failure_frame(error: &str) -> Message {
    let frame = FailureFrame {
        status: "failed",
        error,
    };
    Message::text(serde_json::to_string(&frame).unwrap_or_default())
}
