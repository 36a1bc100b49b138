//! WebSocket transport for the meeting event stream
//!
//! Owns one streaming connection: authenticated connect, keepalive pings,
//! and exponential-backoff reconnection on abnormal closure. Inbound text
//! frames are handed to a single-consumer queue in arrival order; this
//! module never touches transcript state.

mod error;
mod request;
pub(crate) mod subscriptions;

pub(crate) use error::TransportError;

use crate::protocol::ClientFrame;
use error::WS_CONNECT_TIMEOUT_SECS;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maximum number of reconnection attempts after an abnormal closure
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential reconnect backoff in milliseconds
const RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Keepalive ping interval in seconds
const PING_INTERVAL_SECS: u64 = 25;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Lifecycle events, published exactly once per transition
#[derive(Debug, Clone)]
pub(crate) enum TransportEvent {
    /// Connection reached Open (first connect or reconnect)
    Open,
    /// Connection was lost or closed
    Disconnected,
    /// Attempting to reconnect after an abnormal closure
    Reconnecting { attempt: u32 },
    /// Gave up reconnecting after the attempt cap; caller must re-initiate
    ReconnectFailed,
}

/// Client owning one streaming connection to the event stream.
///
/// Subscription bookkeeping lives in
/// [`subscriptions::SubscriptionManager`], which clears itself on the
/// Disconnected lifecycle event; the transport has no knowledge of the
/// current meeting.
pub(crate) struct TransportClient {
    url: Url,
    state: Arc<Mutex<ConnectionState>>,
    event_tx: broadcast::Sender<TransportEvent>,
    frame_tx: mpsc::Sender<String>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    user_close: Arc<AtomicBool>,
}

impl TransportClient {
    /// Create a client for the given stream URL and credential.
    ///
    /// Returns the client plus the receiving end of the inbound frame
    /// queue. Fails up front when the credential is missing; invalid
    /// credentials surface as an Auth error from `connect`.
    pub(crate) fn new(
        ws_url: &str,
        api_key: &str,
    ) -> Result<(Self, mpsc::Receiver<String>), TransportError> {
        if api_key.is_empty() {
            return Err(TransportError::Auth("missing API key".to_string()));
        }

        let url = request::build_ws_url(ws_url, api_key)?;
        let (event_tx, _) = broadcast::channel(64);
        let (frame_tx, frame_rx) = mpsc::channel(256);

        Ok((
            Self {
                url,
                state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
                event_tx,
                frame_tx,
                outbound: Arc::new(Mutex::new(None)),
                user_close: Arc::new(AtomicBool::new(false)),
            },
            frame_rx,
        ))
    }

    /// Subscribe to lifecycle events
    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Current connection state
    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Open the connection.
    ///
    /// No-op while already Open or Connecting. The first handshake runs
    /// inline so credential and network failures surface to the caller;
    /// after that a background task owns the connection and handles
    /// reconnection on abnormal closure.
    pub(crate) async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = lock_state(&self.state);
            match *state {
                ConnectionState::Open | ConnectionState::Connecting => return Ok(()),
                _ => *state = ConnectionState::Connecting,
            }
        }
        self.user_close.store(false, Ordering::SeqCst);

        info!("Connecting to event stream: {}", request::redacted(&self.url));

        match handshake(&self.url).await {
            Ok(stream) => {
                let driver = ConnectionDriver {
                    url: self.url.clone(),
                    state: self.state.clone(),
                    event_tx: self.event_tx.clone(),
                    frame_tx: self.frame_tx.clone(),
                    outbound: self.outbound.clone(),
                    user_close: self.user_close.clone(),
                };
                let mut events = self.event_tx.subscribe();
                tokio::spawn(driver.run(stream));
                // Wait until the driver has installed the connection, so a
                // send() immediately after connect() cannot race it
                while let Ok(event) = events.recv().await {
                    if matches!(
                        event,
                        TransportEvent::Open | TransportEvent::Disconnected
                    ) {
                        break;
                    }
                }
                Ok(())
            }
            Err(e) => {
                error!("Event stream connection failed: {}", e);
                *lock_state(&self.state) = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close the connection with a normal-closure code. Idempotent; no
    /// reconnect is scheduled for a user-initiated close.
    pub(crate) fn disconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.user_close.store(true, Ordering::SeqCst);
        *lock_state(&self.state) = ConnectionState::Closing;

        // Dropping the outbound sender makes the send task emit the
        // close frame and shut the sink down.
        let tx = match self.outbound.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);
        info!("Disconnecting from event stream");
    }

    /// Send a frame over the open connection
    pub(crate) async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Open {
            return Err(TransportError::NotConnected);
        }

        let json =
            serde_json::to_string(frame).map_err(|e| TransportError::Network(e.to_string()))?;

        let tx = match self.outbound.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match tx {
            Some(tx) => tx
                .send(Message::Text(json))
                .await
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }
}

fn lock_state(state: &Mutex<ConnectionState>) -> std::sync::MutexGuard<'_, ConnectionState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reconnect delay for the given 1-based attempt: base * 2^(attempt-1)
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(RECONNECT_BASE_DELAY_MS * 2u64.pow(attempt.saturating_sub(1)))
}

/// Perform one handshake attempt with the connect timeout applied
async fn handshake(url: &Url) -> Result<WsStream, TransportError> {
    let request = request::build_ws_request(url)?;

    match timeout(
        Duration::from_secs(WS_CONNECT_TIMEOUT_SECS),
        connect_async(request),
    )
    .await
    {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(tungstenite::Error::Http(response))) => {
            let status = response.status();
            if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
                Err(TransportError::Auth(format!("server returned {}", status)))
            } else {
                Err(TransportError::Network(format!(
                    "handshake rejected with {}",
                    status
                )))
            }
        }
        Ok(Err(e)) => Err(TransportError::Network(e.to_string())),
        Err(_) => Err(TransportError::ConnectTimeout),
    }
}

/// Background owner of one connection across reconnect cycles
struct ConnectionDriver {
    url: Url,
    state: Arc<Mutex<ConnectionState>>,
    event_tx: broadcast::Sender<TransportEvent>,
    frame_tx: mpsc::Sender<String>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    user_close: Arc<AtomicBool>,
}

impl ConnectionDriver {
    async fn run(self, mut stream: WsStream) {
        loop {
            // A disconnect issued while the handshake was in flight wins
            if self.user_close.load(Ordering::SeqCst) {
                *lock_state(&self.state) = ConnectionState::Disconnected;
                let _ = self.event_tx.send(TransportEvent::Disconnected);
                return;
            }

            let (ws_sink, ws_read) = stream.split();
            let (out_tx, out_rx) = mpsc::channel::<Message>(64);
            self.install_outbound(Some(out_tx));
            let send_task = spawn_send_task(ws_sink, out_rx);

            // Outbound plumbing is in place; Open is now observable
            *lock_state(&self.state) = ConnectionState::Open;
            let _ = self.event_tx.send(TransportEvent::Open);
            info!("Event stream connected");
            let normal_close = self.receive_until_closed(ws_read).await;

            self.install_outbound(None);
            let _ = send_task.await;

            *lock_state(&self.state) = ConnectionState::Disconnected;
            let _ = self.event_tx.send(TransportEvent::Disconnected);

            if self.user_close.load(Ordering::SeqCst) || normal_close {
                info!("Event stream closed");
                return;
            }

            warn!("Event stream connection lost, will attempt to reconnect");
            match self.reconnect().await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    /// Forward inbound text frames until the connection ends.
    /// Returns true when the peer closed with a normal-closure code.
    async fn receive_until_closed(&self, mut ws_read: SplitStream<WsStream>) -> bool {
        while let Some(msg_result) = ws_read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    trace!("Received frame: {} bytes", text.len());
                    if self.frame_tx.send(text).await.is_err() {
                        warn!("Frame queue closed, dropping connection");
                        return true;
                    }
                }
                Ok(Message::Close(frame)) => {
                    let normal = matches!(&frame, Some(f) if f.code == CloseCode::Normal);
                    info!(
                        "Event stream closed by peer (code: {:?})",
                        frame.as_ref().map(|f| f.code)
                    );
                    return normal;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("Received transport-level ping/pong");
                }
                Err(e) => {
                    error!("Event stream receive error: {}", e);
                    return false;
                }
                _ => {}
            }
        }
        false
    }

    /// Exponential-backoff reconnect loop. Returns the new stream, or
    /// None when the attempt cap is exhausted, the credential is
    /// rejected, or the user closed in the meantime.
    async fn reconnect(&self) -> Option<WsStream> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                error!(
                    "Failed to reconnect after {} attempts",
                    MAX_RECONNECT_ATTEMPTS
                );
                let _ = self.event_tx.send(TransportEvent::ReconnectFailed);
                return None;
            }

            let delay = backoff_delay(attempt);
            info!(
                "Reconnecting in {}ms (attempt {}/{})",
                delay.as_millis(),
                attempt,
                MAX_RECONNECT_ATTEMPTS
            );
            let _ = self.event_tx.send(TransportEvent::Reconnecting { attempt });
            sleep(delay).await;

            if self.user_close.load(Ordering::SeqCst) {
                *lock_state(&self.state) = ConnectionState::Disconnected;
                return None;
            }

            *lock_state(&self.state) = ConnectionState::Connecting;
            match handshake(&self.url).await {
                Ok(stream) => return Some(stream),
                Err(TransportError::Auth(msg)) => {
                    error!("Authentication rejected during reconnect: {}", msg);
                    *lock_state(&self.state) = ConnectionState::Disconnected;
                    let _ = self.event_tx.send(TransportEvent::ReconnectFailed);
                    return None;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    *lock_state(&self.state) = ConnectionState::Disconnected;
                }
            }
        }
    }

    fn install_outbound(&self, tx: Option<mpsc::Sender<Message>>) {
        match self.outbound.lock() {
            Ok(mut guard) => *guard = tx,
            Err(poisoned) => *poisoned.into_inner() = tx,
        }
    }
}

/// Spawn the send task: multiplexes outbound frames with the keepalive
/// ping cadence; closing the outbound channel emits the normal-closure
/// frame and ends the task.
fn spawn_send_task(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Consume the immediate first tick; pings start one interval in
        ping_interval.tick().await;

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if let Ok(json) = serde_json::to_string(&ClientFrame::Ping) {
                        if ws_sink.send(Message::Text(json)).await.is_err() {
                            warn!("Failed to send keepalive ping");
                            break;
                        }
                        trace!("Sent keepalive ping");
                    }
                }
                msg = out_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if ws_sink.send(msg).await.is_err() {
                                warn!("Failed to send outbound frame");
                                break;
                            }
                        }
                        None => {
                            let _ = ws_sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "".into(),
                                })))
                                .await;
                            let _ = ws_sink.close().await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(5), Duration::from_millis(16000));
    }

    #[test]
    fn test_new_rejects_missing_credential() {
        let result = TransportClient::new("wss://api.example.com/ws", "");
        assert!(matches!(result, Err(TransportError::Auth(_))));
    }

    #[test]
    fn test_new_starts_disconnected() {
        let (client, _frames) = TransportClient::new("wss://api.example.com/ws", "key").unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let (client, _frames) = TransportClient::new("wss://api.example.com/ws", "key").unwrap();
        let result = client
            .send(&ClientFrame::subscribe(&crate::protocol::MeetingRef::new(
                "m1",
            )))
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_disconnect_is_idempotent_when_disconnected() {
        let (client, _frames) = TransportClient::new("wss://api.example.com/ws", "key").unwrap();
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
