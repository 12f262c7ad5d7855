//! Websocket connection with an automatically reconnecting read loop.
//!
//! [`Connection`] owns the socket worker and the [`ConnectionMachine`]. Every
//! decoded frame, state change and failure is handed to a single listener in
//! the order the worker observes it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::stream::proto::{decode_response, encode_request, ProtocolError, Request, Response};

/// Unsolicited closes tolerated before automatic reconnects stop.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Connection failures and illegal-state calls.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is already connecting")]
    AlreadyConnecting,

    #[error("connection is already connected")]
    AlreadyConnected,

    #[error("connection is already disconnecting")]
    AlreadyDisconnecting,

    #[error("connection is already disconnected")]
    AlreadyDisconnected,

    /// A request was sent while the socket was not open.
    #[error("connection is not connected")]
    NotConnected,

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Notification emitted by the connection.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// Emitted on every state transition.
    StateChanged(ConnectionState),
    /// Socket opened.
    Connected,
    /// Socket closed after an explicit disconnect.
    Disconnected,
    /// Socket closed without a disconnect request.
    ConnectionLost { attempt: u32, reconnecting: bool },
    /// Decoded inbound frame.
    Response(Response),
    /// Inbound frame that failed to decode. Connection state is unaffected.
    DecodeError(Arc<ProtocolError>),
    /// Transport or outbound failure.
    Error(Arc<ConnectionError>),
}

/// Receives every [`ConnectionEvent`], in order, from whichever thread
/// produced it.
pub type ConnectionListener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// What the worker does after a socket closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Close was requested by `disconnect`.
    Graceful,
    /// Unsolicited close; a new attempt under `generation` has begun.
    Reconnect { attempt: u32, generation: u64 },
    /// Unsolicited close with the retry budget spent.
    Exhausted { attempts: u32 },
    /// Close of a socket superseded by a newer `connect`.
    Stale,
}

/// Connection state and reconnect bookkeeping, free of I/O.
///
/// Each `connect` starts a new generation; socket events from an older
/// generation are ignored. The retry counter resets on a successful open and
/// on an explicit connect made after the budget was exhausted.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    retry_count: u32,
    max_retries: u32,
    generation: u64,
}

impl ConnectionMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            max_retries,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn begin_connect(&mut self) -> Result<u64, ConnectionError> {
        match self.state {
            ConnectionState::Connecting => Err(ConnectionError::AlreadyConnecting),
            ConnectionState::Connected => Err(ConnectionError::AlreadyConnected),
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                if self.retry_count > self.max_retries {
                    self.retry_count = 0;
                }
                self.state = ConnectionState::Connecting;
                self.generation += 1;
                Ok(self.generation)
            }
        }
    }

    /// Returns false when the opened socket should be closed right away.
    pub fn opened(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.retry_count = 0;
        true
    }

    pub fn begin_disconnect(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Disconnecting => Err(ConnectionError::AlreadyDisconnecting),
            ConnectionState::Disconnected => Err(ConnectionError::AlreadyDisconnected),
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                Ok(())
            }
        }
    }

    pub fn closed(&mut self, generation: u64) -> CloseOutcome {
        if generation != self.generation {
            return CloseOutcome::Stale;
        }
        if self.state == ConnectionState::Disconnecting {
            self.state = ConnectionState::Disconnected;
            return CloseOutcome::Graceful;
        }

        self.retry_count += 1;
        self.state = ConnectionState::Disconnected;
        if self.retry_count > self.max_retries {
            return CloseOutcome::Exhausted {
                attempts: self.retry_count,
            };
        }

        let attempt = self.retry_count;
        match self.begin_connect() {
            Ok(generation) => CloseOutcome::Reconnect {
                attempt,
                generation,
            },
            Err(_) => CloseOutcome::Stale,
        }
    }
}

enum Outbound {
    Request(Box<Request>),
    Close,
}

/// Handle to the single websocket connection of a client.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    url: String,
    machine: Mutex<ConnectionMachine>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    listener: ConnectionListener,
    runtime: Handle,
}

impl ConnectionInner {
    fn machine(&self) -> MutexGuard<'_, ConnectionMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        (self.listener)(event);
    }

    fn emit_error(&self, error: ConnectionError) {
        self.emit(ConnectionEvent::Error(Arc::new(error)));
    }

    fn dispatch_frame(&self, text: &str) {
        match decode_response(text) {
            Ok(response) => {
                debug!(
                    event = "connection_response",
                    response_type = ?response.response_type()
                );
                self.emit(ConnectionEvent::Response(response));
            }
            Err(err) => {
                warn!(event = "connection_decode_failed", error = %err);
                self.emit(ConnectionEvent::DecodeError(Arc::new(err)));
            }
        }
    }
}

impl Connection {
    /// Creates a disconnected connection. Socket workers are spawned on
    /// `runtime`.
    pub fn new(
        url: impl Into<String>,
        max_reconnect_attempts: u32,
        runtime: Handle,
        listener: ConnectionListener,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                url: url.into(),
                machine: Mutex::new(ConnectionMachine::new(max_reconnect_attempts)),
                outbound: Mutex::new(None),
                listener,
                runtime,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine().state()
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.machine().retry_count()
    }

    /// Starts connecting in the background.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let generation = self.inner.machine().begin_connect()?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.inner.outbound() = Some(outbound_tx);

        info!(event = "connection_connecting", url = %self.inner.url, generation);
        self.inner
            .emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));

        let inner = Arc::clone(&self.inner);
        self.inner
            .runtime
            .spawn(connection_worker(inner, generation, outbound_rx));
        Ok(())
    }

    /// Asks the worker to close the socket. The final transition to
    /// disconnected happens when the worker observes the close.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.inner.machine().begin_disconnect()?;
        info!(event = "connection_disconnecting", url = %self.inner.url);
        self.inner
            .emit(ConnectionEvent::StateChanged(ConnectionState::Disconnecting));

        if let Some(outbound) = self.inner.outbound().as_ref() {
            let _ = outbound.send(Outbound::Close);
        }
        Ok(())
    }

    /// Queues a request for the socket. Failures are reported as events.
    pub fn send(&self, request: Request) {
        if self.state() != ConnectionState::Connected {
            warn!(
                event = "connection_send_dropped",
                kind = request.kind(),
                stream_id = request.stream_id()
            );
            self.inner.emit_error(ConnectionError::NotConnected);
            return;
        }

        let sent = match self.inner.outbound().as_ref() {
            Some(outbound) => outbound.send(Outbound::Request(Box::new(request))).is_ok(),
            None => false,
        };
        if !sent {
            self.inner.emit_error(ConnectionError::SendQueueClosed);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

async fn connection_worker(
    inner: Arc<ConnectionInner>,
    mut generation: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        run_socket_session(&inner, generation, &mut outbound_rx).await;

        let outcome = inner.machine().closed(generation);
        match outcome {
            CloseOutcome::Stale => return,
            CloseOutcome::Graceful => {
                info!(event = "connection_closed", url = %inner.url);
                inner.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                inner.emit(ConnectionEvent::Disconnected);
                return;
            }
            CloseOutcome::Reconnect {
                attempt,
                generation: next,
            } => {
                warn!(event = "connection_lost", url = %inner.url, attempt, reconnecting = true);
                inner.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                inner.emit(ConnectionEvent::ConnectionLost {
                    attempt,
                    reconnecting: true,
                });
                inner.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
                generation = next;
            }
            CloseOutcome::Exhausted { attempts } => {
                error!(event = "connection_reconnect_exhausted", url = %inner.url, attempts);
                inner.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                inner.emit(ConnectionEvent::ConnectionLost {
                    attempt: attempts,
                    reconnecting: false,
                });
                return;
            }
        }
    }
}

/// Runs one socket from open to close.
async fn run_socket_session(
    inner: &ConnectionInner,
    generation: u64,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) {
    let mut socket = match connect_async(inner.url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            warn!(event = "connection_open_failed", url = %inner.url, error = %err);
            inner.emit_error(ConnectionError::WebSocket(err));
            return;
        }
    };

    if !inner.machine().opened(generation) {
        let _ = socket.close(None).await;
        return;
    }
    info!(event = "connection_open", url = %inner.url);
    inner.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
    inner.emit(ConnectionEvent::Connected);

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(Outbound::Request(request)) => {
                        let text = match encode_request(&request) {
                            Ok(text) => text,
                            Err(err) => {
                                inner.emit_error(ConnectionError::Protocol(err));
                                continue;
                            }
                        };
                        debug!(event = "connection_request", kind = request.kind(), stream_id = request.stream_id());
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            inner.emit_error(ConnectionError::WebSocket(err));
                            return;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => inner.dispatch_frame(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => inner.dispatch_frame(&text),
                        Err(_) => inner.emit(ConnectionEvent::DecodeError(Arc::new(
                            ProtocolError::Malformed("binary frame is not utf-8".to_string()),
                        ))),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        inner.emit_error(ConnectionError::WebSocket(err));
                        return;
                    }
                }
            }
        }
    }
}
