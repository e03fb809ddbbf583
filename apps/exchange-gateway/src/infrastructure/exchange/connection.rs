//! Upstream WebSocket Connection
//!
//! Duplex wrapper around one exchange socket. The socket is split into two
//! pumps:
//!
//! - **write pump**: drains a bounded outbound queue, writes pings on the
//!   heartbeat cadence and fails the connection if a write stalls.
//! - **read pump**: renews the read deadline on every frame, answers pings and
//!   forwards text frames into a bounded inbound queue. A full inbound queue
//!   fails the connection rather than blocking the socket.
//!
//! Either pump ending cancels the other. The first failure is kept and handed
//! to the owner by [`Connection::recv`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, Liveness};

// =============================================================================
// Error Type
// =============================================================================

/// Transport-level failures of an upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// TCP/TLS/WebSocket handshake failed.
    #[error("connect to {url} failed: {source}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying error.
        #[source]
        source: tungstenite::Error,
    },

    /// Handshake did not complete in time.
    #[error("connect to {url} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target URL.
        url: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// WebSocket protocol or I/O error on an established connection.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// No frame arrived within the read deadline.
    #[error("no frame received for {0:?}")]
    ReadDeadline(Duration),

    /// A write did not complete within the write timeout.
    #[error("write stalled for {0:?}")]
    WriteTimeout(Duration),

    /// The consumer fell behind and the inbound queue filled up.
    #[error("inbound queue overflow ({capacity} frames)")]
    InboundOverflow {
        /// Configured capacity.
        capacity: usize,
    },

    /// The outbound queue is full.
    #[error("outbound queue full")]
    OutboundFull,

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// The connection was stopped locally.
    #[error("connection cancelled")]
    Cancelled,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one upstream connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Ping cadence and read deadline.
    pub heartbeat: HeartbeatConfig,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Maximum time a single write may take.
    pub write_timeout: Duration,
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
    /// Inbound queue capacity.
    pub inbound_capacity: usize,
}

impl ConnectionConfig {
    /// Create a configuration with default limits.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: HeartbeatConfig::new(Duration::from_secs(20), Duration::from_secs(60)),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            inbound_capacity: 4096,
        }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub fn from_websocket_settings(url: impl Into<String>, settings: &crate::WebSocketSettings) -> Self {
        Self {
            url: url.into(),
            heartbeat: HeartbeatConfig::from_websocket_settings(settings),
            connect_timeout: settings.connect_timeout,
            write_timeout: settings.write_timeout,
            outbound_capacity: settings.outbound_capacity,
            inbound_capacity: settings.inbound_capacity,
        }
    }

    /// Same limits, different URL.
    #[must_use]
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug, Default)]
struct Shared {
    liveness: Liveness,
    failure: Mutex<Option<TransportError>>,
}

impl Shared {
    fn fail(&self, err: TransportError) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// An established upstream connection.
///
/// Dropping the connection stops both pumps.
pub struct Connection {
    writer: ConnectionWriter,
    inbound: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Connection {
    /// Open a connection. The pumps stop when `parent` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] or [`TransportError::ConnectTimeout`]
    /// if the handshake fails.
    pub async fn connect(
        config: &ConnectionConfig,
        parent: &CancellationToken,
    ) -> Result<Self, TransportError> {
        tracing::debug!(url = %config.url, "Opening upstream connection");

        let handshake = tokio_tungstenite::connect_async(config.url.as_str());
        let (stream, _response) = tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                url: config.url.clone(),
                timeout: config.connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                url: config.url.clone(),
                source,
            })?;

        Ok(Self::from_stream(stream, config, parent))
    }

    /// Wrap an already established stream and start its pumps.
    pub fn from_stream<S>(
        stream: WebSocketStream<S>,
        config: &ConnectionConfig,
        parent: &CancellationToken,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = parent.child_token();
        let shared = Arc::new(Shared::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (sink, source) = stream.split();

        tokio::spawn(write_pump(
            sink,
            outbound_rx,
            config.heartbeat.clone(),
            config.write_timeout,
            Arc::clone(&shared),
            cancel.clone(),
        ));
        tokio::spawn(read_pump(
            source,
            inbound_tx,
            outbound_tx.clone(),
            config.heartbeat.read_deadline,
            config.inbound_capacity.max(1),
            Arc::clone(&shared),
            cancel.clone(),
        ));

        Self {
            writer: ConnectionWriter { tx: outbound_tx },
            inbound: inbound_rx,
            shared,
            cancel,
        }
    }

    /// Handle for queueing outbound frames.
    #[must_use]
    pub fn writer(&self) -> ConnectionWriter {
        self.writer.clone()
    }

    /// Liveness counters of this connection.
    #[must_use]
    pub fn liveness(&self) -> &Liveness {
        &self.shared.liveness
    }

    /// Token cancelled when this connection stops.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next inbound text frame.
    ///
    /// # Errors
    ///
    /// Once the connection has stopped, returns the failure that stopped it,
    /// [`TransportError::Cancelled`] after a local stop, or
    /// [`TransportError::Closed`].
    pub async fn recv(&mut self) -> Result<String, TransportError> {
        match self.inbound.recv().await {
            Some(text) => Ok(text),
            None => Err(self.take_failure()),
        }
    }

    /// Stop both pumps.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn take_failure(&self) -> TransportError {
        self.shared.failure.lock().take().unwrap_or_else(|| {
            if self.cancel.is_cancelled() {
                TransportError::Cancelled
            } else {
                TransportError::Closed
            }
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cloneable handle for queueing frames on a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionWriter {
    tx: mpsc::Sender<Message>,
}

impl ConnectionWriter {
    /// Queue a text frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::OutboundFull`] when the queue is full and
    /// [`TransportError::Closed`] when the connection has stopped.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        match self.tx.try_send(Message::Text(text.into().into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::OutboundFull),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Whether the connection has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Writer backed by a plain channel, for exercising code that only
    /// queues frames.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

// =============================================================================
// Pumps
// =============================================================================

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Message>,
    heartbeat: HeartbeatConfig,
    write_timeout: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = heartbeat.ping_ticker();

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.liveness.record_ping();
                Message::Ping(Vec::new().into())
            }
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shared.fail(e.into());
                break;
            }
            Err(_) => {
                shared.fail(TransportError::WriteTimeout(write_timeout));
                break;
            }
        }
    }

    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
    cancel.cancel();
}

async fn read_pump<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::Sender<String>,
    control: mpsc::Sender<Message>,
    read_deadline: Duration,
    capacity: usize,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = tokio::time::timeout(read_deadline, source.next()) => frame,
        };

        let message = match frame {
            Err(_) => {
                tracing::warn!(deadline_secs = read_deadline.as_secs(), "Read deadline expired");
                shared.fail(TransportError::ReadDeadline(read_deadline));
                break;
            }
            Ok(None) => {
                shared.fail(TransportError::Closed);
                break;
            }
            Ok(Some(Err(e))) => {
                shared.fail(e.into());
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        shared.liveness.record_frame();

        let text = match message {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(len = data.len(), "Received non-UTF8 binary message");
                    continue;
                }
            },
            Message::Ping(data) => {
                let _ = control.try_send(Message::Pong(data));
                continue;
            }
            Message::Close(frame) => {
                tracing::info!(?frame, "Server sent close frame");
                shared.fail(TransportError::Closed);
                break;
            }
            Message::Pong(_) | Message::Frame(_) => continue,
        };

        match inbound.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                shared.fail(TransportError::InboundOverflow { capacity });
                break;
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn forwards_text_and_echoes_writes() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Text("hello".into())).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        let cancel = CancellationToken::new();
        let mut conn = Connection::connect(&ConnectionConfig::new(url), &cancel)
            .await
            .unwrap();

        assert_eq!(conn.recv().await.unwrap(), "hello");
        conn.writer().send_text("echo").unwrap();
        assert_eq!(conn.recv().await.unwrap(), "echo");
        assert!(conn.liveness().frames() >= 2);
    }

    #[tokio::test]
    async fn silent_peer_hits_read_deadline() {
        let url = serve_once(|ws| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(ws);
        })
        .await;

        let mut config = ConnectionConfig::new(url);
        config.heartbeat = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_millis(100));

        let cancel = CancellationToken::new();
        let mut conn = Connection::connect(&config, &cancel).await.unwrap();

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::ReadDeadline(_)), "{err}");
    }

    #[tokio::test]
    async fn slow_consumer_overflows_inbound_queue() {
        let url = serve_once(|mut ws| async move {
            for i in 0..10 {
                ws.send(Message::Text(i.to_string().into())).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        let mut config = ConnectionConfig::new(url);
        config.inbound_capacity = 2;

        let cancel = CancellationToken::new();
        let mut conn = Connection::connect(&config, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut received = 0;
        let err = loop {
            match conn.recv().await {
                Ok(_) => received += 1,
                Err(err) => break err,
            }
        };
        assert_eq!(received, 2);
        assert!(matches!(err, TransportError::InboundOverflow { capacity: 2 }));
    }

    #[tokio::test]
    async fn parent_cancel_stops_connection() {
        let url = serve_once(|ws| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(ws);
        })
        .await;

        let cancel = CancellationToken::new();
        let mut conn = Connection::connect(&ConnectionConfig::new(url), &cancel)
            .await
            .unwrap();
        let writer = conn.writer();

        cancel.cancel();

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn unreachable_host_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let result =
            Connection::connect(&ConnectionConfig::new(format!("ws://{addr}")), &cancel).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
