//! Downstream Client Connection
//!
//! One write pump and one read pump per client. The write pump owns the
//! socket sink and drains the client's mailbox and control queue; the read
//! pump owns the stream, renews the read deadline on every frame and turns
//! requests into hub calls. Either pump ending stops the other, and every
//! room the client held is left on the way out.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::{
    ClientAction, ClientId, ClientRequest, ClientSubscriptions, RoomKey, ServerNotice,
};
use crate::infrastructure::hub::RoomRegistry;
use crate::infrastructure::metrics;

/// Per-client limits.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Payloads queued per client before updates are dropped.
    pub mailbox_capacity: usize,
    /// Maximum silence from the client.
    pub read_deadline: Duration,
    /// Interval between protocol pings.
    pub ping_interval: Duration,
    /// Maximum time a single write may take.
    pub write_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
        }
    }
}

const CONTROL_CAPACITY: usize = 32;

/// Serve one upgraded socket until either side stops.
pub(super) async fn serve_client<P>(
    socket: WebSocket,
    rooms: Arc<dyn RoomRegistry<P>>,
    levels: Option<usize>,
    client: ClientId,
    config: ClientConfig,
    cancel: CancellationToken,
) where
    P: Serialize + Send + 'static,
{
    let (sink, stream) = socket.split();
    let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);

    metrics::client_connected();
    tracing::debug!(client, ?levels, "Client connected");

    let writer = tokio::spawn(write_pump(
        sink,
        mailbox_rx,
        control_rx,
        config.clone(),
        client,
        cancel.clone(),
    ));

    let mut held = ClientSubscriptions::new();
    let reason = read_pump(
        stream,
        &*rooms,
        levels,
        client,
        &mailbox_tx,
        &control_tx,
        &mut held,
        config.read_deadline,
        &cancel,
    )
    .await;

    cancel.cancel();
    for key in held.drain() {
        rooms.unsubscribe(&key, client);
    }
    let _ = writer.await;

    metrics::client_disconnected();
    tracing::debug!(client, reason, "Client disconnected");
}

#[allow(clippy::too_many_arguments)]
async fn read_pump<P>(
    mut stream: SplitStream<WebSocket>,
    rooms: &dyn RoomRegistry<P>,
    levels: Option<usize>,
    client: ClientId,
    mailbox: &mpsc::Sender<P>,
    control: &mpsc::Sender<ServerNotice>,
    held: &mut ClientSubscriptions,
    read_deadline: Duration,
    cancel: &CancellationToken,
) -> &'static str {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return "stopped",
            next = tokio::time::timeout(read_deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => return "read deadline",
            Ok(None) => return "closed",
            Ok(Some(Err(_))) => return "read error",
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let notice = handle_request(text.as_str(), rooms, levels, client, mailbox, held);
                if control.try_send(notice).is_err() {
                    return "control queue full";
                }
            }
            Message::Close(_) => return "closed",
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}

fn handle_request<P>(
    text: &str,
    rooms: &dyn RoomRegistry<P>,
    levels: Option<usize>,
    client: ClientId,
    mailbox: &mpsc::Sender<P>,
    held: &mut ClientSubscriptions,
) -> ServerNotice {
    let request = match ClientRequest::parse(text) {
        Ok(request) => request,
        Err(e) => return error_notice(&e),
    };
    if request.action == ClientAction::Ping {
        return ServerNotice::Pong;
    }

    let key = match request.room_key(levels) {
        Ok(key) => key,
        Err(e) => return error_notice(&e),
    };

    match request.action {
        ClientAction::Subscribe => subscribe(rooms, &key, client, mailbox, held),
        ClientAction::Unsubscribe => {
            if held.remove(&key) {
                rooms.unsubscribe(&key, client);
            }
            ServerNotice::Unsubscribed {
                symbol: key.symbol().to_string(),
            }
        }
        ClientAction::Ping => ServerNotice::Pong,
    }
}

fn subscribe<P>(
    rooms: &dyn RoomRegistry<P>,
    key: &RoomKey,
    client: ClientId,
    mailbox: &mpsc::Sender<P>,
    held: &mut ClientSubscriptions,
) -> ServerNotice {
    if !held.contains(key) {
        if let Err(e) = rooms.subscribe(key, client, mailbox.clone()) {
            return error_notice(&e);
        }
        held.add(key.clone());
    }
    ServerNotice::Subscribed {
        symbol: key.symbol().to_string(),
    }
}

fn error_notice(err: &dyn std::error::Error) -> ServerNotice {
    ServerNotice::Error {
        message: err.to_string(),
    }
}

async fn write_pump<P: Serialize>(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<P>,
    mut control: mpsc::Receiver<ServerNotice>,
    config: ClientConfig,
    client: ClientId,
    cancel: CancellationToken,
) {
    let period = config.ping_interval.max(Duration::from_millis(1));
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(notice) = control.recv() => match encode(&notice) {
                Some(text) => Message::Text(text),
                None => continue,
            },
            Some(payload) = mailbox.recv() => match encode(&payload) {
                Some(text) => Message::Text(text),
                None => continue,
            },
            _ = ping.tick() => Message::Ping(Vec::new().into()),
        };

        match tokio::time::timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(client, error = %e, "Client write failed");
                break;
            }
            Err(_) => {
                tracing::debug!(client, "Client write timed out");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
}

fn encode<T: Serialize>(value: &T) -> Option<Utf8Bytes> {
    match serde_json::to_string(value) {
        Ok(text) => Some(text.into()),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode client frame");
            None
        }
    }
}
