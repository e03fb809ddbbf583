//! Gateway Server Integration Tests
//!
//! Serves the downstream endpoints on a real socket, backed by subscription
//! hubs running scripted feeds.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use exchange_gateway::infrastructure::exchange::ReconnectConfig;
use exchange_gateway::infrastructure::server::{ClientConfig, serve};
use exchange_gateway::{
    AuthToken, BookUpdate, FeedError, FeedSink, FeedSource, HubConfig, MarkPrice, OrderBookLevel,
    RoomKey, ServerState, SubscriptionHub,
};

const TOKEN: &str = "s3cret";
const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Publishes a mark price for the room's symbol every few milliseconds.
struct TickingPrices;

#[async_trait]
impl FeedSource for TickingPrices {
    type Payload = MarkPrice;

    fn name(&self) -> &'static str {
        "mark_price"
    }

    async fn run(
        &self,
        key: &RoomKey,
        sink: Arc<dyn FeedSink<MarkPrice>>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        sink.connected();
        let mut ticks = tokio::time::interval(Duration::from_millis(20));
        let mut event_time = 0;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticks.tick() => {
                    event_time += 1;
                    sink.publish(MarkPrice {
                        symbol: key.symbol().to_string(),
                        price: Decimal::new(500_005, 1),
                        event_time,
                    });
                }
            }
        }
    }
}

/// Publishes a book with `levels` bids for the room.
struct TickingBooks;

#[async_trait]
impl FeedSource for TickingBooks {
    type Payload = Arc<BookUpdate>;

    fn name(&self) -> &'static str {
        "depth"
    }

    async fn run(
        &self,
        key: &RoomKey,
        sink: Arc<dyn FeedSink<Arc<BookUpdate>>>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        sink.connected();
        let levels = key.levels().unwrap_or(1);
        let mut ticks = tokio::time::interval(Duration::from_millis(20));
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticks.tick() => {
                    let bids = (0..levels)
                        .map(|i| OrderBookLevel::new((50_000 - i).to_string(), "1"))
                        .collect();
                    sink.publish(Arc::new(BookUpdate {
                        symbol: key.symbol().to_string(),
                        event_time: 1,
                        bids,
                        asks: vec![OrderBookLevel::new("50010", "1")],
                    }));
                }
            }
        }
    }
}

struct Gateway {
    addr: String,
    state: Arc<ServerState>,
    prices: SubscriptionHub<TickingPrices>,
    cancel: CancellationToken,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_gateway() -> Gateway {
    let cancel = CancellationToken::new();
    let hub_config = HubConfig {
        grace_period: Duration::from_millis(50),
        reconnect: ReconnectConfig::immediate(Duration::from_millis(20)),
    };
    let prices = SubscriptionHub::new(Arc::new(TickingPrices), hub_config.clone(), &cancel);
    let books = SubscriptionHub::new(Arc::new(TickingBooks), hub_config, &cancel);

    let state = Arc::new(ServerState::new(
        Arc::new(prices.clone()),
        Arc::new(books),
        ClientConfig::default(),
        AuthToken::new(TOKEN.to_string()),
        &cancel,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve(listener, Arc::clone(&state), cancel.clone()));

    Gateway {
        addr,
        state,
        prices,
        cancel,
    }
}

async fn connect(url: String) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, request: Value) {
    ws.send(Message::text(request.to_string())).await.unwrap();
}

/// Next text frame matching `accept`, skipping everything else.
async fn next_matching(ws: &mut Client, accept: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if accept(&value) {
                        return value;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap()
}

async fn next_notice(ws: &mut Client) -> Value {
    next_matching(ws, |v| v.get("type").is_some_and(|t| t != "book")).await
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn rejects_missing_or_wrong_token() {
    let gateway = start_gateway().await;

    for url in [
        format!("ws://{}/ws/price", gateway.addr),
        format!("ws://{}/ws/price?token=wrong", gateway.addr),
        format!("ws://{}/ws/orderbook?token=", gateway.addr),
    ] {
        let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
        let tokio_tungstenite::tungstenite::Error::Http(response) = err else {
            panic!("expected HTTP rejection, got {err:?}");
        };
        assert_eq!(response.status(), 401);
    }
    assert_eq!(gateway.state.client_count(), 0);
}

#[tokio::test]
async fn accepts_token_header() {
    let gateway = start_gateway().await;

    let mut request = format!("ws://{}/ws/price", gateway.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-auth-token", TOKEN.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    send(&mut ws, json!({"action": "ping"})).await;
    assert_eq!(next_notice(&mut ws).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn rejects_out_of_range_levels() {
    let gateway = start_gateway().await;

    for levels in [0, 1001] {
        let url = format!("ws://{}/ws/orderbook?token={TOKEN}&levels={levels}", gateway.addr);
        let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
        let tokio_tungstenite::tungstenite::Error::Http(response) = err else {
            panic!("expected HTTP rejection, got {err:?}");
        };
        assert_eq!(response.status(), 400);
    }
}

#[tokio::test]
async fn price_subscription_lifecycle() {
    let gateway = start_gateway().await;
    let mut ws = connect(format!("ws://{}/ws/price?token={TOKEN}", gateway.addr)).await;

    send(&mut ws, json!({"action": "subscribe", "symbol": "btcusdt"})).await;
    assert_eq!(
        next_notice(&mut ws).await,
        json!({"type": "subscribed", "symbol": "BTCUSDT"})
    );

    let price = next_matching(&mut ws, |v| v.get("p").is_some()).await;
    assert_eq!(price["s"], "BTCUSDT");
    assert_eq!(price["p"], "50000.5");
    assert_eq!(gateway.state.price_rooms(), 1);
    assert_eq!(gateway.state.client_count(), 1);

    send(&mut ws, json!({"action": "unsubscribe", "symbol": "BTCUSDT"})).await;
    assert_eq!(
        next_notice(&mut ws).await,
        json!({"type": "unsubscribed", "symbol": "BTCUSDT"})
    );

    // Room is torn down after the grace window.
    let prices = gateway.prices.clone();
    eventually(move || prices.room_count() == 0).await;
}

#[tokio::test]
async fn malformed_requests_get_error_notices() {
    let gateway = start_gateway().await;
    let mut ws = connect(format!("ws://{}/ws/price?token={TOKEN}", gateway.addr)).await;

    send(&mut ws, json!({"action": "explode", "symbol": "BTCUSDT"})).await;
    assert_eq!(next_notice(&mut ws).await["type"], "error");

    send(&mut ws, json!({"action": "subscribe"})).await;
    assert_eq!(next_notice(&mut ws).await["type"], "error");

    ws.send(Message::text("not json")).await.unwrap();
    assert_eq!(next_notice(&mut ws).await["type"], "error");

    // Still usable afterwards.
    send(&mut ws, json!({"action": "ping"})).await;
    assert_eq!(next_notice(&mut ws).await, json!({"type": "pong"}));
    assert_eq!(gateway.state.price_rooms(), 0);
}

#[tokio::test]
async fn orderbook_clients_get_their_depth() {
    let gateway = start_gateway().await;
    let mut ws = connect(format!(
        "ws://{}/ws/orderbook?token={TOKEN}&levels=3",
        gateway.addr
    ))
    .await;

    send(&mut ws, json!({"action": "subscribe", "symbol": "ethusdt"})).await;
    assert_eq!(
        next_notice(&mut ws).await,
        json!({"type": "subscribed", "symbol": "ETHUSDT"})
    );

    let book = next_matching(&mut ws, |v| v["type"] == "book").await;
    assert_eq!(book["s"], "ETHUSDT");
    assert_eq!(book["b"].as_array().unwrap().len(), 3);
    assert_eq!(book["b"][0], json!(["50000", "1"]));
    assert_eq!(gateway.state.book_rooms(), 1);
}

#[tokio::test]
async fn disconnect_releases_rooms() {
    let gateway = start_gateway().await;
    let mut ws = connect(format!("ws://{}/ws/price?token={TOKEN}", gateway.addr)).await;

    send(&mut ws, json!({"action": "subscribe", "symbol": "BTCUSDT"})).await;
    send(&mut ws, json!({"action": "subscribe", "symbol": "ETHUSDT"})).await;
    next_notice(&mut ws).await;
    next_notice(&mut ws).await;
    assert_eq!(gateway.state.price_rooms(), 2);

    ws.close(None).await.unwrap();
    drop(ws);

    let state = Arc::clone(&gateway.state);
    eventually(move || state.client_count() == 0 && state.price_rooms() == 0).await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let gateway = start_gateway().await;
    let mut ws = connect(format!("ws://{}/ws/price?token={TOKEN}", gateway.addr)).await;
    send(&mut ws, json!({"action": "ping"})).await;
    next_notice(&mut ws).await;

    gateway.cancel.cancel();

    let ended = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
