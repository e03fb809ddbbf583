//! Execution RPC Integration Tests
//!
//! Drives the trading client against a mock exchange WebSocket on a real
//! socket: correlation under reordered responses, exchange errors, timeouts,
//! dropped connections and the REST fallback.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use exchange_gateway::domain::trading::OrderRef;
use exchange_gateway::infrastructure::exchange::{
    ConnectionConfig, ExecutionRpcClient, ReconnectConfig, RestClient, RestConfig, RetryConfig,
    RpcClientConfig, RpcError, Signer,
};
use exchange_gateway::{Credentials, ExecutionRoute, TradeChannel, TradeCommand, TradeExecutor};

/// How the mock answers trading requests other than logon.
#[derive(Clone, Copy)]
enum Behavior {
    /// Collect `n` requests, then answer them in reverse order.
    Reverse(usize),
    /// Answer every request with an exchange error.
    Reject,
    /// Never answer.
    Silent,
    /// Close the socket on the first request.
    Hangup,
}

/// Accept one trading connection and serve it.
async fn mock_exchange(behavior: Behavior) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut held: Vec<Value> = Vec::new();

        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let request: Value = serde_json::from_str(text.as_str()).unwrap();
            let id = request["id"].clone();

            if request["method"] == "session.logon" {
                let reply = json!({"id": id, "status": 200, "result": {"authorizedSince": 1}});
                ws.send(Message::text(reply.to_string())).await.unwrap();
                continue;
            }

            match behavior {
                Behavior::Reverse(n) => {
                    held.push(request);
                    if held.len() == n {
                        for request in held.drain(..).rev() {
                            let reply = json!({
                                "id": request["id"],
                                "status": 200,
                                "result": {"orderId": request["params"]["orderId"]},
                            });
                            ws.send(Message::text(reply.to_string())).await.unwrap();
                        }
                    }
                }
                Behavior::Reject => {
                    let reply = json!({
                        "id": id,
                        "status": 400,
                        "error": {"code": -2013, "msg": "Order does not exist."},
                    });
                    ws.send(Message::text(reply.to_string())).await.unwrap();
                }
                Behavior::Silent => {}
                Behavior::Hangup => {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    });

    format!("ws://{addr}")
}

/// Accept any number of trading connections and answer each request after
/// `delay`. Returns the URL and the number of connections accepted so far.
async fn slow_exchange(delay: Duration) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    if request["method"] != "session.logon" {
                        tokio::time::sleep(delay).await;
                    }
                    let reply = json!({"id": request["id"], "status": 200, "result": {"orderId": 1}});
                    if ws.send(Message::text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), connections)
}

fn signer() -> Signer {
    Signer::new(Credentials::new("key".to_string(), "secret".to_string()))
}

fn client(url: &str, request_timeout: Duration, cancel: &CancellationToken) -> ExecutionRpcClient {
    let config = RpcClientConfig {
        connection: ConnectionConfig::new(url),
        request_timeout,
        reconnect: ReconnectConfig::immediate(Duration::from_millis(50)),
    };
    ExecutionRpcClient::new(config, signer(), cancel)
}

fn order_status(order_id: u64) -> TradeCommand {
    TradeCommand::OrderStatus {
        symbol: "BTCUSDT".to_string(),
        order: OrderRef::OrderId(order_id),
    }
}

#[tokio::test]
async fn concurrent_requests_receive_their_own_responses() {
    const N: u64 = 16;
    let url = mock_exchange(Behavior::Reverse(N as usize)).await;
    let cancel = CancellationToken::new();
    let rpc = Arc::new(client(&url, Duration::from_secs(5), &cancel));
    rpc.connect().await.unwrap();
    assert!(rpc.is_connected());

    let tasks: Vec<_> = (1..=N)
        .map(|order_id| {
            let rpc = Arc::clone(&rpc);
            tokio::spawn(async move { (order_id, rpc.execute(&order_status(order_id)).await) })
        })
        .collect();

    for task in tasks {
        let (order_id, result) = task.await.unwrap();
        assert_eq!(result.unwrap()["orderId"], json!(order_id));
    }

    rpc.shutdown();
}

#[tokio::test]
async fn exchange_errors_carry_code_and_message() {
    let url = mock_exchange(Behavior::Reject).await;
    let cancel = CancellationToken::new();
    let rpc = client(&url, Duration::from_secs(5), &cancel);
    rpc.connect().await.unwrap();

    let err = rpc.execute(&order_status(7)).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Exchange {
            code: -2013,
            msg: "Order does not exist.".to_string()
        }
    );

    rpc.shutdown();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let url = mock_exchange(Behavior::Silent).await;
    let cancel = CancellationToken::new();
    let rpc = client(&url, Duration::from_millis(200), &cancel);
    rpc.connect().await.unwrap();

    let err = rpc.execute(&order_status(7)).await.unwrap_err();
    assert_eq!(err, RpcError::Timeout(Duration::from_millis(200)));
    assert!(!err.is_unsent());

    rpc.shutdown();
}

#[tokio::test]
async fn dropped_connection_fails_pending_request() {
    let url = mock_exchange(Behavior::Hangup).await;
    let cancel = CancellationToken::new();
    let rpc = client(&url, Duration::from_secs(5), &cancel);
    rpc.connect().await.unwrap();

    let err = rpc.execute(&order_status(7)).await.unwrap_err();
    assert_eq!(err, RpcError::ConnectionClosed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!rpc.is_connected());
    assert_eq!(
        rpc.execute(&order_status(8)).await.unwrap_err(),
        RpcError::ConnectionClosed
    );

    rpc.shutdown();
}

#[tokio::test]
async fn shutdown_fails_pending_requests() {
    let url = mock_exchange(Behavior::Silent).await;
    let cancel = CancellationToken::new();
    let rpc = Arc::new(client(&url, Duration::from_secs(5), &cancel));
    rpc.connect().await.unwrap();

    let pending = {
        let rpc = Arc::clone(&rpc);
        tokio::spawn(async move { rpc.execute(&order_status(7)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    rpc.shutdown();

    assert_eq!(pending.await.unwrap().unwrap_err(), RpcError::ConnectionClosed);
}

#[tokio::test]
async fn reconnect_request_keeps_healthy_session() {
    let (url, connections) = slow_exchange(Duration::from_millis(300)).await;
    let cancel = CancellationToken::new();
    let rpc = Arc::new(client(&url, Duration::from_secs(5), &cancel));
    rpc.connect().await.unwrap();

    let in_flight = {
        let rpc = Arc::clone(&rpc);
        tokio::spawn(async move { rpc.execute(&order_status(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    rpc.trigger_reconnect();

    let result = in_flight.await.unwrap();
    assert_eq!(result.unwrap()["orderId"], json!(1));
    assert!(rpc.is_connected());
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    rpc.shutdown();
}

#[tokio::test]
async fn executor_falls_back_to_rest_when_disconnected() {
    let rest_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol": "BTCUSDT", "positionAmt": "0.010", "entryPrice": "50000.0"}
        ])))
        .expect(1)
        .mount(&rest_server)
        .await;

    let cancel = CancellationToken::new();
    // Nothing listens here; the reconnect loop keeps failing until cancelled.
    let rpc = Arc::new(client("ws://127.0.0.1:9", Duration::from_secs(1), &cancel));
    let rest = Arc::new(
        RestClient::new(
            &RestConfig {
                base_url: rest_server.uri(),
                timeout: Duration::from_secs(2),
                retry: RetryConfig::default(),
            },
            signer(),
        )
        .unwrap(),
    );
    let executor = TradeExecutor::new(Arc::clone(&rpc), rest);

    let execution = executor
        .execute(&TradeCommand::QueryPosition { symbol: None })
        .await
        .unwrap();

    assert_eq!(execution.route, ExecutionRoute::Fallback);
    assert_eq!(execution.result[0]["symbol"], "BTCUSDT");

    cancel.cancel();
}
