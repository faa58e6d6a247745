//! OANDA broker against a local stub of the v20 REST API
//!
//! The account id in the path selects the stub's behavior.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use fxbot::domain::entities::order::OrderIntent;
use fxbot::domain::entities::position::ExitReason;
use fxbot::domain::entities::signal::Direction;
use fxbot::domain::errors::BrokerError;
use fxbot::domain::repositories::broker::Broker;
use fxbot::infrastructure::oanda_broker::OandaBroker;
use fxbot::infrastructure::oanda_client::{OandaClient, OandaConfig, OandaEnvironment, RetryPolicy};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zeroize::Zeroizing;

#[derive(Clone, Default)]
struct Stub {
    summary_hits: Arc<AtomicUsize>,
    order_hits: Arc<AtomicUsize>,
    last_order: Arc<Mutex<Option<Value>>>,
}

fn account_body() -> Value {
    json!({"account": {
        "balance": "100000.0000",
        "NAV": "100000.0000",
        "marginUsed": "0.0000",
        "marginAvailable": "100000.0000"
    }})
}

async fn summary(
    State(stub): State<Stub>,
    Path(account): Path<String>,
) -> (StatusCode, Json<Value>) {
    let hit = stub.summary_hits.fetch_add(1, Ordering::SeqCst);
    match account.as_str() {
        "flaky" if hit == 0 => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"errorMessage": "Too many requests"})),
        ),
        "down" => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"errorMessage": "Service unavailable"})),
        ),
        "denied" => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"errorMessage": "Insufficient authorization"})),
        ),
        _ => (StatusCode::OK, Json(account_body())),
    }
}

async fn instruments(Path(_account): Path<String>) -> Json<Value> {
    Json(json!({"instruments": [
        {"name": "EUR_USD", "displayPrecision": 5},
        {"name": "USD_JPY", "displayPrecision": 3},
        {"name": "XAU_USD", "displayPrecision": 2}
    ]}))
}

async fn orders(
    State(stub): State<Stub>,
    Path(account): Path<String>,
    Json(order): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let hit = stub.order_hits.fetch_add(1, Ordering::SeqCst);
    *stub.last_order.lock().unwrap() = Some(order);
    match account.as_str() {
        "flaky" => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"errorMessage": "Invalid value specified for 'units'"})),
            )
        }
        "slow" => tokio::time::sleep(Duration::from_millis(500)).await,
        _ => {}
    }
    let order_id = (200 + 2 * hit).to_string();
    let trade_id = (201 + 2 * hit).to_string();
    (
        StatusCode::CREATED,
        Json(json!({
            "orderCreateTransaction": {"id": order_id},
            "orderFillTransaction": {
                "id": trade_id,
                "orderID": order_id,
                "price": "1.10012",
                "tradeOpened": {"tradeID": trade_id, "units": "1000"}
            }
        })),
    )
}

async fn close_trade(
    Path((account, trade)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    if account == "stopped" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"errorCode": "NO_SUCH_TRADE"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "orderFillTransaction": {
                "id": "202",
                "price": "1.10100",
                "tradesClosed": [{"tradeID": trade, "units": "-1000"}]
            }
        })),
    )
}

// "stopped" accounts have had trade 201 stopped out at 1.09.
async fn open_trades(Path(account): Path<String>) -> Json<Value> {
    if account == "stopped" {
        return Json(json!({"trades": []}));
    }
    Json(json!({"trades": [{"id": "201", "state": "OPEN"}]}))
}

async fn trade_details(Path((_account, trade)): Path<(String, String)>) -> Json<Value> {
    Json(json!({"trade": {
        "id": trade,
        "state": "CLOSED",
        "averageClosePrice": "1.09000",
        "closeTime": "2024-03-01T10:15:00.000000000Z",
        "stopLossOrder": {"state": "FILLED"},
        "takeProfitOrder": {"state": "CANCELLED"}
    }}))
}

async fn spawn_stub() -> (String, Stub) {
    let stub = Stub::default();
    let app = Router::new()
        .route("/v3/accounts/:account/summary", get(summary))
        .route("/v3/accounts/:account/instruments", get(instruments))
        .route("/v3/accounts/:account/orders", post(orders))
        .route("/v3/accounts/:account/openTrades", get(open_trades))
        .route("/v3/accounts/:account/trades/:trade", get(trade_details))
        .route("/v3/accounts/:account/trades/:trade/close", put(close_trade))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), stub)
}

fn client(base: &str, account: &str) -> Arc<OandaClient> {
    client_with_timeout(base, account, Duration::from_secs(5))
}

fn client_with_timeout(base: &str, account: &str, timeout: Duration) -> Arc<OandaClient> {
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
    };
    let token = Zeroizing::new("a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6-0123456789abcdef".to_string());
    let config = OandaConfig::new(OandaEnvironment::Practice, account, token, retry)
        .with_api_base(base)
        .with_timeout(timeout);
    Arc::new(OandaClient::new(config).unwrap())
}

fn long_intent() -> OrderIntent {
    OrderIntent {
        run_id: "run-remote".to_string(),
        instrument: "EUR_USD".to_string(),
        side: Direction::Long,
        units: 1_000,
        price: 1.1,
        stop_loss: Some(1.09),
        take_profit: Some(1.12),
        reason_codes: vec!["forced".to_string()],
        risk_fraction: 0.0001,
        submitted_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_throttled_request_is_retried() {
    let (base, stub) = spawn_stub().await;
    let broker = OandaBroker::connect(client(&base, "flaky"), None).await;
    assert!(broker.is_ok());
    assert_eq!(stub.summary_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_client_error_fails_without_retry() {
    let (base, stub) = spawn_stub().await;
    let broker = OandaBroker::connect(client(&base, "flaky"), None).await.unwrap();

    let err = broker.place_order(&long_intent()).await.unwrap_err();
    assert!(matches!(err, BrokerError::Rejected { status: 400, .. }));
    assert_eq!(stub.order_hits.load(Ordering::SeqCst), 1);
    assert!(broker.list_open_positions("run-remote").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_server_errors_exhaust_attempts() {
    let (base, stub) = spawn_stub().await;
    let err = OandaBroker::connect(client(&base, "down"), None)
        .await
        .err()
        .unwrap();
    assert_eq!(
        err,
        BrokerError::Unavailable {
            status: 503,
            attempts: 3
        }
    );
    assert_eq!(stub.summary_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_bad_credentials_fail_fast() {
    let (base, stub) = spawn_stub().await;
    let err = OandaBroker::connect(client(&base, "denied"), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BrokerError::AuthenticationFailed(_)));
    assert_eq!(stub.summary_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_round_trip_updates_mirror() {
    let (base, _stub) = spawn_stub().await;
    let broker = OandaBroker::connect(client(&base, "good"), None).await.unwrap();

    let position = broker.place_order(&long_intent()).await.unwrap();
    assert_eq!(position.id, "201");
    assert_eq!(position.order_id, "200");
    assert_eq!(position.entry_price, 1.10012);
    assert_eq!(broker.list_open_positions("run-remote").await.unwrap().len(), 1);

    let closed = broker
        .close_position(&position.id, ExitReason::Manual)
        .await
        .unwrap();
    assert!(!closed.is_open());
    assert_eq!(closed.exit_price, Some(1.101));
    assert!((closed.realized_pnl - 0.88).abs() < 1e-6);
    assert!(matches!(
        broker.close_position(&position.id, ExitReason::Manual).await,
        Err(BrokerError::AlreadyClosed(_))
    ));
}

#[tokio::test]
async fn test_remote_stop_out_is_settled_on_mark() {
    let (base, _stub) = spawn_stub().await;
    let broker = OandaBroker::connect(client(&base, "stopped"), None).await.unwrap();
    let position = broker.place_order(&long_intent()).await.unwrap();

    let settled = broker
        .refresh_mark_to_market("EUR_USD", 1.0905, Utc::now())
        .await
        .unwrap();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].id, position.id);
    assert_eq!(settled[0].exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(settled[0].exit_price, Some(1.09));
    assert_eq!(
        settled[0].closed_at.map(|t| t.to_rfc3339()),
        Some("2024-03-01T10:15:00+00:00".to_string())
    );
    assert!(broker.list_all_open_positions().await.unwrap().is_empty());
    assert!(matches!(
        broker.close_position(&position.id, ExitReason::SignalFlip).await,
        Err(BrokerError::AlreadyClosed(_))
    ));
}

#[tokio::test]
async fn test_open_trades_survive_mark() {
    let (base, _stub) = spawn_stub().await;
    let broker = OandaBroker::connect(client(&base, "good"), None).await.unwrap();
    broker.place_order(&long_intent()).await.unwrap();

    let settled = broker
        .refresh_mark_to_market("EUR_USD", 1.1005, Utc::now())
        .await
        .unwrap();
    assert!(settled.is_empty());
    let open = broker.list_all_open_positions().await.unwrap();
    assert_eq!(open.len(), 1);
    assert!((open[0].unrealized_pnl - 0.38).abs() < 1e-6);
}

#[tokio::test]
async fn test_closing_a_vanished_trade_settles_it() {
    let (base, _stub) = spawn_stub().await;
    let broker = OandaBroker::connect(client(&base, "stopped"), None).await.unwrap();
    let position = broker.place_order(&long_intent()).await.unwrap();

    let closed = broker
        .close_position(&position.id, ExitReason::SignalFlip)
        .await
        .unwrap();
    assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(closed.exit_price, Some(1.09));
    assert!(broker.list_open_positions("run-remote").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_order_is_not_resent_after_timeout() {
    let (base, stub) = spawn_stub().await;
    let broker = OandaBroker::connect(
        client_with_timeout(&base, "slow", Duration::from_millis(200)),
        None,
    )
    .await
    .unwrap();

    let err = broker.place_order(&long_intent()).await.unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));
    assert_eq!(stub.order_hits.load(Ordering::SeqCst), 1);
    assert!(broker.list_all_open_positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_protective_prices_use_instrument_precision() {
    let (base, stub) = spawn_stub().await;
    let broker = OandaBroker::connect(client(&base, "good"), None).await.unwrap();

    let yen = OrderIntent {
        instrument: "USD_JPY".to_string(),
        price: 151.2,
        stop_loss: Some(150.51234),
        take_profit: Some(152.6),
        ..long_intent()
    };
    broker.place_order(&yen).await.unwrap();
    let sent = stub.last_order.lock().unwrap().clone().unwrap();
    assert_eq!(sent["order"]["stopLossOnFill"]["price"], "150.512");
    assert_eq!(sent["order"]["takeProfitOnFill"]["price"], "152.600");

    let gold = OrderIntent {
        instrument: "XAU_USD".to_string(),
        price: 2310.0,
        stop_loss: Some(2301.456),
        take_profit: None,
        ..long_intent()
    };
    broker.place_order(&gold).await.unwrap();
    let sent = stub.last_order.lock().unwrap().clone().unwrap();
    assert_eq!(sent["order"]["stopLossOnFill"]["price"], "2301.46");
    assert!(sent["order"].get("takeProfitOnFill").is_none());
}
