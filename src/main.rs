use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use fxbot::application::engine::TradingEngine;
use fxbot::application::event_bus::EventBus;
use fxbot::config::TradingConfig;
use fxbot::domain::entities::candle::Timeframe;
use fxbot::domain::entities::run::RunMode;
use fxbot::domain::entities::signal::Direction;
use fxbot::domain::errors::EngineError;
use fxbot::domain::repositories::broker::BrokerKind;
use fxbot::domain::services::news_filter::{CalendarBlackout, NoBlock, TradingBlock};
use fxbot::infrastructure::broker_factory::{create_broker, create_candle_source, create_oanda_client};
use fxbot::persistence::init_database;
use fxbot::persistence::repository::{RunRepository, TradeJournal};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Clone)]
struct AppState {
    engine: Arc<TradingEngine>,
    runs: RunRepository,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fxbot=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TradingConfig::from_env();
    config.validate()?;
    info!(
        "fxbot starting: {} {} with {}, {} broker",
        config.instrument, config.timeframe, config.strategy, config.broker
    );

    let pool = init_database(&config.database_url).await?;
    let oanda = create_oanda_client(&config)?;
    let candles = create_candle_source(&config, pool.clone(), oanda.clone());
    let broker = create_broker(&config, oanda, Some(TradeJournal::new(pool.clone()))).await?;
    let news: Arc<dyn TradingBlock> = match &config.news_calendar_path {
        Some(path) => Arc::new(CalendarBlackout::from_file(
            Path::new(path),
            config.news_blackout_minutes,
        )),
        None => Arc::new(NoBlock),
    };

    let runs = RunRepository::new(pool);
    let engine = Arc::new(
        TradingEngine::new(config.clone(), candles, broker, EventBus::new())?
            .with_runs(runs.clone())
            .with_news(news),
    );
    let state = AppState {
        engine: Arc::clone(&engine),
        runs,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/runs", get(list_runs))
        .route("/session/start", post(start_session))
        .route("/session/stop", post(stop_session))
        .route("/session/force-signal", post(force_signal))
        .route("/backtest", post(run_backtest))
        .route("/events", get(events_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    info!("Listening on {}", config.http_bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutting down gracefully...");
    match engine.stop().await {
        Ok(Some(run)) => info!("Sealed run {} on shutdown", run.id),
        Ok(None) => {}
        Err(e) => error!("Failed to stop session on shutdown: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn error_response(e: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        EngineError::Config(_) | EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::NotRunning => StatusCode::CONFLICT,
        EngineError::Data(_) => StatusCode::NOT_FOUND,
        EngineError::Broker(_) => StatusCode::BAD_GATEWAY,
        EngineError::Storage(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("Request failed with {}: {}", status, e);
    (status, Json(json!({ "error": e.to_string() })))
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let broker = state.engine.broker();
    let status = state.engine.status().await;
    Json(json!({
        "status": "running",
        "engine": status.state,
        "broker": broker.kind().as_str(),
        "broker_healthy": broker.is_healthy().await,
    }))
}

async fn get_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.status().await))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<i64>,
}

async fn list_runs(State(state): State<AppState>, Query(query): Query<RunsQuery>) -> ApiResult {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    let runs = state
        .runs
        .list_recent(limit)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(json!({ "runs": runs })))
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    instrument: Option<String>,
    timeframe: Option<String>,
    mode: Option<String>,
}

async fn start_session(
    State(state): State<AppState>,
    payload: Option<Json<StartRequest>>,
) -> ApiResult {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let config = state.engine.config();

    let instrument = request.instrument.unwrap_or_else(|| config.instrument.clone());
    let timeframe = match request.timeframe.as_deref() {
        Some(raw) => raw
            .parse::<Timeframe>()
            .map_err(|e| error_response(e.into()))?,
        None => config.timeframe,
    };
    let mode = match request.mode.as_deref() {
        Some(raw) => raw.parse::<RunMode>().map_err(|e| error_response(e.into()))?,
        None => match config.broker {
            BrokerKind::Paper => RunMode::Paper,
            BrokerKind::Oanda => RunMode::Live,
        },
    };

    let run = state
        .engine
        .start(&instrument, timeframe, mode)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "run": run })))
}

async fn stop_session(State(state): State<AppState>) -> ApiResult {
    let run = state.engine.stop().await.map_err(error_response)?;
    Ok(Json(json!({ "stopped": run.is_some(), "run": run })))
}

#[derive(Debug, Deserialize)]
struct ForceSignalRequest {
    direction: String,
    confidence: f64,
}

async fn force_signal(
    State(state): State<AppState>,
    Json(request): Json<ForceSignalRequest>,
) -> ApiResult {
    let direction = request
        .direction
        .parse::<Direction>()
        .map_err(bad_request)?;
    state
        .engine
        .force_signal(direction, request.confidence)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "queued": true, "direction": direction, "confidence": request.confidence })))
}

#[derive(Debug, Deserialize)]
struct BacktestRequest {
    instrument: Option<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn run_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRequest>,
) -> ApiResult {
    let instrument = request
        .instrument
        .unwrap_or_else(|| state.engine.config().instrument.clone());
    let report = state
        .engine
        .run_backtest(&instrument, request.start, request.end)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(report)))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    topic: Option<String>,
}

/// Streams bus events as JSON text frames, one topic or all of them.
async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_events(socket, state, query.topic))
}

async fn forward_events(socket: WebSocket, state: AppState, topic: Option<String>) {
    let bus = state.engine.bus();
    let mut events = match topic.as_deref() {
        Some(topic) => bus.subscribe(topic),
        None => bus.subscribe_all(),
    };
    let (mut sender, mut receiver) = socket.split();
    debug!("Event stream client connected ({:?})", topic);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Event stream client lagging, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("Event stream client disconnected");
}
