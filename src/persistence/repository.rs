//! Database Repository
//!
//! Data access layer for runs, candles, orders and positions.

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::entities::order::OrderIntent;
use crate::domain::entities::position::Position;
use crate::domain::entities::run::{Run, RunStatus};
use chrono::{DateTime, Utc};
use tracing::{debug, error};

/// Run repository
#[derive(Clone)]
pub struct RunRepository {
    pool: DbPool,
}

impl RunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, run: &Run) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, instrument, timeframe, mode, status, started_at, stopped_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&run.id)
        .bind(&run.instrument)
        .bind(run.timeframe.as_str())
        .bind(run.mode.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.stopped_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create run {}: {}", run.id, e);
            DatabaseError::QueryError(format!("Failed to create run: {}", e))
        })?;

        debug!("Created run: {} ({} {})", run.id, run.instrument, run.timeframe);
        Ok(())
    }

    /// Seals a running run. Returns false when the run was already sealed.
    pub async fn seal(
        &self,
        id: &str,
        status: RunStatus,
        stopped_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?1, stopped_at = ?2
            WHERE id = ?3 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(stopped_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to seal run {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to seal run: {}", e))
        })?
        .rows_affected();

        debug!("Sealed run {} as {} ({} rows)", id, status.as_str(), rows_affected);
        Ok(rows_affected > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Run>, DatabaseError> {
        let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get run {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get run: {}", e))
            })?;

        record.map(Run::try_from).transpose()
    }

    /// Most recent runs first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Run>, DatabaseError> {
        let records = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM runs ORDER BY started_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list runs: {}", e);
            DatabaseError::QueryError(format!("Failed to list runs: {}", e))
        })?;

        records.into_iter().map(Run::try_from).collect()
    }
}

/// Candle cache repository
#[derive(Clone)]
pub struct CandleRepository {
    pool: DbPool,
}

impl CandleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts or overwrites candles keyed by (instrument, timeframe, timestamp).
    pub async fn upsert_batch(&self, candles: &[Candle]) -> Result<usize, DatabaseError> {
        if candles.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for candle in candles {
            sqlx::query(
                r#"
                INSERT INTO candles (
                    instrument, timeframe, timestamp, open, high, low, close, volume, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(instrument, timeframe, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&candle.instrument)
            .bind(candle.timeframe.as_str())
            .bind(candle.timestamp)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to upsert candle {} {}: {}", candle.instrument, candle.timestamp, e);
                DatabaseError::QueryError(format!("Failed to upsert candle: {}", e))
            })?;
        }
        tx.commit().await?;

        debug!("Upserted {} candles", candles.len());
        Ok(candles.len())
    }

    /// Newest `n` candles in ascending time order.
    pub async fn latest(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<Candle>, DatabaseError> {
        let mut records = sqlx::query_as::<_, CandleRecord>(
            r#"
            SELECT instrument, timeframe, timestamp, open, high, low, close, volume
            FROM candles
            WHERE instrument = ?1 AND timeframe = ?2
            ORDER BY timestamp DESC
            LIMIT ?3
            "#,
        )
        .bind(instrument)
        .bind(timeframe.as_str())
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load candles for {}: {}", instrument, e);
            DatabaseError::QueryError(format!("Failed to load candles: {}", e))
        })?;

        records.reverse();
        records.into_iter().map(Candle::try_from).collect()
    }

    /// Candles with `start <= timestamp <= end`, ascending.
    pub async fn range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DatabaseError> {
        let records = sqlx::query_as::<_, CandleRecord>(
            r#"
            SELECT instrument, timeframe, timestamp, open, high, low, close, volume
            FROM candles
            WHERE instrument = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
            ORDER BY timestamp ASC
            "#,
        )
        .bind(instrument)
        .bind(timeframe.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load candle range for {}: {}", instrument, e);
            DatabaseError::QueryError(format!("Failed to load candle range: {}", e))
        })?;

        records.into_iter().map(Candle::try_from).collect()
    }
}

/// Order repository
#[derive(Clone)]
pub struct OrderRepository {
    pool: DbPool,
}

impl OrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, order: CreateOrder) -> Result<OrderRecord, DatabaseError> {
        let now = Utc::now();
        let reason_codes = serde_json::to_string(&order.reason_codes)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to encode reasons: {}", e)))?;

        let record = sqlx::query_as::<_, OrderRecord>(
            r#"
            INSERT INTO orders (
                id, run_id, position_id, broker, instrument, side, units, price,
                fill_price, stop_loss, take_profit, reason_codes, risk_fraction,
                submitted_at, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            RETURNING *
            "#,
        )
        .bind(&order.id)
        .bind(&order.run_id)
        .bind(&order.position_id)
        .bind(&order.broker)
        .bind(&order.instrument)
        .bind(order.side.as_str())
        .bind(order.units)
        .bind(order.price)
        .bind(order.fill_price)
        .bind(order.stop_loss)
        .bind(order.take_profit)
        .bind(reason_codes)
        .bind(order.risk_fraction)
        .bind(order.submitted_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create order: {}", e);
            DatabaseError::QueryError(format!("Failed to create order: {}", e))
        })?;

        debug!("Created order: {} for {}", record.id, record.instrument);
        Ok(record)
    }

    pub async fn list_by_run(&self, run_id: &str) -> Result<Vec<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE run_id = ?1 ORDER BY submitted_at ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list orders for run {}: {}", run_id, e);
            DatabaseError::QueryError(format!("Failed to list orders: {}", e))
        })
    }
}

/// Position repository
#[derive(Clone)]
pub struct PositionRepository {
    pool: DbPool,
}

impl PositionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn record_open(&self, position: &Position) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, run_id, order_id, instrument, side, entry_price, units,
                stop_loss, take_profit, status, opened_at, realized_pnl,
                unrealized_pnl, risk_fraction, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'open', ?10, 0.0, ?11, ?12, ?13)
            "#,
        )
        .bind(&position.id)
        .bind(&position.run_id)
        .bind(&position.order_id)
        .bind(&position.instrument)
        .bind(position.side.as_str())
        .bind(position.entry_price)
        .bind(position.units)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.opened_at)
        .bind(position.unrealized_pnl)
        .bind(position.risk_fraction)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record position {}: {}", position.id, e);
            DatabaseError::QueryError(format!("Failed to record position: {}", e))
        })?;

        debug!("Recorded open position: {} for {}", position.id, position.instrument);
        Ok(())
    }

    /// Refreshes unrealized PnL on an open position; closed rows are left alone.
    pub async fn update_mark(&self, id: &str, unrealized_pnl: f64) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE positions
            SET unrealized_pnl = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'open'
            "#,
        )
        .bind(unrealized_pnl)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update position {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to update position: {}", e))
        })?;

        Ok(())
    }

    /// Closes the row once. A second close fails without touching the row.
    pub async fn close(&self, position: &Position) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let rows_affected = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'closed', exit_price = ?1, exit_reason = ?2, closed_at = ?3,
                realized_pnl = ?4, unrealized_pnl = 0.0, updated_at = ?5
            WHERE id = ?6 AND status = 'open'
            "#,
        )
        .bind(position.exit_price)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.closed_at)
        .bind(position.realized_pnl)
        .bind(now)
        .bind(&position.id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to close position {}: {}", position.id, e);
            DatabaseError::QueryError(format!("Failed to close position: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Position not found or already closed: {}",
                position.id
            )));
        }

        debug!("Closed position: {}", position.id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Position>, DatabaseError> {
        let record = sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get position {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get position: {}", e))
            })?;

        record.map(Position::try_from).transpose()
    }

    pub async fn list_by_run(&self, run_id: &str) -> Result<Vec<Position>, DatabaseError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE run_id = ?1 ORDER BY opened_at ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list positions for run {}: {}", run_id, e);
            DatabaseError::QueryError(format!("Failed to list positions: {}", e))
        })?;

        records.into_iter().map(Position::try_from).collect()
    }
}

/// Write-through journal of broker activity: the order row and the
/// position row it opened, mark updates, and the single close.
#[derive(Clone)]
pub struct TradeJournal {
    orders: OrderRepository,
    positions: PositionRepository,
}

impl TradeJournal {
    pub fn new(pool: DbPool) -> Self {
        Self {
            orders: OrderRepository::new(pool.clone()),
            positions: PositionRepository::new(pool),
        }
    }

    pub fn positions(&self) -> &PositionRepository {
        &self.positions
    }

    pub fn orders(&self) -> &OrderRepository {
        &self.orders
    }

    pub async fn record_fill(
        &self,
        broker: &str,
        intent: &OrderIntent,
        position: &Position,
    ) -> Result<(), DatabaseError> {
        self.orders
            .create(CreateOrder {
                id: position.order_id.clone(),
                run_id: intent.run_id.clone(),
                position_id: Some(position.id.clone()),
                broker: broker.to_string(),
                instrument: intent.instrument.clone(),
                side: intent.side,
                units: intent.units,
                price: intent.price,
                fill_price: Some(position.entry_price),
                stop_loss: intent.stop_loss,
                take_profit: intent.take_profit,
                reason_codes: intent.reason_codes.clone(),
                risk_fraction: intent.risk_fraction,
                submitted_at: intent.submitted_at,
            })
            .await?;
        self.positions.record_open(position).await
    }

    pub async fn record_marks(&self, positions: &[Position]) -> Result<(), DatabaseError> {
        for position in positions.iter().filter(|p| p.is_open()) {
            self.positions
                .update_mark(&position.id, position.unrealized_pnl)
                .await?;
        }
        Ok(())
    }

    pub async fn record_close(&self, position: &Position) -> Result<(), DatabaseError> {
        self.positions.close(position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::{ExitReason, PositionStatus};
    use crate::domain::entities::run::RunMode;
    use crate::domain::entities::signal::Direction;
    use crate::persistence::init_database;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn candle(i: i64, close: f64) -> Candle {
        Candle::new(
            "EUR_USD",
            Timeframe::M5,
            t0() + Duration::minutes(5 * i),
            close,
            close + 0.001,
            close - 0.001,
            close,
            100.0,
        )
        .unwrap()
    }

    fn position() -> Position {
        Position {
            id: "pos-000001".to_string(),
            run_id: "run-1".to_string(),
            order_id: "ord-000001".to_string(),
            instrument: "EUR_USD".to_string(),
            side: Direction::Long,
            entry_price: 1.1,
            units: 10_000,
            stop_loss: Some(1.09),
            take_profit: Some(1.12),
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            opened_at: t0(),
            closed_at: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            risk_fraction: 0.01,
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = RunRepository::new(pool);

        let run = Run::start("EUR_USD", Timeframe::M5, RunMode::Paper);
        repo.create(&run).await.unwrap();

        assert!(repo.seal(&run.id, RunStatus::Stopped, Utc::now()).await.unwrap());
        assert!(!repo.seal(&run.id, RunStatus::Error, Utc::now()).await.unwrap());

        let loaded = repo.get(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Stopped);
        assert!(loaded.stopped_at.is_some());
        assert_eq!(repo.list_recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_candle_upsert_is_idempotent() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = CandleRepository::new(pool);

        let candles: Vec<Candle> = (0..5).map(|i| candle(i, 1.1 + i as f64 * 0.001)).collect();
        repo.upsert_batch(&candles).await.unwrap();
        repo.upsert_batch(&candles).await.unwrap();
        repo.upsert_batch(&[candle(4, 1.2)]).await.unwrap();

        let latest = repo.latest("EUR_USD", Timeframe::M5, 10).await.unwrap();
        assert_eq!(latest.len(), 5);
        assert!(latest.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(latest[4].close, 1.2);

        let last_two = repo.latest("EUR_USD", Timeframe::M5, 2).await.unwrap();
        assert_eq!(last_two[0].timestamp, candles[3].timestamp);

        let window = repo
            .range("EUR_USD", Timeframe::M5, candles[1].timestamp, candles[3].timestamp)
            .await
            .unwrap();
        assert_eq!(window.len(), 3);
    }

    #[tokio::test]
    async fn test_position_closes_once() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let journal = TradeJournal::new(pool);

        let intent = OrderIntent {
            run_id: "run-1".to_string(),
            instrument: "EUR_USD".to_string(),
            side: Direction::Long,
            units: 10_000,
            price: 1.1,
            stop_loss: Some(1.09),
            take_profit: Some(1.12),
            reason_codes: vec!["sma_crossover".to_string(), "bullish_cross".to_string()],
            risk_fraction: 0.01,
            submitted_at: t0(),
        };
        let mut pos = position();
        journal.record_fill("paper", &intent, &pos).await.unwrap();

        pos.mark(1.105);
        journal.record_marks(std::slice::from_ref(&pos)).await.unwrap();

        pos.close(1.12, t0() + Duration::hours(1), ExitReason::TakeProfit).unwrap();
        journal.record_close(&pos).await.unwrap();
        assert!(journal.record_close(&pos).await.is_err());

        let stored = journal.positions().list_by_run("run-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, PositionStatus::Closed);
        assert_eq!(stored[0].exit_reason, Some(ExitReason::TakeProfit));
        assert!((stored[0].realized_pnl - 200.0).abs() < 1e-6);

        let orders = journal.orders().list_by_run("run-1").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].reason_codes(), intent.reason_codes);
        assert_eq!(orders[0].position_id.as_deref(), Some("pos-000001"));
    }
}
