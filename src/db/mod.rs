//! SQLite persistence for signals, trade outcomes and open-trade tags.
//!
//! Stores:
//! - Bot signals and their lifecycle status
//! - Append-only performance records
//! - Learning tags of executed trades awaiting their close
//!
//! Decimals are stored as TEXT, timestamps as fixed-width RFC 3339 TEXT so
//! that string order is time order.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::errors::EngineError;
use crate::learning::{PerformanceStore, TradeTag};
use crate::lifecycle::SignalStore;
use crate::models::{
    BotSignal, PerformanceKey, PerformanceRecord, Regime, SignalStatus, SignalType, Timeframe,
};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored signal row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSignal {
    pub id: String,
    pub symbol: String,
    pub signal_type: String,
    pub status: String,
    pub entry_price: String,
    pub quantity: String,
    pub stop_loss: String,
    pub take_profit: String,
    pub leverage: i64,
    pub confidence: f64,
    pub rationale: String,
    pub risk_reward_ratio: f64,
    pub strategy: String,
    pub regime: String,
    pub timeframe: String,
    pub generated_at: String,
    pub processed_at: Option<String>,
    pub processed_by: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Stored performance record row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredRecord {
    pub id: i64,
    pub strategy: String,
    pub regime: String,
    pub timeframe: String,
    pub symbol: String,
    pub outcome: String,
    pub pnl: String,
    pub closed_at: String,
}

/// Stored open-trade tag row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTradeTag {
    pub symbol: String,
    pub signal_id: String,
    pub strategy: String,
    pub regime: String,
    pub timeframe: String,
    pub executed_at: String,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &'static str, value: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| EngineError::Decode {
            column,
            value: value.to_string(),
        })
}

fn parse_col<T: FromStr>(column: &'static str, value: &str) -> Result<T, EngineError> {
    value.parse().map_err(|_| EngineError::Decode {
        column,
        value: value.to_string(),
    })
}

impl TryFrom<StoredSignal> for BotSignal {
    type Error = EngineError;

    fn try_from(row: StoredSignal) -> Result<Self, Self::Error> {
        Ok(Self {
            signal_type: parse_col::<SignalType>("signal_type", &row.signal_type)?,
            status: parse_col::<SignalStatus>("status", &row.status)?,
            entry_price: parse_col::<Decimal>("entry_price", &row.entry_price)?,
            quantity: parse_col::<Decimal>("quantity", &row.quantity)?,
            stop_loss: parse_col::<Decimal>("stop_loss", &row.stop_loss)?,
            take_profit: parse_col::<Decimal>("take_profit", &row.take_profit)?,
            leverage: u32::try_from(row.leverage).map_err(|_| EngineError::Decode {
                column: "leverage",
                value: row.leverage.to_string(),
            })?,
            regime: parse_col::<Regime>("regime", &row.regime)?,
            timeframe: parse_col::<Timeframe>("timeframe", &row.timeframe)?,
            generated_at: parse_ts("generated_at", &row.generated_at)?,
            processed_at: row
                .processed_at
                .as_deref()
                .map(|v| parse_ts("processed_at", v))
                .transpose()?,
            id: row.id,
            symbol: row.symbol,
            confidence: row.confidence,
            rationale: row.rationale,
            risk_reward_ratio: row.risk_reward_ratio,
            strategy: row.strategy,
            processed_by: row.processed_by,
            rejection_reason: row.rejection_reason,
        })
    }
}

impl TryFrom<StoredRecord> for PerformanceRecord {
    type Error = EngineError;

    fn try_from(row: StoredRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            key: PerformanceKey {
                regime: parse_col("regime", &row.regime)?,
                timeframe: parse_col("timeframe", &row.timeframe)?,
                strategy: row.strategy,
            },
            outcome: parse_col("outcome", &row.outcome)?,
            pnl: parse_col("pnl", &row.pnl)?,
            closed_at: parse_ts("closed_at", &row.closed_at)?,
            symbol: row.symbol,
        })
    }
}

impl TryFrom<StoredTradeTag> for TradeTag {
    type Error = EngineError;

    fn try_from(row: StoredTradeTag) -> Result<Self, Self::Error> {
        Ok(Self {
            key: PerformanceKey {
                regime: parse_col("regime", &row.regime)?,
                timeframe: parse_col("timeframe", &row.timeframe)?,
                strategy: row.strategy,
            },
            executed_at: parse_ts("executed_at", &row.executed_at)?,
            signal_id: row.signal_id,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Signals
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_signals (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                confidence REAL NOT NULL,
                rationale TEXT NOT NULL DEFAULT '',
                risk_reward_ratio REAL NOT NULL,
                strategy TEXT NOT NULL,
                regime TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                processed_at TEXT,
                processed_by TEXT,
                rejection_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Closed trade outcomes (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                regime TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                symbol TEXT NOT NULL,
                outcome TEXT NOT NULL,
                pnl TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Executed trades awaiting close
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS open_trades (
                symbol TEXT PRIMARY KEY,
                signal_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                regime TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bot_signals_status ON bot_signals(status, generated_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_performance_closed ON performance_records(closed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Count signals per status.
    pub async fn count_by_status(&self) -> Result<Vec<(SignalStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM bot_signals GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(s, n)| -> Result<(SignalStatus, i64)> { Ok((parse_col("status", &s)?, n)) })
            .collect()
    }
}

#[async_trait]
impl SignalStore for Database {
    async fn insert_signal(&self, signal: &BotSignal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_signals (
                id, symbol, signal_type, status, entry_price, quantity, stop_loss, take_profit,
                leverage, confidence, rationale, risk_reward_ratio, strategy, regime, timeframe,
                generated_at, processed_at, processed_by, rejection_reason
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.symbol)
        .bind(signal.signal_type.as_str())
        .bind(signal.status.as_str())
        .bind(signal.entry_price.to_string())
        .bind(signal.quantity.to_string())
        .bind(signal.stop_loss.to_string())
        .bind(signal.take_profit.to_string())
        .bind(signal.leverage as i64)
        .bind(signal.confidence)
        .bind(&signal.rationale)
        .bind(signal.risk_reward_ratio)
        .bind(&signal.strategy)
        .bind(signal.regime.as_str())
        .bind(signal.timeframe.as_str())
        .bind(ts(signal.generated_at))
        .bind(signal.processed_at.map(ts))
        .bind(signal.processed_by.as_deref())
        .bind(signal.rejection_reason.as_deref())
        .execute(&self.pool)
        .await
        .context("Failed to insert signal")?;

        Ok(())
    }

    async fn get_signal(&self, id: &str) -> Result<Option<BotSignal>> {
        let row = sqlx::query_as::<_, StoredSignal>("SELECT * FROM bot_signals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch signal")?;

        Ok(row.map(BotSignal::try_from).transpose()?)
    }

    async fn list_signals(&self, status: Option<SignalStatus>, limit: u32) -> Result<Vec<BotSignal>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, StoredSignal>(
                    "SELECT * FROM bot_signals WHERE status = ? ORDER BY generated_at DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, StoredSignal>(
                    "SELECT * FROM bot_signals ORDER BY generated_at DESC LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list signals")?;

        rows.into_iter()
            .map(|r| BotSignal::try_from(r).map_err(Into::into))
            .collect()
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        from: SignalStatus,
        to: SignalStatus,
        at: DateTime<Utc>,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bot_signals SET
                status = ?,
                processed_at = ?,
                processed_by = ?,
                rejection_reason = COALESCE(?, rejection_reason)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(ts(at))
        .bind(actor)
        .bind(reason)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update signal status")?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM bot_signals WHERE status = 'PENDING' AND generated_at < ? ORDER BY generated_at",
        )
        .bind(ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl PerformanceStore for Database {
    async fn append_record(&self, record: &PerformanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO performance_records (strategy, regime, timeframe, symbol, outcome, pnl, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.key.strategy)
        .bind(record.key.regime.as_str())
        .bind(record.key.timeframe.as_str())
        .bind(&record.symbol)
        .bind(record.outcome.as_str())
        .bind(record.pnl.to_string())
        .bind(ts(record.closed_at))
        .execute(&self.pool)
        .await
        .context("Failed to append performance record")?;

        Ok(())
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<PerformanceRecord>> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            "SELECT * FROM performance_records WHERE closed_at >= ? ORDER BY closed_at, id",
        )
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch performance records")?;

        rows.into_iter()
            .map(|r| PerformanceRecord::try_from(r).map_err(Into::into))
            .collect()
    }

    async fn save_trade_tag(&self, symbol: &str, tag: &TradeTag) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO open_trades (symbol, signal_id, strategy, regime, timeframe, executed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                signal_id = excluded.signal_id,
                strategy = excluded.strategy,
                regime = excluded.regime,
                timeframe = excluded.timeframe,
                executed_at = excluded.executed_at
            "#,
        )
        .bind(symbol)
        .bind(&tag.signal_id)
        .bind(&tag.key.strategy)
        .bind(tag.key.regime.as_str())
        .bind(tag.key.timeframe.as_str())
        .bind(ts(tag.executed_at))
        .execute(&self.pool)
        .await
        .context("Failed to save trade tag")?;

        Ok(())
    }

    async fn take_trade_tag(&self, symbol: &str) -> Result<Option<TradeTag>> {
        let row = sqlx::query_as::<_, StoredTradeTag>(
            "DELETE FROM open_trades WHERE symbol = ? RETURNING *",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to take trade tag")?;

        Ok(row.map(TradeTag::try_from).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Outcome;
    use rust_decimal_macros::dec;

    fn signal(id: &str, generated_at: DateTime<Utc>) -> BotSignal {
        BotSignal {
            id: id.into(),
            symbol: "ETHUSDT".into(),
            signal_type: SignalType::Sell,
            status: SignalStatus::Pending,
            entry_price: dec!(3000.25),
            quantity: dec!(1.5),
            stop_loss: dec!(3100),
            take_profit: dec!(2800),
            leverage: 7,
            confidence: 0.72,
            rationale: "bearish confluence".into(),
            risk_reward_ratio: 2.0,
            strategy: "mtf_confluence".into(),
            regime: Regime::Bear,
            timeframe: Timeframe::H1,
            generated_at,
            processed_at: None,
            processed_by: None,
            rejection_reason: None,
        }
    }

    #[tokio::test]
    async fn test_signal_row_preserves_decimals_and_enums() {
        let db = Database::in_memory().await.unwrap();
        let original = signal("a", Utc::now());

        db.insert_signal(&original).await.unwrap();
        let loaded = db.get_signal("a").await.unwrap().unwrap();

        assert_eq!(loaded.entry_price, dec!(3000.25));
        assert_eq!(loaded.signal_type, SignalType::Sell);
        assert_eq!(loaded.regime, Regime::Bear);
        assert_eq!(loaded.timeframe, Timeframe::H1);
        assert_eq!(loaded.leverage, 7);
        assert!(db.get_signal("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_expected_status() {
        let db = Database::in_memory().await.unwrap();
        db.insert_signal(&signal("a", Utc::now())).await.unwrap();
        let now = Utc::now();

        assert!(!db
            .compare_and_set_status("a", SignalStatus::Approved, SignalStatus::Executed, now, "x", None)
            .await
            .unwrap());
        assert!(db
            .compare_and_set_status("a", SignalStatus::Pending, SignalStatus::Rejected, now, "x", Some("nope"))
            .await
            .unwrap());
        assert!(!db
            .compare_and_set_status("a", SignalStatus::Pending, SignalStatus::Approved, now, "y", None)
            .await
            .unwrap());

        let loaded = db.get_signal("a").await.unwrap().unwrap();
        assert_eq!(loaded.status, SignalStatus::Rejected);
        assert_eq!(loaded.processed_by.as_deref(), Some("x"));
        assert_eq!(loaded.rejection_reason.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        db.insert_signal(&signal("old", now - chrono::Duration::minutes(5))).await.unwrap();
        db.insert_signal(&signal("new", now)).await.unwrap();
        db.compare_and_set_status("old", SignalStatus::Pending, SignalStatus::Approved, now, "x", None)
            .await
            .unwrap();

        let all = db.list_signals(None, 10).await.unwrap();
        assert_eq!(all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["new", "old"]);

        let pending = db.list_signals(Some(SignalStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "new");

        let counts = db.count_by_status().await.unwrap();
        assert_eq!(counts, vec![(SignalStatus::Approved, 1), (SignalStatus::Pending, 1)]);
    }

    #[tokio::test]
    async fn test_trade_tag_taken_once() {
        let db = Database::in_memory().await.unwrap();
        let tag = TradeTag {
            signal_id: "a".into(),
            key: PerformanceKey {
                strategy: "mtf_confluence".into(),
                regime: Regime::Volatile,
                timeframe: Timeframe::H4,
            },
            executed_at: Utc::now(),
        };

        db.save_trade_tag("BTCUSDT", &tag).await.unwrap();
        let taken = db.take_trade_tag("BTCUSDT").await.unwrap().unwrap();

        assert_eq!(taken.signal_id, "a");
        assert_eq!(taken.key.regime, Regime::Volatile);
        assert!(db.take_trade_tag("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_since_oldest_first() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        for (mins, pnl) in [(10, dec!(5)), (30, dec!(-2)), (60 * 24 * 40, dec!(1))] {
            db.append_record(&PerformanceRecord {
                key: PerformanceKey {
                    strategy: "s".into(),
                    regime: Regime::Sideways,
                    timeframe: Timeframe::M15,
                },
                symbol: "SOLUSDT".into(),
                outcome: if pnl > Decimal::ZERO { Outcome::Win } else { Outcome::Loss },
                pnl,
                closed_at: now - chrono::Duration::minutes(mins),
            })
            .await
            .unwrap();
        }

        let records = db.records_since(now - chrono::Duration::days(30)).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pnl, dec!(-2));
        assert_eq!(records[1].pnl, dec!(5));
    }
}
