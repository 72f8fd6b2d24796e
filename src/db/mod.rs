//! SQLite persistence layer
//!
//! Every logical write is a single transaction. Decimals are stored as TEXT
//! and parsed at the row boundary; SQLite has no native decimal type and
//! floats are not allowed near money.

use std::str::FromStr;

use chrono::Utc;
use log::info;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::errors::{EngineError, EngineResult};
use crate::types::{BotStatus, GridKind, OrderSide, OrderStatus};

pub mod models;

pub use models::{
    Bot, BotLog, FlatParams, GridParams, LogLevel, NewBot, NewOrder, Order, RangeParams, User,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL UNIQUE,
    username TEXT,
    api_key_enc TEXT,
    api_secret_enc TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    symbol TEXT NOT NULL,
    grid_kind TEXT NOT NULL,
    lower_price TEXT,
    upper_price TEXT,
    grid_levels INTEGER,
    investment_amount TEXT,
    starting_price TEXT,
    flat_spread TEXT,
    flat_increment TEXT,
    buy_orders_count INTEGER,
    sell_orders_count INTEGER,
    order_size TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    total_profit TEXT NOT NULL DEFAULT '0',
    total_profit_percent TEXT NOT NULL DEFAULT '0',
    completed_cycles INTEGER NOT NULL DEFAULT 0,
    total_buy_orders INTEGER NOT NULL DEFAULT 0,
    total_sell_orders INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    stopped_at TEXT,
    last_activity_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_bots_user ON bots(user_id);
CREATE INDEX IF NOT EXISTS idx_bots_status ON bots(status);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
    exchange_order_id TEXT NOT NULL UNIQUE,
    side TEXT NOT NULL,
    level INTEGER NOT NULL,
    price TEXT NOT NULL,
    amount TEXT NOT NULL,
    total TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    fee TEXT NOT NULL DEFAULT '0',
    fee_currency TEXT,
    paired_order_id INTEGER REFERENCES orders(id),
    profit TEXT,
    created_at TEXT NOT NULL,
    filled_at TEXT,
    cancelled_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_orders_bot_status ON orders(bot_id, status);

CREATE TABLE IF NOT EXISTS bot_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_id INTEGER REFERENCES bots(id) ON DELETE CASCADE,
    user_id INTEGER,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bot_logs_bot ON bot_logs(bot_id);
"#;

/// Outcome of a handled fill, applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct FillRecord {
    pub bot_id: i64,
    pub filled_order_id: i64,
    /// Counter order to insert, if one was placed
    pub counter: Option<NewOrder>,
    /// Profit attributed to the filled order (paired sells only)
    pub profit: Option<Decimal>,
    pub new_total_profit: Option<Decimal>,
    pub new_total_profit_percent: Option<Decimal>,
    pub cycle_completed: bool,
}

/// Handle to the engine database.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (and create if missing) the database at `url`.
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);

        // A shared in-memory database only exists on one connection.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("database schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert a user keyed by chat identity, or refresh their username.
    pub async fn upsert_user(&self, chat_id: i64, username: Option<&str>) -> EngineResult<User> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (chat_id, username, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                 username = excluded.username,
                 updated_at = excluded.updated_at",
        )
        .bind(chat_id)
        .bind(username)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM users WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await?;
        map_user(&row)
    }

    pub async fn user(&self, id: i64) -> EngineResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::UserNotFound(id))?;
        map_user(&row)
    }

    /// Store an encrypted API key pair. Both halves are written together so
    /// the both-or-neither invariant holds.
    pub async fn set_credentials(
        &self,
        user_id: i64,
        api_key_enc: &str,
        api_secret_enc: &str,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE users SET api_key_enc = ?, api_secret_enc = ?, updated_at = ? WHERE id = ?",
        )
        .bind(api_key_enc)
        .bind(api_secret_enc)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::UserNotFound(user_id));
        }
        Ok(())
    }

    pub async fn clear_credentials(&self, user_id: i64) -> EngineResult<()> {
        sqlx::query(
            "UPDATE users SET api_key_enc = NULL, api_secret_enc = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bots
    // ------------------------------------------------------------------

    pub async fn insert_bot(&self, new: NewBot) -> EngineResult<Bot> {
        let result = sqlx::query(
            "INSERT INTO bots (
                 user_id, symbol, grid_kind,
                 lower_price, upper_price, grid_levels, investment_amount,
                 starting_price, flat_spread, flat_increment,
                 buy_orders_count, sell_orders_count,
                 order_size, status, created_at, started_at, last_activity_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.user_id)
        .bind(&new.symbol)
        .bind(new.grid_kind.as_str())
        .bind(new.lower_price.map(|d| d.to_string()))
        .bind(new.upper_price.map(|d| d.to_string()))
        .bind(new.grid_levels.map(|n| n as i64))
        .bind(new.investment_amount.map(|d| d.to_string()))
        .bind(new.starting_price.map(|d| d.to_string()))
        .bind(new.flat_spread.map(|d| d.to_string()))
        .bind(new.flat_increment.map(|d| d.to_string()))
        .bind(new.buy_orders_count.map(|n| n as i64))
        .bind(new.sell_orders_count.map(|n| n as i64))
        .bind(new.order_size.to_string())
        .bind(BotStatus::Active.as_str())
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.bot(result.last_insert_rowid()).await
    }

    pub async fn bot(&self, id: i64) -> EngineResult<Bot> {
        let row = sqlx::query("SELECT * FROM bots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::BotNotFound(id))?;
        map_bot(&row)
    }

    pub async fn bots_by_user(&self, user_id: i64) -> EngineResult<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM bots WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_bot).collect()
    }

    pub async fn active_bots(&self) -> EngineResult<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM bots WHERE status = 'active' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_bot).collect()
    }

    pub async fn set_bot_status(&self, id: i64, status: BotStatus) -> EngineResult<()> {
        let result = sqlx::query("UPDATE bots SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::BotNotFound(id));
        }
        Ok(())
    }

    pub async fn mark_bot_started(&self, id: i64) -> EngineResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE bots SET status = 'active', started_at = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_bot_stopped(&self, id: i64) -> EngineResult<()> {
        sqlx::query("UPDATE bots SET status = 'stopped', stopped_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_bot_activity(&self, id: i64) -> EngineResult<()> {
        sqlx::query("UPDATE bots SET last_activity_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump the monotonic placement counters.
    pub async fn add_order_counts(&self, id: i64, buys: i64, sells: i64) -> EngineResult<()> {
        sqlx::query(
            "UPDATE bots SET total_buy_orders = total_buy_orders + ?,
                             total_sell_orders = total_sell_orders + ?
             WHERE id = ?",
        )
        .bind(buys)
        .bind(sells)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a bot; orders and logs cascade.
    pub async fn delete_bot(&self, id: i64) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM bots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::BotNotFound(id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub async fn insert_order(&self, new: NewOrder) -> EngineResult<Order> {
        let order_id = insert_order_row(&self.pool, &new).await?;
        self.order(order_id).await
    }

    pub async fn order(&self, id: i64) -> EngineResult<Order> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::OrderNotFound(id))?;
        map_order(&row)
    }

    pub async fn order_by_exchange_id(&self, exchange_order_id: &str) -> EngineResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE exchange_order_id = ?")
            .bind(exchange_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_order).transpose()
    }

    /// The monitor's hot query, served by the (bot_id, status) index.
    pub async fn open_orders(&self, bot_id: i64) -> EngineResult<Vec<Order>> {
        let rows =
            sqlx::query("SELECT * FROM orders WHERE bot_id = ? AND status = 'open' ORDER BY id")
                .bind(bot_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(map_order).collect()
    }

    pub async fn open_orders_by_side(
        &self,
        bot_id: i64,
        side: OrderSide,
    ) -> EngineResult<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE bot_id = ? AND status = 'open' AND side = ? ORDER BY id",
        )
        .bind(bot_id)
        .bind(side.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_order).collect()
    }

    /// Exchange ids of every persisted open order a user holds on one
    /// symbol, across all of their bots. The stop-time orphan scan checks
    /// exchange-side orders against this set.
    pub async fn open_order_ids_for_symbol(
        &self,
        user_id: i64,
        symbol: &str,
    ) -> EngineResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT o.exchange_order_id FROM orders o
             JOIN bots b ON b.id = o.bot_id
             WHERE b.user_id = ? AND b.symbol = ? AND o.status = 'open'",
        )
        .bind(user_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("exchange_order_id")?))
            .collect()
    }

    pub async fn count_open_orders(&self, bot_id: i64) -> EngineResult<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM orders WHERE bot_id = ? AND status = 'open'")
                .bind(bot_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("n")?)
    }

    /// Atomically claim an open order as filled.
    ///
    /// Returns false when the order already left `open`; this is the
    /// monotonic status transition that makes fill dispatch idempotent.
    pub async fn claim_fill(
        &self,
        order_id: i64,
        fee: Decimal,
        fee_currency: Option<&str>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'filled', filled_at = ?, fee = ?, fee_currency = ?
             WHERE id = ? AND status = 'open'",
        )
        .bind(Utc::now())
        .bind(fee.to_string())
        .bind(fee_currency)
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark an open order cancelled. Terminal orders are left untouched.
    pub async fn mark_order_cancelled(&self, order_id: i64) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'cancelled', cancelled_at = ?
             WHERE id = ? AND status = 'open'",
        )
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Apply everything a handled fill changes, in one transaction:
    /// the counter order, profit attribution, bot statistics and activity.
    pub async fn record_fill_outcome(&self, record: FillRecord) -> EngineResult<Option<Order>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let counter = if let Some(new) = &record.counter {
            let counter_id = insert_order_row(&mut *tx, new).await?;

            match new.side {
                OrderSide::Buy => {
                    sqlx::query("UPDATE bots SET total_buy_orders = total_buy_orders + 1 WHERE id = ?")
                        .bind(record.bot_id)
                        .execute(&mut *tx)
                        .await?;
                }
                OrderSide::Sell => {
                    sqlx::query("UPDATE bots SET total_sell_orders = total_sell_orders + 1 WHERE id = ?")
                        .bind(record.bot_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }

            let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
                .bind(counter_id)
                .fetch_one(&mut *tx)
                .await?;
            Some(map_order(&row)?)
        } else {
            None
        };

        if let Some(profit) = record.profit {
            sqlx::query("UPDATE orders SET profit = ? WHERE id = ?")
                .bind(profit.to_string())
                .bind(record.filled_order_id)
                .execute(&mut *tx)
                .await?;
        }

        if let (Some(total), Some(percent)) =
            (record.new_total_profit, record.new_total_profit_percent)
        {
            sqlx::query("UPDATE bots SET total_profit = ?, total_profit_percent = ? WHERE id = ?")
                .bind(total.to_string())
                .bind(percent.to_string())
                .bind(record.bot_id)
                .execute(&mut *tx)
                .await?;
        }

        if record.cycle_completed {
            sqlx::query("UPDATE bots SET completed_cycles = completed_cycles + 1 WHERE id = ?")
                .bind(record.bot_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE bots SET last_activity_at = ? WHERE id = ?")
            .bind(now)
            .bind(record.bot_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(counter)
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    pub async fn insert_log(
        &self,
        bot_id: Option<i64>,
        user_id: Option<i64>,
        level: LogLevel,
        message: &str,
        details: Option<Value>,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO bot_logs (bot_id, user_id, level, message, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(bot_id)
        .bind(user_id)
        .bind(level.as_str())
        .bind(message)
        .bind(details.map(|d| d.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn logs_for_bot(&self, bot_id: i64, limit: i64) -> EngineResult<Vec<BotLog>> {
        let rows = sqlx::query(
            "SELECT * FROM bot_logs WHERE bot_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(bot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_log).collect()
    }
}

async fn insert_order_row<'e, E>(executor: E, new: &NewOrder) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO orders (
             bot_id, exchange_order_id, side, level, price, amount, total,
             status, paired_order_id, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?, ?)",
    )
    .bind(new.bot_id)
    .bind(new.exchange_order_id.clone())
    .bind(new.side.as_str())
    .bind(new.level)
    .bind(new.price.to_string())
    .bind(new.amount.to_string())
    .bind(new.total().to_string())
    .bind(new.paired_order_id)
    .bind(Utc::now())
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn get_dec(row: &SqliteRow, col: &str) -> EngineResult<Decimal> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw)
        .map_err(|e| EngineError::Invariant(format!("bad decimal in column {col}: {e}")))
}

fn get_opt_dec(row: &SqliteRow, col: &str) -> EngineResult<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| {
        Decimal::from_str(&s)
            .map_err(|e| EngineError::Invariant(format!("bad decimal in column {col}: {e}")))
    })
    .transpose()
}

fn get_opt_u32(row: &SqliteRow, col: &str) -> EngineResult<Option<u32>> {
    let raw: Option<i64> = row.try_get(col)?;
    Ok(raw.map(|n| n as u32))
}

fn map_user(row: &SqliteRow) -> EngineResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        username: row.try_get("username")?,
        api_key_enc: row.try_get("api_key_enc")?,
        api_secret_enc: row.try_get("api_secret_enc")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_bot(row: &SqliteRow) -> EngineResult<Bot> {
    let grid_kind: String = row.try_get("grid_kind")?;
    let status: String = row.try_get("status")?;

    Ok(Bot {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        grid_kind: GridKind::from(grid_kind.as_str()),
        lower_price: get_opt_dec(row, "lower_price")?,
        upper_price: get_opt_dec(row, "upper_price")?,
        grid_levels: get_opt_u32(row, "grid_levels")?,
        investment_amount: get_opt_dec(row, "investment_amount")?,
        starting_price: get_opt_dec(row, "starting_price")?,
        flat_spread: get_opt_dec(row, "flat_spread")?,
        flat_increment: get_opt_dec(row, "flat_increment")?,
        buy_orders_count: get_opt_u32(row, "buy_orders_count")?,
        sell_orders_count: get_opt_u32(row, "sell_orders_count")?,
        order_size: get_dec(row, "order_size")?,
        status: BotStatus::from(status.as_str()),
        total_profit: get_dec(row, "total_profit")?,
        total_profit_percent: get_dec(row, "total_profit_percent")?,
        completed_cycles: row.try_get("completed_cycles")?,
        total_buy_orders: row.try_get("total_buy_orders")?,
        total_sell_orders: row.try_get("total_sell_orders")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        stopped_at: row.try_get("stopped_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
    })
}

fn map_order(row: &SqliteRow) -> EngineResult<Order> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;

    Ok(Order {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        side: OrderSide::from(side.as_str()),
        level: row.try_get("level")?,
        price: get_dec(row, "price")?,
        amount: get_dec(row, "amount")?,
        total: get_dec(row, "total")?,
        status: OrderStatus::from(status.as_str()),
        fee: get_dec(row, "fee")?,
        fee_currency: row.try_get("fee_currency")?,
        paired_order_id: row.try_get("paired_order_id")?,
        profit: get_opt_dec(row, "profit")?,
        created_at: row.try_get("created_at")?,
        filled_at: row.try_get("filled_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

fn map_log(row: &SqliteRow) -> EngineResult<BotLog> {
    let level: String = row.try_get("level")?;
    let details: Option<String> = row.try_get("details")?;

    Ok(BotLog {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        user_id: row.try_get("user_id")?,
        level: match level.as_str() {
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        },
        message: row.try_get("message")?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        created_at: row.try_get("created_at")?,
    })
}
