//! Persisted row types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EngineError, EngineResult};
use crate::types::{split_symbol, BotStatus, GridKind, OrderSide, OrderStatus};

/// A chat user with (optionally) stored exchange credentials.
///
/// Credentials are opaque ciphertext here; only the gateway decrypts them.
/// They are either both present or both absent.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
    pub api_key_enc: Option<String>,
    pub api_secret_enc: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_credentials(&self) -> bool {
        self.api_key_enc.is_some() && self.api_secret_enc.is_some()
    }
}

/// Validated range-grid parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeParams {
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub grid_levels: u32,
    pub investment_amount: Decimal,
}

/// Validated flat-grid parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatParams {
    pub starting_price: Decimal,
    pub flat_spread: Decimal,
    pub flat_increment: Decimal,
    pub buy_orders_count: u32,
    pub sell_orders_count: u32,
}

/// Typed view over a bot's grid configuration columns.
#[derive(Debug, Clone, PartialEq)]
pub enum GridParams {
    Range(RangeParams),
    Flat(FlatParams),
}

/// A grid bot: immutable configuration plus mutable lifecycle fields.
#[derive(Debug, Clone)]
pub struct Bot {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub grid_kind: GridKind,
    pub lower_price: Option<Decimal>,
    pub upper_price: Option<Decimal>,
    pub grid_levels: Option<u32>,
    pub investment_amount: Option<Decimal>,
    pub starting_price: Option<Decimal>,
    pub flat_spread: Option<Decimal>,
    pub flat_increment: Option<Decimal>,
    pub buy_orders_count: Option<u32>,
    pub sell_orders_count: Option<u32>,
    /// Target cost in quote currency per order, identical for every level
    pub order_size: Decimal,
    pub status: BotStatus,
    pub total_profit: Decimal,
    pub total_profit_percent: Decimal,
    pub completed_cycles: i64,
    pub total_buy_orders: i64,
    pub total_sell_orders: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Bot {
    /// The typed grid parameters for this bot.
    ///
    /// Missing columns for the bot's kind are an internal invariant
    /// violation: the manager validates configuration before insert.
    pub fn params(&self) -> EngineResult<GridParams> {
        match self.grid_kind {
            GridKind::Range => Ok(GridParams::Range(RangeParams {
                lower_price: self.column(self.lower_price, "lower_price")?,
                upper_price: self.column(self.upper_price, "upper_price")?,
                grid_levels: self.column(self.grid_levels, "grid_levels")?,
                investment_amount: self.column(self.investment_amount, "investment_amount")?,
            })),
            GridKind::Flat => Ok(GridParams::Flat(FlatParams {
                starting_price: self.column(self.starting_price, "starting_price")?,
                flat_spread: self.column(self.flat_spread, "flat_spread")?,
                flat_increment: self.column(self.flat_increment, "flat_increment")?,
                buy_orders_count: self.column(self.buy_orders_count, "buy_orders_count")?,
                sell_orders_count: self.column(self.sell_orders_count, "sell_orders_count")?,
            })),
        }
    }

    fn column<T>(&self, value: Option<T>, name: &str) -> EngineResult<T> {
        value.ok_or_else(|| {
            EngineError::Invariant(format!(
                "bot {} ({}) is missing {name}",
                self.id,
                self.grid_kind.as_str()
            ))
        })
    }

    pub fn base_currency(&self) -> EngineResult<&str> {
        Ok(split_symbol(&self.symbol)?.0)
    }

    pub fn quote_currency(&self) -> EngineResult<&str> {
        Ok(split_symbol(&self.symbol)?.1)
    }

    /// How many open orders a fully laddered bot keeps.
    pub fn expected_open_orders(&self) -> u32 {
        match self.grid_kind {
            GridKind::Range => self.grid_levels.unwrap_or(0),
            GridKind::Flat => {
                self.buy_orders_count.unwrap_or(0) + self.sell_orders_count.unwrap_or(0)
            }
        }
    }

    /// Capital base used for profit-percent and balance-buffer checks.
    ///
    /// Range bots measure against the configured investment; flat bots
    /// against the total cost of a full ladder.
    pub fn capital_base(&self) -> Decimal {
        match self.grid_kind {
            GridKind::Range => self.investment_amount.unwrap_or(Decimal::ZERO),
            GridKind::Flat => {
                Decimal::from(self.expected_open_orders()) * self.order_size
            }
        }
    }
}

/// A limit (or market) order the system placed.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: i64,
    pub bot_id: i64,
    pub exchange_order_id: String,
    pub side: OrderSide,
    /// Ladder index for range grids, center offset for flat grids
    pub level: i64,
    pub price: Decimal,
    pub amount: Decimal,
    /// price * amount at placement time
    pub total: Decimal,
    pub status: OrderStatus,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    /// A realized sell links back to the buy that created it
    pub paired_order_id: Option<i64>,
    pub profit: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Severity of a bot activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Bot activity log row.
#[derive(Debug, Clone)]
pub struct BotLog {
    pub id: i64,
    pub bot_id: Option<i64>,
    pub user_id: Option<i64>,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Input for inserting a bot.
#[derive(Debug, Clone)]
pub struct NewBot {
    pub user_id: i64,
    pub symbol: String,
    pub grid_kind: GridKind,
    pub lower_price: Option<Decimal>,
    pub upper_price: Option<Decimal>,
    pub grid_levels: Option<u32>,
    pub investment_amount: Option<Decimal>,
    pub starting_price: Option<Decimal>,
    pub flat_spread: Option<Decimal>,
    pub flat_increment: Option<Decimal>,
    pub buy_orders_count: Option<u32>,
    pub sell_orders_count: Option<u32>,
    pub order_size: Decimal,
}

impl NewBot {
    pub fn range(
        user_id: i64,
        symbol: impl Into<String>,
        params: RangeParams,
        order_size: Decimal,
    ) -> Self {
        Self {
            user_id,
            symbol: symbol.into(),
            grid_kind: GridKind::Range,
            lower_price: Some(params.lower_price),
            upper_price: Some(params.upper_price),
            grid_levels: Some(params.grid_levels),
            investment_amount: Some(params.investment_amount),
            starting_price: None,
            flat_spread: None,
            flat_increment: None,
            buy_orders_count: None,
            sell_orders_count: None,
            order_size,
        }
    }

    pub fn flat(
        user_id: i64,
        symbol: impl Into<String>,
        params: FlatParams,
        order_size: Decimal,
    ) -> Self {
        Self {
            user_id,
            symbol: symbol.into(),
            grid_kind: GridKind::Flat,
            lower_price: None,
            upper_price: None,
            grid_levels: None,
            investment_amount: None,
            starting_price: Some(params.starting_price),
            flat_spread: Some(params.flat_spread),
            flat_increment: Some(params.flat_increment),
            buy_orders_count: Some(params.buy_orders_count),
            sell_orders_count: Some(params.sell_orders_count),
            order_size,
        }
    }
}

/// Input for inserting an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub bot_id: i64,
    pub exchange_order_id: String,
    pub side: OrderSide,
    pub level: i64,
    pub price: Decimal,
    pub amount: Decimal,
    pub paired_order_id: Option<i64>,
}

impl NewOrder {
    pub fn total(&self) -> Decimal {
        self.price * self.amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn range_bot() -> Bot {
        Bot {
            id: 1,
            user_id: 1,
            symbol: "ETH/USDT".into(),
            grid_kind: GridKind::Range,
            lower_price: Some(dec!(1800)),
            upper_price: Some(dec!(2200)),
            grid_levels: Some(10),
            investment_amount: Some(dec!(100)),
            starting_price: None,
            flat_spread: None,
            flat_increment: None,
            buy_orders_count: None,
            sell_orders_count: None,
            order_size: dec!(10),
            status: BotStatus::Active,
            total_profit: Decimal::ZERO,
            total_profit_percent: Decimal::ZERO,
            completed_cycles: 0,
            total_buy_orders: 0,
            total_sell_orders: 0,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_activity_at: None,
        }
    }

    #[test]
    fn test_range_params_view() {
        let bot = range_bot();
        match bot.params().unwrap() {
            GridParams::Range(p) => {
                assert_eq!(p.lower_price, dec!(1800));
                assert_eq!(p.grid_levels, 10);
            }
            GridParams::Flat(_) => panic!("expected range params"),
        }
    }

    #[test]
    fn test_missing_column_is_invariant_error() {
        let mut bot = range_bot();
        bot.upper_price = None;
        assert!(bot.params().is_err());
    }

    #[test]
    fn test_currencies() {
        let bot = range_bot();
        assert_eq!(bot.base_currency().unwrap(), "ETH");
        assert_eq!(bot.quote_currency().unwrap(), "USDT");
    }

    #[test]
    fn test_flat_capital_base() {
        let mut bot = range_bot();
        bot.grid_kind = GridKind::Flat;
        bot.buy_orders_count = Some(3);
        bot.sell_orders_count = Some(3);
        // 6 orders x 10 USDT
        assert_eq!(bot.capital_base(), dec!(60));
        assert_eq!(bot.expected_open_orders(), 6);
    }
}
