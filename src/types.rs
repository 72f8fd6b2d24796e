//! Core data types shared across the trading engine

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "bid" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Grid flavour a bot runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridKind {
    /// Arithmetic levels across a fixed [lower, upper] range
    Range,
    /// Symmetric offsets around a starting price
    Flat,
}

impl GridKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridKind::Range => "range",
            GridKind::Flat => "flat",
        }
    }
}

impl From<&str> for GridKind {
    fn from(s: &str) -> Self {
        match s {
            "flat" => GridKind::Flat,
            _ => GridKind::Range,
        }
    }
}

/// Bot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Active,
    Paused,
    Stopped,
}

impl BotStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, BotStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Active => "active",
            BotStatus::Paused => "paused",
            BotStatus::Stopped => "stopped",
        }
    }
}

impl From<&str> for BotStatus {
    fn from(s: &str) -> Self {
        match s {
            "active" => BotStatus::Active,
            "paused" => BotStatus::Paused,
            _ => BotStatus::Stopped,
        }
    }
}

/// Persisted order status
///
/// Moves monotonically through `open -> {filled, cancelled, error}`; a
/// terminal status never re-opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Error,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Open)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Error => "error",
        }
    }
}

impl From<&str> for OrderStatus {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "open" | "new" | "partially_filled" => OrderStatus::Open,
            "filled" | "closed" => OrderStatus::Filled,
            "cancelled" | "canceled" | "expired" => OrderStatus::Cancelled,
            _ => OrderStatus::Error,
        }
    }
}

/// Amount precision as published by the exchange.
///
/// Exchanges report this either as a decimal-place count (an integer >= 1)
/// or as a fractional step size (a number < 1); consumers must accept both
/// forms, so every rounding decision goes through this type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AmountPrecision {
    DecimalPlaces(u32),
    Step(Decimal),
}

impl AmountPrecision {
    /// Interpret a raw precision value from exchange metadata.
    pub fn from_raw(raw: Decimal) -> Self {
        if raw >= Decimal::ONE {
            AmountPrecision::DecimalPlaces(raw.to_u32().unwrap_or(8))
        } else if raw > Decimal::ZERO {
            AmountPrecision::Step(raw)
        } else {
            AmountPrecision::DecimalPlaces(8)
        }
    }

    /// The smallest legal amount increment.
    pub fn step(&self) -> Decimal {
        match self {
            AmountPrecision::DecimalPlaces(places) => Decimal::new(1, *places),
            AmountPrecision::Step(step) => *step,
        }
    }

    /// Round an amount down to the nearest legal step.
    pub fn round_down(&self, amount: Decimal) -> Decimal {
        let step = self.step();
        if step <= Decimal::ZERO {
            return amount;
        }
        (amount / step).floor() * step
    }
}

impl Default for AmountPrecision {
    fn default() -> Self {
        AmountPrecision::DecimalPlaces(8)
    }
}

/// Market metadata for one trading pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    /// Decimal places for prices
    pub price_precision: u32,
    pub amount_precision: AmountPrecision,
    /// Minimum order amount in base currency
    pub min_order_amount: Decimal,
    /// Minimum order cost in quote currency
    pub min_order_cost: Decimal,
    pub active: bool,
}

/// Result of creating an order on the exchange
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub price: Decimal,
    pub amount: Decimal,
    /// Average fill price, where the exchange reports one (market orders)
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
}

/// Snapshot of an order's state on the exchange
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
}

/// An open order as listed by the exchange
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled: Decimal,
}

/// Split a `BASE/QUOTE` pair into its currencies.
pub fn split_symbol(symbol: &str) -> EngineResult<(&str, &str)> {
    match symbol.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok((base, quote)),
        _ => Err(EngineError::InvalidConfig(format!(
            "invalid trading pair: {symbol}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_order_status_monotonic_predicates() {
        assert!(OrderStatus::Open.is_open());
        assert!(!OrderStatus::Open.is_terminal());
        for status in [OrderStatus::Filled, OrderStatus::Cancelled, OrderStatus::Error] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn test_order_status_from_exchange_strings() {
        assert_eq!(OrderStatus::from("NEW"), OrderStatus::Open);
        assert_eq!(OrderStatus::from("PARTIALLY_FILLED"), OrderStatus::Open);
        assert_eq!(OrderStatus::from("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::from("CANCELED"), OrderStatus::Cancelled);
    }

    #[test]
    fn test_amount_precision_both_forms() {
        // 3 decimal places and a 0.001 step are the same unit
        let places = AmountPrecision::from_raw(dec!(3));
        let step = AmountPrecision::from_raw(dec!(0.001));

        assert_eq!(places, AmountPrecision::DecimalPlaces(3));
        assert_eq!(step, AmountPrecision::Step(dec!(0.001)));
        assert_eq!(places.step(), dec!(0.001));
        assert_eq!(step.step(), dec!(0.001));
    }

    #[test]
    fn test_amount_precision_round_down() {
        let precision = AmountPrecision::DecimalPlaces(3);
        assert_eq!(precision.round_down(dec!(0.0384615)), dec!(0.038));

        let step = AmountPrecision::Step(dec!(0.5));
        assert_eq!(step.round_down(dec!(1.7)), dec!(1.5));
    }

    #[test]
    fn test_split_symbol() {
        let (base, quote) = split_symbol("ETH/USDT").unwrap();
        assert_eq!(base, "ETH");
        assert_eq!(quote, "USDT");

        assert!(split_symbol("ETHUSDT").is_err());
        assert!(split_symbol("/USDT").is_err());
    }
}
