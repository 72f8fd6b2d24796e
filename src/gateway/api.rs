//! Exchange capability interface - enables a fake implementation for tests

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::ExchangeError;
use crate::types::{MarketInfo, OpenOrder, OrderSide, OrderUpdate, PlacedOrder};

/// Decrypted API credentials, alive only for the duration of one call.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Result of probing an API key pair.
#[derive(Debug, Clone)]
pub struct CredentialCheck {
    pub valid: bool,
    /// Non-zero balances visible with these credentials
    pub balances: HashMap<String, Decimal>,
}

/// The set of exchange operations the engine relies on.
///
/// One real implementation (signed REST) and one mock; everything above the
/// gateway is written against this trait.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Last-trade price for one pair. Unauthenticated.
    async fn fetch_ticker(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Last-trade prices for several pairs in one request; missing symbols
    /// are omitted from the result.
    async fn fetch_tickers(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Decimal>, ExchangeError>;

    /// Market metadata for one pair. Unauthenticated.
    async fn fetch_market(&self, symbol: &str) -> Result<MarketInfo, ExchangeError>;

    /// Non-zero account balances.
    async fn fetch_balance(
        &self,
        creds: &Credentials,
    ) -> Result<HashMap<String, Decimal>, ExchangeError>;

    /// Create a limit order.
    async fn create_limit_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        amount: Decimal,
    ) -> Result<PlacedOrder, ExchangeError>;

    /// Create a market order. For buys `quantity` is the cost in quote
    /// currency; for sells it is the amount in base currency.
    async fn create_market_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<PlacedOrder, ExchangeError>;

    /// Cancel an order. Unknown orders are reported as `OrderNotFound`;
    /// the gateway treats that as success.
    async fn cancel_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), ExchangeError>;

    /// Current state of one order.
    async fn fetch_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderUpdate, ExchangeError>;

    /// All open orders, optionally restricted to one pair.
    async fn fetch_open_orders(
        &self,
        creds: &Credentials,
        symbol: Option<&str>,
    ) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Probe a key pair without storing it.
    async fn verify_credentials(
        &self,
        creds: &Credentials,
    ) -> Result<CredentialCheck, ExchangeError>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock exchange for driving the engine in tests without a network.
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    use tokio::sync::Mutex;

    use super::*;
    use crate::types::{AmountPrecision, OrderStatus};

    #[derive(Debug, Clone)]
    pub struct MockOrder {
        pub id: String,
        pub symbol: String,
        pub side: OrderSide,
        pub price: Decimal,
        pub amount: Decimal,
        pub status: OrderStatus,
        pub is_market: bool,
        pub fee: Decimal,
    }

    pub struct MockExchange {
        pub tickers: Mutex<HashMap<String, Decimal>>,
        pub markets: Mutex<HashMap<String, MarketInfo>>,
        pub balances: Mutex<HashMap<String, Decimal>>,
        pub orders: Mutex<Vec<MockOrder>>,
        pub cancelled: Mutex<Vec<String>>,
        next_id: AtomicU64,
        /// Every call fails with Transient while this counter is positive.
        transient_remaining: AtomicU32,
        /// All authenticated calls fail with InvalidCredentials.
        credentials_invalid: AtomicBool,
        /// Limit placements fail with this error while set.
        limit_order_failure: Mutex<Option<ExchangeError>>,
        /// Market orders fail with this error while set.
        market_order_failure: Mutex<Option<ExchangeError>>,
        /// Default fee charged on fills, in quote currency.
        pub fill_fee: Mutex<Decimal>,
    }

    impl MockExchange {
        pub fn new() -> Self {
            Self {
                tickers: Mutex::new(HashMap::new()),
                markets: Mutex::new(HashMap::new()),
                balances: Mutex::new(HashMap::new()),
                orders: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                transient_remaining: AtomicU32::new(0),
                credentials_invalid: AtomicBool::new(false),
                limit_order_failure: Mutex::new(None),
                market_order_failure: Mutex::new(None),
                fill_fee: Mutex::new(Decimal::ZERO),
            }
        }

        /// A mock pre-seeded with a market and a ticker, the usual setup.
        pub async fn with_market(symbol: &str, ticker: Decimal) -> Self {
            let mock = Self::new();
            mock.set_market(default_market(symbol)).await;
            mock.set_ticker(symbol, ticker).await;
            mock
        }

        pub async fn set_ticker(&self, symbol: &str, price: Decimal) {
            self.tickers.lock().await.insert(symbol.to_string(), price);
        }

        pub async fn set_market(&self, market: MarketInfo) {
            self.markets.lock().await.insert(market.symbol.clone(), market);
        }

        pub async fn set_balance(&self, currency: &str, amount: Decimal) {
            self.balances
                .lock()
                .await
                .insert(currency.to_string(), amount);
        }

        pub async fn balance_of(&self, currency: &str) -> Decimal {
            self.balances
                .lock()
                .await
                .get(currency)
                .copied()
                .unwrap_or(Decimal::ZERO)
        }

        /// Fail the next `count` calls with a transient error.
        pub fn inject_transient(&self, count: u32) {
            self.transient_remaining.store(count, Ordering::SeqCst);
        }

        pub fn set_credentials_invalid(&self, invalid: bool) {
            self.credentials_invalid.store(invalid, Ordering::SeqCst);
        }

        pub async fn fail_limit_orders_with(&self, error: Option<ExchangeError>) {
            *self.limit_order_failure.lock().await = error;
        }

        pub async fn fail_market_orders_with(&self, error: Option<ExchangeError>) {
            *self.market_order_failure.lock().await = error;
        }

        /// Mark a resting order filled, as the exchange would.
        pub async fn fill_order(&self, order_id: &str) {
            if let Some(order) = self
                .orders
                .lock()
                .await
                .iter_mut()
                .find(|o| o.id == order_id)
            {
                order.status = OrderStatus::Filled;
                order.fee = *self.fill_fee.lock().await;
            }
        }

        pub async fn open_order_count(&self) -> usize {
            self.orders
                .lock()
                .await
                .iter()
                .filter(|o| o.status == OrderStatus::Open)
                .count()
        }

        pub async fn find_order(&self, order_id: &str) -> Option<MockOrder> {
            self.orders
                .lock()
                .await
                .iter()
                .find(|o| o.id == order_id)
                .cloned()
        }

        fn next_order_id(&self) -> String {
            format!("M{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn check_transient(&self) -> Result<(), ExchangeError> {
            let remaining = self.transient_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(ExchangeError::Transient("injected".into()));
            }
            Ok(())
        }

        fn check_auth(&self) -> Result<(), ExchangeError> {
            if self.credentials_invalid.load(Ordering::SeqCst) {
                return Err(ExchangeError::InvalidCredentials);
            }
            Ok(())
        }
    }

    impl Default for MockExchange {
        fn default() -> Self {
            Self::new()
        }
    }

    /// A market with 2-decimal prices and a 0.0001 amount step.
    pub fn default_market(symbol: &str) -> MarketInfo {
        let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USDT"));
        MarketInfo {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            price_precision: 2,
            amount_precision: AmountPrecision::DecimalPlaces(4),
            min_order_amount: Decimal::new(1, 4),
            min_order_cost: Decimal::ONE,
            active: true,
        }
    }

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn fetch_ticker(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
            self.check_transient()?;
            self.tickers
                .lock()
                .await
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
        }

        async fn fetch_tickers(
            &self,
            symbols: &[String],
        ) -> Result<HashMap<String, Decimal>, ExchangeError> {
            self.check_transient()?;
            let tickers = self.tickers.lock().await;
            Ok(symbols
                .iter()
                .filter_map(|s| tickers.get(s).map(|p| (s.clone(), *p)))
                .collect())
        }

        async fn fetch_market(&self, symbol: &str) -> Result<MarketInfo, ExchangeError> {
            self.check_transient()?;
            self.markets
                .lock()
                .await
                .get(symbol)
                .cloned()
                .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
        }

        async fn fetch_balance(
            &self,
            _creds: &Credentials,
        ) -> Result<HashMap<String, Decimal>, ExchangeError> {
            self.check_transient()?;
            self.check_auth()?;
            Ok(self
                .balances
                .lock()
                .await
                .iter()
                .filter(|(_, amount)| **amount > Decimal::ZERO)
                .map(|(c, a)| (c.clone(), *a))
                .collect())
        }

        async fn create_limit_order(
            &self,
            _creds: &Credentials,
            symbol: &str,
            side: OrderSide,
            price: Decimal,
            amount: Decimal,
        ) -> Result<PlacedOrder, ExchangeError> {
            self.check_transient()?;
            self.check_auth()?;
            if let Some(error) = self.limit_order_failure.lock().await.clone() {
                return Err(error);
            }

            let id = self.next_order_id();
            self.orders.lock().await.push(MockOrder {
                id: id.clone(),
                symbol: symbol.to_string(),
                side,
                price,
                amount,
                status: OrderStatus::Open,
                is_market: false,
                fee: Decimal::ZERO,
            });

            Ok(PlacedOrder {
                exchange_order_id: id,
                status: OrderStatus::Open,
                filled: Decimal::ZERO,
                remaining: amount,
                price,
                amount,
                average_price: None,
                fee: Decimal::ZERO,
                fee_currency: None,
            })
        }

        async fn create_market_order(
            &self,
            _creds: &Credentials,
            symbol: &str,
            side: OrderSide,
            quantity: Decimal,
        ) -> Result<PlacedOrder, ExchangeError> {
            self.check_transient()?;
            self.check_auth()?;
            if let Some(error) = self.market_order_failure.lock().await.clone() {
                return Err(error);
            }

            let ticker = self
                .tickers
                .lock()
                .await
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))?;
            let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USDT"));

            // Buys spend quote and receive base; sells the reverse.
            let amount = match side {
                OrderSide::Buy => quantity / ticker,
                OrderSide::Sell => quantity,
            };
            {
                let mut balances = self.balances.lock().await;
                match side {
                    OrderSide::Buy => {
                        *balances.entry(base.to_string()).or_default() += amount;
                        *balances.entry(quote.to_string()).or_default() -= quantity;
                    }
                    OrderSide::Sell => {
                        *balances.entry(base.to_string()).or_default() -= amount;
                        *balances.entry(quote.to_string()).or_default() += amount * ticker;
                    }
                }
            }

            let id = self.next_order_id();
            self.orders.lock().await.push(MockOrder {
                id: id.clone(),
                symbol: symbol.to_string(),
                side,
                price: ticker,
                amount,
                status: OrderStatus::Filled,
                is_market: true,
                fee: Decimal::ZERO,
            });

            Ok(PlacedOrder {
                exchange_order_id: id,
                status: OrderStatus::Filled,
                filled: amount,
                remaining: Decimal::ZERO,
                price: ticker,
                amount,
                average_price: Some(ticker),
                fee: Decimal::ZERO,
                fee_currency: Some(quote.to_string()),
            })
        }

        async fn cancel_order(
            &self,
            _creds: &Credentials,
            _symbol: &str,
            order_id: &str,
        ) -> Result<(), ExchangeError> {
            self.check_transient()?;
            self.check_auth()?;

            let mut orders = self.orders.lock().await;
            match orders.iter_mut().find(|o| o.id == order_id) {
                Some(order) if order.status == OrderStatus::Open => {
                    order.status = OrderStatus::Cancelled;
                    self.cancelled.lock().await.push(order_id.to_string());
                    Ok(())
                }
                Some(_) | None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
            }
        }

        async fn fetch_order(
            &self,
            _creds: &Credentials,
            _symbol: &str,
            order_id: &str,
        ) -> Result<OrderUpdate, ExchangeError> {
            self.check_transient()?;
            self.check_auth()?;

            let orders = self.orders.lock().await;
            let order = orders
                .iter()
                .find(|o| o.id == order_id)
                .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;

            let filled = if order.status == OrderStatus::Filled {
                order.amount
            } else {
                Decimal::ZERO
            };

            Ok(OrderUpdate {
                exchange_order_id: order.id.clone(),
                status: order.status,
                side: order.side,
                price: order.price,
                amount: order.amount,
                filled,
                remaining: order.amount - filled,
                average_price: None,
                fee: order.fee,
                fee_currency: Some("USDT".to_string()),
            })
        }

        async fn fetch_open_orders(
            &self,
            _creds: &Credentials,
            symbol: Option<&str>,
        ) -> Result<Vec<OpenOrder>, ExchangeError> {
            self.check_transient()?;
            self.check_auth()?;

            Ok(self
                .orders
                .lock()
                .await
                .iter()
                .filter(|o| o.status == OrderStatus::Open)
                .filter(|o| symbol.map_or(true, |s| o.symbol == s))
                .map(|o| OpenOrder {
                    exchange_order_id: o.id.clone(),
                    symbol: o.symbol.clone(),
                    side: o.side,
                    price: o.price,
                    amount: o.amount,
                    filled: Decimal::ZERO,
                })
                .collect())
        }

        async fn verify_credentials(
            &self,
            creds: &Credentials,
        ) -> Result<CredentialCheck, ExchangeError> {
            self.check_transient()?;
            if self.credentials_invalid.load(Ordering::SeqCst) {
                return Ok(CredentialCheck {
                    valid: false,
                    balances: HashMap::new(),
                });
            }
            Ok(CredentialCheck {
                valid: true,
                balances: self.fetch_balance(creds).await?,
            })
        }
    }
}
