//! Normalized exchange access: credentials, caching, retry
//!
//! The gateway is the only place credentials are decrypted and the only
//! place exchange errors are retried. Everything above it sees normalized
//! operations and the typed error taxonomy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use rust_decimal::Decimal;

use crate::db::Db;
use crate::errors::{EngineError, EngineResult, ExchangeError};
use crate::security::CredentialCipher;
use crate::types::{MarketInfo, OpenOrder, OrderSide, OrderUpdate, PlacedOrder};

pub mod api;
pub mod cache;
pub mod rest;

pub use api::{CredentialCheck, Credentials, ExchangeApi};
pub use rest::MexcRest;

use cache::TtlCache;

const TICKER_CACHE_TTL: Duration = Duration::from_secs(60);
const BALANCE_CACHE_TTL: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

/// Gateway over one spot exchange.
pub struct Gateway {
    api: Arc<dyn ExchangeApi>,
    db: Db,
    cipher: CredentialCipher,
    ticker_cache: TtlCache<String, Decimal>,
    balance_cache: TtlCache<i64, HashMap<String, Decimal>>,
    max_attempts: u32,
    retry_base_delay: Duration,
}

impl Gateway {
    pub fn new(api: Arc<dyn ExchangeApi>, db: Db, cipher: CredentialCipher) -> Self {
        Self {
            api,
            db,
            cipher,
            ticker_cache: TtlCache::new(TICKER_CACHE_TTL),
            balance_cache: TtlCache::new(BALANCE_CACHE_TTL),
            max_attempts: MAX_ATTEMPTS,
            retry_base_delay: Duration::from_secs(1),
        }
    }

    /// Override retry timing (tests).
    pub fn with_retry_config(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_base_delay = base_delay;
        self
    }

    /// Run an exchange call, retrying transient failures with exponential
    /// backoff (x2 per attempt). Credential and order errors never retry.
    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "transient exchange failure (attempt {attempt}/{}), retrying in {:?}: {error}",
                        self.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Resolve and decrypt a user's API credentials for one call.
    async fn credentials(&self, user_id: i64) -> EngineResult<Credentials> {
        let user = self.db.user(user_id).await?;
        let (key_enc, secret_enc) = match (&user.api_key_enc, &user.api_secret_enc) {
            (Some(k), Some(s)) => (k.clone(), s.clone()),
            _ => return Err(EngineError::MissingCredentials(user_id)),
        };

        let (api_key, api_secret) = self.cipher.decrypt_credentials(&key_enc, &secret_enc)?;
        Ok(Credentials {
            api_key,
            api_secret,
        })
    }

    /// Encrypt and persist a user's API key pair.
    pub async fn store_credentials(
        &self,
        user_id: i64,
        api_key: &str,
        api_secret: &str,
    ) -> EngineResult<()> {
        let (key_enc, secret_enc) = self.cipher.encrypt_credentials(api_key, api_secret)?;
        self.db
            .set_credentials(user_id, &key_enc, &secret_enc)
            .await?;
        self.balance_cache.invalidate(&user_id);
        Ok(())
    }

    /// Probe a key pair without persisting it.
    pub async fn verify_credentials(
        &self,
        api_key: &str,
        api_secret: &str,
    ) -> EngineResult<CredentialCheck> {
        let creds = Credentials {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        };
        Ok(self
            .with_retry(|| self.api.verify_credentials(&creds))
            .await?)
    }

    /// Last-trade price, cached for 60 s.
    pub async fn ticker(&self, symbol: &str) -> EngineResult<Decimal> {
        let key = symbol.to_string();
        if let Some(price) = self.ticker_cache.get(&key) {
            return Ok(price);
        }

        let price = self.with_retry(|| self.api.fetch_ticker(symbol)).await?;
        self.ticker_cache.put(key, price);
        Ok(price)
    }

    /// Prices for several pairs in one request; missing symbols omitted.
    pub async fn batch_tickers(
        &self,
        symbols: &[String],
    ) -> EngineResult<HashMap<String, Decimal>> {
        let prices = self.with_retry(|| self.api.fetch_tickers(symbols)).await?;
        for (symbol, price) in &prices {
            self.ticker_cache.put(symbol.clone(), *price);
        }
        Ok(prices)
    }

    /// Non-zero balances, cached 30 s per user.
    pub async fn balance(&self, user_id: i64) -> EngineResult<HashMap<String, Decimal>> {
        if let Some(balances) = self.balance_cache.get(&user_id) {
            return Ok(balances);
        }

        let creds = self.credentials(user_id).await?;
        let balances = self.with_retry(|| self.api.fetch_balance(&creds)).await?;
        self.balance_cache.put(user_id, balances.clone());
        Ok(balances)
    }

    pub async fn market_info(&self, symbol: &str) -> EngineResult<MarketInfo> {
        Ok(self.with_retry(|| self.api.fetch_market(symbol)).await?)
    }

    pub async fn place_limit(
        &self,
        user_id: i64,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        amount: Decimal,
    ) -> EngineResult<PlacedOrder> {
        let creds = self.credentials(user_id).await?;
        let placed = self
            .with_retry(|| {
                self.api
                    .create_limit_order(&creds, symbol, side, price, amount)
            })
            .await?;
        self.balance_cache.invalidate(&user_id);
        Ok(placed)
    }

    /// Market order. For buys `quantity` is cost in quote currency; for
    /// sells it is amount in base currency.
    pub async fn place_market(
        &self,
        user_id: i64,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> EngineResult<PlacedOrder> {
        let creds = self.credentials(user_id).await?;
        let placed = self
            .with_retry(|| self.api.create_market_order(&creds, symbol, side, quantity))
            .await?;
        self.balance_cache.invalidate(&user_id);
        Ok(placed)
    }

    /// Cancel an order; "unknown order" counts as success.
    pub async fn cancel(&self, user_id: i64, symbol: &str, order_id: &str) -> EngineResult<()> {
        let creds = self.credentials(user_id).await?;
        match self
            .with_retry(|| self.api.cancel_order(&creds, symbol, order_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(ExchangeError::OrderNotFound(_)) => {
                warn!("cancel of {order_id}: already gone, treating as success");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn order_status(
        &self,
        user_id: i64,
        symbol: &str,
        order_id: &str,
    ) -> EngineResult<OrderUpdate> {
        let creds = self.credentials(user_id).await?;
        Ok(self
            .with_retry(|| self.api.fetch_order(&creds, symbol, order_id))
            .await?)
    }

    pub async fn open_orders(
        &self,
        user_id: i64,
        symbol: Option<&str>,
    ) -> EngineResult<Vec<OpenOrder>> {
        let creds = self.credentials(user_id).await?;
        Ok(self
            .with_retry(|| self.api.fetch_open_orders(&creds, symbol))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::api::mock::MockExchange;
    use super::*;
    use rust_decimal_macros::dec;

    async fn setup() -> (Gateway, Arc<MockExchange>, i64) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let cipher = CredentialCipher::from_hex_key(&CredentialCipher::generate_key()).unwrap();

        let user = db.upsert_user(1001, Some("alice")).await.unwrap();
        let (key_enc, secret_enc) = cipher.encrypt_credentials("key", "secret").unwrap();
        db.set_credentials(user.id, &key_enc, &secret_enc)
            .await
            .unwrap();

        let mock = Arc::new(MockExchange::with_market("ETH/USDT", dec!(2000)).await);
        let gateway = Gateway::new(mock.clone(), db, cipher)
            .with_retry_config(3, Duration::from_millis(1));

        (gateway, mock, user.id)
    }

    #[tokio::test]
    async fn test_ticker_uses_cache_within_ttl() {
        let (gateway, mock, _) = setup().await;

        assert_eq!(gateway.ticker("ETH/USDT").await.unwrap(), dec!(2000));
        mock.set_ticker("ETH/USDT", dec!(2100)).await;
        // Second read still served from cache.
        assert_eq!(gateway.ticker("ETH/USDT").await.unwrap(), dec!(2000));
    }

    #[tokio::test]
    async fn test_balance_cached_per_user() {
        let (gateway, mock, user_id) = setup().await;
        mock.set_balance("USDT", dec!(100)).await;

        let first = gateway.balance(user_id).await.unwrap();
        assert_eq!(first.get("USDT"), Some(&dec!(100)));

        mock.set_balance("USDT", dec!(50)).await;
        let second = gateway.balance(user_id).await.unwrap();
        assert_eq!(second.get("USDT"), Some(&dec!(100)));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_up_to_three_attempts() {
        let (gateway, mock, _) = setup().await;

        mock.inject_transient(2);
        assert_eq!(gateway.ticker("ETH/USDT").await.unwrap(), dec!(2000));

        gateway.ticker_cache.clear();
        mock.inject_transient(3);
        assert!(gateway.ticker("ETH/USDT").await.is_err());
    }

    #[tokio::test]
    async fn test_credential_errors_never_retry() {
        let (gateway, mock, user_id) = setup().await;
        mock.set_credentials_invalid(true);

        let error = gateway.balance(user_id).await.unwrap_err();
        assert!(matches!(
            error,
            EngineError::Exchange(ExchangeError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_success() {
        let (gateway, _, user_id) = setup().await;
        gateway
            .cancel(user_id, "ETH/USDT", "does-not-exist")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_credentials_surface_typed_error() {
        let (gateway, _, _) = setup().await;
        let db = &gateway.db;
        let bare_user = db.upsert_user(2002, None).await.unwrap();

        let error = gateway.balance(bare_user.id).await.unwrap_err();
        assert!(matches!(error, EngineError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn test_batch_tickers_seeds_ticker_cache() {
        let (gateway, mock, _) = setup().await;
        mock.set_ticker("BTC/USDT", dec!(60000)).await;

        let symbols = vec!["ETH/USDT".to_string(), "BTC/USDT".to_string(), "XX/YY".to_string()];
        let prices = gateway.batch_tickers(&symbols).await.unwrap();

        assert_eq!(prices.len(), 2);
        // Missing symbols omitted, present ones now cached.
        mock.set_ticker("BTC/USDT", dec!(61000)).await;
        assert_eq!(gateway.ticker("BTC/USDT").await.unwrap(), dec!(60000));
    }
}
