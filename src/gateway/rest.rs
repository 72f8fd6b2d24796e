//! Signed REST client for a MEXC-style spot exchange

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::debug;
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::errors::ExchangeError;
use crate::types::{
    AmountPrecision, MarketInfo, OpenOrder, OrderSide, OrderStatus, OrderUpdate, PlacedOrder,
};

use super::api::{CredentialCheck, Credentials, ExchangeApi};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

/// REST client against the exchange's spot v3 API.
///
/// Authentication is per-request HMAC-SHA256 over the query string, so the
/// HTTP connection pool carries no user state and is safe to share across
/// users.
pub struct MexcRest {
    http: reqwest::Client,
    base_url: String,
}

impl MexcRest {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// `BASE/QUOTE` to the exchange's concatenated form.
    fn wire_symbol(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    fn sign(secret: &str, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = Self::encode_query(params);
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Self::decode(response).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        creds: &Credentials,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = Self::encode_query(&params);
        let signature = Self::sign(&creds.api_secret, &query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        debug!("{method} {path}");
        let response = self
            .http
            .request(method, &url)
            .header("X-MEXC-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::translate_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Transient(format!("malformed exchange response: {e}")))
    }

    /// Map an HTTP failure onto the engine's error taxonomy.
    fn translate_error(status: StatusCode, body: &str) -> ExchangeError {
        #[derive(Deserialize)]
        struct ApiError {
            #[serde(default)]
            code: i64,
            #[serde(default)]
            msg: String,
        }

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return ExchangeError::Transient(format!("exchange returned {status}"));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return ExchangeError::InvalidCredentials;
        }

        let api: ApiError = serde_json::from_str(body).unwrap_or(ApiError {
            code: 0,
            msg: body.to_string(),
        });

        match api.code {
            // Signature / api key failures
            700002 | 700003 | 10072 => ExchangeError::InvalidCredentials,
            // Oversold / insufficient position
            30004 | 30005 => ExchangeError::InsufficientFunds(api.msg),
            // Unknown order
            -2011 | -2013 => ExchangeError::OrderNotFound(api.msg),
            _ if api.msg.to_ascii_lowercase().contains("insufficient") => {
                ExchangeError::InsufficientFunds(api.msg)
            }
            _ => ExchangeError::InvalidOrder(api.msg),
        }
    }
}

fn parse_dec(raw: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(raw)
        .map_err(|e| ExchangeError::Transient(format!("unparseable decimal {raw:?}: {e}")))
}

fn parse_opt_dec(raw: &Option<String>) -> Result<Decimal, ExchangeError> {
    match raw {
        Some(s) if !s.is_empty() => parse_dec(s),
        _ => Ok(Decimal::ZERO),
    }
}

// ----------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    quote_precision: u32,
    #[serde(default)]
    base_asset_precision: u32,
    /// Step size for amounts, e.g. "0.0001"
    #[serde(default)]
    base_size_precision: Option<String>,
    /// Minimum order value in quote currency
    #[serde(default)]
    quote_amount_precision: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct AccountInfo {
    balances: Vec<AssetBalance>,
}

#[derive(Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: serde_json::Value,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    orig_qty: Option<String>,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
}

impl OrderResponse {
    fn order_id_string(&self) -> String {
        match &self.order_id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQuery {
    order_id: serde_json::Value,
    status: String,
    side: String,
    price: String,
    orig_qty: String,
    executed_qty: String,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
}

impl OrderQuery {
    fn order_id_string(&self) -> String {
        match &self.order_id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl ExchangeApi for MexcRest {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let wire = Self::wire_symbol(symbol);
        let ticker: TickerPrice = self
            .public_get("/api/v3/ticker/price", &[("symbol", wire)])
            .await?;
        parse_dec(&ticker.price)
    }

    async fn fetch_tickers(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Decimal>, ExchangeError> {
        // One request for the whole book, filtered locally.
        let tickers: Vec<TickerPrice> = self.public_get("/api/v3/ticker/price", &[]).await?;
        let by_wire: HashMap<String, &TickerPrice> =
            tickers.iter().map(|t| (t.symbol.clone(), t)).collect();

        let mut prices = HashMap::new();
        for symbol in symbols {
            if let Some(ticker) = by_wire.get(&Self::wire_symbol(symbol)) {
                prices.insert(symbol.clone(), parse_dec(&ticker.price)?);
            }
        }
        Ok(prices)
    }

    async fn fetch_market(&self, symbol: &str) -> Result<MarketInfo, ExchangeError> {
        let wire = Self::wire_symbol(symbol);
        let info: ExchangeInfo = self
            .public_get("/api/v3/exchangeInfo", &[("symbol", wire.clone())])
            .await?;

        let market = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == wire)
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))?;

        // The amount step arrives as a fractional string where available,
        // otherwise fall back to the decimal-place count.
        let amount_precision = match &market.base_size_precision {
            Some(step) if !step.is_empty() => AmountPrecision::from_raw(parse_dec(step)?),
            _ => AmountPrecision::DecimalPlaces(market.base_asset_precision),
        };
        let min_order_amount = amount_precision.step();
        let min_order_cost = parse_opt_dec(&market.quote_amount_precision)?;

        Ok(MarketInfo {
            symbol: symbol.to_string(),
            base: market.base_asset,
            quote: market.quote_asset,
            price_precision: market.quote_precision,
            amount_precision,
            min_order_amount,
            min_order_cost,
            active: matches!(market.status.as_str(), "1" | "ENABLED" | "TRADING"),
        })
    }

    async fn fetch_balance(
        &self,
        creds: &Credentials,
    ) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let account: AccountInfo = self
            .signed_request(creds, Method::GET, "/api/v3/account", Vec::new())
            .await?;

        let mut balances = HashMap::new();
        for balance in account.balances {
            let total = parse_dec(&balance.free)? + parse_dec(&balance.locked)?;
            if total > Decimal::ZERO {
                balances.insert(balance.asset, total);
            }
        }
        Ok(balances)
    }

    async fn create_limit_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        amount: Decimal,
    ) -> Result<PlacedOrder, ExchangeError> {
        let params = vec![
            ("symbol", Self::wire_symbol(symbol)),
            ("side", side.as_str().to_ascii_uppercase()),
            ("type", "LIMIT".to_string()),
            ("quantity", amount.to_string()),
            ("price", price.to_string()),
            ("newClientOrderId", Uuid::new_v4().simple().to_string()),
        ];

        let response: OrderResponse = self
            .signed_request(creds, Method::POST, "/api/v3/order", params)
            .await?;

        let filled = parse_opt_dec(&response.executed_qty)?;
        Ok(PlacedOrder {
            exchange_order_id: response.order_id_string(),
            status: response
                .status
                .as_deref()
                .map(OrderStatus::from)
                .unwrap_or(OrderStatus::Open),
            filled,
            remaining: amount - filled,
            price,
            amount,
            average_price: None,
            fee: Decimal::ZERO,
            fee_currency: None,
        })
    }

    async fn create_market_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<PlacedOrder, ExchangeError> {
        let mut params = vec![
            ("symbol", Self::wire_symbol(symbol)),
            ("side", side.as_str().to_ascii_uppercase()),
            ("type", "MARKET".to_string()),
            ("newClientOrderId", Uuid::new_v4().simple().to_string()),
        ];
        // Market buys are sized in quote currency, market sells in base.
        match side {
            OrderSide::Buy => params.push(("quoteOrderQty", quantity.to_string())),
            OrderSide::Sell => params.push(("quantity", quantity.to_string())),
        }

        let response: OrderResponse = self
            .signed_request(creds, Method::POST, "/api/v3/order", params)
            .await?;

        let filled = parse_opt_dec(&response.executed_qty)?;
        let quote_spent = parse_opt_dec(&response.cummulative_quote_qty)?;
        let average_price = if filled > Decimal::ZERO && quote_spent > Decimal::ZERO {
            Some(quote_spent / filled)
        } else {
            None
        };

        Ok(PlacedOrder {
            exchange_order_id: response.order_id_string(),
            status: response
                .status
                .as_deref()
                .map(OrderStatus::from)
                .unwrap_or(OrderStatus::Filled),
            filled,
            remaining: Decimal::ZERO,
            price: average_price.unwrap_or(Decimal::ZERO),
            amount: filled,
            average_price,
            fee: Decimal::ZERO,
            fee_currency: None,
        })
    }

    async fn cancel_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", Self::wire_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let _: serde_json::Value = self
            .signed_request(creds, Method::DELETE, "/api/v3/order", params)
            .await?;
        Ok(())
    }

    async fn fetch_order(
        &self,
        creds: &Credentials,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderUpdate, ExchangeError> {
        let params = vec![
            ("symbol", Self::wire_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let order: OrderQuery = self
            .signed_request(creds, Method::GET, "/api/v3/order", params)
            .await?;

        let amount = parse_dec(&order.orig_qty)?;
        let filled = parse_dec(&order.executed_qty)?;
        let quote_spent = parse_opt_dec(&order.cummulative_quote_qty)?;
        let average_price = if filled > Decimal::ZERO && quote_spent > Decimal::ZERO {
            Some(quote_spent / filled)
        } else {
            None
        };

        Ok(OrderUpdate {
            exchange_order_id: order.order_id_string(),
            status: OrderStatus::from(order.status.as_str()),
            side: OrderSide::from(order.side.as_str()),
            price: parse_dec(&order.price)?,
            amount,
            filled,
            remaining: amount - filled,
            average_price,
            // Spot order queries do not carry fees; fills inherit them from
            // trade history when the exchange exposes it.
            fee: Decimal::ZERO,
            fee_currency: None,
        })
    }

    async fn fetch_open_orders(
        &self,
        creds: &Credentials,
        symbol: Option<&str>,
    ) -> Result<Vec<OpenOrder>, ExchangeError> {
        let mut params = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol", Self::wire_symbol(symbol)));
        }

        let orders: Vec<OrderQuery> = self
            .signed_request(creds, Method::GET, "/api/v3/openOrders", params)
            .await?;

        orders
            .into_iter()
            .map(|o| {
                Ok(OpenOrder {
                    exchange_order_id: o.order_id_string(),
                    symbol: symbol.map(str::to_string).unwrap_or_else(|| "".to_string()),
                    side: OrderSide::from(o.side.as_str()),
                    price: parse_dec(&o.price)?,
                    amount: parse_dec(&o.orig_qty)?,
                    filled: parse_dec(&o.executed_qty)?,
                })
            })
            .collect()
    }

    async fn verify_credentials(
        &self,
        creds: &Credentials,
    ) -> Result<CredentialCheck, ExchangeError> {
        match self.fetch_balance(creds).await {
            Ok(balances) => Ok(CredentialCheck {
                valid: true,
                balances,
            }),
            Err(ExchangeError::InvalidCredentials) => Ok(CredentialCheck {
                valid: false,
                balances: HashMap::new(),
            }),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_symbol() {
        assert_eq!(MexcRest::wire_symbol("ETH/USDT"), "ETHUSDT");
        assert_eq!(MexcRest::wire_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let sig = MexcRest::sign("secret", "symbol=ETHUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            sig,
            MexcRest::sign("secret", "symbol=ETHUSDT&timestamp=1700000000000")
        );
    }

    #[test]
    fn test_error_translation() {
        assert!(matches!(
            MexcRest::translate_error(StatusCode::BAD_GATEWAY, ""),
            ExchangeError::Transient(_)
        ));
        assert!(matches!(
            MexcRest::translate_error(StatusCode::UNAUTHORIZED, ""),
            ExchangeError::InvalidCredentials
        ));
        assert!(matches!(
            MexcRest::translate_error(
                StatusCode::BAD_REQUEST,
                r#"{"code":700002,"msg":"signature invalid"}"#
            ),
            ExchangeError::InvalidCredentials
        ));
        assert!(matches!(
            MexcRest::translate_error(
                StatusCode::BAD_REQUEST,
                r#"{"code":30004,"msg":"insufficient balance"}"#
            ),
            ExchangeError::InsufficientFunds(_)
        ));
        assert!(matches!(
            MexcRest::translate_error(
                StatusCode::BAD_REQUEST,
                r#"{"code":-2013,"msg":"Order does not exist"}"#
            ),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            MexcRest::translate_error(
                StatusCode::BAD_REQUEST,
                r#"{"code":400,"msg":"price out of range"}"#
            ),
            ExchangeError::InvalidOrder(_)
        ));
    }

    #[test]
    fn test_order_response_id_forms() {
        let numeric: OrderResponse =
            serde_json::from_str(r#"{"orderId": 123456}"#).unwrap();
        assert_eq!(numeric.order_id_string(), "123456");

        let textual: OrderResponse =
            serde_json::from_str(r#"{"orderId": "C02__443776"}"#).unwrap();
        assert_eq!(textual.order_id_string(), "C02__443776");
    }
}
