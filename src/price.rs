//! Single-source price quote.

use serde_json::Value;

use crate::config::PriceConfig;
use crate::settings::RuntimeConfig;

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("offline mode")]
    Offline,
    #[error("price request failed: {0}")]
    Request(String),
    #[error("price request timed out")]
    Timeout,
    #[error("quote source answered {0}")]
    Status(u16),
    #[error("no price at {0} in quote")]
    Missing(String),
}

/// Fetches the configured quote with one HTTP GET per call.
#[derive(Clone, Debug)]
pub struct PriceFeed {
    http: reqwest::Client,
    config: PriceConfig,
    runtime: RuntimeConfig,
}

impl PriceFeed {
    pub fn new(config: PriceConfig, runtime: RuntimeConfig) -> Self {
        PriceFeed {
            http: reqwest::Client::new(),
            config,
            runtime,
        }
    }

    pub async fn quote(&self) -> Result<f64, PriceError> {
        let snapshot = self.runtime.snapshot();
        if snapshot.offline {
            return Err(PriceError::Offline);
        }
        let request = async {
            let resp = self
                .http
                .get(&self.config.url)
                .send()
                .await
                .map_err(|e| PriceError::Request(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(PriceError::Status(resp.status().as_u16()));
            }
            resp.json::<Value>()
                .await
                .map_err(|e| PriceError::Request(e.to_string()))
        };
        let body = tokio::time::timeout(snapshot.request_timeout, request)
            .await
            .map_err(|_| PriceError::Timeout)??;
        let price = extract(&body, &self.config.pointer)?;
        tracing::debug!(url = %self.config.url, price, "Price quote");
        Ok(price)
    }
}

/// Read a number (or numeric string) at `pointer`.
pub fn extract(body: &Value, pointer: &str) -> Result<f64, PriceError> {
    let missing = || PriceError::Missing(pointer.to_string());
    match body.pointer(pointer).ok_or_else(missing)? {
        Value::Number(n) => n.as_f64().ok_or_else(missing),
        Value::String(s) => s.trim().parse().map_err(|_| missing()),
        _ => Err(missing()),
    }
}
