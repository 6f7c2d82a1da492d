//! Short-lived JSON-RPC client for daemon queries.
//!
//! Every call dials `ws://<endpoint>/ws`, issues one request and drops the
//! connection. Calls read the endpoint, offline flag and timeout from the
//! shared `RuntimeConfig` at call time, so settings changes apply to the next
//! call without rebuilding the client.

use std::collections::HashMap;
use std::future::Future;

use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ObjectParams;
use jsonrpsee::ws_client::WsClientBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::args::Arguments;
use crate::settings::{RuntimeConfig, RuntimeSnapshot};
use crate::wallet::Transfer;
use crate::Scid;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("offline mode is enabled")]
    Offline,
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("daemon returned status {0:?}")]
    StatusNotOK(String),
    #[error("{0} timed out")]
    Timeout(String),
}

// ── Responses ──

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonInfo {
    pub height: u64,
    pub topoheight: u64,
    pub stableheight: u64,
    pub network: String,
    pub version: String,
    pub testnet: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HeightInfo {
    pub height: u64,
    pub stableheight: u64,
    pub topoheight: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GasEstimate {
    pub gascompute: u64,
    pub gasstorage: u64,
}

/// Contract snapshot returned by `DERO.GetSC`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScState {
    pub code: String,
    pub balance: u64,
    pub balances: HashMap<String, u64>,
    pub valuesuint64: Vec<String>,
    pub valuesstring: Vec<String>,
    pub stringkeys: HashMap<String, serde_json::Value>,
    pub uint64keys: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TxInfo {
    pub as_hex: String,
    pub block_height: i64,
    pub in_pool: bool,
    pub signer: String,
    /// Ring members per transfer.
    pub ring: Vec<Vec<String>>,
}

impl TxInfo {
    /// True if `address` appears in any ring of the transaction.
    pub fn ring_contains(&self, address: &str) -> bool {
        self.ring.iter().flatten().any(|member| member == address)
    }
}

#[derive(Deserialize)]
struct TxsResult {
    #[serde(default)]
    txs: Vec<TxInfo>,
}

#[derive(Deserialize)]
struct NameResult {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
struct InstallResult {
    #[serde(alias = "TXID", alias = "txid")]
    txid: String,
}

/// Which parts of a contract `get_sc` should return.
#[derive(Clone, Debug, Default)]
pub struct ScQuery {
    pub code: bool,
    pub variables: bool,
    pub keys_string: Vec<String>,
    pub keys_uint64: Vec<u64>,
    /// `-1` is the tip.
    pub topoheight: i64,
}

impl ScQuery {
    pub fn code_only() -> Self {
        ScQuery {
            code: true,
            topoheight: -1,
            ..Default::default()
        }
    }

    pub fn keys(keys: &[&str]) -> Self {
        ScQuery {
            keys_string: keys.iter().map(|k| k.to_string()).collect(),
            topoheight: -1,
            ..Default::default()
        }
    }
}

// ── Client ──

#[derive(Clone, Debug)]
pub struct NodeClient {
    runtime: RuntimeConfig,
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new(runtime: RuntimeConfig) -> Self {
        NodeClient {
            runtime,
            http: reqwest::Client::new(),
        }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Current settings, or `Offline`.
    pub fn guard(&self) -> Result<RuntimeSnapshot, NodeError> {
        let snapshot = self.runtime.snapshot();
        if snapshot.offline {
            return Err(NodeError::Offline);
        }
        Ok(snapshot)
    }

    /// Run a remote future under the offline guard and request timeout.
    pub async fn guarded<T, F>(&self, what: &str, fut: F) -> Result<T, NodeError>
    where
        F: Future<Output = Result<T, NodeError>>,
    {
        let snapshot = self.guard()?;
        match tokio::time::timeout(snapshot.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(call = what, "Daemon request timed out");
                Err(NodeError::Timeout(what.to_string()))
            }
        }
    }

    /// One JSON-RPC call on a fresh WebSocket session.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, NodeError> {
        let endpoint = self.guard()?.endpoint;
        let url = ws_url(&endpoint);
        let params = object_params(params)?;
        let value: serde_json::Value = self
            .guarded(method, async move {
                let client = WsClientBuilder::default()
                    .build(&url)
                    .await
                    .map_err(|e| NodeError::Unreachable(e.to_string()))?;
                client
                    .request::<serde_json::Value, _>(method, params)
                    .await
                    .map_err(map_client_error)
            })
            .await?;
        check_status(&value)?;
        serde_json::from_value(value).map_err(|e| NodeError::Protocol(e.to_string()))
    }

    pub async fn get_info(&self) -> Result<DaemonInfo, NodeError> {
        self.call("DERO.GetInfo", serde_json::json!({})).await
    }

    pub async fn get_height(&self) -> Result<HeightInfo, NodeError> {
        self.call("DERO.GetHeight", serde_json::json!({})).await
    }

    /// Storage and compute gas for a candidate transaction.
    pub async fn gas_estimate(
        &self,
        signer: &str,
        transfers: &[Transfer],
        sc_args: &Arguments,
    ) -> Result<GasEstimate, NodeError> {
        let transfers: Vec<serde_json::Value> = transfers
            .iter()
            .map(|t| {
                serde_json::json!({
                    "scid": t.scid.to_hex(),
                    "destination": t.destination,
                    "amount": t.amount,
                    "burn": t.burn,
                })
            })
            .collect();
        let params = serde_json::json!({
            "transfers": transfers,
            "sc_rpc": sc_args.to_rpc(),
            "signer": signer,
        });
        let estimate: GasEstimate = self.call("DERO.GetGasEstimate", params).await?;
        tracing::debug!(
            gas_storage = estimate.gasstorage,
            gas_compute = estimate.gascompute,
            "Gas estimated"
        );
        Ok(estimate)
    }

    pub async fn get_sc(&self, scid: &Scid, query: &ScQuery) -> Result<ScState, NodeError> {
        let params = serde_json::json!({
            "scid": scid.to_hex(),
            "code": query.code,
            "variables": query.variables,
            "topoheight": query.topoheight,
            "keysstring": query.keys_string,
            "keysuint64": query.keys_uint64,
        });
        self.call("DERO.GetSC", params).await
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<TxInfo, NodeError> {
        let params = serde_json::json!({ "txs_hashes": [txid] });
        let result: TxsResult = self.call("DERO.GetTransaction", params).await?;
        result
            .txs
            .into_iter()
            .next()
            .ok_or_else(|| NodeError::Protocol(format!("transaction {} not returned", txid)))
    }

    /// Name-service lookup at `topoheight` (`-1` for the tip).
    pub async fn name_to_address(&self, name: &str, topoheight: i64) -> Result<String, NodeError> {
        let params = serde_json::json!({ "name": name, "topoheight": topoheight });
        let result: NameResult = self.call("DERO.NameToAddress", params).await?;
        if result.address.is_empty() {
            return Err(NodeError::StatusNotOK(format!("name {} not found", name)));
        }
        Ok(result.address)
    }

    /// Install a contract through the daemon's REST endpoint. Returns the txid.
    pub async fn install_sc(&self, code: &str) -> Result<String, NodeError> {
        let endpoint = self.guard()?.endpoint;
        let url = format!("{}/install_sc", http_base(&endpoint));
        let body = code.as_bytes().to_vec();
        let http = self.http.clone();
        let txid = self
            .guarded("install_sc", async move {
                let resp = http
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| NodeError::Unreachable(format!("request failed: {}", e)))?;
                if !resp.status().is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(NodeError::StatusNotOK(text));
                }
                let result: InstallResult = resp
                    .json()
                    .await
                    .map_err(|e| NodeError::Protocol(format!("invalid response: {}", e)))?;
                Ok(result.txid)
            })
            .await?;
        tracing::info!(txid = %txid, "Contract installed");
        Ok(txid)
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    let endpoint = endpoint.trim().trim_end_matches('/');
    for scheme in ["ws://", "wss://", "http://", "https://"] {
        if let Some(rest) = endpoint.strip_prefix(scheme) {
            return rest;
        }
    }
    endpoint
}

pub(crate) fn ws_url(endpoint: &str) -> String {
    format!("ws://{}/ws", strip_scheme(endpoint))
}

pub(crate) fn http_base(endpoint: &str) -> String {
    format!("http://{}", strip_scheme(endpoint))
}

fn object_params(params: serde_json::Value) -> Result<ObjectParams, NodeError> {
    let mut out = ObjectParams::new();
    match params {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                out.insert(&key, value)
                    .map_err(|e| NodeError::Protocol(e.to_string()))?;
            }
            Ok(out)
        }
        serde_json::Value::Null => Ok(out),
        other => Err(NodeError::Protocol(format!(
            "params must be an object, got {}",
            other
        ))),
    }
}

/// Daemon results carry `"status": "OK"` on success.
fn check_status(value: &serde_json::Value) -> Result<(), NodeError> {
    match value.get("status").and_then(|s| s.as_str()) {
        None | Some("OK") => Ok(()),
        Some(other) => Err(NodeError::StatusNotOK(other.to_string())),
    }
}

fn map_client_error(e: jsonrpsee::core::ClientError) -> NodeError {
    use jsonrpsee::core::ClientError;
    match e {
        ClientError::Call(err) => NodeError::Protocol(err.message().to_string()),
        ClientError::Transport(err) => NodeError::Unreachable(err.to_string()),
        ClientError::RestartNeeded(err) => NodeError::Unreachable(err.to_string()),
        other => NodeError::Protocol(other.to_string()),
    }
}
