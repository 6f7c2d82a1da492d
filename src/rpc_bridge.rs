//! JSON-RPC 2.0 bridge for external dApps.
//!
//! A single `POST /json_rpc` endpoint guarded by HTTP basic auth while
//! `auth_mode` is on. Methods:
//!
//! - `GetPrimaryUsername`, `GetAddress`, `GetHeight`, `GetBalance`
//! - `Gnomon.*` indexer reads (fail with `IndexerInactive` when no indexer runs)
//! - `AttemptEPOCHWithAddr`, a short proof-of-work session capped at the
//!   host's `max_epoch_hashes`
//!
//! dApp links (`<target>://<arg>/<arg>/...`) are parsed here as well and turned
//! into navigation events for the presentation sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use base64::Engine;
use rand::{Rng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::config::{BridgeConfig, Network};
use crate::events::{CoreEvent, EventSink, Indicator};
use crate::indexer::{Indexer, IndexerError};
use crate::settings::{Settings, SettingsError};
use crate::wallet::WalletBackend;
use crate::{constant_time_eq, Scid};

/// Random bytes behind a generated bridge password.
pub const PASSWORD_BYTES: usize = 20;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const INDEXER_INACTIVE: i64 = -32000;
const EPOCH_BUSY: i64 = -32001;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("RPC bridge is already running")]
    AlreadyRunning,
    #[error("cannot bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
    #[error("invalid bind address {0}")]
    BadAddress(String),
    #[error("indexer is not active")]
    IndexerInactive,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

// ── Credentials ──

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Random mnemonic word as user, URL-safe base64 of 20 random bytes as
    /// password.
    pub fn generate() -> Self {
        let words = bip39::Language::English.word_list();
        let mut rng = rand::rng();
        let user = words[rng.random_range(0..words.len())].to_string();
        let mut secret = [0u8; PASSWORD_BYTES];
        rng.fill_bytes(&mut secret);
        let pass = base64::engine::general_purpose::URL_SAFE.encode(secret);
        Credentials { user, pass }
    }

    /// Stored credentials, or a freshly generated pair that is persisted first.
    pub fn load_or_generate(settings: &Settings) -> Result<Self, SettingsError> {
        if let Some((user, pass)) = settings.bridge_credentials()? {
            return Ok(Credentials { user, pass });
        }
        let creds = Self::generate();
        settings.set_bridge_credentials(&creds.user, &creds.pass)?;
        tracing::info!(user = %creds.user, "Generated RPC bridge credentials");
        Ok(creds)
    }

    /// Value of an `Authorization` header carrying these credentials.
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.user, self.pass);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }

    fn matches_header(&self, value: &str) -> bool {
        let Some(encoded) = value.trim().strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let expected = format!("{}:{}", self.user, self.pass);
        constant_time_eq(&decoded, expected.as_bytes())
    }
}

// ── EPOCH ──

/// Outcome of one proof-of-work session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochResult {
    pub hashes: u64,
    pub submitted: u64,
    pub duration_ms: u64,
}

/// Runs a bounded proof-of-work session paying out to an address.
pub trait EpochBackend: Send + Sync {
    fn attempt(&self, address: &Address, hashes: u64) -> Result<EpochResult, String>;
}

/// In-process EPOCH worker. Hashes `job || address || nonce` with blake3 and
/// counts every hash with `share_zero_bytes` leading zero bytes as a share.
pub struct LocalEpoch {
    job: [u8; 32],
    share_zero_bytes: usize,
    total: AtomicU64,
}

impl LocalEpoch {
    pub fn new() -> Self {
        Self::with_difficulty(1)
    }

    pub fn with_difficulty(share_zero_bytes: usize) -> Self {
        LocalEpoch {
            job: rand::random(),
            share_zero_bytes: share_zero_bytes.min(32),
            total: AtomicU64::new(0),
        }
    }

    /// Hashes computed across all sessions.
    pub fn total_hashes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for LocalEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochBackend for LocalEpoch {
    fn attempt(&self, address: &Address, hashes: u64) -> Result<EpochResult, String> {
        let start = Instant::now();
        let base = self.total.fetch_add(hashes, Ordering::Relaxed);
        let key = address.public_key();
        let mut submitted = 0;
        for i in 0..hashes {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&self.job);
            hasher.update(&key);
            hasher.update(&(base + i).to_le_bytes());
            let hash = hasher.finalize();
            if hash.as_bytes()[..self.share_zero_bytes].iter().all(|b| *b == 0) {
                submitted += 1;
            }
        }
        Ok(EpochResult {
            hashes,
            submitted,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

// ── dApp links ──

/// A parsed `<target>://<arg>/<arg>/...` link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DappLink {
    pub target: String,
    pub args: Vec<String>,
}

pub fn parse_link(uri: &str) -> Result<DappLink, BridgeError> {
    let invalid = || BridgeError::InvalidArgument(uri.to_string());
    let (target, rest) = uri.trim().split_once("://").ok_or_else(invalid)?;
    if target.is_empty()
        || !target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        return Err(invalid());
    }
    let args: Vec<String> = rest
        .split('/')
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    if args.is_empty() {
        return Err(invalid());
    }
    Ok(DappLink {
        target: target.to_ascii_lowercase(),
        args,
    })
}

/// Route a dApp link: web links are opened, `engram://asset/<scid>` shows the
/// asset manager.
pub fn handle_link(uri: &str, events: &EventSink) -> Result<DappLink, BridgeError> {
    let link = parse_link(uri)?;
    match link.target.as_str() {
        "http" | "https" => events.emit(CoreEvent::OpenLink(uri.trim().to_string())),
        "engram" => match link.args.as_slice() {
            [view, scid] if view == "asset" => {
                let scid: Scid = scid
                    .parse()
                    .map_err(|_| BridgeError::InvalidArgument(uri.to_string()))?;
                events.emit(CoreEvent::ShowAssetManager(scid));
            }
            _ => return Err(BridgeError::InvalidArgument(uri.to_string())),
        },
        _ => return Err(BridgeError::InvalidArgument(uri.to_string())),
    }
    Ok(link)
}

// ── Server state ──

/// The indexer the bridge reads from, swapped as the indexer starts and stops.
pub type IndexerSlot = Arc<RwLock<Option<Arc<Indexer>>>>;

#[derive(Clone)]
pub struct BridgeState {
    wallet: Arc<dyn WalletBackend>,
    settings: Settings,
    indexer: IndexerSlot,
    epoch: Arc<dyn EpochBackend>,
    epoch_busy: Arc<AtomicBool>,
    max_hashes: u64,
    credentials: Option<Credentials>,
}

impl BridgeState {
    pub fn new(
        wallet: Arc<dyn WalletBackend>,
        settings: Settings,
        indexer: IndexerSlot,
        epoch: Arc<dyn EpochBackend>,
        max_hashes: u64,
    ) -> Self {
        BridgeState {
            wallet,
            settings,
            indexer,
            epoch,
            epoch_busy: Arc::new(AtomicBool::new(false)),
            max_hashes,
            credentials: None,
        }
    }

    /// Require these credentials on every request.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Credentials from settings when `auth_mode` is on, none otherwise.
    pub fn with_settings_auth(self) -> Result<Self, BridgeError> {
        let creds = if self.settings.auth_mode()? {
            Some(Credentials::load_or_generate(&self.settings)?)
        } else {
            None
        };
        Ok(self.with_credentials(creds))
    }

    fn indexer(&self) -> Result<Arc<Indexer>, RpcError> {
        self.indexer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|i| i.is_active())
            .ok_or_else(|| RpcError::from(BridgeError::IndexerInactive))
    }

    fn network(&self) -> Network {
        self.settings.runtime().network()
    }
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/json_rpc", post(json_rpc))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(State(state): State<BridgeState>, request: Request, next: Next) -> Response {
    if let Some(creds) = state.credentials.as_ref() {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| creds.matches_header(v));
        if !authorized {
            tracing::debug!("RPC bridge request rejected: bad credentials");
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"engram\"")],
            )
                .into_response();
        }
    }
    next.run(request).await
}

// ── JSON-RPC envelope ──

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }
}

impl From<BridgeError> for RpcError {
    fn from(e: BridgeError) -> Self {
        let code = match e {
            BridgeError::IndexerInactive => INDEXER_INACTIVE,
            BridgeError::InvalidArgument(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        RpcError::new(code, e.to_string())
    }
}

impl From<IndexerError> for RpcError {
    fn from(e: IndexerError) -> Self {
        match e {
            IndexerError::Inactive => BridgeError::IndexerInactive.into(),
            other => RpcError::new(INTERNAL_ERROR, other.to_string()),
        }
    }
}

fn reply(id: Value, outcome: Result<Value, RpcError>) -> Json<Value> {
    match outcome {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err(error) => Json(json!({ "jsonrpc": "2.0", "id": id, "error": error })),
    }
}

async fn json_rpc(State(state): State<BridgeState>, body: Bytes) -> Json<Value> {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return reply(Value::Null, Err(RpcError::new(PARSE_ERROR, e.to_string()))),
    };
    if request.jsonrpc != "2.0" {
        return reply(
            request.id,
            Err(RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\"")),
        );
    }
    tracing::debug!(method = %request.method, "RPC bridge call");
    let outcome = dispatch(&state, &request.method, request.params).await;
    reply(request.id, outcome)
}

fn params<T: DeserializeOwned>(raw: Value) -> Result<T, RpcError> {
    let raw = if raw.is_null() { json!({}) } else { raw };
    serde_json::from_value(raw).map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
}

fn scid(raw: &str) -> Result<Scid, RpcError> {
    raw.parse()
        .map_err(|_| RpcError::new(INVALID_PARAMS, format!("invalid scid {}", raw)))
}

#[derive(Deserialize)]
struct ScidParams {
    scid: String,
    #[serde(default)]
    height: u64,
}

#[derive(Deserialize)]
struct KeyParams {
    scid: String,
    key: String,
    #[serde(default)]
    height: u64,
}

#[derive(Deserialize)]
struct ValueParams {
    scid: String,
    value: String,
    #[serde(default)]
    height: u64,
}

#[derive(Deserialize)]
struct InvokeParams {
    scid: String,
    #[serde(default)]
    entrypoint: Option<String>,
    #[serde(default)]
    signer: Option<String>,
}

#[derive(Deserialize)]
struct AddressParams {
    address: String,
}

#[derive(Deserialize)]
struct InteractionParams {
    scid: String,
    address: String,
}

#[derive(Deserialize, Default)]
struct BalanceParams {
    #[serde(default)]
    scid: Option<String>,
}

#[derive(Deserialize)]
struct EpochParams {
    hashes: u64,
    address: String,
}

async fn dispatch(state: &BridgeState, method: &str, raw: Value) -> Result<Value, RpcError> {
    match method {
        "GetPrimaryUsername" => {
            let name = state
                .settings
                .username()
                .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
            Ok(json!({ "username": name.unwrap_or_default() }))
        }
        "GetAddress" => Ok(json!({ "address": state.wallet.address().to_string() })),
        "GetHeight" => Ok(json!({ "height": state.wallet.wallet_height() })),
        "GetBalance" => {
            let p: BalanceParams = params(raw)?;
            let id = match p.scid.as_deref() {
                Some(s) => scid(s)?,
                None => Scid::NATIVE,
            };
            let wallet = state.wallet.clone();
            let balance = tokio::task::spawn_blocking(move || wallet.balance(&id))
                .await
                .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?
                .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
            Ok(json!({ "balance": balance.total(), "unlocked_balance": balance.mature }))
        }
        "AttemptEPOCHWithAddr" => attempt_epoch(state, params(raw)?).await,
        "Gnomon.GetLastIndexHeight" => {
            Ok(json!({ "height": state.indexer()?.last_indexed_height()? }))
        }
        "Gnomon.GetAllOwnersAndSCIDs" => {
            Ok(json!({ "allOwners": state.indexer()?.owners_and_scids()? }))
        }
        "Gnomon.GetAllSCIDVariableDetails" => {
            let p: ScidParams = params(raw)?;
            let vars = state.indexer()?.variables(&scid(&p.scid)?, p.height)?;
            Ok(json!({ "variables": vars }))
        }
        "Gnomon.GetSCIDValuesByKey" => {
            let p: KeyParams = params(raw)?;
            let values = state
                .indexer()?
                .values_by_key(&scid(&p.scid)?, &p.key, p.height)?;
            Ok(json!({ "valuesString": values }))
        }
        "Gnomon.GetSCIDKeysByValue" => {
            let p: ValueParams = params(raw)?;
            let keys = state
                .indexer()?
                .keys_by_value(&scid(&p.scid)?, &p.value, p.height)?;
            Ok(json!({ "keysString": keys }))
        }
        "Gnomon.GetAllSCIDInvokeDetails" => {
            let p: InvokeParams = params(raw)?;
            let details = state.indexer()?.invoke_details(
                &scid(&p.scid)?,
                p.entrypoint.as_deref(),
                p.signer.as_deref(),
            )?;
            Ok(json!({ "invokeDetails": details }))
        }
        "Gnomon.GetMiniblockDetailsByAddress" => {
            let p: AddressParams = params(raw)?;
            Ok(json!({ "miniblocks": state.indexer()?.miniblocks(&p.address)? }))
        }
        "Gnomon.GetInvalidSCIDDeploys" => {
            Ok(json!({ "invalidDeploys": state.indexer()?.invalid_deploys()? }))
        }
        "Gnomon.GetSCIDInteractionHeight" => {
            let p: InteractionParams = params(raw)?;
            let heights = state
                .indexer()?
                .interaction_heights(&scid(&p.scid)?, &p.address)?;
            Ok(json!({ "interactionHeight": heights }))
        }
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("method {} not found", other),
        )),
    }
}

/// Clears the busy flag when the session ends, even if the request that
/// started it was dropped.
struct EpochGuard(Arc<AtomicBool>);

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn attempt_epoch(state: &BridgeState, p: EpochParams) -> Result<Value, RpcError> {
    if p.hashes == 0 {
        return Err(BridgeError::InvalidArgument("hashes must be positive".into()).into());
    }
    let address = Address::parse_for(&p.address, state.network())
        .map_err(|e| RpcError::from(BridgeError::InvalidArgument(e.to_string())))?;
    let hashes = p.hashes.min(state.max_hashes);
    if state.epoch_busy.swap(true, Ordering::AcqRel) {
        return Err(RpcError::new(EPOCH_BUSY, "an EPOCH session is already running"));
    }
    let guard = EpochGuard(state.epoch_busy.clone());
    let epoch = state.epoch.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        epoch.attempt(&address, hashes)
    })
    .await;
    let result = outcome
        .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?
        .map_err(|e| RpcError::new(INTERNAL_ERROR, e))?;
    tracing::debug!(hashes = result.hashes, submitted = result.submitted, "EPOCH session finished");
    serde_json::to_value(result).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
}

// ── Server lifecycle ──

/// Bind address from host configuration, defaulting to the network's wallet
/// RPC port.
pub fn bind_addr(config: &BridgeConfig, network: Network) -> Result<SocketAddr, BridgeError> {
    let port = if config.port != 0 {
        config.port
    } else {
        network.wallet_rpc_port()
    };
    let raw = format!("{}:{}", config.bind_host, port);
    raw.parse().map_err(|_| BridgeError::BadAddress(raw))
}

/// Owns the process-wide "bridge running" flag; at most one server at a time.
#[derive(Clone, Debug, Default)]
pub struct RpcBridge {
    active: Arc<AtomicBool>,
}

impl RpcBridge {
    pub fn new(active: Arc<AtomicBool>) -> Self {
        RpcBridge { active }
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub async fn start(
        &self,
        addr: SocketAddr,
        state: BridgeState,
        events: EventSink,
    ) -> Result<BridgeHandle, BridgeError> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::AlreadyRunning);
        }
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                self.active.store(false, Ordering::Release);
                tracing::warn!(addr = %addr, error = %e, "RPC bridge bind failed");
                events.emit(CoreEvent::Bridge(Indicator::Red));
                return Err(BridgeError::Bind {
                    addr,
                    reason: e.to_string(),
                });
            }
        };
        let local_addr = listener.local_addr().unwrap_or(addr);
        let auth = state.credentials.is_some();
        let app = router(state);
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::warn!(error = %e, "RPC bridge stopped with error");
            }
            active.store(false, Ordering::Release);
            events.emit(CoreEvent::Bridge(Indicator::Gray));
        });
        tracing::info!(addr = %local_addr, auth, "RPC bridge listening");
        Ok(BridgeHandle {
            addr: local_addr,
            cancel,
            task,
        })
    }
}

pub struct BridgeHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "RPC bridge task failed");
        }
        tracing::info!(addr = %self.addr, "RPC bridge stopped");
    }
}
