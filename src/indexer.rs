//! Coordination with the external contract indexer.
//!
//! The indexer itself is an external component behind `IndexerBackend`. It
//! is started with the account's shard path and address; it never holds a
//! wallet handle. Scans that need balances take the wallet as an argument.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::datashard::{Datashard, DatashardError};
use crate::events::EventSink;
use crate::wallet::{BackendError, WalletBackend};
use crate::{constants, Scid};

pub const MY_ASSETS_TREE: &str = "my_assets";
/// Contract headers of the assets in `my_assets`, keyed the same way.
pub const ASSET_HEADERS_TREE: &str = "asset_headers";
pub const ASSET_SCAN_TREE: &str = "asset_scan";
pub const LAST_SCAN_KEY: &str = "Last Scan";
pub const USERNAMES_TREE: &str = "usernames";
pub const USERNAMES_KEY: &str = "usernames";

pub const NAME_HEADER: &str = "nameHdr";
pub const DESCRIPTION_HEADER: &str = "descrHdr";
pub const ICON_HEADER: &str = "iconURLHdr";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IndexerError {
    #[error("indexer is not active")]
    Inactive,
    #[error("indexer backend: {0}")]
    Backend(String),
    #[error(transparent)]
    Datashard(#[from] DatashardError),
    #[error(transparent)]
    Wallet(#[from] BackendError),
    #[error("indexer wait cancelled")]
    Cancelled,
    #[error("corrupt asset record: {0}")]
    Corrupt(String),
}

/// Start parameters handed to the external indexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexerOptions {
    pub db_path: PathBuf,
    pub endpoint: String,
    pub address: String,
    pub fastsync: bool,
    pub force: bool,
    pub skip_recheck: bool,
    pub no_code: bool,
    pub workers: usize,
}

impl IndexerOptions {
    /// The options used on login.
    pub fn for_login(db_path: PathBuf, endpoint: String, address: &Address) -> Self {
        IndexerOptions {
            db_path,
            endpoint,
            address: address.base().to_string(),
            fastsync: true,
            force: true,
            skip_recheck: true,
            no_code: true,
            workers: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeDetail {
    pub scid: String,
    pub entrypoint: String,
    pub signer: String,
    pub height: u64,
    pub txid: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub key: serde_json::Value,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniblockDetail {
    pub height: u64,
    pub miner: String,
    pub final_block: bool,
}

/// The external indexer.
pub trait IndexerBackend: Send + Sync {
    fn start(&self, options: &IndexerOptions) -> Result<(), String>;
    fn last_indexed_height(&self) -> u64;
    /// Every indexed contract, keyed by SCID hex, with its owner address.
    fn owners_and_scids(&self) -> HashMap<String, String>;
    fn sc_code(&self, scid: &Scid) -> Option<String>;
    /// String values stored under `key` at `height`.
    fn values_by_key(&self, scid: &Scid, key: &str, height: u64) -> Vec<String>;
    /// Keys whose stored string value equals `value` at `height`.
    fn keys_by_value(&self, scid: &Scid, value: &str, height: u64) -> Vec<String>;
    fn variables(&self, scid: &Scid, height: u64) -> Vec<Variable>;
    fn invoke_details(&self, scid: &Scid) -> Vec<InvokeDetail>;
    fn miniblocks(&self, address: &str) -> Vec<MiniblockDetail>;
    fn invalid_deploys(&self) -> Vec<String>;
    fn interaction_heights(&self, scid: &Scid, address: &str) -> Vec<u64>;
    fn close(&self);
}

/// One owned asset as shown in the asset manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub scid: Scid,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub owner: String,
    /// Address that installed the contract.
    pub signer: String,
    pub code: String,
    pub balance: u64,
    /// `format_money(balance)`.
    pub formatted: String,
}

impl AssetRecord {
    fn new(scid: Scid, header: ContractHeader, balance: u64) -> Self {
        AssetRecord {
            scid,
            name: header.name,
            description: header.description,
            icon: header.icon,
            owner: header.owner,
            signer: header.signer,
            code: header.code,
            balance,
            formatted: crate::format_money(balance),
        }
    }

    fn header(&self) -> ContractHeader {
        ContractHeader {
            name: self.name.clone(),
            description: self.description.clone(),
            icon: self.icon.clone(),
            owner: self.owner.clone(),
            signer: self.signer.clone(),
            code: self.code.clone(),
        }
    }
}

/// Contract header fields, with registry fallbacks applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractHeader {
    pub name: String,
    pub description: String,
    pub icon: String,
    pub owner: String,
    pub signer: String,
    pub code: String,
}

pub struct Indexer {
    backend: Arc<dyn IndexerBackend>,
    shard: Arc<Datashard>,
    /// Base address of the account the indexer was started for.
    account: String,
    events: EventSink,
    status: Mutex<String>,
    active: AtomicBool,
    poll_interval: Duration,
}

impl Indexer {
    /// Start the backend and return the running coordinator.
    pub fn start(
        backend: Arc<dyn IndexerBackend>,
        options: &IndexerOptions,
        shard: Arc<Datashard>,
        events: EventSink,
    ) -> Result<Self, IndexerError> {
        backend.start(options).map_err(|e| {
            tracing::warn!(error = %e, "Indexer failed to start");
            IndexerError::Backend(e)
        })?;
        tracing::info!(db = %options.db_path.display(), "Indexer started");
        Ok(Indexer {
            backend,
            shard,
            account: options.address.clone(),
            events,
            status: Mutex::new(String::new()),
            active: AtomicBool::new(true),
            poll_interval: Duration::from_millis(constants::POLL_INTERVAL_MS),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn check_active(&self) -> Result<(), IndexerError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(IndexerError::Inactive)
        }
    }

    pub fn status(&self) -> String {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_status(&self, text: String) {
        self.events.status(text.clone());
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = text;
    }

    pub fn last_indexed_height(&self) -> Result<u64, IndexerError> {
        self.check_active()?;
        Ok(self.backend.last_indexed_height())
    }

    /// Block until the indexer has caught up with the daemon tip.
    pub async fn wait_synced(
        &self,
        wallet: &Arc<dyn WalletBackend>,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexerError::Cancelled),
                _ = interval.tick() => {}
            }
            self.check_active()?;
            let w = wallet.clone();
            let target = tokio::task::spawn_blocking(move || w.daemon_height())
                .await
                .map_err(|e| IndexerError::Backend(e.to_string()))??;
            let indexed = self.backend.last_indexed_height();
            if indexed >= target {
                self.set_status(format!("Indexer synced at {}", indexed));
                return Ok(());
            }
            self.set_status(format!("Indexing {} / {}", indexed, target));
        }
    }

    /// Scan every indexed contract for a non-zero balance and persist the
    /// result in `my_assets`.
    pub async fn list_owned_assets(
        &self,
        wallet: &Arc<dyn WalletBackend>,
        cancel: &CancellationToken,
    ) -> Result<Vec<AssetRecord>, IndexerError> {
        self.wait_synced(wallet, cancel).await?;

        let mut scids: Vec<(Scid, String)> = self
            .backend
            .owners_and_scids()
            .into_iter()
            .filter_map(|(k, owner)| Some((k.parse().ok()?, owner)))
            .collect();
        scids.sort();
        let total = scids.len();
        let height = self.backend.last_indexed_height();
        let limit = Arc::new(Semaphore::new(constants::INDEXER_SCAN_WORKERS));
        let mut tasks = Vec::with_capacity(total);

        for (scid, owner) in scids {
            let permit = limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| IndexerError::Backend(e.to_string()))?;
            let wallet = wallet.clone();
            let backend = self.backend.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let balance = wallet.balance(&scid)?.total();
                if balance == 0 {
                    return Ok::<_, BackendError>(None);
                }
                let header = read_header(backend.as_ref(), &scid, Some(&owner), height);
                Ok(Some(AssetRecord::new(scid, header, balance)))
            }));
        }

        let mut records = Vec::new();
        for (done, task) in tasks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            match task.await {
                Ok(Ok(Some(record))) => records.push(record),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Asset balance read failed");
                    return Err(e.into());
                }
                Err(e) => return Err(IndexerError::Backend(e.to_string())),
            }
            if (done + 1) % 10 == 0 || done + 1 == total {
                self.set_status(format!("Scanned {} / {} assets", done + 1, total));
            }
        }

        self.persist_assets(&records)?;
        tracing::info!(assets = records.len(), scanned = total, "Asset scan complete");
        Ok(records)
    }

    fn persist_assets(&self, records: &[AssetRecord]) -> Result<(), IndexerError> {
        let fresh: BTreeMap<String, &AssetRecord> =
            records.iter().map(|r| (r.scid.to_hex(), r)).collect();
        for tree in [MY_ASSETS_TREE, ASSET_HEADERS_TREE] {
            for stale in self.shard.keys(tree)? {
                if !fresh.contains_key(&stale) {
                    self.shard.delete(tree, &stale)?;
                }
            }
        }
        for (key, record) in &fresh {
            self.shard
                .put_encrypted(MY_ASSETS_TREE, key, record.formatted.as_bytes())?;
            let header = serde_json::to_vec(&record.header())
                .map_err(|e| IndexerError::Corrupt(e.to_string()))?;
            self.shard.put_encrypted(ASSET_HEADERS_TREE, key, &header)?;
        }
        self.shard.commit(ASSET_HEADERS_TREE)?;
        self.shard.commit(MY_ASSETS_TREE)?;
        self.shard.store_encrypted(
            ASSET_SCAN_TREE,
            LAST_SCAN_KEY,
            crate::unix_now().to_string().as_bytes(),
        )?;
        Ok(())
    }

    /// Assets from the last scan, without rescanning.
    pub fn cached_assets(&self) -> Result<Vec<AssetRecord>, IndexerError> {
        let mut out = Vec::new();
        for key in self.shard.keys(MY_ASSETS_TREE)? {
            let Some(formatted) = self.shard.get_encrypted_string(MY_ASSETS_TREE, &key)? else {
                continue;
            };
            let corrupt = |what: &str| IndexerError::Corrupt(format!("{}: {}", key, what));
            let scid: Scid = key.parse().map_err(|_| corrupt("bad scid"))?;
            let balance = crate::parse_money(&formatted).ok_or_else(|| corrupt("bad balance"))?;
            let header = match self.shard.get_encrypted(ASSET_HEADERS_TREE, &key)? {
                Some(raw) => serde_json::from_slice(&raw).map_err(|e| corrupt(&e.to_string()))?,
                None => ContractHeader::default(),
            };
            out.push(AssetRecord::new(scid, header, balance));
        }
        Ok(out)
    }

    /// Unix time of the last completed scan.
    pub fn last_scan(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self
            .shard
            .get_encrypted_string(ASSET_SCAN_TREE, LAST_SCAN_KEY)?
            .and_then(|s| s.parse().ok()))
    }

    pub fn clear_last_scan(&self) -> Result<(), IndexerError> {
        self.shard.delete(ASSET_SCAN_TREE, LAST_SCAN_KEY)?;
        self.shard.commit(ASSET_SCAN_TREE)?;
        Ok(())
    }

    /// Names registered to `address`. The account's own names are persisted
    /// comma-joined under `usernames/usernames`.
    pub fn query_names(&self, address: &Address) -> Result<Vec<String>, IndexerError> {
        self.check_active()?;
        let owner = address.base().to_string();
        let height = self.backend.last_indexed_height();
        let mut names = self
            .backend
            .keys_by_value(&Scid::name_service(), &owner, height);
        names.sort();
        names.dedup();
        if owner == self.account {
            self.shard
                .store_encrypted(USERNAMES_TREE, USERNAMES_KEY, names.join(",").as_bytes())?;
        }
        Ok(names)
    }

    /// The account's names from the last `query_names`.
    pub fn cached_names(&self) -> Result<Vec<String>, IndexerError> {
        Ok(self
            .shard
            .get_encrypted_string(USERNAMES_TREE, USERNAMES_KEY)?
            .map(|joined| {
                joined
                    .split(',')
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn contract_header(&self, scid: &Scid) -> Result<ContractHeader, IndexerError> {
        self.check_active()?;
        let height = self.backend.last_indexed_height();
        let owner = self.backend.owners_and_scids().remove(&scid.to_hex());
        Ok(read_header(self.backend.as_ref(), scid, owner.as_deref(), height))
    }

    // ── Pass-through reads ──

    pub fn owners_and_scids(&self) -> Result<HashMap<String, String>, IndexerError> {
        self.check_active()?;
        Ok(self.backend.owners_and_scids())
    }

    pub fn values_by_key(&self, scid: &Scid, key: &str, height: u64) -> Result<Vec<String>, IndexerError> {
        self.check_active()?;
        Ok(self.backend.values_by_key(scid, key, height))
    }

    pub fn keys_by_value(&self, scid: &Scid, value: &str, height: u64) -> Result<Vec<String>, IndexerError> {
        self.check_active()?;
        Ok(self.backend.keys_by_value(scid, value, height))
    }

    pub fn variables(&self, scid: &Scid, height: u64) -> Result<Vec<Variable>, IndexerError> {
        self.check_active()?;
        Ok(self.backend.variables(scid, height))
    }

    /// Invocations of `scid`, optionally narrowed by entrypoint and signer.
    pub fn invoke_details(
        &self,
        scid: &Scid,
        entrypoint: Option<&str>,
        signer: Option<&str>,
    ) -> Result<Vec<InvokeDetail>, IndexerError> {
        self.check_active()?;
        Ok(self
            .backend
            .invoke_details(scid)
            .into_iter()
            .filter(|d| entrypoint.map_or(true, |e| d.entrypoint == e))
            .filter(|d| signer.map_or(true, |s| d.signer == s))
            .collect())
    }

    pub fn miniblocks(&self, address: &str) -> Result<Vec<MiniblockDetail>, IndexerError> {
        self.check_active()?;
        Ok(self.backend.miniblocks(address))
    }

    pub fn invalid_deploys(&self) -> Result<Vec<String>, IndexerError> {
        self.check_active()?;
        Ok(self.backend.invalid_deploys())
    }

    pub fn interaction_heights(&self, scid: &Scid, address: &str) -> Result<Vec<u64>, IndexerError> {
        self.check_active()?;
        Ok(self.backend.interaction_heights(scid, address))
    }

    /// Stop the backend and release its database. Idempotent.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.backend.close();
            self.set_status("Indexer closed".to_string());
            tracing::info!("Indexer closed");
        }
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.close();
    }
}

fn first(values: Vec<String>) -> Option<String> {
    values.into_iter().find(|v| !v.is_empty())
}

/// Header keys on the contract itself, falling back to the registry's
/// `<scid>`, `<scid>desc`, `<scid>iconURL` and `<scid>owner` entries.
/// `owner` is the indexer's owner entry for `scid`, if any.
fn read_header(
    backend: &dyn IndexerBackend,
    scid: &Scid,
    owner: Option<&str>,
    height: u64,
) -> ContractHeader {
    let registry = Scid::registry();
    let id = scid.to_hex();
    let lookup = |own: &str, fallback: String| {
        first(backend.values_by_key(scid, own, height))
            .or_else(|| first(backend.values_by_key(&registry, &fallback, height)))
            .unwrap_or_default()
    };
    let owner = owner
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .or_else(|| first(backend.values_by_key(&registry, &format!("{}owner", id), height)))
        .unwrap_or_default();
    let signer = backend
        .invoke_details(scid)
        .into_iter()
        .min_by_key(|d| d.height)
        .map(|d| d.signer)
        .unwrap_or_default();
    ContractHeader {
        name: lookup(NAME_HEADER, id.clone()),
        description: lookup(DESCRIPTION_HEADER, format!("{}desc", id)),
        icon: lookup(ICON_HEADER, format!("{}iconURL", id)),
        owner,
        signer,
        code: backend.sc_code(scid).unwrap_or_default(),
    }
}
