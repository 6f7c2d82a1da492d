//! Process façade and the per-account session.
//!
//! `Core` is owned by the host. It holds the pre-login settings shard, the
//! runtime configuration and at most one open `Session`. A session owns the
//! account's key store, datashard and wallet handle and every worker started
//! for the account; closing it cancels the session token, which is the
//! global stop signal for those workers.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::assets::{AssetError, AssetOps};
use crate::config::{AppPaths, EngramConfig, Network};
use crate::datapads::{DatapadError, Datapads, ExplorerHistory};
use crate::datashard::{Datashard, DatashardError};
use crate::events::{CoreEvent, EventSink};
use crate::health::HealthMonitor;
use crate::indexer::{Indexer, IndexerBackend, IndexerError, IndexerOptions};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::messaging::{Messaging, MessagingError, NameDirectory};
use crate::names::{NameError, NameService};
use crate::node_client::{NodeClient, NodeError};
use crate::price::PriceError;
use crate::registrar::{Registrar, RegistrarError, RegistrationJob};
use crate::rpc_bridge::{
    BridgeError, BridgeHandle, BridgeState, EpochBackend, IndexerSlot, RpcBridge,
};
use crate::settings::{RuntimeConfig, Settings, SettingsError};
use crate::transfer::{TransferBuilder, TransferError};
use crate::wallet::{BackendError, WalletBackend, WalletConnector};

// ── Errors ──

/// How an error is surfaced to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad user input; reported synchronously.
    Input,
    /// Wrong password, missing account, shard not writable.
    Access,
    /// Daemon or HTTP failure.
    Remote,
    /// Refused because offline mode is enabled.
    Offline,
    /// Indexer not running or behind.
    Indexer,
    /// Confirmation did not arrive within the block budget.
    Timeout,
    /// The session cannot continue.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no account is open")]
    NoSession,
    #[error("account {0} is already open")]
    SessionOpen(String),
    #[error("connection lost for account {0}; it must be closed first")]
    SessionLost(String),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error(transparent)]
    Datashard(#[from] DatashardError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Datapad(#[from] DatapadError),
    #[error(transparent)]
    Price(#[from] PriceError),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NoSession | CoreError::SessionOpen(_) | CoreError::SessionLost(_) => {
                ErrorKind::Access
            }
            CoreError::KeyStore(e) => keystore_kind(e),
            CoreError::Datashard(e) => datashard_kind(e),
            CoreError::Settings(e) => settings_kind(e),
            CoreError::Backend(e) => backend_kind(e),
            CoreError::Node(e) => node_kind(e),
            CoreError::Transfer(e) => transfer_kind(e),
            CoreError::Registrar(e) => match e {
                RegistrarError::Backend(b) => backend_kind(b),
                RegistrarError::Cancelled => ErrorKind::Access,
                RegistrarError::Spawn(_) => ErrorKind::Fatal,
                RegistrarError::Offline => ErrorKind::Offline,
                RegistrarError::AlreadyRegistered | RegistrarError::AlreadyRunning(_) => {
                    ErrorKind::Input
                }
            },
            CoreError::Indexer(e) => indexer_kind(e),
            CoreError::Messaging(e) => match e {
                MessagingError::Node(n) => node_kind(n),
                MessagingError::Wallet(b) => backend_kind(b),
                MessagingError::Transfer(t) => transfer_kind(t),
                MessagingError::Empty => ErrorKind::Input,
            },
            CoreError::Name(e) => match e {
                NameError::Timeout(..) => ErrorKind::Timeout,
                NameError::Cancelled => ErrorKind::Access,
                NameError::Transfer(t) => transfer_kind(t),
                NameError::Node(n) => node_kind(n),
                NameError::Indexer(i) => indexer_kind(i),
                NameError::TooShort(_)
                | NameError::TooLong(_)
                | NameError::NotOwned(_)
                | NameError::InvalidAddress(_) => ErrorKind::Input,
            },
            CoreError::Asset(e) => match e {
                AssetError::Transfer(t) => transfer_kind(t),
                AssetError::Node(n) => node_kind(n),
                AssetError::NoCode(_) => ErrorKind::Remote,
                _ => ErrorKind::Input,
            },
            CoreError::Bridge(e) => match e {
                BridgeError::IndexerInactive => ErrorKind::Indexer,
                BridgeError::Bind { .. } => ErrorKind::Access,
                BridgeError::Settings(s) => settings_kind(s),
                BridgeError::AlreadyRunning
                | BridgeError::BadAddress(_)
                | BridgeError::InvalidArgument(_) => ErrorKind::Input,
            },
            CoreError::Datapad(e) => match e {
                DatapadError::Datashard(d) => datashard_kind(d),
                _ => ErrorKind::Input,
            },
            CoreError::Price(PriceError::Offline) => ErrorKind::Offline,
            CoreError::Price(_) => ErrorKind::Remote,
        }
    }
}

fn keystore_kind(e: &KeyStoreError) -> ErrorKind {
    match e {
        KeyStoreError::Exists(_)
        | KeyStoreError::InvalidName(_)
        | KeyStoreError::Seed(_)
        | KeyStoreError::UnsupportedLanguage(_) => ErrorKind::Input,
        KeyStoreError::NotFound(_) | KeyStoreError::WrongPassword | KeyStoreError::Io(_) => {
            ErrorKind::Access
        }
        KeyStoreError::Corrupt(_) => ErrorKind::Fatal,
    }
}

fn datashard_kind(e: &DatashardError) -> ErrorKind {
    match e {
        DatashardError::Corrupt(_) => ErrorKind::Fatal,
        DatashardError::Io(_) | DatashardError::NoActiveAccount | DatashardError::Decrypt { .. } => {
            ErrorKind::Access
        }
        DatashardError::MissingTree
        | DatashardError::MissingKey
        | DatashardError::SnapshotNotFound { .. } => ErrorKind::Input,
    }
}

fn settings_kind(e: &SettingsError) -> ErrorKind {
    match e {
        SettingsError::Datashard(d) => datashard_kind(d),
        SettingsError::UnknownKey(_) | SettingsError::InvalidValue { .. } => ErrorKind::Input,
    }
}

fn node_kind(e: &NodeError) -> ErrorKind {
    match e {
        NodeError::Offline => ErrorKind::Offline,
        _ => ErrorKind::Remote,
    }
}

fn backend_kind(e: &BackendError) -> ErrorKind {
    match e {
        BackendError::Offline => ErrorKind::Offline,
        BackendError::InsufficientFunds { .. } => ErrorKind::Input,
        BackendError::NotRegistered => ErrorKind::Access,
        _ => ErrorKind::Remote,
    }
}

fn transfer_kind(e: &TransferError) -> ErrorKind {
    match e {
        TransferError::Backend(b) => backend_kind(b),
        TransferError::Node(n) => node_kind(n),
        TransferError::Offline => ErrorKind::Offline,
        TransferError::ConfirmationTimeout(_) | TransferError::ConfirmationStalled(_) => {
            ErrorKind::Timeout
        }
        TransferError::Cancelled => ErrorKind::Access,
        _ => ErrorKind::Input,
    }
}

fn indexer_kind(e: &IndexerError) -> ErrorKind {
    match e {
        IndexerError::Inactive | IndexerError::Backend(_) => ErrorKind::Indexer,
        IndexerError::Datashard(d) => datashard_kind(d),
        IndexerError::Wallet(b) => backend_kind(b),
        IndexerError::Cancelled => ErrorKind::Access,
        IndexerError::Corrupt(_) => ErrorKind::Fatal,
    }
}

// ── Core ──

pub struct Core {
    paths: AppPaths,
    config: EngramConfig,
    runtime: RuntimeConfig,
    settings: Settings,
    events: EventSink,
    connector: Arc<dyn WalletConnector>,
    indexer_backend: Option<Arc<dyn IndexerBackend>>,
    registrar: Registrar,
    bridge: RpcBridge,
    bridge_active: Arc<AtomicBool>,
    session: Option<Session>,
}

impl Core {
    /// Open the pre-login settings shard and load it into a fresh runtime.
    pub fn open(
        paths: AppPaths,
        config: EngramConfig,
        connector: Arc<dyn WalletConnector>,
        events: EventSink,
    ) -> Result<Self, CoreError> {
        let shard = Arc::new(Datashard::open(&paths.settings_shard(), None)?);
        let runtime = RuntimeConfig::default();
        runtime.update(|s| {
            s.request_timeout = config.host.request_timeout();
            s.lookup_table_size = config.host.lookup_table_size();
        });
        let settings = Settings::load(shard, runtime.clone())?;
        let bridge_active = Arc::new(AtomicBool::new(false));
        tracing::info!(
            root = %paths.root().display(),
            network = %runtime.network(),
            "Core opened"
        );
        Ok(Core {
            paths,
            config,
            settings,
            events,
            connector,
            indexer_backend: None,
            registrar: Registrar::new().with_runtime(runtime.clone()),
            runtime,
            bridge: RpcBridge::new(bridge_active.clone()),
            bridge_active,
            session: None,
        })
    }

    /// Indexer started at login when `gnomon` is enabled.
    pub fn with_indexer_backend(mut self, backend: Arc<dyn IndexerBackend>) -> Self {
        self.indexer_backend = Some(backend);
        self
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config(&self) -> &EngramConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Pre-login settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn network(&self) -> Network {
        self.runtime.network()
    }

    pub fn accounts(&self) -> Vec<String> {
        KeyStore::list(&self.paths, self.network())
    }

    pub fn create_account(
        &self,
        name: &str,
        password: &str,
        language: u32,
    ) -> Result<KeyStore, CoreError> {
        Ok(KeyStore::create(
            &self.paths,
            self.network(),
            name,
            password,
            language,
        )?)
    }

    pub fn restore_account(
        &self,
        name: &str,
        password: &str,
        phrase: &str,
    ) -> Result<KeyStore, CoreError> {
        Ok(KeyStore::restore(
            &self.paths,
            self.network(),
            name,
            password,
            phrase,
        )?)
    }

    /// Unlock an account and start its session workers.
    pub fn login(&mut self, name: &str, password: &str) -> Result<&mut Session, CoreError> {
        if let Some(s) = &self.session {
            let name = s.keys.name().to_string();
            return Err(if s.is_open() {
                CoreError::SessionOpen(name)
            } else {
                CoreError::SessionLost(name)
            });
        }
        let keys = KeyStore::open(&self.paths, self.network(), name, password)?;
        let shard_path = self.paths.account_shard(&keys.shard_id());
        let shard = Arc::new(Datashard::open(&shard_path, Some(Arc::new(keys.value_cipher())))?);
        let settings = Settings::bind(shard.clone(), self.runtime.clone());
        settings.overlay()?;

        let wallet = self.connector.connect(&keys, &self.runtime.snapshot())?;
        wallet.set_scan_window(self.runtime.snapshot().recent_blocks);
        let settings = settings.with_wallet(wallet.clone());
        let cancel = CancellationToken::new();
        let health = HealthMonitor::spawn(
            wallet.clone(),
            self.runtime.clone(),
            self.events.clone(),
            self.bridge_active.clone(),
            cancel.clone(),
        );
        let transfers = TransferBuilder::new(wallet.clone(), self.network(), self.events.clone())
            .with_runtime(self.runtime.clone());
        tracing::info!(account = %keys.name(), address = %keys.address(), "Session opened");

        let mut session = Session {
            keys,
            shard,
            settings,
            wallet,
            node: NodeClient::new(self.runtime.clone()),
            transfers,
            events: self.events.clone(),
            indexer: IndexerSlot::default(),
            registration: None,
            bridge: None,
            health: Some(health),
            cancel,
        };
        self.autostart_indexer(&mut session);
        Ok(self.session.insert(session))
    }

    /// Start the indexer with the login options when `gnomon` is on and the
    /// daemon answers. Failures are reported but do not fail the login.
    fn autostart_indexer(&self, session: &mut Session) {
        let snapshot = self.runtime.snapshot();
        if !snapshot.gnomon || snapshot.offline {
            return;
        }
        let Some(backend) = self.indexer_backend.clone() else {
            tracing::debug!("No indexer backend configured");
            return;
        };
        if let Err(e) = session.wallet.daemon_height() {
            tracing::warn!(error = %e, "Daemon unreachable, indexer not started");
            return;
        }
        let db = self.paths.indexer_db(snapshot.network);
        if let Err(e) = session.start_indexer(backend, db) {
            self.surface(&e);
        }
    }

    /// The open session. A session whose connection was lost counts as
    /// closed until it is reaped.
    pub fn session(&self) -> Result<&Session, CoreError> {
        self.session
            .as_ref()
            .filter(|s| s.is_open())
            .ok_or(CoreError::NoSession)
    }

    pub fn session_mut(&mut self) -> Result<&mut Session, CoreError> {
        self.session
            .as_mut()
            .filter(|s| s.is_open())
            .ok_or(CoreError::NoSession)
    }

    pub fn has_session(&self) -> bool {
        self.session().is_ok()
    }

    /// Close a session the health monitor gave up on. Returns whether one
    /// was closed.
    pub async fn reap(&mut self) -> bool {
        if self.session.as_ref().map_or(true, |s| s.is_open()) {
            return false;
        }
        if let Some(session) = self.session.take() {
            self.close_session(session).await;
        }
        true
    }

    /// Start the indexer for the open account.
    pub fn start_indexer(&mut self, backend: Arc<dyn IndexerBackend>) -> Result<Arc<Indexer>, CoreError> {
        let db = self.paths.indexer_db(self.network());
        self.session_mut()?.start_indexer(backend, db)
    }

    /// Start the proof-of-work registration search for the open account.
    pub fn start_registration(&mut self) -> Result<(), CoreError> {
        let threads = self.config.host.registrar_threads();
        let registrar = self.registrar.clone();
        self.session_mut()?.start_registration(&registrar, threads)
    }

    /// Serve the RPC bridge for the open account.
    pub async fn start_bridge(
        &mut self,
        addr: SocketAddr,
        epoch: Arc<dyn EpochBackend>,
    ) -> Result<SocketAddr, CoreError> {
        let max_hashes = self.config.host.max_epoch_hashes;
        let bridge = self.bridge.clone();
        self.session_mut()?
            .start_bridge(&bridge, addr, epoch, max_hashes)
            .await
    }

    /// Close the open session, if any.
    pub async fn logout(&mut self) {
        if let Some(session) = self.session.take() {
            self.close_session(session).await;
        }
    }

    /// Close `session` and put the pre-login settings back in the runtime.
    async fn close_session(&self, session: Session) {
        session.close().await;
        if let Err(e) = self.settings.apply() {
            tracing::warn!(error = %e, "Failed to restore pre-login settings");
        }
    }

    /// Log `err` at the level its kind calls for and publish it to the sink.
    pub fn surface(&self, err: &CoreError) {
        match err.kind() {
            ErrorKind::Fatal => {
                tracing::error!(error = %err, "Fatal error");
                self.events.emit(CoreEvent::Alert(err.to_string()));
            }
            ErrorKind::Remote | ErrorKind::Timeout | ErrorKind::Indexer => {
                tracing::warn!(error = %err, "Operation failed");
                self.events.toast(err.to_string());
            }
            ErrorKind::Input | ErrorKind::Access | ErrorKind::Offline => {
                tracing::debug!(error = %err, "Operation rejected");
                self.events.toast(err.to_string());
            }
        }
    }
}

// ── Session ──

pub struct Session {
    keys: KeyStore,
    shard: Arc<Datashard>,
    settings: Settings,
    wallet: Arc<dyn WalletBackend>,
    node: NodeClient,
    transfers: TransferBuilder,
    events: EventSink,
    indexer: IndexerSlot,
    registration: Option<RegistrationJob>,
    bridge: Option<BridgeHandle>,
    health: Option<HealthMonitor>,
    cancel: CancellationToken,
}

impl Session {
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyStore {
        &mut self.keys
    }

    pub fn address(&self) -> Address {
        self.keys.address()
    }

    pub fn shard(&self) -> &Arc<Datashard> {
        &self.shard
    }

    /// Account-level settings (username, bridge credentials, ring size).
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn wallet(&self) -> &Arc<dyn WalletBackend> {
        &self.wallet
    }

    pub fn node(&self) -> &NodeClient {
        &self.node
    }

    pub fn transfers(&self) -> &TransferBuilder {
        &self.transfers
    }

    /// Stopped when the session closes or its connection is lost.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn datapads(&self) -> Datapads {
        Datapads::new(self.shard.clone())
    }

    pub fn explorer_history(&self) -> ExplorerHistory {
        ExplorerHistory::new(self.shard.clone())
    }

    pub fn names(&self) -> NameService {
        NameService::new(self.node.clone())
    }

    pub fn assets(&self) -> AssetOps {
        AssetOps::new(self.node.clone())
    }

    pub fn indexer(&self) -> Option<Arc<Indexer>> {
        self.indexer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messaging(&self) -> Messaging {
        let names = self.indexer().map(|i| i as Arc<dyn NameDirectory>);
        Messaging::new(self.wallet.clone(), self.node.clone(), names)
    }

    /// Start an indexer, replacing (and first closing) any running one so
    /// only one holds the database at a time.
    pub fn start_indexer(
        &mut self,
        backend: Arc<dyn IndexerBackend>,
        db_path: std::path::PathBuf,
    ) -> Result<Arc<Indexer>, CoreError> {
        self.stop_indexer();
        let options = IndexerOptions::for_login(db_path, self.node.runtime().endpoint(), &self.address());
        let indexer = Arc::new(Indexer::start(
            backend,
            &options,
            self.shard.clone(),
            self.events.clone(),
        )?);
        *self.indexer.write().unwrap_or_else(|e| e.into_inner()) = Some(indexer.clone());
        Ok(indexer)
    }

    pub fn stop_indexer(&mut self) {
        let previous = self
            .indexer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(indexer) = previous {
            indexer.close();
        }
    }

    pub fn start_registration(&mut self, registrar: &Registrar, threads: usize) -> Result<(), CoreError> {
        let job = registrar.start(
            self.keys.name(),
            self.wallet.clone(),
            threads,
            self.events.clone(),
            &self.cancel,
        )?;
        self.registration = Some(job);
        Ok(())
    }

    pub fn registration(&self) -> Option<&RegistrationJob> {
        self.registration.as_ref()
    }

    /// Take the registration job to await its result.
    pub fn take_registration(&mut self) -> Option<RegistrationJob> {
        self.registration.take()
    }

    pub async fn start_bridge(
        &mut self,
        bridge: &RpcBridge,
        addr: SocketAddr,
        epoch: Arc<dyn EpochBackend>,
        max_hashes: u64,
    ) -> Result<SocketAddr, CoreError> {
        let state = BridgeState::new(
            self.wallet.clone(),
            self.settings.clone(),
            self.indexer.clone(),
            epoch,
            max_hashes,
        )
        .with_settings_auth()?;
        let handle = bridge.start(addr, state, self.events.clone()).await?;
        let local = handle.local_addr();
        self.bridge = Some(handle);
        Ok(local)
    }

    pub async fn stop_bridge(&mut self) {
        if let Some(handle) = self.bridge.take() {
            handle.stop().await;
        }
    }

    /// Stop every worker, release the indexer and the shard, then the wallet
    /// and the key store.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(job) = self.registration.take() {
            job.cancel();
            if let Err(e) = job.wait().await {
                tracing::debug!(error = %e, "Registration ended");
            }
        }
        self.stop_bridge().await;
        self.stop_indexer();
        if let Some(health) = self.health.take() {
            health.join().await;
        }
        match self.shard.compact() {
            Ok(removed) => tracing::debug!(removed, "Datashard compacted"),
            Err(e) => tracing::warn!(error = %e, "Datashard compaction failed"),
        }
        if let Err(e) = self.shard.flush() {
            tracing::warn!(error = %e, "Datashard flush failed");
        }
        self.wallet.close();
        tracing::info!(account = %self.keys.name(), "Session closed");
        self.keys.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capabilities;
    use crate::indexer::{InvokeDetail, MiniblockDetail, Variable};
    use crate::keystore::LANGUAGE_ENGLISH;
    use crate::settings::RuntimeSnapshot;
    use crate::wallet::mock::MockWallet;
    use crate::Scid;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Mocked {
        daemon_down: bool,
        lookup_table: AtomicUsize,
    }

    impl WalletConnector for Mocked {
        fn connect(
            &self,
            keys: &KeyStore,
            runtime: &RuntimeSnapshot,
        ) -> Result<Arc<dyn WalletBackend>, BackendError> {
            self.lookup_table
                .store(runtime.lookup_table_size, Ordering::SeqCst);
            let wallet = MockWallet::new(runtime.network, keys.public_key()[0]);
            wallet.daemon_down.store(self.daemon_down, Ordering::SeqCst);
            Ok(Arc::new(wallet))
        }
    }

    #[derive(Default)]
    struct Idle {
        started: Mutex<Option<IndexerOptions>>,
    }

    impl IndexerBackend for Idle {
        fn start(&self, options: &IndexerOptions) -> Result<(), String> {
            *self.started.lock().unwrap() = Some(options.clone());
            Ok(())
        }
        fn last_indexed_height(&self) -> u64 {
            0
        }
        fn owners_and_scids(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        fn sc_code(&self, _scid: &Scid) -> Option<String> {
            None
        }
        fn values_by_key(&self, _scid: &Scid, _key: &str, _h: u64) -> Vec<String> {
            vec![]
        }
        fn keys_by_value(&self, _scid: &Scid, _value: &str, _h: u64) -> Vec<String> {
            vec![]
        }
        fn variables(&self, _scid: &Scid, _h: u64) -> Vec<Variable> {
            vec![]
        }
        fn invoke_details(&self, _scid: &Scid) -> Vec<InvokeDetail> {
            vec![]
        }
        fn miniblocks(&self, _address: &str) -> Vec<MiniblockDetail> {
            vec![]
        }
        fn invalid_deploys(&self) -> Vec<String> {
            vec![]
        }
        fn interaction_heights(&self, _scid: &Scid, _address: &str) -> Vec<u64> {
            vec![]
        }
        fn close(&self) {}
    }

    fn open_core(
        dir: &std::path::Path,
        config: EngramConfig,
        connector: Arc<Mocked>,
        events: EventSink,
    ) -> Core {
        Core::open(AppPaths::new(dir), config, connector, events).unwrap()
    }

    fn core(dir: &std::path::Path) -> Core {
        open_core(
            dir,
            EngramConfig::default(),
            Arc::new(Mocked::default()),
            EventSink::detached(),
        )
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            CoreError::from(KeyStoreError::WrongPassword).kind(),
            ErrorKind::Access
        );
        assert_eq!(
            CoreError::from(TransferError::CommentTooLong(200)).kind(),
            ErrorKind::Input
        );
        assert_eq!(
            CoreError::from(TransferError::ConfirmationTimeout(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            CoreError::from(TransferError::ConfirmationStalled(60)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            CoreError::from(NodeError::Timeout("DERO.GetInfo".into())).kind(),
            ErrorKind::Remote
        );
        assert_eq!(CoreError::from(NodeError::Offline).kind(), ErrorKind::Offline);
        assert_eq!(CoreError::from(TransferError::Offline).kind(), ErrorKind::Offline);
        assert_eq!(CoreError::from(RegistrarError::Offline).kind(), ErrorKind::Offline);
        assert_eq!(
            CoreError::from(NameError::Transfer(TransferError::Node(NodeError::Offline))).kind(),
            ErrorKind::Offline
        );
        assert_eq!(CoreError::from(IndexerError::Inactive).kind(), ErrorKind::Indexer);
        assert_eq!(
            CoreError::from(DatashardError::Corrupt("bad".into())).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            CoreError::from(NameError::Transfer(TransferError::Backend(
                BackendError::InsufficientFunds { needed: 2, available: 1 }
            )))
            .kind(),
            ErrorKind::Input
        );
        assert_eq!(CoreError::from(BridgeError::IndexerInactive).kind(), ErrorKind::Indexer);
        assert_eq!(CoreError::SessionLost("alice".into()).kind(), ErrorKind::Access);
    }

    #[tokio::test]
    async fn login_and_logout() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path());
        assert!(matches!(core.session(), Err(CoreError::NoSession)));
        core.create_account("alice", "pw", LANGUAGE_ENGLISH).unwrap();
        assert_eq!(core.accounts(), vec!["alice".to_string()]);

        assert!(matches!(
            core.login("alice", "wrong"),
            Err(CoreError::KeyStore(KeyStoreError::WrongPassword))
        ));
        let session = core.login("alice", "pw").unwrap();
        session.datapads().create("notes").unwrap();
        let token = session.cancel_token().clone();
        let shard_path = session.shard().path().unwrap().to_path_buf();
        assert!(shard_path.starts_with(dir.path().join("datashards")));
        assert!(matches!(
            core.login("alice", "pw"),
            Err(CoreError::SessionOpen(_))
        ));
        assert!(!core.reap().await);

        core.logout().await;
        assert!(token.is_cancelled());
        assert!(!core.has_session());

        let session = core.login("alice", "pw").unwrap();
        assert_eq!(session.datapads().list().unwrap(), vec!["notes".to_string()]);
        core.logout().await;
    }

    #[tokio::test]
    async fn gnomon_starts_indexer_at_login() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(Idle::default());
        let mut core = core(dir.path()).with_indexer_backend(backend.clone());
        core.create_account("alice", "pw", LANGUAGE_ENGLISH).unwrap();

        let session = core.login("alice", "pw").unwrap();
        assert!(session.indexer().is_none());
        session.settings().set_gnomon(true).unwrap();
        core.logout().await;
        assert!(!core.runtime().snapshot().gnomon);

        let session = core.login("alice", "pw").unwrap();
        let indexer = session.indexer().unwrap();
        assert!(indexer.is_active());
        let options = backend.started.lock().unwrap().clone().unwrap();
        assert!(options.fastsync && options.force && options.skip_recheck && options.no_code);
        assert_eq!(options.workers, 1);
        assert_eq!(options.address, session.address().base().to_string());
        core.logout().await;
        assert!(!indexer.is_active());
    }

    #[tokio::test]
    async fn account_settings_return_on_login() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path());
        core.create_account("alice", "pw", LANGUAGE_ENGLISH).unwrap();

        let session = core.login("alice", "pw").unwrap();
        session.settings().set_endpoint("node.example:10102").unwrap();
        session.settings().set_recent_blocks(500).unwrap();
        session.settings().set_offline(true).unwrap();
        core.logout().await;
        let host = core.runtime().snapshot();
        assert!(!host.offline);
        assert_eq!(host.endpoint, Network::Mainnet.default_endpoint());
        assert_eq!(host.recent_blocks, 0);

        core.login("alice", "pw").unwrap();
        let snap = core.runtime().snapshot();
        assert!(snap.offline);
        assert_eq!(snap.endpoint, "node.example:10102");
        assert_eq!(snap.recent_blocks, 500);

        let err = core.session().unwrap().transfers().dispatch_all().unwrap_err();
        assert_eq!(err, TransferError::Offline);
        assert_eq!(CoreError::from(err).kind(), ErrorKind::Offline);
        assert!(matches!(
            core.start_registration(),
            Err(CoreError::Registrar(RegistrarError::Offline))
        ));
        core.logout().await;
    }

    #[tokio::test]
    async fn lookup_table_follows_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(Mocked::default());
        let config = EngramConfig {
            host: Capabilities::mobile(),
            ..Default::default()
        };
        let mut core = open_core(dir.path(), config, connector.clone(), EventSink::detached());
        core.create_account("alice", "pw", LANGUAGE_ENGLISH).unwrap();
        core.login("alice", "pw").unwrap();
        assert_eq!(connector.lookup_table.load(Ordering::SeqCst), 1 << 21);
        core.logout().await;
    }

    #[tokio::test]
    async fn lost_connection_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(Mocked {
            daemon_down: true,
            ..Default::default()
        });
        let (events, mut rx) = EventSink::channel();
        let backend = Arc::new(Idle::default());
        let mut core = open_core(dir.path(), EngramConfig::default(), connector, events)
            .with_indexer_backend(backend.clone());
        core.settings().set_gnomon(true).unwrap();
        core.create_account("alice", "pw", LANGUAGE_ENGLISH).unwrap();

        let session = core.login("alice", "pw").unwrap();
        assert!(session.indexer().is_none());
        assert!(backend.started.lock().unwrap().is_none());
        let token = session.cancel_token().clone();

        let lost = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if event == CoreEvent::ConnectionLost {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(lost);
        token.cancelled().await;
        assert!(!core.has_session());
        assert!(matches!(core.session(), Err(CoreError::NoSession)));
        assert!(matches!(
            core.login("alice", "pw"),
            Err(CoreError::SessionLost(_))
        ));

        assert!(core.reap().await);
        assert!(!core.reap().await);
        core.login("alice", "pw").unwrap();
        core.logout().await;
    }

    #[tokio::test]
    async fn indexer_needs_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path());
        assert!(matches!(core.start_registration(), Err(CoreError::NoSession)));
        assert!(matches!(
            core.start_bridge("127.0.0.1:0".parse().unwrap(), Arc::new(crate::rpc_bridge::LocalEpoch::new()))
                .await,
            Err(CoreError::NoSession)
        ));
        assert!(matches!(
            core.start_indexer(Arc::new(Idle::default())),
            Err(CoreError::NoSession)
        ));
    }
}
