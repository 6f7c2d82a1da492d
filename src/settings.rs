//! Typed settings stored in a datashard's `settings` tree.
//!
//! Writing a setting commits it to the shard and updates the shared
//! `RuntimeConfig`, which remote operations read at call time. The host keeps
//! one `Settings` over the pre-login shard; an open session keeps another
//! over the account shard for the encrypted values (username, bridge
//! credentials).

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{Capabilities, Network};
use crate::datashard::{Datashard, DatashardError};
use crate::wallet::WalletBackend;

pub const SETTINGS_TREE: &str = "settings";

pub const KEY_NETWORK: &str = "network";
pub const KEY_ENDPOINT: &str = "endpoint";
pub const KEY_GNOMON: &str = "gnomon";
pub const KEY_AUTH_MODE: &str = "auth_mode";
pub const KEY_USERNAME: &str = "username";
pub const KEY_RECENT_BLOCKS: &str = "recent_blocks";
pub const KEY_OFFLINE: &str = "offline";
pub const KEY_STRICT_MESSAGES: &str = "strict_messages";
pub const KEY_RING_SIZE: &str = "ring_size";
pub const KEY_BRIDGE_USER: &str = "bridge_user";
pub const KEY_BRIDGE_PASS: &str = "bridge_pass";

/// Plaintext keys accepted by `Settings::set`.
pub const PLAIN_KEYS: &[&str] = &[
    KEY_NETWORK,
    KEY_ENDPOINT,
    KEY_GNOMON,
    KEY_AUTH_MODE,
    KEY_RECENT_BLOCKS,
    KEY_OFFLINE,
    KEY_STRICT_MESSAGES,
    KEY_RING_SIZE,
];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Datashard(#[from] DatashardError),
    #[error("unknown setting: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Values remote operations consult at call time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub network: Network,
    pub endpoint: String,
    pub offline: bool,
    pub gnomon: bool,
    pub auth_mode: bool,
    pub recent_blocks: u64,
    pub strict_messages: bool,
    pub request_timeout: Duration,
    /// Entries in the wallet's balance-decoding lookup table.
    pub lookup_table_size: usize,
}

impl Default for RuntimeSnapshot {
    fn default() -> Self {
        RuntimeSnapshot {
            network: Network::Mainnet,
            endpoint: Network::Mainnet.default_endpoint().to_string(),
            offline: false,
            gnomon: false,
            auth_mode: true,
            recent_blocks: 0,
            strict_messages: false,
            request_timeout: Capabilities::default().request_timeout(),
            lookup_table_size: Capabilities::default().lookup_table_size(),
        }
    }
}

/// Process-wide configuration map, shared by handle.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig(Arc<RwLock<RuntimeSnapshot>>);

impl RuntimeConfig {
    pub fn new(snapshot: RuntimeSnapshot) -> Self {
        RuntimeConfig(Arc::new(RwLock::new(snapshot)))
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut RuntimeSnapshot)) {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn network(&self) -> Network {
        self.0.read().unwrap_or_else(|e| e.into_inner()).network
    }

    pub fn endpoint(&self) -> String {
        self.0.read().unwrap_or_else(|e| e.into_inner()).endpoint.clone()
    }

    pub fn is_offline(&self) -> bool {
        self.0.read().unwrap_or_else(|e| e.into_inner()).offline
    }

    pub fn request_timeout(&self) -> Duration {
        self.0.read().unwrap_or_else(|e| e.into_inner()).request_timeout
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn valid_endpoint(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Typed accessors over one shard's `settings` tree.
#[derive(Clone)]
pub struct Settings {
    shard: Arc<Datashard>,
    runtime: RuntimeConfig,
    wallet: Option<Arc<dyn WalletBackend>>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("shard", &self.shard)
            .field("runtime", &self.runtime)
            .field("wallet", &self.wallet.is_some())
            .finish()
    }
}

impl Settings {
    /// Bind to a shard without touching `runtime`.
    pub fn bind(shard: Arc<Datashard>, runtime: RuntimeConfig) -> Self {
        Settings {
            shard,
            runtime,
            wallet: None,
        }
    }

    /// Apply scan window changes to `wallet` as they are written.
    pub fn with_wallet(mut self, wallet: Arc<dyn WalletBackend>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    /// Bind to a shard and load its stored values into `runtime`.
    pub fn load(shard: Arc<Datashard>, runtime: RuntimeConfig) -> Result<Self, SettingsError> {
        let settings = Self::bind(shard, runtime);
        settings.apply()?;
        Ok(settings)
    }

    /// Write every value this shard holds, with defaults, into `runtime`.
    pub fn apply(&self) -> Result<(), SettingsError> {
        let network = self.network()?;
        let endpoint = self.endpoint()?;
        let gnomon = self.gnomon()?;
        let auth_mode = self.auth_mode()?;
        let recent_blocks = self.recent_blocks()?;
        let offline = self.offline()?;
        let strict_messages = self.strict_messages()?;
        self.runtime.update(|s| {
            s.network = network;
            s.endpoint = endpoint;
            s.gnomon = gnomon;
            s.auth_mode = auth_mode;
            s.recent_blocks = recent_blocks;
            s.offline = offline;
            s.strict_messages = strict_messages;
        });
        Ok(())
    }

    /// Apply the values this shard has stored over `runtime`. Keys the shard
    /// never stored keep their current runtime value. The network stays the
    /// one the runtime already has, since accounts are listed per network.
    pub fn overlay(&self) -> Result<(), SettingsError> {
        let active = self.runtime.network();
        if let Some(stored) = self.read(KEY_NETWORK)?.and_then(|v| v.parse::<Network>().ok()) {
            if stored != active {
                tracing::warn!(%stored, %active, "Stored network ignored for the open account");
            }
        }
        let endpoint = self.read(KEY_ENDPOINT)?.filter(|v| valid_endpoint(v));
        let gnomon = self.stored_bool(KEY_GNOMON)?;
        let auth_mode = self.stored_bool(KEY_AUTH_MODE)?;
        let offline = self.stored_bool(KEY_OFFLINE)?;
        let strict_messages = self.stored_bool(KEY_STRICT_MESSAGES)?;
        let recent_blocks = self
            .read(KEY_RECENT_BLOCKS)?
            .and_then(|v| v.trim().parse().ok());
        self.runtime.update(|s| {
            if let Some(v) = endpoint {
                s.endpoint = v;
            }
            if let Some(v) = gnomon {
                s.gnomon = v;
            }
            if let Some(v) = auth_mode {
                s.auth_mode = v;
            }
            if let Some(v) = offline {
                s.offline = v;
            }
            if let Some(v) = strict_messages {
                s.strict_messages = v;
            }
            if let Some(v) = recent_blocks {
                s.recent_blocks = v;
            }
        });
        Ok(())
    }

    pub fn shard(&self) -> &Arc<Datashard> {
        &self.shard
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    fn read(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.shard.get_string(SETTINGS_TREE, key)?)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.shard.store(SETTINGS_TREE, key, value.as_bytes())?;
        tracing::debug!(key, "Setting updated");
        Ok(())
    }

    fn stored_bool(&self, key: &str) -> Result<Option<bool>, SettingsError> {
        Ok(self.read(key)?.and_then(|v| parse_bool(key, &v).ok()))
    }

    fn read_bool(&self, key: &str, default: bool) -> Result<bool, SettingsError> {
        Ok(self.stored_bool(key)?.unwrap_or(default))
    }

    pub fn network(&self) -> Result<Network, SettingsError> {
        Ok(self
            .read(KEY_NETWORK)?
            .and_then(|v| v.parse().ok())
            .unwrap_or_default())
    }

    pub fn set_network(&self, network: Network) -> Result<(), SettingsError> {
        self.write(KEY_NETWORK, &network.to_string())?;
        let endpoint = self.endpoint()?;
        self.runtime.update(|s| {
            s.network = network;
            s.endpoint = endpoint;
        });
        Ok(())
    }

    /// Stored endpoint, or the network default.
    pub fn endpoint(&self) -> Result<String, SettingsError> {
        match self.read(KEY_ENDPOINT)? {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Ok(self.network()?.default_endpoint().to_string()),
        }
    }

    pub fn set_endpoint(&self, endpoint: &str) -> Result<(), SettingsError> {
        let endpoint = endpoint.trim();
        if !valid_endpoint(endpoint) {
            return Err(SettingsError::InvalidValue {
                key: KEY_ENDPOINT.into(),
                value: endpoint.into(),
            });
        }
        self.write(KEY_ENDPOINT, endpoint)?;
        self.runtime.update(|s| s.endpoint = endpoint.to_string());
        Ok(())
    }

    pub fn gnomon(&self) -> Result<bool, SettingsError> {
        self.read_bool(KEY_GNOMON, false)
    }

    pub fn set_gnomon(&self, enabled: bool) -> Result<(), SettingsError> {
        self.write(KEY_GNOMON, if enabled { "1" } else { "0" })?;
        self.runtime.update(|s| s.gnomon = enabled);
        Ok(())
    }

    pub fn auth_mode(&self) -> Result<bool, SettingsError> {
        self.read_bool(KEY_AUTH_MODE, true)
    }

    pub fn set_auth_mode(&self, enabled: bool) -> Result<(), SettingsError> {
        self.write(KEY_AUTH_MODE, if enabled { "true" } else { "false" })?;
        self.runtime.update(|s| s.auth_mode = enabled);
        Ok(())
    }

    pub fn recent_blocks(&self) -> Result<u64, SettingsError> {
        Ok(self
            .read(KEY_RECENT_BLOCKS)?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }

    pub fn set_recent_blocks(&self, blocks: u64) -> Result<(), SettingsError> {
        self.write(KEY_RECENT_BLOCKS, &blocks.to_string())?;
        self.runtime.update(|s| s.recent_blocks = blocks);
        if let Some(wallet) = &self.wallet {
            wallet.set_scan_window(blocks);
        }
        Ok(())
    }

    pub fn offline(&self) -> Result<bool, SettingsError> {
        self.read_bool(KEY_OFFLINE, false)
    }

    pub fn set_offline(&self, offline: bool) -> Result<(), SettingsError> {
        self.write(KEY_OFFLINE, if offline { "true" } else { "false" })?;
        self.runtime.update(|s| s.offline = offline);
        Ok(())
    }

    pub fn strict_messages(&self) -> Result<bool, SettingsError> {
        self.read_bool(KEY_STRICT_MESSAGES, false)
    }

    pub fn set_strict_messages(&self, strict: bool) -> Result<(), SettingsError> {
        self.write(KEY_STRICT_MESSAGES, if strict { "true" } else { "false" })?;
        self.runtime.update(|s| s.strict_messages = strict);
        Ok(())
    }

    /// Default ring size for new transfers.
    pub fn ring_size(&self) -> Result<u64, SettingsError> {
        Ok(self
            .read(KEY_RING_SIZE)?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(crate::constants::DEFAULT_RING_SIZE))
    }

    pub fn set_ring_size(&self, ring_size: u64) -> Result<(), SettingsError> {
        let ring_size = crate::transfer::select_ring_size(Some(ring_size)).map_err(|_| {
            SettingsError::InvalidValue {
                key: KEY_RING_SIZE.to_string(),
                value: ring_size.to_string(),
            }
        })?;
        self.write(KEY_RING_SIZE, &ring_size.to_string())
    }

    // ── Encrypted ──

    /// Primary registered name. Requires an account shard.
    pub fn username(&self) -> Result<Option<String>, SettingsError> {
        Ok(self.shard.get_encrypted_string(SETTINGS_TREE, KEY_USERNAME)?)
    }

    pub fn set_username(&self, name: &str) -> Result<(), SettingsError> {
        self.shard
            .store_encrypted(SETTINGS_TREE, KEY_USERNAME, name.as_bytes())?;
        Ok(())
    }

    pub fn bridge_credentials(&self) -> Result<Option<(String, String)>, SettingsError> {
        let user = self.shard.get_encrypted_string(SETTINGS_TREE, KEY_BRIDGE_USER)?;
        let pass = self.shard.get_encrypted_string(SETTINGS_TREE, KEY_BRIDGE_PASS)?;
        Ok(user.zip(pass))
    }

    pub fn set_bridge_credentials(&self, user: &str, pass: &str) -> Result<(), SettingsError> {
        self.shard
            .put_encrypted(SETTINGS_TREE, KEY_BRIDGE_USER, user.as_bytes())?;
        self.shard
            .put_encrypted(SETTINGS_TREE, KEY_BRIDGE_PASS, pass.as_bytes())?;
        self.shard.commit(SETTINGS_TREE)?;
        Ok(())
    }

    // ── Untyped (host CLI) ──

    /// Current value of a plaintext setting, with defaults applied.
    pub fn get(&self, key: &str) -> Result<String, SettingsError> {
        Ok(match key {
            KEY_NETWORK => self.network()?.to_string(),
            KEY_ENDPOINT => self.endpoint()?,
            KEY_GNOMON => (if self.gnomon()? { "1" } else { "0" }).to_string(),
            KEY_AUTH_MODE => self.auth_mode()?.to_string(),
            KEY_RECENT_BLOCKS => self.recent_blocks()?.to_string(),
            KEY_OFFLINE => self.offline()?.to_string(),
            KEY_STRICT_MESSAGES => self.strict_messages()?.to_string(),
            KEY_RING_SIZE => self.ring_size()?.to_string(),
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        })
    }

    /// Parse and store a plaintext setting.
    pub fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            KEY_NETWORK => self.set_network(value.parse().map_err(|_| invalid())?),
            KEY_ENDPOINT => self.set_endpoint(value),
            KEY_GNOMON => self.set_gnomon(parse_bool(key, value)?),
            KEY_AUTH_MODE => self.set_auth_mode(parse_bool(key, value)?),
            KEY_RECENT_BLOCKS => self.set_recent_blocks(value.trim().parse().map_err(|_| invalid())?),
            KEY_OFFLINE => self.set_offline(parse_bool(key, value)?),
            KEY_STRICT_MESSAGES => self.set_strict_messages(parse_bool(key, value)?),
            KEY_RING_SIZE => self.set_ring_size(value.trim().parse().map_err(|_| invalid())?),
            other => Err(SettingsError::UnknownKey(other.to_string())),
        }
    }
}
