//! Host configuration and network selection.
//!
//! Loads optional `engram.toml` from the app root. Missing file means
//! defaults; an unparsable file is logged and replaced by defaults. The
//! per-account configuration lives in datashards (see `settings`), this file
//! only carries what the host process decides before any account is open.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Chain the wallet talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Simulator,
}

impl Network {
    pub fn is_mainnet(self) -> bool {
        self == Network::Mainnet
    }

    /// Directory under the app root that holds key store files.
    pub fn wallet_dir(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Simulator => "testnet_simulator",
        }
    }

    /// Daemon endpoint used when the settings shard has none.
    pub fn default_endpoint(self) -> &'static str {
        match self {
            Network::Mainnet => constants::MAINNET_ENDPOINT,
            Network::Testnet => constants::TESTNET_ENDPOINT,
            Network::Simulator => constants::SIMULATOR_ENDPOINT,
        }
    }

    /// Port the RPC bridge binds by default.
    pub fn wallet_rpc_port(self) -> u16 {
        match self {
            Network::Mainnet => constants::MAINNET_WALLET_RPC_PORT,
            Network::Testnet => constants::TESTNET_WALLET_RPC_PORT,
            Network::Simulator => constants::SIMULATOR_WALLET_RPC_PORT,
        }
    }

    /// Indexer database directory under `datashards/`.
    pub fn indexer_dir(self) -> &'static str {
        match self {
            Network::Mainnet => "gnomon",
            Network::Testnet | Network::Simulator => "gnomon_testnet",
        }
    }

    /// Human-readable address prefix.
    pub fn address_prefix(self) -> &'static str {
        match self {
            Network::Mainnet => "dero",
            Network::Testnet | Network::Simulator => "deto",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Simulator => "simulator",
        })
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "simulator" | "testnet_simulator" => Ok(Network::Simulator),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngramConfig {
    pub host: Capabilities,
    pub bridge: BridgeConfig,
    pub price: PriceConfig,
}

/// What the host device can afford. Mobile hosts run with a smaller lookup
/// table and fewer registration workers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub mobile: bool,
    pub lookup_table_bits: u32,
    /// Registration worker threads; `0` means half the logical CPUs.
    pub registrar_threads: usize,
    pub max_epoch_hashes: u64,
    pub request_timeout_secs: u64,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            mobile: false,
            lookup_table_bits: constants::DESKTOP_LOOKUP_TABLE_BITS,
            registrar_threads: 0,
            max_epoch_hashes: constants::DEFAULT_MAX_EPOCH_HASHES,
            request_timeout_secs: constants::REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Capabilities {
    pub fn mobile() -> Self {
        Capabilities {
            mobile: true,
            lookup_table_bits: constants::MOBILE_LOOKUP_TABLE_BITS,
            ..Self::default()
        }
    }

    /// Number of entries in the balance-decoding lookup table.
    pub fn lookup_table_size(&self) -> usize {
        1usize << self.lookup_table_bits.min(usize::BITS - 1)
    }

    /// `max(1, ncpus / 2)` unless the host pinned a thread count.
    pub fn registrar_threads(&self) -> usize {
        if self.registrar_threads > 0 {
            return self.registrar_threads;
        }
        (num_cpus::get() / 2).max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// RPC bridge section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_host: String,
    /// Overrides the per-network wallet RPC port when non-zero.
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            bind_host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

/// Quote source for the price display.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    pub url: String,
    /// JSON pointer to the quoted number in the response body.
    pub pointer: String,
}

impl Default for PriceConfig {
    fn default() -> Self {
        PriceConfig {
            url: constants::PRICE_URL.into(),
            pointer: constants::PRICE_POINTER.into(),
        }
    }
}

impl EngramConfig {
    /// Load configuration from `engram.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(app_root: &Path) -> Self {
        let config_path = app_root.join("engram.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// On-disk layout rooted at the application directory.
#[derive(Clone, Debug)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        AppPaths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wallet_dir(&self, network: Network) -> PathBuf {
        self.root.join(network.wallet_dir())
    }

    pub fn wallet_file(&self, network: Network, name: &str) -> PathBuf {
        self.wallet_dir(network).join(format!("{}.db", name))
    }

    pub fn datashards(&self) -> PathBuf {
        self.root.join("datashards")
    }

    pub fn settings_shard(&self) -> PathBuf {
        self.datashards().join("settings")
    }

    pub fn account_shard(&self, shard_id: &str) -> PathBuf {
        self.datashards().join(shard_id)
    }

    pub fn indexer_db(&self, network: Network) -> PathBuf {
        self.datashards().join(network.indexer_dir())
    }
}
