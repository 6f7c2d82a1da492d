//! # Engram
//!
//! Wallet orchestration core for a privacy-preserving, account-based chain
//! with an on-chain smart-contract VM:
//! - **Datashards**: per-account, snapshot-versioned local store with
//!   wallet-encrypted values
//! - **Transfer pipeline**: staging, argument packing, ring-size policy,
//!   dispatch and block-count confirmation
//! - **Registration**: CPU-parallel proof-of-work search for a registration
//!   transaction
//! - **Indexer coordination**: "my assets", contract headers and name lookups
//! - **Messaging**: chat-style transfers on a fixed destination port
//! - **RPC bridge**: authenticated JSON-RPC surface for external dApps

pub mod address;
pub mod args;
pub mod assets;
pub mod config;
pub mod datapads;
pub mod datashard;
pub mod dvm;
pub mod events;
pub mod health;
pub mod indexer;
pub mod keystore;
pub mod messaging;
pub mod names;
pub mod node_client;
pub mod price;
pub mod registrar;
pub mod rpc_bridge;
pub mod session;
pub mod settings;
pub mod transfer;
pub mod wallet;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol and wallet constants
pub mod constants {
    /// Atomic units per whole coin (5 decimal places).
    pub const ATOMIC_UNITS_PER_COIN: u64 = 100_000;
    /// Number of decimal places shown by `format_money`.
    pub const MONEY_DECIMALS: usize = 5;

    /// Destination port reserved for chat-style messages.
    pub const MESSAGE_PORT: u64 = 1337;
    /// Message transfers expire this many seconds after creation.
    pub const MESSAGE_EXPIRY_SECS: u64 = 3_600;
    /// Default value carried by a message transfer (atomic units).
    pub const MESSAGE_DEFAULT_AMOUNT: u64 = 2;

    /// Maximum comment length in bytes.
    pub const COMMENT_LIMIT: usize = 130;
    /// Maximum packed size of the arguments carried by one transfer.
    pub const PAYLOAD0_LIMIT: usize = 144;

    /// Smallest accepted ring size.
    pub const MIN_RING_SIZE: u64 = 2;
    /// Largest accepted ring size; larger requests are clamped.
    pub const MAX_RING_SIZE: u64 = 128;
    /// Ring size preference stored in a freshly created account.
    pub const DEFAULT_RING_SIZE: u64 = 16;
    /// Ring size used for contract invocations (signer is revealed).
    pub const CONTRACT_RING_SIZE: u64 = 2;

    /// Number of block-height increments before a confirmation wait fails.
    pub const DEFAULT_CONFIRMATION_TIMEOUT: u64 = 5;
    /// Poll period for block-level waits (confirmation, sync, health).
    pub const POLL_INTERVAL_MS: u64 = 1_000;
    /// Per-call bound on every daemon/HTTP request.
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;

    /// Leading zero bytes required in a registration transaction hash.
    pub const REGISTRATION_ZERO_BYTES: usize = 3;

    /// Bounded worker pool used by asset rescans.
    pub const INDEXER_SCAN_WORKERS: usize = 15;

    /// Name-service contract id.
    pub const NAME_SERVICE_SCID: &str =
        "0000000000000000000000000000000000000000000000000000000000000001";
    /// Global registry contract used as header fallback.
    pub const REGISTRY_SCID: &str =
        "a05395bb0cf77adc850928b0db00eb5ca7a9ccbafd9a38d021c8d299ad5ce1a4";
    /// Public key of the fee destination for name-service calls.
    pub const NAME_FEE_KEY: &str =
        "6e2f1d1a7c0b4f6e9a3d2c8b5e7f10243a6b9c0d1e2f3a4b5c6d7e8f90a1b2c3";
    /// Registered names are at least this many bytes long.
    pub const NAME_MIN_LEN: usize = 6;
    /// Registered names are shorter than this many bytes.
    pub const NAME_MAX_LEN: usize = 64;

    /// Upper bound on hashes a single EPOCH request may ask for.
    pub const DEFAULT_MAX_EPOCH_HASHES: u64 = 1_000;

    /// Default quote source and the JSON pointer to its price field.
    pub const PRICE_URL: &str =
        "https://api.coingecko.com/api/v3/simple/price?ids=dero&vs_currencies=usd";
    pub const PRICE_POINTER: &str = "/dero/usd";

    /// Default daemon endpoints.
    pub const MAINNET_ENDPOINT: &str = "127.0.0.1:10102";
    pub const TESTNET_ENDPOINT: &str = "127.0.0.1:40402";
    pub const SIMULATOR_ENDPOINT: &str = "127.0.0.1:20000";

    /// Default wallet RPC (bridge) ports.
    pub const MAINNET_WALLET_RPC_PORT: u16 = 10103;
    pub const TESTNET_WALLET_RPC_PORT: u16 = 40403;
    pub const SIMULATOR_WALLET_RPC_PORT: u16 = 30000;

    /// Lookup table sizes selected by host capabilities.
    pub const DESKTOP_LOOKUP_TABLE_BITS: u32 = 24;
    pub const MOBILE_LOOKUP_TABLE_BITS: u32 = 21;

    /// Maximum size accepted by `deserialize` (16 MiB).
    pub const MAX_DECODE_BYTES: usize = 16 * 1024 * 1024;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Smart-contract identifier. The all-zero id denotes the native coin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scid(pub Hash);

impl Scid {
    /// The native coin.
    pub const NATIVE: Scid = Scid([0u8; 32]);

    pub fn is_native(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn name_service() -> Scid {
        Self::from_const(constants::NAME_SERVICE_SCID)
    }

    pub fn registry() -> Scid {
        Self::from_const(constants::REGISTRY_SCID)
    }

    fn from_const(hex_id: &str) -> Scid {
        hex_id.parse().unwrap_or_default()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Scid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Error returned when a SCID string is not 64 hex characters.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid SCID: {0}")]
pub struct InvalidScid(pub String);

impl FromStr for Scid {
    type Err = InvalidScid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| InvalidScid(s.to_string()))?;
        let hash: Hash = bytes
            .as_slice()
            .try_into()
            .map_err(|_| InvalidScid(s.to_string()))?;
        Ok(Scid(hash))
    }
}

/// Format atomic units as a fixed five-decimal string (`100` → `"0.00100"`).
pub fn format_money(atomic: u64) -> String {
    format!(
        "{}.{:0width$}",
        atomic / constants::ATOMIC_UNITS_PER_COIN,
        atomic % constants::ATOMIC_UNITS_PER_COIN,
        width = constants::MONEY_DECIMALS
    )
}

/// Parse a decimal coin amount into atomic units.
///
/// Accepts at most five fractional digits; rejects negative, empty and
/// overflowing input.
pub fn parse_money(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > constants::MONEY_DECIMALS
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
        || (whole.is_empty() && frac.is_empty())
    {
        return None;
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_units: u64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    for _ in frac.len()..constants::MONEY_DECIMALS {
        frac_units *= 10;
    }
    whole
        .checked_mul(constants::ATOMIC_UNITS_PER_COIN)?
        .checked_add(frac_units)
}

/// Seconds since the UNIX epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain must be valid UTF-8; every caller passes an ASCII literal.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).unwrap_or("engram.invalid-domain");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of two byte slices.
///
/// The length comparison is not constant-time; callers compare fixed-size
/// MACs or credentials whose length is not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_DECODE_BYTES`.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_DECODE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
