//! Boundary to the external wallet library.
//!
//! Balance decoding, ring-signature construction and transaction
//! serialization live outside this crate. The core drives them through
//! `WalletBackend`, obtained from a `WalletConnector` once the key store is
//! open. Calls may block on the network and are made from blocking contexts
//! (`spawn_blocking` or worker threads).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::args::{self, Arguments};
use crate::keystore::KeyStore;
use crate::settings::RuntimeSnapshot;
use crate::{Hash, Scid};

/// Errors reported by the wallet library.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("wallet is offline")]
    Offline,
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
    #[error("account is not registered")]
    NotRegistered,
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("transaction build failed: {0}")]
    Build(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("wallet error: {0}")]
    Other(String),
}

/// Decoded balance of one asset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable now.
    pub mature: u64,
    /// Received but not yet spendable.
    pub locked: u64,
}

impl Balance {
    pub fn total(&self) -> u64 {
        self.mature.saturating_add(self.locked)
    }
}

/// One output of a transaction being built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub scid: Scid,
    /// Destination address string. Integrated arguments have already been
    /// folded into `payload`.
    pub destination: String,
    pub amount: u64,
    pub burn: u64,
    pub payload: Arguments,
}

/// A built, signed transaction ready to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub txid: Hash,
    pub raw: Vec<u8>,
    pub fees: u64,
}

impl Transaction {
    pub fn txid_hex(&self) -> String {
        hex::encode(self.txid)
    }

    /// Number of leading zero bytes in the txid.
    pub fn leading_zero_bytes(&self) -> usize {
        self.txid.iter().take_while(|b| **b == 0).count()
    }
}

/// A payment index entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub txid: Hash,
    pub height: u64,
    pub topoheight: u64,
    pub time: u64,
    pub incoming: bool,
    pub coinbase: bool,
    pub scid: Scid,
    pub amount: u64,
    pub burn: u64,
    pub fees: u64,
    /// Destination address string of an outgoing entry.
    pub destination: Option<String>,
    pub payload: Arguments,
}

impl Entry {
    pub fn txid_hex(&self) -> String {
        hex::encode(self.txid)
    }

    pub fn destination_port(&self) -> Option<u64> {
        self.payload.uint64(args::DESTINATION_PORT)
    }

    pub fn comment(&self) -> Option<&str> {
        self.payload.string(args::COMMENT)
    }

    /// Sender address attached to an incoming entry.
    pub fn replyback(&self) -> Option<&Address> {
        self.payload.address(args::REPLYBACK_ADDRESS)
    }
}

/// Filter for `WalletBackend::payments`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentQuery {
    pub scid: Scid,
    pub port: Option<u64>,
    /// Only entries strictly above this height.
    pub min_height: u64,
    pub incoming: bool,
    pub outgoing: bool,
    pub txid: Option<Hash>,
}

impl PaymentQuery {
    pub fn all(scid: Scid) -> Self {
        PaymentQuery {
            scid,
            port: None,
            min_height: 0,
            incoming: true,
            outgoing: true,
            txid: None,
        }
    }

    pub fn port(mut self, port: u64) -> Self {
        self.port = Some(port);
        self
    }

    pub fn above(mut self, height: u64) -> Self {
        self.min_height = height;
        self
    }

    pub fn txid(mut self, txid: Hash) -> Self {
        self.txid = Some(txid);
        self
    }

    pub fn incoming_only(mut self) -> Self {
        self.outgoing = false;
        self
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        entry.scid == self.scid
            && entry.height > self.min_height
            && (if entry.incoming { self.incoming } else { self.outgoing })
            && self.port.map_or(true, |p| entry.destination_port() == Some(p))
            && self.txid.map_or(true, |t| entry.txid == t)
    }
}

/// Operations the core needs from an open wallet.
pub trait WalletBackend: Send + Sync {
    fn address(&self) -> Address;
    fn is_registered(&self) -> bool;
    /// Height the wallet has synchronized to.
    fn wallet_height(&self) -> u64;
    fn wallet_topoheight(&self) -> u64;
    /// Current daemon tip, queried through the wallet's connection.
    fn daemon_height(&self) -> Result<u64, BackendError>;
    fn balance(&self, scid: &Scid) -> Result<Balance, BackendError>;
    fn payments(&self, query: &PaymentQuery) -> Result<Vec<Entry>, BackendError>;
    /// Build and sign one transaction carrying every transfer in the batch.
    fn build_transaction(
        &self,
        transfers: &[Transfer],
        ring_size: u64,
        sc_args: &Arguments,
        gas_storage: u64,
    ) -> Result<Transaction, BackendError>;
    fn send(&self, tx: &Transaction) -> Result<(), BackendError>;
    /// A fresh registration transaction with a random nonce.
    fn registration_candidate(&self) -> Result<Transaction, BackendError>;
    /// Limit balance/payment scans to the last `blocks` blocks; `0` scans all.
    fn set_scan_window(&self, blocks: u64);
    fn close(&self);
}

/// Opens a `WalletBackend` for an unlocked key store. `runtime` carries the
/// endpoint, scan window and the lookup table size the wallet should build.
pub trait WalletConnector: Send + Sync {
    fn connect(
        &self,
        keys: &KeyStore,
        runtime: &RuntimeSnapshot,
    ) -> Result<Arc<dyn WalletBackend>, BackendError>;
}
