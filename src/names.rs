//! Name-service registration, ownership transfer and lookups.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::args::Argument;
use crate::config::Network;
use crate::indexer::{Indexer, IndexerError};
use crate::node_client::{NodeClient, NodeError};
use crate::transfer::{ContractCall, TransferBuilder, TransferError};
use crate::wallet::{Transaction, Transfer, WalletBackend};
use crate::{constants, Scid};

pub const REGISTER: &str = "Register";
pub const TRANSFER_OWNERSHIP: &str = "TransferOwnership";

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("name must be at least {min} bytes, got {0}", min = constants::NAME_MIN_LEN)]
    TooShort(usize),
    #[error("name must be shorter than {max} bytes, got {0}", max = constants::NAME_MAX_LEN)]
    TooLong(usize),
    #[error("name {0} is not owned by this account")]
    NotOwned(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("name {0} did not update within {1} blocks")]
    Timeout(String, u64),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Indexer(#[from] IndexerError),
}

pub fn validate_name(name: &str) -> Result<(), NameError> {
    let len = name.len();
    if len < constants::NAME_MIN_LEN {
        return Err(NameError::TooShort(len));
    }
    if len >= constants::NAME_MAX_LEN {
        return Err(NameError::TooLong(len));
    }
    Ok(())
}

/// Destination of the zero-value transfer that carries name-service fees.
pub fn fee_address(network: Network) -> Address {
    let mut key = [0u8; 32];
    if let Ok(bytes) = hex::decode(constants::NAME_FEE_KEY) {
        if bytes.len() == key.len() {
            key.copy_from_slice(&bytes);
        }
    }
    Address::new(network, key)
}

pub struct NameService {
    node: NodeClient,
    poll_interval: Duration,
    timeout_blocks: u64,
}

impl NameService {
    pub fn new(node: NodeClient) -> Self {
        NameService {
            node,
            poll_interval: Duration::from_millis(constants::POLL_INTERVAL_MS),
            timeout_blocks: constants::DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, timeout_blocks: u64) -> Self {
        self.poll_interval = poll_interval;
        self.timeout_blocks = timeout_blocks;
        self
    }

    fn call(&self, entrypoint: &str) -> ContractCall {
        let network = self.node.runtime().network();
        ContractCall::new(Scid::name_service(), entrypoint).transfer(Transfer {
            scid: Scid::NATIVE,
            destination: fee_address(network).to_string(),
            amount: 0,
            burn: 0,
            payload: Default::default(),
        })
    }

    /// Register `name` to this account and wait until the indexer lists it.
    pub async fn register(
        &self,
        builder: &TransferBuilder,
        indexer: &Indexer,
        wallet: &Arc<dyn WalletBackend>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Transaction, NameError> {
        validate_name(name)?;
        let call = self
            .call(REGISTER)
            .param(Argument::string("name", name));
        let tx = builder.invoke(&self.node, &call).await?;
        tracing::info!(name, txid = %tx.txid_hex(), "Name registration sent");
        self.await_names(indexer, wallet, name, true, cancel).await?;
        Ok(tx)
    }

    /// Hand `name` to `new_owner` and wait until it leaves this account.
    pub async fn transfer_ownership(
        &self,
        builder: &TransferBuilder,
        indexer: &Indexer,
        wallet: &Arc<dyn WalletBackend>,
        name: &str,
        new_owner: &str,
        cancel: &CancellationToken,
    ) -> Result<Transaction, NameError> {
        validate_name(name)?;
        let network = self.node.runtime().network();
        let owner = Address::parse_for(new_owner, network)
            .map_err(|e| NameError::InvalidAddress(e.to_string()))?;
        if !indexer.query_names(&wallet.address())?.iter().any(|n| n == name) {
            return Err(NameError::NotOwned(name.to_string()));
        }
        let call = self
            .call(TRANSFER_OWNERSHIP)
            .param(Argument::string("name", name))
            .param(Argument::string("newowner", owner.base().to_string()));
        let tx = builder.invoke(&self.node, &call).await?;
        tracing::info!(name, txid = %tx.txid_hex(), "Name transfer sent");
        self.await_names(indexer, wallet, name, false, cancel).await?;
        Ok(tx)
    }

    /// Poll `query_names` until `name` is (or is no longer) listed, counting
    /// block-height increments toward the timeout.
    async fn await_names(
        &self,
        indexer: &Indexer,
        wallet: &Arc<dyn WalletBackend>,
        name: &str,
        present: bool,
        cancel: &CancellationToken,
    ) -> Result<(), NameError> {
        let address = wallet.address();
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut start: Option<u64> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(NameError::Cancelled),
                _ = interval.tick() => {}
            }
            let listed = indexer.query_names(&address)?.iter().any(|n| n == name);
            if listed == present {
                return Ok(());
            }
            let height = wallet.wallet_height();
            let first = *start.get_or_insert(height);
            if height.saturating_sub(first) >= self.timeout_blocks {
                return Err(NameError::Timeout(name.to_string(), self.timeout_blocks));
            }
        }
    }

    /// Resolve a name at the tip.
    pub async fn lookup(&self, name: &str) -> Result<Address, NameError> {
        let raw = self.node.name_to_address(name.trim(), -1).await?;
        raw.parse()
            .map_err(|e: crate::address::AddressError| NameError::InvalidAddress(e.to_string()))
    }

    /// Resolve a name as of `topoheight`.
    pub async fn lookup_at(&self, name: &str, topoheight: i64) -> Result<Address, NameError> {
        let raw = self.node.name_to_address(name.trim(), topoheight).await?;
        raw.parse()
            .map_err(|e: crate::address::AddressError| NameError::InvalidAddress(e.to_string()))
    }

    /// Names currently registered to `address`.
    pub fn names_of(&self, indexer: &Indexer, address: &Address) -> Result<Vec<String>, NameError> {
        Ok(indexer.query_names(address)?)
    }
}
