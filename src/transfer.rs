//! Transfer pipeline: staging, dispatch, contract invocation, confirmation.
//!
//! Transfers are validated one at a time into a batch. `dispatch_all` builds
//! one transaction carrying the whole batch, so either every staged transfer
//! reaches the mempool or none does. Confirmation is counted in block-height
//! increments, not wall-clock time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::args::{self, ArgValue, Argument, Arguments, ArgsError, DataType};
use crate::config::Network;
use crate::events::{EventSink, TransferStatus};
use crate::node_client::{NodeClient, NodeError};
use crate::settings::RuntimeConfig;
use crate::wallet::{BackendError, PaymentQuery, Transaction, Transfer, WalletBackend};
use crate::{constants, Hash, Scid};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid destination address: {0}")]
    InvalidAddress(String),
    #[error("integrated address has no destination port")]
    MissingPort,
    #[error("integrated address expired at {0}")]
    Expired(u64),
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("comment is {0} bytes, limit is {limit}", limit = constants::COMMENT_LIMIT)]
    CommentTooLong(usize),
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("ring size {0} is not a power of two in [2, 128]; using 2")]
    InvalidRingSize(u64),
    #[error("ring size {requested} does not match staged batch ring size {batch}")]
    RingSizeMismatch { batch: u64, requested: u64 },
    #[error("arguments pack to {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("arguments: {0}")]
    Args(ArgsError),
    #[error("no transfers staged")]
    EmptyBatch,
    #[error("a dispatch is already in progress")]
    DispatchInProgress,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("not confirmed after {0} blocks")]
    ConfirmationTimeout(u64),
    #[error("confirmation polling failed {0} times in a row")]
    ConfirmationStalled(u32),
    #[error("offline mode is enabled")]
    Offline,
    #[error("cancelled")]
    Cancelled,
}

impl From<ArgsError> for TransferError {
    fn from(e: ArgsError) -> Self {
        match e {
            ArgsError::Oversize { size, limit } => TransferError::PayloadTooLarge { size, limit },
            other => TransferError::Args(other),
        }
    }
}

/// Ring size policy: unset means 2, anything above 128 is clamped, and
/// anything else must be a power of two of at least 2.
pub fn select_ring_size(requested: Option<u64>) -> Result<u64, TransferError> {
    match requested {
        None | Some(0) => Ok(constants::MIN_RING_SIZE),
        Some(r) if r > constants::MAX_RING_SIZE => Ok(constants::MAX_RING_SIZE),
        Some(r) if r >= constants::MIN_RING_SIZE && r.is_power_of_two() => Ok(r),
        Some(r) => Err(TransferError::InvalidRingSize(r)),
    }
}

/// A user request to send funds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferIntent {
    pub destination: String,
    pub amount: u64,
    pub burn: u64,
    pub scid: Scid,
    pub comment: Option<String>,
    pub port: Option<u64>,
    pub ring_size: Option<u64>,
}

impl TransferIntent {
    pub fn new(destination: impl Into<String>, amount: u64) -> Self {
        TransferIntent {
            destination: destination.into(),
            amount,
            ..Default::default()
        }
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn port(mut self, port: u64) -> Self {
        self.port = Some(port);
        self
    }

    pub fn ring_size(mut self, ring_size: u64) -> Self {
        self.ring_size = Some(ring_size);
        self
    }

    pub fn asset(mut self, scid: Scid) -> Self {
        self.scid = scid;
        self
    }

    pub fn burn(mut self, burn: u64) -> Self {
        self.burn = burn;
        self
    }
}

/// A validated transfer waiting in the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedTransfer {
    pub transfer: Transfer,
    pub ring_size: u64,
}

impl StagedTransfer {
    pub fn amount(&self) -> u64 {
        self.transfer.amount
    }

    pub fn port(&self) -> Option<u64> {
        self.transfer.payload.uint64(args::DESTINATION_PORT)
    }

    pub fn comment(&self) -> Option<&str> {
        self.transfer.payload.string(args::COMMENT)
    }
}

/// A contract invocation (`SC_ACTION = 0`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractCall {
    pub scid: Scid,
    pub entrypoint: String,
    pub params: Arguments,
    /// Value transfers and burns attached to the call. Must name at least
    /// one destination to carry the fee.
    pub transfers: Vec<Transfer>,
    pub ring_size: u64,
}

impl ContractCall {
    pub fn new(scid: Scid, entrypoint: impl Into<String>) -> Self {
        ContractCall {
            scid,
            entrypoint: entrypoint.into(),
            params: Arguments::new(),
            transfers: Vec::new(),
            ring_size: constants::CONTRACT_RING_SIZE,
        }
    }

    pub fn param(mut self, arg: Argument) -> Self {
        self.params.set(arg);
        self
    }

    pub fn transfer(mut self, transfer: Transfer) -> Self {
        self.transfers.push(transfer);
        self
    }

    /// Full argument set sent with the transaction.
    pub fn sc_args(&self) -> Arguments {
        let mut out = Arguments::new()
            .with(Argument::uint64(args::SC_ACTION, args::SC_ACTION_CALL))
            .with(Argument::new(args::SC_ID, ArgValue::Hash(self.scid.0)))
            .with(Argument::string(args::SC_ENTRYPOINT, self.entrypoint.clone()));
        for p in self.params.iter() {
            out.set(p.clone());
        }
        out
    }
}

/// Confirmation polling knobs.
#[derive(Clone, Copy, Debug)]
pub struct ConfirmPolicy {
    pub poll_interval: Duration,
    /// Block-height increments to wait before failing.
    pub timeout_blocks: u64,
    /// Consecutive failed polls before giving up.
    pub max_failed_polls: u32,
}

/// One minute of failed polls at the default interval.
pub const MAX_FAILED_POLLS: u32 = 60;

impl Default for ConfirmPolicy {
    fn default() -> Self {
        ConfirmPolicy {
            poll_interval: Duration::from_millis(constants::POLL_INTERVAL_MS),
            timeout_blocks: constants::DEFAULT_CONFIRMATION_TIMEOUT,
            max_failed_polls: MAX_FAILED_POLLS,
        }
    }
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TransferBuilder {
    wallet: Arc<dyn WalletBackend>,
    network: Network,
    events: EventSink,
    batch: Mutex<Vec<StagedTransfer>>,
    dispatching: AtomicBool,
    policy: ConfirmPolicy,
    runtime: Option<RuntimeConfig>,
}

impl TransferBuilder {
    pub fn new(wallet: Arc<dyn WalletBackend>, network: Network, events: EventSink) -> Self {
        Self::with_policy(wallet, network, events, ConfirmPolicy::default())
    }

    pub fn with_policy(
        wallet: Arc<dyn WalletBackend>,
        network: Network,
        events: EventSink,
        policy: ConfirmPolicy,
    ) -> Self {
        TransferBuilder {
            wallet,
            network,
            events,
            batch: Mutex::new(Vec::new()),
            dispatching: AtomicBool::new(false),
            policy,
            runtime: None,
        }
    }

    /// Refuse to build or send while `runtime` is offline.
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn ensure_online(&self) -> Result<(), TransferError> {
        match &self.runtime {
            Some(r) if r.is_offline() => Err(TransferError::Offline),
            _ => Ok(()),
        }
    }

    pub fn batch(&self) -> Vec<StagedTransfer> {
        self.batch.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn batch_len(&self) -> usize {
        self.batch.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.batch.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.events.transfer(TransferStatus::Idle);
    }

    /// Validate one intent and append it to the batch. Blocks on a balance
    /// query.
    pub fn stage(&self, intent: TransferIntent) -> Result<StagedTransfer, TransferError> {
        let staged = self.assemble(intent).map_err(|e| {
            tracing::debug!(error = %e, "Transfer rejected at staging");
            e
        })?;
        let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(first) = batch.first() {
            if first.ring_size != staged.ring_size {
                return Err(TransferError::RingSizeMismatch {
                    batch: first.ring_size,
                    requested: staged.ring_size,
                });
            }
        }
        let already: u64 = batch
            .iter()
            .filter(|s| s.transfer.scid == staged.transfer.scid)
            .map(|s| s.transfer.amount.saturating_add(s.transfer.burn))
            .sum();
        let needed = already
            .saturating_add(staged.transfer.amount)
            .saturating_add(staged.transfer.burn);
        let available = self.wallet.balance(&staged.transfer.scid)?.mature;
        if needed > available {
            return Err(TransferError::InsufficientFunds { needed, available });
        }
        batch.push(staged.clone());
        self.events.transfer(TransferStatus::Staging);
        Ok(staged)
    }

    fn assemble(&self, intent: TransferIntent) -> Result<StagedTransfer, TransferError> {
        let dest = Address::parse_for(&intent.destination, self.network)
            .map_err(|e| TransferError::InvalidAddress(e.to_string()))?;
        let ring_size = select_ring_size(intent.ring_size)?;

        let mut amount = intent.amount;
        let mut payload;
        if dest.is_integrated() {
            payload = dest.arguments().clone();
            if !payload.has(args::DESTINATION_PORT, DataType::Uint64) {
                return Err(TransferError::MissingPort);
            }
            if let Some(value) = payload.uint64(args::VALUE_TRANSFER) {
                amount = value;
            }
            if let Some(expiry) = payload.time(args::EXPIRY) {
                if expiry <= crate::unix_now() {
                    return Err(TransferError::Expired(expiry));
                }
            }
            if payload.string(args::COMMENT).is_none() {
                if let Some(c) = &intent.comment {
                    payload.set(Argument::string(args::COMMENT, c.clone()));
                }
            }
            if payload.remove(args::NEEDS_REPLYBACK_ADDRESS).is_some() {
                payload.set(Argument::new(
                    args::REPLYBACK_ADDRESS,
                    ArgValue::Address(self.wallet.address().base()),
                ));
            }
        } else {
            payload = Arguments::new();
            if let Some(port) = intent.port {
                payload.set(Argument::uint64(args::DESTINATION_PORT, port));
            }
            if let Some(c) = &intent.comment {
                payload.set(Argument::string(args::COMMENT, c.clone()));
            }
        }
        if payload.is_empty() {
            payload = Arguments::new()
                .with(Argument::uint64(args::DESTINATION_PORT, 0))
                .with(Argument::string(args::COMMENT, ""));
        }

        let comment_len = payload.string(args::COMMENT).map_or(0, |c| c.len());
        if comment_len > constants::COMMENT_LIMIT {
            return Err(TransferError::CommentTooLong(comment_len));
        }
        if amount == 0 && intent.burn == 0 {
            return Err(TransferError::ZeroAmount);
        }
        payload.check_size(constants::PAYLOAD0_LIMIT)?;

        Ok(StagedTransfer {
            transfer: Transfer {
                scid: intent.scid,
                destination: dest.base().to_string(),
                amount,
                burn: intent.burn,
                payload,
            },
            ring_size,
        })
    }

    /// Build and send the whole batch as one transaction. On success the
    /// batch is cleared; on failure it is kept for a retry. Blocks.
    pub fn dispatch_all(&self) -> Result<Transaction, TransferError> {
        self.ensure_online()?;
        if self.dispatching.swap(true, Ordering::AcqRel) {
            return Err(TransferError::DispatchInProgress);
        }
        let _guard = DispatchGuard(&self.dispatching);

        let staged = self.batch();
        let first = staged.first().ok_or(TransferError::EmptyBatch)?;
        let ring_size = first.ring_size;
        let transfers: Vec<Transfer> = staged.iter().map(|s| s.transfer.clone()).collect();

        self.events.transfer(TransferStatus::Pending);
        let tx = self
            .wallet
            .build_transaction(&transfers, ring_size, &Arguments::new(), 0)
            .and_then(|tx| self.wallet.send(&tx).map(|_| tx))
            .map_err(|e| {
                tracing::warn!(error = %e, transfers = transfers.len(), "Dispatch failed");
                self.events.transfer(TransferStatus::Failed {
                    reason: e.to_string(),
                });
                TransferError::Backend(e)
            })?;

        {
            let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
            let sent = staged.len().min(batch.len());
            batch.drain(..sent);
        }
        tracing::info!(txid = %tx.txid_hex(), transfers = transfers.len(), "Batch dispatched");
        Ok(tx)
    }

    /// Estimate gas, then build and send a contract call.
    pub async fn invoke(&self, node: &NodeClient, call: &ContractCall) -> Result<Transaction, TransferError> {
        self.ensure_online()?;
        let ring_size = select_ring_size(Some(call.ring_size))?;
        let sc_args = call.sc_args();
        sc_args.check_size(constants::PAYLOAD0_LIMIT)?;
        for t in &call.transfers {
            let balance = self.wallet.balance(&t.scid)?.mature;
            let needed = t.amount.saturating_add(t.burn);
            if needed > balance {
                return Err(TransferError::InsufficientFunds { needed, available: balance });
            }
        }
        let signer = self.wallet.address().base().to_string();

        self.events.transfer(TransferStatus::Pending);
        let gas = match node.gas_estimate(&signer, &call.transfers, &sc_args).await {
            Ok(gas) => gas,
            Err(e) => {
                self.events.transfer(TransferStatus::Failed { reason: e.to_string() });
                return Err(e.into());
            }
        };

        let wallet = self.wallet.clone();
        let transfers = call.transfers.clone();
        let built = tokio::task::spawn_blocking(move || {
            let tx = wallet.build_transaction(&transfers, ring_size, &sc_args, gas.gasstorage)?;
            wallet.send(&tx)?;
            Ok::<_, BackendError>(tx)
        })
        .await
        .map_err(|e| BackendError::Other(e.to_string()))
        .and_then(|r| r);

        match built {
            Ok(tx) => {
                tracing::info!(
                    txid = %tx.txid_hex(),
                    scid = %call.scid,
                    entrypoint = %call.entrypoint,
                    "Contract invoked"
                );
                Ok(tx)
            }
            Err(e) => {
                self.events.transfer(TransferStatus::Failed { reason: e.to_string() });
                Err(e.into())
            }
        }
    }

    /// Poll the payment index for `txid` until it appears or the chain
    /// advances `timeout_blocks` heights. Returns the confirming height.
    pub async fn await_confirmation(
        &self,
        txid: Hash,
        scid: Scid,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let total = self.policy.timeout_blocks;
        let mut last_height: Option<u64> = None;
        let mut seen = 0u64;
        let mut failed_polls = 0u32;
        let mut interval = tokio::time::interval(self.policy.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = interval.tick() => {}
            }

            let wallet = self.wallet.clone();
            let query = PaymentQuery::all(scid).txid(txid);
            let polled = tokio::task::spawn_blocking(move || {
                let found = wallet.payments(&query)?;
                Ok::<_, BackendError>((found, wallet.wallet_height()))
            })
            .await
            .map_err(|e| BackendError::Other(e.to_string()))
            .and_then(|r| r);

            let (found, height) = match polled {
                Ok(v) => {
                    failed_polls = 0;
                    v
                }
                Err(e) => {
                    failed_polls += 1;
                    tracing::warn!(error = %e, failed_polls, "Confirmation poll failed");
                    if failed_polls >= self.policy.max_failed_polls {
                        self.events.transfer(TransferStatus::Failed {
                            reason: e.to_string(),
                        });
                        return Err(TransferError::ConfirmationStalled(failed_polls));
                    }
                    continue;
                }
            };
            if let Some(entry) = found.first() {
                self.events.transfer(TransferStatus::Confirmed {
                    txid: hex::encode(txid),
                });
                return Ok(entry.height);
            }
            if let Some(prev) = last_height {
                if height > prev {
                    seen = seen.saturating_add(height - prev);
                    self.events.transfer(TransferStatus::Confirming {
                        seen: seen.min(total),
                        total,
                    });
                }
            }
            last_height = Some(last_height.map_or(height, |prev| prev.max(height)));
            if seen >= total {
                self.events.transfer(TransferStatus::Failed {
                    reason: format!("not confirmed after {} blocks", total),
                });
                return Err(TransferError::ConfirmationTimeout(total));
            }
        }
    }
}
