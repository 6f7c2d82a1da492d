//! Typed events published to the presentation sink.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::Scid;

/// Status light shown by the presentation sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Indicator {
    Green,
    Yellow,
    Red,
    Gray,
}

/// Progress of a staged batch or contract call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Idle,
    Staging,
    Pending,
    Confirming { seen: u64, total: u64 },
    Failed { reason: String },
    Confirmed { txid: String },
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Failed { .. } | TransferStatus::Confirmed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum CoreEvent {
    Connection(Indicator),
    Sync(Indicator),
    Bridge(Indicator),
    Height { wallet: u64, daemon: u64 },
    Balance { scid: Scid, mature: u64, locked: u64 },
    Transfer(TransferStatus),
    /// Registration search progress, in hashes per second.
    Registration { hashrate: u64, attempts: u64 },
    Registered { txid: String },
    /// Free-form status text (indexer progress, worker failures).
    Status(String),
    Toast(String),
    /// The session was torn down after repeated connection failures.
    ConnectionLost,
    /// Fatal condition; the session cannot continue.
    Alert(String),
    ShowAssetManager(Scid),
    OpenLink(String),
}

/// Sending half of the event channel. Cloned into every worker; sends never
/// block and are dropped once the sink goes away.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, rx)
    }

    /// A sink with no receiver.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn emit(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event sink closed");
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(CoreEvent::Status(text.into()));
    }

    pub fn toast(&self, text: impl Into<String>) {
        self.emit(CoreEvent::Toast(text.into()));
    }

    pub fn transfer(&self, status: TransferStatus) {
        self.emit(CoreEvent::Transfer(status));
    }
}
