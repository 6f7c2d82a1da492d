//! Connection and sync supervisor.
//!
//! One task per open session ticks at `POLL_INTERVAL_MS`, asks the wallet
//! for the daemon and wallet heights and publishes indicator states. After
//! `MAX_CONSECUTIVE_FAILURES` failed ticks in a row it reports
//! `ConnectionLost` and cancels the session token it was given, which stops
//! every worker started from it. The owner then closes the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{CoreEvent, EventSink, Indicator};
use crate::settings::RuntimeConfig;
use crate::wallet::{Balance, WalletBackend};
use crate::{constants, Scid};

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Wallet is considered synced while it trails the daemon by fewer blocks.
pub const SYNC_TOLERANCE: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assessment {
    pub connection: Indicator,
    pub sync: Indicator,
    /// The tick counts toward the failure limit.
    pub failed: bool,
}

/// Indicator rules for one tick.
///
/// `daemon_height` is `None` when the daemon could not be reached.
pub fn assess(
    offline: bool,
    registered: bool,
    daemon_height: Option<u64>,
    wallet_height: u64,
) -> Assessment {
    if offline {
        return Assessment {
            connection: Indicator::Gray,
            sync: Indicator::Gray,
            failed: false,
        };
    }
    let daemon = match daemon_height {
        Some(h) => h,
        None => {
            return Assessment {
                connection: Indicator::Red,
                sync: Indicator::Red,
                failed: true,
            }
        }
    };
    if !registered {
        return Assessment {
            connection: Indicator::Gray,
            sync: Indicator::Gray,
            failed: false,
        };
    }
    let sync = if daemon.saturating_sub(wallet_height) < SYNC_TOLERANCE {
        Indicator::Green
    } else {
        Indicator::Yellow
    };
    Assessment {
        connection: Indicator::Green,
        sync,
        failed: false,
    }
}

struct Sample {
    registered: bool,
    daemon_height: Option<u64>,
    wallet_height: u64,
    balance: Option<Balance>,
}

fn sample(wallet: &dyn WalletBackend) -> Sample {
    let daemon_height = match wallet.daemon_height() {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::warn!(error = %e, "Daemon height query failed");
            None
        }
    };
    let balance = if daemon_height.is_some() {
        wallet.balance(&Scid::NATIVE).ok()
    } else {
        None
    };
    Sample {
        registered: wallet.is_registered(),
        daemon_height,
        wallet_height: wallet.wallet_height(),
        balance,
    }
}

/// Handle to the running monitor.
pub struct HealthMonitor {
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(
        wallet: Arc<dyn WalletBackend>,
        runtime: RuntimeConfig,
        events: EventSink,
        bridge_active: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn_with_period(
            wallet,
            runtime,
            events,
            bridge_active,
            cancel,
            Duration::from_millis(constants::POLL_INTERVAL_MS),
        )
    }

    pub fn spawn_with_period(
        wallet: Arc<dyn WalletBackend>,
        runtime: RuntimeConfig,
        events: EventSink,
        bridge_active: Arc<AtomicBool>,
        cancel: CancellationToken,
        period: Duration,
    ) -> Self {
        let handle = tokio::spawn(run(wallet, runtime, events, bridge_active, cancel, period));
        HealthMonitor { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to observe cancellation and exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Health monitor task failed");
        }
    }
}

async fn run(
    wallet: Arc<dyn WalletBackend>,
    runtime: RuntimeConfig,
    events: EventSink,
    bridge_active: Arc<AtomicBool>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    let mut failures = 0u32;
    let mut last: Option<Assessment> = None;
    let mut last_balance: Option<Balance> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Health monitor stopped");
                break;
            }
            _ = interval.tick() => {
                let offline = runtime.is_offline();
                let reading = if offline {
                    None
                } else {
                    let w = wallet.clone();
                    match tokio::task::spawn_blocking(move || sample(w.as_ref())).await {
                        Ok(p) => Some(p),
                        Err(e) => {
                            tracing::warn!(error = %e, "Health sample panicked");
                            None
                        }
                    }
                };
                let assessment = match &reading {
                    Some(p) => assess(false, p.registered, p.daemon_height, p.wallet_height),
                    None => assess(offline, false, None, 0),
                };

                if last != Some(assessment) {
                    events.emit(CoreEvent::Connection(assessment.connection));
                    events.emit(CoreEvent::Sync(assessment.sync));
                    last = Some(assessment);
                }
                let bridge = if bridge_active.load(Ordering::Acquire) {
                    Indicator::Green
                } else {
                    Indicator::Gray
                };
                events.emit(CoreEvent::Bridge(bridge));

                if let Some(p) = &reading {
                    if let Some(daemon) = p.daemon_height {
                        events.emit(CoreEvent::Height { wallet: p.wallet_height, daemon });
                    }
                    if p.balance.is_some() && p.balance != last_balance {
                        if let Some(b) = p.balance {
                            events.emit(CoreEvent::Balance {
                                scid: Scid::NATIVE,
                                mature: b.mature,
                                locked: b.locked,
                            });
                        }
                        last_balance = p.balance;
                    }
                }

                if assessment.failed {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::warn!(failures, "Connection lost, closing session");
                        events.emit(CoreEvent::ConnectionLost);
                        cancel.cancel();
                        break;
                    }
                } else {
                    failures = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::args::Arguments;
    use crate::config::Network;
    use crate::wallet::{BackendError, Entry, PaymentQuery, Transaction, Transfer};
    use std::sync::atomic::AtomicU64;

    #[test]
    fn assess_rules() {
        let a = assess(true, true, Some(10), 10);
        assert_eq!((a.connection, a.sync), (Indicator::Gray, Indicator::Gray));

        let a = assess(false, true, None, 10);
        assert_eq!((a.connection, a.sync), (Indicator::Red, Indicator::Red));
        assert!(a.failed);

        let a = assess(false, false, Some(10), 10);
        assert_eq!((a.connection, a.sync), (Indicator::Gray, Indicator::Gray));
        assert!(!a.failed);

        let a = assess(false, true, Some(11), 10);
        assert_eq!((a.connection, a.sync), (Indicator::Green, Indicator::Green));

        let a = assess(false, true, Some(12), 10);
        assert_eq!((a.connection, a.sync), (Indicator::Green, Indicator::Yellow));
    }

    struct FlakyWallet {
        daemon_ok: AtomicBool,
        height: AtomicU64,
    }

    impl WalletBackend for FlakyWallet {
        fn address(&self) -> Address {
            Address::new(Network::Testnet, [1; 32])
        }
        fn is_registered(&self) -> bool {
            true
        }
        fn wallet_height(&self) -> u64 {
            self.height.load(Ordering::SeqCst)
        }
        fn wallet_topoheight(&self) -> u64 {
            self.wallet_height()
        }
        fn daemon_height(&self) -> Result<u64, BackendError> {
            if self.daemon_ok.load(Ordering::SeqCst) {
                Ok(self.height.load(Ordering::SeqCst))
            } else {
                Err(BackendError::Unreachable("down".into()))
            }
        }
        fn balance(&self, _scid: &Scid) -> Result<Balance, BackendError> {
            Ok(Balance { mature: 500, locked: 0 })
        }
        fn payments(&self, _q: &PaymentQuery) -> Result<Vec<Entry>, BackendError> {
            Ok(vec![])
        }
        fn build_transaction(
            &self,
            _t: &[Transfer],
            _r: u64,
            _a: &Arguments,
            _g: u64,
        ) -> Result<Transaction, BackendError> {
            Err(BackendError::Other("unused".into()))
        }
        fn send(&self, _tx: &Transaction) -> Result<(), BackendError> {
            Ok(())
        }
        fn registration_candidate(&self) -> Result<Transaction, BackendError> {
            Err(BackendError::Other("unused".into()))
        }
        fn set_scan_window(&self, _blocks: u64) {}
        fn close(&self) {}
    }

    #[tokio::test]
    async fn healthy_wallet_reports_green() {
        let wallet = Arc::new(FlakyWallet {
            daemon_ok: AtomicBool::new(true),
            height: AtomicU64::new(100),
        });
        let (events, mut rx) = EventSink::channel();
        let cancel = CancellationToken::new();
        let monitor = HealthMonitor::spawn_with_period(
            wallet,
            RuntimeConfig::default(),
            events,
            Arc::new(AtomicBool::new(true)),
            cancel.clone(),
            Duration::from_millis(10),
        );
        assert_eq!(rx.recv().await, Some(CoreEvent::Connection(Indicator::Green)));
        assert_eq!(rx.recv().await, Some(CoreEvent::Sync(Indicator::Green)));
        assert_eq!(rx.recv().await, Some(CoreEvent::Bridge(Indicator::Green)));
        cancel.cancel();
        monitor.join().await;
    }

    #[tokio::test]
    async fn repeated_failures_cancel_session() {
        let wallet = Arc::new(FlakyWallet {
            daemon_ok: AtomicBool::new(false),
            height: AtomicU64::new(0),
        });
        let (events, mut rx) = EventSink::channel();
        let session = CancellationToken::new();
        let worker = session.child_token();
        let monitor = HealthMonitor::spawn_with_period(
            wallet,
            RuntimeConfig::default(),
            events,
            Arc::new(AtomicBool::new(false)),
            session.clone(),
            Duration::from_millis(5),
        );
        monitor.join().await;
        assert!(session.is_cancelled());
        assert!(worker.is_cancelled());
        let mut saw_lost = false;
        while let Ok(event) = rx.try_recv() {
            if event == CoreEvent::ConnectionLost {
                saw_lost = true;
            }
        }
        assert!(saw_lost);
    }

    #[tokio::test]
    async fn offline_reports_gray_without_failing() {
        let wallet = Arc::new(FlakyWallet {
            daemon_ok: AtomicBool::new(false),
            height: AtomicU64::new(0),
        });
        let runtime = RuntimeConfig::default();
        runtime.update(|s| s.offline = true);
        let (events, mut rx) = EventSink::channel();
        let cancel = CancellationToken::new();
        let monitor = HealthMonitor::spawn_with_period(
            wallet,
            runtime,
            events,
            Arc::new(AtomicBool::new(false)),
            cancel.clone(),
            Duration::from_millis(5),
        );
        assert_eq!(rx.recv().await, Some(CoreEvent::Connection(Indicator::Gray)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        monitor.join().await;
    }
}
