//! Account registration proof-of-work.
//!
//! Worker threads pull fresh registration candidates from the wallet until
//! one has a txid starting with `REGISTRATION_ZERO_BYTES` zero bytes. The
//! first winner is dispatched; the others see the shared flag and exit. An
//! async supervisor publishes the hashrate once per period and watches for
//! cancellation or the account becoming registered through sync.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{CoreEvent, EventSink};
use crate::settings::RuntimeConfig;
use crate::wallet::{BackendError, Transaction, WalletBackend};
use crate::{constants, Hash};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistrarError {
    #[error("account is already registered")]
    AlreadyRegistered,
    #[error("registration already running for {0}")]
    AlreadyRunning(String),
    #[error("registration cancelled")]
    Cancelled,
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("offline mode is enabled")]
    Offline,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// True if `txid` satisfies the registration target.
pub fn meets_target(txid: &Hash) -> bool {
    txid[..constants::REGISTRATION_ZERO_BYTES]
        .iter()
        .all(|b| *b == 0)
}

/// Tracks which accounts have a job running.
#[derive(Clone, Default)]
pub struct Registrar {
    active: Arc<Mutex<HashSet<String>>>,
    period: Option<Duration>,
    runtime: Option<RuntimeConfig>,
}

struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    account: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.account);
    }
}

struct Shared {
    attempts: AtomicU64,
    found: AtomicBool,
    winner: Mutex<Option<Transaction>>,
    failure: Mutex<Option<BackendError>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the progress period (1 s by default).
    pub fn with_period(period: Duration) -> Self {
        Registrar {
            active: Arc::default(),
            period: Some(period),
            runtime: None,
        }
    }

    /// Refuse to start or dispatch while `runtime` is offline.
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn is_offline(&self) -> bool {
        self.runtime.as_ref().is_some_and(|r| r.is_offline())
    }

    pub fn is_running(&self, account: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(account)
    }

    /// Start a search with `threads` workers. `cancel` is the session token;
    /// cancelling it stops the job.
    pub fn start(
        &self,
        account: &str,
        wallet: Arc<dyn WalletBackend>,
        threads: usize,
        events: EventSink,
        cancel: &CancellationToken,
    ) -> Result<RegistrationJob, RegistrarError> {
        if self.is_offline() {
            return Err(RegistrarError::Offline);
        }
        if wallet.is_registered() {
            return Err(RegistrarError::AlreadyRegistered);
        }
        if !self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.to_string())
        {
            return Err(RegistrarError::AlreadyRunning(account.to_string()));
        }
        let guard = ActiveGuard {
            active: self.active.clone(),
            account: account.to_string(),
        };

        let token = cancel.child_token();
        let shared = Arc::new(Shared {
            attempts: AtomicU64::new(0),
            found: AtomicBool::new(false),
            winner: Mutex::new(None),
            failure: Mutex::new(None),
        });

        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let wallet = wallet.clone();
            let shared = shared.clone();
            let worker_token = token.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("registrar-{}", i))
                .spawn(move || search(wallet.as_ref(), &shared, &worker_token));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    token.cancel();
                    return Err(RegistrarError::Spawn(e.to_string()));
                }
            }
        }
        tracing::info!(account, threads, "Registration search started");

        let period = self
            .period
            .unwrap_or(Duration::from_millis(constants::POLL_INTERVAL_MS));
        let handle = tokio::spawn(supervise(
            wallet,
            shared.clone(),
            workers,
            events,
            token.clone(),
            period,
            self.runtime.clone(),
            guard,
        ));
        Ok(RegistrationJob {
            shared,
            cancel: token,
            handle,
        })
    }
}

fn search(wallet: &dyn WalletBackend, shared: &Shared, token: &CancellationToken) {
    while !token.is_cancelled() && !shared.found.load(Ordering::Acquire) {
        let tx = match wallet.registration_candidate() {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(error = %e, "Registration candidate failed");
                shared
                    .failure
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_or_insert(e);
                token.cancel();
                return;
            }
        };
        shared.attempts.fetch_add(1, Ordering::Relaxed);
        if meets_target(&tx.txid) && !shared.found.swap(true, Ordering::AcqRel) {
            *shared.winner.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
            return;
        }
    }
}

async fn supervise(
    wallet: Arc<dyn WalletBackend>,
    shared: Arc<Shared>,
    workers: Vec<std::thread::JoinHandle<()>>,
    events: EventSink,
    token: CancellationToken,
    period: Duration,
    runtime: Option<RuntimeConfig>,
    _guard: ActiveGuard,
) -> Result<Transaction, RegistrarError> {
    let mut interval = tokio::time::interval(period);
    let started = Instant::now();
    let mut outcome = Err(RegistrarError::Cancelled);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let attempts = shared.attempts.load(Ordering::Relaxed);
                let secs = started.elapsed().as_secs_f64();
                let hashrate = if secs > 0.0 { (attempts as f64 / secs) as u64 } else { 0 };
                events.emit(CoreEvent::Registration { hashrate, attempts });

                if shared.found.load(Ordering::Acquire) {
                    outcome = Ok(());
                    break;
                }
                let w = wallet.clone();
                if let Ok(true) = tokio::task::spawn_blocking(move || w.is_registered()).await {
                    tracing::info!("Account registered by sync, stopping search");
                    outcome = Err(RegistrarError::AlreadyRegistered);
                    break;
                }
            }
        }
    }

    // Seen before the workers are stopped through the same token.
    let cancelled = token.is_cancelled();
    token.cancel();
    if let Err(e) = tokio::task::spawn_blocking(move || {
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("Registrar worker panicked");
            }
        }
    })
    .await
    {
        tracing::warn!(error = %e, "Failed to join registrar workers");
    }

    let winner = shared
        .winner
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(failure) = shared
        .failure
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
    {
        if winner.is_none() {
            events.status(format!("Registration failed: {}", failure));
            return Err(failure.into());
        }
    }
    outcome?;
    let Some(tx) = winner else {
        return Err(RegistrarError::Cancelled);
    };
    if cancelled {
        tracing::debug!("Registration winner discarded after cancellation");
        return Err(RegistrarError::Cancelled);
    }
    if runtime.as_ref().is_some_and(|r| r.is_offline()) {
        return Err(RegistrarError::Offline);
    }
    let w = wallet.clone();
    if let Ok(true) = tokio::task::spawn_blocking(move || w.is_registered()).await {
        tracing::info!("Account registered by sync, discarding winner");
        return Err(RegistrarError::AlreadyRegistered);
    }

    let w = wallet.clone();
    let sent = tx.clone();
    tokio::task::spawn_blocking(move || w.send(&sent))
        .await
        .map_err(|e| BackendError::Other(e.to_string()))??;
    tracing::info!(
        txid = %tx.txid_hex(),
        attempts = shared.attempts.load(Ordering::Relaxed),
        "Registration dispatched"
    );
    events.emit(CoreEvent::Registered {
        txid: tx.txid_hex(),
    });
    Ok(tx)
}

/// Handle to a running search.
pub struct RegistrationJob {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<Transaction, RegistrarError>>,
}

impl RegistrationJob {
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the dispatched registration transaction.
    pub async fn wait(self) -> Result<Transaction, RegistrarError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(RegistrarError::Backend(BackendError::Other(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::args::Arguments;
    use crate::config::Network;
    use crate::wallet::{Balance, Entry, PaymentQuery, Transfer};
    use crate::Scid;

    struct PowWallet {
        counter: AtomicU64,
        /// Every n-th candidate wins; 0 never wins.
        every: u64,
        registered: AtomicBool,
        broken: bool,
        /// Candidates never win while set.
        hold: AtomicBool,
        won: AtomicBool,
        sent: Mutex<Vec<Transaction>>,
    }

    impl PowWallet {
        fn new(every: u64) -> Self {
            PowWallet {
                counter: AtomicU64::new(0),
                every,
                registered: AtomicBool::new(false),
                broken: false,
                hold: AtomicBool::new(false),
                won: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl WalletBackend for PowWallet {
        fn address(&self) -> Address {
            Address::new(Network::Testnet, [3; 32])
        }
        fn is_registered(&self) -> bool {
            self.registered.load(Ordering::SeqCst)
        }
        fn wallet_height(&self) -> u64 {
            0
        }
        fn wallet_topoheight(&self) -> u64 {
            0
        }
        fn daemon_height(&self) -> Result<u64, BackendError> {
            Ok(0)
        }
        fn balance(&self, _scid: &Scid) -> Result<Balance, BackendError> {
            Ok(Balance::default())
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
        fn send(&self, tx: &Transaction) -> Result<(), BackendError> {
            self.sent.lock().unwrap().push(tx.clone());
            Ok(())
        }
        fn registration_candidate(&self) -> Result<Transaction, BackendError> {
            if self.broken {
                return Err(BackendError::Build("no keys".into()));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut txid = crate::hash_domain(b"test.candidate", &n.to_le_bytes());
            let hold = self.hold.load(Ordering::SeqCst);
            if !hold && self.every != 0 && n % self.every == 0 {
                txid[..3].copy_from_slice(&[0, 0, 0]);
                self.won.store(true, Ordering::SeqCst);
            } else if meets_target(&txid) {
                txid[0] = 1;
            }
            Ok(Transaction {
                txid,
                raw: n.to_le_bytes().to_vec(),
                fees: 0,
            })
        }
        fn set_scan_window(&self, _blocks: u64) {}
        fn close(&self) {}
    }

    fn registrar() -> Registrar {
        Registrar::with_period(Duration::from_millis(5))
    }

    /// Start a held search, let the first progress tick pass, then release
    /// the workers and wait until one of them has a winner.
    async fn winner_pending(
        wallet: &Arc<PowWallet>,
        period: Duration,
        session: &CancellationToken,
    ) -> RegistrationJob {
        wallet.hold.store(true, Ordering::SeqCst);
        let job = Registrar::with_period(period)
            .start("frank", wallet.clone(), 2, EventSink::detached(), session)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        wallet.hold.store(false, Ordering::SeqCst);
        while !wallet.won.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        job
    }

    #[test]
    fn target_check() {
        assert!(meets_target(&[0; 32]));
        let mut h = [0u8; 32];
        h[2] = 1;
        assert!(!meets_target(&h));
        h[2] = 0;
        h[3] = 0xff;
        assert!(meets_target(&h));
    }

    #[tokio::test]
    async fn finds_and_dispatches_one_winner() {
        let wallet = Arc::new(PowWallet::new(500));
        let (events, mut rx) = EventSink::channel();
        let job = registrar()
            .start("alice", wallet.clone(), 4, events, &CancellationToken::new())
            .unwrap();
        let tx = job.wait().await.unwrap();
        assert!(meets_target(&tx.txid));
        let sent = wallet.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].txid, tx.txid);
        let mut registered = false;
        while let Ok(ev) = rx.try_recv() {
            if let CoreEvent::Registered { txid } = ev {
                assert_eq!(txid, tx.txid_hex());
                registered = true;
            }
        }
        assert!(registered);
    }

    #[tokio::test]
    async fn one_job_per_account() {
        let wallet = Arc::new(PowWallet::new(0));
        let registrar = registrar();
        let session = CancellationToken::new();
        let job = registrar
            .start("alice", wallet.clone(), 1, EventSink::detached(), &session)
            .unwrap();
        assert!(registrar.is_running("alice"));
        assert!(matches!(
            registrar.start("alice", wallet.clone(), 1, EventSink::detached(), &session),
            Err(RegistrarError::AlreadyRunning(_))
        ));
        job.cancel();
        assert_eq!(job.wait().await, Err(RegistrarError::Cancelled));
        assert!(!registrar.is_running("alice"));
        assert!(wallet.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_cancel_stops_job() {
        let wallet = Arc::new(PowWallet::new(0));
        let session = CancellationToken::new();
        let job = registrar()
            .start("bob", wallet, 2, EventSink::detached(), &session)
            .unwrap();
        session.cancel();
        assert_eq!(job.wait().await, Err(RegistrarError::Cancelled));
    }

    #[tokio::test]
    async fn stops_when_registered_by_sync() {
        let wallet = Arc::new(PowWallet::new(0));
        let job = registrar()
            .start("carol", wallet.clone(), 1, EventSink::detached(), &CancellationToken::new())
            .unwrap();
        wallet.registered.store(true, Ordering::SeqCst);
        assert_eq!(job.wait().await, Err(RegistrarError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn registered_account_rejected() {
        let wallet = Arc::new(PowWallet::new(1));
        wallet.registered.store(true, Ordering::SeqCst);
        assert!(matches!(
            registrar().start("dave", wallet, 1, EventSink::detached(), &CancellationToken::new()),
            Err(RegistrarError::AlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn backend_failure_reported() {
        let mut wallet = PowWallet::new(1);
        wallet.broken = true;
        let job = registrar()
            .start("erin", Arc::new(wallet), 2, EventSink::detached(), &CancellationToken::new())
            .unwrap();
        assert_eq!(
            job.wait().await,
            Err(RegistrarError::Backend(BackendError::Build("no keys".into())))
        );
    }

    #[tokio::test]
    async fn winner_discarded_when_session_closes() {
        let wallet = Arc::new(PowWallet::new(1));
        let session = CancellationToken::new();
        let job = winner_pending(&wallet, Duration::from_secs(3600), &session).await;
        session.cancel();
        assert_eq!(job.wait().await, Err(RegistrarError::Cancelled));
        assert!(wallet.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn winner_discarded_when_registered_by_sync() {
        let wallet = Arc::new(PowWallet::new(1));
        let session = CancellationToken::new();
        let job = winner_pending(&wallet, Duration::from_millis(50), &session).await;
        wallet.registered.store(true, Ordering::SeqCst);
        assert_eq!(job.wait().await, Err(RegistrarError::AlreadyRegistered));
        assert!(wallet.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_blocks_start_and_dispatch() {
        let runtime = RuntimeConfig::default();
        runtime.update(|s| s.offline = true);
        let wallet = Arc::new(PowWallet::new(1));
        let registrar = registrar().with_runtime(runtime.clone());
        assert_eq!(
            registrar
                .start("gina", wallet.clone(), 1, EventSink::detached(), &CancellationToken::new())
                .err(),
            Some(RegistrarError::Offline)
        );
        assert!(!registrar.is_running("gina"));

        runtime.update(|s| s.offline = false);
        let session = CancellationToken::new();
        wallet.hold.store(true, Ordering::SeqCst);
        let job = Registrar::with_period(Duration::from_millis(50))
            .with_runtime(runtime.clone())
            .start("gina", wallet.clone(), 1, EventSink::detached(), &session)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        runtime.update(|s| s.offline = true);
        wallet.hold.store(false, Ordering::SeqCst);
        assert_eq!(job.wait().await, Err(RegistrarError::Offline));
        assert!(wallet.sent.lock().unwrap().is_empty());
    }
}
