//! The per-(validator, role) controller.
//!
//! Owns the instance lifecycle for one duty stream: height tracking,
//! message classification and routing, decided-certificate persistence and
//! publication, future-message buffering, and fork transitions.

use crate::fork::{DecidedMode, Fork, ForkVersion};
use crate::future_msgs::FutureMsgBuffer;
use crate::handlers;
use crate::metrics;
use crate::network::{Network, NetworkError, ValidationResult};
use crate::queue::{MsgQueue, QueuedMessage};
use crate::sync::{DecidedSync, SyncConfig, SyncError};
use crate::worker::{ErrorHandler, MsgHandler, WorkerPool};
use dvq_messages::{MessageType, SignedMessage, SsvMessage, SsvMsgType};
use dvq_qbft::{
    verify_authorization, BroadcastError, Broadcaster, Config, Instance, InstanceConfig,
    InstanceError, InstanceState, QbftStore, RoundRobinLeader, RoundTimeout, Stage, StorageError,
    StoredInstance, ValidationError,
};
use dvq_types::{DomainType, Height, KeyManager, MessageId, Share};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Invoked (from the processing task) for every newly persisted decided
/// certificate.
pub type DecidedHandler = Arc<dyn Fn(&SignedMessage) + Send + Sync>;

/// Controller lifecycle, advanced with compare-and-swap so concurrent
/// `init` calls interleave safely.
///
/// `Quiescent` is terminal: entered after a persistent storage failure, it
/// refuses new instances and fails health checks until the operator
/// restarts the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControllerState {
    NotStarted = 0,
    Initialized = 1,
    SyncedChangeRound = 2,
    WaitingForPeers = 3,
    FoundPeers = 4,
    Ready = 5,
    Forking = 6,
    Quiescent = 7,
}

impl ControllerState {
    fn from_u32(v: u32) -> ControllerState {
        match v {
            0 => ControllerState::NotStarted,
            1 => ControllerState::Initialized,
            2 => ControllerState::SyncedChangeRound,
            3 => ControllerState::WaitingForPeers,
            4 => ControllerState::FoundPeers,
            5 => ControllerState::Ready,
            6 => ControllerState::Forking,
            _ => ControllerState::Quiescent,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ControllerState::NotStarted => "notStarted",
            ControllerState::Initialized => "initialized",
            ControllerState::SyncedChangeRound => "syncedChangeRound",
            ControllerState::WaitingForPeers => "waitingForPeers",
            ControllerState::FoundPeers => "foundPeers",
            ControllerState::Ready => "ready",
            ControllerState::Forking => "forking",
            ControllerState::Quiescent => "quiescent",
        }
    }
}

/// Controller failures.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Returned by `init` when another call is mid-flight; callers treat it
    /// as success.
    #[error("already running")]
    AlreadyRunning,
    #[error("controller is not ready (state: {0})")]
    NotReady(&'static str),
    #[error("fork in progress")]
    Forking,
    #[error("wrong height for new instance: expected {expected}, got {got}")]
    InvalidHeight { expected: Height, got: Height },
    #[error("an instance is already running")]
    InstanceRunning,
    #[error("instance stopped before deciding")]
    InstanceStopped,
    #[error("controller closed")]
    Closed,
    #[error("controller is quiescent after persistent storage failure")]
    Quiescent,
    #[error("message encoded for fork {got}, dropped")]
    ForkMismatch { got: u64 },
    #[error("message queue full")]
    QueueFull,
    #[error("empty queue entry")]
    EmptyQueueEntry,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Codec(#[from] dvq_messages::CodecError),
}

/// Construction options.
pub struct ControllerOptions {
    pub identifier: MessageId,
    pub share: Arc<Share>,
    pub network: Arc<dyn Network>,
    pub storage: Arc<dyn QbftStore>,
    pub key_manager: Arc<dyn KeyManager>,
    pub domain: DomainType,
    pub fork: ForkVersion,
    pub instance_config: InstanceConfig,
    pub sync: SyncConfig,
    /// Minimum connected peers before history sync starts.
    pub min_peers: usize,
    /// Full nodes persist decided history; light nodes keep only the highest.
    pub full_node: bool,
    /// Worker pool size.
    pub workers: usize,
    pub queue_capacity: usize,
    pub decided_handler: Option<DecidedHandler>,
}

/// Adapts the full network trait to the instance's broadcast-only view.
struct NetBroadcaster(Arc<dyn Network>);

impl Broadcaster for NetBroadcaster {
    fn broadcast(&self, msg: SsvMessage) -> Result<(), BroadcastError> {
        self.0.broadcast(msg)
    }
}

struct ControllerInner {
    /// Self-reference for spawning background tasks from `&self` contexts.
    weak: Weak<ControllerInner>,
    identifier: MessageId,
    share: Arc<Share>,
    network: Arc<dyn Network>,
    storage: Arc<dyn QbftStore>,
    key_manager: Arc<dyn KeyManager>,
    domain: DomainType,
    instance_config: InstanceConfig,
    sync_config: SyncConfig,
    min_peers: usize,
    full_node: bool,
    workers: usize,
    decided_handler: Option<DecidedHandler>,

    fork: RwLock<Fork>,
    state: AtomicU32,
    height: Arc<AtomicU64>,
    /// Gates the queue: consensus traffic for the current height is held
    /// until an instance exists to consume it.
    instance_running: Arc<AtomicBool>,
    /// Health surface; cleared when the controller goes quiescent.
    healthy: AtomicBool,
    has_decided: AtomicBool,
    syncing: AtomicBool,
    current: RwLock<Option<Arc<Mutex<Instance>>>>,
    queue: Arc<MsgQueue>,
    future_msgs: Mutex<FutureMsgBuffer>,
    timeout_tx: mpsc::Sender<RoundTimeout>,
    timeout_rx: Mutex<Option<mpsc::Receiver<RoundTimeout>>>,
    worker_pool: Mutex<Option<WorkerPool>>,
    cancel: CancellationToken,
}

/// Handle to one duty stream's controller. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("identifier", &self.inner.identifier)
            .field("state", &self.state())
            .field("height", &self.height())
            .finish()
    }
}

impl Controller {
    pub fn new(opts: ControllerOptions) -> Controller {
        let (timeout_tx, timeout_rx) = mpsc::channel(16);
        let inner = Arc::new_cyclic(|weak| ControllerInner {
            weak: weak.clone(),
            identifier: opts.identifier,
            share: opts.share,
            network: opts.network,
            storage: opts.storage,
            key_manager: opts.key_manager,
            domain: opts.domain,
            instance_config: opts.instance_config,
            sync_config: opts.sync,
            min_peers: opts.min_peers,
            full_node: opts.full_node,
            workers: opts.workers,
            decided_handler: opts.decided_handler,
            fork: RwLock::new(Fork::new(opts.fork)),
            state: AtomicU32::new(ControllerState::NotStarted as u32),
            height: Arc::new(AtomicU64::new(0)),
            instance_running: Arc::new(AtomicBool::new(false)),
            healthy: AtomicBool::new(true),
            has_decided: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            current: RwLock::new(None),
            queue: Arc::new(MsgQueue::new(opts.queue_capacity)),
            future_msgs: Mutex::new(FutureMsgBuffer::new()),
            timeout_tx,
            timeout_rx: Mutex::new(Some(timeout_rx)),
            worker_pool: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        Controller { inner }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Observability
    // ═══════════════════════════════════════════════════════════════════════

    pub fn identifier(&self) -> MessageId {
        self.inner.identifier
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_u32(self.inner.state.load(Ordering::Acquire))
    }

    pub fn height(&self) -> Height {
        Height(self.inner.height.load(Ordering::Acquire))
    }

    pub fn current_instance(&self) -> Option<Arc<Mutex<Instance>>> {
        self.inner.current.read().clone()
    }

    /// Buffered future-message signers (tests and health checks).
    pub fn future_msg_count(&self) -> usize {
        self.inner.future_msgs.lock().len()
    }

    /// Health surface: false once the controller has gone quiescent after a
    /// persistent storage failure.
    pub fn health_check(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// The fork version currently in force.
    pub fn fork_version(&self) -> ForkVersion {
        self.inner.fork.read().version()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Bring the controller up: handlers, initial height, change-round
    /// warm-up, peer wait, decided sync. Blocking until `Ready`. A
    /// concurrent call observes [`ControllerError::AlreadyRunning`].
    pub async fn init(&self) -> Result<(), ControllerError> {
        let inner = &self.inner;

        if self.state() == ControllerState::Quiescent {
            return Err(ControllerError::Quiescent);
        }

        if self.cas(ControllerState::NotStarted, ControllerState::Initialized) {
            info!(identifier = %inner.identifier, "controller init: starting handlers");
            self.spawn_workers();
            self.spawn_timeout_router();
            inner.register_stream_handlers();
            if let Err(err) = inner.network.subscribe(&inner.identifier.validator_pk()) {
                warn!(%err, "failed to subscribe validator topic");
            }
            self.set_initial_height()?;
        }

        if self.cas(
            ControllerState::Initialized,
            ControllerState::SyncedChangeRound,
        ) {
            self.load_last_change_round();
        }

        if self.state() == ControllerState::WaitingForPeers {
            return Err(ControllerError::AlreadyRunning);
        }

        if self.cas(
            ControllerState::SyncedChangeRound,
            ControllerState::WaitingForPeers,
        ) {
            debug!(min_peers = inner.min_peers, "waiting for peers");
            if let Err(err) = self.wait_for_min_peers().await {
                self.set_state(ControllerState::SyncedChangeRound);
                return Err(err);
            }
            self.set_state(ControllerState::FoundPeers);

            if let Err(err) = self.sync_decided_on_init().await {
                warn!(%err, "initial decided sync failed");
                self.set_state(ControllerState::SyncedChangeRound);
                return Err(err);
            }

            self.set_state(ControllerState::Ready);
            info!(
                identifier = %inner.identifier,
                height = %self.height(),
                "controller init finished"
            );
        }

        Ok(())
    }

    /// Stop everything: workers, timers, the running instance.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(mut pool) = self.inner.worker_pool.lock().take() {
            pool.abort();
        }
        if let Some(instance) = self.current_instance() {
            instance.lock().stop();
        }
        if let Err(err) = self
            .inner
            .network
            .unsubscribe(&self.inner.identifier.validator_pk())
        {
            debug!(%err, "unsubscribe failed on close");
        }
    }

    fn cas(&self, from: ControllerState, to: ControllerState) -> bool {
        self.inner
            .state
            .compare_exchange(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set_state(&self, state: ControllerState) {
        self.inner.state.store(state as u32, Ordering::Release);
    }

    fn initialized(&self) -> Result<(), ControllerError> {
        match self.state() {
            ControllerState::Ready => Ok(()),
            ControllerState::Forking => Err(ControllerError::Forking),
            ControllerState::Quiescent => Err(ControllerError::Quiescent),
            other => Err(ControllerError::NotReady(other.name())),
        }
    }

    fn spawn_workers(&self) {
        let inner = Arc::clone(&self.inner);
        let handler: MsgHandler<ControllerError> = Arc::new(move |qmsg| {
            let inner = Arc::clone(&inner);
            let fut: BoxFuture<'static, Result<(), ControllerError>> =
                Box::pin(async move { inner.handle_queued(&qmsg).await });
            fut
        });
        let err_handler: ErrorHandler<ControllerError> = Arc::new(|qmsg, err| {
            debug!(msg_type = ?qmsg.msg.msg_type, %err, "failed to handle message");
        });
        let pool = WorkerPool::spawn(
            self.inner.workers,
            Arc::clone(&self.inner.queue),
            Arc::clone(&self.inner.height),
            Arc::clone(&self.inner.instance_running),
            handler,
            err_handler,
            self.inner.cancel.clone(),
        );
        *self.inner.worker_pool.lock() = Some(pool);
    }

    /// Route round timeouts to the instance they belong to. Fires arrive on
    /// this dedicated task, never on a worker.
    fn spawn_timeout_router(&self) {
        let Some(mut rx) = self.inner.timeout_rx.lock().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let timeout = tokio::select! {
                    _ = cancel.cancelled() => break,
                    t = rx.recv() => match t {
                        Some(t) => t,
                        None => break,
                    },
                };
                let Some(instance) = inner.current.read().clone() else {
                    continue;
                };
                let mut guard = instance.lock();
                if guard.height() != timeout.height {
                    continue;
                }
                if let Err(err) = guard.on_round_timeout(timeout) {
                    warn!(%err, "round timeout handling failed");
                }
            }
        });
    }

    /// Resume from the highest stored decided instance, if any.
    fn set_initial_height(&self) -> Result<(), ControllerError> {
        let highest = self
            .inner
            .storage
            .get_highest_instance(&self.inner.identifier)?;
        match highest {
            Some(stored) => {
                self.inner
                    .height
                    .store(stored.height().0, Ordering::Release);
                self.inner.has_decided.store(true, Ordering::Release);
                debug!(height = %stored.height(), "resumed height from storage");
            }
            None => {
                self.inner.height.store(0, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Warm the queue with stored round-change messages (legacy fork only)
    /// so a restarted operator rejoins its last round quickly.
    fn load_last_change_round(&self) {
        let inner = &self.inner;
        let wire = {
            let fork = inner.fork.read();
            if fork.last_change_round_protocol().is_none() {
                return;
            }
            fork.wire_version()
        };
        match inner.storage.get_last_change_round(&inner.identifier) {
            Ok(msgs) => {
                for msg in msgs {
                    inner
                        .queue
                        .try_enqueue(SsvMessage::consensus(inner.identifier, &msg, wire));
                }
            }
            Err(err) => warn!(%err, "could not load last change round"),
        }
    }

    async fn wait_for_min_peers(&self) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let pk = inner.identifier.validator_pk();
        loop {
            let count = inner.network.peers(&pk).len();
            if count >= inner.min_peers {
                debug!(count, "found enough peers");
                return Ok(());
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => return Err(ControllerError::Closed),
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// Align with the network before accepting duties: fetch the highest
    /// decided certificate and, for full nodes, the history up to it.
    async fn sync_decided_on_init(&self) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let sync = inner.decided_sync();
        let fork = *inner.fork.read();

        let best = match sync.last_decided(fork.last_decided_protocol()).await {
            Ok(best) => best,
            Err(SyncError::NoPeers) if inner.min_peers == 0 => None,
            Err(err) => return Err(err.into()),
        };
        let Some(best) = best else {
            debug!("no decided certificates known to peers");
            return Ok(());
        };

        let local = self.height();
        let target = best.message.height;
        if target > local || !inner.has_decided.load(Ordering::Acquire) {
            if fork.decided_mode(inner.full_node) == DecidedMode::Full {
                let from = if inner.has_decided.load(Ordering::Acquire) {
                    local.next()
                } else {
                    Height::FIRST
                };
                let history = sync
                    .history(fork.decided_history_protocol(), from, target)
                    .await?;
                for cert in history {
                    if let Err(err) = inner.process_decided(&cert).await {
                        warn!(%err, "failed to apply synced certificate");
                    }
                }
            }
            inner.process_decided(&best).await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Instance sequencing
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one decision to completion: create the instance, feed it via the
    /// queue workers, persist and publish the certificate, advance height.
    pub async fn start_instance(
        &self,
        height: Height,
        value: Vec<u8>,
    ) -> Result<SignedMessage, ControllerError> {
        let inner = &self.inner;
        self.initialized()?;
        self.can_start_instance(height)?;

        if inner.fork.read().last_change_round_protocol().is_some() {
            if let Err(err) = inner.storage.clean_last_change_round(&inner.identifier) {
                warn!(%err, "could not clean last change round");
            }
        }

        inner.height.store(height.0, Ordering::Release);
        let instance = Arc::new(Mutex::new(Instance::new(
            inner.instance_qbft_config(),
            Arc::clone(&inner.share),
            inner.identifier,
            height,
            inner.timeout_tx.clone(),
        )));
        *inner.current.write() = Some(Arc::clone(&instance));
        inner.instance_running.store(true, Ordering::Release);

        let mut stage_rx = {
            let mut guard = instance.lock();
            let rx = guard.stage_receiver();
            guard.start(value)?;
            rx
        };

        // Wait for the watch to reach a terminal stage; workers feed the
        // instance concurrently.
        loop {
            let stage = *stage_rx.borrow_and_update();
            match stage {
                Stage::Decided => break,
                Stage::Stopped => return Err(ControllerError::InstanceStopped),
                _ => {}
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => return Err(ControllerError::Closed),
                changed = stage_rx.changed() => {
                    if changed.is_err() {
                        return Err(ControllerError::InstanceStopped);
                    }
                }
            }
        }

        let (state, cert) = {
            let guard = instance.lock();
            let cert = guard
                .decided_message()
                .cloned()
                .ok_or(ControllerError::InstanceStopped)?;
            (guard.state().clone(), cert)
        };

        inner.persist_decided(&state, &cert).await?;
        inner.has_decided.store(true, Ordering::Release);
        let wire = inner.fork.read().wire_version();
        inner
            .network
            .broadcast_decided(SsvMessage::decided(inner.identifier, &cert, wire))?;
        if let Some(handler) = &inner.decided_handler {
            handler(&cert);
        }

        info!(
            identifier = %inner.identifier,
            height = %height,
            round = %cert.message.round,
            signers = cert.signers.len(),
            "instance decided"
        );
        Ok(cert)
    }

    fn can_start_instance(&self, height: Height) -> Result<(), ControllerError> {
        let inner = &self.inner;

        if let Some(instance) = self.current_instance() {
            let guard = instance.lock();
            let terminal = guard.is_decided() || guard.state().stage == Stage::Stopped;
            if !terminal {
                return Err(ControllerError::InstanceRunning);
            }
            // An instance that exited undecided leaves only its late
            // commits and partial signatures behind.
            if !guard.is_decided() {
                inner.queue.purge(&inner.identifier, guard.height());
            }
        }

        let expected = if inner.has_decided.load(Ordering::Acquire) {
            self.height().next()
        } else {
            Height::FIRST
        };
        if height != expected {
            return Err(ControllerError::InvalidHeight {
                expected,
                got: height,
            });
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ingestion
    // ═══════════════════════════════════════════════════════════════════════

    /// Non-blocking entry point for the transport: verify the envelope's
    /// fork tag, then queue for the workers.
    pub fn process_msg(&self, msg: SsvMessage) -> Result<(), ControllerError> {
        let current = self.inner.fork.read().wire_version();
        if msg.fork_version != current {
            return self.on_fork_mismatch(msg, current);
        }
        trace!(
            msg_type = ?msg.msg_type,
            queue_len = self.inner.queue.len(),
            "got message, adding to queue"
        );
        if !self.inner.queue.try_enqueue(msg) {
            return Err(ControllerError::QueueFull);
        }
        Ok(())
    }

    /// A mismatched fork tag is fatal at the queue level. A tag for a known
    /// newer fork drives the fork transition; everything else is dropped
    /// and reported to the scorer.
    fn on_fork_mismatch(&self, msg: SsvMessage, current: u64) -> Result<(), ControllerError> {
        let got = msg.fork_version;
        metrics::record_dropped();
        match ForkVersion::from_wire(got) {
            Some(version) if got > current => {
                warn!(got, current, "message from a newer fork, transitioning");
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    if let Err(err) = inner.do_fork(version).await {
                        debug!(%err, "fork transition not applied");
                    }
                });
            }
            _ => {
                self.inner
                    .network
                    .report_validation(&msg, ValidationResult::RejectLow);
            }
        }
        Err(ControllerError::ForkMismatch { got })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Forks
    // ═══════════════════════════════════════════════════════════════════════

    /// Swap fork rules: stop the running instance, flush queued decided
    /// certificates, clear the rest of the queue, re-register handlers.
    pub async fn on_fork(&self, version: ForkVersion) -> Result<(), ControllerError> {
        self.inner.do_fork(version).await
    }
}

impl ControllerInner {
    fn decided_sync(&self) -> DecidedSync {
        let wire = self.fork.read().wire_version();
        DecidedSync::new(
            Arc::clone(&self.network),
            Arc::clone(&self.share),
            self.identifier,
            self.domain,
            wire,
            self.sync_config.clone(),
        )
    }

    fn register_stream_handlers(&self) {
        let fork = *self.fork.read();
        self.network.register_stream_handler(
            fork.last_decided_protocol(),
            handlers::last_decided_handler(Arc::clone(&self.storage)),
        );
        self.network.register_stream_handler(
            fork.decided_history_protocol(),
            handlers::decided_history_handler(
                Arc::clone(&self.storage),
                self.sync_config.max_batch_size,
            ),
        );
        if let Some(protocol) = fork.last_change_round_protocol() {
            self.network.register_stream_handler(
                protocol,
                handlers::last_change_round_handler(Arc::clone(&self.storage)),
            );
        }
    }

    /// The fork transition proper: only a `Ready` controller forks.
    async fn do_fork(&self, version: ForkVersion) -> Result<(), ControllerError> {
        if self
            .state
            .compare_exchange(
                ControllerState::Ready as u32,
                ControllerState::Forking as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ControllerError::Forking);
        }

        if let Some(instance) = self.current.write().take() {
            instance.lock().stop();
        }
        self.instance_running.store(false, Ordering::Release);

        for qmsg in self.queue.drain_decided() {
            if let Some(signed) = qmsg.signed {
                if let Err(err) = self.process_decided(&signed).await {
                    debug!(%err, "queued decided message dropped during fork");
                }
            }
        }
        let cleared = self.queue.clear();
        debug!(cleared, "forking controller, queue cleared");

        *self.fork.write() = Fork::new(version);
        self.register_stream_handlers();

        self.state
            .store(ControllerState::Ready as u32, Ordering::Release);
        Ok(())
    }

    /// A persistent storage failure makes the controller step aside: stop
    /// the running instance, refuse new work, and fail health checks until
    /// the operator intervenes.
    fn enter_quiescent(&self, err: &StorageError) {
        warn!(%err, "persistent storage failure, controller going quiescent");
        self.healthy.store(false, Ordering::Release);
        self.state
            .store(ControllerState::Quiescent as u32, Ordering::Release);
        if let Some(instance) = self.current.write().take() {
            instance.lock().stop();
        }
        self.instance_running.store(false, Ordering::Release);
    }

    fn instance_qbft_config(&self) -> Arc<Config> {
        Arc::new(Config {
            key_manager: Arc::clone(&self.key_manager),
            domain: self.domain,
            fork_version: self.fork.read().version().wire(),
            leader_selector: Arc::new(RoundRobinLeader::new(&self.share)),
            storage: Arc::clone(&self.storage),
            network: Arc::new(NetBroadcaster(Arc::clone(&self.network))),
            instance: self.instance_config.clone(),
        })
    }

    fn current_height(&self) -> Height {
        Height(self.height.load(Ordering::Acquire))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queue handler
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_queued(&self, qmsg: &QueuedMessage) -> Result<(), ControllerError> {
        if self.state.load(Ordering::Acquire) == ControllerState::Quiescent as u32 {
            trace!("controller is quiescent, dropping message");
            return Ok(());
        }
        match qmsg.msg.msg_type {
            SsvMsgType::Consensus => {
                let signed = qmsg
                    .signed
                    .as_ref()
                    .ok_or(ControllerError::EmptyQueueEntry)?;
                self.handle_consensus(&qmsg.msg, signed).await
            }
            SsvMsgType::Decided => {
                let signed = qmsg
                    .signed
                    .as_ref()
                    .ok_or(ControllerError::EmptyQueueEntry)?;
                self.process_decided_reporting(&qmsg.msg, signed).await
            }
            // Post-consensus signature collection happens outside the
            // consensus engine; the queue only prioritizes these.
            SsvMsgType::PartialSignature => Ok(()),
            SsvMsgType::Sync => Ok(()),
        }
    }

    async fn handle_consensus(
        &self,
        envelope: &SsvMessage,
        signed: &SignedMessage,
    ) -> Result<(), ControllerError> {
        let local = self.current_height();

        if signed.message.height > local {
            return self.upon_future_msg(envelope, signed).await;
        }

        // Aggregated commits on the consensus topic are decided
        // certificates from peers that already terminated.
        if signed.message.msg_type == MessageType::Commit
            && self.share.has_quorum(signed.signers.len())
            && signed.signers.len() > 1
        {
            return self.process_decided_reporting(envelope, signed).await;
        }

        if signed.message.msg_type == MessageType::RoundChange
            && self.fork.read().last_change_round_protocol().is_some()
        {
            if let Err(err) = self.storage.save_last_change_round(signed) {
                debug!(%err, "could not persist change round message");
            }
        }

        let Some(instance) = self.current.read().clone() else {
            trace!(height = %signed.message.height, "no running instance, dropping");
            self.network
                .report_validation(envelope, ValidationResult::Ignore);
            return Ok(());
        };

        // The instance lock stays scoped to the synchronous state-machine
        // step; persistence below may await.
        let outcome = {
            let mut guard = instance.lock();
            if guard.height() != signed.message.height {
                trace!(
                    instance_height = %guard.height(),
                    msg_height = %signed.message.height,
                    "stale message for another height"
                );
                self.network
                    .report_validation(envelope, ValidationResult::Ignore);
                return Ok(());
            }
            match guard.process_msg(signed) {
                Ok(Some(cert)) => Ok(Some((guard.state().clone(), cert))),
                Ok(None) => Ok(None),
                Err(err) => Err(err),
            }
        };

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some((state, cert))) => {
                self.persist_decided(&state, &cert).await?;
                self.has_decided.store(true, Ordering::Release);
                Ok(())
            }
            Err(InstanceError::Validation(err)) => {
                self.network
                    .report_validation(envelope, err.severity().into());
                metrics::record_dropped();
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Validate and apply a decided certificate, reporting the outcome.
    async fn process_decided_reporting(
        &self,
        envelope: &SsvMessage,
        signed: &SignedMessage,
    ) -> Result<(), ControllerError> {
        match self.process_decided(signed).await {
            Ok(()) => Ok(()),
            Err(ControllerError::Validation(err)) => {
                self.network
                    .report_validation(envelope, err.severity().into());
                metrics::record_dropped();
                Err(err.into())
            }
            Err(err) => Err(err),
        }
    }

    /// Apply a decided certificate: advance past it, or merge signers when
    /// it matches the stored height.
    async fn process_decided(&self, signed: &SignedMessage) -> Result<(), ControllerError> {
        signed.validate().map_err(ValidationError::Codec)?;
        if signed.message.identifier != self.identifier {
            return Err(ValidationError::WrongIdentifier.into());
        }
        if signed.message.msg_type != MessageType::Commit {
            return Err(ValidationError::WrongMsgType {
                expected: MessageType::Commit,
                got: signed.message.msg_type,
            }
            .into());
        }
        if !self.share.has_quorum(signed.signers.len()) {
            return Err(
                ValidationError::NotJustified("decided without quorum signers".into()).into(),
            );
        }
        verify_authorization(&self.share, self.domain, signed)?;

        let height = signed.message.height;
        let highest = self.storage.get_highest_instance(&self.identifier)?;

        match highest {
            Some(stored) if height < stored.height() => {
                trace!(%height, highest = %stored.height(), "stale decided certificate");
                Ok(())
            }
            Some(mut stored) if height == stored.height() => {
                // Same decision, heavier certificate: keep the bigger
                // signer set.
                if signed.signers.len() > stored.decided_message.signers.len() {
                    stored.decided_message = signed.clone();
                    self.save_with_retries(|| self.storage.save_highest_instance(&stored))
                        .await?;
                    debug!(%height, signers = stored.decided_message.signers.len(),
                        "extended stored decided certificate");
                }
                Ok(())
            }
            _ => {
                // A decision from the future: stop a slower local instance
                // and adopt the certificate.
                if let Some(instance) = self.current.read().clone() {
                    let mut guard = instance.lock();
                    if guard.height() <= height && !guard.is_decided() {
                        info!(instance_height = %guard.height(), %height,
                            "stopping instance, decided certificate received");
                        guard.stop();
                    }
                }

                let value = signed.message.commit_data()?.data;
                let state = InstanceState {
                    identifier: self.identifier,
                    height,
                    round: signed.message.round,
                    stage: Stage::Decided,
                    prepared_round: Some(signed.message.round),
                    prepared_value: Some(value.clone()),
                    proposal_accepted_for_current_round: None,
                    decided: true,
                    decided_value: Some(value),
                };
                self.persist_decided(&state, signed).await?;
                self.height.fetch_max(height.0, Ordering::AcqRel);
                self.has_decided.store(true, Ordering::Release);
                info!(%height, "advanced height from decided certificate");
                Ok(())
            }
        }
    }

    async fn persist_decided(
        &self,
        state: &InstanceState,
        cert: &SignedMessage,
    ) -> Result<(), ControllerError> {
        let stored = StoredInstance {
            state: state.clone(),
            decided_message: cert.clone(),
        };
        let mode = self.fork.read().decided_mode(self.full_node);
        if mode == DecidedMode::Full {
            self.save_with_retries(|| self.storage.save_instance(&stored))
                .await?;
        }
        self.save_with_retries(|| self.storage.save_highest_instance(&stored))
            .await?;
        metrics::record_decided();
        if let Some(handler) = &self.decided_handler {
            handler(cert);
        }
        Ok(())
    }

    /// Transient storage failures are retried with backoff, bounded at
    /// three attempts. Exhausting the retries counts as a persistent
    /// failure: the controller moves to the quiescent state and the error
    /// surfaces to the caller.
    async fn save_with_retries(
        &self,
        save: impl Fn() -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            match save() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, %err, "storage write failed");
                    if attempt >= 3 {
                        self.enter_quiescent(&err);
                        return Err(err);
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Future messages
    // ═══════════════════════════════════════════════════════════════════════

    async fn upon_future_msg(
        &self,
        envelope: &SsvMessage,
        signed: &SignedMessage,
    ) -> Result<(), ControllerError> {
        // Aggregated commits from ahead are decided certificates; adopt
        // them directly instead of buffering.
        if signed.message.msg_type == MessageType::Commit
            && self.share.has_quorum(signed.signers.len())
        {
            return self.process_decided_reporting(envelope, signed).await;
        }

        if signed.signers.len() != 1 {
            let err = ValidationError::TooManySigners(signed.signers.len());
            self.network
                .report_validation(envelope, err.severity().into());
            return Err(err.into());
        }
        if let Err(err) = verify_authorization(&self.share, self.domain, signed) {
            self.network
                .report_validation(envelope, err.severity().into());
            return Err(err.into());
        }

        let local = self.current_height();
        let (added, trigger) = {
            let mut buffer = self.future_msgs.lock();
            let added = buffer.add(signed.signers[0], signed.message.height, local);
            (added, self.share.has_partial_quorum(buffer.len()))
        };
        if !added {
            trace!(signer = %signed.signers[0], "future message signer already buffered");
            return Ok(());
        }

        if trigger && !self.syncing.swap(true, Ordering::AcqRel) {
            debug!(
                ctrl_height = %local,
                msg_height = %signed.message.height,
                "triggered f+1 sync"
            );
            let Some(this) = self.weak.upgrade() else {
                self.syncing.store(false, Ordering::Release);
                return Ok(());
            };
            tokio::spawn(async move {
                if let Err(err) = this.sync_highest_decided().await {
                    warn!(%err, "highest decided sync failed");
                }
                this.syncing.store(false, Ordering::Release);
            });
        }
        Ok(())
    }

    async fn sync_highest_decided(&self) -> Result<(), ControllerError> {
        let protocol = self.fork.read().last_decided_protocol();
        let best = self.decided_sync().last_decided(protocol).await?;
        if let Some(cert) = best {
            if cert.message.height > self.current_height() {
                self.process_decided(&cert).await?;
            }
        }
        self.future_msgs.lock().clear();
        Ok(())
    }
}
