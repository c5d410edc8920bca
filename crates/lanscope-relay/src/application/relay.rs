//! Relay controller: the composition root of the relay.
//!
//! # Lifecycle
//!
//! ```text
//!  RelayController::start(config)  ── builds tracker, session, discovery
//!        │                            and starts browsing
//!        ├── hook pump        HookEvent → tracker → codec → session.send
//!        ├── discovery pump   PeerFound/PeerLost → attach/detach
//!        └── status watcher   PeerFailed → discovery.invalidate_peer
//!  RelayController::shutdown()    ── stops everything without blocking
//! ```
//!
//! There is no global instance.  The host creates one controller, hands
//! [`RelayController::handle`] (or the adapters) to its hooks, and shuts it
//! down when it is done.
//!
//! # Why a channel between hooks and the tracker?
//!
//! Host callbacks run on arbitrary threads and must return quickly.
//! [`RelayHandle`] therefore only does two things on the caller's thread:
//! `on_start` registers the record (it has to return the id), and every other
//! callback becomes a [`HookEvent`] on an unbounded channel.  The hook pump
//! applies events in the order they were sent, which preserves each
//! request's own callback order without any extra locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lanscope_core::{
    encode_record, BodyChunk, CapturedRequest, Environment, HeaderMap, Origin, RecordId,
    RequestTracker, TrackerError,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::hooks::{DelegateHookAdapter, HookEvent, HookSink, TaskHookAdapter};
use crate::infrastructure::config::{ConfigError, RelayConfig};
use crate::infrastructure::discovery::{DiscoveryError, DiscoveryEvent, DiscoveryService};
use crate::infrastructure::transport::{
    ConnectionStatus, PeerKey, SendOutcome, SessionEvent, TransportSession,
};

/// Shown as `originatingAddress` until the first connection is made.
const UNKNOWN_ADDRESS: &str = "unknown";

/// Errors that prevent the relay from starting.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Counters exposed through [`RelayController::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Packets encoded and handed to the transport queue.
    pub packets_relayed: u64,
    /// Packets written to the viewer's stream.
    pub packets_sent: u64,
    /// Callbacks that named an unknown or already-completed record.
    pub lookup_failures: u64,
    /// Body chunks that arrived out of order.
    pub ordering_violations: u64,
    /// Completed records that could not be encoded or framed.
    pub encode_failures: u64,
    /// Queued packets dropped because the queue was full.
    pub backpressure_drops: u64,
    /// Requests currently being tracked.
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct RelayCounters {
    packets_relayed: AtomicU64,
    lookup_failures: AtomicU64,
    ordering_violations: AtomicU64,
    encode_failures: AtomicU64,
}

impl RelayCounters {
    fn note_tracker_error(&self, err: &TrackerError) {
        match err {
            TrackerError::UnknownRecord(_) | TrackerError::AlreadyCompleted(_) => {
                self.lookup_failures.fetch_add(1, Ordering::Relaxed);
            }
            TrackerError::OrderingViolation { .. } => {
                warn!("hook pump: {err}");
                self.ordering_violations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable [`HookSink`] feeding a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tracker: Arc<RequestTracker>,
    events: mpsc::UnboundedSender<HookEvent>,
}

impl RelayHandle {
    fn forward(&self, event: HookEvent) {
        if self.events.send(event).is_err() {
            debug!("relay is shut down; dropping hook event");
        }
    }
}

impl HookSink for RelayHandle {
    fn on_start(&self, origin: Origin, request: CapturedRequest) -> RecordId {
        self.tracker.start(origin, request)
    }

    fn on_response_metadata(&self, id: RecordId, headers: HeaderMap, status: String) {
        self.forward(HookEvent::ResponseMetadata {
            id,
            headers,
            status,
        });
    }

    fn on_data_chunk(&self, id: RecordId, chunk: BodyChunk) {
        self.forward(HookEvent::DataChunk { id, chunk });
    }

    fn on_finish(&self, id: RecordId) {
        self.forward(HookEvent::Finish { id });
    }

    fn on_fail(&self, id: RecordId, error: String) {
        self.forward(HookEvent::Fail { id, error });
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

/// Owns every relay component and the tasks wiring them together.
pub struct RelayController {
    handle: RelayHandle,
    tracker: Arc<RequestTracker>,
    session: TransportSession,
    discovery: Arc<DiscoveryService>,
    counters: Arc<RelayCounters>,
    task_adapter: Option<Arc<TaskHookAdapter>>,
    delegate_adapter: Option<Arc<DelegateHookAdapter>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayController {
    /// Builds the relay and starts browsing for a viewer.
    ///
    /// # Errors
    ///
    /// [`RelayError::Config`] for an invalid discovery address or a frame
    /// limit too small for the body cap, [`RelayError::Discovery`] if the
    /// discovery socket cannot be bound.
    pub async fn start(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let tracker = Arc::new(RequestTracker::with_config(config.tracker_config()));
        let session = TransportSession::new(config.transport_config());
        let discovery = Arc::new(DiscoveryService::new(config.discovery_config()?));

        let peer_events = discovery
            .start_browsing(&config.discovery.service_type, &config.discovery.domain)
            .await?;
        let session_events = session.subscribe();

        let (hook_tx, hook_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(RelayCounters::default());
        let handle = RelayHandle {
            tracker: Arc::clone(&tracker),
            events: hook_tx,
        };

        let tasks = vec![
            tokio::spawn(hook_pump(
                hook_rx,
                Arc::clone(&tracker),
                session.clone(),
                config.environment(UNKNOWN_ADDRESS),
                Arc::clone(&counters),
            )),
            tokio::spawn(discovery_pump(peer_events, session.clone())),
            tokio::spawn(status_watcher(session_events, Arc::clone(&discovery))),
        ];

        let sink: Arc<dyn HookSink> = Arc::new(handle.clone());
        let task_adapter = config
            .capture
            .enable_task_hooks
            .then(|| Arc::new(TaskHookAdapter::new(Arc::clone(&sink))));
        let delegate_adapter = config
            .capture
            .enable_delegate_hooks
            .then(|| Arc::new(DelegateHookAdapter::new(Arc::clone(&sink))));

        info!(
            "relay started for project {} on device {}",
            config.project.project_name, config.device.device_name
        );
        Ok(Self {
            handle,
            tracker,
            session,
            discovery,
            counters,
            task_adapter,
            delegate_adapter,
            tasks,
        })
    }

    /// A [`HookSink`] for custom hook installers.
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// `None` when task hooks are disabled in the config.
    pub fn task_adapter(&self) -> Option<Arc<TaskHookAdapter>> {
        self.task_adapter.clone()
    }

    /// `None` when delegate hooks are disabled in the config.
    pub fn delegate_adapter(&self) -> Option<Arc<DelegateHookAdapter>> {
        self.delegate_adapter.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    /// Connection status changes, failures and backpressure drops.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    /// UDP port the discovery browser listens on.
    pub fn discovery_port(&self) -> Option<u16> {
        self.discovery.bound_port()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            packets_relayed: self.counters.packets_relayed.load(Ordering::Relaxed),
            packets_sent: self.session.sent_count(),
            lookup_failures: self.counters.lookup_failures.load(Ordering::Relaxed),
            ordering_violations: self.counters.ordering_violations.load(Ordering::Relaxed),
            encode_failures: self.counters.encode_failures.load(Ordering::Relaxed),
            backpressure_drops: self.session.dropped_count(),
            in_flight: self.tracker.in_flight(),
        }
    }

    /// Stops discovery and the transport and cancels the pumps.  Does not
    /// wait for anything.
    pub fn shutdown(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        self.discovery.stop();
        self.session.stop();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("relay shut down");
    }
}

impl Drop for RelayController {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn hook_pump(
    mut events: mpsc::UnboundedReceiver<HookEvent>,
    tracker: Arc<RequestTracker>,
    session: TransportSession,
    mut env: Environment,
    counters: Arc<RelayCounters>,
) {
    while let Some(event) = events.recv().await {
        let result = match event {
            HookEvent::ResponseMetadata {
                id,
                headers,
                status,
            } => tracker.record_response_metadata(id, headers, status),
            HookEvent::DataChunk { id, chunk } => {
                tracker.append_response_body(id, chunk).map(|_| ())
            }
            HookEvent::Finish { id } => {
                relay_completed(&tracker, &session, &mut env, &counters, id, None)
            }
            HookEvent::Fail { id, error } => {
                relay_completed(&tracker, &session, &mut env, &counters, id, Some(error))
            }
        };
        if let Err(e) = result {
            counters.note_tracker_error(&e);
        }
    }
    debug!("hook pump exiting");
}

fn relay_completed(
    tracker: &RequestTracker,
    session: &TransportSession,
    env: &mut Environment,
    counters: &RelayCounters,
    id: RecordId,
    error: Option<String>,
) -> Result<(), TrackerError> {
    let record = tracker.complete(id, error)?;
    if let Some(local) = session.local_addr() {
        env.originating_address = local.to_string();
    }

    let bytes = match encode_record(&record, env) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("dropping record {id}: {e}");
            counters.encode_failures.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };
    match session.send(bytes) {
        SendOutcome::Rejected => {
            warn!("dropping record {id}: encoded packet exceeds the frame limit");
            counters.encode_failures.fetch_add(1, Ordering::Relaxed);
        }
        SendOutcome::Queued | SendOutcome::DroppedOldest => {
            counters.packets_relayed.fetch_add(1, Ordering::Relaxed);
            debug!("relayed {} {} ({id})", record.request_method(), record.request_url());
        }
    }
    Ok(())
}

async fn discovery_pump(mut events: mpsc::Receiver<DiscoveryEvent>, session: TransportSession) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::PeerFound(peer) => session.attach_peer(PeerKey::from(&peer)),
            DiscoveryEvent::PeerLost(peer) => session.detach_peer(PeerKey::from(&peer)),
        }
    }
    debug!("discovery pump exiting");
}

async fn status_watcher(
    mut events: broadcast::Receiver<SessionEvent>,
    discovery: Arc<DiscoveryService>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PeerFailed { peer, reason }) => {
                info!("viewer at {} unusable ({reason}); waiting for rediscovery", peer.addr);
                discovery.invalidate_peer(peer.instance_id);
            }
            Ok(SessionEvent::StatusChanged { status, peer }) => {
                info!(
                    "viewer connection {status:?}{}",
                    peer.map(|p| format!(" ({})", p.addr)).unwrap_or_default()
                );
            }
            Ok(SessionEvent::BackpressureDrop { total_dropped, .. }) => {
                debug!("backpressure: {total_dropped} packets dropped so far");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("status watcher lagged; {skipped} session events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
