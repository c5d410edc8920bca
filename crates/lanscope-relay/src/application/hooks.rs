//! Hook boundary: from host networking callbacks to [`HookSink`] calls.
//!
//! How the hooks get installed in a host runtime (method swizzling, client
//! middleware, a patched connection class, …) is not this crate's concern.
//! Whatever installs them calls one of the two adapters below:
//!
//! - [`TaskHookAdapter`] for task-style APIs, where each request is a task
//!   object that reports "response", "data" and "complete" callbacks.
//! - [`DelegateHookAdapter`] for delegate-style connections, which report
//!   "will start", "did receive response", "did receive data",
//!   "did finish loading" and "did fail".
//!
//! Both adapters remember which [`RecordId`] belongs to which host handle and
//! number body chunks in the order they arrive.  Callbacks for a handle the
//! adapter never saw start are logged and dropped, never forwarded.  A handle
//! that starts again before finishing fails its earlier record with
//! [`RESTARTED_ERROR`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lanscope_core::{BodyChunk, CapturedRequest, ConnectionHandle, HeaderMap, Origin, RecordId, TaskHandle};
use tracing::{debug, warn};

/// Receiver of normalized hook callbacks.
///
/// Implementations must be cheap and must never block: the callbacks run on
/// the host's networking threads.
#[cfg_attr(test, mockall::automock)]
pub trait HookSink: Send + Sync {
    /// A request started.  Returns the id used for every later callback.
    fn on_start(&self, origin: Origin, request: CapturedRequest) -> RecordId;

    fn on_response_metadata(&self, id: RecordId, headers: HeaderMap, status: String);

    fn on_data_chunk(&self, id: RecordId, chunk: BodyChunk);

    fn on_finish(&self, id: RecordId);

    fn on_fail(&self, id: RecordId, error: String);
}

/// Everything after `on_start`, as a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    ResponseMetadata {
        id: RecordId,
        headers: HeaderMap,
        status: String,
    },
    DataChunk {
        id: RecordId,
        chunk: BodyChunk,
    },
    Finish {
        id: RecordId,
    },
    Fail {
        id: RecordId,
        error: String,
    },
}

impl HookEvent {
    pub fn id(&self) -> RecordId {
        match self {
            Self::ResponseMetadata { id, .. }
            | Self::DataChunk { id, .. }
            | Self::Finish { id }
            | Self::Fail { id, .. } => *id,
        }
    }
}

// ── Shared adapter core ───────────────────────────────────────────────────────

/// Error reported for a record whose handle started again before finishing.
pub const RESTARTED_ERROR: &str = "restarted before completion";

#[derive(Debug)]
struct InFlight {
    id: RecordId,
    next_chunk: u64,
    done: bool,
}

type Slot = Arc<Mutex<InFlight>>;

/// Handle → in-flight record map shared by both adapters.
///
/// The map lock only covers insert, lookup and removal.  Each handle has its
/// own slot lock, held across the sink call, so chunk numbering and delivery
/// order cannot diverge for one handle while other handles proceed.
struct AdapterCore<K> {
    sink: Arc<dyn HookSink>,
    live: Mutex<HashMap<K, Slot>>,
    kind: &'static str,
}

impl<K: Eq + Hash + Copy + Debug> AdapterCore<K> {
    fn new(sink: Arc<dyn HookSink>, kind: &'static str) -> Self {
        Self {
            sink,
            live: Mutex::new(HashMap::new()),
            kind,
        }
    }

    fn start(&self, key: K, origin: Origin, request: CapturedRequest) -> RecordId {
        let previous = self.map().remove(&key);
        if let Some(slot) = previous {
            let mut previous = lock_slot(&slot);
            previous.done = true;
            warn!(
                "{} {key:?} restarted before finishing; failing record {}",
                self.kind, previous.id
            );
            self.sink.on_fail(previous.id, RESTARTED_ERROR.to_string());
        }

        let id = self.sink.on_start(origin, request);
        let slot = Arc::new(Mutex::new(InFlight {
            id,
            next_chunk: 0,
            done: false,
        }));
        self.map().insert(key, slot);
        debug!("{} {key:?} started as {id}", self.kind);
        id
    }

    fn response(&self, key: K, headers: HeaderMap, status: u16) {
        let Some(slot) = self.slot(&key) else {
            return self.unknown(key, "response");
        };
        let entry = lock_slot(&slot);
        if entry.done {
            return self.unknown(key, "response");
        }
        self.sink
            .on_response_metadata(entry.id, headers, status.to_string());
    }

    fn data(&self, key: K, bytes: Vec<u8>) {
        let Some(slot) = self.slot(&key) else {
            return self.unknown(key, "data");
        };
        let mut entry = lock_slot(&slot);
        if entry.done {
            return self.unknown(key, "data");
        }
        let chunk = BodyChunk::new(entry.next_chunk, bytes);
        entry.next_chunk += 1;
        self.sink.on_data_chunk(entry.id, chunk);
    }

    fn finish(&self, key: K, error: Option<String>) {
        let removed = self.map().remove(&key);
        let Some(slot) = removed else {
            return self.unknown(key, "completion");
        };
        // Waits for a data callback still running on another thread.
        let mut entry = lock_slot(&slot);
        entry.done = true;
        match error {
            None => self.sink.on_finish(entry.id),
            Some(error) => self.sink.on_fail(entry.id, error),
        }
    }

    fn in_flight(&self) -> usize {
        self.map().len()
    }

    fn unknown(&self, key: K, what: &str) {
        warn!("ignoring {what} callback for unknown {} {key:?}", self.kind);
    }

    fn slot(&self, key: &K) -> Option<Slot> {
        self.map().get(key).cloned()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<K, Slot>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_slot(slot: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Task-style adapter ────────────────────────────────────────────────────────

/// Adapter for task-based networking APIs.
pub struct TaskHookAdapter {
    core: AdapterCore<TaskHandle>,
}

impl TaskHookAdapter {
    pub fn new(sink: Arc<dyn HookSink>) -> Self {
        Self {
            core: AdapterCore::new(sink, "task"),
        }
    }

    /// The task was resumed with `request`.
    pub fn task_did_start(&self, task: TaskHandle, request: CapturedRequest) -> RecordId {
        self.core.start(task, Origin::Task(task), request)
    }

    pub fn task_did_receive_response(&self, task: TaskHandle, status_code: u16, headers: HeaderMap) {
        self.core.response(task, headers, status_code);
    }

    pub fn task_did_receive_data(&self, task: TaskHandle, bytes: impl Into<Vec<u8>>) {
        self.core.data(task, bytes.into());
    }

    /// The task finished; `error` is `Some` when it failed.
    pub fn task_did_complete(&self, task: TaskHandle, error: Option<String>) {
        self.core.finish(task, error);
    }

    /// Tasks started but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.core.in_flight()
    }
}

// ── Delegate-style adapter ────────────────────────────────────────────────────

/// Adapter for delegate-based connections.
pub struct DelegateHookAdapter {
    core: AdapterCore<ConnectionHandle>,
}

impl DelegateHookAdapter {
    pub fn new(sink: Arc<dyn HookSink>) -> Self {
        Self {
            core: AdapterCore::new(sink, "connection"),
        }
    }

    pub fn connection_will_start(&self, connection: ConnectionHandle, request: CapturedRequest) -> RecordId {
        self.core
            .start(connection, Origin::Delegate(connection), request)
    }

    pub fn connection_did_receive_response(
        &self,
        connection: ConnectionHandle,
        status_code: u16,
        headers: HeaderMap,
    ) {
        self.core.response(connection, headers, status_code);
    }

    pub fn connection_did_receive_data(&self, connection: ConnectionHandle, bytes: impl Into<Vec<u8>>) {
        self.core.data(connection, bytes.into());
    }

    pub fn connection_did_finish_loading(&self, connection: ConnectionHandle) {
        self.core.finish(connection, None);
    }

    pub fn connection_did_fail(&self, connection: ConnectionHandle, error: impl Into<String>) {
        self.core.finish(connection, Some(error.into()));
    }

    pub fn in_flight(&self) -> usize {
        self.core.in_flight()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
