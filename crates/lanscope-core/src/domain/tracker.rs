//! Request tracker: owns every in-flight [`InterceptionRecord`].
//!
//! # How it works (for beginners)
//!
//! A host networking stack reports one request through several callbacks that
//! arrive on arbitrary threads: "started", "response headers arrived", "some
//! body bytes arrived" (possibly many times) and "finished" or "failed".  The
//! tracker stitches those callbacks back together by [`RecordId`].
//!
//! ```text
//!  start ──► record_response_metadata ──► append_response_body* ──► complete
//!    │                                                                 │
//!    └──────────── live map (RwLock<HashMap<RecordId, Mutex<..>>>) ────┘
//! ```
//!
//! The live map's lock is held only long enough to insert, look up or remove
//! an entry.  Each record has its own mutex, so callbacks for different
//! requests never contend, while callbacks for the same request are
//! serialized.
//!
//! Once `complete` returns, the record has left the map and belongs to the
//! caller.  Any later call for that id fails with
//! [`TrackerError::AlreadyCompleted`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::record::{
    now_us, BodyChunk, CapturedRequest, HeaderMap, InterceptionRecord, Origin, RecordId,
};

/// Default body cap, applied to the request and response body separately: 10 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// How many completed ids are remembered for `AlreadyCompleted` reporting.
const RECENT_COMPLETED_CAPACITY: usize = 1024;

/// Errors returned by tracker operations.  None of them mutate any record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The id was never issued by this tracker, or it completed long enough
    /// ago to have left the recent-completion window.
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),

    /// The record already reached a terminal state.
    #[error("record {0} is already completed")]
    AlreadyCompleted(RecordId),

    /// A body chunk arrived with an index other than the next expected one.
    #[error("record {id}: expected body chunk {expected}, got {got}")]
    OrderingViolation { id: RecordId, expected: u64, got: u64 },
}

/// Result of a successful [`RequestTracker::append_response_body`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// All bytes of the chunk were stored.
    Appended,
    /// The body cap was reached; some or all bytes of the chunk were dropped.
    Truncated,
}

/// Tracker tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Maximum number of bytes kept for each of the request and response
    /// bodies of one record.
    pub max_body_bytes: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Bounded FIFO of recently completed ids.
#[derive(Debug, Default)]
struct RecentCompleted {
    order: VecDeque<RecordId>,
    members: HashSet<RecordId>,
}

impl RecentCompleted {
    fn remember(&mut self, id: RecordId) {
        if !self.members.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_COMPLETED_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &RecordId) -> bool {
        self.members.contains(id)
    }
}

/// Thread-safe registry of in-flight interception records.
#[derive(Debug, Default)]
pub struct RequestTracker {
    config: TrackerConfig,
    live: RwLock<HashMap<RecordId, Arc<Mutex<InterceptionRecord>>>>,
    recent: Mutex<RecentCompleted>,
}

impl RequestTracker {
    /// Creates a tracker with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Creates a live record for a request that just started.
    ///
    /// Always succeeds.  The returned id is unique for this tracker's lifetime.
    /// A request body longer than the body cap is truncated and the record is
    /// flagged.
    pub fn start(&self, origin: Origin, request: CapturedRequest) -> RecordId {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        let mut id = RecordId::new();
        while live.contains_key(&id) || self.recent().contains(&id) {
            id = RecordId::new();
        }
        let mut record = InterceptionRecord::new(id, origin, request, now_us());
        if record.cap_request_body(self.config.max_body_bytes) {
            debug!("tracker: request body of {id} truncated at {} bytes", self.config.max_body_bytes);
        }
        live.insert(id, Arc::new(Mutex::new(record)));
        debug!("tracker: started {id} ({} in flight)", live.len());
        id
    }

    /// Attaches response status and headers to a live record.
    pub fn record_response_metadata(
        &self,
        id: RecordId,
        headers: HeaderMap,
        status_code: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let entry = self.lookup(id)?;
        let mut record = lock(&entry);
        record.set_response_metadata(headers, status_code.into())
    }

    /// Appends one body chunk to a live record.
    ///
    /// Chunks must arrive with consecutive indices starting at 0.  A chunk
    /// with any other index is rejected and the record is left untouched.
    pub fn append_response_body(
        &self,
        id: RecordId,
        chunk: BodyChunk,
    ) -> Result<AppendOutcome, TrackerError> {
        let entry = self.lookup(id)?;
        let mut record = lock(&entry);
        let outcome = record.append_chunk(chunk, self.config.max_body_bytes)?;
        if outcome == AppendOutcome::Truncated {
            debug!("tracker: body of {id} truncated at {} bytes", self.config.max_body_bytes);
        }
        Ok(outcome)
    }

    /// Moves a record to its terminal state and hands it to the caller.
    ///
    /// `error` is `Some` for abnormal completion.  The record leaves the live
    /// map, so exactly one caller ever receives it.
    pub fn complete(
        &self,
        id: RecordId,
        error: Option<String>,
    ) -> Result<InterceptionRecord, TrackerError> {
        let entry = {
            let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
            match live.remove(&id) {
                Some(entry) => {
                    self.recent().remember(id);
                    entry
                }
                None => return Err(self.missing(id)),
            }
        };

        let record = match Arc::try_unwrap(entry) {
            Ok(mutex) => {
                let mut record = mutex.into_inner().unwrap_or_else(PoisonError::into_inner);
                record.finish(error, now_us())?;
                record
            }
            // A caller still holds a clone from `lookup`.  Finish the shared
            // record in place so its late mutations fail with
            // `AlreadyCompleted` instead of landing in a dropped copy.
            Err(shared) => {
                warn!("tracker: {id} completed while another callback still holds it");
                let mut record = lock(&shared);
                record.finish(error, now_us())?;
                record.clone()
            }
        };
        debug!("tracker: completed {id}");
        Ok(record)
    }

    /// Number of records currently in flight.
    pub fn in_flight(&self) -> usize {
        self.live.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `true` if `id` refers to a live record.
    pub fn contains(&self, id: RecordId) -> bool {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn lookup(&self, id: RecordId) -> Result<Arc<Mutex<InterceptionRecord>>, TrackerError> {
        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        match live.get(&id) {
            Some(entry) => Ok(Arc::clone(entry)),
            None => {
                drop(live);
                let err = self.missing(id);
                warn!("tracker: {err}");
                Err(err)
            }
        }
    }

    fn missing(&self, id: RecordId) -> TrackerError {
        if self.recent().contains(&id) {
            TrackerError::AlreadyCompleted(id)
        } else {
            TrackerError::UnknownRecord(id)
        }
    }

    fn recent(&self) -> MutexGuard<'_, RecentCompleted> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(entry: &Mutex<InterceptionRecord>) -> MutexGuard<'_, InterceptionRecord> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
