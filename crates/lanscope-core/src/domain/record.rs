//! Interception record domain entity.
//!
//! One [`InterceptionRecord`] describes one observed request/response
//! lifecycle.  The request half is captured once at start; the response half
//! is filled in incrementally as the host's networking stack reports
//! metadata and body chunks.  Mutators are crate-private: only the
//! [`crate::RequestTracker`] changes a record, and only while it is live.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::domain::tracker::{AppendOutcome, TrackerError};

/// HTTP header map.  A `BTreeMap` keeps key order stable so encoding is
/// deterministic.
pub type HeaderMap = BTreeMap<String, String>;

/// Unique identifier for an interception record, derived from UUID v4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Non-owning identity of a host task object (task-based networking API).
///
/// This is a lookup key such as the task's numeric identifier or its address;
/// it never keeps the host object alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

/// Non-owning identity of a host connection object (delegate-based API).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Which interception path produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Captured from a task-based request (completion callbacks on a task).
    Task(TaskHandle),
    /// Captured from a delegate-based connection (delegate callbacks).
    Delegate(ConnectionHandle),
}

/// The request half of a record, captured once when the request starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    /// Convenience constructor for a request without headers or body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Adds a header, returning `self` for chaining.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request body, returning `self` for chaining.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// One slice of a response body, numbered in the order the hook adapter
/// received it.  The first chunk of every record has index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChunk {
    pub index: u64,
    pub bytes: Vec<u8>,
}

impl BodyChunk {
    pub fn new(index: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            bytes: bytes.into(),
        }
    }
}

/// In-memory representation of one observed request/response lifecycle.
///
/// Timestamps are microseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptionRecord {
    id: RecordId,
    origin: Origin,
    request: CapturedRequest,
    request_truncated: bool,
    response_headers: Option<HeaderMap>,
    status_code: Option<String>,
    response_body: Vec<u8>,
    body_truncated: bool,
    next_chunk: u64,
    start_time_us: u64,
    end_time_us: Option<u64>,
    error: Option<String>,
    is_completed: bool,
}

impl InterceptionRecord {
    pub(crate) fn new(id: RecordId, origin: Origin, request: CapturedRequest, now_us: u64) -> Self {
        Self {
            id,
            origin,
            request,
            request_truncated: false,
            response_headers: None,
            status_code: None,
            response_body: Vec::new(),
            body_truncated: false,
            next_chunk: 0,
            start_time_us: now_us,
            end_time_us: None,
            error: None,
            is_completed: false,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn request(&self) -> &CapturedRequest {
        &self.request
    }

    pub fn request_method(&self) -> &str {
        &self.request.method
    }

    pub fn request_url(&self) -> &str {
        &self.request.url
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request.headers
    }

    pub fn request_body(&self) -> &[u8] {
        &self.request.body
    }

    /// `true` when the request body was cut at the tracker's body cap.
    pub fn request_truncated(&self) -> bool {
        self.request_truncated
    }

    pub fn response_headers(&self) -> Option<&HeaderMap> {
        self.response_headers.as_ref()
    }

    pub fn status_code(&self) -> Option<&str> {
        self.status_code.as_deref()
    }

    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    /// `true` when bytes past the tracker's body cap were discarded.
    pub fn body_truncated(&self) -> bool {
        self.body_truncated
    }

    pub fn start_time_us(&self) -> u64 {
        self.start_time_us
    }

    pub fn end_time_us(&self) -> Option<u64> {
        self.end_time_us
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// `true` once response metadata (status + headers) has been attached.
    pub fn has_response(&self) -> bool {
        self.status_code.is_some()
    }

    // ── Mutators (tracker only) ───────────────────────────────────────────────

    /// Cuts the request body down to `max_body_bytes`.  Returns `true` if
    /// anything was dropped.
    pub(crate) fn cap_request_body(&mut self, max_body_bytes: usize) -> bool {
        if self.request.body.len() <= max_body_bytes {
            return false;
        }
        self.request.body.truncate(max_body_bytes);
        self.request_truncated = true;
        true
    }

    pub(crate) fn set_response_metadata(
        &mut self,
        headers: HeaderMap,
        status_code: String,
    ) -> Result<(), TrackerError> {
        self.ensure_live()?;
        self.response_headers = Some(headers);
        self.status_code = Some(status_code);
        Ok(())
    }

    pub(crate) fn append_chunk(
        &mut self,
        chunk: BodyChunk,
        max_body_bytes: usize,
    ) -> Result<AppendOutcome, TrackerError> {
        self.ensure_live()?;
        if chunk.index != self.next_chunk {
            return Err(TrackerError::OrderingViolation {
                id: self.id,
                expected: self.next_chunk,
                got: chunk.index,
            });
        }
        self.next_chunk += 1;

        let room = max_body_bytes.saturating_sub(self.response_body.len());
        if chunk.bytes.len() <= room {
            self.response_body.extend_from_slice(&chunk.bytes);
            return Ok(AppendOutcome::Appended);
        }

        self.response_body.extend_from_slice(&chunk.bytes[..room]);
        self.body_truncated = true;
        Ok(AppendOutcome::Truncated)
    }

    pub(crate) fn finish(&mut self, error: Option<String>, now_us: u64) -> Result<(), TrackerError> {
        self.ensure_live()?;
        // A clock step backwards must not produce end < start.
        self.end_time_us = Some(now_us.max(self.start_time_us));
        self.error = error;
        self.is_completed = true;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), TrackerError> {
        if self.is_completed {
            Err(TrackerError::AlreadyCompleted(self.id))
        } else {
            Ok(())
        }
    }
}

/// Returns the current time as microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
