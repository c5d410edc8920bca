//! Outbound TCP session to the active viewer.
//!
//! # How the session works (for beginners)
//!
//! ```text
//!  send(bytes) ──► [bounded queue] ──notify──► I/O task ──frame──► TcpStream
//!                       ▲                          │
//!                       └────── survives ──────────┘ disconnects
//! ```
//!
//! - [`TransportSession::send`] never blocks and never awaits.  It pushes the
//!   payload onto a bounded queue and wakes the I/O task.  When the queue is
//!   full the *oldest* payload is dropped and a
//!   [`SessionEvent::BackpressureDrop`] is broadcast.
//! - One I/O task exists per connection attempt.  It connects (bounded by
//!   `connect_timeout`), then drains the queue in FIFO order, writing each
//!   payload as `[u32 BE length][payload]`.
//! - When the stream fails or the viewer hangs up the session goes back to
//!   [`ConnectionStatus::NotConnected`].  The payload being written is lost;
//!   everything still queued stays queued for the next connection.
//! - There is no retry timer.  A [`SessionEvent::PeerFailed`] is broadcast so
//!   the owner can tell discovery, and discovery decides when to try again.
//!
//! Every connection attempt gets a generation number.  A task whose
//! generation is no longer current has been superseded and must not touch the
//! session state.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lanscope_core::{encode_frame, DEFAULT_MAX_FRAME_LEN};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::infrastructure::discovery::DiscoveryPeer;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Payloads kept while not connected (at least 1).
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    /// Largest payload accepted by `send`.
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            connect_timeout: Duration::from_secs(3),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
}

/// What the session needs to know about a discovered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub instance_id: Uuid,
    pub addr: SocketAddr,
}

impl From<&DiscoveryPeer> for PeerKey {
    fn from(peer: &DiscoveryPeer) -> Self {
        Self {
            instance_id: peer.instance_id,
            addr: peer.addr,
        }
    }
}

/// Notifications broadcast by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StatusChanged {
        status: ConnectionStatus,
        peer: Option<PeerKey>,
    },
    /// The connection to `peer` failed or was closed by the peer.
    PeerFailed { peer: PeerKey, reason: String },
    /// The oldest queued payload was discarded to make room.
    BackpressureDrop { dropped_bytes: usize, total_dropped: u64 },
}

/// Result of [`TransportSession::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queued, but the oldest payload was dropped to make room.
    DroppedOldest,
    /// Larger than `max_frame_len`; not queued.
    Rejected,
}

#[derive(Debug)]
struct SessionState {
    status: ConnectionStatus,
    peer: Option<PeerKey>,
    queue: VecDeque<Vec<u8>>,
    generation: u64,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    stopped: bool,
}

#[derive(Debug)]
struct SessionInner {
    config: TransportConfig,
    state: Mutex<SessionState>,
    wake: Notify,
    events: broadcast::Sender<SessionEvent>,
    dropped: AtomicU64,
    sent: AtomicU64,
}

/// Handle to the single outbound session.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportSession {
    inner: Arc<SessionInner>,
}

impl TransportSession {
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                config,
                state: Mutex::new(SessionState {
                    status: ConnectionStatus::NotConnected,
                    peer: None,
                    queue: VecDeque::new(),
                    generation: 0,
                    task: None,
                    local_addr: None,
                    stopped: false,
                }),
                wake: Notify::new(),
                events,
                dropped: AtomicU64::new(0),
                sent: AtomicU64::new(0),
            }),
        }
    }

    /// Connects to `peer`, replacing any current connection.
    ///
    /// No-op if already connected or connecting to the same peer.  Must be
    /// called from within a Tokio runtime.
    pub fn attach_peer(&self, peer: PeerKey) {
        let mut st = self.inner.lock();
        if st.stopped {
            return;
        }
        if st.peer == Some(peer) && st.status != ConnectionStatus::NotConnected {
            debug!("already attached to {}", peer.addr);
            return;
        }

        self.inner.teardown(&mut st);
        st.generation += 1;
        st.peer = Some(peer);
        self.inner.set_status(&mut st, ConnectionStatus::Connecting);
        info!("connecting to viewer at {}", peer.addr);
        let task = tokio::spawn(run_connection(Arc::clone(&self.inner), peer, st.generation));
        st.task = Some(task);
    }

    /// Drops the connection to `peer` if it is the current one.
    pub fn detach_peer(&self, peer: PeerKey) {
        let mut st = self.inner.lock();
        if st.peer != Some(peer) {
            return;
        }
        self.inner.teardown(&mut st);
        st.generation += 1;
        st.peer = None;
        info!("detached from viewer at {}", peer.addr);
    }

    /// Queues `payload` for delivery.  Never blocks.
    pub fn send(&self, payload: Vec<u8>) -> SendOutcome {
        if payload.len() > self.inner.config.max_frame_len {
            warn!(
                "rejecting {}-byte payload above the {}-byte frame limit",
                payload.len(),
                self.inner.config.max_frame_len
            );
            return SendOutcome::Rejected;
        }

        let mut outcome = SendOutcome::Queued;
        {
            let mut st = self.inner.lock();
            let capacity = self.inner.config.queue_capacity.max(1);
            while st.queue.len() >= capacity {
                let Some(oldest) = st.queue.pop_front() else {
                    break;
                };
                let total_dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("queue full; dropped {}-byte payload ({total_dropped} total)", oldest.len());
                let _ = self.inner.events.send(SessionEvent::BackpressureDrop {
                    dropped_bytes: oldest.len(),
                    total_dropped,
                });
                outcome = SendOutcome::DroppedOldest;
            }
            st.queue.push_back(payload);
        }
        self.inner.wake.notify_one();
        outcome
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    /// The peer currently attached (connected, connecting or last failed).
    pub fn peer(&self) -> Option<PeerKey> {
        self.inner.lock().peer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Copies of the queued payloads, oldest first.
    pub fn queued_payloads(&self) -> Vec<Vec<u8>> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Payloads discarded by backpressure since creation.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Payloads fully handed to the byte stream since creation.
    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Local address of the live connection, if connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Closes the connection and refuses further attaches.  Does not block.
    pub fn stop(&self) {
        let mut st = self.inner.lock();
        if st.stopped {
            return;
        }
        self.inner.teardown(&mut st);
        st.generation += 1;
        st.peer = None;
        st.stopped = true;
        info!("transport session stopped ({} payloads still queued)", st.queue.len());
    }
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aborts the I/O task and reports `NotConnected` if anything was up.
    fn teardown(&self, st: &mut SessionState) {
        if let Some(task) = st.task.take() {
            task.abort();
        }
        st.local_addr = None;
        self.set_status(st, ConnectionStatus::NotConnected);
    }

    fn set_status(&self, st: &mut SessionState, status: ConnectionStatus) {
        if st.status == status {
            return;
        }
        st.status = status;
        let _ = self.events.send(SessionEvent::StatusChanged {
            status,
            peer: st.peer,
        });
    }

    fn mark_connected(&self, generation: u64, local_addr: Option<SocketAddr>) -> bool {
        let mut st = self.lock();
        if st.generation != generation {
            return false;
        }
        st.local_addr = local_addr;
        self.set_status(&mut st, ConnectionStatus::Connected);
        true
    }

    fn pop_next(&self, generation: u64) -> Option<Vec<u8>> {
        let mut st = self.lock();
        if st.generation != generation {
            return None;
        }
        st.queue.pop_front()
    }

    fn connection_lost(&self, generation: u64, peer: PeerKey, reason: String) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        st.task = None;
        st.local_addr = None;
        self.set_status(&mut st, ConnectionStatus::NotConnected);
        let _ = self.events.send(SessionEvent::PeerFailed { peer, reason });
    }
}

// ── I/O task ──────────────────────────────────────────────────────────────────

async fn run_connection(inner: Arc<SessionInner>, peer: PeerKey, generation: u64) {
    let stream = match time::timeout(inner.config.connect_timeout, TcpStream::connect(peer.addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("could not connect to viewer at {}: {e}", peer.addr);
            inner.connection_lost(generation, peer, format!("connect failed: {e}"));
            return;
        }
        Err(_) => {
            warn!(
                "connecting to viewer at {} timed out after {:?}",
                peer.addr, inner.config.connect_timeout
            );
            inner.connection_lost(generation, peer, "connect timed out".to_string());
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    let local_addr = stream.local_addr().ok();
    let (mut reader, mut writer) = stream.into_split();
    if !inner.mark_connected(generation, local_addr) {
        return;
    }
    info!("connected to viewer at {}", peer.addr);

    let mut scratch = [0u8; 512];
    loop {
        while let Some(payload) = inner.pop_next(generation) {
            if let Err(e) = write_frame(&mut writer, &payload, inner.config.max_frame_len).await {
                warn!("write to viewer at {} failed: {e}", peer.addr);
                inner.connection_lost(generation, peer, format!("write failed: {e}"));
                return;
            }
            inner.sent.fetch_add(1, Ordering::Relaxed);
        }

        tokio::select! {
            _ = inner.wake.notified() => {}
            read = reader.read(&mut scratch) => match read {
                Ok(0) => {
                    info!("viewer at {} closed the connection", peer.addr);
                    inner.connection_lost(generation, peer, "closed by peer".to_string());
                    return;
                }
                // The viewer never sends anything meaningful; discard.
                Ok(_) => {}
                Err(e) => {
                    warn!("read from viewer at {} failed: {e}", peer.addr);
                    inner.connection_lost(generation, peer, format!("read failed: {e}"));
                    return;
                }
            }
        }
    }
}

/// Writes one length-prefixed frame and flushes.
///
/// # Errors
///
/// `InvalidInput` if `payload` exceeds `max_frame_len`, otherwise whatever
/// the writer reports.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame_len: usize) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload, max_frame_len)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lanscope_core::FrameDecoder;
    use tokio::net::TcpListener;

    fn session(capacity: usize) -> TransportSession {
        TransportSession::new(TransportConfig {
            queue_capacity: capacity,
            connect_timeout: Duration::from_secs(2),
            max_frame_len: 1024,
        })
    }

    fn key(addr: SocketAddr) -> PeerKey {
        PeerKey {
            instance_id: Uuid::new_v4(),
            addr,
        }
    }

    async fn read_frames(stream: &mut TcpStream, count: usize) -> Vec<Vec<u8>> {
        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        let mut buf = [0u8; 256];
        while frames.len() < count {
            let n = stream.read(&mut buf).await.expect("read");
            assert!(n > 0, "stream closed early");
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.next_frame().expect("frame") {
                frames.push(frame);
            }
        }
        frames
    }

    async fn next_status(rx: &mut broadcast::Receiver<SessionEvent>) -> ConnectionStatus {
        loop {
            let event = time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event within timeout")
                .expect("channel open");
            if let SessionEvent::StatusChanged { status, .. } = event {
                return status;
            }
        }
    }

    #[test]
    fn test_new_session_is_not_connected_and_empty() {
        let session = session(4);

        assert_eq!(session.status(), ConnectionStatus::NotConnected);
        assert_eq!(session.queued_len(), 0);
        assert!(session.local_addr().is_none());
    }

    #[test]
    fn test_send_while_not_connected_queues_in_order() {
        // Arrange
        let session = session(4);

        // Act
        let first = session.send(b"p1".to_vec());
        let second = session.send(b"p2".to_vec());

        // Assert
        assert_eq!(first, SendOutcome::Queued);
        assert_eq!(second, SendOutcome::Queued);
        assert_eq!(session.queued_payloads(), vec![b"p1".to_vec(), b"p2".to_vec()]);
    }

    #[test]
    fn test_full_queue_drops_oldest_and_reports_backpressure() {
        // Arrange
        let session = session(1);
        let mut events = session.subscribe();

        // Act
        session.send(b"p1".to_vec());
        let outcome = session.send(b"p2".to_vec());

        // Assert
        assert_eq!(outcome, SendOutcome::DroppedOldest);
        assert_eq!(session.queued_payloads(), vec![b"p2".to_vec()]);
        assert_eq!(session.dropped_count(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::BackpressureDrop {
                dropped_bytes: 2,
                total_dropped: 1
            }
        );
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let session = session(4);

        let outcome = session.send(vec![0u8; 1025]);

        assert_eq!(outcome, SendOutcome::Rejected);
        assert_eq!(session.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_write_frame_writes_header_then_payload() {
        let mut writer = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'])
            .build();

        write_frame(&mut writer, b"hello", 1024).await.expect("write");
    }

    #[tokio::test]
    async fn test_write_frame_rejects_oversized_payload() {
        let mut writer = tokio_test::io::Builder::new().build();

        let result = write_frame(&mut writer, &[0u8; 8], 4).await;

        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_queued_payloads_flush_in_order_after_connect() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let session = session(8);
        let mut events = session.subscribe();
        session.send(b"p1".to_vec());
        session.send(b"p2".to_vec());

        // Act
        session.attach_peer(key(listener.local_addr().unwrap()));
        let (mut stream, _) = listener.accept().await.expect("accept");
        let frames = read_frames(&mut stream, 2).await;

        // Assert
        assert_eq!(frames, vec![b"p1".to_vec(), b"p2".to_vec()]);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);
        assert!(session.local_addr().is_some());
    }

    #[tokio::test]
    async fn test_send_while_connected_is_written_promptly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let session = session(8);
        let mut events = session.subscribe();
        session.attach_peer(key(listener.local_addr().unwrap()));
        let (mut stream, _) = listener.accept().await.expect("accept");
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        session.send(b"live".to_vec());
        let frames = read_frames(&mut stream, 1).await;

        assert_eq!(frames, vec![b"live".to_vec()]);
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_queue_and_reports_peer_failed() {
        // Arrange: grab a free port, then close it so connecting is refused.
        let addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            probe.local_addr().unwrap()
        };
        let session = session(8);
        let mut events = session.subscribe();
        session.send(b"kept".to_vec());
        let peer = key(addr);

        // Act
        session.attach_peer(peer);
        let mut failed = None;
        while failed.is_none() {
            let event = time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event within timeout")
                .expect("channel open");
            if let SessionEvent::PeerFailed { peer, .. } = event {
                failed = Some(peer);
            }
        }

        // Assert
        assert_eq!(failed, Some(peer));
        assert_eq!(session.status(), ConnectionStatus::NotConnected);
        assert_eq!(session.queued_payloads(), vec![b"kept".to_vec()]);
    }

    #[tokio::test]
    async fn test_peer_hangup_moves_to_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let session = session(8);
        let mut events = session.subscribe();
        session.attach_peer(key(listener.local_addr().unwrap()));
        let (stream, _) = listener.accept().await.expect("accept");
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        drop(stream);

        assert_eq!(next_status(&mut events).await, ConnectionStatus::NotConnected);
        assert!(session.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_attach_same_peer_twice_is_a_noop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let session = session(8);
        let peer = key(listener.local_addr().unwrap());

        session.attach_peer(peer);
        session.attach_peer(peer);
        let _first = listener.accept().await.expect("accept");
        let second = time::timeout(Duration::from_millis(200), listener.accept()).await;

        assert!(second.is_err(), "a second connection must not be opened");
    }

    #[tokio::test]
    async fn test_detach_and_stop_report_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let session = session(8);
        let mut events = session.subscribe();
        let peer = key(listener.local_addr().unwrap());
        session.attach_peer(peer);
        let _conn = listener.accept().await.expect("accept");
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        session.detach_peer(peer);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::NotConnected);
        assert!(session.peer().is_none());

        session.stop();
        session.attach_peer(peer);
        assert_eq!(session.status(), ConnectionStatus::NotConnected);
    }
}
