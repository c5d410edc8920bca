//! UDP broadcast-based peer discovery.
//!
//! One [`DiscoveryService`] plays one of two roles:
//!
//! - **Advertising** (the viewer): every `announce_interval` it broadcasts an
//!   `Announce` datagram carrying its service type, domain, name and TCP
//!   port.  On stop it sends a best-effort `Goodbye`.
//! - **Browsing** (the relay): it binds the discovery port, decodes incoming
//!   datagrams and reports [`DiscoveryEvent`]s on a channel.  The port is
//!   bound with address reuse so several relays on one host can browse at
//!   once; every one of them receives the broadcast announcements.
//!
//! # How peers are chosen (for beginners)
//!
//! Several viewers may be running on the same LAN.  The relay talks to only
//! one at a time, so the browse loop keeps a small [`PeerTable`]:
//!
//! 1. The first matching peer to announce itself becomes *active* and is
//!    reported with [`DiscoveryEvent::PeerFound`].
//! 2. Peers that show up later are remembered as *candidates* but not
//!    reported.
//! 3. When the active peer goes away (goodbye, silence longer than
//!    `peer_ttl`, or the transport calling [`DiscoveryService::invalidate_peer`])
//!    a [`DiscoveryEvent::PeerLost`] is emitted and the oldest surviving
//!    candidate is promoted with a fresh `PeerFound`.
//!
//! Socket errors are logged and the loops keep running: a laptop hopping
//! between Wi-Fi networks must not kill discovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lanscope_core::{decode_announcement, encode_announcement, AnnounceKind, ServiceAnnouncement};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event channel depth, as for every other event channel in the relay.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Largest datagram we try to read.
const MAX_DATAGRAM_LEN: usize = 2048;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The service is already in the other role (or already browsing).
    #[error("discovery service is already {current:?}")]
    RoleConflict { current: DiscoveryState },

    /// `stop` was called; a stopped service cannot be restarted.
    #[error("discovery service is stopped")]
    Stopped,

    /// Socket configuration failed after binding.
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime settings for the discovery sockets.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// UDP port browsers listen on and advertisers send to.  `0` lets the
    /// OS pick (browse side, tests only).
    pub discovery_port: u16,
    /// Where advertisers send announcements.
    pub broadcast_addr: IpAddr,
    pub announce_interval: Duration,
    /// A peer not re-announced within this window is lost.
    pub peer_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_port: 43434,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval: Duration::from_secs(1),
            peer_ttl: Duration::from_secs(5),
        }
    }
}

/// The name/type/domain triple an advertiser publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub service_type: String,
    pub domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLiveness {
    Resolved,
    Lost,
}

/// One discovered service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPeer {
    pub instance_id: Uuid,
    pub name: String,
    /// Datagram source IP plus announced TCP port.
    pub addr: SocketAddr,
    pub liveness: PeerLiveness,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(DiscoveryPeer),
    PeerLost(DiscoveryPeer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Advertising,
    Browsing,
    Stopped,
}

// ── Peer table ────────────────────────────────────────────────────────────────

/// First-resolved-wins bookkeeping for the browse loop.
///
/// Pure data structure: callers pass the current time in, events come out.
#[derive(Debug)]
pub struct PeerTable {
    service_type: String,
    domain: String,
    ttl: Duration,
    active: Option<Uuid>,
    /// In resolution order, so the front is the oldest candidate.
    peers: Vec<DiscoveryPeer>,
}

impl PeerTable {
    pub fn new(service_type: impl Into<String>, domain: impl Into<String>, ttl: Duration) -> Self {
        Self {
            service_type: service_type.into(),
            domain: domain.into(),
            ttl,
            active: None,
            peers: Vec::new(),
        }
    }

    /// The peer currently handed to the transport, if any.
    pub fn active(&self) -> Option<&DiscoveryPeer> {
        let id = self.active?;
        self.peers.iter().find(|p| p.instance_id == id)
    }

    /// Number of known peers (active plus candidates).
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Applies one received datagram.
    pub fn observe(
        &mut self,
        announcement: &ServiceAnnouncement,
        src: SocketAddr,
        now: Instant,
    ) -> Vec<DiscoveryEvent> {
        if announcement.service_type != self.service_type || announcement.domain != self.domain {
            return Vec::new();
        }
        if announcement.kind == AnnounceKind::Goodbye {
            debug!("goodbye from {} ({src})", announcement.name);
            return self.remove(announcement.instance_id);
        }

        let addr = SocketAddr::new(src.ip(), announcement.port);
        let is_active = self.active == Some(announcement.instance_id);
        if let Some(peer) = self
            .peers
            .iter_mut()
            .find(|p| p.instance_id == announcement.instance_id)
        {
            peer.last_seen = now;
            peer.name.clone_from(&announcement.name);
            if peer.addr == addr {
                return Vec::new();
            }
            let mut lost = peer.clone();
            lost.liveness = PeerLiveness::Lost;
            peer.addr = addr;
            info!("peer {} moved from {} to {addr}", peer.name, lost.addr);
            return if is_active {
                vec![DiscoveryEvent::PeerLost(lost), DiscoveryEvent::PeerFound(peer.clone())]
            } else {
                Vec::new()
            };
        }

        let peer = DiscoveryPeer {
            instance_id: announcement.instance_id,
            name: announcement.name.clone(),
            addr,
            liveness: PeerLiveness::Resolved,
            last_seen: now,
        };
        self.peers.push(peer.clone());
        if self.active.is_none() {
            self.active = Some(peer.instance_id);
            info!("peer found: {} at {addr}", peer.name);
            vec![DiscoveryEvent::PeerFound(peer)]
        } else {
            debug!("candidate peer {} at {addr} kept in reserve", peer.name);
            Vec::new()
        }
    }

    /// Drops every peer whose last announcement is older than the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscoveryEvent> {
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|p| now.saturating_duration_since(p.last_seen) > self.ttl)
            .map(|p| p.instance_id)
            .collect();
        stale.into_iter().flat_map(|id| self.remove(id)).collect()
    }

    /// Forgets a peer the transport could not use.  It is rediscovered on its
    /// next announcement.
    pub fn invalidate(&mut self, instance_id: Uuid) -> Vec<DiscoveryEvent> {
        self.remove(instance_id)
    }

    fn remove(&mut self, instance_id: Uuid) -> Vec<DiscoveryEvent> {
        let Some(pos) = self.peers.iter().position(|p| p.instance_id == instance_id) else {
            return Vec::new();
        };
        let mut peer = self.peers.remove(pos);
        if self.active != Some(instance_id) {
            return Vec::new();
        }

        peer.liveness = PeerLiveness::Lost;
        info!("peer lost: {} at {}", peer.name, peer.addr);
        let mut events = vec![DiscoveryEvent::PeerLost(peer)];
        self.active = self.peers.first().map(|p| p.instance_id);
        if let Some(next) = self.peers.first() {
            info!("promoting candidate {} at {}", next.name, next.addr);
            events.push(DiscoveryEvent::PeerFound(next.clone()));
        }
        events
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ServiceState {
    state: DiscoveryState,
    advertised: Option<(ServiceIdentity, u16)>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    bound_port: Option<u16>,
    invalidations: Option<mpsc::UnboundedSender<Uuid>>,
}

/// Advertises or browses for a LanScope service on the LAN.
#[derive(Debug)]
pub struct DiscoveryService {
    config: DiscoveryConfig,
    inner: Mutex<ServiceState>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ServiceState {
                state: DiscoveryState::Idle,
                advertised: None,
                shutdown: None,
                task: None,
                bound_port: None,
                invalidations: None,
            }),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.lock().state
    }

    /// The UDP port the browse loop is bound to.
    pub fn bound_port(&self) -> Option<u16> {
        self.lock().bound_port
    }

    /// Starts broadcasting `identity` with TCP `port`.
    ///
    /// Calling it again with the same identity and port is a no-op.  A
    /// different identity or port replaces the running announcer.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::RoleConflict`] while browsing,
    /// [`DiscoveryError::Stopped`] after `stop`, or a bind failure.
    pub async fn start_advertising(
        &self,
        identity: ServiceIdentity,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        {
            let inner = self.lock();
            match inner.state {
                DiscoveryState::Browsing => {
                    return Err(DiscoveryError::RoleConflict {
                        current: DiscoveryState::Browsing,
                    })
                }
                DiscoveryState::Stopped => return Err(DiscoveryError::Stopped),
                DiscoveryState::Advertising
                    if inner.advertised.as_ref() == Some(&(identity.clone(), port)) =>
                {
                    return Ok(())
                }
                _ => {}
            }
        }

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| DiscoveryError::BindFailed {
                addr: bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;

        let announcement = ServiceAnnouncement {
            kind: AnnounceKind::Announce,
            instance_id: Uuid::new_v4(),
            port,
            service_type: identity.service_type.clone(),
            domain: identity.domain.clone(),
            name: identity.name.clone(),
        };
        let dest = SocketAddr::new(self.config.broadcast_addr, self.config.discovery_port);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(advertise_loop(
            socket,
            dest,
            announcement,
            self.config.announce_interval,
            shutdown_rx,
        ));

        let mut inner = self.lock();
        if let Some(previous) = inner.shutdown.replace(shutdown_tx) {
            let _ = previous.send(true);
        }
        inner.task = Some(task);
        inner.state = DiscoveryState::Advertising;
        info!(
            "advertising {} ({}{}) on port {port} to {dest}",
            identity.name, identity.service_type, identity.domain
        );
        inner.advertised = Some((identity, port));
        Ok(())
    }

    /// Starts watching for peers advertising `service_type` in `domain`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::RoleConflict`] if already advertising or browsing,
    /// [`DiscoveryError::Stopped`] after `stop`, or a bind failure.
    pub async fn start_browsing(
        &self,
        service_type: &str,
        domain: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        {
            let inner = self.lock();
            match inner.state {
                DiscoveryState::Idle => {}
                DiscoveryState::Stopped => return Err(DiscoveryError::Stopped),
                current => return Err(DiscoveryError::RoleConflict { current }),
            }
        }

        let bind_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.discovery_port,
        );
        let socket = bind_shared(bind_addr).map_err(|source| DiscoveryError::BindFailed {
            addr: bind_addr,
            source,
        })?;
        let port = socket.local_addr()?.port();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (invalidate_tx, invalidate_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let table = PeerTable::new(service_type, domain, self.config.peer_ttl);
        let sweep_every = (self.config.peer_ttl / 4).max(Duration::from_millis(50));
        let task = tokio::spawn(browse_loop(
            socket,
            table,
            sweep_every,
            event_tx,
            invalidate_rx,
            shutdown_rx,
        ));

        let mut inner = self.lock();
        inner.state = DiscoveryState::Browsing;
        inner.shutdown = Some(shutdown_tx);
        inner.task = Some(task);
        inner.bound_port = Some(port);
        inner.invalidations = Some(invalidate_tx);
        info!("browsing for {service_type}{domain} on UDP port {port}");
        Ok(event_rx)
    }

    /// Marks a peer as unusable.  If it was active a `PeerLost` follows and
    /// the next candidate (if any) is promoted.  No-op unless browsing.
    pub fn invalidate_peer(&self, instance_id: Uuid) {
        if let Some(tx) = self.lock().invalidations.as_ref() {
            let _ = tx.send(instance_id);
        }
    }

    /// Stops the running loop without waiting for it.  An advertiser sends
    /// its goodbye on the way out.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.state == DiscoveryState::Stopped {
            return;
        }
        if let Some(shutdown) = inner.shutdown.take() {
            let _ = shutdown.send(true);
        }
        // The loop exits on its own; dropping the handle detaches it.
        inner.task = None;
        inner.invalidations = None;
        inner.advertised = None;
        inner.state = DiscoveryState::Stopped;
        info!("discovery stopped");
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Loops ─────────────────────────────────────────────────────────────────────

async fn advertise_loop(
    socket: UdpSocket,
    dest: SocketAddr,
    announcement: ServiceAnnouncement,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let hello = encode_announcement(&announcement);
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&hello, dest).await {
                    warn!("failed to send announcement to {dest}: {e}");
                }
            }
        }
    }

    let goodbye = encode_announcement(&ServiceAnnouncement {
        kind: AnnounceKind::Goodbye,
        ..announcement
    });
    if let Err(e) = socket.send_to(&goodbye, dest).await {
        debug!("failed to send goodbye to {dest}: {e}");
    }
    info!("advertiser stopped");
}

async fn browse_loop(
    socket: UdpSocket,
    mut table: PeerTable,
    sweep_every: Duration,
    events: mpsc::Sender<DiscoveryEvent>,
    mut invalidations: mpsc::UnboundedReceiver<Uuid>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut sweep = time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let batch = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => match decode_announcement(&buf[..len]) {
                    Ok(announcement) => table.observe(&announcement, src, Instant::now()),
                    Err(e) => {
                        debug!("ignoring datagram from {src}: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    warn!("discovery recv error: {e}");
                    continue;
                }
            },
            Some(id) = invalidations.recv() => table.invalidate(id),
            _ = sweep.tick() => table.expire(Instant::now()),
        };

        for event in batch {
            if events.send(event).await.is_err() {
                info!("discovery event receiver dropped; browse loop exiting");
                return;
            }
        }
    }
    info!("browser stopped");
}

/// Binds a UDP socket that other processes on this host may bind as well.
fn bind_shared(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
