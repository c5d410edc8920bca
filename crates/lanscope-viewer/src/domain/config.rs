//! Viewer configuration.
//!
//! [`ViewerConfig`] is built once at startup from the CLI (see `main.rs`) and
//! passed by reference to the listener and the advertiser.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use lanscope_core::DEFAULT_MAX_FRAME_LEN;

/// TCP port relays connect to unless told otherwise.
pub const DEFAULT_LISTEN_PORT: u16 = 43435;

/// UDP port announcements are sent to.
pub const DEFAULT_DISCOVERY_PORT: u16 = 43434;

pub const DEFAULT_SERVICE_TYPE: &str = "_lanscope._tcp";
pub const DEFAULT_DOMAIN: &str = "local.";

/// All runtime configuration for the viewer.
///
/// # Example
///
/// ```rust
/// use lanscope_viewer::domain::ViewerConfig;
///
/// let cfg = ViewerConfig::default();
/// assert_eq!(cfg.listen_addr.port(), 43435);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerConfig {
    /// Where the packet listener binds.  Port `0` picks a free port; the
    /// advertiser always announces the port actually bound.
    pub listen_addr: SocketAddr,

    /// Instance name shown to relays in their logs.
    pub service_name: String,
    pub service_type: String,
    pub domain: String,

    pub discovery_port: u16,
    /// Destination of announcement datagrams.
    pub broadcast_addr: IpAddr,
    pub announce_interval: Duration,

    /// Frames with a larger length header close the connection.
    pub max_frame_len: usize,
}

impl Default for ViewerConfig {
    /// | Field             | Default               |
    /// |-------------------|-----------------------|
    /// | listen_addr       | `0.0.0.0:43435`       |
    /// | service_name      | `lanscope-viewer`     |
    /// | service_type      | `_lanscope._tcp`      |
    /// | domain            | `local.`              |
    /// | discovery_port    | `43434`               |
    /// | broadcast_addr    | `255.255.255.255`     |
    /// | announce_interval | 1 second              |
    /// | max_frame_len     | 32 MiB                |
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_LISTEN_PORT),
            service_name: "lanscope-viewer".to_string(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval: Duration::from_secs(1),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
