//! Application layer for lanscope-viewer: what the viewer does with listener
//! events.

pub mod packet_store;

pub use packet_store::{DeviceLog, IngestOutcome, PacketStore};

use tracing::{debug, info, warn};

use crate::domain::{DisconnectReason, ViewerEvent};

/// Applies one listener event to `store`, logging it.
///
/// Returns the ingest outcome for packet events and `None` otherwise.
pub fn handle_event(store: &mut PacketStore, event: ViewerEvent) -> Option<IngestOutcome> {
    match event {
        ViewerEvent::Connected { peer } => {
            info!("relay connected from {peer}");
            None
        }
        ViewerEvent::Packet { peer, packet } => {
            let status = packet
                .error
                .clone()
                .or_else(|| packet.status_code.clone())
                .unwrap_or_else(|| "-".to_string());
            info!(
                "[{} / {}] {} {} → {status}",
                packet.project_descriptor.project_name,
                packet.device_descriptor.device_name,
                packet.request_method,
                packet.url
            );
            let outcome = store.ingest(*packet);
            if outcome == IngestOutcome::Updated {
                debug!("packet from {peer} replaced an earlier copy");
            }
            Some(outcome)
        }
        ViewerEvent::Corrupt { peer, error } => {
            warn!("dropping frame from {peer}: {error}");
            None
        }
        ViewerEvent::Disconnected { peer, reason } => {
            match reason {
                DisconnectReason::Closed => info!("relay at {peer} disconnected"),
                DisconnectReason::Oversized { len, max } => {
                    warn!("closed connection from {peer}: frame of {len} bytes exceeds {max}")
                }
                DisconnectReason::Io(e) => warn!("connection from {peer} failed: {e}"),
            }
            None
        }
    }
}
