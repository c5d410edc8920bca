//! In-memory store of received packets.
//!
//! Packets are grouped by project name, then by device id, and kept in
//! arrival order within a device.  A packet whose `packetId` was already seen
//! for that device replaces the earlier copy in place, so a relay that resends
//! after a reconnect never produces duplicates.
//!
//! ```text
//! PacketStore
//!   └── "Demo"                    (projectName)
//!         └── "3F2A…"             (deviceId)
//!               ├── packet 1
//!               └── packet 2
//! ```

use std::collections::{BTreeMap, HashMap};

use lanscope_core::{DeviceDescriptor, RequestPacket};

/// Result of [`PacketStore::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    /// A packet with the same id was replaced.
    Updated,
}

/// Packets from one device, in arrival order.
#[derive(Debug, Clone)]
pub struct DeviceLog {
    descriptor: DeviceDescriptor,
    packets: Vec<RequestPacket>,
    by_id: HashMap<String, usize>,
}

impl DeviceLog {
    fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            packets: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Latest descriptor the device reported.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn packets(&self) -> &[RequestPacket] {
        &self.packets
    }

    fn upsert(&mut self, packet: RequestPacket) -> IngestOutcome {
        self.descriptor = packet.device_descriptor.clone();
        match self.by_id.get(&packet.packet_id) {
            Some(&pos) => {
                self.packets[pos] = packet;
                IngestOutcome::Updated
            }
            None => {
                self.by_id.insert(packet.packet_id.clone(), self.packets.len());
                self.packets.push(packet);
                IngestOutcome::Inserted
            }
        }
    }
}

/// All packets received since startup.
#[derive(Debug, Clone, Default)]
pub struct PacketStore {
    projects: BTreeMap<String, BTreeMap<String, DeviceLog>>,
    total: usize,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, packet: RequestPacket) -> IngestOutcome {
        let log = self
            .projects
            .entry(packet.project_descriptor.project_name.clone())
            .or_default()
            .entry(packet.device_descriptor.device_id.clone())
            .or_insert_with(|| DeviceLog::new(packet.device_descriptor.clone()));

        let outcome = log.upsert(packet);
        if outcome == IngestOutcome::Inserted {
            self.total += 1;
        }
        outcome
    }

    /// Number of distinct packets stored.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Project names in sorted order.
    pub fn project_names(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    /// Devices that reported packets for `project`, sorted by device id.
    pub fn devices(&self, project: &str) -> impl Iterator<Item = &DeviceLog> {
        self.projects.get(project).into_iter().flat_map(|d| d.values())
    }

    /// Packets from one device; empty if the project or device is unknown.
    pub fn packets(&self, project: &str, device_id: &str) -> &[RequestPacket] {
        self.projects
            .get(project)
            .and_then(|devices| devices.get(device_id))
            .map(DeviceLog::packets)
            .unwrap_or(&[])
    }

    /// Looks a packet up by id across every project and device.
    pub fn get(&self, packet_id: &str) -> Option<&RequestPacket> {
        self.projects
            .values()
            .flat_map(|devices| devices.values())
            .find_map(|log| log.by_id.get(packet_id).map(|&pos| &log.packets[pos]))
    }

    pub fn clear(&mut self) {
        self.projects.clear();
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanscope_core::{HeaderMap, ProjectDescriptor};

    fn packet(id: &str, project: &str, device_id: &str, url: &str) -> RequestPacket {
        RequestPacket {
            packet_id: id.to_string(),
            url: url.to_string(),
            request_method: "GET".to_string(),
            request_headers: HeaderMap::new(),
            request_body: Vec::new(),
            request_truncated: false,
            response_headers: Some(HeaderMap::new()),
            response_data: Some(b"ok".to_vec()),
            status_code: Some("200".to_string()),
            start_date: 1_000,
            end_date: 2_000,
            error: None,
            response_truncated: false,
            project_descriptor: ProjectDescriptor {
                project_name: project.to_string(),
            },
            device_descriptor: DeviceDescriptor {
                device_id: device_id.to_string(),
                device_name: format!("{device_id}-name"),
                device_description: "test".to_string(),
            },
            protocol_version: "0.1.0".to_string(),
            originating_address: "127.0.0.1:50000".to_string(),
        }
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = PacketStore::new();
        assert!(store.is_empty());
        assert_eq!(store.project_count(), 0);
        assert!(store.packets("Demo", "dev").is_empty());
    }

    #[test]
    fn test_ingest_groups_by_project_then_device() {
        // Arrange
        let mut store = PacketStore::new();

        // Act
        store.ingest(packet("1", "Demo", "dev-a", "https://a/1"));
        store.ingest(packet("2", "Demo", "dev-b", "https://b/1"));
        store.ingest(packet("3", "Other", "dev-a", "https://a/2"));
        store.ingest(packet("4", "Demo", "dev-a", "https://a/3"));

        // Assert
        assert_eq!(store.len(), 4);
        assert_eq!(store.project_names().collect::<Vec<_>>(), vec!["Demo", "Other"]);
        let devices: Vec<_> = store
            .devices("Demo")
            .map(|d| d.descriptor().device_id.as_str())
            .collect();
        assert_eq!(devices, vec!["dev-a", "dev-b"]);
        let urls: Vec<_> = store
            .packets("Demo", "dev-a")
            .iter()
            .map(|p| p.url.as_str())
            .collect();
        assert_eq!(urls, vec!["https://a/1", "https://a/3"]);
    }

    #[test]
    fn test_same_packet_id_replaces_in_place() {
        // Arrange
        let mut store = PacketStore::new();
        store.ingest(packet("1", "Demo", "dev", "https://x/old"));
        store.ingest(packet("2", "Demo", "dev", "https://x/next"));

        // Act
        let outcome = store.ingest(packet("1", "Demo", "dev", "https://x/new"));

        // Assert
        assert_eq!(outcome, IngestOutcome::Updated);
        assert_eq!(store.len(), 2);
        let packets = store.packets("Demo", "dev");
        assert_eq!(packets[0].url, "https://x/new");
        assert_eq!(packets[1].url, "https://x/next");
    }

    #[test]
    fn test_descriptor_tracks_latest_device_name() {
        let mut store = PacketStore::new();
        store.ingest(packet("1", "Demo", "dev", "https://x/1"));
        let mut renamed = packet("2", "Demo", "dev", "https://x/2");
        renamed.device_descriptor.device_name = "renamed".to_string();

        store.ingest(renamed);

        let log = store.devices("Demo").next().expect("one device");
        assert_eq!(log.descriptor().device_name, "renamed");
    }

    #[test]
    fn test_get_finds_packet_in_any_project() {
        let mut store = PacketStore::new();
        store.ingest(packet("a", "P1", "d1", "https://one"));
        store.ingest(packet("b", "P2", "d2", "https://two"));

        assert_eq!(store.get("b").map(|p| p.url.as_str()), Some("https://two"));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_clear_empties_store() {
        let mut store = PacketStore::new();
        store.ingest(packet("a", "P1", "d1", "https://one"));

        store.clear();

        assert!(store.is_empty());
        assert_eq!(store.project_count(), 0);
    }
}
