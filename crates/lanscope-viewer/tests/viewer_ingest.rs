//! Listener + store integration tests on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lanscope_core::{
    encode_frame, encode_packet, DeviceDescriptor, HeaderMap, ProjectDescriptor, RequestPacket,
    DEFAULT_MAX_FRAME_LEN,
};
use lanscope_relay::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};
use lanscope_viewer::application::{handle_event, IngestOutcome, PacketStore};
use lanscope_viewer::domain::{DisconnectReason, ViewerConfig, ViewerEvent};
use lanscope_viewer::infrastructure::{bind_listener, run_listener, start_advertiser};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;

const TIMEOUT: Duration = Duration::from_secs(10);

fn packet(id: &str, url: &str) -> RequestPacket {
    RequestPacket {
        packet_id: id.to_string(),
        url: url.to_string(),
        request_method: "GET".to_string(),
        request_headers: HeaderMap::new(),
        request_body: Vec::new(),
        request_truncated: false,
        response_headers: Some(HeaderMap::new()),
        response_data: Some(b"{}".to_vec()),
        status_code: Some("200".to_string()),
        start_date: 10,
        end_date: 20,
        error: None,
        response_truncated: false,
        project_descriptor: ProjectDescriptor {
            project_name: "Demo".to_string(),
        },
        device_descriptor: DeviceDescriptor {
            device_id: "device-1".to_string(),
            device_name: "test".to_string(),
            device_description: "linux x86_64".to_string(),
        },
        protocol_version: "0.1.0".to_string(),
        originating_address: "127.0.0.1:40000".to_string(),
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(payload, DEFAULT_MAX_FRAME_LEN).expect("frame fits")
}

async fn start_listener() -> (SocketAddr, mpsc::Receiver<ViewerEvent>, Arc<AtomicBool>) {
    let listener = bind_listener("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::channel(64);
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(run_listener(
        listener,
        DEFAULT_MAX_FRAME_LEN,
        tx,
        Arc::clone(&running),
    ));
    (addr, rx, running)
}

async fn next_event(rx: &mut mpsc::Receiver<ViewerEvent>) -> ViewerEvent {
    time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("event within timeout")
        .expect("listener running")
}

#[tokio::test]
async fn test_fragmented_frames_are_stored_in_order() {
    // Arrange
    let (addr, mut rx, running) = start_listener().await;
    let mut relay = TcpStream::connect(addr).await.expect("connect");
    let mut bytes = frame(&encode_packet(&packet("a", "https://example.com/a")).expect("encode"));
    bytes.extend(frame(&encode_packet(&packet("b", "https://example.com/b")).expect("encode")));
    let mut store = PacketStore::new();

    // Act
    for chunk in bytes.chunks(7) {
        relay.write_all(chunk).await.expect("write");
    }
    for _ in 0..3 {
        let event = next_event(&mut rx).await;
        handle_event(&mut store, event);
    }

    // Assert
    let urls: Vec<_> = store
        .packets("Demo", "device-1")
        .iter()
        .map(|p| p.url.as_str())
        .collect();
    assert_eq!(urls, vec!["https://example.com/a", "https://example.com/b"]);
    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_corrupt_frame_is_dropped_and_connection_survives() {
    // Arrange
    let (addr, mut rx, running) = start_listener().await;
    let mut relay = TcpStream::connect(addr).await.expect("connect");
    let mut bytes = frame(b"{not json");
    bytes.extend(frame(&encode_packet(&packet("ok", "https://example.com/ok")).expect("encode")));

    // Act
    relay.write_all(&bytes).await.expect("write");
    let connected = next_event(&mut rx).await;
    let corrupt = next_event(&mut rx).await;
    let good = next_event(&mut rx).await;

    // Assert
    assert!(matches!(connected, ViewerEvent::Connected { .. }));
    assert!(matches!(corrupt, ViewerEvent::Corrupt { .. }));
    assert!(matches!(good, ViewerEvent::Packet { ref packet, .. } if packet.packet_id == "ok"));
    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_resent_packet_updates_instead_of_duplicating() {
    let (addr, mut rx, running) = start_listener().await;
    let mut store = PacketStore::new();

    for url in ["https://example.com/v1", "https://example.com/v2"] {
        let mut relay = TcpStream::connect(addr).await.expect("connect");
        relay
            .write_all(&frame(&encode_packet(&packet("same", url)).expect("encode")))
            .await
            .expect("write");
        drop(relay);
    }
    let mut outcomes = Vec::new();
    while outcomes.len() < 2 {
        if let Some(outcome) = handle_event(&mut store, next_event(&mut rx).await) {
            outcomes.push(outcome);
        }
    }

    assert_eq!(outcomes, vec![IngestOutcome::Inserted, IngestOutcome::Updated]);
    assert_eq!(store.len(), 1);
    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_oversized_frame_disconnects_relay() {
    let (addr, mut rx, running) = start_listener().await;
    let mut relay = TcpStream::connect(addr).await.expect("connect");

    let len = u32::try_from(DEFAULT_MAX_FRAME_LEN + 1).expect("fits in u32");
    relay.write_all(&len.to_be_bytes()).await.expect("write");
    let _connected = next_event(&mut rx).await;
    let closed = next_event(&mut rx).await;

    assert!(matches!(
        closed,
        ViewerEvent::Disconnected {
            reason: DisconnectReason::Oversized { .. },
            ..
        }
    ));
    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_advertiser_is_found_by_relay_browser() {
    // Arrange
    let config = ViewerConfig::default();
    let browser = DiscoveryService::new(DiscoveryConfig {
        discovery_port: 0,
        ..Default::default()
    });
    let mut peers = browser
        .start_browsing(&config.service_type, &config.domain)
        .await
        .expect("browse");
    let viewer = ViewerConfig {
        service_name: "desk-viewer".to_string(),
        discovery_port: browser.bound_port().expect("bound"),
        broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        announce_interval: Duration::from_millis(50),
        ..config
    };

    // Act
    let advertiser = start_advertiser(&viewer, 45678).await.expect("advertise");
    let event = time::timeout(TIMEOUT, peers.recv())
        .await
        .expect("peer within timeout")
        .expect("channel open");

    // Assert
    match event {
        DiscoveryEvent::PeerFound(peer) => {
            assert_eq!(peer.name, "desk-viewer");
            assert_eq!(peer.addr.port(), 45678);
        }
        other => panic!("expected PeerFound, got {other:?}"),
    }
    advertiser.stop();
    browser.stop();
}
