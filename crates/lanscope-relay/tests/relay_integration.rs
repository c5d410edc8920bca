//! End-to-end tests: hooks → tracker → codec → discovery → transport → a
//! TCP listener standing in for the viewer, all on loopback.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use lanscope_core::{decode_packet, FrameDecoder, RequestPacket, TaskHandle};
use lanscope_relay::{
    ConnectionStatus, DiscoveryConfig, DiscoveryService, RelayConfig, RelayController,
    ServiceIdentity, SessionEvent,
};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;

const TIMEOUT: Duration = Duration::from_secs(10);

fn relay_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.discovery.discovery_port = 0;
    config.discovery.peer_ttl_ms = 2_000;
    config.project.project_name = "Demo".to_string();
    config.device.device_name = "test-device".to_string();
    config
}

/// Advertises `viewer_port` straight at the relay's browse socket.
async fn advertise_viewer(relay: &RelayController, viewer_port: u16) -> DiscoveryService {
    let config = relay_config();
    let advertiser = DiscoveryService::new(DiscoveryConfig {
        discovery_port: relay.discovery_port().expect("relay is browsing"),
        broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        announce_interval: Duration::from_millis(50),
        ..Default::default()
    });
    advertiser
        .start_advertising(
            ServiceIdentity {
                name: "test-viewer".to_string(),
                service_type: config.discovery.service_type,
                domain: config.discovery.domain,
            },
            viewer_port,
        )
        .await
        .expect("advertise");
    advertiser
}

async fn read_packet(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> RequestPacket {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next_frame().expect("well-formed frame") {
            return decode_packet(&frame).expect("valid packet");
        }
        let n = stream.read(&mut buf).await.expect("read");
        assert!(n > 0, "relay closed the connection");
        decoder.push(&buf[..n]);
    }
}

async fn wait_for_status(rx: &mut broadcast::Receiver<SessionEvent>, want: ConnectionStatus) {
    loop {
        if let Ok(SessionEvent::StatusChanged { status, .. }) = rx.recv().await {
            if status == want {
                return;
            }
        }
    }
}

fn capture_request(relay: &RelayController, task: u64, url: &str, body: &[u8]) {
    let adapter = relay.task_adapter().expect("task hooks enabled");
    let task = TaskHandle(task);
    adapter.task_did_start(
        task,
        lanscope_core::CapturedRequest::new("GET", url).with_header("Accept", "application/json"),
    );
    adapter.task_did_receive_response(task, 200, Default::default());
    adapter.task_did_receive_data(task, body.to_vec());
    adapter.task_did_complete(task, None);
}

#[tokio::test]
async fn test_captured_request_reaches_discovered_viewer() {
    time::timeout(TIMEOUT, async {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let viewer_port = listener.local_addr().expect("addr").port();
        let relay = RelayController::start(relay_config()).await.expect("relay starts");
        let mut status = relay.subscribe_status();
        let _advertiser = advertise_viewer(&relay, viewer_port).await;

        // Act
        let (mut stream, _) = listener.accept().await.expect("relay connects");
        wait_for_status(&mut status, ConnectionStatus::Connected).await;
        capture_request(&relay, 1, "https://api.example.com/users", br#"{"users":[]}"#);
        let packet = read_packet(&mut stream, &mut FrameDecoder::default()).await;

        // Assert
        assert_eq!(packet.url, "https://api.example.com/users");
        assert_eq!(packet.request_method, "GET");
        assert_eq!(packet.status_code.as_deref(), Some("200"));
        assert_eq!(packet.response_data.as_deref(), Some(&br#"{"users":[]}"#[..]));
        assert_eq!(packet.project_descriptor.project_name, "Demo");
        assert_eq!(packet.device_descriptor.device_name, "test-device");
        assert!(packet.originating_address.starts_with("127.0.0.1:"));
        assert_eq!(relay.stats().packets_relayed, 1);
        relay.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_packets_captured_before_discovery_are_flushed_in_order() {
    time::timeout(TIMEOUT, async {
        // Arrange
        let relay = RelayController::start(relay_config()).await.expect("relay starts");
        capture_request(&relay, 1, "https://example.com/first", b"1");
        capture_request(&relay, 2, "https://example.com/second", b"2");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let viewer_port = listener.local_addr().expect("addr").port();

        // Act
        let _advertiser = advertise_viewer(&relay, viewer_port).await;
        let (mut stream, _) = listener.accept().await.expect("relay connects");
        let mut decoder = FrameDecoder::default();
        let first = read_packet(&mut stream, &mut decoder).await;
        let second = read_packet(&mut stream, &mut decoder).await;

        // Assert
        assert_eq!(first.url, "https://example.com/first");
        assert_eq!(second.url, "https://example.com/second");
        relay.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_relay_reconnects_after_viewer_drops_connection() {
    time::timeout(TIMEOUT, async {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let viewer_port = listener.local_addr().expect("addr").port();
        let relay = RelayController::start(relay_config()).await.expect("relay starts");
        let mut status = relay.subscribe_status();
        let _advertiser = advertise_viewer(&relay, viewer_port).await;
        let (first, _) = listener.accept().await.expect("first connection");
        wait_for_status(&mut status, ConnectionStatus::Connected).await;

        // Act
        drop(first);
        wait_for_status(&mut status, ConnectionStatus::NotConnected).await;
        let (mut second, _) = listener.accept().await.expect("relay reconnects");
        capture_request(&relay, 7, "https://example.com/after", b"ok");
        let packet = read_packet(&mut second, &mut FrameDecoder::default()).await;

        // Assert
        assert_eq!(packet.url, "https://example.com/after");
        relay.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_disabled_hooks_have_no_adapter() {
    let mut config = relay_config();
    config.capture.enable_task_hooks = false;

    let relay = RelayController::start(config).await.expect("relay starts");

    assert!(relay.task_adapter().is_none());
    assert!(relay.delegate_adapter().is_some());
    assert_eq!(relay.status(), ConnectionStatus::NotConnected);
    relay.shutdown();
}

#[tokio::test]
async fn test_failed_request_is_relayed_with_error() {
    time::timeout(TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let viewer_port = listener.local_addr().expect("addr").port();
        let relay = RelayController::start(relay_config()).await.expect("relay starts");
        let _advertiser = advertise_viewer(&relay, viewer_port).await;
        let (mut stream, _) = listener.accept().await.expect("relay connects");

        let adapter = relay.delegate_adapter().expect("delegate hooks enabled");
        let conn = lanscope_core::ConnectionHandle(9);
        adapter.connection_will_start(
            conn,
            lanscope_core::CapturedRequest::new("POST", "https://example.com/upload")
                .with_body(b"payload".to_vec()),
        );
        adapter.connection_did_fail(conn, "The network connection was lost.");
        let packet = read_packet(&mut stream, &mut FrameDecoder::default()).await;

        assert_eq!(packet.request_method, "POST");
        assert_eq!(packet.request_body, b"payload");
        assert_eq!(packet.error.as_deref(), Some("The network connection was lost."));
        assert!(packet.response_data.is_none());
        relay.shutdown();
    })
    .await
    .expect("test timed out");
}
