//! Packet listener: TCP accept loop and per-relay frame decoding.
//!
//! Each accepted relay connection runs in its own task:
//!
//! 1. Bytes read from the socket are pushed into a [`FrameDecoder`].
//! 2. Every complete frame is decoded with [`decode_packet`].  A frame that
//!    does not decode becomes [`ViewerEvent::Corrupt`]; the connection stays
//!    open because the framing itself is still intact.
//! 3. A length header above `max_frame_len` means the stream can no longer be
//!    trusted, so the connection is closed.
//!
//! Events go to a single `mpsc` channel consumed by `main.rs`.  Shutdown is
//! driven by a shared `AtomicBool`, as in any long-running accept loop here:
//! the loop re-checks it every 200 ms.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use lanscope_core::{decode_packet, FrameDecoder, FrameError};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::domain::{DisconnectReason, ViewerEvent};

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const READ_BUF_LEN: usize = 8192;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind packet listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Binds the listener socket.
///
/// Separate from [`run_listener`] so the caller can learn the bound port
/// (for the advertiser) before the accept loop starts.
///
/// # Errors
///
/// [`ListenerError::Bind`] if the address is in use or not permitted.
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ListenerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind { addr, source })
}

/// Accepts relay connections until `running` is cleared.
pub async fn run_listener(
    listener: TcpListener,
    max_frame_len: usize,
    events: mpsc::Sender<ViewerEvent>,
    running: Arc<AtomicBool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("packet listener on {addr}");
    }

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let events = events.clone();
                tokio::spawn(async move {
                    handle_relay(stream, peer, max_frame_len, events).await;
                });
            }
            Ok(Err(e)) => {
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }
}

async fn handle_relay(
    mut stream: TcpStream,
    peer: SocketAddr,
    max_frame_len: usize,
    events: mpsc::Sender<ViewerEvent>,
) {
    if events.send(ViewerEvent::Connected { peer }).await.is_err() {
        return;
    }

    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut buf = vec![0u8; READ_BUF_LEN];
    let reason = 'conn: loop {
        loop {
            let event = match decoder.next_frame() {
                Ok(Some(frame)) => match decode_packet(&frame) {
                    Ok(packet) => ViewerEvent::Packet {
                        peer,
                        packet: Box::new(packet),
                    },
                    Err(error) => ViewerEvent::Corrupt { peer, error },
                },
                Ok(None) => break,
                Err(FrameError::Oversized { len, max }) => {
                    break 'conn DisconnectReason::Oversized { len, max };
                }
            };
            if events.send(event).await.is_err() {
                debug!("event receiver gone; dropping connection from {peer}");
                return;
            }
        }

        match stream.read(&mut buf).await {
            Ok(0) => break DisconnectReason::Closed,
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => break DisconnectReason::Io(e.to_string()),
        }
    };

    // Dropping the stream closes the socket.
    drop(stream);
    let _ = events.send(ViewerEvent::Disconnected { peer, reason }).await;
}
