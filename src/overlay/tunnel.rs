//! `TunnelActor` (design §4.8): the ingress-side bridge for a `CONNECT`
//! tunnel, owning the real TCP socket to the external target.
//!
//! Unlike an ordinary request/response body, a tunnel has two independent
//! directions alive at once. This is built from the same `Payload` +
//! `PayloadSender`/`PayloadReceiver` primitives the egress side already
//! uses for request/response bodies, just wired in both directions under
//! one shared `TransferId`: this node answers `get_next_part` pulls for
//! bytes it read off the target socket, and issues its own `get_next_part`
//! pulls to drain bytes the egress side read off the client socket.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::overlay::ids::{ShortId, TransferId};
use crate::overlay::payload_receiver;
use crate::overlay::payload_sender;
use crate::overlay::transport::OverlayTransport;
use crate::payload::Payload;
use crate::ratelimit::RateLimiter;

const SOCKET_READ_CHUNK: usize = 16 * 1024;

pub fn spawn(
    socket: TcpStream,
    transfer_id: TransferId,
    local_id: ShortId,
    peer_id: ShortId,
    transport: Arc<dyn OverlayTransport>,
    limiter: Option<Arc<RateLimiter>>,
) {
    tokio::spawn(run(socket, transfer_id, local_id, peer_id, transport, limiter));
}

async fn run(socket: TcpStream, transfer_id: TransferId, local_id: ShortId, peer_id: ShortId, transport: Arc<dyn OverlayTransport>, limiter: Option<Arc<RateLimiter>>) {
    let (mut read_half, mut write_half) = socket.into_split();

    let to_peer = Arc::new(Payload::new_tunnel());
    payload_sender::spawn_with_limiter(to_peer.clone(), transfer_id, local_id, transport.clone(), limiter);

    let from_peer = Arc::new(Payload::new_tunnel());
    payload_receiver::spawn(from_peer.clone(), transfer_id, peer_id, transport, true);

    let reader = {
        let to_peer = to_peer.clone();
        async move {
            let mut buf = vec![0u8; SOCKET_READ_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        to_peer.complete();
                        return;
                    }
                    Ok(n) => to_peer.push_bytes(&buf[..n]),
                    Err(e) => {
                        debug!(?transfer_id, error = %e, "tunnel target read error");
                        to_peer.mark_error();
                        return;
                    }
                }
            }
        }
    };

    let writer = async move {
        loop {
            if from_peer.ready_bytes() == 0 {
                if from_peer.is_completed() || from_peer.is_error() {
                    break;
                }
                from_peer.wait_ready_or_done(1).await;
                continue;
            }
            let chunk = from_peer.pop_slice(SOCKET_READ_CHUNK);
            if !chunk.is_empty() {
                if let Err(e) = write_half.write_all(&chunk).await {
                    warn!(?transfer_id, error = %e, "tunnel target write error");
                    from_peer.mark_error();
                    break;
                }
            }
            if from_peer.is_written() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::join!(reader, writer);
    debug!(?transfer_id, "tunnel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::transport::LoopbackTransport;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn echoes_bytes_through_a_real_target_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let transport: Arc<dyn OverlayTransport> = Arc::new(LoopbackTransport::new());
        let ingress_id = ShortId::random();
        let egress_id = ShortId::random();
        let transfer_id = TransferId::random();

        let target_sock = TcpStream::connect(target_addr).await.unwrap();
        spawn(target_sock, transfer_id, ingress_id, egress_id, transport.clone(), None);

        let client_side = Arc::new(Payload::new_tunnel());
        payload_sender::spawn(client_side.clone(), transfer_id, egress_id, transport.clone());
        client_side.push_bytes(b"ping!");

        let server_side = Arc::new(Payload::new_tunnel());
        payload_receiver::spawn(server_side.clone(), transfer_id, ingress_id, transport, true);

        tokio::time::timeout(std::time::Duration::from_secs(2), server_side.wait_ready_or_done(5))
            .await
            .unwrap();
        assert_eq!(&server_side.pop_slice(5)[..], b"ping!");
    }
}
