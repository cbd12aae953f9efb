//! `PayloadReceiver` (design §4.7): the consuming half of a transfer —
//! issues `get_next_part` queries against the peer's `PayloadSender` and
//! feeds the answers into a local `Payload` that some other part of the
//! proxy (the HTTP connection machinery, or a local upstream client) reads
//! from.
//!
//! Pacing follows `Payload`'s own high watermark: the receiver only issues
//! its next query once consumption has brought `ready_bytes` back under
//! `high_watermark`, so a slow consumer naturally throttles how fast bytes
//! are pulled across the overlay.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::overlay::ids::{ShortId, TransferId};
use crate::overlay::transport::OverlayTransport;
use crate::overlay::wire::{self, GetNextPayloadPart, PayloadPartWire};
use crate::payload::Payload;

/// Ordinary transfers time out a single query after 15s; tunnel transfers
/// (answers may legitimately wait on coalescing + a slow socket) get 60s.
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);
const QUERY_TIMEOUT_TUNNEL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_CHUNK_SIZE: i32 = 64 * 1024;

pub fn spawn(
    payload: Arc<Payload>,
    transfer_id: TransferId,
    peer_id: ShortId,
    transport: Arc<dyn OverlayTransport>,
    is_tunnel: bool,
) {
    tokio::spawn(run(payload, transfer_id, peer_id, transport, is_tunnel));
}

async fn run(payload: Arc<Payload>, transfer_id: TransferId, peer_id: ShortId, transport: Arc<dyn OverlayTransport>, is_tunnel: bool) {
    let timeout = if is_tunnel { QUERY_TIMEOUT_TUNNEL } else { QUERY_TIMEOUT };
    let mut seqno: i32 = 0;

    loop {
        while payload.ready_bytes() >= payload.high_watermark && !payload.is_completed() && !payload.is_error() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if payload.is_completed() || payload.is_error() {
            return;
        }

        match fetch_part(&transport, peer_id, transfer_id, seqno, timeout).await {
            Ok(part) => {
                if !part.data.is_empty() {
                    payload.push_bytes(&part.data);
                }
                for wh in part.trailers {
                    if let Err(e) = payload.push_trailer(wh.into_header()) {
                        warn!(?transfer_id, error = %e, "trailer rejected");
                        payload.mark_error();
                        return;
                    }
                }
                seqno += 1;
                if part.last {
                    payload.complete();
                    return;
                }
            }
            Err(e) => {
                debug!(?transfer_id, error = %e, "get_next_part failed, closing transfer");
                payload.mark_error();
                return;
            }
        }
    }
}

async fn fetch_part(
    transport: &Arc<dyn OverlayTransport>,
    peer_id: ShortId,
    transfer_id: TransferId,
    seqno: i32,
    timeout: Duration,
) -> ProxyResult<PayloadPartWire> {
    let request = GetNextPayloadPart { id: transfer_id, seqno, max_chunk_size: DEFAULT_MAX_CHUNK_SIZE };
    let mut data = wire::query_prefix(transfer_id);
    data.extend(wire::encode(&request));
    let reply = transport.query(peer_id, data, timeout).await?;
    wire::decode(&reply).map_err(|_| ProxyError::Parse("malformed payload part".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::PayloadKind;
    use crate::overlay::payload_sender;
    use crate::overlay::transport::LoopbackTransport;

    #[tokio::test]
    async fn pulls_full_body_from_sender() {
        let source = Arc::new(Payload::new(PayloadKind::Eof));
        source.push_bytes(b"overlay says hi");
        source.complete();

        let transport: Arc<dyn OverlayTransport> = Arc::new(LoopbackTransport::new());
        let transfer_id = TransferId::random();
        let sender_id = ShortId::random();
        payload_sender::spawn(source, transfer_id, sender_id, transport.clone());

        let dest = Arc::new(Payload::new(PayloadKind::Eof));
        spawn(dest.clone(), transfer_id, sender_id, transport, false);

        dest.wait_completed_or_error().await;
        assert!(!dest.is_error());
        assert_eq!(dest.ready_bytes(), "overlay says hi".len());
        assert_eq!(&dest.pop_slice(64)[..], b"overlay says hi");
    }
}
