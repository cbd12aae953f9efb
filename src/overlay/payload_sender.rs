//! `PayloadSender` (design §4.7): answers `get_next_part` queries against a
//! `Payload` this node produces into — the overlay-facing half of a
//! request's body (egress: the HTTP request body; ingress: the HTTP
//! response body).
//!
//! One instance is spawned per transfer and lives exactly as long as the
//! subscription: it answers queries in strict sequence order and closes
//! itself the moment it has sent the `last` part, on a seqno mismatch, or
//! after sitting idle past its grace period.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::actor::Alarm;
use crate::http::message::PayloadKind;
use crate::overlay::ids::{ShortId, TransferId};
use crate::overlay::transport::OverlayTransport;
use crate::overlay::wire::{self, GetNextPayloadPart, PayloadPartWire};
use crate::payload::Payload;
use crate::ratelimit::RateLimiter;

/// Ordinary transfers close after 10s without a query; tunnel transfers
/// (which idle between bursts of interactive traffic) get 60s.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT_TUNNEL: Duration = Duration::from_secs(60);
/// Tunnel answers wait this long for more bytes to coalesce into one part
/// before replying, trading a little latency for fewer, fuller parts.
const TUNNEL_COALESCE_DELAY: Duration = Duration::from_millis(1);

pub fn spawn(
    payload: Arc<Payload>,
    transfer_id: TransferId,
    local_id: ShortId,
    transport: Arc<dyn OverlayTransport>,
) {
    spawn_with_limiter(payload, transfer_id, local_id, transport, None);
}

/// Same as [`spawn`], but paces each outgoing part through `limiter` (§4.10)
/// before replying — used when the egress/ingress side has a configured
/// `max_rate_bytes_per_sec`.
pub fn spawn_with_limiter(
    payload: Arc<Payload>,
    transfer_id: TransferId,
    local_id: ShortId,
    transport: Arc<dyn OverlayTransport>,
    limiter: Option<Arc<RateLimiter>>,
) {
    tokio::spawn(run(payload, transfer_id, local_id, transport, limiter));
}

async fn run(payload: Arc<Payload>, transfer_id: TransferId, local_id: ShortId, transport: Arc<dyn OverlayTransport>, limiter: Option<Arc<RateLimiter>>) {
    let is_tunnel = matches!(payload.kind(), PayloadKind::Tunnel);
    let idle_timeout = if is_tunnel { IDLE_TIMEOUT_TUNNEL } else { IDLE_TIMEOUT };
    let mut stream = transport.subscribe(local_id, wire::query_prefix(transfer_id));
    let mut next_seqno: i32 = 0;
    let mut alarm = Alarm::idle();
    alarm.arm_in(idle_timeout);

    loop {
        tokio::select! {
            biased;
            _ = alarm.wait(), if alarm.is_armed() => {
                debug!(?transfer_id, "payload sender idle timeout, closing");
                payload.mark_error();
                return;
            }
            incoming = stream.recv() => {
                let Some(incoming) = incoming else { return };
                alarm.arm_in(idle_timeout);

                let Some(body) = incoming.data.get(wire::QUERY_PREFIX_LEN..) else {
                    warn!(?transfer_id, "query shorter than prefix");
                    continue;
                };
                let request: GetNextPayloadPart = match wire::decode(body) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(?transfer_id, error = %e, "malformed get_next_part");
                        continue;
                    }
                };

                if request.seqno != next_seqno {
                    warn!(?transfer_id, expected = next_seqno, got = request.seqno, "seqno mismatch, closing transfer");
                    payload.mark_error();
                    return;
                }

                if payload.is_error() {
                    return;
                }

                if !(payload.is_completed() || payload.ready_bytes() >= payload.low_watermark) {
                    if is_tunnel && payload.ready_bytes() > 0 {
                        tokio::time::sleep(TUNNEL_COALESCE_DELAY).await;
                    } else {
                        payload.wait_ready_or_done(payload.low_watermark).await;
                    }
                    if payload.is_error() {
                        return;
                    }
                }

                let max_chunk_size = (request.max_chunk_size.max(0)) as usize;
                let (data, trailers, last) = payload.next_transfer_part(max_chunk_size);

                if let Some(limiter) = &limiter {
                    if limiter.enqueue(data.len() as u64, None).await.is_err() {
                        payload.mark_error();
                        return;
                    }
                }

                let part = PayloadPartWire {
                    data: data.to_vec(),
                    trailers: trailers.iter().map(wire::WireHeader::from).collect(),
                    last,
                };
                let _ = incoming.reply.send(wire::encode(&part));
                next_seqno += 1;

                if last {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::PayloadKind;
    use crate::overlay::transport::LoopbackTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn answers_single_part_in_sequence() {
        let payload = Arc::new(Payload::new(PayloadKind::Eof));
        payload.push_bytes(b"hello");
        payload.complete();

        let transport: Arc<dyn OverlayTransport> = Arc::new(LoopbackTransport::new());
        let transfer_id = TransferId::random();
        let local_id = ShortId::random();
        spawn(payload.clone(), transfer_id, local_id, transport.clone());

        let query = GetNextPayloadPart { id: transfer_id, seqno: 0, max_chunk_size: 64 * 1024 };
        let mut data = wire::query_prefix(transfer_id);
        data.extend(wire::encode(&query));
        let reply = transport.query(local_id, data, Duration::from_secs(1)).await.unwrap();
        let part: PayloadPartWire = wire::decode(&reply).unwrap();
        assert_eq!(part.data, b"hello");
        assert!(part.last);
    }

    #[tokio::test]
    async fn seqno_mismatch_closes_transfer() {
        let payload = Arc::new(Payload::new(PayloadKind::Eof));
        payload.push_bytes(b"hello");
        payload.complete();

        let transport: Arc<dyn OverlayTransport> = Arc::new(LoopbackTransport::new());
        let transfer_id = TransferId::random();
        let local_id = ShortId::random();
        spawn(payload.clone(), transfer_id, local_id, transport.clone());

        let query = GetNextPayloadPart { id: transfer_id, seqno: 5, max_chunk_size: 64 * 1024 };
        let mut data = wire::query_prefix(transfer_id);
        data.extend(wire::encode(&query));
        let result = transport.query(local_id, data, Duration::from_millis(200)).await;
        assert!(result.is_err());
        assert!(payload.is_error());
    }
}
