//! HTTP connection state machines (design §4.4): `inbound` (server-side,
//! many sequential requests) and `outbound` (client-side, one in-flight
//! request plus a FIFO of queued ones).

pub mod inbound;
pub mod outbound;

pub use inbound::{InboundConnection, RequestHandler, RequestReply};
pub use outbound::{spawn_outbound, OutboundConnection, OutboundHandle};

use tokio::time::Duration;

/// Connection-level framing unit, shared by both specializations.
pub const LOW_WATERMARK: usize = 16 * 1024;
pub const HIGH_WATERMARK: usize = 128 * 1024;
pub const CHUNK_SIZE: usize = 1024;
pub const MAX_REQUEST_BODY: u64 = 1 << 20;

pub const RECONNECT_JITTER_MIN: Duration = Duration::from_secs(10);
pub const RECONNECT_JITTER_MAX: Duration = Duration::from_secs(20);

pub fn reconnect_backoff() -> Duration {
    use rand::Rng;
    let millis = rand::thread_rng().gen_range(RECONNECT_JITTER_MIN.as_millis()..=RECONNECT_JITTER_MAX.as_millis());
    Duration::from_millis(millis as u64)
}
