//! The overlay bridge (design §4.7–§4.9): everything that turns an HTTP
//! request/response/tunnel on one side of the proxy into RDP-overlay
//! queries on the other.

pub mod ids;
pub mod name_cache;
pub mod payload_receiver;
pub mod payload_sender;
pub mod request_handler;
pub mod request_sender;
pub mod transport;
pub mod tunnel;
pub mod wire;

pub use ids::{Bits256, ShortId, TransferId};
pub use name_cache::{NameCache, UnavailableNameService};
pub use request_handler::{FixedUpstream, HostMapResolver, RequestHandler, UpstreamResolver};
pub use request_sender::{EgressRequestHandler, RequestSender};
pub use transport::{IncomingQuery, LoopbackTransport, NameServiceClient, OverlayTransport, QueryStream};
