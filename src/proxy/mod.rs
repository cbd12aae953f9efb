//! Proxy composition: wires the generic connection/overlay primitives into
//! the two concrete modes this binary runs in (design §10 CLI surface).

pub mod egress;

pub use egress::{host_qualifies, EgressHandler, HostTable};
