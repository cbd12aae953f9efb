//! HTTP/1.x message model: headers, request/response value objects, the
//! incremental parser, and the serializer (design §4.2).

pub mod header;
pub mod message;
pub mod parser;
pub mod serializer;

pub use header::{Header, HeaderList};
pub use message::{Method, PayloadKind, Proto, Request, Response};
pub use parser::{ParseOutcome, RequestParser, ResponseParser};
pub use serializer::{serialize_request, serialize_response};
