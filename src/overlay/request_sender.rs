//! `RequestSender` (design §4.7, egress direction): turns one parsed HTTP
//! request arriving over a local TCP connection into an `http_request`
//! overlay query, and turns its reply back into the `(Response,
//! Arc<Payload>)` pair the HTTP connection machinery expects.
//!
//! A single `TransferId` is minted per request and reused for both legs:
//! the egress node answers `get_next_part` pulls against it while the
//! request body is still being read off the local socket, then switches
//! roles and issues `get_next_part` pulls against the very same id to pull
//! the response body back from the ingress node.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::connection::RequestReply;
use crate::error::{ProxyError, ProxyResult};
use crate::http::message::{Method, PayloadKind, Proto, Request, Response};
use crate::overlay::ids::{ShortId, TransferId};
use crate::overlay::payload_receiver;
use crate::overlay::payload_sender;
use crate::overlay::transport::OverlayTransport;
use crate::overlay::wire::{self, HttpRequestWire, HttpResponseWire};
use crate::ratelimit::RateLimiter;

/// `http_request` queries get a generous timeout of their own since the
/// ingress node may itself be waiting on a slow local upstream before it
/// can answer — grounded in the original's 30s `HttpRemote` query timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RequestSender {
    pub local_id: ShortId,
    pub transport: Arc<dyn OverlayTransport>,
    pub limiter: Option<Arc<RateLimiter>>,
}

impl RequestSender {
    pub fn new(local_id: ShortId, transport: Arc<dyn OverlayTransport>) -> Self {
        Self { local_id, transport, limiter: None }
    }

    pub fn with_limiter(local_id: ShortId, transport: Arc<dyn OverlayTransport>, limiter: Arc<RateLimiter>) -> Self {
        Self { local_id, transport, limiter: Some(limiter) }
    }

    pub async fn send(&self, request: Request, request_body: Arc<crate::payload::Payload>, dst: ShortId) -> ProxyResult<(Response, Arc<crate::payload::Payload>)> {
        let transfer_id = TransferId::random();
        let is_tunnel = request.method == Method::Connect;
        let request_keep_alive = request.keep_alive;

        if !matches!(request_body.kind(), PayloadKind::Empty) {
            payload_sender::spawn_with_limiter(request_body, transfer_id, self.local_id, self.transport.clone(), self.limiter.clone());
        }

        let wire_req = HttpRequestWire {
            transfer_id,
            method: request.method.as_str().to_string(),
            url: String::from_utf8_lossy(&request.url).into_owned(),
            proto: request.proto.as_str().to_string(),
            headers: wire::headers_to_wire(&request.headers),
        };
        let mut data = wire::request_prefix();
        data.extend(wire::encode(&wire_req));

        let reply = self.transport.query(dst, data, REQUEST_TIMEOUT).await?;
        let wire_resp: HttpResponseWire = wire::decode(&reply)?;

        let proto = Proto::parse(&wire_resp.proto)?;
        let headers = wire::wire_to_headers(wire_resp.headers);
        let mut response = Response::new(proto, wire_resp.code as u16, wire_resp.reason, headers, wire_resp.no_payload, is_tunnel, request_keep_alive)?;
        response.inject_chunked_if_unframed();

        let body_kind = response.payload_kind();
        let low = if is_tunnel { 1 } else { crate::payload::DEFAULT_LOW_WATERMARK };
        let response_body = Arc::new(crate::payload::Payload::with_watermarks(
            body_kind,
            low,
            crate::payload::DEFAULT_HIGH_WATERMARK,
            crate::payload::DEFAULT_CHUNK_SIZE,
        ));
        if matches!(body_kind, PayloadKind::Empty) {
            response_body.complete();
        } else {
            payload_receiver::spawn(response_body.clone(), transfer_id, dst, self.transport.clone(), is_tunnel);
        }

        Ok((response, response_body))
    }
}

/// Adapts [`RequestSender`] to the `connection::inbound::RequestHandler`
/// seam, resolving the destination host through a [`crate::overlay::name_cache::NameCache`]
/// before issuing the overlay request.
pub struct EgressRequestHandler {
    pub sender: Arc<RequestSender>,
    pub names: Arc<crate::overlay::name_cache::NameCache>,
}

impl crate::connection::RequestHandler for EgressRequestHandler {
    fn handle_request(&self, req: Request, request_body: Arc<crate::payload::Payload>, promise: oneshot::Sender<RequestReply>) {
        let sender = self.sender.clone();
        let names = self.names.clone();
        tokio::spawn(async move {
            let result = dispatch(&sender, &names, req, request_body).await;
            let _ = promise.send(result);
        });
    }
}

async fn dispatch(
    sender: &RequestSender,
    names: &crate::overlay::name_cache::NameCache,
    req: Request,
    request_body: Arc<crate::payload::Payload>,
) -> RequestReply {
    let host = req.host().ok_or_else(|| ProxyError::Parse("missing Host header".into()))?;
    let normalized = crate::overlay::name_cache::normalize_host(&host);
    let dst = names.resolve(&normalized).await?;
    sender.send(req, request_body, dst).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::HeaderList;
    use crate::overlay::transport::LoopbackTransport;
    use crate::overlay::wire::HttpResponseWire;
    use crate::payload::Payload;

    #[tokio::test]
    async fn send_round_trips_through_a_stub_ingress() {
        let transport: Arc<dyn OverlayTransport> = Arc::new(LoopbackTransport::new());
        let ingress_id = ShortId::random();
        let egress_id = ShortId::random();

        let mut requests = transport.subscribe(ingress_id, wire::request_prefix());
        let ingress_transport = transport.clone();
        tokio::spawn(async move {
            let incoming = requests.recv().await.unwrap();
            let body = &incoming.data[4..];
            let wire_req: HttpRequestWire = wire::decode(body).unwrap();
            assert_eq!(wire_req.method, "GET");

            let response_body = Arc::new(Payload::new(crate::http::message::PayloadKind::Eof));
            response_body.push_bytes(b"pong");
            response_body.complete();
            payload_sender::spawn(response_body, wire_req.transfer_id, ingress_id, ingress_transport);

            let wire_resp = HttpResponseWire {
                proto: "HTTP/1.1".into(),
                code: 200,
                reason: "OK".into(),
                headers: Vec::new(),
                no_payload: false,
            };
            incoming.reply.send(wire::encode(&wire_resp)).unwrap();
        });

        let sender = RequestSender::new(egress_id, transport);
        let request = Request::new(Method::Get, b"/ping".to_vec(), Proto::Http11, HeaderList::new()).unwrap();
        let body = Arc::new(Payload::new(crate::http::message::PayloadKind::Empty));
        body.complete();

        let (response, response_body) = sender.send(request, body, ingress_id).await.unwrap();
        assert_eq!(response.code, 200);
        response_body.wait_completed_or_error().await;
        assert_eq!(&response_body.pop_slice(16)[..], b"pong");
    }
}

