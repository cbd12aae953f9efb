//! `RequestHandler` (design §4.7, ingress direction): the standing
//! subscriber that turns incoming `http_request` overlay queries into
//! forwarded requests against a configured local/remote HTTP upstream, or
//! (for `CONNECT`) a fresh [`crate::overlay::tunnel`] bridge.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::http::message::{Method, PayloadKind, Proto, Request, Response};
use crate::overlay::ids::ShortId;
use crate::overlay::payload_receiver;
use crate::overlay::payload_sender;
use crate::overlay::tunnel;
use crate::overlay::transport::OverlayTransport;
use crate::overlay::wire::{self, HttpRequestWire, HttpResponseWire};
use crate::payload::Payload;
use crate::pool::SingleClient;
use crate::ratelimit::RateLimiter;

/// §10/§11: maps the `Host`/authority the client asked for onto a local
/// upstream address, the same shape as the CLI's repeated `-L local:port`
/// flags.
pub trait UpstreamResolver: Send + Sync + 'static {
    fn resolve(&self, authority: &str) -> Option<SocketAddr>;
}

/// A single fixed upstream, for the common single-backend deployment
/// (`-L 127.0.0.1:8080` with no further host-based routing).
pub struct FixedUpstream(pub SocketAddr);

impl UpstreamResolver for FixedUpstream {
    fn resolve(&self, _authority: &str) -> Option<SocketAddr> {
        Some(self.0)
    }
}

/// Host-keyed upstream table built from the CLI's repeated `-L`/`-R`
/// mappings (§10): each published host resolves to the first configured
/// port on its mapped IP.
pub struct HostMapResolver {
    by_host: std::collections::HashMap<String, SocketAddr>,
}

impl HostMapResolver {
    pub fn new(by_host: std::collections::HashMap<String, SocketAddr>) -> Self {
        Self { by_host }
    }
}

impl UpstreamResolver for HostMapResolver {
    fn resolve(&self, authority: &str) -> Option<SocketAddr> {
        let host = crate::overlay::name_cache::normalize_host(authority);
        self.by_host.get(&host).copied()
    }
}

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RequestHandler {
    pub local_id: ShortId,
    pub transport: Arc<dyn OverlayTransport>,
    pub upstream: Arc<dyn UpstreamResolver>,
    pub limiter: Option<Arc<RateLimiter>>,
    client: std::sync::Mutex<std::collections::HashMap<SocketAddr, Arc<SingleClient>>>,
}

impl RequestHandler {
    pub fn new(local_id: ShortId, transport: Arc<dyn OverlayTransport>, upstream: Arc<dyn UpstreamResolver>) -> Arc<Self> {
        Self::with_limiter(local_id, transport, upstream, None)
    }

    pub fn with_limiter(
        local_id: ShortId,
        transport: Arc<dyn OverlayTransport>,
        upstream: Arc<dyn UpstreamResolver>,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            transport,
            upstream,
            limiter,
            client: std::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Installs the standing `http_request` subscription and processes
    /// queries until the transport's stream ends.
    pub async fn run(self: Arc<Self>) {
        let mut stream = self.transport.subscribe(self.local_id, wire::request_prefix());
        while let Some(incoming) = stream.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.handle(incoming).await });
        }
    }

    async fn handle(&self, incoming: crate::overlay::transport::IncomingQuery) {
        let peer_id = incoming.src;
        let body = match incoming.data.get(4..) {
            Some(b) => b,
            None => return,
        };
        let wire_req: HttpRequestWire = match wire::decode(body) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed http_request");
                return;
            }
        };

        let Ok(method) = crate::http::message::Method::parse(&wire_req.method) else {
            let _ = incoming.reply.send(wire::encode(&canned_response_wire(400, "Bad Request")));
            return;
        };
        let Ok(proto) = Proto::parse(&wire_req.proto) else {
            let _ = incoming.reply.send(wire::encode(&canned_response_wire(400, "Bad Request")));
            return;
        };
        let headers = wire::wire_to_headers(wire_req.headers);
        let request = match Request::new(method, wire_req.url.into_bytes(), proto, headers) {
            Ok(r) => r,
            Err(_) => {
                let _ = incoming.reply.send(wire::encode(&canned_response_wire(400, "Bad Request")));
                return;
            }
        };

        if request.method == Method::Connect {
            self.handle_connect(request, wire_req.transfer_id, peer_id, incoming.reply).await;
            return;
        }

        let request_body = Arc::new(Payload::new(request.payload_kind()));
        if !matches!(request_body.kind(), PayloadKind::Empty) {
            payload_receiver::spawn(request_body.clone(), wire_req.transfer_id, peer_id, self.transport.clone(), false);
        }

        let Some(authority) = request.host() else {
            let _ = incoming.reply.send(wire::encode(&canned_response_wire(400, "Bad Request")));
            return;
        };
        let Some(addr) = self.upstream.resolve(&authority) else {
            let _ = incoming.reply.send(wire::encode(&canned_response_wire(502, "Bad Gateway")));
            return;
        };
        let client = self.client_for(addr);

        let (tx, rx) = oneshot::channel();
        client.send_request(request, request_body, Instant::now() + FORWARD_TIMEOUT, tx);
        let result = rx.await.unwrap_or(Err(ProxyError::Cancelled));
        let (response, response_body) = match result {
            Ok(pair) => pair,
            Err(e) => {
                let (code, reason) = e.canned_status();
                let _ = incoming.reply.send(wire::encode(&canned_response_wire(code, reason)));
                return;
            }
        };

        let wire_resp = HttpResponseWire {
            proto: response.proto.as_str().to_string(),
            code: response.code as u32,
            reason: response.reason.clone(),
            headers: wire::headers_to_wire(&response.headers),
            no_payload: !response.need_payload(),
        };
        let _ = incoming.reply.send(wire::encode(&wire_resp));

        if !matches!(response_body.kind(), PayloadKind::Empty) {
            payload_sender::spawn_with_limiter(response_body, wire_req.transfer_id, self.local_id, self.transport.clone(), self.limiter.clone());
        }
    }

    async fn handle_connect(&self, request: Request, transfer_id: crate::overlay::ids::TransferId, peer_id: ShortId, reply: oneshot::Sender<Vec<u8>>) {
        let target = String::from_utf8_lossy(&request.url).into_owned();
        let target = if target.contains(':') { target } else { format!("{target}:80") };
        match TcpStream::connect(&target).await {
            Ok(socket) => {
                let response = Response::connect_established();
                let wire_resp = HttpResponseWire {
                    proto: response.proto.as_str().to_string(),
                    code: response.code,
                    reason: response.reason.clone(),
                    headers: Vec::new(),
                    no_payload: true,
                };
                let _ = reply.send(wire::encode(&wire_resp));
                tunnel::spawn(socket, transfer_id, self.local_id, peer_id, self.transport.clone(), self.limiter.clone());
            }
            Err(e) => {
                debug!(%target, error = %e, "connect target unreachable");
                let _ = reply.send(wire::encode(&canned_response_wire(502, "Bad Gateway")));
            }
        }
    }

    fn client_for(&self, addr: SocketAddr) -> Arc<SingleClient> {
        let mut clients = self.client.lock().unwrap();
        clients.entry(addr).or_insert_with(|| SingleClient::new(addr)).clone()
    }
}

fn canned_response_wire(code: u16, reason: &str) -> HttpResponseWire {
    HttpResponseWire {
        proto: "HTTP/1.1".into(),
        code: code as u32,
        reason: reason.to_string(),
        headers: Vec::new(),
        no_payload: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::HeaderList;
    use crate::overlay::ids::TransferId;
    use crate::overlay::transport::LoopbackTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forwards_get_to_local_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET / HTTP/1.1"));
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await.unwrap();
        });

        let transport: Arc<dyn OverlayTransport> = Arc::new(LoopbackTransport::new());
        let ingress_id = ShortId::random();
        let handler = RequestHandler::new(ingress_id, transport.clone(), Arc::new(FixedUpstream(addr)));
        tokio::spawn(handler.run());
        tokio::task::yield_now().await;

        let mut headers = HeaderList::new();
        headers.set("Host", b"example.ton".to_vec());
        let wire_req = HttpRequestWire {
            transfer_id: TransferId::random(),
            method: "GET".into(),
            url: "/".into(),
            proto: "HTTP/1.1".into(),
            headers: wire::headers_to_wire(&headers),
        };
        let mut data = wire::request_prefix();
        data.extend(wire::encode(&wire_req));

        let reply = transport.query(ingress_id, data, Duration::from_secs(1)).await.unwrap();
        let resp: HttpResponseWire = wire::decode(&reply).unwrap();
        assert_eq!(resp.code, 200);
        assert!(!resp.no_payload);
    }
}
