//! Egress composition (design §4.6): the HTTP-facing side of the proxy —
//! host-qualification filtering, the normalize-then-resolve pipeline, and
//! a small per-host bookkeeping table mirroring the original's startup
//! grace / idle close timers (`http-proxy.cpp`'s `HttpRemote::set_ready`),
//! adapted to RDP's stateless request/reply transport: "readiness" here
//! means "has a cached resolution", not "has a live socket".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::{RequestHandler, RequestReply};
use crate::http::Request;
use crate::overlay::name_cache::normalize_host;
use crate::overlay::{NameCache, RequestSender};
use crate::payload::Payload;

/// Grace period after first seeing a host before idle-reaping kicks in,
/// matching the original's 10s `set_ready` startup timer.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(10);
/// Idle timeout after the last forwarded request, matching the original's
/// 60s `close_at_` timer.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const REAP_INTERVAL: Duration = Duration::from_secs(30);

struct HostEntry {
    created_at: Instant,
    last_used: std::sync::Mutex<Instant>,
}

/// Tracks per-host activity purely for idle reaping; the name cache (not
/// this table) is the source of truth for resolved `ShortId`s.
#[derive(Clone)]
pub struct HostTable {
    entries: Arc<DashMap<String, HostEntry>>,
    startup_grace: Duration,
    idle_timeout: Duration,
}

impl HostTable {
    pub fn new() -> Self {
        Self::with_timers(DEFAULT_STARTUP_GRACE, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_timers(startup_grace: Duration, idle_timeout: Duration) -> Self {
        let table = Self { entries: Arc::new(DashMap::new()), startup_grace, idle_timeout };
        let reaper = table.clone();
        tokio::spawn(async move { reaper.reap_loop().await });
        table
    }

    fn touch(&self, host: &str) {
        match self.entries.get(host) {
            Some(entry) => *entry.last_used.lock().unwrap() = Instant::now(),
            None => {
                let now = Instant::now();
                self.entries.insert(
                    host.to_string(),
                    HostEntry { created_at: now, last_used: std::sync::Mutex::new(now) },
                );
            }
        }
    }

    async fn reap_loop(&self) {
        loop {
            tokio::time::sleep(REAP_INTERVAL).await;
            self.entries.retain(|_, entry| {
                let idle = entry.last_used.lock().unwrap().elapsed();
                entry.created_at.elapsed() < self.startup_grace || idle < self.idle_timeout
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for HostTable {
    fn default() -> Self {
        Self::new()
    }
}

/// §11 host-qualification predicate: `.ton`/`.adnl` hosts always qualify;
/// everything else only qualifies when `proxy_all` is set.
pub fn host_qualifies(host: &str, proxy_all: bool) -> bool {
    proxy_all || host.ends_with(".ton") || host.ends_with(".adnl")
}

pub struct EgressHandler {
    pub sender: Arc<RequestSender>,
    pub names: Arc<NameCache>,
    pub hosts: HostTable,
    pub proxy_all: bool,
    pub requests_forwarded: AtomicU64,
    pub requests_rejected: AtomicU64,
}

impl EgressHandler {
    pub fn new(sender: Arc<RequestSender>, names: Arc<NameCache>, proxy_all: bool) -> Arc<Self> {
        Self::with_host_table(sender, names, proxy_all, HostTable::new())
    }

    pub fn with_host_table(sender: Arc<RequestSender>, names: Arc<NameCache>, proxy_all: bool, hosts: HostTable) -> Arc<Self> {
        Arc::new(Self {
            sender,
            names,
            hosts,
            proxy_all,
            requests_forwarded: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
        })
    }
}

impl RequestHandler for EgressHandler {
    fn handle_request(&self, req: Request, request_body: Arc<Payload>, promise: oneshot::Sender<RequestReply>) {
        let Some(raw_host) = req.host() else {
            self.requests_rejected.fetch_add(1, Ordering::Relaxed);
            let _ = promise.send(Err(crate::error::ProxyError::Parse("missing Host header".into())));
            return;
        };
        let host = normalize_host(&raw_host);
        if !host_qualifies(&host, self.proxy_all) {
            self.requests_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(%host, "host does not qualify for overlay routing");
            let _ = promise.send(Err(crate::error::ProxyError::UpstreamUnavailable(format!("{host} is not proxied"))));
            return;
        }

        self.hosts.touch(&host);
        self.requests_forwarded.fetch_add(1, Ordering::Relaxed);

        let sender = self.sender.clone();
        let names = self.names.clone();
        tokio::spawn(async move {
            let result = forward(&sender, &names, &host, req, request_body).await;
            let _ = promise.send(result);
        });
    }
}

async fn forward(sender: &RequestSender, names: &NameCache, host: &str, req: Request, request_body: Arc<Payload>) -> RequestReply {
    let dst = names.resolve(host).await?;
    sender.send(req, request_body, dst).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_follows_ton_adnl_and_proxy_all() {
        assert!(host_qualifies("example.ton", false));
        assert!(host_qualifies("abc.adnl", false));
        assert!(!host_qualifies("example.com", false));
        assert!(host_qualifies("example.com", true));
    }

    #[tokio::test]
    async fn rejects_non_qualifying_host_without_touching_overlay() {
        let transport: Arc<dyn crate::overlay::OverlayTransport> = Arc::new(crate::overlay::LoopbackTransport::new());
        let local_id = crate::overlay::ShortId::random();
        let sender = Arc::new(RequestSender::new(local_id, transport.clone()));
        struct AlwaysFails;
        impl crate::overlay::NameServiceClient for AlwaysFails {
            fn resolve(&self, _host: String) -> futures_util::future::BoxFuture<'static, crate::error::ProxyResult<crate::overlay::ShortId>> {
                Box::pin(async { Err(crate::error::ProxyError::UpstreamUnavailable("should not be called".into())) })
            }
        }
        let names = Arc::new(NameCache::new(Arc::new(AlwaysFails)));
        let handler = EgressHandler::new(sender, names, false);

        let mut headers = crate::http::HeaderList::new();
        headers.set("Host", b"example.com".to_vec());
        let req = Request::new(crate::http::Method::Get, b"/".to_vec(), crate::http::message::Proto::Http11, headers).unwrap();
        let body = Arc::new(Payload::new(crate::http::PayloadKind::Empty));
        let (tx, rx) = oneshot::channel();
        handler.handle_request(req, body, tx);
        let result = rx.await.unwrap();
        assert!(result.is_err());
        assert_eq!(handler.requests_rejected.load(Ordering::Relaxed), 1);
    }
}
