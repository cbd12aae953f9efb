//! Connection pool (design §4.5): a lazy single-connection client and a
//! multi-connection variant that opens one connection per request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{reconnect_backoff, spawn_outbound, OutboundHandle, RequestReply};
use crate::error::ProxyError;
use crate::http::Request;
use crate::payload::Payload;

/// Owns at most one outbound connection, reconnecting with uniform
/// 10-20s jitter on disconnect (§4.5, §5 liveness policies).
pub struct SingleClient {
    addr: SocketAddr,
    handle: std::sync::Mutex<Option<OutboundHandle>>,
    ready_notify: Notify,
}

impl SingleClient {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        let client = Arc::new(Self {
            addr,
            handle: std::sync::Mutex::new(None),
            ready_notify: Notify::new(),
        });
        let task_client = client.clone();
        tokio::spawn(async move { task_client.run_loop().await });
        client
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            match TcpStream::connect(self.addr).await {
                Ok(sock) => {
                    debug!(addr = %self.addr, "single-client connected");
                    let (handle, join) = spawn_outbound(sock);
                    *self.handle.lock().unwrap() = Some(handle);
                    self.ready_notify.notify_waiters();
                    let _ = join.await;
                    *self.handle.lock().unwrap() = None;
                    self.ready_notify.notify_waiters();
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "single-client connect failed");
                }
            }
            tokio::time::sleep(reconnect_backoff()).await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .map(OutboundHandle::is_ready)
            .unwrap_or(false)
    }

    /// Resolves the accompanying promise with `UpstreamUnavailable` when not
    /// ready, matching the design's "not ready" error string.
    pub fn send_request(
        &self,
        request: Request,
        body: Arc<Payload>,
        deadline: Instant,
        promise: oneshot::Sender<RequestReply>,
    ) {
        let ready_handle = self.handle.lock().unwrap().clone_handle_if_ready();
        match ready_handle {
            Some(handle) => {
                if handle.send_query(request, body, deadline, promise).is_err() {
                    // Caller already consumed `promise`; nothing further to
                    // report, the in-flight send lost its receiver.
                }
            }
            None => {
                let _ = promise.send(Err(ProxyError::UpstreamUnavailable("not ready".into())));
            }
        }
    }

    pub async fn wait_ready_change(&self) {
        self.ready_notify.notified().await;
    }
}

trait CloneHandleIfReady {
    fn clone_handle_if_ready(&self) -> Option<OutboundHandle>;
}

impl CloneHandleIfReady for Option<OutboundHandle> {
    fn clone_handle_if_ready(&self) -> Option<OutboundHandle> {
        self.as_ref().filter(|h| h.is_ready()).map(OutboundHandle::clone)
    }
}

/// Opens a fresh connection per request and forces `keep_alive = false`
/// (§4.5). `max_connections` is an advisory cap enforced with a semaphore;
/// `max_requests_per_connect` is trivially `1` since every connection
/// serves exactly one request before self-terminating (§9 open question:
/// "treat these as advisory caps").
pub struct MultiClient {
    addr: SocketAddr,
    max_connections: Arc<Semaphore>,
}

impl MultiClient {
    pub fn new(addr: SocketAddr, max_connections: usize) -> Self {
        Self {
            addr,
            max_connections: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    pub async fn send_request(
        &self,
        mut request: Request,
        body: Arc<Payload>,
        deadline: Instant,
        promise: oneshot::Sender<RequestReply>,
    ) {
        request.keep_alive = false;
        let permit = match self.max_connections.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                let _ = promise.send(Err(ProxyError::UpstreamUnavailable("pool closed".into())));
                return;
            }
        };
        match TcpStream::connect(self.addr).await {
            Ok(sock) => {
                let (handle, join) = spawn_outbound(sock);
                if handle.send_query(request, body, deadline, promise).is_err() {
                    drop(permit);
                    return;
                }
                tokio::spawn(async move {
                    let _ = join.await;
                    drop(permit);
                });
            }
            Err(e) => {
                drop(permit);
                let _ = promise.send(Err(ProxyError::UpstreamUnavailable(e.to_string())));
            }
        }
    }
}
