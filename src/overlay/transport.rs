//! External collaborator seams (design §1, §5 "Shared resources"): the
//! lower RDP/overlay transport and the name-service client are kept behind
//! small traits, exactly the way the keyring and TL codec are kept out of
//! scope. Production wiring plugs in the real ADNL/RLDP/DHT stack; tests
//! and local development use the in-memory [`LoopbackTransport`] below.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::error::ProxyResult;
use crate::overlay::ids::ShortId;

/// One inbound RDP query matched against a subscribed prefix: the asker's
/// node id, the raw query bytes, and a one-shot reply channel (the Rust
/// analogue of the design's "promise crossing one actor boundary").
pub struct IncomingQuery {
    pub src: ShortId,
    pub data: Vec<u8>,
    pub reply: oneshot::Sender<Vec<u8>>,
}

pub type QueryStream = mpsc::UnboundedReceiver<IncomingQuery>;

/// The RDP/overlay transport, reduced to the two operations this crate's
/// bridge actors actually call: issue a query and await its reply, or
/// subscribe to inbound queries matching a byte prefix (§4.7 "prefix-
/// matched query routing").
pub trait OverlayTransport: Send + Sync + 'static {
    fn query(&self, dst: ShortId, data: Vec<u8>, timeout: Duration) -> BoxFuture<'static, ProxyResult<Vec<u8>>>;

    /// Installs a prefix subscription for `local_id`; the returned stream
    /// yields every future inbound query whose payload starts with
    /// `prefix`. Dropping the stream is equivalent to unsubscribing.
    fn subscribe(&self, local_id: ShortId, prefix: Vec<u8>) -> QueryStream;
}

/// The external name-service client (§4.9): maps a host string to the
/// `ShortId` currently publishing it.
pub trait NameServiceClient: Send + Sync + 'static {
    fn resolve(&self, host: String) -> BoxFuture<'static, ProxyResult<ShortId>>;
}

/// Prefix-trie-shaped subscriber table, owned by the transport layer per
/// the design note; the in-memory loopback below is the simplest faithful
/// implementation (hash map keyed by the literal prefix bytes).
#[derive(Default)]
struct Subscribers {
    by_prefix: std::collections::HashMap<Vec<u8>, mpsc::UnboundedSender<IncomingQuery>>,
}

/// An in-process transport that loops queries from one logical node
/// straight back to subscribers registered under the same node id,
/// matching longest-prefix semantics. Used by integration tests that
/// exercise the full request-sender/request-handler round trip without a
/// real ADNL/RLDP stack, and as the default for local single-node runs.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<std::sync::Mutex<Subscribers>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverlayTransport for LoopbackTransport {
    fn query(&self, _dst: ShortId, data: Vec<u8>, timeout: Duration) -> BoxFuture<'static, ProxyResult<Vec<u8>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let sender = {
                let subs = inner.lock().unwrap();
                subs.by_prefix
                    .iter()
                    .find(|(prefix, _)| data.starts_with(prefix.as_slice()))
                    .map(|(_, tx)| tx.clone())
            };
            let Some(sender) = sender else {
                return Err(crate::error::ProxyError::UpstreamUnavailable("no subscriber for query".into()));
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if sender
                .send(IncomingQuery {
                    src: ShortId::zero(),
                    data,
                    reply: reply_tx,
                })
                .is_err()
            {
                return Err(crate::error::ProxyError::UpstreamUnavailable("subscriber gone".into()));
            }
            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(_)) => Err(crate::error::ProxyError::Cancelled),
                Err(_) => Err(crate::error::ProxyError::Timeout),
            }
        })
    }

    fn subscribe(&self, _local_id: ShortId, prefix: Vec<u8>) -> QueryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().by_prefix.insert(prefix, tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_routes_by_prefix() {
        let transport = LoopbackTransport::new();
        let mut stream = transport.subscribe(ShortId::zero(), b"tag".to_vec());

        let t2 = transport.clone();
        let send_task = tokio::spawn(async move {
            t2.query(ShortId::zero(), b"tagged-payload".to_vec(), Duration::from_secs(1)).await
        });

        let incoming = stream.recv().await.unwrap();
        assert_eq!(incoming.data, b"tagged-payload");
        incoming.reply.send(b"reply".to_vec()).unwrap();

        let result = send_task.await.unwrap().unwrap();
        assert_eq!(result, b"reply");
    }

    #[tokio::test]
    async fn query_with_no_subscriber_fails_fast() {
        let transport = LoopbackTransport::new();
        let result = transport.query(ShortId::zero(), b"nobody-listens".to_vec(), Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
