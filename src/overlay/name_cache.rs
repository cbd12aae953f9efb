//! Host → short-id resolution cache (design §4.9). Owned exclusively by
//! the resolver that calls it — per §5 "the name cache is owned by the
//! resolver actor; it is the only mutator" — so a plain `Mutex`-guarded
//! map is enough; there is no cross-actor concurrent-mutation contract
//! here the way there is for `Payload`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ProxyResult;
use crate::overlay::ids::ShortId;
use crate::overlay::transport::NameServiceClient;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    short_id: ShortId,
    created_at: Instant,
}

/// `resolve(host)`: literal `.adnl` short ids are parsed directly; anything
/// else is served from cache within `ttl`, else fetched from the external
/// name-service client and cached.
pub struct NameCache {
    client: Arc<dyn NameServiceClient>,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl NameCache {
    pub fn new(client: Arc<dyn NameServiceClient>) -> Self {
        Self::with_ttl(client, DEFAULT_TTL)
    }

    pub fn with_ttl(client: Arc<dyn NameServiceClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, host: &str) -> ProxyResult<ShortId> {
        if host.ends_with(".adnl") {
            let literal = &host[..host.len() - ".adnl".len()];
            if let Some(id) = ShortId::from_adnl_literal(literal) {
                return Ok(id);
            }
        }

        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(host) {
                if entry.created_at.elapsed() < self.ttl {
                    return Ok(entry.short_id);
                }
            }
        }

        let short_id = self.client.resolve(host.to_string()).await?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            host.to_string(),
            Entry {
                short_id,
                created_at: Instant::now(),
            },
        );
        Ok(short_id)
    }
}

/// A [`NameServiceClient`] that resolves nothing, for deployments that only
/// ever address peers by `.adnl` literal and never plug in a real DHT/name
/// service client (design §1 "external collaborators").
pub struct UnavailableNameService;

impl NameServiceClient for UnavailableNameService {
    fn resolve(&self, host: String) -> futures_util::future::BoxFuture<'static, ProxyResult<ShortId>> {
        Box::pin(async move { Err(crate::error::ProxyError::UpstreamUnavailable(format!("no name service configured to resolve {host}"))) })
    }
}

/// Strips scheme, path, and an explicit `:port` suffix, then lowercases —
/// idempotent per §8 (`normalize_host(normalize_host(s)) == normalize_host(s)`).
pub fn normalize_host(raw: &str) -> String {
    let mut s = raw;
    if let Some(rest) = s.strip_prefix("https://") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("http://") {
        s = rest;
    }
    if let Some(idx) = s.find('/') {
        s = &s[..idx];
    }
    if let Some(idx) = s.rfind(':') {
        s = &s[..idx];
    }
    s.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        id: ShortId,
    }

    impl NameServiceClient for CountingResolver {
        fn resolve(&self, _host: String) -> BoxFuture<'static, ProxyResult<ShortId>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = self.id;
            Box::pin(async move { Ok(id) })
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let cases = ["HTTP://Example.TON:8080/path", "example.ton", "https://X.Y/"];
        for c in cases {
            let once = normalize_host(c);
            let twice = normalize_host(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn strips_scheme_prefixes_correctly() {
        assert_eq!(normalize_host("http://example.ton/"), "example.ton");
        assert_eq!(normalize_host("https://example.ton/"), "example.ton");
    }

    #[tokio::test]
    async fn ttl_governs_recheck() {
        tokio::time::pause();
        let id = ShortId::random();
        let resolver = Arc::new(CountingResolver { calls: AtomicUsize::new(0), id });
        let cache = NameCache::with_ttl(resolver.clone(), Duration::from_secs(200));

        let a = cache.resolve("example.ton").await.unwrap();
        assert_eq!(a, id);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(150)).await;
        let b = cache.resolve("example.ton").await.unwrap();
        assert_eq!(b, id);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1, "still within TTL");

        tokio::time::advance(Duration::from_secs(100)).await;
        let c = cache.resolve("example.ton").await.unwrap();
        assert_eq!(c, id);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2, "TTL expired, must recheck");
    }

    #[tokio::test]
    async fn adnl_literal_bypasses_resolver() {
        let resolver = Arc::new(CountingResolver { calls: AtomicUsize::new(0), id: ShortId::random() });
        let cache = NameCache::new(resolver.clone());
        let literal = ShortId::random().to_adnl_literal();
        let host = format!("{literal}.adnl");
        let resolved = cache.resolve(&host).await.unwrap();
        assert_eq!(resolved.to_adnl_literal(), literal);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }
}
