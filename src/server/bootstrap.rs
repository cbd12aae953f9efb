//! Process lifecycle wiring (design §2 "process entrypoint", §10): turns a
//! parsed CLI/config pair into running egress/ingress tasks plus the admin
//! surface, and drives graceful shutdown the way the teacher's
//! `run_proxy_server` drain loop does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ProxyConfig;
use crate::connection::InboundConnection;
use crate::overlay::{HostMapResolver, LoopbackTransport, NameCache, OverlayTransport, RequestHandler as IngressHandler, RequestSender, ShortId, UnavailableNameService};
use crate::proxy::egress::{EgressHandler, HostTable};
use crate::ratelimit::RateLimiter;
use crate::server::admin::{self, AdminState};

/// Resolved startup arguments, assembled by `main.rs` from `clap::Cli`
/// merged over an optional `ProxyConfig` file.
pub struct BootstrapArgs {
    pub config: ProxyConfig,
    pub egress_listen: Option<SocketAddr>,
    pub logname: Option<String>,
    pub verbosity: u8,
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(args: BootstrapArgs, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    init_tracing(args.logname.as_deref(), args.verbosity);

    // No real ADNL/RLDP/DHT stack is in scope (design §1); the loopback
    // transport is the documented stand-in for a single-process egress +
    // ingress pairing until a real `OverlayTransport` is plugged in.
    let transport: Arc<dyn OverlayTransport> = Arc::new(LoopbackTransport::new());
    let local_id = ShortId::random();
    let limiter = Arc::new(RateLimiter::new(args.config.rate_limit.max_rate_bytes_per_sec));

    let mut tasks = Vec::new();

    let host_map = build_host_map(&args.config.ingress.local_hosts);
    if !host_map.is_empty() {
        let upstream = Arc::new(HostMapResolver::new(host_map));
        let ingress = IngressHandler::with_limiter(local_id, transport.clone(), upstream, Some(limiter.clone()));
        info!(hosts = args.config.ingress.local_hosts.len(), "ingress: starting request handler");
        tasks.push(tokio::spawn(ingress.run()));
    }

    let egress_handler = if let Some(egress_addr) = args.egress_listen {
        let names = Arc::new(NameCache::new(Arc::new(UnavailableNameService)));
        let sender = Arc::new(RequestSender::with_limiter(local_id, transport.clone(), limiter.clone()));
        let hosts = HostTable::with_timers(
            Duration::from_secs(args.config.egress.startup_grace_secs),
            Duration::from_secs(args.config.egress.idle_timeout_secs),
        );
        let handler = EgressHandler::with_host_table(sender, names, args.config.egress.proxy_all, hosts);
        let egress_shutdown = shutdown.clone();
        let handler_for_listener = handler.clone();
        tasks.push(tokio::spawn(run_egress_listener(egress_addr, handler_for_listener, egress_shutdown)));
        Some(handler)
    } else {
        None
    };

    if let Some(admin_listen) = args.config.admin.listen.clone() {
        let state = Arc::new(AdminState { egress: egress_handler.clone() });
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::run(&admin_listen, state).await {
                warn!(error = %e, "admin server exited");
            }
        }));
    }

    shutdown.notified().await;
    info!("bootstrap: shutdown requested, draining");
    tokio::time::timeout(DRAIN_TIMEOUT, futures_util::future::join_all(tasks)).await.ok();
    Ok(())
}

fn build_host_map(mappings: &[crate::config::LocalHostMapping]) -> std::collections::HashMap<String, SocketAddr> {
    let mut map = std::collections::HashMap::new();
    for mapping in mappings {
        let Some(&port) = mapping.ports.first() else { continue };
        let addr_str = format!("{}:{port}", mapping.upstream_ip);
        match addr_str.parse::<SocketAddr>() {
            Ok(addr) => {
                map.insert(crate::overlay::name_cache::normalize_host(&mapping.host), addr);
            }
            Err(e) => warn!(host = %mapping.host, error = %e, "ingress: invalid local-host mapping"),
        }
    }
    map
}

async fn run_egress_listener(addr: SocketAddr, handler: Arc<EgressHandler>, shutdown: Arc<Notify>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, error = %e, "egress: failed to bind");
            return;
        }
    };
    info!(%addr, "egress: listening");
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("egress: stop accepting new connections");
                return;
            }
        };
        let (socket, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "egress: accept failed");
                continue;
            }
        };
        let handler: Arc<dyn crate::connection::RequestHandler> = handler.clone();
        tokio::spawn(async move {
            InboundConnection::new(socket, handler).run().await;
        });
        let _ = peer;
    }
}

fn init_tracing(logname: Option<&str>, verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match logname {
        Some(path) => {
            let dir = std::path::Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = std::path::Path::new(path).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "rldp-http-proxy.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // Leaked deliberately: the guard must outlive the process for the
            // non-blocking writer to flush on exit, and bootstrap::run never
            // returns before shutdown.
            Box::leak(Box::new(guard));
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
