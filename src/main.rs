use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;
use tracing::info;

use rldp_http_proxy::config::{LocalHostMapping, ProxyConfig};
use rldp_http_proxy::server::{self, bootstrap::BootstrapArgs};

#[derive(Parser)]
#[command(name = "rldp-http-proxy", about = "bidirectional HTTP <-> RDP overlay tunneling proxy")]
struct Cli {
    /// Path to a config file (TOML); CLI flags below override its values.
    #[arg(long)]
    config: Option<String>,

    /// HTTP listen port for egress mode.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Local UDP endpoint used for RDP/overlay queries.
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// Additional published short IDs this process answers ingress requests for.
    #[arg(short = 'A', long = "adnl")]
    adnl: Vec<String>,

    /// Local port used for outgoing RDP queries.
    #[arg(short = 'c', long = "client-port")]
    client_port: Option<u16>,

    /// Path to the external overlay/network config file.
    #[arg(short = 'C', long = "global-config")]
    global_config: Option<String>,

    /// Publish `host[:ports]` for ingress, proxied to 127.0.0.1:<ports> (default 80,443).
    #[arg(short = 'L', long = "local")]
    local: Vec<String>,

    /// Publish `host[:ports]@ip:port` for ingress, proxied to a remote address.
    #[arg(short = 'R', long = "remote")]
    remote: Vec<String>,

    /// Opaque db-root path forwarded to the external keyring/transport collaborator.
    #[arg(short = 'D', long = "db")]
    db: Option<String>,

    /// When "no" (default), egress only proxies `.ton`/`.adnl` hosts; "yes" tunnels everything.
    #[arg(short = 'P', long = "proxy-all")]
    proxy_all: Option<String>,

    /// Kept for CLI compatibility; daemonization is out of scope.
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Log to this file via a non-blocking rolling writer instead of stdout.
    #[arg(short = 'l', long = "logname")]
    logname: Option<String>,

    /// Verbosity level, mapped to a tracing EnvFilter level.
    #[arg(short = 'v', long, default_value_t = 0)]
    verbosity: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.daemonize {
        eprintln!("note: -d/--daemonize is accepted but has no effect in this build");
    }

    let mut config = match &cli.config {
        Some(path) => ProxyConfig::load(path).with_context(|| format!("loading config file {path}"))?,
        None => ProxyConfig::default(),
    };
    apply_cli_overrides(&mut config, &cli)?;

    let egress_listen = if config.egress.port != 0 {
        Some(SocketAddr::from(([0, 0, 0, 0], config.egress.port)))
    } else {
        None
    };

    let worker_threads = server::runtime::get_container_cpu_limit();
    let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(worker_threads).enable_all().build()?;

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    rt.spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("main: received ctrl-c, shutting down");
        shutdown_signal.notify_waiters();
    });

    rt.block_on(server::run(
        BootstrapArgs {
            config,
            egress_listen,
            logname: cli.logname,
            verbosity: cli.verbosity,
        },
        shutdown,
    ))
}

fn apply_cli_overrides(config: &mut ProxyConfig, cli: &Cli) -> Result<()> {
    if let Some(port) = cli.port {
        config.egress.port = port;
    }
    if let Some(address) = &cli.address {
        config.overlay.address = address.clone();
    }
    if let Some(client_port) = cli.client_port {
        config.overlay.client_port = client_port;
    }
    if let Some(global_config) = &cli.global_config {
        config.overlay.global_config_path = Some(global_config.clone());
    }
    if let Some(db) = &cli.db {
        config.overlay.db_root = Some(db.clone());
    }
    if !cli.adnl.is_empty() {
        config.overlay.adnl_ids = cli.adnl.clone();
    }
    if let Some(proxy_all) = &cli.proxy_all {
        config.egress.proxy_all = matches!(proxy_all.trim(), "yes" | "true" | "1");
    }

    for spec in &cli.local {
        config.ingress.local_hosts.push(parse_local_mapping(spec, "127.0.0.1")?);
    }
    for spec in &cli.remote {
        let (host_ports, remote_ip) = spec.rsplit_once('@').with_context(|| format!("-R mapping {spec} missing @ip:port"))?;
        let remote_host = remote_ip.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(remote_ip);
        config.ingress.local_hosts.push(parse_local_mapping(host_ports, remote_host)?);
    }

    Ok(())
}

/// Parses `host[:ports]` where `ports` is a comma-separated list, default `80,443`.
fn parse_local_mapping(spec: &str, upstream_ip: &str) -> Result<LocalHostMapping> {
    let (host, ports) = match spec.split_once(':') {
        Some((h, p)) => (h, p),
        None => (spec, "80,443"),
    };
    let ports = ports
        .split(',')
        .map(|p| p.trim().parse::<u16>().with_context(|| format!("invalid port in {spec}")))
        .collect::<Result<Vec<u16>>>()?;
    Ok(LocalHostMapping { host: host.to_string(), upstream_ip: upstream_ip.to_string(), ports })
}
