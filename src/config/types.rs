use serde::{Deserialize, Serialize};

/// Top-level process configuration (design §0/§10): egress listener,
/// admin surface, overlay transport parameters, and ingress local-host
/// mappings. CLI flags (`main.rs`) override whatever a config file sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// HTTP listen port for the egress (`-p`) side. `0` disables egress.
    #[serde(default = "default_egress_port")]
    pub port: u16,

    /// When `false` (default), only `.ton`/`.adnl` hosts are tunneled over
    /// the overlay; `true` tunnels every request (`-P`).
    #[serde(default)]
    pub proxy_all: bool,

    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            port: default_egress_port(),
            proxy_all: false,
            startup_grace_secs: default_startup_grace_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_egress_port() -> u16 {
    0
}

fn default_startup_grace_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    60
}

/// One published ingress mapping (`-L`/`-R`): the host this process
/// answers overlay `http_request`s for, proxied to a local or remote
/// `ip:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHostMapping {
    pub host: String,
    /// `127.0.0.1` for `-L`, an explicit remote address for `-R`.
    pub upstream_ip: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default)]
    pub local_hosts: Vec<LocalHostMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Local UDP endpoint for RDP/overlay queries (`-a`), stored and
    /// passed through to the external transport collaborator, never
    /// dialed directly by this crate.
    #[serde(default = "default_address")]
    pub address: String,

    /// Port used for outgoing RDP queries (`-c`).
    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Path to the external overlay/network config file (`-C`).
    #[serde(default)]
    pub global_config_path: Option<String>,

    /// Opaque db-root path forwarded to the keyring/transport
    /// collaborator (`-D`).
    #[serde(default)]
    pub db_root: Option<String>,

    /// Additional published short ids this process answers for (`-A`).
    #[serde(default)]
    pub adnl_ids: Vec<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            client_port: default_client_port(),
            global_config_path: None,
            db_root: None,
            adnl_ids: Vec::new(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:3333".to_string()
}

fn default_client_port() -> u16 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Plain-text admin listener (`/healthz` + stats). `None` disables it.
    #[serde(default)]
    pub listen: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self { listen: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bytes/sec budget for the overlay bridge's `RateLimiter` (design
    /// §4.10). Negative disables limiting, `0` rejects everything.
    #[serde(default = "default_max_rate")]
    pub max_rate_bytes_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_rate_bytes_per_sec: default_max_rate() }
    }
}

fn default_max_rate() -> f64 {
    -1.0
}
