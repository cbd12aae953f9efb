//! Configuration loading (design §0): a `toml`-backed `ProxyConfig` with
//! environment-variable overrides, mirroring the teacher's
//! `GatewayConfig::load` / `apply_env_overrides` split.

pub mod types;

#[cfg(test)]
mod tests;

pub use types::{AdminConfig, EgressConfig, IngressConfig, LocalHostMapping, OverlayConfig, ProxyConfig, RateLimitConfig};

use anyhow::{Context, Result};

impl ProxyConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let mut config: ProxyConfig = toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `RLDP_PROXY_*` environment variables override whatever the config
    /// file set, the same override order the teacher's bootstrap uses.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RLDP_PROXY_EGRESS_PORT") {
            if let Ok(port) = v.parse() {
                self.egress.port = port;
            }
        }
        if let Ok(v) = std::env::var("RLDP_PROXY_ALL") {
            self.egress.proxy_all = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("RLDP_PROXY_ADMIN_LISTEN") {
            self.admin.listen = Some(v);
        }
        if let Ok(v) = std::env::var("RLDP_PROXY_MAX_RATE") {
            if let Ok(rate) = v.parse() {
                self.rate_limit.max_rate_bytes_per_sec = rate;
            }
        }
    }
}
