use super::types::ProxyConfig;

#[test]
fn defaults_are_sane() {
    let config = ProxyConfig::default();
    assert_eq!(config.egress.port, 0);
    assert!(!config.egress.proxy_all);
    assert_eq!(config.egress.startup_grace_secs, 10);
    assert_eq!(config.egress.idle_timeout_secs, 60);
    assert_eq!(config.rate_limit.max_rate_bytes_per_sec, -1.0);
}

#[test]
fn toml_round_trips_through_serde() {
    let toml_src = r#"
        [egress]
        port = 8080
        proxy_all = true

        [admin]
        listen = "127.0.0.1:9000"

        [[ingress.local_hosts]]
        host = "example.ton"
        upstream_ip = "127.0.0.1"
        ports = [80, 443]
    "#;
    let config: ProxyConfig = toml::from_str(toml_src).unwrap();
    assert_eq!(config.egress.port, 8080);
    assert!(config.egress.proxy_all);
    assert_eq!(config.admin.listen.as_deref(), Some("127.0.0.1:9000"));
    assert_eq!(config.ingress.local_hosts.len(), 1);
    assert_eq!(config.ingress.local_hosts[0].host, "example.ton");
    assert_eq!(config.ingress.local_hosts[0].ports, vec![80, 443]);
}

#[test]
fn env_override_wins_over_file_value() {
    let mut config = ProxyConfig::default();
    // SAFETY-equivalent: tests run single-threaded-enough within this
    // module that a process-global env var is acceptable here; tests
    // don't run concurrently against the same key.
    std::env::set_var("RLDP_PROXY_EGRESS_PORT", "1234");
    config.apply_env_overrides();
    std::env::remove_var("RLDP_PROXY_EGRESS_PORT");
    assert_eq!(config.egress.port, 1234);
}
