//! Config loading and defaults integration tests

use std::path::PathBuf;
use std::time::Duration;

use rolegate::config::Config;
use rolegate::ChainMode;

#[test]
fn test_config_with_all_fields() {
    let toml_str = r#"
[store]
data_dir = "/var/lib/rolegate"
io_timeout_ms = 2000

[reconcile]
chain_mode = "recursive"
serialize_per_member = false
rate_limit_retry_cap_ms = 500

[dashboard]
enabled = false
listen = "127.0.0.1:8080"
static_dir = "/srv/rolegate/static"
passwords_file = "/etc/rolegate/password.json"
relay_token = "relay"

[platform]
api_base = "http://localhost:9999/api"
token = "bot-token"
application_id = "1234"
public_key = "abcd"
request_timeout_ms = 3000
role_cache_ttl_secs = 5
"#;

    let config = Config::parse(toml_str).expect("valid config");
    assert_eq!(config.store.data_dir, PathBuf::from("/var/lib/rolegate"));
    assert_eq!(config.io_timeout(), Duration::from_secs(2));
    assert_eq!(config.reconcile.chain_mode, ChainMode::Recursive);
    assert!(!config.dashboard.enabled);
    assert_eq!(config.dashboard.listen.port(), 8080);
    assert_eq!(config.dashboard.relay_token.as_deref(), Some("relay"));
    assert_eq!(config.platform.token.as_deref(), Some("bot-token"));
    assert_eq!(config.request_timeout(), Duration::from_secs(3));
    assert_eq!(config.role_cache_ttl(), Duration::from_secs(5));

    let listener = config.listener();
    assert_eq!(listener.reconcile.chain_mode, ChainMode::Recursive);
    assert!(!listener.serialize_per_member);
    assert_eq!(listener.rate_limit_retry_cap, Duration::from_millis(500));
}

#[test]
fn test_partial_sections_use_defaults() {
    let config = Config::parse(
        r#"
[store]
data_dir = "rules"

[platform]
token = "t"
"#,
    )
    .unwrap();

    assert_eq!(config.store.data_dir, PathBuf::from("rules"));
    assert_eq!(config.store.io_timeout_ms, 5000);
    assert_eq!(config.reconcile.chain_mode, ChainMode::SingleHop);
    assert!(config.reconcile.serialize_per_member);
    assert_eq!(config.dashboard.listen.to_string(), "0.0.0.0:3000");
    assert_eq!(config.platform.api_base, "https://discord.com/api/v10");
    assert_eq!(config.platform.role_cache_ttl_secs, 60);
}

#[test]
fn test_unknown_chain_mode_rejected() {
    assert!(Config::parse("[reconcile]\nchain_mode = \"sideways\"\n").is_err());
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("rolegate.toml");
    std::fs::write(&path, "[dashboard]\nlisten = \"127.0.0.1:4000\"\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.dashboard.listen.port(), 4000);

    std::fs::write(&path, "[dashboard\n").unwrap();
    assert!(Config::load(&path).is_err());
}
