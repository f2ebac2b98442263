use sqlgate::config::{Config, FilterConfig};

fn base_config() -> &'static str {
    r#"
threads = 2

[[servers]]
name = "server1"
address = "10.0.0.1"
initial_status = "master"

[[servers]]
name = "server2"
address = "10.0.0.2"
port = 3307
initial_status = "slave"

[[filters]]
module = "regexfilter"
name = "rewrite"
match = "old_name"
replace = "new_name"

[[services]]
name = "rw"
servers = ["server1", "server2"]
filters = ["rewrite"]

[[listeners]]
name = "main"
port = 4006
service = "rw"
"#
}

#[test]
fn test_parse_and_defaults() {
    let config: Config = toml::from_str(base_config()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.threads, 2);
    assert_eq!(config.max_threads, 64);
    assert_eq!(config.servers[0].port, 3306);
    assert_eq!(config.servers[1].port, 3307);
    let service = &config.services[0];
    assert_eq!(service.router, "readwritesplit");
    assert_eq!(service.max_sescmd_history, 50);
    assert!(service.retry_failed_reads);
    let listener = &config.listeners[0];
    assert_eq!(listener.address, "0.0.0.0");
    assert!(listener.proxy_networks.is_none());
    match &config.filters[0] {
        FilterConfig::Regexfilter { pattern, replace, .. } => {
            assert_eq!(pattern, "old_name");
            assert_eq!(replace, "new_name");
        }
        _ => panic!("expected regexfilter"),
    }
}

#[test]
fn test_unknown_server_reference_rejected() {
    let bad = base_config().replace("servers = [\"server1\", \"server2\"]", "servers = [\"nope\"]");
    let config: Config = toml::from_str(&bad).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_filter_reference_rejected() {
    let bad = base_config().replace("filters = [\"rewrite\"]", "filters = [\"missing\"]");
    let config: Config = toml::from_str(&bad).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_listener_service_checked() {
    let bad = base_config().replace("service = \"rw\"", "service = \"nope\"");
    let config: Config = toml::from_str(&bad).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_bad_initial_status_rejected() {
    let bad = base_config().replace("initial_status = \"master\"", "initial_status = \"primary\"");
    let config: Config = toml::from_str(&bad).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_threads_bounds() {
    let bad = base_config().replace("threads = 2", "threads = 0");
    let config: Config = toml::from_str(&bad).unwrap();
    assert!(config.validate().is_err());

    let bad = base_config().replace("threads = 2", "threads = 100");
    let config: Config = toml::from_str(&bad).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_proxy_networks_validated() {
    let with_networks = base_config().replace(
        "service = \"rw\"",
        "service = \"rw\"\nproxy_networks = \"10.0.0.0/8, 127.0.0.1\"",
    );
    let config: Config = toml::from_str(&with_networks).unwrap();
    config.validate().unwrap();

    let bad = base_config().replace(
        "service = \"rw\"",
        "service = \"rw\"\nproxy_networks = \"not-a-network\"",
    );
    let config: Config = toml::from_str(&bad).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_tee_target_validated() {
    let with_tee = format!(
        "{}\n{}",
        base_config(),
        r#"
[[filters]]
module = "tee"
name = "branch"
target = "nope"
"#
    );
    let config: Config = toml::from_str(&with_tee).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_durations_parse_humantime() {
    let tuned = base_config().replace(
        "name = \"rw\"",
        "name = \"rw\"\ncausal_reads = true\ncausal_reads_timeout = \"2s\"",
    );
    let config: Config = toml::from_str(&tuned).unwrap();
    assert_eq!(
        config.services[0].causal_reads_timeout,
        std::time::Duration::from_secs(2)
    );
}
