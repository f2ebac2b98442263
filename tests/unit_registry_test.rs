use std::io::Write;
use std::sync::Arc;

use sqlgate::core::monitor::{
    apply_update, ClusterSnapshot, ClusterUpdate, ServerSnapshot, ServerStatusFlags,
};
use sqlgate::core::shared::Collector;
use sqlgate::core::state::{Registry, Server};
use sqlgate::core::users::AccountSource;
use sqlgate::server::context::FileAccountSource;

fn fold(snapshot: &mut ClusterSnapshot, update: ClusterUpdate) {
    apply_update(snapshot, update);
}

#[test]
fn test_admin_flag_mutation_flows_through_snapshot() {
    let registry = Registry::new();
    let (mut collector, mut views) =
        Collector::<ClusterSnapshot, ClusterUpdate, _>::new(ClusterSnapshot::default(), 1, 16, fold);
    let slot = views.pop().unwrap();
    registry.set_status_channel(slot.clone());
    registry.servers.insert(
        "server1".to_string(),
        Arc::new(Server::new("server1".to_string(), "10.0.0.1".to_string(), 3306)),
    );

    // Before the monitor published anything, mutations are rejected.
    assert!(registry
        .set_server_flags("server1", ServerStatusFlags::MAINT, ServerStatusFlags::empty())
        .is_err());

    // A monitor publishes the server.
    slot.send_update(ClusterUpdate::Server(
        "server1".to_string(),
        ServerSnapshot {
            flags: ServerStatusFlags::RUNNING | ServerStatusFlags::MASTER,
            ..ServerSnapshot::default()
        },
    ));
    collector.collect_once();

    // `set server server1 maintenance`.
    registry
        .set_server_flags("server1", ServerStatusFlags::MAINT, ServerStatusFlags::empty())
        .unwrap();
    collector.collect_once();
    let status = registry.cluster_snapshot().status_of("server1");
    assert!(status.contains(ServerStatusFlags::MAINT));
    assert!(!status.is_master());

    // `clear server server1 maintenance`.
    registry
        .set_server_flags("server1", ServerStatusFlags::empty(), ServerStatusFlags::MAINT)
        .unwrap();
    collector.collect_once();
    assert!(registry.cluster_snapshot().status_of("server1").is_master());
}

#[test]
fn test_list_and_show_hooks() {
    let registry = Registry::new();
    let (_collector, mut views) =
        Collector::<ClusterSnapshot, ClusterUpdate, _>::new(ClusterSnapshot::default(), 1, 16, fold);
    registry.set_status_channel(views.pop().unwrap());
    registry.servers.insert(
        "server1".to_string(),
        Arc::new(Server::new("server1".to_string(), "10.0.0.1".to_string(), 3306)),
    );

    let listed = registry.list_servers();
    assert_eq!(listed["servers"].as_array().unwrap().len(), 1);
    assert!(registry.show_server("server1").is_some());
    assert!(registry.show_server("missing").is_none());
    assert!(registry.show_session(99).is_none());
    assert_eq!(registry.list_services()["services"].as_array().unwrap().len(), 0);
}

#[test]
fn test_kill_unknown_session_fails() {
    let registry = Registry::new();
    assert!(registry.kill_session(12345).is_err());
}

#[tokio::test]
async fn test_file_account_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[[users]]
user = "app"
host = "10.0.0.0/8"
password = "secret"
default_db = "prod"
grants = ["prod"]

[[users]]
user = "admin"
host = "%"
password_hash = "2af235eca825b9a1a1dbd1b6112c0a0e4e7dcfd4"
require_ssl = true
"#
    )
    .unwrap();

    let source = FileAccountSource {
        path: Some(path.to_string_lossy().into_owned()),
    };
    let entries = source.fetch_all().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].user, "app");
    assert_eq!(entries[0].default_db.as_deref(), Some("prod"));
    assert_eq!(entries[0].auth_token_hash.len(), 20);
    assert!(entries[1].require_ssl);
    assert_eq!(entries[1].auth_token_hash.len(), 20);
}

#[tokio::test]
async fn test_file_account_source_without_file_is_empty() {
    let source = FileAccountSource { path: None };
    assert!(source.fetch_all().await.unwrap().is_empty());
}
