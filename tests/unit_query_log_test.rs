use sqlgate::core::filter::query_log::{LogMode, QueryLogConfig, QueryLogFilter};
use sqlgate::core::filter::{FilterCtx, FilterModule, FilterSession, SessionScope};
use sqlgate::core::protocol::codec::build_query;
use sqlgate::core::session::auth::BackendAuth;
use sqlgate::core::state::Registry;

fn ctx(session_id: u64) -> FilterCtx {
    FilterCtx {
        session_id,
        user: "app".to_string(),
        remote: "127.0.0.1:5000".to_string(),
        service: "svc".to_string(),
        registry: Registry::new(),
        db: None,
        backend_auth: BackendAuth::default(),
        in_trx: false,
        trx_read_only: true,
        request_seq: 0,
        kill_session: false,
    }
}

fn config(filebase: &str, unified: bool) -> QueryLogConfig {
    QueryLogConfig {
        filebase: filebase.to_string(),
        mode: if unified { LogMode::Unified } else { LogMode::Session },
        separator: ",".to_string(),
        match_pattern: None,
        exclude_pattern: Some("^SHOW".to_string()),
        scope: SessionScope::default(),
    }
}

#[tokio::test]
async fn test_per_session_log() {
    let dir = tempfile::tempdir().unwrap();
    let filebase = dir.path().join("qla").to_string_lossy().into_owned();
    let filter = QueryLogFilter::new("qla", config(&filebase, false)).unwrap();
    let mut ctx = ctx(7);
    let mut session = filter.new_session(&ctx).unwrap();
    session
        .route_query(build_query("SELECT 1"), &mut ctx)
        .await
        .unwrap();
    session
        .route_query(build_query("SHOW TABLES"), &mut ctx)
        .await
        .unwrap();

    let log = std::fs::read_to_string(format!("{filebase}.7")).unwrap();
    assert!(log.contains("app@127.0.0.1:5000,SELECT 1"));
    // The excluded statement was not logged.
    assert!(!log.contains("SHOW TABLES"));
}

#[tokio::test]
async fn test_unified_log_shared_by_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let filebase = dir.path().join("qla").to_string_lossy().into_owned();
    let filter = QueryLogFilter::new("qla", config(&filebase, true)).unwrap();
    for id in [1u64, 2] {
        let mut ctx = ctx(id);
        let mut session = filter.new_session(&ctx).unwrap();
        session
            .route_query(build_query(&format!("SELECT {id}")), &mut ctx)
            .await
            .unwrap();
    }
    let log = std::fs::read_to_string(format!("{filebase}.unified")).unwrap();
    assert!(log.contains("SELECT 1"));
    assert!(log.contains("SELECT 2"));
}
