use std::io::Write;

use sqlgate::core::filter::lua::{LuaFilter, LuaFilterConfig};
use sqlgate::core::filter::{DownstreamAction, FilterCtx, FilterModule, FilterSession};
use sqlgate::core::protocol::codec::{build_query, sql_of};
use sqlgate::core::protocol::constants::HEADER_LEN;
use sqlgate::core::session::auth::BackendAuth;
use sqlgate::core::state::Registry;

fn ctx() -> FilterCtx {
    FilterCtx {
        session_id: 1,
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

fn script_file(dir: &tempfile::TempDir, body: &str) -> String {
    let path = dir.path().join("hook.lua");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

fn filter_with_session_script(dir: &tempfile::TempDir, body: &str) -> LuaFilter {
    LuaFilter::new(
        "lua",
        LuaFilterConfig {
            global_script: None,
            session_script: Some(script_file(dir, body)),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let filter = filter_with_session_script(&dir, "function routeQuery(sql) return nil end");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let action = session
        .route_query(build_query("SELECT 1"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(sql_of(&packet).as_deref(), Some("SELECT 1"));
        }
        _ => panic!("expected pass-through"),
    }
}

#[tokio::test]
async fn test_veto_synthesizes_access_denied() {
    let dir = tempfile::tempdir().unwrap();
    let filter = filter_with_session_script(
        &dir,
        "function routeQuery(sql) if string.find(sql, 'DROP') then return false end return nil end",
    );
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let action = session
        .route_query(build_query("DROP TABLE users"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Respond(packet) => {
            // An ERR packet with the access-denied code.
            assert_eq!(packet.byte_at(HEADER_LEN), Some(0xFF));
            let body = packet.to_vec().split_off(HEADER_LEN);
            let err = sqlgate::core::protocol::packets::ErrPacket::parse(&body).unwrap();
            assert_eq!(err.code, 1045);
        }
        _ => panic!("expected a veto"),
    }
}

#[tokio::test]
async fn test_substitution_rewrites_query() {
    let dir = tempfile::tempdir().unwrap();
    let filter =
        filter_with_session_script(&dir, "function routeQuery(sql) return 'SELECT 42' end");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let action = session
        .route_query(build_query("SELECT 1"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(sql_of(&packet).as_deref(), Some("SELECT 42"));
        }
        _ => panic!("expected substitution"),
    }
}

#[tokio::test]
async fn test_ambiguous_return_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    let filter = filter_with_session_script(&dir, "function routeQuery(sql) return 123 end");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let action = session
        .route_query(build_query("SELECT 1"), &mut ctx)
        .await
        .unwrap();
    assert!(matches!(action, DownstreamAction::Forward(_)));
}

#[tokio::test]
async fn test_counters_track_decisions() {
    let dir = tempfile::tempdir().unwrap();
    let filter = filter_with_session_script(
        &dir,
        "function routeQuery(sql) if sql == 'bad' then return false end return nil end",
    );
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    session.route_query(build_query("bad"), &mut ctx).await.unwrap();
    session.route_query(build_query("fine"), &mut ctx).await.unwrap();
    assert_eq!(filter.diagnostics()["queries_vetoed"], 1);
}

#[test]
fn test_missing_script_is_a_config_error() {
    let result = LuaFilter::new(
        "lua",
        LuaFilterConfig {
            global_script: Some("/nonexistent/script.lua".to_string()),
            session_script: None,
        },
    );
    assert!(result.is_err());
}
