use std::io::Read;

use sqlgate::core::filter::regex_rewrite::{RegexRewriteConfig, RegexRewriteFilter};
use sqlgate::core::filter::{DownstreamAction, FilterCtx, FilterModule, FilterSession, SessionScope};
use sqlgate::core::protocol::codec::{build_packet, build_query, peek_header, sql_of};
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

fn rewrite_filter(pattern: &str, replace: &str) -> RegexRewriteFilter {
    RegexRewriteFilter::new(
        "rewrite",
        RegexRewriteConfig {
            pattern: pattern.to_string(),
            replace: replace.to_string(),
            ..RegexRewriteConfig::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_rewrites_matching_query() {
    let filter = rewrite_filter(r"from_table", "to_table");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let action = session
        .route_query(build_query("SELECT * FROM from_table"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(sql_of(&packet).as_deref(), Some("SELECT * FROM to_table"));
        }
        _ => panic!("expected Forward"),
    }
}

#[tokio::test]
async fn test_substitution_is_global() {
    let filter = rewrite_filter(r"a", "b");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let action = session
        .route_query(build_query("a a a"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(sql_of(&packet).as_deref(), Some("b b b"));
        }
        _ => panic!("expected Forward"),
    }
}

#[tokio::test]
async fn test_sequence_preserved_on_rewrite() {
    let filter = rewrite_filter(r"x", "y");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let mut body = vec![0x03];
    body.extend_from_slice(b"select x");
    let packet = build_packet(7, &body);
    let action = session.route_query(packet, &mut ctx).await.unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(peek_header(&packet).unwrap().seq, 7);
        }
        _ => panic!("expected Forward"),
    }
}

#[tokio::test]
async fn test_non_matching_query_passes_untouched() {
    let filter = rewrite_filter(r"never_matches_anything", "x");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let original = build_query("SELECT 1");
    let bytes = original.to_vec();
    let action = session.route_query(original, &mut ctx).await.unwrap();
    match action {
        DownstreamAction::Forward(packet) => assert_eq!(packet.to_vec(), bytes),
        _ => panic!("expected Forward"),
    }
}

#[tokio::test]
async fn test_non_sql_commands_pass_through() {
    let filter = rewrite_filter(r".*", "replaced");
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let ping = build_packet(0, &[0x0E]);
    let bytes = ping.to_vec();
    let action = session.route_query(ping, &mut ctx).await.unwrap();
    match action {
        DownstreamAction::Forward(packet) => assert_eq!(packet.to_vec(), bytes),
        _ => panic!("expected Forward"),
    }
}

#[tokio::test]
async fn test_user_scope_disables_filter() {
    let filter = RegexRewriteFilter::new(
        "rewrite",
        RegexRewriteConfig {
            pattern: "a".to_string(),
            replace: "b".to_string(),
            scope: SessionScope {
                source: None,
                user: Some("someone_else".to_string()),
            },
            ..RegexRewriteConfig::default()
        },
    )
    .unwrap();
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    let action = session.route_query(build_query("a"), &mut ctx).await.unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(sql_of(&packet).as_deref(), Some("a"));
        }
        _ => panic!("expected Forward"),
    }
}

#[tokio::test]
async fn test_match_logging() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("rewrite.log");
    let filter = RegexRewriteFilter::new(
        "rewrite",
        RegexRewriteConfig {
            pattern: "old".to_string(),
            replace: "new".to_string(),
            log_file: Some(log_path.to_string_lossy().into_owned()),
            ..RegexRewriteConfig::default()
        },
    )
    .unwrap();
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    session
        .route_query(build_query("SELECT old"), &mut ctx)
        .await
        .unwrap();
    let mut contents = String::new();
    std::fs::File::open(&log_path)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert!(contents.contains("SELECT old -> SELECT new"));
}

#[test]
fn test_invalid_growth_factor_rejected() {
    let result = RegexRewriteFilter::new(
        "rewrite",
        RegexRewriteConfig {
            pattern: "a".to_string(),
            replace: "b".to_string(),
            growth_factor: 0.5,
            ..RegexRewriteConfig::default()
        },
    );
    assert!(result.is_err());
}
