use sqlgate::core::buffer::BufChain;
use sqlgate::core::filter::optimistic_trx::{OptimisticTrxConfig, OptimisticTrxFilter};
use sqlgate::core::filter::{DownstreamAction, FilterCtx, FilterModule, FilterSession};
use sqlgate::core::protocol::codec::{build_packet, build_query, sql_of};
use sqlgate::core::protocol::constants::{Capabilities, Command};
use sqlgate::core::protocol::packets::OkPacket;
use sqlgate::core::protocol::reply::ReplyTracker;
use sqlgate::core::protocol::StatusFlags;
use sqlgate::core::session::auth::BackendAuth;
use sqlgate::core::state::Registry;
use sqlgate::core::SqlGateError;

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

fn new_session() -> Box<dyn FilterSession> {
    OptimisticTrxFilter::new("otrx", OptimisticTrxConfig::default())
        .new_session(&ctx())
        .unwrap()
}

fn ok_packet() -> BufChain {
    build_packet(1, &OkPacket::build(0, 0, StatusFlags::IN_TRANS))
}

/// Feeds a single-packet OK reply through the filter, returning whether it
/// was forwarded to the client.
async fn feed_ok(session: &mut Box<dyn FilterSession>, ctx: &mut FilterCtx) -> bool {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Query);
    let packet = ok_packet();
    tracker.process(&packet).unwrap();
    let verdict = session.client_reply(packet, &tracker, ctx).await.unwrap();
    verdict.to_client.is_some()
}

/// Feeds a one-row result set, returning (forwarded_any, result).
async fn feed_rows(
    session: &mut Box<dyn FilterSession>,
    ctx: &mut FilterCtx,
    rows: &[&[u8]],
) -> Result<bool, SqlGateError> {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Query);
    let mut forwarded = false;
    let mut seq = 1u8;
    let mut packets = vec![vec![0x01u8], b"coldef".to_vec()];
    packets.push(vec![0xFE, 0, 0, 0, 0]);
    for row in rows {
        packets.push(row.to_vec());
    }
    packets.push(vec![0xFE, 0, 0, 0, 0]);
    for body in packets {
        let packet = build_packet(seq, &body);
        seq += 1;
        tracker.process(&packet).unwrap();
        let verdict = session.client_reply(packet, &tracker, ctx).await?;
        forwarded |= verdict.to_client.is_some();
    }
    Ok(forwarded)
}

#[tokio::test]
async fn test_begin_is_replaced_by_read_only_shadow() {
    let mut ctx = ctx();
    let mut session = new_session();
    let action = session.route_query(build_query("BEGIN"), &mut ctx).await.unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(sql_of(&packet).as_deref(), Some("START TRANSACTION READ ONLY"));
        }
        _ => panic!("expected the shadow transaction"),
    }
}

#[tokio::test]
async fn test_commit_without_write_succeeds() {
    let mut ctx = ctx();
    let mut session = new_session();
    session.route_query(build_query("BEGIN"), &mut ctx).await.unwrap();
    assert!(feed_ok(&mut session, &mut ctx).await);

    session
        .route_query(build_query("SELECT x FROM t"), &mut ctx)
        .await
        .unwrap();
    assert!(feed_rows(&mut session, &mut ctx, &[b"row1"]).await.unwrap());

    let action = session.route_query(build_query("COMMIT"), &mut ctx).await.unwrap();
    assert!(matches!(action, DownstreamAction::Forward(_)));
    assert!(feed_ok(&mut session, &mut ctx).await);
}

#[tokio::test]
async fn test_write_triggers_rollback_and_replay() {
    let mut ctx = ctx();
    let mut session = new_session();
    session.route_query(build_query("BEGIN"), &mut ctx).await.unwrap();
    feed_ok(&mut session, &mut ctx).await;
    session
        .route_query(build_query("SELECT x FROM t"), &mut ctx)
        .await
        .unwrap();
    feed_rows(&mut session, &mut ctx, &[b"row1"]).await.unwrap();

    let action = session
        .route_query(build_query("UPDATE t SET x = 2"), &mut ctx)
        .await
        .unwrap();
    let packets = match action {
        DownstreamAction::ForwardMany(packets) => packets,
        _ => panic!("expected the rollback + replay sequence"),
    };
    // ROLLBACK, replayed BEGIN, replayed SELECT, then the write.
    assert_eq!(packets.len(), 4);
    assert_eq!(sql_of(&packets[0]).as_deref(), Some("ROLLBACK"));
    assert_eq!(sql_of(&packets[1]).as_deref(), Some("BEGIN"));
    assert_eq!(sql_of(&packets[2]).as_deref(), Some("SELECT x FROM t"));
    assert_eq!(sql_of(&packets[3]).as_deref(), Some("UPDATE t SET x = 2"));

    // ROLLBACK reply is absorbed.
    assert!(!feed_ok(&mut session, &mut ctx).await);
    // Replayed BEGIN reply is compared, not forwarded.
    assert!(!feed_ok(&mut session, &mut ctx).await);
    // Replayed SELECT with identical rows: compared, not forwarded.
    assert!(!feed_rows(&mut session, &mut ctx, &[b"row1"]).await.unwrap());
    // The write's own reply reaches the client.
    assert!(feed_ok(&mut session, &mut ctx).await);
    assert!(!ctx.kill_session);
}

#[tokio::test]
async fn test_replay_divergence_kills_session() {
    let mut ctx = ctx();
    let mut session = new_session();
    session.route_query(build_query("BEGIN"), &mut ctx).await.unwrap();
    feed_ok(&mut session, &mut ctx).await;
    session
        .route_query(build_query("SELECT x FROM t"), &mut ctx)
        .await
        .unwrap();
    feed_rows(&mut session, &mut ctx, &[b"row1"]).await.unwrap();

    session
        .route_query(build_query("UPDATE t SET x = 2"), &mut ctx)
        .await
        .unwrap();
    feed_ok(&mut session, &mut ctx).await; // rollback
    feed_ok(&mut session, &mut ctx).await; // replayed BEGIN

    // The primary returns a different row: the client saw stale data.
    let result = feed_rows(&mut session, &mut ctx, &[b"row2-different"]).await;
    assert!(matches!(result, Err(SqlGateError::ChecksumMismatch)));
    assert!(ctx.kill_session);
}

#[tokio::test]
async fn test_row_order_does_not_matter() {
    let mut ctx = ctx();
    let mut session = new_session();
    session.route_query(build_query("BEGIN"), &mut ctx).await.unwrap();
    feed_ok(&mut session, &mut ctx).await;
    session
        .route_query(build_query("SELECT x FROM t"), &mut ctx)
        .await
        .unwrap();
    feed_rows(&mut session, &mut ctx, &[b"rowA", b"rowB"]).await.unwrap();

    session
        .route_query(build_query("UPDATE t SET x = 2"), &mut ctx)
        .await
        .unwrap();
    feed_ok(&mut session, &mut ctx).await; // rollback
    feed_ok(&mut session, &mut ctx).await; // replayed BEGIN
    // Same rows in reverse order still match the checksum.
    let ok = feed_rows(&mut session, &mut ctx, &[b"rowB", b"rowA"]).await;
    assert!(ok.is_ok());
    assert!(!ctx.kill_session);
}

#[tokio::test]
async fn test_counters() {
    let filter = OptimisticTrxFilter::new("otrx", OptimisticTrxConfig::default());
    let mut ctx = ctx();
    let mut session = filter.new_session(&ctx).unwrap();
    session.route_query(build_query("BEGIN"), &mut ctx).await.unwrap();
    feed_ok(&mut session, &mut ctx).await;
    session.route_query(build_query("COMMIT"), &mut ctx).await.unwrap();
    feed_ok(&mut session, &mut ctx).await;
    let diag = filter.diagnostics();
    assert_eq!(diag["success"], 1);
    assert_eq!(diag["rollback"], 0);
}
