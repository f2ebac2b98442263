use sqlgate::core::filter::insert_stream::{InsertStreamConfig, InsertStreamFilter};
use sqlgate::core::filter::{DownstreamAction, FilterCtx, FilterModule, FilterSession, SessionScope};
use sqlgate::core::protocol::codec::{build_packet, build_query, peek_header, sql_of};
use sqlgate::core::protocol::constants::{Capabilities, Command, HEADER_LEN, LOCAL_INFILE_MARKER};
use sqlgate::core::protocol::reply::ReplyTracker;
use sqlgate::core::session::auth::BackendAuth;
use sqlgate::core::state::Registry;

fn ctx_in_trx() -> FilterCtx {
    FilterCtx {
        session_id: 1,
        user: "app".to_string(),
        remote: "127.0.0.1:5000".to_string(),
        service: "svc".to_string(),
        registry: Registry::new(),
        db: None,
        backend_auth: BackendAuth::default(),
        in_trx: true,
        trx_read_only: false,
        request_seq: 0,
        kill_session: false,
    }
}

fn new_session(ctx: &FilterCtx) -> Box<dyn FilterSession> {
    InsertStreamFilter::new(
        "insertstream",
        InsertStreamConfig {
            scope: SessionScope::default(),
        },
    )
    .new_session(ctx)
    .unwrap()
}

/// A tracker armed with the file-request reply of the LOAD DATA statement.
fn file_request_tracker() -> (ReplyTracker, sqlgate::core::buffer::BufChain) {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Query);
    let mut body = vec![LOCAL_INFILE_MARKER];
    body.extend_from_slice(b"maxscale.data");
    let packet = build_packet(1, &body);
    tracker.process(&packet).unwrap();
    (tracker, packet)
}

#[tokio::test]
async fn test_bulk_insert_becomes_load_data() {
    let mut ctx = ctx_in_trx();
    let mut session = new_session(&ctx);
    let action = session
        .route_query(build_query("INSERT INTO t1 VALUES (1,'a'),(2,'b')"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(
                sql_of(&packet).as_deref(),
                Some(
                    "LOAD DATA LOCAL INFILE 'maxscale.data' INTO TABLE t1 \
                     FIELDS TERMINATED BY ',' LINES TERMINATED BY '\\n'"
                )
            );
        }
        _ => panic!("expected the LOAD DATA statement"),
    }
}

#[tokio::test]
async fn test_file_request_streams_rows_and_synthesizes_ok() {
    let mut ctx = ctx_in_trx();
    let mut session = new_session(&ctx);
    session
        .route_query(build_query("INSERT INTO t1 VALUES (1,'a'),(2,'b')"), &mut ctx)
        .await
        .unwrap();

    let (tracker, reply_packet) = file_request_tracker();
    let verdict = session
        .client_reply(reply_packet, &tracker, &mut ctx)
        .await
        .unwrap();

    // The client gets a synthesized OK.
    let ok = verdict.to_client.expect("an OK for the client");
    assert_eq!(ok.byte_at(HEADER_LEN), Some(0x00));
    // The backend gets the CSV rows with the next sequence in the chain.
    assert_eq!(verdict.to_backend.len(), 1);
    let data = &verdict.to_backend[0];
    assert_eq!(peek_header(data).unwrap().seq, 2);
    assert_eq!(&data.to_vec()[HEADER_LEN..], b"1,'a'\n2,'b'\n");
}

#[tokio::test]
async fn test_followup_insert_streams_more_rows() {
    let mut ctx = ctx_in_trx();
    let mut session = new_session(&ctx);
    session
        .route_query(build_query("INSERT INTO t1 VALUES (1,'a'),(2,'b')"), &mut ctx)
        .await
        .unwrap();
    let (tracker, reply_packet) = file_request_tracker();
    session
        .client_reply(reply_packet, &tracker, &mut ctx)
        .await
        .unwrap();

    let action = session
        .route_query(build_query("INSERT INTO t1 VALUES (3,'c')"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::RespondAndForward { reply, forward } => {
            assert_eq!(reply.byte_at(HEADER_LEN), Some(0x00));
            assert_eq!(forward.len(), 1);
            assert_eq!(&forward[0].to_vec()[HEADER_LEN..], b"3,'c'\n");
            // Sequence continues where the first data packet left off.
            assert_eq!(peek_header(&forward[0]).unwrap().seq, 3);
        }
        _ => panic!("expected a streamed row plus a synthesized OK"),
    }
}

#[tokio::test]
async fn test_non_insert_closes_stream_with_empty_packet() {
    let mut ctx = ctx_in_trx();
    let mut session = new_session(&ctx);
    session
        .route_query(build_query("INSERT INTO t1 VALUES (1,'a')"), &mut ctx)
        .await
        .unwrap();
    let (tracker, reply_packet) = file_request_tracker();
    session
        .client_reply(reply_packet, &tracker, &mut ctx)
        .await
        .unwrap();

    let action = session
        .route_query(build_query("COMMIT"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::ForwardMany(packets) => {
            assert_eq!(packets.len(), 2);
            // The empty terminating packet first, then the trailing query.
            assert_eq!(peek_header(&packets[0]).unwrap().payload_len, 0);
            assert_eq!(sql_of(&packets[1]).as_deref(), Some("COMMIT"));
        }
        _ => panic!("expected stream close plus the trailing statement"),
    }
}

#[tokio::test]
async fn test_table_mismatch_closes_and_routes_normally() {
    let mut ctx = ctx_in_trx();
    let mut session = new_session(&ctx);
    session
        .route_query(build_query("INSERT INTO t1 VALUES (1,'a')"), &mut ctx)
        .await
        .unwrap();
    let (tracker, reply_packet) = file_request_tracker();
    session
        .client_reply(reply_packet, &tracker, &mut ctx)
        .await
        .unwrap();

    let action = session
        .route_query(build_query("INSERT INTO t2 VALUES (9)"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::ForwardMany(packets) => {
            assert_eq!(peek_header(&packets[0]).unwrap().payload_len, 0);
            assert_eq!(sql_of(&packets[1]).as_deref(), Some("INSERT INTO t2 VALUES (9)"));
        }
        _ => panic!("expected stream close"),
    }
}

#[tokio::test]
async fn test_no_stream_outside_transaction() {
    let mut ctx = ctx_in_trx();
    ctx.in_trx = false;
    let mut session = new_session(&ctx);
    let action = session
        .route_query(build_query("INSERT INTO t1 VALUES (1)"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert_eq!(sql_of(&packet).as_deref(), Some("INSERT INTO t1 VALUES (1)"));
        }
        _ => panic!("expected untouched insert"),
    }
}

#[tokio::test]
async fn test_explicit_column_list_not_streamed() {
    let mut ctx = ctx_in_trx();
    let mut session = new_session(&ctx);
    let action = session
        .route_query(build_query("INSERT INTO t1 (a, b) VALUES (1, 2)"), &mut ctx)
        .await
        .unwrap();
    match action {
        DownstreamAction::Forward(packet) => {
            assert!(sql_of(&packet).unwrap().starts_with("INSERT INTO t1 (a, b)"));
        }
        _ => panic!("expected untouched insert"),
    }
}
