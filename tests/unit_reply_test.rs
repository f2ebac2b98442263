use sqlgate::core::protocol::codec::build_packet;
use sqlgate::core::protocol::constants::{Capabilities, Command};
use sqlgate::core::protocol::packets::OkPacket;
use sqlgate::core::protocol::reply::{ReplyEvent, ReplyTracker};
use sqlgate::core::protocol::StatusFlags;

fn ok_body(status: StatusFlags) -> Vec<u8> {
    OkPacket::build(0, 0, status)
}

#[test]
fn test_ok_reply_completes() {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Ping);
    let event = tracker
        .process(&build_packet(1, &ok_body(StatusFlags::AUTOCOMMIT)))
        .unwrap();
    assert_eq!(event, ReplyEvent::Complete);
    assert!(tracker.is_complete());
    assert!(tracker.error().is_none());
}

#[test]
fn test_err_reply_completes_with_error() {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Query);
    let body = sqlgate::core::protocol::packets::ErrPacket::build(1064, "42000", "syntax");
    let event = tracker.process(&build_packet(1, &body)).unwrap();
    assert_eq!(event, ReplyEvent::Complete);
    assert_eq!(tracker.error().unwrap().code, 1064);
}

#[test]
fn test_classic_result_set() {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Query);
    // column count = 2
    assert_eq!(
        tracker.process(&build_packet(1, &[0x02])).unwrap(),
        ReplyEvent::InProgress
    );
    // two column definitions
    for seq in 2..4 {
        assert_eq!(
            tracker.process(&build_packet(seq, b"coldef")).unwrap(),
            ReplyEvent::InProgress
        );
    }
    // EOF after definitions
    assert_eq!(
        tracker
            .process(&build_packet(4, &[0xFE, 0, 0, 0x02, 0]))
            .unwrap(),
        ReplyEvent::InProgress
    );
    // two rows
    assert_eq!(
        tracker.process(&build_packet(5, b"row1")).unwrap(),
        ReplyEvent::InProgress
    );
    assert!(tracker.in_result_rows());
    assert_eq!(
        tracker.process(&build_packet(6, b"row2")).unwrap(),
        ReplyEvent::InProgress
    );
    // terminal EOF
    assert_eq!(
        tracker
            .process(&build_packet(7, &[0xFE, 0, 0, 0x02, 0]))
            .unwrap(),
        ReplyEvent::Complete
    );
    assert_eq!(tracker.rows(), 2);
    assert_eq!(tracker.field_count(), 2);
}

#[test]
fn test_more_results_continue() {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Query);
    let first = ok_body(StatusFlags::AUTOCOMMIT | StatusFlags::MORE_RESULTS_EXISTS);
    assert_eq!(
        tracker.process(&build_packet(1, &first)).unwrap(),
        ReplyEvent::InProgress
    );
    assert!(!tracker.is_complete());
    let last = ok_body(StatusFlags::AUTOCOMMIT);
    assert_eq!(
        tracker.process(&build_packet(2, &last)).unwrap(),
        ReplyEvent::Complete
    );
}

#[test]
fn test_local_infile_request() {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::Query);
    let mut body = vec![0xFB];
    body.extend_from_slice(b"maxscale.data");
    assert_eq!(
        tracker.process(&build_packet(1, &body)).unwrap(),
        ReplyEvent::FileRequest
    );
    assert!(!tracker.is_complete());
    // After the client streamed the file, the final OK completes.
    assert_eq!(
        tracker
            .process(&build_packet(4, &ok_body(StatusFlags::AUTOCOMMIT)))
            .unwrap(),
        ReplyEvent::Complete
    );
}

#[test]
fn test_prepare_ok_metadata() {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::StmtPrepare);
    // PREPARE-OK: stmt id 1, 1 column, 2 params.
    let mut body = vec![0x00];
    body.extend_from_slice(&1u32.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(
        tracker.process(&build_packet(1, &body)).unwrap(),
        ReplyEvent::InProgress
    );
    // two param definitions + EOF
    tracker.process(&build_packet(2, b"param1")).unwrap();
    tracker.process(&build_packet(3, b"param2")).unwrap();
    tracker.process(&build_packet(4, &[0xFE, 0, 0, 0, 0])).unwrap();
    // one column definition + EOF completes
    tracker.process(&build_packet(5, b"col1")).unwrap();
    let event = tracker.process(&build_packet(6, &[0xFE, 0, 0, 0, 0])).unwrap();
    assert_eq!(event, ReplyEvent::Complete);
    assert_eq!(tracker.ps_id(), 1);
    assert_eq!(tracker.param_count(), 2);
    assert_eq!(tracker.field_count(), 1);
}

#[test]
fn test_deprecate_eof_rows_end_with_ok() {
    let mut tracker = ReplyTracker::new(Capabilities::DEPRECATE_EOF);
    tracker.start(Command::Query);
    tracker.process(&build_packet(1, &[0x01])).unwrap();
    tracker.process(&build_packet(2, b"coldef")).unwrap();
    // No EOF between definitions and rows.
    tracker.process(&build_packet(3, b"row")).unwrap();
    // Terminal OK with 0xFE header.
    let mut terminal = ok_body(StatusFlags::AUTOCOMMIT);
    terminal[0] = 0xFE;
    let event = tracker.process(&build_packet(4, &terminal)).unwrap();
    assert_eq!(event, ReplyEvent::Complete);
    assert_eq!(tracker.rows(), 1);
}
