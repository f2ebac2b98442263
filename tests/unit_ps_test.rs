use sqlgate::core::classifier::ps::{args_to_sql, find_placeholders, PsTracker};
use sqlgate::core::protocol::codec::build_packet;
use sqlgate::core::protocol::constants::{field_types, Capabilities, Command};
use sqlgate::core::protocol::reply::ReplyTracker;

fn prepare_packet(sql: &str) -> sqlgate::core::buffer::BufChain {
    let mut body = vec![Command::StmtPrepare.as_byte()];
    body.extend_from_slice(sql.as_bytes());
    build_packet(0, &body)
}

/// Drives a PREPARE-OK reply through a tracker: stmt id, no columns,
/// `params` parameter definitions.
fn prepare_ok(stmt_id: u32, params: u16) -> ReplyTracker {
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::StmtPrepare);
    let mut body = vec![0x00];
    body.extend_from_slice(&stmt_id.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&params.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&0u16.to_le_bytes());
    tracker.process(&build_packet(1, &body)).unwrap();
    for i in 0..params {
        tracker.process(&build_packet(2 + i as u8, b"paramdef")).unwrap();
    }
    if params > 0 {
        tracker
            .process(&build_packet(2 + params as u8, &[0xFE, 0, 0, 0, 0]))
            .unwrap();
    }
    assert!(tracker.is_complete());
    tracker
}

/// Builds a COM_STMT_EXECUTE packet. `types` is `(type, unsigned)` per
/// parameter; empty means "no fresh descriptors" (reuse cached).
fn execute_packet(
    stmt_id: u32,
    param_count: usize,
    null_bits: &[usize],
    types: &[(u8, bool)],
    values: &[u8],
) -> sqlgate::core::buffer::BufChain {
    let mut body = vec![Command::StmtExecute.as_byte()];
    body.extend_from_slice(&stmt_id.to_le_bytes());
    body.push(0); // flags
    body.extend_from_slice(&1u32.to_le_bytes()); // iteration count
    let mut bitmap = vec![0u8; (param_count + 7) / 8];
    for &bit in null_bits {
        bitmap[bit / 8] |= 1 << (bit % 8);
    }
    body.extend_from_slice(&bitmap);
    if types.is_empty() {
        body.push(0);
    } else {
        body.push(1);
        for &(ty, unsigned) in types {
            body.push(ty);
            body.push(if unsigned { 0x80 } else { 0x00 });
        }
    }
    body.extend_from_slice(values);
    build_packet(0, &body)
}

#[test]
fn test_find_placeholders_skips_literals_and_comments() {
    let sql = "SELECT '?', `a?b`, /* ? */ ? FROM t -- ?\n WHERE x = ? # ?";
    let offsets = find_placeholders(sql);
    assert_eq!(offsets.len(), 2);
    for &offset in &offsets {
        assert_eq!(sql.as_bytes()[offset], b'?');
    }
}

#[test]
fn test_prepare_execute_renders_canonical_sql() {
    let sql = "SELECT ? FROM test.t1 WHERE id = ? OR 1 = 1";
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet(sql));
    ps.track_reply(&prepare_ok(1, 2));
    assert_eq!(ps.prepared_sql(1), Some(sql));

    // First EXECUTE carries TINY UNSIGNED descriptors and values 1, 1.
    let exec = execute_packet(
        1,
        2,
        &[],
        &[(field_types::TINY, true), (field_types::TINY, true)],
        &[1, 1],
    );
    let rendered = ps.to_sql(&exec).unwrap();
    assert_eq!(rendered, "SELECT 1 FROM test.t1 WHERE id = 1 OR 1 = 1");

    // A second EXECUTE without descriptors reuses the cached types and
    // renders identically.
    let exec2 = execute_packet(1, 2, &[], &[], &[1, 1]);
    assert_eq!(ps.to_sql(&exec2).unwrap(), rendered);
}

#[test]
fn test_execute_without_cached_types_fails_gracefully() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?"));
    ps.track_reply(&prepare_ok(3, 1));
    let exec = execute_packet(3, 1, &[], &[], &[1]);
    assert!(ps.to_sql(&exec).is_none());
}

#[test]
fn test_null_bitmap() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?, ?"));
    ps.track_reply(&prepare_ok(1, 2));
    let exec = execute_packet(
        1,
        2,
        &[0],
        &[(field_types::TINY, false), (field_types::TINY, false)],
        &[5],
    );
    assert_eq!(ps.to_sql(&exec).unwrap(), "SELECT NULL, 5");
}

#[test]
fn test_signed_and_unsigned_integers() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?, ?, ?"));
    ps.track_reply(&prepare_ok(1, 3));
    let mut values = vec![0xFFu8]; // TINY signed -1
    values.extend_from_slice(&(-2i32).to_le_bytes()); // LONG signed
    values.extend_from_slice(&u64::MAX.to_le_bytes()); // LONGLONG unsigned
    let exec = execute_packet(
        1,
        3,
        &[],
        &[
            (field_types::TINY, false),
            (field_types::LONG, false),
            (field_types::LONGLONG, true),
        ],
        &values,
    );
    assert_eq!(
        ps.to_sql(&exec).unwrap(),
        format!("SELECT -1, -2, {}", u64::MAX)
    );
}

#[test]
fn test_string_parameter_quote_doubling() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?"));
    ps.track_reply(&prepare_ok(1, 1));
    let text = b"it's";
    let mut values = vec![text.len() as u8];
    values.extend_from_slice(text);
    let exec = execute_packet(1, 1, &[], &[(field_types::VAR_STRING, false)], &values);
    assert_eq!(ps.to_sql(&exec).unwrap(), "SELECT 'it''s'");
}

#[test]
fn test_timestamp_rendering() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?, ?, ?"));
    ps.track_reply(&prepare_ok(1, 3));
    let mut values = Vec::new();
    // Zero-length timestamp: the sentinel.
    values.push(0);
    // 4-byte date: 2024-02-29.
    values.push(4);
    values.extend_from_slice(&2024u16.to_le_bytes());
    values.push(2);
    values.push(29);
    // 11-byte datetime with microseconds: 2024-02-29 13:07:09.000123.
    values.push(11);
    values.extend_from_slice(&2024u16.to_le_bytes());
    values.push(2);
    values.push(29);
    values.push(13);
    values.push(7);
    values.push(9);
    values.extend_from_slice(&123u32.to_le_bytes());
    let exec = execute_packet(
        1,
        3,
        &[],
        &[
            (field_types::TIMESTAMP, false),
            (field_types::TIMESTAMP, false),
            (field_types::DATETIME, false),
        ],
        &values,
    );
    assert_eq!(
        ps.to_sql(&exec).unwrap(),
        "SELECT '0000-00-00 00:00:00', '2024-02-29', '2024-02-29 13:07:09.000123'"
    );
}

#[test]
fn test_negative_time_rendering() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?"));
    ps.track_reply(&prepare_ok(1, 1));
    // 8-byte TIME: negative, 1 day 2:03:04.
    let mut values = vec![8u8, 1];
    values.extend_from_slice(&1u32.to_le_bytes());
    values.extend_from_slice(&[2, 3, 4]);
    let exec = execute_packet(1, 1, &[], &[(field_types::TIME, false)], &values);
    assert_eq!(ps.to_sql(&exec).unwrap(), "SELECT '-26:03:04'");
}

#[test]
fn test_stmt_close_removes_entry() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?"));
    ps.track_reply(&prepare_ok(9, 1));
    assert_eq!(ps.len(), 1);
    let mut body = vec![Command::StmtClose.as_byte()];
    body.extend_from_slice(&9u32.to_le_bytes());
    ps.track_query(&build_packet(0, &body));
    assert!(ps.is_empty());
}

#[test]
fn test_failed_prepare_not_recorded() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?"));
    let mut tracker = ReplyTracker::new(Capabilities::empty());
    tracker.start(Command::StmtPrepare);
    let body = sqlgate::core::protocol::packets::ErrPacket::build(1064, "42000", "syntax");
    tracker.process(&build_packet(1, &body)).unwrap();
    ps.track_reply(&tracker);
    assert!(ps.is_empty());
}

#[test]
fn test_execute_carries_types_detection() {
    let mut ps = PsTracker::new();
    ps.track_query(&prepare_packet("SELECT ?"));
    ps.track_reply(&prepare_ok(1, 1));
    let with_types = execute_packet(1, 1, &[], &[(field_types::TINY, false)], &[1]);
    assert!(ps.execute_carries_types(&with_types));
    let without = execute_packet(1, 1, &[], &[], &[1]);
    assert!(!ps.execute_carries_types(&without));
}

#[test]
fn test_args_to_sql_substitution() {
    let sql = "SELECT ? + ?";
    let offsets = find_placeholders(sql);
    let prep = sqlgate::core::classifier::ps::PreparedRef {
        sql: sql.to_string(),
        param_offsets: offsets,
    };
    assert_eq!(args_to_sql(&prep, &["1".into(), "2".into()]), "SELECT 1 + 2");
}
