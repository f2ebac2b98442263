use sqlgate::core::protocol::codec::build_query;
use sqlgate::core::router::SessionCommandHistory;

#[test]
fn test_record_in_order() {
    let mut history = SessionCommandHistory::new(10);
    let a = history.record(&build_query("USE test"));
    let b = history.record(&build_query("SET NAMES utf8"));
    assert!(a < b);
    assert_eq!(history.len(), 2);
    let sqls: Vec<Vec<u8>> = history.iter().map(|c| c.packet.to_vec()).collect();
    assert_eq!(&sqls[0][5..], b"USE test");
    assert_eq!(&sqls[1][5..], b"SET NAMES utf8");
}

#[test]
fn test_checksum_assignment() {
    let mut history = SessionCommandHistory::new(10);
    let id = history.record(&build_query("SET NAMES utf8"));
    history.set_checksum(id, 0xDEAD);
    assert_eq!(history.iter().next().unwrap().checksum, Some(0xDEAD));
}

#[test]
fn test_overflow_disables_verification() {
    let mut history = SessionCommandHistory::new(2);
    assert!(history.verifiable());
    history.record(&build_query("SET a=1"));
    history.record(&build_query("SET a=2"));
    history.record(&build_query("SET a=3"));
    // Bounded: the oldest entry was discarded.
    assert_eq!(history.len(), 2);
    assert!(!history.verifiable());
}

#[test]
fn test_recorded_packet_is_detached() {
    let mut history = SessionCommandHistory::new(10);
    let mut packet = build_query("USE test");
    history.record(&packet);
    // Mutating the original must not reach the recorded clone.
    packet.ensure_unique();
    packet.write_at(5, b'X').unwrap();
    let stored = history.at(0).unwrap().packet.to_vec();
    assert_eq!(&stored[5..], b"USE test");
}

#[test]
fn test_reply_checksum_stability() {
    let a = SessionCommandHistory::reply_checksum(b"reply bytes");
    let b = SessionCommandHistory::reply_checksum(b"reply bytes");
    let c = SessionCommandHistory::reply_checksum(b"other bytes");
    assert_eq!(a, b);
    assert_ne!(a, c);
}
