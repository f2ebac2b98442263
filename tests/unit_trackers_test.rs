use sqlgate::core::classifier::TypeMask;
use sqlgate::core::protocol::codec::build_packet;
use sqlgate::core::session::trackers::{
    ChangeTracker, MultiPartTracker, SessionChange, TrxTracker,
};

#[test]
fn test_multipart_tracker_lag() {
    let mut tracker = MultiPartTracker::default();
    // A normal packet.
    tracker.track_query(&build_packet(0, b"short"));
    assert!(!tracker.should_ignore());

    // A packet announcing continuation.
    let mut large = vec![0xFF, 0xFF, 0xFF, 0x00];
    large.extend_from_slice(&[0u8; 8]);
    tracker.track_query(&sqlgate::core::buffer::BufChain::from_vec(large));
    assert!(!tracker.should_ignore());

    // The continuation itself must be ignored by classification.
    tracker.track_query(&build_packet(1, b"tail"));
    assert!(tracker.should_ignore());

    // Back to normal afterwards.
    tracker.track_query(&build_packet(0, b"next"));
    assert!(!tracker.should_ignore());
}

#[test]
fn test_trx_tracker_explicit() {
    let mut trx = TrxTracker::new();
    assert!(!trx.is_trx_active());
    assert!(trx.is_autocommit());

    trx.track(TypeMask::BEGIN_TRX);
    assert!(trx.is_trx_active());
    assert!(trx.is_trx_read_only());

    trx.track(TypeMask::WRITE);
    assert!(!trx.is_trx_read_only());

    trx.track(TypeMask::COMMIT);
    assert!(!trx.is_trx_active());
    assert!(trx.is_trx_read_only());
}

#[test]
fn test_trx_tracker_read_write_marker() {
    let mut trx = TrxTracker::new();
    trx.track(TypeMask::BEGIN_TRX | TypeMask::READ_WRITE_TRX);
    assert!(!trx.is_trx_read_only());
    trx.track(TypeMask::ROLLBACK);
    assert!(!trx.is_trx_active());
}

#[test]
fn test_trx_tracker_autocommit_off_starts_implicit_trx() {
    let mut trx = TrxTracker::new();
    trx.track(TypeMask::DISABLE_AUTOCOMMIT | TypeMask::SESSION_WRITE);
    assert!(!trx.is_autocommit());
    assert!(trx.is_trx_starting(TypeMask::READ));

    trx.track(TypeMask::READ);
    assert!(trx.is_trx_active());
    assert!(trx.is_trx_read_only());

    trx.track(TypeMask::ENABLE_AUTOCOMMIT | TypeMask::SESSION_WRITE);
    assert!(trx.is_autocommit());
    assert!(!trx.is_trx_active());
}

#[test]
fn test_change_tracker_commit() {
    let mut change = ChangeTracker::default();
    assert!(!change.is_pending());
    change.set_pending(SessionChange::Db("test".to_string()));
    assert!(change.is_pending());
    assert_eq!(change.commit(), SessionChange::Db("test".to_string()));
    assert!(!change.is_pending());
}

#[test]
fn test_change_tracker_discard() {
    let mut change = ChangeTracker::default();
    change.set_pending(SessionChange::User("other".to_string()));
    change.discard();
    assert!(!change.is_pending());
    assert_eq!(change.commit(), SessionChange::None);
}
