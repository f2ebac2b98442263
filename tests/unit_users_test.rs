use std::net::IpAddr;
use std::time::Duration;

use sqlgate::core::session::auth::{scramble_response, verify_token};
use sqlgate::core::users::{
    native_password_hash, HostPattern, LookupError, RateLimiter, UserDatabase, UserEntry,
};

fn entry(user: &str, host: &str, password: &str) -> UserEntry {
    UserEntry {
        user: user.to_string(),
        host: HostPattern::parse(host),
        auth_plugin: "mysql_native_password".to_string(),
        auth_token_hash: native_password_hash(password),
        default_db: None,
        grants: Vec::new(),
        roles: Vec::new(),
        require_ssl: false,
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_host_pattern_matching() {
    assert!(HostPattern::parse("%").matches(ip("10.1.2.3")));
    assert!(HostPattern::parse("10.0.0.0/8").matches(ip("10.1.2.3")));
    assert!(!HostPattern::parse("10.0.0.0/8").matches(ip("192.168.0.1")));
    assert!(HostPattern::parse("192.168.0.7").matches(ip("192.168.0.7")));
    assert!(HostPattern::parse("192.168.%").matches(ip("192.168.4.5")));
    assert!(!HostPattern::parse("192.168.%").matches(ip("10.0.0.1")));
    // MySQL-style single-character wildcard.
    assert!(HostPattern::parse("10.0.0._").matches(ip("10.0.0.7")));
}

#[test]
fn test_lookup_prefers_most_specific_host() {
    let mut exact = entry("app", "10.0.0.1", "exact-pw");
    exact.default_db = Some("exact".to_string());
    let mut broad = entry("app", "%", "broad-pw");
    broad.default_db = Some("broad".to_string());
    // Insertion order reversed on purpose; specificity must win.
    let db = UserDatabase::new(vec![broad, exact], 1);
    let found = db.lookup("app", ip("10.0.0.1"), None, false).unwrap();
    assert_eq!(found.default_db.as_deref(), Some("exact"));
    let found = db.lookup("app", ip("10.0.0.2"), None, false).unwrap();
    assert_eq!(found.default_db.as_deref(), Some("broad"));
}

#[test]
fn test_lookup_errors() {
    let mut gated = entry("secure", "%", "pw");
    gated.require_ssl = true;
    let mut limited = entry("limited", "%", "pw");
    limited.grants = vec!["allowed_db".to_string()];
    let db = UserDatabase::new(vec![gated, limited], 1);

    assert_eq!(
        db.lookup("nobody", ip("127.0.0.1"), None, false).unwrap_err(),
        LookupError::UnknownUser
    );
    assert_eq!(
        db.lookup("secure", ip("127.0.0.1"), None, false).unwrap_err(),
        LookupError::NoSslConnection
    );
    assert!(db.lookup("secure", ip("127.0.0.1"), None, true).is_ok());
    assert_eq!(
        db.lookup("limited", ip("127.0.0.1"), Some("other_db"), false)
            .unwrap_err(),
        LookupError::NoDbAccess
    );
    assert!(db
        .lookup("limited", ip("127.0.0.1"), Some("allowed_db"), false)
        .is_ok());
}

#[test]
fn test_deduplication() {
    let db = UserDatabase::new(
        vec![entry("app", "%", "pw1"), entry("app", "%", "pw2")],
        1,
    );
    assert_eq!(db.len(), 1);
}

#[test]
fn test_native_password_token_verification() {
    let scramble: Vec<u8> = (1..=20).collect();
    let stored = native_password_hash("s3cret");
    // The client computes its token from the cleartext password.
    let stage1: Vec<u8> = {
        use sha1::{Digest, Sha1};
        Sha1::digest(b"s3cret").to_vec()
    };
    let token = scramble_response(&scramble, &stage1);
    let recovered = verify_token(&scramble, &stored, &token).expect("token must verify");
    // The recovered stage-1 hash lets the proxy answer backend scrambles.
    assert_eq!(recovered, stage1);

    // A wrong password fails.
    let bad_stage1: Vec<u8> = {
        use sha1::{Digest, Sha1};
        Sha1::digest(b"wrong").to_vec()
    };
    let bad_token = scramble_response(&scramble, &bad_stage1);
    assert!(verify_token(&scramble, &stored, &bad_token).is_none());
}

#[test]
fn test_passwordless_account() {
    let scramble: Vec<u8> = (1..=20).collect();
    assert!(verify_token(&scramble, &[], &[]).is_some());
    // An empty token against a real password hash fails.
    let stored = native_password_hash("pw");
    assert!(verify_token(&scramble, &stored, &[]).is_none());
}

#[test]
fn test_rate_limiter_window() {
    let limiter = RateLimiter::new(2, Duration::from_millis(50));
    assert!(limiter.allow());
    assert!(limiter.allow());
    assert!(!limiter.allow());
    std::thread::sleep(Duration::from_millis(80));
    assert!(limiter.allow());
}
