use std::net::{IpAddr, SocketAddr};

use sqlgate::core::protocol::proxy_header::{
    parse_binary_header, parse_text_header, preparse, AllowedNetworks, PreParseResult, BINARY_SIG,
};

#[test]
fn test_preparse_text() {
    let header = b"PROXY TCP4 192.168.0.1 10.0.0.1 56324 3306\r\n";
    assert_eq!(preparse(header), PreParseResult::Text(header.len()));
    // Trailing bytes after the terminator do not change the length.
    let mut with_tail = header.to_vec();
    with_tail.extend_from_slice(b"garbage");
    assert_eq!(preparse(&with_tail), PreParseResult::Text(header.len()));
}

#[test]
fn test_preparse_text_incomplete() {
    assert_eq!(preparse(b"PRO"), PreParseResult::Incomplete);
    assert_eq!(preparse(b"PROXY TCP4 1.2.3.4"), PreParseResult::Incomplete);
}

#[test]
fn test_preparse_binary() {
    let mut header = BINARY_SIG.to_vec();
    header.push(0x21); // v2, PROXY
    header.push(0x11); // TCP4
    header.extend_from_slice(&12u16.to_be_bytes());
    assert_eq!(preparse(&header), PreParseResult::Binary(16 + 12));
    // A signature prefix alone is incomplete.
    assert_eq!(preparse(&BINARY_SIG[..8]), PreParseResult::Incomplete);
}

#[test]
fn test_preparse_garbage_is_error() {
    assert_eq!(preparse(b"ABCDE"), PreParseResult::Error);
    assert_eq!(preparse(b"QUIT\r\n"), PreParseResult::Error);
}

#[test]
fn test_parse_text_tcp4() {
    let header = parse_text_header(b"PROXY TCP4 192.168.0.1 10.0.0.1 56324 3306\r\n").unwrap();
    let (src, dst) = header.addresses.unwrap();
    assert_eq!(src, "192.168.0.1:56324".parse::<SocketAddr>().unwrap());
    assert_eq!(dst, "10.0.0.1:3306".parse::<SocketAddr>().unwrap());
}

#[test]
fn test_parse_text_unknown_accepted() {
    let header = parse_text_header(b"PROXY UNKNOWN\r\n").unwrap();
    assert!(header.addresses.is_none());
}

#[test]
fn test_parse_text_family_mismatch_rejected() {
    assert!(parse_text_header(b"PROXY TCP6 192.168.0.1 10.0.0.1 1 2\r\n").is_err());
    assert!(parse_text_header(b"PROXY TCP4 ::1 ::2 1 2\r\n").is_err());
}

#[test]
fn test_parse_binary_tcp4() {
    let mut header = BINARY_SIG.to_vec();
    header.push(0x21);
    header.push(0x11);
    header.extend_from_slice(&12u16.to_be_bytes());
    header.extend_from_slice(&[192, 168, 0, 1]);
    header.extend_from_slice(&[10, 0, 0, 1]);
    header.extend_from_slice(&56324u16.to_be_bytes());
    header.extend_from_slice(&3306u16.to_be_bytes());
    let parsed = parse_binary_header(&header).unwrap();
    let (src, dst) = parsed.addresses.unwrap();
    assert_eq!(src, "192.168.0.1:56324".parse::<SocketAddr>().unwrap());
    assert_eq!(dst, "10.0.0.1:3306".parse::<SocketAddr>().unwrap());
}

#[test]
fn test_parse_binary_local_command() {
    let mut header = BINARY_SIG.to_vec();
    header.push(0x20); // v2, LOCAL
    header.push(0x00);
    header.extend_from_slice(&0u16.to_be_bytes());
    let parsed = parse_binary_header(&header).unwrap();
    assert!(parsed.addresses.is_none());
}

#[test]
fn test_parse_binary_bad_version() {
    let mut header = BINARY_SIG.to_vec();
    header.push(0x11); // v1 is invalid for the binary form
    header.push(0x11);
    header.extend_from_slice(&0u16.to_be_bytes());
    assert!(parse_binary_header(&header).is_err());
}

#[test]
fn test_allowed_networks() {
    let networks = AllowedNetworks::parse("127.0.0.1, 10.0.0.0/8").unwrap();
    assert!(networks.is_allowed("127.0.0.1".parse::<IpAddr>().unwrap()));
    assert!(networks.is_allowed("10.1.2.3".parse::<IpAddr>().unwrap()));
    assert!(!networks.is_allowed("192.168.0.1".parse::<IpAddr>().unwrap()));

    let wildcard = AllowedNetworks::parse("*").unwrap();
    assert!(wildcard.is_allowed("8.8.8.8".parse::<IpAddr>().unwrap()));

    assert!(AllowedNetworks::parse("").is_err());
    assert!(AllowedNetworks::parse("not-a-network").is_err());
}
