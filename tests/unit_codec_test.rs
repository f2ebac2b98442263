use sqlgate::core::buffer::BufChain;
use sqlgate::core::protocol::codec::{
    build_packet, build_query, command_of, next_packet, peek_header, set_sequence, sql_of,
    stmt_id_of,
};
use sqlgate::core::protocol::constants::{Command, MAX_PAYLOAD_LEN};

#[test]
fn test_peek_header() {
    let mut data = vec![0x03, 0x00, 0x00, 0x02];
    data.extend_from_slice(b"abc");
    let chain = BufChain::from_vec(data);
    let header = peek_header(&chain).unwrap();
    assert_eq!(header.payload_len, 3);
    assert_eq!(header.seq, 2);
    assert!(!header.is_large());
}

#[test]
fn test_peek_header_incomplete() {
    let chain = BufChain::from_slice(&[0x03, 0x00]);
    assert!(peek_header(&chain).is_none());
}

#[test]
fn test_next_packet_peels_one() {
    let mut chain = BufChain::new();
    chain.append(build_packet(0, b"first"));
    chain.append(build_packet(1, b"second!"));
    let first = next_packet(&mut chain).unwrap();
    assert_eq!(first.len(), 4 + 5);
    assert_eq!(&first.to_vec()[4..], b"first");
    let second = next_packet(&mut chain).unwrap();
    assert_eq!(&second.to_vec()[4..], b"second!");
    assert!(next_packet(&mut chain).is_none());
}

#[test]
fn test_next_packet_waits_for_full_body() {
    let mut chain = BufChain::from_slice(&[0x05, 0x00, 0x00, 0x00, b'a', b'b']);
    assert!(next_packet(&mut chain).is_none());
    chain.append_bytes(b"cde");
    let packet = next_packet(&mut chain).unwrap();
    assert_eq!(&packet.to_vec()[4..], b"abcde");
}

#[test]
fn test_large_packet_marker() {
    let mut header = vec![0xFF, 0xFF, 0xFF, 0x00];
    header.extend_from_slice(&vec![0u8; 16]);
    let chain = BufChain::from_vec(header);
    assert!(peek_header(&chain).unwrap().is_large());
    assert_eq!(peek_header(&chain).unwrap().payload_len, MAX_PAYLOAD_LEN);
}

#[test]
fn test_build_query_and_sql_of() {
    let packet = build_query("SELECT 1");
    assert_eq!(command_of(&packet), Some(Command::Query));
    assert_eq!(sql_of(&packet).as_deref(), Some("SELECT 1"));
}

#[test]
fn test_stmt_id_of() {
    let mut body = vec![Command::StmtExecute.as_byte()];
    body.extend_from_slice(&7u32.to_le_bytes());
    body.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00]);
    let packet = build_packet(0, &body);
    assert_eq!(stmt_id_of(&packet), Some(7));
}

#[test]
fn test_set_sequence_copies_on_write() {
    let mut packet = build_packet(0, b"x");
    let sibling = packet.shallow_clone();
    set_sequence(&mut packet, 5).unwrap();
    assert_eq!(peek_header(&packet).unwrap().seq, 5);
    // The clone kept the original sequence.
    assert_eq!(peek_header(&sibling).unwrap().seq, 0);
}
