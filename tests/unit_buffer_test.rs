use sqlgate::core::buffer::{BufChain, RoutingHint};

#[test]
fn test_len_and_append() {
    let mut chain = BufChain::from_slice(b"hello");
    assert_eq!(chain.len(), 5);
    chain.append(BufChain::from_slice(b" world"));
    assert_eq!(chain.len(), 11);
    assert_eq!(chain.to_vec(), b"hello world");
}

#[test]
fn test_append_bytes_extends_unique_tail_in_place() {
    let mut chain = BufChain::from_slice(b"abc");
    chain.append_bytes(b"def");
    assert_eq!(chain.segment_count(), 1);
    assert_eq!(chain.to_vec(), b"abcdef");
}

#[test]
fn test_append_bytes_allocates_when_shared() {
    let mut chain = BufChain::from_slice(b"abc");
    let clone = chain.shallow_clone();
    chain.append_bytes(b"def");
    // The sibling must not observe the new bytes.
    assert_eq!(clone.to_vec(), b"abc");
    assert_eq!(chain.to_vec(), b"abcdef");
    assert_eq!(chain.segment_count(), 2);
}

#[test]
fn test_consume_saturates() {
    let mut chain = BufChain::from_slice(b"abcdef");
    assert_eq!(chain.consume(4), 4);
    assert_eq!(chain.to_vec(), b"ef");
    assert_eq!(chain.consume(10), 2);
    assert!(chain.is_empty());
}

#[test]
fn test_consume_exact_underflow() {
    let mut chain = BufChain::from_slice(b"abc");
    assert!(chain.consume_exact(4).is_err());
    // The failed call must not have modified the chain.
    assert_eq!(chain.to_vec(), b"abc");
    assert!(chain.consume_exact(3).is_ok());
    assert!(chain.is_empty());
}

#[test]
fn test_split_front_zero_copy() {
    let mut chain = BufChain::from_slice(b"abcdef");
    let head = chain.split_front(4);
    assert_eq!(head.to_vec(), b"abcd");
    assert_eq!(chain.to_vec(), b"ef");
    // No copy happened: both reference the original region.
    assert_eq!(head.segment_count(), 1);
    assert_eq!(chain.segment_count(), 1);
}

#[test]
fn test_split_then_append_roundtrip() {
    let mut chain = BufChain::from_slice(b"the quick brown fox");
    let original = chain.to_vec();
    let mut head = chain.split_front(9);
    head.append(chain);
    assert_eq!(head.to_vec(), original);
}

#[test]
fn test_rtrim_leaves_empty_but_present() {
    let mut chain = BufChain::from_slice(b"abc");
    chain.add_hint(RoutingHint::Master);
    chain.rtrim(10);
    assert!(chain.is_empty());
    assert_eq!(chain.len(), 0);
    // The value survives an over-trim.
    assert_eq!(chain.hints(), &[RoutingHint::Master]);
}

#[test]
fn test_rtrim_partial() {
    let mut chain = BufChain::from_slice(b"abc");
    chain.append(BufChain::from_slice(b"def"));
    chain.rtrim(4);
    assert_eq!(chain.to_vec(), b"ab");
}

#[test]
fn test_copy_data_best_effort() {
    let mut chain = BufChain::from_slice(b"abc");
    chain.append(BufChain::from_slice(b"defgh"));
    let mut out = [0u8; 4];
    assert_eq!(chain.copy_data(2, 4, &mut out), 4);
    assert_eq!(&out, b"cdef");
    // Past the end, only what exists is copied.
    assert_eq!(chain.copy_data(6, 4, &mut out), 2);
    assert_eq!(&out[..2], b"gh");
    assert_eq!(chain.copy_data(100, 4, &mut out), 0);
}

#[test]
fn test_byte_at() {
    let mut chain = BufChain::from_slice(b"ab");
    chain.append(BufChain::from_slice(b"cd"));
    assert_eq!(chain.byte_at(0), Some(b'a'));
    assert_eq!(chain.byte_at(2), Some(b'c'));
    assert_eq!(chain.byte_at(3), Some(b'd'));
    assert_eq!(chain.byte_at(4), None);
}

#[test]
fn test_make_contiguous_preserves_bytes() {
    let mut chain = BufChain::from_slice(b"ab");
    chain.append(BufChain::from_slice(b"cd"));
    chain.append(BufChain::from_slice(b"ef"));
    assert_eq!(chain.segment_count(), 3);
    let before = chain.to_vec();
    assert_eq!(chain.make_contiguous(), before.as_slice());
    assert_eq!(chain.segment_count(), 1);
    assert_eq!(chain.to_vec(), before);
}

#[test]
fn test_deep_clone_isolates_mutation() {
    let chain = BufChain::from_slice(b"abcdef");
    let mut clone = chain.deep_clone();
    clone.ensure_unique();
    clone.write_at(0, b'X').unwrap();
    assert_eq!(chain.to_vec(), b"abcdef");
    assert_eq!(clone.byte_at(0), Some(b'X'));
}

#[test]
fn test_ensure_unique_detaches_shared_regions() {
    let mut chain = BufChain::from_slice(b"abcdef");
    let sibling = chain.shallow_clone();
    chain.ensure_unique();
    chain.write_at(0, b'X').unwrap();
    // No byte observable through the sibling changed.
    assert_eq!(sibling.to_vec(), b"abcdef");
}

#[test]
fn test_write_at_refuses_shared_region() {
    let mut chain = BufChain::from_slice(b"abc");
    let _sibling = chain.shallow_clone();
    assert!(chain.write_at(0, b'X').is_err());
}

#[test]
fn test_sibling_unaffected_by_consume() {
    let mut chain = BufChain::from_slice(b"abcdef");
    let sibling = chain.shallow_clone();
    chain.consume(3);
    chain.rtrim(1);
    assert_eq!(sibling.to_vec(), b"abcdef");
    assert_eq!(chain.to_vec(), b"de");
}

#[test]
fn test_logical_equality_ignores_segmentation() {
    let mut a = BufChain::from_slice(b"ab");
    a.append(BufChain::from_slice(b"cd"));
    let b = BufChain::from_slice(b"abcd");
    assert_eq!(a, b);
}
