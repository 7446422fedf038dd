use super::*;

#[test]
fn test_basic() {
    let hash = ChunkHash::sha1_from_bytes(b"hello world");

    let expected_base16 = "sha1:2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";
    assert_eq!(expected_base16, hash.to_typed_base16());
    assert_eq!(20, hash.data().len());
}

#[test]
fn test_rolling_hash_distinguishes_data() {
    assert_eq!(0, rolling_hash(&[]));
    assert_ne!(rolling_hash(b"abcd"), rolling_hash(b"abce"));
    assert_ne!(rolling_hash(b"abcd"), rolling_hash(b"bacd"));
}
