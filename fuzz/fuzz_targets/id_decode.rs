//! Fuzz target for identifier decoding
//!
//! Feeds arbitrary strings to the hex id parser and the cache-key parser.
//!
//! # Invariants
//!
//! - Decoding NEVER panics; invalid input returns an error
//! - A decoded id re-encodes to a string that decodes to the same id
//! - `encode` agrees with `CompositeId::cache_key`

#![no_main]

use libfuzzer_sys::fuzz_target;
use studychat_proto::{CacheKey, CompositeId, encode};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(id) = CompositeId::from_hex(input) {
        let reparsed = CompositeId::from_hex(&id.to_string()).expect("canonical form must parse");
        assert_eq!(reparsed, id);
        assert_eq!(encode(input).expect("valid id must encode"), id.cache_key());
    } else {
        assert!(encode(input).is_err());
    }

    if let Ok(key) = input.parse::<CacheKey>() {
        let reparsed: CacheKey = key.to_string().parse().expect("canonical form must parse");
        assert_eq!(reparsed, key);
    }
});
