//! Fuzz target for pack ingestion.
//!
//! Arbitrary bytes must either parse or fail with an error, and a failed
//! parse must leave the repository untouched.

#![no_main]

use gitway_storage::{HashAlgorithm, MemoryRepository, PackParser};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let repo = MemoryRepository::new("fuzz");
    let mut input = Cursor::new(data);
    let result = PackParser::new(&mut input, HashAlgorithm::Sha1).parse(&repo);
    if result.is_err() {
        assert!(repo.objects.is_empty());
    }
});
