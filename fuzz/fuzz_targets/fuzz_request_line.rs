//! Fuzz target for the `git://` request line.

#![no_main]

use gitway_daemon::DaemonRequest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = DaemonRequest::parse(data) {
        assert!(!request.path.is_empty());
        assert!(!request.path.starts_with('/'));
    }
});
