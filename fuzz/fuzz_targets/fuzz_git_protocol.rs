//! Fuzz target for the protocol sessions.
//!
//! Feeds arbitrary client input to both services against a small
//! repository. Sessions may fail, but must not panic, and a receive-pack
//! that fails before applying must leave the refs as they were.

#![no_main]

use gitway_git::{ReceivePackSession, SessionConfig, UploadPackSession};
use gitway_storage::{BasicPackCodec, GitObject, MemoryRepository, Repository, TreeEntry};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;
use std::sync::Arc;

fn repository() -> Arc<MemoryRepository> {
    let repo = Arc::new(MemoryRepository::new("fuzz"));
    let sig = "f <f@x> 0 +0000";
    let mut parent = Vec::new();
    for i in 0..3 {
        let blob = repo
            .write_object(GitObject::blob(format!("{}", i).into_bytes()))
            .expect("write blob");
        let tree = repo
            .write_object(GitObject::tree(&[TreeEntry::file("f", blob)]))
            .expect("write tree");
        let commit = repo
            .write_object(GitObject::commit(&tree, &parent, sig, sig, "c"))
            .expect("write commit");
        parent = vec![commit];
    }
    repo.refs.set("refs/heads/main", parent[0]);
    repo
}

fuzz_target!(|data: &[u8]| {
    let config = SessionConfig {
        stateless_rpc: true,
        ..SessionConfig::default()
    };

    let repo = repository();
    let upload = UploadPackSession::new(repo.clone(), Arc::new(BasicPackCodec), config.clone());
    let _ = upload.run(Cursor::new(data), Vec::<u8>::new());

    let before = repo.list_refs().expect("list refs");
    let receive = ReceivePackSession::new(repo.clone(), Arc::new(BasicPackCodec), config);
    if receive.run(Cursor::new(data), Vec::<u8>::new()).is_err() {
        // The memory backend never fails after applying.
        assert_eq!(repo.list_refs().expect("list refs"), before);
    }
});
