//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use vdir_ml::metadata::{AttrMetadata, ValueMetadata};
use vdir_ml::{
    dn, Backend, BackendTxn, BindInfo, DirConfig, DirectoryService, Entry, LockMode,
    MemoryBackend, OpOrigin, Operation, Scope, StaticSchema, TxnMode,
};

/// Domain every fixture directory is bootstrapped with.
pub const DOMAIN: &str = "dc=vsphere,dc=local";

/// Container the fixture users are created in.
pub fn users_dn() -> String {
    format!("cn=users,{}", DOMAIN)
}

/// DN of the fixture user `name`.
pub fn user_dn(name: &str) -> String {
    format!("cn={},{}", name, users_dn())
}

/// Config with short waits so failing tests fail fast.
pub fn test_config() -> DirConfig {
    let mut config = DirConfig::default();
    config.txn.initial_backoff_ms = 1;
    config.txn.max_backoff_ms = 5;
    config.write_queue.wait_timeout_ms = 5_000;
    config.paged_search.read_timeout_ms = 2_000;
    config
}

/// A bootstrapped in-memory directory.
pub fn directory() -> DirectoryService {
    directory_with(test_config())
}

/// A bootstrapped in-memory directory with a custom config.
pub fn directory_with(config: DirConfig) -> DirectoryService {
    let dir = DirectoryService::in_memory(config);
    dir.bootstrap().expect("bootstrap");
    dir
}

/// A bootstrapped directory whose backend the test keeps a handle on, for
/// deadlock injection.
pub fn directory_with_backend() -> (DirectoryService, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let dir = DirectoryService::new(
        test_config(),
        backend.clone(),
        Arc::new(StaticSchema::bootstrap()),
    );
    dir.bootstrap().expect("bootstrap");
    (dir, backend)
}

/// A user entry ready to be added under the users container.
pub fn user_entry(name: &str) -> Entry {
    let mut entry = Entry::new(&user_dn(name));
    entry.add_values("objectclass", &["top", "user"]);
    entry.add_values("cn", &[name]);
    entry.add_values("samaccountname", &[name]);
    entry
}

/// A group entry listing `members` (raw DNs or `foreignSid=` values).
pub fn group_entry(name: &str, members: &[&str]) -> Entry {
    let mut entry = Entry::new(&user_dn(name));
    entry.add_values("objectclass", &["top", "group"]);
    entry.add_values("cn", &[name]);
    if !members.is_empty() {
        entry.add_values("member", members);
    }
    entry
}

/// Adds `entry` as a client bound as the system identity.
pub fn add_as_admin(dir: &DirectoryService, entry: Entry) -> Operation {
    let mut op = Operation::add(OpOrigin::External, BindInfo::system(), entry);
    let result = dir.add(&mut op);
    assert!(result.is_success(), "add failed: {:?}", result);
    op
}

/// Reads one entry by DN through an internal base search.
pub fn lookup(dir: &DirectoryService, dn: &str) -> Option<Entry> {
    dir.simple_equal_filter_search(dn, Scope::Base, "objectclass", "top")
        .expect("base search")
        .into_iter()
        .next()
}

/// Reads the stored entry at `dn` straight from the backend, with its ID.
pub fn stored_entry(dir: &DirectoryService, raw_dn: &str) -> Entry {
    let norm = dn::normalize_dn(raw_dn).expect("normalize dn");
    let mut txn = dir.backend().begin(TxnMode::Read).expect("read txn");
    let entry = txn.dn_to_entry(&norm, LockMode::None).expect("stored entry");
    txn.abort();
    entry
}

/// Attribute metadata stored for `attr` of the entry at `dn`.
pub fn attr_metadata(dir: &DirectoryService, raw_dn: &str, attr: &str) -> Option<AttrMetadata> {
    let id = stored_entry(dir, raw_dn).id.expect("entry id");
    let mut txn = dir.backend().begin(TxnMode::Read).expect("read txn");
    let meta = txn.attr_metadata(id, attr).expect("attribute metadata");
    txn.abort();
    meta
}

/// Per-value metadata stored for `attr` of the entry at `dn`.
pub fn value_metadata(dir: &DirectoryService, raw_dn: &str, attr: &str) -> Vec<ValueMetadata> {
    let id = stored_entry(dir, raw_dn).id.expect("entry id");
    let mut txn = dir.backend().begin(TxnMode::Read).expect("read txn");
    let values = txn.value_metadata(id, attr).expect("value metadata");
    txn.abort();
    values
}
