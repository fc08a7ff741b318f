//! Concurrent writers, write-queue ordering and deadlock retry.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{add_as_admin, directory, directory_with_backend, user_dn, user_entry};
use vdir_ml::{BindInfo, Modification, OpOrigin, Operation, ResultCode, Scope};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_commit_in_usn_order() {
    let dir = Arc::new(directory());
    let base = dir.stats();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let dir = dir.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut usns = Vec::new();
            for n in 0..5 {
                let name = format!("w{}-u{}", worker, n);
                let op = add_as_admin(&dir, user_entry(&name));
                usns.push(op.usn.as_u64());
            }
            usns
        }));
    }

    let mut all = HashSet::new();
    for handle in handles {
        for usn in handle.await.expect("writer thread") {
            assert!(all.insert(usn), "usn {} handed out twice", usn);
        }
    }
    assert_eq!(all.len(), 40);

    let stats = dir.stats();
    assert_eq!(stats.entries, base.entries + 40);
    assert_eq!(stats.committed_usn, stats.max_usn);
    assert_eq!(dir.write_queue().len(), 0);

    let found = dir
        .simple_equal_filter_search(&common::users_dn(), Scope::OneLevel, "objectclass", "user")
        .expect("search");
    // 40 workers' users plus the administrator.
    assert_eq!(found.len(), 41);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_committed_usn_never_goes_back_under_deadlocks() {
    let (dir, backend) = directory_with_backend();
    let dir = Arc::new(dir);
    let before = dir.stats();
    assert_eq!(before.committed_usn, before.max_usn);
    let start = before.max_usn;
    backend.inject_deadlocks(3);

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let dir = dir.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut last = dir.write_queue().committed_usn().as_u64();
            let mut regressions = Vec::new();
            loop {
                let done = stop.load(Ordering::SeqCst);
                let seen = dir.write_queue().committed_usn().as_u64();
                if seen < last {
                    regressions.push((last, seen));
                }
                last = seen;
                if done {
                    return (last, regressions);
                }
                std::thread::yield_now();
            }
        })
    };

    let mut handles = Vec::new();
    for worker in 0..4 {
        let dir = dir.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            (0..5)
                .map(|n| {
                    let op = add_as_admin(&dir, user_entry(&format!("d{}-u{}", worker, n)));
                    op.usn.as_u64()
                })
                .collect::<Vec<u64>>()
        }));
    }
    let mut usns = Vec::new();
    for handle in handles {
        usns.extend(handle.await.expect("writer thread"));
    }
    stop.store(true, Ordering::SeqCst);
    let (last_seen, regressions) = reader.join().expect("reader thread");

    assert_eq!(backend.pending_deadlocks(), 0);
    assert!(regressions.is_empty(), "committed USN went back: {:?}", regressions);

    // Every admitted write took exactly the next USN.
    usns.sort_unstable();
    let expected: Vec<u64> = (start + 1..=start + 20).collect();
    assert_eq!(usns, expected);
    assert_eq!(last_seen, start + 20);
    assert_eq!(dir.stats().committed_usn, start + 20);
}

#[tokio::test]
async fn test_add_retries_injected_deadlocks() {
    let (dir, backend) = directory_with_backend();
    let before = dir.metrics().snapshot().deadlock_retries;

    backend.inject_deadlocks(2);
    let op = tokio::task::spawn_blocking(move || {
        let op = add_as_admin(&dir, user_entry("u1"));
        (op.usn, dir)
    })
    .await
    .expect("add thread");
    let (usn, dir) = op;

    assert_eq!(backend.pending_deadlocks(), 0);
    assert!(dir.metrics().snapshot().deadlock_retries >= before + 2);
    let stats = dir.stats();
    assert_eq!(stats.committed_usn, usn.as_u64());
}

#[test]
fn test_exhausted_retries_report_busy() {
    let (dir, backend) = directory_with_backend();
    add_as_admin(&dir, user_entry("u1"));

    backend.inject_deadlocks(100);
    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("u1"),
        vec![Modification::replace("description", &["x"])],
    );
    assert_eq!(dir.modify(&mut op).code, ResultCode::Busy);

    // The failed write left the queue; the next one goes through.
    backend.inject_deadlocks(0);
    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("u1"),
        vec![Modification::replace("description", &["y"])],
    );
    assert!(dir.modify(&mut op).is_success());
    let stats = dir.stats();
    assert_eq!(stats.committed_usn, stats.max_usn);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_modifies_of_one_entry() {
    let dir = Arc::new(directory());
    add_as_admin(&dir, user_entry("shared"));

    let mut handles = Vec::new();
    for worker in 0..6 {
        let dir = dir.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut op = Operation::modify(
                OpOrigin::External,
                BindInfo::system(),
                &user_dn("shared"),
                vec![Modification::add("mail", &[format!("w{}@vsphere.local", worker)])],
            );
            dir.modify(&mut op)
        }));
    }
    for handle in handles {
        let result = handle.await.expect("modify thread");
        assert!(result.is_success(), "modify failed: {:?}", result);
    }

    let found = dir
        .simple_equal_filter_search(&user_dn("shared"), Scope::Base, "cn", "shared")
        .expect("search");
    assert_eq!(found[0].values_of("mail").len(), 6);
}
