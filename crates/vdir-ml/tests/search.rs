//! Client searches: paging, size limits, deleted-object visibility.

mod common;

use common::{add_as_admin, directory, directory_with, test_config, user_dn, user_entry, users_dn};
use vdir_ml::{BindInfo, DirError, OpOrigin, Operation, ResultCode, Scope, SearchRequest};

fn client_search(dir: &vdir_ml::DirectoryService, request: SearchRequest) -> Operation {
    let mut op = Operation::search(OpOrigin::External, BindInfo::system(), request);
    let result = dir.search(&mut op);
    assert!(result.is_success(), "search failed: {:?}", result);
    op
}

fn populate(dir: &vdir_ml::DirectoryService, count: usize) {
    for n in 0..count {
        add_as_admin(dir, user_entry(&format!("u{}", n)));
    }
}

#[tokio::test]
async fn test_paged_search_walks_all_pages() {
    let dir = directory();
    populate(&dir, 7);

    let outcome = tokio::task::spawn_blocking(move || {
        let mut seen = Vec::new();
        let mut cookie = String::new();
        let mut pages = 0;
        loop {
            let request = SearchRequest::new(&users_dn(), Scope::Subtree, "(objectclass=user)")
                .with_page(3, &cookie);
            let op = client_search(&dir, request);
            let outcome = op.search_result.expect("search result");
            assert!(outcome.entries.len() <= 3);
            seen.extend(outcome.entries.into_iter().map(|e| e.norm_dn));
            pages += 1;
            cookie = outcome.cookie.unwrap_or_default();
            if cookie.is_empty() || pages > 10 {
                break;
            }
        }
        (seen, pages, dir.paged_searches().len())
    })
    .await
    .expect("paging thread");

    let (mut seen, pages, open) = outcome;
    // Seven users plus the administrator, in at least three pages.
    assert_eq!(seen.len(), 8);
    assert!(pages >= 3);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 8);
    assert_eq!(open, 0);
}

#[test]
fn test_paged_search_rejects_unknown_cookie() {
    let dir = directory();
    let request = SearchRequest::new(&users_dn(), Scope::Subtree, "(objectclass=user)")
        .with_page(2, "no-such-cookie");
    let mut op = Operation::search(OpOrigin::External, BindInfo::system(), request);
    assert!(!dir.search(&mut op).is_success());

    let request = SearchRequest::new(&users_dn(), Scope::Subtree, "(objectclass=user)")
        .with_page(0, "");
    let mut op = Operation::search(OpOrigin::Internal, BindInfo::system(), request);
    assert!(matches!(
        dir.internal_search(&mut op),
        Err(DirError::InvalidPagedSearchRequest(_))
    ));
}

#[test]
fn test_size_limit_truncates() {
    let dir = directory();
    populate(&dir, 5);

    let request =
        SearchRequest::new(&users_dn(), Scope::OneLevel, "(objectclass=user)").with_size_limit(2);
    let outcome = client_search(&dir, request).search_result.expect("result");
    assert_eq!(outcome.entries.len(), 2);
    assert!(outcome.truncated);

    let request =
        SearchRequest::new(&users_dn(), Scope::OneLevel, "(objectclass=user)").with_size_limit(50);
    let outcome = client_search(&dir, request).search_result.expect("result");
    assert_eq!(outcome.entries.len(), 6);
    assert!(!outcome.truncated);
}

#[test]
fn test_unique_attribute_lookup_and_projection() {
    let dir = directory();
    populate(&dir, 3);

    let request = SearchRequest::new(common::DOMAIN, Scope::Subtree, "(samaccountname=u1)")
        .with_attrs(&["cn", "samaccountname"]);
    let outcome = client_search(&dir, request).search_result.expect("result");
    assert_eq!(outcome.entries.len(), 1);
    let entry = &outcome.entries[0];
    assert_eq!(entry.norm_dn, user_dn("u1"));
    assert_eq!(entry.get_single("cn"), Some("u1"));
    assert!(entry.get_single("objectguid").is_none());
}

#[test]
fn test_deleted_entries_need_show_deleted() {
    let dir = directory();
    populate(&dir, 2);
    let mut op = Operation::delete(OpOrigin::External, BindInfo::system(), &user_dn("u0"));
    assert!(dir.delete(&mut op).is_success());
    let tombstone = op.tombstone_dn.expect("tombstone dn");

    let hidden = SearchRequest::new(common::DOMAIN, Scope::Subtree, "(objectclass=deletedobject)");
    let mut op = Operation::search(OpOrigin::Internal, BindInfo::system(), hidden);
    dir.internal_search(&mut op).expect("search");
    assert!(op.search_result.expect("result").entries.is_empty());

    let shown = SearchRequest::new(common::DOMAIN, Scope::Subtree, "(objectclass=deletedobject)")
        .with_deleted();
    let mut op = Operation::search(OpOrigin::Internal, BindInfo::system(), shown);
    dir.internal_search(&mut op).expect("search");
    let entries = op.search_result.expect("result").entries;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].norm_dn, tombstone);
}

#[test]
fn test_unindexed_client_search_refused() {
    let dir = directory();
    populate(&dir, 2);

    let request = SearchRequest::new("", Scope::Subtree, "(description=*)");
    let mut op = Operation::search(OpOrigin::External, BindInfo::system(), request);
    assert_eq!(dir.search(&mut op).code, ResultCode::UnwillingToPerform);

    let mut config = test_config();
    config.search.allow_full_scan = true;
    let dir = directory_with(config);
    let request = SearchRequest::new("", Scope::Subtree, "(description=*)");
    let mut op = Operation::search(OpOrigin::External, BindInfo::system(), request);
    assert!(dir.search(&mut op).is_success());
}

#[test]
fn test_anonymous_search_returns_nothing() {
    let dir = directory();
    populate(&dir, 2);
    let request = SearchRequest::new(&users_dn(), Scope::OneLevel, "(objectclass=user)");
    let mut op = Operation::search(OpOrigin::External, BindInfo::anonymous(), request);
    assert!(dir.search(&mut op).is_success());
    assert!(op.search_result.expect("result").entries.is_empty());
}
