//! End-to-end Add/Modify/Delete pipeline tests against the in-memory backend.

mod common;

use std::sync::Arc;

use common::{
    add_as_admin, directory, group_entry, lookup, test_config, user_dn, user_entry, users_dn,
};
use vdir_ml::hooks::default_registry;
use vdir_ml::plugin::{Hook, OpMask, Phase};
use vdir_ml::{
    BindInfo, DirError, DirectoryService, Entry, Modification, OpOrigin, Operation,
    RenameRequest, ResultCode, Scope, ServerState,
};

fn usn_of(entry: &Entry, attr: &str) -> u64 {
    entry
        .get_single(attr)
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("{} missing on {}", attr, entry.dn))
}

#[test]
fn test_add_stamps_operational_attributes() {
    let dir = directory();
    let before = dir.stats();

    let op = add_as_admin(&dir, user_entry("u1"));
    assert!(op.usn.is_set());

    let stored = lookup(&dir, &user_dn("u1")).expect("user stored");
    assert_eq!(usn_of(&stored, "usncreated"), op.usn.as_u64());
    assert_eq!(usn_of(&stored, "usnchanged"), op.usn.as_u64());
    assert!(stored.get_single("objectguid").is_some());
    assert!(stored.get_single("objectsid").is_some());
    assert!(stored.get_single("ntsecuritydescriptor").is_some());

    let after = dir.stats();
    assert_eq!(after.entries, before.entries + 1);
    assert_eq!(after.committed_usn, op.usn.as_u64());
    assert_eq!(after.max_originating_usn, op.usn.as_u64());
}

#[test]
fn test_add_without_parent_fails() {
    let dir = directory();
    let mut entry = Entry::new(&format!("cn=orphan,ou=missing,{}", common::DOMAIN));
    entry.add_values("objectclass", &["top", "user"]);
    entry.add_values("cn", &["orphan"]);
    let mut op = Operation::add(OpOrigin::External, BindInfo::system(), entry);
    let result = dir.add(&mut op);
    assert_eq!(result.code, ResultCode::NoSuchObject);

    // The USN taken by the failed add is released so later writes proceed.
    add_as_admin(&dir, user_entry("u2"));
    let stats = dir.stats();
    assert_eq!(stats.committed_usn, stats.max_usn);
}

#[test]
fn test_duplicate_add_is_rejected() {
    let dir = directory();
    add_as_admin(&dir, user_entry("u1"));
    let mut op = Operation::add(OpOrigin::External, BindInfo::system(), user_entry("u1"));
    assert_eq!(dir.add(&mut op).code, ResultCode::EntryAlreadyExists);
}

#[test]
fn test_anonymous_and_read_only_writes_refused() {
    let dir = directory();
    let mut op = Operation::add(OpOrigin::External, BindInfo::anonymous(), user_entry("u1"));
    assert!(!dir.add(&mut op).is_success());

    dir.set_state(ServerState::ReadOnly);
    let mut op = Operation::add(OpOrigin::External, BindInfo::system(), user_entry("u1"));
    assert_eq!(dir.add(&mut op).code, ResultCode::UnwillingToPerform);
    dir.set_state(ServerState::Normal);
    add_as_admin(&dir, user_entry("u1"));
}

#[test]
fn test_modify_bumps_usn_changed() {
    let dir = directory();
    let added = add_as_admin(&dir, user_entry("u1"));

    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("u1"),
        vec![Modification::replace("description", &["first"])],
    );
    assert!(dir.modify(&mut op).is_success());
    assert!(op.usn > added.usn);

    let stored = lookup(&dir, &user_dn("u1")).expect("user stored");
    assert_eq!(stored.get_single("description"), Some("first"));
    assert_eq!(usn_of(&stored, "usncreated"), added.usn.as_u64());
    assert_eq!(usn_of(&stored, "usnchanged"), op.usn.as_u64());
}

#[test]
fn test_modify_access_follows_binding() {
    let dir = directory();
    add_as_admin(&dir, user_entry("u1"));
    add_as_admin(&dir, user_entry("u2"));

    // Users may write their own entry but not somebody else's.
    let mut own = Operation::modify(
        OpOrigin::External,
        BindInfo::user(&user_dn("u1")),
        &user_dn("u1"),
        vec![Modification::replace("description", &["mine"])],
    );
    assert!(dir.modify(&mut own).is_success());

    let mut other = Operation::modify(
        OpOrigin::External,
        BindInfo::user(&user_dn("u1")),
        &user_dn("u2"),
        vec![Modification::replace("description", &["not mine"])],
    );
    assert_eq!(dir.modify(&mut other).code, ResultCode::InsufficientAccessRights);
}

#[test]
fn test_modify_missing_entry() {
    let dir = directory();
    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("ghost"),
        vec![Modification::replace("description", &["x"])],
    );
    assert_eq!(dir.modify(&mut op).code, ResultCode::NoSuchObject);
}

#[test]
fn test_delete_tombstones_then_purges() {
    let dir = directory();
    add_as_admin(&dir, user_entry("u1"));
    let entries = dir.stats().entries;

    let mut op = Operation::delete(OpOrigin::External, BindInfo::system(), &user_dn("u1"));
    assert!(dir.delete(&mut op).is_success());
    let tombstone = op.tombstone_dn.clone().expect("tombstone dn");
    assert!(tombstone.ends_with(&dir.config().deleted_objects_dn()));

    // The tombstone keeps the entry count but hides from normal searches.
    assert_eq!(dir.stats().entries, entries);
    assert!(lookup(&dir, &user_dn("u1")).is_none());
    let found = dir
        .simple_equal_filter_search(&tombstone, Scope::Base, "isdeleted", "TRUE")
        .expect("tombstone search");
    assert_eq!(found.len(), 1);
    assert!(found[0].get_single("samaccountname").is_none());
    assert_eq!(found[0].get_single("lastknowndn"), Some(user_dn("u1").as_str()));

    // Deleting the tombstone removes it for good.
    let mut purge = Operation::delete(OpOrigin::External, BindInfo::system(), &tombstone);
    assert!(dir.delete(&mut purge).is_success());
    assert!(purge.tombstone_age_off);
    assert_eq!(dir.stats().entries, entries - 1);

    // The name is free again.
    add_as_admin(&dir, user_entry("u1"));
}

#[test]
fn test_delete_non_leaf_refused() {
    let dir = directory();
    add_as_admin(&dir, user_entry("u1"));
    let mut op = Operation::delete(OpOrigin::Internal, BindInfo::system(), &users_dn());
    assert!(matches!(
        dir.internal_delete(&mut op),
        Err(DirError::NotAllowedOnNonLeaf(_))
    ));
}

#[test]
fn test_rename_within_container() {
    let dir = directory();
    add_as_admin(&dir, user_entry("u1"));

    let mut op = Operation::rename(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("u1"),
        RenameRequest {
            new_rdn: String::from("cn=u1-renamed"),
            delete_old_rdn: true,
            new_superior: None,
        },
    );
    let result = dir.modify(&mut op);
    assert!(result.is_success(), "rename failed: {:?}", result);

    assert!(lookup(&dir, &user_dn("u1")).is_none());
    let renamed = lookup(&dir, &user_dn("u1-renamed")).expect("renamed entry");
    assert_eq!(renamed.values_of("cn"), vec!["u1-renamed"]);
}

#[test]
fn test_rename_of_group_member_refused() {
    let dir = directory();
    add_as_admin(&dir, user_entry("u1"));
    add_as_admin(&dir, group_entry("g1", &[&user_dn("u1")]));

    let mut op = Operation::rename(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("u1"),
        RenameRequest {
            new_rdn: String::from("cn=u9"),
            delete_old_rdn: true,
            new_superior: None,
        },
    );
    assert_eq!(dir.modify(&mut op).code, ResultCode::UnwillingToPerform);
}

#[test]
fn test_foreign_sid_member_creates_fsp() {
    let dir = directory();
    let sid = "S-1-5-21-7-8-9-1104";
    add_as_admin(&dir, group_entry("g1", &[&format!("foreignSid={}", sid)]));

    let fsp_dn = format!("cn={},{}", sid, dir.config().fsp_container_dn());
    let fsp = lookup(&dir, &fsp_dn).expect("fsp entry created");
    assert_eq!(fsp.get_single("foreignsid"), Some(sid));

    let group = lookup(&dir, &user_dn("g1")).expect("group stored");
    let members = group.values_of("member");
    assert_eq!(members.len(), 1);
    assert!(members[0].to_ascii_lowercase().starts_with("cn=s-1-5-21-7-8-9-1104,"));
    assert!(group.get_single("grouptype").is_some());
}

#[test]
fn test_deleted_user_leaves_groups() {
    let dir = directory();
    add_as_admin(&dir, user_entry("u1"));
    add_as_admin(&dir, user_entry("u2"));
    add_as_admin(&dir, group_entry("g1", &[&user_dn("u1"), &user_dn("u2")]));

    let mut op = Operation::delete(OpOrigin::External, BindInfo::system(), &user_dn("u1"));
    assert!(dir.delete(&mut op).is_success());

    let group = lookup(&dir, &user_dn("g1")).expect("group stored");
    assert_eq!(group.values_of("member"), vec![user_dn("u2").as_str()]);
}

#[test]
fn test_replicated_add_keeps_originating_usn() {
    let dir = directory();
    let local = add_as_admin(&dir, user_entry("u1"));

    let mut entry = user_entry("remote");
    entry.add_values("objectguid", &["4c1f7c8e-2f2a-4d8e-9d0c-0a1b2c3d4e5f"]);
    let mut op = Operation::add(OpOrigin::Repl, BindInfo::system(), entry);
    dir.assign_usn(&mut op).expect("usn");
    dir.internal_add(&mut op).expect("replicated add");

    let stats = dir.stats();
    assert_eq!(stats.committed_usn, op.usn.as_u64());
    assert_eq!(stats.max_originating_usn, local.usn.as_u64());

    let stored = lookup(&dir, &user_dn("remote")).expect("replicated entry");
    assert_eq!(
        stored.get_single("objectguid"),
        Some("4c1f7c8e-2f2a-4d8e-9d0c-0a1b2c3d4e5f")
    );
}

#[test]
fn test_replicated_write_needs_usn() {
    let dir = directory();
    let mut op = Operation::add(OpOrigin::Repl, BindInfo::system(), user_entry("remote"));
    assert!(matches!(dir.internal_add(&mut op), Err(DirError::NoUsn)));
}

/// Tags every modified user with a description.
struct TagDescription;

impl Hook for TagDescription {
    fn name(&self) -> &'static str {
        "tag-description"
    }

    fn invoke(
        &self,
        _dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> vdir_ml::Result<()> {
        if entry.map_or(false, |e| e.has_class("user")) {
            op.mods.push(Modification::replace("description", &["tagged"]));
        }
        Ok(())
    }
}

#[test]
fn test_pre_modify_hook_mods_are_applied() {
    let mut registry = default_registry();
    registry
        .pipeline_mut(Phase::PreModify)
        .push(OpMask::EXTERNAL, false, Arc::new(TagDescription));
    let dir = DirectoryService::in_memory(test_config()).with_plugins(registry);
    dir.bootstrap().expect("bootstrap");
    add_as_admin(&dir, user_entry("u1"));

    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("u1"),
        vec![Modification::add("mail", &["u1@vsphere.local"])],
    );
    let result = dir.modify(&mut op);
    assert!(result.is_success(), "modify failed: {:?}", result);

    let stored = lookup(&dir, &user_dn("u1")).expect("user stored");
    assert_eq!(stored.get_single("mail"), Some("u1@vsphere.local"));
    assert_eq!(stored.get_single("description"), Some("tagged"));
    assert!(op
        .mods
        .iter()
        .any(|m| m.attr.name == "description" && !m.ignore));
}
