//! Replication metadata written by the Add and Modify pipelines, and
//! per-value conflict resolution for replicated member changes.

mod common;

use common::{
    add_as_admin, attr_metadata, directory, directory_with, group_entry, stored_entry,
    test_config, user_dn, user_entry, value_metadata,
};
use vdir_ml::metadata::{AttrMetadata, ValueMetadata, ValueOp};
use vdir_ml::{BindInfo, DirectoryService, Modification, OpOrigin, Operation, Usn};

const REMOTE: &str = "00000000-0000-0000-0000-0000000000aa";

fn usn_value(dir: &DirectoryService, dn: &str, attr: &str) -> u64 {
    stored_entry(dir, dn)
        .get_single(attr)
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("{} missing on {}", attr, dn))
}

/// A replicated change of one `member` value, stamped as `remote` made it.
fn member_change(op: ValueOp, value: &str, version: u64, time: &str) -> Modification {
    let meta = AttrMetadata {
        local_usn: Usn::new(0),
        version,
        server_id: REMOTE.to_string(),
        time: time.to_string(),
        orig_usn: Usn::new(500 + version),
    };
    let mut m = match op {
        ValueOp::Add => Modification::add("member", &[value]),
        ValueOp::Delete => Modification::delete("member", &[value]),
    };
    m.attr.metadata = Some(meta.clone());
    m.attr.value_meta_to_add.push_back(ValueMetadata {
        attr: String::from("member"),
        meta,
        op,
        value: value.to_string(),
    });
    m
}

fn replicate(dir: &DirectoryService, dn: &str, mods: Vec<Modification>) -> Usn {
    let mut op = Operation::modify(OpOrigin::Repl, BindInfo::system(), dn, mods);
    let usn = dir.assign_usn(&mut op).expect("usn");
    dir.internal_modify(&mut op).expect("replicated modify");
    usn
}

#[test]
fn test_add_stamps_every_attribute_at_version_one() {
    let dir = directory();
    let mut entry = user_entry("u1");
    entry.add_values("mail", &["u1@x"]);
    let op = add_as_admin(&dir, entry);
    let n = op.usn;
    let server = dir.config().server.invocation_id.clone();

    let stored = stored_entry(&dir, &user_dn("u1"));
    assert_eq!(stored.get_single("usncreated"), Some(n.to_string().as_str()));
    assert_eq!(stored.get_single("usnchanged"), Some(n.to_string().as_str()));
    assert!(stored.get_single("objectguid").is_some());

    let mail = attr_metadata(&dir, &user_dn("u1"), "mail").expect("mail metadata");
    let time = mail.time.clone();
    assert_eq!(mail.to_string(), format!("{}:1:{}:{}:{}", n, server, time, n));
    for attribute in &stored.attrs {
        let meta = attr_metadata(&dir, &user_dn("u1"), &attribute.name)
            .unwrap_or_else(|| panic!("no metadata for {}", attribute.name));
        assert_eq!(meta.version, 1, "{}", attribute.name);
        assert_eq!(meta.local_usn, n, "{}", attribute.name);
        assert_eq!(meta.orig_usn, n, "{}", attribute.name);
        assert_eq!(meta.server_id, server, "{}", attribute.name);
        assert_eq!(meta.time, time, "{}", attribute.name);
    }
}

#[test]
fn test_replace_bumps_attribute_version() {
    let dir = directory();
    let mut entry = user_entry("u1");
    entry.add_values("mail", &["u1@x"]);
    let added = add_as_admin(&dir, entry);

    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("u1"),
        vec![Modification::replace("mail", &["u2@x"])],
    );
    assert!(dir.modify(&mut op).is_success());
    assert_eq!(op.usn.as_u64(), added.usn.as_u64() + 1);

    let stored = stored_entry(&dir, &user_dn("u1"));
    assert_eq!(stored.values_of("mail"), vec!["u2@x"]);
    assert_eq!(usn_value(&dir, &user_dn("u1"), "usnchanged"), added.usn.as_u64() + 1);
    assert_eq!(usn_value(&dir, &user_dn("u1"), "usncreated"), added.usn.as_u64());

    let mail = attr_metadata(&dir, &user_dn("u1"), "mail").expect("mail metadata");
    assert_eq!(mail.version, 2);
    assert_eq!(mail.local_usn, op.usn);
    assert_eq!(mail.orig_usn, op.usn);
    // A Replace resets the per-value history instead of recording values.
    assert!(value_metadata(&dir, &user_dn("u1"), "mail").is_empty());

    // Untouched attributes keep their Add stamp.
    let cn = attr_metadata(&dir, &user_dn("u1"), "cn").expect("cn metadata");
    assert_eq!(cn.version, 1);
    assert_eq!(cn.local_usn, added.usn);
}

#[test]
fn test_member_add_records_value_metadata() {
    let mut config = test_config();
    config.server.concurrent_value_update = true;
    let dir = directory_with(config);
    add_as_admin(&dir, user_entry("u1"));
    add_as_admin(&dir, user_entry("u2"));
    add_as_admin(&dir, group_entry("g1", &[&user_dn("u1")]));

    let v = user_dn("u2");
    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("g1"),
        vec![Modification::add("member", &[v.as_str()])],
    );
    assert!(dir.modify(&mut op).is_success());

    let server = dir.config().server.invocation_id.clone();
    let records = value_metadata(&dir, &user_dn("g1"), "member");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.op, ValueOp::Add);
    assert_eq!(record.value, v);
    assert_eq!(
        record.to_string(),
        format!(
            "member:{usn}:2:{server}:{time}:{usn}:1:{len}:{value}",
            usn = op.usn,
            server = server,
            time = record.meta.time,
            len = v.len(),
            value = v
        )
    );
    assert_eq!(
        attr_metadata(&dir, &user_dn("g1"), "member").map(|m| m.version),
        Some(2)
    );
}

#[test]
fn test_replicated_member_race_resolves_by_version() {
    let mut config = test_config();
    config.server.concurrent_value_update = true;
    let dir = directory_with(config);
    add_as_admin(&dir, user_entry("u1"));
    add_as_admin(&dir, user_entry("u2"));
    add_as_admin(&dir, group_entry("g1", &[&user_dn("u1")]));
    let v = user_dn("u2");

    // Local add of V stamps the value at version 2.
    let mut op = Operation::modify(
        OpOrigin::External,
        BindInfo::system(),
        &user_dn("g1"),
        vec![Modification::add("member", &[v.as_str()])],
    );
    assert!(dir.modify(&mut op).is_success());

    // A partner deleted V at version 3: it wins over the local add.
    replicate(
        &dir,
        &user_dn("g1"),
        vec![member_change(ValueOp::Delete, &v, 3, "20300101000000.0Z")],
    );
    let group = stored_entry(&dir, &user_dn("g1"));
    assert_eq!(group.values_of("member"), vec![user_dn("u1").as_str()]);

    // A stale add of V at version 2 arrives late and loses, without a
    // value-exists or value-missing error.
    replicate(
        &dir,
        &user_dn("g1"),
        vec![member_change(ValueOp::Add, &v, 2, "20290101000000.0Z")],
    );
    let group = stored_entry(&dir, &user_dn("g1"));
    assert_eq!(group.values_of("member"), vec![user_dn("u1").as_str()]);
    let member = attr_metadata(&dir, &user_dn("g1"), "member").expect("member metadata");
    assert_eq!(member.version, 3);

    // A repeated delete of the now absent value is tolerated too.
    replicate(
        &dir,
        &user_dn("g1"),
        vec![member_change(ValueOp::Delete, &v, 4, "20300102000000.0Z")],
    );

    // A newer add brings V back; exactly one outcome is visible.
    let usn = replicate(
        &dir,
        &user_dn("g1"),
        vec![member_change(ValueOp::Add, &v, 5, "20300103000000.0Z")],
    );
    let group = stored_entry(&dir, &user_dn("g1"));
    let members = group.values_of("member");
    assert_eq!(members.iter().filter(|m| m.eq_ignore_ascii_case(&v)).count(), 1);

    let member = attr_metadata(&dir, &user_dn("g1"), "member").expect("member metadata");
    assert_eq!(member.version, 5);
    assert_eq!(member.server_id, REMOTE);
    assert_eq!(member.local_usn, usn);
    let newest = value_metadata(&dir, &user_dn("g1"), "member")
        .into_iter()
        .filter(|r| r.is_for(&v))
        .max_by_key(|r| r.meta.version)
        .expect("value records for V");
    assert_eq!(newest.op, ValueOp::Add);
    assert_eq!(newest.meta.version, 5);
    assert_eq!(newest.meta.local_usn, usn);
}
