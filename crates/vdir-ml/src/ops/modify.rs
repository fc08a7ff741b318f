use std::time::Instant;

use tracing::{debug, warn};

use super::{apply_mods, desugar_replace, normalize_mods, Operation, RenameRequest};
use crate::access::{validate_security_descriptor, BindInfo};
use crate::backend::{BackendTxn, IndexLookup, IndexProbe, LockMode, TxnMode};
use crate::dn;
use crate::entry::{Entry, ModOp, Modification};
use crate::error::{DirError, Result};
use crate::metadata::generate_modify_metadata;
use crate::plugin::Phase;
use crate::service::DirectoryService;
use crate::types::{attr, now_generalized, OpOrigin};

impl DirectoryService {
    pub(crate) fn run_modify(&self, op: &mut Operation) -> Result<()> {
        self.check_write_allowed(op)?;
        op.norm_dn = dn::normalize_dn(&op.dn)?;
        if op.norm_dn.is_empty() {
            return Err(DirError::UnwillingToPerform("cannot modify the root entry".into()));
        }
        if op.mods.is_empty() && op.rename.is_none() {
            return Err(DirError::InvalidRequest("modify request without modifications".into()));
        }

        let _schema_guard = self.schema_guard(&op.norm_dn);
        let result = self.modify_to_commit(op);
        self.write_queue().pop(&mut op.wq);
        if result.is_ok() {
            self.after_modify_commit(op);
        }
        result
    }

    fn modify_to_commit(&self, op: &mut Operation) -> Result<()> {
        if op.origin == OpOrigin::External {
            self.check_mod_sanity(&op.bind, &mut op.mods)?;
        }
        if let Some(rename) = op.rename.clone() {
            let mods = rename_mods(&op.dn, &rename)?;
            op.mods.extend(mods);
        }

        let started = Instant::now();
        let pre = self.plugins().run(Phase::PreModApplyModify, self, op, None);
        op.timings.pre_plugin += started.elapsed();
        pre?;

        normalize_mods(self.schema(), &mut op.mods)?;
        self.wait_turn(op)?;

        let now = now_generalized();
        let requested = op.mods.clone();
        let mut stored: Option<Entry> = None;
        self.retry().run("modify", |attempt| {
            if attempt > 1 {
                self.metrics().record_deadlock_retry();
                op.mods = requested.clone();
            }
            let begun = Instant::now();
            let mut txn = self
                .backend()
                .begin(TxnMode::Write)
                .map_err(|e| e.context("txn begin"))?;
            op.timings.be_begin += begun.elapsed();

            let mut entry = read_for_update(txn.as_mut(), &op.norm_dn)?;
            entry.normalize(self.schema())?;

            let mut mods = desugar_replace(&entry, op.mods.clone());
            normalize_mods(self.schema(), &mut mods)?;
            if !op.is_repl() {
                generate_modify_metadata(
                    txn.as_mut(),
                    &entry,
                    &mut mods,
                    &self.metadata_context(op.usn, &now),
                )?;
            }
            apply_mods(txn.as_mut(), &mut entry, &mut mods, op.origin, op.usn)?;

            // Hooks see the entry with the modifications applied. Anything
            // they append to `op.mods` is applied on top.
            let requested_len = op.mods.len();
            let started = Instant::now();
            let pre = self
                .plugins()
                .run(Phase::PreModify, self, op, Some(&mut entry));
            op.timings.pre_plugin += started.elapsed();
            pre?;
            if op.mods.len() > requested_len {
                let appended: Vec<Modification> = op.mods.drain(requested_len..).collect();
                let mut extra = desugar_replace(&entry, appended);
                normalize_mods(self.schema(), &mut extra)?;
                if !op.is_repl() {
                    generate_modify_metadata(
                        txn.as_mut(),
                        &entry,
                        &mut extra,
                        &self.metadata_context(op.usn, &now),
                    )?;
                }
                apply_mods(txn.as_mut(), &mut entry, &mut extra, op.origin, op.usn)?;
                debug!(dn = %op.norm_dn, count = extra.len(), "pre-modify hooks added modifications");
                mods.extend(extra);
            }

            if entry.dn_modified {
                self.check_rename_target(txn.as_mut(), &mut entry)?;
            }
            if !op.is_repl() {
                self.schema().check_entry(&entry)?;
            }

            txn.modify_entry(&mods, &entry)
                .map_err(|e| e.context("backend modify"))?;

            let committing = Instant::now();
            txn.commit().map_err(|e| e.context("txn commit"))?;
            op.timings.be_commit += committing.elapsed();

            op.mods = mods;
            stored = Some(entry);
            Ok(())
        })?;

        if !op.is_repl() {
            self.backend().set_max_originating_usn(op.usn);
        }
        op.entry = stored;
        Ok(())
    }

    /// Client-side checks on the requested modifications, before any hook
    /// adds its own.
    fn check_mod_sanity(&self, bind: &BindInfo, mods: &mut [Modification]) -> Result<()> {
        let admin = self.access().is_admin(bind);
        for m in mods.iter_mut() {
            let desc = self.schema().attr_desc(&m.attr.name)?;
            if desc.no_user_modifiable && !admin {
                return Err(DirError::ConstraintViolation(format!(
                    "attribute {} is not user-modifiable",
                    desc.name
                )));
            }
            if m.op == ModOp::Delete {
                continue;
            }
            for value in &m.attr.values {
                let raw = value.raw.as_str();
                match desc.name.as_str() {
                    attr::UPN => check_upn(raw)?,
                    attr::SPN if !raw.contains('/') => {
                        return Err(DirError::ConstraintViolation(format!(
                            "invalid servicePrincipalName '{}'",
                            raw
                        )))
                    }
                    attr::SECURITY_DESCRIPTOR => validate_security_descriptor(raw)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Checks the new location of an entry whose DN a modification changed.
    fn check_rename_target(&self, txn: &mut dyn BackendTxn, entry: &mut Entry) -> Result<()> {
        if let Some(id) = entry.id {
            if txn.has_children(id)? {
                return Err(DirError::NotAllowedOnNonLeaf(entry.norm_dn.clone()));
            }
        }
        if entry
            .find_attr(attr::MEMBER_OF)
            .map_or(false, |a| !a.values.is_empty())
        {
            return Err(DirError::UnwillingToPerform(
                "cannot rename an entry that is a group member".into(),
            ));
        }
        if let Some(old_dn) = entry_old_dn(txn, entry)? {
            let lookup = self.backend().get_candidates(
                attr::MEMBER,
                &IndexProbe::Equal(old_dn.clone()),
                self.config().search.small_candidate_set,
            )?;
            let referenced = match lookup {
                IndexLookup::Found(ids) => !ids.is_empty(),
                IndexLookup::LimitExceeded => true,
                IndexLookup::NotIndexed => false,
            };
            if referenced {
                return Err(DirError::UnwillingToPerform(format!(
                    "{} is referenced as a group member",
                    old_dn
                )));
            }
        }

        let parent_dn = entry.parent_dn.clone();
        let parent = if parent_dn.is_empty() {
            None
        } else {
            let parent = txn
                .dn_to_entry(&parent_dn, LockMode::Read)
                .map_err(|e| match e {
                    DirError::BackendEntryNotFound(message) => DirError::ParentNotFound {
                        parent: parent_dn.clone(),
                        message,
                    },
                    other => other,
                })?;
            Some(Box::new(parent))
        };
        entry.parent = parent;
        self.schema()
            .check_structure_rule(entry, entry.parent.as_deref())
    }

    fn after_modify_commit(&self, op: &mut Operation) {
        let mut entry = op.entry.take();
        let dn = entry
            .as_ref()
            .map(|e| e.dn.clone())
            .unwrap_or_else(|| op.dn.clone());
        self.audit_write(op, &dn);

        let started = Instant::now();
        if let Err(e) = self
            .plugins()
            .run(Phase::PostModifyCommit, self, op, entry.as_mut())
        {
            warn!(dn = %op.norm_dn, error = %e, "post-modify plugins failed");
        }
        op.timings.post_plugin += started.elapsed();
        op.entry = entry;
    }

    /// Replaces one attribute of an entry with a single value, as the server.
    pub fn internal_attribute_replace(&self, dn: &str, attr_name: &str, value: &str) -> Result<()> {
        let mut op = Operation::modify(
            OpOrigin::Internal,
            BindInfo::system(),
            dn,
            vec![Modification::replace(attr_name, &[value])],
        );
        self.internal_modify(&mut op)
    }
}

fn read_for_update(txn: &mut dyn BackendTxn, norm_dn: &str) -> Result<Entry> {
    txn.dn_to_entry(norm_dn, LockMode::Write).map_err(|e| match e {
        DirError::BackendEntryNotFound(_) => DirError::NoSuchObject(norm_dn.to_string()),
        other => other,
    })
}

/// Stored DN of an entry being renamed, read back through its ID.
fn entry_old_dn(txn: &mut dyn BackendTxn, entry: &Entry) -> Result<Option<String>> {
    match entry.id {
        Some(id) => Ok(Some(txn.id_to_entry(id)?.norm_dn)),
        None => Ok(None),
    }
}

fn check_upn(value: &str) -> Result<()> {
    match value.split_once('@') {
        Some((user, realm)) if !user.is_empty() && !realm.is_empty() && !realm.contains('@') => {
            Ok(())
        }
        _ => Err(DirError::ConstraintViolation(format!(
            "invalid userPrincipalName '{}'",
            value
        ))),
    }
}

/// Expands a rename into entryDN and RDN attribute modifications.
pub(crate) fn rename_mods(current_dn: &str, rename: &RenameRequest) -> Result<Vec<Modification>> {
    let rdns = dn::split_rdns(&rename.new_rdn);
    if rdns.len() != 1 {
        return Err(DirError::UnwillingToPerform(format!(
            "new RDN '{}' must be a single RDN",
            rename.new_rdn
        )));
    }
    let (new_name, new_value) = dn::rdn_to_name_value(&rdns[0])?;
    let (old_name, old_value) = dn::rdn_to_name_value(&dn::rdn(current_dn))?;

    let parent = match &rename.new_superior {
        Some(sup) => {
            dn::normalize_dn(sup)?;
            sup.trim().to_string()
        }
        None => dn::parent_dn(current_dn),
    };
    let new_dn = dn::cat_dn(&format!("{}={}", new_name, new_value), &parent);
    debug!(from = %current_dn, to = %new_dn, "rename requested");

    let mut mods = vec![Modification::replace(attr::ENTRY_DN, &[new_dn.as_str()])];
    let same_rdn = new_name == old_name && new_value.eq_ignore_ascii_case(&old_value);
    if !same_rdn {
        mods.push(Modification::add(&new_name, &[new_value.as_str()]));
        if rename.delete_old_rdn {
            mods.push(Modification::delete(&old_name, &[old_value.as_str()]));
        }
    }
    Ok(mods)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(new_rdn: &str, delete_old_rdn: bool, new_superior: Option<&str>) -> RenameRequest {
        RenameRequest {
            new_rdn: new_rdn.into(),
            delete_old_rdn,
            new_superior: new_superior.map(String::from),
        }
    }

    #[test]
    fn test_rename_mods_same_parent() {
        let mods = rename_mods("cn=a,cn=users,dc=x", &req("cn=b", true, None)).unwrap();
        assert_eq!(mods.len(), 3);
        assert_eq!(mods[0].op, ModOp::Replace);
        assert_eq!(mods[0].attr.name, attr::ENTRY_DN);
        assert_eq!(mods[0].attr.first(), Some("cn=b,cn=users,dc=x"));
        assert_eq!((mods[1].op, mods[1].attr.first()), (ModOp::Add, Some("b")));
        assert_eq!((mods[2].op, mods[2].attr.first()), (ModOp::Delete, Some("a")));
    }

    #[test]
    fn test_rename_mods_move_keeps_rdn() {
        let mods = rename_mods("cn=a,cn=users,dc=x", &req("CN=A", false, Some("ou=o,dc=x"))).unwrap();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].attr.first(), Some("cn=A,ou=o,dc=x"));
    }

    #[test]
    fn test_rename_rejects_multi_rdn() {
        assert!(matches!(
            rename_mods("cn=a,dc=x", &req("cn=b,ou=c", true, None)),
            Err(DirError::UnwillingToPerform(_))
        ));
    }

    #[test]
    fn test_upn_syntax() {
        assert!(check_upn("u1@vsphere.local").is_ok());
        assert!(check_upn("u1").is_err());
        assert!(check_upn("@realm").is_err());
        assert!(check_upn("a@b@c").is_err());
    }
}
