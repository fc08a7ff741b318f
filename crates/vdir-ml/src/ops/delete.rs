use std::time::Instant;

use tracing::{debug, info, warn};

use super::{apply_mods, desugar_replace, normalize_mods, Operation};
use crate::access::AccessRight;
use crate::backend::{BackendTxn, LockMode, TxnMode};
use crate::dn;
use crate::entry::{Attribute, Entry, ModOp, Modification};
use crate::error::{DirError, Result};
use crate::metadata::generate_modify_metadata;
use crate::plugin::Phase;
use crate::schema::Schema;
use crate::service::DirectoryService;
use crate::types::{attr, class, now_generalized, OpOrigin};

/// Marker between the original RDN and the GUID in a tombstone RDN.
pub const TOMBSTONE_GUID_MARKER: &str = "#objectGUID:";

/// Builds the DN an entry is moved to when it is deleted.
pub fn tombstone_dn(dn: &str, guid: &str, deleted_objects_dn: &str) -> String {
    let rdn = format!("{}{}{}", dn::rdn(dn), TOMBSTONE_GUID_MARKER, guid);
    dn::cat_dn(&rdn, deleted_objects_dn)
}

/// Splits a tombstone DN into the original RDN, the GUID and the container.
pub fn parse_tombstone_dn(dn: &str) -> Option<(String, String, String)> {
    let rdn = dn::rdn(dn);
    let marker = rdn
        .to_ascii_lowercase()
        .find(&TOMBSTONE_GUID_MARKER.to_ascii_lowercase())?;
    let original = rdn[..marker].to_string();
    let guid = rdn[marker + TOMBSTONE_GUID_MARKER.len()..].to_string();
    if original.is_empty() || guid.is_empty() {
        return None;
    }
    Some((original, guid, dn::parent_dn(dn)))
}

impl DirectoryService {
    pub(crate) fn run_delete(&self, op: &mut Operation) -> Result<()> {
        self.check_write_allowed(op)?;
        op.norm_dn = dn::normalize_dn(&op.dn)?;
        if op.norm_dn.is_empty() {
            return Err(DirError::UnwillingToPerform("cannot delete the root entry".into()));
        }
        op.orig_norm_dn = op.norm_dn.clone();
        op.tombstone_age_off = dn::parent_dn(&op.norm_dn) == self.config().deleted_objects_dn();

        let _schema_guard = self.schema_guard(&op.norm_dn);
        if op.tombstone_age_off {
            let result = self.purge_tombstone(op);
            if result.is_ok() {
                self.audit_write(op, &op.orig_norm_dn);
            }
            return result;
        }

        let result = self.tombstone_entry(op);
        self.write_queue().pop(&mut op.wq);
        if result.is_ok() {
            self.after_delete_commit(op);
        }
        result
    }

    /// Physically removes an entry that is already a tombstone. No USN is
    /// consumed and the write queue is not involved.
    fn purge_tombstone(&self, op: &mut Operation) -> Result<()> {
        self.retry().run("tombstone purge", |attempt| {
            if attempt > 1 {
                self.metrics().record_deadlock_retry();
            }
            let mut txn = self.backend().begin(TxnMode::Write)?;
            let entry = read_for_delete(txn.as_mut(), &op.norm_dn)?;
            if !entry.is_deleted() {
                return Err(DirError::UnwillingToPerform(format!(
                    "{} is not a tombstone",
                    entry.norm_dn
                )));
            }
            txn.delete_entry(&entry)
                .map_err(|e| e.context("backend delete"))?;
            txn.commit().map_err(|e| e.context("txn commit"))
        })?;
        info!(dn = %op.norm_dn, "tombstone purged");
        Ok(())
    }

    fn tombstone_entry(&self, op: &mut Operation) -> Result<()> {
        let started = Instant::now();
        let pre = self.plugins().run(Phase::PreModApplyDelete, self, op, None);
        op.timings.pre_plugin += started.elapsed();
        pre?;

        normalize_mods(self.schema(), &mut op.mods)?;
        self.wait_turn(op)?;

        let now = now_generalized();
        let container = self.config().deleted_objects_dn();
        let requested = op.mods.clone();
        let mut stored: Option<Entry> = None;
        self.retry().run("delete", |attempt| {
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

            let mut entry = read_for_delete(txn.as_mut(), &op.norm_dn)?;
            entry.normalize(self.schema())?;
            let id = entry
                .id
                .ok_or_else(|| DirError::Internal(format!("{} has no entry id", entry.norm_dn)))?;
            if txn.has_children(id)? {
                return Err(DirError::NotAllowedOnNonLeaf(entry.norm_dn.clone()));
            }
            if op.origin == OpOrigin::External {
                self.access().check(&op.bind, &entry, AccessRight::DELETE)?;
            }

            let started = Instant::now();
            let pre = self
                .plugins()
                .run(Phase::PreDelete, self, op, Some(&mut entry));
            op.timings.pre_plugin += started.elapsed();
            pre?;

            let guid = entry
                .get_single(attr::OBJECT_GUID)
                .ok_or_else(|| {
                    DirError::UnwillingToPerform(format!("{} has no objectGUID", entry.norm_dn))
                })?
                .to_string();
            let target = tombstone_dn(&entry.dn, &guid, &container);

            let mut mods = strip_mods(self.schema(), &entry);
            mods.push(Modification::replace(attr::ENTRY_DN, &[target.as_str()]));
            mods.extend(op.mods.iter().cloned());
            let mut mods = desugar_replace(&entry, mods);
            normalize_mods(self.schema(), &mut mods)?;
            generate_modify_metadata(
                txn.as_mut(),
                &entry,
                &mut mods,
                &self.metadata_context(op.usn, &now),
            )?;
            apply_mods(txn.as_mut(), &mut entry, &mut mods, op.origin, op.usn)?;

            txn.modify_entry(&mods, &entry)
                .map_err(|e| e.context("backend modify"))?;
            txn.delete_value_metadata(id)?;

            let committing = Instant::now();
            txn.commit().map_err(|e| e.context("txn commit"))?;
            op.timings.be_commit += committing.elapsed();

            debug!(dn = %op.orig_norm_dn, tombstone = %entry.norm_dn, "entry tombstoned");
            op.tombstone_dn = Some(entry.norm_dn.clone());
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

    fn after_delete_commit(&self, op: &mut Operation) {
        let mut entry = op.entry.take();
        self.audit_write(op, &op.orig_norm_dn);

        if entry.as_ref().map_or(false, |e| e.has_class(class::DOMAIN)) {
            self.orgs().remove(&op.orig_norm_dn);
        }
        self.lockout().remove(&op.orig_norm_dn);

        let started = Instant::now();
        if let Err(e) = self
            .plugins()
            .run(Phase::PostDeleteCommit, self, op, entry.as_mut())
        {
            warn!(dn = %op.orig_norm_dn, error = %e, "post-delete plugins failed");
        }
        op.timings.post_plugin += started.elapsed();
        op.entry = entry;
    }
}

fn read_for_delete(txn: &mut dyn BackendTxn, norm_dn: &str) -> Result<Entry> {
    txn.dn_to_entry(norm_dn, LockMode::Write).map_err(|e| match e {
        DirError::BackendEntryNotFound(_) => DirError::NoSuchObject(norm_dn.to_string()),
        other => other,
    })
}

/// Delete-all modifications for every user application attribute.
fn strip_mods(schema: &dyn Schema, entry: &Entry) -> Vec<Modification> {
    entry
        .attrs
        .iter()
        .filter_map(|a| {
            let desc = a
                .descriptor
                .clone()
                .or_else(|| schema.attr_desc(&a.name).ok())?;
            if !desc.is_user_application() {
                return None;
            }
            let mut attribute = Attribute::empty(&a.name);
            attribute.descriptor = Some(desc);
            Some(Modification {
                op: ModOp::Delete,
                attr: attribute,
                ignore: false,
                force_version_gap: 0,
            })
        })
        .collect()
}
