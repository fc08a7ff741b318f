use std::time::Instant;

use tracing::{debug, warn};

use super::Operation;
use crate::access::{compute_security_descriptor, AccessRight};
use crate::backend::{LockMode, TxnMode};
use crate::entry::{Attribute, Entry};
use crate::error::{DirError, Result};
use crate::metadata::{generate_add_metadata, AttrMetadata};
use crate::plugin::Phase;
use crate::service::DirectoryService;
use crate::types::{attr, class, now_generalized, OpOrigin};

/// Classes whose creation is pushed to partners right away.
const URGENT_CLASSES: &[&str] = &[class::SERVER, class::REPL_AGREEMENT, class::COMPUTER];

impl DirectoryService {
    pub(crate) fn run_add(&self, op: &mut Operation) -> Result<()> {
        self.check_write_allowed(op)?;
        let mut entry = op
            .entry
            .take()
            .ok_or_else(|| DirError::InvalidRequest("add request without an entry".into()))?;
        if entry.dn.trim().len() < 3 {
            op.entry = Some(entry);
            return Err(DirError::InvalidRequest("DN too short".into()));
        }
        if let Err(e) = entry.normalize_dn() {
            op.entry = Some(entry);
            return Err(e);
        }
        op.norm_dn = entry.norm_dn.clone();

        let _schema_guard = self.schema_guard(&op.norm_dn);
        let result = self.add_to_commit(op, &mut entry);
        self.write_queue().pop(&mut op.wq);
        if result.is_ok() {
            self.after_add_commit(op, &mut entry);
        }
        op.entry = Some(entry);
        result
    }

    fn add_to_commit(&self, op: &mut Operation, entry: &mut Entry) -> Result<()> {
        let started = Instant::now();
        let pre = self
            .plugins()
            .run(Phase::PreAdd, self, op, Some(&mut *entry));
        op.timings.pre_plugin += started.elapsed();
        pre?;

        entry.normalize(self.schema())?;
        if !op.is_repl() {
            self.schema().check_entry(entry)?;
        }
        entry.check_duplicates()?;

        if !op.usn.is_set() {
            return Err(DirError::NoUsn);
        }
        let now = now_generalized();
        if op.is_repl() {
            self.stamp_replicated_add(op, entry, &now);
        } else {
            generate_add_metadata(entry, &self.metadata_context(op.usn, &now));
        }

        self.wait_turn(op)?;

        let owner = if self.access().is_admin(&op.bind) {
            "BA"
        } else {
            "CO"
        };
        let tombstone_parent = self.config().deleted_objects_dn();
        let server_id = self.config().server.invocation_id.clone();

        self.retry().run("add", |attempt| {
            if attempt > 1 {
                self.metrics().record_deadlock_retry();
            }
            let begun = Instant::now();
            let mut txn = self
                .backend()
                .begin(TxnMode::Write)
                .map_err(|e| e.context("txn begin"))?;
            op.timings.be_begin += begun.elapsed();

            entry.parent = None;
            if !entry.parent_dn.is_empty() {
                let parent_dn = entry.parent_dn.clone();
                let parent = txn
                    .dn_to_entry(&parent_dn, LockMode::Read)
                    .map_err(|e| match e {
                        DirError::BackendEntryNotFound(message) => DirError::ParentNotFound {
                            parent: parent_dn.clone(),
                            message,
                        },
                        other => other,
                    })?;
                entry.parent = Some(Box::new(parent));
            }

            if entry.parent_dn != tombstone_parent {
                self.schema()
                    .check_structure_rule(entry, entry.parent.as_deref())?;
            }

            if op.origin == OpOrigin::External {
                if let Some(parent) = entry.parent.as_deref() {
                    self.access()
                        .check(&op.bind, parent, AccessRight::CREATE_CHILD)?;
                }
            }

            if !op.is_repl() {
                let sd = compute_security_descriptor(entry, entry.parent.as_deref(), owner)?;
                entry.remove_attr(attr::ACL_STRING);
                entry.remove_attr(attr::SECURITY_DESCRIPTOR);
                let mut sd_attr = Attribute::new(attr::SECURITY_DESCRIPTOR, &[sd]);
                sd_attr.normalize(self.schema())?;
                sd_attr.metadata = Some(AttrMetadata::local(op.usn, 1, &server_id, &now));
                entry.attrs.push(sd_attr);
            }

            txn.add_entry(entry).map_err(|e| e.context("backend add"))?;

            let committing = Instant::now();
            txn.commit().map_err(|e| e.context("txn commit"))?;
            op.timings.be_commit += committing.elapsed();
            Ok(())
        })?;

        if !op.is_repl() {
            self.backend().set_max_originating_usn(op.usn);
        }
        Ok(())
    }

    /// Replicated adds keep the originating metadata; only the local USN is
    /// rewritten. Attributes that arrive without metadata get a fresh stamp.
    fn stamp_replicated_add(&self, op: &Operation, entry: &mut Entry, now: &str) {
        let server_id = &self.config().server.invocation_id;
        for attribute in &mut entry.attrs {
            match attribute.metadata.as_mut() {
                Some(meta) => meta.local_usn = op.usn,
                None => {
                    debug!(attr = %attribute.name, dn = %entry.norm_dn, "replicated attribute without metadata");
                    attribute.metadata = Some(AttrMetadata::local(op.usn, 1, server_id, now));
                }
            }
        }
    }

    fn after_add_commit(&self, op: &mut Operation, entry: &mut Entry) {
        self.audit_write(op, &entry.dn);

        if self.config().server.urgent_replication
            && op.origin != OpOrigin::Repl
            && URGENT_CLASSES.iter().any(|c| entry.has_class(c))
        {
            debug!(dn = %entry.norm_dn, usn = %op.usn, "urgent replication requested");
            self.urgent_replication().note(op.usn);
        }
        if entry.has_class(class::DOMAIN) {
            self.orgs().insert(&entry.norm_dn);
        }

        let started = Instant::now();
        if let Err(e) = self
            .plugins()
            .run(Phase::PostAddCommit, self, op, Some(&mut *entry))
        {
            warn!(dn = %entry.norm_dn, error = %e, "post-add plugins failed");
        }
        op.timings.post_plugin += started.elapsed();
    }
}
