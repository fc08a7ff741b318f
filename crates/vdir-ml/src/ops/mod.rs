//! Operation model and the shared parts of the write pipelines.
//!
//! An [`Operation`] owns its entry, modification list and write-queue
//! element for its whole lifetime. The public entry points on
//! [`DirectoryService`] (`add`, `modify`, `delete`, `search`) fill in the
//! client-facing [`OpResult`]; the `internal_*` variants run the same
//! pipelines but return the error directly and leave the result untouched.

mod add;
mod delete;
mod modify;

use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

pub use crate::access::BindInfo;
use crate::backend::BackendTxn;
use crate::dn;
use crate::entry::{Attribute, Entry, ModOp, Modification};
use crate::error::{DirError, OpResult, Result, ResultCode};
use crate::lifecycle::ServerState;
use crate::metadata::{check_version_regression, resolve_value_conflicts, MetadataContext};
use crate::metrics::{OpRecord, PhaseTimings};
use crate::schema::Schema;
use crate::search::{SearchOutcome, SearchRequest};
use crate::service::DirectoryService;
use crate::types::{attr, OpKind, OpOrigin, Usn};
use crate::write_queue::WriteQueueElement;

/// ModifyDN part of a Modify request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameRequest {
    /// New relative DN, e.g. `cn=new`.
    pub new_rdn: String,
    /// Remove the old RDN value from the entry.
    pub delete_old_rdn: bool,
    /// New parent DN, if the entry moves.
    pub new_superior: Option<String>,
}

/// The unit of work handed to the pipelines.
pub struct Operation {
    /// Operation kind.
    pub kind: OpKind,
    /// Where the request came from.
    pub origin: OpOrigin,
    /// Identity the operation runs as.
    pub bind: BindInfo,
    /// Target DN as supplied.
    pub dn: String,
    /// Normalized target DN, filled when the pipeline starts.
    pub norm_dn: String,
    /// Add: the entry to create. After a successful write: the stored entry.
    pub entry: Option<Entry>,
    /// Modify/Delete modifications, including those added by hooks.
    pub mods: Vec<Modification>,
    /// Rename part of a Modify.
    pub rename: Option<RenameRequest>,
    /// Search request.
    pub search: Option<SearchRequest>,
    /// Search results.
    pub search_result: Option<SearchOutcome>,
    /// USN assigned through the write queue, `Usn::NONE` until then.
    pub usn: Usn,
    pub(crate) wq: WriteQueueElement,
    /// Client-facing result.
    pub result: OpResult,
    /// Per-phase timings.
    pub timings: PhaseTimings,
    /// Delete: DN before tombstoning.
    pub orig_norm_dn: String,
    /// Delete: DN the tombstone was moved to.
    pub tombstone_dn: Option<String>,
    /// Delete: the target is already a tombstone and is purged for good.
    pub tombstone_age_off: bool,
}

impl Operation {
    fn new(kind: OpKind, origin: OpOrigin, bind: BindInfo, dn: &str) -> Self {
        Self {
            kind,
            origin,
            bind,
            dn: dn.to_string(),
            norm_dn: String::new(),
            entry: None,
            mods: Vec::new(),
            rename: None,
            search: None,
            search_result: None,
            usn: Usn::NONE,
            wq: WriteQueueElement::new(),
            result: OpResult::default(),
            timings: PhaseTimings::default(),
            orig_norm_dn: String::new(),
            tombstone_dn: None,
            tombstone_age_off: false,
        }
    }

    /// Add request.
    pub fn add(origin: OpOrigin, bind: BindInfo, entry: Entry) -> Self {
        let mut op = Self::new(OpKind::Add, origin, bind, &entry.dn);
        op.entry = Some(entry);
        op
    }

    /// Modify request.
    pub fn modify(origin: OpOrigin, bind: BindInfo, dn: &str, mods: Vec<Modification>) -> Self {
        let mut op = Self::new(OpKind::Modify, origin, bind, dn);
        op.mods = mods;
        op
    }

    /// ModifyDN request, executed through the Modify pipeline.
    pub fn rename(origin: OpOrigin, bind: BindInfo, dn: &str, rename: RenameRequest) -> Self {
        let mut op = Self::new(OpKind::Modify, origin, bind, dn);
        op.rename = Some(rename);
        op
    }

    /// Delete request.
    pub fn delete(origin: OpOrigin, bind: BindInfo, dn: &str) -> Self {
        Self::new(OpKind::Delete, origin, bind, dn)
    }

    /// Search request.
    pub fn search(origin: OpOrigin, bind: BindInfo, request: SearchRequest) -> Self {
        let mut op = Self::new(OpKind::Search, origin, bind, &request.base);
        op.search = Some(request);
        op
    }

    /// Returns true for inbound replication.
    pub fn is_repl(&self) -> bool {
        self.origin == OpOrigin::Repl
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("dn", &self.dn)
            .field("usn", &self.usn)
            .field("mods", &self.mods.len())
            .field("result", &self.result)
            .finish()
    }
}

impl DirectoryService {
    /// Adds an entry on behalf of a client.
    pub fn add(&self, op: &mut Operation) -> OpResult {
        self.respond(op, Self::run_add)
    }

    /// Modifies (or renames) an entry on behalf of a client.
    pub fn modify(&self, op: &mut Operation) -> OpResult {
        self.respond(op, Self::run_modify)
    }

    /// Deletes an entry on behalf of a client.
    pub fn delete(&self, op: &mut Operation) -> OpResult {
        self.respond(op, Self::run_delete)
    }

    /// Runs a search on behalf of a client.
    pub fn search(&self, op: &mut Operation) -> OpResult {
        self.respond(op, Self::run_search)
    }

    /// Add without a client result.
    pub fn internal_add(&self, op: &mut Operation) -> Result<()> {
        self.dispatch(op, Self::run_add)
    }

    /// Modify without a client result.
    pub fn internal_modify(&self, op: &mut Operation) -> Result<()> {
        self.dispatch(op, Self::run_modify)
    }

    /// Delete without a client result.
    pub fn internal_delete(&self, op: &mut Operation) -> Result<()> {
        self.dispatch(op, Self::run_delete)
    }

    /// Search without a client result.
    pub fn internal_search(&self, op: &mut Operation) -> Result<()> {
        self.dispatch(op, Self::run_search)
    }

    /// Takes the next USN from the write queue for `op`. The operational
    /// attribute hooks call this for local writes; replication consumers call
    /// it before handing the operation over.
    pub fn assign_usn(&self, op: &mut Operation) -> Result<Usn> {
        let usn = self.write_queue().push(self.backend().as_ref(), &mut op.wq)?;
        op.usn = usn;
        Ok(usn)
    }

    fn respond(&self, op: &mut Operation, run: fn(&Self, &mut Operation) -> Result<()>) -> OpResult {
        let result = self.dispatch(op, run);
        op.result = match &result {
            Ok(()) => OpResult::success(),
            Err(e) => OpResult::from_error(e),
        };
        op.result.clone()
    }

    fn dispatch(&self, op: &mut Operation, run: fn(&Self, &mut Operation) -> Result<()>) -> Result<()> {
        let started = Instant::now();
        let result = run(self, op);
        // The element normally leaves the queue right after commit; this
        // covers paths that failed before reaching it.
        self.write_queue().pop(&mut op.wq);
        self.complete(op, started, &result);
        result
    }

    fn complete(&self, op: &mut Operation, started: Instant, result: &Result<()>) {
        op.timings.total = started.elapsed();
        let code = match result {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                match e {
                    DirError::NoUsn | DirError::UsnAlreadyAssigned(_) => {
                        error!(op = %op.kind, dn = %op.dn, error = %e, "operation sequencing failure")
                    }
                    _ => debug!(op = %op.kind, origin = %op.origin, dn = %op.dn, error = %e, "operation failed"),
                }
                e.result_code()
            }
        };
        let record = OpRecord {
            kind: op.kind,
            origin: op.origin,
            dn: if op.norm_dn.is_empty() {
                op.dn.clone()
            } else {
                op.norm_dn.clone()
            },
            requester: op.bind.dn.clone(),
            usn: op.usn,
            code,
            timings: op.timings,
        };
        self.metrics().record(&record);
        self.notify_observers(&record);

        let limit_ms = if op.kind == OpKind::Search {
            self.config().metrics.efficient_read_op_ms
        } else {
            self.config().metrics.efficient_write_op_ms
        };
        if op.timings.total > Duration::from_millis(limit_ms) {
            self.metrics().record_slow_op();
            warn!(
                op = %op.kind,
                origin = %op.origin,
                dn = %record.dn,
                total_ms = op.timings.total.as_millis() as u64,
                pre_plugin_ms = op.timings.pre_plugin.as_millis() as u64,
                wq_wait_ms = op.timings.wq_wait.as_millis() as u64,
                be_begin_ms = op.timings.be_begin.as_millis() as u64,
                be_commit_ms = op.timings.be_commit.as_millis() as u64,
                post_plugin_ms = op.timings.post_plugin.as_millis() as u64,
                "inefficient operation"
            );
        }
    }

    /// Gate shared by the mutating pipelines.
    pub(crate) fn check_write_allowed(&self, op: &Operation) -> Result<()> {
        let state = self.state();
        if state == ServerState::Shutdown {
            return Err(DirError::Unavailable);
        }
        if op.origin == OpOrigin::External && !op.bind.is_bound() {
            return Err(DirError::NotBound);
        }
        if op.origin != OpOrigin::Repl
            && (state == ServerState::ReadOnly || self.config().server.read_only)
        {
            return Err(DirError::UnwillingToPerform("server in read-only mode".into()));
        }
        Ok(())
    }

    /// Serializes writes below the schema container.
    pub(crate) fn schema_guard(&self, norm_dn: &str) -> Option<MutexGuard<'_, ()>> {
        if dn::is_descendant_or_self(norm_dn, &self.config().schema_dn()) {
            Some(self.schema_mutex().lock().unwrap_or_else(|e| e.into_inner()))
        } else {
            None
        }
    }

    /// Waits for the write-queue head and records the wait time.
    pub(crate) fn wait_turn(&self, op: &mut Operation) -> Result<()> {
        if !op.usn.is_set() {
            return Err(DirError::NoUsn);
        }
        let waited = self
            .write_queue()
            .wait(&op.wq, self.config().write_queue_timeout())?;
        op.timings.wq_wait += waited;
        Ok(())
    }

    pub(crate) fn metadata_context<'a>(&'a self, usn: Usn, time: &'a str) -> MetadataContext<'a> {
        MetadataContext {
            usn,
            server_id: &self.config().server.invocation_id,
            time,
            concurrent_value_update: self.config().server.concurrent_value_update,
        }
    }

    /// Records the write in the counters and the audit log.
    pub(crate) fn audit_write(&self, op: &Operation, dn: &str) {
        self.bump_write_count();
        tracing::info!(
            target: "vdir_ml::audit",
            op = %op.kind,
            dn,
            requester = %op.bind.dn,
            usn = op.usn.as_u64(),
            "write committed"
        );
    }
}

/// Normalizes the values of every modification.
pub(crate) fn normalize_mods(schema: &dyn Schema, mods: &mut [Modification]) -> Result<()> {
    for m in mods.iter_mut() {
        m.attr.normalize(schema)?;
        if m.op != ModOp::Delete {
            m.attr.check_duplicates()?;
        }
    }
    Ok(())
}

/// Rewrites Replace modifications against the current entry: no values
/// deletes the attribute, an absent attribute becomes an Add, otherwise a
/// Delete of all values followed by an Add.
pub(crate) fn desugar_replace(entry: &Entry, mods: Vec<Modification>) -> Vec<Modification> {
    let mut out = Vec::with_capacity(mods.len() + 2);
    for m in mods {
        if m.op != ModOp::Replace || m.ignore {
            out.push(m);
            continue;
        }
        let present = entry
            .find_attr(&m.attr.name)
            .map_or(false, |a| !a.values.is_empty());
        if m.attr.values.is_empty() {
            let mut delete = m;
            delete.op = ModOp::Delete;
            delete.ignore = !present;
            out.push(delete);
        } else if !present {
            let mut add = m;
            add.op = ModOp::Add;
            out.push(add);
        } else {
            let mut delete_all = Modification {
                op: ModOp::Delete,
                attr: Attribute::empty(&m.attr.name),
                ignore: false,
                force_version_gap: m.force_version_gap,
            };
            delete_all.attr.descriptor = m.attr.descriptor.clone();
            out.push(delete_all);
            let mut add = m;
            add.op = ModOp::Add;
            add.force_version_gap = 0;
            out.push(add);
        }
    }
    out
}

/// Applies modifications to the in-memory entry.
///
/// For replicated operations, values that lose against newer stored
/// per-value metadata are dropped first, and adds of present values or
/// deletes of absent ones are tolerated. Incoming attribute metadata is
/// re-stamped with the local USN.
pub(crate) fn apply_mods(
    txn: &mut dyn BackendTxn,
    entry: &mut Entry,
    mods: &mut [Modification],
    origin: OpOrigin,
    usn: Usn,
) -> Result<()> {
    let repl = origin == OpOrigin::Repl;
    let id = entry.id;
    for m in mods.iter_mut() {
        if m.ignore {
            continue;
        }
        let name = m.attr.name.clone();
        if repl {
            if let Some(id) = id {
                let stored = txn.value_metadata(id, &name)?;
                if !stored.is_empty() {
                    resolve_value_conflicts(m, &stored);
                }
                if let Some(incoming) = &m.attr.metadata {
                    let current = txn.attr_metadata(id, &name)?;
                    check_version_regression(&entry.norm_dn, &name, current.as_ref(), incoming);
                }
            }
            if let Some(meta) = m.attr.metadata.as_mut() {
                meta.local_usn = usn;
            }
            for vm in m.attr.value_meta_to_add.iter_mut() {
                vm.meta.local_usn = usn;
            }
            if m.ignore {
                continue;
            }
        }
        match m.op {
            ModOp::Add => apply_add(entry, m, repl)?,
            ModOp::Delete => apply_delete(entry, m, repl)?,
            ModOp::Replace => {
                entry.remove_attr(&name);
                if !m.attr.values.is_empty() {
                    entry.add_attribute(m.attr.clone());
                }
            }
        }
    }
    sync_dn_from_attr(entry)
}

fn apply_add(entry: &mut Entry, m: &mut Modification, repl: bool) -> Result<()> {
    let name = m.attr.name.clone();
    match entry.find_attr_mut(&name) {
        None => {
            let mut attribute = m.attr.clone();
            attribute.value_meta_to_add.clear();
            attribute.value_meta_to_delete.clear();
            entry.attrs.push(attribute);
        }
        Some(existing) => {
            let mut kept = Vec::with_capacity(m.attr.values.len());
            for value in m.attr.values.drain(..) {
                if existing.has_value(value.norm_or_raw()) {
                    if repl {
                        debug!(attr = %name, value = %value.raw, "replicated add of present value dropped");
                        continue;
                    }
                    return Err(DirError::TypeOrValueExists {
                        attr: name,
                        value: value.raw,
                    });
                }
                existing.values.push(value.clone());
                kept.push(value);
            }
            m.attr.values = kept;
            if m.attr.metadata.is_some() {
                existing.metadata = m.attr.metadata.clone();
            }
        }
    }
    Ok(())
}

fn apply_delete(entry: &mut Entry, m: &mut Modification, repl: bool) -> Result<()> {
    let name = m.attr.name.clone();
    let existing = match entry.find_attr_mut(&name) {
        Some(existing) => existing,
        None if repl => {
            debug!(attr = %name, "replicated delete of absent attribute dropped");
            return Ok(());
        }
        None => return Err(DirError::NoSuchAttribute(name)),
    };
    if m.attr.values.is_empty() {
        entry.remove_attr(&name);
        return Ok(());
    }
    for value in &m.attr.values {
        match existing.position_of(value.norm_or_raw()) {
            Some(pos) => {
                existing.values.remove(pos);
            }
            None if repl => {
                debug!(attr = %name, value = %value.raw, "replicated delete of absent value dropped");
            }
            None => {
                return Err(DirError::NoSuchAttribute(format!(
                    "{}: value '{}' not present",
                    name, value.raw
                )))
            }
        }
    }
    if m.attr.metadata.is_some() {
        existing.metadata = m.attr.metadata.clone();
    }
    if existing.values.is_empty() {
        entry.remove_attr(&name);
    }
    Ok(())
}

/// Moves the entry to the DN held in its entryDN attribute, if that changed.
fn sync_dn_from_attr(entry: &mut Entry) -> Result<()> {
    let target = match entry.get_single(attr::ENTRY_DN) {
        Some(v) => v.to_string(),
        None => return Ok(()),
    };
    let norm = dn::normalize_dn(&target)?;
    if norm != entry.norm_dn {
        debug!(from = %entry.norm_dn, to = %norm, "entry DN changed");
        entry.dn = target;
        entry.norm_dn = norm;
        let parent = dn::parent_dn(&entry.norm_dn);
        entry.new_parent_dn = Some(parent.clone());
        entry.parent_dn = parent;
        entry.dn_modified = true;
    }
    Ok(())
}
