//! In-memory backend used by tests and the bootstrap binary.
//!
//! Entries are stored bincode-encoded in a `BTreeMap` behind a `RwLock`.
//! Write transactions stage their changes in private overlays that reads
//! through the same transaction observe; commit re-validates and applies them
//! under the write lock, so a transaction is all-or-nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use crate::backend::{
    Backend, BackendTxn, IndexInfo, IndexIterator, IndexLookup, IndexProbe, LockMode, TxnMode,
};
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::metadata::{AttrMetadata, ValueMetadata};
use crate::types::{attr, EntryId, Usn};

/// Attributes indexed out of the box.
pub const DEFAULT_INDICES: &[(&str, bool)] = &[
    (attr::OBJECT_CLASS, false),
    (attr::CN, false),
    (attr::USN_CHANGED, false),
    (attr::USN_CREATED, false),
    (attr::MEMBER, false),
    (attr::MEMBER_OF, false),
    (attr::OBJECT_GUID, true),
    (attr::OBJECT_SID, true),
    ("samaccountname", true),
    (attr::UPN, true),
    (attr::SPN, true),
];

#[derive(Default)]
struct AttrIndex {
    unique: bool,
    values: BTreeMap<String, BTreeSet<EntryId>>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<EntryId, Vec<u8>>,
    dn_index: BTreeMap<String, EntryId>,
    children: HashMap<String, BTreeSet<EntryId>>,
    indices: HashMap<String, AttrIndex>,
    attr_meta: HashMap<(EntryId, String), AttrMetadata>,
    value_meta: HashMap<(EntryId, String), Vec<ValueMetadata>>,
}

impl State {
    fn decode(&self, id: EntryId) -> Result<Option<Entry>> {
        match self.entries.get(&id) {
            Some(bytes) => Ok(Some(Entry::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    fn index_entry(&mut self, entry: &Entry, id: EntryId) {
        for attribute in &entry.attrs {
            if let Some(index) = self.indices.get_mut(&attribute.name) {
                for value in &attribute.values {
                    index
                        .values
                        .entry(value.norm_or_raw().to_string())
                        .or_default()
                        .insert(id);
                }
            }
        }
        self.dn_index.insert(entry.norm_dn.clone(), id);
        self.children
            .entry(entry.parent_dn.clone())
            .or_default()
            .insert(id);
    }

    fn unindex_entry(&mut self, entry: &Entry, id: EntryId) {
        for attribute in &entry.attrs {
            if let Some(index) = self.indices.get_mut(&attribute.name) {
                for value in &attribute.values {
                    let key = value.norm_or_raw();
                    let now_empty = match index.values.get_mut(key) {
                        Some(ids) => {
                            ids.remove(&id);
                            ids.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        index.values.remove(key);
                    }
                }
            }
        }
        if self.dn_index.get(&entry.norm_dn) == Some(&id) {
            self.dn_index.remove(&entry.norm_dn);
        }
        if let Some(kids) = self.children.get_mut(&entry.parent_dn) {
            kids.remove(&id);
            if kids.is_empty() {
                self.children.remove(&entry.parent_dn);
            }
        }
    }
}

pub(crate) fn compare_values(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

pub(crate) fn substring_matches(value: &str, initial: &Option<String>, any: &[String], last: &Option<String>) -> bool {
    let mut rest = value;
    if let Some(prefix) = initial {
        match rest.strip_prefix(prefix.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for fragment in any {
        match rest.find(fragment.as_str()) {
            Some(pos) => rest = &rest[pos + fragment.len()..],
            None => return false,
        }
    }
    match last {
        Some(suffix) => rest.ends_with(suffix.as_str()),
        None => true,
    }
}

/// Collects IDs from `sets`, failing once more than `limit` IDs were seen.
fn collect_limited<'a, I>(sets: I, limit: usize) -> IndexLookup
where
    I: Iterator<Item = &'a BTreeSet<EntryId>>,
{
    let mut out = BTreeSet::new();
    for ids in sets {
        for id in ids {
            out.insert(*id);
            if limit > 0 && out.len() > limit {
                return IndexLookup::LimitExceeded;
            }
        }
    }
    IndexLookup::Found(out.into_iter().collect())
}

/// In-memory [`Backend`] implementation.
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
    usn: AtomicU64,
    max_originating_usn: AtomicU64,
    next_id: Arc<AtomicU64>,
    deadlocks: Arc<AtomicU32>,
}

impl MemoryBackend {
    /// Creates an empty backend with the default indices.
    pub fn new() -> Self {
        let mut state = State::default();
        for (name, unique) in DEFAULT_INDICES {
            state.indices.insert(
                name.to_string(),
                AttrIndex {
                    unique: *unique,
                    values: BTreeMap::new(),
                },
            );
        }
        Self {
            state: Arc::new(RwLock::new(state)),
            usn: AtomicU64::new(0),
            max_originating_usn: AtomicU64::new(0),
            next_id: Arc::new(AtomicU64::new(1)),
            deadlocks: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Makes the next `n` lock-taking calls fail with a backend deadlock.
    pub fn inject_deadlocks(&self, n: u32) {
        self.deadlocks.store(n, Ordering::SeqCst);
    }

    /// Number of injected deadlocks not yet consumed.
    pub fn pending_deadlocks(&self) -> u32 {
        self.deadlocks.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn begin(&self, mode: TxnMode) -> Result<Box<dyn BackendTxn>> {
        Ok(Box::new(MemoryTxn {
            state: self.state.clone(),
            next_id: self.next_id.clone(),
            deadlocks: self.deadlocks.clone(),
            mode,
            entries: BTreeMap::new(),
            dns: HashMap::new(),
            attr_meta: HashMap::new(),
            value_meta: HashMap::new(),
            purged: HashSet::new(),
            finished: false,
        }))
    }

    fn next_usn(&self) -> Result<Usn> {
        Ok(Usn::new(self.usn.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn max_usn(&self) -> Usn {
        Usn::new(self.usn.load(Ordering::SeqCst))
    }

    fn set_max_originating_usn(&self, usn: Usn) {
        self.max_originating_usn
            .fetch_max(usn.as_u64(), Ordering::SeqCst);
    }

    fn max_originating_usn(&self) -> Usn {
        Usn::new(self.max_originating_usn.load(Ordering::SeqCst))
    }

    fn get_candidates(
        &self,
        attr_name: &str,
        probe: &IndexProbe,
        scan_limit: usize,
    ) -> Result<IndexLookup> {
        let state = self
            .state
            .read()
            .map_err(|e| DirError::Backend(e.to_string()))?;
        let name = attr_name.to_ascii_lowercase();

        if name == attr::ENTRY_DN {
            return Ok(match probe {
                IndexProbe::Equal(v) => IndexLookup::Found(
                    state.dn_index.get(v).map(|id| vec![*id]).unwrap_or_default(),
                ),
                IndexProbe::Substring { initial, any, last } => {
                    let mut out = BTreeSet::new();
                    for (dn, id) in &state.dn_index {
                        if substring_matches(dn, initial, any, last) {
                            out.insert(*id);
                            if scan_limit > 0 && out.len() > scan_limit {
                                return Ok(IndexLookup::LimitExceeded);
                            }
                        }
                    }
                    IndexLookup::Found(out.into_iter().collect())
                }
                IndexProbe::OneLevel(parent) => match state.children.get(parent) {
                    Some(kids) => collect_limited(std::iter::once(kids), scan_limit),
                    None => IndexLookup::Found(Vec::new()),
                },
                _ => IndexLookup::NotIndexed,
            });
        }
        if let IndexProbe::OneLevel(parent) = probe {
            return Ok(match state.children.get(parent) {
                Some(kids) => collect_limited(std::iter::once(kids), scan_limit),
                None => IndexLookup::Found(Vec::new()),
            });
        }

        let index = match state.indices.get(&name) {
            Some(index) => index,
            None => return Ok(IndexLookup::NotIndexed),
        };
        let lookup = match probe {
            IndexProbe::Equal(v) => collect_limited(index.values.get(v).into_iter(), scan_limit),
            IndexProbe::GreaterOrEqual(v) => collect_limited(
                index
                    .values
                    .iter()
                    .filter(|(k, _)| compare_values(k, v) != std::cmp::Ordering::Less)
                    .map(|(_, ids)| ids),
                scan_limit,
            ),
            IndexProbe::LessOrEqual(v) => collect_limited(
                index
                    .values
                    .iter()
                    .filter(|(k, _)| compare_values(k, v) != std::cmp::Ordering::Greater)
                    .map(|(_, ids)| ids),
                scan_limit,
            ),
            IndexProbe::Substring { initial, any, last } => collect_limited(
                index
                    .values
                    .iter()
                    .filter(|(k, _)| substring_matches(k, initial, any, last))
                    .map(|(_, ids)| ids),
                scan_limit,
            ),
            IndexProbe::OneLevel(_) => IndexLookup::NotIndexed,
        };
        trace!(attr = %name, ?probe, scan_limit, ?lookup, "index probe");
        Ok(lookup)
    }

    fn index_iterator(&self, attr_name: &str, probe: &IndexProbe) -> Result<Option<IndexIterator>> {
        let state = self
            .state
            .read()
            .map_err(|e| DirError::Backend(e.to_string()))?;
        let index = match state.indices.get(&attr_name.to_ascii_lowercase()) {
            Some(index) => index,
            None => return Ok(None),
        };
        let mut keys: Vec<(&String, &BTreeSet<EntryId>)> = index
            .values
            .iter()
            .filter(|(k, _)| match probe {
                IndexProbe::Equal(v) => *k == v,
                IndexProbe::GreaterOrEqual(v) => {
                    compare_values(k, v) != std::cmp::Ordering::Less
                }
                IndexProbe::LessOrEqual(v) => {
                    compare_values(k, v) != std::cmp::Ordering::Greater
                }
                IndexProbe::Substring { initial, any, last } => {
                    substring_matches(k, initial, any, last)
                }
                IndexProbe::OneLevel(_) => false,
            })
            .collect();
        keys.sort_by(|a, b| compare_values(a.0, b.0));
        let ids: Vec<EntryId> = keys
            .into_iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        Ok(Some(Box::new(ids.into_iter())))
    }

    fn index_info(&self, attr_name: &str) -> Option<IndexInfo> {
        let name = attr_name.to_ascii_lowercase();
        if name == attr::ENTRY_DN {
            return Some(IndexInfo { unique: true });
        }
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .indices
            .get(&name)
            .map(|i| IndexInfo { unique: i.unique })
    }

    fn configure_index(&self, attr_name: &str, unique: bool) -> Result<()> {
        let name = attr_name.to_ascii_lowercase();
        let mut state = self
            .state
            .write()
            .map_err(|e| DirError::Backend(e.to_string()))?;
        let mut index = AttrIndex {
            unique,
            values: BTreeMap::new(),
        };
        for (id, bytes) in &state.entries {
            let entry = Entry::from_bytes(bytes)?;
            if let Some(attribute) = entry.find_attr(&name) {
                for value in &attribute.values {
                    let ids = index
                        .values
                        .entry(value.norm_or_raw().to_string())
                        .or_default();
                    ids.insert(*id);
                    if unique && ids.len() > 1 {
                        return Err(DirError::ConstraintViolation(format!(
                            "cannot build unique index on {}: value '{}' is shared",
                            name, value.raw
                        )));
                    }
                }
            }
        }
        debug!(attr = %name, unique, keys = index.values.len(), "index configured");
        state.indices.insert(name, index);
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

/// Transaction over a [`MemoryBackend`].
pub struct MemoryTxn {
    state: Arc<RwLock<State>>,
    next_id: Arc<AtomicU64>,
    deadlocks: Arc<AtomicU32>,
    mode: TxnMode,
    /// Staged entry writes; None marks a deletion.
    entries: BTreeMap<EntryId, Option<Entry>>,
    /// Staged DN mappings; None marks a DN that no longer resolves.
    dns: HashMap<String, Option<EntryId>>,
    attr_meta: HashMap<(EntryId, String), AttrMetadata>,
    value_meta: HashMap<(EntryId, String), Vec<ValueMetadata>>,
    purged: HashSet<EntryId>,
    finished: bool,
}

impl MemoryTxn {
    fn take_deadlock(&self) -> Result<()> {
        let hit = self
            .deadlocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            debug!("injected backend deadlock");
            return Err(DirError::BackendDeadlock("injected lock conflict".to_string()));
        }
        Ok(())
    }

    fn require_write(&self) -> Result<()> {
        if self.mode != TxnMode::Write {
            return Err(DirError::Backend(
                "write attempted in a read transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| DirError::Backend(e.to_string()))
    }

    fn resolve_dn(&self, norm_dn: &str) -> Result<Option<EntryId>> {
        if let Some(staged) = self.dns.get(norm_dn) {
            return Ok(*staged);
        }
        Ok(self.read_state()?.dn_index.get(norm_dn).copied())
    }

    fn load(&self, id: EntryId) -> Result<Option<Entry>> {
        if let Some(staged) = self.entries.get(&id) {
            return Ok(staged.clone());
        }
        self.read_state()?.decode(id)
    }

    fn stored_value_meta(&self, id: EntryId, attr_name: &str) -> Result<Vec<ValueMetadata>> {
        let key = (id, attr_name.to_string());
        if let Some(staged) = self.value_meta.get(&key) {
            return Ok(staged.clone());
        }
        if self.purged.contains(&id) {
            return Ok(Vec::new());
        }
        Ok(self
            .read_state()?
            .value_meta
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn stage_put(&mut self, entry: Entry, id: EntryId, previous_dn: Option<String>) {
        if let Some(old) = previous_dn {
            if old != entry.norm_dn {
                self.dns.insert(old, None);
            }
        }
        self.dns.insert(entry.norm_dn.clone(), Some(id));
        self.entries.insert(id, Some(entry));
    }
}

impl BackendTxn for MemoryTxn {
    fn mode(&self) -> TxnMode {
        self.mode
    }

    fn dn_to_entry(&mut self, norm_dn: &str, lock: LockMode) -> Result<Entry> {
        if lock != LockMode::None {
            self.take_deadlock()?;
        }
        let id = self
            .resolve_dn(norm_dn)?
            .ok_or_else(|| DirError::BackendEntryNotFound(format!("no entry for DN {}", norm_dn)))?;
        self.load(id)?
            .ok_or_else(|| DirError::BackendEntryNotFound(format!("entry {} vanished", id)))
    }

    fn dn_to_entry_id(&mut self, norm_dn: &str) -> Result<EntryId> {
        self.resolve_dn(norm_dn)?
            .ok_or_else(|| DirError::BackendEntryNotFound(format!("no entry for DN {}", norm_dn)))
    }

    fn id_to_entry(&mut self, id: EntryId) -> Result<Entry> {
        self.load(id)?
            .ok_or_else(|| DirError::BackendEntryNotFound(format!("no entry with id {}", id)))
    }

    fn has_children(&mut self, id: EntryId) -> Result<bool> {
        let entry = self.id_to_entry(id)?;
        let staged_child = self
            .entries
            .values()
            .flatten()
            .any(|e| e.parent_dn == entry.norm_dn);
        if staged_child {
            return Ok(true);
        }
        let state = self.read_state()?;
        let committed = match state.children.get(&entry.norm_dn) {
            Some(kids) => kids
                .iter()
                .any(|kid| !matches!(self.entries.get(kid), Some(None))),
            None => false,
        };
        Ok(committed)
    }

    fn add_entry(&mut self, entry: &mut Entry) -> Result<EntryId> {
        self.require_write()?;
        self.take_deadlock()?;
        if self.resolve_dn(&entry.norm_dn)?.is_some() {
            return Err(DirError::BackendEntryExists(format!(
                "DN {} already exists",
                entry.norm_dn
            )));
        }
        let id = EntryId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        entry.id = Some(id);
        for attribute in &entry.attrs {
            if let Some(meta) = &attribute.metadata {
                self.attr_meta
                    .insert((id, attribute.name.clone()), meta.clone());
            }
        }
        self.stage_put(entry.clone(), id, None);
        Ok(id)
    }

    fn modify_entry(&mut self, mods: &[Modification], entry: &Entry) -> Result<()> {
        self.require_write()?;
        self.take_deadlock()?;
        let id = entry
            .id
            .ok_or_else(|| DirError::Internal(format!("{} has no entry id", entry.norm_dn)))?;
        let previous = self
            .load(id)?
            .ok_or_else(|| DirError::BackendEntryNotFound(format!("no entry with id {}", id)))?;
        if previous.norm_dn != entry.norm_dn {
            if let Some(other) = self.resolve_dn(&entry.norm_dn)? {
                if other != id {
                    return Err(DirError::BackendEntryExists(format!(
                        "DN {} already exists",
                        entry.norm_dn
                    )));
                }
            }
        }

        for m in mods.iter().filter(|m| !m.ignore) {
            let name = m.attr.name.clone();
            if let Some(meta) = &m.attr.metadata {
                self.attr_meta.insert((id, name.clone()), meta.clone());
            }
            if m.attr.value_meta_to_add.is_empty() && m.attr.value_meta_to_delete.is_empty() {
                continue;
            }
            let mut current = self.stored_value_meta(id, &name)?;
            current.retain(|vm| !m.attr.value_meta_to_delete.contains(vm));
            current.extend(m.attr.value_meta_to_add.iter().cloned());
            self.value_meta.insert((id, name), current);
        }

        let mut stored = entry.clone();
        stored.parent = None;
        stored.computed.clear();
        self.stage_put(stored, id, Some(previous.norm_dn));
        Ok(())
    }

    fn delete_entry(&mut self, entry: &Entry) -> Result<()> {
        self.require_write()?;
        self.take_deadlock()?;
        let id = match entry.id {
            Some(id) => id,
            None => self.dn_to_entry_id(&entry.norm_dn)?,
        };
        let current = self
            .load(id)?
            .ok_or_else(|| DirError::BackendEntryNotFound(format!("no entry with id {}", id)))?;
        self.dns.insert(current.norm_dn, None);
        self.entries.insert(id, None);
        self.purged.insert(id);
        self.value_meta.retain(|(vid, _), _| *vid != id);
        Ok(())
    }

    fn attr_metadata(&mut self, id: EntryId, attr_name: &str) -> Result<Option<AttrMetadata>> {
        let key = (id, attr_name.to_ascii_lowercase());
        if let Some(meta) = self.attr_meta.get(&key) {
            return Ok(Some(meta.clone()));
        }
        Ok(self.read_state()?.attr_meta.get(&key).cloned())
    }

    fn value_metadata(&mut self, id: EntryId, attr_name: &str) -> Result<Vec<ValueMetadata>> {
        self.stored_value_meta(id, &attr_name.to_ascii_lowercase())
    }

    fn delete_value_metadata(&mut self, id: EntryId) -> Result<()> {
        self.require_write()?;
        self.purged.insert(id);
        self.value_meta.retain(|(vid, _), _| *vid != id);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        if self.mode == TxnMode::Read || (self.entries.is_empty() && self.purged.is_empty()) {
            return Ok(());
        }
        self.take_deadlock()?;
        let mut state = self
            .state
            .write()
            .map_err(|e| DirError::Backend(e.to_string()))?;

        let deleting: HashSet<EntryId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_none())
            .map(|(id, _)| *id)
            .collect();

        for (id, staged) in &self.entries {
            let entry = match staged {
                Some(entry) => entry,
                None => continue,
            };
            if let Some(other) = state.dn_index.get(&entry.norm_dn) {
                if other != id && !deleting.contains(other) {
                    return Err(DirError::BackendEntryExists(format!(
                        "DN {} already exists",
                        entry.norm_dn
                    )));
                }
            }
            for attribute in &entry.attrs {
                let index = match state.indices.get(&attribute.name) {
                    Some(index) if index.unique => index,
                    _ => continue,
                };
                for value in &attribute.values {
                    let clash = index.values.get(value.norm_or_raw()).map_or(false, |ids| {
                        ids.iter()
                            .any(|other| other != id && !deleting.contains(other))
                    });
                    if clash {
                        return Err(DirError::ConstraintViolation(format!(
                            "value '{}' of {} is already in use",
                            value.raw, attribute.name
                        )));
                    }
                }
            }
        }

        for (id, staged) in std::mem::take(&mut self.entries) {
            if let Some(old) = state.decode(id)? {
                state.unindex_entry(&old, id);
            }
            match staged {
                Some(entry) => {
                    state.index_entry(&entry, id);
                    let bytes = entry.to_bytes()?;
                    state.entries.insert(id, bytes);
                }
                None => {
                    state.entries.remove(&id);
                    state.attr_meta.retain(|(mid, _), _| *mid != id);
                }
            }
        }
        for id in &self.purged {
            state.value_meta.retain(|(vid, _), _| vid != id);
        }
        for (key, meta) in self.attr_meta.drain() {
            if state.entries.contains_key(&key.0) {
                state.attr_meta.insert(key, meta);
            }
        }
        for (key, values) in self.value_meta.drain() {
            if state.entries.contains_key(&key.0) {
                state.value_meta.insert(key, values);
            }
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.finished = true;
        trace!(staged = self.entries.len(), "transaction aborted");
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        if !self.finished && !self.entries.is_empty() {
            debug!(
                staged = self.entries.len(),
                "uncommitted transaction dropped, changes discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Attribute;

    fn stored_entry(dn: &str, cn: &str) -> Entry {
        let mut e = Entry::new(dn);
        e.add_values(attr::OBJECT_CLASS, &["top", "user"]);
        e.add_values(attr::CN, &[cn]);
        for a in &mut e.attrs {
            for v in &mut a.values {
                v.norm = Some(v.raw.to_lowercase());
            }
        }
        e
    }

    fn add(be: &MemoryBackend, dn: &str, cn: &str) -> EntryId {
        let mut txn = be.begin(TxnMode::Write).unwrap();
        let mut e = stored_entry(dn, cn);
        let id = txn.add_entry(&mut e).unwrap();
        txn.commit().unwrap();
        id
    }

    #[test]
    fn test_add_and_read_back() {
        let be = MemoryBackend::new();
        let id = add(&be, "dc=x", "x");
        let mut txn = be.begin(TxnMode::Read).unwrap();
        let e = txn.dn_to_entry("dc=x", LockMode::Read).unwrap();
        assert_eq!(e.id, Some(id));
        assert_eq!(be.entry_count(), 1);
    }

    #[test]
    fn test_duplicate_dn_rejected() {
        let be = MemoryBackend::new();
        add(&be, "dc=x", "x");
        let mut txn = be.begin(TxnMode::Write).unwrap();
        let mut e = stored_entry("dc=x", "x");
        assert!(matches!(
            txn.add_entry(&mut e),
            Err(DirError::BackendEntryExists(_))
        ));
    }

    #[test]
    fn test_uncommitted_changes_discarded() {
        let be = MemoryBackend::new();
        {
            let mut txn = be.begin(TxnMode::Write).unwrap();
            let mut e = stored_entry("dc=x", "x");
            txn.add_entry(&mut e).unwrap();
        }
        assert_eq!(be.entry_count(), 0);
    }

    #[test]
    fn test_injected_deadlock_consumed_once() {
        let be = MemoryBackend::new();
        be.inject_deadlocks(1);
        let mut txn = be.begin(TxnMode::Write).unwrap();
        let mut e = stored_entry("dc=x", "x");
        assert!(txn.add_entry(&mut e).unwrap_err().is_deadlock());
        assert_eq!(be.pending_deadlocks(), 0);
        txn.add_entry(&mut e).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_candidates_respect_scan_limit() {
        let be = MemoryBackend::new();
        add(&be, "dc=x", "x");
        for i in 0..10 {
            add(&be, &format!("cn=u{},dc=x", i), &format!("u{}", i));
        }
        let probe = IndexProbe::Equal("user".into());
        assert_eq!(
            be.get_candidates(attr::OBJECT_CLASS, &probe, 5).unwrap(),
            IndexLookup::LimitExceeded
        );
        match be.get_candidates(attr::OBJECT_CLASS, &probe, 0).unwrap() {
            IndexLookup::Found(ids) => assert_eq!(ids.len(), 11),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            be.get_candidates("mail", &IndexProbe::Equal("a".into()), 0)
                .unwrap(),
            IndexLookup::NotIndexed
        );
        match be
            .get_candidates(attr::ENTRY_DN, &IndexProbe::OneLevel("dc=x".into()), 0)
            .unwrap()
        {
            IndexLookup::Found(ids) => assert_eq!(ids.len(), 10),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numeric_range_probe() {
        let be = MemoryBackend::new();
        for (i, usn) in ["9", "10", "100"].iter().enumerate() {
            let mut txn = be.begin(TxnMode::Write).unwrap();
            let mut e = stored_entry(&format!("cn=n{},dc=x", i), "n");
            let mut a = Attribute::new(attr::USN_CHANGED, &[*usn]);
            a.values[0].norm = Some(usn.to_string());
            e.attrs.push(a);
            txn.add_entry(&mut e).unwrap();
            txn.commit().unwrap();
        }
        match be
            .get_candidates(attr::USN_CHANGED, &IndexProbe::GreaterOrEqual("10".into()), 0)
            .unwrap()
        {
            IndexLookup::Found(ids) => assert_eq!(ids.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rename_moves_dn_index() {
        let be = MemoryBackend::new();
        add(&be, "dc=x", "x");
        add(&be, "cn=a,dc=x", "a");
        let mut txn = be.begin(TxnMode::Write).unwrap();
        let mut e = txn.dn_to_entry("cn=a,dc=x", LockMode::Write).unwrap();
        e.norm_dn = "cn=b,dc=x".into();
        e.dn = "cn=b,dc=x".into();
        txn.modify_entry(&[], &e).unwrap();
        assert!(txn.dn_to_entry_id("cn=a,dc=x").is_err());
        txn.commit().unwrap();
        let mut txn = be.begin(TxnMode::Read).unwrap();
        assert!(txn.dn_to_entry("cn=b,dc=x", LockMode::None).is_ok());
        assert!(txn.dn_to_entry("cn=a,dc=x", LockMode::None).is_err());
    }

    #[test]
    fn test_has_children() {
        let be = MemoryBackend::new();
        let parent = add(&be, "dc=x", "x");
        let child = add(&be, "cn=a,dc=x", "a");
        let mut txn = be.begin(TxnMode::Write).unwrap();
        assert!(txn.has_children(parent).unwrap());
        assert!(!txn.has_children(child).unwrap());
    }

    #[test]
    fn test_unique_index_conflict_at_commit() {
        let be = MemoryBackend::new();
        let mut first = stored_entry("cn=a,dc=x", "a");
        first.add_values(attr::OBJECT_GUID, &["g1"]);
        let mut txn = be.begin(TxnMode::Write).unwrap();
        txn.add_entry(&mut first).unwrap();
        txn.commit().unwrap();

        let mut second = stored_entry("cn=b,dc=x", "b");
        second.add_values(attr::OBJECT_GUID, &["g1"]);
        let mut txn = be.begin(TxnMode::Write).unwrap();
        txn.add_entry(&mut second).unwrap();
        assert!(matches!(
            txn.commit(),
            Err(DirError::ConstraintViolation(_))
        ));
    }
}
