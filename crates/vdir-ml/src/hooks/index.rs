//! Index configuration entries and the index build scheduler.
//!
//! Adding an `indexConfig` entry schedules an index on its `indexAttribute`.
//! After the add commits, pending indices are built through
//! [`Backend::configure_index`]. The indexed attribute of an existing entry
//! cannot be changed.

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use super::{mods_touch, require_entry, Stage};
use crate::backend::Backend;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, class, OpKind};

/// Build state of a configured index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    /// Waiting for the next build pass.
    Scheduled,
    /// Being built.
    Building,
    /// Usable for candidate lookups.
    Enabled,
    /// The backend refused to build it.
    Failed,
}

impl IndexState {
    fn as_str(&self) -> &'static str {
        match self {
            IndexState::Scheduled => "scheduled",
            IndexState::Building => "building",
            IndexState::Enabled => "enabled",
            IndexState::Failed => "failed",
        }
    }
}

/// One configured index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    /// Indexed attribute (lowercased).
    pub attr: String,
    /// Global uniqueness is enforced.
    pub unique: bool,
    /// Current state.
    pub state: IndexState,
}

/// Indices configured at runtime, keyed by attribute name.
#[derive(Debug, Default)]
pub struct IndexScheduler {
    indices: DashMap<String, IndexStatus>,
}

impl IndexScheduler {
    /// Schedules an index build. Returns false if the attribute already has
    /// a configured index.
    pub fn schedule(&self, attr_name: &str, unique: bool) -> bool {
        let key = attr_name.to_ascii_lowercase();
        if self.indices.contains_key(&key) {
            return false;
        }
        self.indices.insert(
            key.clone(),
            IndexStatus {
                attr: key,
                unique,
                state: IndexState::Scheduled,
            },
        );
        true
    }

    /// State of the index on `attr_name`, if configured.
    pub fn state(&self, attr_name: &str) -> Option<IndexState> {
        self.indices
            .get(&attr_name.to_ascii_lowercase())
            .map(|s| s.state)
    }

    /// All configured indices, sorted by attribute.
    pub fn statuses(&self) -> Vec<IndexStatus> {
        let mut out: Vec<IndexStatus> = self.indices.iter().map(|s| s.value().clone()).collect();
        out.sort_by(|a, b| a.attr.cmp(&b.attr));
        out
    }

    /// Builds every scheduled index. Returns how many became enabled.
    pub fn build_pending(&self, backend: &dyn Backend) -> usize {
        let pending: Vec<(String, bool)> = self
            .indices
            .iter()
            .filter(|s| s.state == IndexState::Scheduled)
            .map(|s| (s.attr.clone(), s.unique))
            .collect();
        let mut enabled = 0;
        for (name, unique) in pending {
            self.set_state(&name, IndexState::Building);
            match backend.configure_index(&name, unique) {
                Ok(()) => {
                    self.set_state(&name, IndexState::Enabled);
                    info!(attr = %name, unique, "index enabled");
                    enabled += 1;
                }
                Err(e) => {
                    self.set_state(&name, IndexState::Failed);
                    warn!(attr = %name, error = %e, "index build failed");
                }
            }
        }
        enabled
    }

    fn set_state(&self, attr_name: &str, state: IndexState) {
        if let Some(mut status) = self.indices.get_mut(attr_name) {
            status.state = state;
        }
    }
}

fn parse_unique(entry: &Entry) -> Result<bool> {
    match entry.get_single(attr::INDEX_UNIQUE) {
        None => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(v) => Err(DirError::ConstraintViolation(format!(
            "indexUnique must be TRUE or FALSE, got '{}'",
            v
        ))),
    }
}

/// Validates `indexConfig` entries and drives the scheduler.
pub struct IndexEntryHook(pub Stage);

impl IndexEntryHook {
    fn check_new_index(dir: &DirectoryService, entry: &Entry) -> Result<()> {
        let name = entry
            .get_single(attr::INDEX_ATTRIBUTE)
            .ok_or_else(|| DirError::ObjectClassViolation("indexConfig without indexAttribute".into()))?;
        let desc = dir.schema().attr_desc(name)?;
        parse_unique(entry)?;
        if dir.backend().index_info(&desc.name).is_some()
            || dir.index_scheduler().state(&desc.name).is_some()
        {
            return Err(DirError::UnwillingToPerform(format!(
                "attribute {} is already indexed",
                desc.name
            )));
        }
        Ok(())
    }
}

impl Hook for IndexEntryHook {
    fn name(&self) -> &'static str {
        "index-entry"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        match (self.0, op.kind) {
            (Stage::Pre, OpKind::Add) => {
                let entry = require_entry(self.name(), entry)?;
                if !entry.has_class(class::INDEX_CONFIG) {
                    return Ok(());
                }
                Self::check_new_index(dir, entry)?;
                entry.set_single(attr::INDEX_STATE, IndexState::Scheduled.as_str());
                Ok(())
            }
            (Stage::Pre, OpKind::Modify) => match entry {
                None if mods_touch(&op.mods, attr::INDEX_ATTRIBUTE) => Err(
                    DirError::UnwillingToPerform("indexAttribute cannot be modified".into()),
                ),
                None => Ok(()),
                Some(entry) if entry.has_class(class::INDEX_CONFIG) => parse_unique(entry).map(|_| ()),
                Some(_) => Ok(()),
            },
            (Stage::Post, OpKind::Add) => {
                let entry = require_entry(self.name(), entry)?;
                if !entry.has_class(class::INDEX_CONFIG) {
                    return Ok(());
                }
                let name = entry.get_single(attr::INDEX_ATTRIBUTE).unwrap_or_default();
                let desc = dir.schema().attr_desc(name)?;
                if dir.index_scheduler().schedule(&desc.name, parse_unique(entry)?) {
                    dir.index_scheduler().build_pending(dir.backend().as_ref());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryBackend;

    #[test]
    fn test_scheduler_builds_pending() {
        let backend = MemoryBackend::new();
        let scheduler = IndexScheduler::default();
        assert!(scheduler.schedule("Mail", false));
        assert!(!scheduler.schedule("mail", true));
        assert_eq!(scheduler.state("mail"), Some(IndexState::Scheduled));

        assert_eq!(scheduler.build_pending(&backend), 1);
        assert_eq!(scheduler.state("mail"), Some(IndexState::Enabled));
        assert!(backend.index_info("mail").is_some());
        assert_eq!(scheduler.build_pending(&backend), 0);
        assert_eq!(scheduler.statuses().len(), 1);
    }

    #[test]
    fn test_index_unique_flag_parsing() {
        let mut entry = Entry::new("cn=idx,cn=config");
        assert_eq!(parse_unique(&entry).unwrap(), false);
        entry.set_single(attr::INDEX_UNIQUE, "TRUE");
        assert!(parse_unique(&entry).unwrap());
        entry.set_single(attr::INDEX_UNIQUE, "yes");
        assert!(parse_unique(&entry).is_err());
    }
}
