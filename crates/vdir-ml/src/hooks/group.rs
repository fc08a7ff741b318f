//! Group type validation and membership cleanup after deletes.

use tracing::{debug, warn};

use super::require_entry;
use crate::backend::{IndexLookup, IndexProbe, TxnMode};
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::ops::{BindInfo, Operation};
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, class, OpKind, OpOrigin};

/// Global security group, the type a group gets when none is supplied.
pub const DEFAULT_GROUP_TYPE: i64 = -2147483646;

/// Accepted `groupType` values (scope bits, with or without the security flag).
pub const VALID_GROUP_TYPES: [i64; 6] = [2, 4, 8, -2147483646, -2147483644, -2147483640];

/// Defaults and validates `groupType` on group entries.
pub struct GroupTypeCheck;

impl Hook for GroupTypeCheck {
    fn name(&self) -> &'static str {
        "group-type"
    }

    fn invoke(
        &self,
        _dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let entry = require_entry(self.name(), entry)?;
        if !entry.has_class(class::GROUP) {
            return Ok(());
        }
        let raw = match entry.get_single(attr::GROUP_TYPE) {
            Some(raw) => raw.to_string(),
            None if op.kind == OpKind::Add => {
                entry.set_single(attr::GROUP_TYPE, &DEFAULT_GROUP_TYPE.to_string());
                return Ok(());
            }
            None if op.origin == OpOrigin::Repl => return Ok(()),
            None => {
                return Err(DirError::ConstraintViolation(
                    "groupType cannot be removed".into(),
                ))
            }
        };
        match raw.trim().parse::<i64>() {
            Ok(v) if VALID_GROUP_TYPES.contains(&v) => Ok(()),
            _ => Err(DirError::ConstraintViolation(format!(
                "invalid groupType '{}'",
                raw
            ))),
        }
    }
}

/// Removes a deleted entry from the `member` values of every group that
/// still lists it.
pub struct GroupMemberCleanup;

impl Hook for GroupMemberCleanup {
    fn name(&self) -> &'static str {
        "group-member-cleanup"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if op.tombstone_age_off || op.orig_norm_dn.is_empty() {
            return Ok(());
        }
        let member_dn = op.orig_norm_dn.clone();
        let ids = match dir
            .backend()
            .get_candidates(attr::MEMBER, &IndexProbe::Equal(member_dn.clone()), 0)?
        {
            IndexLookup::Found(ids) => ids,
            IndexLookup::NotIndexed | IndexLookup::LimitExceeded => {
                warn!(dn = %member_dn, "member index unavailable, group cleanup skipped");
                return Ok(());
            }
        };
        if ids.is_empty() {
            return Ok(());
        }

        let mut groups = Vec::with_capacity(ids.len());
        {
            let mut txn = dir.backend().begin(TxnMode::Read)?;
            for id in ids {
                match txn.id_to_entry(id) {
                    Ok(mut group) => {
                        group.normalize(dir.schema())?;
                        groups.push(group);
                    }
                    Err(DirError::BackendEntryNotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        let mut first_error = None;
        for group in groups {
            let raw: Vec<String> = group
                .find_attr(attr::MEMBER)
                .map(|a| {
                    a.values
                        .iter()
                        .filter(|v| v.norm_or_raw() == member_dn)
                        .map(|v| v.raw.clone())
                        .collect()
                })
                .unwrap_or_default();
            if raw.is_empty() {
                continue;
            }
            let mut cleanup = Operation::modify(
                OpOrigin::Internal,
                BindInfo::system(),
                &group.dn,
                vec![Modification::delete(attr::MEMBER, &raw)],
            );
            match dir.internal_modify(&mut cleanup) {
                Ok(()) => debug!(group = %group.dn, member = %member_dn, "member removed"),
                Err(e @ (DirError::NoSuchObject(_) | DirError::NoSuchAttribute(_))) => {
                    debug!(group = %group.dn, error = %e, "group changed before cleanup")
                }
                Err(e) => {
                    warn!(group = %group.dn, error = %e, "group member cleanup failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
