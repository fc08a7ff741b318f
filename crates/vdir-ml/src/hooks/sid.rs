//! Security identifier generation for principals.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use super::require_entry;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, class};

/// First relative identifier handed out; lower RIDs are well-known.
pub const FIRST_RID: u32 = 1000;

/// Hands out relative identifiers for the hosted domain.
#[derive(Debug)]
pub struct RidAllocator {
    next: AtomicU32,
}

impl RidAllocator {
    /// Next unused RID.
    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// RID the next call to [`allocate`](Self::allocate) returns.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for RidAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(FIRST_RID),
        }
    }
}

const PRINCIPAL_CLASSES: &[&str] = &[class::USER, class::COMPUTER, class::GROUP];

/// Gives users, computers and groups an `objectSid` under the domain SID.
pub struct GenerateSid;

impl Hook for GenerateSid {
    fn name(&self) -> &'static str {
        "generate-sid"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        _op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let entry = require_entry(self.name(), entry)?;
        if !PRINCIPAL_CLASSES.iter().any(|c| entry.has_class(c)) {
            return Ok(());
        }
        if entry.find_attr(attr::OBJECT_SID).is_some() {
            return Ok(());
        }
        let sid = format!("{}-{}", dir.config().server.domain_sid, dir.rids().allocate());
        debug!(dn = %entry.dn, sid = %sid, "objectSid generated");
        entry.set_single(attr::OBJECT_SID, &sid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirConfig;
    use crate::ops::BindInfo;
    use crate::types::OpOrigin;

    #[test]
    fn test_sid_only_for_principals() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        let first = dir.rids().peek();

        let mut user = Entry::new("cn=u1,dc=x");
        user.add_values(attr::OBJECT_CLASS, &["top", "user"]);
        let mut op = Operation::add(OpOrigin::Internal, BindInfo::system(), user.clone());
        GenerateSid.invoke(&dir, &mut op, Some(&mut user), None).unwrap();
        assert_eq!(
            user.get_single(attr::OBJECT_SID),
            Some(format!("S-1-7-21-1000-2000-3000-{}", first).as_str())
        );

        let mut ou = Entry::new("ou=o,dc=x");
        ou.add_values(attr::OBJECT_CLASS, &["top", "organizationalunit"]);
        GenerateSid.invoke(&dir, &mut op, Some(&mut ou), None).unwrap();
        assert!(ou.get_single(attr::OBJECT_SID).is_none());
        assert_eq!(dir.rids().peek(), first + 1);
    }
}
