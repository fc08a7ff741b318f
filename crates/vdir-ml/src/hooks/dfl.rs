//! Domain functional level raise checks.

use tracing::info;

use super::{mods_touch, require_entry};
use crate::dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::attr;

/// Highest domain functional level this server understands.
pub const MAX_DOMAIN_FUNCTIONAL_LEVEL: u32 = 4;

fn targets_domain(dir: &DirectoryService, op: &Operation) -> bool {
    mods_touch(&op.mods, attr::DOMAIN_FUNCTIONAL_LEVEL)
        && dn::normalize_dn(&dir.config().server.domain_dn).map_or(false, |d| d == op.norm_dn)
}

fn parse_level(raw: &str) -> Result<u32> {
    raw.trim().parse::<u32>().map_err(|_| {
        DirError::ConstraintViolation(format!("invalid domain functional level '{}'", raw))
    })
}

/// Only allows the level to be raised, and never beyond what the server
/// supports.
pub struct DflValidate;

impl Hook for DflValidate {
    fn name(&self) -> &'static str {
        "dfl-validate"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if !targets_domain(dir, op) {
            return Ok(());
        }
        let entry = require_entry(self.name(), entry)?;
        let raw = entry.get_single(attr::DOMAIN_FUNCTIONAL_LEVEL).ok_or_else(|| {
            DirError::UnwillingToPerform("domain functional level cannot be removed".into())
        })?;
        let level = parse_level(raw)?;
        let current = dir.domain_functional_level();
        if level < current {
            return Err(DirError::UnwillingToPerform(format!(
                "domain functional level cannot be lowered from {} to {}",
                current, level
            )));
        }
        if level > MAX_DOMAIN_FUNCTIONAL_LEVEL {
            return Err(DirError::UnwillingToPerform(format!(
                "domain functional level {} exceeds the supported maximum {}",
                level, MAX_DOMAIN_FUNCTIONAL_LEVEL
            )));
        }
        Ok(())
    }
}

/// Publishes a committed level change to the running server.
pub struct DflUpdate;

impl Hook for DflUpdate {
    fn name(&self) -> &'static str {
        "dfl-update"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if !targets_domain(dir, op) {
            return Ok(());
        }
        let entry = require_entry(self.name(), entry)?;
        if let Some(raw) = entry.get_single(attr::DOMAIN_FUNCTIONAL_LEVEL) {
            let level = parse_level(raw)?;
            dir.set_domain_functional_level(level);
            info!(level, "domain functional level updated");
        }
        Ok(())
    }
}
