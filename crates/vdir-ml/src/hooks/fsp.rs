//! Foreign security principal mapping for SID-valued group members.
//!
//! A `member` value of the form `foreignSid=S-1-...` names a principal from
//! another domain. It is rewritten to the DN of a foreign security principal
//! entry under the FSP container, and that entry is created when missing.

use tracing::debug;

use super::read_entry;
use crate::entry::{AttrValue, Entry, ModOp};
use crate::error::{DirError, Result};
use crate::ops::{BindInfo, Operation};
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, class, OpKind, OpOrigin};
use crate::dn;

/// Returns the SID carried by a `foreignSid=<sid>` member value.
pub fn foreign_sid(value: &str) -> Option<String> {
    let rdns = dn::split_rdns(value);
    if rdns.len() != 1 {
        return None;
    }
    let (name, sid) = dn::rdn_to_name_value(&rdns[0]).ok()?;
    let valid = name == attr::FSP_SID
        && sid.len() > 2
        && sid[..2].eq_ignore_ascii_case("s-")
        && sid[2..].split('-').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if valid {
        Some(format!("S-{}", &sid[2..]))
    } else {
        None
    }
}

/// DN of the foreign security principal entry for `sid`.
pub fn fsp_dn_for_sid(sid: &str, container: &str) -> String {
    dn::cat_dn(&format!("cn={}", sid), container)
}

/// Rewrites foreign SID members in place, returning the SIDs that need an
/// FSP entry.
fn map_values(values: &mut [AttrValue], container: &str) -> Vec<String> {
    let mut sids = Vec::new();
    for value in values.iter_mut() {
        if let Some(sid) = foreign_sid(&value.raw) {
            *value = AttrValue::new(fsp_dn_for_sid(&sid, container));
            sids.push(sid);
        }
    }
    sids
}

fn ensure_fsp(dir: &DirectoryService, sid: &str, container: &str) -> Result<()> {
    let fsp_dn = fsp_dn_for_sid(sid, container);
    match read_entry(dir, &dn::normalize_dn(&fsp_dn)?) {
        Ok(_) => return Ok(()),
        Err(DirError::NoSuchObject(_)) => {}
        Err(e) => return Err(e),
    }
    let mut fsp = Entry::new(&fsp_dn);
    fsp.add_values(attr::OBJECT_CLASS, &[class::TOP, class::FSP]);
    fsp.add_values(attr::CN, &[sid]);
    fsp.add_values(attr::FSP_SID, &[sid]);
    let mut op = Operation::add(OpOrigin::Internal, BindInfo::system(), fsp);
    match dir.internal_add(&mut op) {
        Ok(()) => {
            debug!(dn = %fsp_dn, "foreign security principal created");
            Ok(())
        }
        Err(DirError::BackendEntryExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Maps foreign SID members and creates their FSP entries.
pub struct CreateFsps;

impl Hook for CreateFsps {
    fn name(&self) -> &'static str {
        "create-fsps"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let container = dir.config().fsp_container_dn();
        let mut needed = Vec::new();
        if op.kind == OpKind::Add {
            if let Some(member) = entry.and_then(|e| e.find_attr_mut(attr::MEMBER)) {
                needed = map_values(&mut member.values, &container);
            }
        } else {
            for m in op.mods.iter_mut().filter(|m| m.attr.name == attr::MEMBER) {
                let sids = map_values(&mut m.attr.values, &container);
                if m.op != ModOp::Delete {
                    needed.extend(sids);
                }
            }
        }
        needed.sort();
        needed.dedup();
        for sid in needed {
            ensure_fsp(dir, &sid, &container)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_sid_parsing() {
        assert_eq!(
            foreign_sid("foreignSid=S-1-5-21-7-8-9-1104"),
            Some("S-1-5-21-7-8-9-1104".to_string())
        );
        assert_eq!(foreign_sid("foreignsid=s-1-5-32"), Some("S-1-5-32".to_string()));
        assert_eq!(foreign_sid("cn=u1,dc=x"), None);
        assert_eq!(foreign_sid("foreignSid=S-1-x"), None);
        assert_eq!(foreign_sid("foreignSid=S-1-5,dc=x"), None);
    }

    #[test]
    fn test_map_values_rewrites_only_sids() {
        let container = "cn=ForeignSecurityPrincipals,dc=x";
        let mut values = vec![
            AttrValue::new("cn=u1,dc=x"),
            AttrValue::new("foreignSid=S-1-5-21-1-2-3-500"),
        ];
        let sids = map_values(&mut values, container);
        assert_eq!(sids, vec!["S-1-5-21-1-2-3-500"]);
        assert_eq!(values[0].raw, "cn=u1,dc=x");
        assert_eq!(
            values[1].raw,
            "cn=S-1-5-21-1-2-3-500,cn=ForeignSecurityPrincipals,dc=x"
        );
        assert!(values[1].norm.is_none());
    }
}
