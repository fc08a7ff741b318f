//! Modify-time access control and object class change checks.

use tracing::debug;

use super::read_entry;
use crate::access::{acl_string_to_sd, parse_security_descriptor, AccessRight};
use crate::entry::{Entry, ModOp, Modification};
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::schema::{ClassKind, Schema};
use crate::service::DirectoryService;
use crate::types::attr;

fn is_structural(schema: &dyn Schema, name: &str) -> bool {
    schema
        .class_desc(name)
        .map_or(false, |c| c.kind == ClassKind::Structural)
}

fn prohibited(dn: &str) -> DirError {
    DirError::ObjectClassModsProhibited(format!("structural object class of {} cannot change", dn))
}

/// Rejects modifications that would change an entry's structural class.
pub struct StructureOcCheck;

impl Hook for StructureOcCheck {
    fn name(&self) -> &'static str {
        "structure-oc"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let schema = dir.schema();
        for m in op.mods.iter().filter(|m| m.attr.name == attr::OBJECT_CLASS && !m.ignore) {
            match m.op {
                ModOp::Add | ModOp::Delete
                    if m.attr.values.iter().any(|v| is_structural(schema, &v.raw.to_ascii_lowercase())) =>
                {
                    return Err(prohibited(&op.norm_dn));
                }
                ModOp::Delete if m.attr.values.is_empty() => return Err(prohibited(&op.norm_dn)),
                ModOp::Replace => {
                    let current = read_entry(dir, &op.norm_dn)?;
                    let mut proposed = Entry::new(&current.dn);
                    proposed.add_values(attr::OBJECT_CLASS, &m.attr.values.iter().map(|v| v.raw.as_str()).collect::<Vec<_>>());
                    if schema.structural_class(&current) != schema.structural_class(&proposed) {
                        return Err(prohibited(&op.norm_dn));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Maps `aclString` modifications onto the security descriptor.
pub struct MapAclString;

impl Hook for MapAclString {
    fn name(&self) -> &'static str {
        "map-acl-string"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let acl = op
            .mods
            .iter()
            .filter(|m| m.attr.name == attr::ACL_STRING && !m.ignore && m.op != ModOp::Delete)
            .filter_map(|m| m.attr.first().map(str::to_string))
            .last();
        for m in op.mods.iter_mut().filter(|m| m.attr.name == attr::ACL_STRING) {
            m.ignore = true;
        }
        let acl = match acl {
            Some(acl) => acl,
            None => return Ok(()),
        };

        let current = read_entry(dir, &op.norm_dn)?;
        let owner = current
            .get_single(attr::SECURITY_DESCRIPTOR)
            .and_then(|sd| parse_security_descriptor(sd).ok())
            .map(|(owner, _, _)| owner.to_string())
            .unwrap_or_else(|| {
                if dir.access().is_admin(&op.bind) {
                    "BA".to_string()
                } else {
                    "CO".to_string()
                }
            });
        let sd = acl_string_to_sd(&acl, &owner);
        debug!(dn = %op.norm_dn, sd = %sd, "aclString mapped to security descriptor");
        op.mods
            .push(Modification::replace(attr::SECURITY_DESCRIPTOR, &[sd]));
        Ok(())
    }
}

/// Checks that the requester may write the target entry.
pub struct VerifyAcl;

impl Hook for VerifyAcl {
    fn name(&self) -> &'static str {
        "verify-acl"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let target = read_entry(dir, &op.norm_dn)?;
        dir.access().check(&op.bind, &target, AccessRight::WRITE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirConfig;
    use crate::ops::BindInfo;
    use crate::types::OpOrigin;

    fn modify(dn: &str, mods: Vec<Modification>) -> Operation {
        let mut op = Operation::modify(OpOrigin::External, BindInfo::system(), dn, mods);
        op.norm_dn = dn.to_string();
        op
    }

    #[test]
    fn test_structural_class_add_and_delete_rejected() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        let mut op = modify(
            "cn=u1,dc=x",
            vec![Modification::add(attr::OBJECT_CLASS, &["group"])],
        );
        assert!(matches!(
            StructureOcCheck.invoke(&dir, &mut op, None, None),
            Err(DirError::ObjectClassModsProhibited(_))
        ));

        let mut op = modify(
            "cn=u1,dc=x",
            vec![Modification::delete::<&str>(attr::OBJECT_CLASS, &[])],
        );
        assert!(StructureOcCheck.invoke(&dir, &mut op, None, None).is_err());

        let mut op = modify(
            "cn=u1,dc=x",
            vec![Modification::add(attr::OBJECT_CLASS, &["lockoutpolicy"])],
        );
        assert!(StructureOcCheck.invoke(&dir, &mut op, None, None).is_ok());
    }

    #[test]
    fn test_acl_string_mapped_to_descriptor() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        dir.bootstrap().unwrap();
        let users = format!("cn=users,{}", dir.config().server.domain_dn);
        let mut op = modify(
            &users,
            vec![Modification::replace(attr::ACL_STRING, &["(A;;RP;;;AU)"])],
        );
        MapAclString.invoke(&dir, &mut op, None, None).unwrap();
        assert!(op.mods[0].ignore);
        let sd = op.mods[1].attr.first().unwrap();
        assert_eq!(op.mods[1].attr.name, attr::SECURITY_DESCRIPTOR);
        assert!(sd.ends_with("D:(A;;RP;;;AU)"));
        assert!(sd.starts_with("O:BA"));
    }
}
