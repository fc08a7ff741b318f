//! Operational attribute stamping and generic add checks.

use tracing::debug;
use uuid::Uuid;

use super::require_entry;
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, class, now_generalized, OpOrigin};

/// Rejects adds a client may not make and fills in derived values.
pub struct GenericPreAdd;

impl Hook for GenericPreAdd {
    fn name(&self) -> &'static str {
        "generic-pre-add"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let entry = require_entry(self.name(), entry)?;
        if entry.object_classes().is_empty() {
            return Err(DirError::ObjectClassViolation(format!(
                "{}: missing objectClass",
                entry.dn
            )));
        }
        if op.origin == OpOrigin::External {
            if entry.is_deleted() || entry.has_class(class::DELETED_OBJECT) {
                return Err(DirError::UnwillingToPerform(
                    "cannot add a deleted object".into(),
                ));
            }
            if !dir.config().server.allow_import_op_attrs {
                for attribute in &entry.attrs {
                    let desc = dir.schema().attr_desc(&attribute.name)?;
                    if desc.no_user_modifiable {
                        return Err(DirError::ConstraintViolation(format!(
                            "attribute {} is maintained by the server",
                            desc.name
                        )));
                    }
                }
            }
        }

        if entry.has_class(class::COMPUTER) && entry.find_attr(attr::SPN).is_none() {
            if let Some(host) = entry.get_single("dnshostname").map(str::to_string) {
                debug!(dn = %entry.dn, host = %host, "default service principal names added");
                entry.add_values(attr::SPN, &[format!("host/{}", host), format!("ldap/{}", host)]);
            }
        }
        Ok(())
    }
}

fn requester(op: &Operation) -> String {
    if op.bind.dn.is_empty() {
        String::from("cn=anonymous")
    } else {
        op.bind.dn.clone()
    }
}

/// Takes a USN for a local add and stamps the creation attributes.
pub struct AddOpAttrs;

impl Hook for AddOpAttrs {
    fn name(&self) -> &'static str {
        "add-op-attrs"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let entry = require_entry(self.name(), entry)?;
        let usn = if op.usn.is_set() {
            op.usn
        } else {
            dir.assign_usn(op)?
        };
        let usn = usn.to_string();
        let now = now_generalized();
        let who = requester(op);
        let keep_imported = dir.config().server.allow_import_op_attrs;

        entry.set_single(attr::USN_CREATED, &usn);
        entry.set_single(attr::USN_CHANGED, &usn);
        for (name, value) in [
            (attr::CREATE_TIMESTAMP, now.as_str()),
            (attr::MODIFY_TIMESTAMP, now.as_str()),
            (attr::CREATORS_NAME, who.as_str()),
            (attr::MODIFIERS_NAME, who.as_str()),
        ] {
            if !(keep_imported && entry.find_attr(name).is_some()) {
                entry.set_single(name, value);
            }
        }
        if !(keep_imported && entry.find_attr(attr::OBJECT_GUID).is_some()) {
            entry.set_single(attr::OBJECT_GUID, &Uuid::new_v4().to_string());
        }
        let dn = entry.dn.clone();
        entry.set_single(attr::ENTRY_DN, &dn);
        Ok(())
    }
}

/// Takes a USN for a local modify or delete and queues the change stamps.
pub struct ReplaceOpAttrs;

impl Hook for ReplaceOpAttrs {
    fn name(&self) -> &'static str {
        "replace-op-attrs"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if op.tombstone_age_off {
            return Ok(());
        }
        let usn = if op.usn.is_set() {
            op.usn
        } else {
            dir.assign_usn(op)?
        };
        let who = requester(op);
        op.mods.push(Modification::replace(attr::USN_CHANGED, &[usn.to_string()]));
        op.mods
            .push(Modification::replace(attr::MODIFY_TIMESTAMP, &[now_generalized()]));
        op.mods.push(Modification::replace(attr::MODIFIERS_NAME, &[who]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirConfig;
    use crate::ops::BindInfo;

    #[test]
    fn test_add_op_attrs_stamps_entry() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        let mut entry = Entry::new("cn=u1,dc=x");
        let mut op = Operation::add(OpOrigin::Internal, BindInfo::system(), entry.clone());
        AddOpAttrs.invoke(&dir, &mut op, Some(&mut entry), None).unwrap();
        assert!(op.usn.is_set());
        let usn = op.usn.to_string();
        assert_eq!(entry.get_single(attr::USN_CREATED), Some(usn.as_str()));
        assert_eq!(entry.get_single(attr::USN_CHANGED), Some(usn.as_str()));
        assert_eq!(entry.get_single(attr::CREATORS_NAME), Some("cn=system"));
        assert_eq!(entry.get_single(attr::ENTRY_DN), Some("cn=u1,dc=x"));
        let guid = entry.get_single(attr::OBJECT_GUID).unwrap();
        assert!(Uuid::parse_str(guid).is_ok());
        dir.write_queue().pop(&mut op.wq);
    }

    #[test]
    fn test_generic_pre_add_rejects_client_op_attrs() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        let mut entry = Entry::new("cn=u1,dc=x");
        entry.add_values(attr::OBJECT_CLASS, &["top", "user"]);
        entry.add_values(attr::USN_CREATED, &["7"]);
        let mut op = Operation::add(
            OpOrigin::External,
            BindInfo::user("cn=administrator,cn=users,dc=vsphere,dc=local"),
            entry.clone(),
        );
        assert!(matches!(
            GenericPreAdd.invoke(&dir, &mut op, Some(&mut entry), None),
            Err(DirError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_computer_gets_default_spns() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        let mut entry = Entry::new("cn=pc1,dc=x");
        entry.add_values(attr::OBJECT_CLASS, &["top", "computer"]);
        entry.add_values("dnshostname", &["pc1.x"]);
        let mut op = Operation::add(OpOrigin::Internal, BindInfo::system(), entry.clone());
        GenericPreAdd
            .invoke(&dir, &mut op, Some(&mut entry), None)
            .unwrap();
        assert_eq!(entry.values_of(attr::SPN), vec!["host/pc1.x", "ldap/pc1.x"]);
    }
}
