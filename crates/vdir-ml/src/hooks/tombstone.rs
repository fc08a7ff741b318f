use super::mods_touch;
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, class};

/// Marks the entry being deleted as a tombstone.
pub struct SetDeletedObjAttrs;

impl Hook for SetDeletedObjAttrs {
    fn name(&self) -> &'static str {
        "set-deleted-obj-attrs"
    }

    fn invoke(
        &self,
        _dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if op.tombstone_age_off || mods_touch(&op.mods, attr::IS_DELETED) {
            return Ok(());
        }
        op.mods.push(Modification::replace(attr::IS_DELETED, &["TRUE"]));
        op.mods
            .push(Modification::replace(attr::LAST_KNOWN_DN, &[op.dn.as_str()]));
        op.mods
            .push(Modification::add(attr::OBJECT_CLASS, &[class::DELETED_OBJECT]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirConfig;
    use crate::entry::ModOp;
    use crate::ops::BindInfo;
    use crate::types::OpOrigin;

    #[test]
    fn test_tombstone_mods_added_once() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        let mut op = Operation::delete(OpOrigin::External, BindInfo::system(), "cn=U1,dc=x");
        SetDeletedObjAttrs.invoke(&dir, &mut op, None, None).unwrap();
        SetDeletedObjAttrs.invoke(&dir, &mut op, None, None).unwrap();
        assert_eq!(op.mods.len(), 3);
        assert_eq!(op.mods[1].attr.first(), Some("cn=U1,dc=x"));
        assert_eq!(op.mods[2].op, ModOp::Add);
        assert_eq!(op.mods[2].attr.first(), Some(class::DELETED_OBJECT));
    }
}
