//! Built-in hooks and the registries they maintain.
//!
//! [`default_registry`] wires every hook into its phase pipeline. Hooks that
//! write other entries (foreign principal creation) run before the operation
//! takes its USN, and cleanup writes (group membership) run after commit, so
//! nested writes never wait behind the operation that issued them.

mod acl;
mod dfl;
mod fsp;
mod group;
mod index;
mod lockout;
mod op_attrs;
mod password;
mod repl;
mod schema_hooks;
mod sid;
mod tombstone;

use std::sync::Arc;

use crate::backend::{LockMode, TxnMode};
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::plugin::{OpMask, Phase, PluginPipeline, PluginRegistry};
use crate::service::DirectoryService;

pub use acl::{MapAclString, StructureOcCheck, VerifyAcl};
pub use dfl::{DflUpdate, DflValidate, MAX_DOMAIN_FUNCTIONAL_LEVEL};
pub use fsp::{foreign_sid, fsp_dn_for_sid, CreateFsps};
pub use group::{GroupMemberCleanup, GroupTypeCheck, DEFAULT_GROUP_TYPE, VALID_GROUP_TYPES};
pub use index::{IndexEntryHook, IndexScheduler, IndexState, IndexStatus};
pub use lockout::{LockoutCache, LockoutCacheInvalidate, LockoutPolicy, LockoutPolicyIntegrity};
pub use op_attrs::{AddOpAttrs, GenericPreAdd, ReplaceOpAttrs};
pub use password::{
    hash_password, verify_password, PasswordHash, PasswordPostCommit, SSHA512_PREFIX,
};
pub use repl::{
    DcAccountRefresh, ReplAgreement, ReplAgreementHook, ReplAgreementRegistry, ServerEntryHook,
    ServerInfo, ServerRegistry,
};
pub use schema_hooks::{
    attr_descriptor_from_entry, class_descriptor_from_entry, SchemaEntryCheck, SchemaLibUpdate,
};
pub use sid::{GenerateSid, RidAllocator, FIRST_RID};
pub use tombstone::SetDeletedObjAttrs;

/// Whether a hook registered in several phases runs before or after commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Before the backend transaction commits.
    Pre,
    /// After commit.
    Post,
}

/// Returns the entry a phase hook needs, or an internal error naming the hook.
pub(crate) fn require_entry<'a>(
    hook: &'static str,
    entry: Option<&'a mut Entry>,
) -> Result<&'a mut Entry> {
    entry.ok_or_else(|| DirError::Internal(format!("hook {} invoked without an entry", hook)))
}

/// Reads the committed state of an entry outside the operation's transaction.
pub(crate) fn read_entry(dir: &DirectoryService, norm_dn: &str) -> Result<Entry> {
    let mut txn = dir.backend().begin(TxnMode::Read)?;
    let mut entry = txn
        .dn_to_entry(norm_dn, LockMode::None)
        .map_err(|e| match e {
            DirError::BackendEntryNotFound(_) => DirError::NoSuchObject(norm_dn.to_string()),
            other => other,
        })?;
    entry.normalize(dir.schema())?;
    Ok(entry)
}

/// Returns true if any live modification targets `attr_name`.
pub(crate) fn mods_touch(mods: &[Modification], attr_name: &str) -> bool {
    mods.iter()
        .any(|m| !m.ignore && m.attr.name.eq_ignore_ascii_case(attr_name))
}

/// The hook registry installed by [`DirectoryService::new`].
///
/// [`DirectoryService::new`]: crate::service::DirectoryService::new
pub fn default_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::empty();

    registry.set(
        Phase::PreAdd,
        PluginPipeline::new()
            .with(OpMask::NOT_REPL, Arc::new(GenericPreAdd))
            .with(OpMask::NOT_REPL, Arc::new(PasswordHash))
            .with(OpMask::NOT_REPL, Arc::new(CreateFsps))
            .with(OpMask::NOT_REPL, Arc::new(AddOpAttrs))
            .with(OpMask::NOT_REPL, Arc::new(GenerateSid))
            .with(OpMask::NOT_REPL, Arc::new(LockoutPolicyIntegrity))
            .with(OpMask::NOT_REPL, Arc::new(GroupTypeCheck))
            .with(OpMask::NOT_REPL, Arc::new(SchemaEntryCheck))
            .with(OpMask::NOT_INTERNAL, Arc::new(SchemaLibUpdate(Stage::Pre)))
            .with(OpMask::NOT_INTERNAL, Arc::new(IndexEntryHook(Stage::Pre))),
    );

    registry.set(
        Phase::PostAddCommit,
        PluginPipeline::new()
            .with(OpMask::ALL, Arc::new(ReplAgreementHook))
            .with(OpMask::NOT_INTERNAL, Arc::new(ServerEntryHook))
            .with(OpMask::NOT_INTERNAL, Arc::new(SchemaLibUpdate(Stage::Post)))
            .with(OpMask::NOT_INTERNAL, Arc::new(IndexEntryHook(Stage::Post))),
    );

    registry.set(
        Phase::PreModApplyModify,
        PluginPipeline::new()
            .with(OpMask::NOT_REPL, Arc::new(PasswordHash))
            .with(OpMask::NOT_REPL, Arc::new(CreateFsps))
            .with(OpMask::NOT_REPL, Arc::new(ReplaceOpAttrs))
            .with(OpMask::NOT_REPL, Arc::new(StructureOcCheck))
            .with(OpMask::NOT_REPL, Arc::new(MapAclString))
            .with(OpMask::NOT_INTERNAL, Arc::new(IndexEntryHook(Stage::Pre)))
            .with(OpMask::EXTERNAL, Arc::new(VerifyAcl)),
    );

    registry.set(
        Phase::PreModify,
        PluginPipeline::new()
            .with(OpMask::NOT_INTERNAL, Arc::new(SchemaLibUpdate(Stage::Pre)))
            .with(OpMask::NOT_REPL, Arc::new(LockoutPolicyIntegrity))
            .with(OpMask::ALL, Arc::new(GroupTypeCheck))
            .with(OpMask::NOT_INTERNAL, Arc::new(IndexEntryHook(Stage::Pre)))
            .with(OpMask::NOT_INTERNAL, Arc::new(DflValidate)),
    );

    registry.set(
        Phase::PostModifyCommit,
        PluginPipeline::new()
            .with(OpMask::ALL, Arc::new(DflUpdate))
            .with(OpMask::ALL, Arc::new(PasswordPostCommit))
            .with(OpMask::NOT_INTERNAL, Arc::new(SchemaLibUpdate(Stage::Post)))
            .with(OpMask::NOT_INTERNAL, Arc::new(LockoutCacheInvalidate))
            .with(OpMask::REPL, Arc::new(DcAccountRefresh)),
    );

    registry.set(
        Phase::PreModApplyDelete,
        PluginPipeline::new()
            .with(OpMask::NOT_REPL, Arc::new(ReplaceOpAttrs))
            .with(OpMask::NOT_REPL, Arc::new(SetDeletedObjAttrs)),
    );

    registry.set(
        Phase::PostDeleteCommit,
        PluginPipeline::new()
            .with(OpMask::ALL, Arc::new(ReplAgreementHook))
            .with(OpMask::ALL, Arc::new(ServerEntryHook))
            .always(OpMask::NOT_REPL, Arc::new(GroupMemberCleanup)),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_order() {
        let registry = default_registry();
        assert_eq!(
            registry.pipeline(Phase::PreAdd).names(),
            vec![
                "generic-pre-add",
                "password-hash",
                "create-fsps",
                "add-op-attrs",
                "generate-sid",
                "lockout-policy-integrity",
                "group-type",
                "schema-entry",
                "schema-lib-update",
                "index-entry",
            ]
        );
        assert_eq!(
            registry.pipeline(Phase::PreModApplyDelete).names(),
            vec!["replace-op-attrs", "set-deleted-obj-attrs"]
        );
        assert!(registry.pipeline(Phase::PreDelete).is_empty());
    }
}
