//! Replication agreement and server registries kept in step with the
//! directory entries that define them.

use std::collections::BTreeMap;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use super::mods_touch;
use crate::dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, class, OpKind, Usn};

/// An outbound replication agreement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplAgreement {
    /// Normalized DN of the agreement entry.
    pub dn: String,
    /// Partner URI, e.g. `ldap://dc2.vsphere.local`.
    pub partner_uri: String,
    /// Highest local USN already sent to the partner.
    pub last_local_usn: Usn,
}

impl ReplAgreement {
    fn from_entry(entry: &Entry) -> Option<Self> {
        let partner_uri = entry.get_single(attr::LABELED_URI)?.to_string();
        let last_local_usn = entry
            .get_single(attr::LAST_LOCAL_USN_PROCESSED)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Usn::new)
            .unwrap_or(Usn::NONE);
        Some(Self {
            dn: entry.norm_dn.clone(),
            partner_uri,
            last_local_usn,
        })
    }
}

/// Agreements known to the server, keyed by normalized DN.
#[derive(Debug, Default)]
pub struct ReplAgreementRegistry {
    agreements: Mutex<BTreeMap<String, ReplAgreement>>,
}

impl ReplAgreementRegistry {
    /// Adds or replaces an agreement.
    pub fn insert(&self, agreement: ReplAgreement) {
        self.agreements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agreement.dn.clone(), agreement);
    }

    /// Removes the agreement stored under `norm_dn`.
    pub fn remove(&self, norm_dn: &str) -> Option<ReplAgreement> {
        self.agreements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(norm_dn)
    }

    /// Looks up one agreement.
    pub fn get(&self, norm_dn: &str) -> Option<ReplAgreement> {
        self.agreements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(norm_dn)
            .cloned()
    }

    /// Snapshot of all agreements, ordered by DN.
    pub fn list(&self) -> Vec<ReplAgreement> {
        self.agreements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Number of agreements.
    pub fn len(&self) -> usize {
        self.agreements.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true when no agreement is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registers agreements on add and drops them on delete.
pub struct ReplAgreementHook;

impl Hook for ReplAgreementHook {
    fn name(&self) -> &'static str {
        "repl-agreement"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        match op.kind {
            OpKind::Add => {
                let agreement = entry
                    .filter(|e| e.has_class(class::REPL_AGREEMENT))
                    .and_then(|e| ReplAgreement::from_entry(e));
                if let Some(agreement) = agreement {
                    info!(dn = %agreement.dn, partner = %agreement.partner_uri, "replication agreement added");
                    dir.repl_agreements().insert(agreement);
                }
            }
            OpKind::Delete => {
                if let Some(gone) = dir.repl_agreements().remove(&op.orig_norm_dn) {
                    info!(dn = %gone.dn, partner = %gone.partner_uri, "replication agreement removed");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A directory server of the federation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Normalized DN of the server entry.
    pub dn: String,
    /// Invocation ID (originating server ID in metadata).
    pub invocation_id: Option<String>,
    /// Numeric server ID.
    pub server_id: Option<u32>,
}

/// Servers known to this server, keyed by normalized DN.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: DashMap<String, ServerInfo>,
}

impl ServerRegistry {
    /// Adds or replaces a server.
    pub fn insert(&self, info: ServerInfo) {
        self.servers.insert(info.dn.clone(), info);
    }

    /// Removes a server.
    pub fn remove(&self, norm_dn: &str) -> Option<ServerInfo> {
        self.servers.remove(norm_dn).map(|(_, v)| v)
    }

    /// Looks up a server.
    pub fn get(&self, norm_dn: &str) -> Option<ServerInfo> {
        self.servers.get(norm_dn).map(|s| s.value().clone())
    }

    /// Server carrying the given invocation ID.
    pub fn by_invocation_id(&self, invocation_id: &str) -> Option<ServerInfo> {
        self.servers
            .iter()
            .find(|s| {
                s.invocation_id
                    .as_deref()
                    .map_or(false, |id| id.eq_ignore_ascii_case(invocation_id))
            })
            .map(|s| s.value().clone())
    }

    /// Number of servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns true when no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Tracks server entries.
pub struct ServerEntryHook;

impl Hook for ServerEntryHook {
    fn name(&self) -> &'static str {
        "server-entry"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        match op.kind {
            OpKind::Add => {
                if let Some(e) = entry.filter(|e| e.has_class(class::SERVER)) {
                    let info = ServerInfo {
                        dn: e.norm_dn.clone(),
                        invocation_id: e.get_single(attr::INVOCATION_ID).map(str::to_string),
                        server_id: e
                            .get_single(attr::SERVER_ID)
                            .and_then(|v| v.trim().parse().ok()),
                    };
                    debug!(dn = %info.dn, "server registered");
                    dir.servers().insert(info);
                }
            }
            OpKind::Delete => {
                if dir.servers().remove(&op.orig_norm_dn).is_some() {
                    debug!(dn = %op.orig_norm_dn, "server unregistered");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Notes a replicated password change of this server's own DC account, so
/// that the replication credentials are reloaded.
pub struct DcAccountRefresh;

impl Hook for DcAccountRefresh {
    fn name(&self) -> &'static str {
        "dc-account-refresh"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let account = match &dir.config().server.dc_account_dn {
            Some(account) => dn::normalize_dn(account)?,
            None => return Ok(()),
        };
        if account != op.norm_dn {
            return Ok(());
        }
        if mods_touch(&op.mods, attr::USER_PASSWORD)
            || mods_touch(&op.mods, attr::DC_ACCOUNT_PWD_REFRESH)
        {
            info!(dn = %op.norm_dn, "DC account password replicated");
            dir.note_dc_account_refresh();
        }
        Ok(())
    }
}
