//! Entries answered without touching the indices: the root DSE and the
//! server and replication status entries.

use crate::entry::{Attribute, Entry};
use crate::service::DirectoryService;
use crate::types::{attr, Scope};

use super::filter::Filter;
use super::SearchRequest;

/// OID of the simple paged results control.
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Normalized DN of the server status entry.
pub const SERVER_STATUS_DN: &str = "cn=serverstatus";

/// Normalized DN of the replication status entry.
pub const REPLICATION_STATUS_DN: &str = "cn=replicationstatus";

/// Returns the synthesized entry for a base-scope `(objectClass=*)` search
/// of one of the special DNs.
pub fn special_entry(dir: &DirectoryService, req: &SearchRequest, norm_base: &str) -> Option<Entry> {
    if req.scope != Scope::Base || req.paged.is_some() {
        return None;
    }
    match Filter::parse(&req.filter) {
        Ok(Filter::Present(name)) if name == attr::OBJECT_CLASS => {}
        _ => return None,
    }
    match norm_base {
        "" => Some(root_dse(dir)),
        SERVER_STATUS_DN => Some(server_status(dir)),
        REPLICATION_STATUS_DN => Some(replication_status(dir)),
        _ => None,
    }
}

fn computed(dn: &str, attrs: Vec<(&str, Vec<String>)>) -> Entry {
    let mut entry = Entry::new(dn);
    entry.add_values(attr::OBJECT_CLASS, &["top"]);
    entry.computed = attrs
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(name, values)| Attribute::new(name, &values))
        .collect();
    entry
}

fn root_dse(dir: &DirectoryService) -> Entry {
    let cfg = dir.config();
    let stats = dir.stats();
    computed(
        "",
        vec![
            ("namingcontexts", vec![cfg.server.domain_dn.clone(), cfg.config_dn(), cfg.schema_dn()]),
            ("defaultnamingcontext", vec![cfg.server.domain_dn.clone()]),
            ("configurationnamingcontext", vec![cfg.config_dn()]),
            ("schemanamingcontext", vec![cfg.schema_dn()]),
            ("supportedcontrol", vec![PAGED_RESULTS_OID.to_string()]),
            ("supportedldapversion", vec!["3".to_string()]),
            ("highestcommittedusn", vec![stats.committed_usn.to_string()]),
            (attr::INVOCATION_ID, vec![cfg.server.invocation_id.clone()]),
            ("domainfunctionality", vec![stats.domain_functional_level.to_string()]),
        ],
    )
}

fn server_status(dir: &DirectoryService) -> Entry {
    let stats = dir.stats();
    let metrics = dir.metrics().snapshot();
    computed(
        SERVER_STATUS_DN,
        vec![
            ("serverstate", vec![format!("{:?}", dir.state()).to_ascii_lowercase()]),
            ("entrycount", vec![stats.entries.to_string()]),
            ("writecount", vec![stats.writes.to_string()]),
            ("highestcommittedusn", vec![stats.committed_usn.to_string()]),
            ("maxoriginatingusn", vec![stats.max_originating_usn.to_string()]),
            ("pagedsearchcount", vec![stats.paged_searches.to_string()]),
            ("totaloperations", vec![metrics.total_ops.to_string()]),
            ("totalerrors", vec![metrics.total_errors.to_string()]),
            ("slowoperations", vec![metrics.slow_ops.to_string()]),
            ("deadlockretries", vec![metrics.deadlock_retries.to_string()]),
        ],
    )
}

fn replication_status(dir: &DirectoryService) -> Entry {
    let stats = dir.stats();
    let partners: Vec<String> = dir
        .repl_agreements()
        .list()
        .into_iter()
        .map(|ra| format!("{} lastLocalUsn={}", ra.partner_uri, ra.last_local_usn))
        .collect();
    computed(
        REPLICATION_STATUS_DN,
        vec![
            (attr::INVOCATION_ID, vec![dir.config().server.invocation_id.clone()]),
            ("highestcommittedusn", vec![stats.committed_usn.to_string()]),
            ("replicationagreementcount", vec![stats.replication_agreements.to_string()]),
            ("replicationpartner", partners),
        ],
    )
}
