//! Directory middle-layer configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Lower bound for the index scan limit.
pub const MIN_MAX_INDEX_SCAN: usize = 512;
/// Lower bound for the "small candidate set" threshold.
pub const MIN_SMALL_CANDIDATE_SET: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub invocation_id: String,
    pub domain_dn: String,
    pub deleted_objects_dn: Option<String>,
    pub domain_sid: String,
    pub admin_dns: Vec<String>,
    pub dc_account_dn: Option<String>,
    pub read_only: bool,
    pub allow_import_op_attrs: bool,
    pub concurrent_value_update: bool,
    pub urgent_replication: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            invocation_id: String::from("00000000-0000-0000-0000-000000000001"),
            domain_dn: String::from("dc=vsphere,dc=local"),
            deleted_objects_dn: None,
            domain_sid: String::from("S-1-7-21-1000-2000-3000"),
            admin_dns: vec![String::from("cn=administrator,cn=users,dc=vsphere,dc=local")],
            dc_account_dn: None,
            read_only: false,
            allow_import_op_attrs: false,
            concurrent_value_update: true,
            urgent_replication: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TxnConfig {
    pub max_deadlock_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_deadlock_retries: 5,
            initial_backoff_ms: 1,
            max_backoff_ms: 50,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriteQueueConfig {
    pub wait_timeout_ms: u64,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub max_index_scan: usize,
    pub small_candidate_set: usize,
    pub max_search_iteration: usize,
    pub priority_threshold: i32,
    pub attribute_priority: BTreeMap<String, i32>,
    pub allow_full_scan: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_index_scan: MIN_MAX_INDEX_SCAN,
            small_candidate_set: MIN_SMALL_CANDIDATE_SET,
            max_search_iteration: 0,
            priority_threshold: 1,
            attribute_priority: BTreeMap::new(),
            allow_full_scan: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PagedSearchConfig {
    pub read_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub max_sessions: usize,
    pub age_off_threshold: usize,
}

impl Default for PagedSearchConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            idle_timeout_secs: 180,
            max_sessions: 128,
            age_off_threshold: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub efficient_read_op_ms: u64,
    pub efficient_write_op_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            efficient_read_op_ms: 200,
            efficient_write_op_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub json: bool,
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: String::from("info"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirConfig {
    pub server: ServerConfig,
    pub txn: TxnConfig,
    pub write_queue: WriteQueueConfig,
    pub search: SearchConfig,
    pub paged_search: PagedSearchConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
}

impl DirConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DirConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config.normalized())
    }

    /// Rejects settings the middle layer cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if crate::dn::normalize_dn(&self.server.domain_dn).is_err()
            || self.server.domain_dn.trim().is_empty()
        {
            anyhow::bail!("invalid domain_dn: {:?}", self.server.domain_dn);
        }
        if self.server.invocation_id.is_empty() || self.server.invocation_id.contains(':') {
            anyhow::bail!("invocation_id must be non-empty and must not contain ':'");
        }
        if self.paged_search.max_sessions == 0 {
            anyhow::bail!("paged_search.max_sessions must be at least 1");
        }
        Ok(())
    }

    /// Applies floors and lowercases DN settings.
    pub fn normalized(mut self) -> Self {
        self.search.max_index_scan = self.search.max_index_scan.max(MIN_MAX_INDEX_SCAN);
        self.search.small_candidate_set = self
            .search
            .small_candidate_set
            .max(MIN_SMALL_CANDIDATE_SET);
        if let Ok(dn) = crate::dn::normalize_dn(&self.server.domain_dn) {
            self.server.domain_dn = dn;
        }
        self.server.admin_dns = self
            .server
            .admin_dns
            .iter()
            .filter_map(|d| crate::dn::normalize_dn(d).ok())
            .collect();
        self
    }

    pub fn deleted_objects_dn(&self) -> String {
        match &self.server.deleted_objects_dn {
            Some(dn) => crate::dn::normalize_dn(dn).unwrap_or_else(|_| dn.to_lowercase()),
            None => format!("cn=deleted objects,{}", self.server.domain_dn),
        }
    }

    pub fn schema_dn(&self) -> String {
        format!("cn=schema,cn=configuration,{}", self.server.domain_dn)
    }

    pub fn config_dn(&self) -> String {
        format!("cn=configuration,{}", self.server.domain_dn)
    }

    pub fn fsp_container_dn(&self) -> String {
        format!("cn=foreignsecurityprincipals,{}", self.server.domain_dn)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.txn.max_deadlock_retries,
            initial_backoff: Duration::from_millis(self.txn.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.txn.max_backoff_ms),
            jitter: self.txn.jitter,
            ..RetryConfig::default()
        }
    }

    pub fn write_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.write_queue.wait_timeout_ms)
    }
}
