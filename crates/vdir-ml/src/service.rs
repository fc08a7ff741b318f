//! The directory service: collaborators, registries and server state shared
//! by every operation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::access::{AccessChecker, DefaultAccessChecker};
use crate::backend::Backend;
use crate::config::DirConfig;
use crate::dn;
use crate::entry::Entry;
use crate::error::Result;
use crate::hooks::{
    default_registry, IndexScheduler, LockoutCache, ReplAgreementRegistry, RidAllocator,
    ServerRegistry,
};
use crate::lifecycle::{ServerState, ShutdownSignal, StateCell};
use crate::memory_backend::MemoryBackend;
use crate::metrics::{MetricsCollector, OpObserver, OpRecord};
use crate::ops::{BindInfo, Operation};
use crate::plugin::PluginRegistry;
use crate::retry::DeadlockRetry;
use crate::schema::{Schema, StaticSchema};
use crate::search::{PagedSearchCache, SearchPriorityMap};
use crate::types::{attr, class, OpOrigin, Usn};
use crate::write_queue::WriteQueue;

/// Normalized DNs of the domain (organization) objects the server hosts.
#[derive(Debug, Default)]
pub struct OrgRegistry {
    orgs: Mutex<BTreeSet<String>>,
}

impl OrgRegistry {
    /// Registers a domain DN.
    pub fn insert(&self, norm_dn: &str) {
        self.orgs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(norm_dn.to_string());
    }

    /// Unregisters a domain DN. Returns true if it was present.
    pub fn remove(&self, norm_dn: &str) -> bool {
        self.orgs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(norm_dn)
    }

    /// Returns true if the DN is registered.
    pub fn contains(&self, norm_dn: &str) -> bool {
        self.orgs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(norm_dn)
    }

    /// Registered DNs in order.
    pub fn list(&self) -> Vec<String> {
        self.orgs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Highest USN whose change should be pushed to partners without waiting
/// for the next replication cycle.
#[derive(Debug, Default)]
pub struct UrgentReplication {
    pending: AtomicU64,
}

impl UrgentReplication {
    /// Requests an urgent push up to `usn`.
    pub fn note(&self, usn: Usn) {
        self.pending.fetch_max(usn.as_u64(), Ordering::SeqCst);
    }

    /// Takes the pending request, if any.
    pub fn take(&self) -> Option<Usn> {
        match self.pending.swap(0, Ordering::SeqCst) {
            0 => None,
            usn => Some(Usn::new(usn)),
        }
    }
}

/// Counters reported by `bootstrap` and the server status entry.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceStats {
    /// Stored entries.
    pub entries: usize,
    /// Committed writes.
    pub writes: u64,
    /// Highest allocated USN.
    pub max_usn: u64,
    /// Highest USN released by the write queue.
    pub committed_usn: u64,
    /// Highest locally originated USN.
    pub max_originating_usn: u64,
    /// Live paged-search records.
    pub paged_searches: usize,
    /// Known replication agreements.
    pub replication_agreements: usize,
    /// Domain functional level.
    pub domain_functional_level: u32,
}

/// Shared state of the directory middle layer.
pub struct DirectoryService {
    config: DirConfig,
    backend: Arc<dyn Backend>,
    schema: Arc<dyn Schema>,
    access: Arc<dyn AccessChecker>,
    plugins: PluginRegistry,
    write_queue: WriteQueue,
    retry: DeadlockRetry,
    repl_agreements: ReplAgreementRegistry,
    servers: ServerRegistry,
    lockout: LockoutCache,
    orgs: OrgRegistry,
    rids: RidAllocator,
    index_scheduler: IndexScheduler,
    search_priority: SearchPriorityMap,
    paged: PagedSearchCache,
    metrics: MetricsCollector,
    observers: RwLock<Vec<Arc<dyn OpObserver>>>,
    state: StateCell,
    shutdown: ShutdownSignal,
    schema_mutex: Mutex<()>,
    write_count: AtomicU64,
    urgent: UrgentReplication,
    dfl: AtomicU32,
    dc_account_refreshes: AtomicU64,
}

impl DirectoryService {
    /// Creates a service over the given backend and schema with the default
    /// hook registry and access checker.
    pub fn new(config: DirConfig, backend: Arc<dyn Backend>, schema: Arc<dyn Schema>) -> Self {
        let config = config.normalized();
        let shutdown = ShutdownSignal::new();
        let access: Arc<dyn AccessChecker> =
            Arc::new(DefaultAccessChecker::new(config.server.admin_dns.iter()));
        let initial_state = if config.server.read_only {
            ServerState::ReadOnly
        } else {
            ServerState::Normal
        };
        Self {
            write_queue: WriteQueue::new(backend.max_usn()),
            retry: DeadlockRetry::new(config.retry_config()),
            search_priority: SearchPriorityMap::from_config(&config.search),
            paged: PagedSearchCache::new(config.paged_search.clone(), shutdown.clone()),
            plugins: default_registry(),
            repl_agreements: ReplAgreementRegistry::default(),
            servers: ServerRegistry::default(),
            lockout: LockoutCache::default(),
            orgs: OrgRegistry::default(),
            rids: RidAllocator::default(),
            index_scheduler: IndexScheduler::default(),
            metrics: MetricsCollector::new(),
            observers: RwLock::new(Vec::new()),
            state: StateCell::new(initial_state),
            schema_mutex: Mutex::new(()),
            write_count: AtomicU64::new(0),
            urgent: UrgentReplication::default(),
            dfl: AtomicU32::new(1),
            dc_account_refreshes: AtomicU64::new(0),
            shutdown,
            access,
            config,
            backend,
            schema,
        }
    }

    /// A service over a fresh [`MemoryBackend`] and the built-in schema.
    pub fn in_memory(config: DirConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticSchema::bootstrap()),
        )
    }

    /// Replaces the hook registry.
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Replaces the access checker.
    pub fn with_access_checker(mut self, access: Arc<dyn AccessChecker>) -> Self {
        self.access = access;
        self
    }

    /// Creates the domain tree, the well-known containers and the
    /// administrator account.
    pub fn bootstrap(&self) -> Result<()> {
        let domain = self.config.server.domain_dn.clone();
        let rdns = dn::split_rdns(&domain);
        for i in (0..rdns.len()).rev() {
            let dc_dn = rdns[i..].join(",");
            let (_, value) = dn::rdn_to_name_value(&rdns[i])?;
            let mut e = Entry::new(&dc_dn);
            e.add_values(attr::OBJECT_CLASS, &[class::TOP, class::DOMAIN]);
            e.add_values("dc", &[value.as_str()]);
            if dc_dn == domain {
                e.add_values(attr::DOMAIN_FUNCTIONAL_LEVEL, &["1"]);
            }
            self.bootstrap_add(e)?;
        }

        let containers = [
            format!("cn=users,{}", domain),
            self.config.deleted_objects_dn(),
            self.config.fsp_container_dn(),
            self.config.config_dn(),
            self.config.schema_dn(),
            format!("cn=servers,{}", self.config.config_dn()),
        ];
        for container in &containers {
            let (_, cn) = dn::rdn_to_name_value(&dn::rdn(container))?;
            let mut e = Entry::new(container);
            e.add_values(attr::OBJECT_CLASS, &[class::TOP, class::CONTAINER]);
            e.add_values(attr::CN, &[cn.as_str()]);
            self.bootstrap_add(e)?;
        }

        let admin_dn = format!("cn=administrator,cn=users,{}", domain);
        let mut admin = Entry::new(&admin_dn);
        admin.add_values(attr::OBJECT_CLASS, &[class::TOP, class::USER]);
        admin.add_values(attr::CN, &["administrator"]);
        admin.add_values("samaccountname", &["administrator"]);
        self.bootstrap_add(admin)?;

        info!(
            domain = %domain,
            entries = self.backend.entry_count(),
            usn = %self.write_queue.committed_usn(),
            "directory bootstrapped"
        );
        Ok(())
    }

    fn bootstrap_add(&self, entry: Entry) -> Result<()> {
        let dn = entry.dn.clone();
        let mut op = Operation::add(OpOrigin::Internal, BindInfo::system(), entry);
        self.internal_add(&mut op)?;
        debug!(dn = %dn, usn = %op.usn, "bootstrap entry added");
        Ok(())
    }

    /// Registers a per-operation completion callback.
    pub fn add_observer(&self, observer: Arc<dyn OpObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub(crate) fn notify_observers(&self, record: &OpRecord) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer.on_op_complete(record);
        }
    }

    /// Moves the server to another state.
    pub fn set_state(&self, state: ServerState) {
        info!(?state, "server state change");
        self.state.set(state);
    }

    /// Current server state.
    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// Enters the shutdown state and stops background workers.
    pub fn shutdown(&self) {
        self.set_state(ServerState::Shutdown);
        self.shutdown.shutdown();
        self.paged.clear();
    }

    /// Snapshot of the service counters.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            entries: self.backend.entry_count(),
            writes: self.write_count(),
            max_usn: self.backend.max_usn().as_u64(),
            committed_usn: self.write_queue.committed_usn().as_u64(),
            max_originating_usn: self.backend.max_originating_usn().as_u64(),
            paged_searches: self.paged.len(),
            replication_agreements: self.repl_agreements.len(),
            domain_functional_level: self.domain_functional_level(),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &DirConfig {
        &self.config
    }

    /// Storage backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Schema collaborator.
    pub fn schema(&self) -> &dyn Schema {
        self.schema.as_ref()
    }

    /// Access checker.
    pub fn access(&self) -> &dyn AccessChecker {
        self.access.as_ref()
    }

    /// Hook registry.
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Write-ordering queue.
    pub fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    pub(crate) fn retry(&self) -> &DeadlockRetry {
        &self.retry
    }

    /// Replication agreements known to this server.
    pub fn repl_agreements(&self) -> &ReplAgreementRegistry {
        &self.repl_agreements
    }

    /// Server objects known to this server.
    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    /// Account lockout cache.
    pub fn lockout(&self) -> &LockoutCache {
        &self.lockout
    }

    /// Hosted domains.
    pub fn orgs(&self) -> &OrgRegistry {
        &self.orgs
    }

    pub(crate) fn rids(&self) -> &RidAllocator {
        &self.rids
    }

    /// Attribute index build states.
    pub fn index_scheduler(&self) -> &IndexScheduler {
        &self.index_scheduler
    }

    /// Attribute priorities used by the search planner.
    pub fn search_priority(&self) -> &SearchPriorityMap {
        &self.search_priority
    }

    /// Paged-search records.
    pub fn paged_searches(&self) -> &PagedSearchCache {
        &self.paged
    }

    /// Operation metrics.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Urgent replication requests.
    pub fn urgent_replication(&self) -> &UrgentReplication {
        &self.urgent
    }

    pub(crate) fn schema_mutex(&self) -> &Mutex<()> {
        &self.schema_mutex
    }

    pub(crate) fn bump_write_count(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Committed writes since start.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Domain functional level.
    pub fn domain_functional_level(&self) -> u32 {
        self.dfl.load(Ordering::SeqCst)
    }

    pub(crate) fn set_domain_functional_level(&self, level: u32) {
        self.dfl.store(level, Ordering::SeqCst);
    }

    pub(crate) fn note_dc_account_refresh(&self) {
        self.dc_account_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Replicated password refreshes of the DC machine account.
    pub fn dc_account_refreshes(&self) -> u64 {
        self.dc_account_refreshes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LockMode, TxnMode};

    #[test]
    fn test_bootstrap_creates_tree() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        dir.bootstrap().unwrap();
        let mut txn = dir.backend().begin(TxnMode::Read).unwrap();
        for dn in [
            "dc=local",
            "dc=vsphere,dc=local",
            "cn=users,dc=vsphere,dc=local",
            "cn=deleted objects,dc=vsphere,dc=local",
            "cn=schema,cn=configuration,dc=vsphere,dc=local",
            "cn=administrator,cn=users,dc=vsphere,dc=local",
        ] {
            let e = txn.dn_to_entry(dn, LockMode::None).unwrap();
            assert!(e.get_single(attr::OBJECT_GUID).is_some(), "{} lacks a GUID", dn);
        }
        assert!(dir.orgs().contains("dc=vsphere,dc=local"));
        let stats = dir.stats();
        assert_eq!(stats.entries, 9);
        assert_eq!(stats.writes, 9);
        assert_eq!(stats.committed_usn, stats.max_usn);
    }

    #[test]
    fn test_urgent_replication_take_clears() {
        let urgent = UrgentReplication::default();
        assert_eq!(urgent.take(), None);
        urgent.note(Usn::new(5));
        urgent.note(Usn::new(3));
        assert_eq!(urgent.take(), Some(Usn::new(5)));
        assert_eq!(urgent.take(), None);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let dir = DirectoryService::in_memory(DirConfig::default());
        dir.shutdown();
        dir.set_state(ServerState::Normal);
        assert_eq!(dir.state(), ServerState::Shutdown);
    }
}
