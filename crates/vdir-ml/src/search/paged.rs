//! Paged-search records.
//!
//! The first page of a paged search hands its candidate IDs to a new record
//! and starts a worker thread. The worker reads candidates in order, applies
//! the full filter and queues batches of surviving IDs, staying at most one
//! batch ahead of the client. Each page request takes the next batch, waiting
//! up to the read timeout. Records are looked up by cookie; `Arc` keeps a
//! record alive while both the worker and a reader use it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, TxnMode};
use crate::config::PagedSearchConfig;
use crate::error::{DirError, Result};
use crate::lifecycle::ShutdownSignal;
use crate::types::EntryId;

use super::filter::Filter;

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Everything a new paged search needs.
pub struct PagedSeed {
    /// Normalized filter applied to every candidate.
    pub filter: Filter,
    /// Filter text as the client sent it; continuations must repeat it.
    pub filter_text: String,
    /// Candidate IDs, in delivery order.
    pub candidates: Vec<EntryId>,
    /// Initial page size.
    pub page_size: usize,
}

/// One page of IDs and the cookie for the next request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagedPage {
    /// IDs of matching entries.
    pub ids: Vec<EntryId>,
    /// Cookie for the next page; empty after the last page.
    pub cookie: String,
}

struct RecordState {
    page_size: usize,
    queue: VecDeque<Vec<EntryId>>,
    worker_done: bool,
    evicted: bool,
    last_read: Instant,
    worker_error: Option<DirError>,
    worker: Option<JoinHandle<()>>,
}

struct PagedRecord {
    cookie: String,
    filter_text: String,
    state: Mutex<RecordState>,
    cond: Condvar,
}

impl PagedRecord {
    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict(&self) -> Option<JoinHandle<()>> {
        let mut st = self.lock();
        st.evicted = true;
        self.cond.notify_all();
        st.worker.take()
    }
}

/// Live paged-search records keyed by cookie.
pub struct PagedSearchCache {
    cfg: PagedSearchConfig,
    shutdown: ShutdownSignal,
    records: Mutex<HashMap<String, Arc<PagedRecord>>>,
}

impl PagedSearchCache {
    /// Creates an empty cache. Workers stop when `shutdown` fires.
    pub fn new(cfg: PagedSearchConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            cfg,
            shutdown,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Arc<PagedRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Returns true when no record is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a record for a first page and starts its worker. Returns the
    /// cookie.
    pub fn start(&self, seed: PagedSeed, backend: Arc<dyn Backend>) -> Result<String> {
        if seed.page_size == 0 {
            return Err(DirError::InvalidPagedSearchRequest("page size must be positive".into()));
        }
        let mut records = self.records();
        if records.len() > self.cfg.age_off_threshold {
            Self::sweep_locked(&mut records, self.idle_timeout());
        }
        if records.len() >= self.cfg.max_sessions {
            return Err(DirError::UnwillingToPerform(format!(
                "too many paged searches ({})",
                records.len()
            )));
        }

        let cookie = Uuid::new_v4().simple().to_string();
        let record = Arc::new(PagedRecord {
            cookie: cookie.clone(),
            filter_text: seed.filter_text,
            state: Mutex::new(RecordState {
                page_size: seed.page_size,
                queue: VecDeque::new(),
                worker_done: false,
                evicted: false,
                last_read: Instant::now(),
                worker_error: None,
                worker: None,
            }),
            cond: Condvar::new(),
        });

        let worker = Worker {
            record: record.clone(),
            filter: seed.filter,
            candidates: seed.candidates,
            backend,
            shutdown: self.shutdown.clone(),
            idle: self.idle_timeout(),
        };
        let total = worker.candidates.len();
        let handle = std::thread::Builder::new()
            .name(format!("paged-{}", &cookie[..8]))
            .spawn(move || worker.run())
            .map_err(|e| DirError::Internal(format!("cannot start paged search worker: {}", e)))?;
        record.lock().worker = Some(handle);
        records.insert(cookie.clone(), record);
        debug!(cookie = %cookie, candidates = total, live = records.len(), "paged search started");
        Ok(cookie)
    }

    /// Returns the next page of the search behind `cookie`.
    pub fn next_page(&self, cookie: &str, page_size: usize, filter_text: &str) -> Result<PagedPage> {
        if page_size == 0 {
            return Err(DirError::InvalidPagedSearchRequest("page size must be positive".into()));
        }
        let record = self
            .records()
            .get(cookie)
            .cloned()
            .ok_or_else(|| DirError::NoPagedSearchContext(cookie.to_string()))?;
        if !record.filter_text.eq_ignore_ascii_case(filter_text) {
            return Err(DirError::InvalidPagedSearchRequest(format!(
                "filter '{}' does not match the original '{}'",
                filter_text, record.filter_text
            )));
        }

        let deadline = Instant::now() + Duration::from_millis(self.cfg.read_timeout_ms);
        let mut st = record.lock();
        if st.evicted {
            drop(st);
            self.remove(cookie);
            return Err(DirError::NoPagedSearchContext(cookie.to_string()));
        }
        st.page_size = page_size;
        st.last_read = Instant::now();

        loop {
            if let Some(ids) = st.queue.pop_front() {
                // A pending worker error is reported on the next read.
                let done = st.worker_done && st.queue.is_empty() && st.worker_error.is_none();
                record.cond.notify_all();
                drop(st);
                if done {
                    self.remove(cookie);
                }
                return Ok(PagedPage {
                    ids,
                    cookie: if done { String::new() } else { record.cookie.clone() },
                });
            }
            if st.worker_done {
                let failure = st.worker_error.take();
                drop(st);
                self.remove(cookie);
                return match failure {
                    Some(e) => Err(e),
                    None => Ok(PagedPage {
                        ids: Vec::new(),
                        cookie: String::new(),
                    }),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(cookie = %cookie, timeout_ms = self.cfg.read_timeout_ms, "paged search read timed out");
                return Err(DirError::PagedSearchTimeout);
            }
            let (guard, _) = record
                .cond
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
    }

    /// Evicts records idle longer than the idle timeout. Returns how many
    /// were removed.
    pub fn sweep_idle(&self) -> usize {
        let mut records = self.records();
        Self::sweep_locked(&mut records, self.idle_timeout())
    }

    /// Evicts every record and waits for the workers to stop.
    pub fn clear(&self) {
        let drained: Vec<Arc<PagedRecord>> = self.records().drain().map(|(_, r)| r).collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "dropping paged search records");
        for record in drained {
            if let Some(handle) = record.evict() {
                if handle.join().is_err() {
                    warn!(cookie = %record.cookie, "paged search worker panicked");
                }
            }
        }
    }

    fn remove(&self, cookie: &str) {
        let removed = self.records().remove(cookie);
        if let Some(record) = removed {
            if let Some(handle) = record.evict() {
                if handle.join().is_err() {
                    warn!(cookie = %cookie, "paged search worker panicked");
                }
            }
            debug!(cookie = %cookie, "paged search finished");
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.idle_timeout_secs)
    }

    fn sweep_locked(records: &mut HashMap<String, Arc<PagedRecord>>, idle: Duration) -> usize {
        let stale: Vec<String> = records
            .iter()
            .filter(|(_, r)| {
                let st = r.lock();
                st.evicted || st.last_read.elapsed() >= idle
            })
            .map(|(k, _)| k.clone())
            .collect();
        // Swept workers are not joined here; they see `evicted` on their next
        // poll and exit on their own.
        for cookie in &stale {
            if let Some(record) = records.remove(cookie) {
                record.evict();
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "idle paged searches evicted");
        }
        stale.len()
    }
}

struct Worker {
    record: Arc<PagedRecord>,
    filter: Filter,
    candidates: Vec<EntryId>,
    backend: Arc<dyn Backend>,
    shutdown: ShutdownSignal,
    idle: Duration,
}

impl Worker {
    fn run(self) {
        let mut cursor = 0;
        loop {
            let page_size = match self.wait_for_room(cursor) {
                Some(size) => size,
                None => return,
            };
            let batch = match self.fill(&mut cursor, page_size) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(cookie = %self.record.cookie, error = %e, "paged search worker failed");
                    let mut st = self.record.lock();
                    st.worker_error = Some(e);
                    st.worker_done = true;
                    self.record.cond.notify_all();
                    return;
                }
            };
            let mut st = self.record.lock();
            if self.shutdown.is_shutdown() && cursor < self.candidates.len() {
                self.interrupt(&mut st, cursor);
                return;
            }
            let finished = cursor >= self.candidates.len();
            if !batch.is_empty() {
                st.queue.push_back(batch);
            }
            if finished {
                st.worker_done = true;
            }
            self.record.cond.notify_all();
            if finished {
                return;
            }
        }
    }

    /// Blocks until the queue is drained. Returns the current page size, or
    /// None when the worker must stop.
    fn wait_for_room(&self, cursor: usize) -> Option<usize> {
        let mut st = self.record.lock();
        loop {
            if st.evicted {
                st.worker_done = true;
                self.record.cond.notify_all();
                return None;
            }
            if self.shutdown.is_shutdown() {
                if cursor < self.candidates.len() {
                    self.interrupt(&mut st, cursor);
                } else {
                    st.worker_done = true;
                    self.record.cond.notify_all();
                }
                return None;
            }
            if st.last_read.elapsed() >= self.idle {
                debug!(cookie = %self.record.cookie, "paged search idle, worker exiting");
                st.evicted = true;
                st.worker_done = true;
                self.record.cond.notify_all();
                return None;
            }
            if st.queue.is_empty() {
                return Some(st.page_size);
            }
            let (guard, _) = self
                .record
                .cond
                .wait_timeout(st, WORKER_POLL)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
    }

    /// Stops a scan cut short by shutdown. The reader gets `Unavailable`
    /// instead of an empty last page.
    fn interrupt(&self, st: &mut RecordState, cursor: usize) {
        info!(
            cookie = %self.record.cookie,
            scanned = cursor,
            candidates = self.candidates.len(),
            "paged search interrupted by shutdown"
        );
        st.worker_error = Some(DirError::Unavailable);
        st.worker_done = true;
        self.record.cond.notify_all();
    }

    fn fill(&self, cursor: &mut usize, page_size: usize) -> Result<Vec<EntryId>> {
        let mut batch = Vec::with_capacity(page_size);
        let mut txn = self.backend.begin(TxnMode::Read)?;
        while *cursor < self.candidates.len() && batch.len() < page_size {
            if self.shutdown.is_shutdown() {
                break;
            }
            let id = self.candidates[*cursor];
            *cursor += 1;
            match txn.id_to_entry(id) {
                Ok(entry) if self.filter.matches(&entry) => batch.push(id),
                Ok(_) => {}
                Err(DirError::BackendEntryNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        txn.abort();
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::memory_backend::MemoryBackend;
    use crate::types::attr;

    fn backend_with_users(count: usize) -> (Arc<dyn Backend>, Vec<EntryId>) {
        let be = MemoryBackend::new();
        let mut txn = be.begin(TxnMode::Write).unwrap();
        let mut ids = Vec::new();
        for n in 0..count {
            let mut e = Entry::new(&format!("cn=u{},dc=x", n));
            e.add_values(attr::CN, &[format!("u{}", n)]);
            let class = if n % 3 == 0 { "group" } else { "user" };
            e.add_values(attr::OBJECT_CLASS, &["top", class]);
            ids.push(txn.add_entry(&mut e).unwrap());
        }
        txn.commit().unwrap();
        (Arc::new(be), ids)
    }

    fn cache(cfg: PagedSearchConfig) -> PagedSearchCache {
        PagedSearchCache::new(cfg, ShutdownSignal::new())
    }

    fn seed(ids: Vec<EntryId>, page_size: usize) -> PagedSeed {
        PagedSeed {
            filter: Filter::eq("objectclass", "user"),
            filter_text: "(objectClass=user)".into(),
            candidates: ids,
            page_size,
        }
    }

    #[test]
    fn test_pages_are_disjoint_and_ordered() {
        let (backend, ids) = backend_with_users(10);
        let cache = cache(PagedSearchConfig::default());
        let mut cookie = cache.start(seed(ids.clone(), 3), backend).unwrap();
        let mut seen = Vec::new();
        let mut pages = 0;
        while !cookie.is_empty() {
            let page = cache.next_page(&cookie, 3, "(OBJECTCLASS=USER)").unwrap();
            assert!(page.ids.len() <= 3);
            seen.extend(page.ids);
            cookie = page.cookie;
            pages += 1;
        }
        let expected: Vec<EntryId> = ids
            .iter()
            .enumerate()
            .filter(|(n, _)| n % 3 != 0)
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(seen, expected);
        assert!(pages >= 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shutdown_mid_scan_fails_the_next_read() {
        let (backend, ids) = backend_with_users(30);
        let signal = ShutdownSignal::new();
        let cache = PagedSearchCache::new(PagedSearchConfig::default(), signal.clone());
        let cookie = cache.start(seed(ids, 1), backend).unwrap();

        let first = cache.next_page(&cookie, 1, "(objectclass=user)").unwrap();
        assert_eq!(first.ids.len(), 1);
        assert_eq!(first.cookie, cookie);
        signal.shutdown();

        // At most the batch queued before shutdown is still delivered.
        let mut seen = first.ids.len();
        let outcome = loop {
            match cache.next_page(&cookie, 1, "(objectclass=user)") {
                Ok(page) if page.cookie.is_empty() => break Ok(page),
                Ok(page) => seen += page.ids.len(),
                Err(e) => break Err(e),
            }
            assert!(seen < 20);
        };
        assert!(matches!(outcome, Err(DirError::Unavailable)), "got {:?}", outcome);
        assert!(seen < 20);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_continuation_checks() {
        let (backend, ids) = backend_with_users(10);
        let cache = cache(PagedSearchConfig::default());
        let cookie = cache.start(seed(ids, 2), backend).unwrap();
        assert!(matches!(
            cache.next_page(&cookie, 2, "(cn=*)"),
            Err(DirError::InvalidPagedSearchRequest(_))
        ));
        assert!(matches!(
            cache.next_page(&cookie, 0, "(objectClass=user)"),
            Err(DirError::InvalidPagedSearchRequest(_))
        ));
        assert!(matches!(
            cache.next_page("nope", 2, "(objectClass=user)"),
            Err(DirError::NoPagedSearchContext(_))
        ));
        // A larger page size on continuation is accepted.
        let page = cache.next_page(&cookie, 50, "(objectClass=user)").unwrap();
        assert!(!page.ids.is_empty());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_session_limit_and_idle_sweep() {
        let (backend, ids) = backend_with_users(4);
        let cache = cache(PagedSearchConfig {
            max_sessions: 2,
            idle_timeout_secs: 0,
            ..PagedSearchConfig::default()
        });
        cache.start(seed(ids.clone(), 1), backend.clone()).unwrap();
        cache.start(seed(ids.clone(), 1), backend.clone()).unwrap();
        assert!(matches!(
            cache.start(seed(ids.clone(), 1), backend.clone()),
            Err(DirError::UnwillingToPerform(_))
        ));
        assert_eq!(cache.sweep_idle(), 2);
        assert!(cache.start(seed(ids, 1), backend).is_ok());
        cache.clear();
    }

    #[test]
    fn test_empty_result_completes_immediately() {
        let (backend, ids) = backend_with_users(1);
        let cache = cache(PagedSearchConfig::default());
        // u0 is a group, so nothing survives the filter.
        let cookie = cache.start(seed(ids, 5), backend).unwrap();
        let page = cache.next_page(&cookie, 5, "(objectclass=user)").unwrap();
        assert!(page.ids.is_empty());
        assert!(page.cookie.is_empty());
        assert!(cache.is_empty());
    }
}
