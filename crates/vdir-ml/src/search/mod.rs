//! Search execution.
//!
//! A search request is turned into one normalized filter (client filter,
//! scope filter and tombstone exclusion), planned by the
//! [`CandidateBuilder`] and then delivered entry by entry: each candidate is
//! read, re-checked against the filter, access checked and projected onto
//! the requested attributes. Paged requests hand their candidates to the
//! [`PagedSearchCache`] instead.

pub mod builder;
pub mod candidates;
pub mod filter;
pub mod paged;
pub mod priority;
pub mod special;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

pub use builder::{CandidateBuilder, ProbeRecord, SearchPlan};
pub use candidates::{CandidateList, Candidates};
pub use filter::Filter;
pub use paged::{PagedPage, PagedSearchCache, PagedSeed};
pub use priority::{IteratorPlan, SearchPriorityMap};

use crate::access::{AccessRight, BindInfo};
use crate::backend::{BackendTxn, IndexLookup, IndexProbe, TxnMode};
use crate::dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::lifecycle::ServerState;
use crate::ops::Operation;
use crate::service::DirectoryService;
use crate::types::{attr, EntryId, OpOrigin, Scope};

/// Simple paged results control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagedControl {
    /// Entries per page.
    pub page_size: usize,
    /// Cookie from the previous page; empty for the first page.
    pub cookie: String,
}

/// A search request as handed over by the protocol head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base DN.
    pub base: String,
    /// Search scope.
    pub scope: Scope,
    /// Filter in string form.
    pub filter: String,
    /// Requested attributes; empty or `*` means all.
    pub attrs: Vec<String>,
    /// Maximum entries returned, 0 for no limit.
    pub size_limit: usize,
    /// Time limit in seconds, 0 for no limit.
    pub time_limit: u64,
    /// Paged results control.
    pub paged: Option<PagedControl>,
    /// Include tombstones.
    pub show_deleted: bool,
}

impl SearchRequest {
    /// Request for all attributes without limits.
    pub fn new(base: &str, scope: Scope, filter: &str) -> Self {
        Self {
            base: base.to_string(),
            scope,
            filter: filter.to_string(),
            attrs: Vec::new(),
            size_limit: 0,
            time_limit: 0,
            paged: None,
            show_deleted: false,
        }
    }

    /// Restricts the returned attributes.
    pub fn with_attrs(mut self, attrs: &[&str]) -> Self {
        self.attrs = attrs.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Sets the size limit.
    pub fn with_size_limit(mut self, limit: usize) -> Self {
        self.size_limit = limit;
        self
    }

    /// Sets the time limit in seconds.
    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit = secs;
        self
    }

    /// Requests a page.
    pub fn with_page(mut self, page_size: usize, cookie: &str) -> Self {
        self.paged = Some(PagedControl {
            page_size,
            cookie: cookie.to_string(),
        });
        self
    }

    /// Includes tombstones in the results.
    pub fn with_deleted(mut self) -> Self {
        self.show_deleted = true;
        self
    }

    fn is_limited(&self) -> bool {
        self.paged.is_some() || self.size_limit > 0 || self.time_limit > 0
    }
}

/// Entries found by a search.
#[derive(Clone, Debug, Default)]
pub struct SearchOutcome {
    /// Matching entries, in delivery order.
    pub entries: Vec<Entry>,
    /// Paged searches: cookie for the next page, empty after the last.
    pub cookie: Option<String>,
    /// A size, time or iteration limit cut the result short.
    pub truncated: bool,
}

impl DirectoryService {
    pub(crate) fn run_search(&self, op: &mut Operation) -> Result<()> {
        if self.state() == ServerState::Shutdown {
            return Err(DirError::Unavailable);
        }
        let req = op
            .search
            .clone()
            .ok_or_else(|| DirError::InvalidRequest("search operation without a request".into()))?;
        op.norm_dn = dn::normalize_dn(&req.base)?;

        if let Some(entry) = special::special_entry(self, &req, &op.norm_dn) {
            op.search_result = Some(SearchOutcome {
                entries: vec![entry],
                cookie: None,
                truncated: false,
            });
            return Ok(());
        }

        let filter = self.search_filter(&req, &op.norm_dn)?;
        debug!(base = %op.norm_dn, scope = ?req.scope, filter = %filter, "search");
        let outcome = match &req.paged {
            Some(control) => self.paged_search(op, &req, control, filter)?,
            None => self.plain_search(op, &req, &filter)?,
        };
        op.search_result = Some(outcome);
        Ok(())
    }

    /// Searches for entries whose `attr_name` equals `value`, as the system
    /// identity.
    pub fn simple_equal_filter_search(
        &self,
        base: &str,
        scope: Scope,
        attr_name: &str,
        value: &str,
    ) -> Result<Vec<Entry>> {
        let filter = Filter::eq(attr_name, value).to_string();
        let mut op = Operation::search(
            OpOrigin::Internal,
            BindInfo::system(),
            SearchRequest::new(base, scope, &filter),
        );
        self.internal_search(&mut op)?;
        Ok(op.search_result.map(|o| o.entries).unwrap_or_default())
    }

    /// Combines the client filter with the scope filter and the tombstone
    /// exclusion, then normalizes it.
    fn search_filter(&self, req: &SearchRequest, norm_base: &str) -> Result<Filter> {
        let client = Filter::parse(&req.filter)?;
        let mut extra = Vec::new();
        if !norm_base.is_empty() {
            extra.push(match req.scope {
                Scope::Base => Filter::eq(attr::ENTRY_DN, norm_base),
                Scope::OneLevel => Filter::OneLevel(norm_base.to_string()),
                Scope::Subtree => Filter::Or(vec![
                    Filter::eq(attr::ENTRY_DN, norm_base),
                    Filter::Substring {
                        attr: attr::ENTRY_DN.to_string(),
                        initial: None,
                        any: Vec::new(),
                        last: Some(format!(",{}", norm_base)),
                    },
                ]),
            });
        }
        let deleted_container = dn::normalize_dn(&self.config().deleted_objects_dn())?;
        if !req.show_deleted && !dn::is_descendant_or_self(norm_base, &deleted_container) {
            extra.push(Filter::Not(Box::new(Filter::eq(attr::IS_DELETED, "TRUE"))));
        }

        let mut combined = match client {
            f if extra.is_empty() => f,
            Filter::And(mut children) => {
                children.extend(extra);
                Filter::And(children)
            }
            f => {
                let mut children = Vec::with_capacity(extra.len() + 1);
                if req.scope == Scope::Base && !norm_base.is_empty() {
                    children.extend(extra);
                    children.insert(1.min(children.len()), f);
                } else {
                    children.push(f);
                    children.extend(extra);
                }
                Filter::And(children)
            }
        };
        combined.normalize(self.schema())?;
        Ok(combined)
    }

    fn plain_search(&self, op: &Operation, req: &SearchRequest, filter: &Filter) -> Result<SearchOutcome> {
        let search_cfg = &self.config().search;
        let mut builder = CandidateBuilder::new(self.backend().as_ref(), search_cfg, self.search_priority());
        if op.origin == OpOrigin::External {
            builder = builder.with_iterator(req.is_limited());
        }
        let plan = builder.build(filter)?;

        let deadline = (req.time_limit > 0).then(|| Instant::now() + Duration::from_secs(req.time_limit));
        let mut delivery = Delivery::begin(self, op, Some(filter), &req.attrs, req.size_limit, deadline)?;
        match plan {
            SearchPlan::Iterate(plan) => {
                let iter = self
                    .backend()
                    .index_iterator(&plan.attr, &plan.probe)?
                    .ok_or_else(|| DirError::Internal(format!("index on {} is gone", plan.attr)))?;
                let max = search_cfg.max_search_iteration;
                let mut seen = HashSet::new();
                for (n, id) in iter.enumerate() {
                    if max > 0 && n >= max {
                        info!(attr = %plan.attr, max, "search iteration limit reached");
                        delivery.truncated = true;
                        break;
                    }
                    if !seen.insert(id) {
                        continue;
                    }
                    if !delivery.offer(id)? {
                        break;
                    }
                }
            }
            SearchPlan::Candidates(candidates) => {
                for id in self.resolve_candidates(candidates, op.origin)? {
                    if !delivery.offer(id)? {
                        break;
                    }
                }
            }
        }
        Ok(delivery.finish(None))
    }

    fn paged_search(
        &self,
        op: &Operation,
        req: &SearchRequest,
        control: &PagedControl,
        filter: Filter,
    ) -> Result<SearchOutcome> {
        if control.page_size == 0 {
            return Err(DirError::InvalidPagedSearchRequest("page size must be positive".into()));
        }
        let cookie = if control.cookie.is_empty() {
            let search_cfg = &self.config().search;
            let mut builder =
                CandidateBuilder::new(self.backend().as_ref(), search_cfg, self.search_priority());
            if op.origin == OpOrigin::External {
                builder = builder.with_iterator(true);
            }
            let candidates = match builder.build(&filter)? {
                SearchPlan::Iterate(plan) => self.collect_iterator(&plan)?,
                SearchPlan::Candidates(c) => self.resolve_candidates(c, op.origin)?,
            };
            self.paged_searches().start(
                PagedSeed {
                    filter,
                    filter_text: req.filter.clone(),
                    candidates,
                    page_size: control.page_size,
                },
                self.backend().clone(),
            )?
        } else {
            control.cookie.clone()
        };

        let page = self
            .paged_searches()
            .next_page(&cookie, control.page_size, &req.filter)?;
        let mut delivery = Delivery::begin(self, op, None, &req.attrs, 0, None)?;
        for id in page.ids {
            delivery.offer(id)?;
        }
        Ok(delivery.finish(Some(page.cookie)))
    }

    /// Walks an index iterator into an ordered, de-duplicated ID list.
    fn collect_iterator(&self, plan: &IteratorPlan) -> Result<Vec<EntryId>> {
        let iter = self
            .backend()
            .index_iterator(&plan.attr, &plan.probe)?
            .ok_or_else(|| DirError::Internal(format!("index on {} is gone", plan.attr)))?;
        let max = self.config().search.max_search_iteration;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (n, id) in iter.enumerate() {
            if max > 0 && n >= max {
                info!(attr = %plan.attr, max, "search iteration limit reached");
                break;
            }
            if seen.insert(id) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Turns planned candidates into the IDs to read. Unrestricted plans are
    /// refused for client searches unless full scans are enabled.
    fn resolve_candidates(&self, candidates: Candidates, origin: OpOrigin) -> Result<Vec<EntryId>> {
        if let Candidates::List(list) = &candidates {
            if list.is_positive() {
                return Ok(candidates_into_ids(candidates));
            }
        }
        if origin == OpOrigin::External && !self.config().search.allow_full_scan {
            return Err(DirError::UnwillingToPerform(
                "search requires a full scan of the entry store; refine the filter".into(),
            ));
        }
        warn!(origin = %origin, "search falls back to a full scan");
        let all = match self.backend().get_candidates(
            attr::ENTRY_DN,
            &IndexProbe::Substring {
                initial: None,
                any: Vec::new(),
                last: None,
            },
            0,
        )? {
            IndexLookup::Found(ids) => ids,
            other => {
                return Err(DirError::Internal(format!("DN index scan returned {:?}", other)))
            }
        };
        let mut all = CandidateList::positive(all);
        if let Candidates::List(negative) = &candidates {
            all.subtract(negative);
        }
        Ok(all.into_ids())
    }
}

fn candidates_into_ids(candidates: Candidates) -> Vec<EntryId> {
    match candidates {
        Candidates::List(list) => list.into_ids(),
        Candidates::All => Vec::new(),
    }
}

/// Reads, checks and collects result entries inside one read transaction.
struct Delivery<'a> {
    dir: &'a DirectoryService,
    bind: &'a BindInfo,
    external: bool,
    filter: Option<&'a Filter>,
    attrs: &'a [String],
    size_limit: usize,
    deadline: Option<Instant>,
    txn: Box<dyn BackendTxn>,
    entries: Vec<Entry>,
    truncated: bool,
}

impl<'a> Delivery<'a> {
    fn begin(
        dir: &'a DirectoryService,
        op: &'a Operation,
        filter: Option<&'a Filter>,
        attrs: &'a [String],
        size_limit: usize,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        Ok(Self {
            dir,
            bind: &op.bind,
            external: op.origin == OpOrigin::External,
            filter,
            attrs,
            size_limit,
            deadline,
            txn: dir.backend().begin(TxnMode::Read)?,
            entries: Vec::new(),
            truncated: false,
        })
    }

    /// Considers one candidate. Returns false once the search must stop.
    fn offer(&mut self, id: EntryId) -> Result<bool> {
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            self.truncated = true;
            return Ok(false);
        }
        let entry = match self.txn.id_to_entry(id) {
            Ok(entry) => entry,
            Err(DirError::BackendEntryNotFound(_)) => return Ok(true),
            Err(e) => return Err(e),
        };
        if self.filter.map_or(false, |f| !f.matches(&entry)) {
            return Ok(true);
        }
        if self.external {
            if let Err(e) = self.dir.access().check(self.bind, &entry, AccessRight::READ) {
                warn!(dn = %entry.norm_dn, requester = %self.bind.dn, error = %e, "search result withheld");
                return Ok(true);
            }
        }
        if self.size_limit > 0 && self.entries.len() >= self.size_limit {
            self.truncated = true;
            return Ok(false);
        }
        self.entries.push(project(entry, self.attrs, self.external));
        Ok(true)
    }

    fn finish(self, cookie: Option<String>) -> SearchOutcome {
        self.txn.abort();
        SearchOutcome {
            entries: self.entries,
            cookie,
            truncated: self.truncated,
        }
    }
}

/// Keeps the requested attributes. Password hashes never leave the server
/// on client searches.
fn project(mut entry: Entry, attrs: &[String], external: bool) -> Entry {
    if external {
        entry.attrs.retain(|a| a.name != attr::USER_PASSWORD);
    }
    if attrs.is_empty() || attrs.iter().any(|a| a == "*") {
        return entry;
    }
    let wanted: Vec<String> = attrs.iter().map(|a| a.to_ascii_lowercase()).collect();
    entry.attrs.retain(|a| wanted.contains(&a.name));
    entry.computed.retain(|a| wanted.contains(&a.name));
    entry
}
