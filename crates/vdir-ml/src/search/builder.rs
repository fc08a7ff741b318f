//! Candidate-set construction from a filter tree.
//!
//! Leaves probe their attribute index under a scan limit. AND nodes look for
//! a cheap answer first (a unique-index equality or a `usnChanged>=` range),
//! then run a bounded pass over their leaves, then their composite children,
//! and only fall back to unbounded probes when no positive set turned up
//! anywhere above and the AND is not nested in an OR. OR nodes evaluate every
//! child.

use tracing::{debug, trace};

use crate::backend::{Backend, IndexLookup};
use crate::config::SearchConfig;
use crate::error::Result;
use crate::types::attr;

use super::candidates::{and_candidates, or_candidates, CandidateList, Candidates};
use super::filter::Filter;
use super::priority::{IteratorPlan, SearchPriorityMap};

/// What the search loop should walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchPlan {
    /// Read the computed candidates (or everything, for `All`).
    Candidates(Candidates),
    /// Walk one index in order.
    Iterate(IteratorPlan),
}

/// One index probe made while planning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeRecord {
    /// Probed attribute.
    pub attr: String,
    /// Scan limit used, 0 for unbounded.
    pub scan_limit: usize,
    /// Number of IDs found; None if unindexed or over the limit.
    pub found: Option<usize>,
}

/// Builds candidates for one search.
pub struct CandidateBuilder<'a> {
    backend: &'a dyn Backend,
    cfg: &'a SearchConfig,
    priority: &'a SearchPriorityMap,
    iterator_limited: Option<bool>,
    plan: Option<IteratorPlan>,
    probes: Vec<ProbeRecord>,
}

impl<'a> CandidateBuilder<'a> {
    /// Creates a builder that never chooses an iterator plan.
    pub fn new(backend: &'a dyn Backend, cfg: &'a SearchConfig, priority: &'a SearchPriorityMap) -> Self {
        Self {
            backend,
            cfg,
            priority,
            iterator_limited: None,
            plan: None,
            probes: Vec::new(),
        }
    }

    /// Allows an iterator plan. `limited` marks paged or size/time bounded
    /// requests.
    pub fn with_iterator(mut self, limited: bool) -> Self {
        self.iterator_limited = Some(limited);
        self
    }

    /// Probes made so far.
    pub fn probes(&self) -> &[ProbeRecord] {
        &self.probes
    }

    /// Plans the search of `filter`.
    pub fn build(&mut self, filter: &Filter) -> Result<SearchPlan> {
        let candidates = self.node(filter, 0, self.cfg.max_index_scan, false)?;
        if let Some(plan) = self.plan.take() {
            debug!(attr = %plan.attr, priority = plan.priority, "index iterator plan");
            return Ok(SearchPlan::Iterate(plan));
        }
        match &candidates {
            Candidates::All => debug!(filter = %filter, "no candidate restriction"),
            Candidates::List(list) => debug!(
                filter = %filter,
                count = list.len(),
                positive = list.is_positive(),
                "candidates built"
            ),
        }
        Ok(SearchPlan::Candidates(candidates))
    }

    fn node(&mut self, filter: &Filter, or_depth: usize, limit: usize, ancestor_positive: bool) -> Result<Candidates> {
        if self.plan.is_some() {
            return Ok(Candidates::All);
        }
        match filter {
            Filter::And(children) => self.and(children, or_depth, limit, ancestor_positive),
            Filter::Or(children) => {
                let mut results = Vec::with_capacity(children.len());
                for child in children {
                    results.push(self.node(child, or_depth + 1, limit, ancestor_positive)?);
                }
                Ok(or_candidates(results.iter()))
            }
            Filter::Not(_) | Filter::Present(_) => Ok(Candidates::All),
            leaf => self.leaf(leaf, limit),
        }
    }

    fn leaf(&mut self, filter: &Filter, limit: usize) -> Result<Candidates> {
        let (name, probe) = match filter.probe() {
            Some(p) => p,
            None => return Ok(Candidates::All),
        };
        let lookup = self.backend.get_candidates(name, &probe, limit)?;
        let found = match lookup {
            IndexLookup::Found(ids) => Some(ids),
            IndexLookup::NotIndexed | IndexLookup::LimitExceeded => None,
        };
        trace!(attr = name, limit, found = ?found.as_ref().map(Vec::len), "index probe");
        self.probes.push(ProbeRecord {
            attr: name.to_string(),
            scan_limit: limit,
            found: found.as_ref().map(Vec::len),
        });
        Ok(found.map_or(Candidates::All, |ids| {
            Candidates::List(CandidateList::positive(ids))
        }))
    }

    /// Index of a child that can settle the AND by itself: an equality on
    /// a unique index wins outright, else the first `usnChanged>=` range.
    fn special_child(&self, children: &[Filter]) -> Option<usize> {
        let mut usn_range = None;
        for (i, child) in children.iter().enumerate() {
            match child {
                Filter::Equality { attr: name, .. }
                    if self.backend.index_info(name).map_or(false, |info| info.unique) =>
                {
                    return Some(i)
                }
                Filter::GreaterOrEqual { attr: name, .. }
                    if name == attr::USN_CHANGED && usn_range.is_none() =>
                {
                    usn_range = Some(i)
                }
                _ => {}
            }
        }
        usn_range
    }

    fn and(&mut self, children: &[Filter], or_depth: usize, limit: usize, ancestor_positive: bool) -> Result<Candidates> {
        let small = self.cfg.small_candidate_set;
        let mut results: Vec<Option<Candidates>> = vec![None; children.len()];
        let mut got_positive = false;

        if let Some(i) = self.special_child(children) {
            let c = self.leaf(&children[i], 0)?;
            if let Some(list) = c.as_positive() {
                if list.len() <= small {
                    return Ok(c);
                }
                got_positive = true;
            }
            results[i] = Some(c);
        }

        for (i, child) in children.iter().enumerate() {
            if child.is_composite() || results[i].is_some() {
                continue;
            }
            let c = self.node(child, or_depth, limit, ancestor_positive)?;
            if let Some(list) = c.as_positive() {
                if list.len() <= small {
                    return Ok(c);
                }
                got_positive = true;
            }
            results[i] = Some(c);
        }

        for (i, child) in children.iter().enumerate() {
            if !child.is_composite() {
                continue;
            }
            let c = self.node(child, or_depth, limit, ancestor_positive || got_positive)?;
            if let Some(list) = c.as_positive() {
                if list.len() <= small {
                    return Ok(c);
                }
                got_positive = true;
            }
            results[i] = Some(c);
        }
        if self.plan.is_some() {
            return Ok(Candidates::All);
        }

        // Under an OR the bounded pass is final; the OR itself falls back to
        // no restriction.
        if !got_positive && !ancestor_positive && or_depth == 0 {
            if let Some(limited) = self.iterator_limited {
                if let Some(plan) = self.priority.choose(children, limited, self.backend) {
                    self.plan = Some(plan);
                    return Ok(Candidates::All);
                }
            }
            for (i, child) in children.iter().enumerate() {
                if matches!(results[i], Some(Candidates::List(_))) {
                    continue;
                }
                results[i] = Some(self.node(child, or_depth, 0, false)?);
            }
        }

        Ok(and_candidates(results.iter().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TxnMode;
    use crate::entry::Entry;
    use crate::memory_backend::MemoryBackend;
    use crate::types::EntryId;

    fn user(n: usize, department: &str) -> Entry {
        let mut e = Entry::new(&format!("cn=user{},dc=x", n));
        e.add_values(attr::OBJECT_CLASS, &["top", "user"]);
        e.add_values(attr::CN, &[format!("user{}", n)]);
        e.add_values("samaccountname", &[format!("user{}", n)]);
        e.add_values("department", &[department]);
        for a in &mut e.attrs {
            for v in &mut a.values {
                v.norm = Some(v.raw.to_lowercase());
            }
        }
        e
    }

    fn populated(count: usize) -> MemoryBackend {
        let be = MemoryBackend::new();
        let mut txn = be.begin(TxnMode::Write).unwrap();
        let mut root = Entry::new("dc=x");
        root.add_values(attr::OBJECT_CLASS, &["top", "domain"]);
        txn.add_entry(&mut root).unwrap();
        for n in 0..count {
            let dept = if n % 2 == 0 { "even" } else { "odd" };
            txn.add_entry(&mut user(n, dept)).unwrap();
        }
        txn.commit().unwrap();
        be
    }

    fn small_cfg() -> SearchConfig {
        SearchConfig {
            max_index_scan: 10,
            small_candidate_set: 2,
            ..SearchConfig::default()
        }
    }

    fn ids(plan: SearchPlan) -> Vec<u64> {
        match plan {
            SearchPlan::Candidates(Candidates::List(list)) => {
                list.ids().iter().map(EntryId::as_u64).collect()
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_unique_equality_settles_and() {
        let be = populated(40);
        let cfg = small_cfg();
        let map = SearchPriorityMap::from_config(&cfg);
        let mut builder = CandidateBuilder::new(&be, &cfg, &map);
        let f = Filter::parse("(&(objectclass=user)(samaccountname=user7))").unwrap();
        let got = ids(builder.build(&f).unwrap());
        assert_eq!(got.len(), 1);
        assert_eq!(builder.probes().len(), 1);
        assert_eq!(builder.probes()[0].attr, "samaccountname");
    }

    #[test]
    fn test_small_set_avoids_unbounded_scan() {
        let be = populated(40);
        let cfg = small_cfg();
        let map = SearchPriorityMap::from_config(&cfg);
        let mut builder = CandidateBuilder::new(&be, &cfg, &map);
        let f = Filter::parse("(&(objectclass=user)(cn=user3))").unwrap();
        assert_eq!(ids(builder.build(&f).unwrap()).len(), 1);
        assert!(builder
            .probes()
            .iter()
            .all(|p| p.scan_limit == cfg.max_index_scan));
    }

    #[test]
    fn test_second_pass_runs_unbounded() {
        let be = populated(40);
        let cfg = small_cfg();
        let map = SearchPriorityMap::from_config(&cfg);
        let mut builder = CandidateBuilder::new(&be, &cfg, &map);
        let f = Filter::parse("(&(objectclass=user)(cn=user1*))").unwrap();
        // user1, user10..user19
        assert_eq!(ids(builder.build(&f).unwrap()).len(), 11);
        assert!(builder.probes().iter().any(|p| p.scan_limit == 0));
    }

    #[test]
    fn test_unindexed_only_gives_all_or_iterator() {
        let be = populated(5);
        let cfg = small_cfg();
        let map = SearchPriorityMap::from_config(&cfg);
        let f = Filter::parse("(&(department=even)(!(cn=user1)))").unwrap();
        let mut builder = CandidateBuilder::new(&be, &cfg, &map);
        assert_eq!(builder.build(&f).unwrap(), SearchPlan::Candidates(Candidates::All));

        let g = Filter::parse("(&(department=even)(objectclass=user))").unwrap();
        let mut builder = CandidateBuilder::new(&be, &cfg, &map).with_iterator(false);
        // objectclass matches 5 entries, above the small set size.
        match builder.build(&g).unwrap() {
            SearchPlan::Candidates(Candidates::List(list)) => assert_eq!(list.len(), 5),
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_iterator_plan_when_no_positive_set() {
        let be = populated(40);
        let cfg = small_cfg();
        let map = SearchPriorityMap::from_config(&cfg);
        let f = Filter::parse("(&(department=even)(objectclass=user))").unwrap();
        let mut builder = CandidateBuilder::new(&be, &cfg, &map).with_iterator(true);
        match builder.build(&f).unwrap() {
            SearchPlan::Iterate(plan) => {
                assert_eq!(plan.attr, "objectclass");
                assert_eq!(plan.priority, 4);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_or_unions_and_gives_up_on_unindexed() {
        let be = populated(6);
        let cfg = small_cfg();
        let map = SearchPriorityMap::from_config(&cfg);
        let mut builder = CandidateBuilder::new(&be, &cfg, &map);
        let f = Filter::parse("(|(cn=user1)(cn=user2))").unwrap();
        assert_eq!(ids(builder.build(&f).unwrap()).len(), 2);

        let g = Filter::parse("(|(cn=user1)(department=odd))").unwrap();
        assert_eq!(builder.build(&g).unwrap(), SearchPlan::Candidates(Candidates::All));
    }

    #[test]
    fn test_and_under_or_skips_unbounded_pass() {
        let be = populated(40);
        let cfg = small_cfg();
        let map = SearchPriorityMap::from_config(&cfg);
        let mut builder = CandidateBuilder::new(&be, &cfg, &map).with_iterator(false);
        // cn=user1* matches 11 entries, over the scan limit of 10.
        let f = Filter::parse("(|(&(department=*)(cn=user1*))(cn=user3))").unwrap();
        assert_eq!(builder.build(&f).unwrap(), SearchPlan::Candidates(Candidates::All));
        assert!(!builder.probes().is_empty());
        assert!(builder.probes().iter().all(|p| p.scan_limit != 0));
    }
}
