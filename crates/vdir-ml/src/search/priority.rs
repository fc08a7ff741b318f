//! Iterator-plan scoring.
//!
//! When no small positive candidate set exists, the planner may instead walk
//! a single index in order and filter entries one by one. Each leaf is scored
//! by its filter type, optionally overridden per attribute; limited searches
//! (paged, size or time bounded) get a bonus since they rarely drain the
//! iterator.

use std::collections::HashMap;

use crate::backend::{Backend, IndexProbe};
use crate::config::SearchConfig;

use super::filter::Filter;

const EQUALITY_PRIORITY: i32 = 3;
const ONELEVEL_PRIORITY: i32 = 2;
const SUBSTRING_INITIAL_PRIORITY: i32 = 2;
const SUBSTRING_PRIORITY: i32 = 1;
const LIMITED_BONUS: i32 = 1;

/// A chosen index walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IteratorPlan {
    /// Attribute whose index is walked.
    pub attr: String,
    /// Probe restricting the walk.
    pub probe: IndexProbe,
    /// Score the plan won with.
    pub priority: i32,
}

/// Scores leaf filters for the iterator plan.
#[derive(Clone, Debug)]
pub struct SearchPriorityMap {
    threshold: i32,
    overrides: HashMap<String, i32>,
}

impl SearchPriorityMap {
    /// Builds the map from the search configuration.
    pub fn from_config(cfg: &SearchConfig) -> Self {
        Self {
            threshold: cfg.priority_threshold,
            overrides: cfg
                .attribute_priority
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), *v))
                .collect(),
        }
    }

    /// Minimum score an iterator plan needs.
    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// Score of one leaf. Zero means never iterate.
    pub fn score(&self, filter: &Filter, limited: bool) -> i32 {
        let base = match filter {
            Filter::Equality { .. } => EQUALITY_PRIORITY,
            Filter::OneLevel(_) => ONELEVEL_PRIORITY,
            Filter::Substring { initial: Some(_), .. } => SUBSTRING_INITIAL_PRIORITY,
            Filter::Substring { .. } => SUBSTRING_PRIORITY,
            _ => return 0,
        };
        let base = filter
            .attr()
            .and_then(|a| self.overrides.get(a))
            .copied()
            .unwrap_or(base);
        if base > 0 && limited {
            base + LIMITED_BONUS
        } else {
            base
        }
    }

    /// Picks the best-scoring leaf among `children` whose attribute has an
    /// index. Ties keep the first leaf.
    pub fn choose(
        &self,
        children: &[Filter],
        limited: bool,
        backend: &dyn Backend,
    ) -> Option<IteratorPlan> {
        let mut best: Option<IteratorPlan> = None;
        for child in children.iter().filter(|c| !c.is_composite()) {
            let priority = self.score(child, limited);
            if priority <= 0 || priority < self.threshold {
                continue;
            }
            let (attr, probe) = match child.probe() {
                Some(p) => p,
                None => continue,
            };
            if backend.index_info(attr).is_none() {
                continue;
            }
            if best.as_ref().map_or(true, |b| priority > b.priority) {
                best = Some(IteratorPlan {
                    attr: attr.to_string(),
                    probe,
                    priority,
                });
            }
        }
        best
    }
}
