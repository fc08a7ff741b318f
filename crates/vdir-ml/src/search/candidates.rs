//! Candidate lists and their algebra.
//!
//! A candidate list is a sorted, de-duplicated set of entry IDs with a
//! polarity: a positive list holds (a superset of) the matching entries, a
//! negative list holds entries known not to match. [`Candidates::All`] means
//! no restriction could be computed.

use crate::types::EntryId;

/// Sorted entry IDs with a polarity flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateList {
    ids: Vec<EntryId>,
    positive: bool,
}

impl CandidateList {
    /// A positive list. Input order and duplicates do not matter.
    pub fn positive(ids: Vec<EntryId>) -> Self {
        Self::build(ids, true)
    }

    /// A negative list.
    pub fn negative(ids: Vec<EntryId>) -> Self {
        Self::build(ids, false)
    }

    fn build(mut ids: Vec<EntryId>, positive: bool) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids, positive }
    }

    /// Returns true for a positive list.
    pub fn is_positive(&self) -> bool {
        self.positive
    }

    /// Number of IDs.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true when the list holds no IDs.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The sorted IDs.
    pub fn ids(&self) -> &[EntryId] {
        &self.ids
    }

    /// Consumes the list, returning the sorted IDs.
    pub fn into_ids(self) -> Vec<EntryId> {
        self.ids
    }

    /// Keeps only IDs also present in `other`. Both lists share a polarity.
    pub fn intersect(&mut self, other: &CandidateList) {
        debug_assert_eq!(self.positive, other.positive);
        let mut out = Vec::with_capacity(self.ids.len().min(other.ids.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            match self.ids[i].cmp(&other.ids[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(self.ids[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        self.ids = out;
    }

    /// Adds the IDs of `other`. Both lists share a polarity.
    pub fn union(&mut self, other: &CandidateList) {
        debug_assert_eq!(self.positive, other.positive);
        let mut out = Vec::with_capacity(self.ids.len() + other.ids.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() || j < other.ids.len() {
            let next = match (self.ids.get(i), other.ids.get(j)) {
                (Some(a), Some(b)) if a < b => {
                    i += 1;
                    *a
                }
                (Some(a), Some(b)) if a > b => {
                    j += 1;
                    *b
                }
                (Some(a), Some(_)) => {
                    i += 1;
                    j += 1;
                    *a
                }
                (Some(a), None) => {
                    i += 1;
                    *a
                }
                (None, Some(b)) => {
                    j += 1;
                    *b
                }
                (None, None) => break,
            };
            out.push(next);
        }
        self.ids = out;
    }

    /// Removes the IDs of a negative list from a positive one.
    pub fn subtract(&mut self, negative: &CandidateList) {
        debug_assert!(self.positive && !negative.positive);
        self.ids
            .retain(|id| negative.ids.binary_search(id).is_err());
    }
}

/// Candidates computed for one filter node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidates {
    /// Every entry may match.
    All,
    /// Entries restricted by a list.
    List(CandidateList),
}

impl Candidates {
    /// Returns the list if it is positive.
    pub fn as_positive(&self) -> Option<&CandidateList> {
        match self {
            Candidates::List(list) if list.is_positive() => Some(list),
            _ => None,
        }
    }
}

/// Combines the children of an AND node: positive lists are intersected
/// first, then negative lists are subtracted (or unioned with a negative
/// accumulator). Children without a restriction are skipped.
pub fn and_candidates<'a, I>(children: I) -> Candidates
where
    I: IntoIterator<Item = &'a Candidates>,
{
    let mut positives = Vec::new();
    let mut negatives = Vec::new();
    for child in children {
        if let Candidates::List(list) = child {
            if list.is_positive() {
                positives.push(list);
            } else {
                negatives.push(list);
            }
        }
    }

    let mut acc: Option<CandidateList> = None;
    for list in positives {
        match acc.as_mut() {
            None => acc = Some(list.clone()),
            Some(cur) => cur.intersect(list),
        }
    }
    for list in negatives {
        match acc.as_mut() {
            None => acc = Some(list.clone()),
            Some(cur) if cur.is_positive() => cur.subtract(list),
            Some(cur) => cur.union(list),
        }
    }
    acc.map_or(Candidates::All, Candidates::List)
}

/// Combines the children of an OR node: any unrestricted or negative child
/// makes the whole node unrestricted, otherwise positive lists are unioned.
pub fn or_candidates<'a, I>(children: I) -> Candidates
where
    I: IntoIterator<Item = &'a Candidates>,
{
    let mut acc: Option<CandidateList> = None;
    for child in children {
        match child {
            Candidates::List(list) if list.is_positive() => match acc.as_mut() {
                None => acc = Some(list.clone()),
                Some(cur) => cur.union(list),
            },
            _ => return Candidates::All,
        }
    }
    acc.map_or(Candidates::All, Candidates::List)
}
