//! Storage backend capability set.
//!
//! The middle layer never touches storage directly. It begins a transaction,
//! reads and writes entries through it, and commits or aborts. Any call that
//! takes a backend lock may fail with [`DirError::BackendDeadlock`], which the
//! operation pipeline retries from the begin step.
//!
//! [`DirError::BackendDeadlock`]: crate::error::DirError::BackendDeadlock

use crate::entry::{Entry, Modification};
use crate::error::Result;
use crate::metadata::{AttrMetadata, ValueMetadata};
use crate::types::{EntryId, Usn};

/// Transaction mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnMode {
    /// Read-only snapshot.
    Read,
    /// Read-write transaction.
    Write,
}

/// Row lock taken by an entry read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Plain read without a row lock.
    None,
    /// Shared row lock.
    Read,
    /// Exclusive row lock.
    Write,
}

/// Kind of an index probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexProbe {
    /// Normalized value equals.
    Equal(String),
    /// Normalized value is greater than or equal.
    GreaterOrEqual(String),
    /// Normalized value is less than or equal.
    LessOrEqual(String),
    /// Substring match on normalized values.
    Substring {
        /// Required prefix.
        initial: Option<String>,
        /// Required inner fragments, in order.
        any: Vec<String>,
        /// Required suffix.
        last: Option<String>,
    },
    /// Direct children of the entry with this normalized DN.
    OneLevel(String),
}

/// Result of an index probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexLookup {
    /// The attribute has no index; no candidate set can be built.
    NotIndexed,
    /// More IDs matched than the scan limit allowed.
    LimitExceeded,
    /// Sorted, de-duplicated matching IDs.
    Found(Vec<EntryId>),
}

/// Index configuration of one attribute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IndexInfo {
    /// The index enforces (and may be used for) global uniqueness.
    pub unique: bool,
}

/// Iterator over entry IDs in index order.
pub type IndexIterator = Box<dyn Iterator<Item = EntryId> + Send>;

/// Backend-wide capabilities.
pub trait Backend: Send + Sync {
    /// Begins a transaction.
    fn begin(&self, mode: TxnMode) -> Result<Box<dyn BackendTxn>>;

    /// Allocates the next USN from the monotonic counter.
    fn next_usn(&self) -> Result<Usn>;

    /// Highest USN allocated so far.
    fn max_usn(&self) -> Usn;

    /// Records the highest USN of a locally originated change.
    fn set_max_originating_usn(&self, usn: Usn);

    /// Highest USN of a locally originated change.
    fn max_originating_usn(&self) -> Usn;

    /// Probes an attribute index. `scan_limit` of 0 means unbounded.
    fn get_candidates(&self, attr: &str, probe: &IndexProbe, scan_limit: usize)
        -> Result<IndexLookup>;

    /// Creates an iterator over IDs matching the probe, in index order.
    /// Returns None when the attribute is not indexed.
    fn index_iterator(&self, attr: &str, probe: &IndexProbe) -> Result<Option<IndexIterator>>;

    /// Index configuration of an attribute, if indexed.
    fn index_info(&self, attr: &str) -> Option<IndexInfo>;

    /// Creates (or reconfigures) an attribute index and builds it.
    fn configure_index(&self, attr: &str, unique: bool) -> Result<()>;

    /// Number of stored entries.
    fn entry_count(&self) -> usize;
}

/// One backend transaction. Dropping an uncommitted transaction aborts it.
pub trait BackendTxn: Send {
    /// Transaction mode.
    fn mode(&self) -> TxnMode;

    /// Reads the entry with the given normalized DN.
    fn dn_to_entry(&mut self, norm_dn: &str, lock: LockMode) -> Result<Entry>;

    /// Resolves a normalized DN to its entry ID.
    fn dn_to_entry_id(&mut self, norm_dn: &str) -> Result<EntryId>;

    /// Reads the entry with the given ID.
    fn id_to_entry(&mut self, id: EntryId) -> Result<Entry>;

    /// Returns true if any entry names `id` as its parent.
    fn has_children(&mut self, id: EntryId) -> Result<bool>;

    /// Stores a new entry, assigning its ID.
    fn add_entry(&mut self, entry: &mut Entry) -> Result<EntryId>;

    /// Replaces a stored entry with `entry` and records the metadata carried
    /// by `mods`.
    fn modify_entry(&mut self, mods: &[Modification], entry: &Entry) -> Result<()>;

    /// Physically removes an entry.
    fn delete_entry(&mut self, entry: &Entry) -> Result<()>;

    /// Stored metadata of one attribute.
    fn attr_metadata(&mut self, id: EntryId, attr: &str) -> Result<Option<AttrMetadata>>;

    /// Stored per-value metadata of one attribute.
    fn value_metadata(&mut self, id: EntryId, attr: &str) -> Result<Vec<ValueMetadata>>;

    /// Drops all per-value metadata of an entry.
    fn delete_value_metadata(&mut self, id: EntryId) -> Result<()>;

    /// Commits the transaction.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Aborts the transaction.
    fn abort(self: Box<Self>);
}
