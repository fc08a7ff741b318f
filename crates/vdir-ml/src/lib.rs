#![warn(missing_docs)]

//! Directory middle layer: transactional Add/Modify/Delete pipelines with
//! deadlock retry, USN write ordering, plugin hooks, replication metadata,
//! candidate-list search and paged-search caching

pub mod access;
pub mod backend;
pub mod config;
pub mod dn;
pub mod entry;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod memory_backend;
pub mod metadata;
pub mod metrics;
pub mod ops;
pub mod plugin;
pub mod retry;
pub mod schema;
pub mod search;
pub mod service;
pub mod types;
pub mod write_queue;

pub use access::{AccessChecker, AccessRight, BindInfo, DefaultAccessChecker};
pub use backend::{Backend, BackendTxn, IndexLookup, IndexProbe, LockMode, TxnMode};
pub use config::DirConfig;
pub use entry::{Attribute, Entry, ModOp, Modification};
pub use error::{DirError, OpResult, Result, ResultCode};
pub use lifecycle::{ServerState, ShutdownSignal};
pub use memory_backend::MemoryBackend;
pub use metrics::{MetricsCollector, OpObserver, OpRecord};
pub use ops::{Operation, RenameRequest};
pub use schema::{Schema, StaticSchema};
pub use search::{Filter, SearchOutcome, SearchRequest};
pub use service::{DirectoryService, ServiceStats};
pub use types::{EntryId, OpKind, OpOrigin, Scope, Usn};
