//! Ordered hook pipelines bound to operation phases.
//!
//! A pipeline is a list of `(mask, skip_on_error, hook)` entries. Invocation
//! folds over the list: a hook runs when its mask covers the operation origin
//! and, if it is skip-on-error, no earlier hook has failed. The first failure
//! is the pipeline result; later failures are logged and never replace it.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::service::DirectoryService;
use crate::types::OpOrigin;

/// Set of operation origins a hook applies to.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct OpMask(u8);

impl OpMask {
    /// Client operations.
    pub const EXTERNAL: OpMask = OpMask(0b001);
    /// Server-internal operations.
    pub const INTERNAL: OpMask = OpMask(0b010);
    /// Inbound replication.
    pub const REPL: OpMask = OpMask(0b100);
    /// Every origin.
    pub const ALL: OpMask = OpMask(0b111);
    /// Everything except replication.
    pub const NOT_REPL: OpMask = OpMask(0b011);
    /// Everything except internal operations.
    pub const NOT_INTERNAL: OpMask = OpMask(0b101);

    /// Mask bit of one origin.
    pub fn of(origin: OpOrigin) -> OpMask {
        match origin {
            OpOrigin::External => Self::EXTERNAL,
            OpOrigin::Internal => Self::INTERNAL,
            OpOrigin::Repl => Self::REPL,
        }
    }

    /// Returns true if the mask covers `origin`.
    pub fn matches(&self, origin: OpOrigin) -> bool {
        self.0 & Self::of(origin).0 != 0
    }
}

impl BitOr for OpMask {
    type Output = OpMask;

    fn bitor(self, rhs: OpMask) -> OpMask {
        OpMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for OpMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.0 & Self::EXTERNAL.0 != 0 {
            names.push("external");
        }
        if self.0 & Self::INTERNAL.0 != 0 {
            names.push("internal");
        }
        if self.0 & Self::REPL.0 != 0 {
            names.push("repl");
        }
        write!(f, "OpMask({})", names.join("|"))
    }
}

/// A hook attached to an operation phase.
pub trait Hook: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Runs the hook. `entry` is the entry being written when the phase has
    /// one; `prior` is the first error recorded earlier in the pipeline.
    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        prior: Option<&DirError>,
    ) -> Result<()>;
}

/// One registered hook.
#[derive(Clone)]
pub struct HookEntry {
    /// Origins the hook runs for.
    pub mask: OpMask,
    /// Skip the hook once an earlier hook in the pipeline failed.
    pub skip_on_error: bool,
    /// The hook itself.
    pub hook: Arc<dyn Hook>,
}

impl fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("hook", &self.hook.name())
            .field("mask", &self.mask)
            .field("skip_on_error", &self.skip_on_error)
            .finish()
    }
}

/// Ordered list of hooks.
#[derive(Clone, Default, Debug)]
pub struct PluginPipeline {
    hooks: Vec<HookEntry>,
}

impl PluginPipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a skip-on-error hook.
    pub fn with(mut self, mask: OpMask, hook: Arc<dyn Hook>) -> Self {
        self.push(mask, true, hook);
        self
    }

    /// Appends a hook that runs even after an earlier failure.
    pub fn always(mut self, mask: OpMask, hook: Arc<dyn Hook>) -> Self {
        self.push(mask, false, hook);
        self
    }

    /// Appends a hook.
    pub fn push(&mut self, mask: OpMask, skip_on_error: bool, hook: Arc<dyn Hook>) {
        self.hooks.push(HookEntry {
            mask,
            skip_on_error,
            hook,
        });
    }

    /// Hook names in invocation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.hook.name()).collect()
    }

    /// Number of hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true when no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs the pipeline and returns the first hook failure.
    pub fn run(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        mut entry: Option<&mut Entry>,
    ) -> Result<()> {
        let mut first: Option<DirError> = None;
        for h in &self.hooks {
            if !h.mask.matches(op.origin) {
                continue;
            }
            if h.skip_on_error && first.is_some() {
                debug!(hook = h.hook.name(), "hook skipped after earlier failure");
                continue;
            }
            if let Err(e) = h
                .hook
                .invoke(dir, op, entry.as_deref_mut(), first.as_ref())
            {
                match &first {
                    None => {
                        debug!(hook = h.hook.name(), error = %e, "hook failed");
                        first = Some(e);
                    }
                    Some(_) => {
                        warn!(hook = h.hook.name(), error = %e, "hook failed after earlier failure");
                    }
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Phase a pipeline is bound to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before an Add is written.
    PreAdd,
    /// After an Add committed.
    PostAddCommit,
    /// Before Modify mods are applied; entry not read yet.
    PreModApplyModify,
    /// Before a Modify commits; entry available.
    PreModify,
    /// After a Modify committed.
    PostModifyCommit,
    /// Before Delete mods are applied; entry not read yet.
    PreModApplyDelete,
    /// Before a Delete commits; entry available.
    PreDelete,
    /// After a Delete committed.
    PostDeleteCommit,
}

/// The eight phase pipelines.
#[derive(Clone, Default, Debug)]
pub struct PluginRegistry {
    pipelines: [PluginPipeline; 8],
}

impl PluginRegistry {
    /// Creates a registry with empty pipelines.
    pub fn empty() -> Self {
        Self::default()
    }

    fn slot(phase: Phase) -> usize {
        match phase {
            Phase::PreAdd => 0,
            Phase::PostAddCommit => 1,
            Phase::PreModApplyModify => 2,
            Phase::PreModify => 3,
            Phase::PostModifyCommit => 4,
            Phase::PreModApplyDelete => 5,
            Phase::PreDelete => 6,
            Phase::PostDeleteCommit => 7,
        }
    }

    /// Pipeline bound to `phase`.
    pub fn pipeline(&self, phase: Phase) -> &PluginPipeline {
        &self.pipelines[Self::slot(phase)]
    }

    /// Mutable pipeline bound to `phase`, for registering extra hooks.
    pub fn pipeline_mut(&mut self, phase: Phase) -> &mut PluginPipeline {
        &mut self.pipelines[Self::slot(phase)]
    }

    /// Replaces the pipeline bound to `phase`.
    pub fn set(&mut self, phase: Phase, pipeline: PluginPipeline) {
        self.pipelines[Self::slot(phase)] = pipeline;
    }

    /// Runs the pipeline bound to `phase`.
    pub fn run(
        &self,
        phase: Phase,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
    ) -> Result<()> {
        self.pipeline(phase).run(dir, op, entry)
    }
}
