//! Write-ordering queue.
//!
//! Writers take a USN from the backend and join the tail of a FIFO under one
//! process-wide mutex, so queue order equals USN order. A writer may only
//! commit once it reaches the head; when the head leaves it advances the
//! committed-USN watermark and wakes the next element. This makes USNs
//! visible strictly in assignment order even though the backend
//! transactions themselves run concurrently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::error::{DirError, Result};
use crate::types::Usn;

struct Waiter {
    usn: Usn,
    cond: Condvar,
}

struct QueueState {
    queue: VecDeque<Arc<Waiter>>,
    committed: Usn,
}

/// Per-operation handle on the queue.
#[derive(Default)]
pub struct WriteQueueElement {
    waiter: Option<Arc<Waiter>>,
}

impl WriteQueueElement {
    /// Creates an element that is not queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// USN held by the element, if pushed.
    pub fn usn(&self) -> Option<Usn> {
        self.waiter.as_ref().map(|w| w.usn)
    }

    /// Returns true while the element sits in the queue.
    pub fn is_queued(&self) -> bool {
        self.waiter.is_some()
    }
}

/// Counters describing queue behavior.
#[derive(Debug, Default)]
pub struct WriteQueueStats {
    /// Elements pushed.
    pub pushed: AtomicU64,
    /// Elements popped.
    pub popped: AtomicU64,
    /// Pops that did not remove the head.
    pub out_of_order_pops: AtomicU64,
    /// Waits that timed out.
    pub timeouts: AtomicU64,
    /// Longest wait observed (microseconds).
    pub max_wait_us: AtomicU64,
}

/// The write queue.
pub struct WriteQueue {
    state: Mutex<QueueState>,
    stats: WriteQueueStats,
}

impl WriteQueue {
    /// Creates an empty queue whose watermark starts at `committed`.
    pub fn new(committed: Usn) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                committed,
            }),
            stats: WriteQueueStats::default(),
        }
    }

    /// Assigns the next USN to `element` and appends it to the tail.
    pub fn push(&self, backend: &dyn Backend, element: &mut WriteQueueElement) -> Result<Usn> {
        if let Some(usn) = element.usn() {
            return Err(DirError::UsnAlreadyAssigned(usn.as_u64()));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let usn = backend.next_usn()?;
        let waiter = Arc::new(Waiter {
            usn,
            cond: Condvar::new(),
        });
        state.queue.push_back(waiter.clone());
        element.waiter = Some(waiter);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        debug!(%usn, depth = state.queue.len(), "write queue push");
        Ok(usn)
    }

    /// Blocks until `element` is at the head of the queue or `timeout` passes.
    /// Returns the time spent waiting.
    pub fn wait(&self, element: &WriteQueueElement, timeout: Duration) -> Result<Duration> {
        let waiter = element.waiter.as_ref().ok_or(DirError::NoUsn)?;
        let start = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match state.queue.front() {
                Some(head) if Arc::ptr_eq(head, waiter) => break,
                None => {
                    return Err(DirError::Internal(format!(
                        "USN {} waited on an empty write queue",
                        waiter.usn
                    )))
                }
                _ => {}
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                let head = state.queue.front().map(|h| h.usn).unwrap_or_default();
                error!(
                    usn = %waiter.usn,
                    %head,
                    waited_ms = elapsed.as_millis() as u64,
                    "write queue wait timed out"
                );
                return Err(DirError::WriteTimeout {
                    usn: waiter.usn.as_u64(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let (guard, _) = waiter
                .cond
                .wait_timeout(state, timeout - elapsed)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        let waited = start.elapsed();
        let waited_us = waited.as_micros() as u64;
        self.stats.max_wait_us.fetch_max(waited_us, Ordering::Relaxed);
        Ok(waited)
    }

    /// Removes `element` from the queue and wakes the new head.
    ///
    /// Removing the head advances the committed watermark. Removing any other
    /// element, or a watermark that would move backwards, is logged as an
    /// anomaly and otherwise tolerated. Popping an element that was never
    /// pushed is a no-op.
    pub fn pop(&self, element: &mut WriteQueueElement) {
        let waiter = match element.waiter.take() {
            Some(w) => w,
            None => return,
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let pos = match state.queue.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
            Some(pos) => pos,
            None => {
                warn!(usn = %waiter.usn, "write queue element missing on pop");
                return;
            }
        };
        state.queue.remove(pos);
        self.stats.popped.fetch_add(1, Ordering::Relaxed);

        if pos == 0 {
            if waiter.usn < state.committed {
                warn!(
                    usn = %waiter.usn,
                    committed = %state.committed,
                    "committed USN watermark would regress"
                );
            } else {
                state.committed = waiter.usn;
            }
        } else {
            // Failed writes leave the queue from wherever they stand.
            self.stats.out_of_order_pops.fetch_add(1, Ordering::Relaxed);
            let head = state.queue.front().map(|h| h.usn).unwrap_or_default();
            debug!(
                usn = %waiter.usn,
                %head,
                position = pos,
                "write queue element was not the head"
            );
        }

        if let Some(next) = state.queue.front() {
            next.cond.notify_one();
        }
        debug!(usn = %waiter.usn, committed = %state.committed, "write queue pop");
    }

    /// Highest USN released from the head of the queue.
    pub fn committed_usn(&self) -> Usn {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).committed
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    /// Returns true when no writer is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue counters.
    pub fn stats(&self) -> &WriteQueueStats {
        &self.stats
    }
}
