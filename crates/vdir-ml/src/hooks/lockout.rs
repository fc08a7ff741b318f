//! Account lockout policy checks and the in-memory lockout cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{mods_touch, require_entry};
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::attr;

const POLICY_ATTRS: [&str; 3] = [
    attr::MAX_FAILED_ATTEMPTS,
    attr::LOCKOUT_DURATION,
    attr::FAILED_ATTEMPT_WINDOW,
];

/// Lockout settings read from a domain or lockout policy entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Failures inside the window that lock the account.
    pub max_failed_attempts: u32,
    /// How long a locked account stays locked.
    pub lockout_duration: Duration,
    /// Window in which failures are counted.
    pub failed_attempt_window: Duration,
}

impl LockoutPolicy {
    /// Reads the policy attributes of `entry`. Returns `None` when the entry
    /// carries none of them.
    pub fn from_entry(entry: &Entry) -> Result<Option<Self>> {
        if POLICY_ATTRS.iter().all(|a| entry.find_attr(a).is_none()) {
            return Ok(None);
        }
        let read = |name: &str| -> Result<u64> {
            match entry.get_single(name) {
                None => Ok(0),
                Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                    DirError::ConstraintViolation(format!(
                        "{} must be a non-negative integer, got '{}'",
                        name, raw
                    ))
                }),
            }
        };
        let max_failed_attempts = u32::try_from(read(attr::MAX_FAILED_ATTEMPTS)?)
            .map_err(|_| DirError::ConstraintViolation("maxFailedAttempts out of range".into()))?;
        Ok(Some(Self {
            max_failed_attempts,
            lockout_duration: Duration::from_secs(read(attr::LOCKOUT_DURATION)?),
            failed_attempt_window: Duration::from_secs(read(attr::FAILED_ATTEMPT_WINDOW)?),
        }))
    }
}

#[derive(Debug)]
struct LockoutRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Failed-bind bookkeeping keyed by normalized account DN.
#[derive(Debug, Default)]
pub struct LockoutCache {
    records: Mutex<HashMap<String, LockoutRecord>>,
}

impl LockoutCache {
    /// Records a failed bind. Returns true if the account is now locked.
    pub fn record_failure(&self, norm_dn: &str, policy: &LockoutPolicy) -> bool {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(norm_dn.to_string())
            .or_insert_with(|| LockoutRecord {
                failures: 0,
                window_start: now,
                locked_until: None,
            });
        if now.duration_since(record.window_start) > policy.failed_attempt_window {
            record.failures = 0;
            record.window_start = now;
        }
        record.failures += 1;
        if policy.max_failed_attempts > 0 && record.failures >= policy.max_failed_attempts {
            record.locked_until = Some(now + policy.lockout_duration);
            info!(dn = norm_dn, failures = record.failures, "account locked out");
            return true;
        }
        false
    }

    /// Returns true while the account's lockout has not expired.
    pub fn is_locked(&self, norm_dn: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(norm_dn)
            .and_then(|r| r.locked_until)
            .map_or(false, |until| Instant::now() < until)
    }

    /// Failures counted for the account in the current window.
    pub fn failures(&self, norm_dn: &str) -> u32 {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(norm_dn).map_or(0, |r| r.failures)
    }

    /// Drops the account's record. Returns true if one existed.
    pub fn remove(&self, norm_dn: &str) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(norm_dn).is_some()
    }

    /// Drops every record.
    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of tracked accounts.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true when no account is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rejects policy entries whose lockout values do not parse.
pub struct LockoutPolicyIntegrity;

impl Hook for LockoutPolicyIntegrity {
    fn name(&self) -> &'static str {
        "lockout-policy-integrity"
    }

    fn invoke(
        &self,
        _dir: &DirectoryService,
        _op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let entry = require_entry(self.name(), entry)?;
        LockoutPolicy::from_entry(entry).map(|_| ())
    }
}

/// Drops cached lockout state after a policy change.
pub struct LockoutCacheInvalidate;

impl Hook for LockoutCacheInvalidate {
    fn name(&self) -> &'static str {
        "lockout-cache-invalidate"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if POLICY_ATTRS.iter().any(|a| mods_touch(&op.mods, a)) {
            debug!(dn = %op.norm_dn, "lockout policy changed, cache cleared");
            dir.lockout().clear();
        }
        Ok(())
    }
}
