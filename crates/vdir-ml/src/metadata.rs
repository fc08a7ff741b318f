//! Replication metadata: per-attribute version stamps and per-value records.
//!
//! Attribute metadata is the string
//! `<localUSN>:<version>:<originatingServerID>:<originatingTime>:<originatingUSN>`.
//! Per-value metadata prefixes the attribute name and appends the value
//! operation and a length-prefixed raw value:
//! `<attr>:<usnChanged>:<version>:<server>:<time>:<origUSN>:<op>:<len>:<value>`.
//! Attribute names never contain `:` (enforced when types are registered),
//! and the value is delimited by its byte length, so values may contain `:`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::BackendTxn;
use crate::entry::{Entry, ModOp, Modification};
use crate::error::{DirError, Result};
use crate::types::Usn;

/// Attribute-level replication metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrMetadata {
    /// USN of the local write that last touched the attribute.
    pub local_usn: Usn,
    /// Monotonic per-attribute version.
    pub version: u64,
    /// Invocation id of the server where the change originated.
    pub server_id: String,
    /// Generalized time of the originating change.
    pub time: String,
    /// USN on the originating server.
    pub orig_usn: Usn,
}

impl AttrMetadata {
    /// Metadata for a change that originates on this server.
    pub fn local(usn: Usn, version: u64, server_id: &str, time: &str) -> Self {
        Self {
            local_usn: usn,
            version,
            server_id: server_id.to_string(),
            time: time.to_string(),
            orig_usn: usn,
        }
    }

    /// Returns true when `self` wins over `other` in a conflict: higher
    /// version first, then later time, then higher server id.
    pub fn supersedes(&self, other: &AttrMetadata) -> bool {
        (self.version, &self.time, &self.server_id) > (other.version, &other.time, &other.server_id)
    }
}

impl fmt::Display for AttrMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.local_usn, self.version, self.server_id, self.time, self.orig_usn
        )
    }
}

fn parse_u64(field: &str, what: &str, input: &str) -> Result<u64> {
    field
        .parse::<u64>()
        .map_err(|_| DirError::InvalidSyntax(format!("bad {} in metadata '{}'", what, input)))
}

impl FromStr for AttrMetadata {
    type Err = DirError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 5 {
            return Err(DirError::InvalidSyntax(format!(
                "attribute metadata needs 5 fields: '{}'",
                s
            )));
        }
        Ok(Self {
            local_usn: Usn::new(parse_u64(parts[0], "local USN", s)?),
            version: parse_u64(parts[1], "version", s)?,
            server_id: parts[2].to_string(),
            time: parts[3].to_string(),
            orig_usn: Usn::new(parse_u64(parts[4], "originating USN", s)?),
        })
    }
}

/// Operation recorded in a per-value metadata record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueOp {
    /// Value was deleted.
    Delete,
    /// Value was added.
    Add,
}

impl ValueOp {
    fn code(&self) -> u8 {
        match self {
            ValueOp::Delete => 0,
            ValueOp::Add => 1,
        }
    }
}

/// Per-value replication metadata record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    /// Attribute the value belongs to.
    pub attr: String,
    /// Metadata of the change; `local_usn` is the entry's usnChanged.
    pub meta: AttrMetadata,
    /// Whether the value was added or deleted.
    pub op: ValueOp,
    /// Raw value.
    pub value: String,
}

impl ValueMetadata {
    /// Returns true if the record concerns `value` (case-insensitive).
    pub fn is_for(&self, value: &str) -> bool {
        self.value.eq_ignore_ascii_case(value)
    }
}

impl fmt::Display for ValueMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.attr,
            self.meta,
            self.op.code(),
            self.value.len(),
            self.value
        )
    }
}

impl FromStr for ValueMetadata {
    type Err = DirError;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = s.splitn(9, ':');
        let mut next = |what: &str| {
            fields.next().ok_or_else(|| {
                DirError::InvalidSyntax(format!("value metadata missing {}: '{}'", what, s))
            })
        };
        let attr = next("attribute")?.to_string();
        let meta_fields = [
            next("usnChanged")?,
            next("version")?,
            next("server")?,
            next("time")?,
            next("originating USN")?,
        ];
        let op = match next("operation")? {
            "0" => ValueOp::Delete,
            "1" => ValueOp::Add,
            other => {
                return Err(DirError::InvalidSyntax(format!(
                    "bad value operation '{}' in '{}'",
                    other, s
                )))
            }
        };
        let len = parse_u64(next("length")?, "value length", s)? as usize;
        let value = next("value")?.to_string();
        if attr.is_empty() || value.len() != len {
            return Err(DirError::InvalidSyntax(format!(
                "value metadata length mismatch: '{}'",
                s
            )));
        }
        let meta: AttrMetadata = meta_fields.join(":").parse()?;
        Ok(Self {
            attr,
            meta,
            op,
            value,
        })
    }
}

/// Inputs shared by the generators.
#[derive(Clone, Debug)]
pub struct MetadataContext<'a> {
    /// USN of the operation.
    pub usn: Usn,
    /// Local invocation id.
    pub server_id: &'a str,
    /// Generalized time of the operation.
    pub time: &'a str,
    /// Generate per-value metadata for multi-valued attributes.
    pub concurrent_value_update: bool,
}

/// Stamps every attribute of a new entry with version 1.
pub fn generate_add_metadata(entry: &mut Entry, ctx: &MetadataContext<'_>) {
    for attribute in &mut entry.attrs {
        attribute.metadata = Some(AttrMetadata::local(ctx.usn, 1, ctx.server_id, ctx.time));
    }
}

/// Refreshes metadata for every modified attribute.
///
/// All modifications of the same attribute share one stamp. A Delete-all
/// immediately followed by an Add (a desugared Replace) resets the per-value
/// history of the attribute instead of recording per-value adds.
pub fn generate_modify_metadata(
    txn: &mut dyn BackendTxn,
    entry: &Entry,
    mods: &mut [Modification],
    ctx: &MetadataContext<'_>,
) -> Result<()> {
    let id = entry
        .id
        .ok_or_else(|| DirError::Internal(format!("{} has no entry id", entry.norm_dn)))?;
    let mut stamped: HashMap<String, (AttrMetadata, u64)> = HashMap::new();
    let mut reset: Vec<String> = Vec::new();

    for m in mods.iter_mut().filter(|m| !m.ignore) {
        let name = m.attr.name.clone();
        let (meta, prior_version) = match stamped.get(&name) {
            Some((meta, prior)) => (meta.clone(), *prior),
            None => {
                let stored = txn.attr_metadata(id, &name)?;
                let current = stored.as_ref().map_or(0, |s| s.version);
                let version = current + m.force_version_gap as u64 + 1;
                let meta = AttrMetadata::local(ctx.usn, version, ctx.server_id, ctx.time);
                debug!(attr = %name, version, "attribute metadata stamped");
                stamped.insert(name.clone(), (meta.clone(), current));
                (meta, current)
            }
        };
        m.attr.metadata = Some(meta.clone());

        if !ctx.concurrent_value_update || !m.attr.is_multi_valued() || prior_version == 0 {
            continue;
        }
        let stored_values = txn.value_metadata(id, &name)?;
        match m.op {
            ModOp::Delete if m.attr.values.is_empty() => {
                m.attr.value_meta_to_delete.extend(stored_values);
                reset.push(name);
            }
            ModOp::Add if reset.contains(&name) => {}
            ModOp::Add | ModOp::Delete => {
                let op = if m.op == ModOp::Add {
                    ValueOp::Add
                } else {
                    ValueOp::Delete
                };
                for value in &m.attr.values {
                    m.attr
                        .value_meta_to_delete
                        .extend(stored_values.iter().filter(|v| v.is_for(&value.raw)).cloned());
                    m.attr.value_meta_to_add.push_back(ValueMetadata {
                        attr: name.clone(),
                        meta: meta.clone(),
                        op,
                        value: value.raw.clone(),
                    });
                }
            }
            ModOp::Replace => {}
        }
    }
    Ok(())
}

/// Logs and reports an incoming metadata version lower than the stored one.
pub fn check_version_regression(
    dn: &str,
    attr: &str,
    stored: Option<&AttrMetadata>,
    incoming: &AttrMetadata,
) -> bool {
    match stored {
        Some(stored) if incoming.version < stored.version => {
            warn!(
                dn,
                attr,
                stored = %stored,
                incoming = %incoming,
                "attribute metadata version regression"
            );
            true
        }
        _ => false,
    }
}

/// Drops values of a replicated modification that lose against newer stored
/// per-value metadata. Sets `ignore` when nothing is left. Returns the number
/// of values dropped.
pub fn resolve_value_conflicts(m: &mut Modification, stored: &[ValueMetadata]) -> usize {
    if m.attr.value_meta_to_add.is_empty() {
        return 0;
    }
    let mut dropped = 0;
    let mut keep_values = Vec::with_capacity(m.attr.values.len());
    let mut keep_meta = std::collections::VecDeque::new();
    let incoming: Vec<ValueMetadata> = m.attr.value_meta_to_add.drain(..).collect();

    for value in m.attr.values.drain(..) {
        let mine = incoming.iter().find(|v| v.is_for(&value.raw));
        let newest_stored = stored
            .iter()
            .filter(|v| v.is_for(&value.raw))
            .max_by(|a, b| {
                if a.meta.supersedes(&b.meta) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Less
                }
            });
        match (mine, newest_stored) {
            (Some(mine), Some(theirs)) if !mine.meta.supersedes(&theirs.meta) => {
                debug!(
                    attr = %m.attr.name,
                    value = %value.raw,
                    incoming = %mine.meta,
                    stored = %theirs.meta,
                    "older value change loses"
                );
                dropped += 1;
            }
            (mine, _) => {
                if let Some(mine) = mine {
                    keep_meta.push_back(mine.clone());
                }
                keep_values.push(value);
            }
        }
    }
    m.attr.values = keep_values;
    m.attr.value_meta_to_add = keep_meta;
    if m.attr.values.is_empty() && dropped > 0 {
        m.ignore = true;
    }
    dropped
}
