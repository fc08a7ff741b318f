//! Password hashing and post-change lockout reset.

use sha2::{Digest, Sha512};
use tracing::debug;

use super::{mods_touch, require_entry};
use crate::entry::{AttrValue, Entry};
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::service::DirectoryService;
use crate::types::{attr, OpKind};
use crate::entry::ModOp;

/// Scheme prefix of stored password hashes.
pub const SSHA512_PREFIX: &str = "{SSHA512}";

const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 64;

/// Hashes a clear-text password with a random salt.
pub fn hash_password(plain: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    hash_with_salt(plain, &salt)
}

fn hash_with_salt(plain: &str, salt: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(plain.as_bytes());
    hasher.update(salt);
    let mut out = hasher.finalize().to_vec();
    out.extend_from_slice(salt);
    format!("{}{}", SSHA512_PREFIX, hex::encode(out))
}

/// Checks a clear-text password against a stored hash.
pub fn verify_password(stored: &str, plain: &str) -> bool {
    let encoded = match stored.strip_prefix(SSHA512_PREFIX) {
        Some(e) => e,
        None => return false,
    };
    let bytes = match hex::decode(encoded) {
        Ok(b) if b.len() > DIGEST_LEN => b,
        _ => return false,
    };
    hash_with_salt(plain, &bytes[DIGEST_LEN..]) == stored
}

fn hash_values(values: &mut [AttrValue]) -> Result<()> {
    for value in values.iter_mut() {
        if value.raw.starts_with(SSHA512_PREFIX) {
            continue;
        }
        if value.raw.is_empty() {
            return Err(DirError::InvalidCredential("empty password".into()));
        }
        *value = AttrValue::new(hash_password(&value.raw));
    }
    Ok(())
}

/// Replaces clear-text `userPassword` values with salted hashes, on add
/// (the entry) and on modify (the modifications).
pub struct PasswordHash;

impl Hook for PasswordHash {
    fn name(&self) -> &'static str {
        "password-hash"
    }

    fn invoke(
        &self,
        _dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if op.kind == OpKind::Add {
            let entry = require_entry(self.name(), entry)?;
            if let Some(pw) = entry.find_attr_mut(attr::USER_PASSWORD) {
                hash_values(&mut pw.values)?;
            }
            return Ok(());
        }
        for m in op.mods.iter_mut() {
            if m.op != ModOp::Delete && m.attr.name == attr::USER_PASSWORD {
                hash_values(&mut m.attr.values)?;
            }
        }
        Ok(())
    }
}

/// Clears the lockout record of an account whose password changed.
pub struct PasswordPostCommit;

impl Hook for PasswordPostCommit {
    fn name(&self) -> &'static str {
        "password-post-commit"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        _entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        if mods_touch(&op.mods, attr::USER_PASSWORD) && dir.lockout().remove(&op.norm_dn) {
            debug!(dn = %op.norm_dn, "lockout cleared after password change");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("s3cret!");
        assert!(stored.starts_with(SSHA512_PREFIX));
        assert_eq!(stored.len(), SSHA512_PREFIX.len() + 2 * (DIGEST_LEN + SALT_LEN));
        assert!(verify_password(&stored, "s3cret!"));
        assert!(!verify_password(&stored, "s3cret"));
        assert!(!verify_password("s3cret!", "s3cret!"));
        assert_ne!(stored, hash_password("s3cret!"));
    }

    #[test]
    fn test_already_hashed_values_kept() {
        let stored = hash_password("pw");
        let mut values = vec![AttrValue::new(stored.clone())];
        hash_values(&mut values).unwrap();
        assert_eq!(values[0].raw, stored);
        let mut empty = vec![AttrValue::new("")];
        assert!(matches!(
            hash_values(&mut empty),
            Err(DirError::InvalidCredential(_))
        ));
    }
}
