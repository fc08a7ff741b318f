//! Access checks and security-descriptor helpers.
//!
//! Security descriptors are handled in their SDDL-like string form
//! `O:<owner>G:<group>D:<dacl>`; only the structure is validated here.

use std::collections::HashSet;

use crate::dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::types::attr;

/// Access right flags.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AccessRight(pub u32);

impl AccessRight {
    /// Read attributes.
    pub const READ: AccessRight = AccessRight(1);
    /// Write attributes.
    pub const WRITE: AccessRight = AccessRight(2);
    /// Create a child entry.
    pub const CREATE_CHILD: AccessRight = AccessRight(4);
    /// Delete the entry.
    pub const DELETE: AccessRight = AccessRight(8);

    /// Checks if this right includes `other`.
    pub fn contains(&self, other: AccessRight) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Identity the operation runs as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindInfo {
    /// Normalized bind DN, empty for anonymous.
    pub dn: String,
    /// The bind attempt failed.
    pub auth_failed: bool,
    /// Server-internal identity that bypasses access checks.
    pub system: bool,
}

impl BindInfo {
    /// The server itself.
    pub fn system() -> Self {
        Self {
            dn: String::from("cn=system"),
            auth_failed: false,
            system: true,
        }
    }

    /// An anonymous connection.
    pub fn anonymous() -> Self {
        Self {
            dn: String::new(),
            auth_failed: false,
            system: false,
        }
    }

    /// A successfully bound user.
    pub fn user(bind_dn: &str) -> Self {
        Self {
            dn: dn::normalize_dn(bind_dn).unwrap_or_else(|_| bind_dn.to_ascii_lowercase()),
            auth_failed: false,
            system: false,
        }
    }

    /// A connection whose bind was rejected.
    pub fn failed(bind_dn: &str) -> Self {
        Self {
            auth_failed: true,
            ..Self::user(bind_dn)
        }
    }

    /// Returns true when the caller is bound and authenticated.
    pub fn is_bound(&self) -> bool {
        self.system || (!self.dn.is_empty() && !self.auth_failed)
    }
}

/// Access-control capability consumed by the pipelines.
pub trait AccessChecker: Send + Sync {
    /// Fails with an access error unless `bind` holds `right` on `entry`.
    fn check(&self, bind: &BindInfo, entry: &Entry, right: AccessRight) -> Result<()>;

    /// Returns true for administrators.
    fn is_admin(&self, bind: &BindInfo) -> bool;
}

/// Admins may do anything; other bound users may read everything and write
/// their own entry.
pub struct DefaultAccessChecker {
    admins: HashSet<String>,
}

impl DefaultAccessChecker {
    /// Creates a checker for the given (normalized) admin DNs.
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            admins: admins
                .into_iter()
                .map(|d| dn::normalize_dn(d.as_ref()).unwrap_or_else(|_| d.as_ref().to_string()))
                .collect(),
        }
    }
}

impl AccessChecker for DefaultAccessChecker {
    fn check(&self, bind: &BindInfo, entry: &Entry, right: AccessRight) -> Result<()> {
        if !bind.is_bound() {
            return Err(DirError::NotBound);
        }
        if self.is_admin(bind) || right == AccessRight::READ {
            return Ok(());
        }
        if right == AccessRight::WRITE && bind.dn == entry.norm_dn {
            return Ok(());
        }
        Err(DirError::InsufficientAccess(format!(
            "{} lacks right {:#x} on {}",
            bind.dn, right.0, entry.norm_dn
        )))
    }

    fn is_admin(&self, bind: &BindInfo) -> bool {
        bind.system || (bind.is_bound() && self.admins.contains(&bind.dn))
    }
}

/// Default DACL granted when nothing can be inherited.
pub const DEFAULT_DACL: &str = "(A;;RPWP;;;BA)";

/// Splits a descriptor into owner, group and DACL parts.
pub fn parse_security_descriptor(sd: &str) -> Result<(&str, &str, &str)> {
    let bad = || DirError::ConstraintViolation(format!("malformed security descriptor '{}'", sd));
    let rest = sd.strip_prefix("O:").ok_or_else(bad)?;
    let g = rest.find("G:").ok_or_else(bad)?;
    let owner = &rest[..g];
    let rest = &rest[g + 2..];
    let d = rest.find("D:").ok_or_else(bad)?;
    let group = &rest[..d];
    let dacl = &rest[d + 2..];
    if owner.is_empty() || group.is_empty() {
        return Err(bad());
    }
    Ok((owner, group, dacl))
}

/// Validates a descriptor string.
pub fn validate_security_descriptor(sd: &str) -> Result<()> {
    parse_security_descriptor(sd).map(|_| ())
}

/// Builds a descriptor from an ACL string.
pub fn acl_string_to_sd(acl: &str, owner: &str) -> String {
    format!("O:{}G:BAD:{}", owner, acl.trim())
}

/// Computes the descriptor for a new entry: an explicit descriptor is kept,
/// an ACL string is mapped, and otherwise the parent's DACL is inherited.
pub fn compute_security_descriptor(entry: &Entry, parent: Option<&Entry>, owner: &str) -> Result<String> {
    if let Some(sd) = entry.get_single(attr::SECURITY_DESCRIPTOR) {
        validate_security_descriptor(sd)?;
        return Ok(sd.to_string());
    }
    if let Some(acl) = entry.get_single(attr::ACL_STRING) {
        return Ok(acl_string_to_sd(acl, owner));
    }
    let dacl = parent
        .and_then(|p| p.get_single(attr::SECURITY_DESCRIPTOR))
        .and_then(|sd| parse_security_descriptor(sd).ok())
        .map(|(_, _, dacl)| dacl.to_string())
        .unwrap_or_else(|| DEFAULT_DACL.to_string());
    Ok(format!("O:{}G:BAD:{}", owner, dacl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_states() {
        assert!(BindInfo::system().is_bound());
        assert!(!BindInfo::anonymous().is_bound());
        assert!(!BindInfo::failed("cn=a,dc=x").is_bound());
        assert!(BindInfo::user("CN=A,DC=X").is_bound());
        assert_eq!(BindInfo::user("CN=A,DC=X").dn, "cn=a,dc=x");
    }

    #[test]
    fn test_default_checker() {
        let checker = DefaultAccessChecker::new(["CN=Admin,DC=X"]);
        let admin = BindInfo::user("cn=admin,dc=x");
        let user = BindInfo::user("cn=u1,dc=x");
        let own = Entry::new("cn=u1,dc=x");
        let other = Entry::new("cn=u2,dc=x");

        assert!(checker.is_admin(&admin));
        assert!(checker.check(&admin, &other, AccessRight::DELETE).is_ok());
        assert!(checker.check(&user, &other, AccessRight::READ).is_ok());
        assert!(checker.check(&user, &own, AccessRight::WRITE).is_ok());
        assert!(matches!(
            checker.check(&user, &other, AccessRight::WRITE),
            Err(DirError::InsufficientAccess(_))
        ));
        assert!(matches!(
            checker.check(&BindInfo::anonymous(), &other, AccessRight::READ),
            Err(DirError::NotBound)
        ));
    }

    #[test]
    fn test_security_descriptor_parsing() {
        let (o, g, d) = parse_security_descriptor("O:BAG:BAD:(A;;RP;;;WD)").unwrap();
        assert_eq!((o, g, d), ("BA", "BA", "(A;;RP;;;WD)"));
        assert!(validate_security_descriptor("G:BAD:").is_err());
        assert!(validate_security_descriptor("O:G:BAD:").is_err());
    }

    #[test]
    fn test_compute_inherits_parent_dacl() {
        let mut parent = Entry::new("dc=x");
        parent.set_single(attr::SECURITY_DESCRIPTOR, "O:BAG:BAD:(A;;GA;;;DA)");
        let child = Entry::new("cn=c,dc=x");
        assert_eq!(
            compute_security_descriptor(&child, Some(&parent), "BA").unwrap(),
            "O:BAG:BAD:(A;;GA;;;DA)"
        );
        let mut with_acl = Entry::new("cn=c,dc=x");
        with_acl.set_single(attr::ACL_STRING, "(A;;RP;;;AU)");
        assert_eq!(
            compute_security_descriptor(&with_acl, None, "BA").unwrap(),
            "O:BAG:BAD:(A;;RP;;;AU)"
        );
    }
}
