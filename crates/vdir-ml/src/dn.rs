//! Distinguished name helpers.
//!
//! DNs are handled as strings. Normalization lowercases attribute types and
//! values and strips insignificant whitespace around separators; escaped
//! commas (`\,`) are kept inside their RDN.

use crate::error::{DirError, Result};

/// Splits a DN into its RDN components, honoring `\,` escapes.
pub fn split_rdns(dn: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in dn.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                current.push(ch);
                escaped = true;
            }
            ',' => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() || !parts.is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Normalizes a DN for comparison and indexing.
pub fn normalize_dn(dn: &str) -> Result<String> {
    let trimmed = dn.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let mut out = Vec::new();
    for rdn in split_rdns(trimmed) {
        let (name, value) = rdn_to_name_value(&rdn)?;
        out.push(format!("{}={}", name, value.to_lowercase()));
    }
    Ok(out.join(","))
}

/// Returns the parent DN, or an empty string for a single-RDN DN.
pub fn parent_dn(dn: &str) -> String {
    let rdns = split_rdns(dn);
    if rdns.len() <= 1 {
        return String::new();
    }
    rdns[1..].join(",")
}

/// Returns the first RDN of a DN.
pub fn rdn(dn: &str) -> String {
    split_rdns(dn).into_iter().next().unwrap_or_default()
}

/// Splits `name=value` into a lowercased attribute name and the raw value.
pub fn rdn_to_name_value(rdn: &str) -> Result<(String, String)> {
    let (name, value) = rdn
        .split_once('=')
        .ok_or_else(|| DirError::InvalidDn(format!("RDN without '=': {}", rdn)))?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || value.is_empty() {
        return Err(DirError::InvalidDn(format!("empty RDN component: {}", rdn)));
    }
    Ok((name.to_lowercase(), value.to_string()))
}

/// Concatenates an RDN and a parent DN.
pub fn cat_dn(rdn: &str, parent: &str) -> String {
    if parent.is_empty() {
        rdn.to_string()
    } else if rdn.is_empty() {
        parent.to_string()
    } else {
        format!("{},{}", rdn, parent)
    }
}

/// Returns true if `dn` equals `base` or lies below it. Both must be normalized.
pub fn is_descendant_or_self(dn: &str, base: &str) -> bool {
    if base.is_empty() {
        return true;
    }
    dn == base || dn.ends_with(&format!(",{}", base))
}

/// Converts `dc=a,dc=b` into `a.b`.
pub fn domain_dn_to_name(dn: &str) -> String {
    split_rdns(dn)
        .iter()
        .filter_map(|r| rdn_to_name_value(r).ok())
        .filter(|(n, _)| n == "dc")
        .map(|(_, v)| v)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize_dn(" CN=User One , DC=Example,dc=COM").unwrap(),
            "cn=user one,dc=example,dc=com"
        );
        assert_eq!(normalize_dn("").unwrap(), "");
        assert!(normalize_dn("novalue").is_err());
        assert!(normalize_dn("cn=,dc=x").is_err());
    }

    #[test]
    fn test_escaped_comma() {
        let rdns = split_rdns("cn=Smith\\, John,dc=x");
        assert_eq!(rdns, vec!["cn=Smith\\, John".to_string(), "dc=x".to_string()]);
        assert_eq!(parent_dn("cn=Smith\\, John,dc=x"), "dc=x");
    }

    #[test]
    fn test_parent_and_rdn() {
        assert_eq!(parent_dn("cn=u1,dc=x"), "dc=x");
        assert_eq!(parent_dn("dc=x"), "");
        assert_eq!(rdn("cn=u1,dc=x"), "cn=u1");
        assert_eq!(cat_dn("cn=u1", "dc=x"), "cn=u1,dc=x");
        assert_eq!(cat_dn("dc=x", ""), "dc=x");
    }

    #[test]
    fn test_descendant() {
        assert!(is_descendant_or_self("cn=a,dc=x", "dc=x"));
        assert!(is_descendant_or_self("dc=x", "dc=x"));
        assert!(!is_descendant_or_self("cn=a,dc=xy", "dc=x"));
        assert!(is_descendant_or_self("cn=a", ""));
    }

    #[test]
    fn test_domain_name() {
        assert_eq!(domain_dn_to_name("dc=vsphere,dc=local"), "vsphere.local");
    }
}
