//! Search filter tree: parsing, string form, normalization and per-entry
//! evaluation.
//!
//! The string form is the usual parenthesized prefix notation, e.g.
//! `(&(objectClass=user)(|(cn=a*)(mail=*@x)))`. One-level scope is written
//! `(ONELEVEL=<parent dn>)`. `*`, `(`, `)` and `\` inside values are escaped
//! as `\2a`, `\28`, `\29` and `\5c`.

use std::cmp::Ordering;
use std::fmt;

use crate::backend::IndexProbe;
use crate::dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::memory_backend::{compare_values, substring_matches};
use crate::schema::Schema;
use crate::types::attr;

/// Pseudo attribute naming the one-level scope filter.
pub const ONELEVEL: &str = "onelevel";

/// A search filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// All children match.
    And(Vec<Filter>),
    /// At least one child matches.
    Or(Vec<Filter>),
    /// Child does not match.
    Not(Box<Filter>),
    /// Attribute has a value equal to `value`.
    Equality {
        /// Attribute name.
        attr: String,
        /// Assertion value.
        value: String,
    },
    /// Attribute has a value matching the pattern.
    Substring {
        /// Attribute name.
        attr: String,
        /// Required prefix.
        initial: Option<String>,
        /// Inner fragments, in order.
        any: Vec<String>,
        /// Required suffix.
        last: Option<String>,
    },
    /// Attribute has a value `>=` the assertion.
    GreaterOrEqual {
        /// Attribute name.
        attr: String,
        /// Assertion value.
        value: String,
    },
    /// Attribute has a value `<=` the assertion.
    LessOrEqual {
        /// Attribute name.
        attr: String,
        /// Assertion value.
        value: String,
    },
    /// Attribute is present.
    Present(String),
    /// Entry is a direct child of the given DN.
    OneLevel(String),
}

impl Filter {
    /// `(attr=value)`
    pub fn eq(attr: &str, value: &str) -> Self {
        Filter::Equality {
            attr: attr.to_ascii_lowercase(),
            value: value.to_string(),
        }
    }

    /// `(attr=*)`
    pub fn present(attr: &str) -> Self {
        Filter::Present(attr.to_ascii_lowercase())
    }

    /// `(attr>=value)`
    pub fn ge(attr: &str, value: &str) -> Self {
        Filter::GreaterOrEqual {
            attr: attr.to_ascii_lowercase(),
            value: value.to_string(),
        }
    }

    /// Parses the string form.
    pub fn parse(s: &str) -> Result<Filter> {
        let mut parser = Parser {
            input: s.trim().as_bytes(),
            pos: 0,
            src: s,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(filter)
    }

    /// Returns true for AND/OR nodes.
    pub fn is_composite(&self) -> bool {
        matches!(self, Filter::And(_) | Filter::Or(_))
    }

    /// Attribute a leaf filter tests, if any.
    pub fn attr(&self) -> Option<&str> {
        match self {
            Filter::Equality { attr, .. }
            | Filter::Substring { attr, .. }
            | Filter::GreaterOrEqual { attr, .. }
            | Filter::LessOrEqual { attr, .. }
            | Filter::Present(attr) => Some(attr),
            Filter::OneLevel(_) => Some(ONELEVEL),
            _ => None,
        }
    }

    /// Index probe answering a leaf filter, if one exists.
    pub fn probe(&self) -> Option<(&str, IndexProbe)> {
        match self {
            Filter::Equality { attr, value } => Some((attr, IndexProbe::Equal(value.clone()))),
            Filter::GreaterOrEqual { attr, value } => {
                Some((attr, IndexProbe::GreaterOrEqual(value.clone())))
            }
            Filter::LessOrEqual { attr, value } => {
                Some((attr, IndexProbe::LessOrEqual(value.clone())))
            }
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => Some((
                attr,
                IndexProbe::Substring {
                    initial: initial.clone(),
                    any: any.clone(),
                    last: last.clone(),
                },
            )),
            Filter::OneLevel(parent) => Some((attr::ENTRY_DN, IndexProbe::OneLevel(parent.clone()))),
            _ => None,
        }
    }

    /// Rewrites assertion values into their normalized form. Values of
    /// attribute types unknown to the schema are only lowercased.
    pub fn normalize(&mut self, schema: &dyn Schema) -> Result<()> {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                for child in children {
                    child.normalize(schema)?;
                }
            }
            Filter::Not(child) => child.normalize(schema)?,
            Filter::Equality { attr, value }
            | Filter::GreaterOrEqual { attr, value }
            | Filter::LessOrEqual { attr, value } => {
                *value = normalize_assertion(schema, attr, value)?;
            }
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                // Fragments keep their internal spacing; only case folds.
                let fold = |v: &mut String| *v = fold_fragment(schema, attr, v);
                initial.iter_mut().for_each(fold);
                any.iter_mut().for_each(fold);
                last.iter_mut().for_each(fold);
            }
            Filter::OneLevel(parent) => {
                *parent = dn::normalize_dn(parent)?;
            }
            Filter::Present(_) => {}
        }
        Ok(())
    }

    /// Evaluates the filter against an entry. Assertion values must be
    /// normalized.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|c| c.matches(entry)),
            Filter::Or(children) => children.iter().any(|c| c.matches(entry)),
            Filter::Not(child) => !child.matches(entry),
            Filter::Present(name) => {
                name == attr::ENTRY_DN || entry.find_attr(name).map_or(false, |a| !a.values.is_empty())
            }
            Filter::OneLevel(parent) => entry.parent_dn == *parent,
            Filter::Equality { attr, value } => {
                values_for(entry, attr).iter().any(|v| v == value)
            }
            Filter::GreaterOrEqual { attr, value } => values_for(entry, attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Less),
            Filter::LessOrEqual { attr, value } => values_for(entry, attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Greater),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => values_for(entry, attr)
                .iter()
                .any(|v| substring_matches(v, initial, any, last)),
        }
    }
}

fn normalize_assertion(schema: &dyn Schema, attr: &str, value: &str) -> Result<String> {
    if attr == attr::ENTRY_DN {
        return dn::normalize_dn(value);
    }
    match schema.attr_desc(attr) {
        Ok(desc) => schema.normalize_value(&desc, value),
        Err(DirError::UndefinedType(_)) => Ok(value.to_lowercase()),
        Err(e) => Err(e),
    }
}

fn fold_fragment(schema: &dyn Schema, attr: &str, fragment: &str) -> String {
    use crate::schema::Syntax;
    match schema.attr_desc(attr).map(|d| d.syntax) {
        Ok(Syntax::CaseExact) | Ok(Syntax::Octet) => fragment.to_string(),
        _ => fragment.to_lowercase(),
    }
}

fn values_for(entry: &Entry, name: &str) -> Vec<String> {
    if name == attr::ENTRY_DN {
        return vec![entry.norm_dn.clone()];
    }
    entry
        .find_attr(name)
        .map(|a| {
            a.values
                .iter()
                .map(|v| match &v.norm {
                    Some(norm) => norm.clone(),
                    None => v.raw.to_lowercase(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            _ => out.push(ch),
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                write!(f, "(&")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::Equality { attr, value } => write!(f, "({}={})", attr, escape(value)),
            Filter::GreaterOrEqual { attr, value } => write!(f, "({}>={})", attr, escape(value)),
            Filter::LessOrEqual { attr, value } => write!(f, "({}<={})", attr, escape(value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::OneLevel(parent) => write!(f, "(ONELEVEL={})", escape(parent)),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(i) = initial {
                    write!(f, "{}", escape(i))?;
                }
                write!(f, "*")?;
                for a in any {
                    write!(f, "{}*", escape(a))?;
                }
                if let Some(l) = last {
                    write!(f, "{}", escape(l))?;
                }
                write!(f, ")")
            }
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, what: &str) -> DirError {
        DirError::InvalidFilter(format!("{} at offset {} in '{}'", what, self.pos, self.src))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, ch: u8) -> Result<()> {
        if self.peek() == Some(ch) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", ch as char)))
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>> {
        let mut children = Vec::new();
        while self.peek() == Some(b'(') {
            children.push(self.filter()?);
        }
        if children.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(children)
    }

    fn item(&mut self) -> Result<Filter> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if matches!(ch, b'=' | b'>' | b'<' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.error("attribute is not UTF-8"))?
            .trim()
            .to_ascii_lowercase();
        if name.is_empty() {
            return Err(self.error("missing attribute"));
        }
        let kind = match self.peek() {
            Some(b'>') => {
                self.pos += 1;
                self.expect(b'=')?;
                b'>'
            }
            Some(b'<') => {
                self.pos += 1;
                self.expect(b'=')?;
                b'<'
            }
            Some(b'=') => {
                self.pos += 1;
                b'='
            }
            _ => return Err(self.error("expected operator")),
        };

        let raw_start = self.pos;
        while let Some(ch) = self.peek() {
            if ch == b')' {
                break;
            }
            if ch == b'(' {
                return Err(self.error("unescaped '(' in value"));
            }
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.input[raw_start..self.pos])
            .map_err(|_| self.error("value is not UTF-8"))?;

        match kind {
            b'>' => Ok(Filter::GreaterOrEqual {
                attr: name,
                value: self.unescape(raw)?,
            }),
            b'<' => Ok(Filter::LessOrEqual {
                attr: name,
                value: self.unescape(raw)?,
            }),
            _ if name == ONELEVEL => Ok(Filter::OneLevel(self.unescape(raw)?)),
            _ if raw == "*" => Ok(Filter::Present(name)),
            _ if raw.contains('*') => {
                let parts: Vec<&str> = raw.split('*').collect();
                let initial = Some(parts[0]).filter(|p| !p.is_empty());
                let last = parts.last().copied().filter(|p| !p.is_empty());
                let any = parts[1..parts.len() - 1]
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| self.unescape(p))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Filter::Substring {
                    attr: name,
                    initial: initial.map(|p| self.unescape(p)).transpose()?,
                    any,
                    last: last.map(|p| self.unescape(p)).transpose()?,
                })
            }
            _ => Ok(Filter::Equality {
                attr: name,
                value: self.unescape(raw)?,
            }),
        }
    }

    fn unescape(&self, raw: &str) -> Result<String> {
        let bytes = raw.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                let hex = raw
                    .get(i + 1..i + 3)
                    .ok_or_else(|| self.error("truncated escape"))?;
                let byte =
                    u8::from_str_radix(hex, 16).map_err(|_| self.error("bad escape"))?;
                out.push(byte);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).map_err(|_| self.error("escaped value is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StaticSchema;

    #[test]
    fn test_parse_and_display() {
        let s = "(&(objectclass=user)(|(cn=a*b*c)(mail=*@x))(!(cn=z))(usnchanged>=5))";
        let f = Filter::parse(s).unwrap();
        assert_eq!(f.to_string(), s);
        match &f {
            Filter::And(children) => assert_eq!(children.len(), 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_special_forms() {
        assert_eq!(Filter::parse("(cn=*)").unwrap(), Filter::present("cn"));
        assert_eq!(
            Filter::parse("(ONELEVEL=dc=x)").unwrap(),
            Filter::OneLevel("dc=x".into())
        );
        let f = Filter::parse("(cn=a\\2ab)").unwrap();
        assert_eq!(f, Filter::eq("cn", "a*b"));
        assert_eq!(f.to_string(), "(cn=a\\2ab)");
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "cn=a", "(cn=a", "(&)", "(=a)", "(cn~a)", "(cn=a)(cn=b)", "(cn=\\zz)"] {
            assert!(
                matches!(Filter::parse(bad), Err(DirError::InvalidFilter(_))),
                "{} should fail",
                bad
            );
        }
    }

    #[test]
    fn test_matches_after_normalize() {
        let schema = StaticSchema::bootstrap();
        let mut entry = Entry::new("cn=U1,dc=x");
        entry.add_values(attr::OBJECT_CLASS, &["top", "user"]);
        entry.add_values("cn", &["U1"]);
        entry.add_values(attr::USN_CHANGED, &["12"]);
        entry.normalize(&schema).unwrap();

        let mut f = Filter::parse("(&(CN=u1)(usnChanged>=9)(!(mail=*))(ONELEVEL=DC=X))").unwrap();
        f.normalize(&schema).unwrap();
        assert!(f.matches(&entry));

        let mut g = Filter::parse("(usnchanged<=9)").unwrap();
        g.normalize(&schema).unwrap();
        assert!(!g.matches(&entry));

        let mut h = Filter::parse("(entrydn=*,dc=x)").unwrap();
        h.normalize(&schema).unwrap();
        assert!(h.matches(&entry));
    }
}
