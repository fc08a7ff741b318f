//! Schema collaborator: attribute/class descriptors, value normalization and
//! entry/structure-rule checks.
//!
//! The middle layer only consumes the [`Schema`] trait. [`StaticSchema`] is an
//! in-process implementation seeded with the built-in directory schema and
//! extended at runtime when attributeSchema/classSchema entries are added.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::types::{attr, class};

/// Value syntax of an attribute type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Syntax {
    /// Case-insensitive directory string.
    CaseIgnore,
    /// Case-sensitive directory string.
    CaseExact,
    /// Signed integer.
    Integer,
    /// `TRUE` / `FALSE`.
    Boolean,
    /// Distinguished name.
    Dn,
    /// Generalized time.
    GeneralizedTime,
    /// Opaque octets, compared byte-wise.
    Octet,
}

impl Syntax {
    /// Parses a syntax keyword as found in attributeSchema entries.
    pub fn parse(s: &str) -> Option<Syntax> {
        match s.to_ascii_lowercase().as_str() {
            "caseignore" | "string" => Some(Syntax::CaseIgnore),
            "caseexact" => Some(Syntax::CaseExact),
            "integer" => Some(Syntax::Integer),
            "boolean" => Some(Syntax::Boolean),
            "dn" => Some(Syntax::Dn),
            "generalizedtime" => Some(Syntax::GeneralizedTime),
            "octet" | "octetstring" => Some(Syntax::Octet),
            _ => None,
        }
    }
}

/// Attribute type descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDescriptor {
    /// Lowercased attribute name.
    pub name: String,
    /// Value syntax.
    pub syntax: Syntax,
    /// At most one value allowed.
    pub single_valued: bool,
    /// Maintained by the server; clients may not modify it.
    pub no_user_modifiable: bool,
    /// Operational attributes are allowed on every entry regardless of class.
    pub operational: bool,
    /// Global uniqueness is enforced through a unique index.
    pub unique: bool,
}

impl AttrDescriptor {
    /// A multi-valued, case-ignore user attribute.
    pub fn user(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            syntax: Syntax::CaseIgnore,
            single_valued: false,
            no_user_modifiable: false,
            operational: false,
            unique: false,
        }
    }

    /// Sets the syntax.
    pub fn with_syntax(mut self, syntax: Syntax) -> Self {
        self.syntax = syntax;
        self
    }

    /// Marks the attribute single-valued.
    pub fn single(mut self) -> Self {
        self.single_valued = true;
        self
    }

    /// Marks the attribute as server-maintained operational.
    pub fn operational(mut self) -> Self {
        self.operational = true;
        self.no_user_modifiable = true;
        self
    }

    /// Marks the attribute as allowed everywhere but still client-writable.
    pub fn everywhere(mut self) -> Self {
        self.operational = true;
        self
    }

    /// Marks the attribute as globally unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Returns true for attributes stripped when an entry is tombstoned.
    pub fn is_user_application(&self) -> bool {
        !self.operational
    }
}

/// Object class kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassKind {
    /// Defines what an entry is; exactly one chain per entry.
    Structural,
    /// Only usable as a superclass.
    Abstract,
    /// Mix-in class.
    Auxiliary,
}

/// Object class descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    /// Lowercased class name.
    pub name: String,
    /// Class kind.
    pub kind: ClassKind,
    /// Superclass, if any.
    pub sup: Option<String>,
    /// Required attributes.
    pub must: Vec<String>,
    /// Optional attributes.
    pub may: Vec<String>,
    /// Classes allowed as the parent of an entry of this class. Empty means
    /// the entry may only be placed at the top of the tree.
    pub poss_superiors: Vec<String>,
}

impl ClassDescriptor {
    fn new(name: &str, kind: ClassKind, sup: Option<&str>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            kind,
            sup: sup.map(|s| s.to_ascii_lowercase()),
            must: Vec::new(),
            may: Vec::new(),
            poss_superiors: Vec::new(),
        }
    }

    fn must(mut self, attrs: &[&str]) -> Self {
        self.must.extend(attrs.iter().map(|a| a.to_ascii_lowercase()));
        self
    }

    fn may(mut self, attrs: &[&str]) -> Self {
        self.may.extend(attrs.iter().map(|a| a.to_ascii_lowercase()));
        self
    }

    fn under(mut self, parents: &[&str]) -> Self {
        self.poss_superiors
            .extend(parents.iter().map(|a| a.to_ascii_lowercase()));
        self
    }
}

/// Schema capability consumed by the operation pipeline.
pub trait Schema: Send + Sync {
    /// Resolves an attribute name to its descriptor.
    fn attr_desc(&self, name: &str) -> Result<Arc<AttrDescriptor>>;

    /// Looks up an object class.
    fn class_desc(&self, name: &str) -> Option<Arc<ClassDescriptor>>;

    /// Normalizes one value according to the attribute syntax.
    fn normalize_value(&self, desc: &AttrDescriptor, raw: &str) -> Result<String>;

    /// Validates an entry against its object classes.
    fn check_entry(&self, entry: &Entry) -> Result<()>;

    /// Checks that `entry` may be placed under `parent` (None = tree root).
    fn check_structure_rule(&self, entry: &Entry, parent: Option<&Entry>) -> Result<()>;

    /// Registers (or replaces) an attribute type.
    fn register_attribute(&self, desc: AttrDescriptor) -> Result<()>;

    /// Registers (or replaces) an object class.
    fn register_class(&self, desc: ClassDescriptor) -> Result<()>;

    /// Returns the most specific structural class of an entry.
    fn structural_class(&self, entry: &Entry) -> Option<String>;
}

/// In-memory schema guarded by `RwLock`s so live updates are visible to
/// concurrent operations.
pub struct StaticSchema {
    attrs: RwLock<HashMap<String, Arc<AttrDescriptor>>>,
    classes: RwLock<HashMap<String, Arc<ClassDescriptor>>>,
}

impl StaticSchema {
    /// Creates an empty schema.
    pub fn empty() -> Self {
        Self {
            attrs: RwLock::new(HashMap::new()),
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the built-in directory schema.
    pub fn bootstrap() -> Self {
        let schema = Self::empty();
        for desc in builtin_attributes() {
            schema.insert_attr(desc);
        }
        for desc in builtin_classes() {
            schema.insert_class(desc);
        }
        schema
    }

    fn insert_attr(&self, desc: AttrDescriptor) {
        let mut attrs = self.attrs.write().unwrap_or_else(|e| e.into_inner());
        attrs.insert(desc.name.clone(), Arc::new(desc));
    }

    fn insert_class(&self, desc: ClassDescriptor) {
        let mut classes = self.classes.write().unwrap_or_else(|e| e.into_inner());
        classes.insert(desc.name.clone(), Arc::new(desc));
    }

    /// Walks the superclass chain of `name`, most specific first.
    fn class_chain(&self, name: &str) -> Vec<Arc<ClassDescriptor>> {
        let classes = self.classes.read().unwrap_or_else(|e| e.into_inner());
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(name.to_ascii_lowercase());
        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                break;
            }
            match classes.get(&current) {
                Some(desc) => {
                    next = desc.sup.clone();
                    chain.push(desc.clone());
                }
                None => break,
            }
        }
        chain
    }

    /// Number of known attribute types.
    pub fn attribute_count(&self) -> usize {
        self.attrs.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for StaticSchema {
    fn default() -> Self {
        Self::bootstrap()
    }
}

impl Schema for StaticSchema {
    fn attr_desc(&self, name: &str) -> Result<Arc<AttrDescriptor>> {
        let attrs = self.attrs.read().unwrap_or_else(|e| e.into_inner());
        attrs
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DirError::UndefinedType(name.to_string()))
    }

    fn class_desc(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        let classes = self.classes.read().unwrap_or_else(|e| e.into_inner());
        classes.get(&name.to_ascii_lowercase()).cloned()
    }

    fn normalize_value(&self, desc: &AttrDescriptor, raw: &str) -> Result<String> {
        match desc.syntax {
            Syntax::CaseIgnore => Ok(raw
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()),
            Syntax::CaseExact => Ok(raw.trim().to_string()),
            Syntax::Integer => raw
                .trim()
                .parse::<i64>()
                .map(|v| v.to_string())
                .map_err(|_| {
                    DirError::InvalidSyntax(format!("{}: '{}' is not an integer", desc.name, raw))
                }),
            Syntax::Boolean => match raw.trim().to_ascii_uppercase().as_str() {
                "TRUE" => Ok("TRUE".to_string()),
                "FALSE" => Ok("FALSE".to_string()),
                _ => Err(DirError::InvalidSyntax(format!(
                    "{}: '{}' is not a boolean",
                    desc.name, raw
                ))),
            },
            Syntax::Dn => dn::normalize_dn(raw).map_err(|e| {
                DirError::InvalidSyntax(format!("{}: {}", desc.name, e))
            }),
            Syntax::GeneralizedTime => {
                if crate::types::parse_generalized_time(raw.trim()).is_none() {
                    return Err(DirError::InvalidSyntax(format!(
                        "{}: '{}' is not a generalized time",
                        desc.name, raw
                    )));
                }
                Ok(raw.trim().to_string())
            }
            Syntax::Octet => Ok(raw.to_string()),
        }
    }

    fn check_entry(&self, entry: &Entry) -> Result<()> {
        let classes = entry.object_classes();
        if classes.is_empty() {
            return Err(DirError::ObjectClassViolation(format!(
                "{}: missing objectClass",
                entry.dn
            )));
        }

        let mut must = HashSet::new();
        let mut allowed: HashSet<String> = HashSet::new();
        let mut has_structural = false;
        for oc in &classes {
            let chain = self.class_chain(oc);
            if chain.is_empty() {
                return Err(DirError::ObjectClassViolation(format!(
                    "{}: unknown object class {}",
                    entry.dn, oc
                )));
            }
            if chain[0].kind == ClassKind::Structural {
                has_structural = true;
            }
            for desc in chain {
                must.extend(desc.must.iter().cloned());
                allowed.extend(desc.must.iter().cloned());
                allowed.extend(desc.may.iter().cloned());
            }
        }
        if !has_structural {
            return Err(DirError::ObjectClassViolation(format!(
                "{}: no structural object class",
                entry.dn
            )));
        }

        for name in &must {
            if entry.find_attr(name).map_or(true, |a| a.values.is_empty()) {
                return Err(DirError::ObjectClassViolation(format!(
                    "{}: missing required attribute {}",
                    entry.dn, name
                )));
            }
        }

        for attribute in &entry.attrs {
            let desc = self.attr_desc(&attribute.name)?;
            if !desc.operational && !allowed.contains(&attribute.name) {
                return Err(DirError::ObjectClassViolation(format!(
                    "{}: attribute {} not allowed",
                    entry.dn, attribute.name
                )));
            }
            if desc.single_valued && attribute.values.len() > 1 {
                return Err(DirError::ConstraintViolation(format!(
                    "{}: single-valued attribute {} has {} values",
                    entry.dn,
                    attribute.name,
                    attribute.values.len()
                )));
            }
        }
        Ok(())
    }

    fn check_structure_rule(&self, entry: &Entry, parent: Option<&Entry>) -> Result<()> {
        let structural = self.structural_class(entry).ok_or_else(|| {
            DirError::ObjectClassViolation(format!("{}: no structural object class", entry.dn))
        })?;

        let mut allowed = HashSet::new();
        for desc in self.class_chain(&structural) {
            allowed.extend(desc.poss_superiors.iter().cloned());
        }

        match parent {
            None => {
                if allowed.is_empty() || structural == class::DOMAIN {
                    Ok(())
                } else {
                    Err(DirError::StructureViolation(format!(
                        "{} ({}) cannot be placed at the top of the tree",
                        entry.dn, structural
                    )))
                }
            }
            Some(parent) => {
                let fits = parent
                    .object_classes()
                    .iter()
                    .any(|oc| allowed.contains(oc));
                if fits {
                    Ok(())
                } else {
                    Err(DirError::StructureViolation(format!(
                        "{} ({}) not allowed under {}",
                        entry.dn, structural, parent.dn
                    )))
                }
            }
        }
    }

    fn register_attribute(&self, desc: AttrDescriptor) -> Result<()> {
        if desc.name.is_empty() || desc.name.contains(':') {
            return Err(DirError::InvalidSyntax(format!(
                "invalid attribute name '{}'",
                desc.name
            )));
        }
        self.insert_attr(desc);
        Ok(())
    }

    fn register_class(&self, desc: ClassDescriptor) -> Result<()> {
        if let Some(sup) = &desc.sup {
            if self.class_desc(sup).is_none() {
                return Err(DirError::ObjectClassViolation(format!(
                    "superclass {} of {} is undefined",
                    sup, desc.name
                )));
            }
        }
        for name in desc.must.iter().chain(desc.may.iter()) {
            self.attr_desc(name)?;
        }
        self.insert_class(desc);
        Ok(())
    }

    fn structural_class(&self, entry: &Entry) -> Option<String> {
        let mut best: Option<(usize, String)> = None;
        for oc in entry.object_classes() {
            let chain = self.class_chain(&oc);
            if chain.first().map(|c| c.kind) != Some(ClassKind::Structural) {
                continue;
            }
            let depth = chain.len();
            if best.as_ref().map_or(true, |(d, _)| depth > *d) {
                best = Some((depth, oc));
            }
        }
        best.map(|(_, name)| name)
    }
}

fn builtin_attributes() -> Vec<AttrDescriptor> {
    use Syntax::*;
    vec![
        AttrDescriptor::user(attr::OBJECT_CLASS).everywhere(),
        AttrDescriptor::user(attr::ENTRY_DN)
            .with_syntax(Dn)
            .single()
            .operational(),
        AttrDescriptor::user(attr::CN).single(),
        AttrDescriptor::user("dc").single(),
        AttrDescriptor::user("ou").single(),
        AttrDescriptor::user("sn"),
        AttrDescriptor::user("givenname"),
        AttrDescriptor::user("description"),
        AttrDescriptor::user("displayname").single(),
        AttrDescriptor::user("mail"),
        AttrDescriptor::user("dnshostname").single(),
        AttrDescriptor::user("telephonenumber"),
        AttrDescriptor::user("samaccountname").single().unique(),
        AttrDescriptor::user(attr::UPN).single().unique(),
        AttrDescriptor::user(attr::SPN).unique(),
        AttrDescriptor::user(attr::USER_PASSWORD)
            .with_syntax(Octet)
            .single(),
        AttrDescriptor::user(attr::MEMBER).with_syntax(Dn),
        AttrDescriptor::user(attr::MEMBER_OF)
            .with_syntax(Dn)
            .operational(),
        AttrDescriptor::user(attr::GROUP_TYPE)
            .with_syntax(Integer)
            .single(),
        AttrDescriptor::user(attr::USN_CREATED)
            .with_syntax(Integer)
            .single()
            .operational(),
        AttrDescriptor::user(attr::USN_CHANGED)
            .with_syntax(Integer)
            .single()
            .operational(),
        AttrDescriptor::user(attr::CREATE_TIMESTAMP)
            .with_syntax(GeneralizedTime)
            .single()
            .operational(),
        AttrDescriptor::user(attr::MODIFY_TIMESTAMP)
            .with_syntax(GeneralizedTime)
            .single()
            .operational(),
        AttrDescriptor::user(attr::CREATORS_NAME)
            .with_syntax(Dn)
            .single()
            .operational(),
        AttrDescriptor::user(attr::MODIFIERS_NAME)
            .with_syntax(Dn)
            .single()
            .operational(),
        AttrDescriptor::user(attr::OBJECT_GUID)
            .single()
            .operational()
            .unique(),
        AttrDescriptor::user(attr::OBJECT_SID)
            .single()
            .operational()
            .unique(),
        AttrDescriptor::user(attr::SECURITY_DESCRIPTOR)
            .with_syntax(CaseExact)
            .single()
            .everywhere(),
        AttrDescriptor::user(attr::ACL_STRING)
            .with_syntax(CaseExact)
            .single()
            .everywhere(),
        AttrDescriptor::user(attr::IS_DELETED)
            .with_syntax(Boolean)
            .single()
            .operational(),
        AttrDescriptor::user(attr::LAST_KNOWN_DN)
            .with_syntax(Dn)
            .single()
            .operational(),
        AttrDescriptor::user(attr::DOMAIN_FUNCTIONAL_LEVEL)
            .with_syntax(Integer)
            .single(),
        AttrDescriptor::user(attr::MAX_FAILED_ATTEMPTS)
            .with_syntax(Integer)
            .single(),
        AttrDescriptor::user(attr::LOCKOUT_DURATION)
            .with_syntax(Integer)
            .single(),
        AttrDescriptor::user(attr::FAILED_ATTEMPT_WINDOW)
            .with_syntax(Integer)
            .single(),
        AttrDescriptor::user(attr::FAILED_ATTEMPTS)
            .with_syntax(Integer)
            .single()
            .everywhere(),
        AttrDescriptor::user(attr::INDEX_ATTRIBUTE).single(),
        AttrDescriptor::user(attr::INDEX_UNIQUE)
            .with_syntax(Boolean)
            .single(),
        AttrDescriptor::user(attr::INDEX_STATE).single(),
        AttrDescriptor::user(attr::LDAP_DISPLAY_NAME).single(),
        AttrDescriptor::user(attr::ATTRIBUTE_SYNTAX).single(),
        AttrDescriptor::user(attr::IS_SINGLE_VALUED)
            .with_syntax(Boolean)
            .single(),
        AttrDescriptor::user(attr::MUST_CONTAIN),
        AttrDescriptor::user(attr::MAY_CONTAIN),
        AttrDescriptor::user(attr::POSS_SUPERIORS),
        AttrDescriptor::user("subclassof").single(),
        AttrDescriptor::user("objectclasscategory").single(),
        AttrDescriptor::user(attr::LABELED_URI).with_syntax(CaseExact).single(),
        AttrDescriptor::user(attr::LAST_LOCAL_USN_PROCESSED)
            .with_syntax(Integer)
            .single(),
        AttrDescriptor::user(attr::INVOCATION_ID).single(),
        AttrDescriptor::user(attr::SERVER_ID)
            .with_syntax(Integer)
            .single(),
        AttrDescriptor::user(attr::FSP_SID).single(),
        AttrDescriptor::user(attr::DC_ACCOUNT_PWD_REFRESH)
            .with_syntax(GeneralizedTime)
            .single()
            .everywhere(),
    ]
}

fn builtin_classes() -> Vec<ClassDescriptor> {
    use ClassKind::*;
    let dit_parents = [class::DOMAIN, class::OU, class::CONTAINER];
    vec![
        ClassDescriptor::new(class::TOP, Abstract, None).must(&[attr::OBJECT_CLASS]),
        ClassDescriptor::new(class::DOMAIN, Structural, Some(class::TOP))
            .must(&["dc"])
            .may(&[
                "description",
                attr::DOMAIN_FUNCTIONAL_LEVEL,
                attr::MAX_FAILED_ATTEMPTS,
                attr::LOCKOUT_DURATION,
                attr::FAILED_ATTEMPT_WINDOW,
            ])
            .under(&[class::DOMAIN]),
        ClassDescriptor::new(class::OU, Structural, Some(class::TOP))
            .must(&["ou"])
            .may(&["description"])
            .under(&dit_parents),
        ClassDescriptor::new(class::CONTAINER, Structural, Some(class::TOP))
            .must(&[attr::CN])
            .may(&["description"])
            .under(&dit_parents),
        ClassDescriptor::new("person", Abstract, Some(class::TOP))
            .must(&[attr::CN])
            .may(&[
                "sn",
                "givenname",
                "description",
                "displayname",
                "telephonenumber",
                attr::USER_PASSWORD,
            ]),
        ClassDescriptor::new(class::USER, Structural, Some("person"))
            .may(&["mail", "samaccountname", attr::UPN, attr::SPN])
            .under(&dit_parents),
        ClassDescriptor::new(class::COMPUTER, Structural, Some(class::USER))
            .may(&["dnshostname"])
            .under(&dit_parents),
        ClassDescriptor::new(class::GROUP, Structural, Some(class::TOP))
            .must(&[attr::CN])
            .may(&[
                attr::MEMBER,
                attr::GROUP_TYPE,
                "description",
                "samaccountname",
                "mail",
            ])
            .under(&dit_parents),
        ClassDescriptor::new(class::FSP, Structural, Some(class::TOP))
            .must(&[attr::CN])
            .may(&[attr::FSP_SID, "description"])
            .under(&[class::CONTAINER]),
        ClassDescriptor::new(class::REPL_AGREEMENT, Structural, Some(class::TOP))
            .must(&[attr::CN, attr::LABELED_URI])
            .may(&[attr::LAST_LOCAL_USN_PROCESSED, "description"])
            .under(&[class::CONTAINER, class::SERVER]),
        ClassDescriptor::new(class::SERVER, Structural, Some(class::TOP))
            .must(&[attr::CN])
            .may(&[attr::INVOCATION_ID, attr::SERVER_ID, "description"])
            .under(&[class::CONTAINER]),
        ClassDescriptor::new(class::ATTRIBUTE_SCHEMA, Structural, Some(class::TOP))
            .must(&[attr::CN, attr::LDAP_DISPLAY_NAME, attr::ATTRIBUTE_SYNTAX])
            .may(&[attr::IS_SINGLE_VALUED, "description"])
            .under(&[class::CONTAINER]),
        ClassDescriptor::new(class::CLASS_SCHEMA, Structural, Some(class::TOP))
            .must(&[attr::CN, attr::LDAP_DISPLAY_NAME])
            .may(&[
                attr::MUST_CONTAIN,
                attr::MAY_CONTAIN,
                attr::POSS_SUPERIORS,
                "subclassof",
                "objectclasscategory",
                "description",
            ])
            .under(&[class::CONTAINER]),
        ClassDescriptor::new(class::INDEX_CONFIG, Structural, Some(class::TOP))
            .must(&[attr::CN, attr::INDEX_ATTRIBUTE])
            .may(&[attr::INDEX_UNIQUE, attr::INDEX_STATE, "description"])
            .under(&[class::CONTAINER]),
        ClassDescriptor::new(class::DELETED_OBJECT, Auxiliary, Some(class::TOP))
            .may(&[attr::IS_DELETED, attr::LAST_KNOWN_DN]),
        ClassDescriptor::new(class::LOCKOUT_POLICY, Auxiliary, Some(class::TOP)).may(&[
            attr::MAX_FAILED_ATTEMPTS,
            attr::LOCKOUT_DURATION,
            attr::FAILED_ATTEMPT_WINDOW,
        ]),
    ]
}
