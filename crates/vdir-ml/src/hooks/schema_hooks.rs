//! Live schema updates from `attributeSchema` and `classSchema` entries.

use tracing::info;

use super::{require_entry, Stage};
use crate::dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::ops::Operation;
use crate::plugin::Hook;
use crate::schema::{AttrDescriptor, ClassDescriptor, ClassKind, Schema, Syntax};
use crate::service::DirectoryService;
use crate::types::{attr, class, OpKind};

fn display_name(entry: &Entry) -> Result<String> {
    entry
        .get_single(attr::LDAP_DISPLAY_NAME)
        .map(|n| n.trim().to_ascii_lowercase())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            DirError::ObjectClassViolation(format!("{}: missing lDAPDisplayName", entry.dn))
        })
}

fn lowered(entry: &Entry, name: &str) -> Vec<String> {
    entry
        .values_of(name)
        .into_iter()
        .map(|v| v.trim().to_ascii_lowercase())
        .collect()
}

/// Builds the attribute type an `attributeSchema` entry defines.
pub fn attr_descriptor_from_entry(entry: &Entry) -> Result<AttrDescriptor> {
    let name = display_name(entry)?;
    let raw_syntax = entry.get_single(attr::ATTRIBUTE_SYNTAX).unwrap_or_default();
    let syntax = Syntax::parse(raw_syntax.trim()).ok_or_else(|| {
        DirError::InvalidSyntax(format!("unknown attribute syntax '{}'", raw_syntax))
    })?;
    let mut desc = AttrDescriptor::user(&name).with_syntax(syntax);
    if entry
        .get_single(attr::IS_SINGLE_VALUED)
        .map_or(false, |v| v.eq_ignore_ascii_case("true"))
    {
        desc = desc.single();
    }
    Ok(desc)
}

/// Builds the object class a `classSchema` entry defines.
pub fn class_descriptor_from_entry(entry: &Entry) -> Result<ClassDescriptor> {
    let name = display_name(entry)?;
    let kind = match entry.get_single("objectclasscategory").map(str::trim) {
        None | Some("1") => ClassKind::Structural,
        Some("2") => ClassKind::Abstract,
        Some("3") => ClassKind::Auxiliary,
        Some(other) => {
            return Err(DirError::ConstraintViolation(format!(
                "invalid objectClassCategory '{}'",
                other
            )))
        }
    };
    let sup = entry
        .get_single("subclassof")
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_else(|| class::TOP.to_string());
    Ok(ClassDescriptor {
        name,
        kind,
        sup: Some(sup),
        must: lowered(entry, attr::MUST_CONTAIN),
        may: lowered(entry, attr::MAY_CONTAIN),
        poss_superiors: lowered(entry, attr::POSS_SUPERIORS),
    })
}

enum SchemaDef {
    Attr(AttrDescriptor),
    Class(ClassDescriptor),
}

fn definition(entry: &Entry) -> Result<Option<SchemaDef>> {
    if entry.has_class(class::ATTRIBUTE_SCHEMA) {
        attr_descriptor_from_entry(entry).map(|d| Some(SchemaDef::Attr(d)))
    } else if entry.has_class(class::CLASS_SCHEMA) {
        class_descriptor_from_entry(entry).map(|d| Some(SchemaDef::Class(d)))
    } else {
        Ok(None)
    }
}

/// Checks placement and uniqueness of new schema entries.
pub struct SchemaEntryCheck;

impl Hook for SchemaEntryCheck {
    fn name(&self) -> &'static str {
        "schema-entry"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        _op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let entry = require_entry(self.name(), entry)?;
        let def = match definition(entry)? {
            Some(def) => def,
            None => return Ok(()),
        };
        let schema_dn = dn::normalize_dn(&dir.config().schema_dn())?;
        if dn::normalize_dn(&dn::parent_dn(&entry.dn))? != schema_dn {
            return Err(DirError::UnwillingToPerform(format!(
                "schema entry {} must be placed directly under {}",
                entry.dn, schema_dn
            )));
        }
        let taken = match &def {
            SchemaDef::Attr(d) => dir.schema().attr_desc(&d.name).is_ok().then(|| d.name.clone()),
            SchemaDef::Class(d) => dir.schema().class_desc(&d.name).map(|_| d.name.clone()),
        };
        match taken {
            Some(name) => Err(DirError::UnwillingToPerform(format!("{} is already defined", name))),
            None => Ok(()),
        }
    }
}

/// Validates schema entries against the live schema before commit and
/// registers them after commit.
pub struct SchemaLibUpdate(pub Stage);

impl SchemaLibUpdate {
    fn check_modify(schema: &dyn Schema, def: &SchemaDef) -> Result<()> {
        if let SchemaDef::Attr(d) = def {
            if let Ok(existing) = schema.attr_desc(&d.name) {
                if existing.syntax != d.syntax {
                    return Err(DirError::UnwillingToPerform(format!(
                        "syntax of {} cannot change",
                        d.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_references(schema: &dyn Schema, def: &SchemaDef) -> Result<()> {
        let class = match def {
            SchemaDef::Class(c) => c,
            SchemaDef::Attr(_) => return Ok(()),
        };
        if let Some(sup) = &class.sup {
            if schema.class_desc(sup).is_none() {
                return Err(DirError::ObjectClassViolation(format!(
                    "superclass {} of {} is undefined",
                    sup, class.name
                )));
            }
        }
        for name in class.must.iter().chain(class.may.iter()) {
            schema.attr_desc(name)?;
        }
        for parent in &class.poss_superiors {
            if schema.class_desc(parent).is_none() {
                return Err(DirError::ObjectClassViolation(format!(
                    "possible superior {} of {} is undefined",
                    parent, class.name
                )));
            }
        }
        Ok(())
    }
}

impl Hook for SchemaLibUpdate {
    fn name(&self) -> &'static str {
        "schema-lib-update"
    }

    fn invoke(
        &self,
        dir: &DirectoryService,
        op: &mut Operation,
        entry: Option<&mut Entry>,
        _prior: Option<&DirError>,
    ) -> Result<()> {
        let entry = require_entry(self.name(), entry)?;
        let def = match definition(entry)? {
            Some(def) => def,
            None => return Ok(()),
        };
        let schema = dir.schema();
        match self.0 {
            Stage::Pre => {
                if op.kind == OpKind::Modify {
                    Self::check_modify(schema, &def)?;
                }
                Self::check_references(schema, &def)
            }
            Stage::Post => match def {
                SchemaDef::Attr(d) => {
                    info!(attr = %d.name, syntax = ?d.syntax, "attribute type registered");
                    schema.register_attribute(d)
                }
                SchemaDef::Class(c) => {
                    info!(class = %c.name, kind = ?c.kind, "object class registered");
                    schema.register_class(c)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute_schema(name: &str, syntax: &str) -> Entry {
        let mut e = Entry::new(&format!("cn={},cn=schema,cn=configuration,dc=x", name));
        e.add_values(attr::OBJECT_CLASS, &["top", "attributeschema"]);
        e.add_values(attr::CN, &[name]);
        e.add_values(attr::LDAP_DISPLAY_NAME, &[name]);
        e.add_values(attr::ATTRIBUTE_SYNTAX, &[syntax]);
        e
    }

    #[test]
    fn test_attr_descriptor_from_entry() {
        let mut e = attribute_schema("vmwFavoriteColor", "caseignore");
        e.add_values(attr::IS_SINGLE_VALUED, &["TRUE"]);
        let d = attr_descriptor_from_entry(&e).unwrap();
        assert_eq!(d.name, "vmwfavoritecolor");
        assert_eq!(d.syntax, Syntax::CaseIgnore);
        assert!(d.single_valued);
        assert!(d.is_user_application());

        let bad = attribute_schema("x", "blob");
        assert!(matches!(
            attr_descriptor_from_entry(&bad),
            Err(DirError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_class_descriptor_from_entry() {
        let mut e = Entry::new("cn=vmwWidget,cn=schema,cn=configuration,dc=x");
        e.add_values(attr::OBJECT_CLASS, &["top", "classschema"]);
        e.add_values(attr::LDAP_DISPLAY_NAME, &["vmwWidget"]);
        e.add_values("objectclasscategory", &["3"]);
        e.add_values(attr::MAY_CONTAIN, &["Description"]);
        let c = class_descriptor_from_entry(&e).unwrap();
        assert_eq!(c.name, "vmwwidget");
        assert_eq!(c.kind, ClassKind::Auxiliary);
        assert_eq!(c.sup.as_deref(), Some("top"));
        assert_eq!(c.may, vec!["description"]);
        assert!(c.must.is_empty());
    }
}
