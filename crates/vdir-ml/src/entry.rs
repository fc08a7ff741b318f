//! In-memory entry, attribute and modification model.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dn;
use crate::error::{DirError, Result};
use crate::metadata::{AttrMetadata, ValueMetadata};
use crate::schema::{AttrDescriptor, Schema};
use crate::types::{attr, EntryId};

/// One attribute value with its cached normalized form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrValue {
    /// Value as supplied.
    pub raw: String,
    /// Normalized value, filled by schema normalization.
    pub norm: Option<String>,
}

impl AttrValue {
    /// Creates a value that has not been normalized yet.
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            norm: None,
        }
    }

    /// Returns the normalized form, falling back to the raw bytes.
    pub fn norm_or_raw(&self) -> &str {
        self.norm.as_deref().unwrap_or(&self.raw)
    }
}

/// A typed, multi-valued attribute.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Attribute {
    /// Lowercased attribute type name.
    pub name: String,
    /// Schema descriptor, resolved on first normalization.
    #[serde(skip)]
    pub descriptor: Option<Arc<AttrDescriptor>>,
    /// Ordered values.
    pub values: Vec<AttrValue>,
    /// Attribute-level replication metadata.
    pub metadata: Option<AttrMetadata>,
    /// Per-value metadata to record with the next backend write.
    #[serde(skip)]
    pub value_meta_to_add: VecDeque<ValueMetadata>,
    /// Stored per-value metadata superseded by the next backend write.
    #[serde(skip)]
    pub value_meta_to_delete: VecDeque<ValueMetadata>,
}

impl Attribute {
    /// Creates an attribute from raw values.
    pub fn new<S: AsRef<str>>(name: &str, values: &[S]) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            values: values.iter().map(|v| AttrValue::new(v.as_ref())).collect(),
            ..Default::default()
        }
    }

    /// Creates an attribute without values.
    pub fn empty(name: &str) -> Self {
        Self::new::<&str>(name, &[])
    }

    /// Resolves the descriptor (cached) and fills in normalized values.
    pub fn normalize(&mut self, schema: &dyn Schema) -> Result<()> {
        let desc = match &self.descriptor {
            Some(d) => d.clone(),
            None => {
                let d = schema.attr_desc(&self.name)?;
                self.descriptor = Some(d.clone());
                d
            }
        };
        for value in &mut self.values {
            if value.norm.is_none() {
                value.norm = Some(schema.normalize_value(&desc, &value.raw)?);
            }
        }
        Ok(())
    }

    /// Fails if two values normalize to the same bytes.
    pub fn check_duplicates(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for value in &self.values {
            if !seen.insert(value.norm_or_raw()) {
                return Err(DirError::TypeOrValueExists {
                    attr: self.name.clone(),
                    value: value.raw.clone(),
                });
            }
        }
        Ok(())
    }

    /// Position of the value whose normalized form equals `norm`.
    pub fn position_of(&self, norm: &str) -> Option<usize> {
        self.values.iter().position(|v| v.norm_or_raw() == norm)
    }

    /// Returns true if a value normalizes to `norm`.
    pub fn has_value(&self, norm: &str) -> bool {
        self.position_of(norm).is_some()
    }

    /// First raw value, if any.
    pub fn first(&self) -> Option<&str> {
        self.values.first().map(|v| v.raw.as_str())
    }

    /// Returns true for multi-valued attribute types. Unresolved descriptors
    /// count as multi-valued.
    pub fn is_multi_valued(&self) -> bool {
        self.descriptor.as_ref().map_or(true, |d| !d.single_valued)
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.values == other.values && self.metadata == other.metadata
    }
}

/// A directory object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Entry {
    /// DN as supplied.
    pub dn: String,
    /// Normalized DN.
    pub norm_dn: String,
    /// Normalized parent DN (empty at the top of the tree).
    pub parent_dn: String,
    /// Normalized new parent DN during a rename.
    #[serde(skip)]
    pub new_parent_dn: Option<String>,
    /// Backend identifier, once stored.
    pub id: Option<EntryId>,
    /// Stored attributes, in insertion order.
    pub attrs: Vec<Attribute>,
    /// Attributes synthesized at read time, never persisted.
    #[serde(skip)]
    pub computed: Vec<Attribute>,
    /// Parent entry read during the operation.
    #[serde(skip)]
    pub parent: Option<Box<Entry>>,
    /// Set when a modification changed the DN.
    #[serde(skip)]
    pub dn_modified: bool,
}

impl Entry {
    /// Creates an empty entry with the given DN.
    pub fn new(dn: &str) -> Self {
        let norm = dn::normalize_dn(dn).unwrap_or_else(|_| dn.to_ascii_lowercase());
        Self {
            dn: dn.to_string(),
            parent_dn: dn::parent_dn(&norm),
            norm_dn: norm,
            ..Default::default()
        }
    }

    /// Normalizes the DN, failing on bad syntax.
    pub fn normalize_dn(&mut self) -> Result<()> {
        self.norm_dn = dn::normalize_dn(&self.dn)?;
        self.parent_dn = dn::parent_dn(&self.norm_dn);
        Ok(())
    }

    /// Normalizes every attribute.
    pub fn normalize(&mut self, schema: &dyn Schema) -> Result<()> {
        for attribute in &mut self.attrs {
            attribute.normalize(schema)?;
        }
        Ok(())
    }

    /// Fails if any attribute holds duplicate normalized values.
    pub fn check_duplicates(&self) -> Result<()> {
        for attribute in &self.attrs {
            attribute.check_duplicates()?;
        }
        Ok(())
    }

    /// Finds an attribute (case-insensitive).
    pub fn find_attr(&self, name: &str) -> Option<&Attribute> {
        let name = name.to_ascii_lowercase();
        self.attrs
            .iter()
            .chain(self.computed.iter())
            .find(|a| a.name == name)
    }

    /// Finds a stored attribute for mutation.
    pub fn find_attr_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        let name = name.to_ascii_lowercase();
        self.attrs.iter_mut().find(|a| a.name == name)
    }

    /// Appends values, creating the attribute if needed.
    pub fn add_values<S: AsRef<str>>(&mut self, name: &str, values: &[S]) {
        match self.find_attr_mut(name) {
            Some(existing) => existing
                .values
                .extend(values.iter().map(|v| AttrValue::new(v.as_ref()))),
            None => self.attrs.push(Attribute::new(name, values)),
        }
    }

    /// Adds a whole attribute, merging values into an existing one.
    pub fn add_attribute(&mut self, attribute: Attribute) {
        match self.find_attr_mut(&attribute.name) {
            Some(existing) => {
                existing.values.extend(attribute.values);
                if attribute.metadata.is_some() {
                    existing.metadata = attribute.metadata;
                }
            }
            None => self.attrs.push(attribute),
        }
    }

    /// Replaces an attribute with a single value.
    pub fn set_single(&mut self, name: &str, value: &str) {
        self.remove_attr(name);
        self.attrs.push(Attribute::new(name, &[value]));
    }

    /// Removes an attribute, returning it.
    pub fn remove_attr(&mut self, name: &str) -> Option<Attribute> {
        let name = name.to_ascii_lowercase();
        let pos = self.attrs.iter().position(|a| a.name == name)?;
        Some(self.attrs.remove(pos))
    }

    /// First raw value of an attribute.
    pub fn get_single(&self, name: &str) -> Option<&str> {
        self.find_attr(name).and_then(|a| a.first())
    }

    /// All raw values of an attribute.
    pub fn values_of(&self, name: &str) -> Vec<&str> {
        self.find_attr(name)
            .map(|a| a.values.iter().map(|v| v.raw.as_str()).collect())
            .unwrap_or_default()
    }

    /// Lowercased object class values.
    pub fn object_classes(&self) -> Vec<String> {
        self.values_of(attr::OBJECT_CLASS)
            .into_iter()
            .map(|v| v.trim().to_ascii_lowercase())
            .collect()
    }

    /// Returns true if the entry carries the object class.
    pub fn has_class(&self, class: &str) -> bool {
        let class = class.to_ascii_lowercase();
        self.object_classes().iter().any(|c| *c == class)
    }

    /// Returns true for tombstones.
    pub fn is_deleted(&self) -> bool {
        self.get_single(attr::IS_DELETED)
            .map_or(false, |v| v.eq_ignore_ascii_case("TRUE"))
    }

    /// Serializes the persisted part of the entry.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes an entry written by [`Entry::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Kind of a modification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModOp {
    /// Add values.
    Add,
    /// Delete the listed values, or the whole attribute when none are listed.
    Delete,
    /// Replace all values.
    Replace,
}

/// One modification of a Modify request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Modification {
    /// What to do.
    pub op: ModOp,
    /// Target attribute and values.
    pub attr: Attribute,
    /// Skipped when applying (already satisfied or dropped).
    pub ignore: bool,
    /// Extra version increment applied by metadata generation.
    pub force_version_gap: u16,
}

impl Modification {
    /// Creates a modification.
    pub fn new<S: AsRef<str>>(op: ModOp, name: &str, values: &[S]) -> Self {
        Self {
            op,
            attr: Attribute::new(name, values),
            ignore: false,
            force_version_gap: 0,
        }
    }

    /// Add-values modification.
    pub fn add<S: AsRef<str>>(name: &str, values: &[S]) -> Self {
        Self::new(ModOp::Add, name, values)
    }

    /// Delete-values modification; an empty slice deletes the attribute.
    pub fn delete<S: AsRef<str>>(name: &str, values: &[S]) -> Self {
        Self::new(ModOp::Delete, name, values)
    }

    /// Replace-values modification.
    pub fn replace<S: AsRef<str>>(name: &str, values: &[S]) -> Self {
        Self::new(ModOp::Replace, name, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StaticSchema;

    #[test]
    fn test_new_entry_normalizes_dn() {
        let e = Entry::new("CN=U1, DC=X");
        assert_eq!(e.norm_dn, "cn=u1,dc=x");
        assert_eq!(e.parent_dn, "dc=x");
    }

    #[test]
    fn test_add_and_find() {
        let mut e = Entry::new("cn=u1,dc=x");
        e.add_values("objectClass", &["top", "User"]);
        e.add_values("mail", &["a@x"]);
        e.add_values("MAIL", &["b@x"]);
        assert_eq!(e.values_of("mail"), vec!["a@x", "b@x"]);
        assert!(e.has_class("user"));
        e.set_single("mail", "c@x");
        assert_eq!(e.values_of("mail"), vec!["c@x"]);
        assert!(e.remove_attr("mail").is_some());
        assert!(e.find_attr("mail").is_none());
    }

    #[test]
    fn test_duplicate_after_normalization() {
        let schema = StaticSchema::bootstrap();
        let mut e = Entry::new("cn=u1,dc=x");
        e.add_values("description", &["Hello  World", "hello world"]);
        e.normalize(&schema).unwrap();
        match e.check_duplicates() {
            Err(DirError::TypeOrValueExists { attr, .. }) => assert_eq!(attr, "description"),
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_bytes_roundtrip_drops_transient_state() {
        let mut e = Entry::new("cn=u1,dc=x");
        e.add_values("cn", &["u1"]);
        e.computed.push(Attribute::new("hassubordinates", &["FALSE"]));
        e.dn_modified = true;
        let back = Entry::from_bytes(&e.to_bytes().unwrap()).unwrap();
        assert_eq!(back.attrs, e.attrs);
        assert!(back.computed.is_empty());
        assert!(!back.dn_modified);
    }
}
