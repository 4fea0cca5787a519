//! Typed attribute values.
//!
//! [`AttributeValue`] is the tagged union every resource attribute is stored
//! as, in configuration, plans and persisted state. Sets are kept in a
//! [`ValueSet`] keyed by element content hash, so set equality never depends
//! on element order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::identity::{write_bytes, ContentIdentity, ElementHash};

/// Attribute name to value mapping for a single resource.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    /// UTF-8 string.
    String(String),
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Ordered list.
    List(Vec<AttributeValue>),
    /// Unordered set with content-derived element identity.
    Set(ValueSet),
    /// Nested block of named attributes.
    Block(AttributeMap),
    /// Placeholder for a value only known after apply.
    ///
    /// Never equal to a concrete value.
    Unknown,
}

impl AttributeValue {
    /// Creates a string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Creates a set value from its elements.
    #[must_use]
    pub fn set(elements: impl IntoIterator<Item = Self>) -> Self {
        Self::Set(elements.into_iter().collect())
    }

    /// Returns true if this value, or anything nested in it, is unknown.
    #[must_use]
    pub fn contains_unknown(&self) -> bool {
        match self {
            Self::Unknown => true,
            Self::List(items) => items.iter().any(Self::contains_unknown),
            Self::Set(set) => set.iter().any(Self::contains_unknown),
            Self::Block(attrs) => attrs.values().any(Self::contains_unknown),
            Self::String(_) | Self::Int(_) | Self::Bool(_) => false,
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the set content, if this is a set.
    #[must_use]
    pub const fn as_set(&self) -> Option<&ValueSet> {
        match self {
            Self::Set(set) => Some(set),
            _ => None,
        }
    }

    /// Converts the value to plain JSON, as sent to provider APIs.
    ///
    /// Unknown values become `null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::List(items) => items.iter().map(Self::to_json).collect(),
            Self::Set(set) => set.iter().map(Self::to_json).collect(),
            Self::Block(attrs) => serde_json::Value::Object(
                attrs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Unknown => serde_json::Value::Null,
        }
    }
}

impl ContentIdentity for AttributeValue {
    fn write_identity(&self, hasher: &mut Sha256) {
        match self {
            Self::String(s) => s.write_identity(hasher),
            Self::Int(i) => i.write_identity(hasher),
            Self::Bool(b) => b.write_identity(hasher),
            Self::List(items) => {
                hasher.update([b'l']);
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    item.write_identity(hasher);
                }
            }
            Self::Set(set) => {
                // Element hashes are already sorted by the BTreeMap
                hasher.update([b'S']);
                hasher.update((set.len() as u64).to_be_bytes());
                for hash in set.hashes() {
                    write_bytes(hasher, hash.as_str().as_bytes());
                }
            }
            Self::Block(attrs) => {
                hasher.update([b'B']);
                hasher.update((attrs.len() as u64).to_be_bytes());
                for (key, value) in attrs {
                    write_bytes(hasher, key.as_bytes());
                    value.write_identity(hasher);
                }
            }
            Self::Unknown => hasher.update([b'?']),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Set(set) => {
                write!(f, "{{")?;
                for (i, item) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Self::Block(attrs) => {
                write!(f, "{{ ")?;
                for (i, (key, value)) in attrs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {value}")?;
                }
                write!(f, " }}")
            }
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

/// An unordered set of attribute values, keyed by content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<AttributeValue>", into = "Vec<AttributeValue>")]
pub struct ValueSet {
    elements: BTreeMap<ElementHash, AttributeValue>,
}

impl ValueSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an element. Returns false if an equal element was present.
    pub fn insert(&mut self, value: AttributeValue) -> bool {
        self.elements.insert(value.content_hash(), value).is_none()
    }

    /// Returns true if an element with the same content is present.
    #[must_use]
    pub fn contains(&self, value: &AttributeValue) -> bool {
        self.elements.contains_key(&value.content_hash())
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if the set has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterates over elements in hash order.
    pub fn iter(&self) -> impl Iterator<Item = &AttributeValue> {
        self.elements.values()
    }

    /// Iterates over element hashes in sorted order.
    pub fn hashes(&self) -> impl Iterator<Item = &ElementHash> {
        self.elements.keys()
    }

    /// Elements of `self` that are absent from `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Vec<AttributeValue> {
        self.elements
            .iter()
            .filter(|(hash, _)| !other.elements.contains_key(*hash))
            .map(|(_, value)| value.clone())
            .collect()
    }
}

impl FromIterator<AttributeValue> for ValueSet {
    fn from_iter<T: IntoIterator<Item = AttributeValue>>(iter: T) -> Self {
        let mut set = Self::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}

impl From<Vec<AttributeValue>> for ValueSet {
    fn from(values: Vec<AttributeValue>) -> Self {
        values.into_iter().collect()
    }
}

impl From<ValueSet> for Vec<AttributeValue> {
    fn from(set: ValueSet) -> Self {
        set.elements.into_values().collect()
    }
}
