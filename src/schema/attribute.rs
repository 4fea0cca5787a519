//! Attribute and resource schema descriptors.
//!
//! A plugin describes each resource type with a [`ResourceSchema`]: one
//! [`AttributeSchema`] per attribute, carrying the Required / Optional /
//! Computed / `ForceNew` flags and the semantic [`AttributeType`].

use std::collections::BTreeMap;

use super::value::{AttributeMap, AttributeValue, ValueSet};

/// Semantic type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    /// UTF-8 string.
    String,
    /// Signed integer.
    Int,
    /// Boolean.
    Bool,
    /// Ordered list of the element type.
    List(Box<AttributeType>),
    /// Unordered set of the element type.
    Set(Box<AttributeType>),
    /// Nested block with its own attribute schemas.
    Block(BTreeMap<String, AttributeSchema>),
}

/// Schema of a single attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSchema {
    /// Semantic type.
    pub kind: AttributeType,
    /// Must be set in declared configuration.
    pub required: bool,
    /// May be set in declared configuration.
    pub optional: bool,
    /// Populated by the provider.
    pub computed: bool,
    /// Any change requires destroying and recreating the resource.
    pub force_new: bool,
    /// Provider-side value overwrites the recorded value on refresh.
    pub authoritative: bool,
    /// Human-readable description.
    pub description: Option<String>,
}

/// Schema of a resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Schema version recorded with each instance.
    pub version: u32,
    /// Attribute schemas by name.
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl AttributeType {
    /// Creates a set type with the given element type.
    #[must_use]
    pub fn set_of(element: Self) -> Self {
        Self::Set(Box::new(element))
    }

    /// Creates a list type with the given element type.
    #[must_use]
    pub fn list_of(element: Self) -> Self {
        Self::List(Box::new(element))
    }

    /// Returns true if `value` is of this type. Unknown matches every type.
    #[must_use]
    pub fn accepts(&self, value: &AttributeValue) -> bool {
        match (self, value) {
            (_, AttributeValue::Unknown)
            | (Self::String, AttributeValue::String(_))
            | (Self::Int, AttributeValue::Int(_))
            | (Self::Bool, AttributeValue::Bool(_)) => true,
            (Self::List(elem), AttributeValue::List(items)) => {
                items.iter().all(|item| elem.accepts(item))
            }
            (Self::Set(elem), AttributeValue::Set(set)) => set.iter().all(|item| elem.accepts(item)),
            (Self::Block(schemas), AttributeValue::Block(attrs)) => attrs
                .iter()
                .all(|(key, item)| schemas.get(key).is_some_and(|s| s.kind.accepts(item))),
            _ => false,
        }
    }

    /// Converts plain JSON into a typed value.
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch if `json` is not of this type.
    pub fn value_from_json(&self, json: &serde_json::Value) -> Result<AttributeValue, String> {
        use serde_json::Value;

        match (self, json) {
            (Self::String, Value::String(s)) => Ok(AttributeValue::String(s.clone())),
            // Scalars written unquoted in YAML still bind to string attributes
            (Self::String, Value::Number(n)) => Ok(AttributeValue::String(n.to_string())),
            (Self::String, Value::Bool(b)) => Ok(AttributeValue::String(b.to_string())),
            (Self::Int, Value::Number(n)) => n
                .as_i64()
                .map(AttributeValue::Int)
                .ok_or_else(|| format!("expected integer, found {n}")),
            (Self::Int, Value::String(s)) => s
                .parse::<i64>()
                .map(AttributeValue::Int)
                .map_err(|_| format!("expected integer, found {s:?}")),
            (Self::Bool, Value::Bool(b)) => Ok(AttributeValue::Bool(*b)),
            (Self::List(elem), Value::Array(items)) => items
                .iter()
                .map(|item| elem.value_from_json(item))
                .collect::<Result<Vec<_>, _>>()
                .map(AttributeValue::List),
            (Self::Set(elem), Value::Array(items)) => items
                .iter()
                .map(|item| elem.value_from_json(item))
                .collect::<Result<ValueSet, _>>()
                .map(AttributeValue::Set),
            (Self::Block(schemas), Value::Object(fields)) => {
                let mut attrs = AttributeMap::new();
                for (key, field) in fields {
                    let schema = schemas
                        .get(key)
                        .ok_or_else(|| format!("unexpected block attribute {key:?}"))?;
                    attrs.insert(key.clone(), schema.kind.value_from_json(field)?);
                }
                Ok(AttributeValue::Block(attrs))
            }
            (kind, other) => Err(format!("expected {kind}, found {other}")),
        }
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Int => write!(f, "integer"),
            Self::Bool => write!(f, "boolean"),
            Self::List(elem) => write!(f, "list of {elem}"),
            Self::Set(elem) => write!(f, "set of {elem}"),
            Self::Block(_) => write!(f, "block"),
        }
    }
}

impl AttributeSchema {
    const fn with_flags(kind: AttributeType, required: bool, optional: bool, computed: bool) -> Self {
        Self {
            kind,
            required,
            optional,
            computed,
            force_new: false,
            authoritative: false,
            description: None,
        }
    }

    /// A value the configuration must supply.
    #[must_use]
    pub const fn required(kind: AttributeType) -> Self {
        Self::with_flags(kind, true, false, false)
    }

    /// A value the configuration may supply.
    #[must_use]
    pub const fn optional(kind: AttributeType) -> Self {
        Self::with_flags(kind, false, true, false)
    }

    /// A value only the provider supplies.
    #[must_use]
    pub const fn computed(kind: AttributeType) -> Self {
        Self::with_flags(kind, false, false, true)
    }

    /// A value the provider computes unless the configuration supplies it.
    #[must_use]
    pub const fn optional_computed(kind: AttributeType) -> Self {
        Self::with_flags(kind, false, true, true)
    }

    /// Marks the attribute as requiring replacement on change.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Marks the provider's value as the source of truth on refresh.
    #[must_use]
    pub const fn authoritative(mut self) -> Self {
        self.authoritative = true;
        self
    }

    /// Attaches a description.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns true if only the provider can set this attribute.
    #[must_use]
    pub const fn is_computed_only(&self) -> bool {
        self.computed && !self.optional
    }

    /// Checks the flag invariant: exactly one of Required / Optional /
    /// Computed, except that Optional may combine with Computed.
    ///
    /// # Errors
    ///
    /// Returns a description of the violation.
    pub fn check_flags(&self) -> Result<(), String> {
        let valid = matches!(
            (self.required, self.optional, self.computed),
            (true, false, false) | (false, true, false) | (false, false, true) | (false, true, true)
        );
        if !valid {
            return Err(String::from(
                "exactly one of required/optional/computed must be set (optional may combine with computed)",
            ));
        }
        if let AttributeType::Block(nested) = &self.kind {
            for (name, schema) in nested {
                schema.check_flags().map_err(|e| format!("{name}: {e}"))?;
            }
        }
        Ok(())
    }
}

impl ResourceSchema {
    /// Creates an empty schema at the given version.
    #[must_use]
    pub fn new(version: u32) -> Self {
        Self {
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    /// Looks up an attribute schema.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Checks every attribute's flag invariant.
    ///
    /// # Errors
    ///
    /// Returns the first violation, prefixed with the attribute name.
    pub fn check(&self) -> Result<(), String> {
        for (name, schema) in &self.attributes {
            schema.check_flags().map_err(|e| format!("{name}: {e}"))?;
        }
        Ok(())
    }

    /// Checks a set of attribute values against this schema.
    ///
    /// Rejects unknown attribute names, type mismatches, computed-only
    /// attributes set by the caller, and missing required attributes.
    ///
    /// # Errors
    ///
    /// Returns a list of human-readable violations.
    pub fn check_values(&self, values: &AttributeMap) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        for (name, value) in values {
            match self.attributes.get(name) {
                None => problems.push(format!("unknown attribute {name:?}")),
                Some(schema) if schema.is_computed_only() => {
                    problems.push(format!("attribute {name:?} is computed and cannot be set"));
                }
                Some(schema) if !schema.kind.accepts(value) => {
                    problems.push(format!("attribute {name:?} must be {}", schema.kind));
                }
                Some(_) => {}
            }
        }

        for (name, schema) in &self.attributes {
            if schema.required && !values.contains_key(name) {
                problems.push(format!("missing required attribute {name:?}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}
