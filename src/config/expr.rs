//! Attribute expressions.
//!
//! Declared attribute values are either literals or references to another
//! resource's attribute, written `${type.name.attribute}`. References are
//! resolved at plan time against the planned values of their targets and
//! become [`AttributeValue::Unknown`] when the target value is only known
//! after apply.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::ResourceAddress;
use crate::schema::{AttributeMap, AttributeType, AttributeValue, ValueSet};

/// A reference to an attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceRef {
    /// Target resource.
    pub address: ResourceAddress,
    /// Attribute name on the target (`id` is always available).
    pub attribute: String,
}

impl ResourceRef {
    /// Parses `${type.name.attribute}`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let inner = raw.strip_prefix("${")?.strip_suffix('}')?;
        let mut parts = inner.split('.');
        let resource_type = parts.next()?;
        let name = parts.next()?;
        let attribute = parts.next()?;
        if parts.next().is_some() || [resource_type, name, attribute].iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self {
            address: ResourceAddress::new(resource_type, name),
            attribute: attribute.to_string(),
        })
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.address, self.attribute)
    }
}

/// A declared attribute value, possibly containing references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A fully known value.
    Literal(AttributeValue),
    /// A reference to another resource's attribute.
    Reference(ResourceRef),
    /// A list whose elements may contain references.
    List(Vec<Expr>),
    /// A set whose elements may contain references.
    Set(Vec<Expr>),
    /// A block whose fields may contain references.
    Block(BTreeMap<String, Expr>),
}

impl Expr {
    /// Builds an expression from plain configuration JSON, typed by `kind`.
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch if a literal is not of `kind`.
    pub fn from_json(kind: &AttributeType, json: &serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;

        if let Value::String(raw) = json
            && let Some(reference) = ResourceRef::parse(raw)
        {
            return Ok(Self::Reference(reference));
        }

        if !json_has_reference(json) {
            return kind.value_from_json(json).map(Self::Literal);
        }

        match (kind, json) {
            (AttributeType::List(elem), Value::Array(items)) => items
                .iter()
                .map(|item| Self::from_json(elem, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            (AttributeType::Set(elem), Value::Array(items)) => items
                .iter()
                .map(|item| Self::from_json(elem, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Set),
            (AttributeType::Block(schemas), Value::Object(fields)) => {
                let mut block = BTreeMap::new();
                for (key, field) in fields {
                    let schema = schemas
                        .get(key)
                        .ok_or_else(|| format!("unexpected block attribute {key:?}"))?;
                    block.insert(key.clone(), Self::from_json(&schema.kind, field)?);
                }
                Ok(Self::Block(block))
            }
            (kind, other) => Err(format!("expected {kind}, found {other}")),
        }
    }

    /// Every reference in this expression.
    #[must_use]
    pub fn references(&self) -> Vec<&ResourceRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a ResourceRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => refs.push(r),
            Self::List(items) | Self::Set(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Self::Block(fields) => {
                for field in fields.values() {
                    field.collect_references(refs);
                }
            }
        }
    }

    /// Resolves references through `lookup`.
    ///
    /// A set with any unknown element is unknown as a whole, since its
    /// membership cannot be decided.
    pub fn resolve(&self, lookup: &dyn Fn(&ResourceRef) -> AttributeValue) -> AttributeValue {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Reference(r) => lookup(r),
            Self::List(items) => AttributeValue::List(items.iter().map(|i| i.resolve(lookup)).collect()),
            Self::Set(items) => {
                let resolved: Vec<AttributeValue> = items.iter().map(|i| i.resolve(lookup)).collect();
                if resolved.iter().any(AttributeValue::contains_unknown) {
                    AttributeValue::Unknown
                } else {
                    AttributeValue::Set(ValueSet::from(resolved))
                }
            }
            Self::Block(fields) => AttributeValue::Block(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(lookup)))
                    .collect(),
            ),
        }
    }
}

fn json_has_reference(json: &serde_json::Value) -> bool {
    use serde_json::Value;

    match json {
        Value::String(s) => ResourceRef::parse(s).is_some(),
        Value::Array(items) => items.iter().any(json_has_reference),
        Value::Object(fields) => fields.values().any(json_has_reference),
        _ => false,
    }
}

/// A validated resource declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredResource {
    /// Resource address.
    pub address: ResourceAddress,
    /// Declared attribute expressions.
    pub attributes: BTreeMap<String, Expr>,
    /// Explicit `depends_on` addresses.
    pub depends_on: BTreeSet<ResourceAddress>,
}

impl DeclaredResource {
    /// Creates a declaration from literal attributes.
    #[must_use]
    pub fn literal(address: ResourceAddress, attributes: AttributeMap) -> Self {
        Self {
            address,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k, Expr::Literal(v)))
                .collect(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Explicit dependencies plus every referenced resource.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceAddress> {
        let mut deps = self.depends_on.clone();
        for expr in self.attributes.values() {
            deps.extend(expr.references().into_iter().map(|r| r.address.clone()));
        }
        deps
    }

    /// Resolves every attribute through `lookup`.
    pub fn resolve(&self, lookup: &dyn Fn(&ResourceRef) -> AttributeValue) -> AttributeMap {
        self.attributes
            .iter()
            .map(|(name, expr)| (name.clone(), expr.resolve(lookup)))
            .collect()
    }
}
