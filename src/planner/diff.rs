//! Attribute-level differ.
//!
//! Compares the prior recorded attributes of a resource with its desired
//! attributes under the resource schema and classifies every change as
//! in-place, forcing replacement, or computed (known after apply).

use std::collections::{BTreeMap, BTreeSet};

use crate::schema::{AttributeMap, AttributeSchema, AttributeType, AttributeValue, ResourceSchema};

/// How a single attribute change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    /// Updatable in place.
    InPlace,
    /// Requires destroying and recreating the resource.
    ForceNew,
    /// Value supplied by the provider after apply.
    Computed,
}

/// Elements added to and removed from a set, identified by content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDelta {
    /// Elements present only in the new set.
    pub added: Vec<AttributeValue>,
    /// Elements present only in the old set.
    pub removed: Vec<AttributeValue>,
}

/// A change to one attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDiff {
    /// Dotted attribute path (`listener.port` for nested blocks).
    pub path: String,
    /// Prior value, if any.
    pub old: Option<AttributeValue>,
    /// New value, if any. [`AttributeValue::Unknown`] when known after apply.
    pub new: Option<AttributeValue>,
    /// How the change is applied.
    pub action: DiffAction,
    /// Element-level delta for set-typed attributes.
    pub set_delta: Option<SetDelta>,
}

/// Attribute-level diff for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Changes by attribute path, in path order.
    pub entries: BTreeMap<String, AttributeDiff>,
    /// A `ForceNew` attribute changed on an existing resource.
    pub requires_replace: bool,
}

impl Diff {
    /// True if nothing needs to change. Computed entries alone do not count.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|e| e.action == DiffAction::Computed)
    }

    /// Top-level attribute names with a non-computed change.
    #[must_use]
    pub fn changed_attributes(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.action != DiffAction::Computed)
            .map(|e| e.path.split('.').next().unwrap_or(&e.path).to_string())
            .collect()
    }

    /// Number of non-computed entries.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.entries.values().filter(|e| e.action != DiffAction::Computed).count()
    }

    fn push(&mut self, entry: AttributeDiff) {
        self.entries.insert(entry.path.clone(), entry);
    }
}

/// Computes the diff between `prior` (absent for a new resource) and `desired`.
#[must_use]
pub fn diff(schema: &ResourceSchema, prior: Option<&AttributeMap>, desired: &AttributeMap) -> Diff {
    let mut result = Diff::default();
    diff_attributes(&schema.attributes, "", prior, desired, &mut result);

    result.requires_replace =
        prior.is_some() && result.entries.values().any(|e| e.action == DiffAction::ForceNew);

    // A new object gets fresh provider-side values
    if prior.is_none() || result.requires_replace {
        for (name, attr) in &schema.attributes {
            if attr.computed && !desired.contains_key(name) {
                result.push(AttributeDiff {
                    path: name.clone(),
                    old: prior.and_then(|p| p.get(name)).cloned(),
                    new: Some(AttributeValue::Unknown),
                    action: DiffAction::Computed,
                    set_delta: None,
                });
            }
        }
    }

    result
}

fn diff_attributes(
    schemas: &BTreeMap<String, AttributeSchema>,
    prefix: &str,
    prior: Option<&AttributeMap>,
    desired: &AttributeMap,
    out: &mut Diff,
) {
    for (name, attr) in schemas {
        if attr.is_computed_only() {
            continue;
        }

        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        let old = prior.and_then(|p| p.get(name));

        match desired.get(name) {
            // Optional+computed with nothing declared keeps the provider's value
            None if attr.computed => {}
            None => {
                if let Some(old) = old {
                    out.push(AttributeDiff {
                        path,
                        old: Some(old.clone()),
                        new: None,
                        action: action_for(attr),
                        set_delta: None,
                    });
                }
            }
            Some(new) => diff_value(&path, attr, old, new, out),
        }
    }
}

fn diff_value(
    path: &str,
    attr: &AttributeSchema,
    old: Option<&AttributeValue>,
    new: &AttributeValue,
    out: &mut Diff,
) {
    if !new.contains_unknown() && old == Some(new) {
        return;
    }

    match (&attr.kind, old, new) {
        (AttributeType::Block(nested), Some(AttributeValue::Block(old_block)), AttributeValue::Block(new_block)) => {
            diff_attributes(nested, path, Some(old_block), new_block, out);
            // A ForceNew block escalates any nested change
            if attr.force_new {
                let nested_prefix = format!("{path}.");
                for entry in out.entries.values_mut() {
                    if entry.path.starts_with(&nested_prefix) && entry.action == DiffAction::InPlace {
                        entry.action = DiffAction::ForceNew;
                    }
                }
            }
        }
        (AttributeType::Set(_), Some(AttributeValue::Set(old_set)), AttributeValue::Set(new_set)) => {
            out.push(AttributeDiff {
                path: path.to_string(),
                old: old.cloned(),
                new: Some(new.clone()),
                action: action_for(attr),
                set_delta: Some(SetDelta {
                    added: new_set.difference(old_set),
                    removed: old_set.difference(new_set),
                }),
            });
        }
        _ => out.push(AttributeDiff {
            path: path.to_string(),
            old: old.cloned(),
            new: Some(new.clone()),
            action: action_for(attr),
            set_delta: None,
        }),
    }
}

const fn action_for(attr: &AttributeSchema) -> DiffAction {
    if attr.force_new {
        DiffAction::ForceNew
    } else {
        DiffAction::InPlace
    }
}

/// The attribute values a resource is expected to have after its change.
///
/// Declared values win. Attributes the provider computes keep their prior
/// value unless the object is new, in which case they are unknown.
#[must_use]
pub fn planned_attributes(
    schema: &ResourceSchema,
    prior: Option<&AttributeMap>,
    desired: &AttributeMap,
    replace: bool,
) -> AttributeMap {
    let mut planned = desired.clone();
    for (name, attr) in &schema.attributes {
        if !attr.computed || planned.contains_key(name) {
            continue;
        }
        let value = match prior.and_then(|p| p.get(name)) {
            Some(value) if !replace => value.clone(),
            _ => AttributeValue::Unknown,
        };
        planned.insert(name.clone(), value);
    }
    planned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ResourceSchema {
        let mut listener = BTreeMap::new();
        listener.insert(String::from("port"), AttributeSchema::required(AttributeType::Int));
        listener.insert(String::from("protocol"), AttributeSchema::optional(AttributeType::String));

        ResourceSchema::new(1)
            .with_attribute("name", AttributeSchema::required(AttributeType::String).force_new())
            .with_attribute("algorithm", AttributeSchema::required(AttributeType::String))
            .with_attribute("ip", AttributeSchema::computed(AttributeType::String))
            .with_attribute("tag", AttributeSchema::optional(AttributeType::String))
            .with_attribute(
                "droplet_ids",
                AttributeSchema::optional_computed(AttributeType::set_of(AttributeType::Int)),
            )
            .with_attribute("listener", AttributeSchema::optional(AttributeType::Block(listener)))
    }

    fn attrs(pairs: &[(&str, AttributeValue)]) -> AttributeMap {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    fn ids(values: &[i64]) -> AttributeValue {
        AttributeValue::set(values.iter().copied().map(AttributeValue::Int))
    }

    #[test]
    fn test_diff_is_idempotent() {
        let schema = schema();
        let mut listener = AttributeMap::new();
        listener.insert(String::from("port"), AttributeValue::Int(80));
        let desired = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
            ("droplet_ids", ids(&[3, 1, 2])),
            ("listener", AttributeValue::Block(listener)),
        ]);

        let d = diff(&schema, Some(&desired), &desired);
        assert!(d.is_empty());
        assert!(d.entries.is_empty());
        assert!(!d.requires_replace);
    }

    #[test]
    fn test_force_new_escalates_regardless_of_other_changes() {
        let schema = schema();
        let prior = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
            ("ip", AttributeValue::string("10.0.0.1")),
        ]);
        let desired = attrs(&[
            ("name", AttributeValue::string("web-2")),
            ("algorithm", AttributeValue::string("least_connections")),
        ]);

        let d = diff(&schema, Some(&prior), &desired);
        assert!(d.requires_replace);
        assert_eq!(d.entries["name"].action, DiffAction::ForceNew);
        assert_eq!(d.entries["algorithm"].action, DiffAction::InPlace);
        // The replacement gets a fresh ip
        assert_eq!(d.entries["ip"].action, DiffAction::Computed);
        assert_eq!(d.entries["ip"].new, Some(AttributeValue::Unknown));
    }

    #[test]
    fn test_in_place_update() {
        let schema = schema();
        let prior = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
            ("ip", AttributeValue::string("10.0.0.1")),
        ]);
        let desired = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("least_connections")),
        ]);

        let d = diff(&schema, Some(&prior), &desired);
        assert!(!d.requires_replace);
        assert_eq!(d.change_count(), 1);
        assert_eq!(d.changed_attributes().into_iter().collect::<Vec<_>>(), vec!["algorithm"]);
        assert!(!d.entries.contains_key("ip"));
    }

    #[test]
    fn test_set_delta_by_content() {
        let schema = schema();
        let prior = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
            ("droplet_ids", ids(&[1, 2])),
        ]);
        let desired = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
            ("droplet_ids", ids(&[2, 1, 3])),
        ]);

        let d = diff(&schema, Some(&prior), &desired);
        let entry = &d.entries["droplet_ids"];
        assert_eq!(entry.action, DiffAction::InPlace);
        let delta = entry.set_delta.as_ref().expect("set delta");
        assert_eq!(delta.added, vec![AttributeValue::Int(3)]);
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn test_optional_computed_carried_forward() {
        let schema = schema();
        let prior = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
            ("droplet_ids", ids(&[1])),
        ]);
        let desired = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
        ]);

        assert!(diff(&schema, Some(&prior), &desired).entries.is_empty());
    }

    #[test]
    fn test_removed_optional_attribute() {
        let schema = schema();
        let prior = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
            ("tag", AttributeValue::string("blue")),
        ]);
        let desired = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
        ]);

        let d = diff(&schema, Some(&prior), &desired);
        assert_eq!(d.entries["tag"].new, None);
        assert!(!d.is_empty());
    }

    #[test]
    fn test_unknown_never_equal() {
        let schema = schema();
        let prior = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
        ]);
        let desired = attrs(&[
            ("name", AttributeValue::Unknown),
            ("algorithm", AttributeValue::string("round_robin")),
        ]);

        let d = diff(&schema, Some(&prior), &desired);
        assert!(d.requires_replace);
    }

    #[test]
    fn test_nested_block_paths() {
        let schema = schema();
        let block = |port: i64| {
            let mut b = AttributeMap::new();
            b.insert(String::from("port"), AttributeValue::Int(port));
            AttributeValue::Block(b)
        };
        let base = [
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
        ];
        let mut prior = attrs(&base);
        prior.insert(String::from("listener"), block(80));
        let mut desired = attrs(&base);
        desired.insert(String::from("listener"), block(443));

        let d = diff(&schema, Some(&prior), &desired);
        assert!(d.entries.contains_key("listener.port"));
        assert_eq!(d.changed_attributes().into_iter().collect::<Vec<_>>(), vec!["listener"]);
    }

    #[test]
    fn test_create_marks_computed_unknown() {
        let schema = schema();
        let desired = attrs(&[
            ("name", AttributeValue::string("web")),
            ("algorithm", AttributeValue::string("round_robin")),
        ]);

        let d = diff(&schema, None, &desired);
        assert!(!d.requires_replace);
        assert_eq!(d.change_count(), 2);
        assert_eq!(d.entries["ip"].action, DiffAction::Computed);
        assert_eq!(d.entries["droplet_ids"].action, DiffAction::Computed);

        let planned = planned_attributes(&schema, None, &desired, false);
        assert_eq!(planned["ip"], AttributeValue::Unknown);
    }

    #[test]
    fn test_planned_attributes_keep_prior_computed() {
        let schema = schema();
        let prior = attrs(&[
            ("name", AttributeValue::string("web")),
            ("ip", AttributeValue::string("10.0.0.1")),
        ]);
        let desired = attrs(&[("name", AttributeValue::string("web"))]);

        let kept = planned_attributes(&schema, Some(&prior), &desired, false);
        assert_eq!(kept["ip"], AttributeValue::string("10.0.0.1"));
        let replaced = planned_attributes(&schema, Some(&prior), &desired, true);
        assert_eq!(replaced["ip"], AttributeValue::Unknown);
    }
}
