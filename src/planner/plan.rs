//! Plan construction.
//!
//! The planner walks declared resources in dependency order, resolves their
//! references against what each dependency is expected to look like after
//! its own change, diffs the result against the recorded state and picks
//! one action per resource. Tracked instances that are no longer declared
//! are deleted, dependents first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::address::ResourceAddress;
use crate::config::{DeclaredResource, ResourceRef};
use crate::error::{ConfigError, PlanError, Result, TerraceError};
use crate::provider::PluginRegistry;
use crate::schema::{AttributeMap, AttributeValue};
use crate::state::StateSnapshot;

use super::diff::{AttributeDiff, Diff, DiffAction, diff, planned_attributes};
use super::graph::DependencyGraph;

/// Action planned for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a resource that is not tracked.
    Create,
    /// Update a tracked resource in place.
    Update,
    /// Delete a tracked resource or a deposed object.
    Delete,
    /// Destroy and recreate a tracked resource.
    Replace,
    /// Nothing to do.
    NoOp,
}

impl Action {
    /// Symbol used in plan listings.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::Replace => "-/+",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
        };
        f.write_str(name)
    }
}

/// One step of a plan.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Resource the step applies to.
    pub address: ResourceAddress,
    /// What to do.
    pub action: Action,
    /// Attribute-level diff against the recorded state.
    pub diff: Diff,
    /// Provider id the step operates on. For a deposed delete, the deposed id.
    pub prior_id: Option<String>,
    /// Declaration the step converges to. `None` for deletes.
    pub desired: Option<DeclaredResource>,
    /// The step deletes a deposed object rather than the tracked one.
    pub deposed: bool,
    /// Replacement creates the new object before deleting the old one.
    pub create_before_destroy: bool,
    /// Dependencies to record on the instance after the step.
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Indices of steps that must succeed before this one starts.
    pub depends_on: Vec<usize>,
    /// Why the step was planned.
    pub reason: String,
}

impl PlannedChange {
    /// True for steps that change infrastructure.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.action != Action::NoOp
    }
}

/// An ordered set of changes computed against one state serial.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Hash of the declared configuration.
    pub config_hash: String,
    /// Serial of the state the plan was computed against.
    pub state_serial: u64,
    /// Lineage of the state the plan was computed against.
    pub state_lineage: String,
    /// Steps in execution order.
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    /// True if no step changes infrastructure.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.changes.iter().any(PlannedChange::is_change)
    }

    /// Number of steps with the given action.
    #[must_use]
    pub fn count(&self, action: Action) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Steps that change infrastructure.
    pub fn actionable(&self) -> impl Iterator<Item = &PlannedChange> {
        self.changes.iter().filter(|c| c.is_change())
    }

    /// Every step starts after all the steps it depends on.
    #[must_use]
    pub fn respects_dependencies(&self) -> bool {
        self.changes
            .iter()
            .enumerate()
            .all(|(index, change)| change.depends_on.iter().all(|dep| *dep < index))
    }

    /// Short summary, e.g. `2 to create, 1 to update, 0 to replace, 1 to delete`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete",
            self.count(Action::Create),
            self.count(Action::Update),
            self.count(Action::Replace),
            self.count(Action::Delete)
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes. Infrastructure matches the configuration.");
        }

        writeln!(f, "Plan: {}", self.summary())?;
        for change in self.actionable() {
            let deposed = if change.deposed { " (deposed)" } else { "" };
            writeln!(f, "  {} {}{deposed}", change.action.symbol(), change.address)?;
            for entry in change.diff.entries.values() {
                writeln!(f, "      {}", format_entry(entry))?;
            }
        }
        Ok(())
    }
}

fn format_entry(entry: &AttributeDiff) -> String {
    let show = |v: &Option<AttributeValue>| v.as_ref().map_or_else(|| String::from("null"), ToString::to_string);
    let marker = match entry.action {
        DiffAction::ForceNew => " (forces replacement)",
        DiffAction::Computed => " (known after apply)",
        DiffAction::InPlace => "",
    };
    match &entry.set_delta {
        Some(delta) => format!(
            "{}: +{} -{} elements{marker}",
            entry.path,
            delta.added.len(),
            delta.removed.len()
        ),
        None => format!("{}: {} -> {}{marker}", entry.path, show(&entry.old), show(&entry.new)),
    }
}

/// What a planned resource is expected to look like after its step.
struct Expected {
    id: Option<String>,
    attributes: AttributeMap,
}

/// Computes plans from declared resources and state.
pub struct Planner<'a> {
    registry: &'a PluginRegistry,
}

impl<'a> Planner<'a> {
    /// Creates a planner over the given plugins.
    #[must_use]
    pub const fn new(registry: &'a PluginRegistry) -> Self {
        Self { registry }
    }

    /// Plans the changes that converge `state` to `declared`.
    ///
    /// # Errors
    ///
    /// Fails on duplicate addresses, references to undeclared resources,
    /// dependency cycles, or resource types with no registered plugin.
    pub fn plan(&self, declared: &[DeclaredResource], state: &StateSnapshot, config_hash: &str) -> Result<Plan> {
        let mut by_address: BTreeMap<&ResourceAddress, &DeclaredResource> = BTreeMap::new();
        for resource in declared {
            if by_address.insert(&resource.address, resource).is_some() {
                return Err(TerraceError::Config(ConfigError::DuplicateResource {
                    address: resource.address.to_string(),
                }));
            }
        }

        let mut graph = DependencyGraph::new();
        for resource in declared {
            graph.add_node(resource.address.clone());
            for dependency in resource.dependencies() {
                if !by_address.contains_key(&dependency) {
                    return Err(TerraceError::Plan(PlanError::UnknownDependency {
                        address: resource.address.to_string(),
                        dependency: dependency.to_string(),
                    }));
                }
                graph.add_dependency(resource.address.clone(), dependency);
            }
        }
        let order = graph.topological_order()?;

        let mut changes: Vec<PlannedChange> = Vec::new();
        let mut index_of: BTreeMap<ResourceAddress, usize> = BTreeMap::new();

        // Deposed objects left behind by an interrupted replacement go first;
        // the owning instance's own step waits for them.
        let mut deposed_steps: BTreeMap<ResourceAddress, Vec<usize>> = BTreeMap::new();
        for (address, instance) in &state.resources {
            for deposed_id in &instance.deposed {
                self.registry.require(&address.resource_type)?;
                deposed_steps.entry(address.clone()).or_default().push(changes.len());
                changes.push(PlannedChange {
                    address: address.clone(),
                    action: Action::Delete,
                    diff: Diff::default(),
                    prior_id: Some(deposed_id.clone()),
                    desired: None,
                    deposed: true,
                    create_before_destroy: false,
                    dependencies: BTreeSet::new(),
                    depends_on: Vec::new(),
                    reason: String::from("deposed object from an earlier replacement"),
                });
            }
        }

        let mut expected: BTreeMap<ResourceAddress, Expected> = BTreeMap::new();
        for address in order {
            let Some(resource) = by_address.get(&address) else {
                continue;
            };
            let plugin = self.registry.require(&address.resource_type)?;
            let schema = plugin.schema();
            let prior = state.get(&address);

            let lookup = |reference: &ResourceRef| lookup_expected(&expected, reference);
            let desired = resource.resolve(&lookup);
            let prior_attributes = prior.map(|p| &p.attributes);
            let diff = diff(schema, prior_attributes, &desired);

            let (action, reason) = match prior {
                None => (Action::Create, String::from("not in state")),
                Some(_) if diff.requires_replace => (Action::Replace, replace_reason(&diff)),
                Some(_) if !diff.is_empty() => (
                    Action::Update,
                    format!("{} attribute(s) changed", diff.change_count()),
                ),
                Some(_) => (Action::NoOp, String::from("up to date")),
            };

            let fresh = matches!(action, Action::Create | Action::Replace);
            expected.insert(
                address.clone(),
                Expected {
                    id: if fresh { None } else { prior.map(|p| p.id.clone()) },
                    attributes: planned_attributes(schema, prior_attributes, &desired, fresh),
                },
            );

            let dependencies = resource.dependencies();
            let mut depends_on: Vec<usize> = dependencies.iter().filter_map(|d| index_of.get(d).copied()).collect();
            depends_on.extend(deposed_steps.get(&address).into_iter().flatten());
            depends_on.sort_unstable();

            debug!(%address, %action, "Planned change");
            index_of.insert(address.clone(), changes.len());
            changes.push(PlannedChange {
                address: address.clone(),
                action,
                diff,
                prior_id: prior.map(|p| p.id.clone()),
                desired: Some((*resource).clone()),
                deposed: false,
                create_before_destroy: action == Action::Replace && plugin.capabilities().create_before_destroy,
                dependencies,
                depends_on,
                reason,
            });
        }

        self.plan_orphans(state, &by_address, &index_of, &deposed_steps, &mut changes)?;

        Ok(Plan {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            state_serial: state.serial,
            state_lineage: state.lineage.clone(),
            changes,
        })
    }

    /// Plans the deletion of every tracked instance.
    ///
    /// # Errors
    ///
    /// Fails if a tracked type has no plugin or recorded dependencies form a cycle.
    pub fn plan_destroy(&self, state: &StateSnapshot) -> Result<Plan> {
        self.plan(&[], state, "")
    }

    /// Appends deletes for tracked instances that are no longer declared.
    fn plan_orphans(
        &self,
        state: &StateSnapshot,
        declared: &BTreeMap<&ResourceAddress, &DeclaredResource>,
        index_of: &BTreeMap<ResourceAddress, usize>,
        deposed_steps: &BTreeMap<ResourceAddress, Vec<usize>>,
        changes: &mut Vec<PlannedChange>,
    ) -> Result<()> {
        let orphans: BTreeSet<&ResourceAddress> =
            state.addresses().filter(|a| !declared.contains_key(a)).collect();
        if orphans.is_empty() {
            return Ok(());
        }

        let mut graph = DependencyGraph::new();
        for address in &orphans {
            graph.add_node((*address).clone());
            if let Some(instance) = state.get(address) {
                for dependency in instance.dependencies.iter().filter(|d| orphans.contains(d)) {
                    graph.add_dependency((*address).clone(), dependency.clone());
                }
            }
        }

        let mut delete_index: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
        for address in graph.topological_order()?.into_iter().rev() {
            let Some(instance) = state.get(&address) else {
                continue;
            };
            self.registry.require(&address.resource_type)?;

            // Everything that recorded a dependency on this instance goes first
            let mut depends_on: Vec<usize> = state
                .resources
                .iter()
                .filter(|(_, other)| other.dependencies.contains(&address))
                .filter_map(|(other, _)| index_of.get(other).or_else(|| delete_index.get(other)).copied())
                .collect();
            depends_on.extend(deposed_steps.get(&address).into_iter().flatten());
            depends_on.sort_unstable();
            depends_on.dedup();

            let entries = instance
                .attributes
                .iter()
                .map(|(name, value)| {
                    (
                        name.clone(),
                        AttributeDiff {
                            path: name.clone(),
                            old: Some(value.clone()),
                            new: None,
                            action: DiffAction::InPlace,
                            set_delta: None,
                        },
                    )
                })
                .collect();

            debug!(%address, "Planned delete of undeclared instance");
            delete_index.insert(address.clone(), changes.len());
            changes.push(PlannedChange {
                address: address.clone(),
                action: Action::Delete,
                diff: Diff {
                    entries,
                    requires_replace: false,
                },
                prior_id: Some(instance.id.clone()),
                desired: None,
                deposed: false,
                create_before_destroy: false,
                dependencies: BTreeSet::new(),
                depends_on,
                reason: String::from("no longer declared"),
            });
        }
        Ok(())
    }
}

fn lookup_expected(expected: &BTreeMap<ResourceAddress, Expected>, reference: &ResourceRef) -> AttributeValue {
    let Some(target) = expected.get(&reference.address) else {
        return AttributeValue::Unknown;
    };
    if reference.attribute == "id" {
        return target
            .id
            .as_ref()
            .map_or(AttributeValue::Unknown, |id| AttributeValue::string(id.as_str()));
    }
    target
        .attributes
        .get(&reference.attribute)
        .cloned()
        .unwrap_or(AttributeValue::Unknown)
}

fn replace_reason(diff: &Diff) -> String {
    let forcing: Vec<&str> = diff
        .entries
        .values()
        .filter(|e| e.action == DiffAction::ForceNew)
        .map(|e| e.path.as_str())
        .collect();
    format!("{} forces replacement", forcing.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Expr;
    use crate::state::ResourceInstance;
    use crate::testing::{FakePlugin, attrs};
    use std::sync::Arc;

    const LB: &str = "fake_lb";

    fn registry() -> PluginRegistry {
        PluginRegistry::new()
            .with_plugin(Arc::new(FakePlugin::new(LB)))
            .expect("register")
    }

    fn addr(name: &str) -> ResourceAddress {
        ResourceAddress::new(LB, name)
    }

    fn lb(name: &str, algorithm: &str) -> DeclaredResource {
        DeclaredResource::literal(
            addr(name),
            attrs(&[
                ("name", AttributeValue::string(name)),
                ("algorithm", AttributeValue::string(algorithm)),
                ("region", AttributeValue::string("nyc1")),
            ]),
        )
    }

    fn referencing(name: &str, target: &str, attribute: &str) -> DeclaredResource {
        let mut resource = lb(name, "round_robin");
        resource.attributes.insert(
            String::from("algorithm"),
            Expr::Reference(ResourceRef {
                address: addr(target),
                attribute: attribute.to_string(),
            }),
        );
        resource
    }

    fn tracked(state: &mut StateSnapshot, name: &str, algorithm: &str) {
        let mut attributes = attrs(&[
            ("name", AttributeValue::string(name)),
            ("algorithm", AttributeValue::string(algorithm)),
            ("region", AttributeValue::string("nyc1")),
            ("ip", AttributeValue::string("10.0.0.1")),
            ("status", AttributeValue::string("active")),
        ]);
        attributes.insert(String::from("droplet_ids"), AttributeValue::set([]));
        state.insert(ResourceInstance::new(&addr(name), format!("id-{name}"), "fake").with_attributes(1, attributes));
    }

    fn actions(plan: &Plan) -> Vec<(String, Action)> {
        plan.changes.iter().map(|c| (c.address.name.clone(), c.action)).collect()
    }

    #[test]
    fn test_create_when_absent() {
        let registry = registry();
        let state = StateSnapshot::new("p", "dev");
        let plan = Planner::new(&registry)
            .plan(&[lb("web", "round_robin")], &state, "h")
            .expect("plan");

        assert_eq!(actions(&plan), vec![(String::from("web"), Action::Create)]);
        let change = &plan.changes[0];
        assert!(change.diff.entries.contains_key("algorithm"));
        assert_eq!(change.diff.entries["ip"].action, DiffAction::Computed);
        assert_eq!(plan.state_serial, state.serial);
        assert_eq!(plan.summary(), "1 to create, 0 to update, 0 to replace, 0 to delete");
    }

    #[test]
    fn test_noop_when_up_to_date() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "web", "round_robin");
        let plan = Planner::new(&registry)
            .plan(&[lb("web", "round_robin")], &state, "h")
            .expect("plan");

        assert_eq!(actions(&plan), vec![(String::from("web"), Action::NoOp)]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_force_new_change_replaces() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "web", "round_robin");
        let plan = Planner::new(&registry)
            .plan(&[lb("web", "least_connections")], &state, "h")
            .expect("plan");

        assert_eq!(plan.changes[0].action, Action::Replace);
        assert_eq!(plan.changes[0].prior_id.as_deref(), Some("id-web"));
        assert!(!plan.changes[0].create_before_destroy);
        assert!(plan.changes[0].reason.contains("algorithm"));
    }

    #[test]
    fn test_set_change_updates_in_place() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "web", "round_robin");
        let mut desired = lb("web", "round_robin");
        desired.attributes.insert(
            String::from("droplet_ids"),
            Expr::Literal(AttributeValue::set([AttributeValue::Int(1001)])),
        );

        let plan = Planner::new(&registry).plan(&[desired], &state, "h").expect("plan");
        let change = &plan.changes[0];
        assert_eq!(change.action, Action::Update);
        let delta = change.diff.entries["droplet_ids"].set_delta.as_ref().expect("delta");
        assert_eq!(delta.added, vec![AttributeValue::Int(1001)]);
    }

    #[test]
    fn test_dependencies_planned_first() {
        let registry = registry();
        let state = StateSnapshot::new("p", "dev");
        let declared = vec![
            referencing("a_front", "z_back", "algorithm"),
            lb("z_back", "round_robin"),
            referencing("m_mid", "a_front", "algorithm"),
        ];

        let plan = Planner::new(&registry).plan(&declared, &state, "h").expect("plan");
        let names: Vec<String> = plan.changes.iter().map(|c| c.address.name.clone()).collect();
        assert_eq!(names, vec!["z_back", "a_front", "m_mid"]);
        assert!(plan.respects_dependencies());
        assert_eq!(plan.changes[1].depends_on, vec![0]);
        assert_eq!(plan.changes[2].depends_on, vec![1]);
    }

    #[test]
    fn test_reference_to_replaced_resource_is_unknown() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "back", "round_robin");
        tracked(&mut state, "front", "round_robin");

        let mut front = lb("front", "round_robin");
        front.attributes.insert(
            String::from("name"),
            Expr::Reference(ResourceRef {
                address: addr("back"),
                attribute: String::from("id"),
            }),
        );

        // back is unchanged, so its id is known and front's name becomes it
        let plan = Planner::new(&registry)
            .plan(&[lb("back", "round_robin"), front.clone()], &state, "h")
            .expect("plan");
        let front_change = plan.changes.iter().find(|c| c.address.name == "front").expect("front");
        assert_eq!(front_change.action, Action::Replace);
        assert_eq!(
            front_change.diff.entries["name"].new,
            Some(AttributeValue::string("id-back"))
        );

        // back is replaced, so front's reference is unknown until apply
        let plan = Planner::new(&registry)
            .plan(&[lb("back", "least_connections"), front], &state, "h")
            .expect("plan");
        let front_change = plan.changes.iter().find(|c| c.address.name == "front").expect("front");
        assert_eq!(front_change.diff.entries["name"].new, Some(AttributeValue::Unknown));
        assert_eq!(front_change.action, Action::Replace);
    }

    #[test]
    fn test_cycle_fails_before_any_change() {
        let registry = registry();
        let state = StateSnapshot::new("p", "dev");
        let declared = vec![referencing("a", "b", "algorithm"), referencing("b", "a", "algorithm")];

        let err = Planner::new(&registry).plan(&declared, &state, "h").unwrap_err();
        assert!(matches!(err, TerraceError::Plan(PlanError::GraphCycle { .. })));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let registry = registry();
        let state = StateSnapshot::new("p", "dev");
        let err = Planner::new(&registry)
            .plan(&[referencing("a", "ghost", "algorithm")], &state, "h")
            .unwrap_err();
        assert!(matches!(err, TerraceError::Plan(PlanError::UnknownDependency { .. })));
    }

    #[test]
    fn test_unregistered_type_rejected() {
        let registry = PluginRegistry::new();
        let state = StateSnapshot::new("p", "dev");
        let err = Planner::new(&registry)
            .plan(&[lb("web", "round_robin")], &state, "h")
            .unwrap_err();
        assert!(matches!(err, TerraceError::Plan(PlanError::PluginNotFound { .. })));
    }

    #[test]
    fn test_removed_resource_deleted_dependents_first() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "back", "round_robin");
        tracked(&mut state, "front", "round_robin");
        if let Some(front) = state.get_mut(&addr("front")) {
            front.dependencies.insert(addr("back"));
        }

        let plan = Planner::new(&registry).plan(&[], &state, "h").expect("plan");
        assert_eq!(
            actions(&plan),
            vec![(String::from("front"), Action::Delete), (String::from("back"), Action::Delete)]
        );
        assert_eq!(plan.changes[0].prior_id.as_deref(), Some("id-front"));
        assert_eq!(plan.changes[1].depends_on, vec![0]);
        assert!(plan.respects_dependencies());
    }

    #[test]
    fn test_orphan_waits_for_former_dependent_update() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "old", "round_robin");
        tracked(&mut state, "web", "round_robin");
        if let Some(web) = state.get_mut(&addr("web")) {
            web.dependencies.insert(addr("old"));
        }

        let plan = Planner::new(&registry)
            .plan(&[lb("web", "round_robin")], &state, "h")
            .expect("plan");
        assert_eq!(
            actions(&plan),
            vec![(String::from("web"), Action::NoOp), (String::from("old"), Action::Delete)]
        );
        assert_eq!(plan.changes[1].depends_on, vec![0]);
    }

    #[test]
    fn test_deposed_objects_deleted_before_owner() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "web", "round_robin");
        if let Some(web) = state.get_mut(&addr("web")) {
            web.deposed.push(String::from("old-1"));
        }

        let plan = Planner::new(&registry)
            .plan(&[lb("web", "round_robin")], &state, "h")
            .expect("plan");
        assert_eq!(plan.changes.len(), 2);
        assert!(plan.changes[0].deposed);
        assert_eq!(plan.changes[0].prior_id.as_deref(), Some("old-1"));
        assert_eq!(plan.changes[1].depends_on, vec![0]);
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_plan_destroy_deletes_everything() {
        let registry = registry();
        let mut state = StateSnapshot::new("p", "dev");
        tracked(&mut state, "a", "round_robin");
        tracked(&mut state, "b", "round_robin");

        let plan = Planner::new(&registry).plan_destroy(&state).expect("plan");
        assert_eq!(plan.count(Action::Delete), 2);
        assert!(plan.to_string().contains("- fake_lb.a"));
    }
}
