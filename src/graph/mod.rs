//! The dependency graph: `Component` storage, insertion and the
//! deterministic topological ordering the reconciler and garbage
//! collector both walk.
//!
//! Grounded on the teacher's `cmd/structs.rs` style of small, serde-able
//! value types, generalized from Qovery's per-cloud resource graph
//! (which is implicit in `deployment_action` ordering) into the
//! explicit, spec-mandated `Component`/`DependencyGraph` pair.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// `"{name}_{namespace}_{kind}"`, with an empty namespace collapsing to
/// `""` (cluster-scoped objects, e.g. a `ClusterRole` or a `Namespace`
/// itself).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(name: &str, namespace: &str, kind: &str) -> Self {
        ComponentId(format!("{name}_{namespace}_{kind}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ComponentId {
    fn from(value: String) -> Self {
        ComponentId(value)
    }
}

/// A GVK+name+namespace reference used by `HelmReleaseContent::patches`
/// to target rendered template output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(flatten)]
    pub target: ObjectRef,
    /// A strategic-merge patch body applied onto the rendered object.
    pub patch: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartAuth {
    pub secret_ref: Option<String>,
    pub workload_identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartReference {
    pub name: String,
    pub repo_url: String,
    pub version: String,
    #[serde(default)]
    pub auth: Option<ChartAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdPolicy {
    pub allow_upgrade: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelmReleaseContent {
    pub name: String,
    pub namespace: String,
    pub chart: ChartReference,
    #[serde(default)]
    pub values: Value,
    pub crds: CrdPolicy,
    #[serde(default)]
    pub patches: Vec<Patch>,
}

/// A unit of desired state: either an unstructured Kubernetes manifest or
/// a Helm release declaration. See spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Component {
    Manifest {
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        content: Value,
    },
    HelmRelease {
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        content: HelmReleaseContent,
    },
}

impl Component {
    pub fn id(&self) -> &ComponentId {
        match self {
            Component::Manifest { id, .. } => id,
            Component::HelmRelease { id, .. } => id,
        }
    }

    pub fn dependencies(&self) -> &[ComponentId] {
        match self {
            Component::Manifest { dependencies, .. } => dependencies,
            Component::HelmRelease { dependencies, .. } => dependencies,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GraphError {
    #[error("component {0} already present with different content")]
    Conflict(ComponentId),
    #[error("component {component} declares dependency {dependency} which is not present in the graph")]
    MissingDependency { component: ComponentId, dependency: ComponentId },
    #[error("dependency cycle detected, involving: {0:?}")]
    Cycle(Vec<ComponentId>),
}

/// A set of `Component` nodes keyed by [`ComponentId`], built once per
/// reconcile pass and discarded after.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ComponentId, Component>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph { nodes: BTreeMap::new() }
    }

    /// Idempotent on ID: re-inserting the identical component is a no-op.
    /// Inserting a different component under an ID already present is a
    /// conflict.
    pub fn insert(&mut self, component: Component) -> Result<(), GraphError> {
        let id = component.id().clone();
        match self.nodes.get(&id) {
            None => {
                self.nodes.insert(id, component);
                Ok(())
            }
            Some(existing) if existing == &component => Ok(()),
            Some(_) => Err(GraphError::Conflict(id)),
        }
    }

    pub fn get(&self, id: &ComponentId) -> Option<&Component> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ComponentId> {
        self.nodes.keys()
    }

    /// Kahn's algorithm: repeatedly emit the lexicographically smallest
    /// ID among nodes whose dependencies have all been emitted. Fails
    /// with [`GraphError::MissingDependency`] if an edge points outside
    /// the graph, or [`GraphError::Cycle`] naming every node that never
    /// became emittable.
    pub fn topological_sort(&self) -> Result<Vec<ComponentId>, GraphError> {
        for component in self.nodes.values() {
            for dep in component.dependencies() {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        component: component.id().clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut indegree: BTreeMap<ComponentId, usize> =
            self.nodes.keys().map(|id| (id.clone(), 0)).collect();
        let mut dependents: BTreeMap<ComponentId, Vec<ComponentId>> = BTreeMap::new();
        for component in self.nodes.values() {
            *indegree.get_mut(component.id()).unwrap() += component.dependencies().len();
            for dep in component.dependencies() {
                dependents.entry(dep.clone()).or_default().push(component.id().clone());
            }
        }

        // BTreeSet keeps the ready set ordered, giving the lexicographic
        // tie-break the determinism property requires "for free".
        let mut ready: BTreeSet<ComponentId> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.iter().next().cloned() {
            ready.remove(&next);
            order.push(next.clone());
            if let Some(children) = dependents.get(&next) {
                // stable iteration order (Vec preserves insertion order of edges)
                let mut newly_ready = VecDeque::new();
                for child in children {
                    let deg = indegree.get_mut(child).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push_back(child.clone());
                    }
                }
                ready.extend(newly_ready);
            }
        }

        if order.len() != self.nodes.len() {
            let remaining: Vec<ComponentId> = self
                .nodes
                .keys()
                .filter(|id| !order.contains(id))
                .cloned()
                .collect();
            return Err(GraphError::Cycle(remaining));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str, deps: &[&str]) -> Component {
        Component::Manifest {
            id: ComponentId::new(name, "ns", "ConfigMap"),
            dependencies: deps.iter().map(|d| ComponentId::new(d, "ns", "ConfigMap")).collect(),
            content: serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}}),
        }
    }

    #[test]
    fn topological_sort_emits_dependencies_first() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("a", &[])).unwrap();
        graph.insert(manifest("b", &["a"])).unwrap();
        graph.insert(manifest("c", &["a", "b"])).unwrap();

        let order = graph.topological_sort().unwrap();
        let pos = |name: &str| order.iter().position(|id| id == &ComponentId::new(name, "ns", "ConfigMap")).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn tie_break_is_lexicographic_and_deterministic() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("zeta", &[])).unwrap();
        graph.insert(manifest("alpha", &[])).unwrap();
        graph.insert(manifest("mid", &[])).unwrap();

        let order1 = graph.topological_sort().unwrap();
        let order2 = graph.topological_sort().unwrap();
        assert_eq!(order1, order2);
        assert_eq!(
            order1,
            vec![
                ComponentId::new("alpha", "ns", "ConfigMap"),
                ComponentId::new("mid", "ns", "ConfigMap"),
                ComponentId::new("zeta", "ns", "ConfigMap"),
            ]
        );
    }

    #[test]
    fn cycle_is_reported_naming_every_involved_node() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("a", &["b"])).unwrap();
        graph.insert(manifest("b", &["a"])).unwrap();

        let err = graph.topological_sort().unwrap_err();
        match err {
            GraphError::Cycle(ids) => {
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&ComponentId::new("a", "ns", "ConfigMap")));
                assert!(ids.contains(&ComponentId::new("b", "ns", "ConfigMap")));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn missing_dependency_is_an_error() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("a", &["ghost"])).unwrap();
        let err = graph.topological_sort().unwrap_err();
        assert!(matches!(err, GraphError::MissingDependency { .. }));
    }

    #[test]
    fn insert_is_idempotent_on_identical_component_but_conflicts_on_divergence() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("a", &[])).unwrap();
        assert!(graph.insert(manifest("a", &[])).is_ok());
        assert!(graph.insert(manifest("a", &["b"])).is_err());
    }
}
