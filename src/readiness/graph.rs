use super::error::CoordinationError;
use crate::config::stack::{DependencyCondition, ServiceSpec};
use crate::registry::ServiceRegistry;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyEdge {
    pub dependent: String,
    pub dependency: String,
    pub condition: DependencyCondition,
}

#[derive(Clone, Debug)]
pub struct GraphNode {
    pub name: String,
    pub dependencies: Vec<DependencyEdge>,
}

/// Directed graph of "starts after" relations between services.
///
/// Nodes keep declaration order, which is also the tie-break order for
/// services whose relative order the edges leave open.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn build(registry: &ServiceRegistry) -> Self {
        Self::from_specs(registry.iter().map(|spec| spec.as_ref()))
    }

    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a ServiceSpec>) -> Self {
        let mut graph = Self::default();
        for spec in specs {
            let idx = graph.ensure_node(&spec.name);
            for dependency in &spec.depends_on {
                graph.nodes[idx].dependencies.push(DependencyEdge {
                    dependent: spec.name.clone(),
                    dependency: dependency.name.clone(),
                    condition: dependency.condition,
                });
            }
        }
        graph
    }

    /// Builds a graph from bare names and edges. Edges whose dependent is not
    /// listed add that dependent as a new node.
    pub fn from_edges<S: Into<String>>(
        names: impl IntoIterator<Item = S>,
        edges: impl IntoIterator<Item = DependencyEdge>,
    ) -> Self {
        let mut graph = Self::default();
        for name in names {
            graph.ensure_node(&name.into());
        }
        for edge in edges {
            let idx = graph.ensure_node(&edge.dependent);
            graph.nodes[idx].dependencies.push(edge);
        }
        graph
    }

    fn ensure_node(&mut self, name: &str) -> usize {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(GraphNode {
            name: name.to_string(),
            dependencies: Vec::new(),
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.nodes.iter().flat_map(|node| node.dependencies.iter())
    }

    /// Services that declare a dependency on `name`, in declaration order.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| node.dependencies.iter().any(|edge| edge.dependency == name))
            .map(|node| node.name.as_str())
            .collect()
    }

    /// Start order: every service appears after all of its dependencies.
    pub fn resolve(&self) -> Result<Vec<String>, CoordinationError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for idx in 0..self.nodes.len() {
            if marks[idx] == Mark::Unvisited {
                self.visit(idx, &mut marks, &mut path, &mut order)?;
            }
        }

        Ok(order)
    }

    /// Stop order: dependents before the services they depend on.
    pub fn reverse_order(&self) -> Result<Vec<String>, CoordinationError> {
        let mut order = self.resolve()?;
        order.reverse();
        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<String>,
    ) -> Result<(), CoordinationError> {
        marks[idx] = Mark::InProgress;
        path.push(idx);

        let node = &self.nodes[idx];
        for edge in &node.dependencies {
            let Some(&dep) = self.index.get(&edge.dependency) else {
                return Err(CoordinationError::UnknownDependency {
                    service: node.name.clone(),
                    dependency: edge.dependency.clone(),
                });
            };

            match marks[dep] {
                Mark::Done => {}
                Mark::InProgress => return Err(self.cycle_through(dep, path)),
                Mark::Unvisited => self.visit(dep, marks, path, order)?,
            }
        }

        path.pop();
        marks[idx] = Mark::Done;
        order.push(node.name.clone());
        Ok(())
    }

    fn cycle_through(&self, back_edge: usize, path: &[usize]) -> CoordinationError {
        let start = path
            .iter()
            .position(|idx| *idx == back_edge)
            .unwrap_or(0);
        let mut cycle = path[start..]
            .iter()
            .map(|idx| self.nodes[*idx].name.clone())
            .collect::<Vec<_>>();
        cycle.push(self.nodes[back_edge].name.clone());
        CoordinationError::CycleDetected { cycle }
    }
}
