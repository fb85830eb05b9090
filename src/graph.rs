//! Resource dependency graph.
//!
//! Orders resources so that every resource comes after the resources it
//! depends on. Sorting is Kahn's algorithm with a name-ordered ready set, so
//! the same input always yields the same order and ties go to the
//! alphabetically smaller name.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ResourceSpec;
use crate::error::DependencyError;

/// Dependency graph over resource names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceGraph {
    /// Node -> the nodes it depends on. Only edges between nodes of the graph
    /// are kept.
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    /// Builds the graph of a spec set.
    ///
    /// Dependencies naming resources outside the set are ignored; use
    /// [`ResourceGraph::check_references`] to reject them.
    #[must_use]
    pub fn new(specs: &[ResourceSpec]) -> Self {
        Self::from_edges(specs.iter().map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str))))
    }

    /// Builds a graph from `(name, dependencies)` pairs.
    pub fn from_edges<'a, I, D>(edges: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let raw: Vec<(&str, Vec<&str>)> = edges
            .into_iter()
            .map(|(name, deps)| (name, deps.into_iter().collect()))
            .collect();

        let nodes: BTreeSet<&str> = raw.iter().map(|(name, _)| *name).collect();

        let dependencies = raw
            .into_iter()
            .map(|(name, deps)| {
                let deps = deps
                    .into_iter()
                    .filter(|d| nodes.contains(d))
                    .map(str::to_string)
                    .collect();
                (name.to_string(), deps)
            })
            .collect();

        Self { dependencies }
    }

    /// Checks that every dependency names another spec of the set.
    ///
    /// # Errors
    ///
    /// Returns `DependencyError::SelfReference` or
    /// `DependencyError::Unresolved` for the first offending spec.
    pub fn check_references(specs: &[ResourceSpec]) -> Result<(), DependencyError> {
        let names: BTreeSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();

        for spec in specs {
            for dependency in &spec.depends_on {
                if dependency == &spec.name {
                    return Err(DependencyError::SelfReference {
                        resource: spec.name.clone(),
                    });
                }
                if !names.contains(dependency.as_str()) {
                    return Err(DependencyError::Unresolved {
                        resource: spec.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Returns true if `name` is a node of the graph.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    /// Returns the in-graph dependencies of a node.
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Returns the in-graph dependents of a node.
    pub fn dependents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.dependencies
            .iter()
            .filter(move |(_, deps)| deps.contains(name))
            .map(|(node, _)| node.as_str())
    }

    /// Returns the subgraph over `names`.
    ///
    /// Ordering through nodes left out is preserved: if `a` reaches `c` only
    /// through an excluded `b`, the subgraph still orders `c` before `a`.
    #[must_use]
    pub fn restricted<'a, I>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keep: BTreeSet<&str> = names.into_iter().filter(|n| self.contains(n)).collect();

        let dependencies = keep
            .iter()
            .map(|&name| {
                let reached = self
                    .reachable_from(name)
                    .into_iter()
                    .filter(|n| *n != name && keep.contains(n))
                    .map(str::to_string)
                    .collect();
                (name.to_string(), reached)
            })
            .collect();

        Self { dependencies }
    }

    fn reachable_from<'a>(&'a self, start: &'a str) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies_of(start).collect();

        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.dependencies_of(node));
            }
        }

        seen
    }

    /// Returns the creation order: every node after all of its dependencies.
    ///
    /// # Errors
    ///
    /// Returns `DependencyError::Cycle` naming every node that could not be
    /// ordered.
    pub fn build_order(&self) -> Result<Vec<String>, DependencyError> {
        Self::kahn(&self.dependencies)
    }

    /// Returns the teardown order: every node before all of its dependencies.
    ///
    /// # Errors
    ///
    /// Returns `DependencyError::Cycle` naming every node that could not be
    /// ordered.
    pub fn build_reverse_order(&self) -> Result<Vec<String>, DependencyError> {
        let mut reversed: BTreeMap<String, BTreeSet<String>> = self
            .dependencies
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();

        for (node, deps) in &self.dependencies {
            for dep in deps {
                if let Some(dependents) = reversed.get_mut(dep) {
                    dependents.insert(node.clone());
                }
            }
        }

        Self::kahn(&reversed)
    }

    fn kahn(edges: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>, DependencyError> {
        let mut remaining: BTreeMap<&str, usize> = edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut unblocks: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (node, deps) in edges {
            for dep in deps {
                unblocks.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut order = Vec::with_capacity(edges.len());

        while let Some(node) = ready.pop_first() {
            order.push(node.to_string());
            remaining.remove(node);

            for &next in unblocks.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(order)
        } else {
            Err(DependencyError::Cycle {
                participants: remaining.keys().map(|n| (*n).to_string()).collect(),
            })
        }
    }
}
