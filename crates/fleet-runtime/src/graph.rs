//! # Dependency Graph
//!
//! Startup ordering for the enabled nodes.
//!
//! ## Edges
//!
//! - `requires`: hard edge. Satisfied by a node of that name or by every node
//!   whose `provides` contains it. Unsatisfied requirements reject the fleet.
//! - `optional`: ordering-only edge, used when the target is present.
//! - `conflicts`: two enabled conflicting nodes reject the fleet.
//!
//! ## Ordering
//!
//! Leaf-first. Among nodes whose predecessors are all placed, `High` priority
//! goes before `Medium` before `Low`, then by name.

use std::collections::{BTreeMap, BTreeSet};

use fleet_types::{ConfigError, NodeDescriptor, Priority};

#[derive(Debug, Clone)]
struct GraphNode {
    priority: Priority,
    /// Resolved providers of every `requires` entry.
    required: BTreeSet<String>,
    /// Present `optional` targets (resolved the same way).
    optional: BTreeSet<String>,
}

impl GraphNode {
    fn predecessors(&self) -> impl Iterator<Item = &String> {
        self.required.iter().chain(self.optional.iter())
    }
}

/// Resolved dependency graph of the enabled fleet.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, GraphNode>,
}

impl DependencyGraph {
    /// Build from descriptors. Disabled descriptors are ignored.
    pub fn build<'a, I>(descriptors: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = &'a NodeDescriptor>,
    {
        let enabled: Vec<&NodeDescriptor> =
            descriptors.into_iter().filter(|d| d.enabled).collect();

        let names: BTreeSet<&str> = enabled.iter().map(|d| d.name.as_str()).collect();
        let mut providers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for desc in &enabled {
            providers
                .entry(desc.name.as_str())
                .or_default()
                .insert(desc.name.as_str());
            for cap in &desc.provides {
                providers
                    .entry(cap.as_str())
                    .or_default()
                    .insert(desc.name.as_str());
            }
        }

        // Conflicts are checked before resolution.
        for desc in &enabled {
            if let Some(other) = desc.conflicts.iter().find(|c| names.contains(c.as_str())) {
                return Err(ConfigError::ConflictViolation {
                    node: desc.name.clone(),
                    other: other.clone(),
                });
            }
        }

        let resolve = |node: &str, target: &str| -> BTreeSet<String> {
            providers
                .get(target)
                .map(|set| {
                    set.iter()
                        .filter(|p| **p != node)
                        .map(|p| p.to_string())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut nodes = BTreeMap::new();
        for desc in &enabled {
            let mut required = BTreeSet::new();
            for dep in &desc.requires {
                let resolved = resolve(&desc.name, dep);
                if resolved.is_empty() {
                    return Err(ConfigError::UnresolvedDependency {
                        node: desc.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                required.extend(resolved);
            }

            let mut optional = BTreeSet::new();
            for dep in &desc.optional {
                optional.extend(resolve(&desc.name, dep));
            }
            optional.retain(|d| !required.contains(d));

            nodes.insert(
                desc.name.clone(),
                GraphNode {
                    priority: desc.priority,
                    required,
                    optional,
                },
            );
        }

        Ok(Self { nodes })
    }

    /// Find one cycle, returned as its members in edge order.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = self
            .nodes
            .keys()
            .map(|k| (k.as_str(), Mark::Unvisited))
            .collect();

        for start in self.nodes.keys() {
            if marks[start.as_str()] != Mark::Unvisited {
                continue;
            }

            // Iterative DFS; `path` is the current chain of InProgress nodes.
            let mut path: Vec<&str> = vec![start.as_str()];
            let mut stack: Vec<Vec<&str>> = vec![self.successors(start)];
            marks.insert(start.as_str(), Mark::InProgress);

            while let Some(pending) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => match marks[next] {
                        Mark::InProgress => {
                            let from = path.iter().position(|n| *n == next).unwrap_or(0);
                            return Some(path[from..].iter().map(|s| s.to_string()).collect());
                        }
                        Mark::Unvisited => {
                            marks.insert(next, Mark::InProgress);
                            path.push(next);
                            stack.push(self.successors(next));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        stack.pop();
                        if let Some(done) = path.pop() {
                            marks.insert(done, Mark::Done);
                        }
                    }
                }
            }
        }
        None
    }

    fn successors(&self, node: &str) -> Vec<&str> {
        let mut next: Vec<&str> = self
            .nodes
            .get(node)
            .map(|n| n.predecessors().map(String::as_str).collect())
            .unwrap_or_default();
        // Popped from the back, so reverse to visit in name order.
        next.reverse();
        next
    }

    /// Leaf-first launch order.
    pub fn topological_order(&self) -> Result<Vec<String>, ConfigError> {
        if let Some(members) = self.detect_cycle() {
            return Err(ConfigError::DependencyCycle { members });
        }

        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.predecessors().count()))
            .collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, node) in &self.nodes {
            for dep in node.predecessors() {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut ready: BTreeSet<(Priority, &str)> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| (self.nodes[*name].priority, *name))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, name)) = ready.pop_first() {
            order.push(name.to_string());
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert((self.nodes[*dependent].priority, *dependent));
                    }
                }
            }
        }

        Ok(order)
    }

    /// Resolved required providers of `node`.
    pub fn dependencies_of(&self, node: &str) -> Vec<String> {
        self.nodes
            .get(node)
            .map(|n| n.required.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes that hard-require `node`.
    pub fn dependents_of(&self, node: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.required.contains(node))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
