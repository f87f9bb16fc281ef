//! Dependency graph over services

use super::service::{DependencyCondition, Project};
use crate::error::{DeployError, Result};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed graph of `depends_on` edges
///
/// Node indices follow declaration order and every traversal breaks ties by
/// that index, so identical input always yields identical output.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `edges[a]` holds what `a` depends on
    edges: Vec<Vec<(usize, DependencyCondition)>>,
    /// `reverse[a]` holds what depends on `a`
    reverse: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph of a project
    ///
    /// Edges to unknown services are skipped; the validator reports them.
    pub fn from_project(project: &Project) -> Self {
        let mut graph = Self::new();
        for service in &project.services {
            graph.add_node(&service.name);
        }
        for edge in project.edges() {
            graph.add_edge(&edge.from, &edge.to, edge.condition);
        }
        graph
    }

    /// Add a node, keeping the first declaration position
    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        self.edges.push(Vec::new());
        self.reverse.push(Vec::new());
        idx
    }

    /// Add an edge meaning `from` depends on `to`; ignored when either is unknown
    pub fn add_edge(&mut self, from: &str, to: &str, condition: DependencyCondition) {
        let (Some(&f), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if self.edges[f].iter().any(|(d, _)| *d == t) {
            return;
        }
        self.edges[f].push((t, condition));
        self.reverse[t].push(f);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct dependencies of a node with their conditions
    pub fn dependencies(&self, name: &str) -> Vec<(String, DependencyCondition)> {
        self.index
            .get(name)
            .map(|&i| {
                self.edges[i]
                    .iter()
                    .map(|(d, c)| (self.nodes[*d].clone(), *c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes that directly depend on `name`
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.index
            .get(name)
            .map(|&i| self.reverse[i].iter().map(|d| self.nodes[*d].clone()).collect())
            .unwrap_or_default()
    }

    /// Nodes that depend on `name` directly or transitively, in declaration order
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &dependent in &self.reverse[node] {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        seen.into_iter().map(|i| self.nodes[i].clone()).collect()
    }

    /// Fail with the first cycle found by a three-color depth-first traversal
    pub fn check_acyclic(&self) -> Result<()> {
        let mut colors = vec![Color::White; self.nodes.len()];
        let mut path = Vec::new();

        for start in 0..self.nodes.len() {
            if colors[start] == Color::White {
                if let Some(cycle) = self.visit(start, &mut colors, &mut path) {
                    return Err(DeployError::CyclicDependency {
                        path: cycle.into_iter().map(|i| self.nodes[i].clone()).collect(),
                    });
                }
            }
        }

        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &(dep, _) in &self.edges[node] {
            match colors[dep] {
                Color::White => {
                    if let Some(cycle) = self.visit(dep, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    // back edge: the cycle is the path suffix starting at `dep`
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    /// Dependencies-first ordering with ties broken by declaration order
    pub fn topological_order(&self) -> Result<Vec<String>> {
        self.check_acyclic()?;

        let mut remaining: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> =
            (0..self.nodes.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(self.nodes[node].clone());
            for &dependent in &self.reverse[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        Ok(order)
    }

    /// Groups of nodes whose dependencies are all in earlier groups
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        self.check_acyclic()?;

        let mut remaining: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut current: Vec<usize> =
            (0..self.nodes.len()).filter(|&i| remaining[i] == 0).collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for &node in &current {
                for &dependent in &self.reverse[node] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.insert(dependent);
                    }
                }
            }
            levels.push(current.iter().map(|&i| self.nodes[i].clone()).collect());
            current = next.into_iter().collect();
        }

        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(n);
        }
        for (from, to) in edges {
            g.add_edge(from, to, DependencyCondition::Started);
        }
        g
    }

    fn assert_consistent(order: &[String], edges: &[(&str, &str)]) {
        for (from, to) in edges {
            let f = order.iter().position(|s| s == from).unwrap();
            let t = order.iter().position(|s| s == to).unwrap();
            assert!(t < f, "{} must come before {}", to, from);
        }
    }

    #[test]
    fn test_topological_order() {
        let edges = [("web", "api"), ("api", "db")];
        let g = graph(&["web", "api", "db"], &edges);
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["db", "api", "web"]);
        assert_consistent(&order, &edges);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let g = graph(&["zeta", "alpha", "mid"], &[]);
        assert_eq!(g.topological_order().unwrap(), vec!["zeta", "alpha", "mid"]);

        let edges = [("app", "postgres"), ("app", "neo4j")];
        let g = graph(&["app", "postgres", "neo4j"], &edges);
        assert_eq!(g.topological_order().unwrap(), vec!["postgres", "neo4j", "app"]);
    }

    #[test]
    fn test_cycle_path_is_a_cycle() {
        let edges = [("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")];
        let g = graph(&["a", "b", "c", "d"], &edges);

        let err = g.topological_order().unwrap_err();
        let DeployError::CyclicDependency { path } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(path, vec!["a", "b", "c", "a"]);
        assert_eq!(path.first(), path.last());
        for pair in path.windows(2) {
            assert!(edges.contains(&(pair[0].as_str(), pair[1].as_str())));
        }
    }

    #[test]
    fn test_cycle_not_through_first_node() {
        let g = graph(&["x", "y", "z"], &[("x", "y"), ("y", "z"), ("z", "y")]);
        let Err(DeployError::CyclicDependency { path }) = g.check_acyclic() else {
            panic!("expected cycle error");
        };
        assert_eq!(path, vec!["y", "z", "y"]);
    }

    #[test]
    fn test_levels_and_dependents() {
        let g = graph(
            &["app", "postgres", "neo4j", "worker"],
            &[("app", "postgres"), ("app", "neo4j"), ("worker", "app")],
        );
        assert_eq!(
            g.levels().unwrap(),
            vec![
                vec!["postgres".to_string(), "neo4j".to_string()],
                vec!["app".to_string()],
                vec!["worker".to_string()],
            ]
        );
        assert_eq!(g.dependents("postgres"), vec!["app"]);
        assert_eq!(g.transitive_dependents("postgres"), vec!["app", "worker"]);
        assert!(g.transitive_dependents("worker").is_empty());
    }

    #[test]
    fn test_unknown_edges_ignored() {
        let g = graph(&["a"], &[("a", "missing")]);
        assert!(g.dependencies("a").is_empty());
        assert_eq!(g.topological_order().unwrap(), vec!["a"]);
    }
}
