// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Bead dependency graph with the algorithms scheduling needs.
//!
//! The graph is encoded as id-keyed adjacency maps, never pointer webs:
//! a forward map (`blocker -> blocked`) and its mirror reverse map. A bead B
//! carrying `{blocks, A}` contributes the forward edge `B -> A`. Edges may
//! point at beads outside the universe handed to `build` (external blockers
//! are real), but traversals stay inside the universe.

use std::collections::{HashMap, HashSet};

use crate::beads::{Bead, BeadStatus};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// blocker id -> ids it blocks
    forward: HashMap<String, Vec<String>>,
    /// blocked id -> ids blocking it
    reverse: HashMap<String, Vec<String>>,
    /// every bead id handed to `build`
    universe: HashSet<String>,
    /// beads with no currently-open predecessor
    roots: HashSet<String>,
}

impl DependencyGraph {
    /// Build forward/reverse edges from the observed beads.
    ///
    /// Self-consistency invariant: `v ∈ forward[u] ⇔ u ∈ reverse[v]`.
    pub fn build(beads: &[Bead]) -> Self {
        let mut forward: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        let mut universe = HashSet::new();

        for bead in beads {
            universe.insert(bead.id.clone());
            forward.entry(bead.id.clone()).or_default();
            reverse.entry(bead.id.clone()).or_default();
        }

        for bead in beads {
            for target in bead.blocks_targets() {
                forward
                    .entry(bead.id.clone())
                    .or_default()
                    .push(target.to_string());
                reverse
                    .entry(target.to_string())
                    .or_default()
                    .push(bead.id.clone());
            }
        }

        let status_by_id: HashMap<&str, BeadStatus> =
            beads.iter().map(|b| (b.id.as_str(), b.status)).collect();

        let mut roots = HashSet::new();
        for bead in beads {
            let has_open_predecessor = reverse
                .get(&bead.id)
                .map(|preds| {
                    preds.iter().any(|p| {
                        status_by_id.get(p.as_str()).copied() == Some(BeadStatus::Open)
                    })
                })
                .unwrap_or(false);
            if !has_open_predecessor {
                roots.insert(bead.id.clone());
            }
        }

        Self {
            forward,
            reverse,
            universe,
            roots,
        }
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.universe.contains(id)
    }

    pub fn universe(&self) -> impl Iterator<Item = &String> {
        self.universe.iter()
    }

    pub fn len(&self) -> usize {
        self.universe.len()
    }

    pub fn is_empty(&self) -> bool {
        self.universe.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = &String> {
        self.roots.iter()
    }

    /// Tarjan's strongly-connected components, returning only components
    /// with more than one node. Edges leaving the universe are skipped.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        struct TarjanState<'a> {
            graph: &'a DependencyGraph,
            index: usize,
            indices: HashMap<&'a str, usize>,
            lowlinks: HashMap<&'a str, usize>,
            stack: Vec<&'a str>,
            on_stack: HashSet<&'a str>,
            components: Vec<Vec<String>>,
        }

        fn strongconnect<'a>(state: &mut TarjanState<'a>, v: &'a str) {
            state.indices.insert(v, state.index);
            state.lowlinks.insert(v, state.index);
            state.index += 1;
            state.stack.push(v);
            state.on_stack.insert(v);

            let graph = state.graph;
            for w in graph.successors(v) {
                let w = w.as_str();
                if !graph.universe.contains(w) {
                    continue; // external reference
                }
                if !state.indices.contains_key(w) {
                    // Re-borrow the id from the universe set so it outlives
                    // this frame.
                    let w = graph.universe.get(w).unwrap().as_str();
                    strongconnect(state, w);
                    let low = state.lowlinks[w].min(state.lowlinks[v]);
                    state.lowlinks.insert(v, low);
                } else if state.on_stack.contains(w) {
                    let low = state.indices[w].min(state.lowlinks[v]);
                    state.lowlinks.insert(v, low);
                }
            }

            if state.lowlinks[v] == state.indices[v] {
                let mut component = Vec::new();
                while let Some(w) = state.stack.pop() {
                    state.on_stack.remove(w);
                    component.push(w.to_string());
                    if w == v {
                        break;
                    }
                }
                if component.len() > 1 {
                    component.sort();
                    state.components.push(component);
                }
            }
        }

        let mut state = TarjanState {
            graph: self,
            index: 0,
            indices: HashMap::new(),
            lowlinks: HashMap::new(),
            stack: Vec::new(),
            on_stack: HashSet::new(),
            components: Vec::new(),
        };

        for v in &self.universe {
            if !state.indices.contains_key(v.as_str()) {
                strongconnect(&mut state, v.as_str());
            }
        }

        state.components.sort();
        state.components
    }

    /// Fan-out metric: transitively-reachable successor *edges* from `id`.
    ///
    /// Every traversed edge counts one; the subtree under an
    /// already-visited node is not re-explored. Diamonds therefore count
    /// the shared descendant edge once per incoming parent, which is the
    /// scheduling signal we want: a bead feeding two paths to the same
    /// sink matters more than one feeding a single path.
    pub fn impact_depth(&self, id: &str) -> usize {
        fn walk(graph: &DependencyGraph, node: &str, visited: &mut HashSet<String>) -> usize {
            let mut count = 0;
            for succ in graph.successors(node) {
                if !graph.universe.contains(succ) {
                    continue;
                }
                count += 1;
                if visited.insert(succ.clone()) {
                    count += walk(graph, succ, visited);
                }
            }
            count
        }

        let mut visited = HashSet::new();
        visited.insert(id.to_string());
        walk(self, id, &mut visited)
    }

    /// Kahn's algorithm over the universe. `None` means a cycle: the
    /// produced order came up short.
    pub fn topological_sort(&self) -> Option<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = self
            .universe
            .iter()
            .map(|id| {
                let count = self
                    .predecessors(id)
                    .iter()
                    .filter(|p| self.universe.contains(p.as_str()))
                    .count();
                (id.as_str(), count)
            })
            .collect();

        let mut queue: Vec<&str> = indegree
            .iter()
            .filter_map(|(id, &count)| (count == 0).then_some(*id))
            .collect();
        let mut order = Vec::with_capacity(self.universe.len());

        while let Some(id) = queue.pop() {
            order.push(id.to_string());
            for succ in self.successors(id) {
                if let Some(count) = indegree.get_mut(succ.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push(self.universe.get(succ.as_str()).unwrap().as_str());
                    }
                }
            }
        }

        if order.len() == self.universe.len() {
            Some(order)
        } else {
            None // contains cycle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::{BeadDependency, BeadKind, DEP_TYPE_BLOCKS};
    use chrono::Utc;

    fn bead(id: &str, blocks: &[&str]) -> Bead {
        bead_with_status(id, blocks, BeadStatus::Open)
    }

    fn bead_with_status(id: &str, blocks: &[&str], status: BeadStatus) -> Bead {
        Bead {
            id: id.to_string(),
            title: id.to_string(),
            description: None,
            kind: BeadKind::Task,
            status,
            priority: 0,
            created_at: Utc::now(),
            labels: vec![],
            dependencies: blocks
                .iter()
                .map(|t| BeadDependency {
                    dep_type: DEP_TYPE_BLOCKS.to_string(),
                    target: t.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn forward_and_reverse_mirror_each_other() {
        // a blocks b and c; b blocks d; c blocks d
        let beads = vec![
            bead("a", &["b", "c"]),
            bead("b", &["d"]),
            bead("c", &["d"]),
            bead("d", &[]),
        ];
        let graph = DependencyGraph::build(&beads);

        for id in ["a", "b", "c", "d"] {
            for succ in graph.successors(id) {
                assert!(
                    graph.predecessors(succ).contains(&id.to_string()),
                    "edge {id}->{succ} missing from reverse map"
                );
            }
            for pred in graph.predecessors(id) {
                assert!(
                    graph.successors(pred).contains(&id.to_string()),
                    "edge {pred}->{id} missing from forward map"
                );
            }
        }
    }

    #[test]
    fn roots_exclude_beads_with_open_blockers() {
        let beads = vec![
            bead("a", &["b"]),
            bead("b", &[]),
            bead_with_status("c", &["d"], BeadStatus::Closed),
            bead("d", &[]),
        ];
        let graph = DependencyGraph::build(&beads);
        let roots: HashSet<&String> = graph.roots().collect();

        // b is blocked by open a; d's blocker c is closed.
        assert!(roots.contains(&"a".to_string()));
        assert!(!roots.contains(&"b".to_string()));
        assert!(roots.contains(&"d".to_string()));
    }

    #[test]
    fn detect_cycles_finds_two_node_cycle() {
        let beads = vec![bead("a", &["b"]), bead("b", &["a"]), bead("c", &[])];
        let graph = DependencyGraph::build(&beads);
        let cycles = graph.detect_cycles();
        assert_eq!(cycles, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn detect_cycles_empty_on_dag() {
        let beads = vec![
            bead("a", &["b", "c"]),
            bead("b", &["d"]),
            bead("c", &["d"]),
            bead("d", &[]),
        ];
        let graph = DependencyGraph::build(&beads);
        assert!(graph.detect_cycles().is_empty());
    }

    #[test]
    fn external_edges_do_not_create_cycles() {
        // a blocks an id outside the universe; nothing in-universe cycles.
        let beads = vec![bead("a", &["external-1"]), bead("b", &[])];
        let graph = DependencyGraph::build(&beads);
        assert!(graph.detect_cycles().is_empty());
        assert!(graph.topological_sort().is_some());
    }

    #[test]
    fn cycle_means_short_topological_order() {
        let beads = vec![bead("a", &["b"]), bead("b", &["a"])];
        let graph = DependencyGraph::build(&beads);
        assert!(!graph.detect_cycles().is_empty());
        assert!(graph.topological_sort().is_none());
    }

    #[test]
    fn topological_sort_respects_edges() {
        let beads = vec![
            bead("a", &["b", "c"]),
            bead("b", &["d"]),
            bead("c", &["d"]),
            bead("d", &[]),
        ];
        let graph = DependencyGraph::build(&beads);
        let order = graph.topological_sort().unwrap();
        assert_eq!(order.len(), 4);

        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn impact_depth_counts_chain_edges() {
        let beads = vec![bead("a", &["b"]), bead("b", &["c"]), bead("c", &[])];
        let graph = DependencyGraph::build(&beads);
        assert_eq!(graph.impact_depth("a"), 2);
        assert_eq!(graph.impact_depth("b"), 1);
        assert_eq!(graph.impact_depth("c"), 0);
    }

    #[test]
    fn impact_depth_diamond_counts_shared_edge_twice() {
        // a -> b -> d, a -> c -> d: from a the edge into d is reached via
        // both parents and counts each time, so impact(a) = 4.
        let beads = vec![
            bead("a", &["b", "c"]),
            bead("b", &["d"]),
            bead("c", &["d"]),
            bead("d", &[]),
        ];
        let graph = DependencyGraph::build(&beads);
        assert_eq!(graph.impact_depth("a"), 4);
        assert_eq!(graph.impact_depth("b"), 1);
        assert_eq!(graph.impact_depth("d"), 0);
    }

    #[test]
    fn impact_depth_ignores_external_successors() {
        let beads = vec![bead("a", &["b", "ext-9"]), bead("b", &[])];
        let graph = DependencyGraph::build(&beads);
        assert_eq!(graph.impact_depth("a"), 1);
    }

    #[test]
    fn empty_graph_behaves() {
        let graph = DependencyGraph::build(&[]);
        assert!(graph.is_empty());
        assert!(graph.detect_cycles().is_empty());
        assert_eq!(graph.topological_sort().unwrap(), Vec::<String>::new());
    }
}
