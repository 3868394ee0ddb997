// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Critical-path scheduler over the run bead set.
//!
//! The scheduler is rebuilt from a fresh bead listing before every decision
//! so externally-resolved blockers are observed, then picks the ready bead
//! with the largest downstream impact. Ties fall to priority (lower number
//! first), then creation time.

use std::collections::{HashMap, HashSet};

use crate::beads::{Bead, BeadStatus};
use crate::engine::graph::DependencyGraph;
use crate::errors::{HarnessError, HarnessResult};

pub struct Scheduler {
    /// Bead ids scoped to this run; fixed at decompose time (grows only
    /// through judge remediation, which re-seeds it).
    run_bead_set: HashSet<String>,
    graph: DependencyGraph,
    issue_index: HashMap<String, Bead>,
    impact_cache: HashMap<String, usize>,
    cycles_checked: bool,
}

impl Scheduler {
    pub fn new(run_bead_set: impl IntoIterator<Item = String>) -> Self {
        Self {
            run_bead_set: run_bead_set.into_iter().collect(),
            graph: DependencyGraph::default(),
            issue_index: HashMap::new(),
            impact_cache: HashMap::new(),
            cycles_checked: false,
        }
    }

    pub fn run_bead_set(&self) -> &HashSet<String> {
        &self.run_bead_set
    }

    /// Judge remediation grows the run scope mid-run.
    pub fn extend_run_bead_set(&mut self, ids: impl IntoIterator<Item = String>) {
        self.run_bead_set.extend(ids);
    }

    /// Replace the graph and bead index with a fresh observation.
    pub fn rebuild(&mut self, beads: &[Bead]) {
        self.graph = DependencyGraph::build(beads);
        self.issue_index = beads.iter().map(|b| (b.id.clone(), b.clone())).collect();
        self.impact_cache.clear();
    }

    /// Run once after the first rebuild; a cyclic run graph is fatal.
    pub fn check_cycles(&mut self) -> HarnessResult<()> {
        if self.cycles_checked {
            return Ok(());
        }
        self.cycles_checked = true;

        let cycles = self.graph.detect_cycles();
        if cycles.is_empty() {
            return Ok(());
        }
        let description = cycles
            .iter()
            .map(|c| c.join(" -> "))
            .collect::<Vec<_>>()
            .join("; ");
        Err(HarnessError::GraphCycle(description))
    }

    fn impact(&mut self, id: &str) -> usize {
        if let Some(&cached) = self.impact_cache.get(id) {
            return cached;
        }
        let depth = self.graph.impact_depth(id);
        self.impact_cache.insert(id.to_string(), depth);
        depth
    }

    /// A predecessor is resolved when it is a completed run bead, or an
    /// out-of-run bead the store reports closed.
    fn predecessor_resolved(&self, pred: &str, completed: &HashSet<&str>) -> bool {
        if self.run_bead_set.contains(pred) {
            completed.contains(pred)
        } else {
            self.issue_index
                .get(pred)
                .map(|b| b.status == BeadStatus::Closed)
                .unwrap_or(false)
        }
    }

    fn is_ready(&self, id: &str, completed: &HashSet<&str>) -> bool {
        self.graph
            .predecessors(id)
            .iter()
            .all(|pred| self.predecessor_resolved(pred, completed))
    }

    fn candidate_ids<'a>(
        &'a self,
        completed: &HashSet<&str>,
        in_progress: &HashSet<&str>,
        blocked: &HashSet<&str>,
    ) -> Vec<&'a str> {
        self.run_bead_set
            .iter()
            .map(String::as_str)
            .filter(|id| {
                !completed.contains(id) && !in_progress.contains(id) && !blocked.contains(id)
            })
            .filter(|id| {
                self.issue_index
                    .get(*id)
                    .map(|b| b.status != BeadStatus::Closed)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Pick the next ready bead, ordered by
    /// `(impact depth DESC, priority ASC, created ASC)`.
    pub fn pick_next(
        &mut self,
        completed: &[String],
        in_progress: &[String],
        blocked: &[String],
    ) -> Option<Bead> {
        let completed: HashSet<&str> = completed.iter().map(String::as_str).collect();
        let in_progress: HashSet<&str> = in_progress.iter().map(String::as_str).collect();
        let blocked: HashSet<&str> = blocked.iter().map(String::as_str).collect();

        let mut ready: Vec<String> = self
            .candidate_ids(&completed, &in_progress, &blocked)
            .into_iter()
            .filter(|id| self.is_ready(id, &completed))
            .map(str::to_string)
            .collect();

        for id in &ready {
            self.impact(id);
        }
        ready.sort_by(|a, b| {
            let impact_a = self.impact_cache[a];
            let impact_b = self.impact_cache[b];
            let bead_a = &self.issue_index[a];
            let bead_b = &self.issue_index[b];
            impact_b
                .cmp(&impact_a)
                .then(bead_a.priority.cmp(&bead_b.priority))
                .then(bead_a.created_at.cmp(&bead_b.created_at))
                .then(bead_a.id.cmp(&bead_b.id))
        });

        let picked = ready.first()?;
        self.issue_index.get(picked).cloned()
    }

    /// Deadlocked iff nothing is running, nothing is ready, and some run
    /// bead is still unaccounted for.
    pub fn detect_deadlock(
        &self,
        completed: &[String],
        in_progress: &[String],
        blocked: &[String],
        active_agent_count: usize,
    ) -> bool {
        if active_agent_count > 0 {
            return false;
        }
        let completed_set: HashSet<&str> = completed.iter().map(String::as_str).collect();
        let in_progress_set: HashSet<&str> = in_progress.iter().map(String::as_str).collect();
        let blocked_set: HashSet<&str> = blocked.iter().map(String::as_str).collect();

        let any_ready = self
            .candidate_ids(&completed_set, &in_progress_set, &blocked_set)
            .into_iter()
            .any(|id| self.is_ready(id, &completed_set));
        if any_ready {
            return false;
        }

        self.run_bead_set.iter().any(|id| {
            !completed_set.contains(id.as_str())
                && !in_progress_set.contains(id.as_str())
                && !blocked_set.contains(id.as_str())
        })
    }

    /// Descriptive strings for unready run beads whose unresolved
    /// predecessor lies outside the run scope.
    pub fn detect_external_blockers(
        &self,
        completed: &[String],
        blocked: &[String],
    ) -> Vec<String> {
        let completed_set: HashSet<&str> = completed.iter().map(String::as_str).collect();
        let blocked_set: HashSet<&str> = blocked.iter().map(String::as_str).collect();

        let mut findings = Vec::new();
        let mut ids: Vec<&String> = self.run_bead_set.iter().collect();
        ids.sort();
        for id in ids {
            if completed_set.contains(id.as_str()) || blocked_set.contains(id.as_str()) {
                continue;
            }
            if self.is_ready(id, &completed_set) {
                continue;
            }
            for pred in self.graph.predecessors(id) {
                if self.run_bead_set.contains(pred) {
                    continue;
                }
                if self.predecessor_resolved(pred, &completed_set) {
                    continue;
                }
                let status = self
                    .issue_index
                    .get(pred)
                    .map(|b| b.status.as_str())
                    .unwrap_or("unknown");
                findings.push(format!(
                    "bead {id} is blocked by external bead {pred} (status {status})"
                ));
            }
        }
        findings
    }
}
