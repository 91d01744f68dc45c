//! Wait graph over a plan: who must finish before whom, and who can never run.
//!
//! A node waits on its dependencies and, for root/composite nodes, on its children.
//! Eligibility is a pure function of this graph and the current node statuses.

use std::collections::HashMap;

use crate::plan::{NodeStatus, Plan};

/// Why a pending node can never become eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// One or more dependency ids do not exist in the plan.
    MissingDependencies(Vec<String>),
    /// The node's wait closure contains the node itself.
    Cycle,
}

impl Blocker {
    pub fn reason(&self) -> String {
        match self {
            Blocker::MissingDependencies(ids) => {
                format!("unsatisfiable dependency: missing {}", ids.join(", "))
            }
            Blocker::Cycle => "dependency cycle: node waits on itself".to_string(),
        }
    }
}

/// Index-based wait graph built once per run.
#[derive(Debug, Clone)]
pub struct PlanGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    blockers: Vec<Option<Blocker>>,
}

impl PlanGraph {
    pub fn new(plan: &Plan) -> Self {
        let ids: Vec<String> = plan.nodes.iter().map(|node| node.id.clone()).collect();
        let mut index = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            index.entry(id.clone()).or_insert(i);
        }

        let mut dependencies = Vec::with_capacity(ids.len());
        let mut missing = Vec::with_capacity(ids.len());
        let mut children = vec![Vec::new(); ids.len()];
        for (i, node) in plan.nodes.iter().enumerate() {
            let mut deps = Vec::new();
            let mut absent = Vec::new();
            for dep in &node.dependencies {
                match index.get(dep) {
                    Some(&j) if !deps.contains(&j) => deps.push(j),
                    Some(_) => {}
                    None => absent.push(dep.clone()),
                }
            }
            dependencies.push(deps);
            missing.push(absent);
            if let Some(&parent) = node.parent_id.as_ref().and_then(|p| index.get(p)) {
                if parent != i {
                    children[parent].push(i);
                }
            }
        }

        let mut graph = Self {
            ids,
            index,
            dependencies,
            children,
            blockers: Vec::new(),
        };
        graph.blockers = (0..graph.len())
            .map(|i| {
                if !missing[i].is_empty() {
                    Some(Blocker::MissingDependencies(missing[i].clone()))
                } else if graph.reaches_self(i) {
                    Some(Blocker::Cycle)
                } else {
                    None
                }
            })
            .collect();
        graph
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, i: usize) -> &str {
        &self.ids[i]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.dependencies[i]
    }

    pub fn children(&self, i: usize) -> &[usize] {
        &self.children[i]
    }

    /// Everything `i` waits on: dependencies first, then children not already listed.
    pub fn waits(&self, i: usize) -> Vec<usize> {
        let mut waits = self.dependencies[i].clone();
        for &child in &self.children[i] {
            if !waits.contains(&child) {
                waits.push(child);
            }
        }
        waits
    }

    pub fn blocker(&self, i: usize) -> Option<&Blocker> {
        self.blockers[i].as_ref()
    }

    /// Pending nodes whose waits are all terminal, in plan order.
    ///
    /// Blocked nodes are never eligible; the scheduler skips them instead.
    pub fn eligible(&self, statuses: &[NodeStatus]) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| statuses[i] == NodeStatus::Pending && self.blockers[i].is_none())
            .filter(|&i| self.waits(i).iter().all(|&w| statuses[w].is_terminal()))
            .collect()
    }

    /// Pending nodes that can never run and should be marked skipped.
    pub fn blocked_pending(&self, statuses: &[NodeStatus]) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| statuses[i] == NodeStatus::Pending && self.blockers[i].is_some())
            .collect()
    }

    /// Non-terminal waits of a pending node, for stall diagnostics.
    pub fn open_waits(&self, i: usize, statuses: &[NodeStatus]) -> Vec<&str> {
        self.waits(i)
            .into_iter()
            .filter(|&w| !statuses[w].is_terminal())
            .map(|w| self.id(w))
            .collect()
    }

    fn reaches_self(&self, start: usize) -> bool {
        let mut visited = vec![false; self.len()];
        let mut stack = self.waits(start);
        while let Some(current) = stack.pop() {
            if current == start {
                return true;
            }
            if visited[current] {
                continue;
            }
            visited[current] = true;
            stack.extend(self.waits(current));
        }
        false
    }
}
