//! Dependency graph for workflow validation and parallel planning.
//!
//! `DependencyGraph` stores a workflow's tasks as a petgraph `DiGraph` whose
//! edges run from a dependency to its dependent. It detects cycles, assigns
//! every task a dependency level, and groups tasks that share a level into
//! the execution plan.

use crate::core::task::{DependencyKind, TaskId};
use crate::error::{Error, Result};
use crate::workflow::WorkflowDefinition;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Tasks sharing one dependency level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub level: usize,
    /// Members in definition order.
    pub task_ids: Vec<TaskId>,
}

impl TaskGroup {
    /// A group with more than one member is eligible for concurrent dispatch.
    pub fn is_parallel(&self) -> bool {
        self.task_ids.len() > 1
    }
}

/// Level-ordered groups covering every task of a workflow exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub groups: Vec<TaskGroup>,
}

impl ExecutionPlan {
    /// Groups with at least two members.
    pub fn parallel_groups(&self) -> impl Iterator<Item = &TaskGroup> {
        self.groups.iter().filter(|g| g.is_parallel())
    }

    /// Every task, by level and then definition order.
    pub fn ordered_task_ids(&self) -> Vec<TaskId> {
        self.groups
            .iter()
            .flat_map(|g| g.task_ids.iter().cloned())
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.groups.iter().map(|g| g.task_ids.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitMark {
    Unvisited,
    OnStack,
    Done,
}

/// The task dependency graph of one workflow.
///
/// Levels are memoized on first use. The graph is immutable after `build`,
/// so the memo stays valid for the graph's lifetime.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, DependencyKind>,
    task_index: HashMap<TaskId, NodeIndex>,
    levels: OnceLock<HashMap<TaskId, usize>>,
}

impl DependencyGraph {
    /// Build the graph for a workflow definition.
    ///
    /// Nodes are added in definition order. A duplicate dependency keeps the
    /// stronger kind.
    ///
    /// # Errors
    /// Returns `Error::Validation` if a dependency names a task that is not
    /// part of the workflow. Cycles are not rejected here; see `has_cycle`.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for id in &definition.task_ids {
            if task_index.contains_key(id) {
                continue;
            }
            let index = graph.add_node(id.clone());
            task_index.insert(id.clone(), index);
        }

        for dep in &definition.dependencies {
            let lookup = |id: &TaskId| {
                task_index.get(id).copied().ok_or_else(|| {
                    Error::Validation(format!(
                        "dependency {} -> {} references unknown task {}",
                        dep.task_id, dep.depends_on, id
                    ))
                })
            };
            let from = lookup(&dep.depends_on)?;
            let to = lookup(&dep.task_id)?;

            match graph.find_edge(from, to) {
                Some(edge) => {
                    if dep.kind == DependencyKind::Blocking {
                        graph[edge] = DependencyKind::Blocking;
                    }
                }
                None => {
                    graph.add_edge(from, to, dep.kind);
                }
            }
        }

        Ok(Self {
            graph,
            task_index,
            levels: OnceLock::new(),
        })
    }

    /// Copy of this graph with every soft edge removed.
    ///
    /// This is the effective wait-list used for scheduling: soft dependencies
    /// never delay a task.
    pub fn without_soft_dependencies(&self) -> Self {
        let mut graph = self.graph.clone();
        graph.retain_edges(|g, edge| g[edge] == DependencyKind::Blocking);
        Self {
            graph,
            task_index: self.task_index.clone(),
            levels: OnceLock::new(),
        }
    }

    /// Check whether the dependency relation contains a cycle.
    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Find one cycle with a depth-first search that tracks the recursion stack.
    ///
    /// The returned path starts and ends with the same task and follows
    /// "must finish before" order.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = vec![VisitMark::Unvisited; self.graph.node_count()];
        let mut stack = Vec::new();

        for start in self.graph.node_indices() {
            if marks[start.index()] == VisitMark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        marks: &mut [VisitMark],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<TaskId>> {
        marks[node.index()] = VisitMark::OnStack;
        stack.push(node);

        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            match marks[next.index()] {
                VisitMark::OnStack => {
                    let start = stack.iter().position(|&n| n == next)?;
                    let mut cycle: Vec<TaskId> =
                        stack[start..].iter().map(|&n| self.graph[n].clone()).collect();
                    cycle.push(self.graph[next].clone());
                    return Some(cycle);
                }
                VisitMark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                VisitMark::Done => {}
            }
        }

        stack.pop();
        marks[node.index()] = VisitMark::Done;
        None
    }

    /// Fail with `Error::CyclicDependency` naming the offending cycle.
    pub fn ensure_acyclic(&self) -> Result<()> {
        if !self.has_cycle() {
            return Ok(());
        }
        Err(Error::CyclicDependency {
            cycle: self.find_cycle().unwrap_or_default(),
        })
    }

    /// Dependency level of every task, computed once.
    ///
    /// Level 0 for a task without dependencies, otherwise one more than the
    /// deepest dependency.
    pub fn levels(&self) -> Result<&HashMap<TaskId, usize>> {
        if let Some(levels) = self.levels.get() {
            return Ok(levels);
        }
        self.ensure_acyclic()?;

        let mut memo = HashMap::with_capacity(self.graph.node_count());
        for index in self.graph.node_indices() {
            self.compute_level(index, &mut memo);
        }
        let levels = memo
            .into_iter()
            .map(|(index, level)| (self.graph[index].clone(), level))
            .collect();
        Ok(self.levels.get_or_init(|| levels))
    }

    fn compute_level(&self, index: NodeIndex, memo: &mut HashMap<NodeIndex, usize>) -> usize {
        if let Some(&level) = memo.get(&index) {
            return level;
        }
        let level = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect::<Vec<_>>()
            .into_iter()
            .map(|dep| self.compute_level(dep, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(index, level);
        level
    }

    /// Dependency level of one task.
    pub fn level(&self, id: &TaskId) -> Result<usize> {
        self.levels()?
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("task {} not in graph", id)))
    }

    /// Group tasks by level, in level order.
    ///
    /// Every level becomes a group; groups with one member run serially.
    pub fn execution_plan(&self) -> Result<ExecutionPlan> {
        let levels = self.levels()?;
        let depth = levels.values().copied().max().map_or(0, |max| max + 1);
        let mut groups: Vec<TaskGroup> = (0..depth)
            .map(|level| TaskGroup {
                level,
                task_ids: Vec::new(),
            })
            .collect();

        // Node indices follow definition order.
        for index in self.graph.node_indices() {
            let id = &self.graph[index];
            if let Some(&level) = levels.get(id) {
                groups[level].task_ids.push(id.clone());
            }
        }

        groups.retain(|g| !g.task_ids.is_empty());
        Ok(ExecutionPlan { groups })
    }

    /// Groups of two or more tasks that share a level.
    pub fn parallel_groups(&self) -> Result<Vec<TaskGroup>> {
        Ok(self
            .execution_plan()?
            .groups
            .into_iter()
            .filter(TaskGroup::is_parallel)
            .collect())
    }

    /// Direct dependencies of a task with their kinds.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<(TaskId, DependencyKind)> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| {
                use petgraph::visit::EdgeRef;
                (edge.source(), *edge.weight())
            })
            .collect();
        deps.sort_by_key(|(source, _)| source.index());
        deps.into_iter()
            .map(|(source, kind)| (self.graph[source].clone(), kind))
            .collect()
    }

    /// Tasks that directly depend on `id`, in definition order.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut dependents: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        dependents.sort_by_key(|n| n.index());
        dependents
            .into_iter()
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
