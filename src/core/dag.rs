//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph::build` validates a task list into an acyclic graph and
//! computes the advisory wave layering. Nodes are tasks; an edge `d -> t`
//! means `t` depends on `d`.

use crate::core::task::{Task, TaskId, TaskSpec};
use crate::error::GraphError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The validated task dependency graph.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Task ids in the order the task list declared them.
    order: Vec<TaskId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl TaskGraph {
    /// Validate a task list and build the graph.
    ///
    /// # Errors
    /// - `EmptyTaskId` / `DuplicateTask` for malformed ids
    /// - `UnknownDependency` if a `depends_on` entry names no task
    /// - `CycleDetected` with the offending path if the graph has a back-edge
    pub fn build(specs: &[TaskSpec]) -> Result<Self, GraphError> {
        let mut seen = HashSet::new();
        for (pos, spec) in specs.iter().enumerate() {
            if spec.id.as_str().trim().is_empty() {
                return Err(GraphError::EmptyTaskId(pos));
            }
            if !seen.insert(&spec.id) {
                return Err(GraphError::DuplicateTask(spec.id.clone()));
            }
        }

        for spec in specs {
            if let Some(missing) = spec.depends_on.iter().find(|d| !seen.contains(d)) {
                return Err(GraphError::UnknownDependency {
                    task: spec.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        if let Some(cycle_path) = find_cycle(specs) {
            return Err(GraphError::CycleDetected { cycle_path });
        }

        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();
        for spec in specs {
            let index = graph.add_node(Task::from_spec(spec));
            task_index.insert(spec.id.clone(), index);
        }
        for spec in specs {
            let to = task_index[&spec.id];
            for dep in &spec.depends_on {
                let from = task_index[dep];
                // `update_edge` collapses a dependency listed twice.
                graph.update_edge(from, to, ());
            }
        }

        let mut dag = Self {
            graph,
            task_index,
            order: specs.iter().map(|s| s.id.clone()).collect(),
        };
        dag.assign_waves()?;
        Ok(dag)
    }

    /// Fill in `wave_index` for every task by walking a topological order.
    fn assign_waves(&mut self) -> Result<(), GraphError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| GraphError::CycleDetected {
            cycle_path: vec![self.graph[cycle.node_id()].id.clone()],
        })?;

        for index in sorted {
            let wave = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|dep| self.graph[dep].wave_index + 1)
                .max()
                .unwrap_or(0);
            self.graph[index].wave_index = wave;
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Task ids in declaration order.
    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.get_task(id))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Ids of the tasks `id` depends on.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Ids of the tasks that depend on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| &self.graph[n].id)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn wave_index(&self, id: &TaskId) -> Option<usize> {
        self.get_task(id).map(|t| t.wave_index)
    }

    /// The advisory layering: `waves()[i]` holds every task with wave index `i`,
    /// in declaration order.
    pub fn waves(&self) -> Vec<Vec<TaskId>> {
        let depth = self.tasks().map(|t| t.wave_index + 1).max().unwrap_or(0);
        let mut waves = vec![Vec::new(); depth];
        for task in self.tasks() {
            waves[task.wave_index].push(task.id.clone());
        }
        waves
    }

    /// Longest chain of estimated minutes through the graph.
    ///
    /// Tasks without an estimate contribute zero.
    pub fn critical_path_minutes(&self) -> u64 {
        let Ok(sorted) = toposort(&self.graph, None) else {
            return 0;
        };
        let mut finish: HashMap<NodeIndex, u64> = HashMap::new();
        for index in sorted {
            let own = self.graph[index]
                .estimated_duration
                .map(|d| d.as_secs() / 60)
                .unwrap_or(0);
            let start = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| finish.get(&dep).copied())
                .max()
                .unwrap_or(0);
            finish.insert(index, start + own);
        }
        finish.values().copied().max().unwrap_or(0)
    }
}

/// Depth-first search over `depends_on` edges, returning the first cycle found.
fn find_cycle(specs: &[TaskSpec]) -> Option<Vec<TaskId>> {
    let position: HashMap<&TaskId, usize> =
        specs.iter().enumerate().map(|(i, s)| (&s.id, i)).collect();
    let mut marks = vec![Mark::Unvisited; specs.len()];
    let mut stack = Vec::new();

    fn visit(
        node: usize,
        specs: &[TaskSpec],
        position: &HashMap<&TaskId, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<TaskId>> {
        marks[node] = Mark::OnStack;
        stack.push(node);

        for dep in &specs[node].depends_on {
            let Some(&next) = position.get(dep) else {
                continue;
            };
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next)?;
                    return Some(stack[start..].iter().map(|&n| specs[n].id.clone()).collect());
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, specs, position, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    for node in 0..specs.len() {
        if marks[node] == Mark::Unvisited {
            if let Some(cycle) = visit(node, specs, &position, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
