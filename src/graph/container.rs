// ABOUTME: Task graph container with nestable subgraphs and dependency edges
// ABOUTME: Provides sequence and fork-join builders used by the lifecycle graph builder

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::Direction;

use crate::tasks::{RetryBudget, Task, TaskError, TaskHandler, TaskId, TaskOutcome, TaskState};

/// Stable handle into the graph registry. Subgraphs reference their
/// containing scope through these handles rather than owning references, so
/// nested scopes never form ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

pub(crate) enum Element {
    Task(Arc<Mutex<Task>>),
    Subgraph(Subgraph),
}

/// Snapshot of the task that failed a subgraph, kept for diagnostics and for
/// upward propagation into containing scopes.
#[derive(Debug, Clone)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub name: String,
    pub error: Option<TaskError>,
}

/// Resolution returned by a subgraph failure hook. A `Retry` outcome names a
/// replacement element (already inserted into the graph by the hook) that
/// takes over the failed subgraph's position.
pub struct SubgraphResolution {
    pub outcome: TaskOutcome,
    pub replacement: Option<ElementId>,
}

/// Failure hook attached to a subgraph. Invoked by the engine when a
/// contained task fails terminally.
pub trait SubgraphFailureHandler: Send + Sync {
    fn on_failure(&self, graph: &mut TaskGraph, subgraph: ElementId) -> SubgraphResolution;
}

/// A named, nestable scope of tasks with its own failure hook. The unit of
/// recovery: task failures are resolved at subgraph boundaries.
pub struct Subgraph {
    pub name: String,
    pub members: Vec<ElementId>,
    pub containing_subgraph: Option<ElementId>,
    pub on_failure: Option<Arc<dyn SubgraphFailureHandler>>,
    pub failed_task: Option<FailedTask>,
    pub state: TaskState,
    pub current_retries: u32,
}

impl Subgraph {
    fn new(name: String, containing_subgraph: Option<ElementId>) -> Self {
        Self {
            name,
            members: Vec::new(),
            containing_subgraph,
            on_failure: None,
            failed_task: None,
            state: TaskState::Pending,
            current_retries: 0,
        }
    }
}

/// How an element finished from the scheduler's point of view. Ignored
/// elements satisfy their dependents exactly like succeeded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Succeeded,
    Ignored,
}

/// Container of tasks and nested subgraphs with dependency edges.
///
/// Owns every element created for one execute() invocation and is discarded
/// after the graph finishes. `add_dependency(a, b)` means a waits for b.
pub struct TaskGraph {
    next_id: u64,
    pub(crate) elements: IndexMap<ElementId, Element>,
    pub(crate) deps: StableGraph<ElementId, ()>,
    pub(crate) indices: HashMap<ElementId, NodeIndex>,
    /// Containing subgraph per element (tasks and nested subgraphs).
    pub(crate) parent: HashMap<ElementId, ElementId>,
    pub(crate) resolutions: HashMap<ElementId, Resolution>,
    pub(crate) halted: Option<FailedTask>,
    pub(crate) subgraph_retries: RetryBudget,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            elements: IndexMap::new(),
            deps: StableGraph::new(),
            indices: HashMap::new(),
            parent: HashMap::new(),
            resolutions: HashMap::new(),
            halted: None,
            subgraph_retries: RetryBudget::Unlimited,
        }
    }

    pub fn with_subgraph_retries(mut self, budget: RetryBudget) -> Self {
        self.subgraph_retries = budget;
        self
    }

    fn insert(&mut self, element: Element, parent: Option<ElementId>) -> ElementId {
        let id = ElementId(self.next_id);
        self.next_id += 1;
        let idx = self.deps.add_node(id);
        self.indices.insert(id, idx);
        self.elements.insert(id, element);
        if let Some(parent_id) = parent {
            self.parent.insert(id, parent_id);
            if let Some(Element::Subgraph(sub)) = self.elements.get_mut(&parent_id) {
                sub.members.push(id);
            }
        }
        id
    }

    /// Create a new top-level subgraph.
    pub fn subgraph(&mut self, name: impl Into<String>) -> ElementId {
        self.insert(Element::Subgraph(Subgraph::new(name.into(), None)), None)
    }

    /// Create a subgraph nested inside `parent`.
    pub fn nested_subgraph(&mut self, parent: ElementId, name: impl Into<String>) -> ElementId {
        self.insert(
            Element::Subgraph(Subgraph::new(name.into(), Some(parent))),
            Some(parent),
        )
    }

    /// Add a free-standing task, not owned by any subgraph.
    pub fn add_task(&mut self, task: Task) -> ElementId {
        self.insert(Element::Task(Arc::new(Mutex::new(task))), None)
    }

    /// Add a task owned by a subgraph.
    pub fn add_task_to(&mut self, subgraph: ElementId, task: Task) -> ElementId {
        self.insert(Element::Task(Arc::new(Mutex::new(task))), Some(subgraph))
    }

    /// Make `dependent` wait for `dependency`.
    pub fn add_dependency(&mut self, dependent: ElementId, dependency: ElementId) {
        if let (Some(&dependent_idx), Some(&dependency_idx)) = (
            self.indices.get(&dependent),
            self.indices.get(&dependency),
        ) {
            // Edge direction follows dependency -> dependent, so readiness
            // checks walk incoming edges.
            if self.deps.find_edge(dependency_idx, dependent_idx).is_none() {
                self.deps.add_edge(dependency_idx, dependent_idx, ());
            }
        }
    }

    pub fn has_dependency(&self, dependent: ElementId, dependency: ElementId) -> bool {
        match (
            self.indices.get(&dependent),
            self.indices.get(&dependency),
        ) {
            (Some(&dependent_idx), Some(&dependency_idx)) => self
                .deps
                .find_edge(dependency_idx, dependent_idx)
                .is_some(),
            _ => false,
        }
    }

    /// Direct dependencies of an element (what it waits for).
    pub fn dependencies_of(&self, element: ElementId) -> Vec<ElementId> {
        match self.indices.get(&element) {
            Some(&idx) => self
                .deps
                .neighbors_directed(idx, Direction::Incoming)
                .map(|n| self.deps[n])
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn containing_subgraph(&self, element: ElementId) -> Option<ElementId> {
        self.parent.get(&element).copied()
    }

    pub fn contains(&self, element: ElementId) -> bool {
        self.elements.contains_key(&element)
    }

    pub(crate) fn task_slot(&self, element: ElementId) -> Option<Arc<Mutex<Task>>> {
        match self.elements.get(&element) {
            Some(Element::Task(slot)) => Some(Arc::clone(slot)),
            _ => None,
        }
    }

    pub fn subgraph_ref(&self, element: ElementId) -> Option<&Subgraph> {
        match self.elements.get(&element) {
            Some(Element::Subgraph(sub)) => Some(sub),
            _ => None,
        }
    }

    pub fn subgraph_mut(&mut self, element: ElementId) -> Option<&mut Subgraph> {
        match self.elements.get_mut(&element) {
            Some(Element::Subgraph(sub)) => Some(sub),
            _ => None,
        }
    }

    /// Attach a failure hook to a subgraph.
    pub fn set_on_failure(&mut self, subgraph: ElementId, handler: Arc<dyn SubgraphFailureHandler>) {
        if let Some(sub) = self.subgraph_mut(subgraph) {
            sub.on_failure = Some(handler);
        }
    }

    /// Handles of every subgraph not contained in another subgraph, in
    /// insertion order.
    pub fn top_level_subgraphs(&self) -> Vec<ElementId> {
        self.elements
            .iter()
            .filter_map(|(&id, element)| match element {
                Element::Subgraph(sub) if sub.containing_subgraph.is_none() => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Attach a task handler to every task under a subgraph, replacing any
    /// handler already set.
    pub fn set_failure_handler_on_tasks(
        &mut self,
        subgraph: ElementId,
        handler: Arc<dyn TaskHandler>,
    ) {
        for element in self.descendants(subgraph) {
            if let Some(slot) = self.task_slot(element) {
                lock_task(&slot).handler = Some(Arc::clone(&handler));
            }
        }
    }

    /// Record a failure onto a subgraph: the failed task snapshot plus the
    /// failed state observed by containing scopes.
    pub fn record_subgraph_failure(&mut self, subgraph: ElementId, failed: FailedTask) {
        if let Some(sub) = self.subgraph_mut(subgraph) {
            sub.failed_task = Some(failed);
            sub.state = TaskState::Failed;
        }
    }

    /// Every element under a subgraph, tasks and nested subgraphs alike, in
    /// member order.
    pub fn descendants(&self, subgraph: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        if let Some(sub) = self.subgraph_ref(subgraph) {
            for &member in &sub.members {
                out.push(member);
                out.extend(self.descendants(member));
            }
        }
        out
    }

    /// Remove an element and, for subgraphs, its whole subtree.
    pub fn remove_task(&mut self, element: ElementId) {
        for descendant in self.descendants(element) {
            self.remove_single(descendant);
        }
        self.remove_single(element);
    }

    fn remove_single(&mut self, element: ElementId) {
        if let Some(idx) = self.indices.remove(&element) {
            self.deps.remove_node(idx);
        }
        self.elements.shift_remove(&element);
        self.resolutions.remove(&element);
        if let Some(parent_id) = self.parent.remove(&element) {
            if let Some(Element::Subgraph(sub)) = self.elements.get_mut(&parent_id) {
                sub.members.retain(|&m| m != element);
            }
        }
    }

    /// Swap a failed element out of its graph position: every dependency
    /// edge incident to `old` is mirrored onto `new`, then `old` and its
    /// subtree are removed.
    pub(crate) fn replace_element(&mut self, old: ElementId, new: ElementId) {
        if let Some(&old_idx) = self.indices.get(&old) {
            let incoming: Vec<ElementId> = self
                .deps
                .neighbors_directed(old_idx, Direction::Incoming)
                .map(|n| self.deps[n])
                .collect();
            let outgoing: Vec<ElementId> = self
                .deps
                .neighbors_directed(old_idx, Direction::Outgoing)
                .map(|n| self.deps[n])
                .collect();
            for dependency in incoming {
                self.add_dependency(new, dependency);
            }
            for dependent in outgoing {
                self.add_dependency(dependent, new);
            }
        }
        self.remove_task(old);
    }

    /// Flattened task names under a subgraph, in declared order. Nested
    /// subgraphs are expanded in place.
    pub fn task_names(&self, subgraph: ElementId) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(sub) = self.subgraph_ref(subgraph) {
            for &member in &sub.members {
                match self.elements.get(&member) {
                    Some(Element::Task(slot)) => names.push(lock_task(slot).name.clone()),
                    Some(Element::Subgraph(_)) => names.extend(self.task_names(member)),
                    None => {}
                }
            }
        }
        names
    }

    /// Begin an ordered sequence inside a subgraph.
    pub fn sequence(&mut self, subgraph: ElementId) -> Sequence<'_> {
        Sequence {
            graph: self,
            subgraph,
            tail: Vec::new(),
        }
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a task slot, recovering the guard if a worker panicked mid-update.
pub(crate) fn lock_task(slot: &Arc<Mutex<Task>>) -> MutexGuard<'_, Task> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One unit inside a sequence step: a task to insert, or an element (such as
/// a nested subgraph) already present in the graph.
pub enum Unit {
    Task(Task),
    Element(ElementId),
}

impl From<Task> for Unit {
    fn from(task: Task) -> Self {
        Unit::Task(task)
    }
}

impl From<ElementId> for Unit {
    fn from(id: ElementId) -> Self {
        Unit::Element(id)
    }
}

/// A sequence step: a single unit, or a fork-join group whose units run
/// concurrently but must all complete before the sequence advances.
pub enum Step {
    Single(Unit),
    ForkJoin(Vec<Unit>),
}

impl From<Task> for Step {
    fn from(task: Task) -> Self {
        Step::Single(Unit::Task(task))
    }
}

impl From<ElementId> for Step {
    fn from(id: ElementId) -> Self {
        Step::Single(Unit::Element(id))
    }
}

/// Group units into a fork-join step.
pub fn forkjoin(units: Vec<Unit>) -> Step {
    Step::ForkJoin(units)
}

/// Ordered sequence builder over a subgraph. Each added step waits for every
/// unit of the previous step.
pub struct Sequence<'g> {
    graph: &'g mut TaskGraph,
    subgraph: ElementId,
    tail: Vec<ElementId>,
}

impl Sequence<'_> {
    pub fn add(&mut self, step: impl Into<Step>) -> &mut Self {
        let units = match step.into() {
            Step::Single(unit) => vec![unit],
            Step::ForkJoin(units) => units,
        };

        // An empty fork-join still takes a slot in the order, as a nop.
        let units = if units.is_empty() {
            vec![Unit::Task(Task::nop())]
        } else {
            units
        };

        let ids: Vec<ElementId> = units
            .into_iter()
            .map(|unit| match unit {
                Unit::Task(task) => self.graph.add_task_to(self.subgraph, task),
                Unit::Element(id) => {
                    // Pre-existing members (nested subgraphs) move to their
                    // declared position in the sequence order.
                    if let Some(sub) = self.graph.subgraph_mut(self.subgraph) {
                        sub.members.retain(|&m| m != id);
                        sub.members.push(id);
                    }
                    id
                }
            })
            .collect();

        for &new in &ids {
            for &prev in &self.tail {
                self.graph.add_dependency(new, prev);
            }
        }
        self.tail = ids;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_task(name: &str) -> Task {
        Task::local(name, || Ok(serde_json::Value::Null))
    }

    #[test]
    fn test_sequence_chains_dependencies() {
        let mut graph = TaskGraph::new();
        let sub = graph.subgraph("install_web");
        let mut seq = graph.sequence(sub);
        seq.add(named_task("a")).add(named_task("b")).add(named_task("c"));

        let names = graph.task_names(sub);
        assert_eq!(names, vec!["a", "b", "c"]);

        let members = graph.subgraph_ref(sub).unwrap().members.clone();
        assert!(graph.has_dependency(members[1], members[0]));
        assert!(graph.has_dependency(members[2], members[1]));
        assert!(!graph.has_dependency(members[2], members[0]));
    }

    #[test]
    fn test_forkjoin_fans_out_and_joins() {
        let mut graph = TaskGraph::new();
        let sub = graph.subgraph("install_db");
        let mut seq = graph.sequence(sub);
        seq.add(named_task("before"))
            .add(forkjoin(vec![named_task("f1").into(), named_task("f2").into()]))
            .add(named_task("after"));

        let members = graph.subgraph_ref(sub).unwrap().members.clone();
        let (before, f1, f2, after) = (members[0], members[1], members[2], members[3]);

        assert!(graph.has_dependency(f1, before));
        assert!(graph.has_dependency(f2, before));
        assert!(!graph.has_dependency(f2, f1));
        assert!(graph.has_dependency(after, f1));
        assert!(graph.has_dependency(after, f2));
    }

    #[test]
    fn test_empty_forkjoin_becomes_nop() {
        let mut graph = TaskGraph::new();
        let sub = graph.subgraph("stub");
        let mut seq = graph.sequence(sub);
        seq.add(named_task("a")).add(forkjoin(vec![])).add(named_task("b"));

        assert_eq!(graph.task_names(sub), vec!["a", "NOP", "b"]);
    }

    #[test]
    fn test_nested_subgraph_membership() {
        let mut graph = TaskGraph::new();
        let outer = graph.subgraph("reinstall_web");
        let inner = graph.nested_subgraph(outer, "install_web");
        graph.add_task_to(inner, named_task("start"));

        assert_eq!(graph.containing_subgraph(inner), Some(outer));
        assert_eq!(graph.task_names(outer), vec!["start"]);
    }

    #[test]
    fn test_remove_task_prunes_subtree() {
        let mut graph = TaskGraph::new();
        let outer = graph.subgraph("outer");
        let inner = graph.nested_subgraph(outer, "inner");
        let t = graph.add_task_to(inner, named_task("x"));

        graph.remove_task(inner);
        assert!(!graph.contains(inner));
        assert!(!graph.contains(t));
        assert!(graph.subgraph_ref(outer).unwrap().members.is_empty());
    }

    #[test]
    fn test_replace_element_rewires_edges() {
        let mut graph = TaskGraph::new();
        let a = graph.subgraph("a");
        let b = graph.subgraph("b");
        let c = graph.subgraph("c");
        // b waits a, c waits b.
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);

        let replacement = graph.subgraph("b_retry");
        graph.replace_element(b, replacement);

        assert!(!graph.contains(b));
        assert!(graph.has_dependency(replacement, a));
        assert!(graph.has_dependency(c, replacement));
    }
}
