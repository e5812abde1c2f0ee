use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::engine::{Deferred, Parameterizer, Pooled, Single, Task};
use crate::error::ResolveError;

/// How a task takes part in the chunked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Runs independently inside every chunk.
    PerChunk,
    /// Collects partial results per chunk and is finalized once on the
    /// merged partials.
    Deferred,
}

/// Static metadata of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub name: &'static str,
    pub summary: &'static str,
    /// Names of the tasks whose output this task reads.
    pub prerequisites: Vec<&'static str>,
    pub has_run_step: bool,
    pub execution: Execution,
    /// Whether an empty result after station filtering is acceptable.
    pub allow_empty: bool,
    /// Cache file name inside the parameter directory.
    pub file_name: String,
    /// Table name inside the relational store.
    pub table_name: String,
}

impl TaskDescriptor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            summary: "",
            prerequisites: Vec::new(),
            has_run_step: false,
            execution: Execution::PerChunk,
            allow_empty: false,
            file_name: format!("{name}.csv"),
            table_name: name.to_string(),
        }
    }

    pub fn summary(mut self, summary: &'static str) -> Self {
        self.summary = summary;
        self
    }

    pub fn requires(mut self, names: impl IntoIterator<Item = &'static str>) -> Self {
        self.prerequisites.extend(names);
        self
    }

    pub fn file(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_run_step(mut self) -> Self {
        self.has_run_step = true;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    /// Whether the task can be materialized independently per chunk.
    pub fn parallel_safe(&self) -> bool {
        self.execution == Execution::PerChunk
    }
}

/// The set of known tasks.
///
/// Tasks are registered explicitly. Registering a second task under an
/// existing name shadows the first one, so a specialised variant can replace
/// a generic task without touching its dependents.
#[derive(Default, Clone)]
pub struct Registry {
    tasks: Vec<Arc<dyn Task>>,
    by_name: HashMap<&'static str, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, task: Arc<dyn Task>) -> &mut Self {
        let name = task.descriptor().name;
        if self.by_name.contains_key(name) {
            tracing::debug!(task = name, "Shadowing earlier registration");
        }
        self.by_name.insert(name, self.tasks.len());
        self.tasks.push(task);
        self
    }

    /// Registers a task materialized independently in every chunk.
    pub fn register<T: Parameterizer>(&mut self, task: T) -> &mut Self {
        self.insert(Arc::new(Single::new(task)))
    }

    /// Registers a two-phase task finalized once after all chunks merged.
    pub fn register_pooled<T: Pooled>(&mut self, task: T) -> &mut Self {
        self.insert(Arc::new(Deferred::new(task)))
    }

    pub fn descriptor(&self, name: &str) -> Option<&TaskDescriptor> {
        self.by_name
            .get(name)
            .map(|&index| self.tasks[index].descriptor())
    }

    /// Names of the active registrations in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut active: Vec<_> = self.by_name.iter().map(|(name, i)| (*i, *name)).collect();
        active.sort();
        active.into_iter().map(|(_, name)| name).collect()
    }

    fn lookup(&self, name: &str, required_by: Option<&str>) -> Result<usize, ResolveError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ResolveError::UnknownTask {
                name: name.to_string(),
                required_by: required_by.map(str::to_string),
            })
    }

    /// Orders the requested tasks and all their transitive prerequisites.
    ///
    /// Every task appears exactly once and after all of its prerequisites.
    /// Among tasks that are ready at the same time, later registrations come
    /// first.
    pub fn resolve(&self, requested: &[&str]) -> Result<Plan, ResolveError> {
        // closure of the request
        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::new();
        for name in requested {
            let index = self.lookup(name, None)?;
            if closure.insert(index) {
                queue.push_back(index);
            }
        }
        while let Some(index) = queue.pop_front() {
            let descriptor = self.tasks[index].descriptor();
            for prerequisite in &descriptor.prerequisites {
                let dep = self.lookup(prerequisite, Some(descriptor.name))?;
                if closure.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }

        let mut graph = Graph::<usize, ()>::new();
        let nodes: HashMap<usize, NodeIndex> = closure
            .iter()
            .map(|&index| (index, graph.add_node(index)))
            .collect();
        for &index in &closure {
            for prerequisite in &self.tasks[index].descriptor().prerequisites {
                let dep = self.by_name[prerequisite];
                graph.add_edge(nodes[&dep], nodes[&index], ());
            }
        }

        // We run toposort only to detect cycles, the order is computed below.
        if petgraph::algo::toposort(&graph, None).is_err() {
            let mut tasks: Vec<String> = petgraph::algo::tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                .flatten()
                .map(|node| self.tasks[graph[node]].descriptor().name.to_string())
                .collect();
            tasks.sort();
            return Err(ResolveError::CyclicDependency { tasks });
        }

        for &index in &closure {
            let descriptor = self.tasks[index].descriptor();
            if !descriptor.parallel_safe() {
                continue;
            }
            for prerequisite in &descriptor.prerequisites {
                let dep = self.tasks[self.by_name[prerequisite]].descriptor();
                if !dep.parallel_safe() {
                    return Err(ResolveError::DeferredPrerequisite {
                        task: descriptor.name.to_string(),
                        prerequisite: dep.name.to_string(),
                    });
                }
            }
        }

        // Kahn's algorithm, ties broken by the most recent registration.
        let mut pending: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|node| {
                let count = graph
                    .neighbors_directed(node, petgraph::Direction::Incoming)
                    .count();
                (node, count)
            })
            .collect();

        let mut ready: BinaryHeap<(usize, Reverse<NodeIndex>)> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| (graph[*node], Reverse(*node)))
            .collect();

        let mut order = Vec::with_capacity(closure.len());
        while let Some((index, Reverse(node))) = ready.pop() {
            order.push(self.tasks[index].clone());
            for next in graph.neighbors_directed(node, petgraph::Direction::Outgoing) {
                if let Some(count) = pending.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push((graph[next], Reverse(next)));
                    }
                }
            }
        }

        Ok(Plan { tasks: order })
    }
}

/// An ordered list of tasks ready for execution.
#[derive(Clone)]
pub struct Plan {
    pub(crate) tasks: Vec<Arc<dyn Task>>,
}

impl Plan {
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|task| task.descriptor().name).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.iter().map(|task| task.descriptor())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.tasks
            .iter()
            .position(|task| task.descriptor().name == name)
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Renders the plan as a Mermaid graph, deferred tasks drawn as hexagons.
impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, descriptor) in self.descriptors().enumerate() {
            match descriptor.execution {
                Execution::PerChunk => writeln!(f, "    {index}[\"{}\"]", descriptor.name)?,
                Execution::Deferred => writeln!(f, "    {index}{{{{\"{}\"}}}}", descriptor.name)?,
            }
            if descriptor.has_run_step {
                writeln!(f, "    {index} --> Namelist")?;
            }
        }

        writeln!(f, "    Namelist[Namelist]")?;

        for (index, descriptor) in self.descriptors().enumerate() {
            for prerequisite in &descriptor.prerequisites {
                if let Some(source) = self.position(prerequisite) {
                    writeln!(f, "    {source} --> {index}")?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::core::{Inputs, TaskContext};
    use crate::data::{Dataset, SqlType};

    crate::record! {
        struct Unit {
            index: [id],
            station: id,
            id: String => SqlType::Text,
        }
    }

    struct Stub(TaskDescriptor);

    impl Parameterizer for Stub {
        type Record = Unit;

        fn descriptor(&self) -> TaskDescriptor {
            self.0.clone()
        }

        fn setup(&self, _: &TaskContext<'_>, _: &Inputs) -> anyhow::Result<Dataset<Unit>> {
            Ok(Dataset::default())
        }
    }

    struct StubPooled(TaskDescriptor);

    impl Pooled for StubPooled {
        type Partial = Unit;
        type Record = Unit;

        fn descriptor(&self) -> TaskDescriptor {
            self.0.clone()
        }

        fn partial(&self, _: &TaskContext<'_>, _: &Inputs) -> anyhow::Result<Dataset<Unit>> {
            Ok(Dataset::default())
        }

        fn finalize(&self, _: &TaskContext<'_>, _: &Dataset<Unit>) -> anyhow::Result<Dataset<Unit>> {
            Ok(Dataset::default())
        }
    }

    fn task(name: &'static str, deps: &[&'static str]) -> Stub {
        Stub(TaskDescriptor::new(name).requires(deps.iter().copied()))
    }

    fn assert_topological(registry: &Registry, plan: &Plan) {
        let names = plan.names();
        for (i, name) in names.iter().enumerate() {
            let descriptor = registry.descriptor(name).unwrap();
            for dep in &descriptor.prerequisites {
                let j = names.iter().position(|n| n == dep).unwrap();
                assert!(j < i, "{dep} must run before {name}: {names:?}");
            }
        }
        let unique: BTreeSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len(), "duplicates in {names:?}");
    }

    const NAMES: [&str; 10] = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", "t8", "t9"];

    /// Registers `NAMES[i]` with the prerequisites `deps[i]`, in `order`.
    fn registry_of(deps: &[BTreeSet<usize>], order: &[usize]) -> Registry {
        let mut registry = Registry::new();
        for &i in order {
            let names: Vec<&'static str> = deps[i].iter().map(|&j| NAMES[j]).collect();
            registry.register(task(NAMES[i], &names));
        }
        registry
    }

    /// Prerequisites of every task only point at tasks with a lower index.
    fn acyclic() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
        proptest::collection::vec(proptest::collection::vec(any::<bool>(), NAMES.len()), NAMES.len())
            .prop_map(|edges| {
                edges
                    .iter()
                    .enumerate()
                    .map(|(i, row)| (0..i).filter(|&j| row[j]).collect())
                    .collect()
            })
    }

    fn registration_order() -> impl Strategy<Value = Vec<usize>> {
        Just((0..NAMES.len()).collect::<Vec<_>>()).prop_shuffle()
    }

    proptest! {
        #[test]
        fn test_resolve_is_an_exact_topological_closure(
            deps in acyclic(),
            order in registration_order(),
            requested in proptest::collection::btree_set(0..NAMES.len(), 1..4),
        ) {
            let registry = registry_of(&deps, &order);
            let names: Vec<&str> = requested.iter().map(|&i| NAMES[i]).collect();
            let plan = registry.resolve(&names).unwrap();
            assert_topological(&registry, &plan);

            let mut closure = BTreeSet::new();
            let mut stack: Vec<usize> = requested.iter().copied().collect();
            while let Some(i) = stack.pop() {
                if closure.insert(i) {
                    stack.extend(deps[i].iter().copied());
                }
            }
            let expected: BTreeSet<&str> = closure.iter().map(|&i| NAMES[i]).collect();
            let resolved: BTreeSet<&str> = plan.names().into_iter().collect();
            prop_assert_eq!(resolved, expected);
        }

        #[test]
        fn test_any_cycle_is_reported(
            deps in acyclic(),
            order in registration_order(),
            len in 1..5usize,
        ) {
            let mut deps = deps;
            // order[..len] depend on each other in a ring
            let ring = &order[..len];
            for (k, &i) in ring.iter().enumerate() {
                deps[i].insert(ring[(k + 1) % len]);
            }
            let registry = registry_of(&deps, &order);

            match registry.resolve(&[NAMES[ring[0]]]) {
                Err(ResolveError::CyclicDependency { tasks }) => {
                    for &i in ring {
                        prop_assert!(tasks.iter().any(|t| t == NAMES[i]), "{} not in {tasks:?}", NAMES[i]);
                    }
                }
                other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|plan| plan.names())),
            }
        }
    }

    #[test]
    fn test_diamond() {
        let mut registry = Registry::new();
        registry
            .register(task("a", &[]))
            .register(task("b", &["a"]))
            .register(task("c", &["a"]))
            .register(task("d", &["b", "c"]));

        let plan = registry.resolve(&["d", "b"]).unwrap();
        assert_topological(&registry, &plan);
        // ties go to the later registration
        assert_eq!(plan.names(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_unknown_prerequisite() {
        let mut registry = Registry::new();
        registry.register(task("b", &["missing"]));

        assert_eq!(
            registry.resolve(&["b"]).unwrap_err(),
            ResolveError::UnknownTask {
                name: "missing".into(),
                required_by: Some("b".into())
            }
        );
        assert!(matches!(
            registry.resolve(&["nope"]),
            Err(ResolveError::UnknownTask { required_by: None, .. })
        ));
    }

    #[test]
    fn test_cycle() {
        let mut registry = Registry::new();
        registry
            .register(task("root", &[]))
            .register(task("x", &["root", "z"]))
            .register(task("y", &["x"]))
            .register(task("z", &["y"]));

        assert_eq!(
            registry.resolve(&["z"]).unwrap_err(),
            ResolveError::CyclicDependency {
                tasks: vec!["x".into(), "y".into(), "z".into()]
            }
        );
    }

    #[test]
    fn test_self_cycle() {
        let mut registry = Registry::new();
        registry.register(task("loop", &["loop"]));
        assert!(matches!(
            registry.resolve(&["loop"]),
            Err(ResolveError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_shadowing() {
        let mut registry = Registry::new();
        registry
            .register(task("base", &[]))
            .register(task("leaf", &["base"]))
            .register(task("other", &[]))
            .register(task("leaf", &["other"]));

        let plan = registry.resolve(&["leaf"]).unwrap();
        assert_eq!(plan.names(), vec!["other", "leaf"]);
        assert_eq!(registry.names(), vec!["base", "other", "leaf"]);
    }

    #[test]
    fn test_deferred_prerequisite() {
        let mut registry = Registry::new();
        registry
            .register(task("a", &[]))
            .register_pooled(StubPooled(TaskDescriptor::new("pool").requires(["a"])))
            .register(task("after", &["pool"]));

        assert_eq!(
            registry.resolve(&["after"]).unwrap_err(),
            ResolveError::DeferredPrerequisite {
                task: "after".into(),
                prerequisite: "pool".into()
            }
        );

        let plan = registry.resolve(&["pool"]).unwrap();
        assert!(!registry.descriptor("pool").unwrap().parallel_safe());
        assert!(plan.to_string().contains("{{\"pool\"}}"));
    }
}
