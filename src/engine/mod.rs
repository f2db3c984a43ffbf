//! The task graph and plan resolution.
//!
//! Tasks are declared once into a [`TaskGraph`] and never change afterwards.
//! Resolving a target builds a throwaway `petgraph` graph of everything the
//! target needs, rejects cycles, and levels it into a [`Plan`]: stages that
//! run strictly one after another, each holding one task or a group of
//! independent tasks that may run in parallel.

mod runner;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display};
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::ConfigError;
use crate::pipeline::Pipeline;
use crate::source::Source;

pub use runner::{Diagnostics, Status, TaskReport, execute};
pub(crate) use runner::{serve, servers};
#[cfg(feature = "live")]
pub use runner::reload::ReloadServer;
#[cfg(feature = "live")]
pub use runner::watch::{WatchEvent, Watcher};
#[cfg(feature = "live")]
pub(crate) use runner::watch::session as watch;

/// Context handed to custom task actions.
pub struct TaskContext<'a> {
    pub name: &'a str,
    pub env: &'a crate::core::Environment,
}

pub type TaskFn = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Globs to watch while serving, and the tasks a change re-runs.
#[derive(Debug, Clone)]
pub struct WatchBinding {
    pub globs: Vec<String>,
    pub tasks: Vec<String>,
}

impl WatchBinding {
    pub fn new<G, T>(globs: G, tasks: T) -> Self
    where
        G: IntoIterator,
        G::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            globs: globs.into_iter().map(Into::into).collect(),
            tasks: tasks.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Directory served over HTTP, relative to the project root.
    pub dir: Utf8PathBuf,
    pub port: u16,
    /// Without bindings the server only serves, nothing is watched.
    pub bindings: Vec<WatchBinding>,
}

/// What a task does once its prerequisites are done.
#[derive(Clone, Default)]
pub enum Action {
    /// Nothing, the task only groups its dependencies.
    #[default]
    Noop,
    Pipeline(Pipeline),
    /// Delete the matched files and directories.
    Clean(Source),
    /// Serve a directory once the plan has finished, optionally watching.
    Serve(ServeOptions),
    Custom(TaskFn),
}

impl Action {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Action::Custom(Arc::new(f))
    }

    fn kind(&self) -> &'static str {
        match self {
            Action::Noop => "noop",
            Action::Pipeline(_) => "pipeline",
            Action::Clean(_) => "clean",
            Action::Serve(_) => "serve",
            Action::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    /// Run before the task, in any order.
    pub dependencies: Vec<String>,
    /// Groups run one after another, after the dependencies.
    pub sequence: Vec<Vec<String>>,
    pub action: Action,
}

/// All declared tasks, by name.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a task with unordered dependencies.
    pub fn define<I, S>(&mut self, name: &str, deps: I, action: Action) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task(name).depends_on(deps).action(action).define()
    }

    /// Start declaring a task, finish with [`TaskBuilder::define`].
    pub fn task(&mut self, name: &str) -> TaskBuilder<'_> {
        TaskBuilder {
            graph: self,
            task: Task {
                name: name.to_string(),
                dependencies: Vec::new(),
                sequence: Vec::new(),
                action: Action::Noop,
            },
        }
    }

    fn insert(&mut self, task: Task) -> Result<(), ConfigError> {
        if self.index.contains_key(&task.name) {
            return Err(ConfigError::DuplicateTask(task.name));
        }
        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Check every reference and the absence of cycles across all tasks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let names: Vec<&str> = self.tasks.iter().map(|t| t.name.as_str()).collect();
        self.resolve_many(names).map(|_| ())
    }

    pub fn resolve_order(&self, target: &str) -> Result<Plan, ConfigError> {
        self.resolve_many([target])
    }

    /// Resolve several targets into one plan, shared prerequisites run once.
    pub fn resolve_many<I, S>(&self, targets: I) -> Result<Plan, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut graph = DiGraph::<usize, ()>::new();
        let mut nodes: HashMap<usize, NodeIndex> = HashMap::new();

        // collect everything reachable from the targets
        let mut stack = Vec::new();
        for target in targets {
            let target = target.as_ref();
            let &i = self
                .index
                .get(target)
                .ok_or_else(|| ConfigError::UnknownTask(target.to_string()))?;
            stack.push(i);
        }

        while let Some(i) = stack.pop() {
            if nodes.contains_key(&i) {
                continue;
            }
            nodes.insert(i, graph.add_node(i));

            let task = &self.tasks[i];
            for name in task.dependencies.iter().chain(task.sequence.iter().flatten()) {
                let &j = self
                    .index
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownDependency {
                        task: task.name.clone(),
                        missing: name.clone(),
                    })?;
                stack.push(j);
            }
        }

        // edges point from a prerequisite to the task waiting for it
        let edges: Vec<(usize, usize)> = nodes
            .keys()
            .flat_map(|&i| self.ordering(i))
            .collect();
        for (from, to) in edges {
            graph.update_edge(nodes[&from], nodes[&to], ());
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| ConfigError::Cycle(self.cycle_path(&graph, cycle.node_id())))?;

        // longest path from any root decides the stage
        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &order {
            let l = graph
                .edges_directed(node, petgraph::Direction::Incoming)
                .map(|e| level[&e.source()] + 1)
                .max()
                .unwrap_or(0);
            level.insert(node, l);
        }

        let depth = level.values().max().map_or(0, |l| l + 1);
        let mut stages: Vec<Vec<usize>> = vec![Vec::new(); depth];
        for (&node, &l) in &level {
            stages[l].push(graph[node]);
        }

        let stages = stages
            .into_iter()
            .map(|mut tasks| {
                tasks.sort_unstable();
                let mut names: Vec<String> = tasks.into_iter().map(|i| self.tasks[i].name.clone()).collect();
                match names.len() {
                    1 => Stage::Single(names.remove(0)),
                    _ => Stage::Parallel(names),
                }
            })
            .collect();

        let mut edges: Vec<(String, String)> = graph
            .edge_indices()
            .filter_map(|e| graph.edge_endpoints(e))
            .map(|(a, b)| (self.tasks[graph[a]].name.clone(), self.tasks[graph[b]].name.clone()))
            .collect();
        edges.sort();

        Ok(Plan { stages, edges })
    }

    /// Ordering constraints contributed by task `i`.
    fn ordering(&self, i: usize) -> Vec<(usize, usize)> {
        let task = &self.tasks[i];
        let lookup = |name: &String| self.index[name];
        let mut edges = Vec::new();

        let mut previous: Vec<usize> = task.dependencies.iter().map(lookup).collect();
        for &dep in &previous {
            edges.push((dep, i));
        }

        for group in &task.sequence {
            let group: Vec<usize> = group.iter().map(lookup).collect();
            for &member in &group {
                for &before in &previous {
                    edges.push((before, member));
                }
                edges.push((member, i));
            }
            previous = group;
        }

        edges
    }

    /// Names along a cycle through `start`, closed with `start` again.
    fn cycle_path(&self, graph: &DiGraph<usize, ()>, start: NodeIndex) -> Vec<String> {
        let name = |n: NodeIndex| self.tasks[graph[n]].name.clone();

        let component = tarjan_scc(graph)
            .into_iter()
            .find(|scc| scc.contains(&start))
            .unwrap_or_else(|| vec![start]);

        // breadth-first back to start, staying inside the component
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in graph.neighbors(node) {
                if !component.contains(&next) {
                    continue;
                }
                if next == start {
                    let mut path = vec![node];
                    let mut at = node;
                    while at != start {
                        at = parent[&at];
                        path.push(at);
                    }
                    path.reverse();
                    path.push(start);
                    return path.into_iter().map(name).collect();
                }
                if let Entry::Vacant(e) = parent.entry(next) {
                    e.insert(node);
                    queue.push_back(next);
                }
            }
        }

        vec![name(start), name(start)]
    }
}

/// Builder returned by [`TaskGraph::task`].
pub struct TaskBuilder<'a> {
    graph: &'a mut TaskGraph,
    task: Task,
}

impl TaskBuilder<'_> {
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Append a group to the task's sequence.
    pub fn then<I, S>(mut self, group: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task.sequence.push(group.into_iter().map(Into::into).collect());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.task.action = action;
        self
    }

    pub fn define(self) -> Result<(), ConfigError> {
        self.graph.insert(self.task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Single(String),
    Parallel(Vec<String>),
}

impl Stage {
    pub fn tasks(&self) -> &[String] {
        match self {
            Stage::Single(task) => std::slice::from_ref(task),
            Stage::Parallel(tasks) => tasks,
        }
    }
}

/// An ordered list of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    stages: Vec<Stage>,
    edges: Vec<(String, String)>,
}

impl Plan {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Task names in execution order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().flat_map(Stage::tasks).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks().count()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, task: &str) -> bool {
        self.tasks().any(|t| t == task)
    }

    /// `(prerequisite, dependent)` pairs.
    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    pub(crate) fn position(&self, task: &str) -> Option<usize> {
        self.tasks().position(|t| t == task)
    }
}

/// Mermaid flowchart of the plan, one subgraph per stage.
impl Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "    subgraph stage{i}")?;
            for task in stage.tasks() {
                writeln!(f, "        {}[\"{}\"]", node_id(task), task.replace('"', "\\\""))?;
            }
            writeln!(f, "    end")?;
        }
        for (from, to) in &self.edges {
            writeln!(f, "    {} --> {}", node_id(from), node_id(to))?;
        }
        Ok(())
    }
}

/// Mermaid node ids can't contain `:`.
pub(crate) fn node_id(task: &str) -> String {
    task.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(tasks: &[(&str, &[&str])]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for (name, deps) in tasks {
            graph.define(name, deps.iter().copied(), Action::Noop).unwrap();
        }
        graph
    }

    fn position(plan: &Plan, task: &str) -> usize {
        plan.position(task).unwrap()
    }

    #[test]
    fn dependencies_come_first_and_once() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let plan = g.resolve_order("d").unwrap();

        assert_eq!(plan.len(), 4);
        assert_eq!(
            plan.stages(),
            &[
                Stage::Single("a".into()),
                Stage::Parallel(vec!["b".into(), "c".into()]),
                Stage::Single("d".into()),
            ]
        );
        for (from, to) in plan.edges() {
            assert!(position(&plan, from) < position(&plan, to));
        }
    }

    #[test]
    fn only_reachable_tasks_are_planned() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("x", &[])]);
        let plan = g.resolve_order("b").unwrap();
        assert!(!plan.contains("x"));
    }

    #[test]
    fn sequence_orders_groups() {
        let mut g = graph(&[
            ("clean", &[]),
            ("styles", &[]),
            ("lint", &[]),
            ("html", &[]),
            ("scripts", &[]),
        ]);
        g.task("default")
            .depends_on(["clean"])
            .then(["styles"])
            .then(["lint", "html", "scripts"])
            .define()
            .unwrap();

        let plan = g.resolve_order("default").unwrap();
        assert_eq!(
            plan.stages(),
            &[
                Stage::Single("clean".into()),
                Stage::Single("styles".into()),
                Stage::Parallel(vec!["lint".into(), "html".into(), "scripts".into()]),
                Stage::Single("default".into()),
            ]
        );
    }

    #[test]
    fn cycle_is_rejected_with_its_path() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &["a"])]);
        let err = g.resolve_order("d").unwrap_err();
        let ConfigError::Cycle(path) = err else {
            panic!("expected a cycle, got {err:?}");
        };

        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), path.last());
        let mut members: Vec<_> = path[..3].to_vec();
        members.sort();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert!(matches!(
            g.resolve_order("a"),
            Err(ConfigError::Cycle(path)) if path == vec!["a", "a"]
        ));
    }

    #[test]
    fn unknown_names() {
        let g = graph(&[("a", &["ghost"])]);
        assert!(matches!(g.resolve_order("nope"), Err(ConfigError::UnknownTask(t)) if t == "nope"));
        assert!(matches!(
            g.resolve_order("a"),
            Err(ConfigError::UnknownDependency { task, missing }) if task == "a" && missing == "ghost"
        ));
    }

    #[test]
    fn duplicate_definition() {
        let mut g = graph(&[("a", &[])]);
        assert!(matches!(
            g.define("a", [] as [&str; 0], Action::Noop),
            Err(ConfigError::DuplicateTask(t)) if t == "a"
        ));
    }

    #[test]
    fn resolve_many_shares_prerequisites() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        let plan = g.resolve_many(["b", "c"]).unwrap();
        assert_eq!(plan.tasks().filter(|t| *t == "a").count(), 1);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn mermaid_output() {
        let g = graph(&[("a", &[]), ("serve:build", &["a"])]);
        let text = g.resolve_order("serve:build").unwrap().to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("serve_build[\"serve:build\"]"));
        assert!(text.contains("a --> serve_build"));
    }
}
