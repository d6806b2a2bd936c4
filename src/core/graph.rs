//! Task graph - named tasks, declared dependencies, execution order

use super::template::CommandTemplate;
use crate::error::{Error, Result};
use crate::publish::ArtifactSpec;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// A single unit of work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    /// Filled from the map key when loaded from a workflow file
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Shell command template; a task without one only groups its dependencies
    pub command: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Parameters required beyond the ones named in the command template
    #[serde(default)]
    pub params: Vec<String>,
    /// Destructive tasks pass through the confirmation gate
    #[serde(default)]
    pub destructive: bool,
    pub timeout_secs: Option<u64>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub publish: Vec<ArtifactSpec>,
}

impl Task {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    pub fn template(&self) -> Option<CommandTemplate> {
        self.command.as_deref().map(CommandTemplate::from)
    }

    /// Every parameter this task needs: explicit `params`, placeholders in the
    /// command, working directory, env values and publish specs.
    pub fn required_params(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: String| {
            if !names.contains(&name) {
                names.push(name);
            }
        };

        for name in &self.params {
            push(name.clone());
        }
        let templates = self
            .command
            .iter()
            .chain(self.working_dir.iter())
            .chain(self.env.values())
            .cloned()
            .chain(self.publish.iter().flat_map(ArtifactSpec::templates));
        for source in templates {
            for name in CommandTemplate::new(source).placeholders() {
                push(name);
            }
        }
        names
    }
}

/// Directed acyclic graph of tasks, kept in declaration order
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task whose dependencies are already defined
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.name) {
            return Err(Error::DuplicateTask(task.name));
        }
        if let Some(dep) = task.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
            return Err(Error::UnknownDependency {
                task: task.name.clone(),
                dependency: dep.clone(),
            });
        }
        self.insert(task);
        Ok(())
    }

    /// Add a task without checking its dependencies; call [`finalize`](Self::finalize)
    /// once every task has been declared.
    pub fn declare(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.name) {
            return Err(Error::DuplicateTask(task.name));
        }
        self.insert(task);
        Ok(())
    }

    fn insert(&mut self, task: Task) {
        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
    }

    /// Validate dependencies and acyclicity
    pub fn finalize(&self) -> Result<()> {
        for task in &self.tasks {
            if let Some(dep) = task.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
                return Err(Error::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        self.resolve_order().map(|_| ())
    }

    /// Topological order of every task; ties follow declaration order
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let graph = self.build()?;
        let mut indegree: Vec<usize> = graph
            .node_indices()
            .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.tasks[i].name.clone());
            for next in graph.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
                let deg = &mut indegree[next.index()];
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        if order.len() < self.tasks.len() {
            return Err(Error::CycleDetected {
                tasks: self.cycle_members(&graph),
            });
        }
        Ok(order)
    }

    /// Order for `target` and its transitive dependencies only
    pub fn order_for(&self, target: &str) -> Result<Vec<String>> {
        let start = *self
            .index
            .get(target)
            .ok_or_else(|| Error::UnknownTask(target.to_string()))?;

        let graph = self.build()?;
        let reversed = Reversed(&graph);
        let mut dfs = Dfs::new(reversed, NodeIndex::new(start));
        let mut closure = HashSet::new();
        while let Some(node) = dfs.next(reversed) {
            closure.insert(self.tasks[node.index()].name.clone());
        }

        Ok(self
            .resolve_order()?
            .into_iter()
            .filter(|name| closure.contains(name))
            .collect())
    }

    pub fn get_task(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Edges run dependency -> dependent; node indices match declaration order
    fn build(&self) -> Result<DiGraph<(), ()>> {
        let mut graph = DiGraph::with_capacity(self.tasks.len(), 0);
        for _ in &self.tasks {
            graph.add_node(());
        }
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let &d = self.index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(NodeIndex::new(d), NodeIndex::new(i), ());
            }
        }
        Ok(graph)
    }

    fn cycle_members(&self, graph: &DiGraph<(), ()>) -> Vec<String> {
        let component = tarjan_scc(graph).into_iter().find(|scc| {
            scc.len() > 1 || graph.contains_edge(scc[0], scc[0])
        });

        let mut members: Vec<usize> = component
            .unwrap_or_default()
            .into_iter()
            .map(NodeIndex::index)
            .collect();
        members.sort_unstable();
        members
            .into_iter()
            .map(|i| self.tasks[i].name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_add_task_rejects_duplicates_and_unknown_deps() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new("init", "terraform init")).unwrap();

        let dup = graph.add_task(Task::new("init", "terraform init")).unwrap_err();
        assert!(matches!(dup, Error::DuplicateTask(name) if name == "init"));

        let unknown = graph
            .add_task(Task::new("apply", "terraform apply").depends_on(["plan"]))
            .unwrap_err();
        assert!(matches!(
            unknown,
            Error::UnknownDependency { task, dependency } if task == "apply" && dependency == "plan"
        ));
    }

    #[test]
    fn test_order_respects_dependencies() {
        let mut graph = TaskGraph::new();
        graph.declare(Task::new("apply", "a").depends_on(["plan"])).unwrap();
        graph
            .declare(Task::new("cluster-apply", "c").depends_on(["cluster-init", "apply"]))
            .unwrap();
        graph.declare(Task::new("plan", "p").depends_on(["init"])).unwrap();
        graph.declare(Task::new("init", "i")).unwrap();
        graph.declare(Task::new("cluster-init", "ci")).unwrap();
        graph.finalize().unwrap();

        let order = graph.resolve_order().unwrap();
        assert_eq!(order.len(), 5);
        for task in graph.tasks() {
            for dep in &task.depends_on {
                assert!(position(&order, dep) < position(&order, &task.name));
            }
        }
        // independent roots keep declaration order
        assert!(position(&order, "init") < position(&order, "cluster-init"));
    }

    #[test]
    fn test_cycle_names_members() {
        let mut graph = TaskGraph::new();
        graph.declare(Task::new("a", "true").depends_on(["b"])).unwrap();
        graph.declare(Task::new("b", "true").depends_on(["a"])).unwrap();
        graph.declare(Task::new("c", "true")).unwrap();

        match graph.finalize().unwrap_err() {
            Error::CycleDetected { tasks } => assert_eq!(tasks, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = TaskGraph::new();
        graph.declare(Task::new("loop", "true").depends_on(["loop"])).unwrap();
        assert!(matches!(
            graph.resolve_order().unwrap_err(),
            Error::CycleDetected { tasks } if tasks == vec!["loop"]
        ));
    }

    #[test]
    fn test_finalize_reports_unknown_dependency() {
        let mut graph = TaskGraph::new();
        graph.declare(Task::new("plan", "p").depends_on(["init"])).unwrap();
        assert!(matches!(
            graph.finalize().unwrap_err(),
            Error::UnknownDependency { dependency, .. } if dependency == "init"
        ));
    }

    #[test]
    fn test_order_for_target_closure() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new("init", "i")).unwrap();
        graph.add_task(Task::new("plan", "p").depends_on(["init"])).unwrap();
        graph.add_task(Task::new("cluster-init", "ci")).unwrap();
        graph.add_task(Task::new("cluster-plan", "cp").depends_on(["cluster-init"])).unwrap();

        assert_eq!(graph.order_for("plan").unwrap(), vec!["init", "plan"]);
        assert_eq!(
            graph.order_for("cluster-plan").unwrap(),
            vec!["cluster-init", "cluster-plan"]
        );
        assert!(matches!(
            graph.order_for("nope").unwrap_err(),
            Error::UnknownTask(_)
        ));
    }

    #[test]
    fn test_required_params_collects_all_templates() {
        let mut task = Task::new("apply", "terraform apply -var vpc={vpc_id}");
        task.params = vec!["account_id".to_string()];
        task.working_dir = Some("terraform/{component}".to_string());
        task.env.insert("AWS_REGION".to_string(), "{region}".to_string());

        assert_eq!(
            task.required_params(),
            vec!["account_id", "vpc_id", "component", "region"]
        );
    }
}
