//! Task runner - executes an ordered task list, fail-fast

use super::confirm::Confirm;
use super::executor::{ExecutionResult, Executor, Invocation, ProcessOptions};
use super::graph::{Task, TaskGraph};
use super::template::CommandTemplate;
use crate::error::{Error, Result};
use crate::publish::{extract, ArtifactPublisher, ArtifactSource, ArtifactSpec};
use crate::report::{RunReport, TaskStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Render and record commands without executing or publishing
    pub dry_run: bool,
    /// Applies to tasks without their own `timeout_secs`
    pub default_timeout: Option<Duration>,
}

/// Command line, working directory and env for one task, fully rendered
struct Prepared {
    command: String,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

pub struct TaskRunner<'g> {
    graph: &'g TaskGraph,
    executor: Executor,
    publisher: ArtifactPublisher,
    confirm: Box<dyn Confirm + 'g>,
    options: RunOptions,
}

impl<'g> TaskRunner<'g> {
    pub fn new(
        graph: &'g TaskGraph,
        executor: Executor,
        publisher: ArtifactPublisher,
        confirm: Box<dyn Confirm + 'g>,
        options: RunOptions,
    ) -> Self {
        Self {
            graph,
            executor,
            publisher,
            confirm,
            options,
        }
    }

    /// Run `order` in sequence. The first failure stops the run; tasks after
    /// it never start.
    pub async fn run(
        &mut self,
        order: &[String],
        params: &HashMap<String, String>,
        report: &mut RunReport,
    ) -> Result<()> {
        let graph = self.graph;
        for name in order {
            let task = graph
                .get_task(name)
                .ok_or_else(|| Error::UnknownTask(name.clone()))?;
            self.run_task(task, params, report).await?;
        }
        Ok(())
    }

    async fn run_task(
        &mut self,
        task: &Task,
        params: &HashMap<String, String>,
        report: &mut RunReport,
    ) -> Result<()> {
        let Some(template) = task.template() else {
            log::info!("Task {} has no command, dependencies satisfied", task.name);
            report.note(&task.name, None, TaskStatus::Grouping);
            return Ok(());
        };

        // explicit params must be resolved even if the command doesn't use them
        if let Some(name) = task.params.iter().find(|p| !params.contains_key(*p)) {
            return Err(Error::MissingParameter {
                task: task.name.clone(),
                name: name.clone(),
            });
        }
        let prepared = prepare(task, &template, params)?;

        if self.options.dry_run {
            log::info!("[dry-run] {}: {}", task.name, prepared.command);
            report.note(&task.name, Some(prepared.command), TaskStatus::Planned);
            return Ok(());
        }

        if task.destructive {
            let prompt = format!(
                "Task '{}' is destructive and will run:\n  {}\nProceed?",
                task.name, prepared.command
            );
            if !self.confirm.confirm(&prompt).await {
                if self.executor.cancel_token().is_cancelled() {
                    report.note(&task.name, Some(prepared.command), TaskStatus::Failed);
                    return Err(Error::Cancelled {
                        task: task.name.clone(),
                    });
                }
                log::warn!("Confirmation declined, {} not run", task.name);
                report.note(&task.name, Some(prepared.command), TaskStatus::Declined);
                return Err(Error::Declined {
                    task: task.name.clone(),
                });
            }
        }

        let options = ProcessOptions {
            working_dir: prepared.working_dir.clone(),
            env: prepared.env,
            timeout: task
                .timeout_secs
                .map(Duration::from_secs)
                .or(self.options.default_timeout),
        };
        let invocation = Invocation::Shell(prepared.command.clone());
        let result = match self.executor.execute(&task.name, invocation, &options).await {
            Ok(result) => result,
            Err(err) => {
                report.note(&task.name, Some(prepared.command), TaskStatus::Failed);
                return Err(err);
            }
        };
        report.record(&prepared.command, &result);

        if !result.success() {
            return Err(Error::TaskFailed {
                task: task.name.clone(),
                code: result.exit_code,
                stderr: result.stderr,
            });
        }

        let working_dir = prepared.working_dir.as_deref();
        for spec in &task.publish {
            self.publish(task, spec, &result, working_dir, params, report).await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        task: &Task,
        spec: &ArtifactSpec,
        result: &ExecutionResult,
        working_dir: Option<&Path>,
        params: &HashMap<String, String>,
        report: &mut RunReport,
    ) -> Result<()> {
        let key = CommandTemplate::new(spec.key.as_str()).render(&task.name, params)?;
        let output = match &spec.source {
            ArtifactSource::Stdout => result.stdout.clone(),
            ArtifactSource::File(path) => {
                let path = CommandTemplate::new(path.as_str()).render(&task.name, params)?;
                let path = match working_dir {
                    Some(dir) => dir.join(path),
                    None => PathBuf::from(path),
                };
                tokio::fs::read_to_string(&path).await.map_err(|e| {
                    Error::Extraction(format!("cannot read {}: {}", path.display(), e))
                })?
            }
        };

        let value = extract(&output, &spec.rule)?;
        let artifact = self
            .publisher
            .publish(&spec.name, &value, &key, spec.overwrite)
            .await?;
        report.add_artifact(artifact);
        Ok(())
    }
}

fn prepare(
    task: &Task,
    template: &CommandTemplate,
    params: &HashMap<String, String>,
) -> Result<Prepared> {
    let command = template.render(&task.name, params)?;
    let working_dir = task
        .working_dir
        .as_deref()
        .map(|dir| CommandTemplate::new(dir).render(&task.name, params).map(PathBuf::from))
        .transpose()?;
    let env = task
        .env
        .iter()
        .map(|(key, value)| {
            CommandTemplate::new(value.as_str())
                .render(&task.name, params)
                .map(|v| (key.clone(), v))
        })
        .collect::<Result<_>>()?;

    Ok(Prepared {
        command,
        working_dir,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PromptConfirm;
    use crate::publish::{ExtractionRule, MemoryRegistry, Registry};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Registry shared with the test so published values can be inspected
    struct Shared(Arc<MemoryRegistry>);

    #[async_trait]
    impl Registry for Shared {
        async fn put(
            &self,
            key: &str,
            value: &str,
            overwrite: bool,
        ) -> std::result::Result<(), String> {
            self.0.put(key, value, overwrite).await
        }
    }

    struct Failing;

    #[async_trait]
    impl Registry for Failing {
        async fn put(&self, _: &str, _: &str, _: bool) -> std::result::Result<(), String> {
            Err("AccessDeniedException".to_string())
        }
    }

    fn runner<'g>(
        graph: &'g TaskGraph,
        registry: Box<dyn Registry>,
        answer: &'static [u8],
        options: RunOptions,
    ) -> TaskRunner<'g> {
        TaskRunner::new(
            graph,
            Executor::quiet(CancellationToken::new()),
            ArtifactPublisher::new(registry),
            Box::new(PromptConfirm::new(answer, tokio::io::sink())),
            options,
        )
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_failing_task() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("third-ran");

        let mut graph = TaskGraph::new();
        graph.add_task(Task::new("first", "echo first")).unwrap();
        graph
            .add_task(Task::new("second", "echo broken >&2; exit 3").depends_on(["first"]))
            .unwrap();
        let third = Task::new("third", format!("touch {}", marker.display()));
        graph.add_task(third.depends_on(["second"])).unwrap();

        let order = graph.resolve_order().unwrap();
        let mut report = RunReport::new("test", "third", false);
        let err = runner(&graph, Box::new(MemoryRegistry::new()), b"", RunOptions::default())
            .run(&order, &HashMap::new(), &mut report)
            .await
            .unwrap_err();

        match err {
            Error::TaskFailed { task, code, stderr } => {
                assert_eq!(task, "second");
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!marker.exists());
        assert_eq!(report.tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_parameter_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");

        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new(
                "apply",
                format!("touch {} {{subnet_id}}", marker.display()),
            ))
            .unwrap();

        let mut report = RunReport::new("test", "apply", false);
        let err = runner(&graph, Box::new(MemoryRegistry::new()), b"", RunOptions::default())
            .run(&["apply".to_string()], &params(&[("vpc_id", "vpc-1")]), &mut report)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::MissingParameter { task, name } if task == "apply" && name == "subnet_id"
        ));
        assert!(!marker.exists());
    }

    fn teardown_graph(marker: &Path) -> TaskGraph {
        let mut graph = TaskGraph::new();
        let destroy = Task::new("cluster-destroy", format!("touch {}", marker.display()));
        graph.add_task(destroy.destructive()).unwrap();
        graph
    }

    async fn run_teardown(answer: &'static [u8]) -> (Result<()>, bool, RunReport) {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("destroyed");
        let graph = teardown_graph(&marker);

        let mut report = RunReport::new("test", "clean", false);
        let registry = Box::new(MemoryRegistry::new());
        let result = runner(&graph, registry, answer, RunOptions::default())
            .run(&["cluster-destroy".to_string()], &HashMap::new(), &mut report)
            .await;
        (result, marker.exists(), report)
    }

    #[tokio::test]
    async fn test_confirmation_gate() {
        let (result, destroyed, report) = run_teardown(b"y\n").await;
        assert!(result.is_ok());
        assert!(destroyed);
        assert_eq!(report.tasks[0].status, TaskStatus::Done);

        for answer in [&b"\n"[..], &b"n\n"[..], &b""[..]] {
            let (result, destroyed, report) = run_teardown(answer).await;
            let err = result.unwrap_err();
            assert!(matches!(err, Error::Declined { ref task } if task == "cluster-destroy"));
            assert_eq!(err.exit_code(), crate::error::EXIT_DECLINED);
            assert!(!destroyed);
            assert_eq!(report.tasks[0].task, "cluster-destroy");
            assert_eq!(report.tasks[0].status, TaskStatus::Declined);
        }
    }

    #[tokio::test]
    async fn test_interrupt_at_prompt_cancels_run() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("destroyed");
        let graph = teardown_graph(&marker);

        let cancel = CancellationToken::new();
        let (silent, _keep_open) = tokio::io::duplex(64);
        let prompt = PromptConfirm::new(tokio::io::BufReader::new(silent), tokio::io::sink())
            .with_cancel(cancel.clone());
        let mut runner = TaskRunner::new(
            &graph,
            Executor::quiet(cancel.clone()),
            ArtifactPublisher::new(Box::new(MemoryRegistry::new())),
            Box::new(prompt),
            RunOptions::default(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let mut report = RunReport::new("test", "clean", false);
        let err = runner
            .run(&["cluster-destroy".to_string()], &HashMap::new(), &mut report)
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), crate::error::EXIT_CANCELLED);
        assert!(!marker.exists());
        assert_eq!(report.tasks[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_publishes_manifest_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new(
            "build-image",
            r#"printf '{"builds":[{"artifact_id":"us-east-1:ami-0123"}]}' > manifest.json"#,
        );
        task.working_dir = Some(dir.path().display().to_string());
        task.publish.push(ArtifactSpec {
            name: "Level1AmiId".to_string(),
            key: "/{namespace}/ami/level1/id".to_string(),
            source: ArtifactSource::File("manifest.json".to_string()),
            rule: ExtractionRule {
                path: Some("builds[-1].artifact_id".to_string()),
                after: Some(":".to_string()),
            },
            overwrite: true,
        });

        let mut graph = TaskGraph::new();
        graph.add_task(task).unwrap();

        let registry = Arc::new(MemoryRegistry::new());
        let mut report = RunReport::new("test", "build-image", false);
        runner(&graph, Box::new(Shared(registry.clone())), b"", RunOptions::default())
            .run(
                &["build-image".to_string()],
                &params(&[("namespace", "nodeforge")]),
                &mut report,
            )
            .await
            .unwrap();

        assert_eq!(
            registry.get("/nodeforge/ami/level1/id").as_deref(),
            Some("ami-0123")
        );
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].name, "Level1AmiId");
    }

    #[tokio::test]
    async fn test_failed_publish_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("after");

        let mut build = Task::new("build", "echo sha256:abc");
        build.publish.push(ArtifactSpec {
            name: "ImageDigest".to_string(),
            key: "/nodeforge/scanner/level1/digest".to_string(),
            source: ArtifactSource::Stdout,
            rule: ExtractionRule::default(),
            overwrite: true,
        });
        let mut graph = TaskGraph::new();
        graph.add_task(build).unwrap();
        let deploy = Task::new("deploy", format!("touch {}", marker.display()));
        graph.add_task(deploy.depends_on(["build"])).unwrap();

        let order = graph.resolve_order().unwrap();
        let mut report = RunReport::new("test", "deploy", false);
        let err = runner(&graph, Box::new(Failing), b"", RunOptions::default())
            .run(&order, &HashMap::new(), &mut report)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Publish { artifact, .. } if artifact == "ImageDigest"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let mut task = Task::new("scan", "sleep 5");
        task.timeout_secs = Some(1);
        let mut graph = TaskGraph::new();
        graph.add_task(task).unwrap();

        let mut report = RunReport::new("test", "run-scan", false);
        let err = runner(&graph, Box::new(MemoryRegistry::new()), b"", RunOptions::default())
            .run(&["scan".to_string()], &HashMap::new(), &mut report)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskTimeout { task, .. } if task == "scan"));
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].task, "scan");
        assert_eq!(report.tasks[0].status, TaskStatus::Failed);
        assert_eq!(report.tasks[0].command.as_deref(), Some("sleep 5"));
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let mut graph = TaskGraph::new();
        let clean = Task::new("clean", format!("touch {}/{{prefix}}", dir.path().display()));
        graph.add_task(clean.destructive()).unwrap();

        let mut report = RunReport::new("test", "clean", true);
        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        runner(&graph, Box::new(MemoryRegistry::new()), b"", options)
            .run(&["clean".to_string()], &params(&[("prefix", "ran")]), &mut report)
            .await
            .unwrap();

        assert!(!marker.exists());
        assert_eq!(report.tasks[0].status, TaskStatus::Planned);
        assert_eq!(
            report.tasks[0].command.as_deref(),
            Some(format!("touch {}/ran", dir.path().display()).as_str())
        );
    }
}
