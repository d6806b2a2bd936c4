//! nodeforge CLI entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodeforge::core::{AssumeYes, Confirm, PromptConfirm, ShellLookup, Stream};
use nodeforge::error::EXIT_FAILURE;
use nodeforge::publish::{MemoryRegistry, Registry, SsmRegistry};
use nodeforge::{App, AppOptions, Config, Executor, RunReport, TaskEvent, Workflow};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Build orchestration for hardened EKS node images and clusters
#[derive(Parser, Debug)]
#[command(name = "nodeforge", version, disable_help_subcommand = true)]
struct Cli {
    /// Workflow file (default: ./nodeforge.yml, else the bundled EKS workflow)
    #[arg(long, global = true)]
    workflow: Option<PathBuf>,

    /// Print the commands that would run without running them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Answer yes to every destructive-task confirmation
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Abort if any parameter had to use its fallback value
    #[arg(long, global = true)]
    strict: bool,

    /// Default per-task timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Seconds to wait for a confirmation answer before declining
    #[arg(long, global = true, value_name = "SECS")]
    confirm_timeout: Option<u64>,

    /// Write a JSON run report to this file
    #[arg(long, global = true, value_name = "FILE")]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Plan the image build infrastructure
    Plan,
    /// Apply the image build infrastructure
    Apply,
    /// Build the hardened node AMI and publish its id
    BuildImage,
    /// Plan the EKS cluster
    ClusterPlan,
    /// Apply the EKS cluster
    ClusterApply,
    /// Run the CIS compliance scan
    RunScan,
    /// Tear down cluster and image infrastructure
    Clean,
    /// List entry points and the tasks they run
    Help,
}

impl Command {
    fn entry(self) -> Option<&'static str> {
        match self {
            Command::Plan => Some("plan"),
            Command::Apply => Some("apply"),
            Command::BuildImage => Some("build-image"),
            Command::ClusterPlan => Some("cluster-plan"),
            Command::ClusterApply => Some("cluster-apply"),
            Command::RunScan => Some("run-scan"),
            Command::Clean => Some("clean"),
            Command::Help => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let failure = err.downcast_ref::<nodeforge::Error>();
            if let Some(task) = failure.and_then(|e| e.task()) {
                eprintln!("nodeforge: task '{}' failed", task);
            }
            eprintln!("nodeforge: {:#}", err);
            if let Some(nodeforge::Error::TaskFailed { task, stderr, .. }) = failure {
                if !stderr.trim().is_empty() {
                    eprintln!("--- stderr of {} ---\n{}", task, stderr.trim_end());
                }
            }
            let code = failure.map(|e| e.exit_code()).unwrap_or(EXIT_FAILURE);
            if matches!(failure, Some(nodeforge::Error::Cancelled { .. })) {
                // an abandoned stdin read would block runtime shutdown
                std::process::exit(code.into());
            }
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    log::info!("nodeforge v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let workflow = Workflow::auto_load(cli.workflow.as_deref()).context("loading workflow")?;
    log::info!(
        "Loaded workflow {} ({} tasks, region {}, prefix {})",
        workflow.name(),
        workflow.graph.len(),
        config.region,
        config.prefix
    );

    let Some(entry) = cli.command.entry() else {
        print_help(&workflow);
        return Ok(());
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping the running task");
            interrupt.cancel();
        }
    });

    let (executor, mut events) = Executor::new(cancel.clone());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TaskEvent::Started { task_id, command } => {
                    eprintln!("==> {}: {}", task_id, command)
                }
                TaskEvent::Output {
                    task_id,
                    stream: Stream::Stdout,
                    line,
                } => println!("[{}] {}", task_id, line),
                TaskEvent::Output {
                    task_id,
                    stream: Stream::Stderr,
                    line,
                } => eprintln!("[{}] {}", task_id, line),
                TaskEvent::Completed { task_id, .. } => eprintln!("==> {}: done", task_id),
                TaskEvent::Failed { task_id, error } => eprintln!("==> {}: {}", task_id, error),
            }
        }
    });

    let lookup = Arc::new(ShellLookup::new(
        Executor::quiet(cancel.clone()),
        Some(Duration::from_secs(120)),
    ));
    let registry: Box<dyn Registry> = if cli.dry_run {
        Box::new(MemoryRegistry::new())
    } else {
        Box::new(SsmRegistry::new(
            Executor::quiet(cancel.clone()),
            config.region.clone(),
        ))
    };
    let confirm: Box<dyn Confirm> = if cli.yes {
        Box::new(AssumeYes)
    } else {
        let prompt = PromptConfirm::stdio().with_cancel(cancel.clone());
        match cli.confirm_timeout {
            Some(secs) => Box::new(prompt.with_timeout(Duration::from_secs(secs))),
            None => Box::new(prompt),
        }
    };

    let options = AppOptions {
        run: nodeforge::core::RunOptions {
            dry_run: cli.dry_run,
            default_timeout: cli.timeout.map(Duration::from_secs),
        },
        strict: cli.strict,
    };

    let mut report = RunReport::new(workflow.name(), entry, cli.dry_run);
    let mut app = App::new(workflow, config, options, executor, lookup, registry, confirm);
    let outcome = app.run(entry, &mut report).await;

    // the app owns the last sender; once it is gone the printer drains and exits
    drop(app);
    let _ = printer.await;

    print_summary(&report);
    if let Some(path) = &cli.report {
        report
            .save_to(path)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }

    outcome.with_context(|| format!("entry point '{}'", entry))
}

fn print_help(workflow: &Workflow) {
    println!("Entry points for {}:\n", workflow.name());
    for (name, entry) in &workflow.entrypoints {
        println!("  {:<14} {}", name, entry.description);
        if let Ok(order) = workflow.plan(name) {
            println!("  {:<14} runs: {}", "", order.join(" -> "));
        }
    }
    println!("\nUse --dry-run to see rendered commands, --yes to skip confirmations.");
}

fn print_summary(report: &RunReport) {
    for task in &report.tasks {
        match task.exit_code {
            Some(code) => println!(
                "  {:<16} {:?} (exit {}, {} ms)",
                task.task, task.status, code, task.duration_ms
            ),
            None => match &task.command {
                Some(command) => println!("  {:<16} {:?}: {}", task.task, task.status, command),
                None => println!("  {:<16} {:?}", task.task, task.status),
            },
        }
    }
    for artifact in &report.artifacts {
        println!("  published {} = {} -> {}", artifact.name, artifact.value, artifact.key);
    }
}
