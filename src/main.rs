use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

use phaser::config::Config;
use phaser::core::{TaskGraph, TaskList};
use phaser::error::EXIT_OK;
use phaser::metrics::RunReport;
use phaser::orchestration::{PhaseRunner, RunSettings};
use phaser::store::{FileStore, PhaseRunId, RunStore};
use phaser::{Error, Result};

/// Phaser - run a dependency-ordered task list with parallel workers and quality gates
#[derive(Parser, Debug)]
#[command(name = "phaser")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PHASER_DEBUG=1     Enable debug logging (alternative to --debug)\n    PHASER_LOG=<spec>  Log filter directive, e.g. phaser=trace")]
pub struct Cli {
    /// Config file (default: ~/.phaser/phaser.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a task list, resuming a matching phase run if one exists
    Run {
        /// Task list file (.toml or .json)
        tasks: PathBuf,

        #[arg(long)]
        phase: String,

        #[arg(long)]
        project: String,

        /// Override run.max_workers
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resume a phase run by id
    Resume {
        phase_run_id: String,

        #[arg(long)]
        json: bool,
    },

    /// List phase runs, or show one
    Status { phase_run_id: Option<String> },

    /// Validate a task list and print its waves
    Waves { tasks: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    phaser::log::init_with_debug(cli.debug);

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "phaser failed");
            eprintln!("error: {}", err);
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    debug!(command = ?cli.command, config = ?cli.config, "phaser starting");
    if let Command::Waves { tasks } = &cli.command {
        return run_waves(tasks);
    }

    let config = Config::load_from(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Run {
                tasks,
                phase,
                project,
                workers,
                json,
            } => run_phase(&config, &tasks, &phase, &project, workers, json).await,
            Command::Resume { phase_run_id, json } => {
                run_resume(&config, &phase_run_id, json).await
            }
            Command::Status { phase_run_id } => run_status(&config, phase_run_id.as_deref()).await,
            Command::Waves { .. } => Ok(EXIT_OK),
        }
    })
}

/// Unreadable or malformed task lists are usage errors, not store failures.
fn load_tasks(path: &Path) -> Result<TaskList> {
    TaskList::load(path).map_err(|err| match err {
        Error::Io(e) => Error::Validation(format!("cannot read {}: {}", path.display(), e)),
        Error::Json(e) => Error::Validation(format!("invalid task list {}: {}", path.display(), e)),
        other => other,
    })
}

fn run_waves(path: &Path) -> Result<i32> {
    let list = load_tasks(path)?;
    let graph = TaskGraph::build(&list.tasks)?;
    for (index, wave) in graph.waves().iter().enumerate() {
        let ids: Vec<String> = wave.iter().map(|id| id.to_string()).collect();
        println!("wave {}: {}", index, ids.join(", "));
    }
    println!(
        "{} tasks, {} waves, critical path {} min",
        graph.task_count(),
        graph.waves().len(),
        graph.critical_path_minutes()
    );
    Ok(EXIT_OK)
}

async fn open_store(config: &Config) -> Result<Arc<FileStore>> {
    let dir = config.store_dir()?;
    Ok(Arc::new(FileStore::open(&dir).await?))
}

fn runner(config: &Config, store: Arc<FileStore>, settings: RunSettings) -> Result<PhaseRunner> {
    let mut runner = PhaseRunner::new(store, config.executor()?)
        .with_checks(config.checks()?)
        .with_settings(settings);
    if let Some(reviewer) = config.reviewer()? {
        runner = runner.with_reviewer(reviewer);
    }
    Ok(runner)
}

async fn run_phase(
    config: &Config,
    tasks: &Path,
    phase: &str,
    project: &str,
    workers: Option<usize>,
    json: bool,
) -> Result<i32> {
    let list = load_tasks(tasks)?;
    let mut settings = config.run_settings();
    if let Some(workers) = workers {
        if workers == 0 {
            return Err(Error::Validation("--workers must be at least 1".into()));
        }
        settings.max_workers = workers;
    }
    let store = open_store(config).await?;
    let report = runner(config, store, settings)?
        .run(phase, project, &list.tasks)
        .await?;
    print_report(&report, json)
}

async fn run_resume(config: &Config, phase_run_id: &str, json: bool) -> Result<i32> {
    let id = parse_phase_run_id(phase_run_id)?;
    let store = open_store(config).await?;
    let report = runner(config, store, config.run_settings())?
        .resume(id)
        .await?;
    print_report(&report, json)
}

async fn run_status(config: &Config, phase_run_id: Option<&str>) -> Result<i32> {
    let store = open_store(config).await?;
    match phase_run_id {
        None => {
            let runs = store.phase_runs().await?;
            if runs.is_empty() {
                println!("No phase runs");
            }
            for run in runs {
                println!(
                    "{}  {:<12} {}/{}  started {}  {}",
                    run.id.short(),
                    run.status.to_string(),
                    run.project_name,
                    run.phase_name,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.summary.as_deref().unwrap_or("")
                );
            }
        }
        Some(id) => {
            let id = parse_phase_run_id(id)?;
            let run = store
                .phase_run(id)
                .await?
                .ok_or_else(|| Error::PhaseRunNotFound(id.to_string()))?;
            let graph = TaskGraph::build(&run.tasks)?;
            let report = RunReport::collect(store.as_ref(), &run, &graph).await?;
            println!("{}", report);
        }
    }
    Ok(EXIT_OK)
}

fn print_report(report: &RunReport, json: bool) -> Result<i32> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }
    Ok(report.exit_code)
}

fn parse_phase_run_id(id: &str) -> Result<PhaseRunId> {
    id.parse()
        .map_err(|_| Error::Validation(format!("invalid phase run id: {}", id)))
}
