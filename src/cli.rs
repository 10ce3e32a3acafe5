//! The `aq` command-line interface.
//!
//! The CLI operates over a [`TaskRegistry`] supplied by the embedding
//! application; `aq` itself ships with an empty one. Subcommands:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run`   | Resolve and execute a task, with backend and force flags |
//! | `ls`    | List registered tasks |
//! | `config`| Show the layered configuration |
//! | `del`   | Delete artifacts under a task tree (interactive) |
//! | `artifact ls` | List filesystem artifacts of a task tree |
//!
//! `run --cfg` and `run --tree` short-circuit before execution. Exit code
//! is zero on success and non-zero on any task error or parse failure.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::Map;

use crate::backend::{self, ArcBackend, BackendSpec, DaskSpec};
use crate::config::Config;
use crate::context::{self, ForceSet};
use crate::error::AqueductError;
use crate::registry::TaskRegistry;
use crate::resolve;
use crate::task::ArcTask;
use crate::tree::WorkTree;

#[derive(Parser)]
#[command(name = "aq")]
#[command(about = "Aqueduct - task graph runner for data pipelines")]
#[command(version)]
pub struct Cli {
    /// Log debug output.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve and execute a task.
    Run(RunArgs),

    /// List registered tasks.
    Ls {
        /// Print each task's declared parameters.
        #[arg(long)]
        signature: bool,
    },

    /// Inspect the layered configuration.
    Config(ConfigArgs),

    /// Delete artifacts belonging to a task tree.
    Del(DelArgs),

    /// Artifact inspection.
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("backend").args(["concurrent", "dask_url", "dask", "multiprocessing"])))]
#[command(group(ArgGroup::new("diagnostics").args(["cfg", "tree"])))]
pub struct RunArgs {
    /// Task name.
    pub task: String,

    /// Task parameters, `param=value`.
    pub parameters: Vec<String>,

    /// Global configuration overrides, `key=value` with dotted keys.
    #[arg(long, num_args = 0..)]
    pub overrides: Vec<String>,

    /// Ignore the cache for the root task.
    #[arg(long)]
    pub force_root: bool,

    /// Re-run the named task class and everything that depends on it.
    #[arg(long)]
    pub force_downstream_of: Option<String>,

    /// Print the resolved configuration and exit.
    #[arg(long)]
    pub cfg: bool,

    /// Resolve interpolations before printing.
    #[arg(long)]
    pub resolve: bool,

    /// Print the task tree that would execute and exit.
    #[arg(long)]
    pub tree: bool,

    /// Worker-pool backend with N workers.
    #[arg(long)]
    pub concurrent: Option<usize>,

    /// Graph backend against a remote scheduler.
    #[arg(long)]
    pub dask_url: Option<String>,

    /// Graph backend with N local workers.
    #[arg(long)]
    pub dask: Option<usize>,

    /// Item-parallel pool with N workers.
    #[arg(long)]
    pub multiprocessing: Option<usize>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Print the merged configuration.
    #[arg(long)]
    pub show: bool,

    /// Show the contribution of each configuration source.
    #[arg(long)]
    pub sources: bool,

    /// Resolve interpolations before printing.
    #[arg(long)]
    pub resolve: bool,

    /// Include the parameter section of this task.
    #[arg(long)]
    pub task: Option<String>,

    /// Task parameters, `param=value`.
    pub parameters: Vec<String>,

    /// Global configuration overrides.
    #[arg(long, num_args = 0..)]
    pub overrides: Vec<String>,
}

#[derive(Args)]
pub struct DelArgs {
    /// Task at the root of the dependency tree.
    pub task: String,

    /// Task parameters, `param=value`.
    pub parameters: Vec<String>,

    /// Only delete artifacts of this task class and its subtree.
    #[arg(long)]
    pub below: Option<String>,

    /// Maximum tree depth to explore.
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Only delete artifacts of tasks whose name matches this pattern.
    #[arg(long)]
    pub re: Option<String>,
}

#[derive(Subcommand)]
pub enum ArtifactCommands {
    /// List filesystem artifacts of a task tree.
    Ls {
        /// Task at the root of the dependency tree.
        task: String,

        /// Task parameters, `param=value`.
        parameters: Vec<String>,

        /// Maximum tree depth to explore.
        #[arg(long)]
        max_depth: Option<usize>,
    },
}

/// Parse the process arguments and dispatch against a registry.
pub async fn main(registry: TaskRegistry) -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .try_init();

    execute(cli, &registry).await
}

/// Dispatch an already-parsed invocation.
pub async fn execute(cli: Cli, registry: &TaskRegistry) -> ExitCode {
    let result = match cli.command {
        Commands::Run(args) => run_command(args, registry).await,
        Commands::Ls { signature } => ls_command(registry, signature),
        Commands::Config(args) => config_command(args, registry),
        Commands::Del(args) => del_command(args, registry),
        Commands::Artifact {
            command: ArtifactCommands::Ls {
                task,
                parameters,
                max_depth,
            },
        } => artifact_ls_command(&task, &parameters, max_depth, registry),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(key) = err.task_key() {
                eprintln!("{} {}", "Failed task:".red().bold(), key);
            }
            eprintln!("{} {}", "Error:".red().bold(), err);
            ExitCode::FAILURE
        }
    }
}

/// Layer the configuration sources for a task invocation, later overriding
/// earlier: defaults, global overrides, then task parameters nested under
/// the task's config section.
fn layered_config(
    overrides: &[String],
    parameters: &[String],
    task_section: Option<&str>,
) -> Result<Config, AqueductError> {
    let mut sources = vec![Config::new(), Config::from_dotlist(overrides)?];
    if let Some(section) = task_section {
        sources.push(Config::from_dotlist_in_section(parameters, section)?);
    }
    Ok(Config::merge_all(sources))
}

fn section_of(registry: &TaskRegistry, task: &str) -> String {
    registry
        .get(task)
        .and_then(|factory| factory.config_section.clone())
        .unwrap_or_else(|| task.to_string())
}

fn build_root(registry: &TaskRegistry, task: &str) -> Result<ArcTask, AqueductError> {
    registry.build(task, Map::new())
}

fn backend_from_flags(args: &RunArgs) -> Result<Option<ArcBackend>, AqueductError> {
    let spec = if let Some(n) = args.concurrent {
        Some(BackendSpec::Concurrent { n_workers: n })
    } else if let Some(address) = &args.dask_url {
        Some(BackendSpec::Dask(DaskSpec::Address {
            address: address.clone(),
        }))
    } else if let Some(n) = args.dask {
        Some(BackendSpec::Dask(DaskSpec::Workers { n_workers: n }))
    } else {
        args.multiprocessing
            .map(|n| BackendSpec::Multiprocessing { n_workers: n })
    };
    spec.as_ref().map(backend::resolve_backend_from_spec).transpose()
}

async fn run_command(args: RunArgs, registry: &TaskRegistry) -> Result<(), AqueductError> {
    let section = section_of(registry, &args.task);
    let cfg = layered_config(&args.overrides, &args.parameters, Some(&section))?;

    if args.cfg {
        let shown = if args.resolve { cfg.resolve()? } else { cfg };
        print!("{}", shown.to_yaml());
        return Ok(());
    }

    context::set_config(cfg);
    let root = build_root(registry, &args.task)?;
    let work = WorkTree::Task(root.clone());

    if args.tree {
        print!("{}", resolve::render_task_tree(&work));
        return Ok(());
    }

    let mut force = ForceSet::new();
    if args.force_root {
        force.insert(root.name());
    }
    if let Some(target) = &args.force_downstream_of {
        force.extend(resolve::downstream_of(&work, target));
    }

    let backend = match backend_from_flags(&args)? {
        Some(backend) => backend,
        None => backend::default_backend()?,
    };

    println!(
        "{} Using backend: {}",
        "→".cyan(),
        backend.spec().to_string().cyan().bold()
    );

    let result = resolve::run_on(&backend, &work, force).await;
    backend.close();
    let value = result?;

    if !value.is_null() {
        println!("{}", "Result:".cyan().bold());
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
        );
    }
    Ok(())
}

fn ls_command(registry: &TaskRegistry, signature: bool) -> Result<(), AqueductError> {
    if registry.is_empty() {
        println!("No tasks registered.");
        return Ok(());
    }
    for factory in registry.factories() {
        if signature {
            println!("{}", factory.signature());
        } else {
            println!("{}", factory.name);
        }
    }
    Ok(())
}

fn config_command(args: ConfigArgs, registry: &TaskRegistry) -> Result<(), AqueductError> {
    let task_section = args.task.as_deref().map(|task| section_of(registry, task));

    if args.sources {
        let overrides = Config::from_dotlist(&args.overrides)?;
        println!("{}", "overrides:".bold());
        print!("{}", indent(&overrides.to_yaml()));
        if let Some(section) = &task_section {
            let parameters = Config::from_dotlist_in_section(&args.parameters, section)?;
            println!("{}", "task parameters:".bold());
            print!("{}", indent(&parameters.to_yaml()));
        }
    }

    if args.show || !args.sources {
        let cfg = layered_config(&args.overrides, &args.parameters, task_section.as_deref())?;
        let shown = if args.resolve { cfg.resolve()? } else { cfg };
        print!("{}", shown.to_yaml());
    }
    Ok(())
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}\n"))
        .collect()
}

fn del_command(args: DelArgs, registry: &TaskRegistry) -> Result<(), AqueductError> {
    let section = section_of(registry, &args.task);
    let cfg = layered_config(&[], &args.parameters, Some(&section))?;
    context::set_config(cfg);

    let root = build_root(registry, &args.task)?;
    let work = WorkTree::Task(root);

    let pattern = args
        .re
        .as_deref()
        .map(regex::Regex::new)
        .transpose()
        .map_err(|e| AqueductError::other(format!("invalid pattern: {e}")))?;

    let mut found: Vec<(String, PathBuf)> = Vec::new();
    collect_artifacts(
        &work,
        args.below.as_deref(),
        args.below.is_none(),
        args.max_depth.unwrap_or(usize::MAX),
        &mut found,
    );

    found.retain(|(name, path)| {
        pattern.as_ref().map(|re| re.is_match(name)).unwrap_or(true) && path.exists()
    });
    found.sort();
    found.dedup();

    if found.is_empty() {
        println!("No artifacts found for task {}.", args.task);
        return Ok(());
    }

    println!("Will delete {} artifacts:", found.len());
    for (name, path) in &found {
        println!("    {} {}", name, path.display());
    }
    print!("Continue? (y/N) ");
    use std::io::Write;
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    if !answer.trim().eq_ignore_ascii_case("y") {
        return Ok(());
    }

    for (_, path) in &found {
        println!("Removing {}.", path.display());
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn artifact_ls_command(
    task: &str,
    parameters: &[String],
    max_depth: Option<usize>,
    registry: &TaskRegistry,
) -> Result<(), AqueductError> {
    let section = section_of(registry, task);
    let cfg = layered_config(&[], parameters, Some(&section))?;
    context::set_config(cfg);

    let root = build_root(registry, task)?;
    let work = WorkTree::Task(root);
    for path in crate::artifact::report::artifact_paths(&work, max_depth) {
        println!("{}", path.display());
    }
    Ok(())
}

/// Gather `(task name, artifact path)` pairs from the full (ungated)
/// dependency tree, honoring `--below` and `--max-depth`.
fn collect_artifacts(
    work: &WorkTree,
    below: Option<&str>,
    active: bool,
    depth_left: usize,
    out: &mut Vec<(String, PathBuf)>,
) {
    for task in work.tasks() {
        let here_active = active || below == Some(task.name().as_str());
        if here_active {
            if let Some(artifact) = task.artifact() {
                push_paths(&task.name(), &artifact, out);
            }
        }
        if depth_left > 0 {
            if let Some(requirements) = task.requirements() {
                collect_artifacts(&requirements, below, here_active, depth_left - 1, out);
            }
        }
    }
}

fn push_paths(
    name: &str,
    artifact: &crate::artifact::ArcArtifact,
    out: &mut Vec<(String, PathBuf)>,
) {
    if let Some(path) = artifact.path() {
        out.push((name.to_string(), path.to_path_buf()));
    }
    if let Some(children) = artifact.children() {
        for child in children {
            push_paths(name, child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_backend_flag() {
        let cli = Cli::try_parse_from([
            "aq",
            "run",
            "MeanStation",
            "station=7",
            "--overrides",
            "aqueduct.local_store=/tmp/store",
            "--concurrent",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.task, "MeanStation");
                assert_eq!(args.parameters, vec!["station=7"]);
                assert_eq!(args.concurrent, Some(4));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn backend_flags_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from([
            "aq",
            "run",
            "T",
            "--concurrent",
            "2",
            "--dask",
            "3",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn cfg_and_tree_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from(["aq", "run", "T", "--cfg", "--tree"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_del_flags() {
        let cli = Cli::try_parse_from([
            "aq",
            "del",
            "T",
            "--below",
            "U",
            "--max-depth",
            "3",
            "--re",
            "^Fetch",
        ])
        .unwrap();
        match cli.command {
            Commands::Del(args) => {
                assert_eq!(args.below.as_deref(), Some("U"));
                assert_eq!(args.max_depth, Some(3));
                assert_eq!(args.re.as_deref(), Some("^Fetch"));
            }
            _ => panic!("expected del"),
        }
    }

    #[test]
    fn parse_artifact_ls() {
        let cli = Cli::try_parse_from(["aq", "artifact", "ls", "T", "--max-depth", "2"]).unwrap();
        match cli.command {
            Commands::Artifact {
                command: ArtifactCommands::Ls { task, max_depth, .. },
            } => {
                assert_eq!(task, "T");
                assert_eq!(max_depth, Some(2));
            }
            _ => panic!("expected artifact ls"),
        }
    }

    #[test]
    fn layered_config_priority() {
        let cfg = layered_config(
            &["a.b=1".into(), "Task.x=0".into()],
            &["x=2".into()],
            Some("Task"),
        )
        .unwrap();
        assert_eq!(cfg.get("a.b"), Some(&serde_json::json!(1)));
        // Task parameters land in the task section and beat overrides.
        assert_eq!(cfg.get("Task.x"), Some(&serde_json::json!(2)));
    }
}
