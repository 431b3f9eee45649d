//! # Label Ledger CLI (`lbl`)
//!
//! The `lbl` binary inspects and edits annotation projects stored in Git
//! repositories. It is the reference client of the [`label_ledger`] library
//! and doubles as an operator tool for flushing or watching a repository.
//!
//! ## Usage
//!
//! ```bash
//! lbl --config ./label-ledger.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lbl projects` | Configured projects, their versions and manifest health |
//! | `lbl versions <project>` | Versions in sort order, default marked |
//! | `lbl items <project>` | Item references and ids |
//! | `lbl show <project> <path> <line>` | One item as JSON |
//! | `lbl locate <project> <id>` | Reference of an item id |
//! | `lbl annotation <project> <path> <line> --annotator <login>` | Saved annotation |
//! | `lbl annotate <project> <path> <line> --annotator <login> --payload <json>` | Stage and save |
//! | `lbl save <project>` | Commit and push everything pending |
//! | `lbl stats <project>` | Per-annotator progress |
//! | `lbl watch <project>` | Autosave until Ctrl-C |
//! | `lbl completions <shell>` | Shell completion script |
//!
//! `<project>` is a slug from the `[projects]` table or a repository URL.
//!
//! ## Examples
//!
//! ```bash
//! # Which versions exist, and which one is served by default?
//! lbl versions support --config ./label-ledger.toml
//!
//! # Label the assistant turn of the first chat
//! lbl annotate support part_000.jsonl 0 --annotator octocat \
//!     --payload '{"labels": {"1": {"tone": ["polite"]}}}'
//!
//! # Keep committing staged work every 30s
//! RUST_LOG=label_ledger=debug lbl watch support
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use label_ledger::config::{self, Config};
use label_ledger::ledger::Ledger;
use label_ledger::repo_cache::RepositoryHandle;
use label_ledger::scheduler::SaveOutcome;
use label_ledger::stats;
use label_ledger_core::models::{Annotator, ItemRef};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Label Ledger CLI — a Git-backed, versioned annotation store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/label-ledger.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lbl",
    about = "Label Ledger — a Git-backed, versioned annotation store",
    version,
    long_about = "Label Ledger serves labeling projects straight from Git repositories: \
    versioned manifests, chunked JSONL source items, and per-annotator annotation files \
    that are committed and pushed back to the same repository."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./label-ledger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured projects with every version and its manifest status.
    Projects,

    /// List the versions of a project; the default one is marked with `*`.
    Versions {
        /// Project slug or repository URL.
        project: String,
    },

    /// List item references (`path:line`) and ids of a version.
    Items {
        project: String,
        /// Version to read (default: last in sort order).
        #[arg(long)]
        version: Option<String>,
    },

    /// Print one source item as JSON.
    Show {
        project: String,
        /// Chunk file relative to `<version>/source/`.
        path: String,
        /// 0-based line number inside the chunk file.
        line: usize,
        #[arg(long)]
        version: Option<String>,
    },

    /// Resolve an item id to its `path:line` reference.
    Locate {
        project: String,
        id: String,
        #[arg(long)]
        version: Option<String>,
    },

    /// Print an annotator's saved annotation for one item.
    Annotation {
        project: String,
        path: String,
        line: usize,
        #[arg(long)]
        annotator: String,
        #[arg(long)]
        version: Option<String>,
    },

    /// Stage an annotation and (unless `--no-save`) commit and push it.
    ///
    /// The payload is the annotation body as JSON, e.g.
    /// `{"labels": {"1": {"tone": ["polite"]}}, "comment": "..."}`.
    Annotate {
        project: String,
        path: String,
        line: usize,
        #[arg(long)]
        annotator: String,
        #[arg(long)]
        payload: String,
        #[arg(long)]
        version: Option<String>,
        /// Only write the file; leave it pending for a later `save`.
        #[arg(long)]
        no_save: bool,
    },

    /// Commit and push every pending annotation file, including files left
    /// over by an earlier failed save.
    Save { project: String },

    /// Show per-annotator progress for a version.
    Stats {
        project: String,
        #[arg(long)]
        version: Option<String>,
    },

    /// Run autosave on the configured interval until Ctrl-C, then flush.
    Watch { project: String },

    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "label_ledger=info".into()),
    );
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "lbl", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;
    let ledger = Ledger::new(cfg);
    let result = run(&ledger, cli.command).await;
    ledger.shutdown();
    result
}

async fn run(ledger: &Ledger, command: Commands) -> Result<()> {
    match command {
        Commands::Projects => list_projects(ledger).await?,
        Commands::Versions { project } => {
            let repo = open(ledger, &project).await?;
            let versions = ledger.versions(&repo)?;
            let default = versions.last().cloned();
            for v in &versions {
                let mark = if Some(v) == default.as_ref() { "*" } else { " " };
                println!("{} {}", mark, v);
            }
        }
        Commands::Items { project, version } => {
            let repo = open(ledger, &project).await?;
            let project = ledger.project(&repo, version.as_deref())?;
            for (item_ref, id) in ledger.item_entries(&project)? {
                println!("{}\t{}", item_ref, id);
            }
        }
        Commands::Show {
            project,
            path,
            line,
            version,
        } => {
            let repo = open(ledger, &project).await?;
            let project = ledger.project(&repo, version.as_deref())?;
            let item = ledger.item(&project, &ItemRef::new(&path, line)?)?;
            println!("{}", serde_json::to_string_pretty(&item.record)?);
        }
        Commands::Locate {
            project,
            id,
            version,
        } => {
            let repo = open(ledger, &project).await?;
            let project = ledger.project(&repo, version.as_deref())?;
            println!("{}", ledger.locate(&project, &id)?);
        }
        Commands::Annotation {
            project,
            path,
            line,
            annotator,
            version,
        } => {
            let repo = open(ledger, &project).await?;
            let project = ledger.project(&repo, version.as_deref())?;
            let item = ledger.item(&project, &ItemRef::new(&path, line)?)?;
            let annotator = Annotator::new(&annotator)?;
            match ledger.annotation(&project, &annotator, &item)? {
                Some(annotation) => {
                    println!("{}", serde_json::to_string_pretty(&annotation.to_record()?)?)
                }
                None => println!("not annotated"),
            }
        }
        Commands::Annotate {
            project,
            path,
            line,
            annotator,
            payload,
            version,
            no_save,
        } => {
            let repo = open(ledger, &project).await?;
            let project = ledger.project(&repo, version.as_deref())?;
            let item = ledger.item(&project, &ItemRef::new(&path, line)?)?;
            let annotator = Annotator::new(&annotator)?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let annotation = ledger
                .annotations()
                .annotation_from_payload(&project, &item, payload)?;
            let staged = ledger
                .stage(&repo, &project, &annotator, &item, &annotation)
                .await?;
            println!("staged {}", staged);
            if !no_save {
                save(ledger, &repo).await?;
            }
        }
        Commands::Save { project } => {
            let repo = open(ledger, &project).await?;
            save(ledger, &repo).await?;
        }
        Commands::Stats { project, version } => {
            let repo = open(ledger, &project).await?;
            let project = ledger.project(&repo, version.as_deref())?;
            stats::print_stats(&stats::collect_stats(ledger, &project)?);
        }
        Commands::Watch { project } => {
            let repo = open(ledger, &project).await?;
            let interval = ledger.config().autosave.interval();
            let autosave = ledger.scheduler(&repo).spawn_autosave(interval);
            println!(
                "autosaving {} every {}s; Ctrl-C to stop",
                repo.url(),
                interval.as_secs()
            );
            tokio::signal::ctrl_c().await?;
            let outcome = autosave.shutdown().await?;
            print_outcome(&outcome);
            println!("status: {}", ledger.status(&repo).label());
        }
        Commands::Completions { .. } => unreachable!("handled before config loading"),
    }
    Ok(())
}

/// Open a configured project by slug, or any repository by URL.
async fn open(ledger: &Ledger, project: &str) -> Result<Arc<RepositoryHandle>> {
    if let Ok(url) = ledger.config().project_url(project) {
        return Ok(ledger.open(url).await?);
    }
    if project.contains("://") || project.contains('@') || std::path::Path::new(project).exists() {
        return Ok(ledger.open(project).await?);
    }
    bail!(
        "Unknown project '{}'. Configured projects: {}",
        project,
        known_projects(ledger.config())
    )
}

async fn save(ledger: &Ledger, repo: &Arc<RepositoryHandle>) -> Result<()> {
    let result = ledger.save(repo).await;
    let status = ledger.status(repo);
    match result {
        Ok(outcome) => {
            print_outcome(&outcome);
            println!("status: {}", status.label());
            Ok(())
        }
        Err(e) => {
            println!("status: {}", status.label());
            Err(e).context("save failed; changes are kept locally and retried on the next save")
        }
    }
}

fn print_outcome(outcome: &SaveOutcome) {
    match outcome {
        SaveOutcome::Committed { files, heads } => {
            let head = heads.last().map(|h| &h[..h.len().min(12)]).unwrap_or("-");
            println!("saved {} file(s), head {}", files, head);
        }
        SaveOutcome::NothingToSave | SaveOutcome::Skipped => println!("nothing to save"),
    }
}

async fn list_projects(ledger: &Ledger) -> Result<()> {
    let cfg = ledger.config();
    if cfg.projects.is_empty() {
        println!("No projects configured. Add a [projects] table to the config file.");
        return Ok(());
    }

    println!("{:<16} {:<12} {:<28} STATUS", "PROJECT", "VERSION", "NAME");
    for slug in cfg.projects.keys() {
        let repo = match ledger.open_project(slug).await {
            Ok(repo) => repo,
            Err(e) => {
                println!("{:<16} {:<12} {:<28} ERROR: {}", slug, "-", "-", e);
                continue;
            }
        };
        let versions = match ledger.projects(&repo) {
            Ok(versions) => versions,
            Err(e) => {
                println!("{:<16} {:<12} {:<28} ERROR: {}", slug, "-", "-", e);
                continue;
            }
        };
        if versions.is_empty() {
            println!("{:<16} {:<12} {:<28} no versions", slug, "-", "-");
        }
        for (version, project) in versions {
            match project {
                Ok(p) => println!("{:<16} {:<12} {:<28} OK ({})", slug, version, p.name, p.task_type),
                Err(e) => println!("{:<16} {:<12} {:<28} ERROR: {}", slug, version, "-", e),
            }
        }
        if let Some(link) = repo.location().web_url() {
            println!("{:<16} {}", "", link);
        }
    }
    Ok(())
}

fn known_projects(cfg: &Config) -> String {
    if cfg.projects.is_empty() {
        "(none)".to_string()
    } else {
        cfg.projects.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}
