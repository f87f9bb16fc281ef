//! rune-deploy - declarative multi-service deployment planner
//!
//! This is the main CLI entry point for rune-deploy.

use clap::{Args, Parser, Subcommand};
use rune_deploy::backend::LocalBackend;
use rune_deploy::compose::{ApplyReport, ComposeOrchestrator, DescriptorParser};
use rune_deploy::config::PlannerConfig;
use rune_deploy::error::{DeployError, Result};
use rune_deploy::project::{DependencyGraph, Project, Validator};
use rune_deploy::scheduler::StartMode;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// rune-deploy - declarative multi-service deployment planner
#[derive(Parser)]
#[command(name = "rune-deploy")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Plan and apply compose-style multi-service deployments", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Reject unknown descriptor fields
    #[arg(long, global = true)]
    strict: bool,

    /// Env file used for interpolation (repeatable)
    #[arg(long = "env-file", global = true)]
    env_file: Vec<PathBuf>,

    /// Directory holding deployed state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Global apply timeout (e.g. 90s, 5m)
    #[arg(long, global = true)]
    timeout: Option<String>,

    /// Planner configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project name
    #[arg(short, long, global = true)]
    project_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Descriptor {
    /// Compose files, merged in order (default: discovered in the current directory)
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a descriptor and list every problem found
    Validate {
        #[command(flatten)]
        descriptor: Descriptor,
    },

    /// Show the actions apply would take
    Plan {
        #[command(flatten)]
        descriptor: Descriptor,
    },

    /// Create, recreate and destroy services, then wait for them to become healthy
    Apply {
        #[command(flatten)]
        descriptor: Descriptor,
    },

    /// Destroy every deployed service of the project
    Down {
        #[command(flatten)]
        descriptor: Descriptor,
    },

    /// List deployed services
    Ps {
        #[command(flatten)]
        descriptor: Descriptor,
    },

    /// Print the merged and interpolated descriptor
    Config {
        #[command(flatten)]
        descriptor: Descriptor,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error [{}]: {}", e.kind(), e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = settings(&cli)?;

    match cli.command {
        Commands::Validate { descriptor } => {
            let project = load_project(&config, &descriptor.files)?;

            let report = Validator::validate(&project);
            if !report.is_empty() {
                println!("{}", report);
                return Ok(1);
            }

            let graph = DependencyGraph::from_project(&project);
            let levels = graph.levels()?;

            println!(
                "Project {} is valid ({} services)",
                project.name,
                project.services.len()
            );
            for (i, level) in levels.iter().enumerate() {
                println!("  stage {}: {}", i + 1, level.join(", "));
            }
            Ok(0)
        }

        Commands::Plan { descriptor } => {
            let orchestrator = orchestrator(&config, &descriptor.files)?;
            let plan = orchestrator.plan().await?;
            println!("{}", plan);
            Ok(0)
        }

        Commands::Apply { descriptor } => {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling pending services");
                    trigger.cancel();
                }
            });

            let orchestrator = orchestrator(&config, &descriptor.files)?
                .with_timeout(config.apply_timeout()?)
                .with_cancellation(cancel);
            let report = orchestrator.up().await?;
            print_apply_report(&report);
            Ok(report.exit_code())
        }

        Commands::Down { descriptor } => {
            let orchestrator = orchestrator(&config, &descriptor.files)?;
            let report = orchestrator.down().await?;

            if report.plan.actions.is_empty() {
                println!("Nothing deployed for project {}", orchestrator.project().name);
            }
            for name in &report.destroyed {
                println!("Destroyed {}", name);
            }
            for failure in &report.failures {
                println!("Failed to destroy {}: {}", failure.service, failure.reason);
            }
            Ok(if report.failures.is_empty() { 0 } else { 2 })
        }

        Commands::Ps { descriptor } => {
            let orchestrator = orchestrator(&config, &descriptor.files)?;
            let deployed = orchestrator.status().await?;

            println!(
                "{:<20} {:<30} {:<14} {:<14} CREATED",
                "SERVICE", "IMAGE", "INSTANCE", "SPEC"
            );
            for service in deployed {
                println!(
                    "{:<20} {:<30} {:<14} {:<14} {}",
                    service.name,
                    service.image,
                    service.instance_id,
                    &service.spec_hash[..service.spec_hash.len().min(12)],
                    service.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(0)
        }

        Commands::Config { descriptor } => {
            let files = descriptor_files(&descriptor.files)?;
            let parser = parser(&config, &files)?;
            // surface descriptor errors before printing
            parser.parse_files(&files)?;
            let value = parser.load_value(&files)?;
            print!("{}", serde_yaml::to_string(&value)?);
            Ok(0)
        }
    }
}

/// Configuration file, then command-line overrides
fn settings(cli: &Cli) -> Result<PlannerConfig> {
    let default_path = dirs::config_dir().map(|dir| dir.join("rune-deploy").join("config.yaml"));
    let mut config = match (&cli.config, default_path) {
        (Some(path), _) => PlannerConfig::load(path)?,
        (None, Some(path)) if path.is_file() => PlannerConfig::load(&path)?,
        _ => PlannerConfig::default(),
    };

    if cli.strict {
        config.strict = true;
    }
    if !cli.env_file.is_empty() {
        config.env_files = cli.env_file.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(timeout) = &cli.timeout {
        config.apply_timeout = timeout.clone();
        config.apply_timeout()?;
    }
    if cli.project_name.is_some() {
        config.project_name = cli.project_name.clone();
    }

    Ok(config)
}

fn descriptor_files(files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !files.is_empty() {
        return Ok(files.to_vec());
    }
    let working_dir = std::env::current_dir()?;
    DescriptorParser::find_compose_file(&working_dir)
        .map(|path| vec![path])
        .ok_or_else(|| {
            DeployError::MalformedDescriptor(format!(
                "no compose file found in {}",
                working_dir.display()
            ))
        })
}

fn parser(config: &PlannerConfig, files: &[PathBuf]) -> Result<DescriptorParser> {
    let project_dir = files
        .first()
        .and_then(|f| f.parent())
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    Ok(DescriptorParser::new()
        .strict(config.strict)
        .with_env(config.interpolation_env(project_dir)?)
        .project_name(config.project_name.clone()))
}

fn load_project(config: &PlannerConfig, files: &[PathBuf]) -> Result<Project> {
    let files = descriptor_files(files)?;
    parser(config, &files)?.parse_files(&files)
}

fn orchestrator(config: &PlannerConfig, files: &[PathBuf]) -> Result<ComposeOrchestrator> {
    let project = load_project(config, files)?;
    let backend = Arc::new(LocalBackend::new(&config.state_dir));
    ComposeOrchestrator::new(project, backend)
}

fn print_apply_report(report: &ApplyReport) {
    println!("{}", report.plan);
    println!();

    for name in &report.destroyed {
        println!("  {:<20} {:<10} destroyed", name, "-");
    }
    for failure in &report.destroy_failures {
        println!(
            "  {:<20} {:<10} destroy failed: {}",
            failure.service, "-", failure.reason
        );
    }
    for outcome in &report.schedule.outcomes {
        let action = match outcome.applied {
            Some(StartMode::Create) => "created",
            Some(StartMode::Recreate) => "recreated",
            Some(StartMode::Keep) | None => "-",
        };
        println!(
            "  {:<20} {:<10} {:<24} {}",
            outcome.name,
            action,
            outcome.state.to_string(),
            outcome.state.health()
        );
        if outcome.state.is_failure() {
            if let Some(error) = &outcome.last_probe_error {
                println!("  {:<20} last probe [{}]: {}", "", error.kind, error.message);
            }
        }
    }

    let failed = report.schedule.failures().count() + report.destroy_failures.len();
    if failed == 0 {
        println!("\nAll services are up");
    } else {
        println!("\n{} services did not come up", failed);
    }
}
