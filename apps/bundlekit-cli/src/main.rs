use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bundlekit::{
    runtime, BuildStateSource, Direction, ModuleId, OperationKind, Orchestrator,
    RequirementSource, Scope,
};
use bundlekit_bootstrap::{AppConfig, CliArgs};

mod simulate;
mod workspace;

use simulate::SimulatedRuntime;
use workspace::Workspace;

/// Bundlekit - dependency closures and lifecycle planning for module workspaces
#[derive(Parser)]
#[command(name = "bundlekit")]
#[command(about = "Dependency closures and lifecycle planning for module workspaces")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace manifest (overrides config)
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DirectionArg {
    /// Dependencies first
    Providing,
    /// Dependents first
    Requiring,
}

impl From<DirectionArg> for Direction {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Providing => Direction::Providing,
            DirectionArg::Requiring => Direction::Requiring,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ordered dependency closure of the given modules
    Closure {
        #[arg(required = true)]
        modules: Vec<String>,
        #[arg(short, long, value_enum, default_value = "providing")]
        direction: DirectionArg,
        /// Emit cycles as blocks instead of failing
        #[arg(long)]
        allow_cycles: bool,
        /// Only traverse modules marked activated
        #[arg(long)]
        activated_only: bool,
    },
    /// Print the working set an operation would touch
    Plan {
        operation: OperationKind,
        #[arg(required = true)]
        modules: Vec<String>,
    },
    /// List identity collisions in the workspace
    Duplicates,
    /// Validate the workspace manifest
    Check,
    /// Run an operation against a simulated runtime and print the final registry
    Simulate {
        operation: OperationKind,
        #[arg(required = true)]
        modules: Vec<String>,
        /// Modules whose transitions fail
        #[arg(long = "fail")]
        failing: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        manifest: cli.manifest.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
        allow_cycles: matches!(
            cli.command,
            Some(Commands::Closure {
                allow_cycles: true,
                ..
            })
        ),
    };

    // defaults -> YAML (if provided) -> env (BUNDLEKIT__*) -> CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    bundlekit_bootstrap::logging::init_logging_unified(
        &logging_config,
        Path::new(&config.home_dir),
    );

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let Some(command) = cli.command else {
        bail!("no command given; see --help");
    };
    let manifest = config
        .manifest_path()
        .context("no workspace manifest configured (use --manifest)")?;
    let workspace = Arc::new(Workspace::load(&manifest)?);
    tracing::info!(manifest = %manifest.display(), modules = workspace.ids().len(), "workspace loaded");

    match command {
        Commands::Closure {
            modules,
            direction,
            activated_only,
            ..
        } => {
            let scope = if activated_only {
                Scope::Activated
            } else {
                config.orchestrator.scope.clone()
            };
            let orchestrator = build_orchestrator(&config, &workspace, Vec::new())?;
            let closure = orchestrator
                .compute_closure(
                    &module_ids(&workspace, &modules)?,
                    direction.into(),
                    &scope,
                    config.orchestrator.allow_cycles,
                )
                .await?;
            println!("{closure}");
            for cycle in closure.cycles() {
                tracing::warn!(members = ?cycle, "cycle tolerated");
            }
        }
        Commands::Plan { operation, modules } => {
            let orchestrator = build_orchestrator(&config, &workspace, Vec::new())?;
            let plan = orchestrator
                .plan_operation(&module_ids(&workspace, &modules)?, operation)
                .await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Duplicates => {
            let orchestrator = build_orchestrator(&config, &workspace, Vec::new())?;
            let groups = orchestrator.resolve_duplicates(workspace.ids()).await?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        Commands::Check => {
            let findings = workspace.check()?;
            for finding in &findings {
                println!("{finding}");
            }
            if !findings.is_empty() {
                bail!("{} problem(s) found in {}", findings.len(), manifest.display());
            }
            println!("ok: {} modules", workspace.ids().len());
        }
        Commands::Simulate {
            operation,
            modules,
            failing,
        } => {
            let failing = module_ids(&workspace, &failing)?;
            let orchestrator = build_orchestrator(&config, &workspace, failing)?;
            orchestrator.start();
            let result = orchestrator
                .run_operation(&module_ids(&workspace, &modules)?, operation)
                .await;
            orchestrator.sync().await;
            let snapshot = orchestrator.registry().snapshot();
            orchestrator.shutdown().await;

            match result {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                }
                Err(err) => {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    return Err(err).context(format!("{operation} failed"));
                }
            }
        }
    }
    Ok(())
}

/// Orchestrator over the workspace, driving a simulated runtime.
fn build_orchestrator(
    config: &AppConfig,
    workspace: &Arc<Workspace>,
    failing: Vec<ModuleId>,
) -> Result<Orchestrator> {
    let registry = Arc::new(workspace.registry()?);
    let (events_tx, events_rx) = runtime::channel();
    let simulated = SimulatedRuntime::new(events_tx.clone()).with_failing(failing);

    let requirements: Arc<dyn RequirementSource> = workspace.clone();
    let build_state: Arc<dyn BuildStateSource> = workspace.clone();
    Ok(
        Orchestrator::new(registry, requirements, Arc::new(simulated), (events_tx, events_rx))
            .with_build_state(build_state)
            .with_config(config.orchestrator_config()),
    )
}

fn module_ids(workspace: &Workspace, names: &[String]) -> Result<Vec<ModuleId>> {
    names
        .iter()
        .map(|name| {
            let id = ModuleId::new(name);
            if !workspace.contains(&id) {
                bail!("unknown module '{name}'");
            }
            Ok(id)
        })
        .collect()
}
