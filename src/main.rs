//! clusterup CLI
//!
//! Entry point for the `clusterup` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clusterup::config::DEFAULT_CONFIG_PATH;
use clusterup::{
    Action, ActionController, ActionSummary, ClusterConfig, HostConnector, LogDelegate, Pipeline,
    PipelineError, StartOutcome, StateStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "clusterup")]
#[command(about = "Staged multi-host cluster bring-up over SSH", version)]
struct Cli {
    /// Path to cluster config (default: clusterup.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the run-state directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run preflight checks on every host
    Preflight,

    /// Install on every host
    Deploy {
        /// Re-run only on hosts that did not succeed last time
        #[arg(long)]
        retry: bool,
    },

    /// Run node and cluster health checks
    Postflight,

    /// Remove the installation from every host
    Uninstall,

    /// Install OS prerequisites on every host
    InstallPrereqs,

    /// Show the recorded state of an action
    Status {
        /// preflight, deploy, postflight, uninstall or install_prereqs
        action: Action,

        /// Print the raw state file
        #[arg(long)]
        json: bool,
    },

    /// Validate the config file and exit
    ValidateConfig,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "clusterup=debug"
    } else {
        "clusterup=info,warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1)
        }
    };
    process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = ClusterConfig::load(&config_path).map_err(PipelineError::from)?;
    let state_dir = cli.state_dir.unwrap_or_else(|| config.state_dir.clone());

    let action = match cli.command {
        Commands::ValidateConfig => {
            let nodes = config.nodes().map_err(PipelineError::from)?;
            println!(
                "Configuration valid: {} ({} hosts)",
                config_path.display(),
                nodes.len()
            );
            return Ok(0);
        }
        Commands::Status { action, json } => return run_status(&state_dir, action, json),
        Commands::Preflight => (Action::Preflight, false),
        Commands::Deploy { retry } => (Action::Deploy, retry),
        Commands::Postflight => (Action::Postflight, false),
        Commands::Uninstall => (Action::Uninstall, false),
        Commands::InstallPrereqs => (Action::InstallPrereqs, false),
    };

    let local_hosts = config.local_host_keys().map_err(PipelineError::from)?;
    let connector = HostConnector::new().with_local_hosts(local_hosts);
    let pipeline = Pipeline::new(config, Arc::new(connector))
        .with_state_dir(&state_dir)
        .with_delegate(Arc::new(LogDelegate::new()));
    run_action(ActionController::new(pipeline), action.0, action.1).await
}

async fn run_action(
    controller: ActionController,
    action: Action,
    retry: bool,
) -> anyhow::Result<i32> {
    let outcome = controller.start(action, retry).await?;
    println!("====> {}", outcome.message(action));

    if matches!(
        outcome,
        StartOutcome::AlreadyRunning | StartOutcome::AlreadyExecuted
    ) {
        return Ok(0);
    }

    let store = controller.pipeline().store();
    let record = store
        .read(action.as_str())
        .map_err(PipelineError::from)?
        .with_context(|| format!("no run state written for {}", action))?;
    let summary = ActionSummary::from_record(action.as_str(), &record);
    print!("{}", summary.render());

    let all_ok = outcome.result().map(|r| r.all_succeeded()).unwrap_or(false);
    Ok(if all_ok && summary.is_success() { 0 } else { 1 })
}

fn run_status(state_dir: &std::path::Path, action: Action, json: bool) -> anyhow::Result<i32> {
    let store = StateStore::new(state_dir);
    let Some(record) = store.read(action.as_str()).map_err(PipelineError::from)? else {
        println!("{} has not been run", action);
        return Ok(1);
    };
    let summary = ActionSummary::from_record(action.as_str(), &record);

    if json {
        let text = record.to_json().context("serializing run state")?;
        println!("{}", text);
    } else {
        print!("{}", summary.render());
    }
    Ok(if record.is_running() { 1 } else { summary.exit_code() })
}
