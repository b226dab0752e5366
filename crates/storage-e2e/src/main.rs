//! Storage end-to-end runner.
//!
//! Lists the registered scenarios and runs a selection of them against the
//! cluster named by the kubeconfig, one fresh project per scenario.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use e2e_util::config::{
    ENV_ADMIN_KUBECONFIG, ENV_CLI_BINARY, ENV_FIXTURE_DIR, ENV_KUBECONFIG, ENV_OUTPUT_DIR,
};
use e2e_util::E2eConfig;
use storage_e2e::{runner, scenarios};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod ui;

const DEFAULT_FIXTURE_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/storage");

#[derive(Parser)]
#[command(
    name = "storage-e2e",
    version,
    about = "Storage end-to-end scenarios for Kubernetes and OpenShift",
    long_about = "Run storage end-to-end scenarios against a live cluster.\n\n\
                  Every scenario runs in its own project, created before the\n\
                  scenario starts and deleted after its cleanup has run."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the environment-driven configuration.
#[derive(Args)]
struct ClusterArgs {
    /// Kubeconfig of the test user.
    #[arg(long, global = true, env = ENV_KUBECONFIG)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig with cluster-admin rights; defaults to --kubeconfig.
    #[arg(long, global = true, env = ENV_ADMIN_KUBECONFIG)]
    admin_kubeconfig: Option<PathBuf>,

    /// `oc` or `kubectl`, or a path to either.
    #[arg(long, global = true, env = ENV_CLI_BINARY)]
    binary: Option<String>,

    /// Directory rendered manifests are written to.
    #[arg(long, global = true, env = ENV_OUTPUT_DIR)]
    output_dir: Option<PathBuf>,

    /// Directory holding the manifest templates.
    #[arg(long, global = true, env = ENV_FIXTURE_DIR)]
    fixture_dir: Option<PathBuf>,
}

impl ClusterArgs {
    fn into_config(self) -> Result<E2eConfig> {
        let mut config = E2eConfig::from_env(DEFAULT_FIXTURE_DIR)?;
        if let Some(kubeconfig) = self.kubeconfig {
            if self.admin_kubeconfig.is_none() && config.admin_kubeconfig == config.kubeconfig {
                config.admin_kubeconfig.clone_from(&kubeconfig);
            }
            config.kubeconfig = kubeconfig;
        }
        if let Some(admin_kubeconfig) = self.admin_kubeconfig {
            config.admin_kubeconfig = admin_kubeconfig;
        }
        if let Some(binary) = self.binary {
            config.binary = binary;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(fixture_dir) = self.fixture_dir {
            config.fixture_dir = fixture_dir;
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered scenarios.
    List,

    /// Run scenarios by id or case number.
    Run(RunCommand),
}

#[derive(Args)]
struct RunCommand {
    /// Scenario ids or case numbers.
    ids: Vec<String>,

    /// Run every registered scenario.
    #[arg(long, conflicts_with = "ids")]
    all: bool,

    /// Write a JSON report to this file.
    #[arg(long, value_name = "FILE")]
    json: Option<PathBuf>,
}

impl RunCommand {
    async fn run(self, cluster: ClusterArgs) -> Result<ExitCode> {
        let selected = runner::select(&self.ids, self.all)?;
        let config = cluster.into_config()?;
        let context = config.validate().context("checking the cluster configuration")?;
        info!(
            context = %context,
            binary = %config.binary,
            scenarios = selected.len(),
            "Starting run"
        );

        ui::print_section(&format!(
            "Running {} storage scenario(s) against context {context}",
            selected.len()
        ));
        let cli = config.cli();
        let report = runner::run_all(&cli, &selected, &mut ui::ConsoleProgress::default()).await;

        ui::print_summary(&report);
        if let Some(path) = &self.json {
            report.write_json(path)?;
        }
        Ok(if report.has_failures() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        })
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "info,storage_e2e=debug,e2e_util=debug"
    } else {
        "info,storage_e2e=info,e2e_util=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::List => {
            ui::print_scenario_table(&scenarios::all());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(cmd) => cmd.run(cli.cluster).await,
    }
}
