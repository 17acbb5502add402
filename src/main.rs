//! cdk-fargate: synthesizes the VPC and ECS Fargate stacks of each
//! environment into CloudFormation templates.
//!
//! Usage: cdk-fargate <COMMAND>
//!
//! Commands:
//!   synth   Declare stacks and write templates plus manifest
//!   list    List the stacks of every environment

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cdk_fargate::app::{self, App, Selection};
use cdk_fargate::config::{self, ConfigRegistry};
use cdk_fargate::lookup::NetworkRegistry;
use cdk_fargate::{compute, network, outputs, writer};

/// cdk-fargate - per-environment VPC and Fargate stacks
#[derive(Parser, Debug)]
#[command(name = "cdk-fargate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Declare stacks and write templates plus manifest
    Synth {
        /// Environment configuration file; built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Environment to build (repeatable); every environment when omitted
        #[arg(short, long = "env")]
        envs: Vec<String>,

        /// Stacks to declare per environment
        #[arg(long, value_enum, default_value_t = Selection::All)]
        only: Selection,

        /// Output directory
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,

        /// Lookup context file, read before and updated after synthesis
        #[arg(long)]
        context: Option<PathBuf>,

        /// Resolve networks from deployed CloudFormation stacks
        #[arg(long)]
        lookup_deployed: bool,
    },

    /// List the stacks of every environment
    List {
        /// Environment configuration file; built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_registry(path: Option<&PathBuf>) -> Result<ConfigRegistry> {
    match path {
        Some(path) => Ok(config::parse(path)?),
        None => Ok(ConfigRegistry::builtin()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Synth {
            config,
            envs,
            only,
            out,
            context,
            lookup_deployed,
        } => {
            let registry = load_registry(config.as_ref())?;
            let env_names = app::resolve_env_names(&envs)?;

            let mut networks = match &context {
                Some(path) => NetworkRegistry::load(path)?,
                None => NetworkRegistry::new(),
            };
            if lookup_deployed {
                let configs: Vec<_> = env_names.iter().map(|&name| registry.get(name)).collect();
                outputs::fetch_networks(&configs, &mut networks).await;
            }

            let mut app = App::with_networks(networks);
            let results = app::build_all(&mut app, &registry, &env_names, only);

            let written = writer::write(&out, &app)?;
            println!("Wrote {} files to {}", written.len(), out.display());
            if let Some(path) = &context {
                app.networks().save(path)?;
            }

            // Each failure was already logged with its stack by `build_all`.
            let failed = results.iter().filter(|(_, result)| result.is_err()).count();
            if failed > 0 {
                bail!("{} of {} environments failed", failed, env_names.len());
            }
        }
        Commands::List { config } => {
            let registry = load_registry(config.as_ref())?;
            for config in registry.iter() {
                let env_name = config.env_name();
                println!(
                    "{}\t{}\t{}",
                    network::stack_id(env_name),
                    compute::stack_id(env_name),
                    config.env().uri()
                );
            }
        }
    }

    return Ok(());
}
