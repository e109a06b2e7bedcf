use std::path::PathBuf;
use std::rc::Rc;

use agent_context::{create_context_manager, ContextManager};
use anyhow::{Context, Error as AnyError};
use clap::Parser;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::tracer::Tracer;
use crate::workload::{run_workload, WorkloadOptions};

mod config;
mod datastore;
mod tracer;
mod workload;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// A JSON agent configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Propagate context through causal chains (feature_flag.async_local_context)
    #[arg(long)]
    async_local: bool,

    /// Select the reserved strategy (feature_flag.new_async_context)
    #[arg(long)]
    new_async_context: bool,

    /// How many transactions to interleave
    #[arg(short, long)]
    transactions: Option<usize>,

    /// Re-enter each transaction explicitly after every hop
    #[arg(long)]
    rebind: bool,

    /// Record datastore keys and values on segments (attributes.enabled)
    #[arg(long)]
    capture_attributes: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn config(&self) -> Result<AgentConfig, AnyError> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };

        // flags can only turn things on, the file decides otherwise
        let flags = &mut config.context.feature_flag;
        flags.async_local_context |= self.async_local;
        flags.new_async_context |= self.new_async_context;
        config.attributes.enabled |= self.capture_attributes;

        Ok(config)
    }

    fn workload(&self, config: &AgentConfig) -> WorkloadOptions {
        let defaults = WorkloadOptions::default();

        WorkloadOptions {
            transactions: self.transactions.unwrap_or(defaults.transactions),
            rebind: self.rebind,
            capture_attributes: config.attributes.enabled,
            ..defaults
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), AnyError> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config = args.config()?;
    let options = args.workload(&config);

    let manager = create_context_manager(&config.context)
        .context("failed to create the context manager")?;
    manager.enable();

    let manager = Rc::new(manager);
    let tracer = Rc::new(Tracer::new(manager.clone()));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    info!(
        transactions = options.transactions,
        rebind = options.rebind,
        "running workload"
    );

    let local = LocalSet::new();
    let report = local.block_on(&runtime, run_workload(tracer, &options))?;

    println!("{report}");

    manager.disable();

    Ok(())
}
