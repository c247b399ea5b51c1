//! perlcode-sandbox daemon
//!
//! MCP server that runs published Perl snippets in locked-down containers.
//! Settings come from environment variables (see `config`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use perlcode_sandbox::config::Config;
use perlcode_sandbox::gate::ExecutionGate;
use perlcode_sandbox::mcp;
use perlcode_sandbox::sandbox::SandboxExecutor;
use perlcode_sandbox::service::{ExecuteService, JsonCatalog, MemoryLedger};

#[derive(Parser, Debug)]
#[command(name = "perlcode-sandbox")]
#[command(about = "Sandboxed Perl execution for published code snippets")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Execute one Perl file and print the result as JSON
    #[arg(long, value_name = "FILE", conflicts_with = "stdio")]
    run: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        mode = config.options.mode.as_str(),
        image = %config.options.image,
        engine = %config.engine,
        "Loaded configuration"
    );
    if config.options.allow_local_fallback {
        warn!("Host fallback enabled; never expose this to untrusted input");
    }

    let executor = SandboxExecutor::from_config(&config);

    if let Some(path) = args.run {
        let code = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let outcome = executor.execute(&code).await;
        if !outcome.is_isolated() {
            warn!("Snippet ran on the host interpreter without isolation");
        }
        println!("{}", serde_json::to_string_pretty(outcome.result())?);
        return Ok(());
    }

    if !args.stdio {
        anyhow::bail!("Either --stdio or --run <FILE> is required");
    }

    let catalog = match &config.snippets_path {
        Some(path) => JsonCatalog::load(path)?,
        None => {
            warn!("PERLCODE_SNIPPETS not set; every slug will be reported as not found");
            JsonCatalog::default()
        }
    };

    let service = ExecuteService::new(
        executor,
        ExecutionGate::new(config.concurrency),
        Arc::new(catalog),
        Arc::new(MemoryLedger::new()),
        config.daily_limit,
    );

    mcp::serve_stdio(Arc::new(service)).await
}
