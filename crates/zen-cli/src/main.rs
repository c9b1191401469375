//! Zen CLI - Sandboxed Python snippet runner
//!
//! Usage:
//!   zen run [FILE]    - Execute a snippet in an isolated environment
//!   zen check [FILE]  - Statically validate a snippet without running it
//!
//! With no FILE, the snippet is read from stdin.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zen_sandbox::{
    validate, BackendKind, ExecutionRequest, ExecutionStatus, Executor, PolicyOverrides,
    ResourcePolicy,
};

#[derive(Parser)]
#[command(name = "zen")]
#[command(version)]
#[command(about = "Run untrusted Python snippets in an isolated sandbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a snippet and print the structured result as JSON
    Run {
        /// Snippet file; stdin when omitted
        file: Option<PathBuf>,

        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Container image for the isolated environment
        #[arg(long)]
        image: Option<String>,

        /// Memory ceiling in bytes
        #[arg(long)]
        memory: Option<u64>,

        /// CPU share as a fractional core count
        #[arg(long)]
        cpus: Option<f64>,

        /// Isolation backend: docker (default) or process
        #[arg(long)]
        backend: Option<String>,

        /// Skip static validation. Unsafe; the snippet still runs isolated
        #[arg(long = "unsafe-skip-validation")]
        unsafe_skip_validation: bool,

        /// Input file staged into the workspace, as NAME=PATH (repeatable)
        #[arg(long = "input", value_name = "NAME=PATH")]
        inputs: Vec<String>,
    },

    /// Validate a snippet against the deny-list without executing it
    Check {
        /// Snippet file; stdin when omitted
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            timeout,
            image,
            memory,
            cpus,
            backend,
            unsafe_skip_validation,
            inputs,
        } => {
            let source = read_source(file.as_deref())?;

            let mut policy = ResourcePolicy::from_env();
            if let Some(backend) = backend {
                policy.backend = backend
                    .parse::<BackendKind>()
                    .map_err(|e| anyhow::anyhow!(e))?;
            }

            let overrides = PolicyOverrides {
                timeout: timeout.map(Duration::from_secs),
                image,
                memory_bytes: memory,
                cpu_share: cpus,
                max_output_bytes: None,
                skip_validation: unsafe_skip_validation.then_some(true),
            };

            // Ctrl-C cancels the run instead of orphaning the environment;
            // the executor tears everything down and reports a timeout.
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, cancelling execution");
                        cancel.cancel();
                    }
                });
            }

            let mut request = ExecutionRequest::new(source)
                .with_overrides(overrides)
                .with_cancel(cancel);
            for (name, bytes) in read_inputs(&inputs)? {
                request = request.with_input(name, bytes);
            }

            let executor = Executor::new(Arc::new(policy));
            let result = executor.execute(request).await?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            std::process::exit(match result.status {
                ExecutionStatus::Succeeded => 0,
                ExecutionStatus::Failed => result.exit_code.unwrap_or(1),
                ExecutionStatus::Rejected => 2,
                ExecutionStatus::TimedOut => 124,
            });
        }

        Commands::Check { file } => {
            let source = read_source(file.as_deref())?;
            let policy = ResourcePolicy::from_env();
            let verdict = validate(&source, &policy.deny);

            println!("{}", serde_json::to_string_pretty(&verdict)?);
            std::process::exit(if verdict.allowed { 0 } else { 2 });
        }
    }
}

fn read_source(file: Option<&std::path::Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("failed to read snippet from stdin")?;
            Ok(source)
        }
    }
}

/// Parse repeated `NAME=PATH` input flags and load each file's bytes.
fn read_inputs(raw: &[String]) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    let mut inputs = BTreeMap::new();
    for spec in raw {
        let Some((name, path)) = spec.split_once('=') else {
            bail!("invalid --input `{spec}`, expected NAME=PATH");
        };
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
        inputs.insert(name.to_string(), bytes);
    }
    Ok(inputs)
}
