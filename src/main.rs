use anyhow::Result;
use clap::Parser;
use ptsentry::{cli::Cli, run};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber on stderr; `RUST_LOG` wins over the default level
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let options = args.tracer_options();
    let probe_addr = args.probe_addr.as_deref();

    // Either attach to PIDs or wrap a command (mutually exclusive)
    match (args.pids.is_empty(), &args.command) {
        (false, None) => run::attach(&args.pids, probe_addr, options)?,
        (true, Some(command)) => {
            let envs: Vec<String> = std::env::vars_os()
                .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
                .collect();
            run::wrap(command, &envs, probe_addr, options)?;
        }
        (false, Some(_)) => {
            anyhow::bail!("Cannot specify both -p PID and command. Choose one.");
        }
        (true, None) => {
            anyhow::bail!("Must specify either -p PID or command. Usage: ptsentry -p PID or ptsentry -- COMMAND [ARGS...]");
        }
    }
    Ok(())
}
