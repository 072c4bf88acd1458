mod commands;
mod opts;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::exec::ExecArgs;
use commands::run::RunArgs;
use opts::EnvOpts;

#[derive(Parser, Debug)]
#[command(name = "wbx", version, about = "Run a toolchain inside a virtual, lazily-fetched filesystem")]
struct Cli {
    #[command(flatten)]
    opts: EnvOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a toolchain entry script, e.g. `wbx run emcc -c hello.c`
    Run(RunArgs),

    /// Dispatch a process by its path in the virtual tree
    Exec(ExecArgs),

    /// Inspect or repair the durable cache store
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// List stored cache keys
    List,

    /// Remove every stored entry
    Clear,

    /// Remove a sync lock left by an interrupted session
    Unlock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.opts.verbose);
    let opts = &cli.opts;

    let code = match cli.command {
        Command::Run(args) => commands::run::cmd_run(opts, &args).await?,
        Command::Exec(args) => commands::exec::cmd_exec(opts, &args).await?,
        Command::Cache(cmd) => {
            match cmd {
                CacheCommand::List => commands::cache::cmd_list(opts)?,
                CacheCommand::Clear => commands::cache::cmd_clear(opts)?,
                CacheCommand::Unlock => commands::cache::cmd_unlock(opts)?,
            }
            0
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Logs go to stderr so tool output on stdout stays clean. `RUST_LOG`
/// takes precedence over `-v`.
fn setup_logging(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
