use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

use fleet_link::logs::Origin;

mod cli;
mod config;

use crate::config::FleetConfig;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Live events, task logs and remote shells for a workload cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.fleet)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Cluster API address, overriding `[cluster] address`
    #[arg(long, global = true)]
    address: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print events for one or more users of a cluster as JSON lines
    Watch(WatchArgs),

    /// Stream a task's logs
    Logs(LogsArgs),

    /// Run a command inside an allocation with this terminal attached
    Exec(ExecArgs),
}

#[derive(Parser)]
struct WatchArgs {
    cluster: String,

    #[arg(required = true)]
    users: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OriginArg {
    Start,
    End,
}

impl From<OriginArg> for Origin {
    fn from(arg: OriginArg) -> Self {
        match arg {
            OriginArg::Start => Origin::Start,
            OriginArg::End => Origin::End,
        }
    }
}

#[derive(Parser)]
struct LogsArgs {
    alloc: String,

    task: String,

    /// Stream stderr instead of stdout
    #[arg(long)]
    stderr: bool,

    /// Stop at the end of the current log instead of following it
    #[arg(long)]
    no_follow: bool,

    #[arg(long, value_enum, default_value = "start")]
    origin: OriginArg,

    /// Byte offset from --origin
    #[arg(long, default_value = "0")]
    offset: u64,

    /// Save everything received to PATH (default: the exports directory)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    download: Option<Option<PathBuf>>,
}

#[derive(Parser)]
struct ExecArgs {
    alloc: String,

    task: String,

    /// Do not allocate a pseudo-terminal for the remote process
    #[arg(long)]
    no_tty: bool,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true, default_value = "/bin/sh")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "fleet=debug,fleet_link=debug,info"
    } else {
        "fleet=info,fleet_link=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = FleetConfig::new(cli.data_dir)?;
    let mut file = config.load()?;
    if let Some(address) = cli.address {
        file.cluster.address = address;
    }
    debug!(address = %file.cluster.address, "configuration loaded");

    match cli.command {
        Commands::Watch(args) => cli::watch_command(&file, &args.cluster, &args.users).await,
        Commands::Logs(args) => {
            let args = cli::LogsArgs {
                alloc: args.alloc,
                task: args.task,
                stderr: args.stderr,
                follow: !args.no_follow,
                origin: args.origin.into(),
                offset: args.offset,
                download: args.download,
            };
            cli::logs_command(&config, &file, args).await
        }
        Commands::Exec(args) => {
            let code =
                cli::exec_command(&file, args.alloc, args.task, args.command, !args.no_tty).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}
