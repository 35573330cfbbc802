#[cfg(unix)]
pub mod exec;
pub mod logs;
#[cfg(unix)]
pub mod terminal;
pub mod watch;

use anyhow::Result;
use std::path::PathBuf;

#[cfg(unix)]
use fleet_link::exec::ExecRequest;
use fleet_link::logs::{LogKind, LogRequest, Origin, StreamStatus};

use crate::config::{FileConfig, FleetConfig};

pub async fn watch_command(file: &FileConfig, cluster: &str, users: &[String]) -> Result<()> {
    if users.is_empty() {
        anyhow::bail!("at least one user id is required");
    }
    watch::run(
        &file.cluster.mux_url(),
        cluster,
        users,
        file.multiplexer.clone(),
    )
    .await
}

pub struct LogsArgs {
    pub alloc: String,
    pub task: String,
    pub stderr: bool,
    pub follow: bool,
    pub origin: Origin,
    pub offset: u64,
    /// `Some(None)` means "download to the exports directory".
    pub download: Option<Option<PathBuf>>,
}

pub async fn logs_command(config: &FleetConfig, file: &FileConfig, args: LogsArgs) -> Result<()> {
    let mut request = LogRequest::new(args.alloc, args.task);
    request.kind = if args.stderr {
        LogKind::Stderr
    } else {
        LogKind::Stdout
    };
    request.follow = args.follow;
    request.origin = args.origin;
    request.offset = args.offset;

    let download = args
        .download
        .map(|path| path.unwrap_or_else(|| config.exports_dir.join(request.suggested_file_name())));

    let status = logs::run(
        &file.cluster.address,
        logs::LogsOptions { request, download },
        file.logs.clone(),
    )
    .await?;

    match status {
        StreamStatus::Failed(reason) => anyhow::bail!("log stream failed: {reason}"),
        _ => Ok(()),
    }
}

#[cfg(unix)]
pub async fn exec_command(
    file: &FileConfig,
    alloc: String,
    task: String,
    command: Vec<String>,
    tty: bool,
) -> Result<i32> {
    let mut request = ExecRequest::new(alloc, task, command);
    request.tty = tty;
    let outcome = exec::run(&file.cluster.ws_base(), request, &file.exec).await?;
    exec::exit_status(outcome)
}

#[cfg(not(unix))]
pub async fn exec_command(
    _file: &FileConfig,
    _alloc: String,
    _task: String,
    _command: Vec<String>,
    _tty: bool,
) -> Result<i32> {
    anyhow::bail!("interactive exec requires a unix terminal")
}
