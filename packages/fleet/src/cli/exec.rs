use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fleet_link::exec::{AnsiSurface, ExecRequest, ExecSession, Geometry, SessionState};
use fleet_link::{ExecConfig, LinkError, WsConnector};

use super::terminal::{RawModeGuard, terminal_geometry};

const DETACH_BYTE: u8 = 0x1D; // Ctrl-]

/// How an interactive exec ended.
pub enum ExecOutcome {
    /// User pressed Ctrl-]. The session is closed normally, which ends the
    /// remote process.
    Detached,
    /// The session closed on its own.
    Finished(SessionState),
}

/// Run `request` remotely with this terminal attached until the process
/// exits, the channel drops, or the user detaches.
pub async fn run(ws_base: &str, request: ExecRequest, config: &ExecConfig) -> Result<ExecOutcome> {
    let geometry = terminal_geometry().unwrap_or_else(|e| {
        debug!("using default geometry: {e}");
        Geometry::default()
    });

    let guard = RawModeGuard::enter();
    if !guard.is_raw() {
        warn!("stdin is not a terminal; input is line-buffered");
    }

    let session = ExecSession::open(
        Arc::new(WsConnector),
        ws_base,
        request,
        geometry,
        AnsiSurface::new(std::io::stdout()),
        config,
    );

    let mut sigwinch = signal(SignalKind::window_change())?;
    let (stdin_rx, stdin_shutdown) = spawn_stdin_reader();
    let outcome = pump(&session, stdin_rx, &mut sigwinch).await;

    stdin_shutdown.store(true, Ordering::Relaxed);
    session.close();
    drop(guard);
    Ok(outcome)
}

async fn pump(
    session: &ExecSession,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    sigwinch: &mut tokio::signal::unix::Signal,
) -> ExecOutcome {
    let mut stdin_open = true;
    loop {
        tokio::select! {
            state = session.closed() => return ExecOutcome::Finished(state),

            data = stdin_rx.recv(), if stdin_open => {
                let Some(data) = data else {
                    stdin_open = false;
                    continue;
                };
                if let Some(pos) = data.iter().position(|&b| b == DETACH_BYTE) {
                    if pos > 0 {
                        session.send_input(String::from_utf8_lossy(&data[..pos]));
                    }
                    return ExecOutcome::Detached;
                }
                session.send_input(String::from_utf8_lossy(&data));
            }

            _ = sigwinch.recv() => {
                if let Ok(geometry) = terminal_geometry() {
                    session.resize(geometry);
                }
            }
        }
    }
}

/// Blocking stdin reader. Polls with a timeout so it notices the shutdown flag.
fn spawn_stdin_reader() -> (mpsc::Receiver<Vec<u8>>, Arc<AtomicBool>) {
    let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    std::thread::spawn(move || {
        use std::io::Read;
        use std::os::fd::AsRawFd;
        let stdin = std::io::stdin();
        let stdin_fd = stdin.as_raw_fd();
        let mut buf = [0u8; 4096];
        loop {
            if shutdown_thread.load(Ordering::Relaxed) {
                break;
            }
            let mut pfd = nix::libc::pollfd {
                fd: stdin_fd,
                events: nix::libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { nix::libc::poll(&mut pfd, 1, 100) };
            if ret <= 0 {
                continue;
            }
            let mut handle = stdin.lock();
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    drop(handle);
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    (stdin_rx, shutdown)
}

/// Process exit status for a finished session.
pub fn exit_status(outcome: ExecOutcome) -> Result<i32> {
    match outcome {
        ExecOutcome::Detached => {
            eprintln!("\r\n[fleet: detached]");
            Ok(0)
        }
        ExecOutcome::Finished(state) => match state.into_result() {
            Ok(code) => Ok(code),
            Err(LinkError::Application(fleet_link::ApplicationError::NonZeroExit(code))) => {
                Ok(code)
            }
            Err(e) => Err(e.into()),
        },
    }
}
