use anyhow::Result;
use fleet_link::exec::Geometry;
use nix::libc;
use nix::sys::termios::{self, SetArg, Termios};

/// Puts stdin into raw mode and restores the saved settings on drop.
pub struct RawModeGuard {
    original: Option<Termios>,
}

impl RawModeGuard {
    /// Does nothing when stdin is not a terminal.
    pub fn enter() -> Self {
        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin).ok();
        if let Some(ref original) = original {
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw);
        }
        Self { original }
    }

    pub fn is_raw(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(ref original) = self.original {
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, original);
        }
    }
}

/// Size of the controlling terminal in cells.
pub fn terminal_geometry() -> Result<Geometry> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 || ws.ws_col == 0 || ws.ws_row == 0 {
        anyhow::bail!("ioctl TIOCGWINSZ failed");
    }
    Ok(Geometry::new(ws.ws_col, ws.ws_row))
}
