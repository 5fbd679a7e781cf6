//! Capture source backed by the host OS.
//!
//! Window and idle queries shell out to the usual per-platform tools
//! (`osascript`/`ioreg` on macOS, `xdotool`/`xprintidle` on Linux);
//! running processes come from `sysinfo`.

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub mod applescript;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
mod processes;

use std::process::Command;
use std::time::Duration;

use dl_client::capture::encode_scaled;
use dl_client::{ActiveWindow, CaptureError, CaptureSource, CapturedImage, RunningApp};
use processes::ProcessTable;

/// Run a helper binary and return stdout.  A missing binary is reported
/// as [`CaptureError::Unsupported`].
pub(crate) fn run_tool(program: &str, args: &[&str]) -> Result<Vec<u8>, CaptureError> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CaptureError::Unsupported(format!("{program} is not installed"))
        } else {
            CaptureError::Failed(format!("{program}: {e}"))
        }
    })?;
    if !output.status.success() {
        return Err(CaptureError::Failed(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

pub(crate) fn run_text(program: &str, args: &[&str]) -> Result<String, CaptureError> {
    run_tool(program, args).map(|out| String::from_utf8_lossy(&out).trim().to_string())
}

/// The capture source for the current OS.
pub struct OsCapture {
    processes: ProcessTable,
}

impl OsCapture {
    pub fn new() -> Self {
        Self {
            processes: ProcessTable::new(),
        }
    }
}

impl Default for OsCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for OsCapture {
    fn capture_screen(&self, max_width: u32, max_height: u32) -> Result<CapturedImage, CaptureError> {
        let raw = grab_screen()?;
        encode_scaled(&raw, max_width, max_height)
    }

    fn query_active_window(&self) -> Result<ActiveWindow, CaptureError> {
        let mut window = active_window()?;
        if window.process.is_empty() && window.pid != 0 {
            window.process = self.processes.name_of(window.pid).unwrap_or_default();
        }
        Ok(window)
    }

    fn running_apps(&self) -> Result<Vec<RunningApp>, CaptureError> {
        Ok(self.processes.list())
    }

    fn idle_time(&self) -> Option<Duration> {
        idle_time()
    }
}

#[cfg(target_os = "linux")]
use linux::{active_window, grab_screen, idle_time};
#[cfg(target_os = "macos")]
use macos::{active_window, grab_screen, idle_time};

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn active_window() -> Result<ActiveWindow, CaptureError> {
    Err(CaptureError::Unsupported(std::env::consts::OS.into()))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn grab_screen() -> Result<Vec<u8>, CaptureError> {
    Err(CaptureError::Unsupported(std::env::consts::OS.into()))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn idle_time() -> Option<Duration> {
    None
}
