//! X11/Wayland helpers: `xdotool`, `xprintidle`, `grim`, ImageMagick `import`.

use std::time::Duration;

use dl_client::{ActiveWindow, CaptureError};

use super::{run_text, run_tool};

pub fn active_window() -> Result<ActiveWindow, CaptureError> {
    let title = run_text("xdotool", &["getactivewindow", "getwindowname"])?;
    // Some windows have no _NET_WM_PID; keep the title anyway.
    let pid = run_text("xdotool", &["getactivewindow", "getwindowpid"])
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(0);
    if title.is_empty() && pid == 0 {
        return Err(CaptureError::NoActiveWindow);
    }
    Ok(ActiveWindow {
        title,
        process: String::new(),
        pid,
    })
}

/// Full-screen PNG.  Tries Wayland first, then X11.
pub fn grab_screen() -> Result<Vec<u8>, CaptureError> {
    let wayland = std::env::var_os("WAYLAND_DISPLAY").is_some();
    if wayland {
        match run_tool("grim", &["-t", "png", "-"]) {
            Ok(png) => return Ok(png),
            Err(e) => tracing::debug!(error = %e, "grim failed, trying import"),
        }
    }
    run_tool("import", &["-window", "root", "png:-"])
}

pub fn idle_time() -> Option<Duration> {
    run_text("xprintidle", &[]).ok().and_then(|raw| parse_xprintidle(&raw))
}

fn parse_xprintidle(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xprintidle_is_milliseconds() {
        assert_eq!(parse_xprintidle("1500\n"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_xprintidle("garbage"), None);
    }
}
