//! macOS helpers: System Events via AppleScript, `screencapture`, `ioreg`.

use std::time::Duration;

use dl_client::{ActiveWindow, CaptureError};

use super::{applescript, run_text, run_tool};

const FRONT_WINDOW: &str = r#"
tell application "System Events"
    set frontProc to first application process whose frontmost is true
    set procName to name of frontProc
    set procId to unix id of frontProc
    set winTitle to ""
    try
        set winTitle to name of front window of frontProc
    end try
end tell
return procName & linefeed & procId & linefeed & winTitle
"#;

pub fn active_window() -> Result<ActiveWindow, CaptureError> {
    let raw = applescript::run(FRONT_WINDOW)?;
    parse_front_window(&raw).ok_or(CaptureError::NoActiveWindow)
}

fn parse_front_window(raw: &str) -> Option<ActiveWindow> {
    let mut lines = raw.lines();
    let process = lines.next()?.trim().to_string();
    let pid = lines.next()?.trim().parse().unwrap_or(0);
    let title = lines.next().unwrap_or("").trim().to_string();
    if process.is_empty() {
        return None;
    }
    Some(ActiveWindow {
        // Windowless apps: fall back to the app name.
        title: if title.is_empty() { process.clone() } else { title },
        process,
        pid,
    })
}

pub fn grab_screen() -> Result<Vec<u8>, CaptureError> {
    let file = tempfile::Builder::new()
        .prefix("desklink-")
        .suffix(".png")
        .tempfile()
        .map_err(|e| CaptureError::Failed(format!("temp file: {e}")))?;
    let path = file.path().to_string_lossy().into_owned();
    run_tool("screencapture", &["-x", "-t", "png", &path])?;
    let png = std::fs::read(file.path())
        .map_err(|e| CaptureError::Failed(format!("read screenshot: {e}")))?;
    // An empty file means Screen Recording permission is missing.
    if png.is_empty() {
        return Err(CaptureError::PermissionDenied(
            "screen recording not allowed for this app".into(),
        ));
    }
    Ok(png)
}

pub fn idle_time() -> Option<Duration> {
    run_text("ioreg", &["-c", "IOHIDSystem", "-d", "4"])
        .ok()
        .and_then(|raw| parse_hid_idle(&raw))
}

/// `"HIDIdleTime" = 123456789` (nanoseconds).
fn parse_hid_idle(raw: &str) -> Option<Duration> {
    raw.lines()
        .find(|line| line.contains("\"HIDIdleTime\""))
        .and_then(|line| line.rsplit('=').next())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_nanos)
}
