//! AppleScript execution helper.
//!
//! Runs AppleScript via `osascript -e` and captures stdout.

use std::process::Command;

use dl_client::CaptureError;

/// Execute an AppleScript snippet and return its trimmed stdout.
pub fn run(script: &str) -> Result<String, CaptureError> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .output()
        .map_err(|e| CaptureError::Unsupported(format!("failed to run osascript: {e}")))?;

    classify_output(output.status.success(), &output.stdout, &output.stderr)
}

/// Map an `osascript` exit to text or a capture error.  Automation and
/// accessibility denials become [`CaptureError::PermissionDenied`].
pub(crate) fn classify_output(
    success: bool,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<String, CaptureError> {
    let stderr = String::from_utf8_lossy(stderr);

    if !success {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("not allowed assistive access")
            || lower.contains("not authorized to send apple events")
            || lower.contains("erraeventnotpermitted")
            || lower.contains("-1743")
            || lower.contains("-25211")
        {
            return Err(CaptureError::PermissionDenied(format!(
                "{}. Allow this app under System Settings → Privacy & Security → \
                 Accessibility and Automation.",
                stderr.trim()
            )));
        }
        return Err(CaptureError::Failed(format!("osascript: {}", stderr.trim())));
    }

    Ok(String::from_utf8_lossy(stdout).trim().to_string())
}
