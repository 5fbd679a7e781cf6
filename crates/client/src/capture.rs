//! Desktop snapshots and the platform capture seam.

use std::collections::HashSet;
use std::io::Cursor;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dl_protocol::{DesktopStatePayload, RunningApp};
use image::imageops::FilterType;
use image::ImageFormat;

use crate::types::CaptureError;

/// The foreground window as reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveWindow {
    pub title: String,
    pub process: String,
    pub pid: u32,
}

/// An encoded (PNG) screenshot and its final dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Platform capture collaborator.
///
/// Calls are synchronous and may block; the sampler runs them on the
/// blocking pool and bounds them with a timeout.
pub trait CaptureSource: Send + Sync + 'static {
    /// Capture the screen, scaled to fit within `max_width` × `max_height`.
    fn capture_screen(&self, max_width: u32, max_height: u32) -> Result<CapturedImage, CaptureError>;

    fn query_active_window(&self) -> Result<ActiveWindow, CaptureError>;

    fn running_apps(&self) -> Result<Vec<RunningApp>, CaptureError> {
        Ok(Vec::new())
    }

    /// Time since the last user input, if the platform can tell.
    fn idle_time(&self) -> Option<Duration> {
        None
    }
}

/// Source for hosts without desktop access (headless, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl CaptureSource for NoCapture {
    fn capture_screen(&self, _: u32, _: u32) -> Result<CapturedImage, CaptureError> {
        Err(CaptureError::Unsupported("no capture source configured".into()))
    }

    fn query_active_window(&self) -> Result<ActiveWindow, CaptureError> {
        Err(CaptureError::Unsupported("no capture source configured".into()))
    }
}

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureReason {
    Periodic,
    Manual,
    Proactive,
    Command,
}

/// Immutable point-in-time description of the user's desktop.
#[derive(Debug, Clone)]
pub struct DesktopState {
    pub timestamp: DateTime<Utc>,
    pub active_window: ActiveWindow,
    pub screenshot: Option<CapturedImage>,
    pub running_apps: Vec<RunningApp>,
    /// The active window title differs from the previous committed snapshot.
    pub window_changed: bool,
    /// Title of the last different window seen before this one.
    pub previous_window_title: String,
    pub reason: CaptureReason,
}

impl DesktopState {
    /// A snapshot with every field empty, built without asking the source.
    pub fn empty(reason: CaptureReason) -> Self {
        Self {
            timestamp: Utc::now(),
            active_window: ActiveWindow::default(),
            screenshot: None,
            running_apps: Vec::new(),
            window_changed: false,
            previous_window_title: String::new(),
            reason,
        }
    }

    pub fn title(&self) -> &str {
        &self.active_window.title
    }

    /// Wire representation, with the screenshot base64-encoded.
    pub fn to_payload(&self) -> DesktopStatePayload {
        DesktopStatePayload {
            timestamp: self.timestamp.to_rfc3339(),
            active_window_title: self.active_window.title.clone(),
            active_window_process: self.active_window.process.clone(),
            active_window_pid: self.active_window.pid,
            screenshot_base64: self.screenshot.as_ref().map(|s| BASE64.encode(&s.png)),
            screenshot_width: self.screenshot.as_ref().map(|s| s.width),
            screenshot_height: self.screenshot.as_ref().map(|s| s.height),
            running_apps: self.running_apps.clone(),
            window_changed: self.window_changed,
            previous_window_title: self.previous_window_title.clone(),
        }
    }
}

/// Drop blank and underscore-prefixed names, keep the first entry per
/// name, and cap the list.
pub fn normalize_apps(apps: Vec<RunningApp>, max: usize) -> Vec<RunningApp> {
    let mut seen = HashSet::new();
    apps.into_iter()
        .filter(|app| !app.name.trim().is_empty() && !app.name.starts_with('_'))
        .filter(|app| seen.insert(app.name.clone()))
        .take(max)
        .collect()
}

/// Largest size with the same aspect ratio that fits within the bounds.
/// Never upscales.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return (width, height);
    }
    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Decode any supported image, downscale it to fit, and re-encode as PNG.
pub fn encode_scaled(raw: &[u8], max_width: u32, max_height: u32) -> Result<CapturedImage, CaptureError> {
    let img = image::load_from_memory(raw)
        .map_err(|e| CaptureError::Failed(format!("decode screenshot: {e}")))?;
    let (w, h) = fit_within(img.width(), img.height(), max_width, max_height);
    let img = if (w, h) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(w, h, FilterType::Triangle)
    };

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| CaptureError::Failed(format!("encode screenshot: {e}")))?;
    Ok(CapturedImage {
        png,
        width: w,
        height: h,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn app(pid: u32, name: &str) -> RunningApp {
        RunningApp {
            pid,
            name: name.into(),
        }
    }

    #[test]
    fn apps_deduplicated_filtered_and_capped() {
        let apps = vec![
            app(1, "code"),
            app(2, "code"),
            app(3, "_hidden"),
            app(4, ""),
            app(5, "firefox"),
            app(6, "slack"),
        ];
        let out = normalize_apps(apps, 2);
        assert_eq!(out, vec![app(1, "code"), app(5, "firefox")]);
    }

    #[test]
    fn fit_preserves_aspect_ratio() {
        assert_eq!(fit_within(1920, 1080, 800, 600), (800, 450));
        assert_eq!(fit_within(1080, 1920, 800, 600), (338, 600));
        assert_eq!(fit_within(640, 480, 800, 600), (640, 480));
    }

    #[test]
    fn encode_scaled_shrinks_and_emits_png() {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(400, 200, Rgb([10, 20, 30]));
        let mut raw = Vec::new();
        img.write_to(&mut Cursor::new(&mut raw), ImageFormat::Png).unwrap();

        let out = encode_scaled(&raw, 100, 100).unwrap();
        assert_eq!((out.width, out.height), (100, 50));
        assert_eq!(&out.png[..4], b"\x89PNG");
    }

    #[test]
    fn encode_scaled_rejects_garbage() {
        assert!(matches!(
            encode_scaled(b"not an image", 10, 10),
            Err(CaptureError::Failed(_))
        ));
    }

    #[test]
    fn payload_encodes_screenshot() {
        let state = DesktopState {
            timestamp: Utc::now(),
            active_window: ActiveWindow {
                title: "Editor".into(),
                process: "code".into(),
                pid: 7,
            },
            screenshot: Some(CapturedImage {
                png: vec![1, 2, 3],
                width: 3,
                height: 1,
            }),
            running_apps: vec![app(7, "code")],
            window_changed: true,
            previous_window_title: "Browser".into(),
            reason: CaptureReason::Periodic,
        };
        let payload = state.to_payload();
        assert_eq!(payload.screenshot_base64.as_deref(), Some("AQID"));
        assert_eq!(payload.screenshot_width, Some(3));
        assert_eq!(payload.active_window_pid, 7);
        assert_eq!(payload.previous_window_title, "Browser");
    }
}
