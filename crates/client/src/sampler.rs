//! Periodic desktop sampling.
//!
//! The timer task is the only writer of the "previous snapshot" slot that
//! `window_changed` is computed against.  On-demand captures
//! ([`StateSampler::capture_once`]) diff against it but never commit, so a
//! burst of manual captures cannot disturb the periodic diff.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dl_domain::config::MonitorConfig;
use dl_protocol::MessageType;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bridge::{Delivery, MessageBridge};
use crate::capture::{
    normalize_apps, ActiveWindow, CaptureReason, CaptureSource, CapturedImage, DesktopState,
};
use crate::types::CaptureError;

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub interval: Duration,
    /// Reports with `window_changed == false` are sent at most this often.
    pub unchanged_report_interval: Duration,
    pub screenshot_enabled: bool,
    pub screenshot_width: u32,
    pub screenshot_height: u32,
    pub capture_timeout: Duration,
    pub max_running_apps: usize,
}

impl From<&MonitorConfig> for SamplerSettings {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            interval: cfg.report_interval(),
            unchanged_report_interval: cfg.unchanged_report_interval(),
            screenshot_enabled: cfg.screenshot_enabled,
            screenshot_width: cfg.screenshot_width,
            screenshot_height: cfg.screenshot_height,
            capture_timeout: cfg.capture_timeout(),
            max_running_apps: cfg.max_running_apps,
        }
    }
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// A qualifying state change: the window changed on a timer tick, or a
/// manual capture was requested.
#[derive(Debug, Clone)]
pub struct SamplerEvent {
    pub state: Arc<DesktopState>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    source: Arc<dyn CaptureSource>,
    settings: RwLock<SamplerSettings>,
    previous: RwLock<Option<Arc<DesktopState>>>,
    events: broadcast::Sender<SamplerEvent>,
    bridge: MessageBridge,
    running: Mutex<Option<Running>>,
}

#[derive(Clone)]
pub struct StateSampler {
    inner: Arc<Inner>,
}

impl StateSampler {
    pub fn new(source: Arc<dyn CaptureSource>, settings: SamplerSettings, bridge: MessageBridge) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner {
                source,
                settings: RwLock::new(settings),
                previous: RwLock::new(None),
                events,
                bridge,
                running: Mutex::new(None),
            }),
        }
    }

    /// Take a snapshot now.  Blocking; reads the previous snapshot for the
    /// diff but does not replace it.
    pub fn capture_once(&self, reason: CaptureReason) -> DesktopState {
        self.inner.snapshot(reason)
    }

    /// Capture on the blocking pool, report it, and announce it to
    /// subscribers.  Used for user-requested captures.
    pub async fn capture_and_report(&self) -> Result<Arc<DesktopState>, CaptureError> {
        let state = Arc::new(self.capture_bounded(CaptureReason::Manual).await?);
        self.report(&state).await;
        let _ = self.inner.events.send(SamplerEvent {
            state: state.clone(),
        });
        Ok(state)
    }

    /// [`capture_once`](Self::capture_once) off the async runtime, bounded
    /// by the configured capture timeout.
    pub async fn capture_bounded(&self, reason: CaptureReason) -> Result<DesktopState, CaptureError> {
        let inner = self.inner.clone();
        let timeout = inner.settings.read().capture_timeout;
        let job = tokio::task::spawn_blocking(move || inner.snapshot(reason));
        match tokio::time::timeout(timeout, job).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(e)) => Err(CaptureError::Failed(format!("capture task: {e}"))),
            Err(_) => Err(CaptureError::Timeout),
        }
    }

    /// A bare screenshot, off the async runtime.  Falls back to the
    /// configured size when no bound is given.
    pub async fn capture_screenshot(
        &self,
        max_width: Option<u32>,
        max_height: Option<u32>,
    ) -> Result<CapturedImage, CaptureError> {
        let (timeout, w, h) = {
            let s = self.inner.settings.read();
            (
                s.capture_timeout,
                max_width.unwrap_or(s.screenshot_width),
                max_height.unwrap_or(s.screenshot_height),
            )
        };
        let source = self.inner.source.clone();
        let job = tokio::task::spawn_blocking(move || source.capture_screen(w, h));
        match tokio::time::timeout(timeout, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CaptureError::Failed(format!("capture task: {e}"))),
            Err(_) => Err(CaptureError::Timeout),
        }
    }

    /// Last snapshot committed by the timer.
    pub fn latest(&self) -> Option<Arc<DesktopState>> {
        self.inner.previous.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SamplerEvent> {
        self.inner.events.subscribe()
    }

    pub fn idle_time(&self) -> Option<Duration> {
        self.inner.source.idle_time()
    }

    pub fn settings(&self) -> SamplerSettings {
        self.inner.settings.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Start the periodic timer, replacing any running one.
    pub fn start(&self, settings: SamplerSettings) {
        self.stop();
        *self.inner.settings.write() = settings;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_timer(self.inner.clone(), cancel.clone()));
        *self.inner.running.lock() = Some(Running { cancel, task });
        tracing::info!("state sampler started");
    }

    /// Stop the timer.  Idempotent.
    pub fn stop(&self) {
        if let Some(running) = self.inner.running.lock().take() {
            running.cancel.cancel();
            running.task.abort();
            tracing::info!("state sampler stopped");
        }
    }

    async fn report(&self, state: &DesktopState) {
        self.inner.report(state).await;
    }
}

impl Inner {
    fn snapshot(&self, reason: CaptureReason) -> DesktopState {
        let settings = self.settings.read().clone();

        let active_window = self.source.query_active_window().unwrap_or_else(|e| {
            tracing::debug!(error = %e, "active window unavailable");
            ActiveWindow::default()
        });

        let running_apps = match self.source.running_apps() {
            Ok(apps) => normalize_apps(apps, settings.max_running_apps),
            Err(e) => {
                tracing::debug!(error = %e, "running apps unavailable");
                Vec::new()
            }
        };

        let screenshot = if settings.screenshot_enabled {
            self.source
                .capture_screen(settings.screenshot_width, settings.screenshot_height)
                .map_err(|e| tracing::debug!(error = %e, "screenshot unavailable"))
                .ok()
        } else {
            None
        };

        let previous = self.previous.read().clone();
        let (window_changed, previous_window_title) = match previous.as_deref() {
            Some(prev) if prev.title() != active_window.title => (true, prev.title().to_string()),
            Some(prev) => (false, prev.previous_window_title.clone()),
            None => (!active_window.title.is_empty(), String::new()),
        };

        DesktopState {
            timestamp: Utc::now(),
            active_window,
            screenshot,
            running_apps,
            window_changed,
            previous_window_title,
            reason,
        }
    }

    async fn report(&self, state: &DesktopState) {
        match self
            .bridge
            .send_payload(MessageType::DesktopState, &state.to_payload())
            .await
        {
            Ok(Delivery::Sent) => tracing::debug!(
                title = %state.title(),
                changed = state.window_changed,
                "desktop state sent"
            ),
            Ok(Delivery::Queued) => tracing::debug!("desktop state queued while offline"),
            Err(e) => tracing::warn!(error = %e, "desktop state report dropped"),
        }
    }
}

async fn run_timer(inner: Arc<Inner>, cancel: CancellationToken) {
    let (period, unchanged_every) = {
        let s = inner.settings.read();
        (s.interval, s.unchanged_report_interval)
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_report: Option<Instant> = None;
    let mut in_flight: Option<JoinHandle<DesktopState>> = None;

    loop {
        let tick = tokio::select! {
            t = ticker.tick() => t,
            _ = cancel.cancelled() => break,
        };

        // A capture that outlived its timeout is still holding the
        // platform; don't pile another one on top.
        if in_flight.as_ref().is_some_and(|job| !job.is_finished()) {
            tracing::debug!("previous capture still running, skipping tick");
            continue;
        }
        in_flight = None;

        let job_inner = inner.clone();
        let mut job = tokio::task::spawn_blocking(move || job_inner.snapshot(CaptureReason::Periodic));
        let timeout = inner.settings.read().capture_timeout;
        let state = match tokio::time::timeout(timeout, &mut job).await {
            Ok(Ok(state)) => Arc::new(state),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "capture task failed");
                continue;
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "capture timed out, skipping tick");
                in_flight = Some(job);
                continue;
            }
        };

        *inner.previous.write() = Some(state.clone());

        let due = last_report.map_or(true, |at| tick.duration_since(at) >= unchanged_every);
        if state.window_changed || due {
            inner.report(&state).await;
            last_report = Some(tick);
        }

        if state.window_changed {
            tracing::info!(
                from = %state.previous_window_title,
                to = %state.title(),
                "active window changed"
            );
            let _ = inner.events.send(SamplerEvent { state });
        }
    }
}
