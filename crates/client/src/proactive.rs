//! Proactive conversation triggers.
//!
//! On every qualifying state change (and on a slower periodic check) the
//! engine decides whether to open a conversation on the user's behalf:
//!
//! 1. disabled → skip
//! 2. cooldown active → skip
//! 3. outside the configured time range → skip
//! 4. user idle past the threshold → skip
//! 5. draw against the configured probability → fire or skip
//!
//! The cooldown starts the moment the decision to fire is made, before the
//! fresh capture or the send, so decisions racing in from other events see
//! it immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime};
use dl_domain::config::{parse_hhmm, ProactiveConfig};
use dl_protocol::{MessageType, ProactiveChatPayload};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::{Delivery, MessageBridge};
use crate::capture::{CaptureReason, DesktopState};
use crate::sampler::StateSampler;

#[derive(Debug, Clone)]
pub struct ProactiveSettings {
    pub enabled: bool,
    pub check_interval: Duration,
    pub probability: f64,
    pub cooldown: Duration,
    pub require_user_active: bool,
    pub idle_threshold: Duration,
    /// Local wall-clock window; `start > end` wraps past midnight.
    pub time_range: Option<(NaiveTime, NaiveTime)>,
    pub prompt: String,
}

impl From<&ProactiveConfig> for ProactiveSettings {
    fn from(cfg: &ProactiveConfig) -> Self {
        let time_range = if cfg.time_range_enabled {
            parse_hhmm(&cfg.time_range_start).zip(parse_hhmm(&cfg.time_range_end))
        } else {
            None
        };
        Self {
            enabled: cfg.enabled,
            check_interval: cfg.check_interval(),
            probability: cfg.trigger_probability.clamp(0.0, 1.0),
            cooldown: cfg.cooldown(),
            require_user_active: cfg.require_user_active,
            idle_threshold: cfg.idle_threshold(),
            time_range,
            prompt: cfg.prompt_template.clone(),
        }
    }
}

impl Default for ProactiveSettings {
    fn default() -> Self {
        Self::from(&ProactiveConfig::default())
    }
}

/// Marks the start of a cooldown period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownToken {
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl CooldownToken {
    pub fn is_active(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Outcome of one trigger evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    Fire { roll: f64 },
    Disabled,
    CoolingDown { remaining: Duration },
    OutsideTimeRange,
    UserIdle { idle: Duration },
    NotDrawn { roll: f64 },
}

impl TriggerDecision {
    pub fn fired(&self) -> bool {
        matches!(self, Self::Fire { .. })
    }
}

/// What a fired trigger submitted.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    /// Fresh capture taken after the decision.
    pub state: Arc<DesktopState>,
    pub probability: f64,
    pub manual: bool,
    pub cooldown: CooldownToken,
    pub delivery: Option<Delivery>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    settings: RwLock<ProactiveSettings>,
    cooldown: Mutex<Option<CooldownToken>>,
    rng: Mutex<StdRng>,
    sampler: StateSampler,
    bridge: MessageBridge,
    running: Mutex<Option<Running>>,
}

#[derive(Clone)]
pub struct ProactiveTrigger {
    inner: Arc<Inner>,
}

fn within(range: (NaiveTime, NaiveTime), now: NaiveTime) -> bool {
    let (start, end) = range;
    if start <= end {
        now >= start && now <= end
    } else {
        now >= start || now <= end
    }
}

impl ProactiveTrigger {
    pub fn new(settings: ProactiveSettings, sampler: StateSampler, bridge: MessageBridge) -> Self {
        Self::with_rng(settings, sampler, bridge, StdRng::from_entropy())
    }

    /// Deterministic draws, for tests.
    pub fn with_seed(
        settings: ProactiveSettings,
        sampler: StateSampler,
        bridge: MessageBridge,
        seed: u64,
    ) -> Self {
        Self::with_rng(settings, sampler, bridge, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        settings: ProactiveSettings,
        sampler: StateSampler,
        bridge: MessageBridge,
        rng: StdRng,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: RwLock::new(settings),
                cooldown: Mutex::new(None),
                rng: Mutex::new(rng),
                sampler,
                bridge,
                running: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> ProactiveSettings {
        self.inner.settings.read().clone()
    }

    pub fn update_settings(&self, settings: ProactiveSettings) {
        *self.inner.settings.write() = settings;
    }

    pub fn cooldown(&self) -> Option<CooldownToken> {
        *self.inner.cooldown.lock()
    }

    /// Run the gates and the draw.  Starts the cooldown when it fires.
    pub fn decide(&self, now: Instant, local_time: NaiveTime, idle: Option<Duration>) -> TriggerDecision {
        let settings = self.inner.settings.read().clone();
        if !settings.enabled {
            return TriggerDecision::Disabled;
        }

        // Held across the draw so two concurrent decisions cannot both fire.
        let mut cooldown = self.inner.cooldown.lock();
        if let Some(token) = cooldown.as_ref().filter(|t| t.is_active(now)) {
            return TriggerDecision::CoolingDown {
                remaining: token.remaining(now),
            };
        }
        if let Some(range) = settings.time_range {
            if !within(range, local_time) {
                return TriggerDecision::OutsideTimeRange;
            }
        }
        if settings.require_user_active {
            if let Some(idle) = idle.filter(|i| *i >= settings.idle_threshold) {
                return TriggerDecision::UserIdle { idle };
            }
        }

        let roll: f64 = self.inner.rng.lock().gen();
        if roll >= settings.probability {
            return TriggerDecision::NotDrawn { roll };
        }

        *cooldown = Some(CooldownToken {
            issued_at: now,
            expires_at: now + settings.cooldown,
        });
        TriggerDecision::Fire { roll }
    }

    /// Evaluate one state-change event; on a hit, capture and submit.
    pub async fn on_state_change(&self, state: &DesktopState) -> TriggerDecision {
        let decision = self.decide(
            Instant::now(),
            Local::now().time(),
            self.inner.sampler.idle_time(),
        );
        tracing::debug!(
            title = %state.title(),
            decision = ?decision,
            "proactive trigger evaluated"
        );
        if decision.fired() {
            if let Some(token) = self.cooldown() {
                let probability = self.inner.settings.read().probability;
                self.fire(token, probability, false, Some(state)).await;
            }
        }
        decision
    }

    /// User-requested trigger: skips the gates and the draw, but honours
    /// and restarts the cooldown.  `None` while cooling down.
    pub async fn trigger_manual(&self) -> Option<TriggerContext> {
        let now = Instant::now();
        let token = {
            let cooldown_for = self.inner.settings.read().cooldown;
            let mut cooldown = self.inner.cooldown.lock();
            if let Some(active) = cooldown.as_ref().filter(|t| t.is_active(now)) {
                tracing::info!(
                    remaining_secs = active.remaining(now).as_secs(),
                    "manual proactive trigger ignored during cooldown"
                );
                return None;
            }
            let token = CooldownToken {
                issued_at: now,
                expires_at: now + cooldown_for,
            };
            *cooldown = Some(token);
            token
        };
        Some(self.fire(token, 1.0, true, None).await)
    }

    async fn fire(
        &self,
        cooldown: CooldownToken,
        probability: f64,
        manual: bool,
        trigger_state: Option<&DesktopState>,
    ) -> TriggerContext {
        let state = match self.inner.sampler.capture_bounded(CaptureReason::Proactive).await {
            Ok(state) => Arc::new(state),
            Err(e) => {
                tracing::warn!(error = %e, "fresh capture failed, using last known snapshot");
                match trigger_state {
                    Some(s) => Arc::new(s.clone()),
                    None => self
                        .inner
                        .sampler
                        .latest()
                        .unwrap_or_else(|| Arc::new(DesktopState::empty(CaptureReason::Proactive))),
                }
            }
        };

        let prompt = self.inner.settings.read().prompt.clone();
        let payload = ProactiveChatPayload {
            prompt,
            probability,
            manual,
            desktop: state.to_payload(),
        };
        let delivery = match self
            .inner
            .bridge
            .send_payload(MessageType::ProactiveChat, &payload)
            .await
        {
            Ok(delivery) => {
                tracing::info!(
                    manual,
                    title = %state.title(),
                    delivery = ?delivery,
                    "proactive conversation triggered"
                );
                Some(delivery)
            }
            Err(e) => {
                tracing::warn!(error = %e, "proactive trigger could not be submitted");
                None
            }
        };

        TriggerContext {
            state,
            probability,
            manual,
            cooldown,
            delivery,
        }
    }

    /// Listen to sampler events and the periodic check.  Replaces any
    /// running loop.
    pub fn start(&self) {
        self.stop();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.clone(), cancel.clone()));
        *self.inner.running.lock() = Some(Running { cancel, task });
    }

    pub fn stop(&self) {
        if let Some(running) = self.inner.running.lock().take() {
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

async fn run_loop(engine: ProactiveTrigger, cancel: CancellationToken) {
    let mut events = engine.inner.sampler.subscribe();
    let period = engine.inner.settings.read().check_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    engine.on_state_change(&event.state).await;
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "proactive engine lagged behind sampler");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if let Some(latest) = engine.inner.sampler.latest() {
                    engine.on_state_change(&latest).await;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ActiveWindow, CaptureSource, CapturedImage};
    use crate::sampler::tests::ScriptedSource;
    use crate::sampler::SamplerSettings;
    use crate::types::CaptureError;

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    fn engine(settings: ProactiveSettings, seed: u64) -> (ProactiveTrigger, MessageBridge) {
        engine_over(
            Arc::new(ScriptedSource::new(&["Editor"])),
            SamplerSettings::default(),
            settings,
            seed,
        )
    }

    fn engine_over(
        source: Arc<dyn CaptureSource>,
        sampler_settings: SamplerSettings,
        settings: ProactiveSettings,
        seed: u64,
    ) -> (ProactiveTrigger, MessageBridge) {
        let bridge = MessageBridge::offline(64);
        let sampler = StateSampler::new(source, sampler_settings, bridge.clone());
        (
            ProactiveTrigger::with_seed(settings, sampler, bridge.clone(), seed),
            bridge,
        )
    }

    /// Answers every query after a long stall.
    struct StalledSource;

    impl CaptureSource for StalledSource {
        fn capture_screen(&self, _: u32, _: u32) -> Result<CapturedImage, CaptureError> {
            std::thread::sleep(Duration::from_millis(800));
            Err(CaptureError::Timeout)
        }

        fn query_active_window(&self) -> Result<ActiveWindow, CaptureError> {
            std::thread::sleep(Duration::from_millis(800));
            Ok(ActiveWindow {
                title: "Too late".into(),
                ..Default::default()
            })
        }
    }

    fn always() -> ProactiveSettings {
        ProactiveSettings {
            enabled: true,
            probability: 1.0,
            cooldown: Duration::from_secs(600),
            ..Default::default()
        }
    }

    async fn proactive_count(bridge: &MessageBridge) -> usize {
        bridge
            .pending()
            .await
            .iter()
            .filter(|e| e.kind == MessageType::ProactiveChat)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_never_fires() {
        let (e, _) = engine(ProactiveSettings::default(), 1);
        assert_eq!(e.decide(Instant::now(), noon(), None), TriggerDecision::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn probability_zero_never_fires() {
        let (e, _) = engine(
            ProactiveSettings {
                probability: 0.0,
                ..always()
            },
            2,
        );
        for _ in 0..100 {
            assert!(matches!(
                e.decide(Instant::now(), noon(), None),
                TriggerDecision::NotDrawn { .. }
            ));
        }
        assert!(e.cooldown().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_until_expiry() {
        let (e, _) = engine(always(), 3);
        let t0 = Instant::now();
        assert!(e.decide(t0, noon(), None).fired());

        let t1 = t0 + Duration::from_secs(300);
        assert_eq!(
            e.decide(t1, noon(), None),
            TriggerDecision::CoolingDown {
                remaining: Duration::from_secs(300)
            }
        );

        let t2 = t0 + Duration::from_secs(601);
        assert!(e.decide(t2, noon(), None).fired());
    }

    #[tokio::test(start_paused = true)]
    async fn two_events_inside_cooldown_fire_once() {
        let (e, bridge) = engine(always(), 4);
        let state = e.inner.sampler.capture_once(CaptureReason::Periodic);

        assert!(e.on_state_change(&state).await.fired());
        assert!(matches!(
            e.on_state_change(&state).await,
            TriggerDecision::CoolingDown { .. }
        ));
        assert_eq!(proactive_count(&bridge).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn time_range_wraps_midnight() {
        let (e, _) = engine(
            ProactiveSettings {
                time_range: Some((
                    NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                )),
                ..always()
            },
            5,
        );
        assert_eq!(
            e.decide(Instant::now(), noon(), None),
            TriggerDecision::OutsideTimeRange
        );
        let late = NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        assert!(e.decide(Instant::now(), late, None).fired());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_user_is_left_alone() {
        let (e, _) = engine(always(), 6);
        let idle = Duration::from_secs(120);
        assert_eq!(
            e.decide(Instant::now(), noon(), Some(idle)),
            TriggerDecision::UserIdle { idle }
        );
        assert!(e
            .decide(Instant::now(), noon(), Some(Duration::from_secs(5)))
            .fired());
    }

    #[tokio::test(start_paused = true)]
    async fn draw_rate_tracks_probability() {
        let (e, _) = engine(
            ProactiveSettings {
                probability: 0.2,
                cooldown: Duration::ZERO,
                ..always()
            },
            42,
        );
        let hits = (0..5_000)
            .filter(|_| e.decide(Instant::now(), noon(), None).fired())
            .count();
        let rate = hits as f64 / 5_000.0;
        assert!((0.17..0.23).contains(&rate), "rate {rate}");
    }

    #[tokio::test]
    async fn fire_submits_fresh_capture() {
        let (e, bridge) = engine_over(
            Arc::new(ScriptedSource::new(&["Editor", "Browser"])),
            SamplerSettings::default(),
            always(),
            7,
        );
        let stale = e.inner.sampler.capture_once(CaptureReason::Periodic);
        assert_eq!(stale.title(), "Editor");
        assert!(e.on_state_change(&stale).await.fired());

        let pending = bridge.pending().await;
        let chat: ProactiveChatPayload = pending
            .iter()
            .find(|env| env.kind == MessageType::ProactiveChat)
            .unwrap()
            .payload()
            .unwrap();
        assert!(!chat.manual);
        assert_eq!(chat.desktop.active_window_title, "Browser");
        assert!((chat.probability - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stalled_capture_does_not_block_manual_trigger() {
        let (e, bridge) = engine_over(
            Arc::new(StalledSource),
            SamplerSettings {
                capture_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            always(),
            9,
        );

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                let mut every = tokio::time::interval(Duration::from_millis(10));
                loop {
                    every.tick().await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            })
        };

        let started = std::time::Instant::now();
        let ctx = e.trigger_manual().await.unwrap();
        let elapsed = started.elapsed();
        ticker.abort();

        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) >= 5);
        // Nothing committed yet, so the request carries an empty snapshot.
        assert_eq!(ctx.state.title(), "");
        assert_eq!(proactive_count(&bridge).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_respects_and_starts_cooldown() {
        let (e, bridge) = engine(
            ProactiveSettings {
                probability: 0.0,
                ..always()
            },
            8,
        );
        let ctx = e.trigger_manual().await.unwrap();
        assert!(ctx.manual);
        assert_eq!(ctx.delivery, Some(Delivery::Queued));
        assert!(e.cooldown().is_some());

        assert!(e.trigger_manual().await.is_none());
        assert_eq!(proactive_count(&bridge).await, 1);
    }

    #[test]
    fn settings_from_config_parse_time_range() {
        let cfg = ProactiveConfig {
            time_range_enabled: true,
            time_range_start: "21:00".into(),
            time_range_end: "07:30".into(),
            ..Default::default()
        };
        let s = ProactiveSettings::from(&cfg);
        let (start, end) = s.time_range.unwrap();
        assert_eq!(start, NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        assert_eq!(end, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
    }
}
