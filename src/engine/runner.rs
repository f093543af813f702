// ── Otokayit Engine: Control Surface & Run Worker ──────────────────────────
//
// One `Engine` value owns all run state: the shared HTTP client, the state
// snapshot, the event bus, the calibration history, and the cancel flag.
// External callers interact through a small thread-safe surface
// (`configure`, `start`, `cancel`, `reset`, `snapshot`, `subscribe`); the
// run itself is a single spawned worker task with linear control flow:
//
//   token_check → calibrating → waiting → registering → done
//
// A second task handles periodic recalibration during the waiting phase and
// is aborted when the wait ends. Exactly one `Done` event is published per
// run, whatever the outcome.

use crate::atoms::constants::{FINAL_CALIBRATION_LEAD, RECALIBRATION_PERIOD};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    CalibrationSource, CourseMap, CrnStatus, DoneReason, EngineConfig, EngineSnapshot, Phase,
};
use crate::engine::attempt;
use crate::engine::calibrate::{CalibrationHistory, Calibrator};
use crate::engine::events::{EventBus, EventStream, LogLevel};
use crate::engine::http::{pinned_client, prewarm};
use crate::engine::request::PrebuiltRequest;
use crate::engine::scheduler::{compute_trigger, resolve_target, wait_until, Trigger};
use crate::engine::state::{CancelFlag, SharedState};
use crate::engine::token;
use log::info;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cloning shares the same underlying engine: one run, one event bus, many
/// handles.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    client: Client,
    state: SharedState,
    bus: EventBus,
    cancel: CancelFlag,
    running: AtomicBool,
    config: Mutex<Option<EngineConfig>>,
    history: CalibrationHistory,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                client: pinned_client(),
                state: SharedState::new(),
                bus: EventBus::new(),
                cancel: CancelFlag::new(),
                running: AtomicBool::new(false),
                config: Mutex::new(None),
                history: CalibrationHistory::new(),
            }),
        }
    }

    /// Replace the working configuration. Rejected mid-run: the active run
    /// owns its config until it finishes.
    pub fn configure(&self, config: EngineConfig) -> EngineResult<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        config.validate()?;
        // Replacing the old config drops it, zeroing its token.
        *self.inner.config.lock() = Some(config);
        Ok(())
    }

    /// Begin a run. Fails fast with `AlreadyRunning` while one is active and
    /// leaves all state untouched in that case.
    pub fn start(&self) -> EngineResult<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }

        let config = match self.inner.config.lock().clone() {
            Some(config) => config,
            None => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(EngineError::config("no configuration loaded"));
            }
        };
        if let Err(e) = config.validate() {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.inner.cancel.reset();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_worker(inner, config).await;
        });
        Ok(())
    }

    /// Request cancellation of the active run. The `Done` event follows
    /// within the cancellation latency of the current suspension point.
    pub fn cancel(&self) -> EngineResult<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        info!("[engine] Cancellation requested");
        self.inner.cancel.cancel();
        Ok(())
    }

    /// Drop the last run's snapshot and configuration (zeroing the token).
    pub fn reset(&self) -> EngineResult<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(EngineError::StillRunning);
        }
        *self.inner.config.lock() = None;
        self.inner.state.clear();
        self.inner.cancel.reset();
        Ok(())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.state.snapshot()
    }

    /// Subscribe to the event stream. Dropping the stream unsubscribes.
    pub fn subscribe(&self) -> EventStream {
        self.inner.bus.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

// ── Worker ─────────────────────────────────────────────────────────────────

async fn run_worker(inner: Arc<EngineInner>, config: EngineConfig) {
    // Seed the per-course map so every event of this run carries the full
    // course set from the first moment.
    let mut courses = CourseMap::new();
    for crn in config.ecrns.iter().chain(config.scrns.iter()) {
        courses.insert(crn.clone(), CrnStatus::Pending);
    }
    inner.state.begin_run(courses, config.max_attempts);

    let reason = match drive(&inner, &config).await {
        Ok(reason) => reason,
        Err(EngineError::Cancelled) => DoneReason::Cancelled,
        Err(EngineError::TokenInvalid) => DoneReason::TokenInvalid,
        Err(e) => DoneReason::Failed { message: e.to_string() },
    };

    match &reason {
        DoneReason::Completed => inner.bus.log(LogLevel::Info, "Run finished: all courses resolved"),
        DoneReason::AttemptsExhausted => {
            inner.bus.log(LogLevel::Warning, "Run finished: attempt budget exhausted")
        }
        DoneReason::Cancelled => inner.bus.log(LogLevel::Info, "Run cancelled"),
        DoneReason::TokenInvalid => {
            inner.bus.log(LogLevel::Error, "Run aborted: the SIS rejected the token")
        }
        DoneReason::Failed { message } => {
            inner.bus.log(LogLevel::Error, format!("Run failed: {}", message))
        }
    }

    inner.state.set_phase(&inner.bus, Phase::Done);
    inner.bus.done(inner.state.courses(), reason);
    inner.running.store(false, Ordering::SeqCst);
}

/// Linear run control flow. Every `?` funnels into the worker's single
/// `Done` emission.
async fn drive(inner: &Arc<EngineInner>, config: &EngineConfig) -> EngineResult<DoneReason> {
    let bus = &inner.bus;
    let state = &inner.state;
    let cancel = &inner.cancel;
    let fingerprint = config.token_fingerprint();

    // ── Token check ────────────────────────────────────────────────────
    state.set_phase(bus, Phase::TokenCheck);
    bus.log(LogLevel::Info, "Checking bearer token against the SIS");
    token::warn_if_expired(&config.token);
    token::check_token(&inner.client, &config.base_url, &config.token).await?;
    bus.log(LogLevel::Info, "Token accepted");

    // ── Initial calibration ────────────────────────────────────────────
    state.set_phase(bus, Phase::Calibrating);
    prewarm(&inner.client, &config.base_url).await;
    let calibrator = Calibrator::new(inner.client.clone(), &config.base_url);
    let initial = calibrator
        .calibrate(&inner.history, &fingerprint, CalibrationSource::Initial, cancel, true)
        .await?;
    bus.log(
        LogLevel::Info,
        format!(
            "Calibrated: server offset {:+.1} ms, one-way latency {:.1} ms (±{:.1} ms)",
            initial.server_offset_ms, initial.rtt_one_way_ms, initial.accuracy_ms
        ),
    );
    state.set_calibration(bus, initial.clone());

    // ── Resolve the target and pre-build the request ───────────────────
    let target = resolve_target(config.target_time, config.zone, chrono::Utc::now());
    bus.log(
        LogLevel::Info,
        format!("Firing at {} ({})", target.with_timezone(&config.zone), config.zone),
    );
    let mut request =
        PrebuiltRequest::build(&config.base_url, &config.token, &config.ecrns, &config.scrns)?;

    // ── Waiting ────────────────────────────────────────────────────────
    state.set_phase(bus, Phase::Waiting);
    let mut trigger = compute_trigger(
        target,
        initial.server_offset_ms,
        initial.rtt_one_way_ms,
        config.safety_buffer,
    );

    // Far-out stretch: count down toward the final-calibration mark while a
    // background task refreshes the sample pool every 30 s.
    let far_mark = trigger.instant - FINAL_CALIBRATION_LEAD.min(
        trigger.instant.saturating_duration_since(Instant::now()),
    );
    if far_mark > Instant::now() {
        let recal = spawn_recalibration(inner, config, &fingerprint);
        let wait = wait_until(far_mark, cancel, countdown_tick(inner, trigger)).await;
        recal.abort();
        wait?;

        // Final calibration: lowest-RTT sample across the whole pool wins
        // and fixes the trigger for good.
        let fin = calibrator
            .calibrate(&inner.history, &fingerprint, CalibrationSource::Final, cancel, true)
            .await?;
        bus.log(
            LogLevel::Info,
            format!(
                "Final calibration: server offset {:+.1} ms (±{:.1} ms, {:?})",
                fin.server_offset_ms, fin.accuracy_ms, fin.source
            ),
        );
        trigger =
            compute_trigger(target, fin.server_offset_ms, fin.rtt_one_way_ms, config.safety_buffer);
        state.set_calibration(bus, fin);
    }

    wait_until(trigger.instant, cancel, countdown_tick(inner, trigger)).await?;

    // ── Registering ────────────────────────────────────────────────────
    state.clear_countdown();
    state.set_phase(bus, Phase::Registering);
    let rtt_full_ms = state
        .snapshot()
        .last_calibration
        .map(|c| c.rtt_full_ms)
        .unwrap_or(50.0);
    let outcome = attempt::run(
        &inner.client,
        &mut request,
        config,
        state,
        bus,
        cancel,
        rtt_full_ms,
    )
    .await?;

    Ok(if outcome.fully_resolved {
        DoneReason::Completed
    } else {
        DoneReason::AttemptsExhausted
    })
}

/// Countdown closure shared by both waiting stretches. Emits at most one
/// event per decisecond value so a steady 10 Hz wake never floods the bus
/// with duplicates.
fn countdown_tick(inner: &EngineInner, trigger: Trigger) -> impl FnMut(f64) + '_ {
    let mut last_deciseconds = u64::MAX;
    move |remaining: f64| {
        let deciseconds = (remaining * 10.0) as u64;
        if deciseconds != last_deciseconds {
            last_deciseconds = deciseconds;
            inner
                .state
                .set_countdown(&inner.bus, deciseconds as f64 / 10.0, trigger.at_epoch);
        }
    }
}

/// Background refresh of the calibration pool during the waiting phase.
/// Results land in the history and the broadcast; the trigger itself is only
/// recomputed at the final calibration.
fn spawn_recalibration(
    inner: &Arc<EngineInner>,
    config: &EngineConfig,
    fingerprint: &str,
) -> tokio::task::JoinHandle<()> {
    let inner = Arc::clone(inner);
    let base_url = config.base_url.clone();
    let fingerprint = fingerprint.to_string();
    tokio::spawn(async move {
        let calibrator = Calibrator::new(inner.client.clone(), &base_url);
        loop {
            tokio::time::sleep(RECALIBRATION_PERIOD).await;
            if inner.cancel.is_cancelled() {
                return;
            }
            match calibrator
                .calibrate(&inner.history, &fingerprint, CalibrationSource::Auto, &inner.cancel, false)
                .await
            {
                Ok(result) => inner.state.set_calibration(&inner.bus, result),
                // A missed refresh is harmless; the pool keeps its best.
                Err(e) => log::debug!("[engine] Recalibration skipped: {}", e),
            }
        }
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
