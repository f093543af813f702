// engine/state.rs — Run-time state shared between the engine worker and the
// control surface. The snapshot mutex is the only lock in the engine and is
// never held across I/O; the cancel flag is a lock-free atomic.

use crate::atoms::types::{CalibrationResult, CourseMap, EngineSnapshot, Phase};
use crate::engine::events::EventBus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set-once cancellation signal.
/// The scheduler checks it on every coarse wake and inside the busy-wait;
/// the attempt loop checks it between slices of every pause. Cheap enough
/// to poll at spin frequency.
#[derive(Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm for the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot cell with mutation helpers that keep the event bus in sync.
/// Every externally visible state change goes through here so the snapshot
/// and the event stream can never disagree about ordering.
pub struct SharedState {
    snapshot: Mutex<EngineSnapshot>,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState { snapshot: Mutex::new(EngineSnapshot::default()) }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.snapshot.lock().phase
    }

    pub fn set_phase(&self, bus: &EventBus, phase: Phase) {
        {
            let mut snap = self.snapshot.lock();
            snap.phase = phase;
            snap.running = !matches!(phase, Phase::Idle | Phase::Done);
        }
        bus.state(phase);
    }

    /// Seed the per-course map and attempt counters at the start of a run.
    pub fn begin_run(&self, courses: CourseMap, max_attempts: u32) {
        let mut snap = self.snapshot.lock();
        *snap = EngineSnapshot {
            courses,
            max_attempts,
            running: true,
            ..EngineSnapshot::default()
        };
    }

    pub fn set_attempt(&self, attempt: u32) {
        self.snapshot.lock().current_attempt = attempt;
    }

    pub fn update_courses(&self, bus: &EventBus, courses: CourseMap) {
        self.snapshot.lock().courses = courses.clone();
        bus.crn_update(courses);
    }

    pub fn courses(&self) -> CourseMap {
        self.snapshot.lock().courses.clone()
    }

    pub fn set_calibration(&self, bus: &EventBus, result: CalibrationResult) {
        self.snapshot.lock().last_calibration = Some(result.clone());
        bus.calibration(result);
    }

    pub fn set_countdown(&self, bus: &EventBus, seconds: f64, trigger_at: f64) {
        {
            let mut snap = self.snapshot.lock();
            snap.countdown_seconds = Some(seconds);
            snap.trigger_at = Some(trigger_at);
        }
        bus.countdown(seconds);
    }

    pub fn clear_countdown(&self) {
        self.snapshot.lock().countdown_seconds = None;
    }

    /// Back to a pristine idle snapshot (explicit reset).
    pub fn clear(&self) {
        *self.snapshot.lock() = EngineSnapshot::default();
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
