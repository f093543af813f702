// ── Otokayit Engine: Firing Scheduler ──────────────────────────────────────
//
// Converts the target wall-clock moment plus the calibration estimate into a
// local monotonic trigger instant, then delivers control at that instant:
//
//   trigger_local = target_local − server_offset − rtt_one_way + safety_buffer
//
// The request leaves one one-way latency before the SIS clock reads the
// target time, so its first byte arrives as the window opens.
//
// Delivery is two-stage: cancellable 100 ms sleep slices with countdown
// ticks while far out, then a pure monotonic busy-wait for the final 50 ms.
// No sleeping primitive runs inside the busy-wait.

use crate::atoms::constants::{BUSY_WAIT_WINDOW, COARSE_SLICE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::state::CancelFlag;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use std::time::Instant;

// ── Target resolution ──────────────────────────────────────────────────────

/// Resolve a time-of-day in the SIS civil zone to the next occurrence ≥ now.
/// A target earlier today rolls over to tomorrow.
pub fn resolve_target(target: NaiveTime, zone: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut date = now.with_timezone(&zone).date_naive();
    loop {
        // `earliest` handles DST ambiguity; a nonexistent local time (DST
        // gap) falls through to the next day.
        if let Some(candidate) = zone
            .from_local_datetime(&date.and_time(target))
            .earliest()
        {
            let candidate = candidate.with_timezone(&Utc);
            if candidate >= now {
                return candidate;
            }
        }
        date += ChronoDuration::days(1);
    }
}

// ── Trigger computation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Trigger {
    pub instant: Instant,
    /// Wall-clock equivalent (epoch seconds), for display only.
    pub at_epoch: f64,
}

/// Apply the firing formula. A trigger already in the past clamps to now so
/// a late start still fires immediately instead of erroring.
pub fn compute_trigger(
    target: DateTime<Utc>,
    server_offset_ms: f64,
    rtt_one_way_ms: f64,
    safety_buffer_secs: f64,
) -> Trigger {
    let now_instant = Instant::now();
    let now_wall_ms = Utc::now().timestamp_micros() as f64 / 1000.0;
    let target_wall_ms = target.timestamp_micros() as f64 / 1000.0;

    let fire_wall_ms =
        target_wall_ms - server_offset_ms - rtt_one_way_ms + safety_buffer_secs * 1000.0;
    let delta_ms = (fire_wall_ms - now_wall_ms).max(0.0);

    Trigger {
        instant: now_instant + std::time::Duration::from_secs_f64(delta_ms / 1000.0),
        at_epoch: (now_wall_ms + delta_ms) / 1000.0,
    }
}

// ── Delivery ───────────────────────────────────────────────────────────────

/// Sleep coarsely toward `trigger`, invoking `on_tick` with the remaining
/// seconds on every wake, then busy-wait the final window. Returns the
/// instant the wait ended, or `Cancelled`.
pub async fn wait_until(
    trigger: Instant,
    cancel: &CancelFlag,
    mut on_tick: impl FnMut(f64),
) -> EngineResult<Instant> {
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let now = Instant::now();
        let remaining = trigger.saturating_duration_since(now);
        if remaining <= BUSY_WAIT_WINDOW {
            break;
        }
        on_tick(remaining.as_secs_f64());
        let slice = COARSE_SLICE.min(remaining - BUSY_WAIT_WINDOW);
        tokio::time::sleep(slice).await;
    }

    // Final window: elevated priority, pure spin, cancel checked per
    // iteration through the lock-free flag.
    let _boost = PriorityBoost::acquire();
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let now = Instant::now();
        if now >= trigger {
            return Ok(now);
        }
        std::hint::spin_loop();
    }
}

// ── Scheduling-priority boost ──────────────────────────────────────────────
// Best-effort niceness bump for the firing window. Requires privileges on
// most hosts; failure is logged once and ignored. Correctness never depends
// on it, it only tightens the tail of the firing distribution.

struct PriorityBoost {
    #[cfg(unix)]
    previous: Option<i32>,
}

impl PriorityBoost {
    #[cfg(unix)]
    fn acquire() -> Self {
        unsafe {
            let previous = libc::getpriority(libc::PRIO_PROCESS, 0);
            if libc::setpriority(libc::PRIO_PROCESS, 0, -10) == 0 {
                debug!("[scheduler] Raised scheduling priority for the firing window");
                PriorityBoost { previous: Some(previous) }
            } else {
                info!("[scheduler] Could not raise scheduling priority (continuing unboosted)");
                PriorityBoost { previous: None }
            }
        }
    }

    #[cfg(not(unix))]
    fn acquire() -> Self {
        warn!("[scheduler] Scheduling priority boost unsupported on this platform");
        PriorityBoost {}
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(previous) = self.previous {
            unsafe {
                if libc::setpriority(libc::PRIO_PROCESS, 0, previous) != 0 {
                    warn!("[scheduler] Failed to restore scheduling priority");
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::time::Duration;

    const IST: Tz = chrono_tz::Europe::Istanbul;

    #[test]
    fn future_time_today_resolves_today() {
        // 10:00 UTC = 13:00 Istanbul; target 14:00 Istanbul is later today.
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let target = resolve_target(NaiveTime::from_hms_opt(14, 0, 0).unwrap(), IST, now);
        assert_eq!(target, Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap());
    }

    #[test]
    fn past_time_resolves_to_next_day() {
        // 13:00 UTC = 16:00 Istanbul; target 14:00 Istanbul already passed.
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap();
        let target = resolve_target(NaiveTime::from_hms_opt(14, 0, 0).unwrap(), IST, now);
        assert_eq!(target, Utc.with_ymd_and_hms(2026, 3, 3, 11, 0, 0).unwrap());
        assert_eq!(target.with_timezone(&IST).hour(), 14);
    }

    #[test]
    fn exact_now_counts_as_this_occurrence() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
        let target = resolve_target(NaiveTime::from_hms_opt(14, 0, 0).unwrap(), IST, now);
        assert_eq!(target, now);
    }

    #[test]
    fn trigger_formula_matches_specification() {
        // Target 10 s out, server 2 s behind us, 25 ms one-way, 5 ms buffer.
        let target = Utc::now() + ChronoDuration::milliseconds(10_000);
        let trigger = compute_trigger(target, -2000.0, 25.0, 0.005);

        // Firing delta from now: 10_000 + 2000 − 25 + 5 = 11_980 ms.
        let delta = trigger
            .instant
            .saturating_duration_since(Instant::now())
            .as_secs_f64()
            * 1000.0;
        assert!(
            (delta - 11_980.0).abs() < 2.0,
            "trigger deviates from the formula by {:.3} ms",
            (delta - 11_980.0).abs()
        );
    }

    #[test]
    fn past_trigger_clamps_to_now() {
        let target = Utc::now() - ChronoDuration::seconds(5);
        let trigger = compute_trigger(target, 0.0, 0.0, 0.0);
        assert!(trigger.instant.saturating_duration_since(Instant::now()) < Duration::from_millis(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_until_fires_close_to_trigger() {
        let trigger = Instant::now() + Duration::from_millis(180);
        let cancel = CancelFlag::new();
        let mut ticks = 0u32;
        let fired = wait_until(trigger, &cancel, |_| ticks += 1).await.unwrap();
        let late = fired.saturating_duration_since(trigger);
        assert!(late < Duration::from_millis(10), "fired {:?} late", late);
        assert!(ticks >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_until_honors_cancellation_quickly() {
        let trigger = Instant::now() + Duration::from_secs(30);
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.cancel();
        });
        let started = Instant::now();
        let result = wait_until(trigger, &cancel, |_| {}).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
