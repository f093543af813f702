// ── Otokayit Engine: Event Bus ─────────────────────────────────────────────
//
// Single-producer, many-consumer broadcast of typed engine events.
// Subscribers (a façade pushing to UIs, the CLI renderer) dispatch on the
// variant; every event carries a monotonically non-decreasing epoch-seconds
// timestamp.
//
// Delivery contract:
//   • Events are totally ordered within a subscription.
//   • A slow subscriber never blocks the engine: `tokio::sync::broadcast`
//     overwrites the oldest buffered events for a lagging receiver. The
//     terminal `Done` is the newest event of a run, so it survives any lag.
//   • Subscribers that observe a gap reconcile via `Engine::snapshot`.

use crate::atoms::types::{CalibrationResult, CourseMap, DoneReason, Phase};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Buffered events per subscriber before the oldest get overwritten.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Everything the engine tells the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Log {
        timestamp: f64,
        level: LogLevel,
        message: String,
    },
    State {
        timestamp: f64,
        phase: Phase,
    },
    Countdown {
        timestamp: f64,
        seconds_remaining: f64,
    },
    CrnUpdate {
        timestamp: f64,
        courses: CourseMap,
    },
    Calibration {
        timestamp: f64,
        #[serde(flatten)]
        result: CalibrationResult,
    },
    Done {
        timestamp: f64,
        courses: CourseMap,
        #[serde(flatten)]
        reason: DoneReason,
    },
}

impl EngineEvent {
    pub fn timestamp(&self) -> f64 {
        match self {
            EngineEvent::Log { timestamp, .. }
            | EngineEvent::State { timestamp, .. }
            | EngineEvent::Countdown { timestamp, .. }
            | EngineEvent::CrnUpdate { timestamp, .. }
            | EngineEvent::Calibration { timestamp, .. }
            | EngineEvent::Done { timestamp, .. } => *timestamp,
        }
    }
}

/// Stream handed to subscribers. Dropping it unsubscribes.
pub type EventStream = BroadcastStream<EngineEvent>;

// ── Bus ────────────────────────────────────────────────────────────────────

pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    /// Last stamped timestamp; keeps the non-decreasing guarantee even if
    /// the wall clock steps backwards mid-run.
    last_timestamp: Mutex<f64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        EventBus { tx, last_timestamp: Mutex::new(0.0) }
    }

    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Stamp and publish. A send error only means there are currently no
    /// subscribers, which is fine; state lives in the snapshot.
    fn publish(&self, make: impl FnOnce(f64) -> EngineEvent) {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        let stamped = {
            let mut last = self.last_timestamp.lock();
            let ts = now.max(*last);
            *last = ts;
            ts
        };
        let _ = self.tx.send(make(stamped));
    }

    /// Publish a log event and mirror it to the process log.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => log::info!("[engine] {}", message),
            LogLevel::Warning => log::warn!("[engine] {}", message),
            LogLevel::Error => log::error!("[engine] {}", message),
        }
        self.publish(|timestamp| EngineEvent::Log { timestamp, level, message });
    }

    pub fn state(&self, phase: Phase) {
        self.publish(|timestamp| EngineEvent::State { timestamp, phase });
    }

    pub fn countdown(&self, seconds_remaining: f64) {
        self.publish(|timestamp| EngineEvent::Countdown { timestamp, seconds_remaining });
    }

    pub fn crn_update(&self, courses: CourseMap) {
        self.publish(|timestamp| EngineEvent::CrnUpdate { timestamp, courses });
    }

    pub fn calibration(&self, result: CalibrationResult) {
        self.publish(|timestamp| EngineEvent::Calibration { timestamp, result });
    }

    pub fn done(&self, courses: CourseMap, reason: DoneReason) {
        self.publish(|timestamp| EngineEvent::Done { timestamp, courses, reason });
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::CrnStatus;
    use std::collections::BTreeMap;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn events_arrive_in_publish_order_with_nondecreasing_timestamps() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        bus.state(Phase::TokenCheck);
        bus.log(LogLevel::Info, "checking token");
        bus.countdown(12.5);

        let mut timestamps = Vec::new();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, EngineEvent::State { phase: Phase::TokenCheck, .. }));
        timestamps.push(first.timestamp());

        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, EngineEvent::Log { .. }));
        timestamps.push(second.timestamp());

        let third = stream.next().await.unwrap().unwrap();
        assert!(matches!(third, EngineEvent::Countdown { .. }));
        timestamps.push(third.timestamp());

        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_but_keeps_done() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        // Flood well past the buffer without the subscriber reading.
        for i in 0..(EVENT_BUFFER * 2) {
            bus.countdown(i as f64);
        }
        bus.done(BTreeMap::new(), DoneReason::Completed);

        let mut saw_done = false;
        let mut received = 0usize;
        // Lagged receivers yield an error item first, then resume from the
        // oldest retained event.
        while let Ok(Some(item)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), stream.next()).await
        {
            if let Ok(event) = item {
                received += 1;
                if matches!(event, EngineEvent::Done { .. }) {
                    saw_done = true;
                    break;
                }
            }
        }
        assert!(saw_done, "terminal Done must never be dropped");
        assert!(received <= EVENT_BUFFER + 1, "oldest events should have been discarded");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.state(Phase::Done);
        bus.done(BTreeMap::new(), DoneReason::Cancelled);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_json_shape_is_tagged() {
        let mut courses = BTreeMap::new();
        courses.insert(
            "24066".to_string(),
            CrnStatus::Success { code: "0".into(), message: "Registered".into() },
        );
        let event = EngineEvent::Done {
            timestamp: 1_726_000_000.5,
            courses,
            reason: DoneReason::Completed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["reason"], "completed");
        assert_eq!(json["courses"]["24066"]["kind"], "success");

        let back: EngineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
