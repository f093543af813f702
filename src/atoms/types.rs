// ── Otokayit Atoms: Shared Types ───────────────────────────────────────────
// Pure data types shared between the engine and its subscribers.
// Everything that crosses the event bus derives Serialize/Deserialize so a
// façade can forward events to a UI without re-encoding.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

// ── Engine configuration ───────────────────────────────────────────────────

/// Immutable per-run configuration. Handed to the engine before `start` and
/// owned by the run until it finishes.
///
/// The bearer token lives in a `Zeroizing<String>` so it is wiped from RAM
/// when the configuration is dropped or replaced. It never appears in
/// `Debug` output, events, or error messages.
#[derive(Clone)]
pub struct EngineConfig {
    pub token: Zeroizing<String>,
    /// Course reference numbers to enroll in, in priority order.
    pub ecrns: Vec<String>,
    /// Course reference numbers to drop.
    pub scrns: Vec<String>,
    /// Time-of-day in the SIS civil zone at which the registration window
    /// opens. Resolved to the next occurrence ≥ now when the run starts.
    pub target_time: NaiveTime,
    pub max_attempts: u32,
    /// Seconds between attempts. Floor enforced at validation.
    pub retry_interval: f64,
    /// Seconds added to the firing instant to avoid early-arrival rejection.
    pub safety_buffer: f64,
    /// When true the attempt loop never contacts the SIS.
    pub dry_run: bool,
    /// Keep retrying courses that report a full quota. Default off: a full
    /// course is treated as terminal.
    pub retry_full_courses: bool,
    pub base_url: String,
    pub zone: chrono_tz::Tz,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            token: Zeroizing::new(String::new()),
            ecrns: Vec::new(),
            scrns: Vec::new(),
            target_time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            max_attempts: 30,
            retry_interval: MIN_RETRY_INTERVAL_SECS,
            safety_buffer: 0.005,
            dry_run: false,
            retry_full_courses: false,
            base_url: SIS_BASE_URL.to_string(),
            zone: SIS_ZONE,
        }
    }
}

impl EngineConfig {
    /// Validate every field. Called at `configure` and again at `start` so a
    /// façade that bypasses `configure` cannot smuggle in a bad run.
    pub fn validate(&self) -> EngineResult<()> {
        if self.token.trim().is_empty() {
            return Err(EngineError::config("missing bearer token"));
        }
        if self.ecrns.is_empty() && self.scrns.is_empty() {
            return Err(EngineError::config("no courses to add or drop"));
        }
        if self.ecrns.len() > MAX_ECRN_COUNT {
            return Err(EngineError::config(format!(
                "at most {} courses can be added per run (got {})",
                MAX_ECRN_COUNT,
                self.ecrns.len()
            )));
        }
        for crn in self.ecrns.iter().chain(self.scrns.iter()) {
            if crn.len() != CRN_LEN || !crn.bytes().all(|b| b.is_ascii_digit()) {
                return Err(EngineError::config(format!("invalid CRN '{}'", crn)));
            }
        }
        if self.retry_interval < MIN_RETRY_INTERVAL_SECS {
            return Err(EngineError::config(format!(
                "retry interval {:.3}s is below the {:.1}s server debounce floor",
                self.retry_interval, MIN_RETRY_INTERVAL_SECS
            )));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS {
            return Err(EngineError::config(format!(
                "max attempts must be in 1..={} (got {})",
                MAX_ATTEMPTS, self.max_attempts
            )));
        }
        if !(0.0..=MAX_SAFETY_BUFFER_SECS).contains(&self.safety_buffer) {
            return Err(EngineError::config(format!(
                "safety buffer must be in 0..={}s (got {})",
                MAX_SAFETY_BUFFER_SECS, self.safety_buffer
            )));
        }
        Ok(())
    }

    /// SHA-256 hex digest of the token. Keys the calibration history so
    /// samples survive token rotation without the token itself being stored.
    pub fn token_fingerprint(&self) -> String {
        token_fingerprint(&self.token)
    }
}

// The derived Debug would print the token; write it by hand instead.
impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("token", &"<redacted>")
            .field("ecrns", &self.ecrns)
            .field("scrns", &self.scrns)
            .field("target_time", &self.target_time)
            .field("max_attempts", &self.max_attempts)
            .field("retry_interval", &self.retry_interval)
            .field("safety_buffer", &self.safety_buffer)
            .field("dry_run", &self.dry_run)
            .field("retry_full_courses", &self.retry_full_courses)
            .field("base_url", &self.base_url)
            .field("zone", &self.zone)
            .finish()
    }
}

/// SHA-256 hex digest of a credential, safe to use as a map key or log tag.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Per-course status ──────────────────────────────────────────────────────

/// Outcome of a single course within the run, updated after every attempt.
/// `code` is the raw SIS result code, `message` a stable human-readable
/// rendering of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrnStatus {
    /// No terminal answer yet; the course stays in the working set.
    Pending,
    Success { code: String, message: String },
    AlreadyEnrolled { code: String, message: String },
    Full { code: String, message: String },
    Conflict { code: String, message: String },
    UpgradeConflict { code: String, message: String },
    Debounce { code: String, message: String },
    Error { code: String, message: String },
    Dropped { code: String, message: String },
}

impl CrnStatus {
    /// Whether this status removes the course from the working set.
    /// `Full` flips to non-terminal when the caller opted into retrying
    /// full courses.
    pub fn is_terminal(&self, retry_full_courses: bool) -> bool {
        match self {
            CrnStatus::Success { .. }
            | CrnStatus::AlreadyEnrolled { .. }
            | CrnStatus::Conflict { .. }
            | CrnStatus::UpgradeConflict { .. }
            | CrnStatus::Dropped { .. } => true,
            CrnStatus::Full { .. } => !retry_full_courses,
            CrnStatus::Pending
            | CrnStatus::Debounce { .. }
            | CrnStatus::Error { .. } => false,
        }
    }

    /// Short label for log lines and the CLI table.
    pub fn label(&self) -> &'static str {
        match self {
            CrnStatus::Pending => "pending",
            CrnStatus::Success { .. } => "success",
            CrnStatus::AlreadyEnrolled { .. } => "already-enrolled",
            CrnStatus::Full { .. } => "full",
            CrnStatus::Conflict { .. } => "conflict",
            CrnStatus::UpgradeConflict { .. } => "upgrade-conflict",
            CrnStatus::Debounce { .. } => "debounce",
            CrnStatus::Error { .. } => "error",
            CrnStatus::Dropped { .. } => "dropped",
        }
    }
}

/// Cumulative per-course map broadcast with every `CrnUpdate` event.
/// BTreeMap keeps CRN order stable across snapshots and serializations.
pub type CourseMap = BTreeMap<String, CrnStatus>;

// ── Engine phase ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    TokenCheck,
    Calibrating,
    Waiting,
    Registering,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::TokenCheck => "token_check",
            Phase::Calibrating => "calibrating",
            Phase::Waiting => "waiting",
            Phase::Registering => "registering",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

// ── Calibration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    /// First measurement of the run.
    Initial,
    /// Periodic refinement during the waiting phase.
    Auto,
    /// The last measurement shortly before firing.
    Final,
    /// Reused from a previous run's history for the same token.
    Manual,
}

/// One aggregated measurement, broadcast after every calibration pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// SIS wall-clock minus local wall-clock, in milliseconds.
    pub server_offset_ms: f64,
    pub rtt_one_way_ms: f64,
    pub rtt_full_ms: f64,
    /// Informational only; never drives firing.
    pub ntp_offset_ms: Option<f64>,
    pub server_minus_ntp_ms: Option<f64>,
    pub accuracy_ms: f64,
    pub source: CalibrationSource,
    /// Seconds since the Unix epoch at which the measurement completed.
    pub measured_at: f64,
}

// ── Run outcome ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DoneReason {
    /// Every course reached a terminal state.
    Completed,
    /// The attempt budget ran out with courses still pending.
    AttemptsExhausted,
    Cancelled,
    TokenInvalid,
    /// A fatal error aborted the run; the message is secret-free.
    Failed { message: String },
}

// ── State snapshot ─────────────────────────────────────────────────────────

/// Point-in-time view of the engine, obtainable at any moment through
/// `Engine::snapshot`. Slow subscribers reconcile against this after a
/// dropped-event gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub phase: Phase,
    pub running: bool,
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub courses: CourseMap,
    pub last_calibration: Option<CalibrationResult>,
    /// Seconds until the trigger instant, while waiting.
    pub countdown_seconds: Option<f64>,
    /// Wall-clock equivalent of the trigger instant (epoch seconds).
    pub trigger_at: Option<f64>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        EngineSnapshot {
            phase: Phase::Idle,
            running: false,
            current_attempt: 0,
            max_attempts: 0,
            courses: BTreeMap::new(),
            last_calibration: None,
            countdown_seconds: None,
            trigger_at: None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EngineConfig {
        EngineConfig {
            token: Zeroizing::new("test-token-abc".into()),
            ecrns: vec!["24066".into()],
            ..EngineConfig::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn retry_floor_is_inclusive() {
        let mut cfg = valid_config();
        cfg.retry_interval = 3.0;
        assert!(cfg.validate().is_ok());
        cfg.retry_interval = 2.999;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn ecrn_count_cap() {
        let mut cfg = valid_config();
        cfg.ecrns = (0..12).map(|i| format!("{:05}", 24000 + i)).collect();
        assert!(cfg.validate().is_ok());
        cfg.ecrns.push("99999".into());
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_missing_token_and_empty_course_lists() {
        let mut cfg = valid_config();
        cfg.token = Zeroizing::new("   ".into());
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.ecrns.clear();
        assert!(cfg.validate().is_err());

        // drop-only runs are legal
        cfg.scrns = vec!["20150".into()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_crns() {
        let mut cfg = valid_config();
        cfg.ecrns = vec!["2406".into()];
        assert!(cfg.validate().is_err());
        cfg.ecrns = vec!["24o66".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn safety_buffer_bounds() {
        let mut cfg = valid_config();
        cfg.safety_buffer = 0.1;
        assert!(cfg.validate().is_ok());
        cfg.safety_buffer = 0.11;
        assert!(cfg.validate().is_err());
        cfg.safety_buffer = -0.001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn debug_output_redacts_token() {
        let cfg = valid_config();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("test-token-abc"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn token_fingerprint_is_stable_hex() {
        let cfg = valid_config();
        let fp = cfg.token_fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, valid_config().token_fingerprint());
        assert!(!fp.contains("test-token"));
    }

    #[test]
    fn full_terminality_follows_policy() {
        let full = CrnStatus::Full { code: "VAL06".into(), message: "Course quota is full".into() };
        assert!(full.is_terminal(false));
        assert!(!full.is_terminal(true));
        assert!(CrnStatus::Pending.is_terminal(false) == false);
        let success = CrnStatus::Success { code: "0".into(), message: "Registered".into() };
        assert!(success.is_terminal(true));
    }

    #[test]
    fn crn_status_roundtrips_through_json() {
        let statuses = vec![
            CrnStatus::Pending,
            CrnStatus::Success { code: "0".into(), message: "Registered".into() },
            CrnStatus::Debounce { code: "Debounce".into(), message: "Too soon".into() },
            CrnStatus::Error { code: "VAL99".into(), message: "Unknown".into() },
        ];
        for status in statuses {
            let json = serde_json::to_string(&status).unwrap();
            let back: CrnStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let mut snapshot = EngineSnapshot {
            phase: Phase::Waiting,
            running: true,
            current_attempt: 3,
            max_attempts: 30,
            countdown_seconds: Some(12.5),
            trigger_at: Some(1_726_000_000.25),
            ..EngineSnapshot::default()
        };
        snapshot.courses.insert(
            "24066".into(),
            CrnStatus::Success { code: "0".into(), message: "Registered".into() },
        );
        snapshot.last_calibration = Some(CalibrationResult {
            server_offset_ms: -2140.0,
            rtt_one_way_ms: 23.0,
            rtt_full_ms: 46.0,
            ntp_offset_ms: Some(1.5),
            server_minus_ntp_ms: Some(-2141.5),
            accuracy_ms: 23.0,
            source: CalibrationSource::Final,
            measured_at: 1_725_999_960.0,
        });
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: EngineSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
