// ── Otokayit Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

use std::time::Duration;

// ── SIS endpoints ──────────────────────────────────────────────────────────
// The registration endpoint is versioned server-side; bumping the version
// here without checking the wire shape in `engine/classify.rs` will break
// result parsing. Treat the pair as one unit.
pub const SIS_BASE_URL: &str = "https://kepler-beta.itu.edu.tr";
pub const REGISTER_PATH: &str = "/api/ders-kayit/v21";
pub const TOKEN_CHECK_PATH: &str = "/api/auth/jwt";

/// Calibration probes target the SIS root: unauthenticated, minimal payload,
/// and served by the same front-end that stamps the `Date` header on the
/// registration endpoint.
pub const CALIBRATION_PROBE_PATH: &str = "/";

/// Civil zone of the SIS. Target times are times-of-day in this zone.
pub const SIS_ZONE: chrono_tz::Tz = chrono_tz::Europe::Istanbul;

// ── Configuration bounds ───────────────────────────────────────────────────
// The server debounces a second request from the same session arriving
// within ~3 s of the first. Anything below this floor converts retries
// into guaranteed rejections, so it is enforced at configuration time.
pub const MIN_RETRY_INTERVAL_SECS: f64 = 3.0;

/// Cap for adaptive back-off after HTTP 429.
pub const MAX_RETRY_INTERVAL_SECS: f64 = 30.0;

pub const MAX_ATTEMPTS: u32 = 300;
pub const MAX_ECRN_COUNT: usize = 12;
pub const MAX_SAFETY_BUFFER_SECS: f64 = 0.1;
pub const CRN_LEN: usize = 5;

// ── Calibration timing ─────────────────────────────────────────────────────
// Probe pacing must complete well under one server second so that a Date
// rollover is always bracketed by two adjacent samples.
pub const CALIBRATION_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const CALIBRATION_BUDGET: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Recalibration cadence while the engine waits for the target moment.
pub const RECALIBRATION_PERIOD: Duration = Duration::from_secs(30);

/// Lead time of the last calibration before firing. Late enough to catch
/// drift, early enough that a slow probe cannot collide with the trigger.
pub const FINAL_CALIBRATION_LEAD: Duration = Duration::from_secs(40);

/// Best-sample history kept per token hash.
pub const CALIBRATION_HISTORY_CAP: usize = 20;

/// Two RTTs within this margin are considered tied; the newer sample wins.
pub const RTT_TIE_MS: f64 = 1.0;

// ── Firing window ──────────────────────────────────────────────────────────
pub const COARSE_SLICE: Duration = Duration::from_millis(100);
pub const BUSY_WAIT_WINDOW: Duration = Duration::from_millis(50);

// ── Attempt loop ───────────────────────────────────────────────────────────
pub const TOKEN_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// While the SIS still reports the registration period closed, the first few
/// attempts may pace at a fraction of the measured round trip instead of the
/// debounce floor. Strictly bounded: the exception exists only to absorb a
/// calibration underestimate.
pub const BURST_MAX_ATTEMPTS: u32 = 5;
pub const BURST_RTT_FACTOR: f64 = 0.8;

// ── NTP comparison (informational only) ────────────────────────────────────
// The SIS clock is known to drift seconds behind UTC; NTP never drives
// firing. The probe exists so operators can see the drift in calibration
// events.
pub const NTP_HOST: &str = "pool.ntp.org:123";
pub const NTP_TIMEOUT: Duration = Duration::from_secs(2);
