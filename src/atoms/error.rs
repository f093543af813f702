// ── Otokayit Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (Config, Credential, Transport…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • The attempt loop switches on `is_fatal()` to separate errors that abort
//     the run from errors that merely consume one attempt slot.
//   • No variant carries secret material (bearer tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The SIS rejected the bearer token (401/403).
    #[error("Bearer token rejected by the SIS")]
    TokenInvalid,

    /// The token's embedded expiry lies in the past. Advisory: the SIS
    /// response is the authoritative source, so this never aborts on its own.
    #[error("Bearer token appears expired")]
    TokenExpired,

    /// The SIS host could not be reached at all.
    #[error("SIS unreachable: {0}")]
    Unreachable(String),

    /// The SIS asked us to slow down (HTTP 429).
    #[error("Rate limited by the SIS")]
    RateLimited,

    /// No Date-header second boundary was observed within the budget.
    #[error("Calibration found no second boundary within the measurement budget")]
    NoSecondBoundary,

    /// A probe's receive time preceded its send time; the sample is unusable.
    #[error("Local clock regressed during calibration")]
    ClockRegression,

    /// The SIS rejected the whole request rather than individual courses.
    #[error("Request rejected wholesale: {0}")]
    WholesaleReject(String),

    /// A run is already in progress.
    #[error("A registration run is already in progress")]
    AlreadyRunning,

    /// No run is in progress.
    #[error("No registration run is in progress")]
    NotRunning,

    /// Reset was requested mid-run.
    #[error("Cannot reset while a run is in progress")]
    StillRunning,

    /// The run was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// The attempt budget ran out before every course converged.
    #[error("All {0} attempts exhausted without full success")]
    AttemptsExhausted(u32),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Errors that must abort the run immediately. Everything else consumes
    /// one attempt slot (or one calibration probe) and is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_)
                | EngineError::TokenInvalid
                | EngineError::WholesaleReject(_)
                | EngineError::Cancelled
                | EngineError::AlreadyRunning
                | EngineError::NotRunning
                | EngineError::StillRunning
        )
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ──────────────────────────────────────
// Lets façade boundaries returning `Result<T, String>` call
// `.map_err(EngineError::into)` directly.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
