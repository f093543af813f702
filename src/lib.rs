// Otokayit — automated course registration for the ITU SIS.
// The crate is the Registration Engine; the CLI in crates/otokayit-cli is a
// thin wrapper around `Engine`.

// ── Otokayit Atoms (constants, error types, shared types) ──────────────────
pub mod atoms;

// ── Otokayit Registration Engine ───────────────────────────────────────────
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    CalibrationResult, CalibrationSource, CourseMap, CrnStatus, DoneReason, EngineConfig,
    EngineSnapshot, Phase,
};
pub use engine::{Engine, EngineEvent, EventStream, LogLevel};
