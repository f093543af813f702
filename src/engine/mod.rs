// Otokayit Registration Engine — millisecond-accurate course registration
// against the ITU student information system. Calibrates the SIS clock off
// its Date header, fires the pre-built add/drop request one one-way latency
// before the window opens, and retries under the server's debounce rules.

pub mod attempt;
pub mod calibrate;
pub mod classify;
pub mod events;
pub mod http;
pub mod request;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod token;

pub use events::{EngineEvent, EventStream, LogLevel};
pub use runner::Engine;
