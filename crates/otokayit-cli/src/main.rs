// Otokayit CLI — thin wrapper around the Registration Engine.
//
// Exit codes:
//   0  every course reached a terminal state
//   1  transport or internal failure
//   2  configuration error
//   3  the SIS rejected the bearer token
//   4  cancelled (Ctrl-C)
//   5  attempt budget exhausted with courses unresolved

use clap::{CommandFactory, Parser, Subcommand};
use otokayit::atoms::constants::SIS_BASE_URL;
use otokayit::engine::calibrate::{CalibrationHistory, Calibrator};
use otokayit::engine::http::pinned_client;
use otokayit::engine::state::CancelFlag;
use otokayit::engine::token;
use otokayit::{
    CalibrationSource, CrnStatus, DoneReason, Engine, EngineConfig, EngineError, EngineEvent,
    LogLevel,
};
use std::process::ExitCode;
use tokio_stream::StreamExt;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "otokayit", version, about = "Timed course registration for the ITU SIS")]
struct Cli {
    /// SIS base URL (override for test servers)
    #[arg(long, global = true, default_value = SIS_BASE_URL)]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate, wait for the target moment, and register
    Run(RunArgs),
    /// Measure the SIS clock offset and print it
    Calibrate(TokenArg),
    /// Check whether the SIS accepts the bearer token
    TestToken(TokenArg),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct TokenArg {
    /// Bearer token for the SIS (prefer the environment variable)
    #[arg(long, env = "OTOKAYIT_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(clap::Args)]
struct RunArgs {
    #[command(flatten)]
    auth: TokenArg,

    /// Course reference number to add (repeatable, at most 12)
    #[arg(long = "ecrn", value_name = "CRN")]
    ecrns: Vec<String>,

    /// Course reference number to drop (repeatable)
    #[arg(long = "scrn", value_name = "CRN")]
    scrns: Vec<String>,

    /// Target time-of-day in the SIS zone, HH:MM or HH:MM:SS
    #[arg(long, value_name = "TIME")]
    time: String,

    /// Maximum number of registration attempts
    #[arg(long, default_value_t = 30)]
    max_attempts: u32,

    /// Seconds between attempts (floor 3.0, the server debounce)
    #[arg(long, default_value_t = 3.0)]
    retry_interval: f64,

    /// Milliseconds added past the window opening to avoid early arrival
    #[arg(long, default_value_t = 5.0)]
    buffer_ms: f64,

    /// Go through the full schedule without contacting the SIS
    #[arg(long)]
    dry_run: bool,

    /// Keep retrying courses whose quota is reported full
    #[arg(long)]
    retry_full: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(cli.base_url, args).await,
        Command::Calibrate(auth) => calibrate(cli.base_url, auth).await,
        Command::TestToken(auth) => test_token(cli.base_url, auth).await,
        Command::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "otokayit",
                &mut std::io::stdout(),
            );
            ExitCode::SUCCESS
        }
    }
}

fn parse_time(raw: &str) -> Result<chrono::NaiveTime, EngineError> {
    chrono::NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| chrono::NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| EngineError::config(format!("invalid target time '{}'", raw)))
}

async fn run(base_url: String, args: RunArgs) -> ExitCode {
    let target_time = match parse_time(&args.time) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    let config = EngineConfig {
        token: Zeroizing::new(args.auth.token),
        ecrns: args.ecrns,
        scrns: args.scrns,
        target_time,
        max_attempts: args.max_attempts,
        retry_interval: args.retry_interval,
        safety_buffer: args.buffer_ms / 1000.0,
        dry_run: args.dry_run,
        retry_full_courses: args.retry_full,
        base_url,
        ..EngineConfig::default()
    };

    let engine = Engine::new();
    if let Err(e) = engine.configure(config) {
        eprintln!("error: {}", e);
        return ExitCode::from(2);
    }

    // Subscribe before starting so the token-check events are not missed.
    let mut events = engine.subscribe();
    if let Err(e) = engine.start() {
        eprintln!("error: {}", e);
        return ExitCode::from(2);
    }

    // Ctrl-C maps to a cancel request; the engine still emits Done.
    {
        let cancel_engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = cancel_engine.cancel();
            }
        });
    }
    let mut last_whole_second = u64::MAX;
    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            // Lagged: reconcile from the snapshot and keep streaming.
            Err(_) => {
                let snap = engine.snapshot();
                println!("… resynced at phase {} (attempt {})", snap.phase, snap.current_attempt);
                continue;
            }
        };
        match event {
            EngineEvent::Log { level, message, .. } => {
                let tag = match level {
                    LogLevel::Info => "info",
                    LogLevel::Warning => "warn",
                    LogLevel::Error => "error",
                };
                println!("[{}] {}", tag, message);
            }
            EngineEvent::State { phase, .. } => println!("phase: {}", phase),
            EngineEvent::Countdown { seconds_remaining, .. } => {
                // One line per whole second is plenty for a terminal.
                let whole = seconds_remaining as u64;
                if whole != last_whole_second {
                    last_whole_second = whole;
                    println!("T-{:>5}s", whole);
                }
            }
            EngineEvent::Calibration { result, .. } => println!(
                "calibration: offset {:+.1} ms, rtt {:.1} ms (±{:.1} ms)",
                result.server_offset_ms, result.rtt_full_ms, result.accuracy_ms
            ),
            EngineEvent::CrnUpdate { courses, .. } => {
                for (crn, status) in &courses {
                    println!("  {} → {}", crn, render_status(status));
                }
            }
            EngineEvent::Done { courses, reason, .. } => {
                println!("done:");
                for (crn, status) in &courses {
                    println!("  {} → {}", crn, render_status(status));
                }
                return match reason {
                    DoneReason::Completed => ExitCode::SUCCESS,
                    DoneReason::AttemptsExhausted => ExitCode::from(5),
                    DoneReason::Cancelled => ExitCode::from(4),
                    DoneReason::TokenInvalid => ExitCode::from(3),
                    DoneReason::Failed { .. } => ExitCode::FAILURE,
                };
            }
        }
    }
    // Stream ended without a Done event: engine dropped unexpectedly.
    ExitCode::FAILURE
}

fn render_status(status: &CrnStatus) -> String {
    match status {
        CrnStatus::Pending => "pending".to_string(),
        CrnStatus::Success { message, .. }
        | CrnStatus::AlreadyEnrolled { message, .. }
        | CrnStatus::Full { message, .. }
        | CrnStatus::Conflict { message, .. }
        | CrnStatus::UpgradeConflict { message, .. }
        | CrnStatus::Debounce { message, .. }
        | CrnStatus::Error { message, .. }
        | CrnStatus::Dropped { message, .. } => {
            format!("{} ({})", status.label(), message)
        }
    }
}

async fn calibrate(base_url: String, auth: TokenArg) -> ExitCode {
    let token = Zeroizing::new(auth.token);
    let calibrator = Calibrator::new(pinned_client(), &base_url);
    let history = CalibrationHistory::new();
    let fingerprint = otokayit::atoms::types::token_fingerprint(&token);
    match calibrator
        .calibrate(&history, &fingerprint, CalibrationSource::Initial, &CancelFlag::new(), false)
        .await
    {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result).expect("calibration serializes"));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn test_token(base_url: String, auth: TokenArg) -> ExitCode {
    let token = Zeroizing::new(auth.token);
    token::warn_if_expired(&token);
    match token::check_token(&pinned_client(), &base_url, &token).await {
        Ok(()) => {
            println!("token accepted");
            ExitCode::SUCCESS
        }
        Err(EngineError::TokenInvalid) => {
            eprintln!("token rejected by the SIS");
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_parsing_accepts_both_precisions() {
        assert_eq!(
            parse_time("14:00").unwrap(),
            chrono::NaiveTime::from_hms_opt(14, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time("08:30:15").unwrap(),
            chrono::NaiveTime::from_hms_opt(8, 30, 15).unwrap()
        );
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("noon").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
