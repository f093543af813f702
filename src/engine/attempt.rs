// ── Otokayit Engine: Attempt Loop ──────────────────────────────────────────
//
// Executes registration attempts under the server's debounce rules until
// every course reaches a terminal state or the attempt budget runs out.
//
// Pacing invariants:
//   • Send-to-send spacing is at least the configured retry interval,
//     measured from each request's send time.
//   • Exception: while the SIS reports the window not yet open, the first
//     few attempts may pace at 0.8 × the measured round trip. This only
//     absorbs a calibration underestimate; it never applies once the window
//     opened.
//   • HTTP 429 doubles the pause per consecutive occurrence, up to the cap.
//
// Terminal courses are pruned from the working set and the request body is
// re-serialized; a CRN that reached a terminal state is never sent again.

use crate::atoms::constants::{ATTEMPT_TIMEOUT, BURST_MAX_ATTEMPTS, BURST_RTT_FACTOR, COARSE_SLICE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CourseMap, EngineConfig};
use crate::engine::classify::{classify_add, classify_drop, reply_kind, RegistrationReply, ReplyKind};
use crate::engine::events::{EventBus, LogLevel};
use crate::engine::http::{parse_retry_after, rate_limit_backoff};
use crate::engine::request::PrebuiltRequest;
use crate::engine::state::{CancelFlag, SharedState};
use log::{debug, warn};
use reqwest::Client;
use std::time::{Duration, Instant};

/// Book-keeping for one fired request. Summarized into the per-course map;
/// kept on the outcome for post-run inspection.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_index: u32,
    pub sent_at: Instant,
    pub received_at: Instant,
    /// None when the request failed below HTTP (connect, timeout).
    pub http_status: Option<u16>,
}

pub struct AttemptOutcome {
    pub courses: CourseMap,
    pub attempts_used: u32,
    pub records: Vec<AttemptRecord>,
    /// True when the working set emptied before the budget did.
    pub fully_resolved: bool,
}

/// What the last attempt told us, reduced to its pacing consequence.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AttemptVerdict {
    /// Normal per-course reply (or a transport error): standard interval.
    Paced,
    /// The registration window has not opened: burst-eligible.
    WindowNotOpen { rtt_full_ms: f64 },
    /// HTTP 429 with an optional server-sent delay.
    RateLimited { retry_after: Option<u64> },
}

/// Compute the pause between this attempt's send time and the next send.
fn next_pause(
    verdict: AttemptVerdict,
    attempt: u32,
    retry_interval: f64,
    consecutive_429s: u32,
) -> Duration {
    match verdict {
        AttemptVerdict::WindowNotOpen { rtt_full_ms } if attempt <= BURST_MAX_ATTEMPTS => {
            Duration::from_secs_f64(rtt_full_ms * BURST_RTT_FACTOR / 1000.0)
        }
        // Burst budget spent: fall back to the debounce floor.
        AttemptVerdict::WindowNotOpen { .. } | AttemptVerdict::Paced => {
            Duration::from_secs_f64(retry_interval)
        }
        AttemptVerdict::RateLimited { retry_after } => {
            rate_limit_backoff(retry_interval, consecutive_429s, retry_after)
        }
    }
}

/// Drive attempts to convergence. `rtt_full_ms` comes from the final
/// calibration and parameterizes burst pacing.
pub async fn run(
    client: &Client,
    request: &mut PrebuiltRequest,
    config: &EngineConfig,
    state: &SharedState,
    bus: &EventBus,
    cancel: &CancelFlag,
    rtt_full_ms: f64,
) -> EngineResult<AttemptOutcome> {
    let mut courses = state.courses();
    let mut working_ecrns: Vec<String> = config.ecrns.clone();
    let mut working_scrns: Vec<String> = config.scrns.clone();
    let mut attempts_used = 0u32;
    let mut consecutive_429s = 0u32;
    let mut records: Vec<AttemptRecord> = Vec::new();

    if config.dry_run {
        bus.log(
            LogLevel::Info,
            format!(
                "Dry run: would fire {} add / {} drop request(s) now",
                working_ecrns.len(),
                working_scrns.len()
            ),
        );
        return Ok(AttemptOutcome {
            courses,
            attempts_used: 0,
            records,
            fully_resolved: true,
        });
    }

    while attempts_used < config.max_attempts
        && !(working_ecrns.is_empty() && working_scrns.is_empty())
    {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        attempts_used += 1;
        state.set_attempt(attempts_used);
        request.set_working_set(&working_ecrns, &working_scrns);

        let sent_at = Instant::now();
        debug!(
            "[attempt] #{}/{}: {} add, {} drop",
            attempts_used,
            config.max_attempts,
            working_ecrns.len(),
            working_scrns.len()
        );

        let send_result = client
            .post(request.url.clone())
            .headers(request.headers().clone())
            .body(request.body_bytes())
            .timeout(ATTEMPT_TIMEOUT)
            .send()
            .await;

        records.push(AttemptRecord {
            attempt_index: attempts_used,
            sent_at,
            received_at: Instant::now(),
            http_status: send_result.as_ref().ok().map(|r| r.status().as_u16()),
        });

        let verdict = match send_result {
            Err(e) => {
                consecutive_429s = 0;
                bus.log(
                    LogLevel::Warning,
                    format!("Attempt {} failed in transport: {}", attempts_used, e),
                );
                AttemptVerdict::Paced
            }
            Ok(response) => {
                let status = response.status().as_u16();
                match status {
                    401 | 403 => return Err(EngineError::TokenInvalid),
                    429 => {
                        consecutive_429s += 1;
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(parse_retry_after);
                        bus.log(
                            LogLevel::Warning,
                            format!("SIS rate-limited attempt {}; backing off", attempts_used),
                        );
                        AttemptVerdict::RateLimited { retry_after }
                    }
                    _ if !(200..300).contains(&status) => {
                        consecutive_429s = 0;
                        bus.log(
                            LogLevel::Warning,
                            format!("Attempt {} returned HTTP {}", attempts_used, status),
                        );
                        AttemptVerdict::Paced
                    }
                    _ => {
                        consecutive_429s = 0;
                        match response.json::<RegistrationReply>().await {
                            Err(e) => {
                                bus.log(
                                    LogLevel::Warning,
                                    format!("Unparseable reply on attempt {}: {}", attempts_used, e),
                                );
                                AttemptVerdict::Paced
                            }
                            Ok(reply) => match reply_kind(&reply) {
                                ReplyKind::Rejected(code) => {
                                    return Err(EngineError::WholesaleReject(code));
                                }
                                kind => {
                                    apply_reply(&reply, &mut courses);
                                    state.update_courses(bus, courses.clone());
                                    prune_terminal(
                                        &courses,
                                        &mut working_ecrns,
                                        &mut working_scrns,
                                        config.retry_full_courses,
                                    );
                                    match kind {
                                        ReplyKind::WindowClosed => {
                                            AttemptVerdict::WindowNotOpen { rtt_full_ms }
                                        }
                                        // Session debounce backs off a full
                                        // interval from this send, same as
                                        // the normal pace.
                                        _ => AttemptVerdict::Paced,
                                    }
                                }
                            },
                        }
                    }
                }
            }
        };

        if working_ecrns.is_empty() && working_scrns.is_empty() {
            break;
        }
        if attempts_used >= config.max_attempts {
            break;
        }

        let pause = next_pause(verdict, attempts_used, config.retry_interval, consecutive_429s);
        sleep_from(sent_at, pause, cancel).await?;
    }

    let fully_resolved = working_ecrns.is_empty() && working_scrns.is_empty();
    if !fully_resolved {
        warn!(
            "[attempt] Budget exhausted with {} course(s) unresolved",
            working_ecrns.len() + working_scrns.len()
        );
    }
    Ok(AttemptOutcome { courses, attempts_used, records, fully_resolved })
}

/// Fold a reply's per-course entries into the cumulative map. Entries for
/// CRNs we never asked about are ignored.
fn apply_reply(reply: &RegistrationReply, courses: &mut CourseMap) {
    for entry in &reply.ecrn_result_list {
        if courses.contains_key(&entry.crn) {
            courses.insert(entry.crn.clone(), classify_add(entry));
        }
    }
    for entry in &reply.scrn_result_list {
        if courses.contains_key(&entry.crn) {
            courses.insert(entry.crn.clone(), classify_drop(entry));
        }
    }
}

fn prune_terminal(
    courses: &CourseMap,
    working_ecrns: &mut Vec<String>,
    working_scrns: &mut Vec<String>,
    retry_full_courses: bool,
) {
    working_ecrns.retain(|crn| {
        courses
            .get(crn)
            .map_or(true, |status| !status.is_terminal(retry_full_courses))
    });
    working_scrns.retain(|crn| {
        courses
            .get(crn)
            .map_or(true, |status| !status.is_terminal(retry_full_courses))
    });
}

/// Sleep until `sent_at + pause` in cancellable slices. The pause anchors on
/// the send time, so response latency never stretches the pacing.
async fn sleep_from(sent_at: Instant, pause: Duration, cancel: &CancelFlag) -> EngineResult<()> {
    let wake_at = sent_at + pause;
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let remaining = wake_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        tokio::time::sleep(remaining.min(COARSE_SLICE)).await;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::CrnStatus;
    use crate::engine::classify::CourseResult;

    #[test]
    fn normal_pacing_uses_retry_interval() {
        let pause = next_pause(AttemptVerdict::Paced, 1, 3.0, 0);
        assert_eq!(pause, Duration::from_secs_f64(3.0));
    }

    #[test]
    fn burst_applies_only_while_window_closed_and_early() {
        let closed = AttemptVerdict::WindowNotOpen { rtt_full_ms: 50.0 };
        // first five attempts: 0.8 × rtt
        for attempt in 1..=BURST_MAX_ATTEMPTS {
            assert_eq!(next_pause(closed, attempt, 3.0, 0), Duration::from_secs_f64(0.04));
        }
        // sixth attempt: back to the floor
        assert_eq!(
            next_pause(closed, BURST_MAX_ATTEMPTS + 1, 3.0, 0),
            Duration::from_secs_f64(3.0)
        );
        // open window never bursts, regardless of attempt index
        assert_eq!(next_pause(AttemptVerdict::Paced, 1, 3.0, 0), Duration::from_secs_f64(3.0));
    }

    #[test]
    fn rate_limit_pacing_doubles_with_consecutive_429s() {
        let limited = AttemptVerdict::RateLimited { retry_after: None };
        assert_eq!(next_pause(limited, 1, 3.0, 1), Duration::from_secs_f64(6.0));
        assert_eq!(next_pause(limited, 2, 3.0, 2), Duration::from_secs_f64(12.0));
        assert_eq!(next_pause(limited, 3, 3.0, 5), Duration::from_secs_f64(30.0));
    }

    fn entry(crn: &str, result: Option<&str>, status: i64) -> CourseResult {
        CourseResult {
            crn: crn.into(),
            status_code: Some(status),
            result_code: result.map(str::to_string),
        }
    }

    #[test]
    fn terminal_courses_leave_the_working_set() {
        let mut courses = CourseMap::new();
        courses.insert("24066".into(), CrnStatus::Pending);
        courses.insert("24067".into(), CrnStatus::Pending);
        courses.insert("20150".into(), CrnStatus::Pending);

        let reply = RegistrationReply {
            status_code: Some(0),
            ecrn_result_list: vec![
                entry("24066", Some("0"), 0),
                entry("24067", Some("Full"), 1),
            ],
            scrn_result_list: vec![entry("20150", None, 0)],
        };
        apply_reply(&reply, &mut courses);

        let mut ecrns = vec!["24066".to_string(), "24067".to_string()];
        let mut scrns = vec!["20150".to_string()];
        prune_terminal(&courses, &mut ecrns, &mut scrns, false);
        assert!(ecrns.is_empty());
        assert!(scrns.is_empty());

        // retry-full policy keeps the full course in play
        let mut ecrns = vec!["24066".to_string(), "24067".to_string()];
        let mut scrns = vec![];
        prune_terminal(&courses, &mut ecrns, &mut scrns, true);
        assert_eq!(ecrns, vec!["24067".to_string()]);
    }

    #[test]
    fn unknown_crns_in_reply_are_ignored() {
        let mut courses = CourseMap::new();
        courses.insert("24066".into(), CrnStatus::Pending);
        let reply = RegistrationReply {
            status_code: Some(0),
            ecrn_result_list: vec![entry("99999", Some("0"), 0)],
            scrn_result_list: vec![],
        };
        apply_reply(&reply, &mut courses);
        assert_eq!(courses.len(), 1);
        assert_eq!(courses["24066"], CrnStatus::Pending);
    }

    #[tokio::test]
    async fn sleep_from_anchors_on_send_time() {
        let cancel = CancelFlag::new();
        // Simulate 80 ms of response latency: the pause is measured from
        // the send instant, so only ~40 ms of real sleeping remains.
        let sent_at = Instant::now() - Duration::from_millis(80);
        let started = Instant::now();
        sleep_from(sent_at, Duration::from_millis(120), &cancel).await.unwrap();
        let slept = started.elapsed();
        assert!(slept >= Duration::from_millis(30), "slept {:?}", slept);
        assert!(slept < Duration::from_millis(110), "slept {:?}", slept);
    }

    #[tokio::test]
    async fn sleep_from_cancels_mid_pause() {
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            flag.cancel();
        });
        let started = Instant::now();
        let result = sleep_from(Instant::now(), Duration::from_secs(10), &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
