// ── Otokayit Engine: Clock Calibrator ──────────────────────────────────────
//
// Measures `server_offset = server_time − local_time` against the SIS by
// detecting the instant its `Date` header rolls over to a new second, and
// `rtt_one_way` as half of the round-trip of the sample that revealed the
// rollover. The Date header has whole-second resolution, so the rollover
// instant is the only sub-second feature the server exposes.
//
// Probe loop: lightweight HEAD requests every ~10 ms. Two adjacent samples
// whose server seconds differ by one bracket the transition inside
// (t_sent_first, t_recv_second); the server-side boundary is estimated as the
// local midpoint of that interval minus one one-way latency.
//
// Aggregation follows the best-sample-pool rule: among all candidates (and
// the per-token history of past runs) the one with the smallest full RTT
// wins; ties within 1 ms go to the newer sample.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CalibrationResult, CalibrationSource};
use crate::engine::state::CancelFlag;
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};

// ── Raw probe sample ───────────────────────────────────────────────────────

/// One HEAD round-trip. Wall-clock stamps are epoch milliseconds; the
/// monotonic stamps only order samples and measure RTT.
#[derive(Debug, Clone)]
pub(crate) struct ProbeSample {
    pub sent_instant: Instant,
    pub sent_wall_ms: f64,
    pub recv_wall_ms: f64,
    pub rtt: Duration,
    /// Whole seconds (epoch) parsed from the Date header.
    pub server_secs: i64,
}

/// One offset candidate derived from a detected second boundary.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OffsetCandidate {
    pub offset_ms: f64,
    pub rtt_full_ms: f64,
}

/// Derive an offset candidate from two adjacent samples, or None when no
/// second boundary lies between them.
pub(crate) fn offset_candidate(prev: &ProbeSample, next: &ProbeSample) -> Option<OffsetCandidate> {
    if next.server_secs != prev.server_secs + 1 {
        return None;
    }
    let rtt_full_ms = next.rtt.as_secs_f64() * 1000.0;
    let midpoint_ms = (prev.sent_wall_ms + next.recv_wall_ms) / 2.0;
    let boundary_local_ms = midpoint_ms - rtt_full_ms / 2.0;
    let offset_ms = next.server_secs as f64 * 1000.0 - boundary_local_ms;
    Some(OffsetCandidate { offset_ms, rtt_full_ms })
}

// ── Aggregated sample & per-token history ──────────────────────────────────

#[derive(Debug, Clone)]
pub struct CalSample {
    pub offset_ms: f64,
    pub rtt_full_ms: f64,
    pub measured_at: f64,
    pub source: CalibrationSource,
}

/// Pick the winner under the best-sample-pool rule.
fn better<'a>(a: &'a CalSample, b: &'a CalSample) -> &'a CalSample {
    if (a.rtt_full_ms - b.rtt_full_ms).abs() <= RTT_TIE_MS {
        // Tied on RTT: prefer the more recent measurement.
        if b.measured_at >= a.measured_at {
            b
        } else {
            a
        }
    } else if b.rtt_full_ms < a.rtt_full_ms {
        b
    } else {
        a
    }
}

/// Best samples per token fingerprint, bounded to the most recent
/// `CALIBRATION_HISTORY_CAP` entries. In-memory only; the credential itself
/// never touches this structure.
#[derive(Default)]
pub struct CalibrationHistory {
    entries: Mutex<HashMap<String, Vec<CalSample>>>,
}

impl CalibrationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, fingerprint: &str, sample: CalSample) {
        let mut entries = self.entries.lock();
        let pool = entries.entry(fingerprint.to_string()).or_default();
        pool.push(sample);
        if pool.len() > CALIBRATION_HISTORY_CAP {
            let excess = pool.len() - CALIBRATION_HISTORY_CAP;
            pool.drain(..excess);
        }
    }

    pub fn best(&self, fingerprint: &str) -> Option<CalSample> {
        let entries = self.entries.lock();
        let pool = entries.get(fingerprint)?;
        pool.iter().reduce(|a, b| better(a, b)).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self, fingerprint: &str) -> usize {
        self.entries.lock().get(fingerprint).map_or(0, Vec::len)
    }
}

// ── Calibrator ─────────────────────────────────────────────────────────────

pub struct Calibrator {
    client: Client,
    probe_url: String,
}

impl Calibrator {
    pub fn new(client: Client, base_url: &str) -> Self {
        let probe_url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            CALIBRATION_PROBE_PATH
        );
        Calibrator { client, probe_url }
    }

    /// One HEAD round-trip. Discards the sample when the wall clock ran
    /// backwards across it or the server sent no parseable Date header.
    async fn probe(&self) -> EngineResult<ProbeSample> {
        let sent_instant = Instant::now();
        let sent_wall_ms = epoch_ms();
        let response = self
            .client
            .head(&self.probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        let rtt = sent_instant.elapsed();
        let recv_wall_ms = epoch_ms();

        if recv_wall_ms < sent_wall_ms {
            return Err(EngineError::ClockRegression);
        }

        let date = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| EngineError::Other("SIS response carried no Date header".into()))?;
        let server_secs = chrono::DateTime::parse_from_rfc2822(date)
            .map_err(|e| EngineError::Other(format!("unparseable Date header: {}", e)))?
            .timestamp();

        Ok(ProbeSample { sent_instant, sent_wall_ms, recv_wall_ms, rtt, server_secs })
    }

    /// Run the probe loop until enough second boundaries were observed, then
    /// aggregate. Fails `NoSecondBoundary` when the budget passes without a
    /// single detected transition, `Unreachable` when not even one probe
    /// succeeded.
    pub async fn measure(
        &self,
        source: CalibrationSource,
        cancel: &CancelFlag,
    ) -> EngineResult<CalSample> {
        // Two transitions are enough to pick a low-RTT candidate; the hard
        // deadline keeps a flaky link from eating into the waiting phase.
        const TARGET_TRANSITIONS: usize = 2;

        let deadline = Instant::now() + CALIBRATION_BUDGET;
        let mut previous: Option<ProbeSample> = None;
        let mut candidates: Vec<OffsetCandidate> = Vec::new();
        let mut any_probe_ok = false;
        let mut last_error: Option<EngineError> = None;

        while Instant::now() < deadline && candidates.len() < TARGET_TRANSITIONS {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match self.probe().await {
                Ok(sample) => {
                    any_probe_ok = true;
                    if let Some(prev) = &previous {
                        // Ignore monotonic inversions between samples.
                        if sample.sent_instant > prev.sent_instant {
                            if let Some(candidate) = offset_candidate(prev, &sample) {
                                debug!(
                                    "[calibrate] Boundary: offset {:+.1} ms, rtt {:.1} ms",
                                    candidate.offset_ms, candidate.rtt_full_ms
                                );
                                candidates.push(candidate);
                            }
                        }
                    }
                    previous = Some(sample);
                }
                Err(EngineError::ClockRegression) => {
                    // Sample unusable; also invalidate the pairing so a
                    // stale `previous` cannot bracket a bogus transition.
                    previous = None;
                    last_error = Some(EngineError::ClockRegression);
                }
                Err(e) => {
                    previous = None;
                    last_error = Some(e);
                }
            }

            tokio::time::sleep(CALIBRATION_POLL_INTERVAL).await;
        }

        if candidates.is_empty() {
            return Err(if any_probe_ok {
                EngineError::NoSecondBoundary
            } else {
                last_error.unwrap_or(EngineError::NoSecondBoundary)
            });
        }

        let now = epoch_ms() / 1000.0;
        let best = candidates
            .iter()
            .map(|c| CalSample {
                offset_ms: c.offset_ms,
                rtt_full_ms: c.rtt_full_ms,
                measured_at: now,
                source,
            })
            .reduce(|a, b| better(&a, &b).clone())
            .expect("candidates is non-empty");

        info!(
            "[calibrate] {:?}: offset {:+.1} ms, rtt {:.1} ms ({} transitions)",
            source,
            best.offset_ms,
            best.rtt_full_ms,
            candidates.len()
        );
        Ok(best)
    }

    /// Measure, fold into the per-token history, and return the pool-wide
    /// best as a broadcastable result. When no boundary is found and
    /// `allow_history_fallback` is set, a previous run's best sample is
    /// reused with `source = Manual`.
    pub async fn calibrate(
        &self,
        history: &CalibrationHistory,
        fingerprint: &str,
        source: CalibrationSource,
        cancel: &CancelFlag,
        allow_history_fallback: bool,
    ) -> EngineResult<CalibrationResult> {
        let measured = self.measure(source, cancel).await;
        let sample = match measured {
            Ok(sample) => {
                history.record(fingerprint, sample);
                history.best(fingerprint).expect("history has the sample just recorded")
            }
            Err(EngineError::NoSecondBoundary) if allow_history_fallback => {
                let mut fallback = history
                    .best(fingerprint)
                    .ok_or(EngineError::NoSecondBoundary)?;
                warn!("[calibrate] No second boundary; reusing best historical sample");
                fallback.source = CalibrationSource::Manual;
                fallback
            }
            Err(e) => return Err(e),
        };

        // Informational drift comparison; only worth the UDP round-trip on
        // the measurements an operator actually looks at.
        let ntp_offset_ms = match sample.source {
            CalibrationSource::Initial | CalibrationSource::Final => sntp_offset_ms().await,
            _ => None,
        };

        Ok(build_result(&sample, ntp_offset_ms))
    }
}

fn build_result(sample: &CalSample, ntp_offset_ms: Option<f64>) -> CalibrationResult {
    CalibrationResult {
        server_offset_ms: sample.offset_ms,
        rtt_one_way_ms: sample.rtt_full_ms / 2.0,
        rtt_full_ms: sample.rtt_full_ms,
        ntp_offset_ms,
        server_minus_ntp_ms: ntp_offset_ms.map(|ntp| sample.offset_ms - ntp),
        accuracy_ms: sample.rtt_full_ms / 2.0,
        source: sample.source,
        measured_at: sample.measured_at,
    }
}

fn epoch_ms() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1000.0
}

// ── SNTP comparison probe ──────────────────────────────────────────────────
// Single unauthenticated SNTP exchange. Failure of any kind yields None;
// the field is informational and must never delay or drive firing.

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

async fn sntp_offset_ms() -> Option<f64> {
    let exchange = async {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(NTP_HOST).await.ok()?;

        // 48-byte client request: LI=0, VN=4, Mode=3 (client).
        let mut packet = [0u8; 48];
        packet[0] = 0x23;
        socket.send(&packet).await.ok()?;

        let mut reply = [0u8; 48];
        let n = socket.recv(&mut reply).await.ok()?;
        let local_ms = epoch_ms();
        if n < 48 {
            return None;
        }

        // Transmit timestamp: seconds since 1900 + binary fraction.
        let secs = u32::from_be_bytes(reply[40..44].try_into().ok()?) as u64;
        let frac = u32::from_be_bytes(reply[44..48].try_into().ok()?) as f64 / (1u64 << 32) as f64;
        let ntp_ms = (secs.checked_sub(NTP_UNIX_DELTA)? as f64 + frac) * 1000.0;
        Some(ntp_ms - local_ms)
    };

    match tokio::time::timeout(NTP_TIMEOUT, exchange).await {
        Ok(Some(offset)) => {
            debug!("[calibrate] NTP offset {:+.1} ms (informational)", offset);
            Some(offset)
        }
        _ => None,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
