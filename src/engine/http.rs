// ── Otokayit Engine: HTTP Client & Back-off Helpers ────────────────────────
//
// Shared HTTP plumbing for the calibrator, token check, and attempt loop.
//
// Features:
//   • Certificate-pinned reqwest::Client (webpki roots only, shared pool)
//   • Connection pre-warm so the first fired request reuses a live socket
//   • Retryable-status detection and `Retry-After` parsing
//   • Adaptive back-off computation for HTTP 429 responses

use crate::atoms::constants::{MAX_RETRY_INTERVAL_SECS, PROBE_TIMEOUT};
use log::{debug, info};
use reqwest::Client;
use rustls::ClientConfig;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

// ── Certificate-pinned client factory ──────────────────────────────────────
//
// Builds a `reqwest::Client` that uses a custom `rustls::ClientConfig` with
// only the Mozilla root certificates. The SIS host is resolved through the
// same root store, so a CA installed on the user's OS cannot MITM the
// registration traffic. One client means one connection pool shared by the
// calibrator, the token check, and the attempt loop, so the fired request
// rides a socket the calibrator already opened.

/// Build a `rustls::ClientConfig` pinned to the Mozilla root certificates.
///
/// Uses an explicit `ring` CryptoProvider rather than the process-level
/// default so the config works reliably in unit-test binaries where no
/// global provider has been installed.
fn pinned_tls_config() -> ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("Failed to set default TLS protocol versions")
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// A singleton certificate-pinned `reqwest::Client` for all SIS traffic.
/// Per-request deadlines are set at the call sites; only the connect
/// timeout lives on the client.
static PINNED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    let tls = pinned_tls_config();
    Client::builder()
        .use_preconfigured_tls(tls)
        .connect_timeout(Duration::from_secs(5))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(120))
        .build()
        .expect("Failed to build certificate-pinned reqwest::Client")
});

/// Get the shared certificate-pinned HTTP client.
/// Engine code should call this instead of `Client::builder().build()`.
pub fn pinned_client() -> Client {
    PINNED_CLIENT.clone()
}

/// Open (or refresh) a keep-alive connection to the SIS host so the first
/// registration request does not pay TCP+TLS setup. Failure is logged and
/// ignored: the attempt loop works on a cold socket too, just slower.
pub async fn prewarm(client: &Client, base_url: &str) {
    match client
        .head(base_url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => debug!("[http] Pre-warmed connection to SIS ({})", resp.status()),
        Err(e) => info!("[http] Connection pre-warm failed (continuing cold): {}", e),
    }
}

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
/// 401/403 are deliberately absent: a rejected token aborts the run.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

// ── Retry-After header parsing ─────────────────────────────────────────────

/// Parse a Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented; falls back to computed back-off.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

// ── Adaptive back-off ──────────────────────────────────────────────────────

/// Compute the pause after a rate-limited attempt: the configured retry
/// interval doubled per consecutive 429, honoring a server-sent
/// `Retry-After`, capped at `MAX_RETRY_INTERVAL_SECS`. The caller sleeps;
/// this function only does arithmetic so it stays trivially testable.
pub fn rate_limit_backoff(
    retry_interval: f64,
    consecutive_429s: u32,
    retry_after_secs: Option<u64>,
) -> Duration {
    let doubled = retry_interval * 2f64.powi(consecutive_429s.min(8) as i32);
    let computed = doubled.min(MAX_RETRY_INTERVAL_SECS);
    let secs = match retry_after_secs {
        Some(server) => (server as f64).clamp(computed, MAX_RETRY_INTERVAL_SECS),
        None => computed,
    };
    Duration::from_secs_f64(secs)
}

// ── Tests ──────────────────────────────────────────────────────────────────
