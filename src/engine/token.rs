// engine/token.rs — Bearer-token validation.
//
// Two layers: a free local inspection of the JWT `exp` claim (advisory, the
// token may not even be a JWT), then an authenticated probe of the SIS. Only
// the SIS answer is authoritative; 401/403 aborts the run.

use crate::atoms::constants::{TOKEN_CHECK_PATH, TOKEN_CHECK_TIMEOUT};
use crate::atoms::error::{EngineError, EngineResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use log::{debug, warn};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;

/// Extract the `exp` claim (epoch seconds) from a JWT-shaped token.
/// Returns None for opaque tokens or malformed payloads.
pub fn jwt_expiry(token: &str) -> Option<i64> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    claims.get("exp")?.as_i64()
}

/// Log a warning when the token's embedded expiry already passed.
/// Advisory only: the SIS probe below remains the authority.
pub fn warn_if_expired(token: &str) {
    match jwt_expiry(token) {
        Some(exp) if exp < chrono::Utc::now().timestamp() => {
            warn!(
                "[token] Embedded expiry passed {}s ago; the SIS will likely reject it",
                chrono::Utc::now().timestamp() - exp
            );
        }
        Some(exp) => {
            debug!(
                "[token] Embedded expiry in {}s",
                exp - chrono::Utc::now().timestamp()
            );
        }
        None => debug!("[token] Token is not JWT-shaped; skipping local expiry check"),
    }
}

/// Authenticated probe of the SIS. 2xx means the token is usable; 401/403
/// means rejected. Every other failure is transport-level and surfaces as
/// `Unreachable` so the caller can distinguish "bad token" from "bad network".
pub async fn check_token(client: &Client, base_url: &str, token: &str) -> EngineResult<()> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), TOKEN_CHECK_PATH);
    let response = client
        .get(&url)
        .header(AUTHORIZATION, format!("Bearer {}", token))
        .timeout(TOKEN_CHECK_TIMEOUT)
        .send()
        .await
        .map_err(|e| EngineError::Unreachable(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(EngineError::TokenInvalid);
    }
    Err(EngineError::Unreachable(format!("token check returned HTTP {}", status.as_u16())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"student","exp":{}}}"#, exp));
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn extracts_exp_from_jwt() {
        assert_eq!(jwt_expiry(&jwt_with_exp(1_900_000_000)), Some(1_900_000_000));
    }

    #[test]
    fn opaque_tokens_have_no_expiry() {
        assert_eq!(jwt_expiry("not-a-jwt"), None);
        assert_eq!(jwt_expiry("a.%%%.c"), None);
        assert_eq!(jwt_expiry(""), None);
    }

    #[test]
    fn missing_exp_claim_is_none() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"student"}"#);
        let token = format!("{}.{}.sig", header, payload);
        assert_eq!(jwt_expiry(&token), None);
    }
}
