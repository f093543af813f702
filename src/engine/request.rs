// engine/request.rs — Pre-built registration request.
//
// The firing path must do nothing but socket writes, so everything that can
// be computed ahead of time is: the resolved URL, the assembled header map
// (bearer credential marked sensitive), and the fully serialized JSON body.
// The body is rebuilt only when the working set changes; URL and headers are
// assembled once per run.

use crate::atoms::constants::REGISTER_PATH;
use crate::atoms::error::{EngineError, EngineResult};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::json;

pub struct PrebuiltRequest {
    pub url: Url,
    headers: HeaderMap,
    body: Vec<u8>,
    ecrns: Vec<String>,
    scrns: Vec<String>,
}

impl PrebuiltRequest {
    pub fn build(
        base_url: &str,
        token: &str,
        ecrns: &[String],
        scrns: &[String],
    ) -> EngineResult<Self> {
        let url = Url::parse(base_url)
            .and_then(|u| u.join(REGISTER_PATH))
            .map_err(|e| EngineError::config(format!("invalid SIS base URL: {}", e)))?;

        let mut headers = HeaderMap::with_capacity(2);
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| EngineError::config("token contains non-header-safe bytes"))?;
        // Sensitive values are excluded from reqwest's debug logging.
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut prebuilt = PrebuiltRequest {
            url,
            headers,
            body: Vec::new(),
            ecrns: ecrns.to_vec(),
            scrns: scrns.to_vec(),
        };
        prebuilt.serialize_body();
        Ok(prebuilt)
    }

    fn serialize_body(&mut self) {
        let body = json!({ "ECRN": self.ecrns, "SCRN": self.scrns });
        // json! over Vec<String> cannot fail to serialize
        self.body = serde_json::to_vec(&body).expect("registration body serialization");
    }

    /// Swap in a shrunken working set, re-serializing the body only.
    /// Headers and URL stay as built. No-op when the set is unchanged.
    pub fn set_working_set(&mut self, ecrns: &[String], scrns: &[String]) {
        if self.ecrns == ecrns && self.scrns == scrns {
            return;
        }
        self.ecrns = ecrns.to_vec();
        self.scrns = scrns.to_vec();
        self.serialize_body();
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        self.body.clone()
    }

    pub fn ecrns(&self) -> &[String] {
        &self.ecrns
    }

    pub fn scrns(&self) -> &[String] {
        &self.scrns
    }
}

// The default Debug on HeaderMap would render the bearer header's presence;
// keep the whole struct opaque instead.
impl std::fmt::Debug for PrebuiltRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrebuiltRequest")
            .field("url", &self.url.as_str())
            .field("ecrns", &self.ecrns)
            .field("scrns", &self.scrns)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> PrebuiltRequest {
        PrebuiltRequest::build(
            "https://sis.example.edu",
            "tok-123",
            &["24066".into(), "24067".into()],
            &["20150".into()],
        )
        .unwrap()
    }

    #[test]
    fn url_and_body_shape() {
        let req = build();
        assert_eq!(req.url.as_str(), "https://sis.example.edu/api/ders-kayit/v21");
        let body: serde_json::Value = serde_json::from_slice(&req.body_bytes()).unwrap();
        assert_eq!(body["ECRN"], serde_json::json!(["24066", "24067"]));
        assert_eq!(body["SCRN"], serde_json::json!(["20150"]));
    }

    #[test]
    fn auth_header_is_sensitive() {
        let req = build();
        let auth = req.headers().get(AUTHORIZATION).unwrap();
        assert!(auth.is_sensitive());
        assert_eq!(req.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn body_rebuilds_only_on_working_set_change() {
        let mut req = build();
        let before = req.body_bytes();
        req.set_working_set(&["24066".into(), "24067".into()], &["20150".into()]);
        assert_eq!(req.body_bytes(), before);

        req.set_working_set(&["24067".into()], &["20150".into()]);
        let body: serde_json::Value = serde_json::from_slice(&req.body_bytes()).unwrap();
        assert_eq!(body["ECRN"], serde_json::json!(["24067"]));
    }

    #[test]
    fn debug_never_renders_token() {
        let req = build();
        let rendered = format!("{:?}", req);
        assert!(!rendered.contains("tok-123"));
    }

    #[test]
    fn empty_add_list_still_serializes() {
        let req =
            PrebuiltRequest::build("https://sis.example.edu", "t", &[], &["20150".into()]).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&req.body_bytes()).unwrap();
        assert_eq!(body["ECRN"], serde_json::json!([]));
    }
}
