// ── Otokayit Engine: Response Classification ───────────────────────────────
//
// Wire types for the SIS registration endpoint and the mapping from raw
// result codes to per-course statuses. The code set mirrors what the SIS
// currently emits; unknown codes degrade to a non-terminal `error` so a
// server-side addition never wedges a run.

use crate::atoms::types::CrnStatus;
use serde::Deserialize;

// ── Wire shapes ────────────────────────────────────────────────────────────

/// Body of `POST /api/ders-kayit/v21`.
/// `statusCode` is the envelope-level verdict; the per-course lists carry
/// one entry per CRN that the server actually processed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReply {
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub ecrn_result_list: Vec<CourseResult>,
    #[serde(default)]
    pub scrn_result_list: Vec<CourseResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseResult {
    pub crn: String,
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub result_code: Option<String>,
}

impl CourseResult {
    fn code(&self) -> String {
        match &self.result_code {
            Some(rc) if !rc.is_empty() => rc.clone(),
            _ => self.status_code.map(|c| c.to_string()).unwrap_or_default(),
        }
    }

    fn is_success(&self) -> bool {
        self.status_code == Some(0) || self.code() == "0"
    }
}

// ── Envelope disposition ───────────────────────────────────────────────────

/// How the attempt loop should treat the reply as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// Per-course results are present; pace normally.
    PerCourse,
    /// The registration period has not opened yet. Burst-mode eligible.
    WindowClosed,
    /// The session hit the server-side debounce; the next send is deferred
    /// a full retry interval past this request's send time.
    SessionDebounce,
    /// The server rejected the request outright; fatal for the run.
    Rejected(String),
}

pub fn reply_kind(reply: &RegistrationReply) -> ReplyKind {
    let entries = reply.ecrn_result_list.len() + reply.scrn_result_list.len();
    if entries == 0 {
        // Nothing was processed; the envelope code is all we have.
        return match reply.status_code {
            Some(0) | None => ReplyKind::PerCourse,
            Some(code) => ReplyKind::Rejected(code.to_string()),
        };
    }

    let adds = &reply.ecrn_result_list;
    if !adds.is_empty() && adds.iter().all(|e| code_is(e, "windowclosed")) {
        return ReplyKind::WindowClosed;
    }
    if !adds.is_empty() && adds.iter().all(|e| code_is(e, "debounce")) {
        return ReplyKind::SessionDebounce;
    }
    ReplyKind::PerCourse
}

fn code_is(entry: &CourseResult, normalized: &str) -> bool {
    entry.code().eq_ignore_ascii_case(normalized)
}

// ── Per-course mapping ─────────────────────────────────────────────────────

/// Classify one entry from the add (ECRN) result list.
pub fn classify_add(entry: &CourseResult) -> CrnStatus {
    let code = entry.code();
    if entry.is_success() {
        return CrnStatus::Success { code, message: "Registered".into() };
    }
    match code.to_ascii_lowercase().as_str() {
        "windowclosed" => CrnStatus::Pending,
        "alreadyenrolled" => CrnStatus::AlreadyEnrolled {
            code,
            message: "Already enrolled in this course".into(),
        },
        "full" => CrnStatus::Full { code, message: "Course quota is full".into() },
        "conflict" => CrnStatus::Conflict { code, message: "Schedule conflict".into() },
        "upgradeconflict" => CrnStatus::UpgradeConflict {
            code,
            message: "Conflicts with an upgrade registration".into(),
        },
        "debounce" => CrnStatus::Debounce {
            code,
            message: "Request arrived too soon after the previous one".into(),
        },
        _ => CrnStatus::Error { code, message: "Unrecognized SIS result code".into() },
    }
}

/// Classify one entry from the drop (SCRN) result list.
/// Drops collapse to dropped-or-error.
pub fn classify_drop(entry: &CourseResult) -> CrnStatus {
    let code = entry.code();
    if entry.is_success() {
        CrnStatus::Dropped { code, message: "Course dropped".into() }
    } else if code.eq_ignore_ascii_case("windowclosed") {
        CrnStatus::Pending
    } else {
        CrnStatus::Error { code, message: "Drop request failed".into() }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(crn: &str, status: Option<i64>, result: Option<&str>) -> CourseResult {
        CourseResult {
            crn: crn.into(),
            status_code: status,
            result_code: result.map(str::to_string),
        }
    }

    #[test]
    fn success_comes_from_status_or_result_code() {
        assert!(matches!(
            classify_add(&entry("24066", Some(0), None)),
            CrnStatus::Success { .. }
        ));
        assert!(matches!(
            classify_add(&entry("24066", None, Some("0"))),
            CrnStatus::Success { .. }
        ));
    }

    #[test]
    fn known_codes_map_per_table() {
        assert_eq!(classify_add(&entry("1", Some(1), Some("WindowClosed"))), CrnStatus::Pending);
        assert!(matches!(
            classify_add(&entry("1", Some(1), Some("AlreadyEnrolled"))),
            CrnStatus::AlreadyEnrolled { .. }
        ));
        assert!(matches!(
            classify_add(&entry("1", Some(1), Some("Full"))),
            CrnStatus::Full { .. }
        ));
        assert!(matches!(
            classify_add(&entry("1", Some(1), Some("Conflict"))),
            CrnStatus::Conflict { .. }
        ));
        assert!(matches!(
            classify_add(&entry("1", Some(1), Some("UpgradeConflict"))),
            CrnStatus::UpgradeConflict { .. }
        ));
        assert!(matches!(
            classify_add(&entry("1", Some(1), Some("Debounce"))),
            CrnStatus::Debounce { .. }
        ));
    }

    #[test]
    fn unknown_codes_become_nonterminal_errors() {
        let status = classify_add(&entry("1", Some(1), Some("VAL99")));
        match &status {
            CrnStatus::Error { code, .. } => assert_eq!(code, "VAL99"),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(!status.is_terminal(false));
    }

    #[test]
    fn drops_collapse_to_dropped_or_error() {
        assert!(matches!(
            classify_drop(&entry("20150", Some(0), None)),
            CrnStatus::Dropped { .. }
        ));
        assert!(matches!(
            classify_drop(&entry("20150", Some(1), Some("Full"))),
            CrnStatus::Error { .. }
        ));
    }

    #[test]
    fn reply_kind_detects_window_closed_and_debounce() {
        let reply = RegistrationReply {
            status_code: Some(1),
            ecrn_result_list: vec![
                entry("24066", Some(1), Some("WindowClosed")),
                entry("24067", Some(1), Some("windowclosed")),
            ],
            scrn_result_list: vec![],
        };
        assert_eq!(reply_kind(&reply), ReplyKind::WindowClosed);

        let reply = RegistrationReply {
            status_code: Some(1),
            ecrn_result_list: vec![entry("24066", Some(1), Some("Debounce"))],
            scrn_result_list: vec![],
        };
        assert_eq!(reply_kind(&reply), ReplyKind::SessionDebounce);
    }

    #[test]
    fn reply_kind_mixed_results_are_per_course() {
        let reply = RegistrationReply {
            status_code: Some(0),
            ecrn_result_list: vec![
                entry("24066", Some(0), None),
                entry("24067", Some(1), Some("WindowClosed")),
            ],
            scrn_result_list: vec![],
        };
        assert_eq!(reply_kind(&reply), ReplyKind::PerCourse);
    }

    #[test]
    fn reply_kind_empty_lists_with_error_code_is_rejected() {
        let reply = RegistrationReply {
            status_code: Some(-16),
            ecrn_result_list: vec![],
            scrn_result_list: vec![],
        };
        assert_eq!(reply_kind(&reply), ReplyKind::Rejected("-16".into()));
    }

    #[test]
    fn wire_parse_matches_sis_shape() {
        let json = r#"{
            "statusCode": 0,
            "ecrnResultList": [
                {"crn": "24066", "statusCode": 0, "resultCode": "0"},
                {"crn": "24067", "statusCode": 1, "resultCode": "Full"}
            ],
            "scrnResultList": [
                {"crn": "20150", "statusCode": 0}
            ]
        }"#;
        let reply: RegistrationReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.ecrn_result_list.len(), 2);
        assert!(matches!(classify_add(&reply.ecrn_result_list[0]), CrnStatus::Success { .. }));
        assert!(matches!(classify_add(&reply.ecrn_result_list[1]), CrnStatus::Full { .. }));
        assert!(matches!(classify_drop(&reply.scrn_result_list[0]), CrnStatus::Dropped { .. }));
    }
}
