//! The wire envelope: one JSON object per line in, one per line out.
//!
//! Requests are tagged by `op`. Day-of-week and time-of-day fields arrive
//! in their wire conventions (0-indexed-Sunday integers, `HH:MM` strings)
//! and are normalized to [`crate::model`] types here — nothing past this
//! boundary ever re-interprets them.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Provider,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScopeKind {
    Weekly,
    DateSpecific,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseActionKind {
    Pause,
    Resume,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// First frame on every connection: tenant, role, shared password.
    Hello {
        org: String,
        role: Role,
        password: String,
        actor: Option<String>,
    },

    RegisterProvider {
        id: Option<Ulid>,
        name: String,
        #[serde(default = "default_true")]
        active: bool,
    },
    UpdateProvider {
        id: Ulid,
        name: Option<String>,
        active: Option<bool>,
    },

    UpsertRule {
        id: Option<Ulid>,
        provider_id: Ulid,
        scope: RuleScopeKind,
        /// 0–6, 0 = Sunday. Required iff scope is weekly.
        day_of_week: Option<u8>,
        /// Required iff scope is date_specific.
        specific_date: Option<NaiveDate>,
        kind: RuleKind,
        start_time: String,
        end_time: String,
        #[serde(default = "default_true")]
        active: bool,
    },
    RemoveRule {
        id: Ulid,
    },

    GetSlots {
        provider_id: Option<Ulid>,
        #[serde(default)]
        days: u32,
        session_type: SessionType,
        client_age: Option<u32>,
    },

    PlaceHold {
        id: Option<Ulid>,
        provider_id: Ulid,
        date: NaiveDate,
        time: String,
        ttl_ms: Option<i64>,
    },
    ReleaseHold {
        id: Ulid,
    },

    ConfirmBooking {
        id: Option<Ulid>,
        hold_id: Option<Ulid>,
        provider_id: Ulid,
        client_id: Ulid,
        enrollment_id: Option<Ulid>,
        date: NaiveDate,
        time: String,
        session_type: SessionType,
        client_age: Option<u32>,
        calendar_event_id: Option<String>,
        video_bot_id: Option<String>,
    },

    Dispatch {
        event: String,
        payload: Value,
    },

    PauseStatus {
        enrollment_id: Ulid,
    },
    PauseAction {
        enrollment_id: Ulid,
        action: PauseActionKind,
        pause_start_date: Option<NaiveDate>,
        pause_end_date: Option<NaiveDate>,
        pause_reason: Option<PauseReason>,
    },

    ListProviders,
    GetRules {
        provider_id: Ulid,
    },
    GetBookings {
        provider_id: Ulid,
    },
    GetHolds {
        provider_id: Ulid,
    },
    GetEnrollment {
        enrollment_id: Ulid,
    },
    AuditLog {
        enrollment_id: Ulid,
    },

    Listen {
        channel: Ulid,
    },
    Unlisten {
        channel: Ulid,
    },
}

fn default_true() -> bool {
    true
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, EngineError> {
        serde_json::from_str(line)
            .map_err(|e| EngineError::Validation(format!("bad request: {e}")))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::RegisterProvider { .. } => "register_provider",
            Request::UpdateProvider { .. } => "update_provider",
            Request::UpsertRule { .. } => "upsert_rule",
            Request::RemoveRule { .. } => "remove_rule",
            Request::GetSlots { .. } => "get_slots",
            Request::PlaceHold { .. } => "place_hold",
            Request::ReleaseHold { .. } => "release_hold",
            Request::ConfirmBooking { .. } => "confirm_booking",
            Request::Dispatch { .. } => "dispatch",
            Request::PauseStatus { .. } => "pause_status",
            Request::PauseAction { .. } => "pause_action",
            Request::ListProviders => "list_providers",
            Request::GetRules { .. } => "get_rules",
            Request::GetBookings { .. } => "get_bookings",
            Request::GetHolds { .. } => "get_holds",
            Request::GetEnrollment { .. } => "get_enrollment",
            Request::AuditLog { .. } => "audit_log",
            Request::Listen { .. } => "listen",
            Request::Unlisten { .. } => "unlisten",
        }
    }

    /// Minimum role for the request. `Dispatch` is refined further by
    /// [`crate::engine::LifecycleEvent::admin_only`].
    pub fn required_role(&self) -> Role {
        match self {
            Request::RegisterProvider { .. }
            | Request::UpdateProvider { .. }
            | Request::UpsertRule { .. }
            | Request::RemoveRule { .. }
            | Request::PauseAction { .. }
            | Request::GetEnrollment { .. }
            | Request::AuditLog { .. } => Role::Admin,
            _ => Role::Provider,
        }
    }
}

/// Build the rule from its wire fields, normalizing the day-of-week
/// convention exactly once.
pub fn rule_from_wire(
    id: Ulid,
    provider_id: Ulid,
    scope: RuleScopeKind,
    day_of_week: Option<u8>,
    specific_date: Option<NaiveDate>,
    kind: RuleKind,
    start_time: &str,
    end_time: &str,
    active: bool,
) -> Result<AvailabilityRule, EngineError> {
    let scope = match scope {
        RuleScopeKind::Weekly => {
            let idx = day_of_week.ok_or_else(|| {
                EngineError::Validation("weekly rules require day_of_week".into())
            })?;
            let day = weekday_from_index(idx).ok_or_else(|| {
                EngineError::Validation(format!("day_of_week {idx} outside 0..=6 (0 = Sunday)"))
            })?;
            RuleScope::Weekly { day }
        }
        RuleScopeKind::DateSpecific => {
            let date = specific_date.ok_or_else(|| {
                EngineError::Validation("date_specific rules require specific_date".into())
            })?;
            RuleScope::DateSpecific { date }
        }
    };
    let start = parse_time(start_time)?;
    let end = parse_time(end_time)?;
    Ok(AvailabilityRule {
        id,
        provider_id,
        scope,
        kind,
        window: TimeWindow { start, end },
        active,
    })
}

pub fn parse_time(s: &str) -> Result<Mins, EngineError> {
    parse_hhmm(s).ok_or_else(|| EngineError::Validation(format!("bad time of day: {s}")))
}

// ── Response envelope ────────────────────────────────────────────

pub fn ok(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

pub fn error(err: &EngineError) -> Value {
    json!({ "success": false, "error": { "kind": err.kind(), "message": err.to_string() } })
}

/// Infrastructure failures get a generic message plus a correlation id the
/// operator can grep for; the specific cause stays in the server log.
pub fn infra_error(correlation_id: Ulid) -> Value {
    json!({
        "success": false,
        "error": {
            "kind": "infrastructure",
            "message": format!("internal error, reference {correlation_id}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tagged_request() {
        let req = Request::parse(r#"{"op":"get_slots","session_type":"coaching","client_age":9}"#)
            .unwrap();
        match req {
            Request::GetSlots {
                provider_id,
                days,
                session_type,
                client_age,
            } => {
                assert_eq!(provider_id, None);
                assert_eq!(days, 0);
                assert_eq!(session_type, SessionType::Coaching);
                assert_eq!(client_age, Some(9));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_op_rejected() {
        let err = Request::parse(r#"{"op":"drop_tables"}"#).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(Request::parse("{not json").is_err());
    }

    #[test]
    fn weekly_rule_normalizes_sunday_zero() {
        let rule = rule_from_wire(
            Ulid::new(),
            Ulid::new(),
            RuleScopeKind::Weekly,
            Some(1),
            None,
            RuleKind::Available,
            "09:00",
            "12:00",
            true,
        )
        .unwrap();
        assert_eq!(rule.scope, RuleScope::Weekly { day: chrono::Weekday::Mon });
        assert_eq!(rule.window, TimeWindow { start: 540, end: 720 });
    }

    #[test]
    fn weekly_rule_requires_day() {
        let err = rule_from_wire(
            Ulid::new(),
            Ulid::new(),
            RuleScopeKind::Weekly,
            None,
            None,
            RuleKind::Available,
            "09:00",
            "12:00",
            true,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn day_index_seven_rejected() {
        let err = rule_from_wire(
            Ulid::new(),
            Ulid::new(),
            RuleScopeKind::Weekly,
            Some(7),
            None,
            RuleKind::Available,
            "09:00",
            "12:00",
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("0 = Sunday"));
    }

    #[test]
    fn seconds_are_stripped_from_times() {
        assert_eq!(parse_time("09:30:00").unwrap(), 570);
        assert!(parse_time("9am").is_err());
    }

    #[test]
    fn role_ordering() {
        assert!(Role::Provider < Role::Admin);
    }

    #[test]
    fn role_requirements() {
        let admin_req = Request::parse(
            r#"{"op":"pause_status","enrollment_id":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}"#,
        )
        .unwrap();
        assert_eq!(admin_req.required_role(), Role::Provider);

        let rule_req = Request::parse(r#"{"op":"remove_rule","id":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}"#)
            .unwrap();
        assert_eq!(rule_req.required_role(), Role::Admin);
    }
}
