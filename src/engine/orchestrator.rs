//! Scheduling orchestrator: the single entry point for lifecycle events.
//!
//! Every cross-cutting side effect (booking marking, calendar teardown,
//! video-bot teardown) fans out from here and only from here — call sites
//! never talk to collaborators directly, so a pause triggered from the
//! wire surface and one triggered internally produce identical effects.

use chrono::NaiveDate;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use ulid::Ulid;

use crate::model::*;

use super::timeline::{PauseRequest, ResumeEffect, TransitionOutcome};
use super::{Engine, EngineError};

/// The closed set of dispatchable lifecycle events. Anything else is
/// rejected before a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnrollmentCreated,
    EnrollmentPaused,
    EnrollmentResumed,
    DelayedStartActivated,
    ProviderUnavailable,
    ProviderAvailable,
    ProviderExited,
    SessionRescheduled,
    SessionCancelled,
    SessionCompleted,
    SessionNoShow,
}

impl LifecycleEvent {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enrollment_created" => Some(Self::EnrollmentCreated),
            "enrollment_paused" => Some(Self::EnrollmentPaused),
            "enrollment_resumed" => Some(Self::EnrollmentResumed),
            "delayed_start_activated" => Some(Self::DelayedStartActivated),
            "provider_unavailable" => Some(Self::ProviderUnavailable),
            "provider_available" => Some(Self::ProviderAvailable),
            "provider_exited" => Some(Self::ProviderExited),
            "session_rescheduled" => Some(Self::SessionRescheduled),
            "session_cancelled" => Some(Self::SessionCancelled),
            "session_completed" => Some(Self::SessionCompleted),
            "session_no_show" => Some(Self::SessionNoShow),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::EnrollmentCreated => "enrollment_created",
            Self::EnrollmentPaused => "enrollment_paused",
            Self::EnrollmentResumed => "enrollment_resumed",
            Self::DelayedStartActivated => "delayed_start_activated",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ProviderAvailable => "provider_available",
            Self::ProviderExited => "provider_exited",
            Self::SessionRescheduled => "session_rescheduled",
            Self::SessionCancelled => "session_cancelled",
            Self::SessionCompleted => "session_completed",
            Self::SessionNoShow => "session_no_show",
        }
    }

    /// Enrollment-scoped events require the admin role; provider-scoped
    /// events may come from the provider itself.
    pub fn admin_only(self) -> bool {
        matches!(
            self,
            Self::EnrollmentCreated
                | Self::EnrollmentPaused
                | Self::EnrollmentResumed
                | Self::DelayedStartActivated
        )
    }
}

// ── Typed payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnrollmentCreatedPayload {
    enrollment_id: Option<Ulid>,
    client_id: Ulid,
    start_date: NaiveDate,
    program_days: i64,
}

#[derive(Debug, Deserialize)]
struct EnrollmentPausedPayload {
    enrollment_id: Ulid,
    pause_start_date: NaiveDate,
    pause_end_date: NaiveDate,
    pause_reason: PauseReason,
}

#[derive(Debug, Deserialize)]
struct EnrollmentIdPayload {
    enrollment_id: Ulid,
}

#[derive(Debug, Deserialize)]
struct ProviderPayload {
    provider_id: Ulid,
}

#[derive(Debug, Deserialize)]
struct SessionReschedulePayload {
    booking_id: Ulid,
    new_booking_id: Option<Ulid>,
    new_date: NaiveDate,
    new_time: String,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    booking_id: Ulid,
    #[serde(default)]
    notify_client: Option<bool>,
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, EngineError> {
    serde_json::from_value(payload)
        .map_err(|e| EngineError::Validation(format!("invalid payload: {e}")))
}

impl Engine {
    /// Validate, deserialize, execute. Handlers tolerate duplicate
    /// invocation — the orchestrator provides no deduplication, so a
    /// retried dispatch must land as a no-op, not an error.
    pub async fn dispatch(
        &self,
        event: &str,
        payload: Value,
        actor: &str,
        clock: &Clock,
    ) -> Result<Value, EngineError> {
        let ev = LifecycleEvent::parse(event)
            .ok_or_else(|| EngineError::Validation(format!("unknown event type: {event}")))?;
        metrics::counter!(crate::observability::DISPATCHES_TOTAL, "event" => ev.label())
            .increment(1);

        match ev {
            LifecycleEvent::EnrollmentCreated => {
                let p: EnrollmentCreatedPayload = parse_payload(payload)?;
                let id = p.enrollment_id.unwrap_or_else(Ulid::new);
                let en = self
                    .create_enrollment(id, p.client_id, p.start_date, p.program_days, actor, clock)
                    .await?;
                Ok(json!({
                    "enrollment_id": en.id,
                    "status": en.status.label(),
                    "program_start_date": en.program_start_date,
                    "program_end_date": en.program_end_date,
                }))
            }

            LifecycleEvent::EnrollmentPaused => {
                let p: EnrollmentPausedPayload = parse_payload(payload)?;
                let req = PauseRequest {
                    start: p.pause_start_date,
                    end: p.pause_end_date,
                    reason: p.pause_reason,
                };

                // Retried dispatch of the same logical pause is a no-op;
                // a different window while paused is a real conflict.
                let current = self.get_enrollment(p.enrollment_id).await?;
                if current.is_paused()
                    && current.pause_start_date == Some(req.start)
                    && current.pause_end_date == Some(req.end)
                {
                    return Ok(json!({
                        "enrollment_id": p.enrollment_id,
                        "status": "paused",
                        "program_end_date": current.program_end_date,
                        "noop": true,
                    }));
                }

                let effect = self
                    .pause_enrollment(p.enrollment_id, req, actor, clock)
                    .await?;
                for t in &effect.paused_bookings {
                    self.collab
                        .teardown_booking(
                            t.booking_id,
                            t.calendar_event_id.as_deref(),
                            t.video_bot_id.as_deref(),
                            true,
                        )
                        .await;
                }
                Ok(json!({
                    "enrollment_id": p.enrollment_id,
                    "status": "paused",
                    "requested_days": effect.requested_days,
                    "program_end_date": effect.new_end_date,
                    "paused_sessions": effect.paused_bookings.iter().map(|t| t.booking_id).collect::<Vec<_>>(),
                }))
            }

            LifecycleEvent::EnrollmentResumed => {
                let p: EnrollmentIdPayload = parse_payload(payload)?;
                match self.resume_enrollment(p.enrollment_id, actor, clock).await? {
                    ResumeEffect::AlreadyActive => Ok(json!({
                        "enrollment_id": p.enrollment_id,
                        "status": "active",
                        "noop": true,
                    })),
                    ResumeEffect::Resumed {
                        actual_days,
                        new_end_date,
                        resumed_bookings,
                        displaced_bookings,
                    } => {
                        for t in &displaced_bookings {
                            self.collab
                                .teardown_booking(
                                    t.booking_id,
                                    t.calendar_event_id.as_deref(),
                                    t.video_bot_id.as_deref(),
                                    true,
                                )
                                .await;
                        }
                        Ok(json!({
                            "enrollment_id": p.enrollment_id,
                            "status": "active",
                            "actual_days": actual_days,
                            "program_end_date": new_end_date,
                            "resumed_sessions": resumed_bookings,
                            "displaced_sessions": displaced_bookings.iter().map(|t| t.booking_id).collect::<Vec<_>>(),
                        }))
                    }
                }
            }

            LifecycleEvent::DelayedStartActivated => {
                let p: EnrollmentIdPayload = parse_payload(payload)?;
                let outcome = self.activate_enrollment(p.enrollment_id, actor, clock).await?;
                Ok(json!({
                    "enrollment_id": p.enrollment_id,
                    "status": "active",
                    "noop": outcome == TransitionOutcome::Noop,
                }))
            }

            LifecycleEvent::ProviderUnavailable => {
                let p: ProviderPayload = parse_payload(payload)?;
                self.update_provider(p.provider_id, None, Some(false)).await?;
                // Flagged for reassignment, not auto-cancelled: moving a
                // client to another coach is an admin decision.
                let flagged = self.upcoming_bookings(p.provider_id, clock).await;
                Ok(json!({
                    "provider_id": p.provider_id,
                    "active": false,
                    "flagged_bookings": flagged,
                }))
            }

            LifecycleEvent::ProviderAvailable => {
                let p: ProviderPayload = parse_payload(payload)?;
                self.update_provider(p.provider_id, None, Some(true)).await?;
                Ok(json!({ "provider_id": p.provider_id, "active": true }))
            }

            LifecycleEvent::ProviderExited => {
                let p: ProviderPayload = parse_payload(payload)?;
                self.update_provider(p.provider_id, None, Some(false)).await?;
                let teardowns = self.cancel_upcoming_bookings(p.provider_id, clock).await?;
                for t in &teardowns {
                    self.collab
                        .teardown_booking(
                            t.booking_id,
                            t.calendar_event_id.as_deref(),
                            t.video_bot_id.as_deref(),
                            true,
                        )
                        .await;
                }
                Ok(json!({
                    "provider_id": p.provider_id,
                    "active": false,
                    "cancelled_bookings": teardowns.iter().map(|t| t.booking_id).collect::<Vec<_>>(),
                }))
            }

            LifecycleEvent::SessionRescheduled => {
                let p: SessionReschedulePayload = parse_payload(payload)?;
                let time = parse_hhmm(&p.new_time).ok_or_else(|| {
                    EngineError::Validation(format!("bad time of day: {}", p.new_time))
                })?;
                let new_id = p.new_booking_id.unwrap_or_else(Ulid::new);
                let replacement = self
                    .reschedule_booking(p.booking_id, new_id, p.new_date, time, clock)
                    .await?;
                self.collab
                    .reschedule_booking(
                        replacement.id,
                        replacement.calendar_event_id.as_deref(),
                        replacement.date,
                        replacement.time,
                        replacement.duration_min,
                    )
                    .await;
                Ok(json!({
                    "old_booking_id": p.booking_id,
                    "new_booking_id": replacement.id,
                    "date": replacement.date,
                    "time": fmt_hhmm(replacement.time),
                }))
            }

            LifecycleEvent::SessionCancelled => {
                let p: SessionPayload = parse_payload(payload)?;
                let booking = self.booking_info(p.booking_id).await?;
                let outcome = self
                    .transition_booking(p.booking_id, BookingStatus::Cancelled, clock)
                    .await?;
                if outcome == TransitionOutcome::Applied {
                    self.collab
                        .teardown_booking(
                            booking.id,
                            booking.calendar_event_id.as_deref(),
                            booking.video_bot_id.as_deref(),
                            p.notify_client.unwrap_or(true),
                        )
                        .await;
                }
                Ok(json!({
                    "booking_id": p.booking_id,
                    "status": "cancelled",
                    "noop": outcome == TransitionOutcome::Noop,
                }))
            }

            LifecycleEvent::SessionCompleted => {
                let p: SessionPayload = parse_payload(payload)?;
                let outcome = self
                    .transition_booking(p.booking_id, BookingStatus::Completed, clock)
                    .await?;
                Ok(json!({
                    "booking_id": p.booking_id,
                    "status": "completed",
                    "noop": outcome == TransitionOutcome::Noop,
                }))
            }

            LifecycleEvent::SessionNoShow => {
                let p: SessionPayload = parse_payload(payload)?;
                let outcome = self
                    .transition_booking(p.booking_id, BookingStatus::NoShow, clock)
                    .await?;
                Ok(json!({
                    "booking_id": p.booking_id,
                    "status": "no_show",
                    "noop": outcome == TransitionOutcome::Noop,
                }))
            }
        }
    }
}
