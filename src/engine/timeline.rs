//! Enrollment timeline engine: the pause/resume state machine and its
//! effect on the program end date.
//!
//! The correctness-critical distinction here is requested vs actual pause
//! length. A pause advances the end date by the days the client asked for;
//! a resume recomputes from the days the client actually missed, capped at
//! the validated window and anchored to the original end date, so the two
//! can neither compound nor overrun the pause-day budget.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::check_slot_free;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The state was already what the caller asked for; nothing changed.
    Noop,
}

#[derive(Debug, Clone, Copy)]
pub struct PauseRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub reason: PauseReason,
}

/// External-resource handles of a booking touched by a lifecycle change,
/// for best-effort teardown after the state is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingTeardown {
    pub booking_id: Ulid,
    pub calendar_event_id: Option<String>,
    pub video_bot_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PauseEffect {
    pub requested_days: i64,
    pub new_end_date: NaiveDate,
    pub paused_bookings: Vec<BookingTeardown>,
}

#[derive(Debug, Clone)]
pub enum ResumeEffect {
    /// Duplicate trigger (e.g. a double-click): already active, no state
    /// change, no audit record.
    AlreadyActive,
    Resumed {
        actual_days: i64,
        new_end_date: NaiveDate,
        resumed_bookings: Vec<Ulid>,
        /// Paused sessions whose slot was claimed by someone else during
        /// the pause: cancelled and left for an admin reschedule.
        displaced_bookings: Vec<BookingTeardown>,
    },
}

/// All pause preconditions, in rejection order. Returns the requested
/// pause length in days.
fn validate_pause(
    en: &Enrollment,
    req: &PauseRequest,
    clock: &Clock,
) -> Result<i64, EngineError> {
    if en.is_paused() {
        return Err(EngineError::Conflict("enrollment is already paused".into()));
    }
    if en.status != EnrollmentStatus::Active {
        return Err(EngineError::Validation(format!(
            "only active enrollments can be paused (status: {})",
            en.status.label()
        )));
    }
    if en.pause_count >= MAX_PAUSE_COUNT {
        return Err(EngineError::Conflict(format!(
            "maximum {MAX_PAUSE_COUNT} pauses allowed"
        )));
    }
    if req.end <= req.start {
        return Err(EngineError::Validation(
            "pause end date must be after pause start date".into(),
        ));
    }
    let requested_days = (req.end - req.start).num_days();
    if !(1..=MAX_PAUSE_DAYS_SINGLE).contains(&requested_days) {
        return Err(EngineError::Validation(format!(
            "pause length must be between 1 and {MAX_PAUSE_DAYS_SINGLE} days"
        )));
    }
    let remaining = MAX_PAUSE_DAYS_TOTAL - en.total_pause_days;
    if requested_days > remaining {
        return Err(EngineError::Conflict(format!(
            "only {remaining} pause days remaining"
        )));
    }
    let minutes_until_start =
        (req.start - clock.today).num_days() * (MINUTES_PER_DAY as i64) - clock.minute_of_day as i64;
    if minutes_until_start < MIN_PAUSE_NOTICE_HOURS * 60 {
        return Err(EngineError::Validation(format!(
            "pause must start at least {MIN_PAUSE_NOTICE_HOURS} hours from now"
        )));
    }
    Ok(requested_days)
}

/// Days actually missed: whole days from pause start until today. Never
/// negative (resuming before the pause even started costs nothing) and
/// never more than the requested window — there is no auto-resume, so a
/// trigger may arrive after the pause end, and charging the overshoot
/// would push `total_pause_days` past the budget that was validated at
/// pause time.
fn actual_pause_days(pause_start: NaiveDate, pause_end: NaiveDate, today: NaiveDate) -> i64 {
    let requested = (pause_end - pause_start).num_days();
    (today - pause_start).num_days().clamp(0, requested)
}

impl Engine {
    pub async fn create_enrollment(
        &self,
        id: Ulid,
        client_id: Ulid,
        start: NaiveDate,
        program_days: i64,
        actor: &str,
        clock: &Clock,
    ) -> Result<Enrollment, EngineError> {
        if self.enrollments.len() >= MAX_ENROLLMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many enrollments"));
        }
        if actor.len() > MAX_ACTOR_LEN {
            return Err(EngineError::LimitExceeded("actor name too long"));
        }
        super::conflict::validate_date(start)?;
        if !(MIN_PROGRAM_DAYS..=MAX_PROGRAM_DAYS).contains(&program_days) {
            return Err(EngineError::Validation(format!(
                "program length must be between {MIN_PROGRAM_DAYS} and {MAX_PROGRAM_DAYS} days"
            )));
        }
        if self.enrollments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let enrollment = Enrollment::new(id, client_id, start, program_days, clock.today);
        let event = Event::EnrollmentCreated {
            enrollment: enrollment.clone(),
            actor: actor.to_string(),
            at: clock.now_ms,
        };
        self.wal_append(&event).await?;
        self.enrollments
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(enrollment.clone())));
        self.record_audit(&event);
        self.notify.send(id, &event);
        Ok(enrollment)
    }

    /// `pending_start → active` once the requested start date has arrived.
    /// Re-activating an active enrollment is a no-op.
    pub async fn activate_enrollment(
        &self,
        id: Ulid,
        actor: &str,
        clock: &Clock,
    ) -> Result<TransitionOutcome, EngineError> {
        let en = self.get_enrollment_ref(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = en.write().await;
        match guard.status {
            EnrollmentStatus::Active => Ok(TransitionOutcome::Noop),
            EnrollmentStatus::PendingStart => {
                if guard.program_start_date > clock.today {
                    return Err(EngineError::Validation(format!(
                        "start date {} has not arrived",
                        guard.program_start_date
                    )));
                }
                let event = Event::EnrollmentActivated {
                    id,
                    actor: actor.to_string(),
                    at: clock.now_ms,
                };
                self.persist_enrollment_event(&mut guard, &event).await?;
                Ok(TransitionOutcome::Applied)
            }
            status => Err(EngineError::Validation(format!(
                "cannot activate enrollment in status {}",
                status.label()
            ))),
        }
    }

    /// Pause: advance the end date by the requested days, count the pause
    /// immediately (pauses started, not completed), and mark every
    /// scheduled session inside the window. The enrollment mutation is
    /// durable before the caller gets the teardown list, so external
    /// cleanup failures can never roll it back.
    pub async fn pause_enrollment(
        &self,
        id: Ulid,
        req: PauseRequest,
        actor: &str,
        clock: &Clock,
    ) -> Result<PauseEffect, EngineError> {
        super::conflict::validate_date(req.start)?;
        super::conflict::validate_date(req.end)?;
        let en = self.get_enrollment_ref(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = en.write().await;
        let requested_days = validate_pause(&guard, &req, clock)?;
        let new_end_date = guard.program_end_date + chrono::Duration::days(requested_days);

        let event = Event::EnrollmentPaused {
            id,
            pause_start: req.start,
            pause_end: req.end,
            reason: req.reason,
            requested_days,
            new_end_date,
            actor: actor.to_string(),
            at: clock.now_ms,
        };
        self.persist_enrollment_event(&mut guard, &event).await?;

        let paused_bookings = self
            .pause_enrollment_bookings(id, req.start, req.end, clock)
            .await?;

        Ok(PauseEffect {
            requested_days,
            new_end_date,
            paused_bookings,
        })
    }

    /// Resume, including early or late resume: charge only the days
    /// actually missed, capped at the requested window and anchored to the
    /// original end date. Idempotent against duplicate triggers. Sessions
    /// whose slot was claimed during the pause come back cancelled, not
    /// double-booked.
    pub async fn resume_enrollment(
        &self,
        id: Ulid,
        actor: &str,
        clock: &Clock,
    ) -> Result<ResumeEffect, EngineError> {
        let en = self.get_enrollment_ref(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = en.write().await;
        match guard.status {
            EnrollmentStatus::Active => return Ok(ResumeEffect::AlreadyActive),
            EnrollmentStatus::Paused => {}
            status => {
                return Err(EngineError::Validation(format!(
                    "cannot resume enrollment in status {}",
                    status.label()
                )));
            }
        }

        let pause_start = guard
            .pause_start_date
            .expect("paused enrollment has a pause window");
        let pause_end = guard
            .pause_end_date
            .expect("paused enrollment has a pause window");
        let original_end = guard
            .original_end_date
            .expect("paused enrollment has an original end date");
        let actual_days = actual_pause_days(pause_start, pause_end, clock.today);
        let new_end_date =
            original_end + chrono::Duration::days(guard.total_pause_days + actual_days);

        let event = Event::EnrollmentResumed {
            id,
            actual_days,
            new_end_date,
            actor: actor.to_string(),
            at: clock.now_ms,
        };
        self.persist_enrollment_event(&mut guard, &event).await?;

        let (restored, displaced) = self.restore_enrollment_bookings(id, clock).await?;

        Ok(ResumeEffect::Resumed {
            actual_days,
            new_end_date,
            resumed_bookings: restored,
            displaced_bookings: displaced,
        })
    }

    pub async fn cancel_enrollment(
        &self,
        id: Ulid,
        actor: &str,
        clock: &Clock,
    ) -> Result<TransitionOutcome, EngineError> {
        let en = self.get_enrollment_ref(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = en.write().await;
        match guard.status {
            EnrollmentStatus::Cancelled => Ok(TransitionOutcome::Noop),
            EnrollmentStatus::Completed => Err(EngineError::Validation(
                "completed enrollments cannot be cancelled".into(),
            )),
            _ => {
                let event = Event::EnrollmentCancelled {
                    id,
                    actor: actor.to_string(),
                    at: clock.now_ms,
                };
                self.persist_enrollment_event(&mut guard, &event).await?;
                Ok(TransitionOutcome::Applied)
            }
        }
    }

    /// Booking ids of an enrollment grouped by provider, in sorted
    /// provider-id order — the same lock-ordering discipline as every other
    /// multi-provider operation, so lock cycles cannot form.
    fn bookings_by_provider(&self, enrollment_id: Ulid) -> BTreeMap<Ulid, Vec<Ulid>> {
        let booking_ids = self
            .enrollment_bookings
            .get(&enrollment_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut by_provider: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        for bid in booking_ids {
            if let Some(pid) = self.get_provider_for_entity(&bid) {
                by_provider.entry(pid).or_default().push(bid);
            }
        }
        by_provider
    }

    /// Mark every Scheduled booking of an enrollment dated inside the
    /// pause window as Paused.
    async fn pause_enrollment_bookings(
        &self,
        enrollment_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        clock: &Clock,
    ) -> Result<Vec<BookingTeardown>, EngineError> {
        let mut teardowns = Vec::new();
        for (pid, bids) in self.bookings_by_provider(enrollment_id) {
            let Some(ps) = self.get_provider(&pid) else {
                continue;
            };
            let mut guard = ps.write().await;
            for bid in bids {
                let Some(b) = guard.booking(bid) else { continue };
                if b.status != BookingStatus::Scheduled || b.date < start || b.date >= end {
                    continue;
                }
                let teardown = BookingTeardown {
                    booking_id: b.id,
                    calendar_event_id: b.calendar_event_id.clone(),
                    video_bot_id: b.video_bot_id.clone(),
                };
                let event = Event::BookingStatusChanged {
                    id: bid,
                    provider_id: pid,
                    status: BookingStatus::Paused,
                    at: clock.now_ms,
                };
                self.persist_provider_event(&mut guard, &event).await?;
                teardowns.push(teardown);
            }
        }
        Ok(teardowns)
    }

    /// Return every upcoming Paused booking of an enrollment to Scheduled.
    /// A paused session does not occupy its slot, so another client may
    /// have booked it during the pause — each restore re-checks occupancy
    /// under the provider lock, and a booking whose slot is now taken is
    /// cancelled and reported for admin reschedule instead of overlapping
    /// the interloper.
    async fn restore_enrollment_bookings(
        &self,
        enrollment_id: Ulid,
        clock: &Clock,
    ) -> Result<(Vec<Ulid>, Vec<BookingTeardown>), EngineError> {
        let mut restored = Vec::new();
        let mut displaced = Vec::new();
        for (pid, bids) in self.bookings_by_provider(enrollment_id) {
            let Some(ps) = self.get_provider(&pid) else {
                continue;
            };
            let mut guard = ps.write().await;
            for bid in bids {
                let Some(b) = guard.booking(bid) else { continue };
                if b.status != BookingStatus::Paused || b.date < clock.today {
                    continue;
                }
                let b = b.clone();
                let slot_free = check_slot_free(
                    &guard,
                    b.date,
                    b.time,
                    b.duration_min,
                    clock.now_ms,
                    None,
                    Some(bid),
                )
                .is_ok();
                let status = if slot_free {
                    BookingStatus::Scheduled
                } else {
                    BookingStatus::Cancelled
                };
                let event = Event::BookingStatusChanged {
                    id: bid,
                    provider_id: pid,
                    status,
                    at: clock.now_ms,
                };
                self.persist_provider_event(&mut guard, &event).await?;
                if slot_free {
                    restored.push(bid);
                } else {
                    displaced.push(BookingTeardown {
                        booking_id: bid,
                        calendar_event_id: b.calendar_event_id,
                        video_bot_id: b.video_bot_id,
                    });
                }
            }
        }
        Ok((restored, displaced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn active_enrollment() -> Enrollment {
        let today = d(2026, 8, 4);
        Enrollment::new(Ulid::new(), Ulid::new(), today, 90, today)
    }

    fn request(start: NaiveDate, days: i64) -> PauseRequest {
        PauseRequest {
            start,
            end: start + chrono::Duration::days(days),
            reason: PauseReason::Vacation,
        }
    }

    #[test]
    fn pause_requires_notice() {
        let en = active_enrollment();
        let clock = Clock::fixed(d(2026, 8, 4), 12 * 60);
        // starting tomorrow is under the 48h notice
        let err = validate_pause(&en, &request(d(2026, 8, 5), 10), &clock).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        // three days out is fine
        assert_eq!(
            validate_pause(&en, &request(d(2026, 8, 7), 10), &clock).unwrap(),
            10
        );
    }

    #[test]
    fn pause_notice_boundary_counts_minutes() {
        let en = active_enrollment();
        // exactly 48h before midnight of the start date
        let clock = Clock::fixed(d(2026, 8, 4), 0);
        assert!(validate_pause(&en, &request(d(2026, 8, 6), 5), &clock).is_ok());
        // one minute later the same request misses the notice window
        let clock = Clock::fixed(d(2026, 8, 4), 1);
        assert!(validate_pause(&en, &request(d(2026, 8, 6), 5), &clock).is_err());
    }

    #[test]
    fn pause_length_bounds() {
        let en = active_enrollment();
        let clock = Clock::fixed(d(2026, 8, 4), 0);
        let start = d(2026, 8, 10);
        assert!(validate_pause(&en, &request(start, 1), &clock).is_ok());
        assert!(validate_pause(&en, &request(start, MAX_PAUSE_DAYS_SINGLE), &clock).is_ok());
        assert!(validate_pause(&en, &request(start, MAX_PAUSE_DAYS_SINGLE + 1), &clock).is_err());
        // inverted window
        let bad = PauseRequest {
            start,
            end: start - chrono::Duration::days(1),
            reason: PauseReason::Vacation,
        };
        assert!(validate_pause(&en, &bad, &clock).is_err());
    }

    #[test]
    fn pause_budget_named_in_conflict() {
        let mut en = active_enrollment();
        en.total_pause_days = 55;
        let clock = Clock::fixed(d(2026, 8, 4), 0);
        let err = validate_pause(&en, &request(d(2026, 8, 10), 10), &clock).unwrap_err();
        match err {
            EngineError::Conflict(msg) => assert!(msg.contains("5 pause days remaining"), "{msg}"),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn pause_count_named_in_conflict() {
        let mut en = active_enrollment();
        en.pause_count = MAX_PAUSE_COUNT;
        let clock = Clock::fixed(d(2026, 8, 4), 0);
        let err = validate_pause(&en, &request(d(2026, 8, 10), 5), &clock).unwrap_err();
        match err {
            EngineError::Conflict(msg) => {
                assert!(msg.contains(&format!("maximum {MAX_PAUSE_COUNT} pauses")), "{msg}")
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn already_paused_is_conflict() {
        let mut en = active_enrollment();
        en.status = EnrollmentStatus::Paused;
        en.pause_start_date = Some(d(2026, 8, 10));
        en.pause_end_date = Some(d(2026, 8, 20));
        let clock = Clock::fixed(d(2026, 8, 4), 0);
        let err = validate_pause(&en, &request(d(2026, 8, 10), 5), &clock).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn pending_start_cannot_pause() {
        let today = d(2026, 8, 4);
        let en = Enrollment::new(Ulid::new(), Ulid::new(), d(2026, 9, 1), 90, today);
        let clock = Clock::fixed(today, 0);
        let err = validate_pause(&en, &request(d(2026, 9, 10), 5), &clock).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn actual_days_clamped_to_window() {
        let start = d(2026, 8, 10);
        let end = d(2026, 8, 20);
        assert_eq!(actual_pause_days(start, end, d(2026, 8, 13)), 3);
        assert_eq!(actual_pause_days(start, end, d(2026, 8, 10)), 0);
        assert_eq!(actual_pause_days(start, end, d(2026, 8, 8)), 0);
        assert_eq!(actual_pause_days(start, end, d(2026, 8, 20)), 10);
        // a resume long after the window charges the validated ten days,
        // not the overshoot
        assert_eq!(actual_pause_days(start, end, d(2026, 11, 8)), 10);
    }
}
