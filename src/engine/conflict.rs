use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    let year = date.year();
    if !(MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&year) {
        return Err(EngineError::Validation(format!("date {date} out of range")));
    }
    Ok(())
}

pub(crate) fn validate_time(t: Mins) -> Result<(), EngineError> {
    if !(0..MINUTES_PER_DAY).contains(&t) {
        return Err(EngineError::Validation(format!(
            "time-of-day {t} outside 00:00..24:00"
        )));
    }
    Ok(())
}

pub(crate) fn validate_window(w: &TimeWindow) -> Result<(), EngineError> {
    if !(0..MINUTES_PER_DAY).contains(&w.start) || w.end > MINUTES_PER_DAY {
        return Err(EngineError::Validation(format!(
            "window {}..{} outside the day",
            fmt_hhmm(w.start),
            fmt_hhmm(w.end)
        )));
    }
    if w.end <= w.start {
        return Err(EngineError::Validation(format!(
            "window end {} must be after start {}",
            fmt_hhmm(w.end),
            fmt_hhmm(w.start)
        )));
    }
    Ok(())
}

/// The booking-conflict guard. Holds claim exact (date, time) keys; active
/// bookings additionally occupy their full duration. Expired holds are
/// treated as absent — nobody assumes the reaper has run.
///
/// `consume_hold` exempts the caller's own hold so a confirmation can
/// replace it in the same locked operation; `exclude_booking` exempts the
/// booking being moved during a reschedule.
///
/// Must run under the provider's write lock: that lock is what turns the
/// check-and-insert into a single atomic operation. Ports backed by a store
/// without such a lock need a conditional write (filtered uniqueness on the
/// key, or a version column with optimistic retry) instead.
pub(crate) fn check_slot_free(
    ps: &ProviderState,
    date: NaiveDate,
    time: Mins,
    duration_min: Mins,
    now: Ms,
    consume_hold: Option<Ulid>,
    exclude_booking: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(hold) = ps.hold_at(date, time, now)
        && consume_hold != Some(hold.id)
    {
        return Err(EngineError::Conflict(format!(
            "slot {date} {} already held ({})",
            fmt_hhmm(time),
            hold.id
        )));
    }

    let requested = TimeWindow::new(time, time + duration_min);
    for b in &ps.bookings {
        if exclude_booking == Some(b.id) {
            continue;
        }
        if b.status.is_active() && b.date == date && b.window().overlaps(&requested) {
            return Err(EngineError::Conflict(format!(
                "slot {date} {} overlaps booking {}",
                fmt_hhmm(time),
                b.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, SessionType};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn provider_with_booking(date: NaiveDate, time: Mins, duration: Mins) -> ProviderState {
        let mut ps = ProviderState::new(Ulid::new(), "Coach".into(), true);
        ps.insert_booking(Booking {
            id: Ulid::new(),
            provider_id: ps.id,
            client_id: Ulid::new(),
            enrollment_id: None,
            date,
            time,
            duration_min: duration,
            session_type: SessionType::Coaching,
            status: BookingStatus::Scheduled,
            calendar_event_id: None,
            video_bot_id: None,
        });
        ps
    }

    #[test]
    fn overlapping_booking_conflicts() {
        let date = d(2026, 8, 10);
        let ps = provider_with_booking(date, 540, 60);
        // 09:30 overlaps the 09:00–10:00 booking
        assert!(check_slot_free(&ps, date, 570, 45, 0, None, None).is_err());
        // 10:00 is adjacent, not overlapping
        assert!(check_slot_free(&ps, date, 600, 45, 0, None, None).is_ok());
    }

    #[test]
    fn unexpired_hold_conflicts_expired_does_not() {
        let date = d(2026, 8, 10);
        let mut ps = ProviderState::new(Ulid::new(), "Coach".into(), true);
        ps.insert_hold(Hold {
            id: Ulid::new(),
            provider_id: ps.id,
            date,
            time: 540,
            expires_at: 5_000,
        });
        assert!(check_slot_free(&ps, date, 540, 60, 4_999, None, None).is_err());
        assert!(check_slot_free(&ps, date, 540, 60, 5_000, None, None).is_ok());
    }

    #[test]
    fn own_hold_is_consumable() {
        let date = d(2026, 8, 10);
        let mut ps = ProviderState::new(Ulid::new(), "Coach".into(), true);
        let hold_id = Ulid::new();
        ps.insert_hold(Hold {
            id: hold_id,
            provider_id: ps.id,
            date,
            time: 540,
            expires_at: i64::MAX,
        });
        assert!(check_slot_free(&ps, date, 540, 60, 0, Some(hold_id), None).is_ok());
        assert!(check_slot_free(&ps, date, 540, 60, 0, Some(Ulid::new()), None).is_err());
    }

    #[test]
    fn window_validation() {
        assert!(validate_window(&TimeWindow { start: 540, end: 720 }).is_ok());
        assert!(validate_window(&TimeWindow { start: 720, end: 540 }).is_err());
        assert!(validate_window(&TimeWindow { start: 540, end: 540 }).is_err());
        assert!(validate_window(&TimeWindow { start: -10, end: 540 }).is_err());
        assert!(validate_window(&TimeWindow { start: 540, end: 1500 }).is_err());
    }

    #[test]
    fn date_bounds() {
        assert!(validate_date(d(2026, 8, 10)).is_ok());
        assert!(validate_date(d(1999, 12, 31)).is_err());
        assert!(validate_date(d(2101, 1, 1)).is_err());
    }
}
