use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

// ── Slot Generation Algorithm ─────────────────────────────────────

/// One candidate bookable window. Blocked candidates are kept and flagged
/// so callers can render occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCandidate {
    pub date: NaiveDate,
    pub time: Mins,
    pub available: bool,
}

/// Session length. Coaching is selected by client age bracket; other
/// session types are fixed. Unknown age falls into the adult bracket.
pub fn session_duration(session_type: SessionType, client_age: Option<u32>) -> Mins {
    match session_type {
        SessionType::Coaching => match client_age {
            Some(age) if age <= COACHING_CHILD_MAX_AGE => COACHING_CHILD_MINUTES,
            Some(age) if age <= COACHING_TEEN_MAX_AGE => COACHING_TEEN_MINUTES,
            _ => COACHING_ADULT_MINUTES,
        },
        SessionType::Intake => INTAKE_MINUTES,
        SessionType::CheckIn => CHECK_IN_MINUTES,
    }
}

/// Snap a time-of-day up to the next grid boundary.
pub fn snap_to_grid(t: Mins, grid: Mins) -> Mins {
    ((t + grid - 1) / grid) * grid
}

/// The bookable windows for one day, or `None` when the day is vetoed
/// outright (date-specific Unavailable rule, or a globally non-working
/// weekday — both independent of weekly rules).
///
/// A provider with zero Available rules anywhere gets the fallback
/// default-hours window: unconfigured is not the same as having explicitly
/// blocked every day.
pub fn day_windows(ps: &ProviderState, date: NaiveDate) -> Option<Vec<TimeWindow>> {
    let vetoed = ps.rules.iter().any(|r| {
        r.active
            && r.kind == RuleKind::Unavailable
            && matches!(r.scope, RuleScope::DateSpecific { date: d } if d == date)
    });
    if vetoed || NON_WORKING_DAYS.contains(&date.weekday()) {
        return None;
    }

    if !ps.has_available_rules() {
        return Some(vec![TimeWindow::new(DEFAULT_DAY_START, DEFAULT_DAY_END)]);
    }

    let mut windows: Vec<TimeWindow> = ps
        .rules
        .iter()
        .filter(|r| r.active && r.kind == RuleKind::Available && r.matches_date(date))
        .map(|r| r.window)
        .collect();
    windows.sort_by_key(|w| w.start);
    Some(windows)
}

/// Candidate start times inside one window: start snapped up to the grid,
/// then fixed grid steps while the whole session still fits.
pub fn window_starts(window: TimeWindow, duration_min: Mins) -> impl Iterator<Item = Mins> {
    let mut t = snap_to_grid(window.start, SLOT_GRID_MINUTES);
    std::iter::from_fn(move || {
        if t + duration_min <= window.end {
            let cur = t;
            t += SLOT_GRID_MINUTES;
            Some(cur)
        } else {
            None
        }
    })
}

/// Walk the horizon and emit ordered candidates for one provider.
/// Same-day candidates inside the lead-time buffer are dropped; candidates
/// whose exact (date, time) key is occupied are flagged blocked.
pub fn generate_provider_slots(
    ps: &ProviderState,
    clock: &Clock,
    days: u32,
    duration_min: Mins,
) -> Vec<SlotCandidate> {
    let days = days.clamp(1, MAX_HORIZON_DAYS);
    let mut out = Vec::new();

    for offset in 0..days {
        let date = clock.today + chrono::Duration::days(offset as i64);
        let Some(windows) = day_windows(ps, date) else {
            continue;
        };

        // Overlapping windows may propose the same start twice.
        let mut seen: BTreeSet<Mins> = BTreeSet::new();
        for window in windows {
            for t in window_starts(window, duration_min) {
                if date == clock.today && t < clock.minute_of_day + LEAD_TIME_MINUTES {
                    continue;
                }
                if !seen.insert(t) {
                    continue;
                }
                out.push(SlotCandidate {
                    date,
                    time: t,
                    available: !ps.occupied(date, t, clock.now_ms),
                });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use ulid::Ulid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    // 2026-08-10 is a Monday, 2026-08-09 a Sunday.
    const MON: (i32, u32, u32) = (2026, 8, 10);

    fn provider() -> ProviderState {
        ProviderState::new(Ulid::new(), "Coach".into(), true)
    }

    fn weekly(ps: &ProviderState, day: Weekday, start: Mins, end: Mins, kind: RuleKind) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            provider_id: ps.id,
            scope: RuleScope::Weekly { day },
            kind,
            window: TimeWindow::new(start, end),
            active: true,
        }
    }

    fn date_unavailable(ps: &ProviderState, date: NaiveDate) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            provider_id: ps.id,
            scope: RuleScope::DateSpecific { date },
            kind: RuleKind::Unavailable,
            window: TimeWindow::new(0, MINUTES_PER_DAY),
            active: true,
        }
    }

    fn times_on(slots: &[SlotCandidate], date: NaiveDate) -> Vec<Mins> {
        slots.iter().filter(|s| s.date == date).map(|s| s.time).collect()
    }

    #[test]
    fn duration_by_age_bracket() {
        assert_eq!(session_duration(SessionType::Coaching, Some(8)), 30);
        assert_eq!(session_duration(SessionType::Coaching, Some(11)), 30);
        assert_eq!(session_duration(SessionType::Coaching, Some(12)), 45);
        assert_eq!(session_duration(SessionType::Coaching, Some(17)), 45);
        assert_eq!(session_duration(SessionType::Coaching, Some(18)), 60);
        assert_eq!(session_duration(SessionType::Coaching, None), 60);
        assert_eq!(session_duration(SessionType::Intake, Some(8)), 20);
        assert_eq!(session_duration(SessionType::CheckIn, None), 15);
    }

    #[test]
    fn grid_snapping() {
        assert_eq!(snap_to_grid(545, 30), 570); // 09:05 → 09:30
        assert_eq!(snap_to_grid(540, 30), 540); // 09:00 stays
        assert_eq!(snap_to_grid(541, 30), 570);
    }

    #[test]
    fn rule_window_snaps_to_grid() {
        // 09:05–12:00, 30-min grid: first candidate is 09:30, not 09:05.
        let mut ps = provider();
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 545, 720, RuleKind::Available));
        let monday = d(MON.0, MON.1, MON.2);
        let clock = Clock::fixed(monday - chrono::Duration::days(3), 0);
        let slots = generate_provider_slots(&ps, &clock, 10, 30);
        assert_eq!(times_on(&slots, monday), vec![570, 600, 630, 660, 690]);
    }

    #[test]
    fn forty_five_minute_sessions_fit_before_window_end() {
        // Mon 09:00–12:00, duration 45, grid 30: last candidate 11:00;
        // 11:30 would end at 12:15 and must not appear.
        let mut ps = provider();
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 540, 720, RuleKind::Available));
        let monday = d(MON.0, MON.1, MON.2);
        let clock = Clock::fixed(monday - chrono::Duration::days(3), 0);
        let slots = generate_provider_slots(&ps, &clock, 10, 45);
        let times = times_on(&slots, monday);
        assert_eq!(times, vec![540, 570, 600, 630, 660]);
        assert!(!times.contains(&690));
    }

    #[test]
    fn fallback_matches_explicit_default_rule() {
        let monday = d(MON.0, MON.1, MON.2);
        let clock = Clock::fixed(monday, 0);

        let bare = provider();

        let mut configured = provider();
        for day in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ] {
            configured.upsert_rule(weekly(
                &configured,
                day,
                DEFAULT_DAY_START,
                DEFAULT_DAY_END,
                RuleKind::Available,
            ));
        }

        let a = generate_provider_slots(&bare, &clock, 14, 60);
        let b = generate_provider_slots(&configured, &clock, 14, 60);
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn date_specific_unavailable_vetoes_day() {
        let mut ps = provider();
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 540, 720, RuleKind::Available));
        let monday = d(MON.0, MON.1, MON.2);
        ps.upsert_rule(date_unavailable(&ps, monday));
        let clock = Clock::fixed(monday - chrono::Duration::days(3), 0);
        let slots = generate_provider_slots(&ps, &clock, 10, 60);
        assert!(times_on(&slots, monday).is_empty());
        // the following Monday is unaffected
        assert!(!times_on(&slots, monday + chrono::Duration::days(7)).is_empty());
    }

    #[test]
    fn sunday_is_globally_non_working() {
        let ps = provider(); // fallback hours every day…
        let sunday = d(2026, 8, 9);
        let clock = Clock::fixed(sunday - chrono::Duration::days(2), 0);
        let slots = generate_provider_slots(&ps, &clock, 10, 60);
        assert!(times_on(&slots, sunday).is_empty());
    }

    #[test]
    fn weekly_rules_on_other_days_do_not_fall_back() {
        // Configured provider with Monday-only hours: Tuesday has no slots,
        // not fallback hours.
        let mut ps = provider();
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 540, 720, RuleKind::Available));
        let monday = d(MON.0, MON.1, MON.2);
        let clock = Clock::fixed(monday, 0);
        let slots = generate_provider_slots(&ps, &clock, 7, 60);
        assert!(times_on(&slots, monday + chrono::Duration::days(1)).is_empty());
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut ps = provider();
        let mut rule = weekly(&ps, Weekday::Mon, 540, 720, RuleKind::Available);
        rule.active = false;
        ps.upsert_rule(rule);
        // the only rule is inactive → provider counts as unconfigured
        assert!(!ps.has_available_rules());
        let monday = d(MON.0, MON.1, MON.2);
        let clock = Clock::fixed(monday, 0);
        let slots = generate_provider_slots(&ps, &clock, 1, 60);
        assert_eq!(times_on(&slots, monday).first(), Some(&DEFAULT_DAY_START));
    }

    #[test]
    fn same_day_lead_time_buffer() {
        let mut ps = provider();
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 540, 1020, RuleKind::Available));
        let monday = d(MON.0, MON.1, MON.2);
        // 10:00 on the day itself: nothing before 12:00 may be offered
        let clock = Clock::fixed(monday, 600);
        let slots = generate_provider_slots(&ps, &clock, 1, 60);
        let times = times_on(&slots, monday);
        assert!(times.iter().all(|&t| t >= 600 + LEAD_TIME_MINUTES));
        assert!(times.contains(&720));
    }

    #[test]
    fn occupied_keys_are_flagged_blocked() {
        let mut ps = provider();
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 540, 720, RuleKind::Available));
        let monday = d(MON.0, MON.1, MON.2);
        ps.insert_booking(Booking {
            id: Ulid::new(),
            provider_id: ps.id,
            client_id: Ulid::new(),
            enrollment_id: None,
            date: monday,
            time: 600,
            duration_min: 60,
            session_type: SessionType::Coaching,
            status: BookingStatus::Scheduled,
            calendar_event_id: None,
            video_bot_id: None,
        });
        let clock = Clock::fixed(monday - chrono::Duration::days(3), 0);
        let slots = generate_provider_slots(&ps, &clock, 10, 60);
        let monday_slots: Vec<_> = slots.iter().filter(|s| s.date == monday).collect();
        for s in &monday_slots {
            assert_eq!(s.available, s.time != 600, "time {}", fmt_hhmm(s.time));
        }
    }

    #[test]
    fn overlapping_windows_dedupe_candidates() {
        let mut ps = provider();
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 540, 720, RuleKind::Available));
        ps.upsert_rule(weekly(&ps, Weekday::Mon, 600, 780, RuleKind::Available));
        let monday = d(MON.0, MON.1, MON.2);
        let clock = Clock::fixed(monday - chrono::Duration::days(3), 0);
        let slots = generate_provider_slots(&ps, &clock, 10, 60);
        let mut times = times_on(&slots, monday);
        let len_before = times.len();
        times.dedup();
        assert_eq!(times.len(), len_before);
        assert!(times.contains(&720)); // from the second window only
    }

    #[test]
    fn horizon_is_capped() {
        let ps = provider();
        let clock = Clock::fixed(d(2026, 8, 10), 0);
        let slots = generate_provider_slots(&ps, &clock, 10_000, 60);
        let last_date = slots.last().unwrap().date;
        assert!(last_date < clock.today + chrono::Duration::days(MAX_HORIZON_DAYS as i64));
    }
}
