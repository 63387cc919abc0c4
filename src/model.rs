use chrono::{Datelike, NaiveDate, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — wall-clock instants (hold expiry, audit timestamps).
pub type Ms = i64;

/// Minutes since midnight — the only time-of-day type. Dates are
/// timezone-naive calendar days; pairing them with `Mins` avoids both
/// floating point and timezone drift in slot comparisons.
pub type Mins = i32;

pub const MINUTES_PER_DAY: Mins = 24 * 60;

/// Parse `HH:MM` (seconds, if present, are stripped).
pub fn parse_hhmm(s: &str) -> Option<Mins> {
    let mut parts = s.trim().split(':');
    let h: u32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    if let Some(sec) = parts.next() {
        let _: u32 = sec.parse().ok()?;
    }
    if parts.next().is_some() || h > 23 || m > 59 {
        return None;
    }
    Some((h * 60 + m) as Mins)
}

pub fn fmt_hhmm(t: Mins) -> String {
    format!("{:02}:{:02}", t / 60, t % 60)
}

/// Normalize a 0-indexed-Sunday day-of-week (the wire convention) to
/// [`Weekday`]. This is the only place a numbering scheme is interpreted;
/// everything downstream carries `Weekday`.
pub fn weekday_from_index(idx: u8) -> Option<Weekday> {
    match idx {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Half-open time-of-day window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Mins,
    pub end: Mins,
}

impl TimeWindow {
    pub fn new(start: Mins, end: Mins) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Mins {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, t: Mins) -> bool {
        self.start <= t && t < self.end
    }
}

/// The observer's notion of "now", injected into every time-sensitive
/// computation so tests can pin it.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    pub today: NaiveDate,
    pub minute_of_day: Mins,
    pub now_ms: Ms,
}

impl Clock {
    pub fn system() -> Self {
        let now = chrono::Local::now();
        Self {
            today: now.date_naive(),
            minute_of_day: (now.hour() * 60 + now.minute()) as Mins,
            now_ms: now.timestamp_millis(),
        }
    }

    /// A pinned clock, used by tests and deterministic replays.
    pub fn fixed(today: NaiveDate, minute_of_day: Mins) -> Self {
        let midnight = today
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists for every date");
        Self {
            today,
            minute_of_day,
            now_ms: midnight.and_utc().timestamp_millis() + (minute_of_day as Ms) * 60_000,
        }
    }
}

// ── Availability rules ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleScope {
    Weekly { day: Weekday },
    DateSpecific { date: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub scope: RuleScope,
    pub kind: RuleKind,
    pub window: TimeWindow,
    pub active: bool,
}

impl AvailabilityRule {
    /// Does this rule's scope cover the given date? Ignores `kind`.
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        match self.scope {
            RuleScope::Weekly { day } => day == date.weekday(),
            RuleScope::DateSpecific { date: d } => d == date,
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Coaching,
    Intake,
    CheckIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    Completed,
    Cancelled,
    Paused,
    Rescheduled,
    NoShow,
}

impl BookingStatus {
    /// Active bookings occupy provider time.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Scheduled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::Rescheduled
                | BookingStatus::NoShow
        )
    }

    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        match self {
            Scheduled => matches!(to, Completed | Cancelled | Paused | Rescheduled | NoShow),
            Paused => matches!(to, Scheduled | Cancelled),
            Completed | Cancelled | Rescheduled | NoShow => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Paused => "paused",
            BookingStatus::Rescheduled => "rescheduled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

/// A confirmed occupancy of provider time. Never deleted — status
/// transitions are the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub client_id: Ulid,
    pub enrollment_id: Option<Ulid>,
    pub date: NaiveDate,
    pub time: Mins,
    pub duration_min: Mins,
    pub session_type: SessionType,
    pub status: BookingStatus,
    pub calendar_event_id: Option<String>,
    pub video_bot_id: Option<String>,
}

impl Booking {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.time, self.time + self.duration_min)
    }
}

/// Short-lived claim on one (provider, date, time) key. Expiry is enforced
/// at read time; a reaper may delete expired rows but nothing depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub time: Mins,
    pub expires_at: Ms,
}

impl Hold {
    pub fn expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

// ── Enrollments ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Vacation,
    Illness,
    Travel,
    Financial,
    Family,
    Other,
}

impl PauseReason {
    pub fn label(self) -> &'static str {
        match self {
            PauseReason::Vacation => "vacation",
            PauseReason::Illness => "illness",
            PauseReason::Travel => "travel",
            PauseReason::Financial => "financial",
            PauseReason::Family => "family",
            PauseReason::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    PendingStart,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EnrollmentStatus::Completed | EnrollmentStatus::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            EnrollmentStatus::PendingStart => "pending_start",
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }
}

/// A client's program instance. Mutated exclusively through the timeline
/// engine's transitions; soft-cancelled, never destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub status: EnrollmentStatus,
    pub program_start_date: NaiveDate,
    pub program_end_date: NaiveDate,
    /// First-ever end date, preserved across pauses. Resume arithmetic is
    /// anchored here so requested-vs-actual days never compound.
    pub original_end_date: Option<NaiveDate>,
    pub pause_start_date: Option<NaiveDate>,
    pub pause_end_date: Option<NaiveDate>,
    pub pause_reason: Option<PauseReason>,
    pub total_pause_days: i64,
    pub pause_count: u32,
}

impl Enrollment {
    pub fn new(
        id: Ulid,
        client_id: Ulid,
        start: NaiveDate,
        program_days: i64,
        today: NaiveDate,
    ) -> Self {
        let status = if start <= today {
            EnrollmentStatus::Active
        } else {
            EnrollmentStatus::PendingStart
        };
        Self {
            id,
            client_id,
            status,
            program_start_date: start,
            program_end_date: start + chrono::Duration::days(program_days),
            original_end_date: None,
            pause_start_date: None,
            pause_end_date: None,
            pause_reason: None,
            total_pause_days: 0,
            pause_count: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == EnrollmentStatus::Paused
    }
}

/// Immutable record of one enrollment lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub kind: String,
    pub actor: String,
    pub at: Ms,
    pub detail: String,
}

// ── Provider state ───────────────────────────────────────────────

/// All scheduling state for one provider. Bookings are kept sorted by
/// (date, time); rules and holds stay small enough for linear scans.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub name: String,
    pub active: bool,
    pub rules: Vec<AvailabilityRule>,
    pub bookings: Vec<Booking>,
    pub holds: Vec<Hold>,
}

impl ProviderState {
    pub fn new(id: Ulid, name: String, active: bool) -> Self {
        Self {
            id,
            name,
            active,
            rules: Vec::new(),
            bookings: Vec::new(),
            holds: Vec::new(),
        }
    }

    /// Replace the rule with the same id, or insert.
    pub fn upsert_rule(&mut self, rule: AvailabilityRule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<AvailabilityRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    /// Insert maintaining (date, time) sort order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.date, booking.time);
        let pos = self
            .bookings
            .binary_search_by(|b| (b.date, b.time).cmp(&key))
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn insert_hold(&mut self, hold: Hold) {
        self.holds.push(hold);
    }

    pub fn remove_hold(&mut self, id: Ulid) -> Option<Hold> {
        let pos = self.holds.iter().position(|h| h.id == id)?;
        Some(self.holds.remove(pos))
    }

    pub fn hold_at(&self, date: NaiveDate, time: Mins, now: Ms) -> Option<&Hold> {
        self.holds
            .iter()
            .find(|h| h.date == date && h.time == time && !h.expired(now))
    }

    /// Any Available rule configured at all? Distinguishes an unconfigured
    /// provider (fallback hours apply) from one who blocked every day.
    pub fn has_available_rules(&self) -> bool {
        self.rules
            .iter()
            .any(|r| r.active && r.kind == RuleKind::Available)
    }

    /// Exact-key occupancy: an active booking or unexpired hold at
    /// (date, time).
    pub fn occupied(&self, date: NaiveDate, time: Mins, now: Ms) -> bool {
        if self.hold_at(date, time, now).is_some() {
            return true;
        }
        self.bookings
            .iter()
            .any(|b| b.status.is_active() && b.date == date && b.time == time)
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
/// Enrollment events embed the resulting end date so replay is
/// deterministic regardless of when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderRegistered {
        id: Ulid,
        name: String,
        active: bool,
    },
    ProviderUpdated {
        id: Ulid,
        name: String,
        active: bool,
    },
    RuleUpserted {
        rule: AvailabilityRule,
    },
    RuleRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    HoldPlaced {
        hold: Hold,
    },
    HoldReleased {
        id: Ulid,
        provider_id: Ulid,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    EnrollmentCreated {
        enrollment: Enrollment,
        actor: String,
        at: Ms,
    },
    EnrollmentActivated {
        id: Ulid,
        actor: String,
        at: Ms,
    },
    EnrollmentPaused {
        id: Ulid,
        pause_start: NaiveDate,
        pause_end: NaiveDate,
        reason: PauseReason,
        requested_days: i64,
        new_end_date: NaiveDate,
        actor: String,
        at: Ms,
    },
    EnrollmentResumed {
        id: Ulid,
        actual_days: i64,
        new_end_date: NaiveDate,
        actor: String,
        at: Ms,
    },
    EnrollmentCancelled {
        id: Ulid,
        actor: String,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn booking_at(provider_id: Ulid, date: NaiveDate, time: Mins) -> Booking {
        Booking {
            id: Ulid::new(),
            provider_id,
            client_id: Ulid::new(),
            enrollment_id: None,
            date,
            time,
            duration_min: 60,
            session_type: SessionType::Coaching,
            status: BookingStatus::Scheduled,
            calendar_event_id: None,
            video_bot_id: None,
        }
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("09:05"), Some(545));
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        // seconds stripped
        assert_eq!(parse_hhmm("14:30:00"), Some(870));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("12"), None);
        assert_eq!(parse_hhmm("12:30:00:00"), None);
        assert_eq!(parse_hhmm("noon"), None);
    }

    #[test]
    fn hhmm_roundtrip() {
        assert_eq!(fmt_hhmm(545), "09:05");
        assert_eq!(fmt_hhmm(0), "00:00");
        assert_eq!(parse_hhmm(&fmt_hhmm(1125)), Some(1125));
    }

    #[test]
    fn weekday_index_is_sunday_zero() {
        assert_eq!(weekday_from_index(0), Some(Weekday::Sun));
        assert_eq!(weekday_from_index(1), Some(Weekday::Mon));
        assert_eq!(weekday_from_index(6), Some(Weekday::Sat));
        assert_eq!(weekday_from_index(7), None);
    }

    #[test]
    fn window_half_open() {
        let w = TimeWindow::new(540, 720);
        assert_eq!(w.duration_min(), 180);
        assert!(w.contains(540));
        assert!(w.contains(719));
        assert!(!w.contains(720));
    }

    #[test]
    fn window_overlap() {
        let a = TimeWindow::new(540, 600);
        let b = TimeWindow::new(570, 630);
        let c = TimeWindow::new(600, 660);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn booking_insert_keeps_order() {
        let mut ps = ProviderState::new(Ulid::new(), "Ada".into(), true);
        ps.insert_booking(booking_at(ps.id, d(2026, 8, 12), 600));
        ps.insert_booking(booking_at(ps.id, d(2026, 8, 10), 900));
        ps.insert_booking(booking_at(ps.id, d(2026, 8, 10), 540));
        let keys: Vec<_> = ps.bookings.iter().map(|b| (b.date, b.time)).collect();
        assert_eq!(
            keys,
            vec![
                (d(2026, 8, 10), 540),
                (d(2026, 8, 10), 900),
                (d(2026, 8, 12), 600),
            ]
        );
    }

    #[test]
    fn occupied_is_exact_key() {
        let mut ps = ProviderState::new(Ulid::new(), "Ada".into(), true);
        ps.insert_booking(booking_at(ps.id, d(2026, 8, 10), 540));
        assert!(ps.occupied(d(2026, 8, 10), 540, 0));
        assert!(!ps.occupied(d(2026, 8, 10), 570, 0));
        assert!(!ps.occupied(d(2026, 8, 11), 540, 0));
    }

    #[test]
    fn cancelled_booking_does_not_occupy() {
        let mut ps = ProviderState::new(Ulid::new(), "Ada".into(), true);
        let booking = booking_at(ps.id, d(2026, 8, 10), 540);
        let id = booking.id;
        ps.insert_booking(booking);
        ps.booking_mut(id).unwrap().status = BookingStatus::Cancelled;
        assert!(!ps.occupied(d(2026, 8, 10), 540, 0));
    }

    #[test]
    fn expired_hold_does_not_occupy() {
        let mut ps = ProviderState::new(Ulid::new(), "Ada".into(), true);
        ps.insert_hold(Hold {
            id: Ulid::new(),
            provider_id: ps.id,
            date: d(2026, 8, 10),
            time: 540,
            expires_at: 1_000,
        });
        assert!(ps.occupied(d(2026, 8, 10), 540, 999));
        assert!(!ps.occupied(d(2026, 8, 10), 540, 1_000));
    }

    #[test]
    fn rule_upsert_replaces_by_id() {
        let mut ps = ProviderState::new(Ulid::new(), "Ada".into(), true);
        let id = Ulid::new();
        let mut rule = AvailabilityRule {
            id,
            provider_id: ps.id,
            scope: RuleScope::Weekly { day: Weekday::Mon },
            kind: RuleKind::Available,
            window: TimeWindow::new(540, 720),
            active: true,
        };
        ps.upsert_rule(rule.clone());
        rule.window = TimeWindow::new(600, 780);
        ps.upsert_rule(rule);
        assert_eq!(ps.rules.len(), 1);
        assert_eq!(ps.rules[0].window, TimeWindow::new(600, 780));
    }

    #[test]
    fn enrollment_new_pending_vs_active() {
        let today = d(2026, 8, 4);
        let e = Enrollment::new(Ulid::new(), Ulid::new(), d(2026, 8, 10), 90, today);
        assert_eq!(e.status, EnrollmentStatus::PendingStart);
        assert_eq!(e.program_end_date, d(2026, 11, 8));

        let e = Enrollment::new(Ulid::new(), Ulid::new(), today, 90, today);
        assert_eq!(e.status, EnrollmentStatus::Active);
    }

    #[test]
    fn booking_transition_table() {
        use BookingStatus::*;
        assert!(Scheduled.can_transition_to(Paused));
        assert!(Scheduled.can_transition_to(NoShow));
        assert!(Paused.can_transition_to(Scheduled));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Scheduled));
        assert!(!Rescheduled.can_transition_to(Scheduled));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::EnrollmentPaused {
            id: Ulid::new(),
            pause_start: d(2026, 9, 1),
            pause_end: d(2026, 9, 11),
            reason: PauseReason::Vacation,
            requested_days: 10,
            new_end_date: d(2026, 12, 1),
            actor: "admin".into(),
            at: 1_754_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn rule_event_roundtrip() {
        let event = Event::RuleUpserted {
            rule: AvailabilityRule {
                id: Ulid::new(),
                provider_id: Ulid::new(),
                scope: RuleScope::DateSpecific { date: d(2026, 12, 24) },
                kind: RuleKind::Unavailable,
                window: TimeWindow::new(0, MINUTES_PER_DAY),
                active: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
