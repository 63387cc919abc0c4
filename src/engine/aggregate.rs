use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::slots::SlotCandidate;

// ── Cross-provider aggregation ────────────────────────────────────

/// One (date, time) key in the aggregate view. Available when ANY provider
/// offers it; `provider_ids` records who, so a downstream assignment step
/// can pick one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedSlot {
    pub date: NaiveDate,
    #[serde(serialize_with = "serialize_hhmm")]
    pub time: Mins,
    pub duration_min: Mins,
    pub available: bool,
    pub provider_ids: Vec<Ulid>,
}

fn serialize_hhmm<S: serde::Serializer>(t: &Mins, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&fmt_hhmm(*t))
}

/// Presentation-only grouping of times of day. Derived view, never a
/// source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    EarlyMorning,
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeBucket {
    pub fn of(time: Mins) -> Self {
        match time {
            t if t < 9 * 60 => TimeBucket::EarlyMorning,
            t if t < 12 * 60 => TimeBucket::Morning,
            t if t < 17 * 60 => TimeBucket::Afternoon,
            t if t < 21 * 60 => TimeBucket::Evening,
            _ => TimeBucket::Night,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeBucket::EarlyMorning => "early_morning",
            TimeBucket::Morning => "morning",
            TimeBucket::Afternoon => "afternoon",
            TimeBucket::Evening => "evening",
            TimeBucket::Night => "night",
        }
    }
}

/// Union per-provider candidates by (date, time). A slot is available in
/// the aggregate if any provider offers it; blocked-everywhere keys stay
/// in the result flagged unavailable.
pub fn merge_provider_slots(
    per_provider: Vec<(Ulid, Vec<SlotCandidate>)>,
    duration_min: Mins,
) -> Vec<AggregatedSlot> {
    let mut merged: BTreeMap<(NaiveDate, Mins), AggregatedSlot> = BTreeMap::new();

    for (provider_id, candidates) in per_provider {
        for c in candidates {
            let entry = merged.entry((c.date, c.time)).or_insert_with(|| AggregatedSlot {
                date: c.date,
                time: c.time,
                duration_min,
                available: false,
                provider_ids: Vec::new(),
            });
            if c.available {
                entry.available = true;
                entry.provider_ids.push(provider_id);
            }
        }
    }

    merged.into_values().collect()
}

fn slot_key(s: &AggregatedSlot) -> String {
    format!("{} {}", s.date, fmt_hhmm(s.time))
}

/// Group available slots by time-of-day bucket (keys are bucket labels).
pub fn bucket_groups(slots: &[AggregatedSlot]) -> BTreeMap<&'static str, Vec<String>> {
    let mut groups: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for s in slots.iter().filter(|s| s.available) {
        groups
            .entry(TimeBucket::of(s.time).label())
            .or_default()
            .push(slot_key(s));
    }
    groups
}

/// Group available slots by date (keys are ISO dates).
pub fn date_groups(slots: &[AggregatedSlot]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for s in slots.iter().filter(|s| s.available) {
        groups.entry(s.date.to_string()).or_default().push(fmt_hhmm(s.time));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn cand(date: NaiveDate, time: Mins, available: bool) -> SlotCandidate {
        SlotCandidate { date, time, available }
    }

    #[test]
    fn buckets() {
        assert_eq!(TimeBucket::of(6 * 60), TimeBucket::EarlyMorning);
        assert_eq!(TimeBucket::of(9 * 60), TimeBucket::Morning);
        assert_eq!(TimeBucket::of(12 * 60), TimeBucket::Afternoon);
        assert_eq!(TimeBucket::of(17 * 60), TimeBucket::Evening);
        assert_eq!(TimeBucket::of(21 * 60), TimeBucket::Night);
        assert_eq!(TimeBucket::of(23 * 60 + 30), TimeBucket::Night);
    }

    #[test]
    fn any_provider_makes_slot_available() {
        let date = d(2026, 8, 10);
        let a = Ulid::new();
        let b = Ulid::new();
        let merged = merge_provider_slots(
            vec![
                (a, vec![cand(date, 540, false)]),
                (b, vec![cand(date, 540, true)]),
            ],
            60,
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].available);
        assert_eq!(merged[0].provider_ids, vec![b]);
    }

    #[test]
    fn blocked_everywhere_stays_blocked() {
        let date = d(2026, 8, 10);
        let merged = merge_provider_slots(
            vec![
                (Ulid::new(), vec![cand(date, 540, false)]),
                (Ulid::new(), vec![cand(date, 540, false)]),
            ],
            60,
        );
        assert_eq!(merged.len(), 1);
        assert!(!merged[0].available);
        assert!(merged[0].provider_ids.is_empty());
    }

    #[test]
    fn union_is_ordered_by_date_then_time() {
        let d1 = d(2026, 8, 10);
        let d2 = d(2026, 8, 11);
        let a = Ulid::new();
        let b = Ulid::new();
        let merged = merge_provider_slots(
            vec![
                (a, vec![cand(d2, 540, true), cand(d1, 600, true)]),
                (b, vec![cand(d1, 540, true)]),
            ],
            60,
        );
        let keys: Vec<_> = merged.iter().map(|s| (s.date, s.time)).collect();
        assert_eq!(keys, vec![(d1, 540), (d1, 600), (d2, 540)]);
    }

    #[test]
    fn groupings_skip_blocked_slots() {
        let date = d(2026, 8, 10);
        let merged = merge_provider_slots(
            vec![(
                Ulid::new(),
                vec![cand(date, 540, true), cand(date, 600, false), cand(date, 17 * 60, true)],
            )],
            60,
        );
        let by_bucket = bucket_groups(&merged);
        assert_eq!(by_bucket["morning"], vec!["2026-08-10 09:00"]);
        assert_eq!(by_bucket["evening"], vec!["2026-08-10 17:00"]);
        assert!(!by_bucket.contains_key("afternoon"));

        let by_date = date_groups(&merged);
        assert_eq!(by_date["2026-08-10"], vec!["09:00", "17:00"]);
    }
}
