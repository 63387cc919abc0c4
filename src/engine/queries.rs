use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::aggregate::{AggregatedSlot, merge_provider_slots};
use super::slots::{generate_provider_slots, session_duration};
use super::{Engine, EngineError};

/// Aggregator output: the union of candidate slots, plus a reason when the
/// set is empty for a policy cause rather than plain fullness.
#[derive(Debug, Clone)]
pub struct SlotsResult {
    pub duration_min: Mins,
    pub slots: Vec<AggregatedSlot>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: String,
    pub active: bool,
}

/// The GET half of the pause/resume surface: current eligibility + budget.
#[derive(Debug, Clone, Serialize)]
pub struct PauseStatus {
    pub enrollment_id: Ulid,
    pub status: &'static str,
    pub can_pause: bool,
    pub pauses_used: u32,
    pub pauses_remaining: u32,
    pub total_pause_days: i64,
    pub pause_days_remaining: i64,
    pub max_single_pause_days: i64,
    pub min_notice_hours: i64,
    pub pause_start_date: Option<NaiveDate>,
    pub pause_end_date: Option<NaiveDate>,
    pub pause_reason: Option<&'static str>,
    pub program_end_date: NaiveDate,
    pub original_end_date: Option<NaiveDate>,
}

impl Engine {
    /// The slot query surface. A named provider answers for that provider
    /// alone; without one, slots are unioned across every active provider
    /// so intake bookings see the widest availability.
    pub async fn get_slots(
        &self,
        provider_id: Option<Ulid>,
        days: u32,
        session_type: SessionType,
        client_age: Option<u32>,
        clock: &Clock,
    ) -> Result<SlotsResult, EngineError> {
        if days > MAX_HORIZON_DAYS {
            return Err(EngineError::LimitExceeded("horizon too wide"));
        }
        let days = if days == 0 { DEFAULT_HORIZON_DAYS } else { days };
        let duration_min = session_duration(session_type, client_age);

        match provider_id {
            Some(pid) => {
                let ps = self.get_provider(&pid).ok_or(EngineError::NotFound(pid))?;
                let guard = ps.read().await;
                if !guard.active {
                    return Ok(SlotsResult {
                        duration_min,
                        slots: Vec::new(),
                        reason: Some("provider is not currently accepting bookings".into()),
                    });
                }
                let candidates = generate_provider_slots(&guard, clock, days, duration_min);
                Ok(SlotsResult {
                    duration_min,
                    slots: merge_provider_slots(vec![(pid, candidates)], duration_min),
                    reason: None,
                })
            }
            None => {
                let mut ids: Vec<Ulid> = self.providers.iter().map(|e| *e.key()).collect();
                ids.sort();

                let mut per_provider = Vec::new();
                for pid in ids {
                    if per_provider.len() >= MAX_PROVIDERS_PER_QUERY {
                        break;
                    }
                    // A provider whose state can't be fetched yields zero
                    // slots, never a failed aggregate.
                    let Some(ps) = self.get_provider(&pid) else {
                        continue;
                    };
                    let guard = ps.read().await;
                    if !guard.active {
                        continue;
                    }
                    per_provider.push((pid, generate_provider_slots(&guard, clock, days, duration_min)));
                }

                if per_provider.is_empty() {
                    return Ok(SlotsResult {
                        duration_min,
                        slots: Vec::new(),
                        reason: Some("no providers are currently accepting bookings".into()),
                    });
                }
                Ok(SlotsResult {
                    duration_min,
                    slots: merge_provider_slots(per_provider, duration_min),
                    reason: None,
                })
            }
        }
    }

    pub async fn pause_status(&self, enrollment_id: Ulid) -> Result<PauseStatus, EngineError> {
        let en = self
            .get_enrollment_ref(&enrollment_id)
            .ok_or(EngineError::NotFound(enrollment_id))?;
        let guard = en.read().await;
        let pause_days_remaining = (MAX_PAUSE_DAYS_TOTAL - guard.total_pause_days).max(0);
        let pauses_remaining = MAX_PAUSE_COUNT.saturating_sub(guard.pause_count);
        Ok(PauseStatus {
            enrollment_id,
            status: guard.status.label(),
            can_pause: guard.status == EnrollmentStatus::Active
                && pauses_remaining > 0
                && pause_days_remaining > 0,
            pauses_used: guard.pause_count,
            pauses_remaining,
            total_pause_days: guard.total_pause_days,
            pause_days_remaining,
            max_single_pause_days: MAX_PAUSE_DAYS_SINGLE,
            min_notice_hours: MIN_PAUSE_NOTICE_HOURS,
            pause_start_date: guard.pause_start_date,
            pause_end_date: guard.pause_end_date,
            pause_reason: guard.pause_reason.map(PauseReason::label),
            program_end_date: guard.program_end_date,
            original_end_date: guard.original_end_date,
        })
    }

    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self
            .providers
            .iter()
            .map(|entry| {
                let ps = entry.value().clone();
                let guard = ps.try_read().expect("list_providers: uncontended read");
                ProviderInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    active: guard.active,
                }
            })
            .collect();
        infos.sort_by_key(|p| p.id);
        infos
    }

    pub async fn get_rules(&self, provider_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        Ok(guard.rules.clone())
    }

    pub async fn get_bookings(&self, provider_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        Ok(guard.bookings.clone())
    }

    pub async fn get_holds(&self, provider_id: Ulid) -> Result<Vec<Hold>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        Ok(guard.holds.clone())
    }

    pub async fn get_enrollment(&self, id: Ulid) -> Result<Enrollment, EngineError> {
        let en = self.get_enrollment_ref(&id).ok_or(EngineError::NotFound(id))?;
        let guard = en.read().await;
        Ok(guard.clone())
    }

    pub async fn booking_info(&self, id: Ulid) -> Result<Booking, EngineError> {
        let provider_id = self
            .get_provider_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Lifecycle audit trail for one enrollment, oldest first.
    pub fn audit_log(&self, enrollment_id: Ulid) -> Vec<AuditRecord> {
        self.audit
            .get(&enrollment_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}
