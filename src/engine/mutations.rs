use chrono::NaiveDate;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use std::collections::HashSet;
use std::sync::Arc;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_slot_free, validate_date, validate_time, validate_window};
use super::timeline::BookingTeardown;
use super::{Engine, EngineError, TransitionOutcome, WalCommand};

/// Everything needed to confirm a booking, bundled because the wire layer
/// and the orchestrator both build it.
#[derive(Debug, Clone)]
pub struct ConfirmBooking {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub client_id: Ulid,
    pub enrollment_id: Option<Ulid>,
    pub hold_id: Option<Ulid>,
    pub date: NaiveDate,
    pub time: Mins,
    pub duration_min: Mins,
    pub session_type: SessionType,
    pub calendar_event_id: Option<String>,
    pub video_bot_id: Option<String>,
}

impl Engine {
    pub async fn register_provider(
        &self,
        id: Ulid,
        name: String,
        active: bool,
    ) -> Result<(), EngineError> {
        if self.providers.len() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("provider name too long"));
        }
        if self.providers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProviderRegistered {
            id,
            name: name.clone(),
            active,
        };
        self.wal_append(&event).await?;
        let ps = ProviderState::new(id, name, active);
        self.providers.insert(id, Arc::new(RwLock::new(ps)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Merge-update name and/or availability flag.
    pub async fn update_provider(
        &self,
        id: Ulid,
        name: Option<String>,
        active: Option<bool>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("provider name too long"));
        }
        let ps = self.get_provider(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ps.write().await;

        let event = Event::ProviderUpdated {
            id,
            name: name.unwrap_or_else(|| guard.name.clone()),
            active: active.unwrap_or(guard.active),
        };
        self.persist_provider_event(&mut guard, &event).await
    }

    pub async fn upsert_rule(&self, rule: AvailabilityRule) -> Result<(), EngineError> {
        validate_window(&rule.window)?;
        if let RuleScope::DateSpecific { date } = rule.scope {
            validate_date(date)?;
        }
        let ps = self
            .get_provider(&rule.provider_id)
            .ok_or(EngineError::NotFound(rule.provider_id))?;
        let mut guard = ps.write().await;
        let is_new = !guard.rules.iter().any(|r| r.id == rule.id);
        if is_new && guard.rules.len() >= MAX_RULES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many rules on provider"));
        }

        let event = Event::RuleUpserted { rule };
        self.persist_provider_event(&mut guard, &event).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, provider_id };
        self.persist_provider_event(&mut guard, &event).await?;
        Ok(provider_id)
    }

    /// Place a reservation hold. The check-and-insert runs under the
    /// provider write lock, so of all concurrent attempts on one key at
    /// most one can succeed — this is the only thing standing between two
    /// clients and a double-booking.
    pub async fn place_hold(
        &self,
        id: Ulid,
        provider_id: Ulid,
        date: NaiveDate,
        time: Mins,
        ttl_ms: Ms,
        clock: &Clock,
    ) -> Result<Ms, EngineError> {
        validate_date(date)?;
        validate_time(time)?;
        if !(MIN_HOLD_TTL_MS..=MAX_HOLD_TTL_MS).contains(&ttl_ms) {
            return Err(EngineError::Validation(format!(
                "hold ttl must be between {MIN_HOLD_TTL_MS} and {MAX_HOLD_TTL_MS} ms"
            )));
        }
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let mut guard = ps.write().await;
        if guard.holds.len() >= MAX_HOLDS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many holds on provider"));
        }

        let now = clock.now_ms;
        if let Some(existing) = guard.hold_at(date, time, now) {
            metrics::counter!(crate::observability::HOLD_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(format!(
                "slot {date} {} already held ({})",
                fmt_hhmm(time),
                existing.id
            )));
        }
        if let Some(b) = guard
            .bookings
            .iter()
            .find(|b| b.status.is_active() && b.date == date && b.time == time)
        {
            metrics::counter!(crate::observability::HOLD_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(format!(
                "slot {date} {} already booked ({})",
                fmt_hhmm(time),
                b.id
            )));
        }

        let expires_at = now + ttl_ms;
        let event = Event::HoldPlaced {
            hold: Hold {
                id,
                provider_id,
                date,
                time,
                expires_at,
            },
        };
        self.persist_provider_event(&mut guard, &event).await?;
        metrics::counter!(crate::observability::HOLDS_PLACED_TOTAL).increment(1);
        Ok(expires_at)
    }

    pub async fn release_hold(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.holds.iter().any(|h| h.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::HoldReleased { id, provider_id };
        self.persist_provider_event(&mut guard, &event).await?;
        Ok(provider_id)
    }

    /// Confirm a booking, consuming the caller's hold (if any) in the same
    /// locked operation so the slot is never observably free in between.
    pub async fn confirm_booking(
        &self,
        req: ConfirmBooking,
        clock: &Clock,
    ) -> Result<Booking, EngineError> {
        validate_date(req.date)?;
        validate_time(req.time)?;
        if req.duration_min <= 0 || req.time + req.duration_min > MINUTES_PER_DAY {
            return Err(EngineError::Validation(format!(
                "session of {} min starting {} does not fit in the day",
                req.duration_min,
                fmt_hhmm(req.time)
            )));
        }
        for ext in [&req.calendar_event_id, &req.video_bot_id].into_iter().flatten() {
            if ext.len() > MAX_EXTERNAL_ID_LEN {
                return Err(EngineError::LimitExceeded("external id too long"));
            }
        }
        if let Some(eid) = req.enrollment_id
            && !self.enrollments.contains_key(&eid)
        {
            return Err(EngineError::NotFound(eid));
        }

        let ps = self
            .get_provider(&req.provider_id)
            .ok_or(EngineError::NotFound(req.provider_id))?;
        let mut guard = ps.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many bookings on provider"));
        }

        if let Some(hold_id) = req.hold_id {
            let valid = guard
                .holds
                .iter()
                .any(|h| h.id == hold_id && h.date == req.date && h.time == req.time);
            if !valid {
                return Err(EngineError::Validation(format!(
                    "hold {hold_id} does not cover slot {} {}",
                    req.date,
                    fmt_hhmm(req.time)
                )));
            }
        }

        check_slot_free(
            &guard,
            req.date,
            req.time,
            req.duration_min,
            clock.now_ms,
            req.hold_id,
            None,
        )?;

        if let Some(hold_id) = req.hold_id {
            let release = Event::HoldReleased {
                id: hold_id,
                provider_id: req.provider_id,
            };
            self.persist_provider_event(&mut guard, &release).await?;
        }

        let booking = Booking {
            id: req.id,
            provider_id: req.provider_id,
            client_id: req.client_id,
            enrollment_id: req.enrollment_id,
            date: req.date,
            time: req.time,
            duration_min: req.duration_min,
            session_type: req.session_type,
            status: BookingStatus::Scheduled,
            calendar_event_id: req.calendar_event_id,
            video_bot_id: req.video_bot_id,
        };
        let event = Event::BookingConfirmed {
            booking: booking.clone(),
        };
        self.persist_provider_event(&mut guard, &event).await?;
        Ok(booking)
    }

    /// Move a booking through its status machine. Re-applying the current
    /// status is a no-op, so retried dispatches stay safe.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        to: BookingStatus,
        clock: &Clock,
    ) -> Result<TransitionOutcome, EngineError> {
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?.status;
        if current == to {
            return Ok(TransitionOutcome::Noop);
        }
        if !current.can_transition_to(to) {
            return Err(EngineError::Validation(format!(
                "booking {id} cannot move from {} to {}",
                current.label(),
                to.label()
            )));
        }
        let event = Event::BookingStatusChanged {
            id,
            provider_id,
            status: to,
            at: clock.now_ms,
        };
        self.persist_provider_event(&mut guard, &event).await?;
        Ok(TransitionOutcome::Applied)
    }

    /// Reschedule: old booking → Rescheduled, replacement confirmed at the
    /// new key, both under one provider lock.
    pub async fn reschedule_booking(
        &self,
        old_id: Ulid,
        new_id: Ulid,
        new_date: NaiveDate,
        new_time: Mins,
        clock: &Clock,
    ) -> Result<Booking, EngineError> {
        validate_date(new_date)?;
        validate_time(new_time)?;
        let (provider_id, mut guard) = self.resolve_entity_write(&old_id).await?;
        let old = guard.booking(old_id).ok_or(EngineError::NotFound(old_id))?.clone();
        if old.status != BookingStatus::Scheduled {
            return Err(EngineError::Validation(format!(
                "only scheduled bookings can be rescheduled (status: {})",
                old.status.label()
            )));
        }
        if new_time + old.duration_min > MINUTES_PER_DAY {
            return Err(EngineError::Validation(format!(
                "session of {} min starting {} does not fit in the day",
                old.duration_min,
                fmt_hhmm(new_time)
            )));
        }
        check_slot_free(
            &guard,
            new_date,
            new_time,
            old.duration_min,
            clock.now_ms,
            None,
            Some(old_id),
        )?;

        let supersede = Event::BookingStatusChanged {
            id: old_id,
            provider_id,
            status: BookingStatus::Rescheduled,
            at: clock.now_ms,
        };
        self.persist_provider_event(&mut guard, &supersede).await?;

        let replacement = Booking {
            id: new_id,
            date: new_date,
            time: new_time,
            status: BookingStatus::Scheduled,
            ..old
        };
        let event = Event::BookingConfirmed {
            booking: replacement.clone(),
        };
        self.persist_provider_event(&mut guard, &event).await?;
        Ok(replacement)
    }

    /// Cancel every upcoming scheduled booking of a provider (used when a
    /// provider exits). Returns the external-resource handles so the caller
    /// can tear them down after the state is durable.
    pub async fn cancel_upcoming_bookings(
        &self,
        provider_id: Ulid,
        clock: &Clock,
    ) -> Result<Vec<BookingTeardown>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let mut guard = ps.write().await;

        let affected: Vec<Booking> = guard
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Scheduled && b.date >= clock.today)
            .cloned()
            .collect();

        let mut teardowns = Vec::with_capacity(affected.len());
        for b in affected {
            let event = Event::BookingStatusChanged {
                id: b.id,
                provider_id,
                status: BookingStatus::Cancelled,
                at: clock.now_ms,
            };
            self.persist_provider_event(&mut guard, &event).await?;
            teardowns.push(BookingTeardown {
                booking_id: b.id,
                calendar_event_id: b.calendar_event_id,
                video_bot_id: b.video_bot_id,
            });
        }
        Ok(teardowns)
    }

    /// Upcoming scheduled bookings for a provider, e.g. to flag for
    /// reassignment when the provider goes unavailable.
    pub async fn upcoming_bookings(&self, provider_id: Ulid, clock: &Clock) -> Vec<Ulid> {
        let Some(ps) = self.get_provider(&provider_id) else {
            return Vec::new();
        };
        let guard = ps.read().await;
        guard
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Scheduled && b.date >= clock.today)
            .map(|b| b.id)
            .collect()
    }

    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.providers.iter() {
            let ps = entry.value().clone();
            if let Ok(guard) = ps.try_read() {
                for hold in &guard.holds {
                    if hold.expired(now) {
                        expired.push((hold.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Expired holds are dropped here — this
    /// is the storage-hygiene half of lazy hold expiry.
    pub async fn compact_wal(&self, now: Ms) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let mut visited = HashSet::new();

        for entry in self.providers.iter() {
            if !visited.insert(*entry.key()) {
                continue;
            }
            let ps = entry.value().clone();
            let guard = ps.try_read().expect("compact: uncontended read");

            events.push(Event::ProviderRegistered {
                id: guard.id,
                name: guard.name.clone(),
                active: guard.active,
            });
            for rule in &guard.rules {
                events.push(Event::RuleUpserted { rule: rule.clone() });
            }
            for hold in &guard.holds {
                if !hold.expired(now) {
                    events.push(Event::HoldPlaced { hold: hold.clone() });
                }
            }
            for booking in &guard.bookings {
                events.push(Event::BookingConfirmed {
                    booking: booking.clone(),
                });
            }
        }

        for entry in self.enrollments.iter() {
            let en = entry.value().clone();
            let guard = en.try_read().expect("compact: uncontended read");
            events.push(Event::EnrollmentCreated {
                enrollment: guard.clone(),
                actor: "compaction".into(),
                at: now,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
