mod aggregate;
mod conflict;
mod error;
mod mutations;
mod orchestrator;
mod queries;
mod slots;
mod timeline;

pub use aggregate::{AggregatedSlot, TimeBucket, bucket_groups, date_groups, merge_provider_slots};
pub use error::EngineError;
pub use mutations::ConfirmBooking;
pub use orchestrator::LifecycleEvent;
pub use queries::{PauseStatus, ProviderInfo, SlotsResult};
pub use slots::{SlotCandidate, generate_provider_slots, session_duration, snap_to_grid};
pub use timeline::{BookingTeardown, PauseEffect, PauseRequest, ResumeEffect, TransitionOutcome};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::collab::Collaborators;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;
pub type SharedEnrollment = Arc<RwLock<Enrollment>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub providers: DashMap<Ulid, SharedProviderState>,
    pub enrollments: DashMap<Ulid, SharedEnrollment>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub collab: Arc<Collaborators>,
    /// Reverse lookup: entity (rule/hold/booking) id → provider id.
    pub(super) entity_to_provider: DashMap<Ulid, Ulid>,
    /// Enrollment → booking ids, for O(1) pause/resume marking.
    pub(super) enrollment_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Append-only lifecycle audit, per enrollment.
    pub(super) audit: DashMap<Ulid, Vec<AuditRecord>>,
}

/// Apply a provider-scoped event directly (no locking — caller holds the lock).
fn apply_to_provider(
    ps: &mut ProviderState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
    enrollment_index: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::ProviderUpdated { name, active, .. } => {
            ps.name = name.clone();
            ps.active = *active;
        }
        Event::RuleUpserted { rule } => {
            ps.upsert_rule(rule.clone());
            entity_map.insert(rule.id, rule.provider_id);
        }
        Event::RuleRemoved { id, .. } => {
            ps.remove_rule(*id);
            entity_map.remove(id);
        }
        Event::HoldPlaced { hold } => {
            ps.insert_hold(hold.clone());
            entity_map.insert(hold.id, hold.provider_id);
        }
        Event::HoldReleased { id, .. } => {
            ps.remove_hold(*id);
            entity_map.remove(id);
        }
        Event::BookingConfirmed { booking } => {
            entity_map.insert(booking.id, booking.provider_id);
            if let Some(eid) = booking.enrollment_id {
                enrollment_index.entry(eid).or_default().push(booking.id);
            }
            ps.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = ps.booking_mut(*id) {
                b.status = *status;
            }
        }
        // Registration/enrollment events are handled at the map level
        _ => {}
    }
}

/// Apply an enrollment-scoped event. Enrollment events carry the resulting
/// end date, so application is pure bookkeeping.
fn apply_to_enrollment(en: &mut Enrollment, event: &Event) {
    match event {
        Event::EnrollmentActivated { .. } => {
            en.status = EnrollmentStatus::Active;
        }
        Event::EnrollmentPaused {
            pause_start,
            pause_end,
            reason,
            new_end_date,
            ..
        } => {
            if en.original_end_date.is_none() {
                en.original_end_date = Some(en.program_end_date);
            }
            en.program_end_date = *new_end_date;
            en.pause_start_date = Some(*pause_start);
            en.pause_end_date = Some(*pause_end);
            en.pause_reason = Some(*reason);
            en.pause_count += 1;
            en.status = EnrollmentStatus::Paused;
        }
        Event::EnrollmentResumed {
            actual_days,
            new_end_date,
            ..
        } => {
            en.total_pause_days += actual_days;
            en.program_end_date = *new_end_date;
            en.pause_start_date = None;
            en.pause_end_date = None;
            en.pause_reason = None;
            en.status = EnrollmentStatus::Active;
        }
        Event::EnrollmentCancelled { .. } => {
            en.status = EnrollmentStatus::Cancelled;
        }
        _ => {}
    }
}

/// The audit record for an event, if it is an enrollment lifecycle
/// transition. One record per meaningful state change.
fn audit_for_event(event: &Event) -> Option<(Ulid, AuditRecord)> {
    let (id, kind, actor, at, detail) = match event {
        Event::EnrollmentCreated { enrollment, actor, at } => (
            enrollment.id,
            "enrollment_created",
            actor,
            at,
            format!(
                "{} → {} ({})",
                enrollment.program_start_date,
                enrollment.program_end_date,
                enrollment.status.label()
            ),
        ),
        Event::EnrollmentActivated { id, actor, at } => {
            (*id, "enrollment_activated", actor, at, String::new())
        }
        Event::EnrollmentPaused {
            id,
            pause_start,
            pause_end,
            reason,
            requested_days,
            actor,
            at,
            ..
        } => (
            *id,
            "enrollment_paused",
            actor,
            at,
            format!("{pause_start}..{pause_end} ({}, {requested_days} days requested)", reason.label()),
        ),
        Event::EnrollmentResumed { id, actual_days, actor, at, .. } => (
            *id,
            "enrollment_resumed",
            actor,
            at,
            format!("{actual_days} days actually missed"),
        ),
        Event::EnrollmentCancelled { id, actor, at } => {
            (*id, "enrollment_cancelled", actor, at, String::new())
        }
        _ => return None,
    };
    Some((
        id,
        AuditRecord {
            kind: kind.to_string(),
            actor: actor.clone(),
            at: *at,
            detail,
        },
    ))
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        collab: Arc<Collaborators>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            providers: DashMap::new(),
            enrollments: DashMap::new(),
            wal_tx,
            notify,
            collab,
            entity_to_provider: DashMap::new(),
            enrollment_bookings: DashMap::new(),
            audit: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this
        // may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::ProviderRegistered { id, name, active } => {
                    let ps = ProviderState::new(*id, name.clone(), *active);
                    engine.providers.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::EnrollmentCreated { enrollment, .. } => {
                    engine
                        .enrollments
                        .insert(enrollment.id, Arc::new(RwLock::new(enrollment.clone())));
                }
                other => {
                    if let Some(pid) = event_provider_id(other) {
                        if let Some(entry) = engine.providers.get(&pid) {
                            let ps_arc = entry.clone();
                            let mut guard = ps_arc.try_write().expect("replay: uncontended write");
                            apply_to_provider(
                                &mut guard,
                                other,
                                &engine.entity_to_provider,
                                &engine.enrollment_bookings,
                            );
                        }
                    } else if let Some(eid) = event_enrollment_id(other)
                        && let Some(entry) = engine.enrollments.get(&eid)
                    {
                        let en_arc = entry.clone();
                        let mut guard = en_arc.try_write().expect("replay: uncontended write");
                        apply_to_enrollment(&mut guard, other);
                    }
                }
            }
            engine.record_audit(event);
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn get_enrollment_ref(&self, id: &Ulid) -> Option<SharedEnrollment> {
        self.enrollments.get(id).map(|e| e.value().clone())
    }

    pub fn get_provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn record_audit(&self, event: &Event) {
        if let Some((eid, rec)) = audit_for_event(event) {
            self.audit.entry(eid).or_default().push(rec);
        }
    }

    /// WAL-append + apply + notify for a provider-scoped event.
    pub(super) async fn persist_provider_event(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event, &self.entity_to_provider, &self.enrollment_bookings);
        self.notify.send(ps.id, event);
        Ok(())
    }

    /// WAL-append + apply + audit + notify for an enrollment-scoped event.
    pub(super) async fn persist_enrollment_event(
        &self,
        en: &mut Enrollment,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_enrollment(en, event);
        self.record_audit(event);
        self.notify.send(en.id, event);
        Ok(())
    }

    /// Lookup entity → provider, get provider, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ProviderState>), EngineError> {
        let provider_id = self
            .get_provider_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.write_owned().await;
        Ok((provider_id, guard))
    }
}

/// Extract the provider id from a provider-scoped event.
fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ProviderUpdated { id, .. } => Some(*id),
        Event::RuleUpserted { rule } => Some(rule.provider_id),
        Event::RuleRemoved { provider_id, .. }
        | Event::HoldReleased { provider_id, .. }
        | Event::BookingStatusChanged { provider_id, .. } => Some(*provider_id),
        Event::HoldPlaced { hold } => Some(hold.provider_id),
        Event::BookingConfirmed { booking } => Some(booking.provider_id),
        _ => None,
    }
}

/// Extract the enrollment id from an enrollment-scoped event
/// (Created excluded — it's handled at the map level).
fn event_enrollment_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::EnrollmentActivated { id, .. }
        | Event::EnrollmentPaused { id, .. }
        | Event::EnrollmentResumed { id, .. }
        | Event::EnrollmentCancelled { id, .. } => Some(*id),
        _ => None,
    }
}
