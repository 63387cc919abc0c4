//! External collaborators: the calendar provider and the video-bot
//! service, behind narrow async interfaces. Every call is best-effort —
//! a failure is logged with enough context for manual reconciliation and
//! never propagated to the primary operation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::Mins;

#[derive(Debug)]
pub struct CollabError(pub String);

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn cancel_event(&self, event_id: &str, notify: bool) -> Result<(), CollabError>;
    async fn reschedule_event(
        &self,
        event_id: &str,
        new_date: NaiveDate,
        new_time: Mins,
        duration_min: Mins,
    ) -> Result<(), CollabError>;
}

#[async_trait]
pub trait VideoBotClient: Send + Sync {
    async fn cancel_bot(&self, bot_id: &str) -> Result<(), CollabError>;
}

/// Deployment default when no calendar/video-bot backend is wired up:
/// every call succeeds and is traced at debug.
struct DisabledCalendar;
struct DisabledVideoBot;

#[async_trait]
impl CalendarClient for DisabledCalendar {
    async fn cancel_event(&self, event_id: &str, notify: bool) -> Result<(), CollabError> {
        debug!(event_id, notify, "calendar disabled, skipping cancel");
        Ok(())
    }

    async fn reschedule_event(
        &self,
        event_id: &str,
        new_date: NaiveDate,
        new_time: Mins,
        _duration_min: Mins,
    ) -> Result<(), CollabError> {
        debug!(event_id, %new_date, new_time, "calendar disabled, skipping reschedule");
        Ok(())
    }
}

#[async_trait]
impl VideoBotClient for DisabledVideoBot {
    async fn cancel_bot(&self, bot_id: &str) -> Result<(), CollabError> {
        debug!(bot_id, "video bot disabled, skipping cancel");
        Ok(())
    }
}

pub struct Collaborators {
    pub calendar: Arc<dyn CalendarClient>,
    pub video_bot: Arc<dyn VideoBotClient>,
}

impl Collaborators {
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            calendar: Arc::new(DisabledCalendar),
            video_bot: Arc::new(DisabledVideoBot),
        })
    }

    pub fn new(calendar: Arc<dyn CalendarClient>, video_bot: Arc<dyn VideoBotClient>) -> Arc<Self> {
        Arc::new(Self { calendar, video_bot })
    }

    /// Tear down external resources tied to a booking. Failures are logged
    /// and counted, never returned — state correctness has already been
    /// committed by the caller.
    pub async fn teardown_booking(
        &self,
        booking_id: Ulid,
        calendar_event_id: Option<&str>,
        video_bot_id: Option<&str>,
        notify: bool,
    ) {
        if let Some(event_id) = calendar_event_id
            && let Err(e) = self.calendar.cancel_event(event_id, notify).await
        {
            metrics::counter!(crate::observability::COLLAB_FAILURES_TOTAL).increment(1);
            warn!(%booking_id, event_id, error = %e, "calendar cancel failed, needs manual reconciliation");
        }
        if let Some(bot_id) = video_bot_id
            && let Err(e) = self.video_bot.cancel_bot(bot_id).await
        {
            metrics::counter!(crate::observability::COLLAB_FAILURES_TOTAL).increment(1);
            warn!(%booking_id, bot_id, error = %e, "video bot cancel failed, needs manual reconciliation");
        }
    }

    /// Move a booking's calendar event. Same best-effort contract.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        calendar_event_id: Option<&str>,
        new_date: NaiveDate,
        new_time: Mins,
        duration_min: Mins,
    ) {
        if let Some(event_id) = calendar_event_id
            && let Err(e) = self
                .calendar
                .reschedule_event(event_id, new_date, new_time, duration_min)
                .await
        {
            metrics::counter!(crate::observability::COLLAB_FAILURES_TOTAL).increment(1);
            warn!(%booking_id, event_id, error = %e, "calendar reschedule failed, needs manual reconciliation");
        }
    }
}
