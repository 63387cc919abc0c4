use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{error, warn};
use ulid::Ulid;

use crate::engine::{ConfirmBooking, Engine, EngineError, LifecycleEvent, session_duration};
use crate::engine::{bucket_groups, date_groups};
use crate::limits::{DEFAULT_HOLD_TTL_MS, MAX_FRAME_LEN};
use crate::model::{Clock, fmt_hhmm};
use crate::proto::{self, PauseActionKind, Request, Role};
use crate::tenant::TenantManager;

#[derive(Clone)]
pub struct AuthKeys {
    pub admin_password: String,
    pub provider_password: String,
}

type Subscriptions = HashMap<Ulid, JoinHandle<()>>;

pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    auth: AuthKeys,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor.accept(socket).await?;
            run_session(stream, tenant_manager, auth).await
        }
        None => run_session(socket, tenant_manager, auth).await,
    }
}

/// One framed JSON request per line, one response per line, with notify
/// frames interleaved for active subscriptions.
async fn run_session<S>(
    stream: S,
    tenant_manager: Arc<TenantManager>,
    auth: AuthKeys,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let first = first.map_err(io::Error::other)?;
    let (engine, role, actor) = match handshake(&first, &tenant_manager, &auth) {
        Ok(session) => session,
        Err(response) => {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            let _ = framed.send(response.to_string()).await;
            return Ok(());
        }
    };
    framed
        .send(proto::ok(json!({ "connected": true })).to_string())
        .await
        .map_err(io::Error::other)?;

    // Subscription tasks forward broadcast events into one channel so the
    // session loop stays a single select.
    let (notify_tx, mut notify_rx) = mpsc::channel::<String>(256);
    let mut subscriptions: Subscriptions = HashMap::new();

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else { break };
                let line = match frame {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("frame error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response =
                    handle_line(&engine, role, &actor, &line, &notify_tx, &mut subscriptions).await;
                framed.send(response.to_string()).await.map_err(io::Error::other)?;
            }
            Some(note) = notify_rx.recv() => {
                framed.send(note).await.map_err(io::Error::other)?;
            }
        }
    }

    for handle in subscriptions.into_values() {
        handle.abort();
    }
    Ok(())
}

fn handshake(
    line: &str,
    tenant_manager: &TenantManager,
    auth: &AuthKeys,
) -> Result<(Arc<Engine>, Role, String), Value> {
    let req = Request::parse(line).map_err(|e| proto::error(&e))?;
    let Request::Hello {
        org,
        role,
        password,
        actor,
    } = req
    else {
        return Err(proto::error(&EngineError::Validation(
            "first frame must be hello".into(),
        )));
    };
    let expected = match role {
        Role::Admin => &auth.admin_password,
        Role::Provider => &auth.provider_password,
    };
    if password != *expected {
        return Err(proto::error(&EngineError::Validation(
            "bad credentials".into(),
        )));
    }
    let engine = tenant_manager
        .get_or_create(&org)
        .map_err(|e| proto::error(&EngineError::Validation(format!("tenant error: {e}"))))?;
    let actor = actor.unwrap_or_else(|| {
        match role {
            Role::Admin => "admin",
            Role::Provider => "provider",
        }
        .to_string()
    });
    Ok((engine, role, actor))
}

async fn handle_line(
    engine: &Arc<Engine>,
    role: Role,
    actor: &str,
    line: &str,
    notify_tx: &mpsc::Sender<String>,
    subscriptions: &mut Subscriptions,
) -> Value {
    let start = Instant::now();
    let req = match Request::parse(line) {
        Ok(req) => req,
        Err(e) => return proto::error(&e),
    };
    let label = req.label();

    let result = if role < req.required_role() {
        Err(EngineError::Validation(format!(
            "{label} requires the admin role"
        )))
    } else {
        execute(engine, role, actor, req, notify_tx, subscriptions).await
    };

    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => label, "status" => status)
        .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => label)
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(response) => response,
        Err(e) if e.is_infrastructure() => {
            let correlation_id = Ulid::new();
            error!(%correlation_id, error = %e, "infrastructure failure");
            proto::infra_error(correlation_id)
        }
        Err(e) => proto::error(&e),
    }
}

async fn execute(
    engine: &Arc<Engine>,
    role: Role,
    actor: &str,
    req: Request,
    notify_tx: &mpsc::Sender<String>,
    subscriptions: &mut Subscriptions,
) -> Result<Value, EngineError> {
    match req {
        Request::Hello { .. } => Err(EngineError::Validation("already connected".into())),

        Request::RegisterProvider { id, name, active } => {
            let id = id.unwrap_or_else(Ulid::new);
            engine.register_provider(id, name, active).await?;
            Ok(proto::ok(json!({ "provider_id": id })))
        }

        Request::UpdateProvider { id, name, active } => {
            engine.update_provider(id, name, active).await?;
            Ok(proto::ok(json!({ "provider_id": id })))
        }

        Request::UpsertRule {
            id,
            provider_id,
            scope,
            day_of_week,
            specific_date,
            kind,
            start_time,
            end_time,
            active,
        } => {
            let rule_id = id.unwrap_or_else(Ulid::new);
            let rule = proto::rule_from_wire(
                rule_id,
                provider_id,
                scope,
                day_of_week,
                specific_date,
                kind,
                &start_time,
                &end_time,
                active,
            )?;
            engine.upsert_rule(rule).await?;
            Ok(proto::ok(json!({ "rule_id": rule_id })))
        }

        Request::RemoveRule { id } => {
            engine.remove_rule(id).await?;
            Ok(proto::ok(json!({ "rule_id": id })))
        }

        Request::GetSlots {
            provider_id,
            days,
            session_type,
            client_age,
        } => {
            let clock = Clock::system();
            let result = engine
                .get_slots(provider_id, days, session_type, client_age, &clock)
                .await?;
            Ok(proto::ok(json!({
                "duration_min": result.duration_min,
                "slots": result.slots,
                "by_time_bucket": bucket_groups(&result.slots),
                "by_date": date_groups(&result.slots),
                "reason": result.reason,
            })))
        }

        Request::PlaceHold {
            id,
            provider_id,
            date,
            time,
            ttl_ms,
        } => {
            let hold_id = id.unwrap_or_else(Ulid::new);
            let time = proto::parse_time(&time)?;
            let clock = Clock::system();
            let expires_at = engine
                .place_hold(
                    hold_id,
                    provider_id,
                    date,
                    time,
                    ttl_ms.unwrap_or(DEFAULT_HOLD_TTL_MS),
                    &clock,
                )
                .await?;
            Ok(proto::ok(json!({ "hold_id": hold_id, "expires_at": expires_at })))
        }

        Request::ReleaseHold { id } => {
            engine.release_hold(id).await?;
            Ok(proto::ok(json!({ "hold_id": id })))
        }

        Request::ConfirmBooking {
            id,
            hold_id,
            provider_id,
            client_id,
            enrollment_id,
            date,
            time,
            session_type,
            client_age,
            calendar_event_id,
            video_bot_id,
        } => {
            let booking_id = id.unwrap_or_else(Ulid::new);
            let time = proto::parse_time(&time)?;
            let clock = Clock::system();
            let booking = engine
                .confirm_booking(
                    ConfirmBooking {
                        id: booking_id,
                        provider_id,
                        client_id,
                        enrollment_id,
                        hold_id,
                        date,
                        time,
                        duration_min: session_duration(session_type, client_age),
                        session_type,
                        calendar_event_id,
                        video_bot_id,
                    },
                    &clock,
                )
                .await?;
            Ok(proto::ok(json!({
                "booking_id": booking.id,
                "date": booking.date,
                "time": fmt_hhmm(booking.time),
                "duration_min": booking.duration_min,
            })))
        }

        Request::Dispatch { event, payload } => {
            dispatch_enveloped(engine, role, actor, &event, payload).await
        }

        Request::PauseStatus { enrollment_id } => {
            let status = engine.pause_status(enrollment_id).await?;
            let data = serde_json::to_value(&status).map_err(|e| EngineError::Wal(e.to_string()))?;
            Ok(proto::ok(data))
        }

        // The POST half of the pause surface is sugar over dispatch, so
        // both paths share one fan-out.
        Request::PauseAction {
            enrollment_id,
            action,
            pause_start_date,
            pause_end_date,
            pause_reason,
        } => match action {
            PauseActionKind::Pause => {
                let (Some(start), Some(end), Some(reason)) =
                    (pause_start_date, pause_end_date, pause_reason)
                else {
                    return Err(EngineError::Validation(
                        "pause requires pause_start_date, pause_end_date and pause_reason".into(),
                    ));
                };
                let payload = json!({
                    "enrollment_id": enrollment_id,
                    "pause_start_date": start,
                    "pause_end_date": end,
                    "pause_reason": reason.label(),
                });
                dispatch_enveloped(engine, role, actor, "enrollment_paused", payload).await
            }
            PauseActionKind::Resume => {
                let payload = json!({ "enrollment_id": enrollment_id });
                dispatch_enveloped(engine, role, actor, "enrollment_resumed", payload).await
            }
        },

        Request::ListProviders => Ok(proto::ok(json!({ "providers": engine.list_providers() }))),

        Request::GetRules { provider_id } => {
            let rules = engine.get_rules(provider_id).await?;
            Ok(proto::ok(json!({ "rules": rules })))
        }

        Request::GetBookings { provider_id } => {
            let bookings = engine.get_bookings(provider_id).await?;
            Ok(proto::ok(json!({ "bookings": bookings })))
        }

        Request::GetHolds { provider_id } => {
            let holds = engine.get_holds(provider_id).await?;
            Ok(proto::ok(json!({ "holds": holds })))
        }

        Request::GetEnrollment { enrollment_id } => {
            let enrollment = engine.get_enrollment(enrollment_id).await?;
            Ok(proto::ok(json!({ "enrollment": enrollment })))
        }

        Request::AuditLog { enrollment_id } => {
            Ok(proto::ok(json!({ "audit": engine.audit_log(enrollment_id) })))
        }

        Request::Listen { channel } => {
            if !subscriptions.contains_key(&channel) {
                let rx = engine.notify.subscribe(channel);
                let tx = notify_tx.clone();
                subscriptions.insert(channel, tokio::spawn(forward_notifications(channel, rx, tx)));
            }
            Ok(proto::ok(json!({ "channel": channel, "listening": true })))
        }

        Request::Unlisten { channel } => {
            if let Some(handle) = subscriptions.remove(&channel) {
                handle.abort();
            }
            Ok(proto::ok(json!({ "channel": channel, "listening": false })))
        }
    }
}

/// Dispatch with the `{success, event, data, error}` envelope. Handler
/// rejections keep the event name in the reply; infrastructure failures
/// bubble up to get a correlation id.
async fn dispatch_enveloped(
    engine: &Arc<Engine>,
    role: Role,
    actor: &str,
    event: &str,
    payload: Value,
) -> Result<Value, EngineError> {
    if let Some(ev) = LifecycleEvent::parse(event)
        && ev.admin_only()
        && role < Role::Admin
    {
        return Err(EngineError::Validation(format!(
            "{event} requires the admin role"
        )));
    }
    let clock = Clock::system();
    match engine.dispatch(event, payload, actor, &clock).await {
        Ok(data) => Ok(json!({ "success": true, "event": event, "data": data })),
        Err(e) if e.is_infrastructure() => Err(e),
        Err(e) => Ok(json!({
            "success": false,
            "event": event,
            "error": { "kind": e.kind(), "message": e.to_string() },
        })),
    }
}

async fn forward_notifications(
    channel: Ulid,
    mut rx: broadcast::Receiver<crate::model::Event>,
    tx: mpsc::Sender<String>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let note = json!({ "op": "notify", "channel": channel, "event": event });
                if tx.send(note.to_string()).await.is_err() {
                    break; // session gone
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%channel, skipped, "notification subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
