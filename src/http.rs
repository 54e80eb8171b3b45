use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, NaiveTime};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::auth::{session_from_headers, AuthError};
use crate::engine::{BookingFilter, BookingRequest, Engine, EngineError, Session};
use crate::model::*;
use crate::observability;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub api_token: String,
}

/// The `/api` surface consumed by the resident/admin frontends.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/facilities", get(list_facilities).post(create_facility))
        .route("/bookings", get(list_bookings).post(create_booking))
        .route("/bookings/calendar", get(booking_calendar))
        .route("/bookings/events", get(booking_events))
        .route("/bookings/:id", get(get_booking).patch(update_booking))
        .route("/bookings/:id/approve", post(approve_booking))
        .route("/bookings/:id/reject", post(reject_booking))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn(track_metrics))
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let op = format!("{} {path}", req.method());
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op.clone(), "status" => status)
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
    response
}

// ── Error mapping ────────────────────────────────────────────────

pub enum ApiError {
    Engine(EngineError),
    Auth(AuthError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Auth(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(AuthError::BadRole) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": AuthError::BadRole.to_string() })),
            )
                .into_response(),
            ApiError::Auth(e) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "message": e.to_string() })),
            )
                .into_response(),
            ApiError::Engine(e) => engine_error_response(e),
        }
    }
}

fn engine_error_response(e: EngineError) -> Response {
    match e {
        EngineError::Validation { field, message } => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "validation", "field": field, "message": message })),
        )
            .into_response(),
        EngineError::Conflict(conflicts) => (
            StatusCode::CONFLICT,
            Json(json!({
                "message": "requested interval overlaps existing bookings",
                "conflicts": conflicts,
            })),
        )
            .into_response(),
        EngineError::InvalidTransition { from, to } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "invalid_transition",
                "message": format!("cannot move booking from {from} to {to}"),
                "from": from,
                "to": to,
            })),
        )
            .into_response(),
        EngineError::Forbidden(msg) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "message": msg })),
        )
            .into_response(),
        EngineError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("not found: {id}") })),
        )
            .into_response(),
        EngineError::LimitExceeded(msg) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": msg })),
        )
            .into_response(),
        EngineError::WalError(e) => {
            tracing::error!("storage failure: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "internal storage error" })),
            )
                .into_response()
        }
    }
}

// ── Parsing helpers ──────────────────────────────────────────────

fn authed(headers: &HeaderMap, state: &AppState) -> Result<Session, ApiError> {
    Ok(session_from_headers(headers, &state.api_token)?)
}

fn parse_id(field: &'static str, s: &str) -> Result<Ulid, ApiError> {
    if s.is_empty() {
        return Err(EngineError::Validation {
            field,
            message: "must not be empty".into(),
        }
        .into());
    }
    Ulid::from_string(s).map_err(|_| {
        EngineError::Validation {
            field,
            message: "not a valid id".into(),
        }
        .into()
    })
}

fn parse_date(field: &'static str, s: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        EngineError::Validation {
            field,
            message: "expected YYYY-MM-DD".into(),
        }
        .into()
    })
}

fn parse_time(field: &'static str, s: &str) -> Result<NaiveTime, ApiError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| {
            EngineError::Validation {
                field,
                message: "expected HH:MM".into(),
            }
            .into()
        })
}

fn parse_status(field: &'static str, s: &str) -> Result<BookingStatus, ApiError> {
    match s {
        "pending" => Ok(BookingStatus::Pending),
        "approved" => Ok(BookingStatus::Approved),
        "rejected" => Ok(BookingStatus::Rejected),
        "cancelled" => Ok(BookingStatus::Cancelled),
        _ => Err(EngineError::Validation {
            field,
            message: "expected pending|approved|rejected|cancelled".into(),
        }
        .into()),
    }
}

fn to_ms(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

// ── Facilities ───────────────────────────────────────────────────

async fn list_facilities(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authed(&headers, &state)?;
    let facilities = state.engine.list_facilities().await;
    Ok(Json(facilities))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFacilityBody {
    name: String,
    description: Option<String>,
}

async fn create_facility(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateFacilityBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authed(&headers, &state)?;
    let facility = state
        .engine
        .create_facility(body.name, body.description, &session)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "facility": facility }))))
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingsQuery {
    status: Option<String>,
    facility_id: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

async fn list_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<BookingsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authed(&headers, &state)?;

    let mut filter = BookingFilter::default();
    if let Some(ref s) = q.status {
        filter.status = Some(parse_status("status", s)?);
    }
    if let Some(ref s) = q.facility_id {
        filter.facility_id = Some(parse_id("facilityId", s)?);
    }
    filter.window = match (&q.start_date, &q.end_date) {
        (None, None) => None,
        (Some(start), Some(end)) => {
            let start = parse_date("startDate", start)?;
            let end = parse_date("endDate", end)?;
            if end < start {
                return Err(EngineError::Validation {
                    field: "endDate",
                    message: "must not be before startDate".into(),
                }
                .into());
            }
            // inclusive date range → half-open instant window
            let start_ms = to_ms(start, NaiveTime::MIN);
            let end_ms = to_ms(end + chrono::Duration::days(1), NaiveTime::MIN);
            Some(Span::new(start_ms, end_ms))
        }
        _ => {
            return Err(EngineError::Validation {
                field: "startDate",
                message: "startDate and endDate must be given together".into(),
            }
            .into())
        }
    };

    let page = state.engine.list_bookings(filter).await?;
    Ok(Json(json!({ "bookings": page.bookings, "total": page.total })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBookingBody {
    facility_id: String,
    title: String,
    date: String,
    start_time: String,
    end_time: String,
    note: Option<String>,
    created_by: Option<String>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBookingBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authed(&headers, &state)?;

    let facility_id = parse_id("facilityId", &body.facility_id)?;
    let date = parse_date("date", &body.date)?;
    let start = parse_time("startTime", &body.start_time)?;
    let end = parse_time("endTime", &body.end_time)?;

    let booking = state
        .engine
        .create_booking(BookingRequest {
            facility_id,
            title: body.title,
            start: to_ms(date, start),
            end: to_ms(date, end),
            note: body.note,
            created_by: body.created_by.unwrap_or(session.user),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "booking": booking }))))
}

async fn get_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authed(&headers, &state)?;
    let id = parse_id("id", &id)?;
    let booking = state.engine.get_booking(&id).await?;
    Ok(Json(json!({ "booking": booking })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewBody {
    reason: Option<String>,
    reviewed_by: Option<String>,
}

/// The reviewer recorded on the booking is the body's `reviewedBy` when
/// present (matching the wire contract), falling back to the session user.
/// Authorization always comes from the session role.
fn reviewer(session: Session, reviewed_by: Option<String>) -> Session {
    Session {
        user: reviewed_by.unwrap_or(session.user),
        role: session.role,
    }
}

async fn approve_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authed(&headers, &state)?;
    let id = parse_id("id", &id)?;
    let session = reviewer(session, body.reviewed_by);
    let booking = state.engine.approve_booking(id, body.reason, &session).await?;
    Ok(Json(json!({ "booking": booking })))
}

async fn reject_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authed(&headers, &state)?;
    let id = parse_id("id", &id)?;
    let session = reviewer(session, body.reviewed_by);
    let booking = state.engine.reject_booking(id, body.reason, &session).await?;
    Ok(Json(json!({ "booking": booking })))
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authed(&headers, &state)?;
    let id = parse_id("id", &id)?;
    state.engine.cancel_booking(id, &session).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBookingBody {
    status: String,
    reason: Option<String>,
    reviewed_by: Option<String>,
}

/// Generic update: dispatches to the same lifecycle transitions as the
/// dedicated endpoints. `pending` is only ever an initial state.
async fn update_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateBookingBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authed(&headers, &state)?;
    let id = parse_id("id", &id)?;

    let booking = match parse_status("status", &body.status)? {
        BookingStatus::Approved => {
            let session = reviewer(session, body.reviewed_by);
            state.engine.approve_booking(id, body.reason, &session).await?
        }
        BookingStatus::Rejected => {
            let session = reviewer(session, body.reviewed_by);
            state.engine.reject_booking(id, body.reason, &session).await?
        }
        BookingStatus::Cancelled => {
            state.engine.cancel_booking(id, &session).await?;
            state.engine.get_booking(&id).await?
        }
        BookingStatus::Pending => {
            return Err(EngineError::Validation {
                field: "status",
                message: "bookings cannot be moved back to pending".into(),
            }
            .into())
        }
    };

    Ok(Json(json!({ "booking": booking })))
}

// ── Calendar ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarQuery {
    month: String,
    facility_id: Option<String>,
}

async fn booking_calendar(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<CalendarQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authed(&headers, &state)?;

    let first = NaiveDate::parse_from_str(&format!("{}-01", q.month), "%Y-%m-%d").map_err(|_| {
        ApiError::from(EngineError::Validation {
            field: "month",
            message: "expected YYYY-MM".into(),
        })
    })?;

    let mut filter = BookingFilter::default();
    if let Some(ref s) = q.facility_id {
        filter.facility_id = Some(parse_id("facilityId", s)?);
    }
    // Fetch everything the 6-week grid could show: from the Sunday before the
    // 1st through the end of the 42nd cell.
    let grid_start = first - chrono::Duration::days(7);
    let grid_end = first + chrono::Duration::days(42);
    filter.window = Some(Span::new(
        to_ms(grid_start, NaiveTime::MIN),
        to_ms(grid_end, NaiveTime::MIN),
    ));

    let page = state.engine.list_bookings(filter).await?;
    let days = crate::engine::month_grid(first, &page.bookings);
    Ok(Json(json!({ "month": q.month, "days": days })))
}

// ── Change feed ──────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    facility_id: String,
}

/// Server-sent events for one facility. The frontend holds its booking list
/// as a read-through cache and refetches whenever a change arrives.
async fn booking_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    authed(&headers, &state)?;
    let facility_id = parse_id("facilityId", &q.facility_id)?;
    if state.engine.get_facility(&facility_id).is_none() {
        return Err(EngineError::NotFound(facility_id).into());
    }

    let rx = state.engine.notify.subscribe(facility_id);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    let frame = SseEvent::default().event("change").data(data);
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                // Slow consumer skipped some events — keep going, the client
                // refetches the whole list on every change anyway.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
