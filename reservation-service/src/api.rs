use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::availability::{Rejection, Slot};
use crate::booking::{Actor, BookingError, BookingService, CreateBooking, Role, UpdateBooking};
use crate::models::Booking;
use crate::venue::ScheduleError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<BookingService>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(StatusCode, String);

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self(StatusCode::UNAUTHORIZED, message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        let status = match &err {
            BookingError::Validation(_) => StatusCode::BAD_REQUEST,
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::RoleNotAllowed | BookingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BookingError::Rejected(Rejection::Conflict { .. }) => StatusCode::CONFLICT,
            BookingError::Rejected(_) | BookingError::NotPending(_) | BookingError::CannotCancel(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BookingError::Schedule(ScheduleError::VenueNotFound(_)) => StatusCode::NOT_FOUND,
            BookingError::Schedule(ScheduleError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            BookingError::Storage(e) => {
                tracing::error!(error = ?e, "booking storage failure");
                return Self(StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string());
            }
        };
        Self(status, err.to_string())
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing X-User-Id header"))?
            .parse::<Uuid>()
            .map_err(|_| ApiError::unauthorized("X-User-Id is not a valid UUID"))?;
        let role = header(USER_ROLE_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing X-User-Role header"))?
            .parse::<Role>()
            .map_err(ApiError::unauthorized)?;

        Ok(Actor { user_id, role })
    }
}

#[derive(Debug, Serialize)]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub duration_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_warning: Option<String>,
}

impl BookingView {
    fn new(booking: Booking, event_warning: Option<String>) -> Self {
        Self {
            duration_minutes: booking.duration_minutes(),
            booking,
            event_warning,
        }
    }
}

impl From<Booking> for BookingView {
    fn from(booking: Booking) -> Self {
        Self::new(booking, None)
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub client_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub venue_id: Uuid,
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/booking", post(create_booking))
        .route("/bookings", get(list_bookings))
        .route("/bookings/:id", get(get_booking).put(update_booking))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/venues/:id/availability", get(venue_availability))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_booking(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreateBooking>,
) -> Result<(StatusCode, Json<BookingView>), ApiError> {
    let (booking, warning) = state.bookings.create(&actor, request, Utc::now()).await?.into_parts();
    Ok((StatusCode::CREATED, Json(BookingView::new(booking, warning))))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<BookingView>, ApiError> {
    let (booking, warning) = state
        .bookings
        .cancel(&actor, id, &request.reason, Utc::now())
        .await?
        .into_parts();
    Ok(Json(BookingView::new(booking, warning)))
}

pub async fn update_booking(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(changes): Json<UpdateBooking>,
) -> Result<Json<BookingView>, ApiError> {
    let booking = state.bookings.update(&actor, id, changes, Utc::now()).await?;
    Ok(Json(booking.into()))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingView>, ApiError> {
    Ok(Json(state.bookings.get(id).await?.into()))
}

pub async fn list_bookings(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BookingView>>, ApiError> {
    let client_id = query.client_id.unwrap_or(actor.user_id);
    if client_id != actor.user_id && actor.role != Role::Admin {
        return Err(ApiError(
            StatusCode::FORBIDDEN,
            "cannot list bookings of another client".to_string(),
        ));
    }

    let bookings = state.bookings.list_for_client(client_id).await?;
    Ok(Json(bookings.into_iter().map(BookingView::from).collect()))
}

pub async fn venue_availability(
    State(state): State<AppState>,
    Path(venue_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let slots = state.bookings.availability(venue_id, query.date).await?;
    Ok(Json(AvailabilityResponse {
        venue_id,
        date: query.date,
        slots,
    }))
}

pub async fn health_check() -> &'static str {
    "OK"
}
