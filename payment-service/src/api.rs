use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{CreatePayment, Ledger, PaymentPage, DEFAULT_PAGE_LIMIT};
use crate::models::{Payment, PaymentStatus, Refund};

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::Validation(_) | LedgerError::InvalidAmount | LedgerError::InvalidMethod(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::NotFound(_) | LedgerError::BookingNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::AlreadyExists(_) => StatusCode::CONFLICT,
            LedgerError::NotCompleted(_)
            | LedgerError::CannotConfirm(_)
            | LedgerError::RefundExceedsRemaining { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::Storage(e) => {
                tracing::error!(error = ?e, "ledger storage failure");
                return Self(StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string());
            }
        };
        Self(status, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/payments", post(create_payment).get(payment_history))
        .route("/payments/:id", get(get_payment))
        .route("/payments/:id/refund", post(create_refund))
        .route("/payments/:id/refunds", get(list_refunds))
        .route("/payments/:id/confirm", post(confirm_payment))
        .route("/bookings/:id/payment", get(payment_for_booking))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePayment>,
) -> Result<(StatusCode, Json<Payment>), ApiError> {
    let payment = state
        .ledger
        .create_payment(request, PaymentStatus::Completed, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<PaymentPage>, ApiError> {
    let user_id = match headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => Some(
            raw.trim()
                .parse::<Uuid>()
                .map_err(|_| ApiError(StatusCode::BAD_REQUEST, "invalid user id".to_string()))?,
        ),
        None => query.user_id,
    }
    .ok_or_else(|| ApiError(StatusCode::BAD_REQUEST, "user id is required".to_string()))?;

    let page = state
        .ledger
        .history(
            user_id,
            query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(page))
}

pub async fn get_payment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Payment>, ApiError> {
    Ok(Json(state.ledger.get(id).await?))
}

pub async fn payment_for_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Payment>, ApiError> {
    Ok(Json(state.ledger.get_by_booking(booking_id).await?))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, ApiError> {
    Ok(Json(state.ledger.confirm(id, Utc::now()).await?))
}

pub async fn create_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> Result<(StatusCode, Json<Refund>), ApiError> {
    let refund = state
        .ledger
        .refund(id, request.amount, &request.reason, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

pub async fn list_refunds(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Refund>>, ApiError> {
    Ok(Json(state.ledger.refunds(id).await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}
