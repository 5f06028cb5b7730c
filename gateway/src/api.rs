use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::{Aggregator, Summary};

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/bookings/:id/summary", get(booking_summary))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn booking_summary(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    match state.aggregator.booking_summary(booking_id, &headers).await {
        Summary::Ready(summary) => Json(summary).into_response(),
        Summary::Passthrough(reply) => {
            let mut response = (reply.status, reply.body).into_response();
            match reply.content_type {
                Some(content_type) => {
                    response.headers_mut().insert(header::CONTENT_TYPE, content_type);
                }
                None => {
                    response.headers_mut().remove(header::CONTENT_TYPE);
                }
            }
            response
        }
        Summary::BadGateway(reason) => (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: reason.to_string(),
            }),
        )
            .into_response(),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregatorConfig;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gateway(reservation_url: &str, venue_url: &str, payment_url: &str) -> Router {
        let aggregator = Aggregator::new(AggregatorConfig {
            reservation_url: reservation_url.to_string(),
            venue_url: venue_url.to_string(),
            payment_url: payment_url.to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        create_router(AppState {
            aggregator: Arc::new(aggregator),
        })
    }

    async fn summary(app: Router, booking_id: Uuid) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(format!("/bookings/{booking_id}/summary"))
            .header("authorization", "Bearer token")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn partial_failure_still_returns_summary() {
        let booking_id = Uuid::new_v4();
        let venue_id = Uuid::new_v4();
        let reservation = spawn_upstream(Router::new().route(
            "/bookings/:id",
            get(move |headers: HeaderMap| async move {
                assert_eq!(headers.get("authorization").unwrap(), "Bearer token");
                Json(json!({"id": booking_id, "venue_id": venue_id, "status": "pending"}))
            }),
        ))
        .await;
        let venue = spawn_upstream(Router::new().route(
            "/venues/:id",
            get(move || async move { Json(json!({"id": venue_id, "name": "Court 1"})) }),
        ))
        .await;
        let payment = spawn_upstream(Router::new().route(
            "/bookings/:id/payment",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))) }),
        ))
        .await;

        let (status, body) = summary(gateway(&reservation, &venue, &payment), booking_id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["booking"]["status"], "pending");
        assert_eq!(body["venue"]["name"], "Court 1");
        assert!(body.get("payment").is_none());
        assert_eq!(body["payment_error"], "payment service status 404");
        assert!(body.get("venue_error").is_none());
    }

    #[tokio::test]
    async fn unreachable_sections_are_reported() {
        let booking_id = Uuid::new_v4();
        let reservation = spawn_upstream(Router::new().route(
            "/bookings/:id",
            get(move || async move { Json(json!({"id": booking_id, "venue_id": Uuid::new_v4()})) }),
        ))
        .await;

        let (status, body) = summary(
            gateway(&reservation, "http://127.0.0.1:1", "http://127.0.0.1:1"),
            booking_id,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["venue_error"], "venue service unavailable");
        assert_eq!(body["payment_error"], "payment service unavailable");
    }

    #[tokio::test]
    async fn booking_errors_pass_through() {
        let reservation = spawn_upstream(Router::new().route(
            "/bookings/:id",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": "booking not found"}))) }),
        ))
        .await;

        let (status, body) = summary(
            gateway(&reservation, "http://127.0.0.1:1", "http://127.0.0.1:1"),
            Uuid::new_v4(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "booking not found");
    }

    #[tokio::test]
    async fn passthrough_keeps_upstream_content_type() {
        let reservation = spawn_upstream(Router::new().route(
            "/bookings/:id",
            get(|| async { (StatusCode::FORBIDDEN, "forbidden") }),
        ))
        .await;

        let app = gateway(&reservation, "http://127.0.0.1:1", "http://127.0.0.1:1");
        let request = Request::builder()
            .uri(format!("/bookings/{}/summary", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"forbidden");
    }

    #[tokio::test]
    async fn reservation_outage_is_bad_gateway() {
        let (status, body) = summary(
            gateway("http://127.0.0.1:1", "http://127.0.0.1:1", "http://127.0.0.1:1"),
            Uuid::new_v4(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "reservation service unavailable");
    }

    #[tokio::test]
    async fn malformed_booking_id_is_rejected() {
        let app = gateway("http://127.0.0.1:1", "http://127.0.0.1:1", "http://127.0.0.1:1");
        let request = Request::builder()
            .uri("/bookings/42/summary")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
