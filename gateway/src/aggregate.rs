//! Read-side fan-out for the booking summary. Only the booking itself is
//! required; venue and payment sections degrade to an error string.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Headers copied from the inbound request onto every upstream call.
pub const FORWARDED_HEADERS: [&str; 3] = ["authorization", "x-user-id", "x-user-role"];

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub reservation_url: String,
    pub venue_url: String,
    pub payment_url: String,
    pub timeout: Duration,
}

/// A non-200 upstream answer, kept verbatim for passthrough.
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum Fetch {
    Ok(Value),
    Status(UpstreamReply),
    Failed(String),
}

#[derive(Debug, Serialize)]
pub struct BookingSummary {
    pub booking: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookingLookup {
    venue_id: Uuid,
}

/// Body of an optional section, or the error text that replaces it.
pub fn section(service: &str, fetch: Fetch) -> (Option<Value>, Option<String>) {
    match fetch {
        Fetch::Ok(body) => (Some(body), None),
        Fetch::Status(reply) => (None, Some(format!("{service} service status {}", reply.status.as_u16()))),
        Fetch::Failed(reason) => {
            warn!(service, %reason, "summary section unavailable");
            (None, Some(format!("{service} service unavailable")))
        }
    }
}

pub enum Summary {
    Ready(BookingSummary),
    /// The reservation service answered with something other than 200.
    Passthrough(UpstreamReply),
    BadGateway(&'static str),
}

pub struct Aggregator {
    http: reqwest::Client,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(mut config: AggregatorConfig) -> anyhow::Result<Self> {
        for url in [&mut config.reservation_url, &mut config.venue_url, &mut config.payment_url] {
            *url = url.trim_end_matches('/').to_string();
        }
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    async fn fetch(&self, url: String, headers: &HeaderMap) -> Fetch {
        let mut request = self.http.get(&url);
        for name in FORWARDED_HEADERS {
            if let Some(value) = headers.get(name) {
                request = request.header(name, value.clone());
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Fetch::Failed(e.to_string()),
        };
        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = match response.bytes().await {
            Ok(body) => body.to_vec(),
            Err(e) => return Fetch::Failed(e.to_string()),
        };
        if status != StatusCode::OK {
            return Fetch::Status(UpstreamReply {
                status,
                content_type,
                body,
            });
        }
        match serde_json::from_slice(&body) {
            Ok(value) => Fetch::Ok(value),
            Err(e) => Fetch::Failed(format!("invalid JSON from {url}: {e}")),
        }
    }

    pub async fn booking_summary(&self, booking_id: Uuid, headers: &HeaderMap) -> Summary {
        let booking_url = format!("{}/bookings/{}", self.config.reservation_url, booking_id);
        let booking = match self.fetch(booking_url, headers).await {
            Fetch::Ok(booking) => booking,
            Fetch::Status(reply) => return Summary::Passthrough(reply),
            Fetch::Failed(reason) => {
                warn!(%booking_id, %reason, "reservation service unavailable");
                return Summary::BadGateway("reservation service unavailable");
            }
        };
        let Ok(lookup) = serde_json::from_value::<BookingLookup>(booking.clone()) else {
            return Summary::BadGateway("invalid booking response");
        };

        let (venue, payment) = futures::join!(
            self.fetch(format!("{}/venues/{}", self.config.venue_url, lookup.venue_id), headers),
            self.fetch(format!("{}/bookings/{}/payment", self.config.payment_url, booking_id), headers),
        );
        let (venue, venue_error) = section("venue", venue);
        let (payment, payment_error) = section("payment", payment);

        Summary::Ready(BookingSummary {
            booking,
            venue,
            payment,
            venue_error,
            payment_error,
        })
    }
}
