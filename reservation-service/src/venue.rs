use async_trait::async_trait;
use reqwest::StatusCode;
use shared::schedule::WeeklySchedule;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("venue {0} not found")]
    VenueNotFound(Uuid),
    #[error("venue service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn weekly_schedule(&self, venue_id: Uuid) -> Result<WeeklySchedule, ScheduleError>;
}

#[derive(Debug, Clone)]
pub struct VenueClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

pub struct VenueClient {
    http: reqwest::Client,
    base_url: String,
}

impl VenueClient {
    pub fn new(config: &VenueClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ScheduleSource for VenueClient {
    async fn weekly_schedule(&self, venue_id: Uuid) -> Result<WeeklySchedule, ScheduleError> {
        let url = format!("{}/venues/{}/schedule", self.base_url, venue_id);
        debug!(%venue_id, %url, "fetching venue schedule");

        let response = self.http.get(&url).send().await.map_err(|e| {
            warn!(%venue_id, error = %e, "venue schedule request failed");
            ScheduleError::Unavailable(e.to_string())
        })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(ScheduleError::VenueNotFound(venue_id)),
            status => {
                warn!(%venue_id, %status, "venue service returned an error status");
                return Err(ScheduleError::Unavailable(format!("status {status}")));
            }
        }

        let schedule: WeeklySchedule = response
            .json()
            .await
            .map_err(|e| ScheduleError::Unavailable(format!("invalid schedule payload: {e}")))?;

        schedule
            .validate()
            .map_err(|e| ScheduleError::Unavailable(format!("inconsistent schedule: {e}")))?;

        Ok(schedule)
    }
}
