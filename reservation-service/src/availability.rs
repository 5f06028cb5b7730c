//! Free-slot computation and candidate validation against a venue's weekly
//! working hours and its existing bookings.
//!
//! Reads are advisory: two requests may both pass validation for the same
//! slot. The `bookings_no_overlap` exclusion constraint has the final word.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday};
use serde::Serialize;
use shared::schedule::WeeklySchedule;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::Booking;
use crate::store::{BookingStore, StoreError};
use crate::venue::{ScheduleError, ScheduleSource};

#[derive(Debug, Clone)]
pub struct AvailabilityConfig {
    /// Offset in which venue working hours are expressed.
    pub utc_offset: FixedOffset,
    pub min_duration: Duration,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            min_duration: Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("start time must be before end time")]
    InvalidInterval,
    #[error("booking must start and end on the same day")]
    SpansMidnight,
    #[error("venue is closed on {0}")]
    VenueClosed(Weekday),
    #[error("booking must be within working hours {open}-{close}")]
    OutsideWorkingHours { open: NaiveTime, close: NaiveTime },
    #[error("minimum booking duration is {min_minutes} minutes, got {minutes}")]
    TooShort { minutes: i64, min_minutes: i64 },
    #[error("time slot overlaps an existing booking")]
    Conflict { with: Option<Uuid> },
}

#[derive(Debug, thiserror::Error)]
pub enum AvailabilityError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// The `[open, close)` window of `date`, or `None` when the venue is closed.
pub fn working_window(
    schedule: &WeeklySchedule,
    date: NaiveDate,
    offset: &FixedOffset,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (open, close) = schedule.day(date.weekday()).window()?;
    let start = offset.from_local_datetime(&date.and_time(open)).single()?;
    let end = offset.from_local_datetime(&date.and_time(close)).single()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

/// Checks a candidate interval against the schedule alone.
pub fn check_interval(
    schedule: &WeeklySchedule,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &AvailabilityConfig,
) -> Result<(), Rejection> {
    if start >= end {
        return Err(Rejection::InvalidInterval);
    }

    let local_start = start.with_timezone(&config.utc_offset);
    let local_end = end.with_timezone(&config.utc_offset);
    if local_start.date_naive() != local_end.date_naive() {
        return Err(Rejection::SpansMidnight);
    }

    let weekday = local_start.weekday();
    let (open, close) = schedule
        .day(weekday)
        .window()
        .ok_or(Rejection::VenueClosed(weekday))?;
    if local_start.time() < open || local_end.time() > close {
        return Err(Rejection::OutsideWorkingHours { open, close });
    }

    let duration = end - start;
    if duration < config.min_duration {
        return Err(Rejection::TooShort {
            minutes: duration.num_minutes(),
            min_minutes: config.min_duration.num_minutes(),
        });
    }

    Ok(())
}

/// First active booking intersecting `[start, end)`, skipping `exclude`.
///
/// The single half-open predicate also covers the case where either interval
/// fully contains the other.
pub fn find_conflict(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    existing: &[Booking],
    exclude: Option<Uuid>,
) -> Option<Uuid> {
    existing
        .iter()
        .filter(|b| b.is_active())
        .filter(|b| Some(b.id) != exclude)
        .find(|b| b.overlaps(start, end))
        .map(|b| b.id)
}

/// Gaps of at least `min_duration` left in `window` once active bookings are
/// taken out.
pub fn free_slots(
    window: (DateTime<Utc>, DateTime<Utc>),
    bookings: &[Booking],
    min_duration: Duration,
) -> Vec<Slot> {
    let (window_start, window_end) = window;

    let mut busy: Vec<(DateTime<Utc>, DateTime<Utc>)> = bookings
        .iter()
        .filter(|b| b.is_active())
        .filter_map(|b| {
            let start = b.start_at.max(window_start);
            let end = b.end_at.min(window_end);
            (start < end).then_some((start, end))
        })
        .collect();
    busy.sort_by_key(|&(start, _)| start);

    let mut merged: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::with_capacity(busy.len());
    for (start, end) in busy {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let mut slots = Vec::new();
    let mut cursor = window_start;
    for (start, end) in merged {
        if start - cursor >= min_duration {
            slots.push(Slot { start_at: cursor, end_at: start });
        }
        cursor = cursor.max(end);
    }
    if window_end - cursor >= min_duration {
        slots.push(Slot { start_at: cursor, end_at: window_end });
    }
    slots
}

/// One schedule read and one bookings read per call; nothing is cached.
#[derive(Clone)]
pub struct AvailabilityEngine {
    schedules: Arc<dyn ScheduleSource>,
    bookings: Arc<dyn BookingStore>,
    config: AvailabilityConfig,
}

impl AvailabilityEngine {
    pub fn new(
        schedules: Arc<dyn ScheduleSource>,
        bookings: Arc<dyn BookingStore>,
        config: AvailabilityConfig,
    ) -> Self {
        Self { schedules, bookings, config }
    }

    pub async fn available_slots(&self, venue_id: Uuid, date: NaiveDate) -> Result<Vec<Slot>, AvailabilityError> {
        let schedule = self.schedules.weekly_schedule(venue_id).await?;
        let Some(window) = working_window(&schedule, date, &self.config.utc_offset) else {
            return Ok(Vec::new());
        };

        let existing = self.bookings.list_active_in_range(venue_id, window.0, window.1).await?;
        Ok(free_slots(window, &existing, self.config.min_duration))
    }

    pub async fn check_candidate(
        &self,
        venue_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<(), AvailabilityError> {
        let schedule = self.schedules.weekly_schedule(venue_id).await?;
        check_interval(&schedule, start, end, &self.config)?;

        let existing = self.bookings.list_active_in_range(venue_id, start, end).await?;
        if let Some(with) = find_conflict(start, end, &existing, exclude) {
            return Err(Rejection::Conflict { with: Some(with) }.into());
        }
        Ok(())
    }
}
