//! Queue telemetry
//!
//! Read-only aggregates over the job queue: status counts, observed send
//! throughput, an ETA for the remaining queue and a per-day calendar of
//! planned versus completed sends.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::ScheduleStatus;
use crate::store::{JobStore, QueuePage, QueueQuery, ScheduleStore, StatusCounts, StoreError};
use crate::window;

/// Throughput is averaged over this trailing interval
pub const THROUGHPUT_WINDOW_MINS: i64 = 15;
/// Days covered by the planned/sent calendar, starting today
pub const CALENDAR_DAYS: i64 = 14;

/// One calendar day of queue activity
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub planned: u64,
    pub sent: u64,
}

/// Snapshot of a schedule's queue
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub schedule_id: String,
    pub name: String,
    pub status: ScheduleStatus,
    pub paused: bool,
    pub counts: StatusCounts,
    pub next_send_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Sends per minute over the trailing window
    pub avg_throughput_per_min: f64,
    /// Projected drain time; `None` when nothing is moving
    pub eta: Option<DateTime<Utc>>,
    /// True when queued jobs can never become eligible under the current
    /// window and quiet-hour configuration
    pub stalled: bool,
    pub calendar: Vec<CalendarDay>,
}

/// Read-side queries over schedules and their queues
pub struct TelemetryService {
    schedules: Arc<dyn ScheduleStore>,
    jobs: Arc<dyn JobStore>,
}

impl TelemetryService {
    pub fn new(schedules: Arc<dyn ScheduleStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self { schedules, jobs }
    }

    /// Build the queue snapshot for one schedule.
    pub fn overview(&self, schedule_id: &str) -> Result<Overview> {
        let schedule = self
            .schedules
            .get(schedule_id)?
            .ok_or_else(|| StoreError::not_found("schedule", schedule_id))?;

        let now = Utc::now();
        let counts = self.jobs.counts(schedule_id)?;
        let window_start = now - Duration::minutes(THROUGHPUT_WINDOW_MINS);
        let recent = self.jobs.sent_since(schedule_id, window_start)?;
        let avg_throughput_per_min = recent as f64 / THROUGHPUT_WINDOW_MINS as f64;

        let remaining = counts.scheduled + counts.processing;
        let eta = if remaining > 0 && avg_throughput_per_min > f64::EPSILON {
            let minutes = remaining as f64 / avg_throughput_per_min;
            Some(now + Duration::seconds((minutes * 60.0) as i64))
        } else {
            None
        };

        let stalled = counts.scheduled > 0
            && !window::has_eligible_time(&schedule.windows, &schedule.quiet_hours);

        let calendar = self.calendar(schedule_id, now)?;

        Ok(Overview {
            schedule_id: schedule.id,
            name: schedule.name,
            status: schedule.status,
            paused: schedule.paused,
            counts,
            next_send_at: self.jobs.next_send_at(schedule_id)?,
            last_sent_at: self.jobs.last_sent_at(schedule_id)?,
            avg_throughput_per_min,
            eta,
            stalled,
            calendar,
        })
    }

    /// Cursor-paged listing of one schedule's jobs.
    pub fn jobs(&self, schedule_id: &str, query: &QueueQuery) -> Result<QueuePage> {
        if self.schedules.get(schedule_id)?.is_none() {
            return Err(StoreError::not_found("schedule", schedule_id).into());
        }
        Ok(self.jobs.list(schedule_id, query)?)
    }

    /// Merge planned and sent per-day counts over the calendar horizon.
    fn calendar(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<Vec<CalendarDay>> {
        let from = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        let to = from + Duration::days(CALENDAR_DAYS);

        let mut days: BTreeMap<NaiveDate, CalendarDay> = BTreeMap::new();
        for (date, planned) in self.jobs.planned_by_day(schedule_id, from, to)? {
            days.entry(date)
                .or_insert(CalendarDay {
                    date,
                    planned: 0,
                    sent: 0,
                })
                .planned = planned;
        }
        for (date, sent) in self.jobs.sent_by_day(schedule_id, from, to)? {
            days.entry(date)
                .or_insert(CalendarDay {
                    date,
                    planned: 0,
                    sent: 0,
                })
                .sent = sent;
        }
        Ok(days.into_values().collect())
    }
}
