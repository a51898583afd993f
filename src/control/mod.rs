//! Schedule control plane
//!
//! Create, reconfigure, activate, pause, resume and cancel schedules.
//! Timing and rate reconfiguration is refused while sends are in flight so
//! the eligibility gate never shifts and a governor is never rebuilt under a
//! live batch; pause takes effect at the next tick boundary and never
//! interrupts in-flight sends.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, Error, Result};
use crate::models::{Job, JobStatus, Schedule, ScheduleStatus, TimeWindow};
use crate::store::{JobStore, ScheduleStore, StoreError};
use crate::throttle::GovernorRegistry;
use crate::window;

/// Patch applied by a schedule update; `None` fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub windows: Option<Vec<TimeWindow>>,
    pub quiet_hours: Option<Vec<TimeWindow>>,
    pub timezone: Option<String>,
    pub throttle_per_minute: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub per_domain: Option<HashMap<String, u32>>,
    pub repeat_interval_mins: Option<Option<u32>>,
}

impl ScheduleUpdate {
    /// Whether this patch touches fields frozen while sends are in flight:
    /// windows, quiet hours and timezone shape the eligibility gate, the
    /// rate fields rebuild the governor.
    fn requires_idle(&self) -> bool {
        self.windows.is_some()
            || self.quiet_hours.is_some()
            || self.timezone.is_some()
            || self.throttle_per_minute.is_some()
            || self.max_concurrent.is_some()
            || self.per_domain.is_some()
    }
}

/// Outcome of activating a schedule against a recipient list
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub schedule_id: String,
    /// Jobs queued; duplicates of existing recipients are not counted
    pub queued: u64,
    /// Recipients recorded as failed jobs because the address is unusable
    pub invalid: Vec<String>,
    /// When the first send becomes eligible
    pub first_eligible_at: Option<DateTime<Utc>>,
}

/// Schedule lifecycle and configuration operations
pub struct ControlService {
    schedules: Arc<dyn ScheduleStore>,
    jobs: Arc<dyn JobStore>,
    governors: Arc<GovernorRegistry>,
}

impl ControlService {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        jobs: Arc<dyn JobStore>,
        governors: Arc<GovernorRegistry>,
    ) -> Self {
        Self {
            schedules,
            jobs,
            governors,
        }
    }

    fn load(&self, schedule_id: &str) -> Result<Schedule> {
        Ok(self
            .schedules
            .get(schedule_id)?
            .ok_or_else(|| StoreError::not_found("schedule", schedule_id))?)
    }

    /// Validate and persist a new draft schedule.
    pub fn create_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        schedule.validate()?;
        schedule.tz()?;
        self.schedules.create(&schedule)?;
        info!(schedule_id = %schedule.id, name = %schedule.name, "Schedule created");
        Ok(schedule)
    }

    /// Apply a patch to an existing schedule. Window, quiet-hours, timezone
    /// and rate changes are refused while the schedule has jobs in flight.
    pub fn update_schedule(&self, schedule_id: &str, update: ScheduleUpdate) -> Result<Schedule> {
        let mut schedule = self.load(schedule_id)?;

        if update.requires_idle() {
            let processing = self.jobs.count_processing(schedule_id)?;
            if processing > 0 {
                return Err(Error::Config(ConfigError::schedule_busy(
                    schedule_id,
                    processing,
                )));
            }
        }

        if let Some(name) = update.name {
            schedule.name = name;
        }
        if let Some(windows) = update.windows {
            schedule.windows = windows;
        }
        if let Some(quiet_hours) = update.quiet_hours {
            schedule.quiet_hours = quiet_hours;
        }
        if let Some(timezone) = update.timezone {
            schedule.timezone = timezone;
        }
        if let Some(rate) = update.throttle_per_minute {
            schedule.throttle_per_minute = rate;
        }
        if let Some(max_concurrent) = update.max_concurrent {
            schedule.max_concurrent = max_concurrent;
        }
        if let Some(per_domain) = update.per_domain {
            schedule.per_domain = per_domain;
        }
        if let Some(repeat) = update.repeat_interval_mins {
            schedule.repeat_interval_mins = repeat;
        }

        schedule.validate()?;
        schedule.tz()?;
        self.schedules.update(&schedule)?;
        // stale rate config must not outlive the update
        self.governors.invalidate(schedule_id);
        info!(schedule_id, "Schedule updated");
        Ok(schedule)
    }

    /// Queue one job per recipient and move the schedule to `SCHEDULED`.
    ///
    /// Recipients already queued on this schedule are skipped. Unparsable
    /// addresses are recorded as failed jobs so the queue accounts for every
    /// requested recipient.
    pub fn activate(
        &self,
        schedule_id: &str,
        recipients: &[String],
        start_at: Option<DateTime<Utc>>,
    ) -> Result<ActivationReport> {
        let schedule = self.load(schedule_id)?;
        if schedule.status == ScheduleStatus::Cancelled {
            return Err(Error::Config(ConfigError::invalid_control(
                schedule_id,
                "schedule is cancelled",
            )));
        }

        let from = start_at.unwrap_or_else(Utc::now);
        let first_eligible = window::next_eligible(
            from,
            &schedule.windows,
            &schedule.quiet_hours,
            schedule.tz()?,
        );
        let send_at = first_eligible.unwrap_or(from);
        if first_eligible.is_none() {
            warn!(
                schedule_id,
                "No eligible send time under current windows; jobs queued but stalled"
            );
        }

        let mut batch = Vec::with_capacity(recipients.len());
        let mut invalid = Vec::new();
        for recipient in recipients {
            match Job::new(schedule_id, recipient, send_at) {
                Ok(job) => batch.push(job),
                Err(e) => {
                    invalid.push(recipient.clone());
                    batch.push(Job {
                        id: uuid::Uuid::new_v4().to_string(),
                        schedule_id: schedule_id.to_string(),
                        recipient: recipient.clone(),
                        recipient_domain: String::new(),
                        status: JobStatus::Failed,
                        attempts: 0,
                        send_at,
                        processing_started_at: None,
                        sent_at: None,
                        provider_message_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let inserted = self.jobs.insert_jobs(&batch)?;
        let queued = inserted.saturating_sub(invalid.len() as u64);
        self.schedules
            .set_status(schedule_id, ScheduleStatus::Scheduled)?;
        self.schedules.set_next_run_at(schedule_id, first_eligible)?;

        info!(
            schedule_id,
            requested = recipients.len(),
            queued,
            invalid = invalid.len(),
            "Schedule activated"
        );
        Ok(ActivationReport {
            schedule_id: schedule_id.to_string(),
            queued,
            invalid,
            first_eligible_at: first_eligible,
        })
    }

    /// Stop dispatch for this schedule at the next tick boundary.
    pub fn pause(&self, schedule_id: &str) -> Result<Schedule> {
        let schedule = self.load(schedule_id)?;
        if !schedule.status.allows_dispatch() {
            return Err(Error::Config(ConfigError::invalid_control(
                schedule_id,
                format!("cannot pause a {} schedule", schedule.status),
            )));
        }
        self.schedules.set_paused(schedule_id, true)?;
        self.schedules
            .set_status(schedule_id, ScheduleStatus::Paused)?;
        info!(schedule_id, "Schedule paused");
        self.load(schedule_id)
    }

    /// Resume a paused schedule and recompute when it next becomes eligible.
    pub fn resume(&self, schedule_id: &str) -> Result<Schedule> {
        let schedule = self.load(schedule_id)?;
        if schedule.status != ScheduleStatus::Paused && !schedule.paused {
            return Err(Error::Config(ConfigError::invalid_control(
                schedule_id,
                "schedule is not paused",
            )));
        }

        let next = window::next_eligible(
            Utc::now(),
            &schedule.windows,
            &schedule.quiet_hours,
            schedule.tz()?,
        );
        if next.is_none() {
            warn!(schedule_id, "Resumed schedule has no eligible send time");
        }

        self.schedules.set_paused(schedule_id, false)?;
        self.schedules
            .set_status(schedule_id, ScheduleStatus::Scheduled)?;
        self.schedules.set_next_run_at(schedule_id, next)?;
        info!(schedule_id, next_run_at = ?next, "Schedule resumed");
        self.load(schedule_id)
    }

    /// Permanently stop dispatch for this schedule. Queued jobs stay in the
    /// store for accounting but are never picked up again.
    pub fn cancel(&self, schedule_id: &str) -> Result<Schedule> {
        let schedule = self.load(schedule_id)?;
        if schedule.status == ScheduleStatus::Cancelled {
            return Err(Error::Config(ConfigError::invalid_control(
                schedule_id,
                "schedule is already cancelled",
            )));
        }
        self.schedules
            .set_status(schedule_id, ScheduleStatus::Cancelled)?;
        self.schedules.set_next_run_at(schedule_id, None)?;
        self.governors.invalidate(schedule_id);
        info!(schedule_id, "Schedule cancelled");
        self.load(schedule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryJobStore, MemoryScheduleStore};

    struct Fixture {
        schedules: Arc<MemoryScheduleStore>,
        jobs: Arc<MemoryJobStore>,
        control: ControlService,
    }

    fn fixture() -> Fixture {
        let schedules = Arc::new(MemoryScheduleStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let control = ControlService::new(
            schedules.clone(),
            jobs.clone(),
            Arc::new(GovernorRegistry::new()),
        );
        Fixture {
            schedules,
            jobs,
            control,
        }
    }

    fn draft() -> Schedule {
        let mut schedule = Schedule::new("c1", "Step 1", 1);
        schedule.timezone = "UTC".to_string();
        schedule.windows = vec![TimeWindow::parse("00:00-00:00").unwrap()];
        schedule
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let f = fixture();
        let mut schedule = draft();
        schedule.throttle_per_minute = 0;
        assert!(f.control.create_schedule(schedule).is_err());

        let mut schedule = draft();
        schedule.timezone = "Mars/Olympus_Mons".to_string();
        assert!(f.control.create_schedule(schedule).is_err());
    }

    #[test]
    fn test_activate_queues_jobs_and_flags_invalid() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();

        let recipients = vec![
            "a@x.com".to_string(),
            "b@x.com".to_string(),
            "not-an-address".to_string(),
        ];
        let report = f.control.activate(&schedule.id, &recipients, None).unwrap();
        assert_eq!(report.queued, 2);
        assert_eq!(report.invalid, vec!["not-an-address".to_string()]);

        let counts = f.jobs.counts(&schedule.id).unwrap();
        assert_eq!(counts.scheduled, 2);
        assert_eq!(counts.failed, 1);

        let stored = f.schedules.get(&schedule.id).unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Scheduled);
    }

    #[test]
    fn test_activate_skips_existing_recipients() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();
        let recipients = vec!["a@x.com".to_string()];
        f.control.activate(&schedule.id, &recipients, None).unwrap();

        let report = f.control.activate(&schedule.id, &recipients, None).unwrap();
        assert_eq!(report.queued, 0);
        assert_eq!(f.jobs.counts(&schedule.id).unwrap().total, 1);
    }

    #[test]
    fn test_pause_and_resume_round_trip() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();
        f.control
            .activate(&schedule.id, &["a@x.com".to_string()], None)
            .unwrap();

        let paused = f.control.pause(&schedule.id).unwrap();
        assert!(paused.paused);
        assert_eq!(paused.status, ScheduleStatus::Paused);

        let resumed = f.control.resume(&schedule.id).unwrap();
        assert!(!resumed.paused);
        assert_eq!(resumed.status, ScheduleStatus::Scheduled);
        assert!(resumed.next_run_at.is_some());
    }

    #[test]
    fn test_pause_draft_rejected() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();
        assert!(f.control.pause(&schedule.id).is_err());
    }

    #[test]
    fn test_resume_unpaused_rejected() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();
        assert!(f.control.resume(&schedule.id).is_err());
    }

    #[test]
    fn test_update_applies_patch() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();

        let updated = f
            .control
            .update_schedule(
                &schedule.id,
                ScheduleUpdate {
                    throttle_per_minute: Some(5),
                    name: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.throttle_per_minute, 5);
        assert_eq!(updated.name, "Renamed");
        // untouched fields survive
        assert_eq!(updated.windows, schedule.windows);
    }

    #[test]
    fn test_rate_update_refused_while_in_flight() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();
        f.control
            .activate(&schedule.id, &["a@x.com".to_string()], None)
            .unwrap();
        let job = &f.jobs.next_batch(&schedule.id, 1).unwrap()[0];
        f.jobs.claim(&job.id, Utc::now()).unwrap();

        let err = f
            .control
            .update_schedule(
                &schedule.id,
                ScheduleUpdate {
                    throttle_per_minute: Some(5),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ScheduleBusy { .. })
        ));

        // non-frozen fields may still change
        let updated = f
            .control
            .update_schedule(
                &schedule.id,
                ScheduleUpdate {
                    name: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Renamed");
    }

    #[test]
    fn test_timing_update_refused_while_in_flight() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();
        f.control
            .activate(&schedule.id, &["a@x.com".to_string()], None)
            .unwrap();
        let job = &f.jobs.next_batch(&schedule.id, 1).unwrap()[0];
        f.jobs.claim(&job.id, Utc::now()).unwrap();

        let frozen = [
            ScheduleUpdate {
                windows: Some(vec![TimeWindow::parse("09:00-17:00").unwrap()]),
                ..Default::default()
            },
            ScheduleUpdate {
                quiet_hours: Some(vec![TimeWindow::parse("22:00-06:00").unwrap()]),
                ..Default::default()
            },
            ScheduleUpdate {
                timezone: Some("America/New_York".to_string()),
                ..Default::default()
            },
        ];
        for update in frozen {
            let err = f.control.update_schedule(&schedule.id, update).unwrap_err();
            assert!(matches!(
                err,
                Error::Config(ConfigError::ScheduleBusy { .. })
            ));
        }

        // once the send resolves the same edit goes through
        f.jobs.mark_sent(&job.id, Utc::now(), "m1").unwrap();
        let updated = f
            .control
            .update_schedule(
                &schedule.id,
                ScheduleUpdate {
                    windows: Some(vec![TimeWindow::parse("09:00-17:00").unwrap()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.windows[0].to_string(), "09:00-17:00");
    }

    #[test]
    fn test_cancel_stops_future_dispatch() {
        let f = fixture();
        let schedule = f.control.create_schedule(draft()).unwrap();
        f.control
            .activate(&schedule.id, &["a@x.com".to_string()], None)
            .unwrap();

        let cancelled = f.control.cancel(&schedule.id).unwrap();
        assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
        assert!(cancelled.next_run_at.is_none());
        assert!(f.schedules.list_dispatchable().unwrap().is_empty());

        // terminal: no re-activation, no second cancel
        assert!(f
            .control
            .activate(&schedule.id, &["b@x.com".to_string()], None)
            .is_err());
        assert!(f.control.cancel(&schedule.id).is_err());
    }
}
