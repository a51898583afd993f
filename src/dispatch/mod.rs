//! Throttled dispatch engine
//!
//! The dispatcher drains due jobs on a fixed tick. Each tick it loads the
//! dispatchable schedules, gates every due job through its schedule's send
//! windows, claims the job with a compare-and-swap, asks the throttle
//! governor for admission (reverting the claim when denied, at no penalty)
//! and hands it to the transport. A tick is a bounded
//! batch: it waits for its in-flight sends before returning, so two ticks
//! never overlap.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, Error, Result};
use crate::metrics;
use crate::models::{Job, Schedule, ScheduleStatus};
use crate::store::{JobStore, ScheduleStore, StoreError};
use crate::throttle::{Admission, AdmissionGrant, DenyReason, GovernorRegistry};
use crate::window;

use transport::EmailTransport;

// ============================================================================
// Configuration
// ============================================================================

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Time between dispatch ticks
    pub tick_interval: Duration,
    /// Upper bound on due jobs examined per tick
    pub claim_batch_size: usize,
    /// Transport calls slower than this count as transient failures
    pub transport_timeout: Duration,
    /// Total delivery attempts before a job is failed
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_backoff_base: Duration,
    /// Retry delay ceiling
    pub retry_backoff_cap: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            claim_batch_size: 100,
            transport_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_backoff_base: Duration::from_secs(60),
            retry_backoff_cap: Duration::from_secs(3600),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Due jobs examined
    pub examined: usize,
    /// Jobs handed to the transport
    pub dispatched: usize,
    /// Jobs re-stamped to their next window opening
    pub deferred: usize,
    /// Admissions denied by the governor
    pub denied: usize,
    /// Claims lost to a concurrent dispatcher
    pub conflicts: usize,
    /// Jobs whose schedule has no eligible time at all
    pub stalled: usize,
    /// Schedules that drained and completed or re-armed this tick
    pub completed: usize,
}

/// Result of the manual batch trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchReport {
    pub requested: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub denied: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Sent,
    Retried,
    Failed,
}

fn deny_label(reason: &DenyReason) -> &'static str {
    match reason {
        DenyReason::Concurrency => "concurrency",
        DenyReason::GlobalRate => "global_rate",
        DenyReason::DomainRate => "domain_rate",
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Scheduler loop that turns due jobs into transport calls
pub struct Dispatcher {
    schedules: Arc<dyn ScheduleStore>,
    jobs: Arc<dyn JobStore>,
    transport: Arc<dyn EmailTransport>,
    governors: Arc<GovernorRegistry>,
    config: DispatcherConfig,
    running: Arc<RwLock<bool>>,
}

impl Dispatcher {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        jobs: Arc<dyn JobStore>,
        transport: Arc<dyn EmailTransport>,
        governors: Arc<GovernorRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            schedules,
            jobs,
            transport,
            governors,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn stop(&self) {
        info!("Dispatcher stop requested");
        *self.running.write().await = false;
    }

    /// Run the tick loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        *self.running.write().await = true;
        info!(
            tick_interval = ?self.config.tick_interval,
            transport = self.transport.name(),
            "Dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                break;
            }
            match self.tick().await {
                Ok(summary) if summary.examined > 0 => {
                    info!(
                        examined = summary.examined,
                        dispatched = summary.dispatched,
                        deferred = summary.deferred,
                        denied = summary.denied,
                        conflicts = summary.conflicts,
                        "Tick complete"
                    );
                }
                Ok(_) => debug!("Tick complete, queue idle"),
                Err(e) => error!(error = %e, "Tick failed"),
            }
        }
        info!("Dispatcher stopped");
    }

    /// Run one dispatch pass over the due queue.
    pub async fn tick(&self) -> Result<TickSummary> {
        let now = Utc::now();
        let mut summary = TickSummary::default();

        let schedules: HashMap<String, Schedule> = self
            .schedules
            .list_dispatchable()?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let due = self.jobs.due_jobs(now, self.config.claim_batch_size)?;
        summary.examined = due.len();

        // Window gate per schedule, computed once per tick
        let mut gates: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();
        let mut handles: Vec<JoinHandle<Option<DeliveryOutcome>>> = Vec::new();

        for job in due {
            let Some(schedule) = schedules.get(&job.schedule_id) else {
                // Paused, draft or cancelled: the job stays queued untouched
                continue;
            };

            let gate = match gates.get(&schedule.id) {
                Some(gate) => *gate,
                None => {
                    let tz = schedule.tz()?;
                    let gate =
                        window::next_eligible(now, &schedule.windows, &schedule.quiet_hours, tz);
                    gates.insert(schedule.id.clone(), gate);
                    gate
                }
            };

            match gate {
                None => {
                    // No eligible time exists under this configuration
                    summary.stalled += 1;
                    continue;
                }
                Some(next) if next > now => {
                    match self.jobs.defer(&job.id, next) {
                        Ok(()) => summary.deferred += 1,
                        // claimed by a concurrent batch between the due
                        // listing and the deferral; not an error
                        Err(StoreError::IllegalTransition { .. }) => {
                            metrics::record_claim_conflict();
                            summary.conflicts += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    continue;
                }
                Some(_) => {}
            }

            if !self.jobs.claim(&job.id, now)? {
                // another worker got there first; not an error
                metrics::record_claim_conflict();
                summary.conflicts += 1;
                continue;
            }

            let governor = self.governors.get_or_create(schedule);
            let grant = match governor.try_admit(&job.recipient_domain, Instant::now()) {
                Admission::Granted(grant) => grant,
                Admission::Denied(reason) => {
                    // revert the claim with send_at unchanged, no penalty
                    self.jobs.release_claim(&job.id)?;
                    metrics::record_rate_denial(deny_label(&reason));
                    summary.denied += 1;
                    continue;
                }
            };

            summary.dispatched += 1;
            let jobs = Arc::clone(&self.jobs);
            let transport = Arc::clone(&self.transport);
            let config = self.config.clone();
            handles.push(tokio::spawn(async move {
                deliver(jobs, transport, config, job, grant).await
            }));
        }

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "Delivery task panicked");
            }
        }

        summary.completed = self.settle_drained(&schedules, now)?;
        Ok(summary)
    }

    /// Send up to `limit` queued jobs of one schedule right now, bypassing
    /// send windows. Quiet hours and the throttle still apply.
    pub async fn send_next_batch(&self, schedule_id: &str, limit: usize) -> Result<BatchReport> {
        let schedule = self
            .schedules
            .get(schedule_id)?
            .ok_or_else(|| StoreError::not_found("schedule", schedule_id))?;

        if schedule.paused || schedule.status == ScheduleStatus::Paused {
            return Err(Error::Config(ConfigError::invalid_control(
                schedule_id,
                "schedule is paused",
            )));
        }
        if !schedule.status.allows_dispatch() {
            return Err(Error::Config(ConfigError::invalid_control(
                schedule_id,
                format!("schedule status {} does not allow sending", schedule.status),
            )));
        }

        let now = Utc::now();
        if window::in_quiet_hours(now, &schedule.quiet_hours, schedule.tz()?) {
            return Err(Error::Config(ConfigError::invalid_control(
                schedule_id,
                "inside quiet hours",
            )));
        }

        let batch = self.jobs.next_batch(schedule_id, limit)?;
        let mut report = BatchReport {
            requested: batch.len(),
            ..Default::default()
        };
        let governor = self.governors.get_or_create(&schedule);

        for job in batch {
            if !self.jobs.claim(&job.id, now)? {
                metrics::record_claim_conflict();
                continue;
            }
            let grant = match governor.try_admit(&job.recipient_domain, Instant::now()) {
                Admission::Granted(grant) => grant,
                Admission::Denied(reason) => {
                    self.jobs.release_claim(&job.id)?;
                    metrics::record_rate_denial(deny_label(&reason));
                    report.denied += 1;
                    continue;
                }
            };
            let outcome = deliver(
                Arc::clone(&self.jobs),
                Arc::clone(&self.transport),
                self.config.clone(),
                job,
                grant,
            )
            .await;
            match outcome {
                Some(DeliveryOutcome::Sent) => report.sent += 1,
                Some(DeliveryOutcome::Retried) => report.retried += 1,
                Some(DeliveryOutcome::Failed) => report.failed += 1,
                None => {}
            }
        }

        info!(
            schedule_id,
            requested = report.requested,
            sent = report.sent,
            denied = report.denied,
            "Manual batch complete"
        );
        Ok(report)
    }

    /// Mark drained schedules completed, or stamp the next run for repeating
    /// ones. Returns how many schedules changed.
    fn settle_drained(
        &self,
        schedules: &HashMap<String, Schedule>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut changed = 0;
        for schedule in schedules.values() {
            if schedule.status != ScheduleStatus::Scheduled || schedule.paused {
                continue;
            }
            // Already re-armed for a future run
            if schedule.next_run_at.is_some_and(|t| t > now) {
                continue;
            }
            let counts = self.jobs.counts(&schedule.id)?;
            if counts.total == 0 || counts.scheduled > 0 || counts.processing > 0 {
                continue;
            }

            self.schedules.set_last_run_at(&schedule.id, now)?;
            match schedule.repeat_interval_mins {
                Some(mins) => {
                    let next = now + chrono::Duration::minutes(i64::from(mins));
                    self.schedules.set_next_run_at(&schedule.id, Some(next))?;
                    info!(schedule_id = %schedule.id, next_run_at = %next, "Schedule drained, re-armed");
                }
                None => {
                    self.schedules.set_next_run_at(&schedule.id, None)?;
                    self.schedules
                        .set_status(&schedule.id, ScheduleStatus::Completed)?;
                    info!(schedule_id = %schedule.id, "Schedule completed");
                }
            }
            changed += 1;
        }
        Ok(changed)
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Exponential backoff with ±20% jitter, capped.
fn backoff_delay(config: &DispatcherConfig, attempt: u32) -> chrono::Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = config.retry_backoff_base.as_secs_f64();
    let capped = (base * 2f64.powi(exp as i32)).min(config.retry_backoff_cap.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    chrono::Duration::milliseconds((capped * jitter * 1000.0) as i64)
}

/// Drive one claimed job through the transport and write the outcome back.
/// The admission grant is held for the duration of the call; dropping it
/// releases the concurrency slot.
async fn deliver(
    jobs: Arc<dyn JobStore>,
    transport: Arc<dyn EmailTransport>,
    config: DispatcherConfig,
    job: Job,
    grant: AdmissionGrant,
) -> Option<DeliveryOutcome> {
    metrics::inc_in_flight();
    let started = Instant::now();
    let result = tokio::time::timeout(config.transport_timeout, transport.send(&job)).await;
    metrics::observe_transport_seconds(started.elapsed().as_secs_f64());
    metrics::dec_in_flight();
    drop(grant);

    let failure = match result {
        Ok(Ok(receipt)) => {
            let now = Utc::now();
            if let Err(e) = jobs.mark_sent(&job.id, now, &receipt.provider_message_id) {
                error!(job_id = %job.id, error = %e, "Failed to record sent job");
                return None;
            }
            metrics::record_job_sent();
            debug!(job_id = %job.id, recipient = %job.recipient, "Job sent");
            return Some(DeliveryOutcome::Sent);
        }
        Ok(Err(e)) => e,
        Err(_) => transport::TransportError::Timeout(config.transport_timeout),
    };

    let attempt = job.attempts + 1;
    let outcome = if failure.is_transient() && attempt < config.max_attempts {
        let next = Utc::now() + backoff_delay(&config, attempt);
        if let Err(e) = jobs.mark_retry(&job.id, next, &failure.to_string()) {
            error!(job_id = %job.id, error = %e, "Failed to record retry");
            return None;
        }
        metrics::record_job_retried();
        warn!(
            job_id = %job.id,
            attempt,
            next_send_at = %next,
            error = %failure,
            "Delivery failed, retrying"
        );
        DeliveryOutcome::Retried
    } else {
        if let Err(e) = jobs.mark_failed(&job.id, &failure.to_string()) {
            error!(job_id = %job.id, error = %e, "Failed to record failed job");
            return None;
        }
        metrics::record_job_failed();
        warn!(job_id = %job.id, attempt, error = %failure, "Job failed permanently");
        DeliveryOutcome::Failed
    };
    Some(outcome)
}
