//! In-memory store implementations
//!
//! Backing for unit and integration tests; the same transition guards as
//! the SQLite implementation, including the compare-and-swap claim.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::models::{Job, JobStatus, Schedule, ScheduleStatus};

use super::{
    check_transition, DailyCounts, JobStore, QueuePage, QueueQuery, ScheduleStore, StatusCounts,
    StoreError, StoreResult,
};

/// In-memory job store
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut Job) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut jobs = self.jobs.lock().expect("job store poisoned");
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        f(job)
    }
}

impl JobStore for MemoryJobStore {
    fn insert_jobs(&self, new_jobs: &[Job]) -> StoreResult<u64> {
        let mut jobs = self.jobs.lock().expect("job store poisoned");
        let mut inserted = 0;
        for job in new_jobs {
            let duplicate = jobs
                .values()
                .any(|j| j.schedule_id == job.schedule_id && j.recipient == job.recipient);
            if duplicate {
                continue;
            }
            jobs.insert(job.id.clone(), job.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    fn get(&self, job_id: &str) -> StoreResult<Option<Job>> {
        Ok(self.jobs.lock().expect("job store poisoned").get(job_id).cloned())
    }

    fn claim(&self, job_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut jobs = self.jobs.lock().expect("job store poisoned");
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        if job.status != JobStatus::Scheduled {
            return Ok(false);
        }
        job.status = JobStatus::Processing;
        job.processing_started_at = Some(now);
        Ok(true)
    }

    fn release_claim(&self, job_id: &str) -> StoreResult<()> {
        self.with_job(job_id, |job| {
            check_transition(job_id, job.status, JobStatus::Scheduled)?;
            job.status = JobStatus::Scheduled;
            job.processing_started_at = None;
            Ok(())
        })
    }

    fn mark_sent(
        &self,
        job_id: &str,
        sent_at: DateTime<Utc>,
        provider_message_id: &str,
    ) -> StoreResult<()> {
        self.with_job(job_id, |job| {
            check_transition(job_id, job.status, JobStatus::Sent)?;
            job.status = JobStatus::Sent;
            job.sent_at = Some(sent_at);
            job.provider_message_id = Some(provider_message_id.to_string());
            job.error = None;
            Ok(())
        })
    }

    fn mark_retry(
        &self,
        job_id: &str,
        next_send_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        self.with_job(job_id, |job| {
            check_transition(job_id, job.status, JobStatus::Scheduled)?;
            job.status = JobStatus::Scheduled;
            job.send_at = next_send_at;
            job.attempts += 1;
            job.error = Some(error.to_string());
            job.processing_started_at = None;
            Ok(())
        })
    }

    fn mark_failed(&self, job_id: &str, error: &str) -> StoreResult<()> {
        self.with_job(job_id, |job| {
            check_transition(job_id, job.status, JobStatus::Failed)?;
            job.status = JobStatus::Failed;
            job.attempts += 1;
            job.error = Some(error.to_string());
            Ok(())
        })
    }

    fn defer(&self, job_id: &str, new_send_at: DateTime<Utc>) -> StoreResult<()> {
        self.with_job(job_id, |job| {
            if job.status != JobStatus::Scheduled {
                return Err(StoreError::IllegalTransition {
                    job_id: job_id.to_string(),
                    from: job.status,
                    to: JobStatus::Scheduled,
                });
            }
            job.send_at = new_send_at;
            Ok(())
        })
    }

    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Scheduled && j.send_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.send_at, &a.id).cmp(&(b.send_at, &b.id)));
        due.truncate(limit);
        Ok(due)
    }

    fn next_batch(&self, schedule_id: &str, limit: usize) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        let mut batch: Vec<Job> = jobs
            .values()
            .filter(|j| j.schedule_id == schedule_id && j.status == JobStatus::Scheduled)
            .cloned()
            .collect();
        batch.sort_by(|a, b| (a.send_at, &a.id).cmp(&(b.send_at, &b.id)));
        batch.truncate(limit);
        Ok(batch)
    }

    fn counts(&self, schedule_id: &str) -> StoreResult<StatusCounts> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        let mut counts = StatusCounts::default();
        for job in jobs.values().filter(|j| j.schedule_id == schedule_id) {
            counts.total += 1;
            match job.status {
                JobStatus::Scheduled => counts.scheduled += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Sent => counts.sent += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn next_send_at(&self, schedule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        Ok(jobs
            .values()
            .filter(|j| j.schedule_id == schedule_id && j.status == JobStatus::Scheduled)
            .map(|j| j.send_at)
            .min())
    }

    fn last_sent_at(&self, schedule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        Ok(jobs
            .values()
            .filter(|j| j.schedule_id == schedule_id && j.status == JobStatus::Sent)
            .filter_map(|j| j.sent_at)
            .max())
    }

    fn sent_since(&self, schedule_id: &str, since: DateTime<Utc>) -> StoreResult<u64> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        Ok(jobs
            .values()
            .filter(|j| {
                j.schedule_id == schedule_id
                    && j.status == JobStatus::Sent
                    && j.sent_at.is_some_and(|t| t >= since)
            })
            .count() as u64)
    }

    fn planned_by_day(
        &self,
        schedule_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DailyCounts> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        let mut by_day: HashMap<chrono::NaiveDate, u64> = HashMap::new();
        for job in jobs.values().filter(|j| {
            j.schedule_id == schedule_id
                && j.status == JobStatus::Scheduled
                && j.send_at >= from
                && j.send_at <= to
        }) {
            *by_day.entry(job.send_at.date_naive()).or_insert(0) += 1;
        }
        let mut counts: DailyCounts = by_day.into_iter().collect();
        counts.sort_by_key(|(d, _)| *d);
        Ok(counts)
    }

    fn sent_by_day(
        &self,
        schedule_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DailyCounts> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        let mut by_day: HashMap<chrono::NaiveDate, u64> = HashMap::new();
        for job in jobs.values().filter(|j| j.schedule_id == schedule_id) {
            if let Some(sent_at) = job.sent_at {
                if job.status == JobStatus::Sent && sent_at >= from && sent_at <= to {
                    *by_day.entry(sent_at.date_naive()).or_insert(0) += 1;
                }
            }
        }
        let mut counts: DailyCounts = by_day.into_iter().collect();
        counts.sort_by_key(|(d, _)| *d);
        Ok(counts)
    }

    fn list(&self, schedule_id: &str, query: &QueueQuery) -> StoreResult<QueuePage> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.schedule_id == schedule_id)
            .filter(|j| query.status.is_none_or(|s| j.status == s))
            .filter(|j| {
                query
                    .search
                    .as_deref()
                    .is_none_or(|needle| j.recipient.contains(needle))
            })
            .filter(|j| query.cursor.as_deref().is_none_or(|c| j.id.as_str() > c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        let limit = query.limit.max(1);
        let next_cursor = if matching.len() > limit {
            matching.truncate(limit);
            matching.last().map(|j| j.id.clone())
        } else {
            None
        };
        Ok(QueuePage {
            jobs: matching,
            next_cursor,
        })
    }

    fn count_processing(&self, schedule_id: &str) -> StoreResult<u64> {
        let jobs = self.jobs.lock().expect("job store poisoned");
        Ok(jobs
            .values()
            .filter(|j| j.schedule_id == schedule_id && j.status == JobStatus::Processing)
            .count() as u64)
    }
}

/// In-memory schedule store
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_schedule<T>(
        &self,
        schedule_id: &str,
        f: impl FnOnce(&mut Schedule) -> T,
    ) -> StoreResult<T> {
        let mut schedules = self.schedules.lock().expect("schedule store poisoned");
        let schedule = schedules
            .get_mut(schedule_id)
            .ok_or_else(|| StoreError::not_found("schedule", schedule_id))?;
        Ok(f(schedule))
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn create(&self, schedule: &Schedule) -> StoreResult<()> {
        self.schedules
            .lock()
            .expect("schedule store poisoned")
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    fn get(&self, schedule_id: &str) -> StoreResult<Option<Schedule>> {
        Ok(self
            .schedules
            .lock()
            .expect("schedule store poisoned")
            .get(schedule_id)
            .cloned())
    }

    fn update(&self, schedule: &Schedule) -> StoreResult<()> {
        let mut schedules = self.schedules.lock().expect("schedule store poisoned");
        if !schedules.contains_key(&schedule.id) {
            return Err(StoreError::not_found("schedule", &schedule.id));
        }
        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    fn set_paused(&self, schedule_id: &str, paused: bool) -> StoreResult<()> {
        self.with_schedule(schedule_id, |s| s.paused = paused)
    }

    fn set_status(&self, schedule_id: &str, status: ScheduleStatus) -> StoreResult<()> {
        self.with_schedule(schedule_id, |s| s.status = status)
    }

    fn set_next_run_at(
        &self,
        schedule_id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.with_schedule(schedule_id, |s| s.next_run_at = next_run_at)
    }

    fn set_last_run_at(&self, schedule_id: &str, last_run_at: DateTime<Utc>) -> StoreResult<()> {
        self.with_schedule(schedule_id, |s| s.last_run_at = Some(last_run_at))
    }

    fn list_dispatchable(&self) -> StoreResult<Vec<Schedule>> {
        let schedules = self.schedules.lock().expect("schedule store poisoned");
        Ok(schedules
            .values()
            .filter(|s| s.status.allows_dispatch() && !s.paused)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> StoreResult<Vec<Schedule>> {
        let schedules = self.schedules.lock().expect("schedule store poisoned");
        Ok(schedules.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(schedule_id: &str, recipient: &str, send_at: DateTime<Utc>) -> Job {
        Job::new(schedule_id, recipient, send_at).unwrap()
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let j = job("s1", "a@x.com", now);
        store.insert_jobs(std::slice::from_ref(&j)).unwrap();

        assert!(store.claim(&j.id, now).unwrap());
        // second claim loses the race
        assert!(!store.claim(&j.id, now).unwrap());

        // a released claim can be claimed again, send_at untouched
        store.release_claim(&j.id).unwrap();
        let stored = store.get(&j.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.send_at, j.send_at);
        assert!(store.claim(&j.id, now).unwrap());
    }

    #[test]
    fn test_insert_skips_duplicates() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let a = job("s1", "a@x.com", now);
        let b = job("s1", "a@x.com", now);
        let c = job("s1", "c@x.com", now);
        assert_eq!(store.insert_jobs(&[a, b, c]).unwrap(), 2);
    }

    #[test]
    fn test_retry_and_fail_increment_attempts() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let j = job("s1", "a@x.com", now);
        store.insert_jobs(std::slice::from_ref(&j)).unwrap();

        store.claim(&j.id, now).unwrap();
        store
            .mark_retry(&j.id, now + Duration::minutes(5), "connection reset")
            .unwrap();
        let stored = store.get(&j.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.send_at, now + Duration::minutes(5));

        store.claim(&j.id, now).unwrap();
        store.mark_failed(&j.id, "mailbox does not exist").unwrap();
        let stored = store.get(&j.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 2);
        assert!(stored.error.is_some());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let j = job("s1", "a@x.com", now);
        store.insert_jobs(std::slice::from_ref(&j)).unwrap();

        // sent without a claim is illegal
        let err = store.mark_sent(&j.id, now, "msg-1").unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn test_due_jobs_ordering_and_limit() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let early = job("s1", "a@x.com", now - Duration::minutes(10));
        let late = job("s1", "b@x.com", now - Duration::minutes(1));
        let future = job("s1", "c@x.com", now + Duration::minutes(10));
        store
            .insert_jobs(&[late.clone(), early.clone(), future])
            .unwrap();

        let due = store.due_jobs(now, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, early.id);
        assert_eq!(due[1].id, late.id);

        let due = store.due_jobs(now, 1).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_counts_and_aggregates() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let a = job("s1", "a@x.com", now);
        let b = job("s1", "b@x.com", now + Duration::hours(1));
        store.insert_jobs(&[a.clone(), b.clone()]).unwrap();

        store.claim(&a.id, now).unwrap();
        store.mark_sent(&a.id, now, "msg-1").unwrap();

        let counts = store.counts("s1").unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.scheduled, 1);

        assert_eq!(store.next_send_at("s1").unwrap(), Some(b.send_at));
        assert_eq!(store.last_sent_at("s1").unwrap(), Some(now));
        assert_eq!(store.sent_since("s1", now - Duration::minutes(15)).unwrap(), 1);
    }

    #[test]
    fn test_list_pagination() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let jobs: Vec<Job> = (0..5)
            .map(|i| job("s1", &format!("user{i}@x.com"), now))
            .collect();
        store.insert_jobs(&jobs).unwrap();

        let page1 = store
            .list(
                "s1",
                &QueueQuery {
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page1.jobs.len(), 2);
        let cursor = page1.next_cursor.expect("more pages");

        let page2 = store
            .list(
                "s1",
                &QueueQuery {
                    limit: 2,
                    cursor: Some(cursor),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page2.jobs.len(), 2);

        // no overlap between pages
        for j in &page2.jobs {
            assert!(!page1.jobs.iter().any(|p| p.id == j.id));
        }
    }

    #[test]
    fn test_list_filters() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let a = job("s1", "alice@x.com", now);
        let b = job("s1", "bob@y.com", now);
        store.insert_jobs(&[a.clone(), b]).unwrap();
        store.claim(&a.id, now).unwrap();

        let page = store
            .list(
                "s1",
                &QueueQuery {
                    status: Some(JobStatus::Processing),
                    limit: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].recipient, "alice@x.com");

        let page = store
            .list(
                "s1",
                &QueueQuery {
                    search: Some("bob".to_string()),
                    limit: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].recipient, "bob@y.com");
    }

    #[test]
    fn test_schedule_store_dispatchable() {
        let store = MemoryScheduleStore::new();
        let mut s1 = Schedule::new("c1", "Step 1", 1);
        s1.status = ScheduleStatus::Scheduled;
        let mut s2 = Schedule::new("c1", "Step 2", 2);
        s2.status = ScheduleStatus::Scheduled;
        s2.paused = true;
        let mut s3 = Schedule::new("c1", "Step 3", 3);
        s3.status = ScheduleStatus::Cancelled;

        store.create(&s1).unwrap();
        store.create(&s2).unwrap();
        store.create(&s3).unwrap();

        let dispatchable = store.list_dispatchable().unwrap();
        assert_eq!(dispatchable.len(), 1);
        assert_eq!(dispatchable[0].id, s1.id);

        store.set_paused(&s2.id, false).unwrap();
        assert_eq!(store.list_dispatchable().unwrap().len(), 2);
    }
}
