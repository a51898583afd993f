//! SQLite-backed stores
//!
//! Single bundled-SQLite connection behind a mutex. Timestamps are stored
//! as RFC3339 text so SQLite's `date()` can group them; window, quiet-hour
//! and per-domain configuration are stored as JSON columns.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::models::{Job, JobStatus, Schedule, ScheduleStatus};

use super::{
    DailyCounts, JobStore, QueuePage, QueueQuery, ScheduleStore, StatusCounts, StoreError,
    StoreResult,
};

// ============================================================================
// Connection setup
// ============================================================================

/// Open (or create) the database at `path` and run the schema migration.
pub fn open_database<P: AsRef<Path>>(path: P) -> StoreResult<Arc<Mutex<Connection>>> {
    let conn = Connection::open(path.as_ref())?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schedules (
            id                   TEXT PRIMARY KEY,
            campaign_id          TEXT NOT NULL,
            name                 TEXT NOT NULL,
            step_order           INTEGER NOT NULL,
            windows              TEXT NOT NULL,
            quiet_hours          TEXT NOT NULL,
            timezone             TEXT NOT NULL,
            throttle_per_minute  INTEGER NOT NULL,
            max_concurrent       INTEGER NOT NULL,
            per_domain           TEXT NOT NULL,
            paused               INTEGER NOT NULL DEFAULT 0,
            status               TEXT NOT NULL,
            repeat_interval_mins INTEGER,
            next_run_at          TEXT,
            last_run_at          TEXT
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id                    TEXT PRIMARY KEY,
            schedule_id           TEXT NOT NULL REFERENCES schedules(id),
            recipient             TEXT NOT NULL,
            recipient_domain      TEXT NOT NULL,
            status                TEXT NOT NULL,
            attempts              INTEGER NOT NULL DEFAULT 0,
            send_at               TEXT NOT NULL,
            processing_started_at TEXT,
            sent_at               TEXT,
            provider_message_id   TEXT,
            error                 TEXT,
            UNIQUE (schedule_id, recipient)
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status_send_at ON jobs (status, send_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_schedule_status ON jobs (schedule_id, status);
        "#,
    )?;

    info!(path = %path.as_ref().display(), "Database opened");
    Ok(Arc::new(Mutex::new(conn)))
}

// ============================================================================
// Column conversion helpers
// ============================================================================

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn column_utc(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn column_utc_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, e)),
        None => Ok(None),
    }
}

fn column_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn parse_utc_opt(column: &str, value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StoreError::corrupt(format!("bad timestamp in {column}: {e}")))
        })
        .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::corrupt(format!("encode failed: {e}")))
}

// ============================================================================
// Job store
// ============================================================================

const JOB_COLUMNS: &str = "id, schedule_id, recipient, recipient_domain, status, attempts, \
     send_at, processing_started_at, sent_at, provider_message_id, error";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_raw: String = row.get(4)?;
    let status = JobStatus::from_str(&status_raw).map_err(|e| conversion_err(4, e))?;
    Ok(Job {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        recipient: row.get(2)?,
        recipient_domain: row.get(3)?,
        status,
        attempts: row.get(5)?,
        send_at: column_utc(row, 6)?,
        processing_started_at: column_utc_opt(row, 7)?,
        sent_at: column_utc_opt(row, 8)?,
        provider_message_id: row.get(9)?,
        error: row.get(10)?,
    })
}

/// Job store over a shared SQLite connection
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn query_jobs(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> StoreResult<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    fn daily_counts(
        &self,
        sql: &str,
        schedule_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DailyCounts> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(
            params![schedule_id, from.to_rfc3339(), to.to_rfc3339()],
            |row| {
                let day: String = row.get(0)?;
                let count: u64 = row.get(1)?;
                Ok((day, count))
            },
        )?;
        let mut counts = Vec::new();
        for row in rows {
            let (day, count) = row?;
            let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .map_err(|e| StoreError::corrupt(format!("bad date bucket {day}: {e}")))?;
            counts.push((date, count));
        }
        Ok(counts)
    }

    fn current_status(&self, conn: &Connection, job_id: &str) -> StoreResult<JobStatus> {
        let status: String = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        JobStatus::from_str(&status)
            .map_err(|_| StoreError::corrupt(format!("unknown job status: {status}")))
    }

    /// Run a status-changing update under the transition table. The status
    /// check and the write happen under the same connection lock.
    fn guarded_update(
        &self,
        job_id: &str,
        to: JobStatus,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let from = self.current_status(&conn, job_id)?;
        super::check_transition(job_id, from, to)?;
        let changed = conn.execute(sql, params)?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::not_found("job", job_id))
        }
    }
}

impl JobStore for SqliteJobStore {
    fn insert_jobs(&self, new_jobs: &[Job]) -> StoreResult<u64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO jobs \
                 (id, schedule_id, recipient, recipient_domain, status, attempts, send_at, \
                  processing_started_at, sent_at, provider_message_id, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, ?8)",
            )?;
            for job in new_jobs {
                inserted += stmt.execute(params![
                    job.id,
                    job.schedule_id,
                    job.recipient,
                    job.recipient_domain,
                    job.status.as_str(),
                    job.attempts,
                    job.send_at.to_rfc3339(),
                    job.error,
                ])? as u64;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn get(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                row_to_job,
            )
            .optional()?)
    }

    fn claim(&self, job_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        // Compare-and-swap: of N concurrent callers exactly one sees a row change.
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'processing', processing_started_at = ?2 \
             WHERE id = ?1 AND status = 'scheduled'",
            params![job_id, now.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    fn release_claim(&self, job_id: &str) -> StoreResult<()> {
        self.guarded_update(
            job_id,
            JobStatus::Scheduled,
            "UPDATE jobs SET status = 'scheduled', processing_started_at = NULL WHERE id = ?1",
            params![job_id],
        )
    }

    fn mark_sent(
        &self,
        job_id: &str,
        sent_at: DateTime<Utc>,
        provider_message_id: &str,
    ) -> StoreResult<()> {
        self.guarded_update(
            job_id,
            JobStatus::Sent,
            "UPDATE jobs SET status = 'sent', sent_at = ?2, provider_message_id = ?3, \
             error = NULL WHERE id = ?1",
            params![job_id, sent_at.to_rfc3339(), provider_message_id],
        )
    }

    fn mark_retry(
        &self,
        job_id: &str,
        next_send_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        self.guarded_update(
            job_id,
            JobStatus::Scheduled,
            "UPDATE jobs SET status = 'scheduled', send_at = ?2, attempts = attempts + 1, \
             error = ?3, processing_started_at = NULL WHERE id = ?1",
            params![job_id, next_send_at.to_rfc3339(), error],
        )
    }

    fn mark_failed(&self, job_id: &str, error: &str) -> StoreResult<()> {
        self.guarded_update(
            job_id,
            JobStatus::Failed,
            "UPDATE jobs SET status = 'failed', attempts = attempts + 1, error = ?2 \
             WHERE id = ?1",
            params![job_id, error],
        )
    }

    fn defer(&self, job_id: &str, new_send_at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET send_at = ?2 WHERE id = ?1 AND status = 'scheduled'",
            params![job_id, new_send_at.to_rfc3339()],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            // either missing or no longer scheduled
            let current = self.current_status(&conn, job_id)?;
            Err(StoreError::IllegalTransition {
                job_id: job_id.to_string(),
                from: current,
                to: JobStatus::Scheduled,
            })
        }
    }

    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE status = 'scheduled' AND send_at <= ?1 \
                 ORDER BY send_at, id LIMIT ?2"
            ),
            params![now.to_rfc3339(), limit as i64],
        )
    }

    fn next_batch(&self, schedule_id: &str, limit: usize) -> StoreResult<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE schedule_id = ?1 AND status = 'scheduled' \
                 ORDER BY send_at, id LIMIT ?2"
            ),
            params![schedule_id, limit as i64],
        )
    }

    fn counts(&self, schedule_id: &str) -> StoreResult<StatusCounts> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM jobs WHERE schedule_id = ?1 GROUP BY status")?;
        let rows = stmt.query_map(params![schedule_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            counts.total += n;
            match JobStatus::from_str(&status)
                .map_err(|_| StoreError::corrupt(format!("unknown job status: {status}")))?
            {
                JobStatus::Scheduled => counts.scheduled += n,
                JobStatus::Processing => counts.processing += n,
                JobStatus::Sent => counts.sent += n,
                JobStatus::Failed => counts.failed += n,
            }
        }
        Ok(counts)
    }

    fn next_send_at(&self, schedule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let value: Option<String> = conn.query_row(
            "SELECT MIN(send_at) FROM jobs WHERE schedule_id = ?1 AND status = 'scheduled'",
            params![schedule_id],
            |row| row.get(0),
        )?;
        parse_utc_opt("send_at", value)
    }

    fn last_sent_at(&self, schedule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let value: Option<String> = conn.query_row(
            "SELECT MAX(sent_at) FROM jobs WHERE schedule_id = ?1 AND status = 'sent'",
            params![schedule_id],
            |row| row.get(0),
        )?;
        parse_utc_opt("sent_at", value)
    }

    fn sent_since(&self, schedule_id: &str, since: DateTime<Utc>) -> StoreResult<u64> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM jobs \
             WHERE schedule_id = ?1 AND status = 'sent' AND sent_at >= ?2",
            params![schedule_id, since.to_rfc3339()],
            |row| row.get(0),
        )?)
    }

    fn planned_by_day(
        &self,
        schedule_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DailyCounts> {
        self.daily_counts(
            "SELECT date(send_at), COUNT(*) FROM jobs \
             WHERE schedule_id = ?1 AND status = 'scheduled' \
               AND send_at >= ?2 AND send_at <= ?3 \
             GROUP BY date(send_at) ORDER BY date(send_at)",
            schedule_id,
            from,
            to,
        )
    }

    fn sent_by_day(
        &self,
        schedule_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DailyCounts> {
        self.daily_counts(
            "SELECT date(sent_at), COUNT(*) FROM jobs \
             WHERE schedule_id = ?1 AND status = 'sent' \
               AND sent_at >= ?2 AND sent_at <= ?3 \
             GROUP BY date(sent_at) ORDER BY date(sent_at)",
            schedule_id,
            from,
            to,
        )
    }

    fn list(&self, schedule_id: &str, query: &QueueQuery) -> StoreResult<QueuePage> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE schedule_id = ?1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(schedule_id.to_string())];

        if let Some(status) = query.status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(search) = &query.search {
            args.push(Box::new(format!("%{search}%")));
            sql.push_str(&format!(" AND recipient LIKE ?{}", args.len()));
        }
        if let Some(cursor) = &query.cursor {
            args.push(Box::new(cursor.clone()));
            sql.push_str(&format!(" AND id > ?{}", args.len()));
        }

        // Fetch one extra row to learn whether another page exists.
        let limit = query.limit.max(1);
        args.push(Box::new((limit + 1) as i64));
        sql.push_str(&format!(" ORDER BY id LIMIT ?{}", args.len()));

        let bound: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut jobs = self.query_jobs(&sql, &bound)?;
        let next_cursor = if jobs.len() > limit {
            jobs.truncate(limit);
            jobs.last().map(|j| j.id.clone())
        } else {
            None
        };
        Ok(QueuePage { jobs, next_cursor })
    }

    fn count_processing(&self, schedule_id: &str) -> StoreResult<u64> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE schedule_id = ?1 AND status = 'processing'",
            params![schedule_id],
            |row| row.get(0),
        )?)
    }
}

// ============================================================================
// Schedule store
// ============================================================================

const SCHEDULE_COLUMNS: &str = "id, campaign_id, name, step_order, windows, quiet_hours, \
     timezone, throttle_per_minute, max_concurrent, per_domain, paused, status, \
     repeat_interval_mins, next_run_at, last_run_at";

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let status_raw: String = row.get(11)?;
    let status = ScheduleStatus::from_str(&status_raw).map_err(|e| conversion_err(11, e))?;
    Ok(Schedule {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        name: row.get(2)?,
        step_order: row.get(3)?,
        windows: column_json(row, 4)?,
        quiet_hours: column_json(row, 5)?,
        timezone: row.get(6)?,
        throttle_per_minute: row.get(7)?,
        max_concurrent: row.get(8)?,
        per_domain: column_json(row, 9)?,
        paused: row.get::<_, i64>(10)? != 0,
        status,
        repeat_interval_mins: row.get(12)?,
        next_run_at: column_utc_opt(row, 13)?,
        last_run_at: column_utc_opt(row, 14)?,
    })
}

/// Schedule store over a shared SQLite connection
pub struct SqliteScheduleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteScheduleStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn touch(
        &self,
        schedule_id: &str,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(sql, params)?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::not_found("schedule", schedule_id))
        }
    }

    fn query_schedules(&self, sql: &str) -> StoreResult<Vec<Schedule>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_schedule)?;
        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(row?);
        }
        Ok(schedules)
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn create(&self, schedule: &Schedule) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO schedules \
             (id, campaign_id, name, step_order, windows, quiet_hours, timezone, \
              throttle_per_minute, max_concurrent, per_domain, paused, status, \
              repeat_interval_mins, next_run_at, last_run_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                schedule.id,
                schedule.campaign_id,
                schedule.name,
                schedule.step_order,
                to_json(&schedule.windows)?,
                to_json(&schedule.quiet_hours)?,
                schedule.timezone,
                schedule.throttle_per_minute,
                schedule.max_concurrent,
                to_json(&schedule.per_domain)?,
                schedule.paused as i64,
                schedule.status.as_str(),
                schedule.repeat_interval_mins,
                schedule.next_run_at.map(|t| t.to_rfc3339()),
                schedule.last_run_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn get(&self, schedule_id: &str) -> StoreResult<Option<Schedule>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![schedule_id],
                row_to_schedule,
            )
            .optional()?)
    }

    fn update(&self, schedule: &Schedule) -> StoreResult<()> {
        self.touch(
            &schedule.id,
            "UPDATE schedules SET campaign_id = ?2, name = ?3, step_order = ?4, windows = ?5, \
             quiet_hours = ?6, timezone = ?7, throttle_per_minute = ?8, max_concurrent = ?9, \
             per_domain = ?10, paused = ?11, status = ?12, repeat_interval_mins = ?13, \
             next_run_at = ?14, last_run_at = ?15 \
             WHERE id = ?1",
            params![
                schedule.id,
                schedule.campaign_id,
                schedule.name,
                schedule.step_order,
                to_json(&schedule.windows)?,
                to_json(&schedule.quiet_hours)?,
                schedule.timezone,
                schedule.throttle_per_minute,
                schedule.max_concurrent,
                to_json(&schedule.per_domain)?,
                schedule.paused as i64,
                schedule.status.as_str(),
                schedule.repeat_interval_mins,
                schedule.next_run_at.map(|t| t.to_rfc3339()),
                schedule.last_run_at.map(|t| t.to_rfc3339()),
            ],
        )
    }

    fn set_paused(&self, schedule_id: &str, paused: bool) -> StoreResult<()> {
        self.touch(
            schedule_id,
            "UPDATE schedules SET paused = ?2 WHERE id = ?1",
            params![schedule_id, paused as i64],
        )
    }

    fn set_status(&self, schedule_id: &str, status: ScheduleStatus) -> StoreResult<()> {
        self.touch(
            schedule_id,
            "UPDATE schedules SET status = ?2 WHERE id = ?1",
            params![schedule_id, status.as_str()],
        )
    }

    fn set_next_run_at(
        &self,
        schedule_id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.touch(
            schedule_id,
            "UPDATE schedules SET next_run_at = ?2 WHERE id = ?1",
            params![schedule_id, next_run_at.map(|t| t.to_rfc3339())],
        )
    }

    fn set_last_run_at(&self, schedule_id: &str, last_run_at: DateTime<Utc>) -> StoreResult<()> {
        self.touch(
            schedule_id,
            "UPDATE schedules SET last_run_at = ?2 WHERE id = ?1",
            params![schedule_id, last_run_at.to_rfc3339()],
        )
    }

    fn list_dispatchable(&self) -> StoreResult<Vec<Schedule>> {
        self.query_schedules(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE status IN ('SCHEDULED', 'PAUSED') AND paused = 0 \
             ORDER BY step_order, id"
        ))
    }

    fn list_all(&self) -> StoreResult<Vec<Schedule>> {
        self.query_schedules(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY campaign_id, step_order, id"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn stores() -> (NamedTempFile, SqliteJobStore, SqliteScheduleStore) {
        let file = NamedTempFile::new().unwrap();
        let conn = open_database(file.path()).unwrap();
        (
            file,
            SqliteJobStore::new(conn.clone()),
            SqliteScheduleStore::new(conn),
        )
    }

    fn seed_schedule(schedules: &SqliteScheduleStore) -> Schedule {
        let mut schedule = Schedule::new("c1", "Step 1", 1);
        schedule.status = ScheduleStatus::Scheduled;
        schedules.create(&schedule).unwrap();
        schedule
    }

    #[test]
    fn test_schedule_round_trip() {
        let (_file, _jobs, schedules) = stores();
        let mut schedule = Schedule::new("c1", "Launch", 1);
        schedule.windows = vec![crate::models::TimeWindow::parse("09:30-11:45").unwrap()];
        schedule.quiet_hours = vec![crate::models::TimeWindow::parse("12:00-13:00").unwrap()];
        schedule.per_domain.insert("gmail.com".to_string(), 10);
        schedule.repeat_interval_mins = Some(1440);
        schedule.next_run_at = Some(Utc::now());
        schedules.create(&schedule).unwrap();

        let loaded = schedules.get(&schedule.id).unwrap().unwrap();
        assert_eq!(loaded.windows, schedule.windows);
        assert_eq!(loaded.quiet_hours, schedule.quiet_hours);
        assert_eq!(loaded.per_domain, schedule.per_domain);
        assert_eq!(loaded.repeat_interval_mins, Some(1440));
        assert_eq!(loaded.status, ScheduleStatus::Draft);
        assert_eq!(
            loaded.next_run_at.map(|t| t.timestamp()),
            schedule.next_run_at.map(|t| t.timestamp())
        );
    }

    #[test]
    fn test_insert_skips_duplicate_recipients() {
        let (_file, jobs, schedules) = stores();
        let schedule = seed_schedule(&schedules);
        let now = Utc::now();
        let a = Job::new(&schedule.id, "a@x.com", now).unwrap();
        let dup = Job::new(&schedule.id, "a@x.com", now).unwrap();
        let b = Job::new(&schedule.id, "b@x.com", now).unwrap();
        assert_eq!(jobs.insert_jobs(&[a, dup, b]).unwrap(), 2);
        assert_eq!(jobs.counts(&schedule.id).unwrap().total, 2);
    }

    #[test]
    fn test_claim_wins_once() {
        let (_file, jobs, schedules) = stores();
        let schedule = seed_schedule(&schedules);
        let now = Utc::now();
        let job = Job::new(&schedule.id, "a@x.com", now).unwrap();
        jobs.insert_jobs(std::slice::from_ref(&job)).unwrap();

        assert!(jobs.claim(&job.id, now).unwrap());
        assert!(!jobs.claim(&job.id, now).unwrap());
        let loaded = jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
        assert!(loaded.processing_started_at.is_some());

        // a rate-limit denial hands the job back untouched
        jobs.release_claim(&job.id).unwrap();
        let loaded = jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Scheduled);
        assert!(loaded.processing_started_at.is_none());
        assert!(jobs.claim(&job.id, now).unwrap());
    }

    #[test]
    fn test_sent_lifecycle_and_aggregates() {
        let (_file, jobs, schedules) = stores();
        let schedule = seed_schedule(&schedules);
        let now = Utc::now();
        let job = Job::new(&schedule.id, "a@x.com", now - Duration::minutes(1)).unwrap();
        jobs.insert_jobs(std::slice::from_ref(&job)).unwrap();

        let due = jobs.due_jobs(now, 10).unwrap();
        assert_eq!(due.len(), 1);

        jobs.claim(&job.id, now).unwrap();
        jobs.mark_sent(&job.id, now, "provider-42").unwrap();

        let loaded = jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Sent);
        assert_eq!(loaded.provider_message_id.as_deref(), Some("provider-42"));
        assert_eq!(
            jobs.last_sent_at(&schedule.id).unwrap().map(|t| t.timestamp()),
            Some(now.timestamp())
        );
        assert_eq!(
            jobs.sent_since(&schedule.id, now - Duration::minutes(15)).unwrap(),
            1
        );

        let sent = jobs
            .sent_by_day(&schedule.id, now - Duration::days(1), now + Duration::days(1))
            .unwrap();
        assert_eq!(sent, vec![(now.date_naive(), 1)]);
    }

    #[test]
    fn test_mark_sent_requires_claim() {
        let (_file, jobs, schedules) = stores();
        let schedule = seed_schedule(&schedules);
        let now = Utc::now();
        let job = Job::new(&schedule.id, "a@x.com", now).unwrap();
        jobs.insert_jobs(std::slice::from_ref(&job)).unwrap();

        let err = jobs.mark_sent(&job.id, now, "m").unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn test_retry_updates_send_at_and_attempts() {
        let (_file, jobs, schedules) = stores();
        let schedule = seed_schedule(&schedules);
        let now = Utc::now();
        let job = Job::new(&schedule.id, "a@x.com", now).unwrap();
        jobs.insert_jobs(std::slice::from_ref(&job)).unwrap();

        jobs.claim(&job.id, now).unwrap();
        let later = now + Duration::minutes(2);
        jobs.mark_retry(&job.id, later, "451 try again").unwrap();

        let loaded = jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Scheduled);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.send_at.timestamp(), later.timestamp());
        assert!(loaded.processing_started_at.is_none());
    }

    #[test]
    fn test_list_pagination_no_overlap() {
        let (_file, jobs, schedules) = stores();
        let schedule = seed_schedule(&schedules);
        let now = Utc::now();
        let batch: Vec<Job> = (0..7)
            .map(|i| Job::new(&schedule.id, format!("u{i}@x.com"), now).unwrap())
            .collect();
        jobs.insert_jobs(&batch).unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = jobs
                .list(
                    &schedule.id,
                    &QueueQuery {
                        limit: 3,
                        cursor: cursor.clone(),
                        ..Default::default()
                    },
                )
                .unwrap();
            for j in &page.jobs {
                assert!(!seen.contains(&j.id));
                seen.push(j.id.clone());
            }
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn test_list_status_and_search_filters() {
        let (_file, jobs, schedules) = stores();
        let schedule = seed_schedule(&schedules);
        let now = Utc::now();
        let alice = Job::new(&schedule.id, "alice@x.com", now).unwrap();
        let bob = Job::new(&schedule.id, "bob@y.com", now).unwrap();
        jobs.insert_jobs(&[alice.clone(), bob]).unwrap();
        jobs.claim(&alice.id, now).unwrap();

        let page = jobs
            .list(
                &schedule.id,
                &QueueQuery {
                    status: Some(JobStatus::Processing),
                    limit: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.jobs.len(), 1);

        let page = jobs
            .list(
                &schedule.id,
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
    fn test_dispatchable_filter() {
        let (_file, _jobs, schedules) = stores();
        let active = seed_schedule(&schedules);
        let mut paused = Schedule::new("c1", "Step 2", 2);
        paused.status = ScheduleStatus::Scheduled;
        paused.paused = true;
        schedules.create(&paused).unwrap();
        let draft = Schedule::new("c1", "Step 3", 3);
        schedules.create(&draft).unwrap();

        let dispatchable = schedules.list_dispatchable().unwrap();
        assert_eq!(dispatchable.len(), 1);
        assert_eq!(dispatchable[0].id, active.id);

        schedules.set_paused(&paused.id, false).unwrap();
        assert_eq!(schedules.list_dispatchable().unwrap().len(), 2);
    }
}
