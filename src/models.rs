// Core data structures for the cadence dispatch engine

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::ConfigError;

/// A daily local-time interval during which sends are allowed (or, as a
/// quiet-hours entry, forbidden). Half-open: `start` inclusive, `end`
/// exclusive. An interval with `end <= start` spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse from "HH:MM-HH:MM"
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| ConfigError::invalid_window(s, "expected HH:MM-HH:MM"))?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
            .map_err(|e| ConfigError::invalid_window(s, e.to_string()))?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
            .map_err(|e| ConfigError::invalid_window(s, e.to_string()))?;
        Ok(Self { start, end })
    }

    /// Whether the interval wraps past midnight
    pub fn spans_midnight(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Lifecycle state of a single send job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its `send_at` instant
    Scheduled,
    /// Claimed by a dispatcher worker, transport call in flight
    Processing,
    /// Terminal: accepted by the transport
    Sent,
    /// Terminal: attempts exhausted or permanent rejection
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Validated transition table. Transitions are monotonic along
    /// `scheduled -> processing -> {sent | scheduled(retry) | failed}`.
    pub fn can_transition(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Processing)
                | (Self::Processing, Self::Sent)
                | (Self::Processing, Self::Scheduled)
                | (Self::Processing, Self::Failed)
        )
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(ConfigError::invalid_status(other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control state of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Draft,
    Scheduled,
    Paused,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Scheduled => "SCHEDULED",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Cancelled, completed and draft schedules never dispatch
    pub fn allows_dispatch(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Paused)
    }
}

impl std::str::FromStr for ScheduleStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "SCHEDULED" => Ok(Self::Scheduled),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ConfigError::invalid_status(other)),
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-campaign-step send configuration and control state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub step_order: u32,

    /// Daily local-time ranges during which sends are allowed
    pub windows: Vec<TimeWindow>,
    /// Daily local-time ranges during which sends are forbidden; overrides windows
    pub quiet_hours: Vec<TimeWindow>,
    /// IANA timezone name the windows are expressed in
    pub timezone: String,

    /// Global cap, sends per minute
    pub throttle_per_minute: u32,
    /// Concurrency cap on in-flight transport calls
    pub max_concurrent: u32,
    /// Per-destination-domain sends-per-minute overrides
    pub per_domain: HashMap<String, u32>,

    pub paused: bool,
    pub status: ScheduleStatus,
    /// When set, a drained run re-arms `next_run_at` instead of completing
    pub repeat_interval_mins: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Create a draft schedule with the default rate configuration
    pub fn new(campaign_id: impl Into<String>, name: impl Into<String>, step_order: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            name: name.into(),
            step_order,
            windows: Vec::new(),
            quiet_hours: Vec::new(),
            timezone: "America/Vancouver".to_string(),
            throttle_per_minute: 60,
            max_concurrent: 50,
            per_domain: HashMap::new(),
            paused: false,
            status: ScheduleStatus::Draft,
            repeat_interval_mins: None,
            next_run_at: None,
            last_run_at: None,
        }
    }

    /// Parse the configured timezone
    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::invalid_timezone(&self.timezone))
    }

    /// Validate rate and timing configuration. Called on create and update.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.throttle_per_minute == 0 {
            return Err(ConfigError::invalid_rate(
                "throttle_per_minute",
                "must be at least 1",
            ));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid_rate(
                "max_concurrent",
                "must be at least 1",
            ));
        }
        for (domain, rate) in &self.per_domain {
            if *rate == 0 {
                return Err(ConfigError::invalid_rate(
                    format!("per_domain[{domain}]"),
                    "must be at least 1",
                ));
            }
        }
        self.tz()?;
        Ok(())
    }

    /// Per-domain sends-per-minute override, if configured
    pub fn domain_rate(&self, domain: &str) -> Option<u32> {
        self.per_domain.get(domain).copied()
    }
}

/// One queued outbound message: a (schedule, recipient) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub schedule_id: String,
    pub recipient: String,
    /// Derived from the recipient address at creation time
    pub recipient_domain: String,

    pub status: JobStatus,
    pub attempts: u32,
    /// Earliest instant the job is allowed to send
    pub send_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl Job {
    /// Create a scheduled job for one recipient. Fails when the recipient
    /// address has no parsable domain.
    pub fn new(
        schedule_id: impl Into<String>,
        recipient: impl Into<String>,
        send_at: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let recipient = recipient.into();
        let recipient_domain =
            extract_domain(&recipient).ok_or_else(|| ConfigError::invalid_recipient(&recipient))?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule_id.into(),
            recipient,
            recipient_domain,
            status: JobStatus::Scheduled,
            attempts: 0,
            send_at,
            processing_started_at: None,
            sent_at: None,
            provider_message_id: None,
            error: None,
        })
    }
}

/// Extract the destination domain from an email address: everything after
/// the last `@`, lowercased. Full host, not the registrable domain.
pub fn extract_domain(address: &str) -> Option<String> {
    let (local, domain) = address.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_parse() {
        let w = TimeWindow::parse("09:00-17:00").unwrap();
        assert_eq!(w.start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(w.end, NaiveTime::from_hms_opt(17, 0, 0).unwrap());
        assert!(!w.spans_midnight());

        let overnight = TimeWindow::parse("22:00-08:00").unwrap();
        assert!(overnight.spans_midnight());

        assert!(TimeWindow::parse("bogus").is_err());
        assert!(TimeWindow::parse("25:00-26:00").is_err());
    }

    #[test]
    fn test_job_status_transitions() {
        assert!(JobStatus::Scheduled.can_transition(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition(JobStatus::Sent));
        assert!(JobStatus::Processing.can_transition(JobStatus::Scheduled));
        assert!(JobStatus::Processing.can_transition(JobStatus::Failed));

        // No skipping, no leaving terminal states
        assert!(!JobStatus::Scheduled.can_transition(JobStatus::Sent));
        assert!(!JobStatus::Scheduled.can_transition(JobStatus::Failed));
        assert!(!JobStatus::Sent.can_transition(JobStatus::Scheduled));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Processing));
    }

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::Processing,
            JobStatus::Sent,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("SENDING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_schedule_status_allows_dispatch() {
        assert!(ScheduleStatus::Scheduled.allows_dispatch());
        assert!(ScheduleStatus::Paused.allows_dispatch());
        assert!(!ScheduleStatus::Cancelled.allows_dispatch());
        assert!(!ScheduleStatus::Completed.allows_dispatch());
        assert!(!ScheduleStatus::Draft.allows_dispatch());
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("alice@Example.COM"),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_domain("weird@quoted@mail.example.org"),
            Some("mail.example.org".to_string())
        );
        assert_eq!(extract_domain("no-at-sign"), None);
        assert_eq!(extract_domain("@example.com"), None);
        assert_eq!(extract_domain("alice@"), None);
    }

    #[test]
    fn test_schedule_validate() {
        let mut schedule = Schedule::new("campaign-1", "Step 1", 1);
        assert!(schedule.validate().is_ok());

        schedule.throttle_per_minute = 0;
        assert!(schedule.validate().is_err());
        schedule.throttle_per_minute = 60;

        schedule.timezone = "Mars/Olympus_Mons".to_string();
        assert!(schedule.validate().is_err());
        schedule.timezone = "America/Vancouver".to_string();

        schedule.per_domain.insert("gmail.com".to_string(), 0);
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_job_new_derives_domain() {
        let job = Job::new("sched-1", "bob@GMail.com", Utc::now()).unwrap();
        assert_eq!(job.recipient_domain, "gmail.com");
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 0);

        assert!(Job::new("sched-1", "not-an-address", Utc::now()).is_err());
    }
}
