//! Throttle Governor
//!
//! Per-schedule admission control: a global rate cap, per-domain rate caps,
//! and a concurrency semaphore. A job may go out only if it fits the global
//! cap, the domain cap (when an override is configured) and wins a semaphore
//! slot in a single all-or-nothing decision.
//!
//! Rates are enforced over a trailing 60-second window: the admissions
//! inside any such window never exceed the configured per-minute cap, so a
//! burst at the top of a minute cannot be topped up mid-minute. An attempt
//! counts against the cap whether or not the send succeeds, which damps
//! retry storms. Concurrency slots are released as soon as the transport
//! call resolves, independent of rate accounting.
//!
//! The governor is an explicit per-schedule object passed by handle, never
//! ambient global state. With dispatcher workers spread across processes the
//! limiter must stay the single source of truth per schedule; this crate
//! assumes one authoritative instance per schedule.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::models::Schedule;

/// Admission counter over a trailing 60-second window with capacity
/// `rate_per_minute`. Admission instants are kept until they age out, so the
/// count inside any trailing window never exceeds the cap. Eviction is lazy,
/// driven by the instants callers (and tests) pass in.
#[derive(Debug)]
pub struct RateWindow {
    capacity: usize,
    span: Duration,
    admissions: VecDeque<Instant>,
}

impl RateWindow {
    pub fn per_minute(rate_per_minute: u32) -> Self {
        Self {
            capacity: rate_per_minute.max(1) as usize,
            span: Duration::from_secs(60),
            admissions: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.admissions.front() {
            if now.saturating_duration_since(*oldest) >= self.span {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another admission fits the window, without recording it
    pub fn peek(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.admissions.len() < self.capacity
    }

    /// Record one admission. Callers must have observed room under the same
    /// lock.
    fn record(&mut self, now: Instant) {
        self.admissions.push_back(now);
    }

    /// Admissions left inside the current trailing window
    pub fn available(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.capacity - self.admissions.len()
    }
}

/// Why an admission request was denied. Not an error: the job simply stays
/// `scheduled` and is retried next tick with no penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// All `max_concurrent` slots are in flight
    Concurrency,
    /// The global cap for the trailing minute is spent
    GlobalRate,
    /// The per-domain cap for the trailing minute is spent
    DomainRate,
}

/// Outcome of a single admission decision
#[derive(Debug)]
pub enum Admission {
    /// Caps debited and a slot held; dropping the grant releases the slot
    Granted(AdmissionGrant),
    Denied(DenyReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// RAII guard for one in-flight send. Holds the concurrency slot; the slot
/// returns to the semaphore when the grant is dropped, i.e. when the
/// transport call resolves.
#[derive(Debug)]
pub struct AdmissionGrant {
    _permit: OwnedSemaphorePermit,
}

struct Rates {
    global: RateWindow,
    per_domain: HashMap<String, RateWindow>,
    domain_caps: HashMap<String, u32>,
}

/// Rate limiter and concurrency gate for one schedule
pub struct ThrottleGovernor {
    rates: Mutex<Rates>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ThrottleGovernor {
    pub fn new(
        throttle_per_minute: u32,
        max_concurrent: u32,
        domain_caps: HashMap<String, u32>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1) as usize;
        Self {
            rates: Mutex::new(Rates {
                global: RateWindow::per_minute(throttle_per_minute),
                per_domain: HashMap::new(),
                domain_caps,
            }),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn for_schedule(schedule: &Schedule) -> Self {
        Self::new(
            schedule.throttle_per_minute,
            schedule.max_concurrent,
            schedule.per_domain.clone(),
        )
    }

    /// Request admission for one send to `domain`.
    ///
    /// All-or-nothing: the semaphore slot is taken first (dropping it is a
    /// free rollback), then both windows are checked and debited under one
    /// lock. Partial acquisition never burns rate budget.
    pub fn try_admit(&self, domain: &str, now: Instant) -> Admission {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Admission::Denied(DenyReason::Concurrency),
            Err(TryAcquireError::Closed) => return Admission::Denied(DenyReason::Concurrency),
        };

        let mut rates = self.rates.lock().expect("throttle lock poisoned");

        if !rates.global.peek(now) {
            // permit drops here, rolling back the slot
            return Admission::Denied(DenyReason::GlobalRate);
        }

        let has_domain_cap = rates.domain_caps.contains_key(domain);
        if has_domain_cap {
            let cap = rates.domain_caps[domain];
            let window = rates
                .per_domain
                .entry(domain.to_string())
                .or_insert_with(|| RateWindow::per_minute(cap));
            if !window.peek(now) {
                return Admission::Denied(DenyReason::DomainRate);
            }
        }

        // Both observed to have room under the lock: record together
        rates.global.record(now);
        if has_domain_cap {
            if let Some(window) = rates.per_domain.get_mut(domain) {
                window.record(now);
            }
        }

        Admission::Granted(AdmissionGrant { _permit: permit })
    }

    /// In-flight sends currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Admissions left in the global window, for telemetry/debugging
    pub fn global_available(&self, now: Instant) -> usize {
        self.rates
            .lock()
            .expect("throttle lock poisoned")
            .global
            .available(now)
    }
}

/// Shared registry handing out one authoritative governor per schedule.
/// Rate-config changes rebuild the schedule's governor.
#[derive(Default)]
pub struct GovernorRegistry {
    governors: RwLock<HashMap<String, Arc<ThrottleGovernor>>>,
}

impl GovernorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the schedule's governor, creating it from the schedule's rate
    /// config on first use.
    pub fn get_or_create(&self, schedule: &Schedule) -> Arc<ThrottleGovernor> {
        if let Some(governor) = self
            .governors
            .read()
            .expect("governor registry poisoned")
            .get(&schedule.id)
        {
            return Arc::clone(governor);
        }

        let mut governors = self.governors.write().expect("governor registry poisoned");
        Arc::clone(
            governors
                .entry(schedule.id.clone())
                .or_insert_with(|| Arc::new(ThrottleGovernor::for_schedule(schedule))),
        )
    }

    /// Drop the schedule's governor so the next tick rebuilds it from fresh
    /// config. Called after rate-config updates.
    pub fn invalidate(&self, schedule_id: &str) {
        self.governors
            .write()
            .expect("governor registry poisoned")
            .remove(schedule_id);
    }
}
