//! Window Calculator
//!
//! Pure interval math over daily send windows and quiet hours, projected
//! into a schedule's timezone. The single entry point is [`next_eligible`]:
//! given `now`, the configured windows, the quiet hours and a timezone, it
//! returns the earliest instant at which a send is allowed, scanning forward
//! day by day up to a bounded horizon.
//!
//! Intervals are normalized to minutes-of-day. Overlapping windows are
//! merged before quiet hours are subtracted; a window spanning midnight is
//! split into two same-day segments.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::models::TimeWindow;

/// How many days ahead to scan before declaring a schedule stalled
pub const SCAN_HORIZON_DAYS: i64 = 14;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// A half-open minutes-of-day interval, `start < end`, both within 0..=1440
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteSpan {
    pub start: u32,
    pub end: u32,
}

impl MinuteSpan {
    fn contains(&self, minute: u32) -> bool {
        minute >= self.start && minute < self.end
    }
}

fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Expand windows to same-day minute spans, splitting midnight-spanning
/// entries into a late segment and an early segment.
fn to_spans(windows: &[TimeWindow]) -> Vec<MinuteSpan> {
    let mut spans = Vec::with_capacity(windows.len());
    for w in windows {
        let start = minute_of_day(w.start);
        let end = minute_of_day(w.end);
        if w.spans_midnight() {
            if start < MINUTES_PER_DAY {
                spans.push(MinuteSpan {
                    start,
                    end: MINUTES_PER_DAY,
                });
            }
            if end > 0 {
                spans.push(MinuteSpan { start: 0, end });
            }
        } else {
            spans.push(MinuteSpan { start, end });
        }
    }
    spans.retain(|s| s.end > s.start);
    spans
}

/// Merge overlapping or adjacent spans into a sorted disjoint list
pub fn merge_spans(mut spans: Vec<MinuteSpan>) -> Vec<MinuteSpan> {
    spans.sort_by_key(|s| (s.start, s.end));
    let mut merged: Vec<MinuteSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Subtract `blocked` from `allowed`. Both inputs must be sorted and
/// disjoint; the output is too.
pub fn subtract_spans(allowed: &[MinuteSpan], blocked: &[MinuteSpan]) -> Vec<MinuteSpan> {
    let mut result = Vec::with_capacity(allowed.len());
    for span in allowed {
        let mut cursor = span.start;
        for b in blocked {
            if b.end <= cursor || b.start >= span.end {
                continue;
            }
            if b.start > cursor {
                result.push(MinuteSpan {
                    start: cursor,
                    end: b.start,
                });
            }
            cursor = cursor.max(b.end);
            if cursor >= span.end {
                break;
            }
        }
        if cursor < span.end {
            result.push(MinuteSpan {
                start: cursor,
                end: span.end,
            });
        }
    }
    result
}

/// The effective per-day allowed spans: merged windows minus merged quiet hours
pub fn effective_spans(windows: &[TimeWindow], quiet_hours: &[TimeWindow]) -> Vec<MinuteSpan> {
    let allowed = merge_spans(to_spans(windows));
    let blocked = merge_spans(to_spans(quiet_hours));
    subtract_spans(&allowed, &blocked)
}

/// Whether a schedule has any eligible time at all. An empty result means
/// the schedule is stalled and must be flagged in telemetry, not spun on.
pub fn has_eligible_time(windows: &[TimeWindow], quiet_hours: &[TimeWindow]) -> bool {
    !effective_spans(windows, quiet_hours).is_empty()
}

/// Whether `now` falls inside quiet hours in the given timezone. Used by the
/// manual batch trigger, which bypasses windows but still honors quiet hours.
pub fn in_quiet_hours(now: DateTime<Utc>, quiet_hours: &[TimeWindow], tz: Tz) -> bool {
    let local = now.with_timezone(&tz);
    let minute = local.hour() * 60 + local.minute();
    merge_spans(to_spans(quiet_hours))
        .iter()
        .any(|s| s.contains(minute))
}

/// Resolve a local date + minute-of-day to a UTC instant. DST-ambiguous
/// local times take the earliest mapping; nonexistent local times (the
/// spring-forward gap) roll forward minute by minute.
fn resolve_local(date: NaiveDate, minute: u32, limit: u32, tz: Tz) -> Option<DateTime<Utc>> {
    let mut m = minute;
    while m < limit {
        let time = NaiveTime::from_hms_opt(m / 60, m % 60, 0)?;
        if let Some(local) = tz.from_local_datetime(&date.and_time(time)).earliest() {
            return Some(local.with_timezone(&Utc));
        }
        m += 1;
    }
    None
}

/// Compute the next instant at which a send is allowed.
///
/// Returns `now` when it already lies inside an allowed, non-quiet interval;
/// otherwise the earliest start of such an interval within the scan horizon.
/// `None` means no eligible time exists (empty windows, or quiet hours fully
/// cover every window) and the caller must treat the schedule as stalled.
pub fn next_eligible(
    now: DateTime<Utc>,
    windows: &[TimeWindow],
    quiet_hours: &[TimeWindow],
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let spans = effective_spans(windows, quiet_hours);
    if spans.is_empty() {
        return None;
    }

    let local_now = now.with_timezone(&tz);
    let now_minute = local_now.hour() * 60 + local_now.minute();

    // Today: eligible immediately, or the next span start later today
    if spans.iter().any(|s| s.contains(now_minute)) {
        return Some(now);
    }
    let today = local_now.date_naive();
    for span in &spans {
        if span.start > now_minute {
            if let Some(instant) = resolve_local(today, span.start, span.end, tz) {
                return Some(instant);
            }
        }
    }

    // Scan forward day by day
    for offset in 1..=SCAN_HORIZON_DAYS {
        let date = today + Duration::days(offset);
        for span in &spans {
            if let Some(instant) = resolve_local(date, span.start, span.end, tz) {
                return Some(instant);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;
    use proptest::prelude::*;

    fn w(s: &str) -> TimeWindow {
        TimeWindow::parse(s).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    const TZ: Tz = chrono_tz::UTC;

    #[test]
    fn test_eligible_immediately_inside_window() {
        let now = utc("2024-06-10T10:30:00Z");
        let next = next_eligible(now, &[w("09:00-17:00")], &[], TZ).unwrap();
        assert_eq!(next, now);
    }

    #[test]
    fn test_after_hours_rolls_to_next_morning() {
        // windows 09:00-17:00, quiet 22:00-08:00, now 18:30 -> next day 09:00
        let now = utc("2024-06-10T18:30:00Z");
        let next = next_eligible(now, &[w("09:00-17:00")], &[w("22:00-08:00")], TZ).unwrap();
        assert_eq!(next, utc("2024-06-11T09:00:00Z"));
    }

    #[test]
    fn test_before_window_same_day() {
        let now = utc("2024-06-10T06:15:00Z");
        let next = next_eligible(now, &[w("09:30-11:45"), w("13:15-16:30")], &[], TZ).unwrap();
        assert_eq!(next, utc("2024-06-10T09:30:00Z"));
    }

    #[test]
    fn test_quiet_hours_trim_window_start() {
        // quiet hours overlap the morning half of the window
        let now = utc("2024-06-10T08:00:00Z");
        let next = next_eligible(now, &[w("09:00-17:00")], &[w("08:00-12:00")], TZ).unwrap();
        assert_eq!(next, utc("2024-06-10T12:00:00Z"));
    }

    #[test]
    fn test_quiet_hours_fully_cover_window() {
        // the day's slot is removed entirely
        let next = next_eligible(
            utc("2024-06-10T08:00:00Z"),
            &[w("09:00-17:00")],
            &[w("00:00-00:00")], // spans midnight: full 24h block
            TZ,
        );
        assert!(next.is_none());
    }

    #[test]
    fn test_empty_windows_is_stalled() {
        assert_eq!(next_eligible(utc("2024-06-10T08:00:00Z"), &[], &[], TZ), None);
        assert!(!has_eligible_time(&[], &[]));
        assert!(has_eligible_time(&[w("09:00-17:00")], &[]));
    }

    #[test]
    fn test_midnight_spanning_window_splits() {
        let spans = effective_spans(&[w("22:00-02:00")], &[]);
        assert_eq!(
            spans,
            vec![
                MinuteSpan { start: 0, end: 120 },
                MinuteSpan {
                    start: 1320,
                    end: 1440
                }
            ]
        );

        // 23:10 is inside the late segment
        let now = utc("2024-06-10T23:10:00Z");
        assert_eq!(next_eligible(now, &[w("22:00-02:00")], &[], TZ), Some(now));
    }

    #[test]
    fn test_overlapping_windows_merge() {
        let spans = effective_spans(&[w("09:00-12:00"), w("11:00-15:00")], &[]);
        assert_eq!(
            spans,
            vec![MinuteSpan {
                start: 540,
                end: 900
            }]
        );
    }

    #[test]
    fn test_timezone_projection() {
        // 18:30 Vancouver local = 01:30 UTC next day (PDT, UTC-7)
        let tz: Tz = "America/Vancouver".parse().unwrap();
        let now = utc("2024-06-11T01:30:00Z");
        let next = next_eligible(now, &[w("09:00-17:00")], &[], tz).unwrap();
        // next day 09:00 PDT = 16:00 UTC
        assert_eq!(next, utc("2024-06-11T16:00:00Z"));
    }

    #[test]
    fn test_in_quiet_hours() {
        assert!(in_quiet_hours(
            utc("2024-06-10T23:30:00Z"),
            &[w("22:00-08:00")],
            TZ
        ));
        assert!(!in_quiet_hours(
            utc("2024-06-10T12:00:00Z"),
            &[w("22:00-08:00")],
            TZ
        ));
    }

    proptest! {
        #[test]
        fn prop_effective_spans_sorted_disjoint_bounded(
            windows in prop::collection::vec((0u32..1440, 0u32..1440), 0..6),
            quiet in prop::collection::vec((0u32..1440, 0u32..1440), 0..6),
        ) {
            let mk = |pairs: &[(u32, u32)]| -> Vec<TimeWindow> {
                pairs
                    .iter()
                    .map(|(a, b)| TimeWindow::new(
                        NaiveTime::from_hms_opt(a / 60, a % 60, 0).unwrap(),
                        NaiveTime::from_hms_opt(b / 60, b % 60, 0).unwrap(),
                    ))
                    .collect()
            };

            let spans = effective_spans(&mk(&windows), &mk(&quiet));

            for s in &spans {
                prop_assert!(s.start < s.end);
                prop_assert!(s.end <= 1440);
            }
            for pair in spans.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }
        }

        #[test]
        fn prop_quiet_minutes_never_eligible(
            qs in 0u32..1379,
        ) {
            // a one-hour quiet block starting at qs removes exactly those minutes
            let qe = qs + 60;
            let quiet = vec![TimeWindow::new(
                NaiveTime::from_hms_opt(qs / 60, qs % 60, 0).unwrap(),
                NaiveTime::from_hms_opt(qe / 60, qe % 60, 0).unwrap(),
            )];
            let all_day = vec![TimeWindow::parse("00:00-23:59").unwrap()];
            let spans = effective_spans(&all_day, &quiet);
            for s in &spans {
                prop_assert!(s.end <= qs || s.start >= qe);
            }
        }
    }
}
