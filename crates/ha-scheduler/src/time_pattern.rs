//! Cron-like hour/minute/second patterns
//!
//! Each field is one of:
//! - `*` (or omitted): any value
//! - a number: `5` matches exactly 5
//! - a list: `0,15,30` matches any listed value
//! - a divisor: `/5` matches 0, 5, 10, 15, etc.
//!
//! Patterns are validated when they are built, so a malformed field fails at
//! registration rather than at the first tick.

use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Upper bound on candidates examined while skipping DST gaps and repeats
const MAX_CANDIDATES: usize = 10_000;

/// Which unit a pattern field constrains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Hour,
    Minute,
    Second,
}

impl TimeField {
    pub fn name(self) -> &'static str {
        match self {
            TimeField::Hour => "hour",
            TimeField::Minute => "minute",
            TimeField::Second => "second",
        }
    }

    pub fn max(self) -> u32 {
        match self {
            TimeField::Hour => 23,
            TimeField::Minute | TimeField::Second => 59,
        }
    }
}

/// Matching rule for one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatch {
    Any,
    Exact(u32),
    List(Vec<u32>),
    /// Every n units, aligned to 0
    Step(u32),
}

impl FieldMatch {
    /// Parse a field expression (`*`, `5`, `1,2,3`, `/5`)
    pub fn parse(field: TimeField, raw: &str) -> SchedulerResult<Self> {
        let raw = raw.trim();
        let invalid = |reason: &str| SchedulerError::InvalidTimePattern {
            field: field.name(),
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() || raw == "*" {
            return Ok(FieldMatch::Any);
        }

        let rule = if let Some(divisor) = raw.strip_prefix('/') {
            let step = divisor
                .trim()
                .parse::<u32>()
                .map_err(|_| invalid("divisor is not a number"))?;
            FieldMatch::Step(step)
        } else if raw.contains(',') {
            let values = raw
                .split(',')
                .map(|part| part.trim().parse::<u32>())
                .collect::<Result<Vec<u32>, _>>()
                .map_err(|_| invalid("list contains a non-numeric value"))?;
            FieldMatch::List(values)
        } else {
            FieldMatch::Exact(raw.parse::<u32>().map_err(|_| invalid("not a number"))?)
        };

        rule.validate(field)?;
        Ok(rule)
    }

    fn validate(&self, field: TimeField) -> SchedulerResult<()> {
        let invalid = |value: String, reason: &str| SchedulerError::InvalidTimePattern {
            field: field.name(),
            value,
            reason: reason.to_string(),
        };
        match self {
            FieldMatch::Any => Ok(()),
            FieldMatch::Step(0) => Err(invalid("/0".to_string(), "divisor cannot be 0")),
            FieldMatch::Step(_) => Ok(()),
            FieldMatch::Exact(value) if *value > field.max() => {
                Err(invalid(value.to_string(), "out of range"))
            }
            FieldMatch::Exact(_) => Ok(()),
            FieldMatch::List(values) if values.is_empty() => {
                Err(invalid(String::new(), "list is empty"))
            }
            FieldMatch::List(values) => match values.iter().find(|v| **v > field.max()) {
                Some(value) => Err(invalid(value.to_string(), "out of range")),
                None => Ok(()),
            },
        }
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            FieldMatch::Any => true,
            FieldMatch::Exact(expected) => *expected == value,
            FieldMatch::List(values) => values.contains(&value),
            FieldMatch::Step(step) => value % step == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    rule: FieldMatch,
    /// Sorted, deduplicated values the rule accepts
    allowed: Vec<u32>,
}

impl Field {
    fn new(field: TimeField, rule: FieldMatch) -> SchedulerResult<Self> {
        rule.validate(field)?;
        let allowed = (0..=field.max()).filter(|v| rule.matches(*v)).collect();
        Ok(Self { rule, allowed })
    }

    fn first(&self) -> Option<u32> {
        self.allowed.first().copied()
    }

    fn next_from(&self, value: u32) -> Option<u32> {
        self.allowed.iter().copied().find(|v| *v >= value)
    }
}

/// An hour/minute/second pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimePattern {
    hour: Field,
    minute: Field,
    second: Field,
}

impl TimePattern {
    pub fn new(hour: FieldMatch, minute: FieldMatch, second: FieldMatch) -> SchedulerResult<Self> {
        Ok(Self {
            hour: Field::new(TimeField::Hour, hour)?,
            minute: Field::new(TimeField::Minute, minute)?,
            second: Field::new(TimeField::Second, second)?,
        })
    }

    /// Build a pattern from string expressions; omitted fields match anything
    pub fn parse(
        hour: Option<&str>,
        minute: Option<&str>,
        second: Option<&str>,
    ) -> SchedulerResult<Self> {
        let field = |kind: TimeField, raw: Option<&str>| match raw {
            Some(raw) => FieldMatch::parse(kind, raw),
            None => Ok(FieldMatch::Any),
        };
        Self::new(
            field(TimeField::Hour, hour)?,
            field(TimeField::Minute, minute)?,
            field(TimeField::Second, second)?,
        )
    }

    /// A pattern matching every second
    pub fn every_second() -> Self {
        let any = |field: TimeField| Field {
            rule: FieldMatch::Any,
            allowed: (0..=field.max()).collect(),
        };
        Self {
            hour: any(TimeField::Hour),
            minute: any(TimeField::Minute),
            second: any(TimeField::Second),
        }
    }

    pub fn hour(&self) -> &FieldMatch {
        &self.hour.rule
    }

    pub fn minute(&self) -> &FieldMatch {
        &self.minute.rule
    }

    pub fn second(&self) -> &FieldMatch {
        &self.second.rule
    }

    /// Whether a wall-clock time satisfies every field
    pub fn matches<T: Timelike>(&self, time: &T) -> bool {
        self.hour.rule.matches(time.hour())
            && self.minute.rule.matches(time.minute())
            && self.second.rule.matches(time.second())
    }

    /// The earliest wall-clock time at or after `start` (whole seconds) that
    /// satisfies the pattern
    pub fn next_naive(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut start = start.with_nanosecond(0)?;
        loop {
            let day: NaiveDate = start.date();
            let (h0, m0, s0) = (start.hour(), start.minute(), start.second());

            let Some(hour) = self.hour.next_from(h0) else {
                start = day.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            };
            if hour > h0 {
                return day.and_hms_opt(hour, self.minute.first()?, self.second.first()?);
            }

            let Some(minute) = self.minute.next_from(m0) else {
                start = day.and_hms_opt(h0, 0, 0)? + Duration::hours(1);
                continue;
            };
            if minute > m0 {
                return day.and_hms_opt(hour, minute, self.second.first()?);
            }

            let Some(second) = self.second.next_from(s0) else {
                start = day.and_hms_opt(h0, m0, 0)? + Duration::minutes(1);
                continue;
            };
            return day.and_hms_opt(hour, minute, second);
        }
    }

    /// The earliest instant at or after `start` whose wall-clock time in `tz`
    /// satisfies the pattern
    ///
    /// Wall-clock times that fall in a DST gap do not exist and are skipped.
    /// A wall-clock time repeated by a fall-back transition fires at its
    /// earlier instant; the later repeat is only used when the earlier one is
    /// already behind `start` and was not `last_match`.
    pub fn next_fire<Tz: TimeZone>(
        &self,
        tz: &Tz,
        start: DateTime<Utc>,
        last_match: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let start = ceil_to_second(start);
        let local_start = start.with_timezone(tz).naive_local();

        // Inside a repeated hour the later occurrences of earlier wall-clock
        // times are still ahead, so the search starts one fold earlier.
        let mut naive_start = match tz.from_local_datetime(&local_start) {
            LocalResult::Ambiguous(earliest, latest) => {
                local_start - (latest.with_timezone(&Utc) - earliest.with_timezone(&Utc))
            }
            _ => local_start,
        };

        for _ in 0..MAX_CANDIDATES {
            let candidate = self.next_naive(naive_start)?;
            match tz.from_local_datetime(&candidate) {
                LocalResult::Single(instant) => {
                    let instant = instant.with_timezone(&Utc);
                    if instant >= start {
                        return Some(instant);
                    }
                }
                LocalResult::Ambiguous(earliest, latest) => {
                    let earliest = earliest.with_timezone(&Utc);
                    let latest = latest.with_timezone(&Utc);
                    if earliest >= start {
                        return Some(earliest);
                    }
                    if latest >= start && last_match != Some(earliest) {
                        return Some(latest);
                    }
                }
                LocalResult::None => {
                    debug!(%candidate, "Skipping time pattern match inside DST gap");
                }
            }
            naive_start = candidate + Duration::seconds(1);
        }
        None
    }
}

impl Default for TimePattern {
    fn default() -> Self {
        Self::every_second()
    }
}

/// Round up to the next whole second
pub fn ceil_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = time.nanosecond();
    if nanos == 0 {
        time
    } else {
        time - Duration::nanoseconds(i64::from(nanos)) + Duration::seconds(1)
    }
}

/// Truncate to the whole second
pub(crate) fn floor_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    time - Duration::nanoseconds(i64::from(time.nanosecond()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Vienna;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_fields() {
        assert_eq!(FieldMatch::parse(TimeField::Minute, "*").unwrap(), FieldMatch::Any);
        assert_eq!(FieldMatch::parse(TimeField::Minute, "5").unwrap(), FieldMatch::Exact(5));
        assert_eq!(
            FieldMatch::parse(TimeField::Second, "0, 30").unwrap(),
            FieldMatch::List(vec![0, 30])
        );
        assert_eq!(FieldMatch::parse(TimeField::Hour, "/2").unwrap(), FieldMatch::Step(2));
    }

    #[test]
    fn test_parse_rejects_malformed_fields() {
        for (field, raw) in [
            (TimeField::Hour, "/two"),
            (TimeField::Hour, "/0"),
            (TimeField::Hour, "24"),
            (TimeField::Minute, "60"),
            (TimeField::Second, "1,x"),
            (TimeField::Second, "abc"),
        ] {
            assert!(
                matches!(
                    FieldMatch::parse(field, raw),
                    Err(SchedulerError::InvalidTimePattern { .. })
                ),
                "{} should be rejected",
                raw
            );
        }
        assert!(TimePattern::parse(Some("/two"), None, None).is_err());
    }

    #[test]
    fn test_step_matches_aligned_to_zero() {
        let pattern = TimePattern::parse(Some("/2"), Some("0"), Some("0")).unwrap();
        assert!(pattern.matches(&chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap()));
        assert!(!pattern.matches(&chrono::NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(pattern.matches(&chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap()));
    }

    #[test]
    fn test_next_fire_carries_across_midnight() {
        let pattern = TimePattern::parse(Some("/2"), Some("0"), Some("0")).unwrap();

        let next = pattern.next_fire(&Utc, utc(2024, 5, 24, 22, 0, 1), None);
        assert_eq!(next, Some(utc(2024, 5, 25, 0, 0, 0)));

        let next = pattern.next_fire(&Utc, utc(2024, 5, 24, 21, 59, 55), None);
        assert_eq!(next, Some(utc(2024, 5, 24, 22, 0, 0)));
    }

    #[test]
    fn test_next_fire_rounds_up_fractional_start() {
        let pattern = TimePattern::every_second();
        let start = utc(2024, 5, 24, 12, 0, 0) + Duration::milliseconds(999);
        assert_eq!(
            pattern.next_fire(&Utc, start, None),
            Some(utc(2024, 5, 24, 12, 0, 1))
        );
    }

    #[test]
    fn test_next_fire_minute_list() {
        let pattern = TimePattern::parse(None, Some("15,45"), Some("0")).unwrap();
        assert_eq!(
            pattern.next_fire(&Utc, utc(2024, 1, 1, 23, 50, 0), None),
            Some(utc(2024, 1, 2, 0, 15, 0))
        );
    }

    #[test]
    fn test_spring_forward_gap_is_skipped() {
        // Vienna jumps from 02:00 CET to 03:00 CEST on 2018-03-25
        let pattern = TimePattern::parse(Some("2"), Some("30"), Some("0")).unwrap();
        let next = pattern.next_fire(&Vienna, utc(2018, 3, 25, 0, 0, 0), None);

        // 02:30 CEST on the 26th
        assert_eq!(next, Some(utc(2018, 3, 26, 0, 30, 0)));
    }

    #[test]
    fn test_fall_back_overlap_fires_first_instant_once() {
        // Vienna repeats 02:00-03:00 on 2018-10-28 (CEST then CET)
        let pattern = TimePattern::parse(Some("2"), Some("30"), Some("0")).unwrap();

        let first = pattern.next_fire(&Vienna, utc(2018, 10, 28, 0, 0, 0), None);
        assert_eq!(first, Some(utc(2018, 10, 28, 0, 30, 0)));

        let after_first = pattern.next_fire(&Vienna, utc(2018, 10, 28, 0, 30, 1), first);
        assert_eq!(after_first, Some(utc(2018, 10, 29, 1, 30, 0)));
    }

    #[test]
    fn test_fall_back_overlap_uses_repeat_when_registered_inside() {
        let pattern = TimePattern::parse(Some("2"), Some("30"), Some("0")).unwrap();

        // Registered at 02:40 CEST, after the first 02:30 already passed
        let next = pattern.next_fire(&Vienna, utc(2018, 10, 28, 0, 40, 0), None);
        assert_eq!(next, Some(utc(2018, 10, 28, 1, 30, 0)));
    }
}
