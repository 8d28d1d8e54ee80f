// Cron schedule parsing and matching
// Five-field expressions (minute hour day-of-month month day-of-week) with
// *, lists, ranges, and step values. Matching is at minute granularity, UTC.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fmt;

/// Error produced for an invalid cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronError {
    pub message: String,
}

impl fmt::Display for CronError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cron expression: {}", self.message)
    }
}

impl std::error::Error for CronError {}

/// A parsed five-field cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

/// One field, stored as the set of admitted values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    /// None means `*` (any value).
    values: Option<Vec<u8>>,
}

impl Field {
    fn any() -> Self {
        Self { values: None }
    }

    fn admits(&self, value: u8) -> bool {
        match &self.values {
            None => true,
            Some(vs) => vs.contains(&value),
        }
    }

    fn is_any(&self) -> bool {
        self.values.is_none()
    }
}

impl CronSchedule {
    pub fn parse(source: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = source.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError {
                message: format!("expected 5 fields, found {}", fields.len()),
            });
        }

        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Whether the schedule fires on the minute containing `tick`.
    ///
    /// Day-of-month and day-of-week are OR-ed when both are restricted,
    /// per the classic cron rule.
    pub fn matches(&self, tick: DateTime<Utc>) -> bool {
        if !self.minute.admits(tick.minute() as u8) {
            return false;
        }
        if !self.hour.admits(tick.hour() as u8) {
            return false;
        }
        if !self.month.admits(tick.month() as u8) {
            return false;
        }

        let dom = self.day_of_month.admits(tick.day() as u8);
        let dow = self
            .day_of_week
            .admits(tick.weekday().num_days_from_sunday() as u8);

        match (self.day_of_month.is_any(), self.day_of_week.is_any()) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }
}

fn parse_field(source: &str, min: u8, max: u8) -> Result<Field, CronError> {
    if source == "*" {
        return Ok(Field::any());
    }

    let mut values = Vec::new();
    for part in source.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u8 = s.parse().map_err(|_| CronError {
                    message: format!("bad step '{s}'"),
                })?;
                if step == 0 {
                    return Err(CronError {
                        message: "step of zero".to_string(),
                    });
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let v = parse_value(range, min, max)?;
            // A bare value with a step ranges to the field maximum.
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo > hi {
            return Err(CronError {
                message: format!("inverted range '{range}'"),
            });
        }

        let mut v = lo;
        while v <= hi {
            values.push(v);
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }

    values.sort_unstable();
    values.dedup();
    Ok(Field {
        values: Some(values),
    })
}

fn parse_value(source: &str, min: u8, max: u8) -> Result<u8, CronError> {
    let v: u8 = source.parse().map_err(|_| CronError {
        message: format!("bad value '{source}'"),
    })?;
    if v < min || v > max {
        return Err(CronError {
            message: format!("value {v} out of range {min}-{max}"),
        });
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_minute() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        assert!(s.matches(at(2026, 3, 14, 9, 26)));
    }

    #[test]
    fn test_fixed_time() {
        let s = CronSchedule::parse("0 4 * * *").unwrap();
        assert!(s.matches(at(2026, 1, 10, 4, 0)));
        assert!(!s.matches(at(2026, 1, 10, 4, 1)));
        assert!(!s.matches(at(2026, 1, 10, 5, 0)));
    }

    #[test]
    fn test_step_values() {
        let s = CronSchedule::parse("*/15 * * * *").unwrap();
        assert!(s.matches(at(2026, 1, 1, 0, 0)));
        assert!(s.matches(at(2026, 1, 1, 0, 45)));
        assert!(!s.matches(at(2026, 1, 1, 0, 20)));
    }

    #[test]
    fn test_ranges_and_lists() {
        let s = CronSchedule::parse("30 12 * * 1-5").unwrap();
        // 2026-01-05 is a Monday.
        assert!(s.matches(at(2026, 1, 5, 12, 30)));
        // 2026-01-04 is a Sunday.
        assert!(!s.matches(at(2026, 1, 4, 12, 30)));

        let s = CronSchedule::parse("0 0 1,15 * *").unwrap();
        assert!(s.matches(at(2026, 2, 15, 0, 0)));
        assert!(!s.matches(at(2026, 2, 14, 0, 0)));
    }

    #[test]
    fn test_dom_dow_union() {
        // Both restricted: fires on the 13th OR on Fridays.
        let s = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2026-02-13 is a Friday; both sides hold.
        assert!(s.matches(at(2026, 2, 13, 0, 0)));
        // 2026-03-13 is a Friday.
        assert!(s.matches(at(2026, 3, 13, 0, 0)));
        // 2026-02-20 is a Friday but not the 13th: still fires.
        assert!(s.matches(at(2026, 2, 20, 0, 0)));
        // 2026-02-14 is a Saturday and not the 13th.
        assert!(!s.matches(at(2026, 2, 14, 0, 0)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
    }
}
