//! Schedule parsing and next-fire computation
//!
//! Accepts classic cron expressions (5-field with optional seconds
//! column, 6/7-field), descriptor aliases like `@hourly`, and the
//! `@every <duration>` form.

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use provisr_core::{Error, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<CronSchedule>),
    Every(Duration),
}

impl Schedule {
    /// Parse a schedule expression; a bad expression is an immediate error
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(Error::InvalidSchedule {
                expr: expr.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = humantime::parse_duration(rest.trim()).map_err(|e| {
                Error::InvalidSchedule {
                    expr: expr.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if interval.is_zero() {
                return Err(Error::InvalidSchedule {
                    expr: expr.to_string(),
                    reason: "interval must be positive".to_string(),
                });
            }
            return Ok(Schedule::Every(interval));
        }

        // Descriptors (@hourly, @daily, ...) pass through; a bare
        // 5-field expression gets a seconds column prepended.
        let normalized = if expr.starts_with('@') || expr.split_whitespace().count() != 5 {
            expr.to_string()
        } else {
            format!("0 {}", expr)
        };

        let parsed = CronSchedule::from_str(&normalized).map_err(|e| Error::InvalidSchedule {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Schedule::Cron(Box::new(parsed)))
    }

    /// Next fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&after).next(),
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_five_field() {
        let schedule = Schedule::parse("*/5 * * * *").unwrap();
        assert!(matches!(schedule, Schedule::Cron(_)));
    }

    #[test]
    fn test_parse_six_field_with_seconds() {
        let schedule = Schedule::parse("*/10 * * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::seconds(10));
    }

    #[test]
    fn test_parse_descriptor() {
        assert!(Schedule::parse("@hourly").is_ok());
        assert!(Schedule::parse("@daily").is_ok());
    }

    #[test]
    fn test_parse_every() {
        let schedule = Schedule::parse("@every 50ms").unwrap();
        match schedule {
            Schedule::Every(d) => assert_eq!(d, Duration::from_millis(50)),
            _ => panic!("expected Every"),
        }
    }

    #[test]
    fn test_parse_every_compound() {
        let schedule = Schedule::parse("@every 1h30m").unwrap();
        match schedule {
            Schedule::Every(d) => assert_eq!(d, Duration::from_secs(5400)),
            _ => panic!("expected Every"),
        }
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Schedule::parse("not a schedule").is_err());
        assert!(Schedule::parse("").is_err());
        assert!(Schedule::parse("@every").is_err());
        assert!(Schedule::parse("@every 0s").is_err());
        assert!(Schedule::parse("@every quickly").is_err());
    }

    #[test]
    fn test_invalid_error_names_expression() {
        let err = Schedule::parse("61 * * * *").unwrap_err();
        assert!(err.to_string().contains("61 * * * *"));
    }

    #[test]
    fn test_next_after_every() {
        let schedule = Schedule::parse("@every 5s").unwrap();
        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next - now, chrono::Duration::seconds(5));
    }

    #[test]
    fn test_next_after_five_field_normalization() {
        // Five-field expressions fire on second zero
        let schedule = Schedule::parse("* * * * *").unwrap();
        let next = schedule.next_after(Utc::now()).unwrap();
        assert_eq!(next.timestamp() % 60, 0);
    }
}
