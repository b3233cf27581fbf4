use chrono::{DateTime, Utc, Weekday};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Invalid calendar field: {0}")]
    InvalidField(String),
}

#[derive(Serialize, Deserialize)]
struct CronSpec {
    expression: String,
    timezone: String,
}

/// A parsed cron expression bound to a timezone.
///
/// Accepts the six/seven field form with seconds. Classic five-field expressions are
/// normalized by firing at second zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CronSpec", into = "CronSpec")]
pub struct CronSchedule {
    expression: String,
    timezone: Tz,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn new(expression: &str) -> Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    pub fn with_timezone(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let normalized = normalize(expression);
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;

        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        Ok(CronSchedule {
            expression: normalized,
            timezone: tz,
            schedule,
        })
    }

    /// Fires at `minute` past every hour.
    pub fn hourly(minute: u32) -> Result<Self, CronError> {
        check_range("minute", minute, 59)?;
        Self::new(&format!("0 {} * * * *", minute))
    }

    /// Fires every day at `hour:minute`.
    pub fn daily(hour: u32, minute: u32) -> Result<Self, CronError> {
        check_range("hour", hour, 23)?;
        check_range("minute", minute, 59)?;
        Self::new(&format!("0 {} {} * * *", minute, hour))
    }

    /// Fires every `day` at `hour:minute`.
    pub fn weekly(day: Weekday, hour: u32, minute: u32) -> Result<Self, CronError> {
        check_range("hour", hour, 23)?;
        check_range("minute", minute, 59)?;
        Self::new(&format!("0 {} {} * * {}", minute, hour, day))
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }

    /// Next fire time strictly after `after`, evaluated in the schedule's timezone.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_tz = after.with_timezone(&self.timezone);
        let next_tz = self.schedule.after(&after_tz).next()?;
        Some(next_tz.with_timezone(&Utc))
    }

    pub fn next_execution_from_now(&self) -> Option<DateTime<Utc>> {
        self.next_execution(Utc::now())
    }

    pub fn validate(expression: &str) -> Result<(), CronError> {
        Schedule::from_str(&normalize(expression))
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;
        Ok(())
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Two schedules are equal when expression and timezone are.
impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

impl TryFrom<CronSpec> for CronSchedule {
    type Error = CronError;

    fn try_from(spec: CronSpec) -> Result<Self, Self::Error> {
        Self::with_timezone(&spec.expression, &spec.timezone)
    }
}

impl From<CronSchedule> for CronSpec {
    fn from(schedule: CronSchedule) -> Self {
        CronSpec {
            expression: schedule.expression,
            timezone: schedule.timezone.name().to_string(),
        }
    }
}

fn normalize(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

fn check_range(field: &str, value: u32, max: u32) -> Result<(), CronError> {
    if value > max {
        return Err(CronError::InvalidField(format!(
            "{} must be within 0..={}, got {}",
            field, max, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_cron_schedule_creation() {
        let schedule = CronSchedule::new("0 0 9 * * Mon-Fri").unwrap();
        assert_eq!(schedule.expression(), "0 0 9 * * Mon-Fri");
        assert_eq!(schedule.timezone(), "UTC");
    }

    #[test]
    fn test_five_field_expression_is_normalized() {
        let schedule = CronSchedule::new("*/5 * * * *").unwrap();
        assert_eq!(schedule.expression(), "0 */5 * * * *");
    }

    #[test]
    fn test_invalid_input() {
        assert!(CronSchedule::new("invalid cron").is_err());
        assert!(CronSchedule::with_timezone("0 0 9 * * *", "Invalid/Timezone").is_err());
        assert!(CronSchedule::hourly(60).is_err());
        assert!(CronSchedule::daily(24, 0).is_err());
    }

    #[test]
    fn test_next_execution() {
        let schedule = CronSchedule::daily(9, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 8, 0, 0).unwrap();
        let next = schedule.next_execution(now).unwrap();

        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.day(), 1);
    }

    #[test]
    fn test_next_execution_with_timezone() {
        let schedule = CronSchedule::with_timezone("0 0 9 * * *", "America/New_York").unwrap();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap();
        let next = schedule.next_execution(now).unwrap();
        // 9 AM EST is 14:00 UTC
        assert_eq!(next.hour(), 14);
    }

    #[test]
    fn test_weekly() {
        let schedule = CronSchedule::weekly(Weekday::Wed, 10, 30).unwrap();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next_execution(now).unwrap();
        assert_eq!(next.weekday(), Weekday::Wed);
        assert_eq!((next.hour(), next.minute()), (10, 30));
    }

    #[test]
    fn test_serialization() {
        let schedule = CronSchedule::with_timezone("0 0 9 * * *", "Europe/Berlin").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        let deserialized: CronSchedule = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.expression(), schedule.expression());
        assert_eq!(deserialized.timezone(), "Europe/Berlin");

        let bad = r#"{"expression":"nope","timezone":"UTC"}"#;
        assert!(serde_json::from_str::<CronSchedule>(bad).is_err());
    }
}
