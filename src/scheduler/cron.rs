use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{CronError, Result};

/// A parsed cron expression.
///
/// Accepts 5-field Unix expressions (`minute hour dom month dow`) and the
/// 6-field form with a trailing year. Day-of-week uses Unix numbering there:
/// 0-6 from Sunday, with 7 also meaning Sunday. 7-field expressions
/// (`second minute hour dom month dow year`) are handed to the `cron` crate
/// unchanged and use its numbering (1-7 from Sunday).
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: Schedule,
}

/// Widen a Unix expression to `second minute hour dom month dow year`.
fn to_cron_crate_format(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            format!("0 {minute} {hour} {dom} {month} {} *", unix_dow_field(dow))
        }
        [minute, hour, dom, month, dow, year] => {
            format!("0 {minute} {hour} {dom} {month} {} {year}", unix_dow_field(dow))
        }
        _ => expression.trim().to_string(),
    }
}

/// Renumber a Unix day-of-week field (Sunday = 0 or 7) for the `cron` crate
/// (Sunday = 1). Names and other non-numeric items pass through.
fn unix_dow_field(field: &str) -> String {
    field.split(',').map(unix_dow_item).collect::<Vec<_>>().join(",")
}

fn unix_dow_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();
    let day = |v: u32| if v == 0 || v == 7 { 1 } else { v + 1 };

    if let Some((lo, hi)) = base.split_once('-') {
        return match (lo.parse::<u32>(), hi.parse::<u32>()) {
            // Sunday closes the range: Mon..Sat stay contiguous, Sunday wraps to 1
            (Ok(lo @ 1..=6), Ok(7)) => {
                let every = step.and_then(|s| s.parse::<u32>().ok()).unwrap_or(1);
                let mut out = format!("{}-7{suffix}", lo + 1);
                if every > 0 && (7 - lo) % every == 0 {
                    out.push_str(",1");
                }
                out
            }
            (Ok(0), Ok(7)) => format!("1-7{suffix}"),
            (Ok(lo), Ok(hi)) => format!("{}-{}{suffix}", day(lo), day(hi)),
            _ => item.to_string(),
        };
    }

    match base.parse::<u32>() {
        Ok(v) => format!("{}{suffix}", day(v)),
        Err(_) => item.to_string(),
    }
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(&to_cron_crate_format(expression)).map_err(|e| {
            CronError::InvalidCron {
                expr: expression.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            source: expression.to_string(),
            schedule,
        })
    }

    /// First trigger strictly after `after`, if the expression has one.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&after).take(count).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expression_is_widened() {
        assert_eq!(to_cron_crate_format("* * * * *"), "0 * * * * * *");
        assert_eq!(to_cron_crate_format("*/5 * * * * 2030"), "0 */5 * * * * 2030");
        assert_eq!(to_cron_crate_format("*/10 * * * * * *"), "*/10 * * * * * *");
    }

    #[test]
    fn unix_day_of_week_is_renumbered() {
        assert_eq!(unix_dow_field("0"), "1");
        assert_eq!(unix_dow_field("7"), "1");
        assert_eq!(unix_dow_field("1-5"), "2-6");
        assert_eq!(unix_dow_field("0-6"), "1-7");
        assert_eq!(unix_dow_field("5-7"), "6-7,1");
        assert_eq!(unix_dow_field("1,3,5"), "2,4,6");
        assert_eq!(unix_dow_field("*/2"), "*/2");
        assert_eq!(unix_dow_field("1/2"), "2/2");
        assert_eq!(unix_dow_field("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn weekdays_skip_the_weekend() {
        let expr = CronExpr::parse("0 9 * * 1-5").unwrap();
        // Friday
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let days: Vec<_> = expr
            .upcoming(now, 5)
            .iter()
            .map(|t| t.format("%a %d %H:%M").to_string())
            .collect();
        assert_eq!(
            days,
            ["Mon 04 09:00", "Tue 05 09:00", "Wed 06 09:00", "Thu 07 09:00", "Fri 08 09:00"]
        );
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap();
        assert_eq!(CronExpr::parse("0 0 * * 0").unwrap().next_after(now), Some(sunday));
        assert_eq!(CronExpr::parse("0 0 * * 7").unwrap().next_after(now), Some(sunday));
    }

    #[test]
    fn six_fields_end_with_a_year() {
        let expr = CronExpr::parse("*/5 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            expr.upcoming(now, 2),
            [
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn every_minute_fires_on_next_minute_boundary() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap();
        let next = expr.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn seconds_field_is_honored() {
        let expr = CronExpr::parse("*/10 * * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).unwrap();
        let upcoming = expr.upcoming(now, 3);
        assert_eq!(upcoming.len(), 3);
        assert_eq!(upcoming[0], Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 10).unwrap());
        assert_eq!(upcoming[2], Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let err = CronExpr::parse("not a cron").unwrap_err();
        assert!(matches!(err, CronError::InvalidCron { .. }));
    }

    #[test]
    fn empty_expression_is_rejected() {
        assert!(CronExpr::parse("").is_err());
    }
}
