//! Five field cron expressions evaluated in UTC.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field accepts `*`, single
//! values, ranges (`1-5`), steps (`*/15`, `10-50/10`, `5/20`) and comma separated lists of those.
//! Months and weekdays also accept three letter names, Sunday is both `0` and `7`. The macros
//! `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight` and `@hourly` are
//! expanded to their five field form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};
use thiserror::Error;

/// Number of years searched for a firing time before an expression is considered to never fire.
const MAX_SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown macro `{0}`")]
    UnknownMacro(String),

    #[error("invalid value `{value}` in {field} field")]
    InvalidValue { field: &'static str, value: String },

    #[error("value {value} out of range {min}-{max} in {field} field")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid range `{value}` in {field} field")]
    InvalidRange { field: &'static str, value: String },

    #[error("invalid step `{value}` in {field} field")]
    InvalidStep { field: &'static str, value: String },
}

/// One field of a cron expression, stored as a bit set of the allowed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronField {
    bits: u64,
    /// `false` when the field was written as `*`, which matters for the day fields.
    restricted: bool,
}

impl CronField {
    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Offset added to the index of a name to obtain its value.
    names_offset: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_offset: 0,
};

const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_offset: 0,
};

const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_offset: 0,
};

const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_offset: 1,
};

// 7 is accepted as Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_offset: 0,
};

impl FieldSpec {
    fn parse(&self, source: &str) -> Result<CronField, CronParseError> {
        let mut bits = 0u64;
        let mut restricted = true;

        for part in source.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step = step
                        .parse::<u32>()
                        .ok()
                        .filter(|step| *step > 0)
                        .ok_or_else(|| CronParseError::InvalidStep {
                            field: self.name,
                            value: part.to_owned(),
                        })?;
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" {
                if step.is_none() && source == "*" {
                    restricted = false;
                }
                (self.min, self.max)
            } else if let Some((start, end)) = range.split_once('-') {
                let start = self.value(start)?;
                let end = self.value(end)?;
                if start > end {
                    return Err(CronParseError::InvalidRange {
                        field: self.name,
                        value: part.to_owned(),
                    });
                }
                (start, end)
            } else {
                let start = self.value(range)?;
                // `5/20` means every 20 starting at 5.
                let end = if step.is_some() { self.max } else { start };
                (start, end)
            };

            let step = step.unwrap_or(1) as usize;
            for value in (start..=end).step_by(step) {
                bits |= 1 << value;
            }
        }

        Ok(CronField { bits, restricted })
    }

    fn value(&self, source: &str) -> Result<u32, CronParseError> {
        let lowered = source.to_ascii_lowercase();
        let value = match self.names.iter().position(|name| *name == lowered) {
            Some(index) => index as u32 + self.names_offset,
            None => source
                .parse::<u32>()
                .map_err(|_| CronParseError::InvalidValue {
                    field: self.name,
                    value: source.to_owned(),
                })?,
        };

        if value < self.min || value > self.max {
            return Err(CronParseError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }

        Ok(value)
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
}

impl CronExpr {
    pub fn parse(source: &str) -> Result<Self, CronParseError> {
        let trimmed = source.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(trimmed)?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minutes, hours, days_of_month, months, days_of_week] = fields[..] else {
            return Err(CronParseError::FieldCount(fields.len()));
        };

        let mut days_of_week = DAY_OF_WEEK.parse(days_of_week)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_owned(),
            minutes: MINUTE.parse(minutes)?,
            hours: HOUR.parse(hours)?,
            days_of_month: DAY_OF_MONTH.parse(days_of_month)?,
            months: MONTH.parse(months)?,
            days_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns the first firing time strictly after `after`.
    ///
    /// Returns `None` if the expression never fires, for example `0 0 30 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .naive_utc()
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(TimeDelta::minutes(1))?;
        let limit_year = start.year().checked_add(MAX_SEARCH_YEARS)?;

        let mut candidate = start;
        while candidate.year() <= limit_year {
            if !self.months.contains(candidate.month()) {
                candidate = first_of_next_month(candidate.date())?;
                continue;
            }

            if !self.matches_day(candidate.date()) {
                candidate = candidate
                    .date()
                    .checked_add_days(Days::new(1))?
                    .and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hours.contains(candidate.hour()) {
                candidate = candidate
                    .date()
                    .and_hms_opt(candidate.hour(), 0, 0)?
                    .checked_add_signed(TimeDelta::hours(1))?;
                continue;
            }

            if !self.minutes.contains(candidate.minute()) {
                candidate = candidate.checked_add_signed(TimeDelta::minutes(1))?;
                continue;
            }

            return Some(candidate.and_utc());
        }

        None
    }

    /// When both day fields are restricted a day matches if either one does.
    fn matches_day(&self, date: NaiveDate) -> bool {
        let day_of_month = self.days_of_month.contains(date.day());
        let day_of_week = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        match (
            self.days_of_month.is_restricted(),
            self.days_of_week.is_restricted(),
        ) {
            (true, true) => day_of_month || day_of_week,
            (true, false) => day_of_month,
            (false, true) => day_of_week,
            (false, false) => true,
        }
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn expand_macro(source: &str) -> Result<&'static str, CronParseError> {
    match source.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronParseError::UnknownMacro(source.to_owned())),
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year().checked_add(1)?, 1)
    } else {
        (date.year(), date.month() + 1)
    };

    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn every_minute_fires_on_the_next_minute() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 45).unwrap();

        assert_eq!(cron.next_after(after), Some(at(2024, 3, 10, 12, 31)));
    }

    #[test]
    fn step_expression_fires_on_multiples() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();

        assert_eq!(
            cron.next_after(at(2024, 3, 10, 12, 31)),
            Some(at(2024, 3, 10, 12, 35))
        );
        assert_eq!(
            cron.next_after(at(2024, 3, 10, 23, 55)),
            Some(at(2024, 3, 11, 0, 0))
        );
    }

    #[test]
    fn ranges_lists_and_names() {
        let cron = CronExpr::parse("30 9-17/4 * jan,jul mon-fri").unwrap();

        // 2024-01-06 is a Saturday, the next weekday is Monday the 8th.
        assert_eq!(
            cron.next_after(at(2024, 1, 6, 0, 0)),
            Some(at(2024, 1, 8, 9, 30))
        );
        assert_eq!(
            cron.next_after(at(2024, 1, 8, 9, 30)),
            Some(at(2024, 1, 8, 13, 30))
        );
        // After January the next allowed month is July.
        assert_eq!(
            cron.next_after(at(2024, 1, 31, 18, 0)),
            Some(at(2024, 7, 1, 9, 30))
        );
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // The 1st of the month or any Sunday.
        let cron = CronExpr::parse("0 0 1 * 7").unwrap();

        // 2024-06-02 is a Sunday.
        assert_eq!(
            cron.next_after(at(2024, 6, 1, 0, 0)),
            Some(at(2024, 6, 2, 0, 0))
        );
    }

    #[test]
    fn macros_expand() {
        let cron = CronExpr::parse("@hourly").unwrap();
        assert_eq!(cron.as_str(), "@hourly");
        assert_eq!(
            cron.next_after(at(2024, 1, 1, 10, 15)),
            Some(at(2024, 1, 1, 11, 0))
        );

        assert_eq!(
            CronExpr::parse("@often").unwrap_err(),
            CronParseError::UnknownMacro("@often".to_owned())
        );
    }

    #[test]
    fn impossible_date_never_fires() {
        let cron = CronExpr::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn leap_day_is_found() {
        let cron = CronExpr::parse("0 12 29 2 *").unwrap();
        assert_eq!(
            cron.next_after(at(2025, 1, 1, 0, 0)),
            Some(at(2028, 2, 29, 12, 0))
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert_eq!(
            CronExpr::parse("* * * *").unwrap_err(),
            CronParseError::FieldCount(4)
        );
        assert!(matches!(
            CronExpr::parse("60 * * * *").unwrap_err(),
            CronParseError::OutOfRange { value: 60, .. }
        ));
        assert!(matches!(
            CronExpr::parse("*/0 * * * *").unwrap_err(),
            CronParseError::InvalidStep { .. }
        ));
        assert!(matches!(
            CronExpr::parse("5-1 * * * *").unwrap_err(),
            CronParseError::InvalidRange { .. }
        ));
        assert!(matches!(
            CronExpr::parse("a * * * *").unwrap_err(),
            CronParseError::InvalidValue { .. }
        ));
    }
}
