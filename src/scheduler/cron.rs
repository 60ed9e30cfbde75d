//! Five-field cron expressions: minute hour day-of-month month day-of-week.

use chrono::{
    DateTime, Datelike as _, Days, Duration, LocalResult, NaiveDate, TimeZone,
    Timelike as _, Utc,
};

use crate::error::{AppError, Result};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// How many years ahead `next_after` searches before giving up.
const SEARCH_YEARS: i32 = 8;

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn bounds(self) -> (u32, u32) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            // 7 is accepted as Sunday and folded to 0.
            Self::DayOfWeek => (0, 7),
        }
    }

    fn names(self) -> &'static [&'static str] {
        match self {
            Self::Month => &MONTH_NAMES,
            Self::DayOfWeek => &WEEKDAY_NAMES,
            _ => &[],
        }
    }

    fn first_name_value(self) -> u32 {
        match self {
            Self::Month => 1,
            _ => 0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day of month",
            Self::Month => "month",
            Self::DayOfWeek => "day of week",
        }
    }
}

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// False when the field started with `*`.
    restricted: bool,
}

impl Field {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    fn parse(source: &str, kind: FieldKind, expression: &str) -> Result<Self> {
        let invalid =
            |detail: String| AppError::schedule(expression, format!("{}: {}", kind.label(), detail));
        let (min, max) = kind.bounds();
        let mut bits = 0u64;

        for item in source.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| invalid(format!("bad step {step:?}")))?;
                    if step == 0 {
                        return Err(invalid("step must be positive".to_string()));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (parse_value(a, kind, &invalid)?, parse_value(b, kind, &invalid)?)
            } else {
                let value = parse_value(range, kind, &invalid)?;
                // `5/15` means every 15 starting at 5.
                (value, if step.is_some() { max } else { value })
            };
            if start > end {
                return Err(invalid(format!("range {range:?} is reversed")));
            }

            let step = step.unwrap_or(1);
            let mut value = start;
            while value <= end {
                bits |= 1 << value;
                value += step;
            }
        }

        if matches!(kind, FieldKind::DayOfWeek) && bits & (1 << 7) != 0 {
            bits = (bits & !(1 << 7)) | 1;
        }
        Ok(Self {
            bits,
            restricted: !source.starts_with('*'),
        })
    }
}

fn parse_value(
    raw: &str,
    kind: FieldKind,
    invalid: &impl Fn(String) -> AppError,
) -> Result<u32> {
    let (min, max) = kind.bounds();
    let upper = raw.to_ascii_uppercase();
    let value = match kind.names().iter().position(|name| *name == upper) {
        Some(index) => index as u32 + kind.first_name_value(),
        None => raw
            .parse()
            .map_err(|_| invalid(format!("bad value {raw:?}")))?,
    };
    if !(min..=max).contains(&value) {
        return Err(invalid(format!("{value} is outside {min}-{max}")));
    }
    Ok(value)
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expanded = match expression.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(AppError::schedule(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        };
        Ok(Self {
            minute: Field::parse(minute, FieldKind::Minute, expression)?,
            hour: Field::parse(hour, FieldKind::Hour, expression)?,
            day_of_month: Field::parse(dom, FieldKind::DayOfMonth, expression)?,
            month: Field::parse(month, FieldKind::Month, expression)?,
            day_of_week: Field::parse(dow, FieldKind::DayOfWeek, expression)?,
        })
    }

    /// Whether the day matches. Restricting both day fields means either may match.
    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`, in the host's local time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after_in(after, &chrono::Local)
    }

    /// First matching minute strictly after `after`, evaluated in `tz`.
    ///
    /// Minutes skipped by a DST jump never match; a repeated hour matches once.
    pub fn next_after_in<Tz: TimeZone>(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(tz).naive_local();
        let mut at = local
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            .checked_add_signed(Duration::minutes(1))?;
        let last_year = local.year() + SEARCH_YEARS;

        while at.year() <= last_year {
            if !self.month.contains(at.month()) {
                let (year, month) = if at.month() == 12 {
                    (at.year() + 1, 1)
                } else {
                    (at.year(), at.month() + 1)
                };
                at = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.matches_day(at.date()) {
                at = at.date().checked_add_days(Days::new(1))?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(at.hour()) {
                at = at.with_minute(0)?.checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !self.minute.contains(at.minute()) {
                at = at.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            match tz.from_local_datetime(&at) {
                LocalResult::Single(found) => return Some(found.with_timezone(&Utc)),
                LocalResult::Ambiguous(earliest, _) => {
                    let found = earliest.with_timezone(&Utc);
                    if found > after {
                        return Some(found);
                    }
                }
                LocalResult::None => {}
            }
            at = at.checked_add_signed(Duration::minutes(1))?;
        }
        None
    }
}
