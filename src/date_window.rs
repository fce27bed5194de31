use crate::error::{IngestError, Result};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, Utc};
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Inclusive calendar-day range of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(IngestError::InvalidInput(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .map_err(|_| IngestError::InvalidInput(format!("'{s}' is not a YYYY-MM-DD date")))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn num_days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    /// Consecutive, non-overlapping units of `span_days`; the last one is clipped
    /// to the window end.
    pub fn units(&self, span_days: u32) -> Vec<DateUnit> {
        let span = span_days.max(1) as u64;
        let mut units = vec![];
        let mut current = self.start;
        let mut index = 0;
        while current <= self.end {
            let last = current
                .checked_add_days(Days::new(span - 1))
                .map_or(self.end, |d| d.min(self.end));
            units.push(DateUnit {
                index,
                first_day: current,
                last_day: last,
            });
            index += 1;
            match last.checked_add_days(Days::new(1)) {
                Some(next) => current = next,
                None => break,
            }
        }
        units
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// One iteration step of a [`DateWindow`], covering `first_day..=last_day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateUnit {
    pub index: usize,
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,
}

impl DateUnit {
    pub fn start(&self) -> DateTime<Utc> {
        self.first_day.and_time(NaiveTime::MIN).and_utc()
    }

    /// Midnight after the last day.
    pub fn end_exclusive(&self) -> DateTime<Utc> {
        self.start() + TimeDelta::days((self.last_day - self.first_day).num_days() + 1)
    }

    /// Last millisecond of the last day.
    pub fn end_inclusive(&self) -> DateTime<Utc> {
        self.end_exclusive() - TimeDelta::milliseconds(1)
    }
}

impl fmt::Display for DateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first_day == self.last_day {
            write!(f, "{}", self.first_day.format(DATE_FORMAT))
        } else {
            write!(
                f,
                "{}..{}",
                self.first_day.format(DATE_FORMAT),
                self.last_day.format(DATE_FORMAT)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_units_are_inclusive() {
        let window = DateWindow::parse("2020-08-29", "2020-09-01").unwrap();
        let units = window.units(1);
        assert_eq!(units.len(), 4);
        assert_eq!(window.num_days(), 4);
        assert_eq!(units[0].to_string(), "2020-08-29");
        assert_eq!(units[3].to_string(), "2020-09-01");
        assert_eq!(
            units[0].end_inclusive().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "2020-08-29T23:59:59.999Z"
        );
        assert_eq!(
            units[0].end_exclusive().format(DATE_FORMAT).to_string(),
            "2020-08-30"
        );
    }

    #[test]
    fn test_multi_day_units_clip_to_window() {
        let window = DateWindow::parse("2024-01-01", "2024-01-05").unwrap();
        let units = window.units(2);
        assert_eq!(units.len(), 3);
        assert_eq!(units[2].first_day, units[2].last_day);
        assert_eq!(units[1].to_string(), "2024-01-03..2024-01-04");
        assert_eq!(units.iter().map(|u| u.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reversed_window_is_rejected() {
        assert!(DateWindow::parse("2024-02-01", "2024-01-01").is_err());
        assert!(DateWindow::parse("2024-13-01", "2024-12-01").is_err());
    }
}
