use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;

/// Where a date falls relative to the crawl window. The feed runs newest-first,
/// so `TooNew` means "keep scrolling" and `TooOld` means "we may be past it".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowPosition {
    TooNew,
    InWindow,
    TooOld,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("start date {start} is after end date {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
    #[error("stop threshold must be at least 1")]
    ZeroThreshold,
    #[error("invalid month range {0}")]
    BadMonth(String),
}

/// Caller-supplied bounds for one run. Both dates are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrawlWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_items: usize,
    pub stop_threshold: usize,
}

impl CrawlWindow {
    pub fn new(
        start_date: NaiveDate,
        end_date: NaiveDate,
        max_items: usize,
        stop_threshold: usize,
    ) -> Result<Self, WindowError> {
        if start_date > end_date {
            return Err(WindowError::Inverted {
                start: start_date,
                end: end_date,
            });
        }
        if stop_threshold == 0 {
            return Err(WindowError::ZeroThreshold);
        }
        Ok(Self {
            start_date,
            end_date,
            max_items,
            stop_threshold,
        })
    }

    pub fn position(&self, date: NaiveDate) -> WindowPosition {
        if date > self.end_date {
            WindowPosition::TooNew
        } else if date < self.start_date {
            WindowPosition::TooOld
        } else {
            WindowPosition::InWindow
        }
    }
}

/// Split `[first month of from, last day of to's month]` into calendar-month windows.
pub fn month_windows(from: NaiveDate, to: NaiveDate) -> Result<Vec<(NaiveDate, NaiveDate)>, WindowError> {
    let first_of = |d: NaiveDate| d.with_day0(0);
    let (Some(mut current), Some(last)) = (first_of(from), first_of(to)) else {
        return Err(WindowError::BadMonth(format!("{from}..{to}")));
    };
    if current > last {
        return Err(WindowError::Inverted { start: from, end: to });
    }

    let mut ranges = Vec::new();
    while current <= last {
        let next = current
            .checked_add_months(Months::new(1))
            .ok_or_else(|| WindowError::BadMonth(current.to_string()))?;
        let end = next
            .pred_opt()
            .ok_or_else(|| WindowError::BadMonth(current.to_string()))?;
        ranges.push((current, end));
        current = next;
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn bounds_are_inclusive() {
        let w = CrawlWindow::new(d(2025, 11, 1), d(2025, 11, 30), 10, 10).unwrap();
        assert_eq!(w.position(d(2025, 11, 1)), WindowPosition::InWindow);
        assert_eq!(w.position(d(2025, 11, 30)), WindowPosition::InWindow);
        assert_eq!(w.position(d(2025, 12, 1)), WindowPosition::TooNew);
        assert_eq!(w.position(d(2025, 10, 31)), WindowPosition::TooOld);
    }

    #[test]
    fn rejects_inverted_and_zero_threshold() {
        assert!(matches!(
            CrawlWindow::new(d(2025, 12, 1), d(2025, 11, 1), 10, 10),
            Err(WindowError::Inverted { .. })
        ));
        assert_eq!(
            CrawlWindow::new(d(2025, 11, 1), d(2025, 11, 2), 10, 0),
            Err(WindowError::ZeroThreshold)
        );
    }

    #[test]
    fn months_cover_leap_february() {
        let ranges = month_windows(d(2024, 1, 15), d(2024, 3, 2)).unwrap();
        assert_eq!(
            ranges,
            vec![
                (d(2024, 1, 1), d(2024, 1, 31)),
                (d(2024, 2, 1), d(2024, 2, 29)),
                (d(2024, 3, 1), d(2024, 3, 31)),
            ]
        );
    }

    #[test]
    fn months_across_year_end() {
        let ranges = month_windows(d(2024, 12, 1), d(2025, 1, 1)).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1], (d(2025, 1, 1), d(2025, 1, 31)));
    }
}
