use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// Number of years every projection covers.
pub const WINDOW_WIDTH: usize = 5;

/// Source of "today" for window and month-remaining computations.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Reads the local calendar date on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Always reports the same date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// The previous year through three years ahead of the reference date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearWindow {
    years: [i32; WINDOW_WIDTH],
}

impl YearWindow {
    /// Rebuilt on every call so that reports straddling new year shift the window.
    pub fn build(today: NaiveDate) -> Self {
        let current = today.year();
        Self {
            years: [current - 1, current, current + 1, current + 2, current + 3],
        }
    }

    pub fn years(&self) -> [i32; WINDOW_WIDTH] {
        self.years
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.years.iter().copied()
    }

    pub fn first(&self) -> i32 {
        self.years[0]
    }

    pub fn last(&self) -> i32 {
        self.years[WINDOW_WIDTH - 1]
    }

    pub fn current_year(&self) -> i32 {
        self.years[1]
    }

    pub fn contains(&self, year: i32) -> bool {
        (self.first()..=self.last()).contains(&year)
    }

    /// Years remaining after `year` until the end of the window.
    pub fn years_left(&self, year: i32) -> i32 {
        self.last() - year
    }
}
