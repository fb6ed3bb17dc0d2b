//! Reload window planning and fiscal period tags.
//!
//! The source labels a month either as `MM.YYYY` or as `YYYY-MM`, and has used
//! both historically. A [`FiscalPeriod`] is the canonical month; every match
//! against source or sink data goes through its full set of renderings.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodParseError {
    #[error("period tag `{0}` is not in MM.YYYY or YYYY-MM form")]
    Malformed(String),
    #[error("period tag `{tag}` has month {month} outside 1..=12")]
    MonthOutOfRange { tag: String, month: u32 },
}

/// A calendar month as the source's fiscal period dimension sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FiscalPeriod {
    year: i32,
    month: u32,
}

impl FiscalPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn first_instant(&self) -> NaiveDateTime {
        self.first_day().and_time(NaiveTime::MIN)
    }

    /// `MM.YYYY`, the form used in query filters.
    pub fn dotted(&self) -> String {
        format!("{:02}.{:04}", self.month, self.year)
    }

    /// `YYYY-MM`.
    pub fn dashed(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Every textual form the source is known to emit for this period.
    pub fn renderings(&self) -> [String; 2] {
        [self.dotted(), self.dashed()]
    }
}

impl fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

impl FromStr for FiscalPeriod {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        let malformed = || PeriodParseError::Malformed(tag.to_string());

        let (month, year) = if let Some((month, year)) = tag.split_once('.') {
            (month, year)
        } else if let Some((year, month)) = tag.split_once('-') {
            (month, year)
        } else {
            return Err(malformed());
        };

        let is_digits = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
        if year.len() != 4 || !is_digits(year) || month.len() > 2 || !is_digits(month) {
            return Err(malformed());
        }

        let year: i32 = year.parse().map_err(|_| malformed())?;
        let month: u32 = month.parse().map_err(|_| malformed())?;
        FiscalPeriod::new(year, month).ok_or(PeriodParseError::MonthOutOfRange {
            tag: tag.to_string(),
            month,
        })
    }
}

/// The scope a run is allowed to both fetch and overwrite. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Window {
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
    fiscal_upper_bound: Option<FiscalPeriod>,
    periods: Vec<FiscalPeriod>,
    period_tags: BTreeSet<String>,
}

impl Window {
    pub fn new(
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
        fiscal_upper_bound: Option<FiscalPeriod>,
        periods: Vec<FiscalPeriod>,
    ) -> Self {
        let period_tags = periods.iter().flat_map(FiscalPeriod::renderings).collect();
        Self {
            start,
            end,
            fiscal_upper_bound,
            periods,
            period_tags,
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// `None` means unbounded.
    pub fn end(&self) -> Option<NaiveDateTime> {
        self.end
    }

    /// Upper bound for filters that cannot express an open-ended date range.
    pub fn fiscal_upper_bound(&self) -> Option<FiscalPeriod> {
        self.fiscal_upper_bound
    }

    pub fn periods(&self) -> &[FiscalPeriod] {
        &self.periods
    }

    pub fn period_tags(&self) -> &BTreeSet<String> {
        &self.period_tags
    }

    /// False means "extract but never delete or filter".
    pub fn has_period_tags(&self) -> bool {
        !self.period_tags.is_empty()
    }

    pub fn matches_tag(&self, tag: &str) -> bool {
        self.period_tags.contains(tag.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowMode {
    /// Previous month plus the current month, anchored on the run date.
    Automatic,
    Manual {
        start: NaiveDateTime,
        periods: Vec<FiscalPeriod>,
    },
}

impl WindowMode {
    /// Parse every configured tag; any malformed tag rejects the whole list.
    pub fn manual_from_tags<S: AsRef<str>>(
        start: NaiveDateTime,
        tags: &[S],
    ) -> Result<Self, PeriodParseError> {
        let mut periods = Vec::with_capacity(tags.len());
        for tag in tags {
            let period: FiscalPeriod = tag.as_ref().parse()?;
            if !periods.contains(&period) {
                periods.push(period);
            }
        }
        Ok(WindowMode::Manual { start, periods })
    }
}

#[derive(Debug, Clone)]
pub struct WindowPlanner {
    mode: WindowMode,
}

impl WindowPlanner {
    pub fn new(mode: WindowMode) -> Self {
        Self { mode }
    }

    pub fn plan(&self, today: NaiveDate) -> Window {
        match &self.mode {
            WindowMode::Automatic => {
                let anchor = FiscalPeriod::containing(today);
                let previous = anchor.previous();
                Window::new(
                    previous.first_instant(),
                    None,
                    Some(anchor),
                    vec![previous, anchor],
                )
            }
            WindowMode::Manual { start, periods } => Window::new(*start, None, None, periods.clone()),
        }
    }
}
