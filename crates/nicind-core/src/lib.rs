//! Core record schema, calendar periods and lookup tables shared by every source.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "nicind-core";

/// Institution used for country-level aggregates published by the central bank.
pub const NATIONAL_INSTITUTION: &str = "NICARAGUA";

/// Sources publishing "millions of dollars" are scaled to base units by this factor.
pub const MILLIONS: f64 = 1_000_000.0;

pub const MIN_YEAR: i32 = 1;
pub const MAX_YEAR: i32 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid month {0}: expected 1-12")]
    Month(u32),
    #[error("invalid year {0}: expected {MIN_YEAR}-{MAX_YEAR}")]
    Year(i32),
    #[error("invalid period `{0}`: expected yyyymm")]
    Period(String),
    #[error("invalid scope `{0}`: expected `todos`, `ultimo` or yyyymm")]
    Scope(String),
    #[error("invalid origin `{0}`: expected BCN, SIBOIF or CONAMI")]
    Origin(String),
}

/// Institution/source system a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Origin {
    /// Banco Central de Nicaragua.
    #[serde(rename = "BCN")]
    Bcn,
    /// Superintendencia de Bancos y de Otras Instituciones Financieras.
    #[serde(rename = "SIBOIF")]
    Siboif,
    /// Comisión Nacional de Microfinanzas.
    #[serde(rename = "CONAMI")]
    Conami,
}

impl Origin {
    /// Processing order used when every source is selected.
    pub const ALL: [Origin; 3] = [Origin::Bcn, Origin::Siboif, Origin::Conami];

    pub fn code(&self) -> &'static str {
        match self {
            Origin::Bcn => "BCN",
            Origin::Siboif => "SIBOIF",
            Origin::Conami => "CONAMI",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Origin {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Origin::ALL
            .into_iter()
            .find(|o| o.code().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ParseError::Origin(s.to_string()))
    }
}

/// A (year, month) pair. Ordering is lexicographic on (year, month).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, ParseError> {
        if !(1..=12).contains(&month) {
            return Err(ParseError::Month(month));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(ParseError::Year(year));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
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

    pub fn previous(&self) -> Option<Self> {
        if self.month == 1 {
            Self::new(self.year - 1, 12).ok()
        } else {
            Self::new(self.year, self.month - 1).ok()
        }
    }

    pub fn next(&self) -> Option<Self> {
        if self.month == 12 {
            Self::new(self.year + 1, 1).ok()
        } else {
            Self::new(self.year, self.month + 1).ok()
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("period year and month are range checked")
    }

    /// Last calendar day of the month, leap years included.
    pub fn last_day(&self) -> NaiveDate {
        let first = self.first_day();
        match self.next() {
            Some(next) => next.first_day() - Days::new(1),
            None => first + Days::new(30),
        }
    }

    /// Months 1..=12 of `year`, in calendar order.
    pub fn months_of(year: i32) -> impl Iterator<Item = Period> {
        (1..=12).filter_map(move |month| Period::new(year, month).ok())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ParseError;

    /// Parses a `yyyymm` literal, e.g. `202403`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Period(s.to_string()));
        }
        let year: i32 = s[..4].parse().map_err(|_| ParseError::Period(s.to_string()))?;
        let month: u32 = s[4..].parse().map_err(|_| ParseError::Period(s.to_string()))?;
        Period::new(year, month)
    }
}

/// Walks backward one calendar month at a time, starting with the month before `today`
/// and never yielding a period older than `min_year`.
#[derive(Debug, Clone)]
pub struct BackwardMonths {
    next: Option<Period>,
    min_year: i32,
}

impl BackwardMonths {
    pub fn starting_before(today: NaiveDate, min_year: i32) -> Self {
        Self {
            next: Period::from_date(today).previous(),
            min_year,
        }
    }
}

impl Iterator for BackwardMonths {
    type Item = Period;

    fn next(&mut self) -> Option<Period> {
        let current = self.next.filter(|p| p.year >= self.min_year)?;
        self.next = current.previous();
        Some(current)
    }
}

/// What a run should collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scope {
    AllPeriods,
    #[default]
    LastPeriod,
    Period(Period),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::AllPeriods => f.write_str("todos"),
            Scope::LastPeriod => f.write_str("ultimo"),
            Scope::Period(p) => write!(f, "{p}"),
        }
    }
}

impl FromStr for Scope {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "todos" => Ok(Scope::AllPeriods),
            "ultimo" => Ok(Scope::LastPeriod),
            other => other
                .parse::<Period>()
                .map(Scope::Period)
                .map_err(|_| ParseError::Scope(s.to_string())),
        }
    }
}

/// The common six-field output row every source adapter produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub origin: Origin,
    pub institution: String,
    pub indicator: String,
    pub year: i32,
    pub month: u32,
    pub value: f64,
}

impl IndicatorRecord {
    pub fn new(
        origin: Origin,
        institution: impl Into<String>,
        indicator: impl Into<String>,
        period: Period,
        value: f64,
    ) -> Self {
        Self {
            origin,
            institution: institution.into(),
            indicator: indicator.into(),
            year: period.year,
            month: period.month,
            value,
        }
    }

    /// Country-level record (institution `NICARAGUA`).
    pub fn national(origin: Origin, indicator: impl Into<String>, period: Period, value: f64) -> Self {
        Self::new(origin, NATIONAL_INSTITUTION, indicator, period, value)
    }

    pub fn period(&self) -> Period {
        Period {
            year: self.year,
            month: self.month,
        }
    }
}

pub const MONTH_NAMES: [(&str, u32); 12] = [
    ("Enero", 1),
    ("Febrero", 2),
    ("Marzo", 3),
    ("Abril", 4),
    ("Mayo", 5),
    ("Junio", 6),
    ("Julio", 7),
    ("Agosto", 8),
    ("Septiembre", 9),
    ("Octubre", 10),
    ("Noviembre", 11),
    ("Diciembre", 12),
];

pub const MONTH_ABBREVIATIONS: [(&str, u32); 12] = [
    ("Ene", 1),
    ("Feb", 2),
    ("Mar", 3),
    ("Abr", 4),
    ("May", 5),
    ("Jun", 6),
    ("Jul", 7),
    ("Ago", 8),
    ("Sep", 9),
    ("Oct", 10),
    ("Nov", 11),
    ("Dic", 12),
];

/// Quarter numeral to the quarter's closing month.
pub const QUARTER_END_MONTHS: [(&str, u32); 4] = [("I", 3), ("II", 6), ("III", 9), ("IV", 12)];

fn lookup(table: &[(&str, u32)], label: &str) -> Option<u32> {
    let label = label.trim();
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(label))
        .map(|(_, month)| *month)
}

pub fn month_from_name(label: &str) -> Option<u32> {
    lookup(&MONTH_NAMES, label)
}

pub fn month_from_abbreviation(label: &str) -> Option<u32> {
    lookup(&MONTH_ABBREVIATIONS, label)
}

pub fn quarter_end_month(label: &str) -> Option<u32> {
    lookup(&QUARTER_END_MONTHS, label)
}

/// Keeps, independently per indicator, the rows of that indicator's most recent period:
/// the maximum year first, then the maximum month within that year. Input order is preserved.
pub fn latest_per_indicator(records: &[IndicatorRecord]) -> Vec<IndicatorRecord> {
    let mut max_year: HashMap<&str, i32> = HashMap::new();
    for record in records {
        max_year
            .entry(record.indicator.as_str())
            .and_modify(|y| *y = (*y).max(record.year))
            .or_insert(record.year);
    }

    let mut max_month: HashMap<&str, u32> = HashMap::new();
    for record in records {
        if max_year.get(record.indicator.as_str()) != Some(&record.year) {
            continue;
        }
        max_month
            .entry(record.indicator.as_str())
            .and_modify(|m| *m = (*m).max(record.month))
            .or_insert(record.month);
    }

    records
        .iter()
        .filter(|r| {
            max_year.get(r.indicator.as_str()) == Some(&r.year)
                && max_month.get(r.indicator.as_str()) == Some(&r.month)
        })
        .cloned()
        .collect()
}
