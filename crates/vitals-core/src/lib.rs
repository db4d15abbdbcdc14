//! Core domain model for vitals: raw source rows, null-safe field coercion,
//! typed period summaries, validation and the shared error taxonomy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vitals-core";

/// Number of days folded into a recent-days projection.
pub const RECENT_WINDOW: usize = 7;

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]{2}):([0-5][0-9]):([0-5][0-9])$").expect("duration pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VitalsError {
    #[error("invalid identifier `{value}`: only letters, digits and underscores are allowed")]
    InvalidIdentifier { value: String },
    #[error("source unavailable while {context}: {detail}")]
    SourceUnavailable { context: String, detail: String },
    #[error("row has no usable period key in column `{column}`: {detail}")]
    MissingPeriodKey { column: String, detail: String },
    #[error("insufficient history: {required} daily summaries required, {available} available")]
    InsufficientHistory { required: usize, available: usize },
    #[error("validation failed for {subject}: {}", .violations.join("; "))]
    Validation {
        subject: String,
        violations: Vec<String>,
    },
    #[error("document store unavailable while {context}: {detail}")]
    StoreUnavailable { context: String, detail: String },
    #[error("no {what} found for {key}")]
    NotFound { what: String, key: String },
}

impl VitalsError {
    pub fn source_unavailable(context: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::SourceUnavailable {
            context: context.into(),
            detail: detail.to_string(),
        }
    }

    pub fn store_unavailable(context: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::StoreUnavailable {
            context: context.into(),
            detail: detail.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>, key: impl fmt::Display) -> Self {
        Self::NotFound {
            what: what.into(),
            key: key.to_string(),
        }
    }

    /// Stable snake_case tag reported to callers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::MissingPeriodKey { .. } => "missing_period_key",
            Self::InsufficientHistory { .. } => "insufficient_history",
            Self::Validation { .. } => "validation_error",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::NotFound { .. } => "not_found",
        }
    }

    /// Failures scoped to a single record; everything else aborts a run.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::MissingPeriodKey { .. } | Self::Validation { .. } | Self::InsufficientHistory { .. }
        )
    }

    /// Names the zero-based source row a per-row failure came from. Other
    /// errors come back unchanged.
    pub fn at_row(self, row_index: usize) -> Self {
        match self {
            Self::MissingPeriodKey { column, detail } => Self::MissingPeriodKey {
                column,
                detail: format!("{detail} (row {row_index})"),
            },
            Self::Validation {
                subject,
                violations,
            } => Self::Validation {
                subject: format!("{subject} at row {row_index}"),
                violations,
            },
            other => other,
        }
    }
}

/// One scalar cell as read from the source database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Null,
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Column name to cell mapping for a single source row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow {
    cells: BTreeMap<String, RawValue>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<RawValue>) {
        self.cells.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&RawValue> {
        self.cells.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl FromIterator<(String, RawValue)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (String, RawValue)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

/// Duration and time-of-day columns are named with `time` or `sleep`.
pub fn signals_duration(field: &str) -> bool {
    field.contains("time") || field.contains("sleep")
}

/// Drops sub-second precision, e.g. `00:45:12.500000` becomes `00:45:12`.
pub fn truncate_fraction(value: &str) -> &str {
    value.split_once('.').map_or(value, |(whole, _)| whole)
}

pub fn as_string(row: &RawRow, field: &str) -> Option<String> {
    let text = match row.get(field)? {
        RawValue::Null => return None,
        RawValue::Text(v) => v.clone(),
        other => other.to_string(),
    };
    if signals_duration(field) {
        Some(truncate_fraction(&text).to_string())
    } else {
        Some(text)
    }
}

pub fn as_integer(row: &RawRow, field: &str) -> Option<i64> {
    match row.get(field)? {
        RawValue::Integer(v) => Some(*v),
        RawValue::Float(v) => round_half_up(*v),
        RawValue::Text(v) => {
            let trimmed = v.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(round_half_up))
        }
        RawValue::Null => None,
    }
}

/// Floating point read; integers widen, numeric text is parsed.
pub fn as_number(row: &RawRow, field: &str) -> Option<f64> {
    let value = match row.get(field)? {
        RawValue::Integer(v) => *v as f64,
        RawValue::Float(v) => *v,
        RawValue::Text(v) => v.trim().parse::<f64>().ok()?,
        RawValue::Null => return None,
    };
    value.is_finite().then_some(value)
}

/// Rounds halves toward positive infinity (`50.5 -> 51`, `-2.5 -> -2`).
pub fn round_half_up(value: f64) -> Option<i64> {
    if !value.is_finite() {
        return None;
    }
    let rounded = (value + 0.5).floor();
    (rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64).then_some(rounded as i64)
}

/// Accepts `YYYY-MM-DD`, optionally followed by a SQLite time component.
pub fn parse_period_date(value: &RawValue) -> Option<NaiveDate> {
    let RawValue::Text(text) = value else {
        return None;
    };
    let date_part = text
        .trim()
        .split(|c| c == 'T' || c == ' ')
        .next()
        .unwrap_or_default();
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Day,
    Week,
    Month,
    Year,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 4] = [Self::Day, Self::Week, Self::Month, Self::Year];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Source column carrying the period date.
    pub fn key_column(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week | Self::Month | Self::Year => "first_day",
        }
    }

    pub fn collection(self) -> Collection {
        match self {
            Self::Day => Collection::CurrentDaySummaries,
            Self::Week => Collection::WeeklySummaries,
            Self::Month => Collection::MonthlySummaries,
            Self::Year => Collection::YearlySummaries,
        }
    }

    /// Maps a source date onto the key identifying its period. Week keys are
    /// taken as the source reports them.
    pub fn normalize(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day | Self::Week => date,
            Self::Month => date.with_day(1).unwrap_or(date),
            Self::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "days" => Ok(Self::Day),
            "week" | "weeks" => Ok(Self::Week),
            "month" | "months" => Ok(Self::Month),
            "year" | "years" => Ok(Self::Year),
            other => Err(format!("unknown period kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    CurrentDaySummaries,
    WeeklySummaries,
    MonthlySummaries,
    YearlySummaries,
    RecentDailySummaries,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Self::CurrentDaySummaries,
        Self::WeeklySummaries,
        Self::MonthlySummaries,
        Self::YearlySummaries,
        Self::RecentDailySummaries,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CurrentDaySummaries => "current_day_summaries",
            Self::WeeklySummaries => "weekly_summaries",
            Self::MonthlySummaries => "monthly_summaries",
            Self::YearlySummaries => "yearly_summaries",
            Self::RecentDailySummaries => "recent_daily_summaries",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Acceptable range for a metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Any,
    AtLeast(f64),
    Range(f64, f64),
    /// `HH:MM:SS` string.
    Duration,
}

impl Bound {
    fn check_number(self, value: f64) -> Option<String> {
        match self {
            Self::AtLeast(min) if value < min => Some(format!("{value} is below {min}")),
            Self::Range(min, max) if value < min || value > max => {
                Some(format!("{value} is outside {min}..={max}"))
            }
            _ => None,
        }
    }
}

pub fn is_duration(value: &str) -> bool {
    DURATION_PATTERN.is_match(value)
}

trait MetricValue {
    fn violation(&self, bound: Bound) -> Option<String>;
}

impl MetricValue for i64 {
    fn violation(&self, bound: Bound) -> Option<String> {
        bound.check_number(*self as f64)
    }
}

impl MetricValue for f64 {
    fn violation(&self, bound: Bound) -> Option<String> {
        bound.check_number(*self)
    }
}

impl MetricValue for String {
    fn violation(&self, bound: Bound) -> Option<String> {
        match bound {
            Bound::Duration if !is_duration(self) => Some(format!("`{self}` is not HH:MM:SS")),
            _ => None,
        }
    }
}

/// camelCase name used on the wire for a snake_case column.
pub fn wire_name(column: &str) -> String {
    let mut out = String::with_capacity(column.len());
    let mut upper_next = false;
    for c in column.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

// Every metric reads the source column named after its field.
macro_rules! health_metrics {
    ($( $field:ident: $ty:ty => $coerce:ident, $bound:expr; )*) => {
        /// Health metrics for one day, week, month or year.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct HealthMetrics {
            $( pub $field: Option<$ty>, )*
        }

        /// The same metrics laid out as most-recent-first daily sequences.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct RecentMetrics {
            $( pub $field: Vec<Option<$ty>>, )*
        }

        impl HealthMetrics {
            pub const COLUMNS: &'static [&'static str] = &[$( stringify!($field) ),*];

            pub fn from_row(row: &RawRow) -> Self {
                Self {
                    $( $field: $coerce(row, stringify!($field)), )*
                }
            }

            pub fn violations(&self) -> Vec<String> {
                let mut out = Vec::new();
                $(
                    if let Some(problem) = self.$field.as_ref().and_then(|v| v.violation($bound)) {
                        out.push(format!("{}: {problem}", wire_name(stringify!($field))));
                    }
                )*
                out
            }
        }

        impl RecentMetrics {
            fn project(days: &[&HealthMetrics]) -> Self {
                Self {
                    $( $field: days.iter().map(|day| day.$field.clone()).collect(), )*
                }
            }

            pub fn violations(&self, window: usize) -> Vec<String> {
                let mut out = Vec::new();
                $(
                    let name = wire_name(stringify!($field));
                    if self.$field.len() != window {
                        out.push(format!("{name}: expected {window} values, found {}", self.$field.len()));
                    }
                    for (idx, value) in self.$field.iter().enumerate() {
                        if let Some(problem) = value.as_ref().and_then(|v| v.violation($bound)) {
                            out.push(format!("{name}[{idx}]: {problem}"));
                        }
                    }
                )*
                out
            }
        }
    };
}

const HEART_RATE: Bound = Bound::Range(20.0, 250.0);
const PERCENT: Bound = Bound::Range(0.0, 100.0);
const RESPIRATION: Bound = Bound::Range(5.0, 50.0);
const SPO2: Bound = Bound::Range(70.0, 100.0);
const WEIGHT: Bound = Bound::Range(0.0, 300.0);
const NON_NEGATIVE: Bound = Bound::AtLeast(0.0);

health_metrics! {
    // heart rate
    hr_min: i64 => as_integer, HEART_RATE;
    hr_max: i64 => as_integer, HEART_RATE;
    hr_avg: i64 => as_integer, HEART_RATE;
    rhr_min: i64 => as_integer, HEART_RATE;
    rhr_max: i64 => as_integer, HEART_RATE;
    rhr_avg: i64 => as_integer, HEART_RATE;
    inactive_hr_min: i64 => as_integer, HEART_RATE;
    inactive_hr_max: i64 => as_integer, HEART_RATE;
    inactive_hr_avg: i64 => as_integer, HEART_RATE;

    // calories
    calories_avg: i64 => as_integer, NON_NEGATIVE;
    calories_goal: i64 => as_integer, NON_NEGATIVE;
    calories_bmr_avg: i64 => as_integer, NON_NEGATIVE;
    calories_consumed_avg: i64 => as_integer, Bound::Any;
    calories_active_avg: i64 => as_integer, NON_NEGATIVE;
    activities_calories: i64 => as_integer, Bound::Any;

    // weight
    weight_min: f64 => as_number, WEIGHT;
    weight_max: f64 => as_number, WEIGHT;
    weight_avg: f64 => as_number, WEIGHT;

    // hydration
    hydration_goal: i64 => as_integer, NON_NEGATIVE;
    hydration_intake: i64 => as_integer, NON_NEGATIVE;
    hydration_avg: i64 => as_integer, NON_NEGATIVE;
    sweat_loss: i64 => as_integer, NON_NEGATIVE;
    sweat_loss_avg: i64 => as_integer, NON_NEGATIVE;

    // stress and body battery
    bb_min: i64 => as_integer, PERCENT;
    bb_max: i64 => as_integer, PERCENT;
    stress_avg: i64 => as_integer, PERCENT;

    // respiration and SpO2
    rr_min: i64 => as_integer, RESPIRATION;
    rr_max: i64 => as_integer, RESPIRATION;
    rr_waking_avg: i64 => as_integer, RESPIRATION;
    spo2_min: i64 => as_integer, SPO2;
    spo2_avg: i64 => as_integer, SPO2;

    // sleep
    sleep_min: String => as_string, Bound::Duration;
    sleep_max: String => as_string, Bound::Duration;
    sleep_avg: String => as_string, Bound::Duration;
    rem_sleep_min: String => as_string, Bound::Duration;
    rem_sleep_max: String => as_string, Bound::Duration;
    rem_sleep_avg: String => as_string, Bound::Duration;

    // steps and floors
    steps_goal: i64 => as_integer, NON_NEGATIVE;
    steps: i64 => as_integer, NON_NEGATIVE;
    floors_goal: i64 => as_integer, NON_NEGATIVE;
    floors: i64 => as_integer, NON_NEGATIVE;

    // activities
    activities: i64 => as_integer, NON_NEGATIVE;
    activities_distance: f64 => as_number, NON_NEGATIVE;
    intensity_time_goal: String => as_string, Bound::Duration;
    intensity_time: String => as_string, Bound::Duration;
    moderate_activity_time: String => as_string, Bound::Duration;
    vigorous_activity_time: String => as_string, Bound::Duration;
}

/// A day, week, month or year summary keyed by its period start.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub kind: PeriodKind,
    /// Assigned by the store on first insert.
    pub id: Option<String>,
    pub period_key: NaiveDate,
    pub metrics: HealthMetrics,
}

impl SummaryRecord {
    pub fn new(kind: PeriodKind, period_key: NaiveDate, metrics: HealthMetrics) -> Self {
        Self {
            kind,
            id: None,
            period_key: kind.normalize(period_key),
            metrics,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn collection(&self) -> Collection {
        self.kind.collection()
    }
}

/// Trailing seven-day projection ending at `latest_day`.
#[derive(Debug, Clone, PartialEq)]
pub struct Recent7Record {
    pub id: Option<String>,
    pub latest_day: NaiveDate,
    pub metrics: RecentMetrics,
}

impl Recent7Record {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

pub fn row_to_summary(row: &RawRow, kind: PeriodKind) -> Result<SummaryRecord, VitalsError> {
    let column = kind.key_column();
    let value = row
        .get(column)
        .filter(|v| !v.is_null())
        .ok_or_else(|| VitalsError::MissingPeriodKey {
            column: column.to_string(),
            detail: "column is absent or null".to_string(),
        })?;
    let date = parse_period_date(value).ok_or_else(|| VitalsError::MissingPeriodKey {
        column: column.to_string(),
        detail: format!("`{value}` is not a YYYY-MM-DD date"),
    })?;
    Ok(SummaryRecord::new(kind, date, HealthMetrics::from_row(row)))
}

/// Folds daily summaries, ordered most recent first, into a seven-day record.
/// Only the first seven entries are used.
pub fn recent_seven_from_days(days: &[SummaryRecord]) -> Result<Recent7Record, VitalsError> {
    if days.len() < RECENT_WINDOW {
        return Err(VitalsError::InsufficientHistory {
            required: RECENT_WINDOW,
            available: days.len(),
        });
    }
    let window = days[..RECENT_WINDOW]
        .iter()
        .map(|day| &day.metrics)
        .collect::<Vec<_>>();
    Ok(Recent7Record {
        id: None,
        latest_day: days[0].period_key,
        metrics: RecentMetrics::project(&window),
    })
}

pub fn validate_summary(record: &SummaryRecord) -> Result<(), VitalsError> {
    let violations = record.metrics.violations();
    if violations.is_empty() {
        return Ok(());
    }
    Err(VitalsError::Validation {
        subject: format!("{} summary {}", record.kind, format_date(record.period_key)),
        violations,
    })
}

pub fn validate_recent(record: &Recent7Record) -> Result<(), VitalsError> {
    let violations = record.metrics.violations(RECENT_WINDOW);
    if violations.is_empty() {
        return Ok(());
    }
    Err(VitalsError::Validation {
        subject: format!("recent summaries ending {}", format_date(record.latest_day)),
        violations,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryView {
    pub id: String,
    pub period_key: String,
    #[serde(flatten)]
    pub metrics: HealthMetrics,
}

impl From<&SummaryRecord> for SummaryView {
    fn from(record: &SummaryRecord) -> Self {
        Self {
            id: record.id.clone().unwrap_or_default(),
            period_key: format_date(record.period_key),
            metrics: record.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentView {
    pub id: String,
    pub latest_day: String,
    #[serde(flatten)]
    pub metrics: RecentMetrics,
}

impl From<&Recent7Record> for RecentView {
    fn from(record: &Recent7Record) -> Self {
        Self {
            id: record.id.clone().unwrap_or_default(),
            latest_day: format_date(record.latest_day),
            metrics: record.metrics.clone(),
        }
    }
}
