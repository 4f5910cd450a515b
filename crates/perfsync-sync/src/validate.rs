//! Type enforcement for extracted aggregation rows.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};
use perfsync_core::{RawRecord, RawTable, ValidatedRecord, ValidationPolicy};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("extracted table is missing column `{0}`")]
    MissingColumn(&'static str),
    #[error("row {row}: invalid date {value:?}")]
    InvalidDate { row: usize, value: Option<String> },
    #[error("row {row}: missing action")]
    MissingAction { row: usize },
    #[error("row {row}: column `{column}` is not numeric: {value:?}")]
    InvalidNumber {
        row: usize,
        column: &'static str,
        value: Option<String>,
    },
    #[error("row {row}: column `{column}` overflows a 64-bit float: {value}")]
    MeasureOverflow {
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("duplicate key ({date}, {action}) in batch")]
    DuplicateKey { date: NaiveDate, action: String },
}

/// Null or blank counts in the critical columns of one batch. Blank text is
/// counted but kept as written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissingDataReport {
    pub action: usize,
    pub platform: usize,
}

impl MissingDataReport {
    pub fn any(&self) -> bool {
        self.action > 0 || self.platform > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedBatch {
    pub records: Vec<ValidatedRecord>,
    /// Rows removed because they could not be keyed.
    pub dropped: usize,
    /// Measure cells replaced by `0.0`.
    pub repaired_values: usize,
    pub missing: MissingDataReport,
}

/// Maps a `RawTable` onto `RawRecord`s by column name.
pub fn raw_records(table: &RawTable) -> Result<Vec<RawRecord>, ValidationError> {
    let idx = |name: &'static str| {
        table
            .column_index(name)
            .ok_or(ValidationError::MissingColumn(name))
    };
    let date = idx("date")?;
    let action = idx("acao")?;
    let funnel = idx("funil")?;
    let platform = idx("plataforma")?;
    let cost = idx("total_cost")?;
    let conversions = idx("total_conversions")?;
    let clicks = idx("total_clicks")?;
    let impressions = idx("total_impressions")?;

    Ok(table
        .rows
        .iter()
        .map(|row| {
            let cell = |i: usize| row.get(i).cloned().flatten();
            RawRecord {
                date: cell(date),
                action: cell(action),
                funnel: cell(funnel),
                platform: cell(platform),
                total_cost: cell(cost),
                total_conversions: cell(conversions),
                total_clicks: cell(clicks),
                total_impressions: cell(impressions),
            }
        })
        .collect())
}

/// Accepts `YYYY-MM-DD`, discarding a trailing time component if present.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
                .map(|dt| dt.date())
                .ok()
        })
}

enum Measure {
    Value(f64),
    Unusable,
    Overflow,
}

fn parse_measure(value: Option<&str>) -> Measure {
    match value.map(str::trim).map(str::parse::<f64>) {
        Some(Ok(v)) if v.is_finite() => Measure::Value(v),
        Some(Ok(v)) if v.is_infinite() => Measure::Overflow,
        _ => Measure::Unusable,
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

pub struct Validator {
    policy: ValidationPolicy,
}

impl Validator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    pub fn validate_table(&self, table: &RawTable) -> Result<ValidatedBatch, ValidationError> {
        self.validate(raw_records(table)?)
    }

    pub fn validate(&self, rows: Vec<RawRecord>) -> Result<ValidatedBatch, ValidationError> {
        let mut batch = ValidatedBatch {
            records: Vec::with_capacity(rows.len()),
            ..Default::default()
        };
        let mut keys = HashSet::with_capacity(rows.len());

        for (row, raw) in rows.into_iter().enumerate() {
            let date = raw
                .date
                .as_deref()
                .and_then(parse_date)
                .ok_or_else(|| ValidationError::InvalidDate {
                    row,
                    value: raw.date.clone(),
                })?;

            if is_blank(raw.platform.as_deref()) {
                batch.missing.platform += 1;
            }
            if is_blank(raw.action.as_deref()) {
                batch.missing.action += 1;
            }

            let Some(action) = raw.action else {
                match self.policy {
                    ValidationPolicy::Strict => return Err(ValidationError::MissingAction { row }),
                    ValidationPolicy::Fill => {
                        batch.dropped += 1;
                        continue;
                    }
                }
            };

            let mut measure = |column: &'static str, value: Option<String>| {
                match (parse_measure(value.as_deref()), self.policy) {
                    (Measure::Value(v), _) => Ok(v),
                    (Measure::Overflow, _) => Err(ValidationError::MeasureOverflow {
                        row,
                        column,
                        value: value.unwrap_or_default(),
                    }),
                    (Measure::Unusable, ValidationPolicy::Fill) => {
                        batch.repaired_values += 1;
                        Ok(0.0)
                    }
                    (Measure::Unusable, ValidationPolicy::Strict) => {
                        Err(ValidationError::InvalidNumber { row, column, value })
                    }
                }
            };
            let total_cost = measure("total_cost", raw.total_cost)?;
            let total_conversions = measure("total_conversions", raw.total_conversions)?;
            let total_clicks = measure("total_clicks", raw.total_clicks)?;
            let total_impressions = measure("total_impressions", raw.total_impressions)?;

            if !keys.insert((date, action.clone())) {
                return Err(ValidationError::DuplicateKey { date, action });
            }

            batch.records.push(ValidatedRecord {
                date,
                action,
                funnel: raw.funnel,
                platform: raw.platform,
                total_cost,
                total_conversions,
                total_clicks,
                total_impressions,
            });
        }

        if batch.missing.any() {
            warn!(
                missing_action = batch.missing.action,
                missing_platform = batch.missing.platform,
                dropped = batch.dropped,
                "missing data found in critical columns"
            );
        }
        Ok(batch)
    }
}
