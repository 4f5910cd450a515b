//! Core record model and run bookkeeping types for perfsync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "perfsync-core";

/// Column names produced by the aggregation query, in select order.
pub const RAW_COLUMNS: [&str; 8] = [
    "date",
    "acao",
    "funil",
    "plataforma",
    "total_cost",
    "total_conversions",
    "total_clicks",
    "total_impressions",
];

/// Target table columns in declared order. DDL and INSERT both read this list.
pub const TARGET_COLUMNS: [TargetColumn; 8] = [
    TargetColumn::new("date", "DATE"),
    TargetColumn::new("acao", "TEXT"),
    TargetColumn::new("plataforma", "TEXT"),
    TargetColumn::new("funil", "TEXT"),
    TargetColumn::new("total_cost", "NUMERIC"),
    TargetColumn::new("total_conversions", "NUMERIC"),
    TargetColumn::new("total_clicks", "NUMERIC"),
    TargetColumn::new("total_impressions", "NUMERIC"),
];

/// Primary key of the target table.
pub const TARGET_KEY: [&str; 2] = ["date", "acao"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: &'static str,
    pub sql_type: &'static str,
}

impl TargetColumn {
    pub const fn new(name: &'static str, sql_type: &'static str) -> Self {
        Self { name, sql_type }
    }

    pub fn is_key(&self) -> bool {
        TARGET_KEY.contains(&self.name)
    }
}

/// Untyped result of a read query: column names plus text-or-NULL cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// One aggregated row exactly as the store returned it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub date: Option<String>,
    pub action: Option<String>,
    pub funnel: Option<String>,
    pub platform: Option<String>,
    pub total_cost: Option<String>,
    pub total_conversions: Option<String>,
    pub total_clicks: Option<String>,
    pub total_impressions: Option<String>,
}

/// A raw record after type enforcement, ready for the upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    pub date: NaiveDate,
    pub action: String,
    pub funnel: Option<String>,
    pub platform: Option<String>,
    pub total_cost: f64,
    pub total_conversions: f64,
    pub total_clicks: f64,
    pub total_impressions: f64,
}

impl ValidatedRecord {
    pub fn key(&self) -> (NaiveDate, &str) {
        (self.date, self.action.as_str())
    }
}

/// How the validator treats missing or unparseable values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationPolicy {
    /// Missing or unparseable measures become `0.0`; unkeyable rows are dropped.
    #[default]
    Fill,
    /// Any missing or unparseable value fails the batch.
    Strict,
}

impl ValidationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fill => "fill",
            Self::Strict => "strict",
        }
    }
}

impl fmt::Display for ValidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fill" | "coerce" => Ok(Self::Fill),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown validation policy `{other}` (expected fill|strict)")),
        }
    }
}

/// Pipeline stage a run failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Connect,
    Provision,
    Extract,
    Validate,
    Upsert,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Provision => "provision",
            Self::Extract => "extract",
            Self::Validate => "validate",
            Self::Upsert => "upsert",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// The extraction returned no rows; nothing was written.
    Empty,
    Failed { stage: RunStage, message: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Record of one pipeline pass. Reported, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extracted: usize,
    pub upserted: u64,
    pub dropped: usize,
    pub repaired_values: usize,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            extracted: 0,
            upserted: 0,
            dropped: 0,
            repaired_values: 0,
            outcome: RunOutcome::Empty,
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Sums of the four measures over one side of the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasureTotals {
    pub cost: f64,
    pub conversions: f64,
    pub clicks: f64,
    pub impressions: f64,
}

impl MeasureTotals {
    /// Largest absolute difference across the four measures.
    pub fn max_abs_diff(&self, other: &MeasureTotals) -> f64 {
        [
            self.cost - other.cost,
            self.conversions - other.conversions,
            self.clicks - other.clicks,
            self.impressions - other.impressions,
        ]
        .into_iter()
        .map(f64::abs)
        .fold(0.0, f64::max)
    }
}

/// Source-side versus target-side totals since the start date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TotalsComparison {
    pub source: MeasureTotals,
    pub target: MeasureTotals,
}

impl TotalsComparison {
    pub fn is_consistent(&self, tolerance: f64) -> bool {
        self.source.max_abs_diff(&self.target) <= tolerance
    }
}
