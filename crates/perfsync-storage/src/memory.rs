//! In-process store with the same provisioning, aggregation and upsert
//! semantics as the Postgres gateway.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use perfsync_core::{MeasureTotals, RawTable, TotalsComparison, ValidatedRecord, RAW_COLUMNS};

use crate::{AggregationQuery, Ident, Store, StoreError, StoreSession, TableRef};

/// One row of the source table, text measures as the source stores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub date: NaiveDate,
    pub action: Option<String>,
    pub funnel: Option<String>,
    pub platform: Option<String>,
    pub cost: String,
    pub conversions: String,
    pub clicks: String,
    pub impressions: String,
}

impl SourceRow {
    pub fn new(date: NaiveDate, action: &str, funnel: &str, platform: &str) -> Self {
        Self {
            date,
            action: Some(action.to_string()),
            funnel: Some(funnel.to_string()),
            platform: Some(platform.to_string()),
            cost: "0".to_string(),
            conversions: String::new(),
            clicks: String::new(),
            impressions: String::new(),
        }
    }

    pub fn measures(
        mut self,
        cost: &str,
        conversions: &str,
        clicks: &str,
        impressions: &str,
    ) -> Self {
        self.cost = cost.to_string();
        self.conversions = conversions.to_string();
        self.clicks = clicks.to_string();
        self.impressions = impressions.to_string();
        self
    }
}

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFailure {
    Connect,
    Provision,
    Extract,
    Upsert,
}

#[derive(Debug, Default)]
struct MemoryState {
    source: Vec<SourceRow>,
    schemas: BTreeSet<String>,
    tables: BTreeSet<TableRef>,
    target: BTreeMap<(NaiveDate, String), ValidatedRecord>,
    pending_failures: Vec<MemoryFailure>,
    opened: usize,
    closed: usize,
    upsert_calls: usize,
}

impl MemoryState {
    fn take_failure(&mut self, op: MemoryFailure) -> Result<(), StoreError> {
        match self.pending_failures.iter().position(|f| *f == op) {
            Some(idx) => {
                self.pending_failures.remove(idx);
                Err(StoreError::Rejected(format!("injected {op:?} failure")))
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a panicking test thread; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_source_rows(self, rows: impl IntoIterator<Item = SourceRow>) -> Self {
        self.lock().source.extend(rows);
        self
    }

    pub fn replace_source_rows(&self, rows: impl IntoIterator<Item = SourceRow>) {
        let mut state = self.lock();
        state.source.clear();
        state.source.extend(rows);
    }

    /// Makes the next `op` call fail once.
    pub fn fail_next(&self, op: MemoryFailure) {
        self.lock().pending_failures.push(op);
    }

    pub fn target_rows(&self) -> Vec<ValidatedRecord> {
        self.lock().target.values().cloned().collect()
    }

    pub fn schemas(&self) -> Vec<String> {
        self.lock().schemas.iter().cloned().collect()
    }

    pub fn tables(&self) -> Vec<TableRef> {
        self.lock().tables.iter().cloned().collect()
    }

    /// (opened, closed) session counts.
    pub fn session_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.opened, state.closed)
    }

    pub fn upsert_calls(&self) -> usize {
        self.lock().upsert_calls
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, StoreError> {
        let mut state = self.lock();
        state.take_failure(MemoryFailure::Connect)?;
        state.opened += 1;
        Ok(MemorySession {
            store: self.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
}

fn parse_measure(text: &str) -> Result<f64, StoreError> {
    text.trim().parse::<f64>().map_err(|_| {
        StoreError::Rejected(format!("invalid input syntax for type numeric: \"{text}\""))
    })
}

/// `SUM(CAST(NULLIF(x, '') AS NUMERIC))`: NULL when every input is empty.
fn sum_nullable<'a>(values: impl Iterator<Item = &'a str>) -> Result<Option<f64>, StoreError> {
    let mut total = None;
    for value in values {
        if value.is_empty() {
            continue;
        }
        *total.get_or_insert(0.0) += parse_measure(value)?;
    }
    Ok(total)
}

fn source_totals(rows: &[&SourceRow]) -> Result<MeasureTotals, StoreError> {
    Ok(MeasureTotals {
        cost: sum_nullable(rows.iter().map(|r| r.cost.as_str()))?.unwrap_or(0.0),
        conversions: sum_nullable(rows.iter().map(|r| r.conversions.as_str()))?.unwrap_or(0.0),
        clicks: sum_nullable(rows.iter().map(|r| r.clicks.as_str()))?.unwrap_or(0.0),
        impressions: sum_nullable(rows.iter().map(|r| r.impressions.as_str()))?.unwrap_or(0.0),
    })
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn schema_exists(&mut self, schema: &Ident) -> Result<bool, StoreError> {
        Ok(self.store.lock().schemas.contains(schema.as_str()))
    }

    async fn create_schema(&mut self, schema: &Ident) -> Result<(), StoreError> {
        let mut state = self.store.lock();
        state.take_failure(MemoryFailure::Provision)?;
        state.schemas.insert(schema.as_str().to_string());
        Ok(())
    }

    async fn ensure_target_table(&mut self, table: &TableRef) -> Result<(), StoreError> {
        let mut state = self.store.lock();
        state.take_failure(MemoryFailure::Provision)?;
        if let Some(schema) = &table.schema {
            if !state.schemas.contains(schema.as_str()) {
                return Err(StoreError::Rejected(format!("schema \"{schema}\" does not exist")));
            }
        }
        state.tables.insert(table.clone());
        Ok(())
    }

    async fn fetch_aggregates(&mut self, query: &AggregationQuery) -> Result<RawTable, StoreError> {
        let mut state = self.store.lock();
        state.take_failure(MemoryFailure::Extract)?;

        let mut groups: BTreeMap<(NaiveDate, Option<String>), Vec<&SourceRow>> = BTreeMap::new();
        for row in state.source.iter().filter(|r| r.date >= query.start_date) {
            groups
                .entry((row.date, row.action.clone()))
                .or_default()
                .push(row);
        }

        let mut table = RawTable::new(RAW_COLUMNS.iter().map(|c| c.to_string()).collect());
        for ((date, action), rows) in groups.iter().rev() {
            let mut cost = 0.0;
            for row in rows {
                cost += parse_measure(&row.cost)?;
            }
            let render = |v: Option<f64>| v.map(|v| v.to_string());
            table.rows.push(vec![
                Some(date.format("%Y-%m-%d").to_string()),
                action.clone(),
                rows.iter().filter_map(|r| r.funnel.clone()).max(),
                rows.iter().filter_map(|r| r.platform.clone()).max(),
                Some(cost.to_string()),
                render(sum_nullable(rows.iter().map(|r| r.conversions.as_str()))?),
                render(sum_nullable(rows.iter().map(|r| r.clicks.as_str()))?),
                render(sum_nullable(rows.iter().map(|r| r.impressions.as_str()))?),
            ]);
        }
        Ok(table)
    }

    async fn write_batch(
        &mut self,
        table: &TableRef,
        records: &[ValidatedRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.store.lock();
        state.upsert_calls += 1;
        state.take_failure(MemoryFailure::Upsert)?;
        if !state.tables.contains(table) {
            return Err(StoreError::Rejected(format!("relation \"{table}\" does not exist")));
        }
        let mut seen = BTreeSet::new();
        for record in records {
            if !seen.insert(record.key()) {
                return Err(StoreError::Rejected(
                    "ON CONFLICT DO UPDATE command cannot affect row a second time".to_string(),
                ));
            }
        }
        for record in records {
            state
                .target
                .insert((record.date, record.action.clone()), record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn compare_totals(
        &mut self,
        _source: &TableRef,
        _target: &TableRef,
        start_date: NaiveDate,
    ) -> Result<TotalsComparison, StoreError> {
        let state = self.store.lock();
        let rows: Vec<&SourceRow> = state.source.iter().filter(|r| r.date >= start_date).collect();
        let source = source_totals(&rows)?;
        let target = state
            .target
            .values()
            .filter(|r| r.date >= start_date)
            .fold(MeasureTotals::default(), |mut acc, r| {
                acc.cost += r.total_cost;
                acc.conversions += r.total_conversions;
                acc.clicks += r.total_clicks;
                acc.impressions += r.total_impressions;
                acc
            });
        Ok(TotalsComparison { source, target })
    }

    async fn close(self) -> Result<(), StoreError> {
        self.store.lock().closed += 1;
        Ok(())
    }
}
