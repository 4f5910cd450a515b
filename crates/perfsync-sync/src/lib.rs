//! Extract → validate → upsert orchestration and the scheduled run-loop.

use std::time::Instant;

use chrono::{NaiveDate, Utc};
use perfsync_core::{RunOutcome, RunReport, RunStage, TotalsComparison};
use perfsync_storage::{AggregationQuery, Ident, Store, StoreError, StoreSession, TableRef};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

pub mod config;
pub mod logging;
pub mod schedule;
pub mod validate;

pub use config::{ConfigError, EtlConfig};
pub use schedule::{LoopStats, RunLoop, SchedulePolicy};
pub use validate::{MissingDataReport, ValidatedBatch, ValidationError, Validator};

pub const CRATE_NAME: &str = "perfsync-sync";

/// Absolute tolerance when comparing source and target totals.
const TOTALS_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("connect failed: {0}")]
    Connect(#[source] StoreError),
    #[error("provisioning failed: {0}")]
    Provision(#[source] StoreError),
    #[error("extraction failed: {0}")]
    Extract(#[source] StoreError),
    #[error("validation failed: {0}")]
    Validate(#[from] ValidationError),
    #[error("upsert failed: {0}")]
    Upsert(#[source] StoreError),
}

impl RunError {
    pub fn stage(&self) -> RunStage {
        match self {
            Self::Connect(_) => RunStage::Connect,
            Self::Provision(_) => RunStage::Provision,
            Self::Extract(_) => RunStage::Extract,
            Self::Validate(_) => RunStage::Validate,
            Self::Upsert(_) => RunStage::Upsert,
        }
    }
}

/// What one run reads and writes.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub target_schema: Ident,
    pub target_table: TableRef,
    pub source_table: TableRef,
    pub start_date: NaiveDate,
    pub verify_totals: bool,
}

impl RunPlan {
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            target_schema: config.target_schema.clone(),
            target_table: config.target_table.clone(),
            source_table: config.source_table.clone(),
            start_date: config.start_date,
            verify_totals: config.verify_totals,
        }
    }

    pub fn aggregation_query(&self) -> AggregationQuery {
        AggregationQuery::new(self.source_table.clone(), self.start_date)
    }
}

pub struct Orchestrator<S: Store> {
    store: S,
    plan: RunPlan,
    validator: Validator,
}

impl<S: Store> Orchestrator<S> {
    pub fn new(store: S, plan: RunPlan, validator: Validator) -> Self {
        Self {
            store,
            plan,
            validator,
        }
    }

    pub fn from_config(store: S, config: &EtlConfig) -> Self {
        Self::new(store, RunPlan::from_config(config), Validator::new(config.validation))
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// One full pass. Never returns an error: failures land in the report's
    /// outcome so the caller can keep scheduling.
    pub async fn run_once(&self) -> RunReport {
        let mut report = RunReport::begin(Utc::now());
        let span = info_span!("etl_run", run_id = %report.run_id);
        async {
            info!(
                source = %self.plan.source_table,
                target = %self.plan.target_table,
                start_date = %self.plan.start_date,
                policy = %self.validator.policy(),
                "starting ETL run"
            );
            let started = Instant::now();
            let result = self.try_run(&mut report).await;
            report.finished_at = Utc::now();
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(()) => info!(
                    elapsed_ms,
                    extracted = report.extracted,
                    upserted = report.upserted,
                    dropped = report.dropped,
                    repaired = report.repaired_values,
                    "ETL run completed"
                ),
                Err(err) => {
                    error!(elapsed_ms, stage = %err.stage(), error = %err, "ETL run failed");
                    report.outcome = RunOutcome::Failed {
                        stage: err.stage(),
                        message: err.to_string(),
                    };
                }
            }
        }
        .instrument(span)
        .await;
        report
    }

    /// Like `run_once` but surfaces the failure cause.
    pub async fn try_run(&self, report: &mut RunReport) -> Result<(), RunError> {
        let mut session = self.store.connect().await.map_err(RunError::Connect)?;
        let result = self.run_with_session(&mut session, report).await;
        close_session(session).await;
        result
    }

    async fn run_with_session(
        &self,
        session: &mut S::Session,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        provision(session, &self.plan).await?;

        info!("executing aggregation query");
        let table = session
            .fetch_aggregates(&self.plan.aggregation_query())
            .await
            .map_err(RunError::Extract)?;
        report.extracted = table.len();

        if table.is_empty() {
            info!("no rows extracted; skipping validation and upsert");
            report.outcome = RunOutcome::Empty;
            return Ok(());
        }

        info!(records = table.len(), "processing records");
        let batch = self.validator.validate_table(&table)?;
        report.dropped = batch.dropped;
        report.repaired_values = batch.repaired_values;

        info!(records = batch.records.len(), "performing upsert");
        report.upserted = session
            .upsert(&self.plan.target_table, &batch.records)
            .await
            .map_err(RunError::Upsert)?;
        report.outcome = RunOutcome::Succeeded;

        if self.plan.verify_totals {
            match compare(session, &self.plan).await {
                Ok(cmp) => log_totals(&cmp),
                Err(err) => warn!(error = %err, "totals check failed"),
            }
        }
        Ok(())
    }

    /// Creates the target schema and table if absent.
    pub async fn provision(&self) -> Result<(), RunError> {
        let mut session = self.store.connect().await.map_err(RunError::Connect)?;
        let result = provision(&mut session, &self.plan).await;
        close_session(session).await;
        result
    }

    /// Source versus target totals since the start date.
    pub async fn reconcile(&self) -> Result<TotalsComparison, RunError> {
        let mut session = self.store.connect().await.map_err(RunError::Connect)?;
        let result = compare(&mut session, &self.plan).await;
        close_session(session).await;
        let cmp = result?;
        log_totals(&cmp);
        Ok(cmp)
    }
}

async fn provision<T: StoreSession>(session: &mut T, plan: &RunPlan) -> Result<(), RunError> {
    session
        .ensure_schema(&plan.target_schema)
        .await
        .map_err(RunError::Provision)?;
    info!(table = %plan.target_table, "verifying target table");
    session
        .ensure_target_table(&plan.target_table)
        .await
        .map_err(RunError::Provision)
}

async fn compare<T: StoreSession>(
    session: &mut T,
    plan: &RunPlan,
) -> Result<TotalsComparison, RunError> {
    session
        .compare_totals(&plan.source_table, &plan.target_table, plan.start_date)
        .await
        .map_err(RunError::Extract)
}

async fn close_session<T: StoreSession>(session: T) {
    if let Err(err) = session.close().await {
        warn!(error = %err, "closing store session failed");
    }
}

fn log_totals(cmp: &TotalsComparison) {
    if cmp.is_consistent(TOTALS_TOLERANCE) {
        info!(
            cost = cmp.source.cost,
            conversions = cmp.source.conversions,
            clicks = cmp.source.clicks,
            impressions = cmp.source.impressions,
            "source and target totals match"
        );
    } else {
        warn!(
            source_cost = cmp.source.cost,
            target_cost = cmp.target.cost,
            source_conversions = cmp.source.conversions,
            target_conversions = cmp.target.conversions,
            source_clicks = cmp.source.clicks,
            target_clicks = cmp.target.clicks,
            source_impressions = cmp.source.impressions,
            target_impressions = cmp.target.impressions,
            gap = cmp.source.max_abs_diff(&cmp.target),
            "source and target totals diverge"
        );
    }
}
