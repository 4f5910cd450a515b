//! Store gateway for perfsync: connection lifecycle, provisioning, the
//! aggregation query, and the conflict-aware bulk upsert.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use perfsync_core::{
    MeasureTotals, RawTable, TotalsComparison, ValidatedRecord, RAW_COLUMNS, TARGET_COLUMNS,
    TARGET_KEY,
};
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, Connection, PgConnection, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

mod memory;

pub use memory::{MemoryFailure, MemorySession, MemoryStore, SourceRow};

pub const CRATE_NAME: &str = "perfsync-storage";

/// Postgres caps one statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
/// Rows per upsert statement; larger batches span several statements.
pub const UPSERT_CHUNK_ROWS: usize = MAX_BIND_PARAMS / TARGET_COLUMNS.len();

const IDENT_MAX_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("provisioning {object}: {source}")]
    Provision {
        object: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("upserting into {table}: {source}")]
    Upsert {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("store rejected the operation: {0}")]
    Rejected(String),
}

/// A validated SQL identifier, rendered double-quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let raw = raw.trim();
        let mut chars = raw.chars();
        let head_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
        if !head_ok || !tail_ok || raw.len() > IDENT_MAX_LEN {
            return Err(StoreError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A table name, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: Option<Ident>,
    pub name: Ident,
}

impl TableRef {
    /// Parses `table` or `schema.table`.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut parts = raw.trim().split('.');
        let first = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (None, _) => Ok(Self {
                schema: None,
                name: Ident::parse(first)?,
            }),
            (Some(second), None) => Ok(Self {
                schema: Some(Ident::parse(first)?),
                name: Ident::parse(second)?,
            }),
            _ => Err(StoreError::InvalidIdentifier(raw.to_string())),
        }
    }

    pub fn qualified(schema: Ident, name: Ident) -> Self {
        Self {
            schema: Some(schema),
            name,
        }
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema.quoted(), self.name.quoted()),
            None => self.name.quoted(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A bind parameter for a read query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    Date(NaiveDate),
    Text(String),
}

/// The bounded per-run aggregation over the source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationQuery {
    pub source: TableRef,
    pub start_date: NaiveDate,
    sql: String,
}

impl AggregationQuery {
    pub fn new(source: TableRef, start_date: NaiveDate) -> Self {
        let sql = format!(
            "SELECT \
                CAST(CAST(date AS DATE) AS TEXT) AS date, \
                CAST(acao AS TEXT) AS acao, \
                MAX(funil) AS funil, \
                MAX(plataforma) AS plataforma, \
                CAST(SUM(CAST(cost AS NUMERIC)) AS TEXT) AS total_cost, \
                CAST(SUM(CAST(NULLIF(conversions, '') AS NUMERIC)) AS TEXT) AS total_conversions, \
                CAST(SUM(CAST(NULLIF(clicks, '') AS NUMERIC)) AS TEXT) AS total_clicks, \
                CAST(SUM(CAST(NULLIF(impressions, '') AS NUMERIC)) AS TEXT) AS total_impressions \
             FROM {} \
             WHERE CAST(date AS DATE) >= $1 \
             GROUP BY CAST(date AS DATE), acao \
             ORDER BY CAST(date AS DATE) DESC",
            source.quoted()
        );
        Self {
            source,
            start_date,
            sql,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> Vec<QueryParam> {
        vec![QueryParam::Date(self.start_date)]
    }

    pub fn columns(&self) -> Vec<String> {
        RAW_COLUMNS.iter().map(|c| c.to_string()).collect()
    }
}

pub fn create_schema_sql(schema: &Ident) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", schema.quoted())
}

pub fn create_target_table_sql(table: &TableRef) -> String {
    let columns = TARGET_COLUMNS
        .iter()
        .map(|c| format!("{} {}", c.name, c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({columns}, PRIMARY KEY ({}))",
        table.quoted(),
        TARGET_KEY.join(", ")
    )
}

/// `INSERT INTO t (cols...) ` ready for a `VALUES` list.
pub fn upsert_prefix_sql(table: &TableRef) -> String {
    let columns = TARGET_COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({columns}) ", table.quoted())
}

/// Replaces every non-key column on key conflict.
pub fn upsert_conflict_sql() -> String {
    let updates = TARGET_COLUMNS
        .iter()
        .filter(|c| !c.is_key())
        .map(|c| format!("{0} = EXCLUDED.{0}", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {updates}",
        TARGET_KEY.join(", ")
    )
}

pub fn compare_totals_sql(source: &TableRef, target: &TableRef) -> String {
    format!(
        "SELECT 'source' AS side, \
                CAST(SUM(CAST(cost AS NUMERIC)) AS TEXT) AS total_cost, \
                CAST(SUM(CAST(NULLIF(conversions, '') AS NUMERIC)) AS TEXT) AS total_conversions, \
                CAST(SUM(CAST(NULLIF(clicks, '') AS NUMERIC)) AS TEXT) AS total_clicks, \
                CAST(SUM(CAST(NULLIF(impressions, '') AS NUMERIC)) AS TEXT) AS total_impressions \
           FROM {} WHERE CAST(date AS DATE) >= $1 \
         UNION ALL \
         SELECT 'target' AS side, \
                CAST(SUM(total_cost) AS TEXT), \
                CAST(SUM(total_conversions) AS TEXT), \
                CAST(SUM(total_clicks) AS TEXT), \
                CAST(SUM(total_impressions) AS TEXT) \
           FROM {} WHERE date >= $1",
        source.quoted(),
        target.quoted()
    )
}

/// Reads the `side`-tagged rows of a totals query. NULL sums count as zero.
pub fn totals_from_table(table: &RawTable) -> Result<TotalsComparison, StoreError> {
    let mut source = None;
    let mut target = None;
    for row in &table.rows {
        let cell = |idx: usize| -> Result<f64, StoreError> {
            match row.get(idx).cloned().flatten() {
                None => Ok(0.0),
                Some(text) => text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| StoreError::Rejected(format!("non-numeric total `{text}`"))),
            }
        };
        let totals = MeasureTotals {
            cost: cell(1)?,
            conversions: cell(2)?,
            clicks: cell(3)?,
            impressions: cell(4)?,
        };
        match row.first().cloned().flatten().as_deref() {
            Some("source") => source = Some(totals),
            Some("target") => target = Some(totals),
            other => {
                return Err(StoreError::Rejected(format!(
                    "unexpected totals side {other:?}"
                )))
            }
        }
    }
    match (source, target) {
        (Some(source), Some(target)) => Ok(TotalsComparison { source, target }),
        _ => Err(StoreError::Rejected(
            "totals query did not return both sides".to_string(),
        )),
    }
}

/// Opens sessions against the external store.
#[async_trait]
pub trait Store: Send + Sync {
    type Session: StoreSession;

    /// Fails loudly; retrying is the run-loop's job.
    async fn connect(&self) -> Result<Self::Session, StoreError>;
}

/// One connection, scoped to one run.
#[async_trait]
pub trait StoreSession: Send + Sized {
    async fn schema_exists(&mut self, schema: &Ident) -> Result<bool, StoreError>;

    /// `CREATE SCHEMA IF NOT EXISTS`; losing a creation race is not an error.
    async fn create_schema(&mut self, schema: &Ident) -> Result<(), StoreError>;

    async fn ensure_target_table(&mut self, table: &TableRef) -> Result<(), StoreError>;

    async fn fetch_aggregates(&mut self, query: &AggregationQuery) -> Result<RawTable, StoreError>;

    /// Writes the whole batch in one transaction.
    async fn write_batch(
        &mut self,
        table: &TableRef,
        records: &[ValidatedRecord],
    ) -> Result<u64, StoreError>;

    async fn compare_totals(
        &mut self,
        source: &TableRef,
        target: &TableRef,
        start_date: NaiveDate,
    ) -> Result<TotalsComparison, StoreError>;

    async fn close(self) -> Result<(), StoreError>;

    /// Check-then-create. Returns whether this call created the schema.
    async fn ensure_schema(&mut self, schema: &Ident) -> Result<bool, StoreError> {
        if self.schema_exists(schema).await? {
            return Ok(false);
        }
        info!(schema = %schema, "creating schema");
        self.create_schema(schema).await?;
        Ok(true)
    }

    /// Insert-or-replace keyed on (date, acao). An empty batch writes nothing.
    async fn upsert(
        &mut self,
        table: &TableRef,
        records: &[ValidatedRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            warn!(table = %table, "no data to upsert, empty batch");
            return Ok(0);
        }
        let affected = self.write_batch(table, records).await?;
        info!(table = %table, records = records.len(), affected, "upsert committed");
        Ok(affected)
    }
}

#[derive(Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub statement_timeout: Option<Duration>,
}

impl ConnectionSettings {
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    fn connect_options(&self) -> PgConnectOptions {
        let opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .application_name("perfsync");
        match self.statement_timeout {
            Some(timeout) => {
                opts.options([("statement_timeout", format!("{}ms", timeout.as_millis()))])
            }
            None => opts,
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    settings: ConnectionSettings,
}

impl PgStore {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

#[async_trait]
impl Store for PgStore {
    type Session = PgSession;

    async fn connect(&self) -> Result<PgSession, StoreError> {
        let endpoint = self.settings.endpoint();
        let conn = PgConnection::connect_with(&self.settings.connect_options())
            .await
            .map_err(|source| StoreError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        info!(%endpoint, "database connection established");
        Ok(PgSession { conn, endpoint })
    }
}

pub struct PgSession {
    conn: PgConnection,
    endpoint: String,
}

impl PgSession {
    /// Runs a read query and returns every column as text. Callers cast
    /// non-text columns in SQL. A zero-row result has no column names.
    pub async fn query_table(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<RawTable, StoreError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                QueryParam::Date(date) => query.bind(*date),
                QueryParam::Text(text) => query.bind(text.clone()),
            };
        }
        let rows = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|source| StoreError::Query {
                context: "executing read query",
                source,
            })?;
        text_table(&rows)
    }
}

fn text_table(rows: &[PgRow]) -> Result<RawTable, StoreError> {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut table = RawTable::new(columns);
    for row in rows {
        let mut cells = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            let cell: Option<String> = row.try_get(idx).map_err(|source| StoreError::Query {
                context: "decoding text column",
                source,
            })?;
            cells.push(cell);
        }
        table.rows.push(cells);
    }
    Ok(table)
}

fn is_duplicate_object(err: &sqlx::Error) -> bool {
    // 42P06 duplicate_schema, 42P07 duplicate_table, 23505 unique_violation
    // (concurrent CREATE ... IF NOT EXISTS races on the catalog index).
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("42P06") | Some("42P07") | Some("23505")
        ),
        _ => false,
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn schema_exists(&mut self, schema: &Ident) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(schema.as_str())
        .fetch_one(&mut self.conn)
        .await
        .map_err(|source| StoreError::Query {
            context: "checking schema",
            source,
        })
    }

    async fn create_schema(&mut self, schema: &Ident) -> Result<(), StoreError> {
        match sqlx::query(&create_schema_sql(schema))
            .execute(&mut self.conn)
            .await
        {
            Ok(_) => {
                info!(schema = %schema, "schema created/verified");
                Ok(())
            }
            Err(err) if is_duplicate_object(&err) => {
                info!(schema = %schema, "schema created concurrently");
                Ok(())
            }
            Err(source) => Err(StoreError::Provision {
                object: format!("schema {schema}"),
                source,
            }),
        }
    }

    async fn ensure_target_table(&mut self, table: &TableRef) -> Result<(), StoreError> {
        match sqlx::query(&create_target_table_sql(table))
            .execute(&mut self.conn)
            .await
        {
            Ok(_) => {}
            Err(err) if is_duplicate_object(&err) => {}
            Err(source) => {
                return Err(StoreError::Provision {
                    object: format!("table {table}"),
                    source,
                })
            }
        }
        info!(table = %table, "table created/verified");
        Ok(())
    }

    async fn fetch_aggregates(&mut self, query: &AggregationQuery) -> Result<RawTable, StoreError> {
        let span = info_span!("extract", source = %query.source, start_date = %query.start_date);
        let mut table = self
            .query_table(query.sql(), &query.params())
            .instrument(span)
            .await?;
        if table.columns.is_empty() {
            table.columns = query.columns();
        }
        Ok(table)
    }

    async fn write_batch(
        &mut self,
        table: &TableRef,
        records: &[ValidatedRecord],
    ) -> Result<u64, StoreError> {
        let upsert_err = |source: sqlx::Error| StoreError::Upsert {
            table: table.to_string(),
            source,
        };
        let prefix = upsert_prefix_sql(table);
        let conflict = upsert_conflict_sql();

        let mut tx = self.conn.begin().await.map_err(upsert_err)?;
        let mut affected = 0u64;
        for chunk in records.chunks(UPSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
            qb.push_values(chunk, |mut b, record| {
                b.push_bind(record.date)
                    .push_bind(record.action.clone())
                    .push_bind(record.platform.clone())
                    .push_bind(record.funnel.clone())
                    .push_bind(record.total_cost)
                    .push_bind(record.total_conversions)
                    .push_bind(record.total_clicks)
                    .push_bind(record.total_impressions);
            });
            qb.push(&conflict);
            let result = qb.build().execute(&mut *tx).await.map_err(upsert_err)?;
            affected += result.rows_affected();
        }
        tx.commit().await.map_err(upsert_err)?;
        Ok(affected)
    }

    async fn compare_totals(
        &mut self,
        source: &TableRef,
        target: &TableRef,
        start_date: NaiveDate,
    ) -> Result<TotalsComparison, StoreError> {
        let table = self
            .query_table(
                &compare_totals_sql(source, target),
                &[QueryParam::Date(start_date)],
            )
            .await?;
        totals_from_table(&table)
    }

    async fn close(self) -> Result<(), StoreError> {
        let endpoint = self.endpoint;
        self.conn
            .close()
            .await
            .map_err(|source| StoreError::Query {
                context: "closing connection",
                source,
            })?;
        info!(%endpoint, "database connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TableRef {
        TableRef::parse("marketing.performance").unwrap()
    }

    #[test]
    fn identifiers_reject_injection() {
        assert!(Ident::parse("daily_stats").is_ok());
        assert!(Ident::parse("_x$1").is_ok());
        assert!(Ident::parse("stats; DROP TABLE x").is_err());
        assert!(Ident::parse("1stats").is_err());
        assert!(Ident::parse("a\"b").is_err());
        assert!(Ident::parse("").is_err());
        assert!(Ident::parse(&"a".repeat(64)).is_err());
        assert!(TableRef::parse("a.b.c").is_err());
        assert!(TableRef::parse("a.").is_err());
    }

    #[test]
    fn table_ref_quotes_each_part() {
        assert_eq!(target().quoted(), "\"marketing\".\"performance\"");
        assert_eq!(target().to_string(), "marketing.performance");
        assert_eq!(TableRef::parse("raw_ads").unwrap().quoted(), "\"raw_ads\"");
    }

    #[test]
    fn aggregation_binds_start_date_instead_of_interpolating() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let query = AggregationQuery::new(TableRef::parse("raw_ads").unwrap(), start);
        assert!(query.sql().contains("FROM \"raw_ads\""));
        assert!(query.sql().contains(">= $1"));
        assert!(!query.sql().contains("2024-01-01"));
        assert!(query.sql().contains("GROUP BY CAST(date AS DATE), acao"));
        assert!(query.sql().ends_with("ORDER BY CAST(date AS DATE) DESC"));
        assert!(query.sql().contains("MAX(funil) AS funil"));
        assert!(query.sql().contains("NULLIF(conversions, '')"));
        assert_eq!(query.params(), vec![QueryParam::Date(start)]);
    }

    #[test]
    fn ddl_and_insert_share_column_order() {
        let ddl = create_target_table_sql(&target());
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"marketing\".\"performance\" (date DATE, acao TEXT, plataforma TEXT, funil TEXT, total_cost NUMERIC"));
        assert!(ddl.ends_with("PRIMARY KEY (date, acao))"));

        let insert = upsert_prefix_sql(&target());
        assert_eq!(
            insert,
            "INSERT INTO \"marketing\".\"performance\" (date, acao, plataforma, funil, total_cost, total_conversions, total_clicks, total_impressions) "
        );
    }

    #[test]
    fn conflict_clause_replaces_only_non_key_columns() {
        let clause = upsert_conflict_sql();
        assert!(clause.starts_with(" ON CONFLICT (date, acao) DO UPDATE SET "));
        assert!(clause.contains("total_cost = EXCLUDED.total_cost"));
        assert!(clause.contains("plataforma = EXCLUDED.plataforma"));
        assert!(clause.contains("funil = EXCLUDED.funil"));
        assert!(!clause.contains("date = EXCLUDED.date"));
        assert!(!clause.contains("acao = EXCLUDED.acao"));
    }

    #[derive(Debug)]
    struct CodedError(&'static str);

    impl fmt::Display for CodedError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl std::error::Error for CodedError {}

    impl sqlx::error::DatabaseError for CodedError {
        fn message(&self) -> &str {
            "coded error"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.0.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    #[test]
    fn concurrent_create_races_count_as_already_present() {
        for code in ["42P06", "42P07", "23505"] {
            let err = sqlx::Error::Database(Box::new(CodedError(code)));
            assert!(is_duplicate_object(&err), "{code}");
        }
        let check = sqlx::Error::Database(Box::new(CodedError("23514")));
        assert!(!is_duplicate_object(&check));
        assert!(!is_duplicate_object(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn upsert_chunks_fit_bind_limit() {
        assert!(UPSERT_CHUNK_ROWS * TARGET_COLUMNS.len() <= MAX_BIND_PARAMS);
    }

    #[test]
    fn totals_rows_map_by_side_and_null_is_zero() {
        let table = RawTable {
            columns: vec![],
            rows: vec![
                vec![
                    Some("target".into()),
                    Some("5".into()),
                    None,
                    Some("1".into()),
                    Some("2".into()),
                ],
                vec![
                    Some("source".into()),
                    Some("10.5".into()),
                    None,
                    Some("3".into()),
                    Some("100".into()),
                ],
            ],
        };
        let cmp = totals_from_table(&table).unwrap();
        assert_eq!(cmp.source.cost, 10.5);
        assert_eq!(cmp.source.conversions, 0.0);
        assert_eq!(cmp.target.impressions, 2.0);
    }

    #[test]
    fn totals_require_both_sides() {
        let table = RawTable {
            columns: vec![],
            rows: vec![vec![Some("source".into()), None, None, None, None]],
        };
        assert!(matches!(
            totals_from_table(&table),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn settings_debug_redacts_password() {
        let settings = ConnectionSettings {
            host: "db".into(),
            port: 5432,
            database: "ads".into(),
            user: "etl".into(),
            password: "hunter2".into(),
            statement_timeout: None,
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(settings.endpoint(), "db:5432/ads");
    }
}
