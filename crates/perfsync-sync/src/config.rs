use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use perfsync_core::ValidationPolicy;
use perfsync_storage::{ConnectionSettings, Ident, StoreError, TableRef};
use thiserror::Error;

use crate::schedule::SchedulePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
    #[error(transparent)]
    Identifier(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub connection: ConnectionSettings,
    pub target_schema: Ident,
    pub target_table: TableRef,
    pub source_table: TableRef,
    pub start_date: NaiveDate,
    pub validation: ValidationPolicy,
    pub schedule: SchedulePolicy,
    pub poll_interval: Duration,
    pub verify_totals: bool,
    pub log_dir: PathBuf,
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let parsed = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(key) {
                None => Ok(default),
                Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
                    var: key,
                    message: format!("expected an integer, got `{v}`"),
                }),
            }
        };

        let port = parsed("DB_PORT", 5432)?;
        let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
            var: "DB_PORT",
            message: format!("{port} is out of range"),
        })?;
        let statement_timeout = match get("PERFSYNC_STATEMENT_TIMEOUT_SECS") {
            None => None,
            Some(_) => Some(Duration::from_secs(parsed("PERFSYNC_STATEMENT_TIMEOUT_SECS", 0)?)),
        };
        let connection = ConnectionSettings {
            host: get("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            database: required("DB_NAME")?,
            user: required("DB_USER")?,
            password: lookup("DB_PASSWORD").unwrap_or_default(),
            statement_timeout,
        };

        let target_schema = Ident::parse(&required("TARGET_SCHEMA")?)?;
        let target_table =
            TableRef::qualified(target_schema.clone(), Ident::parse(&required("TARGET_TABLE")?)?);
        let source_table = TableRef::parse(&required("SOURCE_TABLE")?)?;

        let start_raw = required("START_DATE")?;
        let start_date = NaiveDate::parse_from_str(start_raw.trim(), "%Y-%m-%d").map_err(|e| {
            ConfigError::Invalid {
                var: "START_DATE",
                message: format!("`{start_raw}` is not YYYY-MM-DD: {e}"),
            }
        })?;

        let validation = match get("PERFSYNC_VALIDATION_POLICY") {
            None => ValidationPolicy::default(),
            Some(v) => v.parse::<ValidationPolicy>().map_err(|message| ConfigError::Invalid {
                var: "PERFSYNC_VALIDATION_POLICY",
                message,
            })?,
        };

        let mode = get("PERFSYNC_SCHEDULE_MODE").unwrap_or_else(|| "daily-anchor".to_string());
        let schedule = match mode.trim().to_ascii_lowercase().as_str() {
            "daily-anchor" | "daily" => {
                let raw = get("PERFSYNC_TRIGGER_TIME").unwrap_or_else(|| "06:00".to_string());
                let trigger_time = NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
                    .map_err(|_| ConfigError::Invalid {
                        var: "PERFSYNC_TRIGGER_TIME",
                        message: format!("`{raw}` is not HH:MM"),
                    })?;
                SchedulePolicy::DailyAnchor { trigger_time }
            }
            "fixed-backoff" | "backoff" => SchedulePolicy::FixedBackoff {
                success_delay: Duration::from_secs(parsed("PERFSYNC_SUCCESS_DELAY_SECS", 120)?),
                failure_delay: Duration::from_secs(parsed("PERFSYNC_FAILURE_DELAY_SECS", 60)?),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "PERFSYNC_SCHEDULE_MODE",
                    message: format!("unknown mode `{other}` (expected daily-anchor|fixed-backoff)"),
                })
            }
        };

        let poll_secs = parsed("PERFSYNC_POLL_SECS", 60)?.max(1);
        let verify_totals = get("PERFSYNC_VERIFY_TOTALS")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
            .unwrap_or(false);
        let log_dir = get("PERFSYNC_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./logs"));

        Ok(Self {
            connection,
            target_schema,
            target_table,
            source_table,
            start_date,
            validation,
            schedule,
            poll_interval: Duration::from_secs(poll_secs),
            verify_totals,
            log_dir,
        })
    }
}
