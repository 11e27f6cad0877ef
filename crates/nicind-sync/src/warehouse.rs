//! Staging-table load and warehouse refresh.

use std::time::Duration;

use async_trait::async_trait;
use nicind_core::IndicatorRecord;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{error, info};

pub const STAGING_TABLE: &str = "staging.datos";

/// Dimension procedures, run together in one transaction before the fact refresh.
pub const DIMENSION_PROCEDURES: [&str; 4] = [
    "dw.usp_fill_dim_origen",
    "dw.usp_fill_dim_institucion",
    "dw.usp_fill_dim_indicador",
    "dw.usp_fill_dim_periodo",
];
pub const FACT_PROCEDURE: &str = "dw.usp_fill_ft_valor";

/// Six bind parameters per row keeps each statement well under the protocol limit.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("connecting to warehouse: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("truncating staging.datos: {0}")]
    Truncate(#[source] sqlx::Error),
    #[error("inserting {rows} rows into staging.datos: {source}")]
    Insert {
        rows: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("running {procedure}: {source}")]
    Refresh {
        procedure: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadOutcome {
    /// Loading was not requested for this run.
    Skipped,
    /// Nothing was collected; staging was emptied and the refresh did not run.
    NothingLoaded,
    Loaded { rows: u64 },
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn truncate_staging(&self) -> Result<(), LoadError>;

    /// Empties staging and bulk inserts `records`, atomically.
    async fn replace_staging(&self, records: &[IndicatorRecord]) -> Result<u64, LoadError>;

    /// Refreshes dimensions, commits, then refreshes facts.
    async fn refresh(&self) -> Result<(), LoadError>;
}

/// Replaces the staging contents with `records` and refreshes the warehouse from them.
/// An empty record set only empties staging.
pub async fn load_and_refresh(
    warehouse: &dyn Warehouse,
    records: &[IndicatorRecord],
) -> Result<LoadOutcome, LoadError> {
    if records.is_empty() {
        warehouse.truncate_staging().await.inspect_err(|err| {
            error!(error = %err, "failed to empty staging table");
        })?;
        info!("no records collected; staging emptied, refresh skipped");
        return Ok(LoadOutcome::NothingLoaded);
    }

    let rows = warehouse.replace_staging(records).await.inspect_err(|err| {
        error!(error = %err, "failed to load staging table");
    })?;
    info!(rows, "staging table loaded");

    warehouse.refresh().await.inspect_err(|err| {
        error!(error = %err, "failed to refresh warehouse");
    })?;
    info!("warehouse refreshed");
    Ok(LoadOutcome::Loaded { rows })
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(options: PgConnectOptions) -> Result<Self, LoadError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(LoadError::Connect)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn truncate_sql() -> String {
    format!("TRUNCATE TABLE {STAGING_TABLE}")
}

fn call_sql(procedure: &str) -> String {
    format!("CALL {procedure}()")
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn truncate_staging(&self) -> Result<(), LoadError> {
        sqlx::query(&truncate_sql())
            .execute(&self.pool)
            .await
            .map_err(LoadError::Truncate)?;
        Ok(())
    }

    async fn replace_staging(&self, records: &[IndicatorRecord]) -> Result<u64, LoadError> {
        let insert_error = |source: sqlx::Error| LoadError::Insert {
            rows: records.len(),
            source,
        };
        let mut tx = self.pool.begin().await.map_err(insert_error)?;
        sqlx::query(&truncate_sql())
            .execute(&mut *tx)
            .await
            .map_err(LoadError::Truncate)?;

        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {STAGING_TABLE} (origen, institucion, indicador, anio, mes, valor) "
            ));
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.origin.code())
                    .push_bind(record.institution.as_str())
                    .push_bind(record.indicator.as_str())
                    .push_bind(record.year)
                    .push_bind(record.month as i32)
                    .push_bind(record.value);
            });
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(insert_error)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(insert_error)?;
        Ok(inserted)
    }

    async fn refresh(&self) -> Result<(), LoadError> {
        let mut tx = self.pool.begin().await.map_err(|source| LoadError::Refresh {
            procedure: DIMENSION_PROCEDURES[0],
            source,
        })?;
        for procedure in DIMENSION_PROCEDURES {
            sqlx::query(&call_sql(procedure))
                .execute(&mut *tx)
                .await
                .map_err(|source| LoadError::Refresh { procedure, source })?;
        }
        tx.commit().await.map_err(|source| LoadError::Refresh {
            procedure: DIMENSION_PROCEDURES[3],
            source,
        })?;

        sqlx::query(&call_sql(FACT_PROCEDURE))
            .execute(&self.pool)
            .await
            .map_err(|source| LoadError::Refresh {
                procedure: FACT_PROCEDURE,
                source,
            })?;
        Ok(())
    }
}
