//! Run orchestration: collect from the selected sources, optionally export, load the warehouse.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nicind_adapters::{adapter_for_origin, AdapterContext, SourceAdapter};
use nicind_core::{IndicatorRecord, Origin, Scope};
use nicind_storage::{ArtifactStore, Fetch, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod export;
pub mod warehouse;

pub use export::export_parquet;
pub use warehouse::{load_and_refresh, LoadError, LoadOutcome, PgWarehouse, Warehouse};

pub const CRATE_NAME: &str = "nicind-sync";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: &'static str, value: String },
}

/// Warehouse connection settings. Only required when a run loads.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub server: Option<String>,
    pub port: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl DatabaseConfig {
    pub const DEFAULT_PORT: u16 = 5432;

    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        let required = |value: &Option<String>, key: &'static str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(ConfigError::Missing(key))
        };
        let server = required(&self.server, "DB_SERVER")?;
        let name = required(&self.name, "DB_NAME")?;
        let user = required(&self.user, "DB_USER")?;
        let password = required(&self.password, "DB_PASSWORD")?;
        let port = match self.port.as_deref().map(str::trim) {
            None | Some("") => Self::DEFAULT_PORT,
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "DB_PORT",
                value: raw.to_string(),
            })?,
        };

        Ok(PgConnectOptions::new()
            .host(&server)
            .port(port)
            .database(&name)
            .username(&user)
            .password(&password))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub files_dir: PathBuf,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub download_delay_secs: u64,
    pub siboif_ca_cert: Option<PathBuf>,
    pub database: DatabaseConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            files_dir: non_empty("NICIND_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./files")),
            user_agent: non_empty("NICIND_USER_AGENT"),
            http_timeout_secs: non_empty("NICIND_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(60),
            download_delay_secs: non_empty("NICIND_DOWNLOAD_DELAY_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3),
            siboif_ca_cert: non_empty("SIBOIF_CA_CERT").map(PathBuf::from),
            database: DatabaseConfig {
                server: non_empty("DB_SERVER"),
                port: non_empty("DB_PORT"),
                name: non_empty("DB_NAME"),
                user: non_empty("DB_USER"),
                password: lookup("DB_PASSWORD"),
            },
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            download_delay: Duration::from_secs(self.download_delay_secs),
            extra_root_certificate: self.siboif_ca_cert.clone(),
        }
    }
}

/// What one invocation asks for.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub scope: Scope,
    /// `None` selects every source.
    pub origin: Option<Origin>,
    pub institution: Option<String>,
    pub export: Option<PathBuf>,
    pub skip_load: bool,
}

impl RunRequest {
    pub fn selected_origins(&self) -> Vec<Origin> {
        Origin::ALL
            .into_iter()
            .filter(|o| self.origin.map_or(true, |selected| selected == *o))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub records: Vec<IndicatorRecord>,
    pub per_origin: BTreeMap<Origin, usize>,
}

/// Runs the scope's entry point on each selected adapter, in source order, and concatenates.
pub async fn collect(
    adapters: &[Box<dyn SourceAdapter>],
    http: &dyn Fetch,
    ctx: &AdapterContext,
    request: &RunRequest,
) -> Result<Collected> {
    let mut collected = Collected::default();
    for origin in request.selected_origins() {
        let Some(adapter) = adapters.iter().find(|a| a.origin() == origin) else {
            continue;
        };
        let span = info_span!("collect", %origin, run_id = %ctx.run_id);
        let mut records = adapter
            .collect(http, ctx, request.scope)
            .instrument(span)
            .await
            .with_context(|| format!("collecting {origin} ({})", request.scope))?;
        if let Scope::Period(period) = request.scope {
            records.retain(|r| r.period() == period);
        }
        info!(%origin, rows = records.len(), "collected");
        collected.per_origin.insert(origin, records.len());
        collected.records.extend(records);
    }
    Ok(collected)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: String,
    pub per_origin: BTreeMap<Origin, usize>,
    pub total_records: usize,
    pub export_path: Option<String>,
    pub load: LoadOutcome,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Box<dyn Fetch>,
    adapters: Vec<Box<dyn SourceAdapter>>,
    warehouse: Option<Box<dyn Warehouse>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let adapters = Origin::ALL.into_iter().map(adapter_for_origin).collect();
        Ok(Self::with_parts(config, Box::new(http), adapters))
    }

    pub fn with_parts(
        config: SyncConfig,
        http: Box<dyn Fetch>,
        adapters: Vec<Box<dyn SourceAdapter>>,
    ) -> Self {
        Self {
            config,
            http,
            adapters,
            warehouse: None,
        }
    }

    /// Uses `warehouse` instead of connecting with the configured database settings.
    pub fn with_warehouse(mut self, warehouse: Box<dyn Warehouse>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    pub async fn run_once(&self, request: &RunRequest) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let ctx = AdapterContext::new(ArtifactStore::new(self.config.files_dir.clone()))
            .with_institution(request.institution.clone());
        let run_id = ctx.run_id;
        let span = info_span!("sync_run", %run_id, scope = %request.scope);

        async {
            info!(origins = ?request.selected_origins(), "run started");
            let collected = collect(&self.adapters, self.http.as_ref(), &ctx, request).await?;

            if let Some(path) = &request.export {
                export_parquet(path, &collected.records)?;
                info!(path = %path.display(), rows = collected.records.len(), "exported parquet");
            }

            let load = if request.skip_load {
                LoadOutcome::Skipped
            } else {
                self.load(&collected.records).await?
            };

            let summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                scope: request.scope.to_string(),
                total_records: collected.records.len(),
                per_origin: collected.per_origin,
                export_path: request.export.as_ref().map(|p| p.display().to_string()),
                load,
            };
            info!(total = summary.total_records, load = ?summary.load, "run finished");
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn load(&self, records: &[IndicatorRecord]) -> Result<LoadOutcome> {
        if let Some(warehouse) = &self.warehouse {
            return Ok(load_and_refresh(warehouse.as_ref(), records).await?);
        }
        let options = self
            .config
            .database
            .connect_options()
            .context("database settings")?;
        let warehouse = PgWarehouse::connect(options).await?;
        Ok(load_and_refresh(&warehouse, records).await?)
    }
}

pub async fn run_from_env(request: &RunRequest) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once(request).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use nicind_adapters::AdapterError;
    use nicind_core::{latest_per_indicator, Period};
    use nicind_storage::FixtureFetch;
    use tempfile::tempdir;

    use super::warehouse::fake::RecordingWarehouse;
    use super::*;

    /// Serves a fixed record set; `period` deliberately ignores its argument.
    struct FakeAdapter {
        origin: Origin,
        records: Vec<IndicatorRecord>,
    }

    #[async_trait]
    impl SourceAdapter for FakeAdapter {
        fn origin(&self) -> Origin {
            self.origin
        }

        async fn all_periods(
            &self,
            _http: &dyn Fetch,
            _ctx: &AdapterContext,
        ) -> Result<Vec<IndicatorRecord>, AdapterError> {
            Ok(self.records.clone())
        }

        async fn last_period(
            &self,
            _http: &dyn Fetch,
            _ctx: &AdapterContext,
        ) -> Result<Vec<IndicatorRecord>, AdapterError> {
            Ok(latest_per_indicator(&self.records))
        }

        async fn period(
            &self,
            _http: &dyn Fetch,
            _ctx: &AdapterContext,
            _period: Period,
        ) -> Result<Vec<IndicatorRecord>, AdapterError> {
            Ok(self.records.clone())
        }
    }

    fn period(year: i32, month: u32) -> Period {
        Period::new(year, month).expect("period")
    }

    fn fake_sources() -> Vec<Box<dyn SourceAdapter>> {
        let bcn = FakeAdapter {
            origin: Origin::Bcn,
            records: vec![
                IndicatorRecord::national(Origin::Bcn, "Remesas mensuales", period(2024, 2), 4.0e8),
                IndicatorRecord::national(Origin::Bcn, "Remesas mensuales", period(2024, 3), 4.5e8),
            ],
        };
        let siboif = FakeAdapter {
            origin: Origin::Siboif,
            records: vec![
                IndicatorRecord::new(Origin::Siboif, "BANPRO", "ACTIVO", period(2024, 3), 1.2e8),
                IndicatorRecord::new(Origin::Siboif, "BANPRO", "ACTIVO", period(2023, 12), 1.1e8),
            ],
        };
        let conami = FakeAdapter {
            origin: Origin::Conami,
            records: vec![IndicatorRecord::new(
                Origin::Conami,
                "FUNDENUSE",
                "ACTIVO",
                period(2024, 1),
                1500.0,
            )],
        };
        // registration order differs from processing order on purpose
        vec![Box::new(conami), Box::new(siboif), Box::new(bcn)]
    }

    fn pipeline(files_dir: PathBuf) -> SyncPipeline {
        let config = SyncConfig::from_lookup(|key| {
            (key == "NICIND_FILES_DIR").then(|| files_dir.display().to_string())
        });
        SyncPipeline::with_parts(config, Box::new(FixtureFetch::new(|_| None)), fake_sources())
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(ArtifactStore::new(std::env::temp_dir()))
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.files_dir, PathBuf::from("./files"));
        assert_eq!(config.http_timeout_secs, 60);
        assert_eq!(config.download_delay_secs, 3);
        assert_eq!(config.siboif_ca_cert, None);
        assert_eq!(
            config.database.connect_options().unwrap_err(),
            ConfigError::Missing("DB_SERVER")
        );

        let env: HashMap<&str, &str> = HashMap::from([
            ("NICIND_DOWNLOAD_DELAY_SECS", "0"),
            ("NICIND_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("SIBOIF_CA_CERT", "/etc/nicind/siboif_chain.crt"),
            ("DB_SERVER", "warehouse.local"),
            ("DB_NAME", "indicadores"),
            ("DB_USER", "etl"),
            ("DB_PASSWORD", "secret"),
            ("DB_PORT", "x"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.download_delay_secs, 0);
        assert_eq!(config.http_timeout_secs, 60);
        assert_eq!(
            config.http_client_config().extra_root_certificate,
            Some(PathBuf::from("/etc/nicind/siboif_chain.crt"))
        );
        assert!(matches!(
            config.database.connect_options(),
            Err(ConfigError::Invalid { key: "DB_PORT", .. })
        ));
    }

    #[test]
    fn origin_selection_follows_processing_order() {
        let all = RunRequest::default();
        assert_eq!(all.selected_origins(), Origin::ALL.to_vec());
        let one = RunRequest {
            origin: Some(Origin::Conami),
            ..Default::default()
        };
        assert_eq!(one.selected_origins(), vec![Origin::Conami]);
    }

    #[tokio::test]
    async fn origin_filtered_aggregation_matches_the_adapter() {
        let adapters = fake_sources();
        let http = FixtureFetch::new(|_| None);
        let ctx = ctx();
        let request = RunRequest {
            scope: Scope::AllPeriods,
            origin: Some(Origin::Siboif),
            ..Default::default()
        };

        let collected = collect(&adapters, &http, &ctx, &request).await.expect("collect");
        let direct = adapters[1].all_periods(&http, &ctx).await.expect("direct");

        assert_eq!(collected.records, direct);
        assert_eq!(collected.per_origin, BTreeMap::from([(Origin::Siboif, 2)]));
    }

    #[tokio::test]
    async fn aggregation_concatenates_in_source_order() {
        let adapters = fake_sources();
        let http = FixtureFetch::new(|_| None);
        let request = RunRequest {
            scope: Scope::AllPeriods,
            ..Default::default()
        };

        let collected = collect(&adapters, &http, &ctx(), &request).await.expect("collect");
        let origins: Vec<Origin> = collected.records.iter().map(|r| r.origin).collect();

        assert_eq!(
            origins,
            vec![Origin::Bcn, Origin::Bcn, Origin::Siboif, Origin::Siboif, Origin::Conami]
        );
    }

    #[tokio::test]
    async fn explicit_period_keeps_only_that_period() {
        let adapters = fake_sources();
        let http = FixtureFetch::new(|_| None);
        let request = RunRequest {
            scope: "202403".parse().expect("scope"),
            ..Default::default()
        };

        let collected = collect(&adapters, &http, &ctx(), &request).await.expect("collect");

        assert_eq!(collected.records.len(), 2);
        assert!(collected.records.iter().all(|r| (r.year, r.month) == (2024, 3)));
        assert_eq!(collected.per_origin.get(&Origin::Conami), Some(&0));
    }

    #[tokio::test]
    async fn run_loads_and_summarises() {
        let dir = tempdir().expect("tempdir");
        let export = dir.path().join("run.parquet");
        let warehouse = std::sync::Arc::new(RecordingWarehouse::default());
        let pipeline = pipeline(dir.path().join("files"))
            .with_warehouse(Box::new(SharedWarehouse(warehouse.clone())));
        let request = RunRequest {
            scope: Scope::LastPeriod,
            export: Some(export.clone()),
            ..Default::default()
        };

        let summary = pipeline.run_once(&request).await.expect("run");

        assert_eq!(summary.scope, "ultimo");
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.per_origin.get(&Origin::Bcn), Some(&1));
        assert_eq!(summary.load, LoadOutcome::Loaded { rows: 3 });
        assert!(export.exists());
        assert_eq!(
            warehouse.calls(),
            vec!["replace:3".to_string(), "refresh".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_run_skips_insert_and_refresh() {
        let dir = tempdir().expect("tempdir");
        let warehouse = std::sync::Arc::new(RecordingWarehouse::default());
        let pipeline = pipeline(dir.path().to_path_buf())
            .with_warehouse(Box::new(SharedWarehouse(warehouse.clone())));
        let request = RunRequest {
            scope: Scope::Period(period(2010, 1)),
            ..Default::default()
        };

        let summary = pipeline.run_once(&request).await.expect("run");

        assert_eq!(summary.total_records, 0);
        assert_eq!(summary.load, LoadOutcome::NothingLoaded);
        assert_eq!(warehouse.calls(), vec!["truncate".to_string()]);
    }

    #[tokio::test]
    async fn skip_load_never_touches_the_warehouse() {
        let dir = tempdir().expect("tempdir");
        let warehouse = std::sync::Arc::new(RecordingWarehouse::default());
        let pipeline = pipeline(dir.path().to_path_buf())
            .with_warehouse(Box::new(SharedWarehouse(warehouse.clone())));
        let request = RunRequest {
            skip_load: true,
            ..Default::default()
        };

        let summary = pipeline.run_once(&request).await.expect("run");

        assert_eq!(summary.load, LoadOutcome::Skipped);
        assert!(warehouse.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_fails_the_run() {
        let dir = tempdir().expect("tempdir");
        let warehouse = RecordingWarehouse {
            fail_refresh: true,
            ..Default::default()
        };
        let pipeline = pipeline(dir.path().to_path_buf()).with_warehouse(Box::new(warehouse));

        let err = pipeline.run_once(&RunRequest::default()).await.unwrap_err();
        assert!(format!("{err:#}").contains("dw.usp_fill_ft_valor"));
    }

    #[tokio::test]
    async fn loading_without_database_settings_is_a_config_error() {
        let dir = tempdir().expect("tempdir");
        let err = pipeline(dir.path().to_path_buf())
            .run_once(&RunRequest::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("DB_SERVER"));
    }

    /// Lets a test keep a handle on the warehouse it hands to the pipeline.
    struct SharedWarehouse(std::sync::Arc<RecordingWarehouse>);

    #[async_trait]
    impl Warehouse for SharedWarehouse {
        async fn truncate_staging(&self) -> Result<(), LoadError> {
            self.0.truncate_staging().await
        }

        async fn replace_staging(&self, records: &[IndicatorRecord]) -> Result<u64, LoadError> {
            self.0.replace_staging(records).await
        }

        async fn refresh(&self) -> Result<(), LoadError> {
            self.0.refresh().await
        }
    }
}
