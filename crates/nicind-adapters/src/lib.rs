//! Source adapter contracts + the BCN, CONAMI and SIBOIF implementations.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use nicind_core::{IndicatorRecord, Origin, Period, Scope};
use nicind_storage::{ArtifactStore, Fetch, FetchError, FetchRequest};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod bcn;
pub mod conami;
pub mod grid;
pub mod siboif;

pub use bcn::BcnAdapter;
pub use conami::ConamiAdapter;
pub use grid::{Cell, Grid, Table, Workbook};
pub use siboif::SiboifAdapter;

pub const CRATE_NAME: &str = "nicind-adapters";

/// Balance-sheet headings kept from the financial position statements.
pub const FINANCIAL_POSITION_ACCOUNTS: [&str; 3] = ["ACTIVO", "PASIVO", "PATRIMONIO"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading workbook {path}: {source}")]
    Workbook {
        path: String,
        #[source]
        source: calamine::Error,
    },
    #[error("unexpected layout in {report}: {detail}")]
    Layout { report: String, detail: String },
    #[error("decoding response: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Reference date for "previous month" probing and forward scans.
    pub today: NaiveDate,
    pub artifacts: ArtifactStore,
    /// Institution name filter (case-insensitive), applied to institution-level sources.
    pub institution: Option<String>,
}

impl AdapterContext {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            today: Local::now().date_naive(),
            artifacts,
            institution: None,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn with_institution(mut self, institution: Option<String>) -> Self {
        self.institution = institution
            .map(|i| i.trim().to_uppercase())
            .filter(|i| !i.is_empty());
        self
    }

    pub fn institution_matches(&self, institution: &str) -> bool {
        self.institution
            .as_deref()
            .map(|wanted| institution.trim().eq_ignore_ascii_case(wanted))
            .unwrap_or(true)
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn origin(&self) -> Origin;

    /// Full published history.
    async fn all_periods(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError>;

    /// Most recent published period only.
    async fn last_period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError>;

    /// Exactly `period`; empty when the source has nothing for it.
    async fn period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
        period: Period,
    ) -> Result<Vec<IndicatorRecord>, AdapterError>;

    async fn collect(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
        scope: Scope,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        match scope {
            Scope::AllPeriods => self.all_periods(http, ctx).await,
            Scope::LastPeriod => self.last_period(http, ctx).await,
            Scope::Period(period) => self.period(http, ctx, period).await,
        }
    }
}

pub fn adapter_for_origin(origin: Origin) -> Box<dyn SourceAdapter> {
    match origin {
        Origin::Bcn => Box::new(BcnAdapter),
        Origin::Siboif => Box::new(SiboifAdapter::default()),
        Origin::Conami => Box::new(ConamiAdapter),
    }
}

/// Sends `request`; a non-success status is logged and reported as "no data".
pub(crate) async fn fetch_or_none(
    http: &dyn Fetch,
    origin: Origin,
    request: &FetchRequest,
) -> Result<Option<Vec<u8>>, AdapterError> {
    match http.fetch(request).await {
        Ok(response) => Ok(Some(response.body)),
        Err(FetchError::HttpStatus { status, url }) => {
            warn!(%origin, status, %url, "non-success response, treating as no data");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Downloads a workbook into the artifact store (replacing the previous copy) and opens it.
pub(crate) async fn download_workbook(
    http: &dyn Fetch,
    ctx: &AdapterContext,
    origin: Origin,
    request: &FetchRequest,
    file_name: &str,
) -> Result<Option<Workbook>, AdapterError> {
    let Some(body) = fetch_or_none(http, origin, request).await? else {
        return Ok(None);
    };
    let stored = ctx.artifacts.store_bytes(origin.code(), file_name, &body).await?;
    info!(
        %origin,
        run_id = %ctx.run_id,
        path = %stored.relative_path.display(),
        sha256 = %stored.content_hash,
        bytes = stored.byte_size,
        "downloaded source file"
    );
    let path = stored.absolute_path;
    let workbook = tokio::task::spawn_blocking(move || Workbook::open(&path))
        .await
        .map_err(anyhow::Error::from)??;
    Ok(Some(workbook))
}
