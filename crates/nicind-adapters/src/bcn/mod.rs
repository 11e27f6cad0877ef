//! Banco Central de Nicaragua: a fixed set of spreadsheets downloaded whole on every run.

use async_trait::async_trait;
use nicind_core::{latest_per_indicator, IndicatorRecord, Origin, Period};
use nicind_storage::{Fetch, FetchRequest};
use tracing::{info, info_span, Instrument};

use crate::{download_workbook, AdapterContext, AdapterError, SourceAdapter};

pub mod reports;

pub use reports::{BcnReport, REPORTS};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36 Edg/129.0.0.0";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,es;q=0.8";
const REFERER: &str = "https://www.bcn.gob.ni/publicaciones/sector-externo";

/// The site rejects bare clients, so downloads look like a browser and are spaced out.
pub fn report_request(report: &BcnReport) -> FetchRequest {
    FetchRequest::get(report.url)
        .header("User-Agent", BROWSER_USER_AGENT)
        .header("Accept-Language", ACCEPT_LANGUAGE)
        .header("Referer", REFERER)
        .throttled()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BcnAdapter;

#[async_trait]
impl SourceAdapter for BcnAdapter {
    fn origin(&self) -> Origin {
        Origin::Bcn
    }

    async fn all_periods(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let mut records = Vec::new();
        for report in &REPORTS {
            let span = info_span!("bcn_report", report = report.name, run_id = %ctx.run_id);
            let parsed = async {
                info!("processing report");
                let request = report_request(report);
                let Some(workbook) =
                    download_workbook(http, ctx, Origin::Bcn, &request, report.file_name).await?
                else {
                    return Ok::<_, AdapterError>(Vec::new());
                };
                let rows = (report.parse)(&workbook)?;
                info!(rows = rows.len(), "parsed report");
                Ok(rows)
            }
            .instrument(span)
            .await?;
            records.extend(parsed);
        }
        Ok(records)
    }

    async fn last_period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let all = self.all_periods(http, ctx).await?;
        Ok(latest_per_indicator(&all))
    }

    async fn period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
        period: Period,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let mut records = self.all_periods(http, ctx).await?;
        records.retain(|r| r.period() == period);
        Ok(records)
    }
}
