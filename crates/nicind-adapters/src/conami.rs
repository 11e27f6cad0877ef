//! Comisión Nacional de Microfinanzas: an HTML report page lists the published periods,
//! and each period's statement of financial position is a workbook behind a form POST.

use async_trait::async_trait;
use nicind_core::{month_from_name, IndicatorRecord, Origin, Period};
use nicind_storage::{Fetch, FetchRequest};
use scraper::{Html, Selector};
use tracing::{info, info_span, warn, Instrument};

use crate::grid::Workbook;
use crate::{
    download_workbook, fetch_or_none, AdapterContext, AdapterError, SourceAdapter,
    FINANCIAL_POSITION_ACCOUNTS,
};

pub const REPORT_URL: &str = "http://www.conami.gob.ni/index.php/est-reportes";
const REPORT_NAME: &str = "/RptEstadisticas/RptEstadoSituacion";
const REPORT_TITLE: &str = "Estado de Situación Financiera";
const REPORT_CATEGORY: &str = "Reportes Contables";
const PERIOD_OPTIONS: &str = r#"form#reportForm select[name="Periodo"] option"#;
const ACCOUNT_COLUMN: &str = "Descripcion de Cuenta";
const TOTAL_COLUMN: &str = "Total";
const HEADER_ROW: usize = 9;

/// A published period and the opaque identifier the report form expects for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: i64,
    pub period: Period,
}

fn with_report_query(request: FetchRequest) -> FetchRequest {
    request
        .query("reportName", REPORT_NAME)
        .query("tituloreport", REPORT_TITLE)
        .query("cat", REPORT_CATEGORY)
}

pub fn catalog_request() -> FetchRequest {
    with_report_query(FetchRequest::get(REPORT_URL))
}

pub fn statement_request(id: i64) -> FetchRequest {
    let form = [
        ("Periodo", id.to_string()),
        ("exportSelect", "EXCEL".to_string()),
        ("parameters", "false".to_string()),
        ("exportName", "Reporte".to_string()),
        ("reportName", REPORT_NAME.to_string()),
    ];
    with_report_query(FetchRequest::post_form(REPORT_URL, form)).throttled()
}

/// Reads the period selector. Options read like `Marzo - 2024`; anything else is skipped.
pub fn parse_catalog(html: &str) -> Result<Vec<CatalogEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse(PERIOD_OPTIONS).map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut entries = Vec::new();
    for option in document.select(&sel) {
        let text: String = option
            .text()
            .collect::<String>()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let value = option.value().attr("value").unwrap_or_default();
        match catalog_entry(&text, value) {
            Some(entry) => entries.push(entry),
            None => warn!(option = %text, value, "skipping unrecognised period option"),
        }
    }
    Ok(entries)
}

fn catalog_entry(text: &str, value: &str) -> Option<CatalogEntry> {
    let (month_name, year) = text.split_once('-')?;
    let month = month_from_name(month_name)?;
    let year = year.parse::<i32>().ok()?;
    let id = value.trim().parse::<i64>().ok()?;
    let period = Period::new(year, month).ok()?;
    Some(CatalogEntry { id, period })
}

/// The most recently published entry is the one with the highest identifier.
pub fn latest_entry(entries: &[CatalogEntry]) -> Option<CatalogEntry> {
    entries.iter().max_by_key(|e| e.id).copied()
}

pub fn entry_for(entries: &[CatalogEntry], period: Period) -> Option<CatalogEntry> {
    entries.iter().find(|e| e.period == period).copied()
}

/// Turns the statement's account × institution matrix into records for `period`.
pub fn parse_financial_position(
    workbook: &Workbook,
    period: Period,
    ctx: &AdapterContext,
) -> Result<Vec<IndicatorRecord>, AdapterError> {
    const REPORT: &str = "EstadoSituacionFinanciera";
    let Some((_, grid)) = workbook.sheets().first() else {
        return Ok(Vec::new());
    };
    if grid.height() <= HEADER_ROW + 1 {
        return Ok(Vec::new());
    }
    let table = grid.table(HEADER_ROW).drop_empty_columns().drop_empty_rows();
    if table.rows().is_empty() {
        return Ok(Vec::new());
    }
    let account_col = table.require_column(ACCOUNT_COLUMN, REPORT)?;

    let accounts: Vec<(usize, String)> = table
        .rows()
        .iter()
        .enumerate()
        .filter_map(|(idx, row)| {
            let account = row[account_col].as_text()?.to_uppercase();
            FINANCIAL_POSITION_ACCOUNTS
                .contains(&account.as_str())
                .then_some((idx, account))
        })
        .collect();

    let mut records = Vec::new();
    for (col, name) in table.columns().iter().enumerate() {
        let institution = name.trim().to_uppercase();
        if col == account_col
            || institution.is_empty()
            || institution.eq_ignore_ascii_case(TOTAL_COLUMN)
            || !ctx.institution_matches(&institution)
        {
            continue;
        }
        for (idx, account) in &accounts {
            if let Some(value) = table.rows()[*idx][col].as_f64() {
                records.push(IndicatorRecord::new(
                    Origin::Conami,
                    institution.clone(),
                    account.clone(),
                    period,
                    value,
                ));
            }
        }
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConamiAdapter;

impl ConamiAdapter {
    async fn catalog(&self, http: &dyn Fetch) -> Result<Vec<CatalogEntry>, AdapterError> {
        let Some(body) = fetch_or_none(http, Origin::Conami, &catalog_request()).await? else {
            return Ok(Vec::new());
        };
        let entries = parse_catalog(&String::from_utf8_lossy(&body))?;
        info!(entries = entries.len(), "read period catalog");
        Ok(entries)
    }

    async fn statement(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
        entry: CatalogEntry,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let span = info_span!("conami_period", period = %entry.period, id = entry.id, run_id = %ctx.run_id);
        async {
            info!("processing period");
            let file_name = format!("EstadoSituacionFinanciera_{}.xls", entry.id);
            let request = statement_request(entry.id);
            let Some(workbook) =
                download_workbook(http, ctx, Origin::Conami, &request, &file_name).await?
            else {
                return Ok(Vec::new());
            };
            let records = parse_financial_position(&workbook, entry.period, ctx)?;
            info!(rows = records.len(), "parsed statement");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl SourceAdapter for ConamiAdapter {
    fn origin(&self) -> Origin {
        Origin::Conami
    }

    async fn all_periods(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let mut records = Vec::new();
        for entry in self.catalog(http).await? {
            records.extend(self.statement(http, ctx, entry).await?);
        }
        Ok(records)
    }

    async fn last_period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let catalog = self.catalog(http).await?;
        let Some(entry) = latest_entry(&catalog) else {
            info!("no published periods");
            return Ok(Vec::new());
        };
        info!(period = %entry.period, "latest published period");
        self.statement(http, ctx, entry).await
    }

    async fn period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
        period: Period,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let catalog = self.catalog(http).await?;
        let Some(entry) = entry_for(&catalog, period) else {
            info!(%period, "period not published");
            return Ok(Vec::new());
        };
        self.statement(http, ctx, entry).await
    }
}
