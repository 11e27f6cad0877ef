//! Superintendencia de Bancos: a JSON service queried one month at a time.
//!
//! There is no catalog of published months, so the latest period is found by probing
//! backwards from the month before today and the full history by scanning forward.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use nicind_core::{BackwardMonths, IndicatorRecord, Origin, Period};
use nicind_storage::{Fetch, FetchRequest};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, Instrument};

use crate::{fetch_or_none, AdapterContext, AdapterError, SourceAdapter, FINANCIAL_POSITION_ACCOUNTS};

pub const SERVICE_URL: &str = "https://www.siboif.gob.ni/rest/estadisticas";
/// Oldest year the service has data for.
pub const MIN_YEAR: i32 = 2017;
const SUPERVISED_SECTOR: &str = "Bancos";
const REPORT_TYPE: &str = "Estado de Situación Financiera (ESF)";
/// System-wide totals published alongside the individual banks.
const AGGREGATE_INSTITUTIONS: [&str; 3] = ["SFB", "SF", "SFN"];

#[derive(Debug, Clone, Deserialize)]
pub struct StatisticRow {
    #[serde(rename = "fecha", default)]
    pub date: Option<String>,
    #[serde(rename = "institucion", default)]
    pub institution: Option<String>,
    #[serde(rename = "variable_1", default)]
    pub variable: Option<String>,
    #[serde(rename = "valor_1", default)]
    pub value: JsonValue,
}

impl StatisticRow {
    fn numeric_value(&self) -> Option<f64> {
        let value = match &self.value {
            JsonValue::Number(n) => n.as_f64()?,
            JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
            _ => return None,
        };
        value.is_finite().then_some(value)
    }

    fn period(&self) -> Option<Period> {
        let date = self.date.as_deref()?.get(..10)?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .ok()
            .map(Period::from_date)
    }
}

/// Both ends of the date range are the last day of the month.
pub fn period_request(period: Period) -> FetchRequest {
    let date = period.last_day().format("%Y-%m-%d").to_string();
    FetchRequest::get(SERVICE_URL)
        .query("intendencia", SUPERVISED_SECTOR)
        .query("fecha[min]", date.clone())
        .query("fecha[max]", date)
        .query("tipo_reporte", REPORT_TYPE)
}

/// Balance-sheet totals per bank. Rows dated unreadably fall back to the queried period.
pub fn parse_statistics(
    body: &[u8],
    queried: Period,
    ctx: &AdapterContext,
) -> Result<Vec<IndicatorRecord>, AdapterError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let rows: Option<Vec<StatisticRow>> = serde_json::from_slice(body)?;

    let mut records = Vec::new();
    for row in rows.unwrap_or_default() {
        let (Some(institution), Some(variable)) =
            (row.institution.as_deref(), row.variable.as_deref())
        else {
            debug!(date = ?row.date, "skipping row without institution or variable");
            continue;
        };
        let institution = institution.trim().to_uppercase();
        let variable = variable.trim().to_uppercase();
        if institution.is_empty()
            || AGGREGATE_INSTITUTIONS.contains(&institution.as_str())
            || !FINANCIAL_POSITION_ACCOUNTS.contains(&variable.as_str())
            || !ctx.institution_matches(&institution)
        {
            continue;
        }
        let Some(value) = row.numeric_value() else {
            debug!(institution = %institution, variable = %variable, "skipping non-numeric value");
            continue;
        };
        let period = row.period().unwrap_or(queried);
        records.push(IndicatorRecord::new(Origin::Siboif, institution, variable, period, value));
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy)]
pub struct SiboifAdapter {
    min_year: i32,
}

impl Default for SiboifAdapter {
    fn default() -> Self {
        Self { min_year: MIN_YEAR }
    }
}

impl SiboifAdapter {
    pub fn with_min_year(min_year: i32) -> Self {
        Self { min_year }
    }

    /// Unfiltered "does the service have this month" check plus the filtered rows.
    async fn fetch_period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
        period: Period,
    ) -> Result<(bool, Vec<IndicatorRecord>), AdapterError> {
        let span = info_span!("siboif_period", %period, run_id = %ctx.run_id);
        async {
            let Some(body) = fetch_or_none(http, Origin::Siboif, &period_request(period)).await?
            else {
                return Ok((false, Vec::new()));
            };
            let unfiltered = ctx.clone().with_institution(None);
            let all = parse_statistics(&body, period, &unfiltered)?;
            let published = !all.is_empty();
            let records: Vec<IndicatorRecord> = all
                .into_iter()
                .filter(|r| ctx.institution_matches(&r.institution))
                .collect();
            debug!(published, rows = records.len(), "queried period");
            Ok((published, records))
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl SourceAdapter for SiboifAdapter {
    fn origin(&self) -> Origin {
        Origin::Siboif
    }

    /// Scans each year from the oldest supported one; a year ends at its first empty month.
    async fn all_periods(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let mut records = Vec::new();
        for year in self.min_year..=ctx.today.year() {
            for period in Period::months_of(year) {
                info!(%period, "processing period");
                let (published, rows) = self.fetch_period(http, ctx, period).await?;
                if !published {
                    info!(%period, "no data, moving to the next year");
                    break;
                }
                records.extend(rows);
            }
        }
        Ok(records)
    }

    async fn last_period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        for period in BackwardMonths::starting_before(ctx.today, self.min_year) {
            let (published, rows) = self.fetch_period(http, ctx, period).await?;
            if published {
                info!(%period, "latest published period");
                return Ok(rows);
            }
        }
        info!(min_year = self.min_year, "no published period found");
        Ok(Vec::new())
    }

    async fn period(
        &self,
        http: &dyn Fetch,
        ctx: &AdapterContext,
        period: Period,
    ) -> Result<Vec<IndicatorRecord>, AdapterError> {
        let (_, rows) = self.fetch_period(http, ctx, period).await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicind_storage::{ArtifactStore, FixtureFetch};
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture() -> Vec<u8> {
        std::fs::read(workspace_root().join("fixtures/siboif/esf_2024_03.json")).expect("fixture")
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(ArtifactStore::new(std::env::temp_dir()))
    }

    fn period(year: i32, month: u32) -> Period {
        Period::new(year, month).expect("period")
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("date")
    }

    #[test]
    fn request_uses_the_last_day_of_the_month() {
        let request = period_request(period(2024, 2));
        assert_eq!(request.url, SERVICE_URL);
        assert_eq!(request.query_value("fecha[min]"), Some("2024-02-29"));
        assert_eq!(request.query_value("fecha[max]"), Some("2024-02-29"));
        assert_eq!(request.query_value("intendencia"), Some("Bancos"));
        assert_eq!(
            request.query_value("tipo_reporte"),
            Some("Estado de Situación Financiera (ESF)")
        );
    }

    #[test]
    fn statistics_keep_bank_balance_sheet_rows() {
        let records = parse_statistics(&fixture(), period(2024, 3), &ctx()).expect("parse");

        let rows: Vec<(&str, &str, f64)> = records
            .iter()
            .map(|r| (r.institution.as_str(), r.indicator.as_str(), r.value))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("BANPRO", "ACTIVO", 120_500_000.5),
                ("BANPRO", "PASIVO", 98_250_000.0),
                ("LAFISE", "PATRIMONIO", 22_250_000.0),
                ("BDF", "ACTIVO", 33_000_000.0),
            ]
        );
        assert!(records
            .iter()
            .all(|r| r.origin == Origin::Siboif && r.period() == period(2024, 3)));
    }

    #[test]
    fn statistics_filter_by_institution() {
        let ctx = ctx().with_institution(Some("banpro".to_string()));
        let records = parse_statistics(&fixture(), period(2024, 3), &ctx).expect("parse");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.institution == "BANPRO"));
    }

    #[test]
    fn empty_and_null_bodies_have_no_rows() {
        let bodies: [&[u8]; 4] = [b"", b"  \n", b"null", b"[]"];
        for body in bodies {
            let records = parse_statistics(body, period(2024, 3), &ctx()).expect("parse");
            assert!(records.is_empty());
        }
        assert!(parse_statistics(b"<html>", period(2024, 3), &ctx()).is_err());
    }

    #[test]
    fn rows_with_null_fields_are_skipped_not_fatal() {
        let body = br#"[
            {"fecha": "2024-03-31", "institucion": "Banpro",
             "variable_1": "Activo", "valor_1": 10.5},
            {"fecha": "2024-03-31", "institucion": null, "variable_1": "Activo", "valor_1": 3},
            {"fecha": null, "institucion": "Lafise", "variable_1": null, "valor_1": 4},
            {"fecha": null, "institucion": "Lafise", "variable_1": "Pasivo", "valor_1": null}
        ]"#;

        let records = parse_statistics(body, period(2024, 3), &ctx()).expect("parse");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].institution, "BANPRO");
        assert_eq!(records[0].value, 10.5);
    }

    #[tokio::test]
    async fn backward_scan_over_an_empty_service_stops_at_the_oldest_year() {
        let http = FixtureFetch::new(|_| Some(b"[]".to_vec()));
        let ctx = ctx().with_today(date(2018, 3, 15));

        let records = SiboifAdapter::default()
            .last_period(&http, &ctx)
            .await
            .expect("terminates");

        assert!(records.is_empty());
        let queried: Vec<String> = http
            .requests()
            .iter()
            .filter_map(|r| r.query_value("fecha[min]").map(str::to_string))
            .collect();
        assert_eq!(queried.len(), 14);
        assert_eq!(queried.first().map(String::as_str), Some("2018-02-28"));
        assert_eq!(queried.last().map(String::as_str), Some("2017-01-31"));
    }

    #[tokio::test]
    async fn backward_scan_returns_the_first_published_month() {
        let body = fixture();
        let http = FixtureFetch::new(move |req| {
            match req.query_value("fecha[min]") {
                Some("2024-03-31") => Some(body.clone()),
                _ => Some(b"[]".to_vec()),
            }
        });
        let ctx = ctx().with_today(date(2024, 6, 2));

        let records = SiboifAdapter::default().last_period(&http, &ctx).await.expect("last");

        assert_eq!(records.len(), 4);
        assert_eq!(http.requests().len(), 3);
    }

    #[tokio::test]
    async fn institution_filter_does_not_extend_the_backward_scan() {
        let body = fixture();
        let http = FixtureFetch::new(move |req| {
            (req.query_value("fecha[min]") == Some("2024-03-31")).then(|| body.clone())
        });
        let ctx = ctx()
            .with_today(date(2024, 4, 10))
            .with_institution(Some("NO SUCH BANK".to_string()));

        let records = SiboifAdapter::default().last_period(&http, &ctx).await.expect("last");

        assert!(records.is_empty());
        assert_eq!(http.requests().len(), 1);
    }

    #[tokio::test]
    async fn forward_scan_moves_on_after_the_first_empty_month() {
        let template = String::from_utf8(fixture()).expect("utf8 fixture");
        let http = FixtureFetch::new(move |req| {
            let date = req.query_value("fecha[min]")?;
            (date == "2017-01-31" || date == "2017-02-28" || date == "2018-01-31")
                .then(|| template.replace("2024-03-31", date).into_bytes())
        });
        let ctx = ctx().with_today(date(2018, 5, 1));

        let records = SiboifAdapter::default().all_periods(&http, &ctx).await.expect("all");

        // three published months, four records each
        assert_eq!(records.len(), 12);
        let mut periods: Vec<Period> = records.iter().map(IndicatorRecord::period).collect();
        periods.dedup();
        assert_eq!(periods, vec![period(2017, 1), period(2017, 2), period(2018, 1)]);
        // 2017: Jan, Feb, Mar (empty); 2018: Jan, Feb (empty)
        assert_eq!(http.requests().len(), 5);
    }
}
