//! Parsers for the central bank's published spreadsheets. Every figure is published in
//! millions of dollars and every record is a country-level aggregate.

use nicind_core::{
    month_from_abbreviation, month_from_name, quarter_end_month, IndicatorRecord, Origin, Period,
    MILLIONS,
};
use tracing::debug;

use crate::grid::{Cell, Grid, Workbook};
use crate::AdapterError;

pub type ReportParser = fn(&Workbook) -> Result<Vec<IndicatorRecord>, AdapterError>;

/// One downloadable report: where it lives, the file it is cached as and how to read it.
#[derive(Debug, Clone, Copy)]
pub struct BcnReport {
    pub name: &'static str,
    pub url: &'static str,
    pub file_name: &'static str,
    pub parse: ReportParser,
}

/// Download + processing order.
pub const REPORTS: [BcnReport; 6] = [
    BcnReport {
        name: "Ingresos brutos y flujos netos de IED",
        url: "https://www.bcn.gob.ni/sites/default/files/estadisticas/sector_real/IED/IBIED.xlsx",
        file_name: "IED.xlsx",
        parse: parse_foreign_direct_investment,
    },
    BcnReport {
        name: "Balanza de pagos",
        url: "https://www.bcn.gob.ni/sites/default/files/estadisticas/sector_externo/balanza_pagos/MBP6_(2006).xls",
        file_name: "BPCC.xls",
        parse: parse_balance_of_payments,
    },
    BcnReport {
        name: "Remesas mensuales",
        url: "https://www.bcn.gob.ni/sites/default/files/estadisticas/siec/datos/remesas.xls",
        file_name: "REMESAS.xls",
        parse: parse_remittances,
    },
    BcnReport {
        name: "Deuda externa total",
        url: "https://www.bcn.gob.ni/sites/default/files/estadisticas/sector_externo/deuda_externa/cuadros_DET.xlsx",
        file_name: "DET.xlsx",
        parse: parse_external_debt,
    },
    BcnReport {
        name: "Índices de precios de exportación tipo Fisher",
        url: "https://www.bcn.gob.ni/sites/default/files/estadisticas/comercio_exterior/indices_comercio/6-25.xls",
        file_name: "IPE.xls",
        parse: parse_export_price_index,
    },
    BcnReport {
        name: "Exportaciones FOB: mercancías por sector económico",
        url: "https://www.bcn.gob.ni/sites/default/files/estadisticas/comercio_exterior/exportaciones/6-3b.xls",
        file_name: "Exportaciones.xls",
        parse: parse_exports_by_sector,
    },
];

const IED_INDICATOR_PREFIX: &str = "Inversión Extranjera Directa - ";
const BALANCE_INDICATOR_PREFIX: &str = "Balanza de pagos - ";
const CURRENT_ACCOUNT: &str = "Cuenta corriente";
const REMITTANCES_INDICATOR: &str = "Remesas mensuales";
const DEBT_CONCEPT: &str = "Gobierno General";
const DEBT_INDICATOR: &str = "Deuda Externa Total - Gobierno General";
const PRICE_INDEX_CONCEPT: &str = "Producción Agropecuaria";
const PRICE_INDEX_INDICATOR: &str =
    "Índices de precios de exportación tipo Fisher - Producción Agropecuaria";
const EXPORTS_COLUMN: &str = "Agropecuarios";
const EXPORTS_INDICATOR: &str = "Exportaciones - Agropecuarios";
/// Export rows before this year are annual totals without a month label.
const EXPORTS_MONTHLY_FROM: i32 = 2006;

fn national(indicator: impl Into<String>, period: Period, value: f64) -> IndicatorRecord {
    IndicatorRecord::national(Origin::Bcn, indicator, period, value * MILLIONS)
}

fn year_of(cell: &Cell) -> Option<i32> {
    let value = cell.as_f64()?;
    (value.fract() == 0.0).then_some(value as i32)
}

/// Quarterly FDI flows: `Año` | `Trimestre` | one column per measure.
pub fn parse_foreign_direct_investment(
    workbook: &Workbook,
) -> Result<Vec<IndicatorRecord>, AdapterError> {
    const REPORT: &str = "IED";
    let table = workbook
        .first_sheet(REPORT)?
        .table(4)
        .drop_empty_columns()
        .drop_empty_rows();
    let year_col = table.require_column("Año", REPORT)?;
    let quarter_col = table.require_column("Trimestre", REPORT)?;

    let mut periods = Vec::new();
    let mut year = None;
    for (idx, row) in table.rows().iter().enumerate() {
        let Some(label) = row[quarter_col].as_text() else {
            continue;
        };
        if let Some(y) = year_of(&row[year_col]) {
            year = Some(y);
        }
        let Some(y) = year else { continue };
        let Some(month) = quarter_end_month(label.replace("Trim", "").trim()) else {
            debug!(report = REPORT, label = %label, "unrecognised quarter label");
            continue;
        };
        if let Ok(period) = Period::new(y, month) {
            periods.push((idx, period));
        }
    }

    let mut records = Vec::new();
    for (col, name) in table.columns().iter().enumerate() {
        if col == year_col || col == quarter_col || name.trim().is_empty() {
            continue;
        }
        let indicator = format!("{IED_INDICATOR_PREFIX}{}", name.trim());
        for (idx, period) in &periods {
            if let Some(value) = table.rows()[*idx][col].as_f64() {
                records.push(national(indicator.clone(), *period, value));
            }
        }
    }
    Ok(records)
}

/// `"IV Trim 23"` / `"IV Trim 2023"` → quarter-end period.
fn quarter_column_period(header: &str) -> Option<Period> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() != 3 || parts[1] != "Trim" {
        return None;
    }
    let month = quarter_end_month(parts[0])?;
    let suffix = parts[2];
    let year = if suffix.len() > 2 {
        suffix.parse::<i32>().ok()?
    } else {
        2000 + suffix.parse::<i32>().ok()?
    };
    Period::new(year, month).ok()
}

/// Current account balance by quarter; annual columns and zero cells are left out.
pub fn parse_balance_of_payments(
    workbook: &Workbook,
) -> Result<Vec<IndicatorRecord>, AdapterError> {
    const REPORT: &str = "BPCC";
    let table = workbook.first_sheet(REPORT)?.table(5);
    let concept_col = table.require_column("Conceptos", REPORT)?;

    let rows: Vec<&Vec<Cell>> = table
        .rows()
        .iter()
        .filter(|row| row[concept_col].as_text().as_deref() == Some(CURRENT_ACCOUNT))
        .collect();

    let indicator = format!("{BALANCE_INDICATOR_PREFIX}{CURRENT_ACCOUNT}");
    let mut records = Vec::new();
    for (col, header) in table.columns().iter().enumerate() {
        let Some(period) = quarter_column_period(header) else {
            continue;
        };
        for row in &rows {
            match row[col].as_f64() {
                Some(value) if value != 0.0 => records.push(national(indicator.clone(), period, value)),
                _ => {}
            }
        }
    }
    Ok(records)
}

/// Monthly remittances: `Año` plus one abbreviated month column each; sorted by period.
pub fn parse_remittances(workbook: &Workbook) -> Result<Vec<IndicatorRecord>, AdapterError> {
    const REPORT: &str = "REMESAS";
    let table = workbook
        .first_sheet(REPORT)?
        .table(4)
        .drop_empty_columns()
        .drop_empty_rows();
    let year_col = table.require_column("Año", REPORT)?;
    let month_cols: Vec<(usize, u32)> = table
        .columns()
        .iter()
        .enumerate()
        .filter_map(|(col, name)| month_from_abbreviation(name).map(|m| (col, m)))
        .collect();

    let mut records = Vec::new();
    for row in table.rows() {
        let Some(year) = year_of(&row[year_col]) else {
            continue;
        };
        for (col, month) in &month_cols {
            let (Some(value), Ok(period)) = (row[*col].as_f64(), Period::new(year, *month)) else {
                continue;
            };
            records.push(national(REMITTANCES_INDICATOR, period, value));
        }
    }
    records.sort_by_key(IndicatorRecord::period);
    Ok(records)
}

/// Quarterly government external debt from sheet `C1`: years on row 4, quarters on row 5.
pub fn parse_external_debt(workbook: &Workbook) -> Result<Vec<IndicatorRecord>, AdapterError> {
    const REPORT: &str = "DET";
    let grid = workbook.sheet("C1").ok_or_else(|| AdapterError::Layout {
        report: REPORT.to_string(),
        detail: "missing sheet `C1`".to_string(),
    })?;

    let columns = debt_quarter_columns(grid);
    let mut records = Vec::new();
    for row in grid.rows_containing(DEBT_CONCEPT) {
        for (col, period) in &columns {
            if let Some(value) = grid.cell(row, *col).as_f64() {
                records.push(national(DEBT_INDICATOR, *period, value));
            }
        }
    }
    Ok(records)
}

fn debt_quarter_columns(grid: &Grid) -> Vec<(usize, Period)> {
    let mut year = None;
    let mut columns = Vec::new();
    for col in 1..grid.width() {
        if let Some(y) = grid.cell(4, col).leading_year() {
            year = Some(y);
        }
        let month = grid
            .cell(5, col)
            .as_text()
            .and_then(|label| quarter_end_month(&label));
        if let (Some(y), Some(m)) = (year, month) {
            if let Ok(period) = Period::new(y, m) {
                columns.push((col, period));
            }
        }
    }
    columns
}

/// Fisher export price index; one sheet per year, month names two rows above the values.
pub fn parse_export_price_index(
    workbook: &Workbook,
) -> Result<Vec<IndicatorRecord>, AdapterError> {
    let mut records = Vec::new();
    for (sheet, grid) in workbook.sheets() {
        let Ok(year) = sheet.trim().parse::<i32>() else {
            debug!(sheet = %sheet, "skipping non-year sheet");
            continue;
        };
        for row in grid.rows_containing(PRICE_INDEX_CONCEPT) {
            let Some(header_row) = row.checked_sub(2) else {
                continue;
            };
            for col in 1..grid.width() {
                let Some(month) = grid
                    .cell(header_row, col)
                    .as_text()
                    .and_then(|label| month_from_name(&label))
                else {
                    continue;
                };
                let (Some(value), Ok(period)) = (grid.cell(row, col).as_f64(), Period::new(year, month))
                else {
                    continue;
                };
                records.push(national(PRICE_INDEX_INDICATOR, period, value));
            }
        }
    }
    Ok(records)
}

/// Agricultural FOB exports. The first column mixes year rows and month rows.
pub fn parse_exports_by_sector(workbook: &Workbook) -> Result<Vec<IndicatorRecord>, AdapterError> {
    const REPORT: &str = "Exportaciones";
    let table = workbook
        .first_sheet(REPORT)?
        .table(4)
        .drop_empty_columns()
        .drop_empty_rows();
    let value_col = table.require_column(EXPORTS_COLUMN, REPORT)?;
    let label_col = 0;

    let mut records = Vec::new();
    let mut year = None;
    for row in table.rows() {
        let label = &row[label_col];
        if label.is_empty() {
            continue;
        }
        if let Some(y) = label.leading_year() {
            year = Some(y);
        }
        let Some(y) = year else { continue };
        let month = match label.as_text().and_then(|l| month_from_name(&l)) {
            Some(month) => month,
            None if y < EXPORTS_MONTHLY_FROM => 12,
            None => continue,
        };
        let (Some(value), Ok(period)) = (row[value_col].as_f64(), Period::new(y, month)) else {
            continue;
        };
        records.push(national(EXPORTS_INDICATOR, period, value));
    }
    Ok(records)
}
