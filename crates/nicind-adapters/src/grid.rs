//! In-memory spreadsheet model the report parsers work on.
//!
//! Cells keep their absolute sheet position: calamine ranges start at the first
//! used cell, so leading empty rows/columns are re-inserted when converting.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};

use crate::AdapterError;

static EMPTY: Cell = Cell::Empty;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Number(n) => n.is_nan(),
            Cell::Text(s) => s.trim().is_empty(),
        }
    }

    /// Numeric value; text is accepted when it parses once thousands separators are removed.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Cell::Empty => return None,
            Cell::Number(n) => *n,
            Cell::Text(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    /// Trimmed text; integral numbers render without a fractional part (`2024`, not `2024.0`).
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Number(n) if !n.is_finite() => None,
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
        }
    }

    /// Year read from the first four characters, tolerating trailing footnote marks (`2024 p/`).
    pub fn leading_year(&self) -> Option<i32> {
        let text = self.as_text()?;
        let head: String = text.chars().take(4).collect();
        let year = head.parse::<i32>().ok()?;
        (1900..=2999).contains(&year).then_some(year)
    }

    pub fn contains_ignore_case(&self, needle: &str) -> bool {
        self.as_text()
            .map(|t| t.to_lowercase().contains(&needle.to_lowercase()))
            .unwrap_or(false)
    }
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::String(s) => Cell::Text(s.clone()),
            Data::Bool(b) => Cell::Text(b.to_string()),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(_) | Data::Empty => Cell::Empty,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    rows: Vec<Vec<Cell>>,
}

impl Grid {
    pub fn new(rows: Vec<Vec<Cell>>) -> Self {
        Self { rows }
    }

    pub fn from_range(range: &Range<Data>) -> Self {
        let (start_row, start_col) = range.start().unwrap_or((0, 0));
        let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); start_row as usize];
        for source_row in range.rows() {
            let mut row = vec![Cell::Empty; start_col as usize];
            row.extend(source_row.iter().map(Cell::from));
            rows.push(row);
        }
        Self { rows }
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.iter().all(Cell::is_empty))
    }

    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY)
    }

    /// Indices of rows where any cell contains `needle`, case-insensitively.
    pub fn rows_containing(&self, needle: &str) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|c| c.contains_ignore_case(needle)))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Reads the sheet as a table whose header is `header_row`; everything above it is skipped.
    pub fn table(&self, header_row: usize) -> Table {
        let width = self.width();
        let columns = (0..width)
            .map(|col| self.cell(header_row, col).as_text().unwrap_or_default())
            .collect();
        let rows = (header_row + 1..self.height())
            .map(|row| (0..width).map(|col| self.cell(row, col).clone()).collect())
            .collect();
        Table { columns, rows }
    }
}

/// Header + data rows. Unnamed header cells are empty strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.trim() == name)
    }

    pub fn require_column(&self, name: &str, report: &str) -> Result<usize, AdapterError> {
        self.column_index(name).ok_or_else(|| AdapterError::Layout {
            report: report.to_string(),
            detail: format!("missing column `{name}`"),
        })
    }

    /// Drops columns whose data cells are all empty, whatever their header says.
    pub fn drop_empty_columns(self) -> Self {
        let keep: Vec<bool> = (0..self.columns.len())
            .map(|col| self.rows.iter().any(|row| !row[col].is_empty()))
            .collect();
        let columns = self
            .columns
            .into_iter()
            .zip(&keep)
            .filter_map(|(c, k)| k.then_some(c))
            .collect();
        let rows = self
            .rows
            .into_iter()
            .map(|row| row.into_iter().zip(&keep).filter_map(|(c, k)| k.then_some(c)).collect())
            .collect();
        Self { columns, rows }
    }

    pub fn drop_empty_rows(mut self) -> Self {
        self.rows.retain(|row| row.iter().any(|c| !c.is_empty()));
        self
    }
}

/// All sheets of a workbook, in workbook order.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: Vec<(String, Grid)>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self, AdapterError> {
        let workbook_error = |source| AdapterError::Workbook {
            path: path.display().to_string(),
            source,
        };
        let mut workbook = open_workbook_auto(path).map_err(workbook_error)?;
        let mut sheets = Vec::new();
        for name in workbook.sheet_names() {
            let range = workbook.worksheet_range(&name).map_err(workbook_error)?;
            sheets.push((name, Grid::from_range(&range)));
        }
        Ok(Self { sheets })
    }

    pub fn from_sheets(sheets: Vec<(String, Grid)>) -> Self {
        Self { sheets }
    }

    pub fn single(grid: Grid) -> Self {
        Self::from_sheets(vec![("Sheet1".to_string(), grid)])
    }

    pub fn sheets(&self) -> &[(String, Grid)] {
        &self.sheets
    }

    pub fn sheet(&self, name: &str) -> Option<&Grid> {
        self.sheets
            .iter()
            .find(|(n, _)| n.trim() == name)
            .map(|(_, g)| g)
    }

    pub fn first_sheet(&self, report: &str) -> Result<&Grid, AdapterError> {
        self.sheets
            .first()
            .map(|(_, g)| g)
            .ok_or_else(|| AdapterError::Layout {
                report: report.to_string(),
                detail: "workbook has no sheets".to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Cell;

    pub fn t(s: &str) -> Cell {
        Cell::text(s)
    }

    pub fn n(v: f64) -> Cell {
        Cell::Number(v)
    }

    pub fn e() -> Cell {
        Cell::Empty
    }
}
