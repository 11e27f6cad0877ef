//! Parquet snapshot of a run's unified dataset.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use nicind_core::IndicatorRecord;
use parquet::arrow::ArrowWriter;

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Writes the records with the staging table's column names.
pub fn export_parquet(path: &Path, records: &[IndicatorRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating export directory {}", parent.display()))?;
    }

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("origen", DataType::Utf8, false),
        ArrowField::new("institucion", DataType::Utf8, false),
        ArrowField::new("indicador", DataType::Utf8, false),
        ArrowField::new("anio", DataType::Int32, false),
        ArrowField::new("mes", DataType::Int32, false),
        ArrowField::new("valor", DataType::Float64, false),
    ]));

    let origins = StringArray::from(records.iter().map(|r| r.origin.code()).collect::<Vec<_>>());
    let institutions = StringArray::from(
        records
            .iter()
            .map(|r| r.institution.as_str())
            .collect::<Vec<_>>(),
    );
    let indicators = StringArray::from(
        records
            .iter()
            .map(|r| r.indicator.as_str())
            .collect::<Vec<_>>(),
    );
    let years = Int32Array::from(records.iter().map(|r| r.year).collect::<Vec<_>>());
    let months = Int32Array::from(records.iter().map(|r| r.month as i32).collect::<Vec<_>>());
    let values = Float64Array::from(records.iter().map(|r| r.value).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(origins),
            Arc::new(institutions),
            Arc::new(indicators),
            Arc::new(years),
            Arc::new(months),
            Arc::new(values),
        ],
    )
    .context("building indicator record batch")?;
    write_parquet(path, batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use nicind_core::{Origin, Period};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    #[test]
    fn export_round_trips_row_count_and_columns() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("exports").join("run.parquet");
        let period = Period::new(2024, 3).expect("period");
        let records = vec![
            IndicatorRecord::new(Origin::Siboif, "BANPRO", "ACTIVO", period, 120_500_000.5),
            IndicatorRecord::national(Origin::Bcn, "Remesas mensuales", period, 450_000_000.0),
        ];

        export_parquet(&path, &records).expect("export");

        let file = File::open(&path).expect("open export");
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("reader")
            .build()
            .expect("build");
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().expect("batches");
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);

        let schema = batches[0].schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, ["origen", "institucion", "indicador", "anio", "mes", "valor"]);
        let origins = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8 column");
        assert_eq!(origins.value(0), "SIBOIF");
        assert_eq!(origins.len(), 2);
    }

    #[test]
    fn empty_export_still_writes_a_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.parquet");
        export_parquet(&path, &[]).expect("export");
        assert!(path.exists());
    }
}
