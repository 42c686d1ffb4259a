//! Parquet form of the catalog, consumed at startup instead of the raw
//! price list.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::reader::ChunkReader;
use quote_core::{Catalog, CatalogRow, QuoteError, CATALOG_COLUMNS};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
pub const SNAPSHOT_EXTENSION: &str = "parquet";

pub fn catalog_schema() -> SchemaRef {
    let fields = CATALOG_COLUMNS
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let data_type = if idx < 4 { DataType::Utf8 } else { DataType::Float64 };
            ArrowField::new(*name, data_type, true)
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

fn catalog_record_batch(catalog: &Catalog) -> Result<RecordBatch> {
    let rows = catalog.rows();
    let products = rows.iter().map(|r| r.product.as_deref()).collect::<StringArray>();
    let descriptions = rows.iter().map(|r| r.description.as_deref()).collect::<StringArray>();
    let cut_offs = rows.iter().map(|r| r.cut_off.as_deref()).collect::<StringArray>();
    let packs = rows.iter().map(|r| r.pack.as_deref()).collect::<StringArray>();
    let finished_rmb = Float64Array::from(rows.iter().map(|r| r.finished_price_rmb).collect::<Vec<_>>());
    let finished_usd = Float64Array::from(rows.iter().map(|r| r.finished_price_usd).collect::<Vec<_>>());
    let bulk_rmb = Float64Array::from(rows.iter().map(|r| r.bulk_price_rmb).collect::<Vec<_>>());
    let bulk_usd = Float64Array::from(rows.iter().map(|r| r.bulk_price_usd).collect::<Vec<_>>());

    RecordBatch::try_new(
        catalog_schema(),
        vec![
            Arc::new(products),
            Arc::new(descriptions),
            Arc::new(cut_offs),
            Arc::new(packs),
            Arc::new(finished_rmb),
            Arc::new(finished_usd),
            Arc::new(bulk_rmb),
            Arc::new(bulk_usd),
        ],
    )
    .context("building catalog record batch")
}

/// Encodes the catalog as a single-row-group Parquet file. The same catalog
/// always yields the same bytes.
pub fn encode_snapshot(catalog: &Catalog) -> Result<Vec<u8>> {
    let batch = catalog_record_batch(catalog)?;
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing catalog record batch")?;
    writer.into_inner().context("closing parquet writer")
}

pub fn write_snapshot(path: &Path, catalog: &Catalog) -> Result<()> {
    let bytes = encode_snapshot(catalog)?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

pub fn read_snapshot(path: &Path) -> Result<Catalog> {
    let bytes = std::fs::read(path).with_context(|| format!("opening snapshot {}", path.display()))?;
    decode_snapshot(Bytes::from(bytes), &path.display().to_string())
}

/// Decodes snapshot bytes already held in memory, e.g. after an integrity
/// check, so the decoded rows are exactly the checked ones.
pub fn read_snapshot_bytes(bytes: Bytes) -> Result<Catalog> {
    decode_snapshot(bytes, "in-memory snapshot")
}

fn decode_snapshot<R: ChunkReader + 'static>(input: R, label: &str) -> Result<Catalog> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(input)
        .with_context(|| format!("reading parquet metadata {label}"))?;
    check_schema(builder.schema())?;
    let reader = builder
        .with_batch_size(1024)
        .build()
        .with_context(|| format!("opening parquet reader {label}"))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("decoding {label}"))?;
        rows.extend(rows_from_batch(&batch)?);
    }
    Ok(Catalog::new(rows))
}

fn check_schema(schema: &Schema) -> Result<(), QuoteError> {
    let names = schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect::<Vec<_>>();
    if names != CATALOG_COLUMNS {
        return Err(QuoteError::Snapshot(format!(
            "unexpected snapshot columns {names:?}"
        )));
    }
    Ok(())
}

fn string_column(batch: &RecordBatch, idx: usize) -> Result<&StringArray, QuoteError> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| QuoteError::Snapshot(format!("column {} is not utf8", CATALOG_COLUMNS[idx])))
}

fn float_column(batch: &RecordBatch, idx: usize) -> Result<&Float64Array, QuoteError> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| QuoteError::Snapshot(format!("column {} is not float64", CATALOG_COLUMNS[idx])))
}

fn rows_from_batch(batch: &RecordBatch) -> Result<Vec<CatalogRow>, QuoteError> {
    let product = string_column(batch, 0)?;
    let description = string_column(batch, 1)?;
    let cut_off = string_column(batch, 2)?;
    let pack = string_column(batch, 3)?;
    let finished_rmb = float_column(batch, 4)?;
    let finished_usd = float_column(batch, 5)?;
    let bulk_rmb = float_column(batch, 6)?;
    let bulk_usd = float_column(batch, 7)?;

    let text = |col: &StringArray, i: usize| (!col.is_null(i)).then(|| col.value(i).to_string());
    let price = |col: &Float64Array, i: usize| (!col.is_null(i)).then(|| col.value(i));

    Ok((0..batch.num_rows())
        .map(|i| CatalogRow {
            product: text(product, i),
            description: text(description, i),
            cut_off: text(cut_off, i),
            pack: text(pack, i),
            finished_price_usd: price(finished_usd, i),
            finished_price_rmb: price(finished_rmb, i),
            bulk_price_usd: price(bulk_usd, i),
            bulk_price_rmb: price(bulk_rmb, i),
        })
        .collect())
}
