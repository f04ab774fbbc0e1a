use anyhow::{Context, Result};
use arrow::{compute::concat_batches, record_batch::RecordBatch};
use bytes::Bytes;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::properties::WriterProperties,
};
use std::io::Cursor;

/// Encode a whole table as a single Snappy-compressed Parquet object.
pub fn write_parquet_to_memory(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let cursor = Cursor::new(&mut buffer);

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(cursor, batch.schema(), Some(props))
        .context("creating parquet writer")?;

    writer.write(batch).context("writing batch to parquet")?;
    writer.close().context("closing parquet writer")?;

    Ok(buffer)
}

/// Decode a Parquet object back into one table.
pub fn read_parquet_from_memory(data: Bytes) -> Result<RecordBatch> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(data).context("reading parquet metadata")?;
    let schema = builder.schema().clone();
    let reader = builder
        .with_batch_size(8192)
        .build()
        .context("building parquet reader")?;

    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("decoding parquet record batches")?;
    concat_batches(&schema, &batches).context("concatenating parquet batches")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::{
        array::{ArrayRef, Float64Array, StringArray},
        datatypes::{DataType, Field, Schema},
    };
    use std::sync::Arc;

    #[test]
    fn empty_tables_keep_their_schema() -> Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, true),
            Field::new("amount", DataType::Float64, true),
        ]));
        let empty = RecordBatch::new_empty(schema.clone());
        let decoded = read_parquet_from_memory(Bytes::from(write_parquet_to_memory(&empty)?))?;
        assert_eq!(decoded.num_rows(), 0);
        assert_eq!(decoded.schema().fields(), schema.fields());
        Ok(())
    }

    #[test]
    fn values_survive_encoding() -> Result<()> {
        let batch = RecordBatch::try_from_iter(vec![
            (
                "id",
                Arc::new(StringArray::from(vec![Some("a"), None])) as ArrayRef,
            ),
            (
                "amount",
                Arc::new(Float64Array::from(vec![Some(1.5), Some(2.0)])) as ArrayRef,
            ),
        ])?;
        let decoded = read_parquet_from_memory(Bytes::from(write_parquet_to_memory(&batch)?))?;
        assert_eq!(decoded.schema().fields(), batch.schema().fields());
        assert_eq!(decoded.columns(), batch.columns());
        Ok(())
    }
}
