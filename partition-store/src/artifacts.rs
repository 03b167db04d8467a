// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use arrow::{compute::concat_batches, error::ArrowError, record_batch::RecordBatch};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::{Compression, Encoding},
    file::properties::{EnabledStatistics, WriterProperties, WriterVersion},
};

use crate::error::Result;

const CREATED_BY: &str = "partition-store";
const ROW_GROUP_ROWS: usize = 128_000;

/// Fixed physical layout for every partition file. Nothing here depends on
/// row content, so two files of one dataset always decode to the same
/// column types.
pub fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_created_by(CREATED_BY.to_string())
        .set_writer_version(WriterVersion::PARQUET_1_0)
        .set_compression(Compression::SNAPPY)
        .set_dictionary_enabled(false)
        .set_encoding(Encoding::PLAIN)
        .set_statistics_enabled(EnabledStatistics::Chunk)
        .set_max_row_group_size(ROW_GROUP_ROWS)
        .build()
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    final_path.with_extension("parquet.tmp")
}

/// Writes `batch` next to `final_path` and renames it into place. Readers
/// observe either the previous file or the complete new one. Returns the
/// size of the file in place.
pub fn write_record_batch(final_path: &Path, batch: &RecordBatch) -> Result<u64> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path_for(final_path);
    if tmp_path.exists() {
        fs::remove_file(&tmp_path)?;
    }
    let written = (|| -> Result<()> {
        let file = File::create(&tmp_path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_properties()))?;
        writer.write(batch)?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    fs::rename(&tmp_path, final_path)?;
    Ok(fs::metadata(final_path)?.len())
}

pub fn read_record_batch(path: &Path) -> Result<RecordBatch> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, ArrowError>>()?;
    Ok(concat_batches(&schema, &batches)?)
}
