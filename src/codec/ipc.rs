//! An in-process reference codec: Arrow IPC stream, compressed with zstd.
//!
//! Lossless, so it is what the tests and benchmarks run the pipeline against.

use std::io::Cursor;

use arrow::compute::concat_batches;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use super::{EncodeOptions, RecordCodec};
use crate::error::GsvqError;
use crate::kernels;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrowZstdCodec;

impl ArrowZstdCodec {
    pub fn new() -> Self {
        Self
    }

    /// Maps the 0..=10 compression level onto zstd levels 1..=21.
    pub fn zstd_level(compression_level: u8) -> i32 {
        1 + 2 * compression_level as i32
    }
}

impl RecordCodec for ArrowZstdCodec {
    fn name(&self) -> &str {
        "arrow-ipc-zstd"
    }

    fn encode(&self, batch: &RecordBatch, options: &EncodeOptions) -> Result<Vec<u8>, GsvqError> {
        let mut ipc_bytes = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut ipc_bytes, &batch.schema())?;
            writer.write(batch)?;
            writer.finish()?;
        }
        kernels::zstd::encode(&ipc_bytes, Self::zstd_level(options.compression_level))
    }

    fn decode(&self, bytes: &[u8]) -> Result<RecordBatch, GsvqError> {
        let ipc_bytes = kernels::zstd::decode(bytes)?;
        let reader = StreamReader::try_new(Cursor::new(ipc_bytes), None)?;
        let schema = reader.schema();
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        Ok(concat_batches(&schema, &batches)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Float32Array, UInt16Array};
    use arrow::datatypes::{DataType, Field, Schema};

    #[test]
    fn test_roundtrip_is_lossless_and_keeps_metadata() {
        let metadata = [("gsvq.group".to_string(), "rotation".to_string())]
            .into_iter()
            .collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float32, false),
            Field::new("rot_re", DataType::UInt16, false).with_metadata(metadata),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float32Array::from(vec![f32::MIN_POSITIVE, -0.0, 1e30])),
                Arc::new(UInt16Array::from(vec![0u16, 299, 65_535])),
            ],
        )
        .unwrap();

        let codec = ArrowZstdCodec::new();
        for level in [0, 10] {
            let options = EncodeOptions {
                compression_level: level,
                ..EncodeOptions::default()
            };
            let bytes = codec.encode(&batch, &options).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), batch);
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ArrowZstdCodec::new().decode(b"definitely not zstd").is_err());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(ArrowZstdCodec::zstd_level(0), 1);
        assert_eq!(ArrowZstdCodec::zstd_level(10), 21);
    }
}
