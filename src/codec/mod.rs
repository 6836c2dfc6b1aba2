// In: src/codec/mod.rs

//! The codec boundary: anything able to turn a record batch into bytes and back.
//!
//! The pipeline never assumes a codec is lossless. It only relies on the
//! contract that row count and row order survive, and that decoded index values
//! land within 0.5 of what was encoded.

use arrow::record_batch::RecordBatch;

use crate::config::{GsvqConfig, QuantizationBits};
use crate::error::GsvqError;

pub mod ipc;
pub mod ply;
pub mod process;

pub use ipc::ArrowZstdCodec;
pub use process::ExternalProcessCodec;

/// Encoder knobs forwarded opaquely to the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// 0 (fastest) to `MAX_COMPRESSION_LEVEL`.
    pub compression_level: u8,
    /// Per-group bit depths; 0 means "codec default".
    pub bits: QuantizationBits,
}

impl EncodeOptions {
    pub fn from_config(config: &GsvqConfig) -> Self {
        Self {
            compression_level: config.compression_level,
            bits: config.quantization_bits,
        }
    }
}

/// An encoder/decoder pair for packed splat records.
pub trait RecordCodec {
    /// A short name used in logs.
    fn name(&self) -> &str;

    fn encode(&self, batch: &RecordBatch, options: &EncodeOptions) -> Result<Vec<u8>, GsvqError>;

    fn decode(&self, bytes: &[u8]) -> Result<RecordBatch, GsvqError>;
}

impl<C: RecordCodec + ?Sized> RecordCodec for &C {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn encode(&self, batch: &RecordBatch, options: &EncodeOptions) -> Result<Vec<u8>, GsvqError> {
        (**self).encode(batch, options)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RecordBatch, GsvqError> {
        (**self).decode(bytes)
    }
}

impl<C: RecordCodec + ?Sized> RecordCodec for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn encode(&self, batch: &RecordBatch, options: &EncodeOptions) -> Result<Vec<u8>, GsvqError> {
        (**self).encode(batch, options)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RecordBatch, GsvqError> {
        (**self).decode(bytes)
    }
}
