//! The compress/decompress pipeline.
//!
//! A run walks a fixed sequence of stages (see `PipelineStage`); each stage's
//! failure is reported wrapped in `GsvqError::Pipeline` naming the stage.

pub mod compressor;
pub mod container;
pub mod stage;

pub use compressor::{CompressedSplats, CompressionSummary, DecompressionSummary, SplatCompressor};
pub use container::ContainerHeader;
pub use stage::PipelineStage;
