//! This file is the root of the `gsvq` crate: vector-quantized compression of
//! Gaussian splat point clouds.
//!
//! Its responsibilities are strictly limited to:
//! 1.  Declaring the top-level modules of the library (`pipeline`, `quantization`,
//!     `layout`, `codec`, ...).
//! 2.  Re-exporting the handful of types most callers need.
//!
//! A typical round trip:
//!
//! ```no_run
//! use gsvq::{ArrowZstdCodec, GaussianModel, GsvqConfig, SplatCompressor};
//! # fn run(model: &GaussianModel) -> Result<(), gsvq::GsvqError> {
//! let mut compressor = SplatCompressor::new(GsvqConfig::default(), ArrowZstdCodec::new())?;
//! compressor.compress(model, "scene.gsvq".as_ref())?;
//!
//! let mut restored = GaussianModel::new(3)?;
//! compressor.decompress(&mut restored, "scene.gsvq".as_ref())?;
//! # Ok(())
//! # }
//! ```

//==================================================================================
// 0. Constants
//==================================================================================
/// The crate version, automatically set from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//==================================================================================
// 1. Module Declarations
//==================================================================================
#[macro_use]
pub mod observability; // Make macros available throughout the crate

pub mod codec;
pub mod config;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod quantization;
pub mod store;
pub mod types;

#[doc(hidden)]
pub use log as __log;

//==================================================================================
// 2. Public Re-exports
//==================================================================================
pub use codec::{ArrowZstdCodec, EncodeOptions, ExternalProcessCodec, RecordCodec};
pub use config::{Backend, ClusterConfig, CodebookPolicy, GsvqConfig, QuantizationBits};
pub use error::GsvqError;
pub use layout::RecordLayout;
pub use model::{GaussianModel, SplatModel};
pub use observability::init_logging;
pub use pipeline::{
    CompressedSplats, CompressionSummary, DecompressionSummary, PipelineStage, SplatCompressor,
};
pub use quantization::{ClusterIds, Codebook, VectorQuantizer};
pub use types::{AttributeKey, AttributeSet, Channel};
