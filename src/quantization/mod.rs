//! Attribute quantization: k-means codebooks per channel, nearest-centroid ids,
//! and the inverse lookup.

pub mod codebook;
mod kmeans;
pub mod quantizer;

pub use codebook::{ClusterIds, Codebook};
pub use quantizer::{decompose, dequantize, dequantize_into, split_rotation, VectorQuantizer};
