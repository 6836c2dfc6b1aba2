// In: src/error.rs

//! This module defines the single, unified error type for the entire gsvq library.
//! It uses the `thiserror` crate to provide ergonomic, context-aware error handling.

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::PipelineStage;

#[derive(Error, Debug)]
pub enum GsvqError {
    // =========================================================================
    // === Attribute & Model Errors
    // =========================================================================
    /// The attributes of a set disagree on their point count or dimension.
    #[error("Shape mismatch for '{attribute}': expected {expected}, got {actual}")]
    ShapeMismatch {
        attribute: String,
        expected: String,
        actual: String,
    },

    #[error("Required attribute '{0}' is missing from the attribute set")]
    MissingAttribute(String),

    #[error("Unsupported band degree {requested}: at most {supported} is supported here")]
    UnsupportedDegree { requested: usize, supported: usize },

    // =========================================================================
    // === Quantization Errors
    // =========================================================================
    /// `quantize(update_codebook = false)` was called before any codebook was fit or loaded.
    #[error("Quantizer has no fitted codebook; quantize with update_codebook=true first")]
    NotFitted,

    #[error(
        "Cluster id {index} for channel '{channel}' is outside the codebook range [0, {cluster_count})"
    )]
    IndexOutOfRange {
        channel: String,
        index: i64,
        cluster_count: usize,
    },

    // =========================================================================
    // === Codebook Side Artifact Errors
    // =========================================================================
    #[error("Codebook side artifact not found at {0}")]
    CodebookMissing(PathBuf),

    #[error("Codebook shape error: {0}")]
    CodebookShape(String),

    // =========================================================================
    // === Layout, Container & Codec Errors
    // =========================================================================
    #[error("Record layout error: {0}")]
    Layout(String),

    #[error("Container/artifact format error: {0}")]
    Format(String),

    #[error("Container was written by the '{found}' backend but '{expected}' was configured")]
    BackendMismatch { expected: String, found: String },

    /// An external encode/decode failure, carrying the boundary's own diagnostic.
    #[error("Codec boundary failed: {0}")]
    CodecBoundary(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pipeline execution failed at stage '{stage}': {source}")]
    Pipeline {
        stage: PipelineStage,
        #[source]
        source: Box<GsvqError>,
    },

    // =========================================================================
    // === External Error Wrappers (Using #[from] for automatic conversion)
    // =========================================================================
    /// An error originating from the underlying I/O subsystem (e.g., file not found).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the Serde JSON library, typically while reading configuration.
    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error originating from the Arrow library.
    #[error("Arrow operation failed: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Zstd operation failed: {0}")]
    ZstdError(String),
}

impl GsvqError {
    /// Strips any `Pipeline` wrappers and returns the error that actually failed.
    pub fn root_cause(&self) -> &GsvqError {
        match self {
            GsvqError::Pipeline { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Convenience constructor for the common "expected vs. actual" shape failure.
    pub(crate) fn shape(
        attribute: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        GsvqError::ShapeMismatch {
            attribute: attribute.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

// =============================================================================
// === Manual `From` Implementations ===
// =============================================================================

impl From<ndarray::ShapeError> for GsvqError {
    fn from(err: ndarray::ShapeError) -> Self {
        GsvqError::Layout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_pipeline_errors() {
        let inner = GsvqError::NotFitted;
        let wrapped = GsvqError::Pipeline {
            stage: PipelineStage::Quantizing,
            source: Box::new(GsvqError::Pipeline {
                stage: PipelineStage::Quantizing,
                source: Box::new(inner),
            }),
        };
        assert!(matches!(wrapped.root_cause(), GsvqError::NotFitted));
        assert!(wrapped.to_string().contains("Quantizing"));
    }

    #[test]
    fn test_shape_error_maps_to_layout() {
        let err: GsvqError = ndarray::Array2::<f32>::from_shape_vec((2, 2), vec![0.0; 3])
            .unwrap_err()
            .into();
        assert!(matches!(err, GsvqError::Layout(_)));
    }
}
