// In: src/config.rs

//! The single source of truth for all gsvq compression configuration.
//!
//! This module defines the unified `GsvqConfig` struct, which is designed to be
//! created once at the application boundary (e.g., from a user's JSON file) and
//! then handed to a `SplatCompressor`. Configuration is values only: the codec
//! executables themselves are passed in separately as a `RecordCodec`.

use serde::{Deserialize, Serialize};

use crate::error::GsvqError;
use crate::types::Channel;

//==================================================================================
// 0. Constants
//==================================================================================

/// Highest compression level understood by the codecs (0 = fastest).
pub const MAX_COMPRESSION_LEVEL: u8 = 10;
/// Highest per-attribute quantization bit depth forwarded to a codec.
pub const MAX_QUANTIZATION_BITS: u8 = 30;

//==================================================================================
// I. Core Configuration Enums & Structs
//==================================================================================

/// Selects how attributes travel through the codec.
///
/// The choice is recorded in the container envelope, and decompression refuses a
/// container written by the other backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// **Default:** attributes are replaced by cluster ids plus a side codebook.
    #[default]
    Quantized,
    /// Attributes pass through the codec as raw floats, using only the codec's
    /// own bit-depth quantization. No codebook is written.
    Raw,
}

impl Backend {
    pub fn tag(&self) -> u8 {
        match self {
            Backend::Quantized => 1,
            Backend::Raw => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, GsvqError> {
        match tag {
            1 => Ok(Backend::Quantized),
            2 => Ok(Backend::Raw),
            other => Err(GsvqError::Format(format!("Unknown backend tag {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Quantized => "quantized",
            Backend::Raw => "raw",
        }
    }
}

/// Decides whether compression fits a fresh codebook or reuses the quantizer's.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodebookPolicy {
    /// Always reuse the fitted codebook (`update_codebook = false`). Fails with
    /// `NotFitted` if the quantizer has none.
    Reuse,
    /// Always refit (`update_codebook = true`).
    Refit,
    /// **Default:** fit on the first compression, reuse afterwards.
    #[default]
    FitIfMissing,
}

/// Per-channel cluster counts and k-means parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClusterConfig {
    /// The default number of clusters for every channel.
    #[serde(default = "default_num_clusters")]
    pub num_clusters: usize,

    #[serde(default)]
    pub scale: Option<usize>,
    #[serde(default)]
    pub rotation_re: Option<usize>,
    #[serde(default)]
    pub rotation_im: Option<usize>,
    #[serde(default)]
    pub opacity: Option<usize>,
    #[serde(default)]
    pub feature_dc: Option<usize>,

    /// One count per rest band. Empty means "use `num_clusters` for every band";
    /// otherwise the length must equal the model's band degree.
    #[serde(default)]
    pub feature_rest: Vec<usize>,

    /// Upper bound on Lloyd iterations per channel.
    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,

    /// Seed for k-means++ initialisation. Fixed seeds make fitting reproducible.
    #[serde(default)]
    pub seed: u64,

    /// Keep all-zero rest coefficients out of clustering and reserve codebook
    /// row 0 of every rest band for the zero vector.
    #[serde(default)]
    pub exclude_zero_rest: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_clusters: default_num_clusters(),
            scale: None,
            rotation_re: None,
            rotation_im: None,
            opacity: None,
            feature_dc: None,
            feature_rest: Vec::new(),
            kmeans_iterations: default_kmeans_iterations(),
            seed: 0,
            exclude_zero_rest: false,
        }
    }
}

impl ClusterConfig {
    /// A config where every channel uses `num_clusters`.
    pub fn uniform(num_clusters: usize) -> Self {
        Self {
            num_clusters,
            ..Self::default()
        }
    }

    /// The cluster count that applies to `channel`.
    ///
    /// Call `validate` first; an out-of-range band here falls back to the default.
    pub fn cluster_count(&self, channel: Channel) -> usize {
        let override_count = match channel {
            Channel::Scale => self.scale,
            Channel::RotationRe => self.rotation_re,
            Channel::RotationIm => self.rotation_im,
            Channel::Opacity => self.opacity,
            Channel::FeatureDc => self.feature_dc,
            Channel::FeatureRest(band) => self.feature_rest.get(band as usize).copied(),
        };
        override_count.unwrap_or(self.num_clusters)
    }

    /// Validates the counts against a model with `band_degree` rest bands.
    pub fn validate(&self, band_degree: usize) -> Result<(), GsvqError> {
        if !self.feature_rest.is_empty() && self.feature_rest.len() != band_degree {
            return Err(GsvqError::Config(format!(
                "feature_rest lists {} cluster counts but the model has {} rest bands",
                self.feature_rest.len(),
                band_degree
            )));
        }

        let named = [
            ("num_clusters", Some(self.num_clusters)),
            ("scale", self.scale),
            ("rotation_re", self.rotation_re),
            ("rotation_im", self.rotation_im),
            ("opacity", self.opacity),
            ("feature_dc", self.feature_dc),
        ];
        let rest = self
            .feature_rest
            .iter()
            .map(|&count| ("feature_rest", Some(count)));

        for (name, count) in named.into_iter().chain(rest) {
            match count {
                Some(0) => {
                    return Err(GsvqError::Config(format!(
                        "Cluster count for '{}' must be at least 1",
                        name
                    )))
                }
                Some(count) if count as u64 > u32::MAX as u64 + 1 => {
                    return Err(GsvqError::Config(format!(
                        "Cluster count {} for '{}' exceeds the 32-bit index range",
                        count, name
                    )))
                }
                _ => {}
            }
        }

        if self.kmeans_iterations == 0 {
            return Err(GsvqError::Config(
                "kmeans_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-attribute-group bit depths forwarded opaquely to the codec. 0 lets the
/// codec pick its own default.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QuantizationBits {
    #[serde(default = "default_bits")]
    pub position: u8,
    #[serde(default = "default_bits")]
    pub scale: u8,
    #[serde(default = "default_bits")]
    pub rotation: u8,
    #[serde(default = "default_bits")]
    pub opacity: u8,
    #[serde(default = "default_bits")]
    pub feature_dc: u8,
    #[serde(default = "default_bits")]
    pub feature_rest: u8,
}

impl Default for QuantizationBits {
    fn default() -> Self {
        Self::uniform(default_bits())
    }
}

impl QuantizationBits {
    pub fn uniform(bits: u8) -> Self {
        Self {
            position: bits,
            scale: bits,
            rotation: bits,
            opacity: bits,
            feature_dc: bits,
            feature_rest: bits,
        }
    }

    fn validate(&self) -> Result<(), GsvqError> {
        let all = [
            ("position", self.position),
            ("scale", self.scale),
            ("rotation", self.rotation),
            ("opacity", self.opacity),
            ("feature_dc", self.feature_dc),
            ("feature_rest", self.feature_rest),
        ];
        for (name, bits) in all {
            if bits > MAX_QUANTIZATION_BITS {
                return Err(GsvqError::Config(format!(
                    "Quantization bits for '{}' must be <= {}, got {}",
                    name, MAX_QUANTIZATION_BITS, bits
                )));
            }
        }
        Ok(())
    }
}

//==================================================================================
// II. The Unified GsvqConfig
//==================================================================================

/// The single, unified configuration for a compress/decompress invocation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GsvqConfig {
    /// Quantized (ids + codebook) or raw passthrough.
    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub codebook_policy: CodebookPolicy,

    #[serde(default)]
    pub clusters: ClusterConfig,

    /// Codec effort, 0 (fastest) to `MAX_COMPRESSION_LEVEL`.
    #[serde(default)]
    pub compression_level: u8,

    #[serde(default)]
    pub quantization_bits: QuantizationBits,
}

impl GsvqConfig {
    /// Parses a config from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, GsvqError> {
        let config: GsvqConfig = serde_json::from_str(json)?;
        config.validate_static()?;
        Ok(config)
    }

    /// Checks everything that does not depend on the model being compressed.
    /// Band-dependent checks happen in `ClusterConfig::validate`.
    pub fn validate_static(&self) -> Result<(), GsvqError> {
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(GsvqError::Config(format!(
                "compression_level must be <= {}, got {}",
                MAX_COMPRESSION_LEVEL, self.compression_level
            )));
        }
        self.quantization_bits.validate()
    }
}

/// Helper for `serde` to provide a default for `num_clusters`.
fn default_num_clusters() -> usize {
    256
}

fn default_kmeans_iterations() -> usize {
    10
}

fn default_bits() -> u8 {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_count_overrides() {
        let config = ClusterConfig {
            num_clusters: 64,
            opacity: Some(4),
            feature_rest: vec![8, 16],
            ..ClusterConfig::default()
        };
        assert_eq!(config.cluster_count(Channel::Scale), 64);
        assert_eq!(config.cluster_count(Channel::Opacity), 4);
        assert_eq!(config.cluster_count(Channel::FeatureRest(0)), 8);
        assert_eq!(config.cluster_count(Channel::FeatureRest(1)), 16);
    }

    #[test]
    fn test_feature_rest_length_must_match_degree() {
        let config = ClusterConfig {
            feature_rest: vec![8, 16],
            ..ClusterConfig::default()
        };
        assert!(config.validate(2).is_ok());
        assert!(matches!(config.validate(3), Err(GsvqError::Config(_))));
        assert!(matches!(config.validate(0), Err(GsvqError::Config(_))));
        // An empty list means "use the default everywhere".
        assert!(ClusterConfig::default().validate(3).is_ok());
    }

    #[test]
    fn test_zero_cluster_count_is_rejected() {
        let config = ClusterConfig {
            rotation_im: Some(0),
            ..ClusterConfig::default()
        };
        assert!(matches!(config.validate(0), Err(GsvqError::Config(_))));
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config = GsvqConfig::from_json_str(
            r#"{ "backend": "raw", "clusters": { "num_clusters": 32, "feature_rest": [4, 4] } }"#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Raw);
        assert_eq!(config.codebook_policy, CodebookPolicy::FitIfMissing);
        assert_eq!(config.clusters.num_clusters, 32);
        assert_eq!(config.clusters.kmeans_iterations, 10);
        assert_eq!(config.quantization_bits, QuantizationBits::uniform(16));
        assert_eq!(config.compression_level, 0);
    }

    #[test]
    fn test_config_rejects_out_of_range_levels() {
        assert!(matches!(
            GsvqConfig::from_json_str(r#"{ "compression_level": 11 }"#),
            Err(GsvqError::Config(_))
        ));
        assert!(matches!(
            GsvqConfig::from_json_str(r#"{ "quantization_bits": { "rotation": 31 } }"#),
            Err(GsvqError::Config(_))
        ));
    }

    #[test]
    fn test_backend_tags_roundtrip() {
        for backend in [Backend::Quantized, Backend::Raw] {
            assert_eq!(Backend::from_tag(backend.tag()).unwrap(), backend);
        }
        assert!(Backend::from_tag(0).is_err());
    }
}
