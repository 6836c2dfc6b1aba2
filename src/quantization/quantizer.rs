//! The vector quantizer: turns an `AttributeSet` into cluster ids plus a codebook,
//! and resolves ids back into attribute values.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

use crate::config::ClusterConfig;
use crate::error::GsvqError;
use crate::model::SplatModel;
use crate::quantization::codebook::{check_channel_width, ClusterIds, Codebook};
use crate::quantization::kmeans::{self, KMeansParams};
use crate::types::{AttributeKey, AttributeSet, Channel};

//==================================================================================
// 1. Quantizer
//==================================================================================

/// Holds the cluster configuration and, once fitted (or seeded), the codebook
/// that later `quantize(.., false)` calls assign against.
///
/// Fitting mutates the held codebook, so calls against one instance must be
/// serialised; `&mut self` enforces that.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    config: ClusterConfig,
    codebook: Option<Codebook>,
}

impl VectorQuantizer {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            codebook: None,
        }
    }

    /// A quantizer that starts out fitted with `codebook` (e.g. one loaded from disk).
    pub fn with_codebook(config: ClusterConfig, codebook: Codebook) -> Self {
        Self {
            config,
            codebook: Some(codebook),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn codebook(&self) -> Option<&Codebook> {
        self.codebook.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.codebook.is_some()
    }

    pub fn set_codebook(&mut self, codebook: Codebook) {
        self.codebook = Some(codebook);
    }

    /// Quantizes every channel of `attrs`.
    ///
    /// With `update_codebook` the codebook is refit from `attrs` first; without it
    /// the previously fitted codebook is reused and only nearest-centroid
    /// assignment runs. Returns the ids together with the codebook they index,
    /// restricted to the channels of `attrs`; a held codebook fit on more rest
    /// bands stays intact.
    pub fn quantize(
        &mut self,
        attrs: &AttributeSet,
        update_codebook: bool,
    ) -> Result<(ClusterIds, Codebook), GsvqError> {
        let n = attrs.validate()?;
        let degree = attrs.band_degree();
        self.config.validate(degree)?;
        if !update_codebook && self.codebook.is_none() {
            return Err(GsvqError::NotFitted);
        }

        let channels = decompose(attrs)?;

        if update_codebook {
            let mut codebook = Codebook::new();
            for (channel, data) in &channels {
                let centroids = self.fit_channel(*channel, data.view());
                crate::log_metric!(
                    "event" = "fit_channel",
                    "channel" = channel,
                    "points" = n,
                    "clusters" = centroids.nrows()
                );
                codebook.insert(*channel, centroids)?;
            }
            self.codebook = Some(codebook);
        }

        let codebook = self.codebook.as_ref().ok_or(GsvqError::NotFitted)?;
        let mut ids = ClusterIds::new();
        for (channel, data) in &channels {
            let centroids = codebook
                .get(*channel)
                .ok_or_else(|| missing_channel(codebook, *channel))?;
            check_channel_width(*channel, centroids.ncols())?;
            if centroids.ncols() != data.ncols() {
                return Err(GsvqError::CodebookShape(format!(
                    "Codebook for '{}' has {} columns but the attribute has {}",
                    channel,
                    centroids.ncols(),
                    data.ncols()
                )));
            }
            ids.insert(*channel, kmeans::assign(data.view(), centroids.view()));
        }

        log::debug!(
            "Quantized {} points over {} channels (update_codebook={})",
            n,
            ids.len(),
            update_codebook
        );
        let used = codebook.restricted(ids.channels());
        Ok((ids, used))
    }

    fn fit_channel(&self, channel: Channel, data: ArrayView2<'_, f32>) -> Array2<f32> {
        let clusters = self.config.cluster_count(channel);
        let params = KMeansParams {
            clusters,
            max_iterations: self.config.kmeans_iterations,
            seed: self.config.seed,
        };

        let exclude_zero =
            self.config.exclude_zero_rest && matches!(channel, Channel::FeatureRest(_)) && clusters >= 2;
        if !exclude_zero {
            return kmeans::fit(data, &params);
        }

        // Row 0 is reserved for the all-zero vector; the rest are fit on non-zero rows.
        let non_zero: Vec<usize> = data
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|&v| v != 0.0))
            .map(|(i, _)| i)
            .collect();
        let training = data.select(Axis(0), &non_zero);
        let fitted = kmeans::fit(
            training.view(),
            &KMeansParams {
                clusters: clusters - 1,
                ..params
            },
        );

        let mut centroids = Array2::zeros((clusters, data.ncols()));
        centroids.slice_mut(s![1.., ..]).assign(&fitted);
        centroids
    }
}

fn missing_channel(codebook: &Codebook, channel: Channel) -> GsvqError {
    match channel {
        Channel::FeatureRest(band) => GsvqError::UnsupportedDegree {
            requested: band as usize + 1,
            supported: codebook.band_degree(),
        },
        other => GsvqError::CodebookShape(format!("Codebook has no entry for channel '{}'", other)),
    }
}

//==================================================================================
// 2. Channel Decomposition
//==================================================================================

/// Splits rotations into `(re, im)` channels: each quaternion is normalised to
/// unit length and its sign flipped so the real part is non-negative. A zero
/// quaternion becomes the identity.
pub fn split_rotation(rotation: ArrayView2<'_, f32>) -> (Array2<f32>, Array2<f32>) {
    let n = rotation.nrows();
    let mut re = Array2::zeros((n, 1));
    let mut im = Array2::zeros((n, 3));

    for (i, q) in rotation.outer_iter().enumerate() {
        let norm = q.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            re[[i, 0]] = 1.0;
            continue;
        }
        let sign = if q[0] < 0.0 { -1.0 } else { 1.0 };
        let scale = sign / norm;
        re[[i, 0]] = q[0] * scale;
        for j in 0..3 {
            im[[i, j]] = q[j + 1] * scale;
        }
    }
    (re, im)
}

/// The per-channel arrays to cluster, in canonical channel order.
pub fn decompose(attrs: &AttributeSet) -> Result<Vec<(Channel, Array2<f32>)>, GsvqError> {
    let mut channels = Vec::new();
    for (key, values) in attrs.iter() {
        match key {
            AttributeKey::Position => {}
            AttributeKey::Rotation => {
                let (re, im) = split_rotation(values.view());
                channels.push((Channel::RotationRe, re));
                channels.push((Channel::RotationIm, im));
            }
            AttributeKey::Scale => channels.push((Channel::Scale, values.clone())),
            AttributeKey::Opacity => channels.push((Channel::Opacity, values.clone())),
            AttributeKey::FeatureDc => channels.push((Channel::FeatureDc, values.clone())),
            AttributeKey::FeatureRest(band) => {
                channels.push((Channel::FeatureRest(band), values.clone()))
            }
        }
    }
    Ok(channels)
}

//==================================================================================
// 3. Dequantization
//==================================================================================

/// Resolves `ids` through `codebook` and reassembles a fresh attribute set.
///
/// `positions` bypass the codebook. Every id is range-checked; the rotation is
/// rebuilt as `[re | im]`.
pub fn dequantize(
    ids: &ClusterIds,
    codebook: &Codebook,
    positions: Array2<f32>,
) -> Result<AttributeSet, GsvqError> {
    let n = positions.nrows();
    if positions.ncols() != 3 {
        return Err(GsvqError::shape(
            "position",
            "3 columns",
            format!("{} columns", positions.ncols()),
        ));
    }

    let mut attrs = AttributeSet::new().with(AttributeKey::Position, positions);
    let mut rotation_re = None;
    let mut rotation_im = None;

    for (channel, channel_ids) in ids.iter() {
        if channel_ids.len() != n {
            return Err(GsvqError::shape(
                channel.name(),
                format!("{} ids (one per position)", n),
                format!("{} ids", channel_ids.len()),
            ));
        }
        let values = codebook.lookup(channel, channel_ids.view())?;
        match channel {
            Channel::RotationRe => rotation_re = Some(values),
            Channel::RotationIm => rotation_im = Some(values),
            other => {
                attrs.insert(other.source(), values);
            }
        }
    }

    match (rotation_re, rotation_im) {
        (Some(re), Some(im)) => {
            let rotation = concatenate(Axis(1), &[re.view(), im.view()])?;
            attrs.insert(AttributeKey::Rotation, rotation);
        }
        (None, None) => {}
        (Some(_), None) => return Err(GsvqError::MissingAttribute(Channel::RotationIm.name())),
        (None, Some(_)) => return Err(GsvqError::MissingAttribute(Channel::RotationRe.name())),
    }

    attrs.validate()?;
    Ok(attrs)
}

/// The in-place variant of `dequantize`: the reconstructed set replaces the
/// model's attributes.
pub fn dequantize_into<M: SplatModel + ?Sized>(
    model: &mut M,
    ids: &ClusterIds,
    codebook: &Codebook,
    positions: Array2<f32>,
) -> Result<(), GsvqError> {
    let attrs = dequantize(ids, codebook, positions)?;
    model.set_attributes(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GaussianModel;
    use crate::types::rest_band_dim;
    use ndarray::array;

    /// A small deterministic model with `n` points and `degree` rest bands.
    fn synthetic_attrs(n: usize, degree: usize) -> AttributeSet {
        let wave = |i: usize, j: usize, salt: usize| (((i * 13 + j * 7 + salt) % 17) as f32) * 0.1 - 0.8;
        let mut attrs = AttributeSet::new()
            .with(AttributeKey::Position, Array2::from_shape_fn((n, 3), |(i, j)| i as f32 + j as f32 * 0.5))
            .with(AttributeKey::Scale, Array2::from_shape_fn((n, 3), |(i, j)| wave(i, j, 1)))
            .with(AttributeKey::Rotation, Array2::from_shape_fn((n, 4), |(i, j)| wave(i, j, 2) + if j == 0 { 2.0 } else { 0.0 }))
            .with(AttributeKey::Opacity, Array2::from_shape_fn((n, 1), |(i, j)| wave(i, j, 3)))
            .with(AttributeKey::FeatureDc, Array2::from_shape_fn((n, 3), |(i, j)| wave(i, j, 4)));
        for band in 0..degree {
            attrs.insert(
                AttributeKey::FeatureRest(band as u8),
                Array2::from_shape_fn((n, rest_band_dim(band)), |(i, j)| wave(i, j, 5 + band)),
            );
        }
        attrs
    }

    #[test]
    fn test_quantize_without_fit_is_not_fitted_error() {
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(4));
        let result = quantizer.quantize(&synthetic_attrs(10, 0), false);
        assert!(matches!(result, Err(GsvqError::NotFitted)));
    }

    #[test]
    fn test_quantize_produces_one_id_per_point_per_channel() {
        let attrs = synthetic_attrs(40, 2);
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(8));
        let (ids, codebook) = quantizer.quantize(&attrs, true).unwrap();

        assert_eq!(ids.len(), 7); // scale, re, im, opacity, dc, rest_0, rest_1
        for (channel, channel_ids) in ids.iter() {
            assert_eq!(channel_ids.len(), 40);
            assert_eq!(codebook.cluster_count(channel), Some(8));
            assert!(ids.max_id(channel).unwrap() < 8);
        }
        assert_eq!(codebook.get(Channel::RotationRe).unwrap().ncols(), 1);
        assert_eq!(codebook.get(Channel::RotationIm).unwrap().ncols(), 3);
        assert_eq!(codebook.get(Channel::FeatureRest(1)).unwrap().ncols(), 15);
        assert!(quantizer.is_fitted());
    }

    #[test]
    fn test_requantizing_with_fitted_codebook_matches() {
        let attrs = synthetic_attrs(30, 1);
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(5));
        let (first_ids, first_codebook) = quantizer.quantize(&attrs, true).unwrap();
        let (second_ids, second_codebook) = quantizer.quantize(&attrs, false).unwrap();
        assert_eq!(first_ids, second_ids);
        assert_eq!(first_codebook, second_codebook);
    }

    #[test]
    fn test_reused_codebook_is_restricted_to_model_bands() {
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(4));
        quantizer.quantize(&synthetic_attrs(20, 2), true).unwrap();

        for degree in [1, 0] {
            let (ids, codebook) = quantizer.quantize(&synthetic_attrs(20, degree), false).unwrap();
            assert_eq!(codebook.band_degree(), degree);
            assert_eq!(codebook.len(), ids.len());
            assert!(ids.channels().all(|channel| codebook.get(channel).is_some()));
        }
        assert_eq!(quantizer.codebook().unwrap().band_degree(), 2);
    }

    #[test]
    fn test_single_cluster_maps_everything_to_zero() {
        let attrs = synthetic_attrs(25, 1);
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(1));
        let (ids, codebook) = quantizer.quantize(&attrs, true).unwrap();
        for (channel, channel_ids) in ids.iter() {
            assert!(channel_ids.iter().all(|&id| id == 0));
            assert_eq!(codebook.cluster_count(channel), Some(1));
        }
    }

    #[test]
    fn test_feature_rest_list_must_match_degree_before_fitting() {
        let attrs = synthetic_attrs(10, 2);
        let config = ClusterConfig {
            feature_rest: vec![4, 4, 4],
            ..ClusterConfig::uniform(4)
        };
        let mut quantizer = VectorQuantizer::new(config);
        assert!(matches!(
            quantizer.quantize(&attrs, true),
            Err(GsvqError::Config(_))
        ));
        assert!(!quantizer.is_fitted());
    }

    #[test]
    fn test_reused_codebook_with_fewer_bands_is_unsupported_degree() {
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(4));
        quantizer.quantize(&synthetic_attrs(12, 1), true).unwrap();
        assert!(matches!(
            quantizer.quantize(&synthetic_attrs(12, 2), false),
            Err(GsvqError::UnsupportedDegree {
                requested: 2,
                supported: 1
            })
        ));
    }

    #[test]
    fn test_split_rotation_normalises_and_canonicalises_sign() {
        let rotation = array![[2.0f32, 0.0, 0.0, 0.0], [-1.0, 1.0, 1.0, 1.0], [0.0, 0.0, 0.0, 0.0]];
        let (re, im) = split_rotation(rotation.view());
        assert_eq!(re[[0, 0]], 1.0);
        assert_eq!(re[[1, 0]], 0.5);
        assert_eq!(im.row(1).to_vec(), vec![-0.5, -0.5, -0.5]);
        assert_eq!(re[[2, 0]], 1.0);
        assert_eq!(im.row(2).to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_dequantize_equals_codebook_lookup_and_is_idempotent() {
        let attrs = synthetic_attrs(50, 2);
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(6));
        let (ids, codebook) = quantizer.quantize(&attrs, true).unwrap();
        let positions = attrs.get(AttributeKey::Position).unwrap().clone();

        let restored = dequantize(&ids, &codebook, positions.clone()).unwrap();
        assert_eq!(restored.get(AttributeKey::Position), Some(&positions));

        let opacity_ids = ids.get(Channel::Opacity).unwrap();
        for (i, &id) in opacity_ids.iter().enumerate() {
            assert_eq!(
                restored.get(AttributeKey::Opacity).unwrap()[[i, 0]],
                codebook.get(Channel::Opacity).unwrap()[[id as usize, 0]]
            );
        }
        let rotation = restored.get(AttributeKey::Rotation).unwrap();
        assert_eq!(rotation.ncols(), 4);
        let re_id = ids.get(Channel::RotationRe).unwrap()[0] as usize;
        assert_eq!(rotation[[0, 0]], codebook.get(Channel::RotationRe).unwrap()[[re_id, 0]]);

        // Re-quantizing the reconstruction reproduces the ids of every
        // non-rotation channel exactly.
        let (again, _) = quantizer.quantize(&restored, false).unwrap();
        for channel in [
            Channel::Scale,
            Channel::Opacity,
            Channel::FeatureDc,
            Channel::FeatureRest(0),
            Channel::FeatureRest(1),
        ] {
            assert_eq!(again.get(channel), ids.get(channel), "channel {}", channel);
        }
    }

    #[test]
    fn test_rotation_roundtrip_is_idempotent_for_unit_prototypes() {
        // Four distinct unit quaternions with non-negative real parts.
        let prototypes = array![
            [1.0f32, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.6, 0.0, 0.8, 0.0],
            [0.5, 0.5, 0.5, 0.5]
        ];
        let rows: Vec<usize> = (0..20).map(|i| i % 4).collect();
        let rotation = prototypes.select(Axis(0), &rows);
        let attrs = AttributeSet::new()
            .with(AttributeKey::Position, Array2::zeros((20, 3)))
            .with(AttributeKey::Rotation, rotation.clone());

        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(4));
        let (ids, codebook) = quantizer.quantize(&attrs, true).unwrap();
        let restored = dequantize(&ids, &codebook, Array2::zeros((20, 3))).unwrap();
        let restored_rotation = restored.get(AttributeKey::Rotation).unwrap();
        for (a, b) in restored_rotation.iter().zip(rotation.iter()) {
            assert!((a - b).abs() < 1e-6);
        }

        let (again, _) = quantizer.quantize(&restored, false).unwrap();
        assert_eq!(again, ids);
    }

    #[test]
    fn test_dequantize_rejects_out_of_range_and_mismatched_lengths() {
        let mut codebook = Codebook::new();
        codebook.insert(Channel::Opacity, Array2::zeros((256, 1))).unwrap();

        let mut ids = ClusterIds::new();
        ids.insert(Channel::Opacity, array![1u32, 300]);
        assert!(matches!(
            dequantize(&ids, &codebook, Array2::zeros((2, 3))),
            Err(GsvqError::IndexOutOfRange { index: 300, cluster_count: 256, .. })
        ));

        let mut ids = ClusterIds::new();
        ids.insert(Channel::Opacity, array![1u32]);
        assert!(matches!(
            dequantize(&ids, &codebook, Array2::zeros((2, 3))),
            Err(GsvqError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_exclude_zero_rest_reserves_zero_row() {
        let mut attrs = synthetic_attrs(30, 1);
        let mut rest = attrs.get(AttributeKey::FeatureRest(0)).unwrap().clone();
        for i in (0..30).step_by(3) {
            rest.row_mut(i).fill(0.0);
        }
        attrs.insert(AttributeKey::FeatureRest(0), rest);

        let config = ClusterConfig {
            exclude_zero_rest: true,
            ..ClusterConfig::uniform(4)
        };
        let mut quantizer = VectorQuantizer::new(config);
        let (ids, codebook) = quantizer.quantize(&attrs, true).unwrap();

        let table = codebook.get(Channel::FeatureRest(0)).unwrap();
        assert!(table.row(0).iter().all(|&v| v == 0.0));
        let rest_ids = ids.get(Channel::FeatureRest(0)).unwrap();
        for i in (0..30).step_by(3) {
            assert_eq!(rest_ids[i], 0);
        }
    }

    #[test]
    fn test_dequantize_into_replaces_model_attributes() {
        let attrs = synthetic_attrs(16, 1);
        let mut model = GaussianModel::from_attributes(1, attrs.clone()).unwrap();
        let mut quantizer = VectorQuantizer::new(ClusterConfig::uniform(3));
        let (ids, codebook) = quantizer.quantize(&attrs, true).unwrap();

        let positions = attrs.get(AttributeKey::Position).unwrap().clone();
        dequantize_into(&mut model, &ids, &codebook, positions).unwrap();
        let expected = codebook
            .lookup(Channel::Scale, ids.get(Channel::Scale).unwrap().view())
            .unwrap();
        assert_eq!(model.attribute_set().get(AttributeKey::Scale), Some(&expected));
    }
}
