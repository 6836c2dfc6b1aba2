//! Codebooks (per-channel centroid tables) and the cluster id arrays that index them.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::GsvqError;
use crate::types::{Channel, MAX_BAND_DEGREE};

//==================================================================================
// 1. Codebook
//==================================================================================

/// Per-channel centroid tables of shape `(cluster_count, D)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Codebook {
    entries: BTreeMap<Channel, Array2<f32>>,
}

impl Codebook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the table for `channel`. A table needs at least one row
    /// and one column.
    pub fn insert(&mut self, channel: Channel, centroids: Array2<f32>) -> Result<(), GsvqError> {
        if centroids.nrows() == 0 || centroids.ncols() == 0 {
            return Err(GsvqError::CodebookShape(format!(
                "Codebook for '{}' must be non-empty, got shape {:?}",
                channel,
                centroids.dim()
            )));
        }
        self.entries.insert(channel, centroids);
        Ok(())
    }

    pub fn get(&self, channel: Channel) -> Option<&Array2<f32>> {
        self.entries.get(&channel)
    }

    pub fn cluster_count(&self, channel: Channel) -> Option<usize> {
        self.entries.get(&channel).map(|c| c.nrows())
    }

    /// The cluster count of every channel. This is all a record layout needs.
    pub fn cluster_counts(&self) -> BTreeMap<Channel, usize> {
        self.entries
            .iter()
            .map(|(channel, c)| (*channel, c.nrows()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &Array2<f32>)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of rest bands covered by this codebook.
    pub fn band_degree(&self) -> usize {
        self.entries
            .keys()
            .filter_map(|c| match c {
                Channel::FeatureRest(band) => Some(*band as usize + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Row-wise lookup `self[channel][ids]`. Any id outside the table fails;
    /// ids are never clamped.
    pub fn lookup(&self, channel: Channel, ids: ArrayView1<'_, u32>) -> Result<Array2<f32>, GsvqError> {
        let centroids = self.entries.get(&channel).ok_or_else(|| {
            GsvqError::CodebookShape(format!("Codebook has no entry for channel '{}'", channel))
        })?;
        let cluster_count = centroids.nrows();

        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= cluster_count) {
            return Err(GsvqError::IndexOutOfRange {
                channel: channel.name(),
                index: bad as i64,
                cluster_count,
            });
        }
        let rows: Vec<usize> = ids.iter().map(|&id| id as usize).collect();
        Ok(centroids.select(Axis(0), &rows))
    }

    /// The tables of `channels` only; channels without a table are skipped.
    pub fn restricted(&self, channels: impl IntoIterator<Item = Channel>) -> Codebook {
        let entries = channels
            .into_iter()
            .filter_map(|channel| self.entries.get(&channel).map(|c| (channel, c.clone())))
            .collect();
        Codebook { entries }
    }

    /// Validates against `degree` and drops the rest bands a model of that
    /// degree does not have.
    pub fn for_degree(&self, degree: usize) -> Result<Codebook, GsvqError> {
        self.validate_for_degree(degree)?;
        Ok(self.restricted(required_channels(degree)))
    }

    /// Checks that this codebook can decode a model with `degree` rest bands:
    /// every channel present, each with the width the channel requires. Bands
    /// beyond `degree` are ignored.
    pub fn validate_for_degree(&self, degree: usize) -> Result<(), GsvqError> {
        if degree > MAX_BAND_DEGREE {
            return Err(GsvqError::UnsupportedDegree {
                requested: degree,
                supported: MAX_BAND_DEGREE,
            });
        }
        let codebook_degree = self.band_degree();
        if codebook_degree < degree {
            return Err(GsvqError::UnsupportedDegree {
                requested: degree,
                supported: codebook_degree,
            });
        }

        for channel in required_channels(degree) {
            let centroids = self.entries.get(&channel).ok_or_else(|| {
                GsvqError::CodebookShape(format!("Codebook is missing channel '{}'", channel))
            })?;
            check_channel_width(channel, centroids.ncols())?;
        }
        Ok(())
    }
}

fn required_channels(degree: usize) -> Vec<Channel> {
    let mut required = vec![
        Channel::Scale,
        Channel::RotationRe,
        Channel::RotationIm,
        Channel::Opacity,
        Channel::FeatureDc,
    ];
    required.extend((0..degree).map(|b| Channel::FeatureRest(b as u8)));
    required
}

/// Validates a table width against the channel's definition.
pub(crate) fn check_channel_width(channel: Channel, cols: usize) -> Result<(), GsvqError> {
    let ok = match channel.fixed_dim() {
        Some(dim) => cols == dim,
        None => cols == 3 || cols == 1,
    };
    if ok {
        Ok(())
    } else {
        Err(GsvqError::CodebookShape(format!(
            "Codebook for '{}' has {} columns, which does not match the channel",
            channel, cols
        )))
    }
}

//==================================================================================
// 2. Cluster Ids
//==================================================================================

/// The per-channel index arrays produced by quantization (or by parsing codec output).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterIds {
    ids: BTreeMap<Channel, Array1<u32>>,
}

impl ClusterIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: Channel, ids: Array1<u32>) -> Option<Array1<u32>> {
        self.ids.insert(channel, ids)
    }

    pub fn get(&self, channel: Channel) -> Option<&Array1<u32>> {
        self.ids.get(&channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &Array1<u32>)> {
        self.ids.iter().map(|(k, v)| (*k, v))
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.ids.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Largest id of `channel`, if it has any ids.
    pub fn max_id(&self, channel: Channel) -> Option<u32> {
        self.ids.get(&channel).and_then(|ids| ids.iter().copied().max())
    }
}
