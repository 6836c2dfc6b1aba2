//! Strongly-typed names for per-point attributes and quantization channels, and
//! the `AttributeSet` container that holds a model's attribute arrays.
//!
//! Attribute and channel names are part of the persisted contract (they key the
//! codebook side artifact), so their string forms must never change.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::Array2;

use crate::error::GsvqError;

//==================================================================================
// 0. Constants
//==================================================================================

/// The highest color band degree the layout and codebook understand.
pub const MAX_BAND_DEGREE: usize = 3;

/// Number of floats in rest band `band` (zero-based): `2b + 3` coefficients per color channel.
pub fn rest_band_dim(band: usize) -> usize {
    3 * (2 * band + 3)
}

//==================================================================================
// 1. Attribute Keys
//==================================================================================

/// A named per-point attribute of a splat model.
///
/// The derived ordering is the canonical field order used everywhere a
/// deterministic order matters (record layouts, codebook files).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttributeKey {
    Position,
    Scale,
    Rotation,
    Opacity,
    FeatureDc,
    /// Zero-based rest band index.
    FeatureRest(u8),
}

impl AttributeKey {
    pub fn name(&self) -> String {
        match self {
            Self::Position => "position".to_string(),
            Self::Scale => "scale".to_string(),
            Self::Rotation => "rotation".to_string(),
            Self::Opacity => "opacity".to_string(),
            Self::FeatureDc => "feature_dc".to_string(),
            Self::FeatureRest(band) => format!("feature_rest_{}", band),
        }
    }

    /// Returns `true` if an array of width `dim` is valid for this attribute.
    pub fn accepts_dim(&self, dim: usize) -> bool {
        match self {
            Self::Position => dim == 3,
            Self::Scale | Self::FeatureDc => dim == 3 || dim == 1,
            Self::Rotation => dim == 4,
            Self::Opacity => dim == 1,
            Self::FeatureRest(band) => dim == rest_band_dim(*band as usize),
        }
    }

    fn expected_dims(&self) -> String {
        match self {
            Self::Scale | Self::FeatureDc => "3 or 1".to_string(),
            Self::Position => "3".to_string(),
            Self::Rotation => "4".to_string(),
            Self::Opacity => "1".to_string(),
            Self::FeatureRest(band) => rest_band_dim(*band as usize).to_string(),
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for AttributeKey {
    type Err = GsvqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position" => Ok(Self::Position),
            "scale" => Ok(Self::Scale),
            "rotation" => Ok(Self::Rotation),
            "opacity" => Ok(Self::Opacity),
            "feature_dc" => Ok(Self::FeatureDc),
            other => parse_band(other, "feature_rest_")
                .map(Self::FeatureRest)
                .ok_or_else(|| GsvqError::Format(format!("Unknown attribute name '{}'", other))),
        }
    }
}

//==================================================================================
// 2. Quantization Channels
//==================================================================================

/// The unit of clustering. Every attribute except `position` maps to one channel,
/// except `rotation`, which is split into its real and imaginary parts so the
/// two can be clustered independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Scale,
    RotationRe,
    RotationIm,
    Opacity,
    FeatureDc,
    FeatureRest(u8),
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Self::Scale => "scale".to_string(),
            Self::RotationRe => "rot_re".to_string(),
            Self::RotationIm => "rot_im".to_string(),
            Self::Opacity => "opacity".to_string(),
            Self::FeatureDc => "feature_dc".to_string(),
            Self::FeatureRest(band) => format!("feature_rest_{}", band),
        }
    }

    /// The attribute this channel is derived from.
    pub fn source(&self) -> AttributeKey {
        match self {
            Self::Scale => AttributeKey::Scale,
            Self::RotationRe | Self::RotationIm => AttributeKey::Rotation,
            Self::Opacity => AttributeKey::Opacity,
            Self::FeatureDc => AttributeKey::FeatureDc,
            Self::FeatureRest(band) => AttributeKey::FeatureRest(*band),
        }
    }

    /// Channel width when it is fixed by definition; `None` for `scale` and
    /// `feature_dc`, which follow the model.
    pub fn fixed_dim(&self) -> Option<usize> {
        match self {
            Self::RotationRe | Self::Opacity => Some(1),
            Self::RotationIm => Some(3),
            Self::FeatureRest(band) => Some(rest_band_dim(*band as usize)),
            Self::Scale | Self::FeatureDc => None,
        }
    }

    /// The channels that cover `attrs`, in canonical order.
    pub fn channels_for(attrs: &AttributeSet) -> Vec<Channel> {
        let mut channels = Vec::new();
        for key in attrs.keys() {
            match key {
                AttributeKey::Position => {}
                AttributeKey::Scale => channels.push(Self::Scale),
                AttributeKey::Rotation => {
                    channels.push(Self::RotationRe);
                    channels.push(Self::RotationIm);
                }
                AttributeKey::Opacity => channels.push(Self::Opacity),
                AttributeKey::FeatureDc => channels.push(Self::FeatureDc),
                AttributeKey::FeatureRest(band) => channels.push(Self::FeatureRest(band)),
            }
        }
        channels
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Channel {
    type Err = GsvqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scale" => Ok(Self::Scale),
            "rot_re" => Ok(Self::RotationRe),
            "rot_im" => Ok(Self::RotationIm),
            "opacity" => Ok(Self::Opacity),
            "feature_dc" => Ok(Self::FeatureDc),
            other => parse_band(other, "feature_rest_")
                .map(Self::FeatureRest)
                .ok_or_else(|| GsvqError::Format(format!("Unknown channel name '{}'", other))),
        }
    }
}

fn parse_band(name: &str, prefix: &str) -> Option<u8> {
    name.strip_prefix(prefix)?.parse::<u8>().ok()
}

//==================================================================================
// 3. AttributeSet
//==================================================================================

/// A mapping from attribute to a dense `(N, D)` array. `N` is shared by every
/// attribute in a valid set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet {
    attributes: BTreeMap<AttributeKey, Array2<f32>>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: AttributeKey, values: Array2<f32>) -> Option<Array2<f32>> {
        self.attributes.insert(key, values)
    }

    /// Builder-style insert, convenient when assembling sets in tests.
    pub fn with(mut self, key: AttributeKey, values: Array2<f32>) -> Self {
        self.attributes.insert(key, values);
        self
    }

    pub fn get(&self, key: AttributeKey) -> Option<&Array2<f32>> {
        self.attributes.get(&key)
    }

    /// Like `get`, but a missing attribute is an error.
    pub fn require(&self, key: AttributeKey) -> Result<&Array2<f32>, GsvqError> {
        self.attributes
            .get(&key)
            .ok_or_else(|| GsvqError::MissingAttribute(key.name()))
    }

    pub fn remove(&mut self, key: AttributeKey) -> Option<Array2<f32>> {
        self.attributes.remove(&key)
    }

    pub fn contains(&self, key: AttributeKey) -> bool {
        self.attributes.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = AttributeKey> + '_ {
        self.attributes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttributeKey, &Array2<f32>)> {
        self.attributes.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// The column count of every attribute.
    pub fn dims(&self) -> BTreeMap<AttributeKey, usize> {
        self.attributes
            .iter()
            .map(|(key, values)| (*key, values.ncols()))
            .collect()
    }

    /// Number of rest bands present. Assumes the bands are contiguous; `validate`
    /// enforces that.
    pub fn band_degree(&self) -> usize {
        self.attributes
            .keys()
            .filter_map(|k| match k {
                AttributeKey::FeatureRest(band) => Some(*band as usize + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// The shared point count, or `ShapeMismatch` if the attributes disagree.
    /// An empty set has zero points.
    pub fn num_points(&self) -> Result<usize, GsvqError> {
        let mut iter = self.attributes.iter();
        let Some((first_key, first)) = iter.next() else {
            return Ok(0);
        };
        let n = first.nrows();
        for (key, values) in iter {
            if values.nrows() != n {
                return Err(GsvqError::shape(
                    key.name(),
                    format!("{} rows (as in '{}')", n, first_key),
                    format!("{} rows", values.nrows()),
                ));
            }
        }
        Ok(n)
    }

    /// Checks every structural invariant of the set and returns `N`.
    ///
    /// * all attributes share one row count,
    /// * every attribute has a width it accepts,
    /// * rest bands are contiguous from zero and do not exceed `MAX_BAND_DEGREE`.
    pub fn validate(&self) -> Result<usize, GsvqError> {
        let n = self.num_points()?;

        for (key, values) in &self.attributes {
            if !key.accepts_dim(values.ncols()) {
                return Err(GsvqError::shape(
                    key.name(),
                    format!("{} columns", key.expected_dims()),
                    format!("{} columns", values.ncols()),
                ));
            }
        }

        let degree = self.band_degree();
        if degree > MAX_BAND_DEGREE {
            return Err(GsvqError::UnsupportedDegree {
                requested: degree,
                supported: MAX_BAND_DEGREE,
            });
        }
        for band in 0..degree {
            if !self.contains(AttributeKey::FeatureRest(band as u8)) {
                return Err(GsvqError::MissingAttribute(
                    AttributeKey::FeatureRest(band as u8).name(),
                ));
            }
        }
        Ok(n)
    }
}

impl FromIterator<(AttributeKey, Array2<f32>)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (AttributeKey, Array2<f32>)>>(iter: I) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}
