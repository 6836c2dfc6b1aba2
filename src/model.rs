//! The model interface consumed by the pipeline, and a plain in-memory model.
//!
//! Training and rendering live elsewhere; the pipeline only needs to read a
//! model's attributes, write reconstructed attributes back, and know the band
//! degree the model was built for.

use crate::error::GsvqError;
use crate::types::{AttributeKey, AttributeSet, MAX_BAND_DEGREE};

/// What the compression pipeline needs from a splat model.
pub trait SplatModel {
    /// A snapshot of the model's current attributes.
    fn attributes(&self) -> AttributeSet;

    /// Replaces the model's attributes wholesale.
    fn set_attributes(&mut self, attributes: AttributeSet) -> Result<(), GsvqError>;

    /// The number of rest bands the model is configured for.
    fn max_band_degree(&self) -> usize;
}

/// A Gaussian splat model held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaussianModel {
    degree: usize,
    attributes: AttributeSet,
}

impl GaussianModel {
    /// An empty model for `degree` rest bands.
    pub fn new(degree: usize) -> Result<Self, GsvqError> {
        if degree > MAX_BAND_DEGREE {
            return Err(GsvqError::UnsupportedDegree {
                requested: degree,
                supported: MAX_BAND_DEGREE,
            });
        }
        Ok(Self {
            degree,
            attributes: AttributeSet::new(),
        })
    }

    /// A model populated with `attributes`, validated against `degree`.
    pub fn from_attributes(degree: usize, attributes: AttributeSet) -> Result<Self, GsvqError> {
        let mut model = Self::new(degree)?;
        model.set_attributes(attributes)?;
        Ok(model)
    }

    pub fn attribute_set(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn num_points(&self) -> usize {
        self.attributes
            .get(AttributeKey::Position)
            .map_or(0, |p| p.nrows())
    }
}

impl SplatModel for GaussianModel {
    fn attributes(&self) -> AttributeSet {
        self.attributes.clone()
    }

    fn set_attributes(&mut self, attributes: AttributeSet) -> Result<(), GsvqError> {
        attributes.validate()?;
        if attributes.band_degree() != self.degree {
            return Err(GsvqError::UnsupportedDegree {
                requested: attributes.band_degree(),
                supported: self.degree,
            });
        }
        self.attributes = attributes;
        Ok(())
    }

    fn max_band_degree(&self) -> usize {
        self.degree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::rest_band_dim;
    use ndarray::Array2;

    #[test]
    fn test_model_rejects_band_count_other_than_its_degree() {
        let mut model = GaussianModel::new(1).unwrap();
        let attrs = AttributeSet::new().with(AttributeKey::Position, Array2::zeros((2, 3)));
        assert!(matches!(
            model.set_attributes(attrs),
            Err(GsvqError::UnsupportedDegree { .. })
        ));

        let attrs = AttributeSet::new()
            .with(AttributeKey::Position, Array2::zeros((2, 3)))
            .with(AttributeKey::FeatureRest(0), Array2::zeros((2, rest_band_dim(0))));
        model.set_attributes(attrs).unwrap();
        assert_eq!(model.num_points(), 2);
        assert_eq!(model.max_band_degree(), 1);
    }

    #[test]
    fn test_model_degree_is_bounded() {
        assert!(GaussianModel::new(MAX_BAND_DEGREE).is_ok());
        assert!(GaussianModel::new(MAX_BAND_DEGREE + 1).is_err());
    }
}
