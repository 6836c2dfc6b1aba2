//! This module defines the canonical, type-safe representation of the numeric
//! field types that can appear in a packed record schema.

use crate::error::GsvqError;
use arrow::datatypes::DataType as ArrowDataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The supported index widths, smallest first. Width selection walks this list
/// and picks the first entry able to represent the largest cluster id.
pub const SUPPORTED_ID_WIDTHS: [FieldType; 3] =
    [FieldType::UInt8, FieldType::UInt16, FieldType::UInt32];

/// The numeric type of one field in the record schema.
///
/// The derived ordering is by width, so the common type of a channel group is
/// simply the maximum of its members.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldType {
    UInt8,
    UInt16,
    UInt32,
    Float32,
}

impl FieldType {
    /// Selects the smallest supported integer width that losslessly holds `max_id`.
    pub fn for_max_id(max_id: u64) -> Result<Self, GsvqError> {
        SUPPORTED_ID_WIDTHS
            .iter()
            .copied()
            .find(|width| width.max_value() >= max_id)
            .ok_or_else(|| {
                GsvqError::Layout(format!(
                    "Cluster id {} exceeds the widest supported index type",
                    max_id
                ))
            })
    }

    /// Width selection keyed on the codebook size rather than the id itself.
    pub fn for_cluster_count(cluster_count: usize) -> Result<Self, GsvqError> {
        if cluster_count == 0 {
            return Err(GsvqError::Layout(
                "A channel must have at least one cluster".to_string(),
            ));
        }
        Self::for_max_id(cluster_count as u64 - 1)
    }

    /// The largest integer value exactly representable by the type.
    pub fn max_value(&self) -> u64 {
        match self {
            Self::UInt8 => u8::MAX as u64,
            Self::UInt16 => u16::MAX as u64,
            Self::UInt32 => u32::MAX as u64,
            // f32 has a 24-bit mantissa.
            Self::Float32 => 1 << 24,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Self::UInt8 => 8,
            Self::UInt16 => 16,
            Self::UInt32 | Self::Float32 => 32,
        }
    }

    pub fn is_index(&self) -> bool {
        !matches!(self, Self::Float32)
    }

    /// Converts a `FieldType` into the Arrow `DataType` used in record batches.
    pub fn to_arrow_type(&self) -> ArrowDataType {
        match self {
            Self::UInt8 => ArrowDataType::UInt8,
            Self::UInt16 => ArrowDataType::UInt16,
            Self::UInt32 => ArrowDataType::UInt32,
            Self::Float32 => ArrowDataType::Float32,
        }
    }

    /// Converts an Arrow `DataType` back into a `FieldType`.
    pub fn from_arrow_type(arrow_type: &ArrowDataType) -> Result<Self, GsvqError> {
        match arrow_type {
            ArrowDataType::UInt8 => Ok(Self::UInt8),
            ArrowDataType::UInt16 => Ok(Self::UInt16),
            ArrowDataType::UInt32 => Ok(Self::UInt32),
            ArrowDataType::Float32 => Ok(Self::Float32),
            dt => Err(GsvqError::Layout(format!(
                "Cannot convert Arrow type {:?} to a record field type",
                dt
            ))),
        }
    }

    /// The PLY property type name for this field.
    pub fn ply_name(&self) -> &'static str {
        match self {
            Self::UInt8 => "uchar",
            Self::UInt16 => "ushort",
            Self::UInt32 => "uint",
            Self::Float32 => "float",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_selection_boundaries() {
        assert_eq!(FieldType::for_max_id(0).unwrap(), FieldType::UInt8);
        assert_eq!(FieldType::for_max_id(255).unwrap(), FieldType::UInt8);
        assert_eq!(FieldType::for_max_id(256).unwrap(), FieldType::UInt16);
        assert_eq!(FieldType::for_max_id(65_535).unwrap(), FieldType::UInt16);
        assert_eq!(FieldType::for_max_id(65_536).unwrap(), FieldType::UInt32);
        assert!(FieldType::for_max_id(u64::MAX).is_err());
    }

    #[test]
    fn test_cluster_count_maps_to_max_id() {
        assert_eq!(FieldType::for_cluster_count(1).unwrap(), FieldType::UInt8);
        assert_eq!(FieldType::for_cluster_count(256).unwrap(), FieldType::UInt8);
        assert_eq!(FieldType::for_cluster_count(300).unwrap(), FieldType::UInt16);
        assert!(matches!(
            FieldType::for_cluster_count(0),
            Err(GsvqError::Layout(_))
        ));
    }

    #[test]
    fn test_arrow_type_mapping_is_bidirectional() {
        for ft in [
            FieldType::UInt8,
            FieldType::UInt16,
            FieldType::UInt32,
            FieldType::Float32,
        ] {
            assert_eq!(FieldType::from_arrow_type(&ft.to_arrow_type()).unwrap(), ft);
        }
        assert!(FieldType::from_arrow_type(&ArrowDataType::Utf8).is_err());
    }

    #[test]
    fn test_ordering_is_by_width() {
        assert!(FieldType::UInt8 < FieldType::UInt16);
        assert!(FieldType::UInt16 < FieldType::UInt32);
        assert_eq!(
            [FieldType::UInt16, FieldType::UInt8].iter().max(),
            Some(&FieldType::UInt16)
        );
    }
}
