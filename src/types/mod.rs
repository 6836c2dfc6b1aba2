//! This module defines the core, strongly-typed data representations used
//! throughout the gsvq pipeline.
//!
//! It includes the attribute and channel names that replace fragile string
//! matching on attribute names, the `AttributeSet` container, and the
//! `FieldType` enum describing the numeric type of each packed record field.

pub mod attribute;
pub mod field_type;

// Re-export the main type(s) for easier access.
pub use attribute::{rest_band_dim, AttributeKey, AttributeSet, Channel, MAX_BAND_DEGREE};
pub use field_type::{FieldType, SUPPORTED_ID_WIDTHS};
