//! Record layouts: how an attribute set (or its cluster ids) is flattened into
//! one Arrow `RecordBatch` row per point for the codec.
//!
//! The quantized layout is derived from cluster counts alone, so compression and
//! decompression always agree on it as long as they see the same codebook.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float32Array, PrimitiveArray, UInt16Array, UInt32Array, UInt8Array};
use arrow::datatypes::{
    ArrowPrimitiveType, DataType, Field, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, Schema, SchemaRef, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use ndarray::{Array1, Array2};
use num_traits::{NumCast, ToPrimitive};

use crate::config::QuantizationBits;
use crate::error::GsvqError;
use crate::quantization::ClusterIds;
use crate::types::{AttributeKey, AttributeSet, Channel, FieldType, MAX_BAND_DEGREE};


/// Field metadata key naming the channel group a field belongs to.
pub const GROUP_METADATA_KEY: &str = "gsvq.group";

const POSITION_FIELDS: [&str; 3] = ["x", "y", "z"];
const NORMAL_FIELDS: [&str; 3] = ["nx", "ny", "nz"];
const FLAT_REST_PREFIX: &str = "f_rest_";

//==================================================================================
// 1. Groups & Members
//==================================================================================

/// The tag of a channel group. All fields of a group share one numeric type and
/// one codec bit depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKind {
    Position,
    Scale,
    Rotation,
    Opacity,
    FeatureDc,
    FeatureRest,
}

impl GroupKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Scale => "scale",
            Self::Rotation => "rotation",
            Self::Opacity => "opacity",
            Self::FeatureDc => "feature_dc",
            Self::FeatureRest => "feature_rest",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "position" => Some(Self::Position),
            "scale" => Some(Self::Scale),
            "rotation" => Some(Self::Rotation),
            "opacity" => Some(Self::Opacity),
            "feature_dc" => Some(Self::FeatureDc),
            "feature_rest" => Some(Self::FeatureRest),
            _ => None,
        }
    }

    /// The codec bit depth configured for this group.
    pub fn quantization_bits(&self, bits: &QuantizationBits) -> u8 {
        match self {
            Self::Position => bits.position,
            Self::Scale => bits.scale,
            Self::Rotation => bits.rotation,
            Self::Opacity => bits.opacity,
            Self::FeatureDc => bits.feature_dc,
            Self::FeatureRest => bits.feature_rest,
        }
    }

    fn of_attribute(key: AttributeKey) -> Self {
        match key {
            AttributeKey::Position => Self::Position,
            AttributeKey::Scale => Self::Scale,
            AttributeKey::Rotation => Self::Rotation,
            AttributeKey::Opacity => Self::Opacity,
            AttributeKey::FeatureDc => Self::FeatureDc,
            AttributeKey::FeatureRest(_) => Self::FeatureRest,
        }
    }

    fn of_channel(channel: Channel) -> Self {
        Self::of_attribute(channel.source())
    }
}

/// Where the values of one record field come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// A column of the position array.
    Position(usize),
    /// The cluster ids of a channel.
    ClusterId(Channel),
    /// A column of a raw (unquantized) attribute.
    Component(AttributeKey, usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub name: String,
    pub source: FieldSource,
    /// Set for cluster id fields; ids must fall in `[0, cluster_count)`.
    pub cluster_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub kind: GroupKind,
    pub field_type: FieldType,
    pub members: Vec<GroupMember>,
}

//==================================================================================
// 2. Layout Derivation
//==================================================================================

/// An ordered list of channel groups; flattening the members in order gives the
/// record schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    groups: Vec<ChannelGroup>,
}

impl RecordLayout {
    /// The layout for the quantized backend: `x, y, z` as f32, then one index
    /// field per channel in canonical order.
    ///
    /// Each index field gets the smallest width able to hold `cluster_count - 1`;
    /// grouped channels (the rotation pair, all rest bands) are widened to the
    /// widest member.
    pub fn quantized(cluster_counts: &BTreeMap<Channel, usize>) -> Result<Self, GsvqError> {
        let has_re = cluster_counts.contains_key(&Channel::RotationRe);
        let has_im = cluster_counts.contains_key(&Channel::RotationIm);
        if has_re != has_im {
            return Err(GsvqError::Layout(
                "rot_re and rot_im must be quantized together".to_string(),
            ));
        }

        let mut groups = vec![position_group()];
        for (&channel, &count) in cluster_counts {
            let kind = GroupKind::of_channel(channel);
            let width = FieldType::for_cluster_count(count)?;
            let member = GroupMember {
                name: channel.name(),
                source: FieldSource::ClusterId(channel),
                cluster_count: Some(count),
            };
            // Channels of one group are adjacent in canonical order.
            match groups.last_mut() {
                Some(group) if group.kind == kind => {
                    group.field_type = group.field_type.max(width);
                    group.members.push(member);
                }
                _ => groups.push(ChannelGroup {
                    kind,
                    field_type: width,
                    members: vec![member],
                }),
            }
        }

        let layout = Self { groups };
        layout.log_groups("quantized");
        Ok(layout)
    }

    /// The layout for the raw backend: every component of every attribute
    /// becomes an f32 field.
    pub fn raw(dims: &BTreeMap<AttributeKey, usize>) -> Result<Self, GsvqError> {
        if !dims.contains_key(&AttributeKey::Position) {
            return Err(GsvqError::MissingAttribute(AttributeKey::Position.name()));
        }

        let degree = rest_degree(dims.keys().copied());
        let mut groups = Vec::with_capacity(dims.len());
        for (&key, &dim) in dims {
            if !key.accepts_dim(dim) {
                return Err(GsvqError::shape(
                    key.name(),
                    "a valid attribute width",
                    format!("{} columns", dim),
                ));
            }
            if key == AttributeKey::Position {
                groups.push(position_group());
                continue;
            }
            let kind = GroupKind::of_attribute(key);
            let members = (0..dim).map(|col| GroupMember {
                name: raw_field_name(key, col, degree),
                source: FieldSource::Component(key, col),
                cluster_count: None,
            });
            match groups.last_mut() {
                Some(group) if group.kind == kind => group.members.extend(members),
                _ => groups.push(ChannelGroup {
                    kind,
                    field_type: FieldType::Float32,
                    members: members.collect(),
                }),
            }
        }

        let layout = Self { groups };
        layout.log_groups("raw");
        Ok(layout)
    }

    /// Rebuilds a raw layout from the field names of a decoded record schema.
    /// Normal fields (`nx, ny, nz`) are ignored.
    pub fn raw_from_schema(schema: &Schema) -> Result<Self, GsvqError> {
        let rest_fields = schema
            .fields()
            .iter()
            .filter(|f| f.name().starts_with(FLAT_REST_PREFIX))
            .count();
        let degree = (0..=MAX_BAND_DEGREE)
            .find(|&d| 3 * rest_coefficients(d) == rest_fields)
            .ok_or_else(|| {
                GsvqError::Layout(format!(
                    "{} '{}*' fields do not form a whole number of rest bands",
                    rest_fields, FLAT_REST_PREFIX
                ))
            })?;

        let mut dims: BTreeMap<AttributeKey, usize> = BTreeMap::new();
        for field in schema.fields() {
            let Some((key, col)) = parse_raw_field_name(field.name(), degree)? else {
                continue;
            };
            let dim = dims.entry(key).or_insert(0);
            *dim = (*dim).max(col + 1);
        }
        Self::raw(&dims)
    }

    pub fn groups(&self) -> &[ChannelGroup] {
        &self.groups
    }

    pub fn num_fields(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }

    /// The numeric type chosen for `channel`'s index field, if the layout has one.
    pub fn index_type(&self, channel: Channel) -> Option<FieldType> {
        self.groups
            .iter()
            .find(|g| {
                g.members
                    .iter()
                    .any(|m| m.source == FieldSource::ClusterId(channel))
            })
            .map(|g| g.field_type)
    }

    /// The Arrow fields in record order, each tagged with its group.
    pub fn fields(&self) -> Vec<Field> {
        self.members()
            .map(|(group, member)| {
                let metadata =
                    HashMap::from([(GROUP_METADATA_KEY.to_string(), group.kind.name().to_string())]);
                Field::new(&member.name, group.field_type.to_arrow_type(), false).with_metadata(metadata)
            })
            .collect()
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(self.fields()))
    }

    fn members(&self) -> impl Iterator<Item = (&ChannelGroup, &GroupMember)> {
        self.groups
            .iter()
            .flat_map(|g| g.members.iter().map(move |m| (g, m)))
    }

    fn log_groups(&self, flavour: &str) {
        for group in &self.groups {
            log::debug!(
                "{} layout group '{}': {} fields as {}",
                flavour,
                group.kind.name(),
                group.members.len(),
                group.field_type
            );
        }
    }

    //==============================================================================
    // 3. Packing
    //==============================================================================

    /// Packs positions and cluster ids into a record batch with one row per point.
    pub fn pack_quantized(
        &self,
        positions: &Array2<f32>,
        ids: &ClusterIds,
    ) -> Result<RecordBatch, GsvqError> {
        let n = check_positions(positions)?;
        for channel in ids.channels() {
            if self.index_type(channel).is_none() {
                return Err(GsvqError::Layout(format!(
                    "Cluster ids for '{}' have no field in the layout",
                    channel
                )));
            }
        }

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.num_fields());
        for (group, member) in self.members() {
            let column = match member.source {
                FieldSource::Position(col) => float_column(positions.column(col).iter().copied()),
                FieldSource::ClusterId(channel) => {
                    let values = ids.get(channel).ok_or_else(|| {
                        GsvqError::Layout(format!("No cluster ids for field '{}'", member.name))
                    })?;
                    if values.len() != n {
                        return Err(GsvqError::shape(
                            &member.name,
                            format!("{} ids", n),
                            format!("{} ids", values.len()),
                        ));
                    }
                    let cluster_count = member.cluster_count.unwrap_or(0);
                    if let Some(&bad) = values.iter().find(|&&id| id as usize >= cluster_count) {
                        return Err(GsvqError::IndexOutOfRange {
                            channel: member.name.clone(),
                            index: bad as i64,
                            cluster_count,
                        });
                    }
                    index_column(group.field_type, values, &member.name)?
                }
                FieldSource::Component(..) => {
                    return Err(GsvqError::Layout(format!(
                        "Field '{}' is a raw component, not part of a quantized layout",
                        member.name
                    )))
                }
            };
            columns.push(column);
        }
        Ok(RecordBatch::try_new(self.schema(), columns)?)
    }

    /// Packs every attribute component as f32.
    pub fn pack_raw(&self, attrs: &AttributeSet) -> Result<RecordBatch, GsvqError> {
        attrs.validate()?;
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.num_fields());
        for (_, member) in self.members() {
            let (key, col) = match member.source {
                FieldSource::Position(col) => (AttributeKey::Position, col),
                FieldSource::Component(key, col) => (key, col),
                FieldSource::ClusterId(_) => {
                    return Err(GsvqError::Layout(format!(
                        "Field '{}' is a cluster id, not part of a raw layout",
                        member.name
                    )))
                }
            };
            let values = attrs.require(key)?;
            if col >= values.ncols() {
                return Err(GsvqError::shape(
                    key.name(),
                    format!("at least {} columns", col + 1),
                    format!("{} columns", values.ncols()),
                ));
            }
            columns.push(float_column(values.column(col).iter().copied()));
        }
        Ok(RecordBatch::try_new(self.schema(), columns)?)
    }

    //==============================================================================
    // 4. Parsing
    //==============================================================================

    /// Reads positions and cluster ids back from a decoded batch.
    ///
    /// Columns may have any numeric type. Index values are rounded to the
    /// nearest integer and must land in `[0, cluster_count)`.
    pub fn parse_quantized(&self, batch: &RecordBatch) -> Result<(Array2<f32>, ClusterIds), GsvqError> {
        let n = batch.num_rows();
        let mut positions = Array2::zeros((n, 3));
        let mut ids = ClusterIds::new();

        for (_, member) in self.members() {
            let values = column_values(batch, &member.name)?;
            match member.source {
                FieldSource::Position(col) => {
                    for (dst, v) in positions.column_mut(col).iter_mut().zip(values) {
                        *dst = v as f32;
                    }
                }
                FieldSource::ClusterId(channel) => {
                    let cluster_count = member.cluster_count.unwrap_or(0);
                    ids.insert(channel, round_ids(&values, &member.name, cluster_count)?);
                }
                FieldSource::Component(..) => {
                    return Err(GsvqError::Layout(format!(
                        "Field '{}' is a raw component, not part of a quantized layout",
                        member.name
                    )))
                }
            }
        }
        Ok((positions, ids))
    }

    /// Reads a full attribute set back from a decoded raw batch.
    pub fn parse_raw(&self, batch: &RecordBatch) -> Result<AttributeSet, GsvqError> {
        let n = batch.num_rows();
        let mut dims: BTreeMap<AttributeKey, usize> = BTreeMap::new();
        for (_, member) in self.members() {
            let (key, col) = raw_target(member)?;
            let dim = dims.entry(key).or_insert(0);
            *dim = (*dim).max(col + 1);
        }

        let mut arrays: BTreeMap<AttributeKey, Array2<f32>> = dims
            .iter()
            .map(|(&key, &dim)| (key, Array2::zeros((n, dim))))
            .collect();
        for (_, member) in self.members() {
            let (key, col) = raw_target(member)?;
            let values = column_values(batch, &member.name)?;
            if let Some(array) = arrays.get_mut(&key) {
                for (dst, v) in array.column_mut(col).iter_mut().zip(values) {
                    *dst = v as f32;
                }
            }
        }

        let attrs: AttributeSet = arrays.into_iter().collect();
        attrs.validate()?;
        Ok(attrs)
    }
}

//==================================================================================
// 5. Private Helpers
//==================================================================================

fn position_group() -> ChannelGroup {
    ChannelGroup {
        kind: GroupKind::Position,
        field_type: FieldType::Float32,
        members: POSITION_FIELDS
            .iter()
            .enumerate()
            .map(|(col, name)| GroupMember {
                name: name.to_string(),
                source: FieldSource::Position(col),
                cluster_count: None,
            })
            .collect(),
    }
}

/// Raw field names follow the Gaussian splat PLY convention. Rest bands are
/// flattened color-major across all bands: `f_rest_{color * C + coefficient}`
/// with `C` rest coefficients per color.
fn raw_field_name(key: AttributeKey, col: usize, degree: usize) -> String {
    match key {
        AttributeKey::Position => POSITION_FIELDS[col].to_string(),
        AttributeKey::Scale => format!("scale_{}", col),
        AttributeKey::Rotation => format!("rot_{}", col),
        AttributeKey::Opacity => "opacity".to_string(),
        AttributeKey::FeatureDc => format!("f_dc_{}", col),
        AttributeKey::FeatureRest(band) => {
            format!("{}{}", FLAT_REST_PREFIX, flat_rest_index(band as usize, col, degree))
        }
    }
}

/// Maps a raw field name back to its attribute column. `None` for fields the
/// layout skips.
fn parse_raw_field_name(name: &str, degree: usize) -> Result<Option<(AttributeKey, usize)>, GsvqError> {
    let unknown = || GsvqError::Layout(format!("Unknown raw record field '{}'", name));
    let index = |s: &str| s.parse::<usize>().map_err(|_| unknown());

    if NORMAL_FIELDS.contains(&name) {
        return Ok(None);
    }
    if let Some(col) = POSITION_FIELDS.iter().position(|&p| p == name) {
        return Ok(Some((AttributeKey::Position, col)));
    }
    if name == "opacity" {
        return Ok(Some((AttributeKey::Opacity, 0)));
    }
    let target = if let Some(flat) = name.strip_prefix(FLAT_REST_PREFIX) {
        let (band, col) = band_of_flat_rest(index(flat)?, degree).ok_or_else(unknown)?;
        (AttributeKey::FeatureRest(band), col)
    } else if let Some(col) = name.strip_prefix("scale_") {
        (AttributeKey::Scale, index(col)?)
    } else if let Some(col) = name.strip_prefix("rot_") {
        (AttributeKey::Rotation, index(col)?)
    } else if let Some(col) = name.strip_prefix("f_dc_") {
        (AttributeKey::FeatureDc, index(col)?)
    } else {
        return Err(unknown());
    };
    Ok(Some(target))
}

/// Rest coefficients per color for `degree` bands; also the offset of band `degree`.
fn rest_coefficients(degree: usize) -> usize {
    degree * (degree + 2)
}

fn rest_degree(keys: impl Iterator<Item = AttributeKey>) -> usize {
    keys.filter_map(|k| match k {
        AttributeKey::FeatureRest(band) => Some(band as usize + 1),
        _ => None,
    })
    .max()
    .unwrap_or(0)
}

/// Column `col` of band `band` (color-major, `2b + 3` coefficients per color)
/// to its flat rest index in a model with `degree` bands.
fn flat_rest_index(band: usize, col: usize, degree: usize) -> usize {
    let width = 2 * band + 3;
    let (color, coefficient) = (col / width, col % width);
    color * rest_coefficients(degree) + rest_coefficients(band) + coefficient
}

fn band_of_flat_rest(index: usize, degree: usize) -> Option<(u8, usize)> {
    let per_color = rest_coefficients(degree);
    if index >= 3 * per_color {
        return None;
    }
    let (color, coefficient) = (index / per_color, index % per_color);
    let band = (0..degree).find(|&b| coefficient < rest_coefficients(b + 1))?;
    let col = color * (2 * band + 3) + coefficient - rest_coefficients(band);
    Some((band as u8, col))
}

fn raw_target(member: &GroupMember) -> Result<(AttributeKey, usize), GsvqError> {
    match member.source {
        FieldSource::Position(col) => Ok((AttributeKey::Position, col)),
        FieldSource::Component(key, col) => Ok((key, col)),
        FieldSource::ClusterId(_) => Err(GsvqError::Layout(format!(
            "Field '{}' is a cluster id, not part of a raw layout",
            member.name
        ))),
    }
}

fn check_positions(positions: &Array2<f32>) -> Result<usize, GsvqError> {
    if positions.ncols() != 3 {
        return Err(GsvqError::shape(
            AttributeKey::Position.name(),
            "3 columns",
            format!("{} columns", positions.ncols()),
        ));
    }
    Ok(positions.nrows())
}

fn float_column(values: impl Iterator<Item = f32>) -> ArrayRef {
    Arc::new(Float32Array::from_iter_values(values))
}

/// Narrows ids to `T`, failing instead of truncating.
fn narrow<T: NumCast>(values: &Array1<u32>, name: &str) -> Result<Vec<T>, GsvqError> {
    values
        .iter()
        .map(|&id| {
            num_traits::cast::<u32, T>(id).ok_or_else(|| {
                GsvqError::Layout(format!("Cluster id {} does not fit the type of field '{}'", id, name))
            })
        })
        .collect()
}

fn index_column(field_type: FieldType, values: &Array1<u32>, name: &str) -> Result<ArrayRef, GsvqError> {
    Ok(match field_type {
        FieldType::UInt8 => Arc::new(UInt8Array::from(narrow::<u8>(values, name)?)),
        FieldType::UInt16 => Arc::new(UInt16Array::from(narrow::<u16>(values, name)?)),
        FieldType::UInt32 => Arc::new(UInt32Array::from(narrow::<u32>(values, name)?)),
        FieldType::Float32 => Arc::new(Float32Array::from(narrow::<f32>(values, name)?)),
    })
}

fn primitive_values<T>(array: &dyn Array) -> Option<Vec<f64>>
where
    T: ArrowPrimitiveType,
    T::Native: ToPrimitive,
{
    let array = array.as_any().downcast_ref::<PrimitiveArray<T>>()?;
    Some(
        array
            .values()
            .iter()
            .map(|v| v.to_f64().unwrap_or(f64::NAN))
            .collect(),
    )
}

/// Any numeric column widened to f64. Codecs are free to hand back a different
/// numeric type than the one that was encoded.
fn column_values(batch: &RecordBatch, name: &str) -> Result<Vec<f64>, GsvqError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| GsvqError::Layout(format!("Decoded records have no field '{}'", name)))?;
    if column.null_count() > 0 {
        return Err(GsvqError::Layout(format!("Field '{}' contains nulls", name)));
    }

    macro_rules! dispatch {
        ($($dt:ident => $T:ty),+ $(,)?) => {
            match column.data_type() {
                $(DataType::$dt => primitive_values::<$T>(column.as_ref()),)+
                _ => None,
            }
        };
    }
    let values = dispatch!(
        UInt8 => UInt8Type,
        UInt16 => UInt16Type,
        UInt32 => UInt32Type,
        UInt64 => UInt64Type,
        Int8 => Int8Type,
        Int16 => Int16Type,
        Int32 => Int32Type,
        Int64 => Int64Type,
        Float32 => Float32Type,
        Float64 => Float64Type,
    );
    values.ok_or_else(|| {
        GsvqError::Layout(format!(
            "Field '{}' has non-numeric type {:?}",
            name,
            column.data_type()
        ))
    })
}

fn round_ids(values: &[f64], name: &str, cluster_count: usize) -> Result<Array1<u32>, GsvqError> {
    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                return Err(GsvqError::Layout(format!(
                    "Field '{}' contains a non-finite index value",
                    name
                )));
            }
            let rounded = v.round();
            if rounded < 0.0 || rounded >= cluster_count as f64 {
                return Err(GsvqError::IndexOutOfRange {
                    channel: name.to_string(),
                    index: rounded as i64,
                    cluster_count,
                });
            }
            Ok(rounded as u32)
        })
        .collect()
}
