//! A minimal PLY reader/writer for the `vertex` element, used to exchange
//! records with external codec executables.
//!
//! Writing always produces `binary_little_endian`. Reading accepts ASCII and
//! both binary byte orders, every PLY scalar type, and skips any elements
//! (list properties included) that precede `vertex`.

use std::io::Write;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int16Array, Int32Array, Int8Array, UInt16Array,
    UInt32Array, UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use crate::error::GsvqError;

const VERTEX_ELEMENT: &str = "vertex";
/// Upper bound on rows reserved from a header's declared count; more rows are
/// still read, they just grow the column.
const MAX_PREALLOCATED_ROWS: usize = 1 << 20;

//==================================================================================
// 1. Scalar Types
//==================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl Scalar {
    fn parse(name: &str) -> Result<Self, GsvqError> {
        match name {
            "char" | "int8" => Ok(Self::Int8),
            "uchar" | "uint8" => Ok(Self::UInt8),
            "short" | "int16" => Ok(Self::Int16),
            "ushort" | "uint16" => Ok(Self::UInt16),
            "int" | "int32" => Ok(Self::Int32),
            "uint" | "uint32" => Ok(Self::UInt32),
            "float" | "float32" => Ok(Self::Float32),
            "double" | "float64" => Ok(Self::Float64),
            other => Err(GsvqError::Format(format!("Unknown PLY scalar type '{}'", other))),
        }
    }

    fn from_arrow(data_type: &DataType) -> Result<Self, GsvqError> {
        match data_type {
            DataType::Int8 => Ok(Self::Int8),
            DataType::UInt8 => Ok(Self::UInt8),
            DataType::Int16 => Ok(Self::Int16),
            DataType::UInt16 => Ok(Self::UInt16),
            DataType::Int32 => Ok(Self::Int32),
            DataType::UInt32 => Ok(Self::UInt32),
            DataType::Float32 => Ok(Self::Float32),
            DataType::Float64 => Ok(Self::Float64),
            other => Err(GsvqError::Format(format!(
                "Arrow type {:?} has no PLY equivalent",
                other
            ))),
        }
    }

    fn ply_name(&self) -> &'static str {
        match self {
            Self::Int8 => "char",
            Self::UInt8 => "uchar",
            Self::Int16 => "short",
            Self::UInt16 => "ushort",
            Self::Int32 => "int",
            Self::UInt32 => "uint",
            Self::Float32 => "float",
            Self::Float64 => "double",
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// Reads one value as a count (for list lengths).
    fn read_count(&self, bytes: &[u8], little_endian: bool) -> Result<usize, GsvqError> {
        let mut column = Column::new(*self, 1);
        column.push_binary(bytes, little_endian)?;
        column.as_count()
    }
}

//==================================================================================
// 2. Typed Column Buffers
//==================================================================================

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// Expands `$body` once per variant with `$v` bound to the inner vector and
/// `$t` to its element type.
macro_rules! for_each_column {
    ($column:expr, $v:ident, $t:ident => $body:expr) => {
        match $column {
            Column::Int8($v) => {
                type $t = i8;
                $body
            }
            Column::UInt8($v) => {
                type $t = u8;
                $body
            }
            Column::Int16($v) => {
                type $t = i16;
                $body
            }
            Column::UInt16($v) => {
                type $t = u16;
                $body
            }
            Column::Int32($v) => {
                type $t = i32;
                $body
            }
            Column::UInt32($v) => {
                type $t = u32;
                $body
            }
            Column::Float32($v) => {
                type $t = f32;
                $body
            }
            Column::Float64($v) => {
                type $t = f64;
                $body
            }
        }
    };
}

impl Column {
    fn new(scalar: Scalar, capacity: usize) -> Self {
        match scalar {
            Scalar::Int8 => Self::Int8(Vec::with_capacity(capacity)),
            Scalar::UInt8 => Self::UInt8(Vec::with_capacity(capacity)),
            Scalar::Int16 => Self::Int16(Vec::with_capacity(capacity)),
            Scalar::UInt16 => Self::UInt16(Vec::with_capacity(capacity)),
            Scalar::Int32 => Self::Int32(Vec::with_capacity(capacity)),
            Scalar::UInt32 => Self::UInt32(Vec::with_capacity(capacity)),
            Scalar::Float32 => Self::Float32(Vec::with_capacity(capacity)),
            Scalar::Float64 => Self::Float64(Vec::with_capacity(capacity)),
        }
    }

    /// Appends one value from exactly `size()` bytes.
    fn push_binary(&mut self, bytes: &[u8], little_endian: bool) -> Result<(), GsvqError> {
        for_each_column!(self, values, T => {
            let raw: [u8; std::mem::size_of::<T>()] = bytes
                .try_into()
                .map_err(|_| GsvqError::Format("Truncated PLY scalar".to_string()))?;
            values.push(if little_endian {
                T::from_le_bytes(raw)
            } else {
                T::from_be_bytes(raw)
            });
            Ok(())
        })
    }

    fn push_token(&mut self, token: &str) -> Result<(), GsvqError> {
        for_each_column!(self, values, T => {
            let value = token.parse::<T>().map_err(|_| {
                GsvqError::Format(format!("Cannot parse PLY value '{}'", token))
            })?;
            values.push(value);
            Ok(())
        })
    }

    fn write_le<W: Write>(&self, row: usize, writer: &mut W) -> Result<(), GsvqError> {
        for_each_column!(self, values, T => {
            let value: T = values[row];
            writer.write_all(&value.to_le_bytes())?;
            Ok(())
        })
    }

    fn as_count(&self) -> Result<usize, GsvqError> {
        let count = for_each_column!(self, values, T => {
            values.first().and_then(|&v| num_traits::cast::<T, usize>(v))
        });
        count.ok_or_else(|| GsvqError::Format("Invalid PLY list length".to_string()))
    }

    fn from_array(array: &dyn Array) -> Result<Self, GsvqError> {
        if array.null_count() > 0 {
            return Err(GsvqError::Format(
                "PLY cannot represent null values".to_string(),
            ));
        }
        macro_rules! values_of {
            ($variant:ident, $array_type:ty) => {
                array
                    .as_any()
                    .downcast_ref::<$array_type>()
                    .map(|a| Self::$variant(a.values().to_vec()))
            };
        }
        let column = match Scalar::from_arrow(array.data_type())? {
            Scalar::Int8 => values_of!(Int8, Int8Array),
            Scalar::UInt8 => values_of!(UInt8, UInt8Array),
            Scalar::Int16 => values_of!(Int16, Int16Array),
            Scalar::UInt16 => values_of!(UInt16, UInt16Array),
            Scalar::Int32 => values_of!(Int32, Int32Array),
            Scalar::UInt32 => values_of!(UInt32, UInt32Array),
            Scalar::Float32 => values_of!(Float32, Float32Array),
            Scalar::Float64 => values_of!(Float64, Float64Array),
        };
        column.ok_or_else(|| GsvqError::Format("Unexpected Arrow array layout".to_string()))
    }

    fn into_array(self) -> ArrayRef {
        match self {
            Self::Int8(v) => Arc::new(Int8Array::from(v)),
            Self::UInt8(v) => Arc::new(UInt8Array::from(v)),
            Self::Int16(v) => Arc::new(Int16Array::from(v)),
            Self::UInt16(v) => Arc::new(UInt16Array::from(v)),
            Self::Int32(v) => Arc::new(Int32Array::from(v)),
            Self::UInt32(v) => Arc::new(UInt32Array::from(v)),
            Self::Float32(v) => Arc::new(Float32Array::from(v)),
            Self::Float64(v) => Arc::new(Float64Array::from(v)),
        }
    }
}

//==================================================================================
// 3. Header
//==================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Property {
    Scalar { name: String, scalar: Scalar },
    List { count: Scalar, item: Scalar },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
}

#[derive(Debug)]
struct Header {
    encoding: Encoding,
    elements: Vec<Element>,
    /// Byte offset of the first body byte.
    body_offset: usize,
}

fn parse_header(bytes: &[u8]) -> Result<Header, GsvqError> {
    const END: &[u8] = b"end_header";
    let end = bytes
        .windows(END.len())
        .position(|w| w == END)
        .ok_or_else(|| GsvqError::Format("PLY header has no end_header line".to_string()))?;
    let newline = bytes[end..]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| GsvqError::Format("PLY header is not newline terminated".to_string()))?;
    let body_offset = end + newline + 1;

    let text = std::str::from_utf8(&bytes[..end])
        .map_err(|e| GsvqError::Format(format!("PLY header is not valid text: {}", e)))?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some("ply") {
        return Err(GsvqError::Format("Missing 'ply' magic line".to_string()));
    }

    let mut encoding = None;
    let mut elements: Vec<Element> = Vec::new();
    for line in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["format", kind, _version] => {
                encoding = Some(match *kind {
                    "ascii" => Encoding::Ascii,
                    "binary_little_endian" => Encoding::BinaryLittleEndian,
                    "binary_big_endian" => Encoding::BinaryBigEndian,
                    other => {
                        return Err(GsvqError::Format(format!("Unknown PLY format '{}'", other)))
                    }
                });
            }
            ["comment", ..] | ["obj_info", ..] => {}
            ["element", name, count] => elements.push(Element {
                name: name.to_string(),
                count: count.parse().map_err(|_| {
                    GsvqError::Format(format!("Invalid element count '{}'", count))
                })?,
                properties: Vec::new(),
            }),
            ["property", "list", count, item, _name] => {
                let property = Property::List {
                    count: Scalar::parse(count)?,
                    item: Scalar::parse(item)?,
                };
                current_element(&mut elements)?.properties.push(property);
            }
            ["property", scalar, name] => {
                let property = Property::Scalar {
                    name: name.to_string(),
                    scalar: Scalar::parse(scalar)?,
                };
                current_element(&mut elements)?.properties.push(property);
            }
            _ => {
                return Err(GsvqError::Format(format!(
                    "Unrecognised PLY header line '{}'",
                    line
                )))
            }
        }
    }

    let encoding =
        encoding.ok_or_else(|| GsvqError::Format("PLY header has no format line".to_string()))?;
    Ok(Header {
        encoding,
        elements,
        body_offset,
    })
}

fn current_element(elements: &mut [Element]) -> Result<&mut Element, GsvqError> {
    elements
        .last_mut()
        .ok_or_else(|| GsvqError::Format("PLY property declared before any element".to_string()))
}

//==================================================================================
// 4. Public API
//==================================================================================

/// Writes every column of `batch` as a property of a binary little-endian
/// `vertex` element.
pub fn write_binary_le<W: Write>(batch: &RecordBatch, writer: &mut W) -> Result<(), GsvqError> {
    let schema = batch.schema();
    let mut header = String::new();
    header.push_str("ply\nformat binary_little_endian 1.0\n");
    header.push_str(&format!("element {} {}\n", VERTEX_ELEMENT, batch.num_rows()));

    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let scalar = Scalar::from_arrow(field.data_type())?;
        header.push_str(&format!("property {} {}\n", scalar.ply_name(), field.name()));
        columns.push(Column::from_array(array.as_ref())?);
    }
    header.push_str("end_header\n");
    writer.write_all(header.as_bytes())?;

    for row in 0..batch.num_rows() {
        for column in &columns {
            column.write_le(row, writer)?;
        }
    }
    Ok(())
}

/// Parses the `vertex` element of a PLY file into a record batch whose columns
/// keep the file's scalar types.
pub fn read(bytes: &[u8]) -> Result<RecordBatch, GsvqError> {
    let header = parse_header(bytes)?;
    let vertex_index = header
        .elements
        .iter()
        .position(|e| e.name == VERTEX_ELEMENT)
        .ok_or_else(|| GsvqError::Format("PLY file has no vertex element".to_string()))?;
    let vertex = &header.elements[vertex_index];
    if vertex.properties.is_empty() {
        return Err(GsvqError::Format(
            "PLY vertex element declares no properties".to_string(),
        ));
    }

    let body = &bytes[header.body_offset..];
    if header.encoding != Encoding::Ascii {
        let row_size: usize = vertex
            .properties
            .iter()
            .map(|p| match p {
                Property::Scalar { scalar, .. } => scalar.size(),
                Property::List { .. } => 0,
            })
            .sum();
        let needed = vertex.count.checked_mul(row_size);
        if needed.map_or(true, |needed| needed > body.len()) {
            return Err(GsvqError::Format(format!(
                "PLY header declares {} vertices but the body holds only {} bytes",
                vertex.count,
                body.len()
            )));
        }
    }

    let mut fields = Vec::with_capacity(vertex.properties.len());
    let mut columns = Vec::with_capacity(vertex.properties.len());
    for property in &vertex.properties {
        match property {
            Property::Scalar { name, scalar } => {
                fields.push(Field::new(name, arrow_type(*scalar), false));
                columns.push(Column::new(*scalar, vertex.count.min(MAX_PREALLOCATED_ROWS)));
            }
            Property::List { .. } => {
                return Err(GsvqError::Format(
                    "List properties on vertex elements are not supported".to_string(),
                ))
            }
        }
    }

    match header.encoding {
        Encoding::Ascii => read_ascii(body, &header.elements[..vertex_index], vertex, &mut columns)?,
        Encoding::BinaryLittleEndian => {
            read_binary(body, &header.elements[..vertex_index], vertex, &mut columns, true)?
        }
        Encoding::BinaryBigEndian => {
            read_binary(body, &header.elements[..vertex_index], vertex, &mut columns, false)?
        }
    }

    let arrays: Vec<ArrayRef> = columns.into_iter().map(Column::into_array).collect();
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn arrow_type(scalar: Scalar) -> DataType {
    match scalar {
        Scalar::Int8 => DataType::Int8,
        Scalar::UInt8 => DataType::UInt8,
        Scalar::Int16 => DataType::Int16,
        Scalar::UInt16 => DataType::UInt16,
        Scalar::Int32 => DataType::Int32,
        Scalar::UInt32 => DataType::UInt32,
        Scalar::Float32 => DataType::Float32,
        Scalar::Float64 => DataType::Float64,
    }
}

fn take<'a>(body: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], GsvqError> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= body.len())
        .ok_or_else(|| GsvqError::Format("PLY body is truncated".to_string()))?;
    let slice = &body[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_binary(
    body: &[u8],
    preceding: &[Element],
    vertex: &Element,
    columns: &mut [Column],
    little_endian: bool,
) -> Result<(), GsvqError> {
    let mut offset = 0usize;
    for element in preceding {
        for _ in 0..element.count {
            for property in &element.properties {
                match property {
                    Property::Scalar { scalar, .. } => {
                        take(body, &mut offset, scalar.size())?;
                    }
                    Property::List { count, item } => {
                        let raw = take(body, &mut offset, count.size())?;
                        let n = count.read_count(raw, little_endian)?;
                        let len = n
                            .checked_mul(item.size())
                            .ok_or_else(|| GsvqError::Format("PLY list is too long".to_string()))?;
                        take(body, &mut offset, len)?;
                    }
                }
            }
        }
    }

    let sizes: Vec<usize> = vertex
        .properties
        .iter()
        .map(|p| match p {
            Property::Scalar { scalar, .. } => scalar.size(),
            Property::List { .. } => 0,
        })
        .collect();
    for _ in 0..vertex.count {
        for (column, &size) in columns.iter_mut().zip(&sizes) {
            column.push_binary(take(body, &mut offset, size)?, little_endian)?;
        }
    }
    Ok(())
}

fn read_ascii(
    body: &[u8],
    preceding: &[Element],
    vertex: &Element,
    columns: &mut [Column],
) -> Result<(), GsvqError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| GsvqError::Format(format!("ASCII PLY body is not valid text: {}", e)))?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    let skip: usize = preceding.iter().map(|e| e.count).sum();
    for _ in 0..skip {
        lines
            .next()
            .ok_or_else(|| GsvqError::Format("PLY body is truncated".to_string()))?;
    }

    for row in 0..vertex.count {
        let line = lines
            .next()
            .ok_or_else(|| GsvqError::Format("PLY body is truncated".to_string()))?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != columns.len() {
            return Err(GsvqError::Format(format!(
                "Vertex {} has {} values, expected {}",
                row,
                tokens.len(),
                columns.len()
            )));
        }
        for (column, token) in columns.iter_mut().zip(tokens) {
            column.push_token(token)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float32, false),
            Field::new("rot_re", DataType::UInt16, false),
            Field::new("opacity", DataType::UInt8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float32Array::from(vec![1.5f32, -2.25, 0.0])),
                Arc::new(UInt16Array::from(vec![299u16, 0, 65_535])),
                Arc::new(UInt8Array::from(vec![7u8, 255, 1])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_binary_roundtrip_preserves_types_and_values() {
        let batch = sample_batch();
        let mut bytes = Vec::new();
        write_binary_le(&batch, &mut bytes).unwrap();

        let header_text = String::from_utf8_lossy(&bytes[..80]).to_string();
        assert!(header_text.starts_with("ply\nformat binary_little_endian 1.0\nelement vertex 3\n"));

        let parsed = read(&bytes).unwrap();
        assert_eq!(parsed.schema().fields().len(), 3);
        assert_eq!(parsed.column(1).data_type(), &DataType::UInt16);
        assert_eq!(parsed.columns(), batch.columns());
    }

    #[test]
    fn test_ascii_with_preceding_element_and_double_values() {
        let text = "ply\r\nformat ascii 1.0\r\ncomment made by hand\r\n\
                    element face 1\r\nproperty list uchar int vertex_indices\r\n\
                    element vertex 2\r\nproperty double x\r\nproperty int opacity\r\nend_header\r\n\
                    3 0 1 2\r\n0.25 -1\r\n1e3 4\r\n";
        let batch = read(text.as_bytes()).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let x = batch.column(0).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(x.values().to_vec(), vec![0.25, 1000.0]);
        let opacity = batch.column(1).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(opacity.values().to_vec(), vec![-1, 4]);
    }

    #[test]
    fn test_big_endian_with_skipped_list_element() {
        let mut bytes = b"ply\nformat binary_big_endian 1.0\nelement meta 1\nproperty list uchar short ids\n\
element vertex 1\nproperty float y\nproperty ushort id\nend_header\n"
            .to_vec();
        bytes.push(2);
        bytes.extend_from_slice(&7i16.to_be_bytes());
        bytes.extend_from_slice(&9i16.to_be_bytes());
        bytes.extend_from_slice(&3.5f32.to_be_bytes());
        bytes.extend_from_slice(&300u16.to_be_bytes());

        let batch = read(&bytes).unwrap();
        let y = batch.column(0).as_any().downcast_ref::<Float32Array>().unwrap();
        let id = batch.column(1).as_any().downcast_ref::<UInt16Array>().unwrap();
        assert_eq!(y.value(0), 3.5);
        assert_eq!(id.value(0), 300);
    }

    #[test]
    fn test_malformed_files_are_format_errors() {
        assert!(matches!(read(b"not a ply"), Err(GsvqError::Format(_))));
        assert!(matches!(
            read(b"ply\nformat binary_little_endian 1.0\nelement vertex 2\nproperty float x\nend_header\n\0\0\0\0"),
            Err(GsvqError::Format(_))
        ));
        assert!(matches!(
            read(b"ply\nformat ascii 1.0\nelement vertex 1\nproperty quad x\nend_header\n1\n"),
            Err(GsvqError::Format(_))
        ));
        assert!(matches!(
            read(b"ply\nformat ascii 1.0\nelement face 1\nend_header\n\n"),
            Err(GsvqError::Format(_))
        ));
        assert!(matches!(
            read(b"ply\nformat ascii 1.0\nelement vertex 3\nend_header\n"),
            Err(GsvqError::Format(_))
        ));
    }

    #[test]
    fn test_oversized_vertex_count_is_a_format_error() {
        for encoding in ["binary_little_endian", "binary_big_endian", "ascii"] {
            let header = format!(
                "ply\nformat {} 1.0\nelement vertex 4611686018427387903\nproperty double x\nend_header\n",
                encoding
            );
            assert!(
                matches!(read(header.as_bytes()), Err(GsvqError::Format(_))),
                "encoding {}",
                encoding
            );
        }

        // Overflowing count * row size.
        let header = b"ply\nformat binary_little_endian 1.0\nelement vertex 18446744073709551615\nproperty double x\nend_header\n";
        assert!(matches!(read(header), Err(GsvqError::Format(_))));
    }
}
