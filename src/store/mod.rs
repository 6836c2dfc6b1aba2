// In: src/store/mod.rs

//! The codebook side artifact: a self-describing binary file written next to
//! every quantized container.
//!
//! ```text
//! magic "GSCB" | version u16 | entry count u16
//! per entry:   name (u16 length + utf8) | rows u32 | cols u32
//! payload:     zstd( f32 values of every entry, row-major, in entry order )
//! ```
//!
//! All integers and payload values are little-endian.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::error::GsvqError;
use crate::kernels;
use crate::quantization::Codebook;
use crate::types::Channel;

//==================================================================================
// Format Constants
//==================================================================================

/// The magic number at the start of every codebook artifact.
pub const CODEBOOK_MAGIC: &[u8; 4] = b"GSCB";
pub const CODEBOOK_FORMAT_VERSION: u16 = 1;
/// Extension that replaces the container's own.
pub const CODEBOOK_EXTENSION: &str = "codebook.bin";

/// magic(4) + version(2) + entry count(2)
const MIN_ARTIFACT_SIZE: usize = 8;
const MAX_NAME_LEN: usize = 256;
const PAYLOAD_ZSTD_LEVEL: i32 = 3;

//==================================================================================
// Paths & Atomic Writes
//==================================================================================

/// `<container without extension>.codebook.bin`.
pub fn codebook_path(container: &Path) -> PathBuf {
    container.with_extension(CODEBOOK_EXTENSION)
}

/// Writes `bytes` to a temporary file in `path`'s directory, then renames it
/// over `path`. Readers see either the old file or the new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GsvqError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut file = tempfile::NamedTempFile::new_in(&dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| GsvqError::Io(e.error))?;
    Ok(())
}

/// Saves `codebook` atomically to `path` and returns the artifact size in bytes.
pub fn save(codebook: &Codebook, path: &Path) -> Result<usize, GsvqError> {
    let bytes = codebook.to_bytes()?;
    write_atomic(path, &bytes)?;
    log::debug!(
        "Wrote codebook with {} channels ({} bytes) to {}",
        codebook.len(),
        bytes.len(),
        path.display()
    );
    Ok(bytes.len())
}

/// Loads the codebook at `path`; a missing file is `CodebookMissing`.
pub fn load(path: &Path) -> Result<Codebook, GsvqError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(GsvqError::CodebookMissing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    Codebook::from_bytes(&bytes)
}

//==================================================================================
// Serialization
//==================================================================================

impl Codebook {
    /// Serializes the codebook. Entries are written in canonical channel order,
    /// so equal codebooks always produce identical bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GsvqError> {
        let count = u16::try_from(self.len())
            .map_err(|_| GsvqError::CodebookShape("Too many codebook entries".to_string()))?;

        let mut buf = Vec::new();
        buf.write_all(CODEBOOK_MAGIC)?;
        buf.write_all(&CODEBOOK_FORMAT_VERSION.to_le_bytes())?;
        buf.write_all(&count.to_le_bytes())?;

        let mut payload: Vec<u8> = Vec::new();
        for (channel, centroids) in self.iter() {
            let (rows, cols) = centroids.dim();
            write_prefixed_string(&mut buf, &channel.name())?;
            buf.write_all(&dim_to_u32(rows)?.to_le_bytes())?;
            buf.write_all(&dim_to_u32(cols)?.to_le_bytes())?;
            payload.extend(centroids.iter().flat_map(|v| v.to_le_bytes()));
        }

        buf.extend_from_slice(&kernels::zstd::encode(&payload, PAYLOAD_ZSTD_LEVEL)?);
        Ok(buf)
    }

    /// Parses a serialized codebook, validating every declared shape against
    /// both its channel and the payload length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GsvqError> {
        if bytes.len() < MIN_ARTIFACT_SIZE {
            return Err(GsvqError::Format(format!(
                "Codebook artifact is too small to be valid. Minimum size: {}, got: {}",
                MIN_ARTIFACT_SIZE,
                bytes.len()
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic).map_err(format_err)?;
        if magic != *CODEBOOK_MAGIC {
            return Err(GsvqError::Format("Invalid codebook magic number".into()));
        }
        let version = read_u16(&mut cursor)?;
        if version != CODEBOOK_FORMAT_VERSION {
            return Err(GsvqError::Format(format!(
                "Unsupported codebook version: expected {}, got {}",
                CODEBOOK_FORMAT_VERSION, version
            )));
        }

        let count = read_u16(&mut cursor)? as usize;
        let mut entries = Vec::with_capacity(count);
        let mut total_values = 0usize;
        for _ in 0..count {
            let name = read_prefixed_string(&mut cursor)?;
            let channel: Channel = name.parse()?;
            let rows = read_u32(&mut cursor)? as usize;
            let cols = read_u32(&mut cursor)? as usize;
            if rows == 0 {
                return Err(GsvqError::CodebookShape(format!(
                    "Codebook entry '{}' has zero rows",
                    name
                )));
            }
            crate::quantization::codebook::check_channel_width(channel, cols)?;
            total_values = rows
                .checked_mul(cols)
                .and_then(|n| total_values.checked_add(n))
                .ok_or_else(|| GsvqError::CodebookShape("Codebook is too large".to_string()))?;
            entries.push((channel, rows, cols));
        }

        let payload_start = cursor.position() as usize;
        let payload_bytes = kernels::zstd::decode(&bytes[payload_start..])?;
        if payload_bytes.len() % std::mem::size_of::<f32>() != 0 {
            return Err(GsvqError::CodebookShape(format!(
                "Payload length {} is not a whole number of f32 values",
                payload_bytes.len()
            )));
        }
        let values = payload_bytes
            .chunks_exact(std::mem::size_of::<f32>())
            .map(|chunk| {
                chunk
                    .try_into()
                    .map(f32::from_le_bytes)
                    .map_err(|_| GsvqError::CodebookShape("Truncated payload value".to_string()))
            })
            .collect::<Result<Vec<f32>, _>>()?;
        if values.len() != total_values {
            return Err(GsvqError::CodebookShape(format!(
                "Payload holds {} values but the entries declare {}",
                values.len(),
                total_values
            )));
        }

        let mut codebook = Codebook::new();
        let mut offset = 0;
        for (channel, rows, cols) in entries {
            let table = Array2::from_shape_vec((rows, cols), values[offset..offset + rows * cols].to_vec())?;
            offset += rows * cols;
            codebook.insert(channel, table)?;
        }
        Ok(codebook)
    }
}

//==================================================================================
// Private Helpers
//==================================================================================

fn format_err(e: std::io::Error) -> GsvqError {
    GsvqError::Format(e.to_string())
}

fn dim_to_u32(dim: usize) -> Result<u32, GsvqError> {
    u32::try_from(dim).map_err(|_| GsvqError::CodebookShape(format!("Dimension {} exceeds u32", dim)))
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, GsvqError> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(format_err)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, GsvqError> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(format_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_prefixed_string(cursor: &mut Cursor<&[u8]>) -> Result<String, GsvqError> {
    let len = read_u16(cursor)? as usize;
    if len > MAX_NAME_LEN {
        return Err(GsvqError::Format(format!(
            "Entry name length ({}) exceeds maximum allowed size ({})",
            len, MAX_NAME_LEN
        )));
    }
    let mut buf = vec![0; len];
    cursor.read_exact(&mut buf).map_err(format_err)?;
    String::from_utf8(buf).map_err(|e| GsvqError::Format(e.to_string()))
}

fn write_prefixed_string<W: Write>(writer: &mut W, s: &str) -> Result<(), GsvqError> {
    if s.len() > MAX_NAME_LEN {
        return Err(GsvqError::Format(format!(
            "Entry name length ({}) exceeds maximum allowed size ({})",
            s.len(),
            MAX_NAME_LEN
        )));
    }
    writer.write_all(&(s.len() as u16).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

//==================================================================================
// Unit Tests
//==================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_codebook() -> Codebook {
        let mut codebook = Codebook::new();
        codebook
            .insert(Channel::Opacity, array![[0.5f32], [-1.25], [3.0]])
            .unwrap();
        codebook
            .insert(Channel::RotationIm, Array2::from_shape_fn((4, 3), |(i, j)| (i * 3 + j) as f32 * 0.1))
            .unwrap();
        codebook
            .insert(Channel::FeatureRest(0), Array2::from_elem((2, 9), 0.75))
            .unwrap();
        codebook
    }

    #[test]
    fn test_codebook_path_replaces_extension() {
        assert_eq!(
            codebook_path(Path::new("out/scene.gsvq")),
            PathBuf::from("out/scene.codebook.bin")
        );
        assert_eq!(codebook_path(Path::new("scene")), PathBuf::from("scene.codebook.bin"));
    }

    #[test]
    fn test_bytes_roundtrip_is_exact_and_deterministic() {
        let codebook = sample_codebook();
        let bytes = codebook.to_bytes().unwrap();
        assert_eq!(&bytes[..4], CODEBOOK_MAGIC);
        assert_eq!(Codebook::from_bytes(&bytes).unwrap(), codebook);
        assert_eq!(sample_codebook().to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_payload_values_are_little_endian() {
        let mut codebook = Codebook::new();
        codebook.insert(Channel::Opacity, array![[1.5f32], [-2.0]]).unwrap();
        let bytes = codebook.to_bytes().unwrap();

        // magic, version, count, "opacity" with its length, rows, cols
        let header_len = 4 + 2 + 2 + 2 + "opacity".len() + 4 + 4;
        let payload = kernels::zstd::decode(&bytes[header_len..]).unwrap();
        let expected: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(payload, expected);
    }

    #[test]
    fn test_save_and_load_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = codebook_path(&dir.path().join("nested/model.gsvq"));
        save(&sample_codebook(), &path).unwrap();
        assert_eq!(load(&path).unwrap(), sample_codebook());

        // Overwriting replaces the file wholesale.
        let mut smaller = Codebook::new();
        smaller.insert(Channel::Opacity, array![[1.0f32]]).unwrap();
        save(&smaller, &path).unwrap();
        assert_eq!(load(&path).unwrap(), smaller);
    }

    #[test]
    fn test_missing_file_is_codebook_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.codebook.bin");
        assert!(matches!(load(&path), Err(GsvqError::CodebookMissing(p)) if p == path));
    }

    #[test]
    fn test_bad_magic_and_version_are_format_errors() {
        let mut bytes = sample_codebook().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Codebook::from_bytes(&bytes), Err(GsvqError::Format(_))));

        let mut bytes = sample_codebook().to_bytes().unwrap();
        bytes[4] = 0xFF;
        assert!(matches!(Codebook::from_bytes(&bytes), Err(GsvqError::Format(_))));

        assert!(matches!(Codebook::from_bytes(b"GSCB"), Err(GsvqError::Format(_))));
    }

    /// Hand-assembles an artifact with one entry and an arbitrary payload.
    fn single_entry(name: &str, rows: u32, cols: u32, values: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(CODEBOOK_MAGIC);
        bytes.extend_from_slice(&CODEBOOK_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        write_prefixed_string(&mut bytes, name).unwrap();
        bytes.extend_from_slice(&rows.to_le_bytes());
        bytes.extend_from_slice(&cols.to_le_bytes());
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        bytes.extend_from_slice(&kernels::zstd::encode(&payload, 1).unwrap());
        bytes
    }

    #[test]
    fn test_inconsistent_shapes_are_codebook_shape_errors() {
        // rot_im must be 3 wide.
        let bytes = single_entry("rot_im", 2, 2, &[0.0; 4]);
        assert!(matches!(Codebook::from_bytes(&bytes), Err(GsvqError::CodebookShape(_))));

        // Payload shorter than declared.
        let bytes = single_entry("opacity", 4, 1, &[0.0; 3]);
        assert!(matches!(Codebook::from_bytes(&bytes), Err(GsvqError::CodebookShape(_))));

        // Zero rows.
        let bytes = single_entry("opacity", 0, 1, &[]);
        assert!(matches!(Codebook::from_bytes(&bytes), Err(GsvqError::CodebookShape(_))));

        let bytes = single_entry("opacity", 2, 1, &[1.0, 2.0]);
        assert_eq!(
            Codebook::from_bytes(&bytes).unwrap().get(Channel::Opacity),
            Some(&array![[1.0f32], [2.0]])
        );
    }

    #[test]
    fn test_unknown_channel_name_is_rejected() {
        let bytes = single_entry("color", 1, 1, &[0.0]);
        assert!(matches!(Codebook::from_bytes(&bytes), Err(GsvqError::Format(_))));
    }
}
