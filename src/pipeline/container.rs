// In: src/pipeline/container.rs

//! The container envelope: a fixed 16-byte header in front of the codec payload.
//!
//! ```text
//! magic "GSVQ" | version u16 | backend u8 | reserved u8 | point count u64 | payload
//! ```
//!
//! The backend tag lets decompression refuse a container written by the other
//! backend instead of misreading it.

use crate::config::Backend;
use crate::error::GsvqError;

/// The magic number at the start of every container.
pub const CONTAINER_MAGIC: &[u8; 4] = b"GSVQ";
pub const CONTAINER_FORMAT_VERSION: u16 = 1;
/// magic(4) + version(2) + backend(1) + reserved(1) + points(8)
pub const CONTAINER_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u16,
    pub backend: Backend,
    pub num_points: u64,
}

impl ContainerHeader {
    pub fn new(backend: Backend, num_points: u64) -> Self {
        Self {
            version: CONTAINER_FORMAT_VERSION,
            backend,
            num_points,
        }
    }

    /// Prepends the header to `payload`.
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONTAINER_HEADER_SIZE + payload.len());
        buf.extend_from_slice(CONTAINER_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.backend.tag());
        buf.push(0);
        buf.extend_from_slice(&self.num_points.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Splits a container into its header and the codec payload.
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), GsvqError> {
        if bytes.len() < CONTAINER_HEADER_SIZE {
            return Err(GsvqError::Format(format!(
                "Container is too small to be valid. Minimum size: {}, got: {}",
                CONTAINER_HEADER_SIZE,
                bytes.len()
            )));
        }
        let (header, payload) = bytes.split_at(CONTAINER_HEADER_SIZE);
        if header[..4] != CONTAINER_MAGIC[..] {
            return Err(GsvqError::Format("Invalid container magic number".into()));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != CONTAINER_FORMAT_VERSION {
            return Err(GsvqError::Format(format!(
                "Unsupported container version: expected {}, got {}",
                CONTAINER_FORMAT_VERSION, version
            )));
        }
        let backend = Backend::from_tag(header[6])?;
        let mut points = [0u8; 8];
        points.copy_from_slice(&header[8..16]);

        Ok((
            Self {
                version,
                backend,
                num_points: u64::from_le_bytes(points),
            },
            payload,
        ))
    }

    /// Fails with `BackendMismatch` unless this container was written by `expected`.
    pub fn expect_backend(&self, expected: Backend) -> Result<(), GsvqError> {
        if self.backend != expected {
            return Err(GsvqError::BackendMismatch {
                expected: expected.name().to_string(),
                found: self.backend.name().to_string(),
            });
        }
        Ok(())
    }
}
