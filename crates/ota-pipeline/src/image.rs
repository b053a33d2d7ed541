//! Firmware image header parsing and integrity checks
//!
//! The image starts with a 24-byte image header and an 8-byte segment header,
//! followed by a 256-byte application descriptor:
//!
//! ```text
//! offset  size  field
//!   32      4   magic word (LE, 0xABCD5432)
//!   36      4   secure version
//!   40      8   reserved
//!   48     32   version (NUL-terminated)
//!   80     32   project name
//!  112     16   build time
//!  128     16   build date
//!  144     32   SDK version
//!  176     32   ELF SHA-256
//!  208     80   reserved
//! ```
//!
//! This is a plausibility check, not authentication.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{OtaError, OtaResult};
use crate::storage::Storage;

/// Magic word at the start of the application descriptor
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

/// Offset of the application descriptor within the image
pub const APP_DESC_OFFSET: usize = 32;

/// Size of the application descriptor
pub const APP_DESC_LEN: usize = 256;

/// Bytes that must be read to validate an image
pub const HEADER_LEN: usize = APP_DESC_OFFSET + APP_DESC_LEN;

const VERSION_LEN: usize = 32;
const PROJECT_NAME_LEN: usize = 32;
const TIME_LEN: usize = 16;
const DATE_LEN: usize = 16;
const SDK_VERSION_LEN: usize = 32;
const ELF_SHA_LEN: usize = 32;

/// Header parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Input ended before the field being read
    #[error("image too small: need {needed} bytes at offset {offset}, have {available}")]
    TooShort {
        /// Offset of the field
        offset: usize,
        /// Bytes the field needs
        needed: usize,
        /// Bytes available from the offset
        available: usize,
    },

    /// Descriptor magic word did not match
    #[error("invalid image magic word: {found:#010x}")]
    BadMagic {
        /// Value found at the magic offset
        found: u32,
    },
}

/// Bounds-checked little-endian reader over a byte slice
struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], HeaderError> {
        let available = self.data.len().saturating_sub(self.pos);
        let bytes = self
            .pos
            .checked_add(len)
            .and_then(|end| self.data.get(self.pos..end))
            .ok_or(HeaderError::TooShort {
                offset: self.pos,
                needed: len,
                available,
            })?;
        self.pos += len;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), HeaderError> {
        self.take(len).map(|_| ())
    }

    fn u32_le(&mut self) -> Result<u32, HeaderError> {
        let bytes = self.take(4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(word))
    }

    fn c_string(&mut self, len: usize) -> Result<String, HeaderError> {
        let bytes = self.take(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let text = bytes.get(..end).unwrap_or_default();
        Ok(String::from_utf8_lossy(text).into_owned())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], HeaderError> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

/// Parsed application descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Anti-rollback security version
    pub secure_version: u32,
    /// Embedded version string
    pub version: String,
    /// Project name
    pub project_name: String,
    /// Build time
    pub build_time: String,
    /// Build date
    pub build_date: String,
    /// SDK version the image was built with
    pub sdk_version: String,
    /// SHA-256 of the application ELF
    pub elf_sha256: [u8; ELF_SHA_LEN],
}

impl ImageHeader {
    /// Parse the header region of an image
    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        let mut cursor = ByteCursor::new(data);
        cursor.skip(APP_DESC_OFFSET)?;

        let magic = cursor.u32_le()?;
        if magic != APP_DESC_MAGIC {
            return Err(HeaderError::BadMagic { found: magic });
        }

        let secure_version = cursor.u32_le()?;
        cursor.skip(8)?;
        let version = cursor.c_string(VERSION_LEN)?;
        let project_name = cursor.c_string(PROJECT_NAME_LEN)?;
        let build_time = cursor.c_string(TIME_LEN)?;
        let build_date = cursor.c_string(DATE_LEN)?;
        let sdk_version = cursor.c_string(SDK_VERSION_LEN)?;
        let elf_sha256 = cursor.array::<ELF_SHA_LEN>()?;

        let remaining = HEADER_LEN.saturating_sub(cursor.pos);
        cursor.skip(remaining)?;

        Ok(Self {
            secure_version,
            version,
            project_name,
            build_time,
            build_date,
            sdk_version,
            elf_sha256,
        })
    }

    /// Encode a header region; strings longer than their field are truncated
    ///
    /// Used by provisioning tooling and tests to produce plausible images.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        fn put_raw(out: &mut [u8], offset: usize, value: &[u8]) {
            if let Some(dst) = out.get_mut(offset..offset + value.len()) {
                dst.copy_from_slice(value);
            }
        }

        fn put(out: &mut [u8], offset: usize, len: usize, value: &[u8]) {
            let n = value.len().min(len.saturating_sub(1));
            put_raw(out, offset, value.get(..n).unwrap_or_default());
        }

        let mut out = [0u8; HEADER_LEN];
        // image header magic byte, informational only
        put_raw(&mut out, 0, &[0xE9]);

        let base = APP_DESC_OFFSET;
        put_raw(&mut out, base, &APP_DESC_MAGIC.to_le_bytes());
        put_raw(&mut out, base + 4, &self.secure_version.to_le_bytes());
        put(&mut out, base + 16, VERSION_LEN, self.version.as_bytes());
        put(&mut out, base + 48, PROJECT_NAME_LEN, self.project_name.as_bytes());
        put(&mut out, base + 80, TIME_LEN, self.build_time.as_bytes());
        put(&mut out, base + 96, DATE_LEN, self.build_date.as_bytes());
        put(&mut out, base + 112, SDK_VERSION_LEN, self.sdk_version.as_bytes());
        put_raw(&mut out, base + 144, &self.elf_sha256);
        out
    }

    /// Header with the given version and project name, other fields empty
    pub fn new(version: &str, project_name: &str) -> Self {
        Self {
            secure_version: 0,
            version: version.to_string(),
            project_name: project_name.to_string(),
            build_time: String::new(),
            build_date: String::new(),
            sdk_version: String::new(),
            elf_sha256: [0u8; ELF_SHA_LEN],
        }
    }
}

/// Build a complete image: encoded header followed by `payload`
pub fn build_image(header: &ImageHeader, payload: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(HEADER_LEN + payload.len());
    image.extend_from_slice(&header.encode());
    image.extend_from_slice(payload);
    image
}

/// Result of a successful image verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Embedded version string
    pub version: String,
    /// Project name
    pub project_name: String,
}

/// SHA-256 of a byte slice, lower-case hex
pub fn compute_data_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Header and digest checks over staged files
#[derive(Clone)]
pub struct ImageVerifier {
    storage: Arc<dyn Storage>,
    chunk_size: usize,
}

impl ImageVerifier {
    /// Create a verifier reading through `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            chunk_size: 4096,
        }
    }

    /// Read and validate the header of the image at `path`
    ///
    /// Only the header region is read.
    pub async fn verify(&self, path: &Path) -> OtaResult<ImageInfo> {
        let header = self
            .storage
            .read_range(path, 0, HEADER_LEN)
            .await
            .map_err(|e| OtaError::from_storage(e, path.display()))?;

        let parsed = ImageHeader::parse(&header)
            .map_err(|e| OtaError::VerifyFailed(format!("{}: {e}", path.display())))?;

        info!(
            "Firmware verified: {} v{}",
            parsed.project_name, parsed.version
        );

        Ok(ImageInfo {
            version: parsed.version,
            project_name: parsed.project_name,
        })
    }

    /// Stream the whole file through SHA-256
    pub async fn file_sha256(&self, path: &Path) -> OtaResult<String> {
        let mut hasher = Sha256::new();
        let mut offset = 0u64;

        loop {
            let chunk = self
                .storage
                .read_range(path, offset, self.chunk_size)
                .await
                .map_err(|e| OtaError::from_storage(e, path.display()))?;
            if chunk.is_empty() {
                break;
            }
            hasher.update(&chunk);
            offset += chunk.len() as u64;
        }

        let digest = hex::encode(hasher.finalize());
        debug!("SHA-256 of {} ({} bytes): {}", path.display(), offset, digest);
        Ok(digest)
    }

    /// Compare the file digest with an expected hex digest (case-insensitive)
    pub async fn verify_checksum(&self, path: &Path, expected: &str) -> OtaResult<()> {
        let actual = self.file_sha256(path).await?;
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(OtaError::VerifyFailed(format!(
                "checksum mismatch for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            )))
        }
    }
}
