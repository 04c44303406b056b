//! Vision Layer
//!
//! Image access for the detection pipeline: decoding screenshots,
//! content fingerprints for the result cache, round pre-scaling and the
//! target-language text filter.

pub mod language;
pub mod preprocess;

pub use language::{FilterPolicy, TextFilter};
pub use preprocess::prescale;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::errors::DetectError;

/// Stable content hash of an image file (hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageFingerprint(String);

impl ImageFingerprint {
    /// Fingerprint raw file bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already computed hex digest (e.g. read back from storage)
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell images apart in logs
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Compute the fingerprint of an image file
pub fn fingerprint_file(path: &Path) -> Result<ImageFingerprint, DetectError> {
    let data = std::fs::read(path).map_err(|e| DetectError::ImageRead {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(ImageFingerprint::from_bytes(&data))
}

/// Decode an image file
pub fn load_image(path: &Path) -> Result<DynamicImage, DetectError> {
    image::open(path).map_err(|e| DetectError::ImageRead {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
