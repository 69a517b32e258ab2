//! Whole-resource integrity verification
//!
//! Hashing a large finished resource is itself non-trivial latency, so the
//! verifier streams it in blocks and reports progress 0-100.

use md5::Md5;
use sha2::{Digest, Sha256, Sha512};

use crate::resource::ResourceWriter;
use crate::{Error, Result};

/// Expected whole-resource digest, configured per download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalHash {
    /// Algorithm name, e.g. "SHA-256"
    pub algorithm: String,

    /// Expected digest, lowercase hex
    pub digest_hex: String,
}

impl TotalHash {
    pub fn new(algorithm: impl Into<String>, digest_hex: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            digest_hex: digest_hex.into().to_lowercase(),
        }
    }
}

/// Supported verification algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Md5,
}

impl HashAlgorithm {
    /// Resolve an algorithm by configured name. An unknown name is an
    /// immediately-fatal configuration error, distinct from a mismatch.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_uppercase().replace('-', "").as_str() {
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            "MD5" => Ok(HashAlgorithm::Md5),
            _ => Err(Error::UnsupportedHashAlgorithm(name.to_string())),
        }
    }

    fn hasher(&self) -> Box<dyn sha2::digest::DynDigest> {
        match self {
            HashAlgorithm::Sha256 => Box::new(Sha256::new()),
            HashAlgorithm::Sha512 => Box::new(Sha512::new()),
            HashAlgorithm::Md5 => Box::new(Md5::new()),
        }
    }
}

/// Stream `length` bytes of the written resource through `algorithm`,
/// reporting whole-percent progress, and compare against the expected digest.
///
/// Returns `Ok(())` on a match and [`Error::HashMismatch`] otherwise.
pub fn verify_resource(
    writer: &dyn ResourceWriter,
    length: u64,
    algorithm: HashAlgorithm,
    expected_hex: &str,
    block_size: usize,
    mut progress: impl FnMut(u8),
) -> Result<()> {
    let mut hasher = algorithm.hasher();
    let mut offset: u64 = 0;
    let mut last_percent: u8 = 0;
    progress(0);

    while offset < length {
        let len = block_size.min((length - offset) as usize);
        let block = writer.read(offset, len)?;
        if block.is_empty() {
            // A writer shorter than the announced length can never verify.
            return Err(Error::LengthMismatch {
                expected: length,
                reported: offset,
            });
        }
        hasher.update(&block);
        offset += block.len() as u64;

        let percent = if length == 0 {
            100
        } else {
            ((offset * 100) / length) as u8
        };
        if percent > last_percent {
            last_percent = percent;
            progress(percent);
        }
    }
    if last_percent < 100 {
        progress(100);
    }

    let got = hex::encode(hasher.finalize());
    let expected = expected_hex.to_lowercase();
    if got == expected {
        Ok(())
    } else {
        Err(Error::HashMismatch { expected, got })
    }
}
