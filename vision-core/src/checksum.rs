//! SHA-256 verification against upstream `.CHECKSUM` sidecars.
//!
//! The sidecar holds `"<hex digest>  <file name>"`.

use crate::error::TaskError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Pull the hex digest out of a `.CHECKSUM` body.
pub fn parse_checksum(body: &str) -> Result<String, TaskError> {
    let digest = body
        .split_whitespace()
        .next()
        .ok_or_else(|| TaskError::Integrity("empty checksum file".into()))?;
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TaskError::Integrity(format!(
            "malformed checksum '{digest}'"
        )));
    }
    Ok(digest.to_ascii_lowercase())
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare the file's digest with the expected one.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), TaskError> {
    let actual = sha256_file(path)?;
    if actual != expected {
        return Err(TaskError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
