//! Integrity hashing: streaming SHA-256 over files and buffers, compared in
//! constant time so a mismatching hash never leaks via timing.

use crate::error::{Result, TransferError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use subtle::ConstantTimeEq;

const READ_BUF_SIZE: usize = 64 * 1024;

/// SHA-256 of an in-memory buffer, hex-encoded.
pub fn hash_buf(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of an entire local file, hex-encoded. Streams so memory use
/// doesn't scale with file size.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

/// SHA-256 of `len` bytes starting at `offset` in an already-open file.
pub fn hash_file_range(file: &mut File, offset: u64, len: u64) -> Result<String> {
    file.seek(SeekFrom::Start(offset))?;
    let mut hasher = Sha256::new();
    let mut remaining = len;
    let mut buf = [0u8; READ_BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(READ_BUF_SIZE as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two hex-encoded digests in constant time. Both sides are decoded
/// first; a decode failure is treated as a mismatch, not an error, since a
/// malformed digest should never be indistinguishable from a valid one that
/// happens to match.
pub fn digests_equal(expected_hex: &str, actual_hex: &str) -> bool {
    let (Ok(expected), Ok(actual)) = (hex_decode(expected_hex), hex_decode(actual_hex)) else {
        return false;
    };
    expected.ct_eq(&actual).into()
}

fn hex_decode(s: &str) -> std::result::Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s)
}

/// Verify a local file against an expected whole-file digest, returning the
/// structured `IntegrityError` the orchestrator expects on mismatch.
pub fn verify_file(path: &Path, expected_hex: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if digests_equal(expected_hex, &actual) {
        Ok(())
    } else {
        Err(TransferError::IntegrityError {
            expected: expected_hex.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_buf_is_deterministic() {
        assert_eq!(hash_buf(b"hello"), hash_buf(b"hello"));
        assert_ne!(hash_buf(b"hello"), hash_buf(b"world"));
    }

    #[test]
    fn hash_buf_matches_known_vector() {
        // SHA-256("") per FIPS 180-4 test vectors.
        assert_eq!(
            hash_buf(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }

    #[test]
    fn hash_file_matches_hash_buf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"some file contents").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_buf(b"some file contents"));
    }

    #[test]
    fn hash_file_range_matches_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data = b"0123456789abcdef".repeat(1000);
        std::fs::write(&path, &data).unwrap();

        let mut file = File::open(&path).unwrap();
        let got = hash_file_range(&mut file, 10, 100).unwrap();
        let want = hash_buf(&data[10..110]);
        assert_eq!(got, want);
    }

    #[test]
    fn digests_equal_true_for_same_hash() {
        let h = hash_buf(b"payload");
        assert!(digests_equal(&h, &h));
    }

    #[test]
    fn digests_equal_false_for_different_hash() {
        assert!(!digests_equal(&hash_buf(b"a"), &hash_buf(b"b")));
    }

    #[test]
    fn digests_equal_false_for_malformed_hex() {
        assert!(!digests_equal("not-hex", &hash_buf(b"a")));
    }

    #[test]
    fn verify_file_ok_on_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"abc").unwrap();
        drop(f);

        let expected = hash_buf(b"abc");
        verify_file(&path, &expected).unwrap();
    }

    #[test]
    fn verify_file_errors_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"abc").unwrap();

        let err = verify_file(&path, &hash_buf(b"xyz")).unwrap_err();
        assert!(matches!(err, TransferError::IntegrityError { .. }));
    }
}
