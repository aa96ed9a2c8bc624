//! Streaming hash computation for model files.
//!
//! Both digests come out of a single pass over the file. The fast hash
//! (first + last 8 MiB + length) exists for cheap duplicate-candidate
//! filtering before a full dual hash is paid for.

use crate::cancel::CancellationToken;
use crate::error::{LibraryError, Result};
use blake3::Hasher as Blake3Hasher;
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Read buffer size (2 MiB).
const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Window size for the fast hash (first + last 8 MiB).
const FAST_HASH_WINDOW: usize = 8 * 1024 * 1024;

/// Dual hash result with the byte count observed during the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualHash {
    /// SHA-256 as lowercase hex
    pub sha256: String,
    /// BLAKE3 as lowercase hex
    pub blake3: String,
    pub size_bytes: u64,
}

/// Compute SHA-256 and BLAKE3 in a single pass over the file.
///
/// Checks the cancellation token at every buffer boundary. Runs on the
/// caller's thread; wrap in `spawn_blocking` from async contexts.
pub fn hash_file(path: impl AsRef<Path>, cancel: &CancellationToken) -> Result<DualHash> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| LibraryError::io_with_path(e, path))?;

    let mut sha256_hasher = Sha256::new();
    let mut blake3_hasher = Blake3Hasher::new();
    let mut size_bytes: u64 = 0;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        cancel.check()?;
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| LibraryError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }

        sha256_hasher.update(&buffer[..bytes_read]);
        blake3_hasher.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(DualHash {
        sha256: hex::encode(sha256_hasher.finalize()),
        blake3: blake3_hasher.finalize().to_hex().to_string(),
        size_bytes,
    })
}

/// Hash a file while copying it to a writer, sharing one read pass.
///
/// Used by the importer when bytes must move into the canonical tree anyway.
pub fn hash_file_into(
    path: impl AsRef<Path>,
    dest: &mut impl Write,
    cancel: &CancellationToken,
) -> Result<DualHash> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| LibraryError::io_with_path(e, path))?;

    let mut sha256_hasher = Sha256::new();
    let mut blake3_hasher = Blake3Hasher::new();
    let mut size_bytes: u64 = 0;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        cancel.check()?;
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| LibraryError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }

        sha256_hasher.update(&buffer[..bytes_read]);
        blake3_hasher.update(&buffer[..bytes_read]);
        dest.write_all(&buffer[..bytes_read])
            .map_err(|e| LibraryError::io_with_path(e, path))?;
        size_bytes += bytes_read as u64;
    }

    Ok(DualHash {
        sha256: hex::encode(sha256_hasher.finalize()),
        blake3: blake3_hasher.finalize().to_hex().to_string(),
        size_bytes,
    })
}

/// Compute a fast hash for duplicate-candidate filtering.
///
/// SHA-256 over (first 8 MiB + last 8 MiB + little-endian length). Not a
/// content identity; a fast-hash match still requires full verification.
pub fn compute_fast_hash(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| LibraryError::io_with_path(e, path))?;

    let file_size = file
        .metadata()
        .map_err(|e| LibraryError::io_with_path(e, path))?
        .len();

    let mut hasher = Sha256::new();

    let first_window = std::cmp::min(file_size as usize, FAST_HASH_WINDOW);
    let mut buffer = vec![0u8; first_window];
    file.read_exact(&mut buffer)
        .map_err(|e| LibraryError::io_with_path(e, path))?;
    hasher.update(&buffer);

    if file_size > (FAST_HASH_WINDOW as u64) * 2 {
        file.seek(SeekFrom::Start(file_size - FAST_HASH_WINDOW as u64))
            .map_err(|e| LibraryError::io_with_path(e, path))?;
        let mut tail = vec![0u8; FAST_HASH_WINDOW];
        file.read_exact(&mut tail)
            .map_err(|e| LibraryError::io_with_path(e, path))?;
        hasher.update(&tail);
    }

    hasher.update(file_size.to_le_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file's SHA-256 against an expected lowercase-hex value.
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = hash_file(path, &CancellationToken::new())?.sha256;
    let expected = expected.to_lowercase();
    if actual == expected {
        Ok(())
    } else {
        Err(LibraryError::HashMismatch { expected, actual })
    }
}

/// Verify a file's BLAKE3 against an expected lowercase-hex value.
pub fn verify_blake3(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = hash_file(path, &CancellationToken::new())?.blake3;
    let expected = expected.to_lowercase();
    if actual == expected {
        Ok(())
    } else {
        Err(LibraryError::HashMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_known_digests() {
        let file = NamedTempFile::new().unwrap();
        let hash = hash_file(file.path(), &CancellationToken::new()).unwrap();
        assert_eq!(
            hash.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash.blake3,
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
        assert_eq!(hash.size_bytes, 0);
    }

    #[test]
    fn hashing_is_idempotent() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();
        file.flush().unwrap();

        let first = hash_file(file.path(), &CancellationToken::new()).unwrap();
        let second = hash_file(file.path(), &CancellationToken::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size_bytes, 13);
    }

    #[test]
    fn hash_into_matches_plain_hash() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"stream me").unwrap();
        file.flush().unwrap();

        let mut copied = Vec::new();
        let streamed = hash_file_into(file.path(), &mut copied, &CancellationToken::new()).unwrap();
        let plain = hash_file(file.path(), &CancellationToken::new()).unwrap();
        assert_eq!(streamed, plain);
        assert_eq!(copied, b"stream me");
    }

    #[test]
    fn cancelled_token_aborts() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();
        file.flush().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            hash_file(file.path(), &token),
            Err(LibraryError::Cancelled)
        ));
    }

    #[test]
    fn verify_detects_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();
        file.flush().unwrap();

        let hash = hash_file(file.path(), &CancellationToken::new()).unwrap();
        assert!(verify_sha256(file.path(), &hash.sha256).is_ok());
        assert!(matches!(
            verify_sha256(file.path(), "00"),
            Err(LibraryError::HashMismatch { .. })
        ));
        assert!(verify_blake3(file.path(), &hash.blake3).is_ok());
    }

    #[test]
    fn fast_hash_small_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"small").unwrap();
        file.flush().unwrap();
        assert_eq!(compute_fast_hash(file.path()).unwrap().len(), 64);
    }
}
