use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_CHUNK_BYTES: usize = 64 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    to_hex_lower(&Sha256::digest(bytes))
}

/// Streams the file through SHA-256 and returns the lowercase hex digest.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(to_hex_lower(&hasher.finalize()))
}

pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

fn to_hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn file_digest_matches_in_memory_digest() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("agent.jar");
        fs::write(&path, b"abc").expect("write jar");

        assert_eq!(sha256_hex(b"abc"), ABC_SHA256);
        assert_eq!(sha256_file(&path).expect("hash file"), ABC_SHA256);
    }

    #[test]
    fn digest_comparison_ignores_case_and_whitespace() {
        assert!(digests_match(&ABC_SHA256.to_ascii_uppercase(), ABC_SHA256));
        assert!(digests_match(&format!(" {ABC_SHA256}\n"), ABC_SHA256));
        assert!(!digests_match("00", ABC_SHA256));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let temp = TempDir::new().expect("tempdir");
        let error = sha256_file(&temp.path().join("missing.jar")).expect_err("missing");
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}
