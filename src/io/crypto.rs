use crate::error::Result;

use sha2::{Digest, Sha256};
use std::{fs::File, io::Read, path::Path};

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// `Ok(false)` when the file is missing or the digest differs.
pub fn verify_sha256(path: &Path, expected_hex: &str) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let got = sha256_file(path)?;
    Ok(got.eq_ignore_ascii_case(expected_hex.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_digest() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(sha256_file(f.path()).unwrap(), expected);
        assert!(verify_sha256(f.path(), &expected.to_uppercase()).unwrap());
        assert!(!verify_sha256(f.path(), "00").unwrap());
    }

    #[test]
    fn missing_file_is_not_verified() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!verify_sha256(&dir.path().join("nope.onnx"), "00").unwrap());
    }
}
