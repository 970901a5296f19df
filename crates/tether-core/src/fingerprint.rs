//! Build fingerprint: truncated SHA-256 of the running executable.
//!
//! The control protocol may evolve faster than a numbered version, so
//! compatibility is keyed on the binary itself. Computed once at first use
//! and cached; the value reflects the file on disk when this process asked,
//! not any later replacement.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::OnceLock;

/// Length of the hex-encoded fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

static BUILD_HASH: OnceLock<String> = OnceLock::new();

/// The fingerprint of the current executable, `"unknown"` if it cannot be
/// hashed.
pub fn build_fingerprint() -> &'static str {
    BUILD_HASH.get_or_init(compute)
}

fn compute() -> String {
    match hash_current_exe() {
        Ok(h) => h,
        Err(_) => "unknown".to_string(),
    }
}

fn hash_current_exe() -> std::io::Result<String> {
    let exe = std::env::current_exe()?;
    let mut file = std::fs::File::open(exe)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..FINGERPRINT_LEN].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_short_hex() {
        let fp = build_fingerprint();
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(build_fingerprint(), build_fingerprint());
    }
}
