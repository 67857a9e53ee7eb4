//! Content fingerprints: `wark` identifies an upload by `(salt, size,
//! chunk-hash-list)`; `filekey` is the per-file access-key suffix appended
//! to search results when a volume requires one (`SPEC_FULL.md` GLOSSARY).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256, Sha512};

/// `wark = H(salt, size, hashlist)`. Stable identity for an upload,
/// independent of where it's stored (`SPEC_FULL.md` §3 invariants).
pub fn wark_from_hashlist(salt: &str, size: u64, hashlist: &[String]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt.as_bytes());
    hasher.update(size.to_le_bytes());
    for h in hashlist {
        hasher.update(h.as_bytes());
    }
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(digest)
}

/// `filekey(salt, absPath, size, inodeOrZeroOnWindows)`; the caller truncates
/// to the volume's configured `fk` length before appending as `?k=...`.
pub fn gen_filekey(salt: &str, abs_path: &str, size: u64, inode: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(abs_path.as_bytes());
    hasher.update(size.to_le_bytes());
    hasher.update(inode.to_le_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wark_is_deterministic_and_salt_sensitive() {
        let a = wark_from_hashlist("salt1", 10, &["h1".to_string()]);
        let b = wark_from_hashlist("salt1", 10, &["h1".to_string()]);
        let c = wark_from_hashlist("salt2", 10, &["h1".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn filekey_is_truncatable_and_stable() {
        let k = gen_filekey("salt", "/srv/vol/a.bin", 10, 0);
        assert_eq!(&k[..4], &gen_filekey("salt", "/srv/vol/a.bin", 10, 0)[..4]);
    }
}
