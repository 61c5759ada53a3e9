//! Path canonicalization and identity.
//!
//! Every path under the folder root maps to one canonical byte string:
//! relative to the root, forward-slash separators, optionally NFC-normalized
//! and lowercased (per-folder flags). The canonical bytes never leave the
//! machine in the clear — peers see only `path_id` (a keyed hash) and the
//! AES-CBC ciphertext of the bytes.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::crypto::{self, Iv, SymmetricKey};
use crate::secret::{Secret, SecretError};

/// HMAC-SHA3-256 of the canonical path bytes under the symmetric key.
pub type PathId = [u8; 32];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path {0:?} is not under the folder root")]
    OutsideRoot(PathBuf),

    #[error("path {0:?} is not valid UTF-8")]
    NonUtf8(PathBuf),

    #[error("canonical path contains an invalid segment")]
    BadSegment,
}

/// Per-folder normalization policy.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    root: PathBuf,
    nfc: bool,
    lowercase: bool,
}

impl PathNormalizer {
    pub fn new(root: impl Into<PathBuf>, nfc: bool, lowercase: bool) -> Self {
        Self {
            root: root.into(),
            nfc,
            lowercase,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical byte string for an absolute path under the root.
    pub fn normalize(&self, abspath: &Path) -> Result<Vec<u8>, PathError> {
        let rel = abspath
            .strip_prefix(&self.root)
            .map_err(|_| PathError::OutsideRoot(abspath.to_path_buf()))?;

        let mut segments = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| PathError::NonUtf8(abspath.to_path_buf()))?;
                    segments.push(part.to_string());
                }
                Component::CurDir => continue,
                // `..`, roots and prefixes would escape the folder
                _ => return Err(PathError::OutsideRoot(abspath.to_path_buf())),
            }
        }

        let mut joined = segments.join("/");
        if self.nfc {
            joined = joined.nfc().collect();
        }
        if self.lowercase {
            joined = joined.to_lowercase();
        }
        Ok(joined.into_bytes())
    }

    /// Inverse direction: canonical bytes back to an absolute path under the
    /// root. Used by the assembler on decrypted path ciphertext, so the
    /// input is untrusted and segments are re-validated.
    pub fn absolutize(&self, canonical: &[u8]) -> Result<PathBuf, PathError> {
        let text = std::str::from_utf8(canonical).map_err(|_| PathError::BadSegment)?;
        if text.is_empty() {
            return Err(PathError::BadSegment);
        }
        let mut out = self.root.clone();
        for segment in text.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(PathError::BadSegment);
            }
            out.push(segment);
        }
        Ok(out)
    }
}

/// `path_id = HMAC(symmetric_key, canonical_bytes)`.
pub fn path_id(key: &SymmetricKey, canonical: &[u8]) -> PathId {
    crypto::keyed_hash(key, canonical)
}

/// Encrypt canonical path bytes under a fresh random IV.
pub fn encrypt_path(secret: &Secret, canonical: &[u8]) -> Result<(Vec<u8>, Iv), SecretError> {
    let iv = crypto::random_iv();
    let ciphertext = secret.encrypt(canonical, &iv)?;
    Ok((ciphertext, iv))
}

pub fn decrypt_path(secret: &Secret, ciphertext: &[u8], iv: &Iv) -> Result<Vec<u8>, SecretError> {
    secret.decrypt(ciphertext, iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::Secret;

    fn normalizer() -> PathNormalizer {
        PathNormalizer::new("/sync/folder", false, false)
    }

    #[test]
    fn normalize_strips_root_and_uses_forward_slashes() {
        let n = normalizer();
        let canonical = n.normalize(Path::new("/sync/folder/a/b/c.txt")).unwrap();
        assert_eq!(canonical, b"a/b/c.txt");
    }

    #[test]
    fn normalize_rejects_outside_root() {
        let n = normalizer();
        assert!(matches!(
            n.normalize(Path::new("/elsewhere/x")),
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            n.normalize(Path::new("/sync/folder/../escape")),
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[test]
    fn lowercase_flag() {
        let n = PathNormalizer::new("/r", false, true);
        assert_eq!(n.normalize(Path::new("/r/Dir/File.TXT")).unwrap(), b"dir/file.txt");
    }

    #[test]
    fn nfc_flag_composes() {
        // "e" + combining acute vs precomposed "é"
        let decomposed = "e\u{0301}.txt";
        let n = PathNormalizer::new("/r", true, false);
        let canonical = n
            .normalize(&Path::new("/r").join(decomposed))
            .unwrap();
        assert_eq!(canonical, "\u{00e9}.txt".as_bytes());
    }

    #[test]
    fn absolutize_roundtrip() {
        let n = normalizer();
        let abs = n.absolutize(b"a/b/c.txt").unwrap();
        assert_eq!(abs, PathBuf::from("/sync/folder/a/b/c.txt"));
        assert_eq!(n.normalize(&abs).unwrap(), b"a/b/c.txt");
    }

    #[test]
    fn absolutize_rejects_traversal() {
        let n = normalizer();
        assert_eq!(n.absolutize(b"../x"), Err(PathError::BadSegment));
        assert_eq!(n.absolutize(b"a//b"), Err(PathError::BadSegment));
        assert_eq!(n.absolutize(b""), Err(PathError::BadSegment));
    }

    #[test]
    fn path_id_is_deterministic_and_keyed() {
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        assert_eq!(path_id(&key_a, b"a/b"), path_id(&key_a, b"a/b"));
        assert_ne!(path_id(&key_a, b"a/b"), path_id(&key_b, b"a/b"));
        assert_ne!(path_id(&key_a, b"a/b"), path_id(&key_a, b"a/c"));
    }

    #[test]
    fn path_encryption_roundtrip() {
        let secret = Secret::generate();
        let (ct, iv) = encrypt_path(&secret, b"docs/note.md").unwrap();
        assert_ne!(ct, b"docs/note.md");
        assert_eq!(decrypt_path(&secret, &ct, &iv).unwrap(), b"docs/note.md");
    }
}
