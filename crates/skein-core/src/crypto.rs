//! Symmetric chunk cryptography.
//!
//! Everything here is deterministic on purpose: the same
//! `(plaintext, key, iv)` triple must always produce the same ciphertext,
//! so unchanged chunks keep their ciphertext hash across revisions and
//! peers can deduplicate them on the wire.
//!
//!   pt_hmac = HMAC-SHA3-256(symmetric_key, plaintext)   — content identity
//!   ciphertext = AES-256-CBC/PKCS7(symmetric_key, iv)   — storage + wire form
//!   ct_hash = SHA3-224(ciphertext)                      — wire identifier

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha3::{Digest, Sha3_224, Sha3_256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha3 = Hmac<Sha3_256>;

/// SHA3-224 digest of a chunk's ciphertext. The wire identifier.
pub const CT_HASH_LEN: usize = 28;
pub type CtHash = [u8; CT_HASH_LEN];

/// HMAC of a chunk's plaintext. Identifies content for IV reuse.
pub type PtHmac = [u8; 32];

pub const IV_LEN: usize = 16;
pub type Iv = [u8; IV_LEN];

pub type SymmetricKey = [u8; 32];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext length not a whole number of blocks")]
    BadLength,

    #[error("bad PKCS7 padding — wrong key or corrupted ciphertext")]
    BadPadding,
}

/// HMAC-SHA3-256 under the folder's symmetric key.
/// Used for `pt_hmac`, `path_id` and the handshake auth token.
pub fn keyed_hash(key: &SymmetricKey, data: &[u8]) -> [u8; 32] {
    let mut mac =
        HmacSha3::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Keyed hash over multiple segments without concatenating them first.
pub fn keyed_hash_parts(key: &SymmetricKey, parts: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        HmacSha3::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// SHA3-224 of ciphertext bytes.
pub fn ct_hash(ciphertext: &[u8]) -> CtHash {
    let digest = Sha3_224::digest(ciphertext);
    let mut out = [0u8; CT_HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// SHA3-256 — folder ids and symmetric-key derivation.
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

/// Fresh random 128-bit IV. Drawn once per new chunk content, then pinned
/// in the Meta so re-encryption stays bit-stable.
pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// AES-256-CBC with PKCS7 padding. Output length is the plaintext length
/// rounded up to the next 16-byte block boundary.
pub fn encrypt(key: &SymmetricKey, iv: &Iv, plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn decrypt(key: &SymmetricKey, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CryptoError::BadLength);
    }
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}

/// Ciphertext length for a plaintext of `len` bytes under PKCS7.
pub fn ciphertext_len(len: u64) -> u64 {
    (len / 16 + 1) * 16
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: SymmetricKey = [0x42; 32];
    const IV: Iv = [0x07; 16];

    #[test]
    fn encrypt_decrypt_roundtrip() {
        for len in [0usize, 1, 15, 16, 17, 1024] {
            let plaintext = vec![0xabu8; len];
            let ct = encrypt(&KEY, &IV, &plaintext);
            assert_eq!(ct.len() as u64, ciphertext_len(len as u64));
            assert_eq!(decrypt(&KEY, &IV, &ct).unwrap(), plaintext);
        }
    }

    #[test]
    fn encryption_is_deterministic() {
        let ct1 = encrypt(&KEY, &IV, b"same bytes");
        let ct2 = encrypt(&KEY, &IV, b"same bytes");
        assert_eq!(ct1, ct2);
        assert_eq!(ct_hash(&ct1), ct_hash(&ct2));
    }

    #[test]
    fn different_iv_different_ciphertext() {
        let ct1 = encrypt(&KEY, &[0u8; 16], b"same bytes");
        let ct2 = encrypt(&KEY, &[1u8; 16], b"same bytes");
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn decrypt_rejects_ragged_length() {
        assert_eq!(decrypt(&KEY, &IV, &[0u8; 17]), Err(CryptoError::BadLength));
        assert_eq!(decrypt(&KEY, &IV, &[]), Err(CryptoError::BadLength));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let ct = encrypt(&KEY, &IV, b"secret");
        let wrong: SymmetricKey = [0x43; 32];
        // Either padding fails or the plaintext differs; padding failure is
        // the overwhelmingly common case for CBC.
        match decrypt(&wrong, &IV, &ct) {
            Err(CryptoError::BadPadding) => {}
            Ok(pt) => assert_ne!(pt, b"secret"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn keyed_hash_is_stable_and_keyed() {
        let a = keyed_hash(&KEY, b"payload");
        let b = keyed_hash(&KEY, b"payload");
        let c = keyed_hash(&[0x01; 32], b"payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn keyed_hash_parts_matches_concatenation() {
        let joined = keyed_hash(&KEY, b"leftright");
        let parts = keyed_hash_parts(&KEY, &[b"left", b"right"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn ct_hash_len_is_sha3_224() {
        assert_eq!(ct_hash(b"x").len(), 28);
    }
}
