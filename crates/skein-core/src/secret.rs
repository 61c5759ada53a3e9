//! Folder secrets — the three-tier capability model.
//!
//! A folder is identified and protected by one root secret. Three tiers,
//! each derivable from the one above, never the other way:
//!
//!   ReadWrite — ed25519 signing key. Can author new Metas.
//!   ReadOnly  — verifying key + symmetric key. Can decrypt paths and chunks.
//!   Download  — verifying key only. Stores and relays ciphertext blindly.
//!
//! The string form is `{tier char}{base58 payload}{check char}` where the
//! tier char is `A`/`B`/`C` for ReadWrite/ReadOnly/Download and the check
//! char is a Luhn mod-58 digit over the base58 body.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::crypto::{self, CryptoError, Iv, SymmetricKey};

/// SHA3-256 of the verifying key — the cluster identifier on the wire.
pub type FolderId = [u8; 32];

pub const SIGNATURE_LEN: usize = 64;

/// Base58 alphabet shared with bs58's default (Bitcoin) alphabet.
/// Needed locally for the Luhn check digit.
const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    /// Ciphertext relay only.
    Download,
    /// Can decrypt, cannot author.
    ReadOnly,
    /// Full control.
    ReadWrite,
}

impl Capability {
    fn tier_char(self) -> char {
        match self {
            Capability::ReadWrite => 'A',
            Capability::ReadOnly => 'B',
            Capability::Download => 'C',
        }
    }

    fn from_tier_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(Capability::ReadWrite),
            'B' => Some(Capability::ReadOnly),
            'C' => Some(Capability::Download),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("operation requires {needed:?}, secret holds {held:?}")]
    CapabilityMissing {
        needed: Capability,
        held: Capability,
    },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("secret string too short")]
    TooShort,

    #[error("unknown capability tier {0:?}")]
    BadTier(char),

    #[error("check character mismatch")]
    BadChecksum,

    #[error("payload is not valid base58")]
    BadEncoding,

    #[error("payload has wrong length for its tier")]
    BadPayload,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A folder secret at some capability tier.
#[derive(Clone)]
pub struct Secret {
    level: Capability,
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
    symmetric: Option<SymmetricKey>,
}

impl Secret {
    /// Generate a fresh ReadWrite secret.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing(signing)
    }

    fn from_signing(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        // The symmetric key is a deterministic function of the seed, so
        // every ReadWrite holder derives the same ReadOnly secret.
        let symmetric = crypto::sha3_256(signing.as_bytes());
        Self {
            level: Capability::ReadWrite,
            signing: Some(signing),
            verifying,
            symmetric: Some(symmetric),
        }
    }

    pub fn level(&self) -> Capability {
        self.level
    }

    /// Derive a lower (or equal) tier. Deriving upward fails.
    pub fn derive(&self, level: Capability) -> Result<Secret, SecretError> {
        if level > self.level {
            return Err(SecretError::CapabilityMissing {
                needed: level,
                held: self.level,
            });
        }
        Ok(Secret {
            level,
            signing: if level == Capability::ReadWrite {
                self.signing.clone()
            } else {
                None
            },
            verifying: self.verifying,
            symmetric: if level >= Capability::ReadOnly {
                self.symmetric
            } else {
                None
            },
        })
    }

    /// The cluster identifier: SHA3-256 of the signing public key.
    pub fn folder_id(&self) -> FolderId {
        crypto::sha3_256(self.verifying.as_bytes())
    }

    pub fn symmetric_key(&self) -> Result<&SymmetricKey, SecretError> {
        self.symmetric
            .as_ref()
            .ok_or(SecretError::CapabilityMissing {
                needed: Capability::ReadOnly,
                held: self.level,
            })
    }

    pub fn sign(&self, bytes: &[u8]) -> Result<[u8; SIGNATURE_LEN], SecretError> {
        let signing = self.signing.as_ref().ok_or(SecretError::CapabilityMissing {
            needed: Capability::ReadWrite,
            held: self.level,
        })?;
        Ok(signing.sign(bytes).to_bytes())
    }

    /// Verification needs only the public key, so every tier can do it.
    pub fn verify(&self, bytes: &[u8], signature: &[u8; SIGNATURE_LEN]) -> Result<(), SecretError> {
        let sig = Signature::from_bytes(signature);
        self.verifying
            .verify(bytes, &sig)
            .map_err(|_| SecretError::InvalidSignature)
    }

    pub fn encrypt(&self, plaintext: &[u8], iv: &Iv) -> Result<Vec<u8>, SecretError> {
        Ok(crypto::encrypt(self.symmetric_key()?, iv, plaintext))
    }

    pub fn decrypt(&self, ciphertext: &[u8], iv: &Iv) -> Result<Vec<u8>, SecretError> {
        Ok(crypto::decrypt(self.symmetric_key()?, iv, ciphertext)?)
    }

    fn payload(&self) -> Vec<u8> {
        match self.level {
            Capability::ReadWrite => self
                .signing
                .as_ref()
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default(),
            Capability::ReadOnly => {
                let mut out = self.verifying.as_bytes().to_vec();
                if let Some(sym) = &self.symmetric {
                    out.extend_from_slice(sym);
                }
                out
            }
            Capability::Download => self.verifying.as_bytes().to_vec(),
        }
    }

    fn from_payload(level: Capability, payload: &[u8]) -> Result<Self, SecretError> {
        match level {
            Capability::ReadWrite => {
                let seed: [u8; 32] = payload.try_into().map_err(|_| SecretError::BadPayload)?;
                Ok(Self::from_signing(SigningKey::from_bytes(&seed)))
            }
            Capability::ReadOnly => {
                if payload.len() != 64 {
                    return Err(SecretError::BadPayload);
                }
                let vk: [u8; 32] = payload[..32].try_into().expect("split length checked");
                let mut symmetric = [0u8; 32];
                symmetric.copy_from_slice(&payload[32..]);
                Ok(Secret {
                    level,
                    signing: None,
                    verifying: VerifyingKey::from_bytes(&vk)
                        .map_err(|_| SecretError::BadPayload)?,
                    symmetric: Some(symmetric),
                })
            }
            Capability::Download => {
                let vk: [u8; 32] = payload.try_into().map_err(|_| SecretError::BadPayload)?;
                Ok(Secret {
                    level,
                    signing: None,
                    verifying: VerifyingKey::from_bytes(&vk)
                        .map_err(|_| SecretError::BadPayload)?,
                    symmetric: None,
                })
            }
        }
    }
}

/// Luhn mod-58 check character over a base58 body.
fn luhn_check(body: &[u8]) -> Result<u8, SecretError> {
    let n = BASE58_ALPHABET.len();
    let mut factor = 2usize;
    let mut sum = 0usize;
    for &c in body.iter().rev() {
        let code = BASE58_ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or(SecretError::BadEncoding)?;
        let mut addend = factor * code;
        factor = 3 - factor;
        addend = addend / n + addend % n;
        sum += addend;
    }
    Ok(BASE58_ALPHABET[(n - sum % n) % n])
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = bs58::encode(self.payload()).into_string();
        let check = luhn_check(body.as_bytes()).map_err(|_| std::fmt::Error)?;
        write!(f, "{}{}{}", self.level.tier_char(), body, check as char)
    }
}

impl std::str::FromStr for Secret {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 3 || !s.is_ascii() {
            return Err(SecretError::TooShort);
        }
        let tier = s.chars().next().expect("length checked");
        let level = Capability::from_tier_char(tier).ok_or(SecretError::BadTier(tier))?;

        let body = &s.as_bytes()[1..s.len() - 1];
        let check = s.as_bytes()[s.len() - 1];
        if luhn_check(body)? != check {
            return Err(SecretError::BadChecksum);
        }

        let payload = bs58::decode(body)
            .into_vec()
            .map_err(|_| SecretError::BadEncoding)?;
        Secret::from_payload(level, &payload)
    }
}

// Never print key material.
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("level", &self.level)
            .field("folder_id", &hex::encode(&self.folder_id()[..8]))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(Capability::ReadWrite > Capability::ReadOnly);
        assert!(Capability::ReadOnly > Capability::Download);
    }

    #[test]
    fn derive_preserves_folder_id() {
        let rw = Secret::generate();
        let ro = rw.derive(Capability::ReadOnly).unwrap();
        let dl = ro.derive(Capability::Download).unwrap();
        assert_eq!(rw.folder_id(), ro.folder_id());
        assert_eq!(ro.folder_id(), dl.folder_id());
    }

    #[test]
    fn derive_upward_is_refused() {
        let rw = Secret::generate();
        let ro = rw.derive(Capability::ReadOnly).unwrap();
        assert!(matches!(
            ro.derive(Capability::ReadWrite),
            Err(SecretError::CapabilityMissing { .. })
        ));
    }

    #[test]
    fn readonly_shares_symmetric_key() {
        let rw = Secret::generate();
        let ro = rw.derive(Capability::ReadOnly).unwrap();
        assert_eq!(rw.symmetric_key().unwrap(), ro.symmetric_key().unwrap());
    }

    #[test]
    fn download_cannot_decrypt() {
        let rw = Secret::generate();
        let dl = rw.derive(Capability::Download).unwrap();
        assert!(matches!(
            dl.symmetric_key(),
            Err(SecretError::CapabilityMissing { .. })
        ));
        assert!(dl.decrypt(&[0u8; 16], &[0u8; 16]).is_err());
    }

    #[test]
    fn sign_verify_roundtrip_across_tiers() {
        let rw = Secret::generate();
        let sig = rw.sign(b"meta bytes").unwrap();

        let dl = rw.derive(Capability::Download).unwrap();
        dl.verify(b"meta bytes", &sig).unwrap();
        assert!(matches!(
            dl.verify(b"tampered", &sig),
            Err(SecretError::InvalidSignature)
        ));
        assert!(matches!(
            dl.sign(b"anything"),
            Err(SecretError::CapabilityMissing { .. })
        ));
    }

    #[test]
    fn string_roundtrip_all_tiers() {
        let rw = Secret::generate();
        for level in [
            Capability::ReadWrite,
            Capability::ReadOnly,
            Capability::Download,
        ] {
            let secret = rw.derive(level).unwrap();
            let s = secret.to_string();
            assert_eq!(
                s.chars().next().unwrap(),
                level.tier_char(),
                "tier char for {level:?}"
            );
            let parsed: Secret = s.parse().unwrap();
            assert_eq!(parsed.level(), level);
            assert_eq!(parsed.folder_id(), rw.folder_id());
        }
    }

    #[test]
    fn parsed_readwrite_can_still_sign() {
        let rw = Secret::generate();
        let parsed: Secret = rw.to_string().parse().unwrap();
        let sig = parsed.sign(b"payload").unwrap();
        rw.verify(b"payload", &sig).unwrap();
        assert_eq!(parsed.symmetric_key().unwrap(), rw.symmetric_key().unwrap());
    }

    #[test]
    fn corrupted_string_is_rejected() {
        let s = Secret::generate().to_string();

        // Flip the check char
        let mut bad = s.clone().into_bytes();
        let last = *bad.last().unwrap();
        *bad.last_mut().unwrap() = if last == b'2' { b'3' } else { b'2' };
        let bad = String::from_utf8(bad).unwrap();
        assert!(matches!(
            bad.parse::<Secret>(),
            Err(SecretError::BadChecksum)
        ));

        // Unknown tier char
        let bad_tier = format!("Z{}", &s[1..]);
        assert!(matches!(
            bad_tier.parse::<Secret>(),
            Err(SecretError::BadTier('Z'))
        ));

        assert!(matches!("A".parse::<Secret>(), Err(SecretError::TooShort)));
    }

    #[test]
    fn debug_does_not_leak_keys() {
        let rw = Secret::generate();
        let debug = format!("{rw:?}");
        assert!(!debug.contains(&rw.to_string()[1..10]));
    }
}
