//! Meta — one record per path per revision.
//!
//! A Meta describes a single path at a moment in time: its kind, attributes
//! and (for files) the ordered chunk list. Records are immutable; a change
//! produces a new Meta with a higher revision. The canonical bencode bytes
//! are what gets signed, stored and forwarded — peers without the signing
//! key keep the raw encoding verbatim so the signature stays checkable.

use bytes::Bytes;

use thiserror::Error;

use crate::bencode::{BencodeError, DictExt, Value};
use crate::chunker::ChunkerParams;
use crate::crypto::{self, CtHash, Iv, PtHmac, CT_HASH_LEN, IV_LEN};
use crate::path::PathId;
use crate::secret::{Secret, SecretError, SIGNATURE_LEN};

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),

    #[error("malformed field {0:?}")]
    BadField(&'static str),

    #[error("unknown meta kind {0}")]
    UnknownKind(i64),

    #[error("invalid signature")]
    InvalidSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKind {
    File,
    Directory,
    Symlink,
    Deleted,
}

impl MetaKind {
    pub fn as_i64(self) -> i64 {
        match self {
            MetaKind::File => 0,
            MetaKind::Directory => 1,
            MetaKind::Symlink => 2,
            MetaKind::Deleted => 255,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self, MetaError> {
        match v {
            0 => Ok(MetaKind::File),
            1 => Ok(MetaKind::Directory),
            2 => Ok(MetaKind::Symlink),
            255 => Ok(MetaKind::Deleted),
            other => Err(MetaError::UnknownKind(other)),
        }
    }
}

/// One chunk of a file, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    /// Keyed hash of the plaintext — content identity for IV reuse.
    pub pt_hmac: PtHmac,
    /// IV pinned to this content so ciphertext stays bit-stable.
    pub iv: Iv,
    /// Plaintext length.
    pub size: u32,
    /// SHA3-224 of the ciphertext — the wire identifier.
    pub ct_hash: CtHash,
}

impl ChunkRef {
    /// On-disk/wire ciphertext length (PKCS7-padded plaintext).
    pub fn ciphertext_len(&self) -> u64 {
        crypto::ciphertext_len(self.size as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub path_id: PathId,
    pub encrypted_path: Vec<u8>,
    pub encrypted_path_iv: Iv,
    pub kind: MetaKind,
    /// Unix seconds at signing time. Strictly monotonic per path in
    /// practice; ties are resolved on the encoded bytes.
    pub revision: i64,
    pub mtime: i64,
    pub windows_attrib: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// FILE only.
    pub chunker: Option<ChunkerParams>,
    pub chunks: Vec<ChunkRef>,
    /// SYMLINK only.
    pub encrypted_target: Vec<u8>,
    pub encrypted_target_iv: Iv,
}

impl Meta {
    /// Skeleton with empty attributes; callers fill what applies.
    pub fn new(path_id: PathId, kind: MetaKind, revision: i64) -> Self {
        Self {
            path_id,
            encrypted_path: Vec::new(),
            encrypted_path_iv: [0; IV_LEN],
            kind,
            revision,
            mtime: 0,
            windows_attrib: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            chunker: None,
            chunks: Vec::new(),
            encrypted_target: Vec::new(),
            encrypted_target_iv: [0; IV_LEN],
        }
    }

    /// Total plaintext size of all chunks.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }

    /// Canonical bencode bytes — the signing input.
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"kind".to_vec(), Value::Int(self.kind.as_i64()));
        dict.insert(b"revision".to_vec(), Value::Int(self.revision));
        dict.insert(b"mtime".to_vec(), Value::Int(self.mtime));
        dict.insert(b"path_id".to_vec(), Value::bytes(self.path_id.to_vec()));
        dict.insert(
            b"enc_path".to_vec(),
            Value::bytes(self.encrypted_path.clone()),
        );
        dict.insert(
            b"enc_path_iv".to_vec(),
            Value::bytes(self.encrypted_path_iv.to_vec()),
        );
        dict.insert(b"win_attrib".to_vec(), Value::Int(self.windows_attrib as i64));
        dict.insert(b"mode".to_vec(), Value::Int(self.mode as i64));
        dict.insert(b"uid".to_vec(), Value::Int(self.uid as i64));
        dict.insert(b"gid".to_vec(), Value::Int(self.gid as i64));

        if let Some(params) = &self.chunker {
            let mut c = std::collections::BTreeMap::new();
            c.insert(b"avg_bits".to_vec(), Value::Int(params.avg_bits as i64));
            c.insert(b"max".to_vec(), Value::Int(params.max_chunksize as i64));
            c.insert(b"min".to_vec(), Value::Int(params.min_chunksize as i64));
            c.insert(b"poly".to_vec(), Value::Int(params.polynomial as i64));
            c.insert(
                b"shift".to_vec(),
                Value::Int(params.polynomial_shift as i64),
            );
            dict.insert(b"chunker".to_vec(), Value::Dict(c));
        }
        if self.kind == MetaKind::File {
            let chunks = self
                .chunks
                .iter()
                .map(|chunk| {
                    let mut c = std::collections::BTreeMap::new();
                    c.insert(b"ct".to_vec(), Value::bytes(chunk.ct_hash.to_vec()));
                    c.insert(b"iv".to_vec(), Value::bytes(chunk.iv.to_vec()));
                    c.insert(b"pt".to_vec(), Value::bytes(chunk.pt_hmac.to_vec()));
                    c.insert(b"size".to_vec(), Value::Int(chunk.size as i64));
                    Value::Dict(c)
                })
                .collect();
            dict.insert(b"chunks".to_vec(), Value::List(chunks));
        }
        if self.kind == MetaKind::Symlink {
            dict.insert(
                b"target".to_vec(),
                Value::bytes(self.encrypted_target.clone()),
            );
            dict.insert(
                b"target_iv".to_vec(),
                Value::bytes(self.encrypted_target_iv.to_vec()),
            );
        }

        Value::Dict(dict).encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Meta, MetaError> {
        let value = Value::decode(bytes)?;
        let dict = value.as_dict()?;

        let kind = MetaKind::from_i64(dict.req_int("kind")?)?;
        let mut meta = Meta::new(
            fixed::<32>(dict.req_bytes("path_id")?, "path_id")?,
            kind,
            dict.req_int("revision")?,
        );
        meta.mtime = dict.req_int("mtime")?;
        meta.encrypted_path = dict.req_bytes("enc_path")?.to_vec();
        meta.encrypted_path_iv = fixed::<IV_LEN>(dict.req_bytes("enc_path_iv")?, "enc_path_iv")?;
        meta.windows_attrib = int_u32(dict.req_int("win_attrib")?, "win_attrib")?;
        meta.mode = int_u32(dict.req_int("mode")?, "mode")?;
        meta.uid = int_u32(dict.req_int("uid")?, "uid")?;
        meta.gid = int_u32(dict.req_int("gid")?, "gid")?;

        if let Some(chunker) = dict.opt("chunker") {
            let c = chunker.as_dict()?;
            meta.chunker = Some(ChunkerParams {
                polynomial: c.req_int("poly")? as u64,
                polynomial_shift: int_u32(c.req_int("shift")?, "shift")?,
                avg_bits: int_u32(c.req_int("avg_bits")?, "avg_bits")?,
                min_chunksize: int_u32(c.req_int("min")?, "min")?,
                max_chunksize: int_u32(c.req_int("max")?, "max")?,
            });
        }
        if kind == MetaKind::File {
            for chunk in dict.req("chunks")?.as_list()? {
                let c = chunk.as_dict()?;
                meta.chunks.push(ChunkRef {
                    pt_hmac: fixed::<32>(c.req_bytes("pt")?, "pt")?,
                    iv: fixed::<IV_LEN>(c.req_bytes("iv")?, "iv")?,
                    size: int_u32(c.req_int("size")?, "size")?,
                    ct_hash: fixed::<CT_HASH_LEN>(c.req_bytes("ct")?, "ct")?,
                });
            }
        }
        if kind == MetaKind::Symlink {
            meta.encrypted_target = dict.req_bytes("target")?.to_vec();
            meta.encrypted_target_iv =
                fixed::<IV_LEN>(dict.req_bytes("target_iv")?, "target_iv")?;
        }
        Ok(meta)
    }
}

fn fixed<const N: usize>(bytes: &[u8], field: &'static str) -> Result<[u8; N], MetaError> {
    bytes.try_into().map_err(|_| MetaError::BadField(field))
}

fn int_u32(v: i64, field: &'static str) -> Result<u32, MetaError> {
    u32::try_from(v).map_err(|_| MetaError::BadField(field))
}

/// A Meta plus the detached signature over its canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMeta {
    raw: Bytes,
    signature: [u8; SIGNATURE_LEN],
    meta: Meta,
}

impl SignedMeta {
    /// Author a record. Requires the ReadWrite tier.
    pub fn sign(meta: Meta, secret: &Secret) -> Result<Self, SecretError> {
        let raw = Bytes::from(meta.encode());
        let signature = secret.sign(&raw)?;
        Ok(Self {
            raw,
            signature,
            meta,
        })
    }

    /// Accept a record from storage or the wire: verify, then decode.
    pub fn from_parts(
        raw: Bytes,
        signature: [u8; SIGNATURE_LEN],
        secret: &Secret,
    ) -> Result<Self, MetaError> {
        secret
            .verify(&raw, &signature)
            .map_err(|_| MetaError::InvalidSignature)?;
        let meta = Meta::decode(&raw)?;
        Ok(Self {
            raw,
            signature,
            meta,
        })
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    pub fn path_id(&self) -> PathId {
        self.meta.path_id
    }

    pub fn revision(&self) -> i64 {
        self.meta.revision
    }

    /// Total order across revisions of one path: higher revision wins,
    /// ties fall back to the lexicographically greater signed bytes.
    pub fn supersedes(&self, other: &SignedMeta) -> bool {
        match self.revision().cmp(&other.revision()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.raw[..] > other.raw[..],
        }
    }
}
