//! Folder sync wire protocol.
//!
//! Every frame is `u32 BE length ∥ u8 kind ∥ payload`, payload a canonical
//! bencode dictionary (empty for the four flag messages). These frames ARE
//! the protocol — peers of any implementation must agree on every byte, so
//! kinds are fixed numbers and payload keys are part of the format.
//!
//! Frames travel inside the encrypted transport (see `transport`); nothing
//! here touches sockets. `FrameDecoder` is fed decrypted stream bytes and
//! yields complete messages.

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::bencode::{BencodeError, DictExt, Value};
use crate::crypto::{self, CtHash, SymmetricKey, CT_HASH_LEN};
use crate::path::PathId;
use crate::secret::{FolderId, SIGNATURE_LEN};

/// Hard ceiling on a single frame, checked before any allocation.
/// Generous enough for a BlockReply carrying one maximum-size chunk.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

pub const KIND_HANDSHAKE: u8 = 0;
pub const KIND_CHOKE: u8 = 1;
pub const KIND_UNCHOKE: u8 = 2;
pub const KIND_INTERESTED: u8 = 3;
pub const KIND_NOT_INTERESTED: u8 = 4;
pub const KIND_HAVE_META: u8 = 5;
pub const KIND_HAVE_CHUNK: u8 = 6;
pub const KIND_META_REQUEST: u8 = 7;
pub const KIND_META_REPLY: u8 = 8;
pub const KIND_BLOCK_REQUEST: u8 = 9;
pub const KIND_BLOCK_REPLY: u8 = 10;
pub const KIND_CANCEL: u8 = 11;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame of {0} bytes exceeds limit")]
    Oversize(usize),

    #[error("frame shorter than its header")]
    Truncated,

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("malformed field {0:?}")]
    BadField(&'static str),

    #[error(transparent)]
    Bencode(#[from] BencodeError),
}

/// First frame on every connection, both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub folder_id: FolderId,
    pub peer_name: String,
    pub user_agent: String,
    /// HMAC(symmetric_key, their_digest ∥ our_digest) — proves the sender
    /// holds the folder secret without revealing it.
    pub auth_token: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    HaveMeta {
        path_id: PathId,
        revision: i64,
    },
    HaveChunk {
        ct_hash: CtHash,
    },
    MetaRequest {
        path_id: PathId,
        revision: i64,
    },
    MetaReply {
        meta_bytes: Vec<u8>,
        signature: [u8; SIGNATURE_LEN],
    },
    BlockRequest {
        ct_hash: CtHash,
        offset: u32,
        size: u32,
    },
    BlockReply {
        ct_hash: CtHash,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel {
        ct_hash: CtHash,
        offset: u32,
        size: u32,
    },
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::Handshake(_) => KIND_HANDSHAKE,
            Message::Choke => KIND_CHOKE,
            Message::Unchoke => KIND_UNCHOKE,
            Message::Interested => KIND_INTERESTED,
            Message::NotInterested => KIND_NOT_INTERESTED,
            Message::HaveMeta { .. } => KIND_HAVE_META,
            Message::HaveChunk { .. } => KIND_HAVE_CHUNK,
            Message::MetaRequest { .. } => KIND_META_REQUEST,
            Message::MetaReply { .. } => KIND_META_REPLY,
            Message::BlockRequest { .. } => KIND_BLOCK_REQUEST,
            Message::BlockReply { .. } => KIND_BLOCK_REPLY,
            Message::Cancel { .. } => KIND_CANCEL,
        }
    }

    /// Payload bytes carried for the peer's benefit (for the payload-only
    /// bandwidth counters): block data and meta bytes, not protocol chrome.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::BlockReply { data, .. } => data.len(),
            Message::MetaReply { meta_bytes, .. } => meta_bytes.len(),
            _ => 0,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                return Vec::new()
            }
            Message::Handshake(hs) => {
                dict.insert(b"auth".to_vec(), Value::bytes(hs.auth_token.to_vec()));
                dict.insert(b"folder".to_vec(), Value::bytes(hs.folder_id.to_vec()));
                dict.insert(b"name".to_vec(), Value::bytes(hs.peer_name.as_bytes()));
                dict.insert(b"ua".to_vec(), Value::bytes(hs.user_agent.as_bytes()));
            }
            Message::HaveMeta { path_id, revision }
            | Message::MetaRequest { path_id, revision } => {
                dict.insert(b"path_id".to_vec(), Value::bytes(path_id.to_vec()));
                dict.insert(b"revision".to_vec(), Value::Int(*revision));
            }
            Message::HaveChunk { ct_hash } => {
                dict.insert(b"ct".to_vec(), Value::bytes(ct_hash.to_vec()));
            }
            Message::MetaReply {
                meta_bytes,
                signature,
            } => {
                dict.insert(b"meta".to_vec(), Value::bytes(meta_bytes.clone()));
                dict.insert(b"sig".to_vec(), Value::bytes(signature.to_vec()));
            }
            Message::BlockRequest {
                ct_hash,
                offset,
                size,
            }
            | Message::Cancel {
                ct_hash,
                offset,
                size,
            } => {
                dict.insert(b"ct".to_vec(), Value::bytes(ct_hash.to_vec()));
                dict.insert(b"offset".to_vec(), Value::Int(*offset as i64));
                dict.insert(b"size".to_vec(), Value::Int(*size as i64));
            }
            Message::BlockReply {
                ct_hash,
                offset,
                data,
            } => {
                dict.insert(b"ct".to_vec(), Value::bytes(ct_hash.to_vec()));
                dict.insert(b"data".to_vec(), Value::bytes(data.clone()));
                dict.insert(b"offset".to_vec(), Value::Int(*offset as i64));
            }
        }
        Value::Dict(dict).encode()
    }

    /// Encode the full frame: `u32 length ∥ kind ∥ payload`. The length
    /// field covers kind + payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(5 + payload.len());
        out.extend_from_slice(&((payload.len() + 1) as u32).to_be_bytes());
        out.push(self.kind());
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode_body(kind: u8, payload: &[u8]) -> Result<Message, ProtoError> {
        match kind {
            KIND_CHOKE => Ok(Message::Choke),
            KIND_UNCHOKE => Ok(Message::Unchoke),
            KIND_INTERESTED => Ok(Message::Interested),
            KIND_NOT_INTERESTED => Ok(Message::NotInterested),
            KIND_HANDSHAKE => {
                let value = Value::decode(payload)?;
                let dict = value.as_dict()?;
                Ok(Message::Handshake(Handshake {
                    folder_id: fixed::<32>(dict.req_bytes("folder")?, "folder")?,
                    peer_name: utf8(dict.req_bytes("name")?, "name")?,
                    user_agent: utf8(dict.req_bytes("ua")?, "ua")?,
                    auth_token: fixed::<32>(dict.req_bytes("auth")?, "auth")?,
                }))
            }
            KIND_HAVE_META | KIND_META_REQUEST => {
                let value = Value::decode(payload)?;
                let dict = value.as_dict()?;
                let path_id = fixed::<32>(dict.req_bytes("path_id")?, "path_id")?;
                let revision = dict.req_int("revision")?;
                Ok(if kind == KIND_HAVE_META {
                    Message::HaveMeta { path_id, revision }
                } else {
                    Message::MetaRequest { path_id, revision }
                })
            }
            KIND_HAVE_CHUNK => {
                let value = Value::decode(payload)?;
                let dict = value.as_dict()?;
                Ok(Message::HaveChunk {
                    ct_hash: fixed::<CT_HASH_LEN>(dict.req_bytes("ct")?, "ct")?,
                })
            }
            KIND_META_REPLY => {
                let value = Value::decode(payload)?;
                let dict = value.as_dict()?;
                Ok(Message::MetaReply {
                    meta_bytes: dict.req_bytes("meta")?.to_vec(),
                    signature: fixed::<SIGNATURE_LEN>(dict.req_bytes("sig")?, "sig")?,
                })
            }
            KIND_BLOCK_REQUEST | KIND_CANCEL => {
                let value = Value::decode(payload)?;
                let dict = value.as_dict()?;
                let ct_hash = fixed::<CT_HASH_LEN>(dict.req_bytes("ct")?, "ct")?;
                let offset = int_u32(dict.req_int("offset")?, "offset")?;
                let size = int_u32(dict.req_int("size")?, "size")?;
                Ok(if kind == KIND_BLOCK_REQUEST {
                    Message::BlockRequest {
                        ct_hash,
                        offset,
                        size,
                    }
                } else {
                    Message::Cancel {
                        ct_hash,
                        offset,
                        size,
                    }
                })
            }
            KIND_BLOCK_REPLY => {
                let value = Value::decode(payload)?;
                let dict = value.as_dict()?;
                Ok(Message::BlockReply {
                    ct_hash: fixed::<CT_HASH_LEN>(dict.req_bytes("ct")?, "ct")?,
                    offset: int_u32(dict.req_int("offset")?, "offset")?,
                    data: dict.req_bytes("data")?.to_vec(),
                })
            }
            other => Err(ProtoError::UnknownKind(other)),
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8], field: &'static str) -> Result<[u8; N], ProtoError> {
    bytes.try_into().map_err(|_| ProtoError::BadField(field))
}

fn int_u32(v: i64, field: &'static str) -> Result<u32, ProtoError> {
    u32::try_from(v).map_err(|_| ProtoError::BadField(field))
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, ProtoError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::BadField(field))
}

/// The handshake auth token. Both sides compute it with the digests in
/// sender-relative order, so each side verifies with arguments swapped.
pub fn auth_token(
    symmetric_key: &SymmetricKey,
    their_digest: &[u8; 32],
    our_digest: &[u8; 32],
) -> [u8; 32] {
    crypto::keyed_hash_parts(symmetric_key, &[their_digest, our_digest])
}

/// Incremental frame parser over decrypted stream bytes.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, or None until more bytes arrive.
    /// The returned usize is the full frame length (for byte accounting).
    pub fn next(&mut self) -> Result<Option<(Message, usize)>, ProtoError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes(
            self.buf[..4]
                .try_into()
                .expect("slice length checked above"),
        ) as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(ProtoError::Oversize(body_len));
        }
        if body_len == 0 {
            return Err(ProtoError::Truncated);
        }
        if self.buf.len() < 4 + body_len {
            return Ok(None);
        }
        self.buf.advance(4);
        let body = self.buf.split_to(body_len);
        let message = Message::decode_body(body[0], &body[1..])?;
        Ok(Some((message, 4 + body_len)))
    }
}
