//! Transport security — node identity and per-connection encryption.
//!
//! The node key is a process-global X25519 static keypair; a peer's
//! identity is the BLAKE3 digest of its public key. Connections run
//! Noise_XX over TCP: mutual authentication, both static keys transmitted
//! encrypted. After the three handshake messages, the plaintext protocol
//! stream is cut into records of at most [`MAX_SEGMENT`] bytes, each
//! sealed by the Noise transport state and framed `u16 BE length ∥ ct`.
//!
//! Key material derives ZeroizeOnDrop — wiped from memory when dropped.
//! There is no unsafe code in this module.

use rand::RngCore;
use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Noise_XX: neither static key is visible to a passive observer.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest plaintext per Noise record (65535 minus the 16-byte MAC).
pub const MAX_SEGMENT: usize = 65535 - 16;

/// BLAKE3 digest of an X25519 public key — a node's identity.
pub type NodeDigest = [u8; 32];

pub fn node_digest(public_key: &[u8; 32]) -> NodeDigest {
    *blake3::hash(public_key).as_bytes()
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid Noise pattern string — this is a bug")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("record shorter than the 16-byte MAC")]
    TooShort,

    #[error("handshake finished without a peer static key")]
    NoPeerKey,
}

// ── Node key ──────────────────────────────────────────────────────────────────

/// The long-term X25519 keypair identifying this node.
///
/// Generated on first start and persisted (mode 0600). Immutable for the
/// process lifetime; every folder's sessions authenticate with it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NodeKey {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl NodeKey {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_private(seed)
    }

    /// Reconstruct from stored private bytes; the public key is derived.
    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn digest(&self) -> NodeDigest {
        node_digest(&self.public)
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Dialer side of the Noise_XX handshake.
pub struct HandshakeInitiator {
    state: HandshakeState,
}

impl HandshakeInitiator {
    /// Returns the initiator and message 1 to send.
    pub fn new(key: &NodeKey) -> Result<(Self, Vec<u8>), TransportError> {
        let state = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|_| TransportError::BadPattern)?,
        )
        .local_private_key(&*key.private_bytes())
        .build_initiator()?;

        let mut initiator = Self { state };
        let mut msg1 = vec![0u8; 64];
        let len = initiator.state.write_message(&[], &mut msg1)?;
        msg1.truncate(len);
        Ok((initiator, msg1))
    }

    /// Consume message 2, produce message 3 and the finished channel.
    pub fn finish(mut self, msg2: &[u8]) -> Result<(Channel, Vec<u8>), TransportError> {
        let mut payload = vec![0u8; msg2.len()];
        self.state.read_message(msg2, &mut payload)?;

        let mut msg3 = vec![0u8; 96];
        let len = self.state.write_message(&[], &mut msg3)?;
        msg3.truncate(len);

        Ok((Channel::from_handshake(self.state)?, msg3))
    }
}

/// Listener side of the Noise_XX handshake.
pub struct HandshakeResponder {
    state: HandshakeState,
}

impl HandshakeResponder {
    pub fn new(key: &NodeKey) -> Result<Self, TransportError> {
        let state = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|_| TransportError::BadPattern)?,
        )
        .local_private_key(&*key.private_bytes())
        .build_responder()?;
        Ok(Self { state })
    }

    /// Consume message 1, produce message 2.
    pub fn respond(mut self, msg1: &[u8]) -> Result<(ResponderPending, Vec<u8>), TransportError> {
        let mut payload = vec![0u8; msg1.len()];
        self.state.read_message(msg1, &mut payload)?;

        let mut msg2 = vec![0u8; 128];
        let len = self.state.write_message(&[], &mut msg2)?;
        msg2.truncate(len);

        Ok((ResponderPending { state: self.state }, msg2))
    }
}

/// Responder waiting for message 3.
pub struct ResponderPending {
    state: HandshakeState,
}

impl ResponderPending {
    pub fn finish(mut self, msg3: &[u8]) -> Result<Channel, TransportError> {
        let mut payload = vec![0u8; msg3.len()];
        self.state.read_message(msg3, &mut payload)?;
        Channel::from_handshake(self.state)
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// A completed Noise session over an ordered stream.
///
/// TCP delivers records in order, so the stateful transport's implicit
/// nonces stay synchronized and no replay window is needed — a reordered
/// or replayed record simply fails its MAC and kills the connection.
pub struct Channel {
    transport: TransportState,
    peer_digest: NodeDigest,
}

impl Channel {
    fn from_handshake(state: HandshakeState) -> Result<Self, TransportError> {
        let remote = state
            .get_remote_static()
            .ok_or(TransportError::NoPeerKey)?;
        let remote: [u8; 32] = remote.try_into().map_err(|_| TransportError::NoPeerKey)?;
        Ok(Self {
            transport: state.into_transport_mode()?,
            peer_digest: node_digest(&remote),
        })
    }

    /// Identity digest of the authenticated peer.
    pub fn peer_digest(&self) -> NodeDigest {
        self.peer_digest
    }

    /// Seal arbitrary-length plaintext into framed records, appended to
    /// `out`: the stream analog of one encrypted write.
    pub fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), TransportError> {
        let mut chunks = plaintext.chunks(MAX_SEGMENT);
        // An empty write still produces one (empty) record.
        let first: &[u8] = chunks.next().unwrap_or(&[]);
        self.seal_record(first, out)?;
        for chunk in chunks {
            self.seal_record(chunk, out)?;
        }
        Ok(())
    }

    fn seal_record(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), TransportError> {
        let mut ct = vec![0u8; plaintext.len() + 16];
        let len = self.transport.write_message(plaintext, &mut ct)?;
        ct.truncate(len);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&ct);
        Ok(())
    }

    /// Open one record's ciphertext (without its length prefix), appending
    /// the plaintext to `out`.
    pub fn open(&mut self, record: &[u8], out: &mut Vec<u8>) -> Result<(), TransportError> {
        if record.len() < 16 {
            return Err(TransportError::TooShort);
        }
        let start = out.len();
        out.resize(start + record.len(), 0);
        let len = self.transport.read_message(record, &mut out[start..])?;
        out.truncate(start + len);
        Ok(())
    }
}

/// Incremental parser for `u16 BE length ∥ ct` records read off the socket.
#[derive(Default)]
pub struct RecordDecoder {
    buf: Vec<u8>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete record's ciphertext.
    pub fn next(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let record = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(record)
    }
}
