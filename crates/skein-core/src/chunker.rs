//! Content-defined chunking over a Rabin fingerprint.
//!
//! Classic LBFS construction: a rolling fingerprint of the last 64 bytes in
//! GF(2)[x] modulo an irreducible polynomial. A chunk ends when the low
//! `avg_bits` bits of the fingerprint are zero (and the chunk has reached
//! `min_chunksize`), or unconditionally at `max_chunksize`, or at EOF.
//!
//! The parameters travel inside every FILE Meta, so a re-index after an
//! upgrade chunks exactly the way the original author did. The fingerprint
//! state resets at every cut: a chunk's boundary depends only on the bytes
//! since the previous cut, which is what makes unchanged spans of a file
//! produce identical chunks.

use thiserror::Error;

const WINDOW_SIZE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("polynomial degree must be at least 9, got {0}")]
    PolynomialTooSmall(u32),

    #[error("polynomial_shift {shift} does not match polynomial degree {degree}")]
    ShiftMismatch { shift: u32, degree: u32 },

    #[error("min_chunksize must be positive and not exceed max_chunksize")]
    BadSizes,

    #[error("avg_bits {0} out of range")]
    BadAvgBits(u32),
}

/// Chunking parameters, persisted inside each FILE Meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerParams {
    pub polynomial: u64,
    pub polynomial_shift: u32,
    pub avg_bits: u32,
    pub min_chunksize: u32,
    pub max_chunksize: u32,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            polynomial: 0x3DA3358B4DC173,
            polynomial_shift: 45,
            avg_bits: 20,
            min_chunksize: 1 << 20,
            max_chunksize: 8 << 20,
        }
    }
}

// ── GF(2) polynomial arithmetic ───────────────────────────────────────────────

fn degree(p: u64) -> u32 {
    63 - p.leading_zeros()
}

/// (nh·2⁶⁴ + nl) mod d in GF(2)[x].
fn polymod(mut nh: u64, mut nl: u64, d: u64) -> u64 {
    let k = degree(d);
    let d = d << (63 - k);

    if nh != 0 {
        if nh & (1 << 63) != 0 {
            nh ^= d;
        }
        for i in (0..63).rev() {
            if nh & (1u64 << i) != 0 {
                nh ^= d >> (63 - i);
                nl ^= d << (i + 1);
            }
        }
    }
    for i in (k..64).rev() {
        if nl & (1u64 << i) != 0 {
            nl ^= d >> (63 - i);
        }
    }
    nl
}

/// x·y in GF(2)[x], split into high and low 64-bit halves.
fn polymult(x: u64, y: u64) -> (u64, u64) {
    let mut ph = 0u64;
    let mut pl = if x & 1 != 0 { y } else { 0 };
    for i in 1..64 {
        if x & (1u64 << i) != 0 {
            ph ^= y >> (64 - i);
            pl ^= y << i;
        }
    }
    (ph, pl)
}

fn polymmult(x: u64, y: u64, d: u64) -> u64 {
    let (h, l) = polymult(x, y);
    polymod(h, l, d)
}

// ── Chunker ───────────────────────────────────────────────────────────────────

/// Streaming Rabin chunker. Feed bytes with [`Chunker::push`]; a `true`
/// return means the current chunk ends after that byte.
pub struct Chunker {
    params: ChunkerParams,
    mask: u64,
    shift: u32,
    /// Appends one byte to the fingerprint (reduction table).
    mod_table: [u64; 256],
    /// Cancels the byte leaving the 64-byte window.
    out_table: [u64; 256],
    window: [u8; WINDOW_SIZE],
    wpos: usize,
    fingerprint: u64,
    chunk_len: u32,
}

impl Chunker {
    pub fn new(params: ChunkerParams) -> Result<Self, ChunkerError> {
        if params.polynomial < 0x200 {
            return Err(ChunkerError::PolynomialTooSmall(degree(params.polynomial.max(1))));
        }
        let deg = degree(params.polynomial);
        if params.polynomial_shift != deg - 8 {
            return Err(ChunkerError::ShiftMismatch {
                shift: params.polynomial_shift,
                degree: deg,
            });
        }
        if params.min_chunksize == 0 || params.min_chunksize > params.max_chunksize {
            return Err(ChunkerError::BadSizes);
        }
        if params.avg_bits == 0 || params.avg_bits >= 64 {
            return Err(ChunkerError::BadAvgBits(params.avg_bits));
        }

        let poly = params.polynomial;
        let shift = params.polynomial_shift;

        let mut mod_table = [0u64; 256];
        let t1 = polymod(0, 1u64 << deg, poly);
        for (j, entry) in mod_table.iter_mut().enumerate() {
            *entry = polymmult(j as u64, t1, poly) | ((j as u64) << deg);
        }

        // out_table[b] is b·x^(8·WINDOW_SIZE) mod poly: xor-ing it out of the
        // fingerprint removes the byte that slides off the window.
        let append = |p: u64, m: u8| ((p << 8) | m as u64) ^ mod_table[(p >> shift) as usize & 0xff];
        let mut sizeshift = 1u64;
        for _ in 1..WINDOW_SIZE {
            sizeshift = append(sizeshift, 0);
        }
        let mut out_table = [0u64; 256];
        for (b, entry) in out_table.iter_mut().enumerate() {
            *entry = polymmult(b as u64, sizeshift, poly);
        }

        Ok(Self {
            params,
            mask: (1u64 << params.avg_bits) - 1,
            shift,
            mod_table,
            out_table,
            window: [0; WINDOW_SIZE],
            wpos: 0,
            fingerprint: 0,
            chunk_len: 0,
        })
    }

    pub fn params(&self) -> &ChunkerParams {
        &self.params
    }

    /// Bytes accumulated in the unfinished chunk.
    pub fn pending(&self) -> u32 {
        self.chunk_len
    }

    /// Reset per-chunk state. Called automatically after each cut.
    pub fn reset(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.wpos = 0;
        self.fingerprint = 0;
        self.chunk_len = 0;
    }

    fn append8(&self, p: u64, m: u8) -> u64 {
        ((p << 8) | m as u64) ^ self.mod_table[(p >> self.shift) as usize & 0xff]
    }

    /// Feed one byte. Returns true when the chunk ends after this byte.
    pub fn push(&mut self, byte: u8) -> bool {
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;
        let outgoing = self.window[self.wpos];
        self.window[self.wpos] = byte;
        self.fingerprint = self.append8(self.fingerprint ^ self.out_table[outgoing as usize], byte);
        self.chunk_len += 1;

        let cut = self.chunk_len >= self.params.max_chunksize
            || (self.chunk_len >= self.params.min_chunksize && self.fingerprint & self.mask == 0);
        if cut {
            self.reset();
        }
        cut
    }

    /// Split an in-memory buffer into chunk boundaries (offsets of one past
    /// each chunk end; the final boundary is `data.len()` unless empty).
    pub fn split(&mut self, data: &[u8]) -> Vec<usize> {
        self.reset();
        let mut cuts = Vec::new();
        for (i, &b) in data.iter().enumerate() {
            if self.push(b) {
                cuts.push(i + 1);
            }
        }
        if self.chunk_len > 0 {
            cuts.push(data.len());
            self.reset();
        }
        cuts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ChunkerParams {
        ChunkerParams {
            min_chunksize: 64,
            max_chunksize: 1024,
            avg_bits: 6,
            ..ChunkerParams::default()
        }
    }

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        // xorshift — deterministic input without pulling rand into the test
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn default_params_are_consistent() {
        Chunker::new(ChunkerParams::default()).unwrap();
    }

    #[test]
    fn rejects_mismatched_shift() {
        let params = ChunkerParams {
            polynomial_shift: 40,
            ..ChunkerParams::default()
        };
        assert!(matches!(
            Chunker::new(params),
            Err(ChunkerError::ShiftMismatch { .. })
        ));
    }

    #[test]
    fn rejects_bad_sizes() {
        let params = ChunkerParams {
            min_chunksize: 2048,
            max_chunksize: 1024,
            avg_bits: 6,
            ..ChunkerParams::default()
        };
        assert!(matches!(Chunker::new(params), Err(ChunkerError::BadSizes)));
    }

    #[test]
    fn boundaries_are_deterministic() {
        let data = pseudo_random(64 * 1024, 7);
        let a = Chunker::new(small_params()).unwrap().split(&data);
        let b = Chunker::new(small_params()).unwrap().split(&data);
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert_eq!(*a.last().unwrap(), data.len());
    }

    #[test]
    fn chunks_respect_min_and_max() {
        let data = pseudo_random(256 * 1024, 11);
        let cuts = Chunker::new(small_params()).unwrap().split(&data);
        let mut prev = 0;
        for (i, &cut) in cuts.iter().enumerate() {
            let len = cut - prev;
            assert!(len <= 1024, "chunk {i} overlong: {len}");
            // The final chunk may be short — EOF forces a cut.
            if i + 1 < cuts.len() {
                assert!(len >= 64, "chunk {i} undersized: {len}");
            }
            prev = cut;
        }
    }

    #[test]
    fn eof_always_cuts() {
        let data = pseudo_random(100, 3); // below min_chunksize
        let cuts = Chunker::new(small_params()).unwrap().split(&data);
        assert_eq!(cuts, vec![100]);
    }

    #[test]
    fn empty_input_has_no_chunks() {
        let cuts = Chunker::new(small_params()).unwrap().split(&[]);
        assert!(cuts.is_empty());
    }

    #[test]
    fn prefix_edit_leaves_later_chunks_aligned() {
        // Content-defined chunking's whole point: an insertion near the
        // start must not shift every boundary downstream.
        let original = pseudo_random(128 * 1024, 23);
        let mut edited = original.clone();
        edited.splice(10..10, [0xAA, 0xBB, 0xCC]);

        let mut chunker = Chunker::new(small_params()).unwrap();
        let cuts_a = chunker.split(&original);
        let cuts_b = chunker.split(&edited);

        // Compare chunk contents from the tail: most should be identical.
        let chunks = |data: &[u8], cuts: &[usize]| -> Vec<Vec<u8>> {
            let mut prev = 0;
            cuts.iter()
                .map(|&c| {
                    let chunk = data[prev..c].to_vec();
                    prev = c;
                    chunk
                })
                .collect()
        };
        let a = chunks(&original, &cuts_a);
        let b = chunks(&edited, &cuts_b);
        let shared_tail = a
            .iter()
            .rev()
            .zip(b.iter().rev())
            .take_while(|(x, y)| x == y)
            .count();
        assert!(
            shared_tail >= a.len() / 2,
            "only {shared_tail} of {} tail chunks survived a 3-byte edit",
            a.len()
        );
    }

    #[test]
    fn constant_input_cuts_at_min() {
        // An all-zero stream keeps the fingerprint at zero, so the content
        // condition fires as soon as min_chunksize allows.
        let data = vec![0u8; 4096];
        let cuts = Chunker::new(small_params()).unwrap().split(&data);
        let mut prev = 0;
        for &cut in &cuts[..cuts.len() - 1] {
            assert_eq!(cut - prev, 64);
            prev = cut;
        }
    }
}
