//! Bit-level I/O over the container's 32-bit word stream.
//!
//! Bits are packed MSB-first within each word; words serialize in
//! little-endian byte order. The writer hashes every completed word so the
//! trailer can be appended without a second pass over the stream.

use crate::error::{Error, Result};
use crate::hash::{hash_words, Murmur3};

/// First rope chunk size in words; later chunks double.
const ROPE_HEAD_WORDS: usize = 128;

/// Append-only word store built from doubling chunks.
///
/// Appends never move existing data, so a long encode avoids both
/// per-push reallocation and one giant contiguous allocation. The final
/// operation reads everything back out in order.
#[derive(Debug)]
struct WordRope {
    chunks: Vec<Vec<u32>>,
    len: usize,
}

impl WordRope {
    fn new() -> Self {
        Self {
            chunks: vec![Vec::with_capacity(ROPE_HEAD_WORDS)],
            len: 0,
        }
    }

    #[inline]
    fn push(&mut self, word: u32) {
        let last = self.chunks.last_mut().expect("rope has a chunk");
        if last.len() == last.capacity() {
            let next_cap = last.capacity() * 2;
            self.chunks.push(Vec::with_capacity(next_cap));
        }
        self.chunks
            .last_mut()
            .expect("rope has a chunk")
            .push(word);
        self.len += 1;
    }

    fn write_out(&self, target: &mut Vec<u8>) {
        target.reserve(self.len * 4);
        for chunk in &self.chunks {
            for &word in chunk {
                target.extend_from_slice(&word.to_le_bytes());
            }
        }
    }
}

/// A bit writer that packs bits MSB-first into 32-bit words.
#[derive(Debug)]
pub struct WordWriter {
    words: WordRope,
    hash: Murmur3,
    acc: u64,
    bits_in_acc: u32,
    bits_written: u64,
}

impl WordWriter {
    /// Create a writer whose trailer hash is seeded with `seed`.
    pub fn new(seed: u32) -> Self {
        Self {
            words: WordRope::new(),
            hash: Murmur3::new(seed),
            acc: 0,
            bits_in_acc: 0,
            bits_written: 0,
        }
    }

    /// Write a single bit (0 or 1).
    #[inline]
    pub fn write_bit(&mut self, bit: u32) {
        debug_assert!(bit <= 1);
        self.write_bits(bit, 1);
    }

    /// Write the low `len` bits of `code`, MSB-first.
    ///
    /// `len` must be in 1..=32 and `code` must not have dirty high bits.
    #[inline]
    pub fn write_bits(&mut self, code: u32, len: u32) {
        debug_assert!((1..=32).contains(&len));
        debug_assert!(len == 32 || code < (1u32 << len));

        // Data lives in the top `bits_in_acc` bits of the accumulator.
        self.acc |= (code as u64) << (64 - self.bits_in_acc - len);
        self.bits_in_acc += len;
        self.bits_written += len as u64;

        while self.bits_in_acc >= 32 {
            let word = (self.acc >> 32) as u32;
            self.hash.hash_word(word);
            self.words.push(word);
            self.acc <<= 32;
            self.bits_in_acc -= 32;
        }
    }

    /// Write a whole 32-bit word.
    #[inline]
    pub fn write_word(&mut self, word: u32) {
        self.write_bits(word, 32);
    }

    /// Total bits written so far (used for layer accounting).
    #[inline]
    pub fn bit_count(&self) -> u64 {
        self.bits_written
    }

    /// Flush the partial word (zero-padded), append the trailer hash and
    /// serialize the stream little-endian.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        if self.bits_in_acc > 0 {
            let word = (self.acc >> 32) as u32;
            self.hash.hash_word(word);
            self.words.push(word);
        }
        let trailer = self.hash.finalize();
        self.words.push(trailer);

        let mut out = Vec::new();
        self.words.write_out(&mut out);
        out
    }
}

/// Random-access bit reader over a decoded word stream.
///
/// Reads peek a 64-bit window across two words so any 1..=32-bit read
/// avoids a per-bit loop. The trailer word is excluded from the readable
/// payload.
#[derive(Debug)]
pub struct WordReader {
    words: Vec<u32>,
    bit_pos: u64,
    payload_bits: u64,
}

impl WordReader {
    /// Parse a byte stream into words. Fails on a length that is not a
    /// whole number of words or too short to hold a header and trailer.
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() % 4 != 0 {
            return Err(Error::CorruptBitstream(
                "stream length is not word-aligned".into(),
            ));
        }
        let count = data.len() / 4;
        if count < 6 {
            return Err(Error::CorruptBitstream("stream too short".into()));
        }

        let mut words = Vec::with_capacity(count);
        for bytes in data.chunks_exact(4) {
            words.push(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }

        let payload_bits = (count as u64 - 1) * 32;
        Ok(Self {
            words,
            bit_pos: 0,
            payload_bits,
        })
    }

    /// Recompute the stream hash and compare it against the trailer word.
    pub fn verify_trailer(&self, seed: u32) -> Result<()> {
        let n = self.words.len();
        let expected = self.words[n - 1];
        let actual = hash_words(&self.words[..n - 1], seed);
        if actual != expected {
            return Err(Error::CorruptBitstream("trailer hash mismatch".into()));
        }
        Ok(())
    }

    /// Read a single bit.
    #[inline]
    pub fn read_bit(&mut self) -> Result<u32> {
        self.read_bits(1)
    }

    /// Read `len` bits MSB-first, `len` in 1..=32.
    #[inline]
    pub fn read_bits(&mut self, len: u32) -> Result<u32> {
        debug_assert!((1..=32).contains(&len));
        if self.bit_pos + len as u64 > self.payload_bits {
            return Err(Error::CorruptBitstream("unexpected end of stream".into()));
        }

        let word_idx = (self.bit_pos >> 5) as usize;
        let offset = (self.bit_pos & 31) as u32;
        let hi = self.words[word_idx] as u64;
        let lo = *self.words.get(word_idx + 1).unwrap_or(&0) as u64;
        let window = (hi << 32) | lo;

        self.bit_pos += len as u64;
        Ok(((window << offset) >> (64 - len)) as u32)
    }

    /// Peek `len` bits without consuming them; missing tail bits read as
    /// zero so Huffman decoding near the end of the payload stays
    /// branch-free.
    #[inline]
    pub fn peek_bits(&self, len: u32) -> u32 {
        debug_assert!((1..=32).contains(&len));
        let word_idx = (self.bit_pos >> 5) as usize;
        let offset = (self.bit_pos & 31) as u32;
        let hi = *self.words.get(word_idx).unwrap_or(&0) as u64;
        let lo = *self.words.get(word_idx + 1).unwrap_or(&0) as u64;
        let window = (hi << 32) | lo;
        ((window << offset) >> (64 - len)) as u32
    }

    /// Consume `len` bits previously peeked.
    #[inline]
    pub fn consume(&mut self, len: u32) -> Result<()> {
        if self.bit_pos + len as u64 > self.payload_bits {
            return Err(Error::CorruptBitstream("unexpected end of stream".into()));
        }
        self.bit_pos += len as u64;
        Ok(())
    }

    /// Read a whole 32-bit word.
    #[inline]
    pub fn read_word(&mut self) -> Result<u32> {
        self.read_bits(32)
    }
}
