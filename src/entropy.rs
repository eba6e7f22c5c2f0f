//! Chaos-indexed entropy coding of residual planes.
//!
//! Each plane is coded through up to eight parallel Huffman tables selected
//! per pixel by the chaos metric. The alphabet extends the 256 literal
//! residuals with zero-run symbols so flat regions collapse to a handful of
//! bits. A run symbol occupies the stream position of the run's first zero
//! (where the decoder must learn the run length); the encoder reserves that
//! slot and patches it when the run terminates.

use crate::bits::{WordReader, WordWriter};
use crate::error::{Error, Result};
use crate::huffman::{HuffmanDecoder, HuffmanEncoder};

/// Literal residual symbols.
pub const NUM_LITERALS: usize = 256;
/// Zero-run symbols appended to the literal alphabet.
pub const ZRLE_SYMS: usize = 128;
/// Full plane alphabet.
pub const ALPHABET: usize = NUM_LITERALS + ZRLE_SYMS;

/// Long-run escape: run length continues in nibble groups.
const RUN_ESCAPE: u16 = (ALPHABET - 1) as u16;
/// Longest run expressed by a direct run symbol.
const MAX_DIRECT_RUN: u32 = (ZRLE_SYMS - 1) as u32;

/// One recorded symbol, tagged with the stream position where the decoder
/// will consume it.
#[derive(Debug, Clone, Copy)]
struct SymRec {
    seq: u32,
    chaos: u8,
    sym: u16,
    /// Set for [`RUN_ESCAPE`]: the run length minus 128.
    extra: u32,
}

const PENDING: u16 = u16::MAX;

/// Two-pass plane encoder: `push` records symbols and histograms, then
/// `write_tables` / `write_pending` replay them into the stream.
#[derive(Debug)]
pub struct PlaneEncoder {
    levels: usize,
    hists: Vec<Vec<u32>>,
    recs: Vec<SymRec>,
    run: u32,
    run_slot: usize,
    cursor: usize,
    encoders: Vec<HuffmanEncoder>,
}

impl PlaneEncoder {
    /// Create an encoder with `levels` chaos contexts.
    pub fn new(levels: usize) -> Self {
        Self {
            levels,
            hists: vec![vec![0u32; ALPHABET]; levels],
            recs: Vec::new(),
            run: 0,
            run_slot: 0,
            cursor: 0,
            encoders: Vec::new(),
        }
    }

    /// Record the residual for the next coded cell. `seq` is the cell's
    /// position tag; tags must be strictly increasing across calls.
    pub fn push(&mut self, seq: u32, chaos: usize, value: u8) {
        debug_assert!(chaos < self.levels);
        if value == 0 {
            if self.run == 0 {
                self.run_slot = self.recs.len();
                self.recs.push(SymRec {
                    seq,
                    chaos: chaos as u8,
                    sym: PENDING,
                    extra: 0,
                });
            }
            self.run += 1;
        } else {
            self.end_run();
            self.hists[chaos][value as usize] += 1;
            self.recs.push(SymRec {
                seq,
                chaos: chaos as u8,
                sym: value as u16,
                extra: 0,
            });
        }
    }

    /// Terminate any open zero run (end of plane or context reset).
    pub fn end_run(&mut self) {
        if self.run == 0 {
            return;
        }
        let rec = &mut self.recs[self.run_slot];
        if self.run <= MAX_DIRECT_RUN {
            rec.sym = (NUM_LITERALS as u32 + self.run - 1) as u16;
        } else {
            rec.sym = RUN_ESCAPE;
            rec.extra = self.run - (MAX_DIRECT_RUN + 1);
        }
        self.hists[rec.chaos as usize][rec.sym as usize] += 1;
        self.run = 0;
    }

    /// Build the per-chaos Huffman codes. Call after the final `end_run`.
    pub fn finalize(&mut self) {
        debug_assert_eq!(self.run, 0, "open zero run at finalize");
        self.encoders = self
            .hists
            .iter()
            .map(|hist| HuffmanEncoder::from_frequencies(hist))
            .collect();
    }

    /// Write the per-chaos tables, one present bit each. Returns bits
    /// written.
    pub fn write_tables(&self, writer: &mut WordWriter) -> u64 {
        let start = writer.bit_count();
        for encoder in &self.encoders {
            if encoder.is_empty() {
                writer.write_bit(0);
            } else {
                writer.write_bit(1);
                encoder.write_table(writer);
            }
        }
        writer.bit_count() - start
    }

    /// Write every recorded symbol tagged with `seq`, in order.
    #[inline]
    pub fn write_pending(&mut self, seq: u32, writer: &mut WordWriter) {
        while self.cursor < self.recs.len() && self.recs[self.cursor].seq == seq {
            let rec = self.recs[self.cursor];
            self.encoders[rec.chaos as usize].write_symbol(rec.sym as usize, writer);
            if rec.sym == RUN_ESCAPE {
                write_run_extension(writer, rec.extra);
            }
            self.cursor += 1;
        }
    }

    /// True when no symbol was recorded for any chaos level.
    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }
}

/// Write a long-run extension: nibble groups of 3 payload bits plus a
/// continuation bit, low group first.
fn write_run_extension(writer: &mut WordWriter, mut value: u32) {
    loop {
        let payload = value & 7;
        value >>= 3;
        let more = (value != 0) as u32;
        writer.write_bits((more << 3) | payload, 4);
        if more == 0 {
            break;
        }
    }
}

/// Read a long-run extension written by [`write_run_extension`].
fn read_run_extension(reader: &mut WordReader) -> Result<u32> {
    let mut value = 0u32;
    let mut shift = 0u32;
    loop {
        let nibble = reader.read_bits(4)?;
        if shift > 27 {
            return Err(Error::CorruptBitstream("zero run length overflow".into()));
        }
        value |= (nibble & 7) << shift;
        shift += 3;
        if nibble & 8 == 0 {
            return Ok(value);
        }
    }
}

/// Streaming decoder mirroring [`PlaneEncoder`].
#[derive(Debug)]
pub struct PlaneDecoder {
    decoders: Vec<Option<HuffmanDecoder>>,
    pending: u64,
}

impl PlaneDecoder {
    /// Read the per-chaos tables (present bit each).
    pub fn read_tables(reader: &mut WordReader, levels: usize) -> Result<Self> {
        let mut decoders = Vec::with_capacity(levels);
        for _ in 0..levels {
            if reader.read_bit()? == 1 {
                decoders.push(Some(HuffmanDecoder::read_table(reader, ALPHABET)?));
            } else {
                decoders.push(None);
            }
        }
        Ok(Self {
            decoders,
            pending: 0,
        })
    }

    /// Produce the residual for the next coded cell.
    #[inline]
    pub fn next(&mut self, chaos: usize, reader: &mut WordReader) -> Result<u8> {
        if self.pending > 0 {
            self.pending -= 1;
            return Ok(0);
        }
        let decoder = self.decoders[chaos]
            .as_ref()
            .ok_or_else(|| Error::CorruptBitstream("symbol from absent table".into()))?;
        let sym = decoder.next_symbol(reader)?;
        if (sym as usize) < NUM_LITERALS {
            return Ok(sym as u8);
        }
        let run = if sym == RUN_ESCAPE {
            MAX_DIRECT_RUN + 1 + read_run_extension(reader)?
        } else {
            sym as u32 - NUM_LITERALS as u32 + 1
        };
        self.pending = run as u64 - 1;
        Ok(0)
    }

    /// Verify no zero run crosses a context reset.
    pub fn check_reset(&self) -> Result<()> {
        if self.pending != 0 {
            return Err(Error::CorruptBitstream(
                "zero run crosses a context reset".into(),
            ));
        }
        Ok(())
    }
}

/// Online entropy estimator over committed residual histograms.
///
/// Estimates the coded size of a candidate symbol slice against the global
/// histogram of everything committed so far, in integer bit units. Zero
/// symbols cost nothing (the run symbols absorb them); other symbols cost a
/// quantized log2 of their likelihood in 24-bit fixed point.
#[derive(Debug)]
pub struct EntropyEstimator {
    hist: [u32; NUM_LITERALS],
    total: u32,
}

impl EntropyEstimator {
    /// Create an empty estimator.
    pub fn new() -> Self {
        Self {
            hist: [0; NUM_LITERALS],
            total: 0,
        }
    }

    /// Estimated bits to code `symbols` given the committed history.
    pub fn entropy_of(&self, symbols: &[u8]) -> u32 {
        let mut local = [0u32; NUM_LITERALS];
        for &sym in symbols {
            local[sym as usize] += 1;
        }

        let total = self.total + symbols.len() as u32;
        let mut codelens = [0u8; NUM_LITERALS];
        let mut bits = 0u32;

        for &sym in symbols {
            if sym == 0 {
                continue;
            }
            let idx = sym as usize;
            if codelens[idx] == 0 {
                let inst = self.hist[idx] + local[idx];
                let likelihood = ((inst as u64) << 24) / total as u64;
                codelens[idx] = quantized_codelen(likelihood as u32);
            }
            bits += codelens[idx] as u32;
        }
        bits
    }

    /// Commit a symbol slice into the global histogram.
    pub fn add(&mut self, symbols: &[u8]) {
        self.total += symbols.len() as u32;
        for &sym in symbols {
            self.hist[sym as usize] += 1;
        }
    }
}

impl Default for EntropyEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Quantized -log2 of a 24-bit fixed-point likelihood.
#[inline]
fn quantized_codelen(likelihood: u32) -> u8 {
    if likelihood == 0 {
        24
    } else if likelihood >= 0x80_0000 {
        1
    } else {
        let msb = 31 - likelihood.leading_zeros();
        if likelihood >= 0x8000 {
            (23 - msb) as u8
        } else {
            (24 - msb) as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[(u32, usize, u8)], levels: usize, resets: &[u32]) -> Vec<u8> {
        // Encode.
        let mut enc = PlaneEncoder::new(levels);
        for &(seq, chaos, value) in values {
            if resets.contains(&seq) {
                enc.end_run();
            }
            enc.push(seq, chaos, value);
        }
        enc.end_run();
        enc.finalize();

        let mut writer = WordWriter::new(0);
        enc.write_tables(&mut writer);
        for &(seq, _, _) in values {
            enc.write_pending(seq, &mut writer);
        }
        for _ in 0..6 {
            writer.write_word(0);
        }

        // Decode with the same chaos sequence.
        let mut reader = WordReader::new(&writer.finish()).unwrap();
        let mut dec = PlaneDecoder::read_tables(&mut reader, levels).unwrap();
        let mut out = Vec::new();
        for &(seq, chaos, _) in values {
            if resets.contains(&seq) {
                dec.check_reset().unwrap();
            }
            out.push(dec.next(chaos, &mut reader).unwrap());
        }
        out
    }

    #[test]
    fn test_literals_roundtrip() {
        let values: Vec<(u32, usize, u8)> = (0..200u32)
            .map(|i| (i, (i % 3) as usize, (i % 251) as u8 + 1))
            .collect();
        let decoded = roundtrip(&values, 3, &[]);
        let expected: Vec<u8> = values.iter().map(|&(_, _, v)| v).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_short_runs_roundtrip() {
        let mut values = Vec::new();
        let mut seq = 0u32;
        for block in 0..10 {
            for _ in 0..(block * 7 + 1) {
                values.push((seq, 0, 0u8));
                seq += 1;
            }
            values.push((seq, 0, 42));
            seq += 1;
        }
        let decoded = roundtrip(&values, 1, &[]);
        let expected: Vec<u8> = values.iter().map(|&(_, _, v)| v).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_long_run_uses_escape() {
        // A run longer than 127 zeros must survive the escape path.
        let mut values: Vec<(u32, usize, u8)> = (0..5000u32).map(|i| (i, 0, 0u8)).collect();
        values.push((5000, 0, 9));
        let decoded = roundtrip(&values, 1, &[]);
        assert!(decoded[..5000].iter().all(|&v| v == 0));
        assert_eq!(decoded[5000], 9);
    }

    #[test]
    fn test_trailing_run_flushed() {
        let values: Vec<(u32, usize, u8)> =
            vec![(0, 0, 7), (1, 0, 0), (2, 0, 0), (3, 0, 0)];
        let decoded = roundtrip(&values, 1, &[]);
        assert_eq!(decoded, vec![7, 0, 0, 0]);
    }

    #[test]
    fn test_runs_respect_resets() {
        // Zero runs flushed at seq 4; decoder verifies no run crosses it.
        let values: Vec<(u32, usize, u8)> = (0..8u32).map(|i| (i, 0, 0u8)).collect();
        let decoded = roundtrip(&values, 1, &[4]);
        assert_eq!(decoded, vec![0; 8]);
    }

    #[test]
    fn test_chaos_levels_independent() {
        // Alternating chaos levels still reconstruct in order.
        let values: Vec<(u32, usize, u8)> = (0..64u32)
            .map(|i| (i, (i % 2) as usize, if i % 5 == 0 { 0 } else { i as u8 }))
            .collect();
        let decoded = roundtrip(&values, 2, &[]);
        let expected: Vec<u8> = values.iter().map(|&(_, _, v)| v).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_estimator_prefers_seen_symbols() {
        let mut estimator = EntropyEstimator::new();
        estimator.add(&[5; 1000]);
        let familiar = estimator.entropy_of(&[5; 64]);
        let novel = estimator.entropy_of(&[9; 64]);
        assert!(familiar < novel);
    }

    #[test]
    fn test_estimator_zeros_are_free() {
        let estimator = EntropyEstimator::new();
        assert_eq!(estimator.entropy_of(&[0; 128]), 0);
    }

    #[test]
    fn test_quantized_codelen_monotone() {
        let mut last = 25;
        for shift in 0..24 {
            let len = quantized_codelen(1u32 << shift);
            assert!(len <= last, "codelen rose at likelihood 2^{}", shift);
            last = len;
        }
    }
}
