//! Dominant-color mask layer.
//!
//! Finds the single most common exact value in the raster (typically fully
//! transparent black) and, when its share clears the acceptance threshold,
//! records its footprint as a bitmap. The bitmap travels as per-row
//! run-length symbols — one parity bit per row names the leading run's bit
//! value — and the symbol stream is compressed by the monochrome coder.
//! Downstream layers skip every masked pixel.

use std::collections::HashMap;

use crate::bits::{WordReader, WordWriter};
use crate::error::{Error, Result};
use crate::mono::{MonoParams, MonoReader, MonoWriter};

/// Run lengths below this are single stream bytes; longer runs escape.
const RLE_ESCAPE: u8 = 255;

/// Mask detection and encoding.
#[derive(Debug)]
pub struct MaskWriter {
    color: u32,
    color_bits: u32,
    enabled: bool,
    bitmap: Vec<u32>,
    stride: usize,
    width: usize,
    height: usize,
}

impl MaskWriter {
    /// Detect the dominant RGBA color. The acceptance threshold is
    /// `min_percent` of all pixels, halved when the candidate is fully
    /// transparent.
    pub fn from_rgba(rgba: &[u8], width: usize, height: usize, min_percent: u32) -> Self {
        let mut counts: HashMap<u32, (u32, usize)> = HashMap::new();
        for (i, px) in rgba.chunks_exact(4).enumerate() {
            let color = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
            let entry = counts.entry(color).or_insert((0, i));
            entry.0 += 1;
        }

        let (color, count) = dominant(&counts);
        let threshold = if color & 0xFF00_0000 == 0 {
            min_percent / 2
        } else {
            min_percent
        };
        let total = (width * height) as u64;
        let enabled = count as u64 * 100 >= total * threshold as u64;

        let mut mask = Self::empty(color, 32, width, height, enabled);
        if enabled {
            for (i, px) in rgba.chunks_exact(4).enumerate() {
                let value = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                if value == color {
                    mask.set(i % width, i / width);
                }
            }
        }
        mask
    }

    /// Detect the dominant byte of a packed single-plane raster
    /// (palette mode).
    pub fn from_bytes(bytes: &[u8], width: usize, height: usize, min_percent: u32) -> Self {
        let mut counts = [(0u32, usize::MAX); 256];
        for (i, &b) in bytes.iter().enumerate() {
            if counts[b as usize].1 == usize::MAX {
                counts[b as usize].1 = i;
            }
            counts[b as usize].0 += 1;
        }

        let mut best = 0usize;
        for v in 0..256 {
            let better = counts[v].0 > counts[best].0
                || (counts[v].0 == counts[best].0 && counts[v].1 < counts[best].1);
            if better {
                best = v;
            }
        }
        let count = counts[best].0;
        let total = (width * height) as u64;
        let enabled = count as u64 * 100 >= total * min_percent as u64;

        let mut mask = Self::empty(best as u32, 8, width, height, enabled);
        if enabled {
            for (i, &b) in bytes.iter().enumerate() {
                if b as u32 == mask.color {
                    mask.set(i % width, i / width);
                }
            }
        }
        mask
    }

    fn empty(color: u32, color_bits: u32, width: usize, height: usize, enabled: bool) -> Self {
        let stride = width.div_ceil(32);
        Self {
            color,
            color_bits,
            enabled,
            bitmap: vec![0; stride * height],
            stride,
            width,
            height,
        }
    }

    #[inline]
    fn set(&mut self, x: usize, y: usize) {
        self.bitmap[(x >> 5) + y * self.stride] |= 1 << (x & 31);
    }

    /// Whether a qualifying dominant color was found.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The mask color (an RGBA word, or a packed byte in palette mode).
    #[inline]
    pub fn color(&self) -> u32 {
        self.color
    }

    /// True when the pixel needs real encoding (not mask-covered).
    #[inline]
    pub fn has_rgb(&self, x: usize, y: usize) -> bool {
        !self.masked(x, y)
    }

    /// True when the pixel equals the mask color.
    #[inline]
    pub fn masked(&self, x: usize, y: usize) -> bool {
        if !self.enabled {
            return false;
        }
        (self.bitmap[(x >> 5) + y * self.stride] >> (x & 31)) & 1 != 0
    }

    /// Serialize the mask color, row parity bits and the mono-compressed
    /// run-length stream. Returns bits written.
    pub fn write(&self, writer: &mut WordWriter, chaos_thresh: usize) -> u64 {
        debug_assert!(self.enabled);
        let start = writer.bit_count();

        writer.write_bits(self.color, self.color_bits);
        for y in 0..self.height {
            writer.write_bit(self.masked(0, y) as u32);
        }

        let stream = self.rle_stream();
        writer.write_word(stream.len() as u32);

        let params = MonoParams {
            width: stream.len(),
            height: 1,
            num_syms: 256,
            min_tile_bits: 1,
            max_tile_bits: 4,
            chaos_thresh,
        };
        let mut mono = MonoWriter::new(params, &stream, None);
        mono.write_tables(writer);
        mono.write_row(0, writer);

        writer.bit_count() - start
    }

    /// Horizontal RLE of the bitmap: alternating run lengths per row,
    /// starting from the value named by that row's parity bit.
    fn rle_stream(&self) -> Vec<u8> {
        let mut stream = Vec::new();
        for y in 0..self.height {
            let mut run_value = self.masked(0, y);
            let mut run_len = 0usize;
            for x in 0..self.width {
                if self.masked(x, y) == run_value {
                    run_len += 1;
                } else {
                    push_run(&mut stream, run_len);
                    run_value = !run_value;
                    run_len = 1;
                }
            }
            push_run(&mut stream, run_len);
        }
        stream
    }
}

/// Emit one run length: direct byte, or escape plus 7-bit continuation
/// groups of the excess.
fn push_run(stream: &mut Vec<u8>, len: usize) {
    if len < RLE_ESCAPE as usize {
        stream.push(len as u8);
        return;
    }
    stream.push(RLE_ESCAPE);
    let mut rest = len - RLE_ESCAPE as usize;
    loop {
        let group = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest > 0 {
            stream.push(group | 0x80);
        } else {
            stream.push(group);
            return;
        }
    }
}

/// Decoded mask state.
#[derive(Debug)]
pub struct MaskReader {
    color: u32,
    bitmap: Vec<u32>,
    stride: usize,
    enabled: bool,
}

impl MaskReader {
    /// A disabled mask: every pixel needs real encoding.
    pub fn disabled(width: usize, height: usize) -> Self {
        let stride = width.div_ceil(32);
        Self {
            color: 0,
            bitmap: vec![0; stride * height],
            stride,
            enabled: false,
        }
    }

    /// Read a mask block written by [`MaskWriter::write`].
    pub fn read(
        reader: &mut WordReader,
        width: usize,
        height: usize,
        color_bits: u32,
    ) -> Result<Self> {
        let color = reader.read_bits(color_bits)?;

        let mut parity = Vec::with_capacity(height);
        for _ in 0..height {
            parity.push(reader.read_bit()? == 1);
        }

        let len = reader.read_word()? as usize;
        // Worst case is one alternating run per pixel.
        if len > width * height + height {
            return Err(Error::CorruptBitstream("RLE stream oversized".into()));
        }

        // Chaos-level selection travels inside the mono stream itself.
        let params = MonoParams {
            width: len,
            height: 1,
            num_syms: 256,
            min_tile_bits: 1,
            max_tile_bits: 4,
            chaos_thresh: 0,
        };
        let mut stream = vec![0u8; len];
        let mut mono = MonoReader::read_tables(params, reader)?;
        mono.read_row_header(0, reader)?;
        for x in 0..len {
            mono.read(x, 0, &mut stream, reader)?;
        }

        let mut mask = Self {
            color,
            bitmap: vec![0; width.div_ceil(32) * height],
            stride: width.div_ceil(32),
            enabled: true,
        };
        mask.expand_rle(&stream, &parity, width, height)?;
        Ok(mask)
    }

    fn expand_rle(
        &mut self,
        stream: &[u8],
        parity: &[bool],
        width: usize,
        height: usize,
    ) -> Result<()> {
        let mut pos = 0usize;
        for (y, &start_masked) in parity.iter().enumerate().take(height) {
            let mut value = start_masked;
            let mut x = 0usize;
            while x < width {
                let run = next_run(stream, &mut pos)?;
                if run == 0 || x + run > width {
                    return Err(Error::CorruptBitstream("bad mask run length".into()));
                }
                if value {
                    for xx in x..x + run {
                        self.bitmap[(xx >> 5) + y * self.stride] |= 1 << (xx & 31);
                    }
                }
                x += run;
                value = !value;
            }
        }
        if pos != stream.len() {
            return Err(Error::CorruptBitstream("trailing mask run data".into()));
        }
        Ok(())
    }

    /// The decoded mask color.
    #[inline]
    pub fn color(&self) -> u32 {
        self.color
    }

    /// True when the pixel needs real decoding (not mask-covered).
    #[inline]
    pub fn has_rgb(&self, x: usize, y: usize) -> bool {
        !self.masked(x, y)
    }

    /// True when the pixel carries the mask color.
    #[inline]
    pub fn masked(&self, x: usize, y: usize) -> bool {
        if !self.enabled {
            return false;
        }
        (self.bitmap[(x >> 5) + y * self.stride] >> (x & 31)) & 1 != 0
    }
}

/// Read one run length from the RLE stream.
fn next_run(stream: &[u8], pos: &mut usize) -> Result<usize> {
    let err = || Error::CorruptBitstream("truncated mask run".into());
    let first = *stream.get(*pos).ok_or_else(err)?;
    *pos += 1;
    if first < RLE_ESCAPE {
        return Ok(first as usize);
    }
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let group = *stream.get(*pos).ok_or_else(err)?;
        *pos += 1;
        if shift > 28 {
            return Err(Error::CorruptBitstream("mask run overflow".into()));
        }
        value |= ((group & 0x7F) as usize) << shift;
        shift += 7;
        if group & 0x80 == 0 {
            return Ok(RLE_ESCAPE as usize + value);
        }
    }
}

fn dominant(counts: &HashMap<u32, (u32, usize)>) -> (u32, u32) {
    let mut best_color = 0u32;
    let mut best = (0u32, usize::MAX);
    for (&color, &(count, first)) in counts {
        if count > best.0 || (count == best.0 && first < best.1) {
            best = (count, first);
            best_color = color;
        }
    }
    (best_color, best.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sprite(width: usize, height: usize) -> Vec<u8> {
        // Transparent background with an opaque diamond in the middle.
        let mut rgba = vec![0u8; width * height * 4];
        let cx = width as i32 / 2;
        let cy = height as i32 / 2;
        for y in 0..height {
            for x in 0..width {
                if (x as i32 - cx).abs() + (y as i32 - cy).abs() < cx.min(cy) {
                    let idx = (y * width + x) * 4;
                    rgba[idx..idx + 4].copy_from_slice(&[200, 40, 40, 255]);
                }
            }
        }
        rgba
    }

    fn roundtrip(mask: &MaskWriter, width: usize, height: usize) -> MaskReader {
        let mut writer = WordWriter::new(0);
        mask.write(&mut writer, 512);
        for _ in 0..6 {
            writer.write_word(0);
        }
        let mut reader = WordReader::new(&writer.finish()).unwrap();
        MaskReader::read(&mut reader, width, height, 32).unwrap()
    }

    #[test]
    fn test_detects_transparent_background() {
        let rgba = sprite(32, 32);
        let mask = MaskWriter::from_rgba(&rgba, 32, 32, 40);
        assert!(mask.enabled());
        assert_eq!(mask.color(), 0);
        assert!(mask.masked(0, 0));
        assert!(!mask.masked(16, 16));
    }

    #[test]
    fn test_disabled_below_threshold() {
        // Four equal quadrants: no color reaches 40%.
        let mut rgba = Vec::new();
        for y in 0..16 {
            for x in 0..16 {
                let c = match (x < 8, y < 8) {
                    (true, true) => [1, 0, 0, 255],
                    (false, true) => [0, 2, 0, 255],
                    (true, false) => [0, 0, 3, 255],
                    (false, false) => [4, 4, 4, 255],
                };
                rgba.extend_from_slice(&c);
            }
        }
        let mask = MaskWriter::from_rgba(&rgba, 16, 16, 40);
        assert!(!mask.enabled());
        assert!(mask.has_rgb(0, 0));
    }

    #[test]
    fn test_ties_break_first_seen() {
        // Two colors at exactly 50% each; the first-seen one wins.
        let mut rgba = Vec::new();
        for i in 0..64 {
            if i % 2 == 0 {
                rgba.extend_from_slice(&[9, 9, 9, 255]);
            } else {
                rgba.extend_from_slice(&[1, 1, 1, 255]);
            }
        }
        let mask = MaskWriter::from_rgba(&rgba, 8, 8, 40);
        assert!(mask.enabled());
        assert_eq!(mask.color(), u32::from_le_bytes([9, 9, 9, 255]));
    }

    #[test]
    fn test_bitmap_roundtrip() {
        let width = 48;
        let height = 40;
        let rgba = sprite(width, height);
        let mask = MaskWriter::from_rgba(&rgba, width, height, 40);
        assert!(mask.enabled());

        let decoded = roundtrip(&mask, width, height);
        assert_eq!(decoded.color(), mask.color());
        for y in 0..height {
            for x in 0..width {
                assert_eq!(decoded.masked(x, y), mask.masked(x, y), "({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_full_coverage_roundtrip() {
        let width = 64;
        let height = 64;
        let rgba = vec![0u8; width * height * 4];
        let mask = MaskWriter::from_rgba(&rgba, width, height, 40);
        assert!(mask.enabled());

        let decoded = roundtrip(&mask, width, height);
        for y in 0..height {
            for x in 0..width {
                assert!(decoded.masked(x, y));
            }
        }
    }

    #[test]
    fn test_byte_domain_mask() {
        let bytes: Vec<u8> = (0..256).map(|i| if i % 4 == 0 { 7 } else { i as u8 }).collect();
        let mask = MaskWriter::from_bytes(&bytes, 16, 16, 20);
        assert!(mask.enabled());
        assert_eq!(mask.color(), 7);
        assert!(mask.masked(0, 0));
        assert!(!mask.masked(1, 0));
    }

    #[test]
    fn test_long_run_escape() {
        let mut stream = Vec::new();
        push_run(&mut stream, 300);
        push_run(&mut stream, 254);
        push_run(&mut stream, 255);
        let mut pos = 0;
        assert_eq!(next_run(&stream, &mut pos).unwrap(), 300);
        assert_eq!(next_run(&stream, &mut pos).unwrap(), 254);
        assert_eq!(next_run(&stream, &mut pos).unwrap(), 255);
        assert_eq!(pos, stream.len());
    }
}
