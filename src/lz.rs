//! 2D LZ exact-match layer.
//!
//! Finds rectangular regions that exactly duplicate earlier regions and
//! replaces them with references. Candidate sources come from a hash table
//! over 4x2-element tiles; each destination position walks its chain,
//! extends greedily right then down, and keeps the largest clean
//! rectangle. The accepted match list doubles as the replay engine: a grid
//! of match ids answers coverage queries for the residual coder and maps
//! covered cells back to their source.

use std::collections::HashMap;

use crate::bits::{WordReader, WordWriter};
use crate::error::{Error, Result};
use crate::huffman::{HuffmanDecoder, HuffmanEncoder};
use crate::mask::MaskWriter;

/// Tile width (elements) hashed for candidate lookup.
const TILE_W: usize = 4;
/// Tile height hashed for candidate lookup.
const TILE_H: usize = 2;

/// Escape symbol for coordinate and size tables.
const SYM_ESCAPE: usize = 255;
/// Coordinate/size table alphabet.
const SYM_COUNT: usize = 256;

/// Estimated bits to emit one match record.
const MATCH_COST_BITS: u64 = 60;
/// Estimated residual bits saved per covered element.
const SAVED_BITS_PER_CELL: u64 = 4;

/// One rectangular copy: the `w x h` rectangle at `(dx, dy)` repeats the
/// one at `(sx, sy)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzMatch {
    /// Source left column.
    pub sx: u32,
    /// Source top row.
    pub sy: u32,
    /// Destination left column.
    pub dx: u32,
    /// Destination top row.
    pub dy: u32,
    /// Rectangle width in elements.
    pub w: u32,
    /// Rectangle height in elements.
    pub h: u32,
}

/// Match list plus the coverage grid used for replay.
#[derive(Debug)]
pub struct LzMap {
    matches: Vec<LzMatch>,
    /// Match id + 1 per covered cell, 0 when uncovered.
    grid: Vec<u32>,
    width: usize,
}

impl LzMap {
    /// An empty map (no matches).
    pub fn empty(width: usize, height: usize) -> Self {
        Self {
            matches: Vec::new(),
            grid: vec![0; width * height],
            width,
        }
    }

    /// Number of accepted matches.
    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    /// True when a match covers this cell.
    #[inline]
    pub fn covered(&self, x: usize, y: usize) -> bool {
        self.grid[y * self.width + x] != 0
    }

    /// The covering match, if any.
    #[inline]
    pub fn match_at(&self, x: usize, y: usize) -> Option<&LzMatch> {
        let id = self.grid[y * self.width + x];
        (id != 0).then(|| &self.matches[id as usize - 1])
    }

    /// Source cell for a covered destination cell.
    #[inline]
    pub fn source_of(&self, x: usize, y: usize) -> (usize, usize) {
        let m = self.match_at(x, y).expect("cell is covered");
        (
            m.sx as usize + (x - m.dx as usize),
            m.sy as usize + (y - m.dy as usize),
        )
    }

    /// True when one single match encloses the whole `side x side` square
    /// at `(x0, y0)`.
    pub fn encloses_square(&self, x0: usize, y0: usize, side: usize) -> bool {
        match self.match_at(x0, y0) {
            Some(m) => {
                m.dx as usize <= x0
                    && m.dy as usize <= y0
                    && m.dx as usize + m.w as usize >= x0 + side
                    && m.dy as usize + m.h as usize >= y0 + side
            }
            None => false,
        }
    }

    /// Emit the match count, the three Huffman tables and the match
    /// records. Returns bits written.
    pub fn write(&self, writer: &mut WordWriter) -> u64 {
        let start = writer.bit_count();
        writer.write_word(self.matches.len() as u32);
        if self.matches.is_empty() {
            return writer.bit_count() - start;
        }

        let mut row_freqs = [0u32; SYM_COUNT];
        let mut col_freqs = [0u32; SYM_COUNT];
        let mut size_freqs = [0u32; SYM_COUNT];
        let mut prev_dy = 0u32;
        for m in &self.matches {
            row_freqs[value_sym(m.dy - prev_dy)] += 1;
            row_freqs[value_sym(m.dy - m.sy)] += 1;
            col_freqs[value_sym(m.dx)] += 1;
            col_freqs[value_sym(m.sx)] += 1;
            size_freqs[size_sym(m.w, m.h)] += 1;
            prev_dy = m.dy;
        }

        let rows = HuffmanEncoder::from_frequencies(&row_freqs);
        let cols = HuffmanEncoder::from_frequencies(&col_freqs);
        let sizes = HuffmanEncoder::from_frequencies(&size_freqs);
        rows.write_table(writer);
        cols.write_table(writer);
        sizes.write_table(writer);

        let mut prev_dy = 0u32;
        for m in &self.matches {
            write_value(writer, &rows, m.dy - prev_dy);
            write_value(writer, &cols, m.dx);
            write_value(writer, &rows, m.dy - m.sy);
            write_value(writer, &cols, m.sx);
            write_size(writer, &sizes, m.w, m.h);
            prev_dy = m.dy;
        }
        writer.bit_count() - start
    }

    /// Read a match list written by [`LzMap::write`] and rebuild the
    /// coverage grid, validating bounds and scan-order precedence.
    pub fn read(reader: &mut WordReader, width: usize, height: usize) -> Result<Self> {
        let count = reader.read_word()? as usize;
        if count > width * height {
            return Err(Error::CorruptBitstream("match count oversized".into()));
        }

        let mut map = Self::empty(width, height);
        if count == 0 {
            return Ok(map);
        }

        let rows = HuffmanDecoder::read_table(reader, SYM_COUNT)?;
        let cols = HuffmanDecoder::read_table(reader, SYM_COUNT)?;
        let sizes = HuffmanDecoder::read_table(reader, SYM_COUNT)?;

        let mut prev_dy = 0u32;
        for _ in 0..count {
            let dy = prev_dy + read_value(reader, &rows)?;
            let dx = read_value(reader, &cols)?;
            let sy_delta = read_value(reader, &rows)?;
            let sx = read_value(reader, &cols)?;
            let (w, h) = read_size(reader, &sizes)?;
            let sy = dy
                .checked_sub(sy_delta)
                .ok_or_else(|| Error::CorruptBitstream("match source below dest".into()))?;
            prev_dy = dy;

            let m = LzMatch {
                sx,
                sy,
                dx,
                dy,
                w,
                h,
            };
            map.push_validated(m, width, height)?;
        }
        Ok(map)
    }

    fn push_validated(&mut self, m: LzMatch, width: usize, height: usize) -> Result<()> {
        let err = |msg: &str| Error::CorruptBitstream(msg.into());
        if m.w == 0 || m.h == 0 {
            return Err(err("empty match"));
        }
        if (m.dx + m.w) as usize > width
            || (m.dy + m.h) as usize > height
            || (m.sx + m.w) as usize > width
            || (m.sy + m.h) as usize > height
        {
            return Err(err("match out of bounds"));
        }
        let precedes = m.sy < m.dy || (m.sy == m.dy && m.sx < m.dx);
        if !precedes {
            return Err(err("match source does not precede destination"));
        }
        if m.sy == m.dy && m.sx + m.w > m.dx {
            return Err(err("match self-overlaps in destination row"));
        }

        let id = self.matches.len() as u32 + 1;
        for y in m.dy as usize..(m.dy + m.h) as usize {
            for x in m.dx as usize..(m.dx + m.w) as usize {
                let cell = &mut self.grid[y * width + x];
                if *cell != 0 {
                    return Err(err("matches overlap"));
                }
                *cell = id;
            }
        }
        self.matches.push(m);
        Ok(())
    }
}

#[inline]
fn value_sym(value: u32) -> usize {
    (value as usize).min(SYM_ESCAPE)
}

#[inline]
fn size_sym(w: u32, h: u32) -> usize {
    if w <= 16 && h <= 16 && !(w == 16 && h == 16) {
        (((w - 1) << 4) | (h - 1)) as usize
    } else {
        SYM_ESCAPE
    }
}

fn write_value(writer: &mut WordWriter, encoder: &HuffmanEncoder, value: u32) {
    debug_assert!(value <= u16::MAX as u32);
    let sym = value_sym(value);
    encoder.write_symbol(sym, writer);
    if sym == SYM_ESCAPE {
        writer.write_bits(value, 16);
    }
}

fn read_value(reader: &mut WordReader, decoder: &HuffmanDecoder) -> Result<u32> {
    let sym = decoder.next_symbol(reader)? as u32;
    if sym as usize == SYM_ESCAPE {
        reader.read_bits(16)
    } else {
        Ok(sym)
    }
}

fn write_size(writer: &mut WordWriter, encoder: &HuffmanEncoder, w: u32, h: u32) {
    let sym = size_sym(w, h);
    encoder.write_symbol(sym, writer);
    if sym == SYM_ESCAPE {
        writer.write_bits(w, 16);
        writer.write_bits(h, 16);
    }
}

fn read_size(reader: &mut WordReader, decoder: &HuffmanDecoder) -> Result<(u32, u32)> {
    let sym = decoder.next_symbol(reader)? as u32;
    if sym as usize == SYM_ESCAPE {
        let w = reader.read_bits(16)?;
        let h = reader.read_bits(16)?;
        Ok((w, h))
    } else {
        Ok(((sym >> 4) + 1, (sym & 15) + 1))
    }
}

/// Scan `data` (a raster of `elem`-byte elements) for rectangular repeats.
///
/// Destinations whose whole seed tile is mask-covered are skipped: those
/// cells already cost nothing, so a reference would only add overhead.
pub fn find_matches(
    data: &[u8],
    elem: usize,
    width: usize,
    height: usize,
    max_chain: usize,
    min_area: usize,
    mask: Option<&MaskWriter>,
) -> LzMap {
    let mut map = LzMap::empty(width, height);
    if width < TILE_W || height < TILE_H {
        return map;
    }

    let seed_all_masked = |x: usize, y: usize| -> bool {
        match mask {
            Some(mask) => (0..TILE_H)
                .all(|dy| (0..TILE_W).all(|dx| mask.masked(x + dx, y + dy))),
            None => false,
        }
    };

    let mut table: HashMap<u64, Vec<u32>> = HashMap::new();

    for y in 0..=height - TILE_H {
        for x in 0..=width - TILE_W {
            let key = tile_key(data, elem, width, x, y);

            if map.grid[y * width + x] == 0 && !seed_all_masked(x, y) {
                if let Some(chain) = table.get(&key) {
                    if let Some(m) =
                        best_match_at(data, elem, width, height, &map, chain, max_chain, x, y)
                    {
                        let area = (m.w * m.h) as u64;
                        if area as usize >= min_area
                            && area * SAVED_BITS_PER_CELL > MATCH_COST_BITS
                        {
                            let id = map.matches.len() as u32 + 1;
                            for yy in m.dy as usize..(m.dy + m.h) as usize {
                                for xx in m.dx as usize..(m.dx + m.w) as usize {
                                    map.grid[yy * width + xx] = id;
                                }
                            }
                            map.matches.push(m);
                        }
                    }
                }
            }

            table.entry(key).or_default().push((y * width + x) as u32);
        }
    }
    map
}

/// Hash the 4x2 tile at `(x, y)`.
#[inline]
fn tile_key(data: &[u8], elem: usize, width: usize, x: usize, y: usize) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for row in 0..TILE_H {
        let start = ((y + row) * width + x) * elem;
        for &b in &data[start..start + TILE_W * elem] {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x1000_0000_01b3);
        }
    }
    hash
}

#[inline]
fn cells_equal(data: &[u8], elem: usize, width: usize, a: (usize, usize), b: (usize, usize), n: usize) -> bool {
    let ai = (a.1 * width + a.0) * elem;
    let bi = (b.1 * width + b.0) * elem;
    data[ai..ai + n * elem] == data[bi..bi + n * elem]
}

/// Walk the hash chain at one destination and return the largest clean
/// extension.
#[allow(clippy::too_many_arguments)]
fn best_match_at(
    data: &[u8],
    elem: usize,
    width: usize,
    height: usize,
    map: &LzMap,
    chain: &[u32],
    max_chain: usize,
    x: usize,
    y: usize,
) -> Option<LzMatch> {
    let mut best: Option<LzMatch> = None;
    let mut best_area = 0u32;

    for &pos in chain.iter().rev().take(max_chain) {
        let sx = pos as usize % width;
        let sy = pos as usize / width;

        // Verify the seed tile (hash collisions are possible).
        if !cells_equal(data, elem, width, (sx, sy), (x, y), TILE_W)
            || !cells_equal(data, elem, width, (sx, sy + 1), (x, y + 1), TILE_W)
        {
            continue;
        }

        // Extend right across both seed rows.
        let mut w = TILE_W;
        let mut limit = (width - x).min(width - sx);
        if sy == y {
            // Same row: the source must stay strictly left of the dest.
            limit = limit.min(x - sx);
            if limit < TILE_W {
                continue;
            }
        }
        while w < limit
            && data[((y) * width + x + w) * elem..(y * width + x + w + 1) * elem]
                == data[((sy) * width + sx + w) * elem..(sy * width + sx + w + 1) * elem]
            && data[((y + 1) * width + x + w) * elem..((y + 1) * width + x + w + 1) * elem]
                == data[((sy + 1) * width + sx + w) * elem..((sy + 1) * width + sx + w + 1) * elem]
        {
            w += 1;
        }

        // The destination rows must be clean of earlier matches.
        while w >= TILE_W {
            let clean = (x..x + w).all(|xx| map.grid[y * width + xx] == 0)
                && (x..x + w).all(|xx| map.grid[(y + 1) * width + xx] == 0);
            if clean {
                break;
            }
            w -= 1;
        }
        if w < TILE_W {
            continue;
        }

        // Extend down row by row.
        let mut h = TILE_H;
        while y + h < height
            && sy + h < height
            && cells_equal(data, elem, width, (sx, sy + h), (x, y + h), w)
            && (x..x + w).all(|xx| map.grid[(y + h) * width + xx] == 0)
        {
            h += 1;
        }

        let area = (w * h) as u32;
        if area > best_area {
            best_area = area;
            best = Some(LzMatch {
                sx: sx as u32,
                sy: sy as u32,
                dx: x as u32,
                dy: y as u32,
                w: w as u32,
                h: h as u32,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_square(rgba: &mut [u8], width: usize, x0: usize, y0: usize, side: usize, color: [u8; 4]) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                let idx = (y * width + x) * 4;
                rgba[idx..idx + 4].copy_from_slice(&color);
            }
        }
    }

    fn noisy(width: usize, height: usize) -> Vec<u8> {
        let mut state = 0x9e37_79b9u32;
        (0..width * height * 4)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 13) as u8
            })
            .collect()
    }

    #[test]
    fn test_repeated_square_found() {
        let width = 96;
        let height = 24;
        let mut rgba = noisy(width, height);
        solid_square(&mut rgba, width, 0, 0, 8, [255, 0, 255, 255]);
        solid_square(&mut rgba, width, 64, 0, 8, [255, 0, 255, 255]);

        let map = find_matches(&rgba, 4, width, height, 32, 64, None);
        assert_eq!(map.match_count(), 1);
        let m = map.match_at(64, 0).unwrap();
        assert_eq!((m.dx, m.dy), (64, 0));
        assert!(m.w >= 8 && m.h >= 8);
        assert!(map.encloses_square(64, 0, 8));
    }

    #[test]
    fn test_noise_has_no_matches() {
        let rgba = noisy(64, 64);
        let map = find_matches(&rgba, 4, 64, 64, 32, 64, None);
        assert_eq!(map.match_count(), 0);
    }

    #[test]
    fn test_source_precedes_destination() {
        let width = 64;
        let height = 64;
        let mut rgba = noisy(width, height);
        solid_square(&mut rgba, width, 8, 8, 12, [1, 2, 3, 255]);
        solid_square(&mut rgba, width, 40, 30, 12, [1, 2, 3, 255]);

        let map = find_matches(&rgba, 4, width, height, 32, 64, None);
        for m in &map.matches {
            assert!(m.sy < m.dy || (m.sy == m.dy && m.sx < m.dx));
        }
    }

    #[test]
    fn test_replay_sources_resolve() {
        let width = 48;
        let height = 32;
        let mut rgba = vec![0u8; width * height * 4];
        solid_square(&mut rgba, width, 0, 0, 16, [10, 20, 30, 255]);
        solid_square(&mut rgba, width, 24, 0, 16, [10, 20, 30, 255]);

        let map = find_matches(&rgba, 4, width, height, 32, 64, None);
        for y in 0..height {
            for x in 0..width {
                if map.covered(x, y) {
                    let (sx, sy) = map.source_of(x, y);
                    let s = (sy * width + sx) * 4;
                    let d = (y * width + x) * 4;
                    assert_eq!(rgba[s..s + 4], rgba[d..d + 4]);
                    // Source cell strictly precedes in scan order.
                    assert!(sy < y || (sy == y && sx < x));
                }
            }
        }
    }

    #[test]
    fn test_match_list_roundtrip() {
        let width = 96;
        let height = 48;
        let mut rgba = noisy(width, height);
        solid_square(&mut rgba, width, 0, 0, 10, [9, 9, 9, 255]);
        solid_square(&mut rgba, width, 48, 8, 10, [9, 9, 9, 255]);
        solid_square(&mut rgba, width, 16, 30, 10, [9, 9, 9, 255]);

        let map = find_matches(&rgba, 4, width, height, 32, 64, None);
        assert!(map.match_count() >= 1);

        let mut writer = WordWriter::new(0);
        map.write(&mut writer);
        for _ in 0..6 {
            writer.write_word(0);
        }
        let mut reader = WordReader::new(&writer.finish()).unwrap();
        let decoded = LzMap::read(&mut reader, width, height).unwrap();

        assert_eq!(decoded.matches, map.matches);
        assert_eq!(decoded.grid, map.grid);
    }

    #[test]
    fn test_empty_list_roundtrip() {
        let map = LzMap::empty(10, 10);
        let mut writer = WordWriter::new(0);
        map.write(&mut writer);
        for _ in 0..6 {
            writer.write_word(0);
        }
        let mut reader = WordReader::new(&writer.finish()).unwrap();
        let decoded = LzMap::read(&mut reader, 10, 10).unwrap();
        assert_eq!(decoded.match_count(), 0);
    }

    #[test]
    fn test_bad_match_rejected() {
        let mut map = LzMap::empty(16, 16);
        // Source does not precede destination.
        let bad = LzMatch {
            sx: 8,
            sy: 8,
            dx: 0,
            dy: 0,
            w: 4,
            h: 4,
        };
        assert!(map.push_validated(bad, 16, 16).is_err());

        // Out of bounds.
        let bad = LzMatch {
            sx: 0,
            sy: 0,
            dx: 14,
            dy: 0,
            w: 4,
            h: 2,
        };
        assert!(map.push_validated(bad, 16, 16).is_err());
    }

    #[test]
    fn test_byte_domain_matches() {
        // Palette mode runs the finder over single-byte elements.
        let width = 32;
        let height = 16;
        let mut bytes = vec![0u8; width * height];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i % 7) as u8;
        }
        let map = find_matches(&bytes, 1, width, height, 32, 16, None);
        assert!(map.match_count() >= 1);
        for m in &map.matches {
            for y in 0..m.h as usize {
                for x in 0..m.w as usize {
                    let s = (m.sy as usize + y) * width + m.sx as usize + x;
                    let d = (m.dy as usize + y) * width + m.dx as usize + x;
                    assert_eq!(bytes[s], bytes[d]);
                }
            }
        }
    }
}
