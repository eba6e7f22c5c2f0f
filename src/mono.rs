//! Recursive tiled-filter coder for single-plane rasters.
//!
//! The raster is cut into square tiles; each tile gets the spatial filter
//! that minimizes its residual magnitude, and the tile-filter map — itself
//! a small raster — is coded the same way. The recursion is held as an
//! explicit level stack; it terminates because every level shrinks the
//! raster by at least a factor of two, and a small enough map is written
//! as a flat Huffman stream. Level-0 residuals are entropy coded through
//! the chaos-indexed plane coder, with a per-row header bit that may reset
//! the contexts on tile boundaries.

use crate::bits::{WordReader, WordWriter};
use crate::entropy::{PlaneDecoder, PlaneEncoder};
use crate::error::{Error, Result};
use crate::filters::ChaosRing;
use crate::huffman::{HuffmanDecoder, HuffmanEncoder};

/// Tile filters: zero, left, above, average of both.
const MONO_FILTERS: usize = 4;
const MF_Z: u8 = 0;
const MF_A: u8 = 1;
const MF_B: u8 = 2;

/// Rasters at or below this cell count are written flat.
const BASE_AREA: usize = 64;
/// Level stack cap (the stream field is 4 bits).
const MAX_DEPTH: usize = 15;

/// Caller-provided coding parameters.
#[derive(Debug, Clone, Copy)]
pub struct MonoParams {
    /// Raster width in cells.
    pub width: usize,
    /// Raster height in cells.
    pub height: usize,
    /// Payload alphabet size (<= 256).
    pub num_syms: usize,
    /// Smallest tile side, as a power of two exponent.
    pub min_tile_bits: u32,
    /// Largest tile side, as a power of two exponent.
    pub max_tile_bits: u32,
    /// Coded-cell count at which eight chaos contexts engage.
    pub chaos_thresh: usize,
}

/// Predict a cell from its already-decoded neighbors.
#[inline]
fn mono_predict(filter: u8, raster: &[u8], x: usize, y: usize, width: usize) -> u8 {
    let idx = y * width + x;
    match filter {
        MF_Z => 0,
        MF_A => {
            if x > 0 {
                raster[idx - 1]
            } else if y > 0 {
                raster[idx - width]
            } else {
                0
            }
        }
        MF_B => {
            if y > 0 {
                raster[idx - width]
            } else if x > 0 {
                raster[idx - 1]
            } else {
                0
            }
        }
        // Average of left and above.
        _ => {
            let a = if x > 0 { raster[idx - 1] as u16 } else { 0 };
            let b = if y > 0 { raster[idx - width] as u16 } else { 0 };
            ((a + b) >> 1) as u8
        }
    }
}

/// Wrap-distance score of a residual byte.
#[inline]
fn residual_score(p: u8) -> u32 {
    crate::filters::chaos_score(p)
}

/// One planned recursion level: the raster it codes and its tile map.
#[derive(Debug)]
struct MonoLevel {
    width: usize,
    height: usize,
    tile_bits: u32,
    /// Best filter per tile; becomes the next level's raster.
    map: Vec<u8>,
    /// Per-cell residuals under the chosen tile filters.
    residuals: Vec<u8>,
}

/// Score the whole raster under one tile size, returning the tile map and
/// the summed residual score.
fn design_tiles(
    raster: &[u8],
    width: usize,
    height: usize,
    tile_bits: u32,
    skip: Option<&[bool]>,
) -> (Vec<u8>, u64) {
    let tile = 1usize << tile_bits;
    let tiles_x = width.div_ceil(tile);
    let tiles_y = height.div_ceil(tile);
    let mut map = vec![MF_Z; tiles_x * tiles_y];
    let mut total = 0u64;

    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let mut scores = [0u64; MONO_FILTERS];
            let mut used = false;
            for y in ty * tile..((ty + 1) * tile).min(height) {
                for x in tx * tile..((tx + 1) * tile).min(width) {
                    let idx = y * width + x;
                    if skip.is_some_and(|s| s[idx]) {
                        continue;
                    }
                    used = true;
                    let value = raster[idx];
                    for (f, score) in scores.iter_mut().enumerate() {
                        let pred = mono_predict(f as u8, raster, x, y, width);
                        *score += residual_score(value.wrapping_sub(pred)) as u64;
                    }
                }
            }
            if used {
                let best = scores
                    .iter()
                    .enumerate()
                    .min_by_key(|&(_, s)| s)
                    .map(|(f, _)| f)
                    .unwrap_or(0);
                map[ty * tiles_x + tx] = best as u8;
                total += scores[best];
            }
        }
    }
    (map, total)
}

/// Compute per-cell residuals under a tile map.
fn apply_tiles(
    raster: &[u8],
    width: usize,
    height: usize,
    tile_bits: u32,
    map: &[u8],
    skip: Option<&[bool]>,
) -> Vec<u8> {
    let tile = 1usize << tile_bits;
    let tiles_x = width.div_ceil(tile);
    let mut residuals = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if skip.is_some_and(|s| s[idx]) {
                continue;
            }
            let filter = map[(y >> tile_bits) * tiles_x + (x >> tile_bits)];
            let pred = mono_predict(filter, raster, x, y, width);
            residuals[idx] = raster[idx].wrapping_sub(pred);
        }
    }
    residuals
}

/// Monochrome raster encoder.
#[derive(Debug)]
pub struct MonoWriter {
    params: MonoParams,
    levels: Vec<MonoLevel>,
    base: Vec<u8>,
    base_encoder: HuffmanEncoder,
    /// Skip flags for the payload raster (palette mode coverage).
    skip: Option<Vec<bool>>,
    /// Level-0 residual coder; `None` when the payload itself is flat.
    plane: Option<PlaneEncoder>,
    /// Flat payload symbol stream per cell, when depth == 0.
    flat_codes: Vec<FlatSym>,
    flat_cursor: usize,
}

/// Recorded flat symbol with its cell index.
#[derive(Debug, Clone, Copy)]
struct FlatSym {
    cell: u32,
    sym: u8,
}

impl MonoWriter {
    /// Plan the full encode for `raster`; cells flagged in `skip` emit
    /// nothing (the caller covers them some other way).
    pub fn new(params: MonoParams, raster: &[u8], skip: Option<&[bool]>) -> Self {
        debug_assert_eq!(raster.len(), params.width * params.height);
        debug_assert!(params.num_syms <= 256);

        let mut levels: Vec<MonoLevel> = Vec::new();
        let mut cur: Vec<u8> = raster.to_vec();
        let mut cur_w = params.width;
        let mut cur_h = params.height;

        while cur_w * cur_h > BASE_AREA && levels.len() < MAX_DEPTH {
            let level_skip = if levels.is_empty() { skip } else { None };

            let mut best: Option<(u32, Vec<u8>, u64)> = None;
            for tb in params.min_tile_bits..=params.max_tile_bits {
                let (map, score) = design_tiles(&cur, cur_w, cur_h, tb, level_skip);
                if best.as_ref().is_none_or(|&(_, _, s)| score < s) {
                    best = Some((tb, map, score));
                }
            }
            let (tile_bits, map, _) = best.expect("tile range is non-empty");

            let residuals = apply_tiles(&cur, cur_w, cur_h, tile_bits, &map, level_skip);
            let tile = 1usize << tile_bits;
            let next_w = cur_w.div_ceil(tile);
            let next_h = cur_h.div_ceil(tile);

            levels.push(MonoLevel {
                width: cur_w,
                height: cur_h,
                tile_bits,
                map: map.clone(),
                residuals,
            });

            cur = map;
            cur_w = next_w;
            cur_h = next_h;
        }

        let base = cur;
        let mut writer = Self {
            params,
            levels,
            base,
            base_encoder: HuffmanEncoder::from_frequencies(&[]),
            skip: skip.map(|s| s.to_vec()),
            plane: None,
            flat_codes: Vec::new(),
            flat_cursor: 0,
        };
        writer.plan_streams();
        writer
    }

    fn base_alphabet(&self) -> usize {
        if self.levels.is_empty() {
            self.params.num_syms
        } else {
            MONO_FILTERS
        }
    }

    /// Count payload cells that will carry a symbol.
    fn coded_cells(&self) -> usize {
        let total = self.params.width * self.params.height;
        match &self.skip {
            Some(skip) => total - skip.iter().filter(|&&s| s).count(),
            None => total,
        }
    }

    fn plan_streams(&mut self) {
        // Base histogram: flat stream over the deepest raster.
        let mut freqs = vec![0u32; self.base_alphabet()];
        if self.levels.is_empty() {
            // The payload itself is the base; skipped cells emit nothing.
            for (idx, &sym) in self.base.iter().enumerate() {
                if self.skip.as_ref().is_some_and(|s| s[idx]) {
                    continue;
                }
                freqs[sym as usize] += 1;
                self.flat_codes.push(FlatSym {
                    cell: idx as u32,
                    sym,
                });
            }
        } else {
            for &sym in &self.base {
                freqs[sym as usize] += 1;
            }
        }
        self.base_encoder = HuffmanEncoder::from_frequencies(&freqs);

        // Level-0 residual stream with chaos contexts and row resets.
        if let Some(level) = self.levels.first() {
            let chaos_levels = if self.coded_cells() >= self.params.chaos_thresh {
                crate::filters::CHAOS_LEVELS_MAX
            } else {
                1
            };
            let mut plane = PlaneEncoder::new(chaos_levels);
            let mut ring = ChaosRing::new(level.width, 1, chaos_levels);
            let tile = 1usize << level.tile_bits;

            for y in 0..level.height {
                if y > 0 && y % tile == 0 {
                    plane.end_run();
                    ring.reset();
                }
                for x in 0..level.width {
                    let idx = y * level.width + x;
                    if self.skip.as_ref().is_some_and(|s| s[idx]) {
                        ring.zero(x);
                        continue;
                    }
                    let residual = level.residuals[idx];
                    let chaos = ring.chaos(x, 0);
                    plane.push(idx as u32, chaos, residual);
                    ring.store(x, 0, residual);
                }
            }
            plane.end_run();
            plane.finalize();
            self.plane = Some(plane);
        }
    }

    /// Write the level stack, base raster and entropy tables. Returns bits
    /// written.
    pub fn write_tables(&mut self, writer: &mut WordWriter) -> u64 {
        let start = writer.bit_count();

        writer.write_bits(self.levels.len() as u32, 4);
        for level in &self.levels {
            writer.write_bits(level.tile_bits, 3);
        }

        if self.levels.is_empty() {
            // A fully skipped payload leaves the flat table empty.
            if self.base_encoder.is_empty() {
                writer.write_bit(0);
            } else {
                writer.write_bit(1);
                self.base_encoder.write_table(writer);
            }
        } else {
            self.base_encoder.write_table(writer);
            for &sym in &self.base {
                self.base_encoder.write_symbol(sym as usize, writer);
            }
        }

        // Interior map levels, deepest first, each through a one-context
        // plane coder.
        for k in (1..self.levels.len()).rev() {
            let level = &self.levels[k];
            let mut plane = PlaneEncoder::new(1);
            for (idx, &residual) in level.residuals.iter().enumerate() {
                plane.push(idx as u32, 0, residual);
            }
            plane.end_run();
            plane.finalize();
            plane.write_tables(writer);
            for idx in 0..level.residuals.len() {
                plane.write_pending(idx as u32, writer);
            }
        }

        if let Some(plane) = &self.plane {
            let chaos_levels = if self.coded_cells() >= self.params.chaos_thresh {
                crate::filters::CHAOS_LEVELS_MAX
            } else {
                1
            };
            writer.write_bits(chaos_levels as u32 - 1, 3);
            plane.write_tables(writer);
        }

        writer.bit_count() - start
    }

    /// Write one payload row: the context-reset header bit followed by the
    /// row's coded symbols.
    pub fn write_row(&mut self, y: usize, writer: &mut WordWriter) {
        if let Some(level) = self.levels.first() {
            let tile = 1usize << level.tile_bits;
            let reset = y > 0 && y % tile == 0;
            writer.write_bit(reset as u32);

            let width = level.width;
            let plane = self.plane.as_mut().expect("level 0 has a plane coder");
            for x in 0..width {
                plane.write_pending((y * width + x) as u32, writer);
            }
        } else {
            // Flat payload: no header, just the row's literal symbols.
            let width = self.params.width;
            while self.flat_cursor < self.flat_codes.len() {
                let rec = self.flat_codes[self.flat_cursor];
                if (rec.cell as usize) / width != y {
                    break;
                }
                self.base_encoder.write_symbol(rec.sym as usize, writer);
                self.flat_cursor += 1;
            }
        }
    }
}

/// Monochrome raster decoder.
#[derive(Debug)]
pub struct MonoReader {
    params: MonoParams,
    /// Tile size per level.
    tile_bits: Vec<u32>,
    /// Level-1 raster: the payload's tile-filter map (empty when flat).
    map: Vec<u8>,
    map_width: usize,
    /// The payload is a flat symbol stream (no level stack).
    flat_mode: bool,
    /// Flat payload decoder; absent when every payload cell is skipped.
    flat: Option<HuffmanDecoder>,
    /// Level-0 residual decoder and chaos ring.
    plane: Option<PlaneDecoder>,
    ring: ChaosRing,
}

impl MonoReader {
    /// Read the level stack, reconstruct every map level, and prepare the
    /// payload decoders.
    pub fn read_tables(params: MonoParams, reader: &mut WordReader) -> Result<Self> {
        let depth = reader.read_bits(4)? as usize;

        let mut tile_bits = Vec::with_capacity(depth);
        let mut dims = Vec::with_capacity(depth + 1);
        dims.push((params.width, params.height));
        for _ in 0..depth {
            let tb = reader.read_bits(3)?;
            if tb == 0 {
                return Err(Error::CorruptBitstream("zero tile size".into()));
            }
            let (w, h) = *dims.last().expect("dims is non-empty");
            let tile = 1usize << tb;
            dims.push((w.div_ceil(tile), h.div_ceil(tile)));
            tile_bits.push(tb);
        }

        if depth == 0 {
            let flat = if reader.read_bit()? == 1 {
                Some(HuffmanDecoder::read_table(reader, params.num_syms)?)
            } else {
                None
            };
            return Ok(Self {
                params,
                tile_bits,
                map: Vec::new(),
                map_width: 0,
                flat_mode: true,
                flat,
                plane: None,
                ring: ChaosRing::new(params.width, 1, 1),
            });
        }
        let base_decoder = HuffmanDecoder::read_table(reader, MONO_FILTERS)?;

        // Base raster is the deepest map level, stored flat.
        let (base_w, base_h) = dims[depth];
        let mut raster = vec![0u8; base_w * base_h];
        for cell in raster.iter_mut() {
            let sym = base_decoder.next_symbol(reader)?;
            if sym as usize >= MONO_FILTERS {
                return Err(Error::CorruptBitstream("tile filter out of range".into()));
            }
            *cell = sym as u8;
        }

        // Rebuild interior map levels from deepest to level 1.
        for k in (1..depth).rev() {
            let (w, h) = dims[k];
            let (map_w, _) = dims[k + 1];
            let mut plane = PlaneDecoder::read_tables(reader, 1)?;
            let mut next = vec![0u8; w * h];
            for y in 0..h {
                for x in 0..w {
                    let residual = plane.next(0, reader)?;
                    let filter = raster[(y >> tile_bits[k]) * map_w + (x >> tile_bits[k])];
                    let pred = mono_predict(filter, &next, x, y, w);
                    let value = pred.wrapping_add(residual);
                    if value as usize >= MONO_FILTERS {
                        return Err(Error::CorruptBitstream("tile filter out of range".into()));
                    }
                    next[y * w + x] = value;
                }
            }
            raster = next;
        }

        let chaos_levels = reader.read_bits(3)? as usize + 1;
        if chaos_levels != 1 && chaos_levels != crate::filters::CHAOS_LEVELS_MAX {
            return Err(Error::CorruptBitstream("bad chaos level count".into()));
        }
        let plane = PlaneDecoder::read_tables(reader, chaos_levels)?;

        let (map_w, _) = dims[1];
        Ok(Self {
            params,
            tile_bits,
            map: raster,
            map_width: map_w,
            flat_mode: false,
            flat: None,
            plane: Some(plane),
            ring: ChaosRing::new(params.width, 1, chaos_levels),
        })
    }

    /// Read one row's header bit, resetting contexts when it is set.
    pub fn read_row_header(&mut self, _y: usize, reader: &mut WordReader) -> Result<()> {
        if self.flat_mode {
            return Ok(());
        }
        if reader.read_bit()? == 1 {
            self.plane
                .as_ref()
                .expect("tiled payload has a plane decoder")
                .check_reset()?;
            self.ring.reset();
        }
        Ok(())
    }

    /// Decode the payload cell at `(x, y)` into `dst`, predicting from the
    /// caller's raster (which also holds the cells the caller filled in
    /// some other way).
    pub fn read(
        &mut self,
        x: usize,
        y: usize,
        dst: &mut [u8],
        reader: &mut WordReader,
    ) -> Result<u8> {
        let width = self.params.width;
        let value = if self.flat_mode {
            let flat = self
                .flat
                .as_ref()
                .ok_or_else(|| Error::CorruptBitstream("symbol from absent table".into()))?;
            flat.next_symbol(reader)? as u8
        } else {
            let chaos = self.ring.chaos(x, 0);
            let residual = self
                .plane
                .as_mut()
                .expect("tiled payload has a plane decoder")
                .next(chaos, reader)?;
            let filter = self.map[(y >> self.tile_bits[0]) * self.map_width + (x >> self.tile_bits[0])];
            let pred = mono_predict(filter, dst, x, y, width);
            self.ring.store(x, 0, residual);
            pred.wrapping_add(residual)
        };
        if value as usize >= self.params.num_syms {
            return Err(Error::CorruptBitstream("payload symbol out of range".into()));
        }
        dst[y * width + x] = value;
        Ok(value)
    }

    /// Record a zero context for a skipped cell.
    pub fn zero(&mut self, x: usize) {
        self.ring.zero(x);
    }
}
