//! Context-model residual layer.
//!
//! Everything the mask and LZ layers leave behind goes through here. Each
//! 8x8 zone picks the spatial/color filter pair that minimizes its coded
//! size; the per-zone symbols travel through two small Huffman tables
//! interleaved into the residual stream at zone corners. Residuals are
//! entropy coded per plane through chaos-indexed tables, and covered
//! pixels contribute zero residuals to the chaos state so both sides stay
//! in lockstep.

use crate::bits::{WordReader, WordWriter};
use crate::entropy::{EntropyEstimator, PlaneDecoder, PlaneEncoder};
use crate::error::{Error, Result};
use crate::filters::{
    default_spatial_filters, rgb_to_yuv, yuv_to_rgb, ChaosRing, SpatialFilter, CF_COUNT,
    CHAOS_LEVELS_MAX, COLOR_PLANES, FILTER_TAPS, SF_COUNT, TAPPED_COUNT,
};
use crate::lz::LzMap;
use crate::mask::{MaskReader, MaskWriter};

/// Filter zone side in pixels.
pub const FILTER_ZONE_SIZE: usize = 8;

/// Zone sentinel: no residuals will be emitted in this zone.
const UNUSED_FILTER: u16 = 0xFFFF;
/// Decoder-side sentinel for a zone whose symbols have not arrived yet.
const PENDING_FILTER: u16 = 0xFFFE;

/// A zone's filter choice packed as `sf << 8 | cf`.
#[inline]
fn pack_filter(sf: usize, cf: usize) -> u16 {
    ((sf as u16) << 8) | cf as u16
}

/// Zone is skipped when one LZ match encloses it or every pixel carries
/// the mask color.
fn zone_unused(
    masked: &impl Fn(usize, usize) -> bool,
    lz: &LzMap,
    zx: usize,
    zy: usize,
) -> bool {
    let x0 = zx * FILTER_ZONE_SIZE;
    let y0 = zy * FILTER_ZONE_SIZE;
    if lz.encloses_square(x0, y0, FILTER_ZONE_SIZE) {
        return true;
    }
    for y in y0..y0 + FILTER_ZONE_SIZE {
        for x in x0..x0 + FILTER_ZONE_SIZE {
            if !masked(x, y) {
                return false;
            }
        }
    }
    true
}

/// Alpha-plane residual: left-delta on the interior, complement at the
/// left edge.
#[inline]
fn alpha_residual(rgba: &[u8], x: usize, y: usize, width: usize) -> u8 {
    let idx = (y * width + x) * 4;
    let a = rgba[idx + 3];
    if x > 0 {
        a.wrapping_sub(rgba[idx - 1])
    } else {
        255u8.wrapping_sub(a)
    }
}

/// Per-channel absolute error of a prediction.
#[inline]
fn prediction_error(pixel: &[u8], pred: [u8; 3]) -> u64 {
    (0..3)
        .map(|c| (pixel[c] as i32 - pred[c] as i32).unsigned_abs() as u64)
        .sum()
}

/// Wrap-distance score of a filtered YUV triple.
#[inline]
fn yuv_score(yuv: [u8; 3]) -> u64 {
    yuv.iter()
        .map(|&v| crate::filters::chaos_score(v) as u64)
        .sum()
}

/// CM encoder. Borrows the image, mask and LZ layers for one encode.
pub struct CmWriter<'a> {
    rgba: &'a [u8],
    width: usize,
    height: usize,
    zones_x: usize,
    zones_y: usize,
    mask: &'a MaskWriter,
    lz: &'a LzMap,
    matrix: Vec<u16>,
    filters: [SpatialFilter; SF_COUNT],
    substitutions: Vec<(u8, u8)>,
    sf_encoder: crate::huffman::HuffmanEncoder,
    cf_encoder: crate::huffman::HuffmanEncoder,
    planes: Vec<PlaneEncoder>,
    chaos_levels: usize,
}

impl<'a> CmWriter<'a> {
    /// Run zone masking, filter design, the joint filter decision and the
    /// chaos statistics pass.
    pub fn new(
        rgba: &'a [u8],
        width: usize,
        height: usize,
        mask: &'a MaskWriter,
        lz: &'a LzMap,
        compress_level: u8,
        filter_select_fuzz: usize,
        chaos_thresh: usize,
    ) -> Result<Self> {
        if width < FILTER_ZONE_SIZE
            || height < FILTER_ZONE_SIZE
            || width % FILTER_ZONE_SIZE != 0
            || height % FILTER_ZONE_SIZE != 0
        {
            return Err(Error::BadDimensions {
                width: width as u32,
                height: height as u32,
            });
        }

        let zones_x = width / FILTER_ZONE_SIZE;
        let zones_y = height / FILTER_ZONE_SIZE;
        let mut cm = Self {
            rgba,
            width,
            height,
            zones_x,
            zones_y,
            mask,
            lz,
            matrix: vec![0; zones_x * zones_y],
            filters: default_spatial_filters(),
            substitutions: Vec::new(),
            sf_encoder: crate::huffman::HuffmanEncoder::from_frequencies(&[0; SF_COUNT]),
            cf_encoder: crate::huffman::HuffmanEncoder::from_frequencies(&[0; CF_COUNT]),
            planes: Vec::new(),
            chaos_levels: 1,
        };

        cm.mask_zones();
        cm.design_filters();
        cm.decide_filters(compress_level, filter_select_fuzz);
        cm.apply_filters();
        cm.chaos_stats(chaos_thresh);
        Ok(cm)
    }

    #[inline]
    fn covered(&self, x: usize, y: usize) -> bool {
        self.lz.covered(x, y) || self.mask.masked(x, y)
    }

    #[inline]
    fn zone_filter(&self, x: usize, y: usize) -> u16 {
        self.matrix[(y / FILTER_ZONE_SIZE) * self.zones_x + x / FILTER_ZONE_SIZE]
    }

    /// Mark zones with no residuals as unused.
    fn mask_zones(&mut self) {
        let mask = self.mask;
        let lz = self.lz;
        let masked = |x: usize, y: usize| mask.masked(x, y);
        for zy in 0..self.zones_y {
            for zx in 0..self.zones_x {
                self.matrix[zy * self.zones_x + zx] = if zone_unused(&masked, lz, zx, zy) {
                    UNUSED_FILTER
                } else {
                    0
                };
            }
        }
    }

    /// Score the live filter set and the tapped menu across all zones,
    /// then swap poorly used defaults for clearly better tapped
    /// predictors.
    fn design_filters(&mut self) {
        const CANDIDATES: usize = SF_COUNT + TAPPED_COUNT;
        let mut best_hist = [0i64; CANDIDATES];
        let mut scores = [0u64; CANDIDATES];

        for zy in 0..self.zones_y {
            for zx in 0..self.zones_x {
                if self.matrix[zy * self.zones_x + zx] == UNUSED_FILTER {
                    continue;
                }
                scores.fill(0);
                let mut any = false;

                for y in zy * FILTER_ZONE_SIZE..(zy + 1) * FILTER_ZONE_SIZE {
                    for x in zx * FILTER_ZONE_SIZE..(zx + 1) * FILTER_ZONE_SIZE {
                        if self.covered(x, y) {
                            continue;
                        }
                        any = true;
                        let idx = (y * self.width + x) * 4;
                        let pixel = &self.rgba[idx..idx + 3];

                        for (i, filter) in self.filters.iter().enumerate() {
                            let pred = filter.predict(self.rgba, x, y, self.width);
                            scores[i] += prediction_error(pixel, pred);
                        }
                        for (i, taps) in FILTER_TAPS.iter().enumerate() {
                            let tapped = SpatialFilter::Tapped {
                                a: taps[0],
                                b: taps[1],
                                c: taps[2],
                                d: taps[3],
                            };
                            let pred = tapped.predict(self.rgba, x, y, self.width);
                            scores[SF_COUNT + i] += prediction_error(pixel, pred);
                        }
                    }
                }
                if !any {
                    continue;
                }

                // The outright winner gets 4 votes, the top four one each.
                let mut order: Vec<usize> = (0..CANDIDATES).collect();
                order.sort_by_key(|&i| scores[i]);
                best_hist[order[0]] += 4;
                for &i in order.iter().take(4) {
                    best_hist[i] += 1;
                }
            }
        }

        for _ in 0..SF_COUNT {
            let (mut lowest_idx, mut lowest) = (0usize, i64::MAX);
            for (i, &votes) in best_hist.iter().enumerate().take(SF_COUNT) {
                if votes < lowest {
                    lowest = votes;
                    lowest_idx = i;
                }
            }
            let (mut tap_idx, mut best_tap) = (0usize, i64::MIN);
            for i in 0..TAPPED_COUNT {
                if best_hist[SF_COUNT + i] > best_tap {
                    best_tap = best_hist[SF_COUNT + i];
                    tap_idx = i;
                }
            }

            if best_tap <= lowest {
                break;
            }
            // Require the tapped filter to be at least 1.2x more popular.
            if best_tap * 5 < lowest * 6 {
                break;
            }

            let taps = FILTER_TAPS[tap_idx];
            self.filters[lowest_idx] = SpatialFilter::Tapped {
                a: taps[0],
                b: taps[1],
                c: taps[2],
                d: taps[3],
            };
            self.substitutions.push((lowest_idx as u8, tap_idx as u8));

            // Grave markers.
            best_hist[lowest_idx] = i64::MAX;
            best_hist[SF_COUNT + tap_idx] = 0;
        }
    }

    /// Choose each zone's `(sf, cf)` pair.
    fn decide_filters(&mut self, compress_level: u8, filter_select_fuzz: usize) {
        let mut estimators: [EntropyEstimator; 3] = Default::default();
        let mut coords: Vec<(usize, usize)> = Vec::with_capacity(64);
        let mut scores = vec![0u64; SF_COUNT * CF_COUNT];

        let fuzz = match compress_level {
            0 | 1 => filter_select_fuzz,
            _ => (filter_select_fuzz * 2).min(64),
        };

        for zy in 0..self.zones_y {
            for zx in 0..self.zones_x {
                if self.matrix[zy * self.zones_x + zx] == UNUSED_FILTER {
                    continue;
                }

                coords.clear();
                for y in zy * FILTER_ZONE_SIZE..(zy + 1) * FILTER_ZONE_SIZE {
                    for x in zx * FILTER_ZONE_SIZE..(zx + 1) * FILTER_ZONE_SIZE {
                        if !self.covered(x, y) {
                            coords.push((x, y));
                        }
                    }
                }
                if coords.is_empty() {
                    self.matrix[zy * self.zones_x + zx] = pack_filter(0, 0);
                    continue;
                }

                scores.fill(0);
                for &(x, y) in &coords {
                    let idx = (y * self.width + x) * 4;
                    let pixel = &self.rgba[idx..idx + 3];
                    for (sf, filter) in self.filters.iter().enumerate() {
                        let pred = filter.predict(self.rgba, x, y, self.width);
                        let diff = [
                            pixel[0].wrapping_sub(pred[0]),
                            pixel[1].wrapping_sub(pred[1]),
                            pixel[2].wrapping_sub(pred[2]),
                        ];
                        for cf in 0..CF_COUNT {
                            scores[cf * SF_COUNT + sf] += yuv_score(rgb_to_yuv(cf, diff));
                        }
                    }
                }

                let mut order: Vec<usize> = (0..scores.len()).collect();
                order.sort_by_key(|&i| scores[i]);
                let lowest = order[0];

                let (best_sf, best_cf) = if compress_level == 0 || scores[lowest] <= 4 {
                    (lowest % SF_COUNT, lowest / SF_COUNT)
                } else {
                    self.rescore_by_entropy(&coords, &order[..fuzz.min(order.len())], &mut estimators)
                };

                self.matrix[zy * self.zones_x + zx] = pack_filter(best_sf, best_cf);
            }
        }
    }

    /// Re-rank the top candidates with the online entropy estimator and
    /// commit the winner's residuals into the global histograms.
    fn rescore_by_entropy(
        &self,
        coords: &[(usize, usize)],
        candidates: &[usize],
        estimators: &mut [EntropyEstimator; 3],
    ) -> (usize, usize) {
        let mut best = (0usize, 0usize);
        let mut best_score = u32::MAX;
        let mut best_syms: [Vec<u8>; 3] = Default::default();

        for &cand in candidates {
            let sf = cand % SF_COUNT;
            let cf = cand / SF_COUNT;

            let mut syms: [Vec<u8>; 3] = Default::default();
            for &(x, y) in coords {
                let idx = (y * self.width + x) * 4;
                let pred = self.filters[sf].predict(self.rgba, x, y, self.width);
                let diff = [
                    self.rgba[idx].wrapping_sub(pred[0]),
                    self.rgba[idx + 1].wrapping_sub(pred[1]),
                    self.rgba[idx + 2].wrapping_sub(pred[2]),
                ];
                let yuv = rgb_to_yuv(cf, diff);
                for (c, plane) in syms.iter_mut().enumerate() {
                    plane.push(yuv[c]);
                }
            }

            let score: u32 = (0..3).map(|c| estimators[c].entropy_of(&syms[c])).sum();
            if score < best_score {
                best_score = score;
                best = (sf, cf);
                best_syms = syms;
            }
        }

        for (c, estimator) in estimators.iter_mut().enumerate() {
            estimator.add(&best_syms[c]);
        }
        best
    }

    /// Histogram the decided zone symbols and build their tables.
    fn apply_filters(&mut self) {
        let mut sf_hist = [0u32; SF_COUNT];
        let mut cf_hist = [0u32; CF_COUNT];
        for &filter in &self.matrix {
            if filter != UNUSED_FILTER {
                sf_hist[(filter >> 8) as usize] += 1;
                cf_hist[(filter & 0xFF) as usize] += 1;
            }
        }
        self.sf_encoder = crate::huffman::HuffmanEncoder::from_frequencies(&sf_hist);
        self.cf_encoder = crate::huffman::HuffmanEncoder::from_frequencies(&cf_hist);
    }

    /// First residual pass: identical traversal to emission, accumulating
    /// the per-chaos histograms.
    fn chaos_stats(&mut self, chaos_thresh: usize) {
        let mut chaos_count = 0usize;
        for y in 0..self.height {
            for x in 0..self.width {
                if !self.covered(x, y) {
                    chaos_count += 1;
                }
            }
        }
        self.chaos_levels = if chaos_count >= chaos_thresh {
            CHAOS_LEVELS_MAX
        } else {
            1
        };

        self.planes = (0..COLOR_PLANES)
            .map(|_| PlaneEncoder::new(self.chaos_levels))
            .collect();
        let mut ring = ChaosRing::new(self.width, COLOR_PLANES, self.chaos_levels);

        for y in 0..self.height {
            for x in 0..self.width {
                if self.covered(x, y) {
                    ring.zero(x);
                    continue;
                }
                let yuva = self.pixel_residuals(x, y);
                let seq = (y * self.width + x) as u32;
                for (c, plane) in self.planes.iter_mut().enumerate() {
                    let chaos = ring.chaos(x, c);
                    plane.push(seq, chaos, yuva[c]);
                    ring.store(x, c, yuva[c]);
                }
            }
        }
        for plane in &mut self.planes {
            plane.end_run();
            plane.finalize();
        }
    }

    /// Filtered residuals for a non-covered pixel.
    #[inline]
    fn pixel_residuals(&self, x: usize, y: usize) -> [u8; 4] {
        let filter = self.zone_filter(x, y);
        debug_assert_ne!(filter, UNUSED_FILTER);
        let sf = (filter >> 8) as usize;
        let cf = (filter & 0xFF) as usize;

        let idx = (y * self.width + x) * 4;
        let pred = self.filters[sf].predict(self.rgba, x, y, self.width);
        let diff = [
            self.rgba[idx].wrapping_sub(pred[0]),
            self.rgba[idx + 1].wrapping_sub(pred[1]),
            self.rgba[idx + 2].wrapping_sub(pred[2]),
        ];
        let yuv = rgb_to_yuv(cf, diff);
        [
            yuv[0],
            yuv[1],
            yuv[2],
            alpha_residual(self.rgba, x, y, self.width),
        ]
    }

    /// Emit the CM block: filter negotiation, tables and the interleaved
    /// zone/residual stream.
    pub fn write(&mut self, writer: &mut WordWriter) {
        writer.write_bits(self.substitutions.len() as u32, 5);
        for &(slot, tap) in &self.substitutions {
            writer.write_bits(slot as u32, 5);
            writer.write_bits(tap as u32, 7);
        }

        for encoder in [&self.sf_encoder, &self.cf_encoder] {
            if encoder.is_empty() {
                writer.write_bit(0);
            } else {
                writer.write_bit(1);
                encoder.write_table(writer);
            }
        }

        writer.write_bits(self.chaos_levels as u32 - 1, 3);
        for plane in &self.planes {
            plane.write_tables(writer);
        }

        for y in 0..self.height {
            for x in 0..self.width {
                if x % FILTER_ZONE_SIZE == 0 && y % FILTER_ZONE_SIZE == 0 {
                    let filter = self.zone_filter(x, y);
                    if filter != UNUSED_FILTER {
                        self.sf_encoder.write_symbol((filter >> 8) as usize, writer);
                        self.cf_encoder.write_symbol((filter & 0xFF) as usize, writer);
                    }
                }
                if self.covered(x, y) {
                    continue;
                }
                let seq = (y * self.width + x) as u32;
                for plane in &mut self.planes {
                    plane.write_pending(seq, writer);
                }
            }
        }
    }
}

/// Decode a CM block into `rgba`, consuming the mask and LZ state.
pub fn decode(
    reader: &mut WordReader,
    rgba: &mut [u8],
    width: usize,
    height: usize,
    mask: &MaskReader,
    lz: &LzMap,
) -> Result<()> {
    let zones_x = width / FILTER_ZONE_SIZE;
    let zones_y = height / FILTER_ZONE_SIZE;

    // Rebuild the zone-unused predicate from the decoded mask and matches.
    let masked = |x: usize, y: usize| mask.masked(x, y);
    let mut matrix = vec![PENDING_FILTER; zones_x * zones_y];
    for zy in 0..zones_y {
        for zx in 0..zones_x {
            if zone_unused(&masked, lz, zx, zy) {
                matrix[zy * zones_x + zx] = UNUSED_FILTER;
            }
        }
    }

    // Filter-set negotiation.
    let mut filters = default_spatial_filters();
    let substitutions = reader.read_bits(5)? as usize;
    if substitutions > SF_COUNT {
        return Err(Error::CorruptBitstream("too many filter substitutions".into()));
    }
    for _ in 0..substitutions {
        let slot = reader.read_bits(5)? as usize;
        let tap = reader.read_bits(7)? as usize;
        if slot >= SF_COUNT || tap >= TAPPED_COUNT {
            return Err(Error::CorruptBitstream("filter substitution out of range".into()));
        }
        let taps = FILTER_TAPS[tap];
        filters[slot] = SpatialFilter::Tapped {
            a: taps[0],
            b: taps[1],
            c: taps[2],
            d: taps[3],
        };
    }

    let sf_decoder = if reader.read_bit()? == 1 {
        Some(crate::huffman::HuffmanDecoder::read_table(reader, SF_COUNT)?)
    } else {
        None
    };
    let cf_decoder = if reader.read_bit()? == 1 {
        Some(crate::huffman::HuffmanDecoder::read_table(reader, CF_COUNT)?)
    } else {
        None
    };

    let chaos_levels = reader.read_bits(3)? as usize + 1;
    if chaos_levels != 1 && chaos_levels != CHAOS_LEVELS_MAX {
        return Err(Error::CorruptBitstream("bad chaos level count".into()));
    }
    let mut planes = Vec::with_capacity(COLOR_PLANES);
    for _ in 0..COLOR_PLANES {
        planes.push(PlaneDecoder::read_tables(reader, chaos_levels)?);
    }
    let mut ring = ChaosRing::new(width, COLOR_PLANES, chaos_levels);

    let mask_color = mask.color().to_le_bytes();

    for y in 0..height {
        for x in 0..width {
            if x % FILTER_ZONE_SIZE == 0 && y % FILTER_ZONE_SIZE == 0 {
                let zone = (y / FILTER_ZONE_SIZE) * zones_x + x / FILTER_ZONE_SIZE;
                if matrix[zone] != UNUSED_FILTER {
                    let missing =
                        || Error::CorruptBitstream("zone symbols without a table".into());
                    let sf = sf_decoder
                        .as_ref()
                        .ok_or_else(missing)?
                        .next_symbol(reader)?;
                    let cf = cf_decoder
                        .as_ref()
                        .ok_or_else(|| {
                            Error::CorruptBitstream("zone symbols without a table".into())
                        })?
                        .next_symbol(reader)?;
                    matrix[zone] = pack_filter(sf as usize, cf as usize);
                }
            }

            let idx = (y * width + x) * 4;

            if lz.covered(x, y) {
                let (sx, sy) = lz.source_of(x, y);
                let src = (sy * width + sx) * 4;
                let (head, tail) = rgba.split_at_mut(idx);
                tail[..4].copy_from_slice(&head[src..src + 4]);
                ring.zero(x);
                continue;
            }
            if mask.masked(x, y) {
                rgba[idx..idx + 4].copy_from_slice(&mask_color);
                ring.zero(x);
                continue;
            }

            let filter = matrix[(y / FILTER_ZONE_SIZE) * zones_x + x / FILTER_ZONE_SIZE];
            if filter >= PENDING_FILTER {
                return Err(Error::CorruptBitstream("pixel in an unused zone".into()));
            }
            let sf = (filter >> 8) as usize;
            let cf = (filter & 0xFF) as usize;

            let pred = filters[sf].predict(rgba, x, y, width);

            let mut yuva = [0u8; COLOR_PLANES];
            for (c, plane) in planes.iter_mut().enumerate() {
                let chaos = ring.chaos(x, c);
                yuva[c] = plane.next(chaos, reader)?;
                ring.store(x, c, yuva[c]);
            }

            let diff = yuv_to_rgb(cf, [yuva[0], yuva[1], yuva[2]]);
            rgba[idx] = pred[0].wrapping_add(diff[0]);
            rgba[idx + 1] = pred[1].wrapping_add(diff[1]);
            rgba[idx + 2] = pred[2].wrapping_add(diff[2]);
            rgba[idx + 3] = if x > 0 {
                rgba[idx - 1].wrapping_add(yuva[3])
            } else {
                255u8.wrapping_sub(yuva[3])
            };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(rgba: &[u8], width: usize, height: usize) -> Vec<u8> {
        roundtrip_with(rgba, width, height, 40)
    }

    fn roundtrip_with(rgba: &[u8], width: usize, height: usize, mask_percent: u32) -> Vec<u8> {
        let mask = MaskWriter::from_rgba(rgba, width, height, mask_percent);
        let lz = crate::lz::find_matches(rgba, 4, width, height, 32, 64, Some(&mask));
        let mut cm = CmWriter::new(rgba, width, height, &mask, &lz, 1, 16, 512).unwrap();

        let mut writer = WordWriter::new(0);
        let mask_enabled = mask.enabled();
        if mask_enabled {
            mask.write(&mut writer, 512);
        }
        lz.write(&mut writer);
        cm.write(&mut writer);
        for _ in 0..6 {
            writer.write_word(0);
        }

        let mut reader = WordReader::new(&writer.finish()).unwrap();
        let mask = if mask_enabled {
            MaskReader::read(&mut reader, width, height, 32).unwrap()
        } else {
            MaskReader::disabled(width, height)
        };
        let lz = LzMap::read(&mut reader, width, height).unwrap();
        let mut out = vec![0u8; width * height * 4];
        decode(&mut reader, &mut out, width, height, &mask, &lz).unwrap();
        out
    }

    fn gradient(width: usize, height: usize) -> Vec<u8> {
        let mut rgba = Vec::with_capacity(width * height * 4);
        for _y in 0..height {
            for x in 0..width {
                rgba.extend_from_slice(&[x as u8, x as u8, x as u8, 255]);
            }
        }
        rgba
    }

    #[test]
    fn test_gradient_roundtrip() {
        let rgba = gradient(64, 16);
        assert_eq!(roundtrip(&rgba, 64, 16), rgba);
    }

    #[test]
    fn test_noise_roundtrip() {
        let mut state = 0xfeed_f00du32;
        let rgba: Vec<u8> = (0..32 * 32 * 4)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 11) as u8
            })
            .collect();
        assert_eq!(roundtrip(&rgba, 32, 32), rgba);
    }

    #[test]
    fn test_sprite_with_mask_roundtrip() {
        let width = 48;
        let height = 48;
        let mut rgba = vec![0u8; width * height * 4];
        for y in 8..40 {
            for x in 8..40 {
                let idx = (y * width + x) * 4;
                rgba[idx..idx + 4].copy_from_slice(&[(x * 5) as u8, (y * 3) as u8, 128, 255]);
            }
        }
        assert_eq!(roundtrip(&rgba, width, height), rgba);
    }

    #[test]
    fn test_repeated_blocks_roundtrip() {
        // Repeats trigger LZ coverage; residuals must stay aligned.
        let width = 64;
        let height = 32;
        let mut rgba = vec![0u8; width * height * 4];
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) * 4;
                let v = ((x % 16) * 16) as u8;
                rgba[idx..idx + 4].copy_from_slice(&[v, v ^ 0x55, v ^ 0xAA, 255]);
            }
        }
        assert_eq!(roundtrip_with(&rgba, width, height, 90), rgba);
    }

    #[test]
    fn test_alpha_variation_roundtrip() {
        let width = 16;
        let height = 16;
        let mut rgba = Vec::new();
        for y in 0..height {
            for x in 0..width {
                rgba.extend_from_slice(&[x as u8 * 9, 0, y as u8 * 7, (x * y) as u8]);
            }
        }
        assert_eq!(roundtrip(&rgba, width, height), rgba);
    }

    #[test]
    fn test_bad_dimensions_rejected() {
        let rgba = gradient(12, 8);
        let mask = MaskWriter::from_rgba(&rgba, 12, 8, 40);
        let lz = LzMap::empty(12, 8);
        assert!(matches!(
            CmWriter::new(&rgba, 12, 8, &mask, &lz, 1, 16, 512),
            Err(Error::BadDimensions { .. })
        ));
    }

    #[test]
    fn test_compress_levels_agree() {
        let rgba = gradient(32, 16);
        for level in 0..=2 {
            let mask = MaskWriter::from_rgba(&rgba, 32, 16, 40);
            let lz = LzMap::empty(32, 16);
            let mut cm = CmWriter::new(&rgba, 32, 16, &mask, &lz, level, 16, 512).unwrap();
            let mut writer = WordWriter::new(0);
            cm.write(&mut writer);
            for _ in 0..6 {
                writer.write_word(0);
            }
            let mut reader = WordReader::new(&writer.finish()).unwrap();
            let mask = MaskReader::disabled(32, 16);
            let lz = LzMap::empty(32, 16);
            let mut out = vec![0u8; 32 * 16 * 4];
            decode(&mut reader, &mut out, 32, 16, &mask, &lz).unwrap();
            assert_eq!(out, rgba, "level {} failed", level);
        }
    }
}
