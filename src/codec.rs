//! Top-level container driver: header, block sequencing and hash trailer.

use crate::bits::{WordReader, WordWriter};
use crate::cm::{self, CmWriter, FILTER_ZONE_SIZE};
use crate::error::{Error, Result};
use crate::lz::{find_matches, LzMap};
use crate::mask::{MaskReader, MaskWriter};
use crate::palette::{self, detect_palette, PaletteWriter};

/// Container magic: "GCIF" as a little-endian word.
const MAGIC: u32 = u32::from_le_bytes(*b"GCIF");
/// Container version.
const VERSION: u32 = 1;
/// Maximum supported image dimension.
const MAX_DIMENSION: u32 = 1 << 15;
/// Maximum supported pixel count (bounds decoder allocations).
const MAX_PIXELS: u64 = 1 << 26;

/// Flag bit: small-palette block present.
const FLAG_PALETTE: u32 = 1 << 0;
/// Flag bit: mask block present.
const FLAG_MASK: u32 = 1 << 1;
/// Flag bit: LZ block present.
const FLAG_LZ: u32 = 1 << 2;
/// Flag bit: CM block present.
const FLAG_CM: u32 = 1 << 3;
const FLAG_ALL: u32 = FLAG_PALETTE | FLAG_MASK | FLAG_LZ | FLAG_CM;

/// Encoder tuning knobs.
#[derive(Debug, Clone)]
pub struct GcifOptions {
    /// Zone filter-selection effort (0..=2).
    pub compress_level: u8,
    /// Candidate pairs rescored by the entropy estimator (1..=64).
    pub filter_select_fuzz: usize,
    /// Dominant-color acceptance threshold, in percent of all pixels.
    pub mask_min_percent: u32,
    /// LZ hash-chain walk bound.
    pub lz_max_chain: usize,
    /// Smallest LZ match area worth a reference, in pixels.
    pub lz_min_area: usize,
    /// Coded-pixel count below which a single chaos context is used.
    pub chaos_thresh: usize,
    /// Header seed for the trailer hash.
    pub seed: u32,
}

impl Default for GcifOptions {
    fn default() -> Self {
        Self::balanced()
    }
}

impl GcifOptions {
    /// Speed-focused preset: absolute-error filter decisions, shallow
    /// match chains.
    pub fn fast() -> Self {
        Self {
            compress_level: 0,
            filter_select_fuzz: 8,
            mask_min_percent: 40,
            lz_max_chain: 8,
            lz_min_area: 64,
            chaos_thresh: 4096,
            seed: 0x6a09_e667,
        }
    }

    /// Balanced preset: entropy-estimated filter decisions.
    pub fn balanced() -> Self {
        Self {
            compress_level: 1,
            filter_select_fuzz: 16,
            mask_min_percent: 40,
            lz_max_chain: 32,
            lz_min_area: 64,
            chaos_thresh: 4096,
            seed: 0x6a09_e667,
        }
    }

    /// Highest compression preset; slowest.
    pub fn max_compression() -> Self {
        Self {
            compress_level: 2,
            filter_select_fuzz: 32,
            mask_min_percent: 40,
            lz_max_chain: 256,
            lz_min_area: 48,
            chaos_thresh: 4096,
            seed: 0x6a09_e667,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.compress_level > 2 {
            return Err(Error::BadOptions("compress_level must be 0..=2".into()));
        }
        if !(1..=64).contains(&self.filter_select_fuzz) {
            return Err(Error::BadOptions("filter_select_fuzz must be 1..=64".into()));
        }
        if self.mask_min_percent > 100 {
            return Err(Error::BadOptions("mask_min_percent must be <= 100".into()));
        }
        if self.lz_max_chain == 0 {
            return Err(Error::BadOptions("lz_max_chain must be positive".into()));
        }
        if self.lz_min_area == 0 {
            return Err(Error::BadOptions("lz_min_area must be positive".into()));
        }
        Ok(())
    }
}

/// Per-layer bit accounting for one encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Fixed header bits.
    pub header_bits: u64,
    /// Small-palette block bits.
    pub palette_bits: u64,
    /// Mask block bits.
    pub mask_bits: u64,
    /// LZ block bits.
    pub lz_bits: u64,
    /// CM block bits (tables and pixel stream).
    pub cm_bits: u64,
    /// Total payload bits before word alignment and the trailer.
    pub total_bits: u64,
}

/// A decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    /// RGBA pixels, row-major, alpha in the high byte of each word.
    pub pixels: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Encode an RGBA raster.
pub fn encode(rgba: &[u8], width: u32, height: u32, options: &GcifOptions) -> Result<Vec<u8>> {
    encode_with_stats(rgba, width, height, options).map(|(bytes, _)| bytes)
}

/// Encode an RGBA raster, returning per-layer bit counts alongside the
/// stream.
pub fn encode_with_stats(
    rgba: &[u8],
    width: u32,
    height: u32,
    options: &GcifOptions,
) -> Result<(Vec<u8>, CodecStats)> {
    options.validate()?;

    if width == 0
        || height == 0
        || width > MAX_DIMENSION
        || height > MAX_DIMENSION
        || width as u64 * height as u64 > MAX_PIXELS
    {
        return Err(Error::BadDimensions { width, height });
    }
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        return Err(Error::BadDataLength {
            expected,
            actual: rgba.len(),
        });
    }

    let w = width as usize;
    let h = height as usize;
    let zone = FILTER_ZONE_SIZE as u32;
    let aligned = width % zone == 0 && height % zone == 0;

    let palette = detect_palette(rgba, width, height);

    // Routing: single colors on aligned images go through the mask; any
    // other small palette goes through palette mode; everything else
    // requires the aligned CM path.
    let use_palette = match &palette {
        Some(p) => p.len() > 1 || !aligned,
        None => false,
    };
    if !use_palette && !aligned {
        return Err(Error::BadDimensions { width, height });
    }

    let mut stats = CodecStats::default();

    if use_palette {
        let palette = palette.expect("palette mode requires a palette");
        let pw = PaletteWriter::new(
            rgba,
            w,
            h,
            palette,
            options.mask_min_percent,
            options.lz_max_chain,
            options.lz_min_area,
        );
        let mut writer = WordWriter::new(options.seed);
        write_header(&mut writer, width, height, FLAG_PALETTE, options.seed);
        stats.header_bits = writer.bit_count();
        stats.palette_bits = pw.write(&mut writer, options.chaos_thresh);
        stats.total_bits = writer.bit_count();
        return Ok((writer.finish(), stats));
    }

    let mask = MaskWriter::from_rgba(rgba, w, h, options.mask_min_percent);
    let lz = find_matches(
        rgba,
        4,
        w,
        h,
        options.lz_max_chain,
        options.lz_min_area,
        Some(&mask),
    );
    let mut cm = CmWriter::new(
        rgba,
        w,
        h,
        &mask,
        &lz,
        options.compress_level,
        options.filter_select_fuzz,
        options.chaos_thresh,
    )?;

    let mut flags = FLAG_CM;
    if mask.enabled() {
        flags |= FLAG_MASK;
    }
    if lz.match_count() > 0 {
        flags |= FLAG_LZ;
    }

    let mut writer = WordWriter::new(options.seed);
    write_header(&mut writer, width, height, flags, options.seed);
    stats.header_bits = writer.bit_count();

    if mask.enabled() {
        stats.mask_bits = mask.write(&mut writer, options.chaos_thresh);
    }
    if lz.match_count() > 0 {
        stats.lz_bits = lz.write(&mut writer);
    }
    let cm_start = writer.bit_count();
    cm.write(&mut writer);
    stats.cm_bits = writer.bit_count() - cm_start;
    stats.total_bits = writer.bit_count();

    Ok((writer.finish(), stats))
}

fn write_header(writer: &mut WordWriter, width: u32, height: u32, flags: u32, seed: u32) {
    writer.write_word(MAGIC);
    writer.write_bits(VERSION, 16);
    writer.write_bits(flags, 16);
    writer.write_word(width);
    writer.write_word(height);
    writer.write_word(seed);
}

/// Decode a GCIF stream.
pub fn decode(data: &[u8]) -> Result<DecodedImage> {
    let mut reader = WordReader::new(data)?;

    if reader.read_word()? != MAGIC {
        return Err(Error::CorruptBitstream("bad magic".into()));
    }
    let version = reader.read_bits(16)?;
    if version != VERSION {
        return Err(Error::Unsupported(format!("unknown version {}", version)));
    }
    let flags = reader.read_bits(16)?;
    if flags & !FLAG_ALL != 0 {
        return Err(Error::Unsupported(format!("unknown flag bits {:#x}", flags)));
    }

    let width = reader.read_word()?;
    let height = reader.read_word()?;
    if width == 0
        || height == 0
        || width > MAX_DIMENSION
        || height > MAX_DIMENSION
        || width as u64 * height as u64 > MAX_PIXELS
    {
        return Err(Error::CorruptBitstream("bad dimensions".into()));
    }
    let seed = reader.read_word()?;
    reader.verify_trailer(seed)?;

    let w = width as usize;
    let h = height as usize;

    if flags & FLAG_PALETTE != 0 {
        if flags != FLAG_PALETTE {
            return Err(Error::CorruptBitstream("conflicting block flags".into()));
        }
        let pixels = palette::decode(&mut reader, w, h)?;
        return Ok(DecodedImage {
            pixels,
            width,
            height,
        });
    }

    if flags & FLAG_CM == 0 {
        return Err(Error::CorruptBitstream("no pixel block".into()));
    }
    if w % FILTER_ZONE_SIZE != 0 || h % FILTER_ZONE_SIZE != 0 {
        return Err(Error::CorruptBitstream("unaligned dimensions".into()));
    }

    let mask = if flags & FLAG_MASK != 0 {
        MaskReader::read(&mut reader, w, h, 32)?
    } else {
        MaskReader::disabled(w, h)
    };
    let lz = if flags & FLAG_LZ != 0 {
        LzMap::read(&mut reader, w, h)?
    } else {
        LzMap::empty(w, h)
    };

    let mut pixels = vec![0u8; w * h * 4];
    cm::decode(&mut reader, &mut pixels, w, h, &mask, &lz)?;

    Ok(DecodedImage {
        pixels,
        width,
        height,
    })
}
