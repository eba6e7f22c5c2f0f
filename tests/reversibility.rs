//! Color-filter reversibility gates.
//!
//! Every color filter in the menu must invert exactly on 8-bit bytes; a
//! filter that fails here corrupts images silently, so the lifting
//! transforms are swept over their entire input space and the simpler
//! difference transforms over dense deterministic samples.

use gcif::filters::{rgb_to_yuv, yuv_to_rgb, CF_COUNT};

/// The YCoCg-R lifting transform, exhaustively over all 2^24 inputs.
#[test]
fn test_ycocg_r_exhaustive() {
    for r in 0..=255u16 {
        for g in 0..=255u16 {
            for b in 0..=255u16 {
                let rgb = [r as u8, g as u8, b as u8];
                let out = yuv_to_rgb(0, rgb_to_yuv(0, rgb));
                assert_eq!(out, rgb, "YCoCg-R broke at {:?}", rgb);
            }
        }
    }
}

/// The averaged-chroma transforms, exhaustively over all 2^24 inputs.
#[test]
fn test_averaged_chroma_exhaustive() {
    for cf in 13..CF_COUNT {
        for r in 0..=255u16 {
            for g in 0..=255u16 {
                for b in 0..=255u16 {
                    let rgb = [r as u8, g as u8, b as u8];
                    let out = yuv_to_rgb(cf, rgb_to_yuv(cf, rgb));
                    assert_eq!(out, rgb, "filter {} broke at {:?}", cf, rgb);
                }
            }
        }
    }
}

/// Every filter over a dense deterministic lattice plus the byte extremes.
#[test]
fn test_full_menu_lattice() {
    let edge = [0u8, 1, 2, 63, 64, 127, 128, 129, 191, 254, 255];
    for cf in 0..CF_COUNT {
        for &r in &edge {
            for &g in &edge {
                for &b in &edge {
                    let rgb = [r, g, b];
                    assert_eq!(
                        yuv_to_rgb(cf, rgb_to_yuv(cf, rgb)),
                        rgb,
                        "filter {} broke at {:?}",
                        cf,
                        rgb
                    );
                }
            }
        }

        let mut state = 0x2545_f491u32;
        for _ in 0..250_000 {
            state = state.wrapping_mul(747796405).wrapping_add(2891336453);
            let bytes = state.to_le_bytes();
            let rgb = [bytes[0], bytes[1], bytes[2]];
            assert_eq!(
                yuv_to_rgb(cf, rgb_to_yuv(cf, rgb)),
                rgb,
                "filter {} broke at {:?}",
                cf,
                rgb
            );
        }
    }
}
