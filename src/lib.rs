//! # gcif
//!
//! A lossless codec for 32-bit RGBA images with large uniform regions and
//! limited palettes (game sprites, UI assets, icons).
//!
//! Four collaborating layers turn pixels into bits and back, bit-exactly:
//!
//! - a **dominant-color mask** that records the footprint of the most
//!   common color as a compressed bitmap;
//! - a **2D LZ** pass that replaces repeated rectangles with references;
//! - a **context-model** residual coder that picks a spatial and color
//!   filter per 8x8 zone and entropy-codes the four planes through
//!   chaos-selected Huffman tables;
//! - a **small-palette** mode that collapses images of at most sixteen
//!   colors into packed indices.
//!
//! The container is a little-endian 32-bit word stream with a Murmur3
//! trailer; any corruption fails the decode loudly.
//!
//! ## Example
//!
//! ```rust
//! use gcif::{decode, encode, GcifOptions};
//!
//! let pixels = vec![0u8; 8 * 8 * 4]; // 8x8 transparent black
//! let bytes = encode(&pixels, 8, 8, &GcifOptions::default()).unwrap();
//! let image = decode(&bytes).unwrap();
//! assert_eq!(image.pixels, pixels);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bits;
pub mod cm;
pub mod codec;
pub mod entropy;
pub mod error;
pub mod filters;
pub mod hash;
pub mod huffman;
pub mod lz;
pub mod mask;
pub mod mono;
pub mod palette;

pub use codec::{decode, encode, encode_with_stats, CodecStats, DecodedImage, GcifOptions};
pub use error::{Error, Result};
