//! Error types for the gcif library.

use std::fmt;

/// Result type alias for gcif operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during image encoding or decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid image dimensions (zero, or not a multiple of 8 outside
    /// palette mode).
    BadDimensions {
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
    },
    /// Pixel data length doesn't match expected size.
    BadDataLength {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes provided.
        actual: usize,
    },
    /// Huffman code lengths violate the Kraft inequality, or a decoded
    /// symbol falls outside its alphabet.
    BadTable(String),
    /// Truncated stream, trailer hash mismatch, or inconsistent block data.
    CorruptBitstream(String),
    /// Unknown container version or flag bits.
    Unsupported(String),
    /// An option field is outside its accepted range.
    BadOptions(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadDimensions { width, height } => {
                write!(f, "Invalid image dimensions: {}x{}", width, height)
            }
            Error::BadDataLength { expected, actual } => {
                write!(
                    f,
                    "Invalid pixel data length: expected {} bytes, got {}",
                    expected, actual
                )
            }
            Error::BadTable(msg) => write!(f, "Bad Huffman table: {}", msg),
            Error::CorruptBitstream(msg) => write!(f, "Corrupt bitstream: {}", msg),
            Error::Unsupported(msg) => write!(f, "Unsupported stream: {}", msg),
            Error::BadOptions(msg) => write!(f, "Invalid options: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
