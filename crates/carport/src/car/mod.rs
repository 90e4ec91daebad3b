//! CAR file decoding and encoding
//!
//! A CARv1 stream is a varint-length-prefixed header frame (DAG-CBOR
//! `{version, roots}`) followed by zero or more block frames, each holding a
//! binary CID and the block payload.
//!
//! Decoding is streaming: [`open`] reads the header and returns a
//! [`BlockDecoder`] that yields one block per call, so memory use is bounded by
//! the largest frame rather than the archive.
//!
//! # Examples
//!
//! Walking an archive:
//! ```ignore
//! use carport::car::{DecodeLimits, open};
//!
//! let (header, mut blocks) = open(reader, &DecodeLimits::default()).await?;
//! while let Some(block) = blocks.next_block().await? {
//!     println!("{} ({} bytes)", block.cid, block.data.len());
//! }
//! ```
//!
//! Writing one:
//! ```ignore
//! use carport::car::writer::write_car_bytes;
//!
//! let bytes = write_car_bytes(vec![root], blocks).await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::cid::{CidError, ContentId};

pub mod decoder;
pub mod header;
pub mod writer;

pub use decoder::BlockDecoder;
pub use header::{CarHeader, decode_header};
pub use writer::{CarWriteError, write_car, write_car_bytes};

/// Default cap on a single block frame (8 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 8 * 1024 * 1024;

/// Default cap on the header frame (1 MiB)
pub const DEFAULT_MAX_HEADER_SIZE: u64 = 1024 * 1024;

/// One (CID, payload) pair read from an archive
///
/// The CID is unverified until checked with [`crate::verify::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Identifier the archive claims for this payload
    pub cid: ContentId,
    /// Payload bytes
    pub data: Bytes,
}

/// Position of a frame within an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// The leading header frame
    Header,
    /// A block frame, zero-based
    Block(u64),
}

impl Frame {
    /// Block index, if this is a block frame
    pub fn block_index(self) -> Option<u64> {
        match self {
            Frame::Header => None,
            Frame::Block(index) => Some(index),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Header => f.write_str("header"),
            Frame::Block(index) => write!(f, "block {}", index),
        }
    }
}

/// Size limits applied while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Largest header frame accepted
    pub max_header_size: u64,
    /// Largest block frame accepted
    pub max_frame_size: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Structural errors from decoding an archive
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CarError {
    /// Header frame missing or not a `{version, roots}` map
    #[error("malformed CAR header: {reason}")]
    #[diagnostic(
        code(car::malformed_header),
        help("a CARv1 header is a DAG-CBOR map with an integer `version` and a list of `roots`")
    )]
    MalformedHeader {
        /// What was wrong
        reason: String,
    },

    /// Header names a version other than 1
    #[error("unsupported CAR version {0}")]
    #[diagnostic(code(car::unsupported_version), help("only CARv1 archives are accepted"))]
    UnsupportedVersion(u64),

    /// Stream ended inside a frame
    #[error("{frame} truncated: stream ended {received} bytes into a {expected} byte frame")]
    #[diagnostic(code(car::truncated_frame))]
    TruncatedFrame {
        /// Which frame
        frame: Frame,
        /// Bytes the length prefix declared (0 if the prefix itself was cut)
        expected: u64,
        /// Bytes actually available
        received: u64,
    },

    /// Frame declares more bytes than the configured limit
    #[error("{frame} declares {declared} bytes, limit is {max}")]
    #[diagnostic(
        code(car::oversized_frame),
        help("raise the frame size limit if large blocks are expected")
    )]
    OversizedFrame {
        /// Which frame
        frame: Frame,
        /// Declared length
        declared: u64,
        /// Configured limit
        max: u64,
    },

    /// Length prefix longer than any valid varint
    #[error("{frame} length prefix exceeds 63 bits")]
    #[diagnostic(code(car::oversized_frame))]
    LengthOverflow {
        /// Which frame
        frame: Frame,
    },

    /// Block frame does not start with a valid CID
    #[error("{frame} has a malformed CID")]
    #[diagnostic(code(car::malformed_cid))]
    MalformedCid {
        /// Which frame
        frame: Frame,
        /// Underlying CID error
        #[source]
        #[diagnostic_source]
        source: CidError,
    },

    /// Reading the underlying stream failed
    #[error("failed to read CAR stream")]
    #[diagnostic(code(car::io))]
    Io(#[from] std::io::Error),
}

impl CarError {
    pub(crate) fn malformed_header(reason: impl Into<String>) -> Self {
        Self::MalformedHeader {
            reason: reason.into(),
        }
    }

    /// The frame the error occurred in, if known
    pub fn frame(&self) -> Option<Frame> {
        match self {
            CarError::MalformedHeader { .. } | CarError::UnsupportedVersion(_) => {
                Some(Frame::Header)
            }
            CarError::TruncatedFrame { frame, .. }
            | CarError::OversizedFrame { frame, .. }
            | CarError::LengthOverflow { frame }
            | CarError::MalformedCid { frame, .. } => Some(*frame),
            CarError::Io(_) => None,
        }
    }
}

/// Read the header and return a decoder positioned at the first block
pub async fn open<R>(
    mut reader: R,
    limits: &DecodeLimits,
) -> Result<(CarHeader, BlockDecoder<R>), CarError>
where
    R: AsyncRead + Unpin,
{
    let header = decode_header(&mut reader, limits.max_header_size).await?;
    Ok((header, BlockDecoder::new(reader, limits.max_frame_size)))
}

/// Parsed CAR data held in memory
#[derive(Debug, Clone)]
pub struct ParsedCar {
    /// Roots from the header
    pub roots: Vec<ContentId>,
    /// All blocks, keyed by CID
    pub blocks: BTreeMap<ContentId, Bytes>,
}

/// Decode an in-memory CAR into roots and a block map
///
/// No integrity checks are made; this is for archives we produced ourselves,
/// such as exports and test fixtures.
pub async fn parse_car_bytes(data: &[u8]) -> Result<ParsedCar, CarError> {
    let limits = DecodeLimits {
        max_header_size: data.len() as u64,
        max_frame_size: data.len() as u64,
    };
    let (header, mut decoder) = open(data, &limits).await?;

    let mut blocks = BTreeMap::new();
    while let Some(block) = decoder.next_block().await? {
        blocks.insert(block.cid, block.data);
    }

    Ok(ParsedCar {
        roots: header.roots,
        blocks,
    })
}
