//! Streaming block decoder

use bytes::Bytes;
use n0_future::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Block, CarError, Frame};
use crate::cid::decode_cid;
use crate::varint::{VarintRead, read_uvarint};

/// Read one length-prefixed frame
///
/// Returns `None` on a clean end of stream before the length prefix. The length
/// is checked against `max` before anything is allocated.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    frame: Frame,
    max: u64,
) -> Result<Option<Vec<u8>>, CarError>
where
    R: AsyncRead + Unpin,
{
    let len = match read_uvarint(reader).await? {
        VarintRead::Eof => return Ok(None),
        VarintRead::Truncated { .. } => {
            return Err(CarError::TruncatedFrame {
                frame,
                expected: 0,
                received: 0,
            });
        }
        VarintRead::Overflow => return Err(CarError::LengthOverflow { frame }),
        VarintRead::Value(len) => len,
    };

    if len > max {
        return Err(CarError::OversizedFrame {
            frame,
            declared: len,
            max,
        });
    }

    let mut buf = Vec::with_capacity(len as usize);
    let received = (&mut *reader).take(len).read_to_end(&mut buf).await? as u64;
    if received < len {
        return Err(CarError::TruncatedFrame {
            frame,
            expected: len,
            received,
        });
    }

    Ok(Some(buf))
}

/// Forward-only reader over the block frames of an archive
///
/// Each call to [`next_block`](Self::next_block) consumes exactly one frame.
/// After the end of the stream or any error the decoder is finished and keeps
/// returning `Ok(None)`.
pub struct BlockDecoder<R> {
    reader: R,
    max_frame_size: u64,
    next_index: u64,
    finished: bool,
}

impl<R> BlockDecoder<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap a reader positioned just after the header
    pub fn new(reader: R, max_frame_size: u64) -> Self {
        Self {
            reader,
            max_frame_size,
            next_index: 0,
            finished: false,
        }
    }

    /// Read the next block
    ///
    /// Returns `None` when the stream ends cleanly between frames.
    pub async fn next_block(&mut self) -> Result<Option<Block>, CarError> {
        if self.finished {
            return Ok(None);
        }

        let result = self.read_block().await;
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }

    async fn read_block(&mut self) -> Result<Option<Block>, CarError> {
        let frame = Frame::Block(self.next_index);
        let Some(bytes) = read_frame(&mut self.reader, frame, self.max_frame_size).await? else {
            return Ok(None);
        };
        self.next_index += 1;

        let (cid, consumed) =
            decode_cid(&bytes, 0).map_err(|source| CarError::MalformedCid { frame, source })?;
        let data = Bytes::from(bytes).slice(consumed..);

        Ok(Some(Block { cid, data }))
    }

    /// Index the next block frame will have
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Convert into a stream of blocks
    pub fn into_stream(self) -> impl Stream<Item = Result<Block, CarError>> {
        stream::unfold(self, |mut decoder| async move {
            match decoder.next_block().await {
                Ok(Some(block)) => Some((Ok(block), decoder)),
                Ok(None) => None,
                Err(e) => Some((Err(e), decoder)),
            }
        })
    }

    /// Give back the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}
