//! CAR header frame

use serde::Deserialize;
use tokio::io::AsyncRead;

use super::decoder::read_frame;
use super::{CarError, Frame};
use crate::cid::{ContentId, IpldCid};

/// Decoded CARv1 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarHeader {
    /// Always 1 for accepted archives
    pub version: u64,
    /// Declared entry points, in header order; may be empty
    pub roots: Vec<ContentId>,
}

impl CarHeader {
    /// A version 1 header with the given roots
    pub fn new_v1(roots: Vec<ContentId>) -> Self {
        Self { version: 1, roots }
    }

    /// First declared root
    pub fn root(&self) -> Option<&ContentId> {
        self.roots.first()
    }
}

/// Wire shape of the header map
///
/// `roots` is optional here so that a CARv2 pragma (`{version: 2}`) reports its
/// version rather than a missing field.
#[derive(Deserialize)]
struct RawHeader {
    version: u64,
    #[serde(default)]
    roots: Option<Vec<IpldCid>>,
}

/// Read the header frame from the front of `reader`
pub async fn decode_header<R>(reader: &mut R, max_header_size: u64) -> Result<CarHeader, CarError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, Frame::Header, max_header_size)
        .await?
        .ok_or_else(|| CarError::malformed_header("stream is empty"))?;

    parse_header(&frame)
}

fn parse_header(frame: &[u8]) -> Result<CarHeader, CarError> {
    if frame.is_empty() {
        return Err(CarError::malformed_header("header frame is empty"));
    }

    let raw: RawHeader = serde_ipld_dagcbor::from_slice(frame)
        .map_err(|e| CarError::malformed_header(e.to_string()))?;

    if raw.version != 1 {
        return Err(CarError::UnsupportedVersion(raw.version));
    }

    let roots = raw
        .roots
        .ok_or_else(|| CarError::malformed_header("missing `roots`"))?
        .into_iter()
        .map(|cid| {
            ContentId::try_from(cid)
                .map_err(|e| CarError::malformed_header(format!("invalid root: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CarHeader { version: 1, roots })
}
