//! CAR file writing
//!
//! Output is plain CARv1: a DAG-CBOR `{roots, version}` header frame, then one
//! frame per block. The header is always written, so an archive with no blocks
//! is still a valid CAR.

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cid::{ContentId, IpldCid, encode_cid};
use crate::error::BoxError;
use crate::varint::encode_uvarint;

/// Errors from writing an archive
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CarWriteError {
    /// Header encoding failed
    #[error("failed to encode CAR header")]
    #[diagnostic(code(car::encode))]
    Encode(#[source] BoxError),

    /// Writing to the sink failed
    #[error("failed to write CAR")]
    #[diagnostic(code(car::write))]
    Io(#[from] std::io::Error),
}

// Field order is the DAG-CBOR canonical key order (shorter keys first).
#[derive(Serialize)]
struct HeaderOut {
    roots: Vec<IpldCid>,
    version: u64,
}

async fn write_frame<W>(writer: &mut W, parts: &[&[u8]]) -> Result<(), CarWriteError>
where
    W: AsyncWrite + Unpin,
{
    let len: usize = parts.iter().map(|p| p.len()).sum();
    let mut prefix = Vec::with_capacity(crate::varint::MAX_VARINT_LEN);
    encode_uvarint(len as u64, &mut prefix);

    writer.write_all(&prefix).await?;
    for part in parts {
        writer.write_all(part).await?;
    }
    Ok(())
}

/// Write an archive to `writer`
///
/// Blocks are written in iteration order, without verification.
pub async fn write_car<W>(
    mut writer: W,
    roots: Vec<ContentId>,
    blocks: impl IntoIterator<Item = (ContentId, Bytes)>,
) -> Result<(), CarWriteError>
where
    W: AsyncWrite + Unpin,
{
    let header = HeaderOut {
        roots: roots.into_iter().map(Into::into).collect(),
        version: 1,
    };
    let header =
        serde_ipld_dagcbor::to_vec(&header).map_err(|e| CarWriteError::Encode(Box::new(e)))?;
    write_frame(&mut writer, &[header.as_slice()]).await?;

    for (cid, data) in blocks {
        let cid = encode_cid(&cid);
        write_frame(&mut writer, &[cid.as_slice(), data.as_ref()]).await?;
    }

    writer.flush().await?;
    Ok(())
}

/// Write an archive to a new buffer
pub async fn write_car_bytes(
    roots: Vec<ContentId>,
    blocks: impl IntoIterator<Item = (ContentId, Bytes)>,
) -> Result<Vec<u8>, CarWriteError> {
    let mut buffer = Vec::new();
    write_car(&mut buffer, roots, blocks).await?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::parse_car_bytes;
    use crate::cid::{DAG_CBOR, HashAlgorithm, RAW};

    #[tokio::test]
    async fn test_written_car_reads_back() {
        let leaf = Bytes::from_static(b"leaf");
        let leaf_cid = ContentId::for_data(RAW, HashAlgorithm::Sha2_256, &leaf).unwrap();
        let node = Bytes::from_static(&[0xa0]);
        let node_cid = ContentId::for_data(DAG_CBOR, HashAlgorithm::Sha2_256, &node).unwrap();

        let bytes = write_car_bytes(
            vec![node_cid],
            vec![(node_cid, node.clone()), (leaf_cid, leaf.clone())],
        )
        .await
        .unwrap();

        let parsed = parse_car_bytes(&bytes).await.unwrap();
        assert_eq!(parsed.roots, vec![node_cid]);
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks[&leaf_cid], leaf);
        assert_eq!(parsed.blocks[&node_cid], node);
    }

    #[tokio::test]
    async fn test_header_only_archive() {
        let root = ContentId::for_data(RAW, HashAlgorithm::Sha2_256, b"absent").unwrap();
        let bytes = write_car_bytes(vec![root], Vec::new()).await.unwrap();

        let parsed = parse_car_bytes(&bytes).await.unwrap();
        assert_eq!(parsed.roots, vec![root]);
        assert!(parsed.blocks.is_empty());

        let bytes = write_car_bytes(Vec::new(), Vec::new()).await.unwrap();
        assert!(parse_car_bytes(&bytes).await.unwrap().roots.is_empty());
    }

    #[test]
    fn test_header_matches_reference_bytes() {
        // {roots: [], version: 1}
        let header = HeaderOut {
            roots: Vec::new(),
            version: 1,
        };
        assert_eq!(
            serde_ipld_dagcbor::to_vec(&header).unwrap(),
            [
                0xa2, 0x65, b'r', b'o', b'o', b't', b's', 0x80, 0x67, b'v', b'e', b'r', b's', b'i',
                b'o', b'n', 0x01
            ]
        );
    }
}
