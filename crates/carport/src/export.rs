//! DAG export
//!
//! Walks a DAG held in a [`ClusterStore`] from its root and writes every
//! reachable block, once each, into a CARv1 whose single root is the DAG root.
//! Links are found per codec:
//!
//! - raw: none
//! - dag-cbor: every CID link anywhere in the value
//! - dag-pb: `Links[].Hash`
//! - dag-json: every `{"/": "<cid>"}` object

use std::collections::BTreeSet;

use bytes::Bytes;
use ipld_core::ipld::Ipld;

use crate::car::{CarWriteError, write_car_bytes};
use crate::cid::{CidError, ContentId, DAG_CBOR, DAG_JSON, DAG_PB, IpldCid, RAW};
use crate::store::{ClusterStore, StoreError};
use crate::varint::decode_uvarint;

/// Errors from exporting a DAG
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ExportError {
    /// Store call failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// A linked block is not in the store
    #[error("linked block {0} is not in the store")]
    #[diagnostic(
        code(export::missing_block),
        help("the DAG was only partially uploaded")
    )]
    MissingBlock(ContentId),

    /// Block bytes do not parse as their codec
    #[error("block {cid} is not valid for its codec: {reason}")]
    #[diagnostic(code(export::decode))]
    Decode {
        /// The block
        cid: ContentId,
        /// What was wrong
        reason: String,
    },

    /// A link names a CID we cannot represent
    #[error("block {cid} links to an invalid CID")]
    #[diagnostic(code(export::invalid_link))]
    InvalidLink {
        /// The linking block
        cid: ContentId,
        /// Underlying CID error
        #[source]
        source: CidError,
    },

    /// No link extraction for this codec
    #[error("block {cid} has codec 0x{codec:x}, links cannot be followed")]
    #[diagnostic(code(export::unsupported_codec))]
    UnsupportedCodec {
        /// The block
        cid: ContentId,
        /// Its codec
        codec: u64,
    },

    /// Encoding the archive failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Write(#[from] CarWriteError),
}

/// Export the DAG under `root` as CAR bytes
///
/// Returns `None` if the root block itself is absent. Blocks are written in
/// depth-first order, root first.
pub async fn export_car<S: ClusterStore>(
    store: &S,
    root: &ContentId,
) -> Result<Option<Vec<u8>>, ExportError> {
    let Some(root_data) = store.get(root).await? else {
        return Ok(None);
    };

    let mut seen = BTreeSet::from([*root]);
    let mut blocks = Vec::new();
    let mut stack = vec![(*root, root_data)];

    while let Some((cid, data)) = stack.pop() {
        let links = block_links(&cid, &data)?;
        blocks.push((cid, data));

        for link in links.into_iter().rev() {
            if seen.contains(&link) {
                continue;
            }
            let data = store
                .get(&link)
                .await?
                .ok_or(ExportError::MissingBlock(link))?;
            seen.insert(link);
            stack.push((link, data));
        }
    }

    tracing::debug!(%root, blocks = blocks.len(), "DAG exported");
    Ok(Some(write_car_bytes(vec![*root], blocks).await?))
}

/// CIDs linked from a block, in the order they appear
pub fn block_links(cid: &ContentId, data: &Bytes) -> Result<Vec<ContentId>, ExportError> {
    let decode = |reason: String| ExportError::Decode { cid: *cid, reason };

    let raw_links = match cid.codec() {
        RAW => return Ok(Vec::new()),
        DAG_CBOR => {
            let value: Ipld =
                serde_ipld_dagcbor::from_slice(data).map_err(|e| decode(e.to_string()))?;
            let mut links = Vec::new();
            collect_ipld_links(&value, &mut links);
            links
        }
        DAG_PB => dag_pb_links(data).map_err(decode)?,
        DAG_JSON => {
            let value: Ipld =
                serde_ipld_dagjson::from_slice(data).map_err(|e| decode(e.to_string()))?;
            let mut links = Vec::new();
            collect_ipld_links(&value, &mut links);
            links
        }
        codec => {
            return Err(ExportError::UnsupportedCodec { cid: *cid, codec });
        }
    };

    raw_links
        .into_iter()
        .map(|link| {
            ContentId::try_from(link)
                .map_err(|source| ExportError::InvalidLink { cid: *cid, source })
        })
        .collect()
}

fn collect_ipld_links(value: &Ipld, out: &mut Vec<IpldCid>) {
    match value {
        Ipld::Link(cid) => out.push(*cid),
        Ipld::List(items) => items.iter().for_each(|item| collect_ipld_links(item, out)),
        Ipld::Map(map) => map.values().for_each(|item| collect_ipld_links(item, out)),
        _ => {}
    }
}

/// Protobuf field reader for dag-pb nodes
///
/// Yields `(field number, bytes)` for length-delimited fields and skips
/// varints. Other wire types do not occur in dag-pb.
fn pb_fields(data: &[u8]) -> Result<Vec<(u64, &[u8])>, String> {
    let mut fields = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (key, n) = decode_uvarint(&data[pos..]).ok_or("truncated field key")?;
        pos += n;
        let field = key >> 3;

        match key & 0x7 {
            0 => {
                let (_, n) = decode_uvarint(&data[pos..]).ok_or("truncated varint field")?;
                pos += n;
            }
            2 => {
                let (len, n) = decode_uvarint(&data[pos..]).ok_or("truncated field length")?;
                pos += n;
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| pos.checked_add(len))
                    .filter(|end| *end <= data.len())
                    .ok_or_else(|| format!("field {} overruns the node", field))?;
                fields.push((field, &data[pos..end]));
                pos = end;
            }
            wire => return Err(format!("unexpected wire type {} for field {}", wire, field)),
        }
    }

    Ok(fields)
}

fn dag_pb_links(data: &[u8]) -> Result<Vec<IpldCid>, String> {
    let mut links = Vec::new();
    // PBNode { 2: Links (repeated PBLink), 1: Data }
    for (field, body) in pb_fields(data)? {
        if field != 2 {
            continue;
        }
        // PBLink { 1: Hash, 2: Name, 3: Tsize }
        let hash = pb_fields(body)?
            .into_iter()
            .find(|(f, _)| *f == 1)
            .map(|(_, hash)| hash)
            .ok_or("link without Hash")?;
        let cid = IpldCid::read_bytes(hash).map_err(|e| e.to_string())?;
        links.push(cid);
    }
    Ok(links)
}
