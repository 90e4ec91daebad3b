//! Block store abstraction
//!
//! A [`ClusterStore`] is the replicated store verified blocks are forwarded to.
//! Ingest only needs `put` and `pin`; retrieval uses `get`, `has` and
//! `is_pinned`.

use bytes::Bytes;

use crate::cid::ContentId;
use crate::error::BoxError;

#[cfg(feature = "cluster-client")]
pub mod cluster;
pub mod memory;

#[cfg(feature = "cluster-client")]
pub use cluster::HttpClusterStore;
pub use memory::MemoryClusterStore;

/// Errors from talking to a block store
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StoreError {
    /// The request never got a response
    #[error("cluster request failed: {0}")]
    #[diagnostic(code(store::transport), help("check that the cluster is reachable"))]
    Transport(#[source] BoxError),

    /// The cluster answered with an error status
    #[error("{endpoint} returned {status}: {body}")]
    #[diagnostic(code(store::status))]
    Status {
        /// Which call
        endpoint: String,
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The cluster stored the block under a different multihash
    #[error("cluster stored {expected} as {stored}")]
    #[diagnostic(
        code(store::cid_mismatch),
        help("the cluster recomputed a different hash for the block")
    )]
    CidMismatch {
        /// CID the block was sent as
        expected: ContentId,
        /// Key the cluster reported
        stored: String,
    },

    /// A response body could not be decoded
    #[error("unexpected response from cluster: {0}")]
    #[diagnostic(code(store::decode))]
    Decode(#[source] BoxError),

    /// Pin requested for a block the store does not hold
    #[error("block {0} not present in store")]
    #[diagnostic(code(store::missing_block))]
    MissingBlock(ContentId),

    /// The cluster RPC has no name for this codec
    #[error("codec 0x{0:x} cannot be sent to the cluster")]
    #[diagnostic(code(store::unsupported_codec))]
    UnsupportedCodec(u64),
}

/// Async block store trait
///
/// Clone is required so ingest can hand a handle to each concurrent job.
/// Implementations must be safe to call concurrently.
///
/// # Example
///
/// ```rust,ignore
/// use carport::store::{ClusterStore, MemoryClusterStore};
///
/// # use carport::{ContentId, StoreError};
/// # async fn example(cid: ContentId, data: bytes::Bytes) -> Result<(), StoreError> {
/// let store = MemoryClusterStore::new();
/// store.put(&cid, data).await?;
/// store.pin(&cid).await?;
/// assert!(store.is_pinned(&cid).await?);
/// # Ok(())
/// # }
/// ```
#[trait_variant::make(Send)]
pub trait ClusterStore: Clone {
    /// Store a verified block under its CID
    ///
    /// Storing the same block twice is not an error.
    async fn put(&self, cid: &ContentId, data: Bytes) -> Result<(), StoreError>;

    /// Pin a DAG by its root
    async fn pin(&self, root: &ContentId) -> Result<(), StoreError>;

    /// Fetch a block
    ///
    /// Returns `None` if the block is not held.
    async fn get(&self, cid: &ContentId) -> Result<Option<Bytes>, StoreError>;

    /// Check for a block without fetching it
    async fn has(&self, cid: &ContentId) -> Result<bool, StoreError>;

    /// Whether a root is pinned
    async fn is_pinned(&self, root: &ContentId) -> Result<bool, StoreError>;
}
