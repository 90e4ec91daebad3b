//! CAR ingest primitives
//!
//! This crate provides the pieces needed to accept a content-addressed archive
//! (CAR) from an untrusted client and hand it to a block store:
//!
//! - **CIDs**: binary and text codecs for content identifiers, with the hash
//!   algorithm checked against a closed set before it is ever used
//! - **CAR decoding**: streaming header and block decoders that read one frame at a
//!   time and enforce frame size limits before allocating
//! - **Verification**: per-block digest checks and root coverage tracking
//! - **Ingest**: the orchestrator that verifies, forwards and pins an archive as one
//!   atomic decision
//! - **Storage**: the `ClusterStore` abstraction with in-memory and HTTP cluster
//!   implementations, plus DAG export back into CAR form
//!
//! # Example
//!
//! ```rust,ignore
//! use carport::{IngestOptions, MemoryClusterStore, ingest};
//!
//! # async fn example(body: &[u8]) {
//! let store = MemoryClusterStore::new();
//! let options = IngestOptions::new().concurrency(4).build();
//!
//! let result = ingest(body, &options, &store).await;
//! if result.accepted {
//!     println!("pinned {}", result.root_cid.unwrap());
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CAR (Content Addressable aRchive) decoding and encoding
pub mod car;
pub mod cid;
pub mod error;
pub mod export;
pub mod ingest;
/// Block store abstraction
pub mod store;
pub mod varint;
pub mod verify;

pub use crate::cid::{ContentId, HashAlgorithm};
pub use car::{Block, BlockDecoder, CarHeader};
pub use error::{Failure, FailureCategory, FailureKind, IngestError};
pub use export::export_car;
pub use ingest::{IngestOptions, IngestResult, ingest};
#[cfg(feature = "cluster-client")]
pub use store::HttpClusterStore;
pub use store::{ClusterStore, MemoryClusterStore, StoreError};
pub use verify::verify;
