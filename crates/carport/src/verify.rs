//! Block integrity verification
//!
//! A block's CID is a claim about its payload. [`verify`] recomputes the digest
//! named by the CID and compares; [`RootTracker`] checks that the roots an
//! archive declares actually show up among its blocks.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::car::Block;
use crate::cid::{ContentId, HashAlgorithm};

/// Errors from checking a block against its CID
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum IntegrityError {
    /// Payload does not hash to the CID's digest
    #[error("hash mismatch for {cid}: payload hashes to {computed}")]
    #[diagnostic(
        code(verify::hash_mismatch),
        help("the block's bytes were altered, or its CID was computed over different bytes")
    )]
    HashMismatch {
        /// The CID the block claimed
        cid: ContentId,
        /// Hex of the digest actually computed
        computed: String,
    },

    /// The CID names a hash function the verifier does not implement
    #[error("hash algorithm {algorithm} is not supported for verification")]
    #[diagnostic(
        code(verify::unsupported_hash),
        help("blocks must be hashed with sha2-256, sha2-384 or sha2-512")
    )]
    UnsupportedHashAlgorithm {
        /// The algorithm named by the CID
        algorithm: HashAlgorithm,
    },
}

/// Compute a digest with an implemented algorithm
///
/// Returns `None` for every algorithm not explicitly listed.
pub fn compute_digest(algorithm: HashAlgorithm, data: &[u8]) -> Option<Vec<u8>> {
    match algorithm {
        HashAlgorithm::Sha2_256 => Some(Sha256::digest(data).to_vec()),
        HashAlgorithm::Sha2_384 => Some(Sha384::digest(data).to_vec()),
        HashAlgorithm::Sha2_512 => Some(Sha512::digest(data).to_vec()),
        _ => None,
    }
}

/// Check that a block's payload hashes to the digest in its CID
pub fn verify(block: &Block) -> Result<(), IntegrityError> {
    let algorithm = block.cid.hash_algorithm();
    let computed = compute_digest(algorithm, &block.data)
        .ok_or(IntegrityError::UnsupportedHashAlgorithm { algorithm })?;

    if computed.as_slice() != block.cid.digest() {
        return Err(IntegrityError::HashMismatch {
            cid: block.cid,
            computed: hex::encode(&computed),
        });
    }
    Ok(())
}

/// Tracks which declared roots have been seen as block CIDs
///
/// Coverage can only be decided once the block stream has ended.
#[derive(Debug, Clone, Default)]
pub struct RootTracker {
    pending: BTreeSet<ContentId>,
}

impl RootTracker {
    /// Start tracking the given roots
    pub fn new(roots: &[ContentId]) -> Self {
        Self {
            pending: roots.iter().copied().collect(),
        }
    }

    /// Record a block CID
    pub fn observe(&mut self, cid: &ContentId) {
        self.pending.remove(cid);
    }

    /// Roots not yet observed, in CID order
    pub fn missing(&self) -> Vec<ContentId> {
        self.pending.iter().copied().collect()
    }

    /// Whether every root has been observed
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::{DAG_CBOR, RAW};
    use bytes::Bytes;

    fn block(data: &'static [u8]) -> Block {
        let cid = ContentId::for_data(RAW, HashAlgorithm::Sha2_256, data).unwrap();
        Block {
            cid,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_valid_block_verifies() {
        assert_eq!(verify(&block(b"hello world!")), Ok(()));
    }

    #[test]
    fn test_every_single_byte_flip_is_detected() {
        let original = block(b"a payload of moderate length");
        for i in 0..original.data.len() {
            for bit in [0x01u8, 0x80] {
                let mut data = original.data.to_vec();
                data[i] ^= bit;
                let tampered = Block {
                    cid: original.cid,
                    data: Bytes::from(data),
                };
                assert!(
                    matches!(verify(&tampered), Err(IntegrityError::HashMismatch { .. })),
                    "flip at byte {} bit {:#x} not detected",
                    i,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_other_sha2_widths() {
        for algorithm in [HashAlgorithm::Sha2_384, HashAlgorithm::Sha2_512] {
            let data = b"wider digests";
            let cid = ContentId::for_data(DAG_CBOR, algorithm, data).unwrap();
            assert_eq!(cid.digest().len(), algorithm.digest_len());
            let block = Block {
                cid,
                data: Bytes::from_static(data),
            };
            assert_eq!(verify(&block), Ok(()));
        }
    }

    #[test]
    fn test_recognised_unimplemented_algorithm_is_rejected() {
        // CIDv1 raw with a well-formed 32 byte blake3 multihash
        let mut bytes = vec![0x01, 0x55, 0x1e, 0x20];
        bytes.extend_from_slice(&[7u8; 32]);
        let (cid, _) = crate::cid::decode_cid(&bytes, 0).unwrap();
        let block = Block {
            cid,
            data: Bytes::from_static(b"anything"),
        };

        assert_eq!(
            verify(&block),
            Err(IntegrityError::UnsupportedHashAlgorithm {
                algorithm: HashAlgorithm::Blake3
            })
        );
    }

    #[test]
    fn test_mismatch_reports_computed_digest() {
        let good = block(b"one");
        let other = block(b"two");
        let swapped = Block {
            cid: good.cid,
            data: other.data.clone(),
        };
        match verify(&swapped) {
            Err(IntegrityError::HashMismatch { cid, computed }) => {
                assert_eq!(cid, good.cid);
                assert_eq!(computed, hex::encode(other.cid.digest()));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_root_tracker() {
        let a = block(b"a").cid;
        let b = block(b"b").cid;
        let c = block(b"c").cid;

        let mut tracker = RootTracker::new(&[a, b]);
        assert!(!tracker.is_complete());
        tracker.observe(&c);
        tracker.observe(&a);
        assert_eq!(tracker.missing(), vec![b]);
        tracker.observe(&b);
        tracker.observe(&b);
        assert!(tracker.is_complete());

        assert!(RootTracker::new(&[]).is_complete());
    }
}
