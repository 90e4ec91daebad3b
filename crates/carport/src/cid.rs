//! Content identifiers
//!
//! [`ContentId`] wraps an IPLD CID whose multihash has already been checked
//! against the closed [`HashAlgorithm`] set: the algorithm tag is recognised and
//! the digest has the length that algorithm produces. Nothing downstream ever
//! dispatches on a raw multihash code.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

pub use ::cid::Cid as IpldCid;
use ::cid::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Visitor};

use crate::verify::{IntegrityError, compute_digest};

/// raw
pub const RAW: u64 = 0x55;

/// dag-pb
pub const DAG_PB: u64 = 0x70;

/// dag-cbor
pub const DAG_CBOR: u64 = 0x71;

/// dag-json
pub const DAG_JSON: u64 = 0x0129;

/// Multicodec name for a codec, as used by IPFS RPC parameters
pub fn codec_name(codec: u64) -> Option<&'static str> {
    match codec {
        RAW => Some("raw"),
        DAG_PB => Some("dag-pb"),
        DAG_CBOR => Some("dag-cbor"),
        DAG_JSON => Some("dag-json"),
        _ => None,
    }
}

/// Multihash functions a CID may name
///
/// Recognising an algorithm only means its digest length is known. Whether the
/// verifier can recompute it is a separate question, see
/// [`HashAlgorithm::is_implemented`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    /// sha1 (0x11)
    Sha1,
    /// sha2-256 (0x12)
    Sha2_256,
    /// sha2-512 (0x13)
    Sha2_512,
    /// sha3-512 (0x14)
    Sha3_512,
    /// sha3-384 (0x15)
    Sha3_384,
    /// sha3-256 (0x16)
    Sha3_256,
    /// sha3-224 (0x17)
    Sha3_224,
    /// keccak-256 (0x1b)
    Keccak256,
    /// blake3 (0x1e), default 32-byte output
    Blake3,
    /// sha2-384 (0x20)
    Sha2_384,
    /// blake2b-256 (0xb220)
    Blake2b256,
    /// blake2b-512 (0xb240)
    Blake2b512,
}

impl HashAlgorithm {
    /// Look up a multihash code
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0x11 => Self::Sha1,
            0x12 => Self::Sha2_256,
            0x13 => Self::Sha2_512,
            0x14 => Self::Sha3_512,
            0x15 => Self::Sha3_384,
            0x16 => Self::Sha3_256,
            0x17 => Self::Sha3_224,
            0x1b => Self::Keccak256,
            0x1e => Self::Blake3,
            0x20 => Self::Sha2_384,
            0xb220 => Self::Blake2b256,
            0xb240 => Self::Blake2b512,
            _ => return None,
        })
    }

    /// The multihash code
    pub fn code(self) -> u64 {
        match self {
            Self::Sha1 => 0x11,
            Self::Sha2_256 => 0x12,
            Self::Sha2_512 => 0x13,
            Self::Sha3_512 => 0x14,
            Self::Sha3_384 => 0x15,
            Self::Sha3_256 => 0x16,
            Self::Sha3_224 => 0x17,
            Self::Keccak256 => 0x1b,
            Self::Blake3 => 0x1e,
            Self::Sha2_384 => 0x20,
            Self::Blake2b256 => 0xb220,
            Self::Blake2b512 => 0xb240,
        }
    }

    /// Digest length in bytes
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha3_224 => 28,
            Self::Sha2_256 | Self::Sha3_256 | Self::Keccak256 | Self::Blake3 | Self::Blake2b256 => {
                32
            }
            Self::Sha2_384 | Self::Sha3_384 => 48,
            Self::Sha2_512 | Self::Sha3_512 | Self::Blake2b512 => 64,
        }
    }

    /// Multihash table name
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha2_256 => "sha2-256",
            Self::Sha2_512 => "sha2-512",
            Self::Sha3_512 => "sha3-512",
            Self::Sha3_384 => "sha3-384",
            Self::Sha3_256 => "sha3-256",
            Self::Sha3_224 => "sha3-224",
            Self::Keccak256 => "keccak-256",
            Self::Blake3 => "blake3",
            Self::Sha2_384 => "sha2-384",
            Self::Blake2b256 => "blake2b-256",
            Self::Blake2b512 => "blake2b-512",
        }
    }

    /// Whether the verifier can recompute this digest
    pub fn is_implemented(self) -> bool {
        matches!(self, Self::Sha2_256 | Self::Sha2_384 | Self::Sha2_512)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// CID parsing errors
///
/// Binary and text failures are separate variants so the API boundary can tell a
/// corrupt archive apart from a bad identifier typed into a URL.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CidError {
    /// Binary CID could not be decoded
    #[error("malformed CID: {reason}")]
    #[diagnostic(
        code(cid::malformed),
        help("a binary CID is a version varint, a codec varint and a multihash")
    )]
    Malformed {
        /// What was wrong
        reason: String,
        /// Underlying decode error
        #[source]
        source: Option<::cid::Error>,
    },

    /// Text CID could not be decoded
    #[error("invalid CID text {text:?}: {reason}")]
    #[diagnostic(
        code(cid::invalid_text),
        help("CIDv1 is multibase text such as `bafk...`, CIDv0 is base58btc `Qm...`")
    )]
    InvalidText {
        /// The rejected input
        text: String,
        /// What was wrong
        reason: String,
    },
}

impl CidError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
            source: None,
        }
    }
}

/// A validated content identifier
///
/// Equality, ordering and hashing cover all four fields (version, codec, hash
/// algorithm, digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId {
    cid: IpldCid,
    algorithm: HashAlgorithm,
}

impl ContentId {
    /// Build a CIDv1 over `data`
    ///
    /// Only implemented algorithms can be used here, since the digest has to be
    /// computed.
    pub fn for_data(
        codec: u64,
        algorithm: HashAlgorithm,
        data: &[u8],
    ) -> Result<Self, IntegrityError> {
        let digest = compute_digest(algorithm, data)
            .ok_or(IntegrityError::UnsupportedHashAlgorithm { algorithm })?;
        let mh = ::cid::multihash::Multihash::<64>::wrap(algorithm.code(), &digest)
            .map_err(|_| IntegrityError::UnsupportedHashAlgorithm { algorithm })?;
        Ok(Self {
            cid: IpldCid::new_v1(codec, mh),
            algorithm,
        })
    }

    /// CID version, 0 or 1
    pub fn version(&self) -> u64 {
        match self.cid.version() {
            Version::V0 => 0,
            Version::V1 => 1,
        }
    }

    /// Multicodec of the payload
    pub fn codec(&self) -> u64 {
        self.cid.codec()
    }

    /// Hash function named by the multihash
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Digest bytes carried by the multihash
    pub fn digest(&self) -> &[u8] {
        self.cid.hash().digest()
    }

    /// The underlying IPLD CID
    pub fn as_ipld(&self) -> &IpldCid {
        &self.cid
    }

    /// Binary encoding, see [`encode_cid`]
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_cid(self)
    }

    /// Text form: base32-lower multibase for CIDv1, base58btc for CIDv0
    pub fn to_text(&self) -> String {
        self.cid.to_string()
    }

    /// Parse the text form
    pub fn from_text(text: &str) -> Result<Self, CidError> {
        let cid = IpldCid::try_from(text).map_err(|e| CidError::InvalidText {
            text: text.to_string(),
            reason: e.to_string(),
        })?;
        Self::try_from(cid).map_err(|e| CidError::InvalidText {
            text: text.to_string(),
            reason: match e {
                CidError::Malformed { reason, .. } => reason,
                CidError::InvalidText { reason, .. } => reason,
            },
        })
    }
}

impl TryFrom<IpldCid> for ContentId {
    type Error = CidError;

    fn try_from(cid: IpldCid) -> Result<Self, Self::Error> {
        let code = cid.hash().code();
        let algorithm = HashAlgorithm::from_code(code).ok_or_else(|| {
            CidError::malformed(format!("unrecognised hash algorithm 0x{:x}", code))
        })?;
        let len = cid.hash().digest().len();
        if len != algorithm.digest_len() {
            return Err(CidError::malformed(format!(
                "{} digest is {} bytes, expected {}",
                algorithm,
                len,
                algorithm.digest_len()
            )));
        }
        Ok(Self { cid, algorithm })
    }
}

impl From<ContentId> for IpldCid {
    fn from(value: ContentId) -> Self {
        value.cid
    }
}

/// Decode a binary CID starting at `offset`
///
/// Returns the CID and the number of bytes it occupied.
pub fn decode_cid(bytes: &[u8], offset: usize) -> Result<(ContentId, usize), CidError> {
    let input = bytes.get(offset..).ok_or_else(|| {
        CidError::malformed(format!("offset {} past end of {} bytes", offset, bytes.len()))
    })?;
    if input.is_empty() {
        return Err(CidError::malformed("no bytes"));
    }

    let mut cursor = Cursor::new(input);
    let cid = IpldCid::read_bytes(&mut cursor).map_err(|e| CidError::Malformed {
        reason: e.to_string(),
        source: Some(e),
    })?;
    let consumed = cursor.position() as usize;

    Ok((ContentId::try_from(cid)?, consumed))
}

/// Encode a CID to its binary form
pub fn encode_cid(cid: &ContentId) -> Vec<u8> {
    cid.cid.to_bytes()
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cid, f)
    }
}

impl FromStr for ContentId {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}

impl Serialize for ContentId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_text())
        } else {
            self.cid.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        if deserializer.is_human_readable() {
            struct TextVisitor;

            impl Visitor<'_> for TextVisitor {
                type Value = ContentId;

                fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                    formatter.write_str("a CID string")
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                where
                    E: Error,
                {
                    ContentId::from_text(v).map_err(E::custom)
                }
            }

            deserializer.deserialize_str(TextVisitor)
        } else {
            let cid = IpldCid::deserialize(deserializer)?;
            ContentId::try_from(cid).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_CID: &str = "bafkreidvbhs33ighmljlvr7zbv2ywwzcmp5adtf4kqvlly67cy56bdtmve";

    fn raw_cid(data: &[u8]) -> ContentId {
        ContentId::for_data(RAW, HashAlgorithm::Sha2_256, data).unwrap()
    }

    #[test]
    fn test_hello_world_raw_leaf() {
        let cid = raw_cid(b"hello world!");
        assert_eq!(cid.to_text(), HELLO_CID);
        assert_eq!(cid.version(), 1);
        assert_eq!(cid.codec(), RAW);
        assert_eq!(cid.hash_algorithm(), HashAlgorithm::Sha2_256);
        assert_eq!(cid.digest().len(), 32);
    }

    #[test]
    fn test_binary_roundtrip_with_offset() {
        let cid = raw_cid(b"roundtrip");
        let mut buf = vec![0xde, 0xad];
        buf.extend_from_slice(&encode_cid(&cid));
        buf.extend_from_slice(b"trailing payload");

        let (decoded, consumed) = decode_cid(&buf, 2).unwrap();
        assert_eq!(decoded, cid);
        assert_eq!(consumed, encode_cid(&cid).len());
    }

    #[test]
    fn test_cidv0_roundtrip() {
        let v1 = ContentId::for_data(DAG_PB, HashAlgorithm::Sha2_256, b"node").unwrap();
        let v0 = IpldCid::new_v0(*v1.as_ipld().hash()).unwrap();
        let cid = ContentId::try_from(v0).unwrap();

        assert_eq!(cid.version(), 0);
        assert!(cid.to_text().starts_with("Qm"));
        let (decoded, consumed) = decode_cid(&cid.to_bytes(), 0).unwrap();
        assert_eq!(decoded, cid);
        assert_eq!(consumed, 34);
        assert_eq!(ContentId::from_text(&cid.to_text()).unwrap(), cid);
    }

    #[test]
    fn test_text_roundtrip() {
        let cid = raw_cid(b"text");
        let parsed: ContentId = cid.to_text().parse().unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(ContentId::from_text(HELLO_CID).unwrap(), raw_cid(b"hello world!"));
    }

    #[test]
    fn test_truncated_binary_is_malformed() {
        let bytes = raw_cid(b"truncate me").to_bytes();
        for len in [0, 1, 3, bytes.len() - 1] {
            let err = decode_cid(&bytes[..len], 0).unwrap_err();
            assert!(matches!(err, CidError::Malformed { .. }), "len {}: {:?}", len, err);
        }
        assert!(matches!(
            decode_cid(&bytes, bytes.len() + 1),
            Err(CidError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_hash_is_malformed() {
        // CIDv1, raw, multihash code 0x99 with a 4 byte digest
        let bytes = [0x01, 0x55, 0x99, 0x01, 0x04, 1, 2, 3, 4];
        let err = decode_cid(&bytes, 0).unwrap_err();
        assert!(matches!(err, CidError::Malformed { .. }));
        assert!(err.to_string().contains("0x99"));
    }

    #[test]
    fn test_identity_hash_is_malformed() {
        let bytes = [0x01, 0x55, 0x00, 0x03, b'a', b'b', b'c'];
        assert!(matches!(
            decode_cid(&bytes, 0),
            Err(CidError::Malformed { .. })
        ));
    }

    #[test]
    fn test_short_digest_for_algorithm_is_malformed() {
        // sha2-256 claiming a 4 byte digest
        let bytes = [0x01, 0x55, 0x12, 0x04, 1, 2, 3, 4];
        let err = decode_cid(&bytes, 0).unwrap_err();
        assert!(err.to_string().contains("expected 32"));
    }

    #[test]
    fn test_text_errors_are_distinct() {
        for bad in ["", "bafkreieq", "not a cid", "zzzz"] {
            let err = ContentId::from_text(bad).unwrap_err();
            assert!(matches!(err, CidError::InvalidText { .. }), "{:?}", bad);
        }
    }

    #[test]
    fn test_recognised_but_unimplemented() {
        let sha1 = HashAlgorithm::from_code(0x11).unwrap();
        assert_eq!(sha1.digest_len(), 20);
        assert!(!sha1.is_implemented());
        assert!(HashAlgorithm::Sha2_512.is_implemented());
        assert!(HashAlgorithm::from_code(0x00).is_none());
        assert!(ContentId::for_data(RAW, HashAlgorithm::Blake3, b"x").is_err());
    }

    #[test]
    fn test_json_uses_text_form() {
        let cid = raw_cid(b"hello world!");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO_CID));
        let back: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
    }

    #[test]
    fn test_dagcbor_uses_link_form() {
        let cid = raw_cid(b"link");
        let cbor = serde_ipld_dagcbor::to_vec(&cid).unwrap();
        let back: ContentId = serde_ipld_dagcbor::from_slice(&cbor).unwrap();
        assert_eq!(back, cid);
    }
}
