//! Ingest error taxonomy
//!
//! Module-level errors ([`CarError`], [`IntegrityError`], [`StoreError`]) are
//! granular enums. At the ingest boundary they collapse into [`IngestError`],
//! which carries a [`FailureKind`] plus the block index it happened at, and
//! from there into the serialisable [`Failure`] reported to clients.

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::car::CarError;
use crate::cid::ContentId;
use crate::store::StoreError;
use crate::verify::IntegrityError;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Why an archive was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Header frame missing or not a `{version, roots}` map
    MalformedHeader,
    /// Header version other than 1
    UnsupportedVersion,
    /// Stream ended inside a frame
    TruncatedFrame,
    /// Frame larger than the configured limit
    OversizedFrame,
    /// Block frame does not start with a valid CID
    MalformedCid,
    /// Payload does not hash to its CID
    HashMismatch,
    /// CID names a hash the verifier cannot compute
    UnsupportedHashAlgorithm,
    /// A declared root never appeared as a block
    MissingRoot,
    /// First root differs from the one the caller asked for
    RootMismatch,
    /// The cluster rejected or could not be reached for a put or pin
    StoreUnavailable,
    /// The ingest deadline expired
    IngestTimeout,
    /// The request body could not be read
    ReadFailed,
}

/// Coarse grouping of [`FailureKind`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    /// The archive bytes are not a well-formed CARv1
    Structural,
    /// Blocks do not match their identifiers
    Integrity,
    /// Well-formed and intact, but not acceptable
    Policy,
    /// Something other than the archive went wrong
    Infrastructure,
}

impl FailureKind {
    /// Which group this kind belongs to
    pub fn category(self) -> FailureCategory {
        match self {
            Self::MalformedHeader
            | Self::UnsupportedVersion
            | Self::TruncatedFrame
            | Self::OversizedFrame
            | Self::MalformedCid => FailureCategory::Structural,
            Self::HashMismatch | Self::UnsupportedHashAlgorithm => FailureCategory::Integrity,
            Self::MissingRoot | Self::RootMismatch => FailureCategory::Policy,
            Self::StoreUnavailable | Self::IngestTimeout | Self::ReadFailed => {
                FailureCategory::Infrastructure
            }
        }
    }

    /// Whether resubmitting the same archive might succeed
    pub fn is_retryable(self) -> bool {
        self.category() == FailureCategory::Infrastructure
    }

    /// Variant name, as serialised
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedHeader => "MalformedHeader",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::TruncatedFrame => "TruncatedFrame",
            Self::OversizedFrame => "OversizedFrame",
            Self::MalformedCid => "MalformedCid",
            Self::HashMismatch => "HashMismatch",
            Self::UnsupportedHashAlgorithm => "UnsupportedHashAlgorithm",
            Self::MissingRoot => "MissingRoot",
            Self::RootMismatch => "RootMismatch",
            Self::StoreUnavailable => "StoreUnavailable",
            Self::IngestTimeout => "IngestTimeout",
            Self::ReadFailed => "ReadFailed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing description of a rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// What went wrong
    pub kind: FailureKind,
    /// Human readable detail
    pub message: String,
    /// Zero-based block the failure is attributed to, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub block_index: Option<u64>,
}

/// Ingest failure with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct IngestError {
    kind: FailureKind,
    block_index: Option<u64>,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

impl IngestError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: FailureKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            block_index: None,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attribute the error to a block
    pub fn at_block(mut self, index: u64) -> Self {
        self.block_index = Some(index);
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Block the error is attributed to
    pub fn block_index(&self) -> Option<u64> {
        self.block_index
    }

    // Constructors for kinds without a lower-level source

    /// The deadline expired
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(FailureKind::IngestTimeout, None)
            .with_context(format!("ingest did not finish within {:?}", after))
            .with_help("the archive may be resubmitted")
    }

    /// Declared roots absent from the block stream
    pub fn missing_root(missing: &[ContentId]) -> Self {
        let list = missing
            .iter()
            .map(ContentId::to_text)
            .collect::<Vec<_>>()
            .join(", ");
        Self::new(FailureKind::MissingRoot, None)
            .with_context(format!("declared roots not present in archive: {}", list))
            .with_help("every root named in the header must also appear as a block")
    }

    /// First root differs from the expected one
    pub fn root_mismatch(expected: &ContentId, found: Option<&ContentId>) -> Self {
        let found = found
            .map(ContentId::to_text)
            .unwrap_or_else(|| "no roots".to_string());
        Self::new(FailureKind::RootMismatch, None)
            .with_context(format!("expected root {}, archive declares {}", expected, found))
    }

    /// Human readable message without the kind prefix
    pub fn message(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ctx) = &self.context {
            parts.push(ctx.clone());
        }
        if let Some(src) = &self.source {
            parts.push(src.to_string());
        }
        if parts.is_empty() {
            self.kind.to_string()
        } else {
            parts.join(": ")
        }
    }

    /// Client-facing summary
    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind,
            message: self.message(),
            block_index: self.block_index,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(index) = self.block_index {
            write!(f, " at block {}", index)?;
        }

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

impl From<CarError> for IngestError {
    fn from(e: CarError) -> Self {
        let kind = match &e {
            CarError::MalformedHeader { .. } => FailureKind::MalformedHeader,
            CarError::UnsupportedVersion(_) => FailureKind::UnsupportedVersion,
            CarError::TruncatedFrame { .. } => FailureKind::TruncatedFrame,
            CarError::OversizedFrame { .. } | CarError::LengthOverflow { .. } => {
                FailureKind::OversizedFrame
            }
            CarError::MalformedCid { .. } => FailureKind::MalformedCid,
            CarError::Io(_) => FailureKind::ReadFailed,
        };
        let index = e.frame().and_then(|frame| frame.block_index());
        let err = Self::new(kind, Some(Box::new(e)));
        match index {
            Some(index) => err.at_block(index),
            None => err,
        }
    }
}

impl From<IntegrityError> for IngestError {
    fn from(e: IntegrityError) -> Self {
        let kind = match &e {
            IntegrityError::HashMismatch { .. } => FailureKind::HashMismatch,
            IntegrityError::UnsupportedHashAlgorithm { .. } => {
                FailureKind::UnsupportedHashAlgorithm
            }
        };
        Self::new(kind, Some(Box::new(e)))
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        Self::new(FailureKind::StoreUnavailable, Some(Box::new(e)))
            .with_help("the cluster did not accept the request; the archive may be resubmitted")
    }
}
