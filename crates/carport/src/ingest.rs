//! Ingest orchestrator
//!
//! [`ingest`] drives one archive from bytes to a pinned DAG:
//!
//! 1. decode the header (and check it against an expected root, if given)
//! 2. read block frames one at a time; each block is verified and `put` to
//!    the store as a job on a bounded [`JoinSet`]
//! 3. once the stream ends and every job has finished, check root coverage
//! 4. pin the first root
//!
//! The outcome is a single accept/reject decision. When several blocks fail the
//! one with the lowest index is reported, whatever order the jobs finished in:
//! jobs for later blocks are aborted, earlier ones are still awaited since they
//! could fail with a lower index.

use std::collections::BTreeMap;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, BufReader};
use tokio::task::{AbortHandle, JoinSet};

use crate::car::{self, Block, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_HEADER_SIZE, DecodeLimits};
use crate::cid::ContentId;
use crate::error::{Failure, FailureKind, IngestError};
use crate::store::ClusterStore;
use crate::verify::{RootTracker, verify};

/// Default number of blocks verified and forwarded at once
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Options for one ingest call
///
/// - `max_frame_size` / `max_header_size`: largest frame accepted, checked
///   against the length prefix before any allocation.
/// - `require_all_roots_present`: every declared root must appear as a block
///   (default true).
/// - `concurrency`: blocks in flight at once; 1 makes ingest strictly
///   sequential.
/// - `deadline`: bound on the whole call, including the pin.
/// - `expected_root`: if set, the first declared root must equal it.
/// - `caller`: authenticated identity, recorded in logs only.
#[derive(Debug, Clone, Builder)]
#[builder(start_fn = new)]
pub struct IngestOptions {
    /// Largest block frame accepted
    #[builder(default = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: u64,
    /// Largest header frame accepted
    #[builder(default = DEFAULT_MAX_HEADER_SIZE)]
    pub max_header_size: u64,
    /// Reject archives whose declared roots are not all present
    #[builder(default = true)]
    pub require_all_roots_present: bool,
    /// Blocks verified and forwarded concurrently
    #[builder(default = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
    /// Overall time limit
    pub deadline: Option<Duration>,
    /// Root the archive must declare first
    pub expected_root: Option<ContentId>,
    /// Who is uploading
    #[builder(into)]
    pub caller: Option<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

impl IngestOptions {
    fn limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_header_size: self.max_header_size,
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Outcome of one ingest call
///
/// `block_count` and `byte_count` count blocks verified and stored (payload
/// bytes only). On rejection they describe how far ingest got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    /// Whether the archive was accepted and pinned
    pub accepted: bool,
    /// First declared root, if the header was decoded and has one
    pub root_cid: Option<ContentId>,
    /// Blocks stored
    pub block_count: u64,
    /// Payload bytes stored
    pub byte_count: u64,
    /// Why the archive was rejected
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<Failure>,
}

impl IngestResult {
    /// Kind of the failure, if rejected
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

#[derive(Debug, Default)]
struct Progress {
    root: Option<ContentId>,
    block_count: u64,
    byte_count: u64,
}

/// Verify, forward and pin one archive
///
/// Never returns an error: every failure is reported in the result with
/// `accepted: false`. Dropping the returned future aborts any in-flight jobs.
#[tracing::instrument(skip_all, fields(caller = options.caller.as_deref().unwrap_or("anonymous")))]
pub async fn ingest<R, S>(reader: R, options: &IngestOptions, store: &S) -> IngestResult
where
    R: AsyncRead + Unpin + Send,
    S: ClusterStore + Send + Sync + 'static,
{
    let mut progress = Progress::default();

    let outcome = match options.deadline {
        Some(deadline) => {
            match tokio::time::timeout(deadline, run(reader, options, store, &mut progress)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(IngestError::timeout(deadline)),
            }
        }
        None => run(reader, options, store, &mut progress).await,
    };

    let failure = match outcome {
        Ok(()) => {
            tracing::info!(
                root = progress.root.as_ref().map(tracing::field::display),
                blocks = progress.block_count,
                bytes = progress.byte_count,
                "archive accepted"
            );
            None
        }
        Err(err) => {
            tracing::warn!(
                kind = %err.kind(),
                block = err.block_index(),
                blocks = progress.block_count,
                error = %err,
                "archive rejected"
            );
            Some(err.to_failure())
        }
    };

    IngestResult {
        accepted: failure.is_none(),
        root_cid: progress.root,
        block_count: progress.block_count,
        byte_count: progress.byte_count,
        failure,
    }
}

async fn run<R, S>(
    reader: R,
    options: &IngestOptions,
    store: &S,
    progress: &mut Progress,
) -> Result<(), IngestError>
where
    R: AsyncRead + Unpin + Send,
    S: ClusterStore + Send + Sync + 'static,
{
    let (header, mut decoder) = car::open(BufReader::new(reader), &options.limits()).await?;
    progress.root = header.root().copied();
    tracing::debug!(roots = header.roots.len(), "header decoded");

    if let Some(expected) = &options.expected_root {
        if header.root() != Some(expected) {
            return Err(IngestError::root_mismatch(expected, header.root()));
        }
    }

    let mut tracker = RootTracker::new(&header.roots);
    let mut forwarder = Forwarder::new(store.clone(), options.concurrency, progress);

    while !forwarder.has_failed() {
        match decoder.next_block().await {
            Ok(Some(block)) => {
                let index = decoder.next_index() - 1;
                tracker.observe(&block.cid);
                forwarder.dispatch(index, block).await;
            }
            Ok(None) => break,
            Err(e) => {
                let err = IngestError::from(e);
                let index = err.block_index().unwrap_or(decoder.next_index());
                forwarder.fail(index, err);
            }
        }
    }

    forwarder.drain().await;
    if let Some(err) = forwarder.into_failure() {
        return Err(err);
    }

    if options.require_all_roots_present && !tracker.is_complete() {
        return Err(IngestError::missing_root(&tracker.missing()));
    }

    if let Some(root) = header.root() {
        store
            .pin(root)
            .await
            .map_err(|e| IngestError::from(e).with_context(format!("pinning {}", root)))?;
    }

    Ok(())
}

/// Verify a block and hand it to the store
async fn forward<S: ClusterStore>(store: &S, index: u64, block: Block) -> Result<u64, IngestError> {
    verify(&block).map_err(|e| IngestError::from(e).at_block(index))?;

    let len = block.data.len() as u64;
    store
        .put(&block.cid, block.data)
        .await
        .map_err(|e| IngestError::from(e).at_block(index))?;

    tracing::trace!(index, cid = %block.cid, len, "block forwarded");
    Ok(len)
}

/// Bounded set of forwarding jobs that remembers the lowest failing index
struct Forwarder<'a, S> {
    store: S,
    jobs: JoinSet<(u64, Result<u64, IngestError>)>,
    handles: BTreeMap<u64, AbortHandle>,
    limit: usize,
    failure: Option<(u64, IngestError)>,
    progress: &'a mut Progress,
}

impl<'a, S> Forwarder<'a, S>
where
    S: ClusterStore + Send + Sync + 'static,
{
    fn new(store: S, concurrency: usize, progress: &'a mut Progress) -> Self {
        Self {
            store,
            jobs: JoinSet::new(),
            handles: BTreeMap::new(),
            limit: concurrency.max(1),
            failure: None,
            progress,
        }
    }

    fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Record a failure at `index`, keeping only the lowest
    fn fail(&mut self, index: u64, err: IngestError) {
        if matches!(&self.failure, Some((current, _)) if *current <= index) {
            return;
        }

        for (_, handle) in self.handles.split_off(&(index + 1)) {
            handle.abort();
        }
        self.failure = Some((index, err));
    }

    /// Start a job for `block`, waiting for a free slot first
    ///
    /// Does nothing if a failure is already recorded: every job in flight has
    /// a lower index, so this block could never be the one reported.
    async fn dispatch(&mut self, index: u64, block: Block) {
        while self.jobs.len() >= self.limit && !self.has_failed() {
            self.reap().await;
        }
        if self.has_failed() {
            return;
        }

        let store = self.store.clone();
        let handle = self.jobs.spawn(async move {
            let result = forward(&store, index, block).await;
            (index, result)
        });
        self.handles.insert(index, handle);
    }

    /// Wait for one job; returns false when none are left
    async fn reap(&mut self) -> bool {
        match self.jobs.join_next().await {
            None => false,
            Some(Ok((index, result))) => {
                self.handles.remove(&index);
                match result {
                    Ok(len) => {
                        self.progress.block_count += 1;
                        self.progress.byte_count += len;
                    }
                    Err(err) => self.fail(index, err),
                }
                true
            }
            Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // aborted by `fail`
            Some(Err(_)) => true,
        }
    }

    async fn drain(&mut self) {
        while self.reap().await {}
    }

    fn into_failure(self) -> Option<IngestError> {
        self.failure.map(|(_, err)| err)
    }
}
