//! HTTP boundary for carport
//!
//! Routes:
//!
//! - `POST /car`: ingest the request body as a CAR
//! - `PUT /car/{cid}`: as `POST`, and the archive's first root must be `cid`
//! - `GET /car/{cid}`: export the DAG under `cid` as a CAR
//! - `HEAD /car/{cid}`: whether `cid` is a pinned root
//!
//! Uploads need a bearer token when tokens are configured; reads are open.
//! Uploads must be sent as `application/car` (or `application/vnd.ipld.car`).
//! Every response other than a CAR body is JSON: `{"ok": true, "value": ..}`
//! on success, `{"ok": false, "error", "message", "retryable"}` otherwise.
//! A rejected upload also reports `cid`, `blocks`, `bytes` and `blockIndex`.
//! Only pinned roots are served; blocks left behind by a rejected upload are not.
//!
//! # Example
//!
//! ```no_run
//! use carport::MemoryClusterStore;
//! use carport_axum::{CarportState, router};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = router(CarportState::new(MemoryClusterStore::new()));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
//!         .await
//!         .unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod auth;

use std::io;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{post, put},
};
use carport::cid::CidError;
use carport::export::ExportError;
use carport::{
    ClusterStore, ContentId, Failure, FailureKind, IngestOptions, IngestResult, export_car, ingest,
};
use n0_future::StreamExt;
use serde_json::json;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::auth::{CallerAuth, ExtractCaller, StaticTokens};

/// Media type for CAR bodies
pub const CAR_MIME: &str = "application/car";
/// IPLD registered media type, accepted as an alias
pub const CAR_MIME_IPLD: &str = "application/vnd.ipld.car";

/// Shared state for the router
#[derive(Clone)]
pub struct CarportState<S> {
    store: S,
    options: Arc<IngestOptions>,
    tokens: Arc<StaticTokens>,
}

impl<S: ClusterStore> CarportState<S> {
    /// Default ingest options, authentication disabled
    pub fn new(store: S) -> Self {
        Self {
            store,
            options: Arc::new(IngestOptions::default()),
            tokens: Arc::new(StaticTokens::new()),
        }
    }

    /// Options used as the base for every upload
    ///
    /// `caller` and `expected_root` are overwritten per request.
    pub fn with_options(mut self, options: IngestOptions) -> Self {
        self.options = Arc::new(options);
        self
    }

    /// Bearer tokens accepted on uploads
    pub fn with_tokens(mut self, tokens: StaticTokens) -> Self {
        self.tokens = Arc::new(tokens);
        self
    }

    /// Backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Base ingest options
    pub fn options(&self) -> &IngestOptions {
        &self.options
    }
}

impl<S> CallerAuth for CarportState<S> {
    type Validator = StaticTokens;

    fn validator(&self) -> &Self::Validator {
        &self.tokens
    }
}

/// Errors returned to HTTP clients
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ApiError {
    /// Upload was not sent as a CAR
    #[error("expected content-type application/car, got {}", .0.as_deref().unwrap_or("none"))]
    #[diagnostic(code(api::content_type))]
    InvalidContentType(Option<String>),

    /// Path segment is not a CID
    #[error("invalid CID {text:?}: {source}")]
    #[diagnostic(code(api::invalid_cid))]
    InvalidCid {
        /// What was sent
        text: String,
        #[source]
        source: CidError,
    },

    /// Root is not pinned
    #[error("{0} not found")]
    #[diagnostic(code(api::not_found))]
    NotFound(ContentId),

    /// Ingest rejected the archive
    #[error("{}", .0.message)]
    #[diagnostic(code(api::rejected))]
    Rejected(Failure),

    /// Export could not complete
    #[error(transparent)]
    #[diagnostic(transparent)]
    Export(#[from] ExportError),
}

impl ApiError {
    /// Error name as sent in the `error` field
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::InvalidContentType(_) => "InvalidContentType",
            Self::InvalidCid { .. } => "InvalidCid",
            Self::NotFound(_) => "NotFound",
            Self::Rejected(failure) => failure.kind.as_str(),
            Self::Export(ExportError::Store(_)) => FailureKind::StoreUnavailable.as_str(),
            Self::Export(_) => "ExportFailed",
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidContentType(_) | Self::InvalidCid { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Rejected(failure) => match failure.kind {
                FailureKind::StoreUnavailable | FailureKind::ReadFailed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                FailureKind::IngestTimeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_REQUEST,
            },
            Self::Export(ExportError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may resend the same request
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected(failure) => failure.kind.is_retryable(),
            Self::Export(ExportError::Store(_)) => true,
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = self.error_name(), "{}", self);
        }

        (
            status,
            Json(json!({
                "ok": false,
                "error": self.error_name(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            })),
        )
            .into_response()
    }
}

fn check_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let value = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let essence = value.map(|v| {
        v.split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    });

    match essence.as_deref() {
        Some(CAR_MIME) | Some(CAR_MIME_IPLD) => Ok(()),
        _ => Err(ApiError::InvalidContentType(value.map(str::to_owned))),
    }
}

fn parse_cid(text: &str) -> Result<ContentId, ApiError> {
    ContentId::from_text(text).map_err(|source| ApiError::InvalidCid {
        text: text.to_owned(),
        source,
    })
}

/// The request body as a byte stream, read as the decoder asks for it
fn body_reader(body: Body) -> impl AsyncRead + Unpin + Send {
    StreamReader::new(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other)),
    )
}

fn ingest_response(result: IngestResult) -> Response {
    let Some(failure) = result.failure else {
        return Json(json!({
            "ok": true,
            "value": {
                "cid": result.root_cid,
                "blocks": result.block_count,
                "bytes": result.byte_count,
            }
        }))
        .into_response();
    };

    let block_index = failure.block_index;
    let error = ApiError::Rejected(failure);
    let status = error.status();
    if status.is_server_error() {
        tracing::warn!(error = error.error_name(), "{}", error);
    }
    (
        status,
        Json(json!({
            "ok": false,
            "error": error.error_name(),
            "message": error.to_string(),
            "retryable": error.is_retryable(),
            "cid": result.root_cid,
            "blocks": result.block_count,
            "bytes": result.byte_count,
            "blockIndex": block_index,
        })),
    )
        .into_response()
}

/// Fails with `NotFound` unless `root` is pinned
async fn require_pinned<S: ClusterStore>(store: &S, root: &ContentId) -> Result<(), ApiError> {
    let pinned = store
        .is_pinned(root)
        .await
        .map_err(|e| ApiError::Export(e.into()))?;
    if pinned {
        Ok(())
    } else {
        Err(ApiError::NotFound(*root))
    }
}

async fn upload<S>(
    state: &CarportState<S>,
    caller: Option<String>,
    expected_root: Option<ContentId>,
    body: Body,
) -> Response
where
    S: ClusterStore + Send + Sync + 'static,
{
    let mut options = IngestOptions::clone(&state.options);
    options.caller = caller;
    options.expected_root = expected_root;

    let result = ingest(body_reader(body), &options, &state.store).await;
    ingest_response(result)
}

async fn post_car<S>(
    State(state): State<CarportState<S>>,
    ExtractCaller(caller): ExtractCaller,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError>
where
    S: ClusterStore + Send + Sync + 'static,
{
    check_content_type(&headers)?;
    Ok(upload(&state, caller, None, body).await)
}

async fn put_car<S>(
    State(state): State<CarportState<S>>,
    ExtractCaller(caller): ExtractCaller,
    Path(cid): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError>
where
    S: ClusterStore + Send + Sync + 'static,
{
    check_content_type(&headers)?;
    let expected = parse_cid(&cid)?;
    Ok(upload(&state, caller, Some(expected), body).await)
}

async fn get_car<S>(
    State(state): State<CarportState<S>>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError>
where
    S: ClusterStore + Send + Sync + 'static,
{
    let root = parse_cid(&cid)?;
    require_pinned(&state.store, &root).await?;
    let car = export_car(&state.store, &root)
        .await?
        .ok_or(ApiError::NotFound(root))?;
    Ok(([(header::CONTENT_TYPE, CAR_MIME)], car).into_response())
}

async fn head_car<S>(
    State(state): State<CarportState<S>>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError>
where
    S: ClusterStore + Send + Sync + 'static,
{
    let root = parse_cid(&cid)?;
    require_pinned(&state.store, &root).await?;
    Ok(([(header::CONTENT_TYPE, CAR_MIME)], StatusCode::OK).into_response())
}

/// Router serving the CAR endpoints over `state`
pub fn router<S>(state: CarportState<S>) -> Router
where
    S: ClusterStore + Send + Sync + 'static,
{
    Router::new()
        .route("/car", post(post_car::<S>))
        .route(
            "/car/{cid}",
            put(put_car::<S>).get(get_car::<S>).head(head_car::<S>),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
