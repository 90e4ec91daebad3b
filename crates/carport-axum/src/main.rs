use std::net::SocketAddr;
use std::time::Duration;

use carport::car::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_HEADER_SIZE};
use carport::ingest::DEFAULT_CONCURRENCY;
use carport::{ClusterStore, HttpClusterStore, IngestOptions, MemoryClusterStore};
use carport_axum::auth::StaticTokens;
use carport_axum::{CarportState, router};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Verify CAR uploads and forward them to an IPFS cluster")]
struct Config {
    /// Address to listen on
    #[arg(long, env = "CARPORT_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// IPFS Cluster REST API, used for pins
    #[arg(long, env = "CLUSTER_API_URL", requires = "cluster_proxy_url")]
    cluster_api_url: Option<Url>,

    /// IPFS proxy endpoint, used for block calls
    #[arg(long, env = "CLUSTER_PROXY_URL", requires = "cluster_api_url")]
    cluster_proxy_url: Option<Url>,

    /// Base64 `user:password` sent as HTTP basic auth to the cluster
    #[arg(long, env = "CLUSTER_BASIC_AUTH_TOKEN", hide_env_values = true)]
    cluster_basic_auth_token: Option<String>,

    /// Accepted bearer tokens as `name:token,...`; empty disables auth
    #[arg(long, env = "CARPORT_AUTH_TOKENS", hide_env_values = true, default_value = "")]
    auth_tokens: StaticTokens,

    /// Largest block frame accepted, in bytes
    #[arg(long, env = "CARPORT_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: u64,

    /// Largest header frame accepted, in bytes
    #[arg(long, env = "CARPORT_MAX_HEADER_SIZE", default_value_t = DEFAULT_MAX_HEADER_SIZE)]
    max_header_size: u64,

    /// Blocks verified and forwarded at once per upload
    #[arg(long, env = "CARPORT_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Time limit for one upload, in seconds
    #[arg(long, env = "CARPORT_DEADLINE_SECS")]
    deadline_secs: Option<u64>,

    /// Accept archives whose declared roots are not all present
    #[arg(long, env = "CARPORT_ALLOW_MISSING_ROOTS")]
    allow_missing_roots: bool,
}

impl Config {
    fn ingest_options(&self) -> IngestOptions {
        IngestOptions::new()
            .max_frame_size(self.max_frame_size)
            .max_header_size(self.max_header_size)
            .concurrency(self.concurrency)
            .require_all_roots_present(!self.allow_missing_roots)
            .maybe_deadline(self.deadline_secs.map(Duration::from_secs))
            .build()
    }
}

async fn serve<S>(config: &Config, store: S) -> Result<()>
where
    S: ClusterStore + Send + Sync + 'static,
{
    let state = CarportState::new(store)
        .with_options(config.ingest_options())
        .with_tokens(config.auth_tokens.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .into_diagnostic()?;
    tracing::info!(addr = %config.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .into_diagnostic()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(EnvFilter::from_env("CARPORT_LOG"))
        .init();

    let config = Config::parse();
    if config.auth_tokens.is_empty() {
        tracing::warn!("no auth tokens configured, uploads are unauthenticated");
    }

    match (&config.cluster_api_url, &config.cluster_proxy_url) {
        (Some(api), Some(proxy)) => {
            let mut store = HttpClusterStore::new(api.clone(), proxy.clone());
            if let Some(token) = &config.cluster_basic_auth_token {
                store = store.with_basic_auth(token.clone());
            }
            tracing::info!(api = %api, proxy = %proxy, "forwarding to cluster");
            serve(&config, store).await
        }
        _ => {
            tracing::warn!("no cluster configured, blocks are kept in memory");
            serve(&config, MemoryClusterStore::new()).await
        }
    }
}
