//! IPFS Cluster client
//!
//! Blocks travel through the cluster's IPFS proxy, which speaks the IPFS RPC
//! API (`/api/v0/block/*`). Pins go to the cluster REST API (`/pins/{cid}`) so
//! they are tracked and replicated by the cluster rather than a single node.

use std::collections::BTreeMap;

use bytes::Bytes;
use reqwest::{RequestBuilder, Response, StatusCode, header, multipart};
use serde::Deserialize;
use url::Url;

use super::{ClusterStore, StoreError};
use crate::cid::{ContentId, IpldCid, codec_name};

const MAX_ERROR_BODY: usize = 512;

/// Cluster-backed store
///
/// Cloning is cheap: the underlying `reqwest::Client` is reference counted.
///
/// # Example
///
/// ```rust,ignore
/// use carport::HttpClusterStore;
///
/// let store = HttpClusterStore::new(
///     "http://127.0.0.1:9094".parse()?,
///     "http://127.0.0.1:9095".parse()?,
/// )
/// .with_basic_auth(token);
/// ```
#[derive(Debug, Clone)]
pub struct HttpClusterStore {
    client: reqwest::Client,
    api_url: Url,
    proxy_url: Url,
    basic_auth_token: Option<String>,
}

#[derive(Deserialize)]
struct BlockPutResponse {
    #[serde(rename = "Key")]
    key: String,
}

#[derive(Deserialize)]
struct PinStatus {
    #[serde(default)]
    peer_map: BTreeMap<String, PeerStatus>,
}

#[derive(Deserialize)]
struct PeerStatus {
    status: String,
}

impl HttpClusterStore {
    /// Client for a cluster REST API and IPFS proxy
    pub fn new(api_url: Url, proxy_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, proxy_url)
    }

    /// Use an existing HTTP client
    pub fn with_client(client: reqwest::Client, api_url: Url, proxy_url: Url) -> Self {
        Self {
            client,
            api_url: with_trailing_slash(api_url),
            proxy_url: with_trailing_slash(proxy_url),
            basic_auth_token: None,
        }
    }

    /// Send `Authorization: Basic <token>` on every request
    ///
    /// The token is used as given: already base64 `user:password`.
    pub fn with_basic_auth(mut self, token: impl Into<String>) -> Self {
        self.basic_auth_token = Some(token.into());
        self
    }

    /// Cluster REST API base
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// IPFS proxy base
    pub fn proxy_url(&self) -> &Url {
        &self.proxy_url
    }

    fn endpoint(base: &Url, path: &str) -> Result<Url, StoreError> {
        base.join(path).map_err(|e| StoreError::Decode(Box::new(e)))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.basic_auth_token {
            Some(token) => req.header(header::AUTHORIZATION, format!("Basic {}", token)),
            None => req,
        }
    }

    async fn send(&self, endpoint: &str, req: RequestBuilder) -> Result<Response, StoreError> {
        self.authed(req)
            .send()
            .await
            .map_err(|e| StoreError::Transport(Box::new(e)))
            .inspect_err(|e| tracing::warn!(endpoint, error = %e, "cluster request failed"))
    }

    async fn read_error(endpoint: &str, resp: Response) -> StoreError {
        let status = resp.status().as_u16();
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        StoreError::Status {
            endpoint: endpoint.to_string(),
            status,
            body,
        }
    }

    /// Run an offline IPFS block RPC, mapping "not found" to `None`
    async fn block_rpc(&self, call: &str, cid: &ContentId) -> Result<Option<Response>, StoreError> {
        let mut url = Self::endpoint(&self.proxy_url, &format!("api/v0/block/{}", call))?;
        url.query_pairs_mut()
            .append_pair("arg", &cid.to_text())
            .append_pair("offline", "true");

        let endpoint = format!("block/{}", call);
        let resp = self.send(&endpoint, self.client.post(url)).await?;
        if resp.status().is_success() {
            return Ok(Some(resp));
        }

        match Self::read_error(&endpoint, resp).await {
            StoreError::Status { status, body, .. }
                if status == StatusCode::INTERNAL_SERVER_ERROR.as_u16()
                    && body.contains("not found") =>
            {
                Ok(None)
            }
            err => Err(err),
        }
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl ClusterStore for HttpClusterStore {
    async fn put(&self, cid: &ContentId, data: Bytes) -> Result<(), StoreError> {
        let codec = codec_name(cid.codec()).ok_or(StoreError::UnsupportedCodec(cid.codec()))?;
        let algorithm = cid.hash_algorithm();

        let mut url = Self::endpoint(&self.proxy_url, "api/v0/block/put")?;
        url.query_pairs_mut()
            .append_pair("cid-codec", codec)
            .append_pair("mhtype", algorithm.name())
            .append_pair("mhlen", &algorithm.digest_len().to_string())
            .append_pair("pin", "false");

        let size = data.len();
        let form = multipart::Form::new().part(
            "file",
            multipart::Part::bytes(data.to_vec()).file_name("block"),
        );

        let resp = self
            .send("block/put", self.client.post(url).multipart(form))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::read_error("block/put", resp).await);
        }

        let body: BlockPutResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(Box::new(e)))?;
        let stored =
            IpldCid::try_from(body.key.as_str()).map_err(|e| StoreError::Decode(Box::new(e)))?;

        // The cluster may answer with a different CID version, so only the
        // multihash has to match.
        if stored.hash() != cid.as_ipld().hash() {
            return Err(StoreError::CidMismatch {
                expected: *cid,
                stored: body.key,
            });
        }

        tracing::debug!(%cid, size, "block stored in cluster");
        Ok(())
    }

    async fn pin(&self, root: &ContentId) -> Result<(), StoreError> {
        let url = Self::endpoint(&self.api_url, &format!("pins/{}", root))?;
        let resp = self.send("pins", self.client.post(url)).await?;
        if !resp.status().is_success() {
            return Err(Self::read_error("pins", resp).await);
        }

        tracing::info!(%root, "pinned in cluster");
        Ok(())
    }

    async fn get(&self, cid: &ContentId) -> Result<Option<Bytes>, StoreError> {
        match self.block_rpc("get", cid).await? {
            Some(resp) => resp
                .bytes()
                .await
                .map(Some)
                .map_err(|e| StoreError::Transport(Box::new(e))),
            None => Ok(None),
        }
    }

    async fn has(&self, cid: &ContentId) -> Result<bool, StoreError> {
        Ok(self.block_rpc("stat", cid).await?.is_some())
    }

    async fn is_pinned(&self, root: &ContentId) -> Result<bool, StoreError> {
        let url = Self::endpoint(&self.api_url, &format!("pins/{}", root))?;
        let resp = self.send("pins", self.client.get(url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(Self::read_error("pins", resp).await);
        }

        let status: PinStatus = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(Box::new(e)))?;

        // queued and pinning still count: the cluster is tracking the pin
        Ok(status
            .peer_map
            .values()
            .any(|peer| matches!(peer.status.as_str(), "pinned" | "pinning" | "queued")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_urls_get_trailing_slash() {
        let store = HttpClusterStore::new(
            "http://cluster.local:9094".parse().unwrap(),
            "http://cluster.local:9095/proxy".parse().unwrap(),
        );
        assert_eq!(store.api_url().as_str(), "http://cluster.local:9094/");
        assert_eq!(store.proxy_url().as_str(), "http://cluster.local:9095/proxy/");

        let url = HttpClusterStore::endpoint(store.proxy_url(), "api/v0/block/put").unwrap();
        assert_eq!(url.as_str(), "http://cluster.local:9095/proxy/api/v0/block/put");
    }
}
