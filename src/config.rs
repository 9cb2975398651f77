//! C6: fetches and watches cluster config updates (spec §4.6).

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::clustermap::{ClusterMap, Node, ServerCapabilities, SharedClusterMap};
use crate::error::{Error, Result};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Raw shape of `GET /pools/default/b/<bucket>`. Unknown fields are ignored
/// for forward compatibility (spec §4.6).
#[derive(Debug, Deserialize)]
struct RawConfig {
    rev: u64,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: RawVBucketMap,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<RawNodeExt>,
}

#[derive(Debug, Deserialize)]
struct RawVBucketMap {
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    hostname: Option<String>,
    services: RawServices,
}

#[derive(Debug, Default, Deserialize)]
struct RawServices {
    kv: Option<u16>,
    #[serde(rename = "n1ql")]
    query: Option<u16>,
    fts: Option<u16>,
    cbas: Option<u16>,
    capi: Option<u16>,
}

/// Parses one streamed config blob into a `ClusterMap` (spec §4.6
/// "Config parsing extracts: revision number, node list, partition map per
/// bucket, server capability flags. Unknown fields are ignored").
pub fn parse_config(bucket: &str, body: &[u8]) -> Result<ClusterMap> {
    let raw: RawConfig =
        serde_json::from_slice(body).map_err(|e| Error::ParseError(e.to_string()))?;

    let nodes = raw
        .nodes_ext
        .into_iter()
        .map(|n| Node {
            host: n.hostname.unwrap_or_else(|| "127.0.0.1".to_string()),
            kv_port: n.services.kv.unwrap_or(11210),
            query_port: n.services.query,
            search_port: n.services.fts,
            analytics_port: n.services.cbas,
            views_port: n.services.capi,
        })
        .collect();

    let partitions = raw
        .vbucket_server_map
        .vbucket_map
        .into_iter()
        .map(|owners| {
            owners
                .into_iter()
                .filter(|&idx| idx >= 0)
                .map(|idx| idx as usize)
                .collect()
        })
        .collect::<Vec<Vec<usize>>>();

    #[allow(clippy::cast_possible_truncation)]
    let partition_count = partitions.len() as u16;

    Ok(ClusterMap {
        revision: raw.rev,
        bucket: bucket.to_string(),
        nodes,
        partition_count,
        partitions,
        capabilities: ServerCapabilities::empty(),
    })
}

/// Owns the cluster map and keeps it fresh: initial fetch races an HTTP
/// streaming subscription against a KV fallback, then a background task
/// keeps consuming the HTTP stream (spec §4.6).
pub struct ConfigProvider {
    bucket: String,
    cluster_map: SharedClusterMap,
    refresh_requested: Mutex<bool>,
}

impl ConfigProvider {
    pub fn new(bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            cluster_map: SharedClusterMap::new(ClusterMap::empty(bucket.clone())),
            bucket,
            refresh_requested: Mutex::new(false),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new("default")
    }

    pub fn cluster_map(&self) -> SharedClusterMap {
        self.cluster_map.clone()
    }

    /// Applies one config blob, whatever its origin (initial HTTP fetch, KV
    /// `GET_CLUSTER_CONFIG`, streaming update, or an NMV-embedded config).
    pub fn apply_blob(&self, body: &[u8]) -> Result<bool> {
        let map = parse_config(&self.bucket, body)?;
        Ok(self.cluster_map.apply(map))
    }

    /// Called by the Dispatcher on NMV. If the response carried an embedded
    /// config, applies it; otherwise flags that an out-of-band refresh is
    /// owed (spec §4.6).
    pub fn handle_nmv(&self, embedded_config: Option<Vec<u8>>) {
        match embedded_config {
            Some(body) => {
                if let Err(err) = self.apply_blob(&body) {
                    warn!(error = %err, "failed to parse NMV-embedded cluster config");
                }
            }
            None => {
                *self.refresh_requested.lock().expect("poisoned") = true;
            }
        }
    }

    pub fn refresh_requested(&self) -> bool {
        std::mem::take(&mut *self.refresh_requested.lock().expect("poisoned"))
    }

    /// Fetches the initial config from the streaming HTTP endpoint, with a
    /// KV fallback raced alongside it — whichever resolves first wins
    /// (spec §4.6). `kv_fallback` is any already-`Ready` connection's
    /// `GET_CLUSTER_CONFIG` response body, fetched by the caller.
    ///
    /// `base_urls` is every seed host from the connection string (spec §6
    /// "couchbase://host[,host...]"); each is tried in turn until one
    /// answers, so a single down seed does not fail the whole fetch.
    #[instrument(skip(self, http, kv_fallback))]
    pub async fn fetch_initial(
        &self,
        http: &reqwest::Client,
        base_urls: &[url::Url],
        kv_fallback: impl std::future::Future<Output = Result<Vec<u8>>>,
    ) -> Result<()> {
        let http_attempt = self.try_base_urls(http, base_urls);

        tokio::select! {
            biased;
            result = http_attempt => {
                result?;
            }
            result = kv_fallback => {
                self.apply_blob(&result?)?;
            }
        }
        Ok(())
    }

    /// Tries each seed host's config endpoint in turn, returning on the
    /// first that answers. Returns the last seed's error if every seed
    /// fails, or `InvalidConfig` if `base_urls` is empty.
    async fn try_base_urls(&self, http: &reqwest::Client, base_urls: &[url::Url]) -> Result<()> {
        let mut last_err = Error::InvalidConfig("no seed hosts to fetch config from".into());
        for base_url in base_urls {
            let attempt = async {
                let url = base_url
                    .join(&format!("pools/default/b/{}", self.bucket))
                    .map_err(|e| Error::InvalidConfig(e.to_string()))?;
                let response = http.get(url).send().await?;
                let body = response.bytes().await?;
                self.apply_blob(&body)
            };
            match attempt.await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(error = %err, seed = %base_url, "seed host failed to answer initial config fetch");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Runs a long-lived streaming subscription, reconnecting with
    /// exponential back-off (base 100 ms, cap 10 s, full jitter) on loss
    /// (spec §4.6 "Failure policy").
    #[instrument(skip(self, http, base_url))]
    pub async fn run_streaming_subscription(&self, http: &reqwest::Client, base_url: &url::Url) -> ! {
        let mut attempt = 0u32;
        loop {
            match self.stream_once(http, base_url).await {
                Ok(()) => attempt = 0, // clean EOF: server closed, reconnect promptly
                Err(err) => {
                    warn!(error = %err, "cluster config stream lost, reconnecting");
                }
            }
            let delay = crate::retry::backoff_delay_public(attempt, BACKOFF_BASE, BACKOFF_CAP);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn stream_once(&self, http: &reqwest::Client, base_url: &url::Url) -> Result<()> {
        let url = base_url
            .join(&format!("pools/default/b/{}", self.bucket))
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let response = http.get(url).send().await?;
        let mut stream = response.bytes_stream();

        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk?;
            buffer.extend_from_slice(&chunk);
            // Streaming config updates are newline-delimited JSON objects.
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let trimmed = line.trim_ascii();
                if !trimmed.is_empty() {
                    if let Err(err) = self.apply_blob(trimmed) {
                        warn!(error = %err, "ignoring malformed cluster config chunk");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "rev": 3,
        "vBucketServerMap": { "vBucketMap": [[0, 1], [1, 0]] },
        "nodesExt": [
            {"hostname": "node-a", "services": {"kv": 11210, "n1ql": 8093}},
            {"hostname": "node-b", "services": {"kv": 11210}}
        ]
    }"#;

    #[test]
    fn parses_revision_nodes_and_partitions() {
        let map = parse_config("travel-sample", SAMPLE.as_bytes()).unwrap();
        assert_eq!(map.revision, 3);
        assert_eq!(map.nodes.len(), 2);
        assert_eq!(map.partition_count, 2);
        assert_eq!(map.node_for(0, 0), Some(0));
        assert_eq!(map.node_for(1, 0), Some(1));
    }

    #[test]
    fn apply_blob_rejects_stale_revision() {
        let provider = ConfigProvider::new("travel-sample");
        assert!(provider.apply_blob(SAMPLE.as_bytes()).unwrap());
        assert!(!provider.apply_blob(SAMPLE.as_bytes()).unwrap());
    }

    #[test]
    fn nmv_without_embedded_config_requests_refresh() {
        let provider = ConfigProvider::new("travel-sample");
        assert!(!provider.refresh_requested());
        provider.handle_nmv(None);
        assert!(provider.refresh_requested());
        // Single-shot: taking the flag clears it.
        assert!(!provider.refresh_requested());
    }

    #[test]
    fn nmv_with_embedded_config_applies_it() {
        let provider = ConfigProvider::new("travel-sample");
        provider.handle_nmv(Some(SAMPLE.as_bytes().to_vec()));
        assert_eq!(provider.cluster_map().load().revision, 3);
        assert!(!provider.refresh_requested());
    }
}
