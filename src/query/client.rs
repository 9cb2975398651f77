//! Query service HTTP client: picks a node from the cluster map, issues the
//! request, classifies the response, and hands the body to the streaming
//! row reader (spec §4.10, tying together §4.5 and §4.9).

use std::time::Duration;

use rand::seq::SliceRandom;

use crate::clustermap::SharedClusterMap;
use crate::error::{Error, Result};
use crate::http::RowStream;

use super::{AnalyticsRequest, N1qlRequest, Request, SearchRequest, ViewRequest};

/// Thin HTTP front for the four query-style services. Node selection reads
/// the same cluster map the KV dispatcher uses (spec §4.5): a Query client
/// never maintains its own topology.
pub struct QueryClient {
    http: reqwest::Client,
    cluster_map: SharedClusterMap,
}

impl QueryClient {
    pub fn new(http: reqwest::Client, cluster_map: SharedClusterMap) -> Self {
        Self { http, cluster_map }
    }

    /// Dispatches any of the four request shapes without the caller needing
    /// to know which method it maps to.
    pub async fn execute(&self, request: &Request) -> Result<RowStream> {
        match request {
            Request::Search(r) => self.search(r).await,
            Request::View(r) => self.view(r).await,
            Request::N1ql(r) => self.n1ql(r).await,
            Request::Analytics(r) => self.analytics(r).await,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<RowStream> {
        let base = self.pick_base_url(|node| node.search_port)?;
        let url = format!("{base}/{}/_search", request.index);
        let response = self.http.post(&url).json(&request.to_body()).send().await?;
        self.into_row_stream(response, "hits").await
    }

    pub async fn view(&self, request: &ViewRequest) -> Result<RowStream> {
        let base = self.pick_base_url(|node| node.views_port)?;
        let url = format!("{base}{}", request.path());
        let response = self.http.get(&url).query(&request.query_params()).send().await?;
        self.into_row_stream(response, request.rows_key()).await
    }

    pub async fn n1ql(&self, request: &N1qlRequest) -> Result<RowStream> {
        let base = self.pick_base_url(|node| node.query_port)?;
        let url = format!("{base}/query/service");
        let response = self.http.post(&url).json(&request.to_body()).send().await?;
        self.into_row_stream(response, request.rows_key()).await
    }

    pub async fn analytics(&self, request: &AnalyticsRequest) -> Result<RowStream> {
        let base = self.pick_base_url(|node| node.analytics_port)?;
        let url = format!("{base}/analytics/service");
        let response = self.http.post(&url).json(&request.to_body()).send().await?;
        self.into_row_stream(response, request.rows_key()).await
    }

    /// Picks one node at random among those exposing the requested service,
    /// matching spec §4.5's "no preference among replicas" load spreading.
    fn pick_base_url(&self, port_of: impl Fn(&crate::clustermap::Node) -> Option<u16>) -> Result<String> {
        let map = self.cluster_map.load();
        let candidates: Vec<(&str, u16)> = map
            .nodes
            .iter()
            .filter_map(|node| port_of(node).map(|port| (node.host.as_str(), port)))
            .collect();
        let (host, port) = candidates
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(Error::NoNode)?;
        Ok(format!("http://{host}:{port}"))
    }

    async fn into_row_stream(&self, response: reqwest::Response, rows_key: &'static str) -> Result<RowStream> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus { status: status.as_u16(), body });
        }
        let byte_stream = Box::pin(response.bytes_stream());
        Ok(RowStream::new(byte_stream, rows_key))
    }
}

/// Request-scoped timeout applied at the transport level, independent of
/// the `ctl.timeout` value carried in the body (spec §4.9's "client-side
/// deadline is enforced separately from the server-side one").
pub fn client_timeout(ctl_timeout_ms: u64) -> Duration {
    Duration::from_millis(ctl_timeout_ms).saturating_add(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustermap::{ClusterMap, Node, ServerCapabilities};

    fn map_with_query_node() -> ClusterMap {
        ClusterMap {
            revision: 1,
            bucket: "travel-sample".into(),
            nodes: vec![Node {
                host: "127.0.0.1".into(),
                kv_port: 11210,
                query_port: Some(8093),
                search_port: None,
                analytics_port: None,
                views_port: None,
            }],
            partition_count: 1,
            partitions: vec![vec![0]],
            capabilities: ServerCapabilities::empty(),
        }
    }

    #[test]
    fn pick_base_url_finds_node_with_requested_service() {
        let client = QueryClient::new(reqwest::Client::new(), SharedClusterMap::new(map_with_query_node()));
        let url = client.pick_base_url(|node| node.query_port).unwrap();
        assert_eq!(url, "http://127.0.0.1:8093");
    }

    #[test]
    fn pick_base_url_fails_when_no_node_exposes_service() {
        let client = QueryClient::new(reqwest::Client::new(), SharedClusterMap::new(map_with_query_node()));
        assert!(matches!(client.pick_base_url(|node| node.search_port), Err(Error::NoNode)));
    }

    #[test]
    fn client_timeout_adds_headroom_over_ctl_timeout() {
        assert_eq!(client_timeout(1000), Duration::from_millis(6000));
    }
}
