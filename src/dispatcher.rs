//! C7: single public entry point for a KV operation (spec §4.7).

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::instrument;

use crate::clustermap::SharedClusterMap;
use crate::config::ConfigProvider;
use crate::error::{Error, Result};
use crate::hash;
use crate::protocol::{Magic, Opcode, Packet, Status};
use crate::retry::{self, Decision, NmvHint};

/// The data a KV request carries beyond its opcode and key (spec §3 Packet).
#[derive(Debug, Clone, Default)]
pub struct KvRequest {
    pub value: Option<Bytes>,
    pub extras: Bytes,
    pub cas: u64,
}

/// A mutation's durability coordinates, captured from a response's extras
/// when the serving connection negotiated `MUTATION_TOKENS` (SPEC_FULL §2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub vbucket: u16,
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

impl MutationToken {
    /// Parses the 16-byte `{vbucket_uuid: u64 BE}{seqno: u64 BE}` trailer a
    /// server appends to a mutation response's extras when mutation tokens
    /// are negotiated; absent or short extras mean the feature is off.
    fn from_extras(vbucket: u16, extras: &[u8]) -> Option<Self> {
        if extras.len() < 16 {
            return None;
        }
        Some(Self {
            vbucket,
            vbucket_uuid: u64::from_be_bytes(extras[0..8].try_into().expect("checked length")),
            seqno: u64::from_be_bytes(extras[8..16].try_into().expect("checked length")),
        })
    }
}

fn is_mutation_opcode(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Set
            | Opcode::Add
            | Opcode::Replace
            | Opcode::Delete
            | Opcode::Increment
            | Opcode::Decrement
            | Opcode::Append
            | Opcode::Prepend
    )
}

/// The result of a dispatched KV operation: the raw packet plus, for a
/// successful mutation on a mutation-token-enabled connection, the
/// durability coordinates the server attached.
#[derive(Debug, Clone)]
pub struct KvResponse {
    pub packet: Packet,
    pub mutation_token: Option<MutationToken>,
}

/// One key's durability state as reported by OBSERVE (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveResult {
    pub key: Bytes,
    pub persisted: bool,
    pub cas: u64,
}

const OBSERVE_FOUND_PERSISTED: u8 = 0x01;

/// A node's acquire-a-connection-and-send capability, implemented by the
/// per-node pool set that owns one `Pool` per cluster-map node index.
pub trait NodeTransport: Send + Sync {
    async fn send_to_node(&self, node_index: usize, packet: Packet, deadline: Instant) -> Result<Packet>;
}

pub struct Dispatcher<T: NodeTransport> {
    cluster_map: SharedClusterMap,
    config: Arc<ConfigProvider>,
    transport: T,
    acquire_timeout: Duration,
}

impl<T: NodeTransport> Dispatcher<T> {
    pub fn new(cluster_map: SharedClusterMap, config: Arc<ConfigProvider>, transport: T, acquire_timeout: Duration) -> Self {
        Self {
            cluster_map,
            config,
            transport,
            acquire_timeout,
        }
    }

    /// Routes `op` to the owning node, retrying under `deadline` per the
    /// classification table in spec §4.7.
    #[instrument(skip(self, request), fields(opcode = ?op))]
    pub async fn dispatch(&self, key: &[u8], op: Opcode, request: KvRequest, deadline: Instant) -> Result<KvResponse> {
        let mut attempt = 0u32;
        loop {
            match self.try_once(key, op, &request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let nmv_hint = match &err {
                        Error::NotMyVBucket { config: Some(_) } => Some(NmvHint {
                            fresher_map_available: true,
                        }),
                        Error::NotMyVBucket { config: None } => Some(NmvHint {
                            fresher_map_available: false,
                        }),
                        _ => None,
                    };
                    if !retry::is_kv_retryable(&err, op.is_idempotent()) {
                        return Err(err);
                    }
                    match retry::retry(err, attempt, deadline, nmv_hint) {
                        Decision::Stop(stop_err) => return Err(stop_err),
                        Decision::Wait(wait) => {
                            if !wait.is_zero() {
                                tokio::time::sleep(wait).await;
                            }
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    async fn try_once(&self, key: &[u8], op: Opcode, request: &KvRequest) -> Result<KvResponse> {
        let map = self.cluster_map.load();
        if map.partition_count == 0 {
            return Err(Error::NoMap);
        }
        let partition = hash::partition(key, map.partition_count)?;
        let node_index = map.node_for(partition, 0).ok_or(Error::NoNode)?;

        let acquire_deadline = Instant::now() + self.acquire_timeout;
        let packet = Packet {
            magic: Magic::Request as u8,
            opcode: op as u8,
            data_type: 0,
            vbucket_or_status: partition,
            opaque: 0, // assigned by Connection::send
            cas: request.cas,
            extras: request.extras.clone(),
            key: Bytes::copy_from_slice(key),
            value: request.value.clone().unwrap_or_default(),
        };

        let response = self.transport.send_to_node(node_index, packet, acquire_deadline).await?;
        self.classify(response, op, partition)
    }

    fn classify(&self, response: Packet, op: Opcode, partition: u16) -> Result<KvResponse> {
        match Status::from_u16(response.vbucket_or_status) {
            Status::Success => {
                let mutation_token = is_mutation_opcode(op)
                    .then(|| MutationToken::from_extras(partition, &response.extras))
                    .flatten();
                Ok(KvResponse { packet: response, mutation_token })
            }
            Status::KeyEnoent => Err(Error::KeyNotFound),
            Status::KeyEexists => Err(Error::KeyExists),
            Status::NotStored => Err(Error::KeyNotFound),
            Status::DeltaBadVal => Err(Error::DeltaBadVal),
            Status::TooBig => Err(Error::TooBig),
            Status::Locked => Err(Error::Locked),
            Status::NotMyVBucket => {
                let embedded_config = (!response.value.is_empty()).then(|| response.value.to_vec());
                self.config.handle_nmv(embedded_config.clone());
                Err(Error::NotMyVBucket { config: embedded_config })
            }
            Status::TmpFail | Status::Busy | Status::NoMemory => Err(Error::TmpFail),
            Status::AuthError => Err(Error::AuthFailure("server returned AUTH_ERROR mid-session".into())),
            Status::AccessError => Err(Error::AccessDenied),
            Status::AuthStale | Status::AuthContinue => {
                Err(Error::ProtocolViolation("unexpected SASL status on a data operation".into()))
            }
            Status::Unknown(code) => Err(Error::Unknown(code)),
        }
    }

    /// Polls durability state for `keys` via OBSERVE (spec §4.7, SPEC_FULL
    /// §2 "Durability/observe helper"). Keys are grouped by owning vbucket
    /// so each group fits in one OBSERVE request value; every group is
    /// routed and retried exactly like any other dispatched op, since
    /// `Opcode::Observe` is idempotent.
    #[instrument(skip(self, keys))]
    pub async fn observe(&self, keys: &[&[u8]], deadline: Instant) -> Result<Vec<ObserveResult>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let map = self.cluster_map.load();
        if map.partition_count == 0 {
            return Err(Error::NoMap);
        }

        let mut by_partition: std::collections::HashMap<u16, Vec<&[u8]>> = std::collections::HashMap::new();
        for &key in keys {
            let partition = hash::partition(key, map.partition_count)?;
            by_partition.entry(partition).or_default().push(key);
        }

        let mut results = Vec::new();
        for group in by_partition.into_values() {
            // The real OBSERVE request packs one superkey list into the
            // value: per key, vbucket id + key length + key bytes; the
            // packet's own key field stays empty. We still have to name a
            // routing key for `dispatch`, so the group's first key stands
            // in for that purpose only.
            let mut value = Vec::new();
            for key in &group {
                let partition = hash::partition(key, map.partition_count)?;
                value.extend_from_slice(&partition.to_be_bytes());
                #[allow(clippy::cast_possible_truncation)]
                value.extend_from_slice(&(key.len() as u16).to_be_bytes());
                value.extend_from_slice(key);
            }

            let request = KvRequest {
                value: Some(Bytes::from(value)),
                extras: Bytes::new(),
                cas: 0,
            };
            let response = self.dispatch(group[0], Opcode::Observe, request, deadline).await?;
            results.extend(parse_observe_body(&response.packet.value)?);
        }
        Ok(results)
    }
}

/// Parses an OBSERVE response value: repeated `{vbucket: u16}{key_len:
/// u16}{key}{status: u8}{cas: u64}` entries, one per requested key.
fn parse_observe_body(body: &[u8]) -> Result<Vec<ObserveResult>> {
    let mut results = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::ProtocolViolation("truncated OBSERVE entry header".into()));
        }
        let key_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < key_len + 9 {
            return Err(Error::ProtocolViolation("truncated OBSERVE entry body".into()));
        }
        let key = Bytes::copy_from_slice(&rest[..key_len]);
        let status = rest[key_len];
        let cas = u64::from_be_bytes(rest[key_len + 1..key_len + 9].try_into().expect("checked length"));
        results.push(ObserveResult {
            key,
            persisted: status == OBSERVE_FOUND_PERSISTED,
            cas,
        });
        rest = &rest[key_len + 9..];
    }
    Ok(results)
}
