//! E2: a GET comes back NOT_MY_VBUCKET with an embedded config promoting a
//! second node; the dispatcher applies that config and the retried attempt
//! routes to the new owner and succeeds, with no caller-visible error.
//! Exercises `ConfigProvider` and `Dispatcher` sharing one `SharedClusterMap`
//! the way a real client wires them together.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use couchbase_core::config::ConfigProvider;
use couchbase_core::dispatcher::{Dispatcher, KvRequest, NodeTransport};
use couchbase_core::protocol::{Magic, Opcode, Packet, Status};
use couchbase_core::Result;

struct NmvThenSuccess {
    calls: AtomicUsize,
}

impl NodeTransport for NmvThenSuccess {
    async fn send_to_node(&self, node_index: usize, packet: Packet, _deadline: Instant) -> Result<Packet> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            let promoted = serde_json::json!({
                "rev": 2,
                "vBucketServerMap": {"vBucketMap": (0..64).map(|_| vec![1]).collect::<Vec<_>>()},
                "nodesExt": [
                    {"hostname": "127.0.0.1", "services": {"kv": 11210}},
                    {"hostname": "127.0.0.2", "services": {"kv": 11210}},
                ],
            });
            return Ok(Packet {
                magic: Magic::Response as u8,
                vbucket_or_status: Status::NotMyVBucket.as_u16(),
                value: Bytes::from(serde_json::to_vec(&promoted).unwrap()),
                ..packet
            });
        }
        assert_eq!(node_index, 1, "retried attempt should route to the promoted node");
        Ok(Packet {
            magic: Magic::Response as u8,
            vbucket_or_status: Status::Success.as_u16(),
            ..packet
        })
    }
}

#[tokio::test]
async fn e2_nmv_with_embedded_config_retries_and_succeeds() {
    let config = Arc::new(ConfigProvider::new("travel-sample"));
    let seed = serde_json::json!({
        "rev": 1,
        "vBucketServerMap": {"vBucketMap": (0..64).map(|_| vec![0]).collect::<Vec<_>>()},
        "nodesExt": [{"hostname": "127.0.0.1", "services": {"kv": 11210}}],
    });
    config.apply_blob(&serde_json::to_vec(&seed).unwrap()).unwrap();
    let cluster_map = config.cluster_map();

    let transport = NmvThenSuccess { calls: AtomicUsize::new(0) };
    let dispatcher = Dispatcher::new(cluster_map, Arc::clone(&config), transport, Duration::from_secs(1));

    let response = dispatcher
        .dispatch(b"k", Opcode::Get, KvRequest::default(), Instant::now() + Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(Status::from_u16(response.packet.vbucket_or_status), Status::Success);
    assert_eq!(config.cluster_map().load().revision, 2);
}
