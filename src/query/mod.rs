//! C10: typed query request bodies, the HTTP client that issues them, and
//! the hookup to the streaming row reader (spec §4.10).

pub mod analytics;
pub mod client;
pub mod n1ql;
pub mod search;
pub mod view;

pub use analytics::AnalyticsRequest;
pub use client::QueryClient;
pub use n1ql::N1qlRequest;
pub use search::{Highlight, SearchRequest, SearchSort};
pub use view::ViewRequest;

use serde::Serialize;
use serde_json::{Map, Value};

/// Default request-scoped timeout, spec §6 "ctl.timeout = 75000".
pub const DEFAULT_CTL_TIMEOUT_MS: u64 = 75_000;

/// Consistency requirements attached to a request's `ctl` block.
#[derive(Debug, Clone, Serialize)]
pub struct Consistency {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vectors: Option<Value>,
}

/// The `ctl` control block every query request carries (spec §6).
#[derive(Debug, Clone)]
pub struct Ctl {
    pub timeout_ms: u64,
    pub consistency: Option<Consistency>,
}

impl Default for Ctl {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_CTL_TIMEOUT_MS,
            consistency: None,
        }
    }
}

impl Ctl {
    pub fn to_json(&self) -> Value {
        let mut ctl = Map::new();
        ctl.insert("timeout".to_string(), Value::from(self.timeout_ms));
        if let Some(consistency) = &self.consistency {
            let mut consistency_obj = Map::new();
            consistency_obj.insert("level".to_string(), Value::String(consistency.level.clone()));
            if let Some(vectors) = &consistency.vectors {
                consistency_obj.insert("vectors".to_string(), vectors.clone());
            }
            ctl.insert("consistency".to_string(), Value::Object(consistency_obj));
        }
        Value::Object(ctl)
    }
}

/// A request that can be dispatched through the Query service client.
pub enum Request {
    Search(SearchRequest),
    View(ViewRequest),
    N1ql(N1qlRequest),
    Analytics(AnalyticsRequest),
}
