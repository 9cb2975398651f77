//! E4: given `{"status":"ok","hits":[{"id":"a"},{"id":"b"}],"total_hits":2}`
//! (rows under `hits`, Search's rows key), the row stream yields both hits
//! in order and reports `total_hits` once drained.

use bytes::Bytes;
use couchbase_core::http::{ByteStream, RowStream};
use futures_util::stream;
use serde_json::Value;

fn body_stream(chunks: Vec<&'static str>) -> ByteStream {
    Box::pin(stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())))))
}

#[tokio::test]
async fn e4_search_streaming_yields_rows_and_metadata() {
    let body = r#"{"status":"ok","hits":[{"id":"a"},{"id":"b"}],"total_hits":2}"#;
    let mut stream = RowStream::new(body_stream(vec![body]), "hits");

    let mut rows = stream.rows().unwrap();
    let mut seen = Vec::new();
    while let Some(row) = rows.next().await {
        seen.push(row.unwrap());
    }
    assert_eq!(seen, vec![serde_json::json!({"id": "a"}), serde_json::json!({"id": "b"})]);

    let metadata = stream.metadata().unwrap();
    assert_eq!(metadata.get("status"), Some(&Value::String("ok".into())));
    assert_eq!(metadata.get("total_hits"), Some(&serde_json::json!(2)));
}
