//! E6: a Search request with field sorts serializes `sort` as a plain string
//! array and carries the default `ctl.timeout`; the equivalent request built
//! with `SearchSort::Id` instead serializes `sort` as `[{"by":"id"}]`.
//! Exercises `SearchRequest` together with the shared `Ctl` block every
//! query-style request carries.

use couchbase_core::query::{Highlight, SearchRequest, SearchSort};

#[test]
fn e6_field_sort_serializes_to_string_array_with_default_ctl() {
    let mut req = SearchRequest::new("travel-sample", serde_json::json!({"match": "inn"}));
    req.sort = vec![SearchSort::ascending("name"), SearchSort::descending("age")];
    req.highlight = Some(Highlight {
        style: Some("html".into()),
        fields: Some(vec!["description".into()]),
    });

    let body = req.to_body();
    assert_eq!(body["sort"], serde_json::json!(["name", "-age"]));
    assert_eq!(body["ctl"], serde_json::json!({"timeout": 75000}));
    assert_eq!(body["highlight"]["style"], serde_json::json!("html"));
}

#[test]
fn e6_id_sort_serializes_to_object() {
    let mut req = SearchRequest::new("travel-sample", serde_json::Value::Null);
    req.sort = vec![SearchSort::Id];
    let body = req.to_body();
    assert_eq!(body["sort"], serde_json::json!([{"by": "id"}]));
}
