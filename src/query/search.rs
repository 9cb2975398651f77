//! Full-text Search request body (spec §6 "Query request body (Search
//! example)").

use serde_json::{Map, Value};

use super::Ctl;

/// One element of a Search request's `sort` array. Accepts a bare field
/// name (descending via a leading `-`), the common `SearchSort` object
/// shapes (e.g. `{"by":"id"}`), or arbitrary JSON passed through unchanged.
#[derive(Debug, Clone)]
pub enum SearchSort {
    Field(String),
    Id,
    Score,
    Raw(Value),
}

impl SearchSort {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self::Field(field.into())
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self::Field(format!("-{}", field.into()))
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Field(field) => Value::String(field.clone()),
            Self::Id => serde_json::json!({"by": "id"}),
            Self::Score => serde_json::json!({"by": "score"}),
            Self::Raw(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Highlight {
    pub style: Option<String>,
    pub fields: Option<Vec<String>>,
}

/// A full-text Search request, posted to `POST /<index>/_search`.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub index: String,
    pub query: Value,
    pub size: Option<u32>,
    pub from: Option<u32>,
    pub highlight: Option<Highlight>,
    pub fields: Option<Vec<String>>,
    pub facets: Option<Value>,
    pub explain: Option<bool>,
    pub sort: Vec<SearchSort>,
    pub ctl: Ctl,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>, query: Value) -> Self {
        Self {
            index: index.into(),
            query,
            size: None,
            from: None,
            highlight: None,
            fields: None,
            facets: None,
            explain: None,
            sort: Vec::new(),
            ctl: Ctl::default(),
        }
    }

    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("ctl".to_string(), self.ctl.to_json());
        body.insert("query".to_string(), self.query.clone());
        if let Some(size) = self.size {
            body.insert("size".to_string(), Value::from(size));
        }
        if let Some(from) = self.from {
            body.insert("from".to_string(), Value::from(from));
        }
        if let Some(highlight) = &self.highlight {
            let mut h = Map::new();
            if let Some(style) = &highlight.style {
                h.insert("style".to_string(), Value::String(style.clone()));
            }
            if let Some(fields) = &highlight.fields {
                h.insert("fields".to_string(), Value::from(fields.clone()));
            }
            body.insert("highlight".to_string(), Value::Object(h));
        }
        if let Some(fields) = &self.fields {
            body.insert("fields".to_string(), Value::from(fields.clone()));
        }
        if let Some(facets) = &self.facets {
            body.insert("facets".to_string(), facets.clone());
        }
        if let Some(explain) = self.explain {
            body.insert("explain".to_string(), Value::Bool(explain));
        }
        if !self.sort.is_empty() {
            body.insert("sort".to_string(), Value::Array(self.sort.iter().map(SearchSort::to_json).collect()));
        }
        Value::Object(body)
    }
}
