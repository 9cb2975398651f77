//! Map/reduce View request, issued as `GET /<bucket>/_design/<ddoc>/_view/<view>`.

use super::Ctl;

#[derive(Debug, Clone)]
pub struct ViewRequest {
    pub bucket: String,
    pub design_doc: String,
    pub view: String,
    pub params: Vec<(String, String)>,
    pub ctl: Ctl,
}

impl ViewRequest {
    pub fn new(bucket: impl Into<String>, design_doc: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            design_doc: design_doc.into(),
            view: view.into(),
            params: Vec::new(),
            ctl: Ctl::default(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn path(&self) -> String {
        format!("/{}/_design/{}/_view/{}", self.bucket, self.design_doc, self.view)
    }

    /// Views express their `ctl.timeout` as a `connection_timeout` query
    /// parameter rather than a JSON body field, since the request itself
    /// carries no body.
    pub fn query_params(&self) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        params.push(("connection_timeout".to_string(), self.ctl.timeout_ms.to_string()));
        params
    }

    pub fn rows_key(&self) -> &'static str {
        "rows"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_design_doc_path() {
        let req = ViewRequest::new("travel-sample", "hotels", "by_city").param("stale", "false");
        assert_eq!(req.path(), "/travel-sample/_design/hotels/_view/by_city");
        assert!(req.query_params().iter().any(|(k, v)| k == "stale" && v == "false"));
        assert!(req.query_params().iter().any(|(k, _)| k == "connection_timeout"));
    }
}
