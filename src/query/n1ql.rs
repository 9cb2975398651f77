//! N1QL request body, posted to `POST /query/service`.

use serde_json::{Map, Value};

use super::Ctl;

#[derive(Debug, Clone)]
pub struct N1qlRequest {
    pub statement: String,
    pub args: Option<Vec<Value>>,
    pub ctl: Ctl,
}

impl N1qlRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            args: None,
            ctl: Ctl::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("statement".to_string(), Value::String(self.statement.clone()));
        if let Some(args) = &self.args {
            body.insert("args".to_string(), Value::from(args.clone()));
        }
        let ctl = self.ctl.to_json();
        body.insert("timeout".to_string(), Value::String(format!("{}ms", self.ctl.timeout_ms)));
        if let Some(consistency) = ctl.get("consistency") {
            body.insert("scan_consistency".to_string(), consistency["level"].clone());
        }
        Value::Object(body)
    }

    pub fn rows_key(&self) -> &'static str {
        "results"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_statement_and_timeout() {
        let req = N1qlRequest::new("SELECT * FROM `default`");
        let body = req.to_body();
        assert_eq!(body["statement"], "SELECT * FROM `default`");
        assert_eq!(body["timeout"], "75000ms");
        assert!(body.get("args").is_none());
    }

    #[test]
    fn carries_positional_args() {
        let req = N1qlRequest::new("SELECT $1").with_args(vec![Value::from(42)]);
        assert_eq!(req.to_body()["args"], serde_json::json!([42]));
    }
}
