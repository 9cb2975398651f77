//! Analytics request body, posted to `POST /analytics/service`.

use serde_json::{Map, Value};

use super::Ctl;

#[derive(Debug, Clone)]
pub struct AnalyticsRequest {
    pub statement: String,
    pub ctl: Ctl,
}

impl AnalyticsRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            ctl: Ctl::default(),
        }
    }

    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("statement".to_string(), Value::String(self.statement.clone()));
        body.insert("timeout".to_string(), Value::String(format!("{}ms", self.ctl.timeout_ms)));
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
        let req = AnalyticsRequest::new("SELECT COUNT(*) FROM dataset");
        let body = req.to_body();
        assert_eq!(body["statement"], "SELECT COUNT(*) FROM dataset");
        assert_eq!(body["timeout"], "75000ms");
    }
}
