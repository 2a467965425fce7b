//! Dashboard protocol types
//!
//! The dashboard is a JSON datasource plugin. Its requests nest the actual
//! query as a JSON document inside a string field, and it tolerates loosely
//! formed bodies, so parsing here never fails: missing or malformed fields
//! read as empty strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::filter::RecordRow;

/// Column of a [`TableResponse`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableColumn {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Table answer to a `/query` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableResponse {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Vec<String>>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl TableResponse {
    /// Rows of one sub filter, or a single `"empty"` placeholder row
    pub fn records(query: &RecordQuery, records: Vec<RecordRow>) -> Self {
        let columns = ["target", "filter", "sub_filter", "summary", "message"]
            .into_iter()
            .map(|text| TableColumn {
                text: text.to_string(),
                kind: "string".to_string(),
            })
            .collect();

        let row = |summary: String, message: String| {
            vec![
                query.target.clone(),
                query.filter.clone(),
                query.sub_filter.clone(),
                summary,
                message,
            ]
        };

        let mut rows: Vec<_> = records
            .into_iter()
            .map(|record| row(record.summary, record.message))
            .collect();
        if rows.is_empty() {
            rows.push(row("empty".to_string(), "empty".to_string()));
        }

        Self {
            columns,
            rows,
            kind: "table".to_string(),
        }
    }
}

/// Entry of a `/variable` answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variable {
    #[serde(rename = "__text")]
    pub text: String,
    #[serde(rename = "__value")]
    pub value: String,
}

impl From<String> for Variable {
    fn from(name: String) -> Self {
        Self {
            text: name.clone(),
            value: name,
        }
    }
}

/// `{type, target, filter}` query behind `/search` and `/variable`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableQuery {
    pub tier: String,
    pub target: String,
    pub filter: String,
}

impl VariableQuery {
    /// `/search` body: `{"target": "<query json>"}`
    pub fn from_search(body: &str) -> Self {
        Self::from_value(lookup(&parse(body), "/target"))
    }

    /// `/variable` body: `{"payload": {"target": "<query json>"}}`
    pub fn from_variable(body: &str) -> Self {
        Self::from_value(lookup(&parse(body), "/payload/target"))
    }

    fn from_value(query: Option<&Value>) -> Self {
        // the query is usually a string holding json, but accept it inline
        let query = match query {
            Some(Value::String(raw)) => parse(raw),
            Some(value) => value.clone(),
            None => Value::Null,
        };
        Self {
            tier: text(&query, "/type"),
            target: text(&query, "/target"),
            filter: text(&query, "/filter"),
        }
    }
}

/// Sub filter addressed by a `/query` request through its scoped variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub target: String,
    pub filter: String,
    pub sub_filter: String,
}

impl RecordQuery {
    pub fn from_body(body: &str) -> Self {
        let body = parse(body);
        Self {
            target: text(&body, "/scopedVars/target/text"),
            filter: text(&body, "/scopedVars/filter/text"),
            sub_filter: text(&body, "/scopedVars/sub_filter/text"),
        }
    }
}

fn parse(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

fn lookup<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    value.pointer(pointer)
}

fn text(value: &Value, pointer: &str) -> String {
    match lookup(value, pointer) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
