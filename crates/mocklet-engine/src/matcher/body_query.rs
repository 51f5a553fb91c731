//! Request-body query evaluation: JSONPath/XPath extraction plus comparison
//! operators.

use crate::cache::BoundedCache;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bound on the compiled-pattern cache for `Matches`/`NotMatches` operators.
pub const REGEX_CACHE_SIZE: usize = 20;

/// Comparison operator applied to the queried body value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BodyOperator {
    Exists,
    NotExists,
    EqualTo,
    NotEqualTo,
    Contains,
    NotContains,
    Matches,
    NotMatches,
}

/// A body-query clause on a resource rule: one of `jsonPath`/`xPath`, an
/// operator, and an expected value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyQuery {
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default, rename = "xPath")]
    pub x_path: Option<String>,
    pub operator: BodyOperator,
    #[serde(default)]
    pub value: Option<String>,
}

/// Evaluate a body query against the raw request body.
///
/// A malformed body (unparsable JSON/XML) yields "query produced no result",
/// never an error.
pub fn evaluate(
    query: &BodyQuery,
    body: Option<&str>,
    regex_cache: &BoundedCache<String, Regex>,
) -> bool {
    let queried = match (&query.json_path, &query.x_path) {
        (Some(path), _) => body.and_then(|b| query_json(b, path)),
        (None, Some(path)) => body.and_then(|b| query_xml(b, path)),
        (None, None) => None,
    };
    apply_operator(
        query.operator,
        queried.as_deref(),
        query.value.as_deref(),
        regex_cache,
    )
}

fn apply_operator(
    operator: BodyOperator,
    queried: Option<&str>,
    expected: Option<&str>,
    regex_cache: &BoundedCache<String, Regex>,
) -> bool {
    match operator {
        BodyOperator::Exists => queried.is_some(),
        BodyOperator::NotExists => queried.is_none(),
        // Null-safe equality: both-absent counts as equal
        BodyOperator::EqualTo => queried == expected,
        BodyOperator::NotEqualTo => queried != expected,
        BodyOperator::Contains => {
            matches!((queried, expected), (Some(q), Some(e)) if q.contains(e))
        }
        BodyOperator::NotContains => {
            !matches!((queried, expected), (Some(q), Some(e)) if q.contains(e))
        }
        BodyOperator::Matches => regex_matches(queried, expected, regex_cache),
        BodyOperator::NotMatches => !regex_matches(queried, expected, regex_cache),
    }
}

fn regex_matches(
    queried: Option<&str>,
    pattern: Option<&str>,
    regex_cache: &BoundedCache<String, Regex>,
) -> bool {
    let (Some(queried), Some(pattern)) = (queried, pattern) else {
        return false;
    };
    regex_cache
        .get_or_compute(pattern.to_string(), || Regex::new(pattern).ok())
        .map(|re| re.is_match(queried))
        .unwrap_or(false)
}

/// Query a JSON body with a JSONPath expression. A null result counts as no
/// result.
pub(crate) fn query_json(body: &str, path: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    let compiled = serde_json_path::JsonPath::parse(path).ok()?;
    let nodes = compiled.query(&json).all();
    let node = nodes.first()?;
    match node {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Query an XML body with an XPath expression.
pub(crate) fn query_xml(body: &str, path: &str) -> Option<String> {
    use sxd_document::parser;
    use sxd_xpath::{evaluate_xpath, Value};

    let package = parser::parse(body).ok()?;
    let document = package.as_document();

    match evaluate_xpath(&document, path) {
        Ok(Value::String(s)) => Some(s),
        Ok(Value::Number(n)) => Some(n.to_string()),
        Ok(Value::Boolean(b)) => Some(b.to_string()),
        Ok(Value::Nodeset(nodes)) => nodes.iter().next().map(|n| n.string_value()),
        Err(_) => None,
    }
}
