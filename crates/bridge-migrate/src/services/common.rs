//! Common utilities shared across services.
//!
//! HTTP client creation, status mapping, cell stringification and
//! table reference extraction from query text.

use crate::error::{Error, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Default HTTP timeout for all REST calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates a configured HTTP client with timeout.
#[must_use]
pub fn create_http_client() -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Validates a service endpoint URL.
pub fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::Config(format!(
            "Invalid URL scheme in '{}'. Allowed: http, https",
            url
        )));
    }
    if url.len() < 10 {
        return Err(Error::Config(format!("Invalid URL format: {}", url)));
    }
    Ok(())
}

/// Handles HTTP error responses and returns appropriate errors.
pub fn handle_http_error(status_code: u16, body: &str, service_name: &str) -> Error {
    match status_code {
        429 => Error::RateLimit(60),
        401 | 403 => Error::Authentication(format!("{} auth failed: {}", service_name, body)),
        _ => Error::Remote(format!("{} error {}: {}", service_name, status_code, body)),
    }
}

/// Renders a cell as a plain string.
///
/// Strings are taken verbatim, integral floats lose their fractional part,
/// null becomes the empty string and nested values become compact JSON.
#[must_use]
pub fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if n.is_f64() {
                let f = n.as_f64().unwrap_or_default();
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    #[allow(clippy::cast_possible_truncation)]
                    return (f as i64).to_string();
                }
            }
            n.to_string()
        }
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Extracts the table reference following `FROM` in a query.
pub fn table_ref_from_sql(sql: &str) -> Result<String> {
    let mut tokens = sql.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("from") {
            return tokens
                .next()
                .map(|t| t.trim_end_matches(';').trim_matches('"').to_string())
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::Query(format!("Missing table after FROM in '{}'", sql)));
        }
    }
    Err(Error::Query(format!("No FROM clause in '{}'", sql)))
}

/// Quotes a string literal for a query, doubling embedded single quotes.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
