//! Value parsers for command line flags.

use std::{
    collections::BTreeMap,
    sync::OnceLock,
};

use regex::Regex;
use serde_json::{
    Map,
    Value,
};

use crate::backend::gcp::BACKEND_NAME as GOOGLE_BATCH;

const SA_DOMAIN: &str = ".iam.gserviceaccount.com";

// user-managed accounts only: name@PROJECT_ID.iam.gserviceaccount.com
const SA_PATTERN: &str = r"^(?P<name>[a-z][a-z0-9-]*)@(?P<project>[a-z][a-z0-9-]*)\.iam\.gserviceaccount\.com$";

fn service_account_regex() -> &'static Regex {
    static SA_RE: OnceLock<Regex> = OnceLock::new();
    SA_RE.get_or_init(|| Regex::new(SA_PATTERN).expect("service account regex must compile"))
}

// `gs://bucket`, `gs://bucket/` or `bucket`
pub fn bucket_name(value: &str) -> Result<String, String> {
    let bucket = crate::config::normalize_bucket(value);
    if bucket.is_empty() {
        return Err("base bucket cannot be empty".to_string());
    }
    if bucket.contains('/') {
        return Err(format!("`{value}` is not a bucket name"));
    }
    Ok(bucket)
}

/// `name@project.iam.gserviceaccount.com`, both parts `[a-z][a-z0-9-]*`.
pub fn service_account_email(value: &str) -> Result<String, String> {
    if service_account_regex().is_match(value) {
        Ok(value.to_string())
    } else {
        Err(format!(
            "invalid service account email `{value}`, expected `name@PROJECT_ID{SA_DOMAIN}`"
        ))
    }
}

pub fn json_object(value: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(r#"expected a JSON object, e.g. '{"key": "value"}'"#.to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

// labels must be flat string pairs
pub fn labels(value: &str) -> Result<BTreeMap<String, String>, String> {
    json_object(value)?
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => Ok((k, s)),
            other => Err(format!("label `{k}` must be a string, got `{other}`")),
        })
        .collect()
}

pub fn positive_int(value: &str) -> Result<u32, String> {
    let n: i64 = value
        .trim()
        .parse()
        .map_err(|_| format!("expected a positive integer, got `{value}`"))?;
    if n <= 0 {
        return Err("value must be greater than zero".to_string());
    }
    u32::try_from(n).map_err(|_| format!("`{value}` is too large"))
}

pub fn backend_alias(value: &str) -> Result<String, String> {
    match value.to_lowercase().as_str() {
        "google-batch" | "gcp-batch" => Ok(GOOGLE_BATCH.to_string()),
        _ => Err(format!("backend must be `{GOOGLE_BATCH}` (alias: `gcp-batch`)")),
    }
}
