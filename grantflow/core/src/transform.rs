//! Raw record to canonical schema mapping
//!
//! Raw records arrive as loosely shaped JSON objects whose field names vary
//! slightly between sources. The transformer maps them into the canonical
//! concession schema and tags them with the caller-supplied regime. A
//! malformed record fails on its own; the caller counts it and moves on.

use chrono::NaiveDate;
use grantflow_schemas::{CanonicalRecord, RegimeTag};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("record is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unparseable grant date '{0}'")]
    InvalidDate(String),

    #[error("unparseable amount '{0}'")]
    InvalidAmount(String),
}

/// Map one raw record into the canonical schema under the given regime
pub fn transform_record(
    raw: &Value,
    regime: RegimeTag,
) -> Result<CanonicalRecord, TransformError> {
    let source_id = string_field(raw, "id").ok_or(TransformError::MissingField("id"))?;

    let date_raw = string_field(raw, "grantDate")
        .or_else(|| string_field(raw, "date"))
        .ok_or(TransformError::MissingField("grantDate"))?;
    let grant_date = parse_grant_date(&date_raw)?;

    let beneficiary =
        string_field(raw, "beneficiary").ok_or(TransformError::MissingField("beneficiary"))?;

    let amount_value = raw
        .get("amount")
        .or_else(|| raw.get("equivalentAmount"))
        .ok_or(TransformError::MissingField("amount"))?;
    let amount = parse_amount(amount_value)?;

    Ok(CanonicalRecord {
        source_id,
        grant_date,
        regime,
        beneficiary,
        call_reference: string_field(raw, "callReference"),
        amount,
        instrument: string_field(raw, "instrument"),
    })
}

// sources disagree on whether identifiers and amounts arrive as strings or
// numbers, so accept both
fn string_field(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(clean_field(s)),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn clean_field(s: &str) -> String {
    s.trim_start_matches('\u{feff}').trim().to_string()
}

fn parse_grant_date(raw: &str) -> Result<NaiveDate, TransformError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .map_err(|_| TransformError::InvalidDate(raw.to_string()))
}

fn parse_amount(raw: &Value) -> Result<f64, TransformError> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| TransformError::InvalidAmount(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| TransformError::InvalidAmount(s.clone())),
        other => Err(TransformError::InvalidAmount(other.to_string())),
    }
}
