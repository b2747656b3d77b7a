//! Broadcast response aggregation.
//!
//! A broadcast yields one outcome per daemon: either a response frame
//! or a local failure (connection lost mid-request). `any_aggregate`
//! answers "did anyone manage this" commands (logs, stop, kill);
//! `cat_aggregate` answers "merge everyone's view" commands (ps, run).

use serde_json::{Map, Value};
use tracing::warn;

use corral_core::error::CorralError;
use corral_core::protocol::Response;

/// One daemon's outcome in a broadcast.
pub type Outcome = Result<Response, CorralError>;

fn failure_pair(outcome: &Outcome) -> Option<(i64, String)> {
    match outcome {
        Ok(response) if response.code == 0 => None,
        Ok(response) => {
            let msg = response
                .fields
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            Some((response.code, msg))
        }
        Err(err) => Some((err.code(), err.to_string())),
    }
}

/// Return the first successful response's fields. If every daemon
/// failed, report the most common `(code, msg)` pair as a wrapped
/// daemon error.
pub fn any_aggregate(outcomes: Vec<Outcome>) -> Result<Map<String, Value>, CorralError> {
    let mut failures: Vec<((i64, String), usize)> = Vec::new();
    for outcome in outcomes {
        match failure_pair(&outcome) {
            None => {
                let response = outcome.expect("success outcome");
                return Ok(response.fields);
            }
            Some(pair) => match failures.iter_mut().find(|(seen, _)| *seen == pair) {
                Some((_, count)) => *count += 1,
                None => failures.push((pair, 1)),
            },
        }
    }
    // Ties break toward the first pair seen.
    match failures.iter().max_by_key(|(_, count)| *count) {
        Some(((code, msg), _)) => Err(CorralError::Daemon {
            code: *code,
            msg: msg.clone(),
        }),
        None => Err(CorralError::Daemon {
            code: -1,
            msg: "no daemons connected".into(),
        }),
    }
}

/// Merge every daemon's fields: lists concatenate, objects merge with
/// later entries winning per key, scalars keep the last value written.
/// Any failure short-circuits to a wrapped daemon error.
pub fn cat_aggregate(outcomes: Vec<Outcome>) -> Result<Map<String, Value>, CorralError> {
    let mut merged = Map::new();
    for outcome in outcomes {
        if let Some((code, msg)) = failure_pair(&outcome) {
            return Err(CorralError::Daemon { code, msg });
        }
        let response = outcome.expect("success outcome");
        for (key, value) in response.fields {
            match (merged.get_mut(&key), value) {
                (Some(Value::Array(acc)), Value::Array(mut items)) => {
                    acc.append(&mut items);
                }
                (Some(Value::Object(acc)), Value::Object(entries)) => {
                    for (k, v) in entries {
                        acc.insert(k, v);
                    }
                }
                (existing, value) => {
                    if let Some(existing) = existing {
                        if *existing != value && !existing.is_array() && !existing.is_object() {
                            warn!(%key, "daemons disagree on scalar field, keeping the last");
                        }
                    }
                    merged.insert(key, value);
                }
            }
        }
    }
    Ok(merged)
}
