//! Normalization of a verbose `getrawmempool` result into a [`Snapshot`].

use mpr_reconcile::{RecordMeta, Snapshot, SnapshotError};
use serde_json::Value;

/// Turn the `result` object of `getrawmempool true` into a snapshot.
///
/// Every entry must be an object carrying an integer `time` field (first-seen,
/// UTC epoch seconds). The whole entry is kept as the record's metadata.
pub fn parse_verbose_mempool(result: Value, fetched_at: i64) -> Result<Snapshot, SnapshotError> {
    let entries = match result {
        Value::Object(map) => map,
        other => {
            return Err(SnapshotError::Decode(format!(
                "expected verbose mempool object, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut snapshot = Snapshot::empty_at(fetched_at);
    for (txid, entry) in entries {
        let fields = match entry {
            Value::Object(fields) => fields,
            other => {
                return Err(SnapshotError::Decode(format!(
                    "mempool entry {txid}: expected object, got {}",
                    json_kind(&other)
                )))
            }
        };
        let first_seen = fields
            .get("time")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                SnapshotError::Decode(format!("mempool entry {txid}: missing integer 'time'"))
            })?;
        snapshot.insert(txid, RecordMeta::new(first_seen, fields));
    }
    Ok(snapshot)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
