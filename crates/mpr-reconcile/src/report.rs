//! Discrepancy report: missing ids joined back against the snapshot.
//!
//! Lines are ordered oldest first (`first_seen` ascending, then record id) so
//! two runs over the same data print the same report.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};

use serde_json::{Map, Value};

use crate::engine::ReconcileError;
use crate::{FailureKind, RecordId, RecordMeta, Snapshot};

/// One missing record.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscrepancyLine {
    pub record_id: RecordId,
    /// `first_seen - now` in seconds (negative for records seen in the past).
    pub age_secs: i64,
    pub meta: RecordMeta,
}

impl fmt::Display for DiscrepancyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.age_secs,
            self.record_id,
            render_metadata(&self.meta.fields)
        )
    }
}

/// One record whose verification call failed without an answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnverifiedLine {
    pub record_id: RecordId,
    pub reason: String,
}

impl fmt::Display for UnverifiedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unverified {} {}", self.record_id, self.reason)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiscrepancyReport {
    /// Reference time used for ages (UTC epoch seconds).
    pub generated_at: i64,
    pub missing: Vec<DiscrepancyLine>,
    pub unverified: Vec<UnverifiedLine>,
}

impl DiscrepancyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unverified.is_empty()
    }
}

/// Build the report for `missing` (and `failures`) at reference time `now`.
///
/// Every missing id must be a snapshot key; anything else means the caller
/// submitted ids that did not come from this snapshot.
pub fn build_report(
    snapshot: &Snapshot,
    missing: &BTreeSet<RecordId>,
    failures: &BTreeMap<RecordId, FailureKind>,
    now: i64,
) -> Result<DiscrepancyReport, ReconcileError> {
    let mut lines = Vec::with_capacity(missing.len());
    for id in missing {
        let meta = snapshot
            .get(id)
            .ok_or_else(|| ReconcileError::UnknownRecord(id.clone()))?;
        lines.push(DiscrepancyLine {
            record_id: id.clone(),
            age_secs: meta.first_seen - now,
            meta: meta.clone(),
        });
    }
    lines.sort_by(|a, b| {
        (a.meta.first_seen, &a.record_id).cmp(&(b.meta.first_seen, &b.record_id))
    });

    let unverified = failures
        .iter()
        .map(|(id, kind)| UnverifiedLine {
            record_id: id.clone(),
            reason: kind.to_string(),
        })
        .collect();

    Ok(DiscrepancyReport {
        generated_at: now,
        missing: lines,
        unverified,
    })
}

/// Compact JSON rendering. Numbers are printed exactly as the source sent
/// them, and never in exponent notation (`0.00001`, not `1e-5`).
pub fn render_metadata(fields: &Map<String, Value>) -> String {
    let mut out = String::new();
    render_object(fields, &mut out);
    out
}

fn render_object(fields: &Map<String, Value>, out: &mut String) {
    out.push('{');
    for (i, (k, v)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}:", Value::String(k.clone()));
        render_value(v, out);
    }
    out.push('}');
}

fn render_value(v: &Value, out: &mut String) {
    match v {
        Value::Number(n) => {
            // Numbers keep their source text (`0.00001410` stays as is);
            // only exponent forms are re-rendered as plain decimals.
            let text = n.to_string();
            match n.as_f64() {
                Some(f) if text.contains(['e', 'E']) => {
                    let _ = write!(out, "{f}");
                }
                _ => out.push_str(&text),
            }
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => render_object(map, out),
        other => {
            let _ = write!(out, "{other}");
        }
    }
}
