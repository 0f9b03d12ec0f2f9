//! Metrics bulk-load contract.
//!
//! Metric values can be reloaded in bulk (migrations, tenant restores)
//! through a CSV staging artifact with an exact column order:
//!
//! ```text
//! metricId,groupId,date,timeUnit,name,executionId,pipelineId,createdAt,groupValue,subGroupsValue,isLatest
//! ```
//!
//! The staging artifact is parsed and merged set-based into the versioned
//! and latest stores, keyed on (groupId, date, name, timeUnit). Rows are
//! applied oldest-first so the latest projection lands on the row flagged
//! `isLatest`; an artifact whose flags contradict its timestamps is
//! rejected rather than silently produce a diverging projection.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use tally_core::{ExecutionId, MetricId, PipelineId};

use crate::error::{Error, Result};
use crate::values::{MetricKey, MetricValueRow, MetricValueStore, TimeUnit};

/// The exact staging header, a compatibility contract.
pub const STAGING_HEADER: &str =
    "metricId,groupId,date,timeUnit,name,executionId,pipelineId,createdAt,groupValue,subGroupsValue,isLatest";

/// One staging row.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRow {
    /// Source metric ID (informational; merge resolves by natural key).
    pub metric_id: MetricId,
    /// The group path.
    pub group_id: String,
    /// The bucket start date.
    pub date: NaiveDate,
    /// The bucket size.
    pub time_unit: TimeUnit,
    /// The metric name.
    pub name: String,
    /// The producing execution.
    pub execution_id: ExecutionId,
    /// The producing pipeline.
    pub pipeline_id: PipelineId,
    /// When the value was computed.
    pub created_at: DateTime<Utc>,
    /// The group's own contribution.
    pub group_value: f64,
    /// The rolled-up descendants' contribution.
    pub sub_groups_value: f64,
    /// Whether this row is the current latest for its key.
    pub is_latest: bool,
}

impl BulkRow {
    fn key(&self) -> MetricKey {
        MetricKey {
            group_id: self.group_id.clone(),
            date: self.date,
            name: self.name.clone(),
            time_unit: self.time_unit,
        }
    }
}

/// Serializes staging rows to CSV, header first.
#[must_use]
pub fn to_staging_csv(rows: &[BulkRow]) -> String {
    let mut out = String::with_capacity(rows.len() * 128 + STAGING_HEADER.len() + 1);
    out.push_str(STAGING_HEADER);
    out.push('\n');
    for row in rows {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{}",
            row.metric_id,
            escape(&row.group_id),
            row.date.format("%Y-%m-%d"),
            row.time_unit,
            escape(&row.name),
            row.execution_id,
            row.pipeline_id,
            row.created_at.to_rfc3339(),
            row.group_value,
            row.sub_groups_value,
            row.is_latest,
        );
    }
    out
}

/// Parses a staging artifact.
///
/// # Errors
///
/// Returns an error when the header deviates from the contract or a row
/// fails to parse.
pub fn from_staging_csv(data: &str) -> Result<Vec<BulkRow>> {
    let mut lines = data.lines();
    let header = lines
        .next()
        .ok_or_else(|| Error::internal("empty staging artifact"))?;
    if header != STAGING_HEADER {
        return Err(Error::internal(format!(
            "staging header mismatch: got '{header}'"
        )));
    }

    let mut rows = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        rows.push(parse_row(line).map_err(|e| {
            Error::internal(format!("staging row {}: {e}", line_no + 2))
        })?);
    }
    Ok(rows)
}

/// Merges staging rows into the versioned and latest stores.
///
/// Rows are grouped by natural key and applied oldest-first; the latest
/// projection follows the conditional-upsert rule, so the end state per
/// key matches the row flagged `isLatest`.
///
/// # Errors
///
/// Returns an error if a key's `isLatest` flag does not sit on its newest
/// row, or a store operation fails.
pub async fn load_staging(store: &Arc<dyn MetricValueStore>, rows: Vec<BulkRow>) -> Result<u64> {
    let mut by_key: HashMap<MetricKey, Vec<BulkRow>> = HashMap::new();
    for row in rows {
        by_key.entry(row.key()).or_default().push(row);
    }

    let mut inserted = 0u64;
    for (key, mut rows) in by_key {
        rows.sort_by_key(|r| r.created_at);

        let newest = rows.last().map(|r| r.created_at);
        for row in &rows {
            let flag_consistent = row.is_latest == (Some(row.created_at) == newest);
            if !flag_consistent {
                return Err(Error::internal(format!(
                    "isLatest flag contradicts createdAt order for {} {} {} {}",
                    key.group_id, key.date, key.name, key.time_unit
                )));
            }
        }

        let metric_id = store.ensure_metric(&key).await?;
        for row in rows {
            store
                .append(
                    metric_id,
                    MetricValueRow {
                        execution_id: row.execution_id,
                        pipeline_id: row.pipeline_id,
                        created_at: row.created_at,
                        group_value: row.group_value,
                        sub_groups_value: row.sub_groups_value,
                    },
                )
                .await?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

fn escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

fn parse_row(line: &str) -> Result<BulkRow> {
    let fields = split_row(line);
    if fields.len() != 11 {
        return Err(Error::internal(format!(
            "expected 11 columns, got {}",
            fields.len()
        )));
    }

    Ok(BulkRow {
        metric_id: MetricId::from_str(&fields[0])?,
        group_id: fields[1].clone(),
        date: fields[2]
            .parse()
            .map_err(|e| Error::internal(format!("bad date '{}': {e}", fields[2])))?,
        time_unit: TimeUnit::parse(&fields[3])?,
        name: fields[4].clone(),
        execution_id: ExecutionId::from_str(&fields[5])?,
        pipeline_id: PipelineId::from_str(&fields[6])?,
        created_at: DateTime::parse_from_rfc3339(&fields[7])
            .map_err(|e| Error::internal(format!("bad createdAt '{}': {e}", fields[7])))?
            .with_timezone(&Utc),
        group_value: fields[8]
            .parse()
            .map_err(|e| Error::internal(format!("bad groupValue '{}': {e}", fields[8])))?,
        sub_groups_value: fields[9]
            .parse()
            .map_err(|e| Error::internal(format!("bad subGroupsValue '{}': {e}", fields[9])))?,
        is_latest: fields[10]
            .parse()
            .map_err(|e| Error::internal(format!("bad isLatest '{}': {e}", fields[10])))?,
    })
}
