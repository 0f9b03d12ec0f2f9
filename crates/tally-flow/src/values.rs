//! Versioned value stores and the latest-value projection.
//!
//! Metric and activity values are append-only facts: every aggregation
//! pass or dataset run appends new rows and never rewrites history. What
//! readers usually want, though, is "the current value" - so each store
//! also maintains a latest projection with exactly one row per natural
//! key, kept consistent by a conditional upsert:
//!
//! - no latest row yet → insert one
//! - otherwise overwrite iff the new row's `created_at` is greater than
//!   or equal to the existing latest's, and the new row is not an error
//!   row
//!
//! The upsert is applied in the same critical section as the versioned
//! insert, so a reader can never observe a versioned row without its
//! latest projection. Out-of-order arrival of an older value leaves the
//! projection untouched.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{ActivityId, ExecutionId, MetricId, PipelineId};

use crate::error::{Error, Result};

/// Calendar bucket a metric value is aggregated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One calendar day.
    Day,
    /// One ISO week.
    Week,
    /// One calendar month.
    Month,
    /// One calendar quarter.
    Quarter,
    /// One calendar year.
    Year,
}

impl TimeUnit {
    /// Returns the wire name of the unit.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown unit names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            "year" => Ok(Self::Year),
            other => Err(Error::internal(format!("unknown time unit '{other}'"))),
        }
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a metric combines its contributing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationType {
    /// Sum of contributions.
    Sum,
    /// Minimum contribution.
    Min,
    /// Maximum contribution.
    Max,
    /// Number of contributions.
    Count,
    /// Arithmetic mean of contributions.
    Mean,
}

impl AggregationType {
    /// Applies the aggregation to a set of contributions.
    ///
    /// Returns 0.0 for an empty set.
    #[must_use]
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Self::Sum => values.iter().sum(),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            #[allow(clippy::cast_precision_loss)]
            Self::Count => values.len() as f64,
            #[allow(clippy::cast_precision_loss)]
            Self::Mean => values.iter().sum::<f64>() / values.len() as f64,
        }
    }
}

/// The natural key of a metric series: group, date, name, time unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricKey {
    /// The group path the value belongs to.
    pub group_id: String,
    /// The bucket start date.
    pub date: NaiveDate,
    /// The metric name.
    pub name: String,
    /// The bucket size.
    pub time_unit: TimeUnit,
}

/// One appended metric fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueRow {
    /// The execution that produced the value.
    pub execution_id: ExecutionId,
    /// The pipeline that produced the value.
    pub pipeline_id: PipelineId,
    /// When the value was computed.
    pub created_at: DateTime<Utc>,
    /// This group's own direct contribution.
    pub group_value: f64,
    /// The rolled-up contribution of all descendant groups.
    pub sub_groups_value: f64,
}

impl MetricValueRow {
    /// Returns the group's total: its own value plus its descendants'.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.group_value + self.sub_groups_value
    }
}

/// Decides whether a new versioned row should overwrite the latest
/// projection for its key.
///
/// This is the single projection rule shared by metric and activity
/// stores: insert when absent, overwrite only for a non-error row that is
/// at least as new as the current latest. Equal timestamps favor the new
/// row, matching set-based reload semantics.
#[must_use]
pub fn should_project_latest(
    existing_created_at: Option<DateTime<Utc>>,
    new_created_at: DateTime<Utc>,
    new_is_error: bool,
) -> bool {
    if new_is_error {
        return false;
    }
    match existing_created_at {
        None => true,
        Some(existing) => new_created_at >= existing,
    }
}

/// Store of versioned metric values with a latest projection.
#[async_trait]
pub trait MetricValueStore: Send + Sync {
    /// Resolves (creating if absent) the metric ID for a natural key.
    async fn ensure_metric(&self, key: &MetricKey) -> Result<MetricId>;

    /// Appends a versioned value and projects the latest row atomically.
    async fn append(&self, metric_id: MetricId, row: MetricValueRow) -> Result<()>;

    /// Returns the latest projection for a metric, if any.
    async fn latest(&self, metric_id: MetricId) -> Result<Option<MetricValueRow>>;

    /// Returns the latest projections for a metric name under one group,
    /// restricted to a time unit and inclusive date range.
    async fn list_latest(
        &self,
        name: &str,
        group_id: &str,
        time_unit: TimeUnit,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(MetricKey, MetricValueRow)>>;

    /// Returns the latest projections for a metric name across the
    /// immediate child groups of `parent_group`, restricted to a time unit
    /// and inclusive date range.
    ///
    /// Used by hierarchical rollups: a parent's sub-groups value is derived
    /// from its direct children only, never by re-scanning deeper levels.
    async fn list_latest_children(
        &self,
        name: &str,
        parent_group: &str,
        time_unit: TimeUnit,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(MetricKey, MetricValueRow)>>;

    /// Returns the full append-only history for a metric, oldest first.
    async fn history(&self, metric_id: MetricId) -> Result<Vec<MetricValueRow>>;
}

/// Returns true if `child` is an immediate child path of `parent`.
fn is_immediate_child(parent: &str, child: &str) -> bool {
    let remainder = if parent == "/" {
        child.strip_prefix('/')
    } else {
        child
            .strip_prefix(parent)
            .and_then(|rest| rest.strip_prefix('/'))
    };
    remainder.is_some_and(|r| !r.is_empty() && !r.contains('/'))
}

#[derive(Default)]
struct MetricState {
    ids: HashMap<MetricKey, MetricId>,
    keys: HashMap<MetricId, MetricKey>,
    history: HashMap<MetricId, Vec<MetricValueRow>>,
    latest: HashMap<MetricId, MetricValueRow>,
}

/// In-memory metric value store.
///
/// The versioned insert and the latest upsert run under one mutex guard,
/// which is the in-memory equivalent of the single-transaction requirement.
/// Not suitable for production.
#[derive(Default)]
pub struct InMemoryMetricStore {
    state: Mutex<MetricState>,
}

impl InMemoryMetricStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricValueStore for InMemoryMetricStore {
    async fn ensure_metric(&self, key: &MetricKey) -> Result<MetricId> {
        let mut state = self.state.lock().map_err(|_| Error::internal("metric store poisoned"))?;
        if let Some(id) = state.ids.get(key) {
            return Ok(*id);
        }
        let id = MetricId::generate();
        state.ids.insert(key.clone(), id);
        state.keys.insert(id, key.clone());
        Ok(id)
    }

    async fn append(&self, metric_id: MetricId, row: MetricValueRow) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::internal("metric store poisoned"))?;
        if !state.keys.contains_key(&metric_id) {
            return Err(Error::internal(format!(
                "append for unknown metric {metric_id}"
            )));
        }

        let existing = state.latest.get(&metric_id).map(|r| r.created_at);
        if should_project_latest(existing, row.created_at, false) {
            state.latest.insert(metric_id, row.clone());
        }
        state.history.entry(metric_id).or_default().push(row);
        Ok(())
    }

    async fn latest(&self, metric_id: MetricId) -> Result<Option<MetricValueRow>> {
        let state = self.state.lock().map_err(|_| Error::internal("metric store poisoned"))?;
        Ok(state.latest.get(&metric_id).cloned())
    }

    async fn list_latest(
        &self,
        name: &str,
        group_id: &str,
        time_unit: TimeUnit,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(MetricKey, MetricValueRow)>> {
        let state = self.state.lock().map_err(|_| Error::internal("metric store poisoned"))?;
        let mut rows: Vec<(MetricKey, MetricValueRow)> = state
            .ids
            .iter()
            .filter(|(key, _)| {
                key.name == name
                    && key.group_id == group_id
                    && key.time_unit == time_unit
                    && key.date >= from
                    && key.date <= to
            })
            .filter_map(|(key, id)| {
                state.latest.get(id).map(|row| (key.clone(), row.clone()))
            })
            .collect();
        rows.sort_by_key(|(key, _)| key.date);
        Ok(rows)
    }

    async fn list_latest_children(
        &self,
        name: &str,
        parent_group: &str,
        time_unit: TimeUnit,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(MetricKey, MetricValueRow)>> {
        let state = self.state.lock().map_err(|_| Error::internal("metric store poisoned"))?;
        let mut rows: Vec<(MetricKey, MetricValueRow)> = state
            .ids
            .iter()
            .filter(|(key, _)| {
                key.name == name
                    && key.time_unit == time_unit
                    && key.date >= from
                    && key.date <= to
                    && is_immediate_child(parent_group, &key.group_id)
            })
            .filter_map(|(key, id)| {
                state.latest.get(id).map(|row| (key.clone(), row.clone()))
            })
            .collect();
        rows.sort_by(|(a, _), (b, _)| (&a.group_id, a.date).cmp(&(&b.group_id, b.date)));
        Ok(rows)
    }

    async fn history(&self, metric_id: MetricId) -> Result<Vec<MetricValueRow>> {
        let state = self.state.lock().map_err(|_| Error::internal("metric store poisoned"))?;
        Ok(state.history.get(&metric_id).cloned().unwrap_or_default())
    }
}

/// The natural key of a raw activity row within a pipeline's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityKey {
    /// The group path that owns the row.
    pub group_id: String,
    /// The pipeline that produced the row.
    pub pipeline_id: PipelineId,
    /// The activity date.
    pub date: NaiveDate,
    /// The row's unique-key column values, joined.
    pub unique_key: String,
}

/// One appended activity attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityValueRow {
    /// The execution that produced the value.
    pub execution_id: ExecutionId,
    /// When the value was computed.
    pub created_at: DateTime<Utc>,
    /// The numeric value, absent for non-numeric or deleted values.
    pub value: Option<f64>,
    /// Whether the row is a transform error placeholder.
    pub error: bool,
}

/// Store of versioned activity attribute values with a latest projection.
#[async_trait]
pub trait ActivityValueStore: Send + Sync {
    /// Resolves (creating if absent) the activity ID for a natural key.
    async fn ensure_activity(&self, key: &ActivityKey) -> Result<ActivityId>;

    /// Appends a versioned value for one attribute and projects the latest
    /// row atomically.
    ///
    /// Error rows are appended to history but never become the latest
    /// projection.
    async fn append(
        &self,
        activity_id: ActivityId,
        attribute: &str,
        row: ActivityValueRow,
    ) -> Result<()>;

    /// Returns the latest projection for one (activity, attribute).
    async fn latest(
        &self,
        activity_id: ActivityId,
        attribute: &str,
    ) -> Result<Option<ActivityValueRow>>;

    /// Returns the inclusive date range of activities touched by one
    /// execution, or `None` if the execution inserted nothing.
    ///
    /// Drives the affected time range of the triggered aggregation pass.
    async fn affected_date_range(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
    ) -> Result<Option<(NaiveDate, NaiveDate)>>;

    /// Returns the latest numeric values of one attribute for all
    /// activities of a group, bucketed by day, over an inclusive range.
    ///
    /// Only values produced by the given pipelines contribute. Error rows
    /// and non-numeric values never appear.
    async fn day_values(
        &self,
        group_id: &str,
        attribute: &str,
        pipeline_ids: &[PipelineId],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<HashMap<NaiveDate, Vec<f64>>>;
}

#[derive(Default)]
struct ActivityState {
    ids: HashMap<ActivityKey, ActivityId>,
    keys: HashMap<ActivityId, ActivityKey>,
    history: HashMap<(ActivityId, String), Vec<ActivityValueRow>>,
    latest: HashMap<(ActivityId, String), ActivityValueRow>,
}

/// In-memory activity value store.
///
/// Not suitable for production; the mutex-guarded critical section stands
/// in for the single-transaction insert-plus-upsert.
#[derive(Default)]
pub struct InMemoryActivityStore {
    state: Mutex<ActivityState>,
}

impl InMemoryActivityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityValueStore for InMemoryActivityStore {
    async fn ensure_activity(&self, key: &ActivityKey) -> Result<ActivityId> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::internal("activity store poisoned"))?;
        if let Some(id) = state.ids.get(key) {
            return Ok(*id);
        }
        let id = ActivityId::generate();
        state.ids.insert(key.clone(), id);
        state.keys.insert(id, key.clone());
        Ok(id)
    }

    async fn append(
        &self,
        activity_id: ActivityId,
        attribute: &str,
        row: ActivityValueRow,
    ) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::internal("activity store poisoned"))?;
        if !state.keys.contains_key(&activity_id) {
            return Err(Error::internal(format!(
                "append for unknown activity {activity_id}"
            )));
        }

        let slot = (activity_id, attribute.to_string());
        let existing = state.latest.get(&slot).map(|r| r.created_at);
        if should_project_latest(existing, row.created_at, row.error) {
            state.latest.insert(slot.clone(), row.clone());
        }
        state.history.entry(slot).or_default().push(row);
        Ok(())
    }

    async fn latest(
        &self,
        activity_id: ActivityId,
        attribute: &str,
    ) -> Result<Option<ActivityValueRow>> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::internal("activity store poisoned"))?;
        Ok(state.latest.get(&(activity_id, attribute.to_string())).cloned())
    }

    async fn affected_date_range(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
    ) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::internal("activity store poisoned"))?;

        let mut range: Option<(NaiveDate, NaiveDate)> = None;
        for ((activity_id, _), rows) in &state.history {
            let Some(key) = state.keys.get(activity_id) else {
                continue;
            };
            if key.pipeline_id != pipeline_id
                || !rows.iter().any(|r| r.execution_id == execution_id)
            {
                continue;
            }
            range = Some(match range {
                None => (key.date, key.date),
                Some((from, to)) => (from.min(key.date), to.max(key.date)),
            });
        }
        Ok(range)
    }

    async fn day_values(
        &self,
        group_id: &str,
        attribute: &str,
        pipeline_ids: &[PipelineId],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<HashMap<NaiveDate, Vec<f64>>> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::internal("activity store poisoned"))?;

        let mut buckets: HashMap<NaiveDate, Vec<f64>> = HashMap::new();
        for (key, id) in &state.ids {
            if key.group_id != group_id
                || !pipeline_ids.contains(&key.pipeline_id)
                || key.date < from
                || key.date > to
            {
                continue;
            }
            let Some(row) = state.latest.get(&(*id, attribute.to_string())) else {
                continue;
            };
            if let Some(value) = row.value {
                buckets.entry(key.date).or_default().push(value);
            }
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn metric_row(created_at: DateTime<Utc>, group_value: f64) -> MetricValueRow {
        MetricValueRow {
            execution_id: ExecutionId::generate(),
            pipeline_id: PipelineId::generate(),
            created_at,
            group_value,
            sub_groups_value: 0.0,
        }
    }

    #[test]
    fn projection_rule() {
        // No existing latest: always project non-error rows
        assert!(should_project_latest(None, ts(100), false));
        // Error rows never project
        assert!(!should_project_latest(None, ts(100), true));
        // Newer and equal timestamps project
        assert!(should_project_latest(Some(ts(100)), ts(200), false));
        assert!(should_project_latest(Some(ts(100)), ts(100), false));
        // Older timestamps never regress the projection
        assert!(!should_project_latest(Some(ts(200)), ts(100), false));
    }

    #[test]
    fn aggregation_types() {
        let values = [2.0, 8.0, 5.0];
        assert!((AggregationType::Sum.apply(&values) - 15.0).abs() < f64::EPSILON);
        assert!((AggregationType::Min.apply(&values) - 2.0).abs() < f64::EPSILON);
        assert!((AggregationType::Max.apply(&values) - 8.0).abs() < f64::EPSILON);
        assert!((AggregationType::Count.apply(&values) - 3.0).abs() < f64::EPSILON);
        assert!((AggregationType::Mean.apply(&values) - 5.0).abs() < f64::EPSILON);
        assert!(AggregationType::Sum.apply(&[]).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn monotone_inserts_track_the_newest_row() {
        let store = InMemoryMetricStore::new();
        let key = MetricKey {
            group_id: "/usa/co".into(),
            date: date("2023-06-01"),
            name: "ghg:emissions".into(),
            time_unit: TimeUnit::Day,
        };
        let id = store.ensure_metric(&key).await.unwrap();

        for (seconds, value) in [(100, 1.0), (200, 2.0), (300, 3.0)] {
            store.append(id, metric_row(ts(seconds), value)).await.unwrap();
        }

        let latest = store.latest(id).await.unwrap().expect("latest");
        assert!((latest.group_value - 3.0).abs() < f64::EPSILON);
        assert_eq!(store.history(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn out_of_order_insert_does_not_regress_latest() {
        let store = InMemoryMetricStore::new();
        let key = MetricKey {
            group_id: "/usa/co".into(),
            date: date("2023-06-01"),
            name: "ghg:emissions".into(),
            time_unit: TimeUnit::Day,
        };
        let id = store.ensure_metric(&key).await.unwrap();

        store.append(id, metric_row(ts(300), 3.0)).await.unwrap();
        store.append(id, metric_row(ts(100), 1.0)).await.unwrap();

        let latest = store.latest(id).await.unwrap().expect("latest");
        assert!((latest.group_value - 3.0).abs() < f64::EPSILON);
        // History keeps both rows - nothing is overwritten
        assert_eq!(store.history(id).await.unwrap().len(), 2);
    }

    #[test]
    fn immediate_child_detection() {
        assert!(is_immediate_child("/", "/usa"));
        assert!(is_immediate_child("/usa", "/usa/co"));
        assert!(!is_immediate_child("/usa", "/usa/co/denver"));
        assert!(!is_immediate_child("/usa", "/usa"));
        assert!(!is_immediate_child("/usa", "/canada"));
    }

    #[tokio::test]
    async fn children_query_returns_only_direct_children() {
        let store = InMemoryMetricStore::new();
        let row = metric_row(ts(100), 1.0);
        for group in ["/usa/co", "/usa/wa", "/usa/co/denver", "/canada"] {
            let key = MetricKey {
                group_id: group.into(),
                date: date("2023-06-01"),
                name: "ghg:emissions".into(),
                time_unit: TimeUnit::Day,
            };
            let id = store.ensure_metric(&key).await.unwrap();
            store.append(id, row.clone()).await.unwrap();
        }

        let children = store
            .list_latest_children(
                "ghg:emissions",
                "/usa",
                TimeUnit::Day,
                date("2023-06-01"),
                date("2023-06-30"),
            )
            .await
            .unwrap();
        let groups: Vec<&str> = children.iter().map(|(k, _)| k.group_id.as_str()).collect();
        assert_eq!(groups, vec!["/usa/co", "/usa/wa"]);
    }

    #[tokio::test]
    async fn ensure_metric_is_idempotent() {
        let store = InMemoryMetricStore::new();
        let key = MetricKey {
            group_id: "/".into(),
            date: date("2023-06-01"),
            name: "ghg:emissions".into(),
            time_unit: TimeUnit::Month,
        };
        let first = store.ensure_metric(&key).await.unwrap();
        let second = store.ensure_metric(&key).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn error_activity_rows_never_become_latest() {
        let store = InMemoryActivityStore::new();
        let key = ActivityKey {
            group_id: "/usa/co".into(),
            pipeline_id: PipelineId::generate(),
            date: date("2023-06-01"),
            unique_key: "site-1".into(),
        };
        let id = store.ensure_activity(&key).await.unwrap();

        store
            .append(
                id,
                "co2e",
                ActivityValueRow {
                    execution_id: ExecutionId::generate(),
                    created_at: ts(100),
                    value: Some(5.0),
                    error: false,
                },
            )
            .await
            .unwrap();
        store
            .append(
                id,
                "co2e",
                ActivityValueRow {
                    execution_id: ExecutionId::generate(),
                    created_at: ts(200),
                    value: None,
                    error: true,
                },
            )
            .await
            .unwrap();

        let latest = store.latest(id, "co2e").await.unwrap().expect("latest");
        assert!(!latest.error);
        assert_eq!(latest.value, Some(5.0));
    }

    #[tokio::test]
    async fn day_values_filter_by_group_pipeline_and_range() {
        let store = InMemoryActivityStore::new();
        let pipeline = PipelineId::generate();
        let other_pipeline = PipelineId::generate();

        for (group, pid, day, value) in [
            ("/usa/co", pipeline, "2023-06-01", 5.0),
            ("/usa/co", pipeline, "2023-06-01", 7.0),
            ("/usa/co", pipeline, "2023-06-02", 11.0),
            ("/usa/wa", pipeline, "2023-06-01", 100.0),
            ("/usa/co", other_pipeline, "2023-06-01", 999.0),
        ] {
            let key = ActivityKey {
                group_id: group.into(),
                pipeline_id: pid,
                date: date(day),
                unique_key: format!("row-{value}"),
            };
            let id = store.ensure_activity(&key).await.unwrap();
            store
                .append(
                    id,
                    "co2e",
                    ActivityValueRow {
                        execution_id: ExecutionId::generate(),
                        created_at: ts(100),
                        value: Some(value),
                        error: false,
                    },
                )
                .await
                .unwrap();
        }

        let buckets = store
            .day_values(
                "/usa/co",
                "co2e",
                &[pipeline],
                date("2023-06-01"),
                date("2023-06-30"),
            )
            .await
            .unwrap();

        let mut first_day = buckets.get(&date("2023-06-01")).cloned().unwrap();
        first_day.sort_by(f64::total_cmp);
        assert_eq!(first_day, vec![5.0, 7.0]);
        assert_eq!(buckets.get(&date("2023-06-02")).cloned().unwrap(), vec![11.0]);
    }
}
