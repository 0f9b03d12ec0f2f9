//! Lock-guarded hierarchical metric aggregation.
//!
//! An aggregation pass recomputes a metric's values for every group that
//! contributed to an execution, plus all of their ancestors:
//!
//! 1. Build a [`GroupHierarchy`] from the contributing group paths and
//!    take its leaf paths
//! 2. Process the union of all leaf-to-root chains bottom-up (deepest
//!    groups first): a group's own day-level contribution comes from raw
//!    activity values, its sub-groups contribution from the
//!    already-computed latest values of its direct children - higher
//!    levels never re-scan raw data
//! 3. Roll day buckets up the chain day→week, day→month, month→quarter,
//!    quarter→year
//!
//! Every write appends a versioned [`MetricValueRow`] and drives the
//! latest projection; history is never rewritten. The whole pass runs
//! under a `metricAggregation` lock so two concurrent executions cannot
//! interleave partial sums for the same target, and each pass records an
//! [`AggregationJob`] for observability.
//!
//! Time buckets use ISO weeks and calendar months/quarters/years. The
//! hierarchy dimension always sums child totals (a parent's total is its
//! own value plus its descendants'); the metric's aggregation type applies
//! where raw activity values enter at the leaves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use tally_core::{
    Error as CoreError, ExecutionId, JobId, LockManager, LockScope, PipelineId, ScopedStorage,
    WritePrecondition,
};

use crate::error::{Error, Result};
use crate::hierarchy::{ancestor_chain, GroupHierarchy};
use crate::metrics::{record_lock_conflict, TimingGuard};
use crate::paths;
use crate::values::{
    ActivityValueStore, AggregationType, MetricKey, MetricValueRow, MetricValueStore, TimeUnit,
};

/// Binds one pipeline output column to a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPipeline {
    /// The contributing pipeline.
    pub pipeline_id: PipelineId,
    /// The output column whose values feed the metric.
    pub output: String,
}

/// A metric definition: what to aggregate and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    /// The metric name.
    pub name: String,
    /// How contributing raw values combine at the leaves.
    pub aggregation_type: AggregationType,
    /// The pipeline outputs feeding the metric.
    pub input_pipelines: Vec<InputPipeline>,
}

/// Inclusive date range affected by an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    /// First affected date.
    pub from: NaiveDate,
    /// Last affected date.
    pub to: NaiveDate,
}

/// Aggregation job status surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The pass is running.
    InProgress,
    /// The pass completed.
    Succeeded,
    /// The pass failed; the error is in the job record.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Record of one aggregation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationJob {
    /// Unique job ID.
    pub id: JobId,
    /// The metric the pass aggregated.
    pub metric_name: String,
    /// The pipeline whose execution triggered the pass.
    pub pipeline_id: PipelineId,
    /// The triggering execution.
    pub execution_id: ExecutionId,
    /// Current status.
    pub status: JobStatus,
    /// Failure detail, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// When the job started.
    pub created_at: DateTime<Utc>,
    /// When the job record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Source of metric definitions, keyed by name.
///
/// Metric management is an external collaborator; the engine only resolves
/// the definitions named by a pipeline's transform outputs.
#[async_trait::async_trait]
pub trait MetricCatalog: Send + Sync {
    /// Looks up a metric definition by name.
    async fn get_by_name(&self, name: &str) -> Result<Option<MetricDefinition>>;
}

/// In-memory metric catalog for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMetricCatalog {
    metrics: std::sync::RwLock<HashMap<String, MetricDefinition>>,
}

impl InMemoryMetricCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a metric definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog lock is poisoned.
    pub fn insert(&self, metric: MetricDefinition) -> Result<()> {
        self.metrics
            .write()
            .map_err(|_| Error::internal("metric catalog poisoned"))?
            .insert(metric.name.clone(), metric);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetricCatalog for InMemoryMetricCatalog {
    async fn get_by_name(&self, name: &str) -> Result<Option<MetricDefinition>> {
        Ok(self
            .metrics
            .read()
            .map_err(|_| Error::internal("metric catalog poisoned"))?
            .get(name)
            .cloned())
    }
}

/// Runs lock-guarded aggregation passes.
pub struct MetricAggregator {
    storage: ScopedStorage,
    locks: LockManager,
    metric_store: Arc<dyn MetricValueStore>,
    activity_store: Arc<dyn ActivityValueStore>,
    lock_ttl: std::time::Duration,
}

impl MetricAggregator {
    /// Creates a new aggregator.
    #[must_use]
    pub fn new(
        storage: ScopedStorage,
        locks: LockManager,
        metric_store: Arc<dyn MetricValueStore>,
        activity_store: Arc<dyn ActivityValueStore>,
        lock_ttl: std::time::Duration,
    ) -> Self {
        Self {
            storage,
            locks,
            metric_store,
            activity_store,
            lock_ttl,
        }
    }

    /// Runs one aggregation pass for a metric.
    ///
    /// `group_paths` is the flat list of group paths that contributed data
    /// during the execution; the pass fans out over their leaf set and
    /// rolls up every ancestor to the root.
    ///
    /// # Errors
    ///
    /// Returns a lock conflict if a pass for the same target is already in
    /// flight; any other failure marks the job `FAILED` and is returned
    /// after the lock is released.
    #[tracing::instrument(
        skip(self, metric, group_paths),
        fields(metric_name = %metric.name, pipeline_id = %pipeline_id, execution_id = %execution_id)
    )]
    pub async fn aggregate(
        &self,
        metric: &MetricDefinition,
        group_paths: &[String],
        range: DateRange,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
    ) -> Result<AggregationJob> {
        let _timing = TimingGuard::new(crate::metrics::observe_aggregation_duration);

        let lock_key = format!("{}:{}", metric.name, TimeUnit::Day);
        let guard = match self
            .locks
            .acquire_with_operation(
                LockScope::MetricAggregation,
                &lock_key,
                self.lock_ttl,
                Some(format!("aggregate {} for {execution_id}", metric.name)),
            )
            .await
        {
            Ok(guard) => guard,
            Err(e @ CoreError::LockHeld { .. }) => {
                record_lock_conflict(LockScope::MetricAggregation.as_str());
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut job = AggregationJob {
            id: JobId::generate(),
            metric_name: metric.name.clone(),
            pipeline_id,
            execution_id,
            status: JobStatus::InProgress,
            status_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.save_job(&job).await?;

        let outcome = self
            .run_pass(metric, group_paths, range, pipeline_id, execution_id)
            .await;

        match outcome {
            Ok(()) => {
                job.status = JobStatus::Succeeded;
                job.updated_at = Utc::now();
                self.save_job(&job).await?;
                guard.release().await?;
                Ok(job)
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.status_message = Some(e.to_string());
                job.updated_at = Utc::now();
                self.save_job(&job).await?;
                guard.release().await?;
                Err(e)
            }
        }
    }

    /// Loads an aggregation job record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or unreadable.
    pub async fn get_job(&self, job_id: JobId) -> Result<AggregationJob> {
        let data = self
            .storage
            .get(&paths::aggregation_job_path(job_id))
            .await
            .map_err(|e| match e {
                CoreError::NotFound(_) => {
                    CoreError::resource_not_found("aggregationJob", job_id).into()
                }
                other => Error::Core(other),
            })?;
        Ok(serde_json::from_slice(&data).map_err(CoreError::serialization)?)
    }

    async fn save_job(&self, job: &AggregationJob) -> Result<()> {
        let record = Bytes::from(serde_json::to_vec(job).map_err(CoreError::serialization)?);
        self.storage
            .put(
                &paths::aggregation_job_path(job.id),
                record,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    async fn run_pass(
        &self,
        metric: &MetricDefinition,
        group_paths: &[String],
        range: DateRange,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
    ) -> Result<()> {
        let hierarchy = GroupHierarchy::from_paths(group_paths);
        let leaves = hierarchy.leaf_paths();
        tracing::debug!(leaves = ?leaves, "aggregation fan-out targets");

        let created_at = Utc::now();

        for group_id in bottom_up_groups(&leaves) {
            self.aggregate_day_level(
                metric,
                &group_id,
                range,
                pipeline_id,
                execution_id,
                created_at,
            )
            .await?;

            for (from_unit, to_unit) in [
                (TimeUnit::Day, TimeUnit::Week),
                (TimeUnit::Day, TimeUnit::Month),
                (TimeUnit::Month, TimeUnit::Quarter),
                (TimeUnit::Quarter, TimeUnit::Year),
            ] {
                self.roll_up_time_unit(
                    metric,
                    &group_id,
                    range,
                    from_unit,
                    to_unit,
                    pipeline_id,
                    execution_id,
                    created_at,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Computes a group's day-level values from raw activities plus its
    /// direct children's latest day values.
    async fn aggregate_day_level(
        &self,
        metric: &MetricDefinition,
        group_id: &str,
        range: DateRange,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut own: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
        for binding in &metric.input_pipelines {
            let buckets = self
                .activity_store
                .day_values(
                    group_id,
                    &binding.output,
                    &[binding.pipeline_id],
                    range.from,
                    range.to,
                )
                .await?;
            for (date, mut values) in buckets {
                own.entry(date).or_default().append(&mut values);
            }
        }

        let children = self
            .metric_store
            .list_latest_children(&metric.name, group_id, TimeUnit::Day, range.from, range.to)
            .await?;
        let mut sub_groups: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for (key, row) in children {
            *sub_groups.entry(key.date).or_default() += row.total();
        }

        let mut dates: Vec<NaiveDate> = own.keys().copied().collect();
        for date in sub_groups.keys() {
            if !own.contains_key(date) {
                dates.push(*date);
            }
        }
        dates.sort_unstable();

        for date in dates {
            let group_value = own
                .get(&date)
                .map_or(0.0, |values| metric.aggregation_type.apply(values));
            let sub_groups_value = sub_groups.get(&date).copied().unwrap_or(0.0);

            let key = MetricKey {
                group_id: group_id.to_string(),
                date,
                name: metric.name.clone(),
                time_unit: TimeUnit::Day,
            };
            let metric_id = self.metric_store.ensure_metric(&key).await?;
            self.metric_store
                .append(
                    metric_id,
                    MetricValueRow {
                        execution_id,
                        pipeline_id,
                        created_at,
                        group_value,
                        sub_groups_value,
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// Rolls a group's finer-grained buckets up to a coarser time unit.
    ///
    /// The range widens to whole target buckets so a partial unit is never
    /// aggregated from partial data.
    #[allow(clippy::too_many_arguments)]
    async fn roll_up_time_unit(
        &self,
        metric: &MetricDefinition,
        group_id: &str,
        range: DateRange,
        from_unit: TimeUnit,
        to_unit: TimeUnit,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let widened_from = bucket_start(range.from, to_unit);
        let widened_to = bucket_end(range.to, to_unit);

        let source = self
            .metric_store
            .list_latest(&metric.name, group_id, from_unit, widened_from, widened_to)
            .await?;
        if source.is_empty() {
            return Ok(());
        }

        let mut buckets: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();
        for (key, row) in source {
            let bucket = buckets
                .entry(bucket_start(key.date, to_unit))
                .or_insert((0.0, 0.0));
            bucket.0 += row.group_value;
            bucket.1 += row.sub_groups_value;
        }

        for (date, (group_value, sub_groups_value)) in buckets {
            let key = MetricKey {
                group_id: group_id.to_string(),
                date,
                name: metric.name.clone(),
                time_unit: to_unit,
            };
            let metric_id = self.metric_store.ensure_metric(&key).await?;
            self.metric_store
                .append(
                    metric_id,
                    MetricValueRow {
                        execution_id,
                        pipeline_id,
                        created_at,
                        group_value,
                        sub_groups_value,
                    },
                )
                .await?;
        }

        Ok(())
    }
}

/// Returns the union of all leaf-to-root chains, deepest groups first.
///
/// Each group appears once, and every group is preceded by all of its
/// descendants in the list - the order that makes child latest values
/// available before their parent reads them.
fn bottom_up_groups(leaves: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for leaf in leaves {
        for group in ancestor_chain(leaf) {
            if !seen.contains(&group) {
                seen.push(group);
            }
        }
    }
    seen.sort_by_key(|g| std::cmp::Reverse(depth_of(g)));
    seen
}

fn depth_of(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// Returns the first date of the bucket containing `date`.
#[must_use]
pub fn bucket_start(date: NaiveDate, unit: TimeUnit) -> NaiveDate {
    match unit {
        TimeUnit::Day => date,
        TimeUnit::Week => {
            let week = date.iso_week();
            NaiveDate::from_isoywd_opt(week.year(), week.week(), Weekday::Mon).unwrap_or(date)
        }
        TimeUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date),
        TimeUnit::Quarter => {
            let quarter_month = ((date.month() - 1) / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(date.year(), quarter_month, 1).unwrap_or(date)
        }
        TimeUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
    }
}

/// Returns the last date of the bucket containing `date`.
#[must_use]
pub fn bucket_end(date: NaiveDate, unit: TimeUnit) -> NaiveDate {
    match unit {
        TimeUnit::Day => date,
        TimeUnit::Week => bucket_start(date, unit) + chrono::Duration::days(6),
        TimeUnit::Month | TimeUnit::Quarter | TimeUnit::Year => {
            let start = bucket_start(date, unit);
            let (next_year, next_month) = match unit {
                TimeUnit::Month => {
                    if start.month() == 12 {
                        (start.year() + 1, 1)
                    } else {
                        (start.year(), start.month() + 1)
                    }
                }
                TimeUnit::Quarter => {
                    if start.month() >= 10 {
                        (start.year() + 1, 1)
                    } else {
                        (start.year(), start.month() + 3)
                    }
                }
                TimeUnit::Year => (start.year() + 1, 1),
                TimeUnit::Day | TimeUnit::Week => unreachable!(),
            };
            NaiveDate::from_ymd_opt(next_year, next_month, 1)
                .map_or(date, |next| next - chrono::Duration::days(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{ActivityKey, ActivityValueRow, InMemoryActivityStore, InMemoryMetricStore};
    use tally_core::MemoryBackend;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn bucket_boundaries() {
        // 2023-06-15 is a Thursday in ISO week 24 (Mon 2023-06-12)
        assert_eq!(bucket_start(date("2023-06-15"), TimeUnit::Week), date("2023-06-12"));
        assert_eq!(bucket_end(date("2023-06-15"), TimeUnit::Week), date("2023-06-18"));
        assert_eq!(bucket_start(date("2023-06-15"), TimeUnit::Month), date("2023-06-01"));
        assert_eq!(bucket_end(date("2023-06-15"), TimeUnit::Month), date("2023-06-30"));
        assert_eq!(bucket_start(date("2023-06-15"), TimeUnit::Quarter), date("2023-04-01"));
        assert_eq!(bucket_end(date("2023-06-15"), TimeUnit::Quarter), date("2023-06-30"));
        assert_eq!(bucket_start(date("2023-06-15"), TimeUnit::Year), date("2023-01-01"));
        assert_eq!(bucket_end(date("2023-12-15"), TimeUnit::Year), date("2023-12-31"));
    }

    #[test]
    fn bottom_up_order_visits_children_before_parents() {
        let groups = bottom_up_groups(&[
            "/usa/co/denver".to_string(),
            "/usa/co/fraser".to_string(),
            "/ca/bc/vancouver".to_string(),
        ]);

        let position = |g: &str| groups.iter().position(|x| x == g).unwrap();
        assert!(position("/usa/co/denver") < position("/usa/co"));
        assert!(position("/usa/co/fraser") < position("/usa/co"));
        assert!(position("/usa/co") < position("/usa"));
        assert!(position("/usa") < position("/"));
        assert!(position("/ca/bc/vancouver") < position("/ca/bc"));
        // Root appears exactly once, last
        assert_eq!(groups.iter().filter(|g| g.as_str() == "/").count(), 1);
        assert_eq!(groups.last().map(String::as_str), Some("/"));
    }

    struct Fixture {
        aggregator: MetricAggregator,
        metric_store: Arc<InMemoryMetricStore>,
        activity_store: Arc<InMemoryActivityStore>,
        locks: LockManager,
    }

    fn fixture() -> Fixture {
        let storage =
            ScopedStorage::new(Arc::new(MemoryBackend::new()), "acme").expect("tenant");
        let locks = LockManager::new(storage.clone());
        let metric_store = Arc::new(InMemoryMetricStore::new());
        let activity_store = Arc::new(InMemoryActivityStore::new());
        let aggregator = MetricAggregator::new(
            storage,
            locks.clone(),
            metric_store.clone(),
            activity_store.clone(),
            std::time::Duration::from_secs(300),
        );
        Fixture {
            aggregator,
            metric_store,
            activity_store,
            locks,
        }
    }

    async fn seed_activity(
        store: &InMemoryActivityStore,
        group: &str,
        pipeline_id: PipelineId,
        day: &str,
        unique_key: &str,
        value: f64,
    ) {
        let key = ActivityKey {
            group_id: group.into(),
            pipeline_id,
            date: date(day),
            unique_key: unique_key.into(),
        };
        let id = store.ensure_activity(&key).await.unwrap();
        store
            .append(
                id,
                "co2e",
                ActivityValueRow {
                    execution_id: ExecutionId::generate(),
                    created_at: Utc::now(),
                    value: Some(value),
                    error: false,
                },
            )
            .await
            .unwrap();
    }

    async fn latest_total(
        store: &InMemoryMetricStore,
        name: &str,
        group: &str,
        unit: TimeUnit,
        day: &str,
    ) -> Option<(f64, f64)> {
        store
            .list_latest(name, group, unit, date(day), date(day))
            .await
            .unwrap()
            .first()
            .map(|(_, row)| (row.group_value, row.sub_groups_value))
    }

    #[tokio::test]
    async fn parent_totals_equal_own_plus_child_totals() {
        let f = fixture();
        let pipeline_id = PipelineId::generate();
        let execution_id = ExecutionId::generate();

        seed_activity(&f.activity_store, "/usa/co/denver", pipeline_id, "2023-06-01", "a", 10.0)
            .await;
        seed_activity(&f.activity_store, "/usa/co/fraser", pipeline_id, "2023-06-01", "b", 5.0)
            .await;
        seed_activity(&f.activity_store, "/usa/co", pipeline_id, "2023-06-01", "c", 2.0).await;

        let metric = MetricDefinition {
            name: "ghg:emissions".into(),
            aggregation_type: AggregationType::Sum,
            input_pipelines: vec![InputPipeline {
                pipeline_id,
                output: "co2e".into(),
            }],
        };

        let job = f
            .aggregator
            .aggregate(
                &metric,
                &["/usa/co/denver".into(), "/usa/co/fraser".into()],
                DateRange {
                    from: date("2023-06-01"),
                    to: date("2023-06-01"),
                },
                pipeline_id,
                execution_id,
            )
            .await
            .expect("aggregate");
        assert_eq!(job.status, JobStatus::Succeeded);

        let denver = latest_total(&f.metric_store, "ghg:emissions", "/usa/co/denver", TimeUnit::Day, "2023-06-01")
            .await
            .expect("denver");
        assert_eq!(denver, (10.0, 0.0));

        // /usa/co has its own direct contribution (2.0) plus both leaves
        let co = latest_total(&f.metric_store, "ghg:emissions", "/usa/co", TimeUnit::Day, "2023-06-01")
            .await
            .expect("co");
        assert_eq!(co, (2.0, 15.0));

        // /usa has no direct contribution; its sub-groups value is co's total
        let usa = latest_total(&f.metric_store, "ghg:emissions", "/usa", TimeUnit::Day, "2023-06-01")
            .await
            .expect("usa");
        assert_eq!(usa, (0.0, 17.0));

        let root = latest_total(&f.metric_store, "ghg:emissions", "/", TimeUnit::Day, "2023-06-01")
            .await
            .expect("root");
        assert_eq!(root, (0.0, 17.0));
    }

    #[tokio::test]
    async fn day_values_roll_up_to_coarser_units() {
        let f = fixture();
        let pipeline_id = PipelineId::generate();

        // Two days in the same ISO week and month
        seed_activity(&f.activity_store, "/usa", pipeline_id, "2023-06-13", "a", 4.0).await;
        seed_activity(&f.activity_store, "/usa", pipeline_id, "2023-06-14", "b", 6.0).await;

        let metric = MetricDefinition {
            name: "ghg:emissions".into(),
            aggregation_type: AggregationType::Sum,
            input_pipelines: vec![InputPipeline {
                pipeline_id,
                output: "co2e".into(),
            }],
        };

        f.aggregator
            .aggregate(
                &metric,
                &["/usa".into()],
                DateRange {
                    from: date("2023-06-13"),
                    to: date("2023-06-14"),
                },
                pipeline_id,
                ExecutionId::generate(),
            )
            .await
            .expect("aggregate");

        let week = latest_total(&f.metric_store, "ghg:emissions", "/usa", TimeUnit::Week, "2023-06-12")
            .await
            .expect("week bucket");
        assert_eq!(week, (10.0, 0.0));

        let month = latest_total(&f.metric_store, "ghg:emissions", "/usa", TimeUnit::Month, "2023-06-01")
            .await
            .expect("month bucket");
        assert_eq!(month, (10.0, 0.0));

        let quarter = latest_total(&f.metric_store, "ghg:emissions", "/usa", TimeUnit::Quarter, "2023-04-01")
            .await
            .expect("quarter bucket");
        assert_eq!(quarter, (10.0, 0.0));

        let year = latest_total(&f.metric_store, "ghg:emissions", "/usa", TimeUnit::Year, "2023-01-01")
            .await
            .expect("year bucket");
        assert_eq!(year, (10.0, 0.0));
    }

    #[tokio::test]
    async fn mean_applies_at_the_leaves() {
        let f = fixture();
        let pipeline_id = PipelineId::generate();

        seed_activity(&f.activity_store, "/usa", pipeline_id, "2023-06-01", "a", 4.0).await;
        seed_activity(&f.activity_store, "/usa", pipeline_id, "2023-06-01", "b", 8.0).await;

        let metric = MetricDefinition {
            name: "ghg:intensity".into(),
            aggregation_type: AggregationType::Mean,
            input_pipelines: vec![InputPipeline {
                pipeline_id,
                output: "co2e".into(),
            }],
        };

        f.aggregator
            .aggregate(
                &metric,
                &["/usa".into()],
                DateRange {
                    from: date("2023-06-01"),
                    to: date("2023-06-01"),
                },
                pipeline_id,
                ExecutionId::generate(),
            )
            .await
            .expect("aggregate");

        let usa = latest_total(&f.metric_store, "ghg:intensity", "/usa", TimeUnit::Day, "2023-06-01")
            .await
            .expect("usa");
        assert_eq!(usa, (6.0, 0.0));
    }

    #[tokio::test]
    async fn concurrent_pass_for_same_metric_conflicts() {
        let f = fixture();
        let pipeline_id = PipelineId::generate();

        let _held = f
            .locks
            .acquire(
                LockScope::MetricAggregation,
                "ghg:emissions:day",
                std::time::Duration::from_secs(300),
            )
            .await
            .expect("hold lock");

        let metric = MetricDefinition {
            name: "ghg:emissions".into(),
            aggregation_type: AggregationType::Sum,
            input_pipelines: vec![InputPipeline {
                pipeline_id,
                output: "co2e".into(),
            }],
        };

        let err = f
            .aggregator
            .aggregate(
                &metric,
                &["/usa".into()],
                DateRange {
                    from: date("2023-06-01"),
                    to: date("2023-06-01"),
                },
                pipeline_id,
                ExecutionId::generate(),
            )
            .await
            .expect_err("conflict");
        assert!(err.is_lock_held());
    }

    #[tokio::test]
    async fn job_record_is_persisted_and_succeeded() {
        let f = fixture();
        let pipeline_id = PipelineId::generate();
        seed_activity(&f.activity_store, "/usa", pipeline_id, "2023-06-01", "a", 1.0).await;

        let metric = MetricDefinition {
            name: "ghg:emissions".into(),
            aggregation_type: AggregationType::Sum,
            input_pipelines: vec![InputPipeline {
                pipeline_id,
                output: "co2e".into(),
            }],
        };

        let job = f
            .aggregator
            .aggregate(
                &metric,
                &["/usa".into()],
                DateRange {
                    from: date("2023-06-01"),
                    to: date("2023-06-01"),
                },
                pipeline_id,
                ExecutionId::generate(),
            )
            .await
            .expect("aggregate");

        let loaded = f.aggregator.get_job(job.id).await.expect("job record");
        assert_eq!(loaded.status, JobStatus::Succeeded);
        assert_eq!(loaded.metric_name, "ghg:emissions");

        // The lock is released on completion
        assert!(!f
            .locks
            .is_locked(LockScope::MetricAggregation, "ghg:emissions:day")
            .await
            .expect("check"));
    }
}
