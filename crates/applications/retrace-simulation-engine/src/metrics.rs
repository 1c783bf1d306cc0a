//! Workflow metrics
//!
//! [`MeterRegistry`] is the in-process metric producer: named long-sum
//! counters whose every update is recorded as a timestamped point against the
//! virtual clock. [`collect`] turns a producer into a [`MetricsSnapshot`] by
//! reading the last point of each [`WorkflowCounter`].

use retrace_core::{Clock, MetricData, MetricPoint, MetricProducer, MetricsSnapshot};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::clock::duration_to_ms;

/// The six counters a workflow service reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkflowCounter {
    JobsSubmitted,
    JobsActive,
    JobsFinished,
    TasksSubmitted,
    TasksActive,
    TasksFinished,
}

impl WorkflowCounter {
    pub const ALL: [WorkflowCounter; 6] = [
        WorkflowCounter::JobsSubmitted,
        WorkflowCounter::JobsActive,
        WorkflowCounter::JobsFinished,
        WorkflowCounter::TasksSubmitted,
        WorkflowCounter::TasksActive,
        WorkflowCounter::TasksFinished,
    ];

    /// Metric name as exposed by the producer
    pub fn name(self) -> &'static str {
        match self {
            WorkflowCounter::JobsSubmitted => "jobs.submitted",
            WorkflowCounter::JobsActive => "jobs.active",
            WorkflowCounter::JobsFinished => "jobs.finished",
            WorkflowCounter::TasksSubmitted => "tasks.submitted",
            WorkflowCounter::TasksActive => "tasks.active",
            WorkflowCounter::TasksFinished => "tasks.finished",
        }
    }

    /// Snapshot field backing this counter
    pub fn field(self, snapshot: &mut MetricsSnapshot) -> &mut u64 {
        match self {
            WorkflowCounter::JobsSubmitted => &mut snapshot.jobs_submitted,
            WorkflowCounter::JobsActive => &mut snapshot.jobs_active,
            WorkflowCounter::JobsFinished => &mut snapshot.jobs_finished,
            WorkflowCounter::TasksSubmitted => &mut snapshot.tasks_submitted,
            WorkflowCounter::TasksActive => &mut snapshot.tasks_active,
            WorkflowCounter::TasksFinished => &mut snapshot.tasks_finished,
        }
    }
}

/// Counters the producer does not declare. Missing counters read as zero.
pub fn validate(producer: &dyn MetricProducer) -> Vec<WorkflowCounter> {
    let declared = producer.metric_names();
    let missing: Vec<WorkflowCounter> = WorkflowCounter::ALL
        .into_iter()
        .filter(|c| !declared.iter().any(|name| name == c.name()))
        .collect();

    for counter in &missing {
        warn!(metric = counter.name(), "Producer does not declare metric, it will read as 0");
    }
    missing
}

/// Read the final value of every workflow counter.
///
/// A metric that is absent, or has no points, yields 0. Negative sums clamp to 0.
pub fn collect(producer: &dyn MetricProducer) -> MetricsSnapshot {
    let metrics: BTreeMap<String, MetricData> = producer
        .collect_all()
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect();

    let mut snapshot = MetricsSnapshot::default();
    for counter in WorkflowCounter::ALL {
        let value = metrics
            .get(counter.name())
            .and_then(MetricData::last_value)
            .unwrap_or(0);
        *counter.field(&mut snapshot) = u64::try_from(value).unwrap_or(0);
    }

    debug!(?snapshot, "Collected workflow metrics");
    snapshot
}

type Series = BTreeMap<String, Vec<MetricPoint>>;

fn lock(series: &Mutex<Series>) -> MutexGuard<'_, Series> {
    series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process metric producer
#[derive(Clone)]
pub struct MeterRegistry {
    clock: Arc<dyn Clock>,
    series: Arc<Mutex<Series>>,
}

impl MeterRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            series: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Declare (or fetch) a long-sum counter
    pub fn counter(&self, name: impl Into<String>) -> LongCounter {
        let name = name.into();
        lock(&self.series).entry(name.clone()).or_default();
        LongCounter {
            name,
            registry: self.clone(),
        }
    }

    fn record(&self, name: &str, delta: i64) {
        let timestamp_ms = duration_to_ms(self.clock.now());
        let mut series = lock(&self.series);
        let points = series.entry(name.to_string()).or_default();
        let value = points.last().map_or(0, |p| p.value).saturating_add(delta);
        points.push(MetricPoint {
            timestamp_ms,
            value,
        });
    }
}

impl MetricProducer for MeterRegistry {
    fn metric_names(&self) -> Vec<String> {
        lock(&self.series).keys().cloned().collect()
    }

    fn collect_all(&self) -> Vec<MetricData> {
        lock(&self.series)
            .iter()
            .map(|(name, points)| MetricData {
                name: name.clone(),
                points: points.clone(),
            })
            .collect()
    }
}

/// Monotonic-by-convention sum; `add` may be negative for gauges like `*.active`
#[derive(Clone)]
pub struct LongCounter {
    name: String,
    registry: MeterRegistry,
}

impl LongCounter {
    pub fn add(&self, delta: i64) {
        self.registry.record(&self.name, delta);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handles for the six workflow counters
#[derive(Clone)]
pub struct WorkflowCounters {
    pub jobs_submitted: LongCounter,
    pub jobs_active: LongCounter,
    pub jobs_finished: LongCounter,
    pub tasks_submitted: LongCounter,
    pub tasks_active: LongCounter,
    pub tasks_finished: LongCounter,
}

impl WorkflowCounters {
    pub fn register(registry: &MeterRegistry) -> Self {
        let counter = |c: WorkflowCounter| registry.counter(c.name());
        Self {
            jobs_submitted: counter(WorkflowCounter::JobsSubmitted),
            jobs_active: counter(WorkflowCounter::JobsActive),
            jobs_finished: counter(WorkflowCounter::JobsFinished),
            tasks_submitted: counter(WorkflowCounter::TasksSubmitted),
            tasks_active: counter(WorkflowCounter::TasksActive),
            tasks_finished: counter(WorkflowCounter::TasksFinished),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::time::Duration;

    struct EmptyProducer;

    impl MetricProducer for EmptyProducer {
        fn metric_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn collect_all(&self) -> Vec<MetricData> {
            Vec::new()
        }
    }

    struct StaticProducer(Vec<MetricData>);

    impl MetricProducer for StaticProducer {
        fn metric_names(&self) -> Vec<String> {
            self.0.iter().map(|m| m.name.clone()).collect()
        }

        fn collect_all(&self) -> Vec<MetricData> {
            self.0.clone()
        }
    }

    fn series(name: &str, values: &[i64]) -> MetricData {
        MetricData {
            name: name.to_string(),
            points: values
                .iter()
                .enumerate()
                .map(|(i, &value)| MetricPoint {
                    timestamp_ms: i as u64,
                    value,
                })
                .collect(),
        }
    }

    #[test]
    fn test_collect_empty_producer_is_all_zero() {
        assert_eq!(collect(&EmptyProducer), MetricsSnapshot::default());
    }

    #[test]
    fn test_validate_reports_every_missing_counter() {
        assert_eq!(validate(&EmptyProducer), WorkflowCounter::ALL.to_vec());
    }

    #[test]
    fn test_collect_reads_last_point() {
        let producer = StaticProducer(vec![
            series("jobs.submitted", &[1, 2, 3]),
            series("jobs.finished", &[1, 2]),
            series("tasks.active", &[]),
            series("unrelated.metric", &[99]),
        ]);

        let snapshot = collect(&producer);

        assert_eq!(snapshot.jobs_submitted, 3);
        assert_eq!(snapshot.jobs_finished, 2);
        assert_eq!(snapshot.tasks_active, 0);
        assert_eq!(snapshot.tasks_submitted, 0);
    }

    #[test]
    fn test_counter_names_are_unique() {
        let mut names: Vec<_> = WorkflowCounter::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), WorkflowCounter::ALL.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_records_against_virtual_time() {
        let clock = VirtualClock::attach().unwrap();
        let registry = MeterRegistry::new(Arc::new(clock));
        let counters = WorkflowCounters::register(&registry);

        assert!(validate(&registry).is_empty());

        counters.jobs_active.add(1);
        clock.suspend_until(Duration::from_millis(250)).await;
        counters.jobs_active.add(-1);
        counters.jobs_finished.add(1);

        let active = registry
            .collect_all()
            .into_iter()
            .find(|m| m.name == "jobs.active")
            .unwrap();
        assert_eq!(
            active.points,
            vec![
                MetricPoint { timestamp_ms: 0, value: 1 },
                MetricPoint { timestamp_ms: 250, value: 0 },
            ]
        );

        let snapshot = collect(&registry);
        assert_eq!(snapshot.jobs_finished, 1);
        assert_eq!(snapshot.jobs_active, 0);
    }
}
