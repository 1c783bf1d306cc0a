//! Trace sources
//!
//! - [`VecTraceSource`]: in-memory, forward-only sequence of events
//! - [`GwfTraceReader`]: parser for Grid Workflow Format traces
//!
//! ## GWF
//!
//! Comma-separated text. `#` comments and blank lines are skipped; the first
//! remaining line names the columns. Each row is one task; rows sharing a
//! `WorkflowID` form one job, submitted at the earliest `SubmitTime` of its
//! tasks.
//!
//! ```text
//! WorkflowID, JobID, SubmitTime, RunTime, NProcs, ReqNProcs, Dependencies
//! 0,          1,     10,         120,     1,      1,
//! 0,          2,     10,         60,      2,      2,         1
//! ```

use retrace_core::{Job, TaskSpec, TraceError, TraceEvent, TraceSource};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Forward-only source over already-materialized events
#[derive(Debug, Clone)]
pub struct VecTraceSource<W> {
    events: VecDeque<TraceEvent<W>>,
}

impl<W> VecTraceSource<W> {
    pub fn new(events: impl IntoIterator<Item = TraceEvent<W>>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    /// Number of events not yet read
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl<W> TraceSource for VecTraceSource<W> {
    type Workload = W;

    fn has_next(&self) -> bool {
        !self.events.is_empty()
    }

    fn next_event(&mut self) -> Result<TraceEvent<W>, TraceError> {
        self.events.pop_front().ok_or(TraceError::Exhausted)
    }
}

/// Column positions resolved from the header line
#[derive(Debug, Clone, Copy)]
struct Columns {
    workflow_id: usize,
    task_id: usize,
    submit_time: usize,
    runtime: usize,
    cores: usize,
    dependencies: usize,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self, TraceError> {
        let names: HashMap<&str, usize> = header
            .split(',')
            .enumerate()
            .map(|(idx, name)| (name.trim(), idx))
            .collect();

        let find = |name: &str| {
            names
                .get(name)
                .copied()
                .ok_or_else(|| TraceError::MissingColumn(name.to_string()))
        };

        Ok(Self {
            workflow_id: find("WorkflowID")?,
            task_id: find("JobID")?,
            submit_time: find("SubmitTime")?,
            runtime: find("RunTime")?,
            cores: find("NProcs")?,
            dependencies: find("Dependencies")?,
        })
    }
}

/// Job under construction while rows are read
struct PendingJob {
    start_ms: i64,
    tasks: Vec<TaskSpec>,
}

/// Grid Workflow Format reader
pub struct GwfTraceReader;

impl GwfTraceReader {
    /// Read the whole trace file; the handle is closed before this returns
    pub fn open(path: impl AsRef<Path>) -> Result<VecTraceSource<Job>, TraceError> {
        let path = path.as_ref();
        let source = {
            let file = File::open(path)?;
            Self::parse(BufReader::new(file))?
        };
        info!(
            path = %path.display(),
            jobs = source.remaining(),
            "Loaded workflow trace"
        );
        Ok(source)
    }

    /// Parse a GWF trace into jobs ordered by submission time
    pub fn parse(reader: impl BufRead) -> Result<VecTraceSource<Job>, TraceError> {
        let mut columns: Option<Columns> = None;
        let mut order: Vec<u64> = Vec::new();
        let mut jobs: HashMap<u64, PendingJob> = HashMap::new();
        let mut task_owner: HashMap<u64, u64> = HashMap::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some(cols) = columns else {
                columns = Some(Columns::from_header(trimmed)?);
                continue;
            };

            let values: Vec<&str> = trimmed.split(',').map(str::trim).collect();
            let field = |col: usize, name: &str| {
                values.get(col).copied().ok_or_else(|| TraceError::Parse {
                    line: line_no,
                    reason: format!("missing value for {name}"),
                })
            };
            let number = |col: usize, name: &str| -> Result<i64, TraceError> {
                let raw = field(col, name)?;
                raw.parse::<i64>().map_err(|e| TraceError::Parse {
                    line: line_no,
                    reason: format!("invalid {name} '{raw}': {e}"),
                })
            };

            let id = |col: usize, name: &str| -> Result<u64, TraceError> {
                let value = number(col, name)?;
                u64::try_from(value).map_err(|_| TraceError::Parse {
                    line: line_no,
                    reason: format!("{name} must not be negative, got {value}"),
                })
            };

            let workflow_id = id(cols.workflow_id, "WorkflowID")?;
            let task_id = id(cols.task_id, "JobID")?;
            let submit_ms = number(cols.submit_time, "SubmitTime")?.saturating_mul(1000);
            let runtime_secs = number(cols.runtime, "RunTime")?.max(0) as u64;
            let cores = u32::try_from(number(cols.cores, "NProcs")?.max(1)).unwrap_or(u32::MAX);

            // A trailing empty column is dropped by some writers
            let dependencies = values
                .get(cols.dependencies)
                .copied()
                .unwrap_or("")
                .split_whitespace()
                .map(|dep| {
                    dep.parse::<u64>().map_err(|e| TraceError::Parse {
                        line: line_no,
                        reason: format!("invalid dependency '{dep}': {e}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            if task_owner.insert(task_id, workflow_id).is_some() {
                return Err(TraceError::Parse {
                    line: line_no,
                    reason: format!("duplicate JobID {task_id}"),
                });
            }

            let mut task = TaskSpec::new(task_id, Duration::from_secs(runtime_secs), cores)
                .with_dependencies(dependencies);
            task.submit_ms = submit_ms;

            let job = jobs.entry(workflow_id).or_insert_with(|| {
                order.push(workflow_id);
                PendingJob {
                    start_ms: submit_ms,
                    tasks: Vec::new(),
                }
            });
            job.start_ms = job.start_ms.min(submit_ms);
            job.tasks.push(task);
        }

        let mut events = Vec::with_capacity(order.len());
        for workflow_id in order {
            let Some(pending) = jobs.remove(&workflow_id) else {
                continue;
            };
            let known: HashSet<u64> = pending.tasks.iter().map(|t| t.id).collect();
            for task in &pending.tasks {
                if let Some(&dependency) = task.dependencies.iter().find(|d| !known.contains(d)) {
                    return Err(TraceError::UnknownDependency {
                        task: task.id,
                        dependency,
                    });
                }
            }
            events.push(TraceEvent::new(
                pending.start_ms,
                Job::new(workflow_id, pending.tasks),
            ));
        }

        // Stable: jobs submitted at the same instant keep file order
        events.sort_by_key(|e| e.start_offset_ms);
        debug!(jobs = events.len(), "Parsed GWF trace");

        Ok(VecTraceSource::new(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# sample trace
WorkflowID, JobID, SubmitTime, RunTime, NProcs, ReqNProcs, Dependencies
1, 10, 20, 60, 1, 1,
1, 11, 25, 30, 2, 2, 10
0, 1, 5, 120, 1, 1,

0, 2, 7, -3, 1, 1, 1
";

    fn drain(mut source: VecTraceSource<Job>) -> Vec<TraceEvent<Job>> {
        let mut events = Vec::new();
        while source.has_next() {
            events.push(source.next_event().unwrap());
        }
        events
    }

    #[test]
    fn test_vec_source_exhaustion() {
        let mut source = VecTraceSource::new(vec![TraceEvent::new(0, "a")]);
        assert!(source.has_next());
        assert_eq!(source.next_event().unwrap().workload, "a");
        assert!(!source.has_next());
        assert!(matches!(source.next_event(), Err(TraceError::Exhausted)));
    }

    #[test]
    fn test_parse_groups_tasks_into_jobs() {
        let events = drain(GwfTraceReader::parse(SAMPLE.as_bytes()).unwrap());

        assert_eq!(events.len(), 2);

        // Workflow 0 starts earlier even though it appears later in the file
        assert_eq!(events[0].workload.id, 0);
        assert_eq!(events[0].start_offset_ms, 5_000);
        assert_eq!(events[0].workload.tasks.len(), 2);

        assert_eq!(events[1].workload.id, 1);
        assert_eq!(events[1].start_offset_ms, 20_000);
    }

    #[test]
    fn test_parse_task_fields() {
        let events = drain(GwfTraceReader::parse(SAMPLE.as_bytes()).unwrap());
        let job = &events[1].workload;

        let dependent = job.tasks.iter().find(|t| t.id == 11).unwrap();
        assert_eq!(dependent.runtime, Duration::from_secs(30));
        assert_eq!(dependent.cores, 2);
        assert_eq!(dependent.dependencies, vec![10]);
        assert_eq!(dependent.submit_ms, 25_000);

        // Negative runtimes are clamped to zero
        let clamped = events[0].workload.tasks.iter().find(|t| t.id == 2).unwrap();
        assert_eq!(clamped.runtime, Duration::ZERO);
    }

    #[test]
    fn test_parse_missing_column() {
        let trace = "WorkflowID, JobID, SubmitTime, RunTime, NProcs\n0, 1, 0, 1, 1\n";
        let err = GwfTraceReader::parse(trace.as_bytes()).unwrap_err();
        assert!(matches!(err, TraceError::MissingColumn(ref c) if c == "Dependencies"));
    }

    #[test]
    fn test_parse_unknown_dependency() {
        let trace = "WorkflowID, JobID, SubmitTime, RunTime, NProcs, Dependencies\n0, 1, 0, 1, 1, 99\n";
        let err = GwfTraceReader::parse(trace.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            TraceError::UnknownDependency { task: 1, dependency: 99 }
        ));
    }

    #[test]
    fn test_parse_invalid_number_reports_line() {
        let trace = "WorkflowID, JobID, SubmitTime, RunTime, NProcs, Dependencies\n\n0, x, 0, 1, 1,\n";
        let err = GwfTraceReader::parse(trace.as_bytes()).unwrap_err();
        assert!(matches!(err, TraceError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_parse_rejects_negative_ids() {
        let header = "WorkflowID, JobID, SubmitTime, RunTime, NProcs, Dependencies\n";

        let workflow = format!("{header}-1, 1, 0, 1, 1,\n");
        let err = GwfTraceReader::parse(workflow.as_bytes()).unwrap_err();
        assert!(matches!(err, TraceError::Parse { line: 2, ref reason } if reason.contains("WorkflowID")));

        let task = format!("{header}0, -7, 0, 1, 1,\n");
        let err = GwfTraceReader::parse(task.as_bytes()).unwrap_err();
        assert!(matches!(err, TraceError::Parse { line: 2, ref reason } if reason.contains("JobID")));
    }

    #[test]
    fn test_parse_empty_trace() {
        let source = GwfTraceReader::parse("# nothing here\n".as_bytes()).unwrap();
        assert!(!source.has_next());
    }

    #[test]
    fn test_open_missing_file() {
        let err = GwfTraceReader::open("/nonexistent/trace.gwf").unwrap_err();
        assert!(matches!(err, TraceError::Io(_)));
    }
}
