//! Retrace CLI
//!
//! Replays a GWF workflow trace on an SC18 environment and prints job and task
//! completion counts.
//!
//! ```bash
//! retrace-sim --environment data/environment.json --trace data/trace.gwf
//! retrace-sim --config run.json --interactive --output report.json
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use retrace_simulation_engine::{
    policies::JobAdmissionPolicy, workflow::WorkflowSchedulerMode, Simulation, SimulationConfig,
};

#[derive(Parser, Debug)]
#[command(name = "retrace-sim")]
#[command(about = "Replay a workflow trace on a simulated cluster", long_about = None)]
struct Args {
    /// SC18 environment description (JSON)
    #[arg(short, long)]
    environment: Option<PathBuf>,

    /// Workflow trace in Grid Workflow Format
    #[arg(short, long)]
    trace: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Compute placement quantum in milliseconds
    #[arg(long)]
    scheduling_quantum_ms: Option<u64>,

    /// Release eligible workflow tasks every N milliseconds
    #[arg(long, conflicts_with = "interactive")]
    batch_quantum_ms: Option<u64>,

    /// Release eligible workflow tasks immediately
    #[arg(long)]
    interactive: bool,

    /// Maximum number of concurrently running jobs
    #[arg(long)]
    max_active_jobs: Option<usize>,

    /// Output JSON report path (optional)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => SimulationConfig::default(),
        };

        if let Some(environment) = self.environment {
            config = config.with_environment(environment);
        }
        if let Some(trace) = self.trace {
            config = config.with_trace(trace);
        }
        if let Some(quantum_ms) = self.scheduling_quantum_ms {
            config = config.with_scheduling_quantum_ms(quantum_ms);
        }
        if self.interactive {
            config = config.with_workflow_mode(WorkflowSchedulerMode::Interactive);
        } else if let Some(quantum_ms) = self.batch_quantum_ms {
            config = config.with_workflow_mode(WorkflowSchedulerMode::Batch { quantum_ms });
        }
        if let Some(max_active_jobs) = self.max_active_jobs {
            config = config.with_job_admission(JobAdmissionPolicy::Limit { max_active_jobs });
        }
        if let Some(output) = self.output {
            config = config.with_output(output);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (file_layer, _log_guard) = match &args.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().context("--log-file must name a file")?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "retrace=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let config = args.into_config()?;
    info!(
        environment = %config.environment.display(),
        trace = %config.trace.display(),
        "Starting simulation"
    );
    let output = config.output.clone();
    let simulation = Simulation::new(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling replay");
            on_interrupt.cancel();
        }
    });

    // The simulation drives its own paused-time runtime
    let report = tokio::task::spawn_blocking(move || simulation.run_until_cancelled(cancel))
        .await
        .context("simulation thread failed")??;

    println!("Workflow trace finished...");
    println!("{}", report.summary());

    for failure in &report.submission_failures {
        warn!(event = ?failure.index, error = %failure.error, "Submission failed");
    }
    if report.cancelled {
        warn!(aborted = report.aborted, "Run was cancelled before the trace finished");
    }

    if let Some(path) = output {
        report
            .write_json(&path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(())
}
