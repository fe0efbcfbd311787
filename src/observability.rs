use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub measured_steps: Vec<MeasuredStep>,
    pub total_duration_ms: f64,
    pub failed_stage: Option<String>,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub runs: u64,
    pub steps: u64,
    pub duration_ms: f64,
    pub max_step_duration_ms: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct MeasuredStep {
    pub stage: String,
    pub step: String,
    pub wall_ms: f64,
    pub peak_memory_kb: Option<u64>,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_step(
        &self,
        stage: &str,
        step: &str,
        duration: Duration,
        peak_memory_kb: Option<u64>,
        measured: bool,
    ) {
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = guard.stages.entry(stage.to_string()).or_default();
            metrics.steps += 1;
            if duration_ms > metrics.max_step_duration_ms {
                metrics.max_step_duration_ms = duration_ms;
            }
            if measured {
                guard.measured_steps.push(MeasuredStep {
                    stage: stage.to_string(),
                    step: step.to_string(),
                    wall_ms: duration_ms,
                    peak_memory_kb,
                });
            }
        }
    }

    pub fn record_failure(&self, stage: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.failed_stage.get_or_insert_with(|| stage.to_string());
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records a stage's wall time when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.runs += 1;
            metrics.duration_ms += duration.as_secs_f64() * 1_000.0;
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        failed_stage = snapshot.failed_stage.as_deref(),
        "Job metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            steps = metrics.steps,
            duration_ms = metrics.duration_ms,
            max_step_ms = metrics.max_step_duration_ms,
            "Stage metrics"
        );
    }
    for measured in &snapshot.measured_steps {
        info!(
            stage = measured.stage.as_str(),
            step = measured.step.as_str(),
            wall_ms = measured.wall_ms,
            peak_memory_kb = measured.peak_memory_kb,
            "Measured step"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP eos_ci_stage_steps_total Steps executed per stage\n");
        output.push_str("# TYPE eos_ci_stage_steps_total counter\n");
        output.push_str("# HELP eos_ci_stage_duration_seconds Stage wall time in seconds\n");
        output.push_str("# TYPE eos_ci_stage_duration_seconds gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "eos_ci_stage_steps_total{{stage=\"{}\"}} {}\n",
                stage, metrics.steps
            ));
            output.push_str(&format!(
                "eos_ci_stage_duration_seconds{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP eos_ci_step_wall_seconds Wall time of measured steps\n");
        output.push_str("# TYPE eos_ci_step_wall_seconds gauge\n");
        output.push_str("# HELP eos_ci_step_peak_memory_bytes Peak resident memory of measured steps\n");
        output.push_str("# TYPE eos_ci_step_peak_memory_bytes gauge\n");
        for measured in &self.measured_steps {
            output.push_str(&format!(
                "eos_ci_step_wall_seconds{{stage=\"{}\",step=\"{}\"}} {:.6}\n",
                measured.stage,
                measured.step,
                measured.wall_ms / 1_000.0
            ));
            if let Some(kb) = measured.peak_memory_kb {
                output.push_str(&format!(
                    "eos_ci_step_peak_memory_bytes{{stage=\"{}\",step=\"{}\"}} {}\n",
                    measured.stage,
                    measured.step,
                    kb * 1024
                ));
            }
        }
        output.push_str("# HELP eos_ci_job_duration_seconds Total job duration\n");
        output.push_str("# TYPE eos_ci_job_duration_seconds gauge\n");
        output.push_str(&format!(
            "eos_ci_job_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output.push_str("# HELP eos_ci_job_success Whether every stage succeeded\n");
        output.push_str("# TYPE eos_ci_job_success gauge\n");
        output.push_str(&format!(
            "eos_ci_job_success {}\n",
            u8::from(self.failed_stage.is_none())
        ));
        output
    }
}
