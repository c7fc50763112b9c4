//! CPU watchdog
//!
//! Samples global CPU usage on a fixed interval. When usage crosses the
//! threshold it records a short profile (per-CPU and process usage sampled
//! once a second over the capture window) and writes it as JSON under the
//! profile directory.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WatchdogConfig;
use crate::EntitlementError;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct CpuSample {
    pub offset_ms: u64,
    pub global_percent: f32,
    pub per_cpu_percent: Vec<f32>,
    pub process_percent: Option<f32>,
    pub process_memory_bytes: Option<u64>,
}

/// One capture, as written to disk
#[derive(Debug, Clone, Serialize)]
pub struct CpuProfile {
    pub captured_at: DateTime<Utc>,
    pub trigger_percent: f32,
    pub threshold_percent: f32,
    pub window_ms: u64,
    pub cpu_count: usize,
    pub total_memory_bytes: u64,
    pub samples: Vec<CpuSample>,
}

pub struct CpuWatchdog {
    config: WatchdogConfig,
    system: System,
    pid: Option<Pid>,
}

impl CpuWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!(error = e, "Process id unavailable, sampling global CPU only"))
            .ok();
        Self {
            config,
            system: System::new(),
            pid,
        }
    }

    pub fn should_capture(&self, usage_percent: f32) -> bool {
        usage_percent > self.config.threshold_percent
    }

    fn global_usage(&mut self) -> f32 {
        self.system.refresh_cpu();
        self.system.global_cpu_info().cpu_usage()
    }

    fn sample(&mut self, offset: Duration) -> CpuSample {
        self.system.refresh_cpu();
        let (process_percent, process_memory_bytes) = match self.pid {
            Some(pid) if self.system.refresh_process(pid) => self
                .system
                .process(pid)
                .map(|p| (Some(p.cpu_usage()), Some(p.memory())))
                .unwrap_or((None, None)),
            _ => (None, None),
        };
        CpuSample {
            offset_ms: offset.as_millis() as u64,
            global_percent: self.system.global_cpu_info().cpu_usage(),
            per_cpu_percent: self.system.cpus().iter().map(|c| c.cpu_usage()).collect(),
            process_percent,
            process_memory_bytes,
        }
    }

    /// Sample for the capture window and write the profile; returns its path.
    ///
    /// Stops early, keeping the samples taken so far, when `token` fires.
    pub async fn capture(
        &mut self,
        trigger_percent: f32,
        token: &CancellationToken,
    ) -> Result<PathBuf, EntitlementError> {
        let window = self.config.capture_window;
        let step = if window < SAMPLE_INTERVAL {
            window.max(MINIMUM_CPU_UPDATE_INTERVAL)
        } else {
            SAMPLE_INTERVAL
        };
        let rounds = (window.as_millis() / step.as_millis()).max(1);

        let captured_at = Utc::now();
        self.system.refresh_memory();
        // Prime the counters; the first refresh has no baseline
        self.system.refresh_cpu();

        let mut samples = Vec::new();
        for round in 1..=rounds {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(step) => {}
            }
            samples.push(self.sample(step * round as u32));
        }

        let profile = CpuProfile {
            captured_at,
            trigger_percent,
            threshold_percent: self.config.threshold_percent,
            window_ms: window.as_millis() as u64,
            cpu_count: self.system.cpus().len(),
            total_memory_bytes: self.system.total_memory(),
            samples,
        };
        self.write(&profile).await
    }

    async fn write(&self, profile: &CpuProfile) -> Result<PathBuf, EntitlementError> {
        let dir = &self.config.profile_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| EntitlementError::Internal(format!("create {}: {e}", dir.display())))?;

        let path = dir.join(format!(
            "cpu-{}.json",
            profile.captured_at.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let body = serde_json::to_vec_pretty(profile)
            .map_err(|e| EntitlementError::Internal(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| EntitlementError::Internal(format!("write {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Check usage every interval until `token` fires
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            threshold = self.config.threshold_percent,
            dir = %self.config.profile_dir.display(),
            "CPU watchdog started"
        );
        // Baseline for the first reading
        self.system.refresh_cpu();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            let usage = self.global_usage();
            if !self.should_capture(usage) {
                continue;
            }
            warn!(usage, threshold = self.config.threshold_percent, "High CPU usage, capturing profile");
            match self.capture(usage, &token).await {
                Ok(path) => info!(path = %path.display(), "CPU profile written"),
                Err(e) => error!(error = %e, "CPU profile capture failed"),
            }
        }
        info!("CPU watchdog stopped");
    }
}
