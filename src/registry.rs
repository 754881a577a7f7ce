use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::{ObserverConfig, SnapshotPolicy, SourceConfig, SourceKind};
use crate::runner::{SnapshotConsumer, SourceRunner};
use crate::source::{FrameSource, SourceError, VideoFileSource};

/// Builds a frame source for one configured entry. Injectable so tests can
/// substitute stub sources.
pub type SourceFactory = dyn Fn(&SourceConfig) -> Result<Arc<dyn FrameSource>, SourceError> + Send + Sync;

/// Counts reported after startup: how many sources were configured (enabled)
/// and how many actually came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryReport {
    pub total_configured: usize,
    pub active: usize,
}

/// Owns one runner per enabled source and coordinates bulk start/stop. No
/// single source failure, at construction or at startup, affects siblings.
pub struct SourceRegistry {
    runners: Vec<SourceRunner>,
    started: Vec<bool>,
    total_configured: usize,
}

impl SourceRegistry {
    /// Build runners from the configured source entries. Disabled sources
    /// are skipped; malformed or unconstructible sources are logged, counted
    /// as configured-but-inactive, and never abort loading of the rest.
    pub fn load(config: &ObserverConfig, factory: &SourceFactory, consumer: SnapshotConsumer) -> Self {
        let dispatch = guarded_dispatch(consumer);

        let mut runners = Vec::new();
        let mut total_configured = 0usize;

        for entry in &config.sources {
            let source_cfg = match SourceConfig::from_value(entry) {
                Ok(cfg) => cfg,
                Err(err) => {
                    total_configured += 1;
                    error!(error = %err, "invalid source entry, disabling");
                    continue;
                }
            };

            if !source_cfg.enabled {
                continue;
            }
            total_configured += 1;

            let source = match factory(&source_cfg) {
                Ok(source) => source,
                Err(err) => {
                    error!(source_id = %source_cfg.source_id, error = %err, "failed to construct source");
                    continue;
                }
            };

            let SnapshotPolicy::Interval {
                interval_seconds,
                resize_percent,
            } = source_cfg.snapshot_policy;

            info!(source_id = %source_cfg.source_id, "source initialized");
            runners.push(SourceRunner::new(
                source_cfg.source_id,
                source,
                Duration::from_secs(interval_seconds),
                resize_percent,
                Arc::clone(&dispatch),
            ));
        }

        let started = vec![false; runners.len()];
        Self {
            runners,
            started,
            total_configured,
        }
    }

    /// Start all runners. Failures are logged per source and do not block
    /// sibling runners.
    pub fn start(&mut self) {
        for (runner, started) in self.runners.iter_mut().zip(self.started.iter_mut()) {
            match runner.start() {
                Ok(()) => *started = true,
                Err(err) => {
                    error!(source_id = %runner.source_id(), error = %err, "source failed to start, marked inactive");
                }
            }
        }
        let report = self.report();
        info!(
            total_configured = report.total_configured,
            active = report.active,
            "source registry started"
        );
    }

    /// Stop all started runners.
    pub fn stop(&mut self) {
        for (runner, started) in self.runners.iter_mut().zip(self.started.iter_mut()) {
            if *started {
                runner.stop();
                *started = false;
            }
        }
        info!("source registry stopped");
    }

    pub fn report(&self) -> RegistryReport {
        RegistryReport {
            total_configured: self.total_configured,
            active: self.started.iter().filter(|s| **s).count(),
        }
    }
}

/// Wrap the caller-supplied snapshot handler so a downstream fault can never
/// crash a sampling thread or lose the registry.
fn guarded_dispatch(consumer: SnapshotConsumer) -> SnapshotConsumer {
    Arc::new(move |snapshot| {
        let source_id = snapshot.source_id.clone();
        if catch_unwind(AssertUnwindSafe(|| consumer(snapshot))).is_err() {
            error!(source_id = %source_id, "snapshot handler panicked");
        }
    })
}

/// Default factory mapping config entries onto ffmpeg-backed sources.
pub fn default_source_factory(cfg: &SourceConfig) -> Result<Arc<dyn FrameSource>, SourceError> {
    match &cfg.source {
        SourceKind::VideoFile {
            path,
            loop_playback,
            start_paused,
        } => Ok(Arc::new(VideoFileSource::new(
            path.to_string_lossy().into_owned(),
            *loop_playback,
            *start_paused,
        ))),
        // Network feeds decode through the same rawvideo pipe; end of stream
        // doubles as the reconnect trigger.
        SourceKind::Stream { url } => Ok(Arc::new(VideoFileSource::new(url.clone(), true, false))),
    }
}
