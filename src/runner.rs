use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::frame::Snapshot;
use crate::source::{FrameSource, SourceError};

const TASK_SLEEP_CHUNK_MS: u64 = 100;
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared snapshot consumer invoked from every runner's sampling thread.
pub type SnapshotConsumer = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Sleep in cancellable chunks. Returns true when the flag was raised.
pub(crate) fn sleep_with_cancellation(flag: &AtomicBool, duration: Duration) -> bool {
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        if flag.load(Ordering::Relaxed) {
            return true;
        }
        let remaining = duration - elapsed;
        let step = remaining.min(Duration::from_millis(TASK_SLEEP_CHUNK_MS));
        thread::sleep(step);
        elapsed += step;
    }
    flag.load(Ordering::Relaxed)
}

/// Owns one frame source and samples it at a fixed cadence on its own
/// thread, handing each snapshot to the registered consumer.
pub struct SourceRunner {
    source_id: String,
    source: Arc<dyn FrameSource>,
    interval: Duration,
    resize_percent: u32,
    consumer: SnapshotConsumer,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    done_rx: Option<mpsc::Receiver<()>>,
}

impl SourceRunner {
    pub fn new(
        source_id: impl Into<String>,
        source: Arc<dyn FrameSource>,
        interval: Duration,
        resize_percent: u32,
        consumer: SnapshotConsumer,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source,
            interval,
            resize_percent,
            consumer,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            done_rx: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Start the owned source, then the sampling loop. A source that cannot
    /// open its feed fails here and the runner stays inert.
    pub fn start(&mut self) -> Result<(), SourceError> {
        self.source.start()?;
        self.source.play();

        let (done_tx, done_rx) = mpsc::channel();
        let stop = Arc::clone(&self.stop);
        let source = Arc::clone(&self.source);
        let consumer = Arc::clone(&self.consumer);
        let source_id = self.source_id.clone();
        let interval = self.interval;
        let resize_percent = self.resize_percent;

        let handle = thread::Builder::new()
            .name(format!("sample-{source_id}"))
            .spawn(move || {
                sampling_loop(&source_id, &source, &consumer, &stop, interval, resize_percent);
                let _ = done_tx.send(());
            })?;

        self.handle = Some(handle);
        self.done_rx = Some(done_rx);
        info!(source_id = %self.source_id, interval_secs = self.interval.as_secs(), "sampling loop started");
        Ok(())
    }

    /// Signal the loop to exit and join it within a bounded timeout. A loop
    /// stuck past the timeout is detached rather than blocking shutdown.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.source.stop();

        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.done_rx.take() {
            Some(done_rx) if done_rx.recv_timeout(JOIN_TIMEOUT).is_ok() => {
                if handle.join().is_err() {
                    error!(source_id = %self.source_id, "sampling thread panicked during shutdown");
                }
            }
            _ => {
                warn!(source_id = %self.source_id, "sampling loop did not stop in time, detaching");
            }
        }
    }
}

fn sampling_loop(
    source_id: &str,
    source: &Arc<dyn FrameSource>,
    consumer: &SnapshotConsumer,
    stop: &AtomicBool,
    interval: Duration,
    resize_percent: u32,
) {
    while !stop.load(Ordering::Relaxed) {
        let cycle_start = Instant::now();

        let Some(frame) = source.snapshot() else {
            debug!(source_id, "no frame available yet");
            if sleep_with_cancellation(stop, interval) {
                break;
            }
            continue;
        };

        let frame = match frame.downscale_percent(resize_percent) {
            Ok(frame) => frame,
            Err(err) => {
                error!(source_id, error = %err, "failed to downscale frame");
                if sleep_with_cancellation(stop, interval) {
                    break;
                }
                continue;
            }
        };

        let snapshot = Snapshot::new(source_id, frame);
        // A faulty consumer must never stop sampling.
        if catch_unwind(AssertUnwindSafe(|| consumer(snapshot))).is_err() {
            error!(source_id, "snapshot consumer panicked");
        }

        let elapsed = cycle_start.elapsed();
        if sleep_with_cancellation(stop, interval.saturating_sub(elapsed)) {
            break;
        }
    }
    info!(source_id, "sampling loop stopped");
}
