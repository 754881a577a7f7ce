use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::anchor::AnchorIndex;
use crate::config::{RuntimeConfig, TrainingConfig, VlmConfig};
use crate::detector::{AnomalyDetector, AnomalyReason, AnomalyReport, Classification};
use crate::embedder::Embedder;
use crate::frame::{EMBED_JPEG_QUALITY, EMBED_MAX_WIDTH, Snapshot};
use crate::gate::SimilarityGate;
use crate::index::TextIndex;
use crate::vlm::{PromptContext, VlmClient, build_analysis_prompt};

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Stage at which a snapshot was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Encode,
    Embed,
    Assign,
    Classify,
}

/// Terminal state of one snapshot's pass through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// Near-identical to the previous accepted frame; nothing else ran.
    Duplicate,
    /// Training: persisted under an anchor.
    Trained { anchor_id: u64, seq: u64 },
    /// Training: the run is frozen, the frame was ignored.
    TrainingFrozen,
    /// Runtime: matched the learned set.
    Normal { similarity: f32 },
    /// Runtime: reported as anomalous.
    AnomalyReported { reason: AnomalyReason, similarity: f32 },
    /// A stage failed; the frame was logged and discarded.
    Dropped { stage: Stage },
}

/// Per-source camera details surfaced to the analysis prompt.
#[derive(Debug, Clone, Default)]
pub struct CameraInfo {
    pub name: String,
    pub description: String,
}

/// Analyzes anomalous frames with the remote VLM and records the findings
/// in the text index, maintaining one rolling context per source.
pub struct VlmAnalysis {
    client: VlmClient,
    embedder: Arc<dyn Embedder>,
    text_index: TextIndex,
    business: VlmConfig,
    cameras: HashMap<String, CameraInfo>,
    rolling: HashMap<String, String>,
}

impl VlmAnalysis {
    pub fn new(
        client: VlmClient,
        embedder: Arc<dyn Embedder>,
        text_index: TextIndex,
        business: VlmConfig,
        cameras: HashMap<String, CameraInfo>,
    ) -> Self {
        Self {
            client,
            embedder,
            text_index,
            business,
            cameras,
            rolling: HashMap::new(),
        }
    }

    fn prompt_context(&self, source_id: &str) -> PromptContext {
        let camera = self.cameras.get(source_id);
        PromptContext {
            business_name: self.business.business_name.clone(),
            business_type: self.business.business_type.clone(),
            camera_name: camera
                .map(|c| c.name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| source_id.to_string()),
            camera_description: camera.map(|c| c.description.clone()).unwrap_or_default(),
            analysis_goal: self.business.analysis_goal.clone(),
        }
    }

    fn analyze_and_store(&mut self, snapshot: &Snapshot, jpeg: &[u8]) -> Result<()> {
        let ctx = self.prompt_context(&snapshot.source_id);
        let previous = self.rolling.get(&snapshot.source_id).map(String::as_str);
        let prompt = build_analysis_prompt(&ctx, previous);

        let sections = self
            .client
            .analyze(jpeg, &prompt)
            .context("vlm analysis failed")?;
        self.rolling
            .insert(snapshot.source_id.clone(), sections.rolling_context.clone());

        let embedding = self
            .embedder
            .embed_text(&sections.frame_description)
            .context("text embedding failed")?;
        self.text_index
            .add(
                &embedding,
                &sections.frame_description,
                &sections.rolling_context,
                "vlm",
                Some(&snapshot.source_id),
                snapshot.timestamp(),
            )
            .context("text index write failed")?;
        Ok(())
    }
}

/// Central anomaly hook: log, export the frame, and optionally run VLM
/// analysis. Every step is best-effort; a failing hook never fails the
/// pipeline.
pub struct AnomalyReporter {
    export_dir: Option<PathBuf>,
    analysis: Option<VlmAnalysis>,
}

impl AnomalyReporter {
    pub fn new(export_dir: Option<PathBuf>, analysis: Option<VlmAnalysis>) -> Self {
        Self {
            export_dir,
            analysis,
        }
    }

    fn report(&mut self, snapshot: &Snapshot, jpeg: &[u8], report: &AnomalyReport) {
        warn!(
            source_id = %snapshot.source_id,
            reason = report.reason.as_str(),
            similarity = report.similarity,
            anchor_id = report.anchor_id,
            "anomaly detected"
        );

        if let Some(dir) = &self.export_dir {
            if let Err(err) = export_frame(dir, snapshot, jpeg) {
                error!(source_id = %snapshot.source_id, error = %err, "failed to export anomaly frame");
            }
        }

        if let Some(analysis) = &mut self.analysis {
            if let Err(err) = analysis.analyze_and_store(snapshot, jpeg) {
                error!(source_id = %snapshot.source_id, error = %err, "anomaly analysis failed");
            }
        }
    }
}

fn export_frame(dir: &std::path::Path, snapshot: &Snapshot, jpeg: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = snapshot.captured_at.format("%Y%m%d-%H%M%S%.3f");
    let path = dir.join(format!("{}-{stamp}.jpg", snapshot.source_id));
    std::fs::write(&path, jpeg)?;
    Ok(path)
}

struct TrainingFlow {
    anchors: AnchorIndex,
    static_frame_threshold: f32,
    prune_after: Option<u64>,
    prune_percent: u32,
}

struct RuntimeFlow {
    detector: AnomalyDetector,
    static_frame_threshold: f32,
    reporter: AnomalyReporter,
}

enum Flow {
    Training(TrainingFlow),
    Runtime(RuntimeFlow),
}

/// Per-snapshot orchestration: encode, embed, gate, then the mode-specific
/// tail. Runs on the single ingest worker thread, so the gate and the anchor
/// counters need no locking.
pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    gate: SimilarityGate,
    flow: Flow,
}

impl IngestPipeline {
    pub fn training(embedder: Arc<dyn Embedder>, anchors: AnchorIndex, cfg: &TrainingConfig) -> Self {
        Self {
            embedder,
            gate: SimilarityGate::new(),
            flow: Flow::Training(TrainingFlow {
                anchors,
                static_frame_threshold: cfg.static_frame_threshold,
                prune_after: cfg.prune_after,
                prune_percent: cfg.prune_percent,
            }),
        }
    }

    pub fn runtime(
        embedder: Arc<dyn Embedder>,
        detector: AnomalyDetector,
        reporter: AnomalyReporter,
        cfg: &RuntimeConfig,
    ) -> Self {
        Self {
            embedder,
            gate: SimilarityGate::new(),
            flow: Flow::Runtime(RuntimeFlow {
                detector,
                static_frame_threshold: cfg.static_frame_threshold,
                reporter,
            }),
        }
    }

    /// Drive one snapshot to a terminal state. Never panics and never lets a
    /// stage failure block the next snapshot for the same source.
    pub fn process_snapshot(&mut self, snapshot: &Snapshot) -> Outcome {
        // A frozen training run ignores frames before any work happens.
        if let Flow::Training(flow) = &self.flow {
            if flow.anchors.is_frozen() {
                return Outcome::TrainingFrozen;
            }
        }

        let jpeg = match snapshot.frame.to_jpeg(EMBED_MAX_WIDTH, EMBED_JPEG_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                error!(source_id = %snapshot.source_id, error = %err, "frame encoding failed");
                return Outcome::Dropped { stage: Stage::Encode };
            }
        };

        let embedding = match self.embedder.embed_image(&jpeg) {
            Ok(embedding) => embedding,
            Err(err) => {
                error!(source_id = %snapshot.source_id, error = %err, "image embedding failed");
                return Outcome::Dropped { stage: Stage::Embed };
            }
        };

        let static_threshold = match &self.flow {
            Flow::Training(flow) => flow.static_frame_threshold,
            Flow::Runtime(flow) => flow.static_frame_threshold,
        };
        if self
            .gate
            .is_duplicate(&snapshot.source_id, &embedding, static_threshold)
        {
            return Outcome::Duplicate;
        }

        match &mut self.flow {
            Flow::Training(flow) => {
                let assignment =
                    match flow
                        .anchors
                        .assign(&embedding, &snapshot.source_id, snapshot.timestamp())
                    {
                        Ok(Some(assignment)) => assignment,
                        Ok(None) => return Outcome::TrainingFrozen,
                        Err(err) => {
                            error!(source_id = %snapshot.source_id, error = %err, "anchor assignment failed");
                            return Outcome::Dropped { stage: Stage::Assign };
                        }
                    };

                if let Some(prune_after) = flow.prune_after {
                    if flow.anchors.ingest_seq() >= prune_after {
                        match flow.anchors.prune_oldest(flow.prune_percent) {
                            Ok(cutoff) => {
                                info!(cutoff, "training bound reached, learned set frozen");
                            }
                            Err(err) => {
                                error!(error = %err, "pruning failed, will retry on next frame");
                            }
                        }
                    }
                }

                Outcome::Trained {
                    anchor_id: assignment.anchor_id,
                    seq: assignment.seq,
                }
            }
            Flow::Runtime(flow) => {
                match flow.detector.classify(&embedding, &snapshot.source_id) {
                    Ok(Classification::Ok { similarity }) => Outcome::Normal { similarity },
                    Ok(Classification::Anomaly(report)) => {
                        flow.reporter.report(snapshot, &jpeg, &report);
                        Outcome::AnomalyReported {
                            reason: report.reason,
                            similarity: report.similarity,
                        }
                    }
                    Err(err) => {
                        error!(source_id = %snapshot.source_id, error = %err, "anomaly classification failed");
                        Outcome::Dropped { stage: Stage::Classify }
                    }
                }
            }
        }
    }
}

/// Dedicated consumption thread. Runners hand snapshots off through a
/// bounded channel so slow embedding/store/analysis round trips never delay
/// a sampling tick; when the queue is full the frame is dropped, not queued.
pub struct IngestWorker {
    tx: mpsc::SyncSender<Snapshot>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IngestWorker {
    pub fn start(mut pipeline: IngestPipeline, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Snapshot>(queue_depth);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            loop {
                match rx.recv_timeout(WORKER_POLL) {
                    Ok(snapshot) => {
                        if flag.load(Ordering::Relaxed) {
                            break;
                        }
                        let outcome = pipeline.process_snapshot(&snapshot);
                        log_outcome(&snapshot.source_id, outcome);
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if flag.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("ingest worker stopped");
        });

        Self {
            tx,
            stop,
            handle: Some(handle),
        }
    }

    /// Consumer handed to the source registry. Non-blocking: a full queue
    /// drops the frame rather than stalling the sampling thread.
    pub fn consumer(&self) -> crate::runner::SnapshotConsumer {
        let tx = self.tx.clone();
        Arc::new(move |snapshot| {
            let source_id = snapshot.source_id.clone();
            match tx.try_send(snapshot) {
                Ok(()) => {}
                Err(mpsc::TrySendError::Full(_)) => {
                    warn!(source_id = %source_id, "ingest queue full, dropping frame");
                }
                Err(mpsc::TrySendError::Disconnected(_)) => {
                    warn!(source_id = %source_id, "ingest worker gone, dropping frame");
                }
            }
        })
    }

    /// Cooperative shutdown. The in-flight snapshot is allowed to finish; no
    /// new one is started.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("ingest worker panicked during shutdown");
            }
        }
    }
}

fn log_outcome(source_id: &str, outcome: Outcome) {
    match outcome {
        Outcome::Duplicate => debug!(source_id, "frame unchanged, skipped"),
        Outcome::Trained { anchor_id, seq } => {
            debug!(source_id, anchor_id, seq, "frame persisted")
        }
        Outcome::TrainingFrozen => debug!(source_id, "training frozen, frame ignored"),
        Outcome::Normal { similarity } => {
            debug!(source_id, similarity, "frame matched learned set")
        }
        // Anomalies and drops were already logged where they happened.
        Outcome::AnomalyReported { .. } | Outcome::Dropped { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::ThresholdSchedule;
    use crate::embedder::EmbedError;
    use crate::frame::Frame;
    use crate::index::{IMAGE_COLLECTION, ImageIndex};
    use crate::store::testing::MemoryStore;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const SCHEDULE: ThresholdSchedule = ThresholdSchedule {
        base: 0.85,
        max: 0.97,
        step: 0.005,
        step_size: 200,
    };

    /// Embedder returning a scripted sequence of vectors.
    struct QueueEmbedder {
        queue: Mutex<VecDeque<Vec<f32>>>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl QueueEmbedder {
        fn new(embeddings: Vec<Vec<f32>>) -> Self {
            Self {
                queue: Mutex::new(embeddings.into_iter().collect()),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Embedder for QueueEmbedder {
        fn embed_image(&self, _jpeg: &[u8]) -> Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbedError::Empty);
            }
            let mut queue = self.queue.lock().unwrap();
            match queue.len() {
                0 => Err(EmbedError::Empty),
                1 => Ok(queue[0].clone()),
                _ => Ok(queue.pop_front().unwrap()),
            }
        }

        fn embed_text(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(vec![0.5; 4])
        }
    }

    fn unit(values: &[f32]) -> Vec<f32> {
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        values.iter().map(|v| v / norm).collect()
    }

    fn snapshot(source_id: &str) -> Snapshot {
        Snapshot::new(
            source_id,
            Frame {
                rgb: vec![40; Frame::expected_len(16, 16)],
                width: 16,
                height: 16,
            },
        )
    }

    fn training_pipeline(
        store: &Arc<MemoryStore>,
        embedder: Arc<QueueEmbedder>,
        cfg: &TrainingConfig,
    ) -> IngestPipeline {
        let index = ImageIndex::new(store.clone(), IMAGE_COLLECTION).expect("index");
        let anchors = AnchorIndex::new(index, SCHEDULE, cfg.top_k);
        IngestPipeline::training(embedder, anchors, cfg)
    }

    fn runtime_pipeline(
        store: &Arc<MemoryStore>,
        embedder: Arc<QueueEmbedder>,
        cfg: &RuntimeConfig,
    ) -> IngestPipeline {
        let index = ImageIndex::new(store.clone(), IMAGE_COLLECTION).expect("index");
        let detector = AnomalyDetector::new(index, cfg.anomaly_threshold, cfg.top_k);
        let reporter = AnomalyReporter::new(cfg.anomaly_dir.clone(), None);
        IngestPipeline::runtime(embedder, detector, reporter, cfg)
    }

    #[test]
    fn first_frame_trains_anchor_one() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![unit(&[1.0, 0.0])]));
        let mut pipeline = training_pipeline(&store, embedder, &TrainingConfig::default());

        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert_eq!(outcome, Outcome::Trained { anchor_id: 1, seq: 1 });
    }

    #[test]
    fn near_identical_frame_skips_search_and_write() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![
            unit(&[1.0, 0.0]),
            unit(&[0.999, 0.0447]), // cos ~0.999 against the first
        ]));
        let mut pipeline = training_pipeline(&store, embedder, &TrainingConfig::default());

        assert!(matches!(
            pipeline.process_snapshot(&snapshot("cam-1")),
            Outcome::Trained { .. }
        ));
        let searches = store.search_calls.load(Ordering::SeqCst);
        let upserts = store.upsert_calls.load(Ordering::SeqCst);

        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(store.search_calls.load(Ordering::SeqCst), searches);
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), upserts);
    }

    #[test]
    fn store_failure_drops_frame_and_next_one_recovers() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![
            unit(&[1.0, 0.0, 0.0]),
            unit(&[0.0, 1.0, 0.0]),
            unit(&[0.0, 0.0, 1.0]),
        ]));
        let mut pipeline = training_pipeline(&store, embedder, &TrainingConfig::default());

        assert!(matches!(
            pipeline.process_snapshot(&snapshot("cam-1")),
            Outcome::Trained { .. }
        ));

        store.fail_upsert.store(true, Ordering::SeqCst);
        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert_eq!(outcome, Outcome::Dropped { stage: Stage::Assign });

        // Counters were not advanced by the failed write: the retry gets the
        // same anchor id and the next sequence number.
        store.fail_upsert.store(false, Ordering::SeqCst);
        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert_eq!(outcome, Outcome::Trained { anchor_id: 2, seq: 2 });
    }

    #[test]
    fn embedding_failure_drops_frame() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![unit(&[1.0, 0.0])]));
        embedder.fail.store(true, Ordering::SeqCst);
        let mut pipeline = training_pipeline(&store, embedder, &TrainingConfig::default());

        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert_eq!(outcome, Outcome::Dropped { stage: Stage::Embed });
    }

    #[test]
    fn training_bound_freezes_run() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![
            unit(&[1.0, 0.0, 0.0]),
            unit(&[0.0, 1.0, 0.0]),
            unit(&[0.0, 0.0, 1.0]),
        ]));
        let cfg = TrainingConfig {
            prune_after: Some(2),
            prune_percent: 50,
            ..TrainingConfig::default()
        };
        let mut pipeline = training_pipeline(&store, embedder, &cfg);

        assert!(matches!(
            pipeline.process_snapshot(&snapshot("cam-1")),
            Outcome::Trained { .. }
        ));
        assert!(matches!(
            pipeline.process_snapshot(&snapshot("cam-1")),
            Outcome::Trained { .. }
        ));
        // Bound reached: pruned to the newest half and frozen.
        assert_eq!(store.delete_calls.load(Ordering::SeqCst), 1);

        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert_eq!(outcome, Outcome::TrainingFrozen);
    }

    #[test]
    fn runtime_matches_learned_anchor() {
        let store = Arc::new(MemoryStore::new());
        let index = ImageIndex::new(store.clone(), IMAGE_COLLECTION).expect("index");
        index
            .add(&unit(&[1.0, 0.0]), "cam-1", 1.0, None, json!({ "anchor_id": 1, "seq": 1 }))
            .expect("seed");

        let embedder = Arc::new(QueueEmbedder::new(vec![unit(&[1.0, 0.0])]));
        let mut pipeline = runtime_pipeline(&store, embedder, &RuntimeConfig::default());

        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert!(matches!(outcome, Outcome::Normal { similarity } if similarity > 0.99));
    }

    #[test]
    fn runtime_reports_similarity_drop() {
        let store = Arc::new(MemoryStore::new());
        let index = ImageIndex::new(store.clone(), IMAGE_COLLECTION).expect("index");
        index
            .add(&unit(&[1.0, 0.0]), "cam-1", 1.0, None, json!({ "anchor_id": 1, "seq": 1 }))
            .expect("seed");

        let embedder = Arc::new(QueueEmbedder::new(vec![unit(&[0.8, 0.6])]));
        let mut pipeline = runtime_pipeline(&store, embedder, &RuntimeConfig::default());

        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        match outcome {
            Outcome::AnomalyReported { reason, similarity } => {
                assert_eq!(reason, AnomalyReason::SimilarityDrop);
                assert!((similarity - 0.8).abs() < 1e-6);
            }
            other => panic!("expected anomaly, got {other:?}"),
        }
    }

    #[test]
    fn runtime_with_empty_index_reports_no_similar_vectors() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![unit(&[1.0, 0.0])]));
        let mut pipeline = runtime_pipeline(&store, embedder, &RuntimeConfig::default());

        let outcome = pipeline.process_snapshot(&snapshot("cam-1"));
        assert!(matches!(
            outcome,
            Outcome::AnomalyReported {
                reason: AnomalyReason::NoSimilarVectors,
                ..
            }
        ));
    }

    #[test]
    fn runtime_never_writes_to_the_index() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![
            unit(&[1.0, 0.0]),
            unit(&[0.0, 1.0]),
        ]));
        let mut pipeline = runtime_pipeline(&store, embedder, &RuntimeConfig::default());

        pipeline.process_snapshot(&snapshot("cam-1"));
        pipeline.process_snapshot(&snapshot("cam-1"));
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn anomalous_frames_are_exported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![unit(&[1.0, 0.0])]));
        let cfg = RuntimeConfig {
            anomaly_dir: Some(dir.path().to_path_buf()),
            ..RuntimeConfig::default()
        };
        let mut pipeline = runtime_pipeline(&store, embedder, &cfg);

        pipeline.process_snapshot(&snapshot("cam-1"));

        let exported: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(exported.len(), 1);
        let name = exported[0].file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("cam-1-"));
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn worker_processes_handed_off_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(QueueEmbedder::new(vec![
            unit(&[1.0, 0.0, 0.0]),
            unit(&[0.0, 1.0, 0.0]),
            unit(&[0.0, 0.0, 1.0]),
        ]));
        let pipeline = training_pipeline(&store, embedder, &TrainingConfig::default());

        let worker = IngestWorker::start(pipeline, 16);
        let consumer = worker.consumer();
        for _ in 0..3 {
            consumer(snapshot("cam-1"));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.upsert_calls.load(Ordering::SeqCst) < 3
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop();

        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 3);
        // Emission order preserved: sequence numbers follow send order.
        let records = store.records(IMAGE_COLLECTION);
        let seqs: Vec<u64> = records
            .iter()
            .map(|r| r.payload["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
