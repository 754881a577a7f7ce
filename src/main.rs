use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use observer::anchor::{AnchorIndex, ThresholdSchedule};
use observer::config::{Mode, ObserverConfig, SourceConfig};
use observer::detector::AnomalyDetector;
use observer::embedder::{Embedder, HttpEmbedder};
use observer::index::{IMAGE_COLLECTION, ImageIndex, TEXT_COLLECTION, TextIndex};
use observer::logging;
use observer::pipeline::{AnomalyReporter, CameraInfo, IngestPipeline, IngestWorker, VlmAnalysis};
use observer::registry::{SourceRegistry, default_source_factory};
use observer::store::{QdrantHttp, VectorStore};
use observer::vlm::VlmClient;

const DEFAULT_CONFIG_PATH: &str = "observer_config.json";
const INGEST_QUEUE_DEPTH: usize = 32;
const RESUME_PAGE_SIZE: usize = 1000;
const DEFAULT_ANOMALY_DIR: &str = ".observer/anomalies";

fn main() {
    logging::init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    info!(config = %config_path, "observer starting");

    let config = match ObserverConfig::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration unusable, aborting");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config) {
        error!(error = %err, "startup failed");
        std::process::exit(1);
    }
}

fn run(config: ObserverConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Eager construction: every external client exists before the first
    // frame is sampled.
    let store: Arc<dyn VectorStore> = Arc::new(QdrantHttp::new(&config.qdrant_url)?);
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(&config.model_server_url)?);

    let pipeline = match config.mode {
        Mode::Training => {
            let index = ImageIndex::new(Arc::clone(&store), IMAGE_COLLECTION)?;
            let schedule = ThresholdSchedule {
                base: config.training.base_threshold,
                max: config.training.max_threshold,
                step: config.training.threshold_step,
                step_size: config.training.threshold_step_size,
            };
            let mut anchors = AnchorIndex::new(index, schedule, config.training.top_k);
            // Pick an interrupted run back up where it left off.
            anchors.resume_from_store(RESUME_PAGE_SIZE)?;
            info!("training pipeline composed");
            IngestPipeline::training(Arc::clone(&embedder), anchors, &config.training)
        }
        Mode::Runtime => {
            let index = ImageIndex::new(Arc::clone(&store), IMAGE_COLLECTION)?;
            let detector =
                AnomalyDetector::new(index, config.runtime.anomaly_threshold, config.runtime.top_k);

            let analysis = match &config.vlm {
                Some(vlm_cfg) => {
                    let client = VlmClient::new(&config.model_server_url, vlm_cfg.timeout_secs)?;
                    let text_index = TextIndex::new(Arc::clone(&store), TEXT_COLLECTION)?;
                    Some(VlmAnalysis::new(
                        client,
                        Arc::clone(&embedder),
                        text_index,
                        vlm_cfg.clone(),
                        camera_infos(&config),
                    ))
                }
                None => None,
            };

            let export_dir = config
                .runtime
                .anomaly_dir
                .clone()
                .or_else(|| Some(default_anomaly_dir()));
            let reporter = AnomalyReporter::new(export_dir, analysis);
            info!("runtime pipeline composed");
            IngestPipeline::runtime(Arc::clone(&embedder), detector, reporter, &config.runtime)
        }
    };

    let worker = IngestWorker::start(pipeline, INGEST_QUEUE_DEPTH);
    let mut registry = SourceRegistry::load(&config, &default_source_factory, worker.consumer());
    registry.start();

    if registry.report().active == 0 {
        warn!("no source came up; the pipeline is idle");
    }

    // Process supervision and signal handling are external concerns; the
    // daemon runs until its supervisor terminates it.
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn camera_infos(config: &ObserverConfig) -> HashMap<String, CameraInfo> {
    config
        .sources
        .iter()
        .filter_map(|entry| SourceConfig::from_value(entry).ok())
        .map(|cfg| {
            (
                cfg.source_id.clone(),
                CameraInfo {
                    name: cfg.name.unwrap_or_default(),
                    description: cfg.description.unwrap_or_default(),
                },
            )
        })
        .collect()
}

fn default_anomaly_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(DEFAULT_ANOMALY_DIR)
}
