//! Service construction and lifecycle
//!
//! Every service is built exactly once here and handed to its consumers.

use orbitgate_core::{Error, PipelineConfig, Result};
use orbitgate_eye::{Detector, DetectorFactory, ObjectBrain, ObjectTracker};
use orbitgate_storage::{
    DurableStore, FlushReport, MemoryBackend, MemoryDurableStore, ObjectPersistence, SledStore,
    StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The wired pipeline
pub struct Services {
    pub config: PipelineConfig,
    pub store: StateStore,
    pub tracker: Arc<ObjectTracker>,
    pub brain: Arc<ObjectBrain>,
    pub persistence: Arc<ObjectPersistence>,
}

impl Services {
    /// Validate `config`, open storage and connect persistence
    pub async fn build(config: PipelineConfig) -> Result<Self> {
        Self::build_with_detectors(config, &DetectorFactory::new()).await
    }

    /// As [`Services::build`], creating the detector from `detectors` so a
    /// detector registered for the `custom` backend is picked up
    pub async fn build_with_detectors(
        config: PipelineConfig,
        detectors: &DetectorFactory,
    ) -> Result<Self> {
        config.validate()?;

        let store = StateStore::new(Arc::new(MemoryBackend::new()));

        let durable: Arc<dyn DurableStore> = match &config.persistence.path {
            Some(path) => {
                info!("Opening durable store at {}", path.display());
                Arc::new(SledStore::open(path)?)
            }
            None => {
                info!("No durable path configured, using in-memory durable store");
                Arc::new(MemoryDurableStore::new())
            }
        };
        let persistence = Arc::new(ObjectPersistence::new(durable, &config.persistence));
        persistence.connect().await?;

        let object_ttl = config.store.object_ttl_secs.map(Duration::from_secs);
        let tracker = Arc::new(ObjectTracker::new(
            store.clone(),
            config.tracker.clone(),
            object_ttl,
        ));

        let detector = detectors.create(&config.detector).map_err(Error::from)?;
        info!("Detector backend: {}", detector.backend());

        let brain = Arc::new(
            ObjectBrain::new(store.clone(), tracker.clone(), detector, config.brain.clone())?
                .with_persistence(persistence.clone()),
        );

        Ok(Self {
            config,
            store,
            tracker,
            brain,
            persistence,
        })
    }

    /// Start background work
    pub fn start(&self) {
        self.persistence.start_flush_loop();
    }

    /// Stop the flush loop, flush every buffer and disconnect
    pub async fn shutdown(&self) -> Result<FlushReport> {
        let report = self.persistence.shutdown().await?;
        self.persistence.disconnect().await?;
        Ok(report)
    }
}
