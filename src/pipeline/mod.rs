//! Pipeline orchestrator
//!
//! One item processes at a time: the active slot holds the running task and
//! later requests queue FIFO behind it. Stage execution lives in [`run`],
//! enqueueing in [`queue`], cancellation in [`control`].

mod control;
mod queue;
mod run;

use crate::config::Config;
use crate::converter::{Converter, EncryptionMaterialProvider};
use crate::downloader::Downloader;
use crate::error::Result;
use crate::storage_probe::StorageProbe;
use crate::task_state::TaskState;
use crate::trigger::RemoteTrigger;
use crate::types::{Event, ItemId, ProcessingItem, TaskSnapshot};
use crate::uploader::Uploader;
use object_store::ObjectStore;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Injectable service implementations for the pipeline
///
/// Production wires the real converter, material provider, trigger, probe
/// and cloud store; tests substitute fakes and `InMemory`.
pub struct PipelineServices {
    /// Artifact converter (decrypt + remux)
    pub converter: Arc<dyn Converter>,
    /// Per-item decryption material source
    pub material_provider: Arc<dyn EncryptionMaterialProvider>,
    /// Remote post-processing trigger
    pub trigger: Arc<dyn RemoteTrigger>,
    /// Free-space probe
    pub probe: Arc<dyn StorageProbe>,
    /// Durable storage backend for converted artifacts
    pub object_store: Arc<dyn ObjectStore>,
}

/// The task occupying the active slot
pub(crate) struct ActiveSlot {
    pub(crate) state: TaskState,
    pub(crate) cancel: CancellationToken,
}

/// Audiobook acquisition pipeline
///
/// Cheap to clone; all clones share the same queue, active slot and event
/// channel.
///
/// # Example
///
/// ```no_run
/// # async fn example(services: aax_pipeline::PipelineServices) -> aax_pipeline::Result<()> {
/// use aax_pipeline::{Config, Pipeline, ProcessingItem, ItemId};
///
/// let pipeline = Pipeline::new(Config::default(), services).await?;
/// let mut events = pipeline.subscribe();
///
/// pipeline.start_processing(ProcessingItem {
///     id: ItemId::new("bk-1"),
///     title: "Some Title".into(),
///     source_url: "https://cdn.example.com/bk-1.aax".into(),
///     remote_progress: 0.0,
/// });
///
/// while let Ok(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) config: Arc<Config>,
    pub(crate) downloader: Downloader,
    pub(crate) uploader: Uploader,
    pub(crate) converter: Arc<dyn Converter>,
    pub(crate) material_provider: Arc<dyn EncryptionMaterialProvider>,
    pub(crate) trigger: Arc<dyn RemoteTrigger>,
    pub(crate) active: Arc<Mutex<Option<ActiveSlot>>>,
    pub(crate) pending: Arc<Mutex<VecDeque<ProcessingItem>>>,
    pub(crate) next_task_id: Arc<AtomicU64>,
    pub(crate) event_tx: broadcast::Sender<Event>,
}

impl Pipeline {
    /// Create a pipeline with the given configuration and services.
    ///
    /// Validates the configuration and creates the local artifact
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] for invalid configuration values, or
    /// an I/O error when an artifact directory cannot be created.
    pub async fn new(config: Config, services: PipelineServices) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        for dir in [
            &config.storage.raw_dir,
            &config.storage.converted_dir,
            &config.storage.transient_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let client = reqwest::Client::new();
        let (event_tx, _) = broadcast::channel(1024);

        Ok(Self {
            downloader: Downloader::new(client, config.clone(), services.probe),
            uploader: Uploader::new(services.object_store),
            converter: services.converter,
            material_provider: services.material_provider,
            trigger: services.trigger,
            config,
            active: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            next_task_id: Arc::new(AtomicU64::new(1)),
            event_tx,
        })
    }

    /// Subscribe to lifecycle events.
    ///
    /// Each subscriber gets an independent receiver; slow subscribers may
    /// observe `Lagged` on the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Snapshot of the active task, if any
    pub fn active_task(&self) -> Option<TaskSnapshot> {
        lock(&self.active).as_ref().map(|slot| slot.state.snapshot())
    }

    /// Item ids awaiting the active slot, FIFO order
    pub fn pending_items(&self) -> Vec<ItemId> {
        lock(&self.pending).iter().map(|item| item.id.clone()).collect()
    }

    pub(crate) fn emit(&self, event: Event) {
        // Err means no subscribers, which is fine
        let _ = self.event_tx.send(event);
    }
}

/// Mutex lock that survives a poisoned peer by taking the inner value
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
