//! # aax-pipeline
//!
//! On-device acquisition pipeline for DRM-protected audiobooks: download the
//! encrypted artifact, convert it to a plaintext container, validate the
//! result, upload it to durable storage and trigger remote post-processing.
//!
//! ## Design Philosophy
//!
//! aax-pipeline is designed to be:
//! - **Single-lane** - One item processes at a time, later requests queue FIFO
//! - **Resumable** - Stages skip work whose durable output already exists
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use aax_pipeline::{Config, Pipeline, PipelineServices, ProcessingItem, ItemId};
//!
//! # async fn example(services: PipelineServices) -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::new(Config::default(), services).await?;
//!
//! // Subscribe to events
//! let mut events = pipeline.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! pipeline.start_processing(ProcessingItem {
//!     id: ItemId::new("bk-1"),
//!     title: "An Audiobook".to_string(),
//!     source_url: "https://cdn.example.com/bk-1.aax".to_string(),
//!     remote_progress: 0.0,
//! });
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Artifact conversion (decrypt + remux)
pub mod converter;
/// Encrypted artifact downloader
pub mod downloader;
/// Error types
pub mod error;
/// Pipeline orchestrator (decomposed into focused submodules)
pub mod pipeline;
/// Retry logic with exponential backoff
pub mod retry;
/// Device storage probing
pub mod storage_probe;
/// Per-task progress state machine
pub mod task_state;
/// Remote post-processing trigger
pub mod trigger;
/// Core types and events
pub mod types;
/// Durable artifact uploader
pub mod uploader;
/// Converted-artifact validation
pub mod validator;

// Re-export commonly used types
pub use config::{Config, RetryConfig, StorageConfig, ValidationConfig};
pub use converter::{CliConverter, Converter, EncryptionMaterialProvider};
pub use downloader::{Downloader, ProgressFn};
pub use error::{
    AuthError, CodecError, Error, Result, StorageError, TransferError, TriggerError,
};
pub use pipeline::{Pipeline, PipelineServices};
pub use storage_probe::{StorageProbe, SystemStorageProbe};
pub use trigger::{HttpRemoteTrigger, RemoteTrigger};
pub use types::{
    DownloadStatus, EncryptionMaterial, Event, ItemId, ProcessingItem, Stage, TaskId,
    TaskSnapshot, UploadStatus,
};
pub use uploader::Uploader;
