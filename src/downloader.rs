//! Encrypted artifact downloader
//!
//! Manages one network download per item: preflight space check, streaming
//! transfer with progress push, cooperative cancellation, and the move from
//! the transient download area to the stable raw-artifact directory.

use crate::config::Config;
use crate::error::{Error, Result, StorageError, TransferError, translate_write_error};
use crate::storage_probe::StorageProbe;
use crate::types::{DownloadStatus, ItemId};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Progress callback invoked with the stage fraction (0.0 to 1.0)
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// One in-flight download, keyed by item id
struct DownloadJob {
    id: u64,
    progress: f32,
    status: DownloadStatus,
    cancel: CancellationToken,
}

/// Manages at most one download per item id
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    config: Arc<Config>,
    probe: Arc<dyn StorageProbe>,
    jobs: Arc<Mutex<HashMap<ItemId, DownloadJob>>>,
    next_job_id: Arc<AtomicU64>,
}

impl Downloader {
    /// Create a new downloader
    pub fn new(client: reqwest::Client, config: Arc<Config>, probe: Arc<dyn StorageProbe>) -> Self {
        Self {
            client,
            config,
            probe,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Download the encrypted artifact for an item.
    ///
    /// Preflights free space against the estimated remote size plus margin
    /// (or the configured fallback when estimation fails), streams the body
    /// into the transient area with progress callbacks, then moves the
    /// primary payload to the stable raw-artifact path.
    ///
    /// Returns the download job id and the final artifact path.
    ///
    /// # Errors
    ///
    /// - [`TransferError::AlreadyInProgress`] when a job exists for the item
    /// - [`StorageError::InsufficientSpace`] when preflight or the move fails
    /// - [`TransferError::Cancelled`] when [`Downloader::cancel`] fires
    pub async fn download(
        &self,
        item_id: &ItemId,
        url: &str,
        on_progress: ProgressFn,
    ) -> Result<(u64, PathBuf)> {
        let (job_id, cancel) = self.register_job(item_id)?;

        let result = self
            .run_transfer(job_id, item_id, url, &on_progress, &cancel)
            .await;

        self.remove_job(item_id);

        if result.is_err() {
            // Best-effort cleanup of partial artifacts
            let dir = self.config.transient_dir_for(item_id);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(item_id = %item_id, error = %e, "Failed to clean up partial download");
                }
            }
        }

        result.map(|path| (job_id, path))
    }

    /// Cancel the download for an item.
    ///
    /// Synchronously resolves the in-flight transfer with
    /// [`TransferError::Cancelled`] so no completion is ever leaked.
    /// No-op when no job exists.
    pub fn cancel(&self, item_id: &ItemId) {
        let job = lock_jobs(&self.jobs).remove(item_id);
        if let Some(job) = job {
            tracing::info!(item_id = %item_id, download_id = job.id, "Cancelling download");
            job.cancel.cancel();
        }
    }

    /// Cancel every active download (bulk teardown, e.g. sign-out)
    pub fn cancel_all(&self) {
        let jobs: Vec<(ItemId, DownloadJob)> = lock_jobs(&self.jobs).drain().collect();
        for (item_id, job) in jobs {
            tracing::info!(item_id = %item_id, download_id = job.id, "Cancelling download");
            job.cancel.cancel();
        }
    }

    /// Current progress for an item; 0.0 when no job exists
    pub fn progress(&self, item_id: &ItemId) -> f32 {
        lock_jobs(&self.jobs)
            .get(item_id)
            .map(|j| j.progress)
            .unwrap_or(0.0)
    }

    /// Current status for an item.
    ///
    /// Absence of a job means "not in progress", reported as `Completed`
    /// rather than an error.
    pub fn status(&self, item_id: &ItemId) -> DownloadStatus {
        lock_jobs(&self.jobs)
            .get(item_id)
            .map(|j| j.status)
            .unwrap_or(DownloadStatus::Completed)
    }

    fn register_job(&self, item_id: &ItemId) -> Result<(u64, CancellationToken)> {
        let mut jobs = lock_jobs(&self.jobs);
        if jobs.contains_key(item_id) {
            return Err(TransferError::AlreadyInProgress(item_id.to_string()).into());
        }
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        jobs.insert(
            item_id.clone(),
            DownloadJob {
                id,
                progress: 0.0,
                status: DownloadStatus::Waiting,
                cancel: cancel.clone(),
            },
        );
        Ok((id, cancel))
    }

    fn remove_job(&self, item_id: &ItemId) {
        lock_jobs(&self.jobs).remove(item_id);
    }

    fn update_job(&self, item_id: &ItemId, progress: Option<f32>, status: Option<DownloadStatus>) {
        if let Some(job) = lock_jobs(&self.jobs).get_mut(item_id) {
            if let Some(p) = progress {
                job.progress = p;
            }
            if let Some(s) = status {
                job.status = s;
            }
        }
    }

    async fn run_transfer(
        &self,
        job_id: u64,
        item_id: &ItemId,
        url: &str,
        on_progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let storage = &self.config.storage;

        // Advisory preflight: estimate + margin, or the fallback requirement
        // when the remote size cannot be determined
        let estimate = self.estimate_remote_size(url).await;
        let required = match estimate {
            Some(size) => size.saturating_add(storage.download_margin_bytes),
            None => storage.fallback_required_bytes,
        };
        let available = self.probe.available_space(&storage.transient_dir)?;
        if available < required {
            tracing::warn!(
                item_id = %item_id,
                required,
                available,
                "Insufficient space for download"
            );
            return Err(StorageError::InsufficientSpace {
                required,
                available,
            }
            .into());
        }

        let dir = self.config.transient_dir_for(item_id);
        tokio::fs::create_dir_all(&dir).await?;
        let payload_path = dir.join(format!("{}.{}", item_id, storage.raw_extension));

        self.update_job(item_id, None, Some(DownloadStatus::Downloading));
        tracing::info!(item_id = %item_id, download_id = job_id, url, "Starting download");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
            resp = self.client.get(url).send() => resp?.error_for_status()?,
        };

        let total = response
            .content_length()
            .or(estimate)
            .filter(|&t| t > 0);

        let mut file = tokio::fs::File::create(&payload_path)
            .await
            .map_err(|e| translate_write_error(e, required, available))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(item_id = %item_id, download_id = job_id, "Download cancelled");
                    return Err(TransferError::Cancelled.into());
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| translate_write_error(e, required, available))?;
            downloaded += chunk.len() as u64;

            if let Some(total) = total {
                let fraction = (downloaded as f32 / total as f32).clamp(0.0, 1.0);
                self.update_job(item_id, Some(fraction), None);
                on_progress(fraction);
            }
        }

        file.flush()
            .await
            .map_err(|e| translate_write_error(e, required, available))?;
        drop(file);

        tracing::info!(
            item_id = %item_id,
            download_id = job_id,
            bytes = downloaded,
            "Transfer complete, moving artifact"
        );

        self.update_job(item_id, Some(1.0), Some(DownloadStatus::Moving));
        let dest = self.move_to_stable_location(item_id, &dir).await?;

        on_progress(1.0);
        self.update_job(item_id, None, Some(DownloadStatus::Completed));
        Ok(dest)
    }

    /// Move the primary payload from the transient area to the stable
    /// raw-artifact directory, identifying it among sidecar files by the
    /// expected extension.
    async fn move_to_stable_location(&self, item_id: &ItemId, dir: &Path) -> Result<PathBuf> {
        let storage = &self.config.storage;

        let available = self.probe.available_space(&storage.raw_dir)?;
        if available < storage.move_margin_bytes {
            return Err(StorageError::InsufficientSpace {
                required: storage.move_margin_bytes,
                available,
            }
            .into());
        }

        let payload = find_payload(dir, &storage.raw_extension).await?;
        let dest = self.config.raw_artifact_path(item_id);
        tokio::fs::create_dir_all(&storage.raw_dir).await?;

        // rename fails across filesystems, fall back to copy + remove
        if let Err(rename_err) = tokio::fs::rename(&payload, &dest).await {
            tracing::debug!(error = %rename_err, "Rename failed, falling back to copy");
            tokio::fs::copy(&payload, &dest).await.map_err(|e| {
                Error::Storage(StorageError::MoveFailed {
                    source_path: payload.clone(),
                    dest_path: dest.clone(),
                    reason: e.to_string(),
                })
            })?;
            if let Err(e) = tokio::fs::remove_file(&payload).await {
                tracing::warn!(error = %e, "Failed to remove transient payload after copy");
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            tracing::warn!(error = %e, "Failed to remove transient download directory");
        }

        Ok(dest)
    }

    /// Estimate the remote artifact size via a HEAD request.
    ///
    /// Returns None on any failure; the caller falls back to the fixed
    /// free-space requirement.
    async fn estimate_remote_size(&self, url: &str) -> Option<u64> {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok()),
            Ok(resp) => {
                tracing::warn!(url, status = %resp.status(), "Size estimation rejected");
                None
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "Size estimation failed");
                None
            }
        }
    }
}

/// Pick the primary payload in a download directory by expected extension
async fn find_payload(dir: &Path, extension: &str) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut fallback = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            return Ok(path);
        }
        fallback.get_or_insert(path);
    }
    fallback.ok_or_else(|| {
        Error::Storage(StorageError::MoveFailed {
            source_path: dir.to_path_buf(),
            dest_path: PathBuf::new(),
            reason: "no payload found in download directory".to_string(),
        })
    })
}

fn lock_jobs<'a>(
    jobs: &'a Mutex<HashMap<ItemId, DownloadJob>>,
) -> std::sync::MutexGuard<'a, HashMap<ItemId, DownloadJob>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
