//! Durable artifact uploader
//!
//! Streams converted artifacts to an [`ObjectStore`] backend via multipart
//! upload. The backend is injected as a trait object, so production can use
//! a cloud store while tests run against `object_store::memory::InMemory`.

use crate::error::{Result, TransferError};
use crate::types::{ItemId, UploadStatus};
use bytes::BytesMut;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::downloader::ProgressFn;

/// Multipart chunk size (8 MiB, above the common 5 MiB backend minimum)
const PART_SIZE: usize = 8 * 1024 * 1024;

struct UploadJob {
    progress: f32,
    status: UploadStatus,
    cancel: CancellationToken,
}

/// Manages at most one upload per item id
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    jobs: Arc<Mutex<HashMap<ItemId, UploadJob>>>,
}

impl Uploader {
    /// Create an uploader backed by the given object store
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Upload a local file to `dest_path` in the object store.
    ///
    /// Streams the file as a multipart upload with progress callbacks and
    /// returns the destination path on success. An incomplete upload is
    /// aborted so no orphaned parts accumulate on the backend.
    ///
    /// # Errors
    ///
    /// - [`TransferError::AlreadyInProgress`] when a job exists for the item
    /// - [`TransferError::Cancelled`] when [`Uploader::cancel`] fires
    /// - [`TransferError::UploadFailed`] on backend failures
    pub async fn upload(
        &self,
        item_id: &ItemId,
        file: &Path,
        dest_path: &str,
        on_progress: ProgressFn,
    ) -> Result<String> {
        let cancel = self.register_job(item_id)?;
        tracing::info!(item_id = %item_id, file = %file.display(), dest_path, "Starting upload");

        let result = self
            .run_upload(item_id, file, dest_path, &on_progress, &cancel)
            .await;

        self.remove_job(item_id);

        match &result {
            Ok(_) => tracing::info!(item_id = %item_id, dest_path, "Upload complete"),
            Err(e) if e.is_cancelled() => {
                tracing::info!(item_id = %item_id, "Upload cancelled");
            }
            Err(e) => tracing::error!(item_id = %item_id, error = %e, "Upload failed"),
        }
        result
    }

    /// Cancel the upload for an item; no-op when no job exists
    pub fn cancel(&self, item_id: &ItemId) {
        let job = lock_jobs(&self.jobs).remove(item_id);
        if let Some(job) = job {
            tracing::info!(item_id = %item_id, "Cancelling upload");
            job.cancel.cancel();
        }
    }

    /// Cancel every active upload
    pub fn cancel_all(&self) {
        let jobs: Vec<(ItemId, UploadJob)> = lock_jobs(&self.jobs).drain().collect();
        for (item_id, job) in jobs {
            tracing::info!(item_id = %item_id, "Cancelling upload");
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

    /// Current status for an item; absence reports `Completed`
    pub fn status(&self, item_id: &ItemId) -> UploadStatus {
        lock_jobs(&self.jobs)
            .get(item_id)
            .map(|j| j.status)
            .unwrap_or(UploadStatus::Completed)
    }

    fn register_job(&self, item_id: &ItemId) -> Result<CancellationToken> {
        let mut jobs = lock_jobs(&self.jobs);
        if jobs.contains_key(item_id) {
            return Err(TransferError::AlreadyInProgress(item_id.to_string()).into());
        }
        let cancel = CancellationToken::new();
        jobs.insert(
            item_id.clone(),
            UploadJob {
                progress: 0.0,
                status: UploadStatus::Uploading,
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    fn remove_job(&self, item_id: &ItemId) {
        lock_jobs(&self.jobs).remove(item_id);
    }

    fn update_progress(&self, item_id: &ItemId, progress: f32) {
        if let Some(job) = lock_jobs(&self.jobs).get_mut(item_id) {
            job.progress = progress;
        }
    }

    async fn run_upload(
        &self,
        item_id: &ItemId,
        file: &Path,
        dest_path: &str,
        on_progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let total = tokio::fs::metadata(file).await?.len();
        let mut source = tokio::fs::File::open(file).await?;
        let dest = object_store::path::Path::from(dest_path);

        let mut multipart = self
            .store
            .put_multipart(&dest)
            .await
            .map_err(|e| TransferError::UploadFailed(e.to_string()))?;

        let mut sent: u64 = 0;
        loop {
            let mut buf = BytesMut::with_capacity(PART_SIZE);
            while buf.len() < PART_SIZE {
                let n = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(abort_cancelled(multipart).await);
                    }
                    n = source.read_buf(&mut buf) => n?,
                };
                if n == 0 {
                    break;
                }
            }
            if buf.is_empty() {
                break;
            }

            let len = buf.len() as u64;
            let part = multipart.put_part(PutPayload::from(buf.freeze()));
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(abort_cancelled(multipart).await);
                }
                result = part => {
                    result.map_err(|e| TransferError::UploadFailed(e.to_string()))?;
                }
            }

            sent += len;
            if total > 0 {
                let fraction = (sent as f32 / total as f32).clamp(0.0, 1.0);
                self.update_progress(item_id, fraction);
                on_progress(fraction);
            }
        }

        multipart
            .complete()
            .await
            .map_err(|e| TransferError::UploadFailed(e.to_string()))?;

        on_progress(1.0);
        Ok(dest_path.to_string())
    }
}

async fn abort_cancelled(mut multipart: Box<dyn MultipartUpload>) -> crate::error::Error {
    if let Err(e) = multipart.abort().await {
        tracing::warn!(error = %e, "Failed to abort multipart upload");
    }
    TransferError::Cancelled.into()
}

fn lock_jobs<'a>(
    jobs: &'a Mutex<HashMap<ItemId, UploadJob>>,
) -> std::sync::MutexGuard<'a, HashMap<ItemId, UploadJob>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn no_progress() -> ProgressFn {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn upload_stores_file_contents_at_destination() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("book.m4b");
        let body = vec![3u8; 50_000];
        tokio::fs::write(&file, &body).await.unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = Uploader::new(store.clone());
        let item = ItemId::new("bk-1");

        let dest = uploader
            .upload(&item, &file, "audiobooks/bk-1.m4b", no_progress())
            .await
            .unwrap();
        assert_eq!(dest, "audiobooks/bk-1.m4b");

        let stored = store
            .get(&object_store::path::Path::from("audiobooks/bk-1.m4b"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.to_vec(), body);
        assert_eq!(uploader.status(&item), UploadStatus::Completed);
    }

    #[tokio::test]
    async fn progress_callbacks_reach_one() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("book.m4b");
        tokio::fs::write(&file, vec![0u8; 12_345]).await.unwrap();

        let uploader = Uploader::new(Arc::new(InMemory::new()));
        let last = Arc::new(AtomicU64::new(0));
        let last_clone = last.clone();
        let on_progress: ProgressFn = Arc::new(move |p| {
            last_clone.store((p * 1000.0) as u64, Ordering::SeqCst);
        });

        uploader
            .upload(&ItemId::new("bk-2"), &file, "audiobooks/bk-2.m4b", on_progress)
            .await
            .unwrap();

        assert_eq!(last.load(Ordering::SeqCst), 1000);
    }

    #[tokio::test]
    async fn second_upload_for_same_item_is_rejected() {
        let uploader = Uploader::new(Arc::new(InMemory::new()));
        let item = ItemId::new("bk-3");

        // Register a job directly; no transfer needed to exercise the guard
        uploader.register_job(&item).unwrap();

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("book.m4b");
        tokio::fs::write(&file, b"data").await.unwrap();

        let err = uploader
            .upload(&item, &file, "audiobooks/bk-3.m4b", no_progress())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer(TransferError::AlreadyInProgress(_))
        ));
    }

    #[tokio::test]
    async fn missing_source_file_fails_and_frees_the_slot() {
        let uploader = Uploader::new(Arc::new(InMemory::new()));
        let item = ItemId::new("bk-4");

        let result = uploader
            .upload(
                &item,
                Path::new("/nonexistent/book.m4b"),
                "audiobooks/bk-4.m4b",
                no_progress(),
            )
            .await;
        assert!(result.is_err());

        // The failed job must not block a later attempt
        assert!(uploader.register_job(&item).is_ok());
    }

    #[tokio::test]
    async fn cancel_of_absent_job_is_a_noop() {
        let uploader = Uploader::new(Arc::new(InMemory::new()));
        uploader.cancel(&ItemId::new("missing"));
        assert_eq!(uploader.progress(&ItemId::new("missing")), 0.0);
    }
}
