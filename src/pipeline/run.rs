//! Stage execution for the active task
//!
//! A task walks download -> convert -> upload -> remote trigger, skipping
//! whole stages when their durable outputs already exist (cross-restart
//! resumability) and skipping upload/trigger entirely when the remote copy
//! already exists. Each stage runs under the shared retry policy; a
//! cancellation resolves the task without touching the failure paths.

use super::{Pipeline, lock};
use crate::downloader::ProgressFn;
use crate::error::{CodecError, Error, Result, TransferError};
use crate::retry::run_with_retry;
use crate::types::{Event, ProcessingItem, Stage, TaskId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

impl Pipeline {
    pub(crate) async fn run_task(
        &self,
        task_id: TaskId,
        item: ProcessingItem,
        cancel: CancellationToken,
    ) {
        // Fix the progress blend before any stage reports progress
        let needs_upload = item.remote_progress <= 0.0;
        self.with_task(task_id, |state| state.set_needs_upload(needs_upload));

        let result = self.run_stages(task_id, &item, needs_upload, &cancel).await;

        match result {
            Ok(()) => {
                self.with_task(task_id, |state| state.set_completed());
                tracing::info!(task_id = %task_id, item_id = %item.id, "Task completed");
                self.finish_task(
                    task_id,
                    Event::TaskCompleted {
                        task_id,
                        item_id: item.id.clone(),
                    },
                );
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                if cancel.is_cancelled() {
                    // cancel_processing owns slot removal, events and queue
                    // advancement; the runner only exits
                    tracing::info!(task_id = %task_id, item_id = %item.id, "Task runner exiting after cancellation");
                } else {
                    // The transfer was torn down externally (bulk cancel);
                    // finish the task lifecycle here
                    tracing::info!(task_id = %task_id, item_id = %item.id, "Transfer cancelled externally, removing task");
                    self.finish_task(
                        task_id,
                        Event::TaskCancelled {
                            task_id,
                            item_id: item.id.clone(),
                        },
                    );
                }
            }
            Err(e) => {
                let stage = self
                    .with_task(task_id, |state| state.stage())
                    .unwrap_or(Stage::Waiting);
                tracing::error!(
                    task_id = %task_id,
                    item_id = %item.id,
                    ?stage,
                    error = %e,
                    "Task failed"
                );
                self.finish_task(
                    task_id,
                    Event::TaskFailed {
                        task_id,
                        item_id: item.id.clone(),
                        stage,
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    async fn run_stages(
        &self,
        task_id: TaskId,
        item: &ProcessingItem,
        needs_upload: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let raw_path = self.config.raw_artifact_path(&item.id);
        let converted_path = self.config.converted_artifact_path(&item.id);

        self.download_stage(task_id, item, &raw_path, cancel).await?;
        check_cancelled(cancel)?;

        self.set_stage(task_id, Stage::Convert);
        self.convert_stage(task_id, item, &raw_path, &converted_path)
            .await?;
        check_cancelled(cancel)?;

        if !needs_upload {
            tracing::info!(
                task_id = %task_id,
                item_id = %item.id,
                "Remote copy already exists, skipping upload and trigger"
            );
            return Ok(());
        }

        self.set_stage(task_id, Stage::Upload);
        self.upload_stage(task_id, item, &raw_path, &converted_path, cancel)
            .await?;
        check_cancelled(cancel)?;

        self.set_stage(task_id, Stage::RemoteTrigger);
        self.emit(Event::TriggeringRemote {
            task_id,
            item_id: item.id.clone(),
        });
        run_with_retry(&self.config.retry, || self.trigger.trigger(&item.id)).await?;

        Ok(())
    }

    async fn download_stage(
        &self,
        task_id: TaskId,
        item: &ProcessingItem,
        raw_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if tokio::fs::try_exists(raw_path).await? {
            tracing::info!(
                task_id = %task_id,
                item_id = %item.id,
                path = %raw_path.display(),
                "Raw artifact already present, skipping download"
            );
            self.report_download_progress(task_id, item, 1.0);
            return Ok(());
        }

        check_cancelled(cancel)?;
        let (download_id, _path) = run_with_retry(&self.config.retry, || {
            let on_progress = self.download_progress_fn(task_id, item);
            self.downloader.download(&item.id, &item.source_url, on_progress)
        })
        .await?;

        self.with_task(task_id, |state| state.set_download_id(download_id));
        self.report_download_progress(task_id, item, 1.0);
        Ok(())
    }

    async fn convert_stage(
        &self,
        task_id: TaskId,
        item: &ProcessingItem,
        raw_path: &Path,
        converted_path: &Path,
    ) -> Result<()> {
        if tokio::fs::try_exists(converted_path).await? {
            tracing::info!(
                task_id = %task_id,
                item_id = %item.id,
                path = %converted_path.display(),
                "Converted artifact already present, skipping conversion"
            );
            return Ok(());
        }

        self.emit(Event::Converting {
            task_id,
            item_id: item.id.clone(),
        });
        self.convert_once(item, raw_path, converted_path).await
    }

    async fn convert_once(
        &self,
        item: &ProcessingItem,
        raw_path: &Path,
        converted_path: &Path,
    ) -> Result<()> {
        let material = self.material_provider.material_for(&item.id).await?;
        run_with_retry(&self.config.retry, || {
            self.converter.convert(&material, raw_path, converted_path)
        })
        .await
    }

    /// Validate then upload. An invalid conversion gets exactly one
    /// reconversion; a second invalid result is terminal corruption.
    async fn upload_stage(
        &self,
        task_id: TaskId,
        item: &ProcessingItem,
        raw_path: &Path,
        converted_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.emit(Event::Validating {
            task_id,
            item_id: item.id.clone(),
        });

        let tolerance = self.config.validation.size_tolerance;
        if !crate::validator::validate_converted(raw_path, converted_path, tolerance).await? {
            tracing::warn!(
                task_id = %task_id,
                item_id = %item.id,
                "Converted artifact invalid, reconverting once"
            );
            check_cancelled(cancel)?;
            self.convert_once(item, raw_path, converted_path).await?;

            if !crate::validator::validate_converted(raw_path, converted_path, tolerance).await? {
                return Err(CodecError::CorruptedOutputAfterReconversion.into());
            }
        }
        check_cancelled(cancel)?;

        let dest = self.config.remote_dest_path(&item.id);
        let converted: PathBuf = converted_path.to_path_buf();
        run_with_retry(&self.config.retry, || {
            let on_progress = self.upload_progress_fn(task_id, item);
            let converted = converted.clone();
            let dest = dest.clone();
            async move {
                self.uploader
                    .upload(&item.id, &converted, &dest, on_progress)
                    .await
            }
        })
        .await?;

        self.report_upload_progress(task_id, item, 1.0);
        Ok(())
    }

    fn download_progress_fn(&self, task_id: TaskId, item: &ProcessingItem) -> ProgressFn {
        let pipeline = self.clone();
        let item = item.clone();
        Arc::new(move |progress| {
            pipeline.report_download_progress(task_id, &item, progress);
        })
    }

    fn upload_progress_fn(&self, task_id: TaskId, item: &ProcessingItem) -> ProgressFn {
        let pipeline = self.clone();
        let item = item.clone();
        Arc::new(move |progress| {
            pipeline.report_upload_progress(task_id, &item, progress);
        })
    }

    fn report_download_progress(&self, task_id: TaskId, item: &ProcessingItem, progress: f32) {
        let updated = self.with_task(task_id, |state| {
            state.update_download_progress(progress);
            (state.download_progress(), state.overall_progress())
        });
        if let Some((progress, overall)) = updated {
            self.emit(Event::DownloadProgress {
                task_id,
                item_id: item.id.clone(),
                progress,
                overall,
            });
        }
    }

    fn report_upload_progress(&self, task_id: TaskId, item: &ProcessingItem, progress: f32) {
        let updated = self.with_task(task_id, |state| {
            state.update_upload_progress(progress);
            (state.upload_progress(), state.overall_progress())
        });
        if let Some((progress, overall)) = updated {
            self.emit(Event::UploadProgress {
                task_id,
                item_id: item.id.clone(),
                progress,
                overall,
            });
        }
    }

    fn set_stage(&self, task_id: TaskId, stage: Stage) {
        self.with_task(task_id, |state| state.set_stage(stage));
    }

    /// Run `f` against the active task's state if it is still this task
    fn with_task<R>(&self, task_id: TaskId, f: impl FnOnce(&mut crate::task_state::TaskState) -> R) -> Option<R> {
        let mut active = lock(&self.active);
        match active.as_mut() {
            Some(slot) if slot.state.task_id() == task_id => Some(f(&mut slot.state)),
            _ => None,
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Transfer(TransferError::Cancelled));
    }
    Ok(())
}
