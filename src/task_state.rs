//! Per-task state machine blending stage progress into one overall value
//!
//! The blend is fixed once `set_needs_upload` is called:
//! `overall = 0.5 * download + 0.5 * upload` when an upload is required,
//! plain download progress otherwise. The overall value is clamped to
//! `[0, 1]` and never decreases while the task is active; a finished
//! stage's contribution stays pinned at 1.0.

use chrono::{DateTime, Utc};

use crate::types::{ItemId, Stage, TaskId, TaskSnapshot};

/// State of one processing task, owned exclusively by the orchestrator
#[derive(Clone, Debug)]
pub struct TaskState {
    task_id: TaskId,
    item_id: ItemId,
    stage: Stage,
    needs_upload: Option<bool>,
    download_progress: f32,
    upload_progress: f32,
    overall_progress: f32,
    download_id: Option<u64>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskState {
    /// Create a fresh task in the waiting stage
    pub fn new(task_id: TaskId, item_id: ItemId) -> Self {
        Self {
            task_id,
            item_id,
            stage: Stage::Waiting,
            needs_upload: None,
            download_progress: 0.0,
            upload_progress: 0.0,
            overall_progress: 0.0,
            download_id: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Task identifier
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Item being processed
    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Blended overall progress (0.0 to 1.0)
    pub fn overall_progress(&self) -> f32 {
        self.overall_progress
    }

    /// Download stage progress (0.0 to 1.0)
    pub fn download_progress(&self) -> f32 {
        self.download_progress
    }

    /// Upload stage progress (0.0 to 1.0)
    pub fn upload_progress(&self) -> f32 {
        self.upload_progress
    }

    /// Whether the task is in an active (running) stage
    pub fn is_active(&self) -> bool {
        matches!(
            self.stage,
            Stage::Download | Stage::Convert | Stage::Upload | Stage::RemoteTrigger
        )
    }

    /// Fix the blend formula for this task.
    ///
    /// Must be called once before any progress update; later calls are
    /// ignored with a warning so the formula never changes mid-task.
    pub fn set_needs_upload(&mut self, needs_upload: bool) {
        if self.needs_upload.is_some() {
            tracing::warn!(
                task_id = %self.task_id,
                "set_needs_upload called twice, keeping original blend"
            );
            return;
        }
        self.needs_upload = Some(needs_upload);
    }

    /// Record the download job id for observability
    pub fn set_download_id(&mut self, id: u64) {
        self.download_id = Some(id);
    }

    /// Advance to a new stage
    pub fn set_stage(&mut self, stage: Stage) {
        if self.completed_at.is_some() {
            return;
        }
        tracing::debug!(task_id = %self.task_id, item_id = %self.item_id, ?stage, "Stage transition");
        self.stage = stage;
    }

    /// Update download-stage progress and recompute the blend
    pub fn update_download_progress(&mut self, progress: f32) {
        if self.completed_at.is_some() {
            return;
        }
        if self.needs_upload.is_none() {
            tracing::warn!(
                task_id = %self.task_id,
                "progress update before set_needs_upload, ignoring"
            );
            return;
        }
        // A finished stage never regresses
        self.download_progress = progress.clamp(0.0, 1.0).max(self.download_progress);
        self.recompute_overall();
    }

    /// Update upload-stage progress and recompute the blend
    pub fn update_upload_progress(&mut self, progress: f32) {
        if self.completed_at.is_some() {
            return;
        }
        if self.needs_upload.is_none() {
            tracing::warn!(
                task_id = %self.task_id,
                "progress update before set_needs_upload, ignoring"
            );
            return;
        }
        self.upload_progress = progress.clamp(0.0, 1.0).max(self.upload_progress);
        self.recompute_overall();
    }

    /// Terminal: pin overall progress to 1.0; no further mutation permitted
    pub fn set_completed(&mut self) {
        if self.completed_at.is_some() {
            return;
        }
        self.stage = Stage::Completed;
        self.overall_progress = 1.0;
        self.completed_at = Some(Utc::now());
    }

    /// Observable snapshot for the caller/UI
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id,
            item_id: self.item_id.clone(),
            stage: self.stage,
            overall_progress: self.overall_progress,
            download_progress: self.download_progress,
            upload_progress: self.upload_progress,
            download_id: self.download_id,
            started_at: self.started_at,
        }
    }

    fn recompute_overall(&mut self) {
        let blended = match self.needs_upload {
            Some(true) => 0.5 * self.download_progress + 0.5 * self.upload_progress,
            Some(false) | None => self.download_progress,
        };
        // Monotonic while active: never report less than already observed
        self.overall_progress = blended.clamp(0.0, 1.0).max(self.overall_progress);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskState {
        TaskState::new(TaskId(1), ItemId::new("bk-1"))
    }

    #[test]
    fn blend_is_half_download_half_upload_when_upload_needed() {
        let mut t = task();
        t.set_needs_upload(true);
        t.update_download_progress(0.4);
        assert!((t.overall_progress() - 0.2).abs() < f32::EPSILON);

        t.update_download_progress(1.0);
        assert!((t.overall_progress() - 0.5).abs() < f32::EPSILON);

        t.update_upload_progress(0.5);
        assert!((t.overall_progress() - 0.75).abs() < f32::EPSILON);

        t.update_upload_progress(1.0);
        assert!((t.overall_progress() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn blend_is_download_only_when_no_upload_needed() {
        let mut t = task();
        t.set_needs_upload(false);
        t.update_download_progress(0.3);
        assert!((t.overall_progress() - 0.3).abs() < f32::EPSILON);
        t.update_download_progress(1.0);
        assert!((t.overall_progress() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn overall_progress_is_monotonic() {
        let mut t = task();
        t.set_needs_upload(true);
        t.update_download_progress(0.8);
        let before = t.overall_progress();

        // A regressing report must not lower the overall value
        t.update_download_progress(0.2);
        assert!(t.overall_progress() >= before);
        assert!(
            (t.download_progress() - 0.8).abs() < f32::EPSILON,
            "finished portion of a stage must stay pinned"
        );
    }

    #[test]
    fn updates_before_set_needs_upload_are_ignored() {
        let mut t = task();
        t.update_download_progress(0.9);
        assert_eq!(t.overall_progress(), 0.0);
        assert_eq!(t.download_progress(), 0.0);
    }

    #[test]
    fn second_set_needs_upload_keeps_original_blend() {
        let mut t = task();
        t.set_needs_upload(true);
        t.set_needs_upload(false);
        t.update_download_progress(1.0);
        // Blend stays 50/50, so overall is 0.5 with no upload progress yet
        assert!((t.overall_progress() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn out_of_range_progress_is_clamped() {
        let mut t = task();
        t.set_needs_upload(false);
        t.update_download_progress(3.5);
        assert!((t.overall_progress() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn set_completed_pins_overall_and_is_terminal() {
        let mut t = task();
        t.set_needs_upload(true);
        t.update_download_progress(0.5);
        t.set_completed();

        assert_eq!(t.stage(), Stage::Completed);
        assert!((t.overall_progress() - 1.0).abs() < f32::EPSILON);
        assert!(!t.is_active());

        // No further mutation permitted
        t.update_download_progress(0.1);
        t.set_stage(Stage::Download);
        assert_eq!(t.stage(), Stage::Completed);
        assert!((t.overall_progress() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn active_stages_report_is_active() {
        let mut t = task();
        assert!(!t.is_active(), "waiting is not active");
        for stage in [
            Stage::Download,
            Stage::Convert,
            Stage::Upload,
            Stage::RemoteTrigger,
        ] {
            t.set_stage(stage);
            assert!(t.is_active(), "{stage:?} should be active");
        }
    }

    #[test]
    fn snapshot_reflects_current_state() {
        let mut t = task();
        t.set_needs_upload(true);
        t.set_stage(Stage::Download);
        t.set_download_id(9);
        t.update_download_progress(0.5);

        let snap = t.snapshot();
        assert_eq!(snap.task_id, TaskId(1));
        assert_eq!(snap.item_id, ItemId::new("bk-1"));
        assert_eq!(snap.stage, Stage::Download);
        assert_eq!(snap.download_id, Some(9));
        assert!((snap.overall_progress - 0.25).abs() < f32::EPSILON);
    }
}
