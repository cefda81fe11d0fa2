//! Task cancellation
//!
//! Cancellation is synchronous from the caller's point of view: the slot is
//! vacated and the terminal event emitted before this call returns, so a
//! cancelled item never reappears as active and no in-flight completion is
//! leaked to the caller. Durable artifacts already produced are kept for
//! resumption.

use super::{ActiveSlot, Pipeline, lock};
use crate::types::{Event, ItemId, TaskId};

impl Pipeline {
    /// Cancel the active task by task id.
    ///
    /// No-op when the id does not match the active task. Transfers in
    /// flight are cancelled, the slot is vacated, `TaskCancelled` is
    /// emitted and the next pending item (if any) starts.
    pub fn cancel_processing(&self, task_id: TaskId) {
        let mut active = lock(&self.active);
        let owns_slot = active
            .as_ref()
            .is_some_and(|slot| slot.state.task_id() == task_id);
        if !owns_slot {
            tracing::debug!(task_id = %task_id, "No active task with this id, ignoring cancel");
            return;
        }
        if let Some(slot) = active.take() {
            self.teardown(slot, &mut active);
        }
    }

    /// Cancel processing of an item, whether active or pending.
    ///
    /// A pending item is removed from the queue without a task lifecycle;
    /// only `PendingChanged` is emitted for it.
    pub fn cancel_processing_for_item(&self, item_id: &ItemId) {
        {
            let mut active = lock(&self.active);
            let owns_slot = active
                .as_ref()
                .is_some_and(|slot| slot.state.item_id() == item_id);
            if owns_slot {
                if let Some(slot) = active.take() {
                    self.teardown(slot, &mut active);
                }
                return;
            }
        }

        let removed = {
            let mut pending = lock(&self.pending);
            let before = pending.len();
            pending.retain(|item| &item.id != item_id);
            before != pending.len()
        };
        if removed {
            tracing::info!(item_id = %item_id, "Removed pending item");
            self.emit(Event::PendingChanged {
                pending: self.pending_items(),
            });
        }
    }

    /// Drop every pending item and bulk-cancel all transfers (sign-out
    /// teardown).
    ///
    /// The active task itself is not torn down here: its runner observes
    /// the cancelled transfer and completes its own lifecycle, while a
    /// stage with no transfer in flight runs to its natural end.
    pub fn cancel_all_tasks(&self) {
        let had_pending = {
            let mut pending = lock(&self.pending);
            let had = !pending.is_empty();
            pending.clear();
            had
        };
        if had_pending {
            tracing::info!("Cleared pending queue");
            self.emit(Event::PendingChanged { pending: vec![] });
        }

        self.downloader.cancel_all();
        self.uploader.cancel_all();
    }

    /// Cancel a vacated slot's work, emit its terminal event and promote
    /// the next pending item under the still-held slot guard
    fn teardown(&self, slot: ActiveSlot, active: &mut Option<ActiveSlot>) {
        let task_id = slot.state.task_id();
        let item_id = slot.state.item_id().clone();
        tracing::info!(task_id = %task_id, item_id = %item_id, "Cancelling task");

        slot.cancel.cancel();
        self.downloader.cancel(&item_id);
        self.uploader.cancel(&item_id);

        self.emit(Event::TaskCancelled { task_id, item_id });
        self.promote_next(active);
    }
}
