//! Core types and events for aax-pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Stable identifier of an audiobook item
///
/// Item ids key everything in the pipeline: the active task, the pending
/// queue, transfer jobs, and the on-disk artifact names.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Create a new ItemId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique identifier for a processing task (per-session, monotonic)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Waiting for the active slot
    Waiting,
    /// Downloading the encrypted artifact
    Download,
    /// Decrypting and transcoding locally
    Convert,
    /// Validating and uploading the converted artifact
    Upload,
    /// Triggering remote post-processing
    RemoteTrigger,
    /// Terminal: all stages finished
    Completed,
}

/// Status of a download job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Created, preflight checks running
    Waiting,
    /// Transfer in progress
    Downloading,
    /// Moving artifact to its stable location
    Moving,
    /// Finished successfully (also reported for absent jobs)
    Completed,
    /// Failed with error
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

/// Status of an upload job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Created, not yet transferring
    Waiting,
    /// Transfer in progress
    Uploading,
    /// Finished successfully
    Completed,
    /// Failed with error
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

/// Per-item decryption material, parsed and validated at the system boundary
///
/// The pipeline core never sees untyped payloads: construction goes through
/// [`EncryptionMaterial::from_hex`], which is the single validated parse step.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionMaterial {
    key_hex: String,
    iv_hex: String,
}

impl EncryptionMaterial {
    /// Parse key and IV from hex strings.
    ///
    /// Both must be non-empty, even-length, valid hex. Input is normalised
    /// to lowercase. Invalid material fails with
    /// [`CodecError::InvalidEncryptionMaterial`] before any codec call.
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, CodecError> {
        validate_hex("key", key_hex)?;
        validate_hex("iv", iv_hex)?;
        Ok(Self {
            key_hex: key_hex.to_ascii_lowercase(),
            iv_hex: iv_hex.to_ascii_lowercase(),
        })
    }

    /// The decryption key as a lowercase hex string
    pub fn key_hex(&self) -> &str {
        &self.key_hex
    }

    /// The initialisation vector as a lowercase hex string
    pub fn iv_hex(&self) -> &str {
        &self.iv_hex
    }
}

// Key material must not leak into logs via {:?}
impl std::fmt::Debug for EncryptionMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionMaterial")
            .field("key_hex", &"<redacted>")
            .field("iv_hex", &"<redacted>")
            .finish()
    }
}

fn validate_hex(field: &str, value: &str) -> Result<(), CodecError> {
    if value.is_empty() {
        return Err(CodecError::InvalidEncryptionMaterial(format!(
            "{field} is empty"
        )));
    }
    if value.len() % 2 != 0 {
        return Err(CodecError::InvalidEncryptionMaterial(format!(
            "{field} has odd length {}",
            value.len()
        )));
    }
    if let Some(bad) = value.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(CodecError::InvalidEncryptionMaterial(format!(
            "{field} contains non-hex character {bad:?}"
        )));
    }
    Ok(())
}

/// Caller-supplied description of an audiobook to process
///
/// `remote_progress > 0` means a remote plaintext copy already exists, which
/// lets a resumed task skip the upload and trigger stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingItem {
    /// Stable item identifier
    pub id: ItemId,

    /// Human-readable title (logging and events only)
    pub title: String,

    /// URL of the encrypted source artifact
    pub source_url: String,

    /// Remote processing progress already recorded for this item (0.0 to 1.0)
    #[serde(default)]
    pub remote_progress: f32,
}

/// Observable snapshot of the active task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier
    pub task_id: TaskId,

    /// Item being processed
    pub item_id: ItemId,

    /// Current stage
    pub stage: Stage,

    /// Blended overall progress (0.0 to 1.0)
    pub overall_progress: f32,

    /// Download stage progress (0.0 to 1.0)
    pub download_progress: f32,

    /// Upload stage progress (0.0 to 1.0)
    pub upload_progress: f32,

    /// Download job id, if a download is or was in flight
    pub download_id: Option<u64>,

    /// When the task entered the active slot
    pub started_at: DateTime<Utc>,
}

/// Event emitted during the task lifecycle
///
/// Consumers subscribe via [`crate::pipeline::Pipeline::subscribe`]; events
/// are broadcast, so multiple independent subscribers are supported.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Item added to the pending queue (active slot occupied)
    TaskQueued {
        /// Item identifier
        item_id: ItemId,
    },

    /// Task entered the active slot
    TaskStarted {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
    },

    /// Download progress update
    DownloadProgress {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
        /// Stage progress (0.0 to 1.0)
        progress: f32,
        /// Blended overall progress (0.0 to 1.0)
        overall: f32,
    },

    /// Conversion started
    Converting {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
    },

    /// Validating the converted artifact
    Validating {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
    },

    /// Upload progress update
    UploadProgress {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
        /// Stage progress (0.0 to 1.0)
        progress: f32,
        /// Blended overall progress (0.0 to 1.0)
        overall: f32,
    },

    /// Remote post-processing trigger in flight
    TriggeringRemote {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
    },

    /// Task finished all stages
    TaskCompleted {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
    },

    /// Task failed terminally; the item reverts to its pre-processing state
    TaskFailed {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
        /// Stage where the failure occurred
        stage: Stage,
        /// Error message
        error: String,
    },

    /// Task cancelled by the caller
    TaskCancelled {
        /// Task identifier
        task_id: TaskId,
        /// Item identifier
        item_id: ItemId,
    },

    /// The pending queue changed
    PendingChanged {
        /// Item ids awaiting the active slot, FIFO order
        pending: Vec<ItemId>,
    },

    /// The active slot transitioned idle <-> occupied
    ActiveStateChanged {
        /// True when a task occupies the active slot
        active: bool,
    },
}
