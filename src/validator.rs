//! Converted-artifact validation
//!
//! The converted container is a remux of the original, so its size should be
//! close to the encrypted source. A size comparison within a configured
//! relative tolerance is the integrity proxy; a full audio decode is not
//! attempted on device.

use crate::error::Result;
use std::path::Path;

/// Check a converted artifact against its encrypted original by size.
///
/// Returns `Ok(false)` for an out-of-tolerance artifact and deletes it so a
/// stale invalid file can never be mistaken for a usable conversion later.
///
/// # Errors
///
/// Returns an error when either file's metadata cannot be read.
pub async fn validate_converted(
    original: &Path,
    converted: &Path,
    size_tolerance: f64,
) -> Result<bool> {
    let original_size = tokio::fs::metadata(original).await?.len();
    let converted_size = tokio::fs::metadata(converted).await?.len();

    let deviation = original_size.abs_diff(converted_size) as f64;
    let allowed = size_tolerance * original_size as f64;

    if deviation <= allowed {
        tracing::debug!(
            original_size,
            converted_size,
            "Converted artifact within size tolerance"
        );
        return Ok(true);
    }

    tracing::warn!(
        original_size,
        converted_size,
        allowed_deviation = allowed,
        converted = %converted.display(),
        "Converted artifact out of tolerance, removing"
    );
    if let Err(e) = tokio::fs::remove_file(converted).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, "Failed to remove invalid converted artifact");
        }
    }
    Ok(false)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_sized(dir: &TempDir, name: &str, size: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        path
    }

    #[tokio::test]
    async fn matching_sizes_validate() {
        let dir = TempDir::new().unwrap();
        let original = write_sized(&dir, "a.aax", 10_000).await;
        let converted = write_sized(&dir, "a.m4b", 10_000).await;

        assert!(validate_converted(&original, &converted, 0.05).await.unwrap());
        assert!(converted.exists());
    }

    #[tokio::test]
    async fn deviation_within_tolerance_validates() {
        let dir = TempDir::new().unwrap();
        let original = write_sized(&dir, "a.aax", 10_000).await;
        // 4% smaller, within the 5% default
        let converted = write_sized(&dir, "a.m4b", 9_600).await;

        assert!(validate_converted(&original, &converted, 0.05).await.unwrap());
    }

    #[tokio::test]
    async fn out_of_tolerance_artifact_is_invalid_and_deleted() {
        let dir = TempDir::new().unwrap();
        let original = write_sized(&dir, "a.aax", 10_000).await;
        // 20% smaller, well outside the 5% default
        let converted = write_sized(&dir, "a.m4b", 8_000).await;

        assert!(!validate_converted(&original, &converted, 0.05).await.unwrap());
        assert!(
            !converted.exists(),
            "invalid converted artifact must be removed"
        );
    }

    #[tokio::test]
    async fn oversized_artifact_is_also_invalid() {
        let dir = TempDir::new().unwrap();
        let original = write_sized(&dir, "a.aax", 10_000).await;
        let converted = write_sized(&dir, "a.m4b", 12_000).await;

        assert!(!validate_converted(&original, &converted, 0.05).await.unwrap());
    }

    #[tokio::test]
    async fn missing_original_is_an_error() {
        let dir = TempDir::new().unwrap();
        let converted = write_sized(&dir, "a.m4b", 1_000).await;

        let result =
            validate_converted(&dir.path().join("missing.aax"), &converted, 0.05).await;
        assert!(result.is_err());
    }
}
