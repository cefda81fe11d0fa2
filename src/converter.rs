//! Artifact conversion (decrypt + remux)
//!
//! The conversion seam is a trait so the pipeline can run against a fake in
//! tests. The production implementation shells out to ffmpeg, which decrypts
//! the AAX container in place of a bespoke codec: `-audible_key`/`-audible_iv`
//! carry the per-item material and `-c copy` remuxes without re-encoding.

use crate::error::{CodecError, Error, Result};
use crate::types::{EncryptionMaterial, ItemId};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Converts an encrypted artifact into its plaintext container
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `input` into `output` using the item's decryption material.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ConversionFailed`] when the conversion tool
    /// fails; the output file must not be left behind in that case.
    async fn convert(
        &self,
        material: &EncryptionMaterial,
        input: &Path,
        output: &Path,
    ) -> Result<()>;

    /// Human-readable name for logging
    fn name(&self) -> &str;
}

/// Supplies per-item decryption material (activation bytes derived key/IV)
#[async_trait]
pub trait EncryptionMaterialProvider: Send + Sync {
    /// Fetch the decryption material for an item.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AuthError::NoUserSignedIn`] when no account
    /// is available to derive material from.
    async fn material_for(&self, item: &ItemId) -> Result<EncryptionMaterial>;
}

/// Converter shelling out to an ffmpeg binary
pub struct CliConverter {
    binary: PathBuf,
}

impl CliConverter {
    /// Locate ffmpeg on PATH.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ConversionFailed`] when no binary is found.
    pub fn new() -> Result<Self> {
        let binary = which::which("ffmpeg").map_err(|e| {
            Error::Codec(CodecError::ConversionFailed(format!(
                "ffmpeg not found on PATH: {e}"
            )))
        })?;
        tracing::info!(binary = %binary.display(), "Found conversion binary");
        Ok(Self { binary })
    }

    /// Use a specific ffmpeg binary
    pub fn from_path(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl Converter for CliConverter {
    async fn convert(
        &self,
        material: &EncryptionMaterial,
        input: &Path,
        output: &Path,
    ) -> Result<()> {
        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            "Starting conversion"
        );

        let result = tokio::process::Command::new(&self.binary)
            .arg("-y")
            .arg("-audible_key")
            .arg(material.key_hex())
            .arg("-audible_iv")
            .arg(material.iv_hex())
            .arg("-i")
            .arg(input)
            .arg("-c")
            .arg("copy")
            .arg(output)
            .output()
            .await
            .map_err(|e| {
                Error::Codec(CodecError::ConversionFailed(format!(
                    "failed to run {}: {e}",
                    self.binary.display()
                )))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            // Last lines carry the actual failure; the preamble is banner noise
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            tracing::error!(
                status = ?result.status.code(),
                stderr = %tail,
                "Conversion failed"
            );
            // A failed run must not leave a half-written output behind
            if let Err(e) = tokio::fs::remove_file(output).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, "Failed to remove partial conversion output");
                }
            }
            return Err(CodecError::ConversionFailed(tail).into());
        }

        tracing::info!(output = %output.display(), "Conversion complete");
        Ok(())
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn material() -> EncryptionMaterial {
        EncryptionMaterial::from_hex("1a2b3c4d", "a1b2c3d4").unwrap()
    }

    #[tokio::test]
    async fn missing_binary_fails_conversion() {
        let dir = TempDir::new().unwrap();
        let converter = CliConverter::from_path(dir.path().join("no-such-ffmpeg"));

        let err = converter
            .convert(
                &material(),
                &dir.path().join("in.aax"),
                &dir.path().join("out.m4b"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Codec(CodecError::ConversionFailed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_tool_run_is_ok() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        // Writes a dummy output file (last argument) and exits 0
        std::fs::write(&script, "#!/bin/sh\nfor last; do :; done\necho data > \"$last\"\n")
            .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let converter = CliConverter::from_path(script);
        let output = dir.path().join("out.m4b");
        converter
            .convert(&material(), &dir.path().join("in.aax"), &output)
            .await
            .unwrap();

        assert!(output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr_and_removes_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor last; do :; done\necho partial > \"$last\"\necho 'Invalid data found' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let converter = CliConverter::from_path(script);
        let output = dir.path().join("out.m4b");
        let err = converter
            .convert(&material(), &dir.path().join("in.aax"), &output)
            .await
            .unwrap_err();

        match err {
            Error::Codec(CodecError::ConversionFailed(msg)) => {
                assert!(msg.contains("Invalid data found"), "stderr tail: {msg}");
            }
            other => panic!("expected ConversionFailed, got {other:?}"),
        }
        assert!(!output.exists(), "partial output must be removed");
    }
}
