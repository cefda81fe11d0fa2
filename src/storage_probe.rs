//! Device storage probing
//!
//! Free-space checks are advisory: they run before a download starts and
//! before the post-download move, with no reservation between check and
//! write. The probe is a trait so tests can substitute fixed capacities.

use crate::error::{Result, StorageError};
use std::path::Path;

/// Reports available device storage for a filesystem path
pub trait StorageProbe: Send + Sync {
    /// Available disk space in bytes at `path`
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SpaceCheckFailed`] when the underlying
    /// filesystem query fails.
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Probe backed by platform filesystem statistics
///
/// - Linux/macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemStorageProbe;

impl StorageProbe for SystemStorageProbe {
    fn available_space(&self, path: &Path) -> Result<u64> {
        query_available_space(path)
            .map_err(|e| StorageError::SpaceCheckFailed(e.to_string()).into())
    }
}

fn query_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: This is safe because:
        // 1. c_path is a valid, null-terminated C string created from the input path
        // 2. stat is properly initialized with zeroed memory before the call
        // 3. We check the return value and propagate any OS errors
        // 4. The statvfs struct is only read after a successful call
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail is available blocks for unprivileged users,
            // f_frsize the fragment size (preferred over f_bsize)
            let available_bytes = stat.f_bavail.saturating_mul(stat.f_frsize);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0)) // null terminator
            .collect();

        // SAFETY: This is safe because:
        // 1. wide_path is a valid, null-terminated wide string
        // 2. All output pointers point to valid, properly aligned u64 variables
        // 3. We check the return value and propagate any OS errors
        // 4. The output variables are only read after a successful call
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn available_space_on_valid_path() {
        let temp_dir = TempDir::new().unwrap();
        let available = SystemStorageProbe
            .available_space(temp_dir.path())
            .unwrap();

        assert!(available > 0, "available space should be greater than 0");
        assert!(
            available < 1_000_000_000_000_000,
            "available space seems unreasonably large"
        );
    }

    #[test]
    fn nonexistent_path_fails_with_space_check_error() {
        let result =
            SystemStorageProbe.available_space(Path::new("/nonexistent/path/that/should/not/exist"));

        match result {
            Err(crate::error::Error::Storage(StorageError::SpaceCheckFailed(_))) => {}
            other => panic!("expected SpaceCheckFailed, got {other:?}"),
        }
    }

    #[test]
    fn current_dir_has_available_space() {
        let available = SystemStorageProbe.available_space(Path::new(".")).unwrap();
        assert!(available > 0);
    }
}
