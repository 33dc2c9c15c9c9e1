//! Device existence, accessibility and capacity queries.
//!
//! None of these read the medium itself: sizes come from the block layer's
//! geometry ioctl and tray state from the CD-ROM driver. Every query that
//! opens the device runs with a time limit, so a drive that hangs on open is
//! reported as inaccessible instead of stalling the caller.
use crate::error::ProbeError;
use nix::sys::statvfs::statvfs;
use nix::{ioctl_read, ioctl_write_int_bad};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::debug;

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_write_int_bad!(cdrom_drive_status, 0x5326);

/// Ask the drive about the currently selected slot (`CDSL_CURRENT`).
const CDSL_CURRENT: libc::c_int = libc::c_int::MAX;

/// What an optical drive reports about its tray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayStatus {
    /// The driver has no information (`CDS_NO_INFO`).
    NoInfo,
    NoDisc,
    Open,
    /// The drive is still spinning up or reading the table of contents.
    Reading,
    DiscPresent,
}

impl TrayStatus {
    fn from_raw(status: libc::c_int) -> Self {
        match status {
            1 => Self::NoDisc,
            2 => Self::Open,
            3 => Self::Reading,
            4 => Self::DiscPresent,
            _ => Self::NoInfo,
        }
    }
}

/// Queries about the source device and the output filesystem.
pub trait DeviceProbe: Send + Sync {
    /// True only for a block-special node.
    fn exists(&self, path: &Path) -> bool;

    /// Whether the device can be opened for reading right now.
    fn is_accessible(&self, path: &Path) -> bool;

    /// Like [`DeviceProbe::is_accessible`], but gives up after `limit`.
    fn is_accessible_within(&self, path: &Path, limit: Duration) -> bool {
        let _ = limit;
        self.is_accessible(path)
    }

    /// Capacity of the device in bytes.
    fn size_bytes(&self, path: &Path) -> Result<u64, ProbeError>;

    /// Free space available to unprivileged users on the filesystem that
    /// holds `dir`.
    fn available_space(&self, dir: &Path) -> Result<u64, ProbeError>;

    /// Tray state of an optical drive.
    fn tray_status(&self, path: &Path) -> Result<TrayStatus, ProbeError>;
}

/// [`DeviceProbe`] backed by the running Linux kernel.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    timeout: Duration,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a single device query may take.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `query` on a helper thread and gives up after the timeout. The
    /// helper is left behind if the device never answers.
    fn bounded<T, F>(&self, path: &Path, query: F) -> Result<T, ProbeError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, ProbeError> + Send + 'static,
    {
        bounded_for(path, self.timeout, query)
    }
}

fn bounded_for<T, F>(path: &Path, limit: Duration, query: F) -> Result<T, ProbeError>
where
    T: Send + 'static,
    F: FnOnce(PathBuf) -> Result<T, ProbeError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let owned = path.to_path_buf();
    thread::spawn(move || {
        let _ = tx.send(query(owned));
    });

    rx.recv_timeout(limit)
        .map_err(|_| ProbeError::Timeout(path.to_path_buf()))?
}

fn open_nonblocking(path: &Path) -> Result<File, ProbeError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> ProbeError {
    if source.kind() == std::io::ErrorKind::NotFound {
        ProbeError::NotFound(path.to_path_buf())
    } else {
        ProbeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl DeviceProbe for SystemProbe {
    fn exists(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn is_accessible(&self, path: &Path) -> bool {
        self.is_accessible_within(path, self.timeout)
    }

    fn is_accessible_within(&self, path: &Path, limit: Duration) -> bool {
        let result = bounded_for(path, limit, |path| {
            File::open(&path)
                .map(drop)
                .map_err(|source| io_error(&path, source))
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("{} not accessible: {e}", path.display());
                false
            }
        }
    }

    fn size_bytes(&self, path: &Path) -> Result<u64, ProbeError> {
        self.bounded(path, |path| {
            let file = open_nonblocking(&path)?;
            let meta = file.metadata().map_err(|source| io_error(&path, source))?;
            // Image files stand in for devices in a few workflows; their size
            // is simply their length.
            if meta.is_file() {
                return Ok(meta.len());
            }

            let mut size_bytes: u64 = 0;
            // SAFETY: the fd is open for the duration of the call and
            // BLKGETSIZE64 writes exactly one u64.
            unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) }.map_err(|errno| {
                ProbeError::Ioctl {
                    path: path.clone(),
                    errno: errno.to_string(),
                }
            })?;
            Ok(size_bytes)
        })
    }

    fn available_space(&self, dir: &Path) -> Result<u64, ProbeError> {
        let stat = statvfs(dir).map_err(|errno| io_error(dir, errno.into()))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn tray_status(&self, path: &Path) -> Result<TrayStatus, ProbeError> {
        self.bounded(path, |path| {
            let file = open_nonblocking(&path)?;
            // SAFETY: CDROM_DRIVE_STATUS takes the slot number by value and
            // returns the status as the ioctl result.
            let status = unsafe { cdrom_drive_status(file.as_raw_fd(), CDSL_CURRENT) }
                .map_err(|errno| ProbeError::Ioctl {
                    path: path.clone(),
                    errno: errno.to_string(),
                })?;
            Ok(TrayStatus::from_raw(status))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regular_files_are_not_devices() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 4096]).unwrap();
        let probe = SystemProbe::new();

        assert!(!probe.exists(file.path()));
        assert!(!probe.exists(Path::new("/dev/null")));
        assert!(!probe.exists(Path::new("/nonexistent/sdz")));
    }

    #[test]
    fn accessibility_and_size_of_an_image_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 4096]).unwrap();
        file.flush().unwrap();
        let probe = SystemProbe::new();

        assert!(probe.is_accessible(file.path()));
        assert!(!probe.is_accessible(Path::new("/nonexistent/sdz")));
        assert_eq!(probe.size_bytes(file.path()).unwrap(), 4096);
        assert!(matches!(
            probe.size_bytes(Path::new("/nonexistent/sdz")),
            Err(ProbeError::NotFound(_))
        ));
    }

    #[test]
    fn accessibility_with_a_short_limit() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let probe = SystemProbe::with_timeout(Duration::from_secs(30));

        assert!(probe.is_accessible_within(file.path(), Duration::from_secs(1)));
        assert!(!probe.is_accessible_within(Path::new("/nonexistent/sdz"), Duration::from_secs(1)));
    }

    #[test]
    fn available_space_of_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SystemProbe::new();
        assert!(probe.available_space(dir.path()).unwrap() > 0);
        assert!(probe.available_space(Path::new("/nonexistent/dir")).is_err());
    }

    #[test]
    fn tray_status_of_a_non_drive_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let probe = SystemProbe::new();
        assert!(matches!(
            probe.tray_status(file.path()),
            Err(ProbeError::Ioctl { .. })
        ));
    }

    #[test]
    fn raw_tray_codes() {
        assert_eq!(TrayStatus::from_raw(1), TrayStatus::NoDisc);
        assert_eq!(TrayStatus::from_raw(2), TrayStatus::Open);
        assert_eq!(TrayStatus::from_raw(3), TrayStatus::Reading);
        assert_eq!(TrayStatus::from_raw(4), TrayStatus::DiscPresent);
        assert_eq!(TrayStatus::from_raw(0), TrayStatus::NoInfo);
    }
}
