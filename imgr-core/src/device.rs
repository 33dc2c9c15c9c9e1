use std::fmt;
use std::path::PathBuf;

/// A block device or partition discovered on the system.
///
/// Populated by the discovery functions in [`crate::platform`] and used by
/// front-ends to present a list of candidate sources. The size comes from the
/// kernel's sector count, so listing never touches the medium itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sdb` or `/dev/sr0`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sdb1").
    pub name: String,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl Device {
    /// The size as a short human-readable string, e.g. `14.9GiB`.
    pub fn human_size(&self) -> String {
        human_size(self.size_bytes)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.human_size())
    }
}

/// Formats a byte count with binary units and one decimal.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];

    let mut num = bytes as f64;
    for unit in UNITS {
        if num.abs() < 1024.0 {
            return format!("{num:.1}{unit}B");
        }
        num /= 1024.0;
    }
    format!("{num:.1}YiB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_uses_binary_units() {
        assert_eq!(human_size(0), "0.0B");
        assert_eq!(human_size(1023), "1023.0B");
        assert_eq!(human_size(1536), "1.5KiB");
        assert_eq!(human_size(512_000), "500.0KiB");
        assert_eq!(human_size(16 * 1024 * 1024 * 1024), "16.0GiB");
    }

    #[test]
    fn display_shows_path_and_size() {
        let device = Device {
            path: PathBuf::from("/dev/sr0"),
            name: "sr0".into(),
            size_bytes: 737_280_000,
            mount_point: String::new(),
        };
        assert_eq!(device.to_string(), "/dev/sr0 (703.1MiB)");
    }
}
