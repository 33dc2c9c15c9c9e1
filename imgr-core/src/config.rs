//! User settings: built-in defaults, optionally overridden by a JSON file.
use crate::method::CopyMethod;
use crate::request::{AcquisitionRequest, MediaKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SYSTEM_CONFIG: &str = "/etc/imgr/imgr.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub retries: u32,
    pub block_size: u32,
    pub prefix: String,
    pub extension: String,
    pub checksum_file_name: String,
    pub log_file_name: String,
    pub metadata_file_name: String,
    pub rescue_direct_disc_mode: bool,
    pub auto_retry: bool,
    pub read_command: CopyMethod,
    pub time_zone: String,
    pub default_dir: String,
    pub optical_device: String,
    /// Upper bound for a single copy-tool run, in seconds.
    pub timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retries: 4,
            block_size: 512,
            prefix: "disc".into(),
            extension: "img".into(),
            checksum_file_name: "checksums.sha512".into(),
            log_file_name: "imgr.log".into(),
            metadata_file_name: "metadata.json".into(),
            rescue_direct_disc_mode: false,
            auto_retry: false,
            read_command: CopyMethod::DirectCopy,
            time_zone: "Europe/Amsterdam".into(),
            default_dir: String::new(),
            optical_device: "/dev/sr0".into(),
            timeout_secs: None,
        }
    }
}

impl Settings {
    /// Reads settings from a JSON file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing configuration file {}", path.display()))
    }

    /// The first configuration file that exists: the user's
    /// (`$XDG_CONFIG_HOME/imgr/imgr.json`), then the system-wide one.
    pub fn default_location() -> Option<PathBuf> {
        let user = dirs::config_dir().map(|dir| dir.join("imgr").join("imgr.json"));
        user.into_iter()
            .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)))
            .find(|path| path.is_file())
    }

    /// Loads `explicit` if given, else the default location, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit.map(Path::to_path_buf).or_else(Self::default_location) {
            Some(path) => {
                debug!("loading settings from {}", path.display());
                Self::from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// A request pre-filled from these settings. Descriptive fields start
    /// empty.
    pub fn request(&self, device: PathBuf, output_dir: PathBuf, media: MediaKind) -> AcquisitionRequest {
        AcquisitionRequest {
            device,
            output_dir,
            prefix: self.prefix.clone(),
            extension: self.extension.clone(),
            method: self.read_command,
            media,
            block_size: self.block_size,
            max_retries: self.retries,
            rescue_direct_mode: self.rescue_direct_disc_mode,
            auto_retry: self.auto_retry,
            identifier: String::new(),
            description: String::new(),
            notes: String::new(),
            time_zone: self.time_zone.clone(),
            log_file_name: self.log_file_name.clone(),
            checksum_file_name: self.checksum_file_name.clone(),
            metadata_file_name: self.metadata_file_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imgr.json");
        fs::write(
            &path,
            r#"{"extension": "iso", "readCommand": "readom", "timeZone": "UTC", "timeoutSecs": 7200}"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.extension, "iso");
        assert_eq!(settings.read_command, CopyMethod::OpticalCopy);
        assert_eq!(settings.time_zone, "UTC");
        assert_eq!(settings.timeout_secs, Some(7200));
        assert_eq!(settings.retries, 4);
        assert_eq!(settings.checksum_file_name, "checksums.sha512");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imgr.json");
        fs::write(&path, "{ not json").unwrap();

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("parsing configuration file"));
    }

    #[test]
    fn request_takes_settings_values() {
        let settings = Settings {
            block_size: 2048,
            auto_retry: true,
            ..Settings::default()
        };
        let req = settings.request("/dev/sr0".into(), "/out".into(), MediaKind::Optical);

        assert_eq!(req.block_size, 2048);
        assert!(req.auto_retry);
        assert_eq!(req.media, MediaKind::Optical);
        assert_eq!(req.metadata_file_name, "metadata.json");
        assert!(req.identifier.is_empty());
    }
}
