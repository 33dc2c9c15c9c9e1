//! The immutable input of one acquisition run.
use crate::method::CopyMethod;
use std::path::{Path, PathBuf};

/// What kind of medium is being imaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Hard disks, USB sticks, memory cards, floppies.
    Disk,
    /// CD-ROM / DVD media in an optical drive. Enables the tray check, image
    /// validation and ejecting on success.
    Optical,
}

/// Everything one run needs to know, fixed before the run starts.
///
/// A retry or failover is a new request (see [`crate::escalation`]), never a
/// mutation of a running one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRequest {
    pub device: PathBuf,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub extension: String,
    pub method: CopyMethod,
    pub media: MediaKind,
    pub block_size: u32,
    pub max_retries: u32,
    /// Pass `-d` (direct disc access) to rescue copies.
    pub rescue_direct_mode: bool,
    /// Escalate a failed direct copy to a rescue copy without asking.
    pub auto_retry: bool,
    pub identifier: String,
    pub description: String,
    pub notes: String,
    /// IANA time zone name used for the acquisition timestamps.
    pub time_zone: String,
    pub log_file_name: String,
    pub checksum_file_name: String,
    pub metadata_file_name: String,
}

impl AcquisitionRequest {
    /// The same request with another copy method, as used when escalating.
    pub fn with_method(&self, method: CopyMethod) -> Self {
        Self {
            method,
            ..self.clone()
        }
    }

    pub fn paths(&self) -> RunPaths {
        RunPaths::derive(self)
    }
}

/// Output paths derived from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// `<prefix>.<extension>`
    pub image: PathBuf,
    /// `<prefix>.map`, only written by rescue copies.
    pub map: PathBuf,
    pub log: PathBuf,
    pub checksums: PathBuf,
    pub metadata: PathBuf,
}

impl RunPaths {
    fn derive(request: &AcquisitionRequest) -> Self {
        let dir: &Path = &request.output_dir;
        Self {
            image: dir.join(format!("{}.{}", request.prefix, request.extension)),
            map: dir.join(format!("{}.map", request.prefix)),
            log: dir.join(&request.log_file_name),
            checksums: dir.join(&request.checksum_file_name),
            metadata: dir.join(&request.metadata_file_name),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_prefix_and_extension() {
        let req = fixtures::request(Path::new("/data/acc-001"));
        let paths = req.paths();

        assert_eq!(paths.image, PathBuf::from("/data/acc-001/disc.img"));
        assert_eq!(paths.map, PathBuf::from("/data/acc-001/disc.map"));
        assert_eq!(paths.log, PathBuf::from("/data/acc-001/imgr.log"));
        assert_eq!(paths.checksums, PathBuf::from("/data/acc-001/checksums.sha512"));
        assert_eq!(paths.metadata, PathBuf::from("/data/acc-001/metadata.json"));
    }

    #[test]
    fn with_method_keeps_everything_else() {
        let req = fixtures::request(Path::new("/tmp"));
        let rescue = req.with_method(CopyMethod::RescueCopy);

        assert_eq!(rescue.method, CopyMethod::RescueCopy);
        assert_eq!(rescue.device, req.device);
        assert_eq!(rescue.paths(), req.paths());
    }
}
