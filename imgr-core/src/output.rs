//! What to do about files left in the output directory by an earlier run.
//!
//! A map file next to the image means the image came from a rescue copy and
//! can be resumed. Without one, the image is a finished (or failed) simple
//! copy that a new run has to replace.
use crate::checksum::has_extension;
use crate::request::AcquisitionRequest;
use std::fs;
use std::io;
use tracing::info;

/// Earlier output found in the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingOutput {
    /// Some file matches `<prefix>*.<extension>`.
    pub image_files: bool,
    /// `<prefix>.map` exists.
    pub map_file: bool,
}

impl ExistingOutput {
    pub fn scan(request: &AcquisitionRequest) -> Self {
        let image_files = fs::read_dir(&request.output_dir)
            .map(|entries| {
                entries.filter_map(Result::ok).any(|entry| {
                    let name = entry.file_name().to_string_lossy().to_string();
                    name.starts_with(&request.prefix) && has_extension(&name, &request.extension)
                })
            })
            .unwrap_or(false);

        Self {
            image_files,
            map_file: request.paths().map.is_file(),
        }
    }
}

/// How a new run relates to earlier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPlan {
    /// Nothing there yet.
    Fresh,
    /// A simple copy would overwrite earlier output; ask first, then call
    /// [`discard_previous`] with `include_map = true`.
    ConfirmOverwrite,
    /// A rescue copy continues where the map file left off.
    Resume,
    /// A rescue copy finds an image without a map file; the image is
    /// discarded without asking, since a rescue pass cannot build on it.
    ReplaceUnresumable,
}

pub fn plan(request: &AcquisitionRequest) -> OutputPlan {
    let existing = ExistingOutput::scan(request);
    if !existing.image_files {
        return OutputPlan::Fresh;
    }

    match (request.method.is_resumable(), existing.map_file) {
        (true, true) => OutputPlan::Resume,
        (true, false) => OutputPlan::ReplaceUnresumable,
        (false, _) => OutputPlan::ConfirmOverwrite,
    }
}

/// Removes the image and, if asked, the map file of an earlier run. Files
/// that are already gone are fine.
pub fn discard_previous(request: &AcquisitionRequest, include_map: bool) -> io::Result<()> {
    let paths = request.paths();
    let mut targets = vec![paths.image];
    if include_map {
        targets.push(paths.map);
    }

    for target in targets {
        match fs::remove_file(&target) {
            Ok(()) => info!("removed {}", target.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
