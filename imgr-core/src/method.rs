//! Copy methods and the argument vectors of their tools.
use crate::classify::LineClassifier;
use crate::request::{AcquisitionRequest, RunPaths};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which output stream of a child carries its status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// The external tool used to read the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyMethod {
    /// Whole-device, non-resuming copy with `dd`.
    #[serde(rename = "dd")]
    DirectCopy,
    /// Resumable, error-tolerant copy with `ddrescue` and a map file.
    #[serde(rename = "ddrescue")]
    RescueCopy,
    /// Optical disc copy with `readom`.
    #[serde(rename = "readom")]
    OpticalCopy,
}

impl CopyMethod {
    /// Name of the executable, also used in the metadata's `readMethod`.
    pub fn tool(&self) -> &'static str {
        match self {
            Self::DirectCopy => "dd",
            Self::RescueCopy => "ddrescue",
            Self::OpticalCopy => "readom",
        }
    }

    pub fn watched_stream(&self) -> Stream {
        match self {
            Self::RescueCopy => Stream::Stdout,
            Self::DirectCopy | Self::OpticalCopy => Stream::Stderr,
        }
    }

    pub fn classifier(&self) -> LineClassifier {
        match self {
            Self::RescueCopy => LineClassifier::RescueErrorCount,
            Self::DirectCopy | Self::OpticalCopy => LineClassifier::ErrorKeyword,
        }
    }

    /// Whether the method writes a map file and can resume a previous pass.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::RescueCopy)
    }

    /// Builds the full argument vector, `program` first.
    pub fn build_args(
        &self,
        program: &str,
        request: &AcquisitionRequest,
        paths: &RunPaths,
    ) -> Vec<String> {
        let device = request.device.display().to_string();
        let image = paths.image.display().to_string();
        let mut args = vec![program.to_string()];

        match self {
            Self::DirectCopy => {
                args.push(format!("if={device}"));
                args.push(format!("of={image}"));
                args.push(format!("bs={}", request.block_size));
                args.push("conv=notrunc".into());
            }
            Self::RescueCopy => {
                if request.rescue_direct_mode {
                    args.push("-d".into());
                }
                args.push("-b".into());
                args.push(request.block_size.to_string());
                args.push(format!("-r{}", request.max_retries));
                args.push("-v".into());
                args.push(device);
                args.push(image);
                args.push(paths.map.display().to_string());
            }
            Self::OpticalCopy => {
                args.push(format!("retries={}", request.max_retries));
                args.push(format!("dev={device}"));
                args.push(format!("f={image}"));
            }
        }

        args
    }
}

impl fmt::Display for CopyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool())
    }
}

impl FromStr for CopyMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dd" | "direct" => Ok(Self::DirectCopy),
            "ddrescue" | "rescue" => Ok(Self::RescueCopy),
            "readom" | "optical" => Ok(Self::OpticalCopy),
            other => Err(format!(
                "unknown copy method '{other}' (expected dd, ddrescue or readom)"
            )),
        }
    }
}
