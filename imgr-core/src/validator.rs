//! Structural validation of the produced image by an external validator.
//!
//! The engine does not understand container formats itself. It asks a
//! validator for two answers, whether the image is structurally sound and
//! whether it is smaller than its own headers say it should be, and treats
//! any failure to get those answers as a failed validation.
use crate::error::ValidatorError;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// A validator's answer about one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorVerdict {
    pub success: bool,
    /// The image is smaller than its file system claims (likely truncated).
    pub size_anomaly_detected: bool,
}

impl ValidatorVerdict {
    /// The verdict used whenever the validator could not produce one.
    pub const FAIL_CLOSED: Self = Self {
        success: false,
        size_anomaly_detected: true,
    };

    pub fn is_complete(&self) -> bool {
        self.success && !self.size_anomaly_detected
    }
}

/// Format-specific image validator.
pub trait ImageValidator: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the validator can run at all. Checked before a run starts.
    fn is_available(&self) -> bool {
        true
    }

    /// Validates the image at `image`, whose file system starts `offset`
    /// bytes in.
    fn validate(&self, image: &Path, offset: u64) -> Result<ValidatorVerdict, ValidatorError>;
}

/// Runs `validator` and maps every error to [`ValidatorVerdict::FAIL_CLOSED`].
pub fn validate_fail_closed(
    validator: &dyn ImageValidator,
    image: &Path,
    offset: u64,
) -> ValidatorVerdict {
    let verdict = match validator.validate(image, offset) {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!("{} could not validate {}: {e}", validator.name(), image.display());
            ValidatorVerdict::FAIL_CLOSED
        }
    };

    info!("{}Success: {}", validator.name(), verdict.success);
    info!("imageTruncated: {}", verdict.size_anomaly_detected);
    verdict
}

/// ISO 9660 / UDF validation with the external `isolyzer` program.
#[derive(Debug, Clone)]
pub struct IsolyzerValidator {
    program: String,
}

impl Default for IsolyzerValidator {
    fn default() -> Self {
        Self {
            program: "isolyzer".into(),
        }
    }
}

impl IsolyzerValidator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ImageValidator for IsolyzerValidator {
    fn name(&self) -> &str {
        "isolyzer"
    }

    fn is_available(&self) -> bool {
        crate::tools::is_installed(&self.program)
    }

    fn validate(&self, image: &Path, offset: u64) -> Result<ValidatorVerdict, ValidatorError> {
        let output = Command::new(&self.program)
            .arg("--offset")
            .arg(offset.to_string())
            .arg(image)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ValidatorError::Launch {
                program: self.program.clone(),
                source,
            })?;

        parse_isolyzer_report(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Reads `statusInfo/success` and `tests/smallerThanExpected` from an
/// isolyzer XML report. A missing size test counts as an anomaly.
pub fn parse_isolyzer_report(xml: &str) -> Result<ValidatorVerdict, ValidatorError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut success = None;
    let mut smaller_than_expected = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ValidatorError::Report(e.to_string()))?;
                let flag = text.trim() == "True";
                match tail(&path) {
                    Some(("statusInfo", "success")) => success = Some(flag),
                    Some(("tests", "smallerThanExpected")) => smaller_than_expected = Some(flag),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ValidatorError::Report(e.to_string())),
            _ => {}
        }
    }

    let success = success.ok_or(ValidatorError::MissingField("statusInfo/success"))?;
    Ok(ValidatorVerdict {
        success,
        size_anomaly_detected: smaller_than_expected.unwrap_or(true),
    })
}

fn tail(path: &[String]) -> Option<(&str, &str)> {
    match path {
        [.., parent, leaf] => Some((parent.as_str(), leaf.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_REPORT: &str = r#"<?xml version="1.0" ?>
<isolyzer>
  <file>
    <fileInfo><fileName>disc.iso</fileName><fileSizeInBytes>3670016</fileSizeInBytes></fileInfo>
    <statusInfo><success>True</success></statusInfo>
    <tests>
      <containsKnownFileSystem>True</containsKnownFileSystem>
      <sizeExpected>3670016</sizeExpected>
      <sizeActual>3670016</sizeActual>
      <sizeDifference>0</sizeDifference>
      <sizeDifferenceSectors>0.0</sizeDifferenceSectors>
      <sizeAsExpected>True</sizeAsExpected>
      <smallerThanExpected>False</smallerThanExpected>
    </tests>
  </file>
</isolyzer>"#;

    #[test]
    fn complete_image() {
        let verdict = parse_isolyzer_report(GOOD_REPORT).unwrap();
        assert!(verdict.success);
        assert!(!verdict.size_anomaly_detected);
        assert!(verdict.is_complete());
    }

    #[test]
    fn truncated_image() {
        let report = GOOD_REPORT.replace(
            "<smallerThanExpected>False",
            "<smallerThanExpected>True",
        );
        let verdict = parse_isolyzer_report(&report).unwrap();
        assert!(verdict.success);
        assert!(verdict.size_anomaly_detected);
        assert!(!verdict.is_complete());
    }

    #[test]
    fn missing_size_test_counts_as_anomaly() {
        let report = "<isolyzer><file><statusInfo><success>True</success></statusInfo><tests/></file></isolyzer>";
        let verdict = parse_isolyzer_report(report).unwrap();
        assert!(verdict.size_anomaly_detected);
    }

    #[test]
    fn missing_status_is_an_error() {
        assert!(matches!(
            parse_isolyzer_report("<isolyzer><file/></isolyzer>"),
            Err(ValidatorError::MissingField(_))
        ));
        assert!(parse_isolyzer_report("").is_err());
    }

    #[test]
    fn unavailable_validator_fails_closed() {
        let validator = IsolyzerValidator::new("/nonexistent/isolyzer");
        let verdict = validate_fail_closed(&validator, Path::new("/tmp/disc.iso"), 0);
        assert_eq!(verdict, ValidatorVerdict::FAIL_CLOSED);
    }
}
