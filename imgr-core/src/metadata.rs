//! The provenance record written at the end of every run.
//!
//! Field names are part of the on-disk format and are kept in the
//! camelCase spelling archives already rely on. The document is written with
//! sorted keys and four-space indentation so that two runs can be diffed.
use crate::error::MetadataError;
use crate::method::CopyMethod;
use chrono::{SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub identifier: String,
    pub description: String,
    pub notes: String,
    pub imgr_version: String,
    pub block_device: String,
    pub read_method: CopyMethod,
    pub read_method_version: String,
    pub read_command_line: String,
    pub max_retries: u32,
    pub rescue_direct_disc_mode: bool,
    pub auto_retry: bool,
    pub prefix: String,
    pub extension: String,
    pub acquisition_start: String,
    pub acquisition_end: String,
    pub success_flag: bool,
    pub interrupted_flag: bool,
    /// Only present when an image validator ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolyzer_success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_truncated: Option<bool>,
    pub checksums: BTreeMap<String, String>,
    pub checksum_type: String,
}

impl MetadataRecord {
    /// Renders the record as sorted-key, four-space indented JSON.
    pub fn to_json(&self) -> Result<String, MetadataError> {
        let mut buf = Vec::new();
        self.write_json(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn write_json<W: Write>(&self, writer: W) -> Result<(), MetadataError> {
        // Going through a BTreeMap fixes the key order independent of how
        // serde_json's own map type is configured.
        let sorted: BTreeMap<String, Value> = serde_json::from_value(serde_json::to_value(self)?)?;
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut ser = Serializer::with_formatter(writer, formatter);
        sorted.serialize(&mut ser)?;
        Ok(())
    }

    /// Writes the record to `path`, replacing any earlier document.
    pub fn write(&self, path: &Path) -> Result<(), MetadataError> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_json(&mut out)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// The free-text fields of a metadata document, readable from documents
/// written by any version of the tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DescriptiveFields {
    pub identifier: String,
    pub description: String,
    pub notes: String,
}

impl DescriptiveFields {
    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Parses an IANA time zone name such as `Europe/Amsterdam`.
pub fn parse_time_zone(name: &str) -> Result<Tz, MetadataError> {
    name.parse::<Tz>()
        .map_err(|_| MetadataError::TimeZone(name.to_string()))
}

/// The current time in `tz` as ISO 8601 with microseconds and UTC offset,
/// e.g. `2024-03-05T14:02:11.512034+01:00`.
pub fn timestamp(tz: Tz) -> String {
    Utc::now()
        .with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}
