//! Roster entries and the canonical source filename grammar
//!
//! Source photos are named `<name>_<id>_<role>_<seq>.<ext>`. The id segment may
//! carry a one-letter prefix (`T001`, `B42`) that is kept for display only; the
//! numeric part is what the remote image server is keyed on.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// The only separator allowed between filename fields
pub const FIELD_SEPARATOR: char = '_';

const NAME_PATTERN: &str = r"^[\p{L}\p{M}\p{N}.\- ]+$";
const ROLE_PATTERN: &str = r"^[A-Za-z0-9]+$";

/// Raster formats accepted as source photos and produced as badges
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpg,
    Jpeg,
    Bmp,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Webp => "webp",
        }
    }

    /// Format implied by a path's extension (case-insensitive)
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ImageFormat::from_str(ext).ok())
    }

    /// Encoder used by the `image` crate when saving in this format
    pub fn encoder_format(&self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpg | ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Bmp => image::ImageFormat::Bmp,
            ImageFormat::Webp => image::ImageFormat::WebP,
        }
    }

    /// Comma separated list of every supported extension, for messages
    pub fn supported_list() -> String {
        ImageFormat::iter()
            .map(|f| f.extension())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Numeric identifier the remote image server uses for a person
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchKey(u64);

impl FetchKey {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a filename does not follow the `<name>_<id>_<role>_<seq>.<ext>` grammar
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormatError {
    #[error("'{filename}' has no file extension")]
    MissingExtension { filename: String },

    #[error("'{filename}' has unsupported extension '{extension}'")]
    UnsupportedExtension { filename: String, extension: String },

    #[error("'{filename}' has {found} fields, expected name_id_role_seq")]
    TooFewFields { filename: String, found: usize },

    #[error("'{filename}' has {found} fields, '_' may only separate name_id_role_seq")]
    TooManyFields { filename: String, found: usize },

    #[error("invalid name '{value}'")]
    InvalidName { value: String },

    #[error("employee id '{value}' is not numeric after prefix stripping")]
    NonNumericId { value: String },

    #[error("invalid role code '{value}'")]
    InvalidRole { value: String },

    #[error("sequence '{value}' is not a non-negative integer")]
    InvalidSequence { value: String },

    #[error("'{value}' is not a bare filename")]
    NotAFilename { value: String },
}

/// One person's badge request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Digits of the employee id, prefix removed
    pub employee_id: String,
    /// Opaque one-letter classification tag from the id segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_prefix: Option<char>,
    pub display_name: String,
    pub role_code: String,
    pub sequence: u32,
    /// Exact filename the entry was decoded from
    ///
    /// Decoding is lenient about zero padding, surrounding spaces and the
    /// extension, so the canonical encoding may not name the file on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl RosterEntry {
    /// Build an entry from raw field values, splitting a leading id prefix
    pub fn new(
        display_name: &str,
        raw_employee_id: &str,
        role_code: &str,
        sequence: u32,
    ) -> Result<Self, FormatError> {
        let display_name = display_name.trim();
        if !name_regex().is_match(display_name) {
            return Err(FormatError::InvalidName {
                value: display_name.to_string(),
            });
        }

        let role_code = role_code.trim();
        if !role_regex().is_match(role_code) {
            return Err(FormatError::InvalidRole {
                value: role_code.to_string(),
            });
        }

        let (id_prefix, employee_id) = split_id_prefix(raw_employee_id.trim())?;

        Ok(Self {
            employee_id,
            id_prefix,
            display_name: display_name.to_string(),
            role_code: role_code.to_string(),
            sequence,
            source_file: None,
        })
    }

    /// Employee id as shown to people, prefix included
    pub fn display_id(&self) -> String {
        match self.id_prefix {
            Some(prefix) => format!("{}{}", prefix, self.employee_id),
            None => self.employee_id.clone(),
        }
    }

    /// Remote fetch key (numeric id, leading zeros dropped)
    pub fn fetch_key(&self) -> Result<FetchKey, FormatError> {
        self.employee_id
            .parse::<u64>()
            .map(FetchKey)
            .map_err(|_| FormatError::NonNumericId {
                value: self.employee_id.clone(),
            })
    }

    /// Canonical source filename for this entry
    pub fn filename(&self, format: ImageFormat) -> String {
        encode(self, format)
    }

    /// Filename of the source photo: the decoded name when there is one,
    /// otherwise the canonical name in `default_format`
    pub fn source_filename(&self, default_format: ImageFormat) -> String {
        self.source_file
            .clone()
            .unwrap_or_else(|| encode(self, default_format))
    }
}

/// Encode an entry as `<name>_<id>_<role>_<seq>.<ext>`
pub fn encode(entry: &RosterEntry, format: ImageFormat) -> String {
    format!(
        "{name}{sep}{id}{sep}{role}{sep}{seq}.{ext}",
        name = entry.display_name,
        id = entry.display_id(),
        role = entry.role_code,
        seq = entry.sequence,
        ext = format.extension(),
        sep = FIELD_SEPARATOR,
    )
}

/// Decode a canonical filename into a roster entry
///
/// Pure: only the string is inspected, never the filesystem.
pub fn decode(filename: &str) -> Result<RosterEntry, FormatError> {
    if filename.contains('/') || filename.contains('\\') {
        return Err(FormatError::NotAFilename {
            value: filename.to_string(),
        });
    }

    let (stem, extension) =
        filename
            .rsplit_once('.')
            .ok_or_else(|| FormatError::MissingExtension {
                filename: filename.to_string(),
            })?;

    let fields: Vec<&str> = stem.split(FIELD_SEPARATOR).collect();
    if fields.len() < 4 {
        return Err(FormatError::TooFewFields {
            filename: filename.to_string(),
            found: fields.len(),
        });
    }
    if fields.len() > 4 {
        return Err(FormatError::TooManyFields {
            filename: filename.to_string(),
            found: fields.len(),
        });
    }

    if ImageFormat::from_str(extension).is_err() {
        return Err(FormatError::UnsupportedExtension {
            filename: filename.to_string(),
            extension: extension.to_string(),
        });
    }

    let sequence = fields[3]
        .trim()
        .parse::<u32>()
        .map_err(|_| FormatError::InvalidSequence {
            value: fields[3].to_string(),
        })?;

    let mut entry = RosterEntry::new(fields[0], fields[1], fields[2], sequence)?;
    // Rejects ids too large for a fetch key
    entry.fetch_key()?;
    entry.source_file = Some(filename.to_string());
    Ok(entry)
}

/// Fetch key for a canonical filename
pub fn fetch_key_for(filename: &str) -> Result<FetchKey, FormatError> {
    decode(filename)?.fetch_key()
}

/// Split an optional one-letter prefix off an employee id
fn split_id_prefix(raw: &str) -> Result<(Option<char>, String), FormatError> {
    let mut chars = raw.chars();
    let (prefix, digits) = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => (Some(first), chars.as_str()),
        _ => (None, raw),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(FormatError::NonNumericId {
            value: raw.to_string(),
        });
    }

    Ok((prefix, digits.to_string()))
}

fn name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(NAME_PATTERN).expect("name pattern is valid"))
}

fn role_regex() -> &'static Regex {
    static ROLE: OnceLock<Regex> = OnceLock::new();
    ROLE.get_or_init(|| Regex::new(ROLE_PATTERN).expect("role pattern is valid"))
}

/// Roster record as written in a JSON roster file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterRecord {
    name: String,
    employee_id: String,
    role: String,
    #[serde(default = "default_sequence")]
    sequence: u32,
}

fn default_sequence() -> u32 {
    1
}

/// Load a roster from disk
///
/// `.json` files hold an array of `{name, employeeId, role, sequence}` records;
/// any other file is read as one canonical filename per line (blank lines and
/// `#` comments are ignored).
pub fn load_roster(path: &Path) -> Result<Vec<RosterEntry>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read roster file: {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        let records: Vec<RosterRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse roster file: {}", path.display()))?;
        records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                RosterEntry::new(&record.name, &record.employee_id, &record.role, record.sequence)
                    .with_context(|| format!("Invalid roster record #{}", index + 1))
            })
            .collect()
    } else {
        contents
            .lines()
            .enumerate()
            .map(|(number, line)| (number, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(number, line)| {
                decode(line).with_context(|| format!("Invalid roster line {}", number + 1))
            })
            .collect()
    }
}
