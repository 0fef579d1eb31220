//! Validated string types for MIME types, data URIs and filename components.
//!
//! URI path components, media suffix paths and blob keys all share the same
//! restricted filename character class. Validation happens at construction so
//! that every held value is known-good and serialization is infallible.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Filename component character class: ASCII alphanumerics plus a restricted
/// punctuation set and percent-escapes. Excludes `/` and `$` so that suffix
/// detection on `/$` is unambiguous.
pub const REGEX_FILENAME: &str = r"(?:[a-zA-Z0-9]|[!&'()+,\-.=@_~]|%[0-9a-fA-F]{2})+";

static RE_FILENAME: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(&format!("^{REGEX_FILENAME}$")).unwrap()
});

static RE_MIME: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z0-9][a-z0-9.+-]*/[a-z0-9][a-z0-9.+-]*$").unwrap()
});

/// A single validated filename component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileName(String);

impl FileName {
    /// Parse a filename component, rejecting anything outside the restricted
    /// character class.
    pub fn decode(value: &str) -> Result<Self> {
        if RE_FILENAME.is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::bad_uri("FileName", "expected pattern", value))
        }
    }

    /// Parse a filename component, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The validated string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Replace or append the file extension.
    #[must_use]
    pub fn with_ext(&self, ext: &str) -> Self {
        match self.0.rsplit_once('.') {
            Some((stem, _)) => Self(format!("{stem}.{ext}")),
            None => Self(format!("{}.{ext}", self.0)),
        }
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for FileName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<FileName> for String {
    fn from(value: FileName) -> Self {
        value.0
    }
}

/// A slash-separated path of validated filename components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilePath(Vec<FileName>);

impl FilePath {
    /// Parse a `a/b/c` path with at least one component.
    pub fn decode(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::bad_uri("FilePath", "expected pattern", value));
        }
        let parts = value
            .split('/')
            .map(FileName::decode)
            .collect::<Result<Vec<_>>>()
            .map_err(|_| Error::bad_uri("FilePath", "expected pattern", value))?;
        Ok(Self(parts))
    }

    /// Parse a path, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The path components.
    #[must_use]
    pub fn parts(&self) -> Vec<FileName> {
        self.0.clone()
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                f.write_str("/")?;
            }
            first = false;
            f.write_str(part.as_str())?;
        }
        Ok(())
    }
}

/// Broad processing mode inferred from a MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeMode {
    /// Markdown-convertible prose.
    Markdown,
    /// Plain text with no markup.
    Plain,
    /// Structured data (JSON, CSV-as-data, XML).
    Data,
    /// Spreadsheet family; split per sheet during ingestion.
    Spreadsheet,
    /// Raster image family.
    Image,
    /// Anything else.
    Binary,
}

/// A validated lowercase `type/subtype` MIME type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MimeType(String);

/// The canonical image type all kept media are re-encoded to.
#[must_use]
pub fn image_preferred_type() -> MimeType {
    MimeType("image/webp".to_string())
}

/// The image MIME types the ingestion pipeline accepts as blobs.
#[must_use]
pub fn image_mime_types() -> Vec<MimeType> {
    ["image/png", "image/jpeg", "image/gif", "image/webp", "image/bmp", "image/tiff"]
        .iter()
        .map(|s| MimeType((*s).to_string()))
        .collect()
}

impl MimeType {
    /// Parse a MIME type, lowercasing and validating the `type/subtype` form.
    pub fn decode(value: &str) -> Result<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        if RE_MIME.is_match(&lowered) {
            Ok(Self(lowered))
        } else {
            Err(Error::bad_uri("MimeType", "expected pattern", value))
        }
    }

    /// Parse a MIME type, returning `None` on mismatch.
    #[must_use]
    pub fn try_decode(value: &str) -> Option<Self> {
        Self::decode(value).ok()
    }

    /// The validated string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Broad processing mode for ingestion dispatch.
    ///
    /// The detection policy is intentionally centralized here; connectors
    /// only carry the MIME type.
    #[must_use]
    pub fn mode(&self) -> MimeMode {
        match self.0.as_str() {
            "text/markdown" | "text/x-markdown" | "text/html" => MimeMode::Markdown,
            "text/plain" => MimeMode::Plain,
            "text/csv"
            | "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.oasis.opendocument.spreadsheet" => MimeMode::Spreadsheet,
            "application/json" | "application/xml" | "text/xml" | "application/x-yaml" => {
                MimeMode::Data
            },
            other if other.starts_with("image/") => MimeMode::Image,
            other if other.starts_with("text/") => MimeMode::Plain,
            _ => MimeMode::Binary,
        }
    }

    /// Guess a file extension for the type, when one is well-known.
    #[must_use]
    pub fn guess_extension(&self) -> Option<&'static str> {
        match self.0.as_str() {
            "text/html" => Some("html"),
            "text/plain" => Some("txt"),
            "text/markdown" | "text/x-markdown" => Some("md"),
            "text/csv" => Some("csv"),
            "application/json" => Some("json"),
            "application/pdf" => Some("pdf"),
            "image/png" => Some("png"),
            "image/jpeg" => Some("jpg"),
            "image/webp" => Some("webp"),
            "image/gif" => Some("gif"),
            _ => None,
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MimeType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<MimeType> for String {
    fn from(value: MimeType) -> Self {
        value.0
    }
}

/// A `data:<mime>;base64,<payload>` URI carrying inline binary content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataUri {
    mime_type: MimeType,
    blob: String,
}

impl DataUri {
    /// Build a data URI from a MIME type and raw bytes.
    #[must_use]
    pub fn new(mime_type: MimeType, bytes: &[u8]) -> Self {
        Self {
            mime_type,
            blob: BASE64.encode(bytes),
        }
    }

    /// Build a data URI from a MIME type and an already-encoded payload.
    #[must_use]
    pub fn from_encoded(mime_type: MimeType, blob: String) -> Self {
        Self { mime_type, blob }
    }

    /// Parse a `data:` URI string.
    pub fn decode(value: &str) -> Result<Self> {
        let rest = value
            .strip_prefix("data:")
            .ok_or_else(|| Error::bad_uri("DataUri", "invalid scheme", value))?;
        let (mime_str, blob) = rest
            .split_once(";base64,")
            .ok_or_else(|| Error::bad_uri("DataUri", "expected base64 payload", value))?;
        Ok(Self {
            mime_type: MimeType::decode(mime_str)
                .map_err(|_| Error::bad_uri("DataUri", "invalid mime type", value))?,
            blob: blob.to_string(),
        })
    }

    /// The MIME type and encoded payload.
    #[must_use]
    pub fn parts(&self) -> (MimeType, String) {
        (self.mime_type.clone(), self.blob.clone())
    }

    /// The MIME type of the payload.
    #[must_use]
    pub const fn mime_type(&self) -> &MimeType {
        &self.mime_type
    }

    /// Decode the payload bytes.
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.blob)
            .map_err(|e| Error::Serialization(format!("invalid base64 payload: {e}")))
    }
}

impl fmt::Display for DataUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.mime_type, self.blob)
    }
}

impl TryFrom<String> for DataUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<DataUri> for String {
    fn from(value: DataUri) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_accepts_restricted_punctuation() {
        for value in ["PROJ-123", "-", "Loyalty-Program.aspx", "image.png", "a%20b"] {
            assert!(FileName::try_decode(value).is_some(), "rejected '{value}'");
        }
    }

    #[test]
    fn test_filename_rejects_separators_and_suffix_marker() {
        for value in ["", "a/b", "$body", "a b", "a?b", "a#b", "a\"b"] {
            assert!(FileName::try_decode(value).is_none(), "accepted '{value}'");
        }
    }

    #[test]
    fn test_filepath_round_trip() {
        let path = FilePath::decode("figures/image.png").unwrap();
        assert_eq!(path.parts().len(), 2);
        assert_eq!(path.to_string(), "figures/image.png");
        assert!(FilePath::try_decode("").is_none());
        assert!(FilePath::try_decode("a//b").is_none());
    }

    #[test]
    fn test_mime_type_normalizes_case() {
        let mime = MimeType::decode("Image/PNG").unwrap();
        assert_eq!(mime.as_str(), "image/png");
        assert_eq!(mime.mode(), MimeMode::Image);
    }

    #[test]
    fn test_mime_mode_detection() {
        assert_eq!(MimeType::decode("text/csv").unwrap().mode(), MimeMode::Spreadsheet);
        assert_eq!(
            MimeType::decode("application/vnd.ms-excel").unwrap().mode(),
            MimeMode::Spreadsheet
        );
        assert_eq!(MimeType::decode("application/json").unwrap().mode(), MimeMode::Data);
        assert_eq!(MimeType::decode("text/markdown").unwrap().mode(), MimeMode::Markdown);
        assert_eq!(MimeType::decode("application/pdf").unwrap().mode(), MimeMode::Binary);
    }

    #[test]
    fn test_data_uri_round_trip() {
        let uri = DataUri::new(MimeType::decode("image/webp").unwrap(), b"hello");
        let serialized = uri.to_string();
        assert!(serialized.starts_with("data:image/webp;base64,"));

        let parsed = DataUri::decode(&serialized).unwrap();
        assert_eq!(parsed, uri);
        assert_eq!(parsed.as_bytes().unwrap(), b"hello");
    }

    #[test]
    fn test_data_uri_rejects_other_schemes() {
        assert!(DataUri::decode("https://example.com").is_err());
        assert!(DataUri::decode("data:image/webp,plain").is_err());
    }
}
