//! Identifiers and value objects shared by the store, the ledger and workers.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of a content descriptor aggregate (one per unique binary content).
    DescriptorId
);

string_id!(
    /// Opaque identifier of a stored binary. Immutable once assigned.
    BlobId
);

string_id!(
    /// Tenant the pipeline runs for. Part of every deterministic job id.
    TenantId
);

string_id!(
    /// Identifier of the pipeline stage that produced a format.
    PipelineId
);

impl DescriptorId {
    /// Allocate a fresh, time-ordered descriptor id.
    pub fn generate() -> Self {
        Self(format!("descriptor_{}", uuid::Uuid::now_v7().simple()))
    }
}

impl BlobId {
    /// Allocate a fresh blob id for content of the given format.
    ///
    /// The format is kept as a readable prefix (`pdf.0190...`) so operators
    /// can tell what a blob is from its id alone.
    pub fn generate(format: &Format) -> Self {
        Self(format!("{}.{}", format, uuid::Uuid::now_v7().simple()))
    }

    /// Format prefix embedded by [`BlobId::generate`], if present.
    pub fn format_prefix(&self) -> Option<&str> {
        self.0.split_once('.').map(|(prefix, _)| prefix)
    }
}

impl PipelineId {
    /// Pipeline attributed to uploads and formats detected at upload time.
    pub fn original() -> Self {
        Self("original".into())
    }
}

/// A logical, user-facing document name. Compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct HandleId(String);

impl HandleId {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A handle is usable as a document name if it is non-empty and has no whitespace.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for HandleId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for HandleId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<HandleId> for String {
    fn from(value: HandleId) -> Self {
        value.0
    }
}

/// A named variant of a document's content (`original`, `pdf`, `tika`, ...).
///
/// Format names are case-insensitive and always stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Format(String);

impl Format {
    pub const ORIGINAL: &'static str = "original";
    pub const PDF: &'static str = "pdf";
    pub const RASTER_IMAGE: &'static str = "rasterimage";
    pub const HTML_ZIP: &'static str = "htmlzip";

    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_lowercase())
    }

    pub fn original() -> Self {
        Self(Self::ORIGINAL.into())
    }

    pub fn is_original(&self) -> bool {
        self.0 == Self::ORIGINAL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Map a file name to a well-known format based on its extension.
    pub fn detect(file_name: &FileName) -> Option<Self> {
        let format = match file_name.extension().as_str() {
            "pdf" => Self::PDF,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tif" | "tiff" => Self::RASTER_IMAGE,
            "htmlzip" | "ezip" => Self::HTML_ZIP,
            _ => return None,
        };
        Some(Self(format.into()))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Format {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Format {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Format> for String {
    fn from(value: Format) -> Self {
        value.0
    }
}

/// Display file name of an uploaded document or produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileName(String);

impl FileName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase extension without the leading dot, or an empty string.
    pub fn extension(&self) -> String {
        match self.0.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => String::new(),
        }
    }

    /// File name without its extension.
    pub fn stem(&self) -> &str {
        match self.0.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.0,
        }
    }

    /// Strip any directory components a client may have sent along.
    pub fn sanitized(&self) -> Self {
        let name = self
            .0
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        if name.is_empty() || name == "." || name == ".." {
            Self("unnamed".into())
        } else {
            Self(name.into())
        }
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FileName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_case_insensitive() {
        assert_eq!(Format::new("PDF"), Format::new("pdf"));
        assert_eq!(Format::new(" Original ").as_str(), "original");
        assert!(Format::new("ORIGINAL").is_original());
    }

    #[test]
    fn format_deserializes_lowercase() {
        let format: Format = serde_json::from_str("\"Tika\"").unwrap();
        assert_eq!(format.as_str(), "tika");
    }

    #[test]
    fn detect_known_formats() {
        assert_eq!(
            Format::detect(&FileName::from("report.PDF")),
            Some(Format::new(Format::PDF))
        );
        assert_eq!(
            Format::detect(&FileName::from("scan.tiff")),
            Some(Format::new(Format::RASTER_IMAGE))
        );
        assert_eq!(Format::detect(&FileName::from("notes.docx")), None);
        assert_eq!(Format::detect(&FileName::from("README")), None);
    }

    #[test]
    fn file_name_extension_and_stem() {
        let name = FileName::from("Quarterly.Report.DOCX");
        assert_eq!(name.extension(), "docx");
        assert_eq!(name.stem(), "Quarterly.Report");

        let dotfile = FileName::from(".profile");
        assert_eq!(dotfile.extension(), "");
        assert_eq!(dotfile.stem(), ".profile");
    }

    #[test]
    fn file_name_sanitized_drops_directories() {
        assert_eq!(
            FileName::from("../../etc/passwd").sanitized().as_str(),
            "passwd"
        );
        assert_eq!(
            FileName::from("C:\\docs\\a.pdf").sanitized().as_str(),
            "a.pdf"
        );
        assert_eq!(FileName::from("..").sanitized().as_str(), "unnamed");
    }

    #[test]
    fn handle_id_normalizes() {
        let handle = HandleId::new("  Doc_1 ");
        assert_eq!(handle.as_str(), "doc_1");
        assert!(handle.is_valid());
        assert!(!HandleId::new("two words").is_valid());
        assert!(!HandleId::new("  ").is_valid());
    }

    #[test]
    fn blob_id_carries_format_prefix() {
        let id = BlobId::generate(&Format::new("PDF"));
        assert_eq!(id.format_prefix(), Some("pdf"));
        assert_ne!(id, BlobId::generate(&Format::new("pdf")));
    }
}
