//! Contract between the pipeline and the external transforms it drives.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Format;

/// Input handed to a converter: a local file plus what is known about it.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub input: PathBuf,
    /// Lowercase extension the input was declared with.
    pub extension: String,
    /// Scratch directory the converter may write its outputs into.
    pub output_dir: PathBuf,
    /// Job parameters, including queue-specific ones.
    pub parameters: BTreeMap<String, String>,
}

/// Where a produced artifact lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactSource {
    File(PathBuf),
    /// Structured output, stored as a JSON blob.
    Payload(serde_json::Value),
}

/// One output of a conversion, registered as a new format of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub format: Format,
    pub source: ArtifactSource,
}

impl Artifact {
    pub fn file(format: impl Into<Format>, path: impl Into<PathBuf>) -> Self {
        Self {
            format: format.into(),
            source: ArtifactSource::File(path.into()),
        }
    }

    pub fn payload(format: impl Into<Format>, value: serde_json::Value) -> Self {
        Self {
            format: format.into(),
            source: ArtifactSource::Payload(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConvertOutcome {
    Converted(Vec<Artifact>),
    /// The converter cannot handle this input. Not a failure.
    Unsupported,
}

/// A swappable transform (PDF rendering, text extraction, thumbnails...).
///
/// An `Err` from [`convert`](Converter::convert) is a hard failure and feeds
/// the job retry count.
#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    fn can_convert(&self, extension: &str) -> bool;

    async fn convert(&self, request: &ConvertRequest) -> Result<ConvertOutcome>;
}
