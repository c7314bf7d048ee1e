use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Blob store configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory of the filesystem blob store. Default: "./data/blobs".
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Largest accepted blob in bytes. Default: 512 MiB.
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u64,
}

fn default_storage_path() -> PathBuf {
    "./data/blobs".into()
}
fn default_max_blob_size() -> u64 {
    512 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            max_blob_size: default_max_blob_size(),
        }
    }
}

/// Definition of one pipeline queue.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue name, also used by workers to poll it.
    pub name: String,
    /// Regular expression over the producing pipeline id. Supports lookaround,
    /// e.g. `^(?!thumbnail$).*`.
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Pipe-separated extension allow-list, e.g. `pdf|docx`.
    #[serde(default)]
    pub extensions: Option<String>,
    /// Extra parameters copied verbatim into every job of this queue.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Failures after which a job is abandoned. Default: 5.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_max_failures() -> u32 {
    5
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline: None,
            extensions: None,
            parameters: BTreeMap::new(),
            max_failures: default_max_failures(),
        }
    }

    pub fn with_pipeline(mut self, pattern: impl Into<String>) -> Self {
        self.pipeline = Some(pattern.into());
        self
    }

    pub fn with_extensions(mut self, extensions: impl Into<String>) -> Self {
        self.extensions = Some(extensions.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }
}
