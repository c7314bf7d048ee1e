use std::path::PathBuf;

use serde::Deserialize;

/// One polling worker bound to a queue.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Identity recorded on claimed jobs. Default: "worker-1".
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Queue to poll.
    pub queue: String,
    /// Delay after the first empty poll, doubled on each further one. Default: 500.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cap of the idle backoff. Default: 30000.
    #[serde(default = "default_max_idle_backoff_ms")]
    pub max_idle_backoff_ms: u64,
    /// Scratch space for downloaded inputs and converter outputs.
    /// Default: "./data/work".
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Converters tried in order; the first accepting the extension wins.
    #[serde(default)]
    pub converters: Vec<CommandConverterConfig>,
}

fn default_identity() -> String {
    "worker-1".into()
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_idle_backoff_ms() -> u64 {
    30_000
}
fn default_working_dir() -> PathBuf {
    "./data/work".into()
}

impl WorkerConfig {
    pub fn new(identity: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            queue: queue.into(),
            poll_interval_ms: default_poll_interval_ms(),
            max_idle_backoff_ms: default_max_idle_backoff_ms(),
            working_dir: default_working_dir(),
            converters: Vec::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }
}

/// An external program turning one file into another.
///
/// `{input}` and `{output}` in `args` are replaced by the downloaded input
/// path and the path the program must write; `{output_dir}` by the folder
/// holding `{output}`.
#[derive(Debug, Deserialize, Clone)]
pub struct CommandConverterConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Pipe-separated input extensions; all extensions when absent.
    #[serde(default)]
    pub extensions: Option<String>,
    /// Format registered for the produced file.
    pub output_format: String,
    /// Extension of the produced file. Default: the output format.
    #[serde(default)]
    pub output_extension: Option<String>,
    /// Default: 300.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Exit code meaning "cannot convert this input" rather than failure.
    #[serde(default)]
    pub unsupported_exit_code: Option<i32>,
}

fn default_timeout_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults() {
        let config: WorkerConfig = serde_json::from_value(serde_json::json!({
            "queue": "pdf"
        }))
        .unwrap();
        assert_eq!(config.identity, "worker-1");
        assert_eq!(config.poll_interval_ms, 500);
        assert!(config.converters.is_empty());
    }

    #[test]
    fn converter_definition() {
        let config: CommandConverterConfig = serde_json::from_value(serde_json::json!({
            "name": "libreoffice",
            "program": "soffice",
            "args": ["--convert-to", "pdf", "{input}"],
            "extensions": "doc|docx",
            "output_format": "pdf"
        }))
        .unwrap();
        assert_eq!(config.timeout_secs, 300);
        assert_eq!(config.output_extension, None);
        assert_eq!(config.extensions.as_deref(), Some("doc|docx"));
    }
}
