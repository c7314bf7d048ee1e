use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use common::converter::{Artifact, ConvertOutcome, ConvertRequest, Converter};
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use crate::config::CommandConverterConfig;

/// Converter backed by an external program.
pub struct CommandConverter {
    config: CommandConverterConfig,
    extensions: Option<Vec<String>>,
}

impl CommandConverter {
    pub fn new(config: CommandConverterConfig) -> Self {
        let extensions = config.extensions.as_ref().map(|list| {
            list.split('|')
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect()
        });
        Self { config, extensions }
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn can_convert(&self, extension: &str) -> bool {
        match &self.extensions {
            Some(list) => list.iter().any(|ext| ext.eq_ignore_ascii_case(extension)),
            None => true,
        }
    }

    async fn convert(&self, request: &ConvertRequest) -> anyhow::Result<ConvertOutcome> {
        let extension = self
            .config
            .output_extension
            .as_deref()
            .unwrap_or(&self.config.output_format);
        let stem = request
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let output = request.output_dir.join(format!("{stem}.{extension}"));

        let input_arg = request.input.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let output_dir_arg = request.output_dir.to_string_lossy();
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input_arg)
                    .replace("{output_dir}", &output_dir_arg)
                    .replace("{output}", &output_arg)
            })
            .collect();

        debug!(converter = %self.config.name, program = %self.config.program, ?args, "Running converter");
        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .current_dir(&request.output_dir)
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "{} timed out after {}s",
                    self.config.name,
                    self.config.timeout_secs
                )
            })?
            .with_context(|| format!("failed to start {}", self.config.program))?;

        if !result.status.success() {
            if self.config.unsupported_exit_code.is_some()
                && result.status.code() == self.config.unsupported_exit_code
            {
                return Ok(ConvertOutcome::Unsupported);
            }
            bail!(
                "{} exited with {}: {}",
                self.config.name,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }

        if !fs::try_exists(&output).await? {
            bail!(
                "{} produced no output at {}",
                self.config.name,
                output.display()
            );
        }

        Ok(ConvertOutcome::Converted(vec![Artifact::file(
            self.config.output_format.as_str(),
            output,
        )]))
    }
}
