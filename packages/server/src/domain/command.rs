use serde::{Deserialize, Serialize};

/// Cross-cutting metadata passed alongside a command and stamped on the
/// events it produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Who issued the command (a user, or a worker identity).
    pub actor: Option<String>,
    /// Ties the resulting events to a request or pipeline job.
    pub correlation_id: Option<String>,
}

impl CommandContext {
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
