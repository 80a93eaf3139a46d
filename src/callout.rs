use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::host::HostId;

/// Error produced by a callout before it could report an outcome.
#[derive(Debug, thiserror::Error)]
pub enum CalloutError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("invalid callout configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// What a callout reported for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalloutOutcome {
    Succeeded {
        output: Vec<String>,
    },
    Failed {
        exit_code: i32,
        output: Vec<String>,
        error: String,
    },
}

impl CalloutOutcome {
    pub fn output(&self) -> &[String] {
        match self {
            Self::Succeeded { output } | Self::Failed { output, .. } => output,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// The execution step run for every changed host: given the host id and
/// the path of its freshly written payload, apply the configuration.
///
/// With `dry_run` set the callout must decide and log exactly as it would
/// live, but perform no external action.
#[async_trait]
pub trait Callout: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        host: &HostId,
        payload_path: &Path,
        dry_run: bool,
    ) -> Result<CalloutOutcome, CalloutError>;
}
