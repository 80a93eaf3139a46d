use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Default location of the heartbeat file shared with the health check.
pub const DEFAULT_STAT_FILE: &str = "/tmp/healthcheck_stat";

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("touch {path}: {source}")]
    Touch { path: PathBuf, source: io::Error },
}

/// Receives a heartbeat after every fully successful cycle.
pub trait Liveness: Send + Sync {
    fn heartbeat(&self) -> Result<(), LivenessError>;
}

/// Heartbeat by touching a file; the health check reads its mtime.
#[derive(Debug, Clone)]
pub struct StatFileLiveness {
    path: PathBuf,
}

impl StatFileLiveness {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Liveness for StatFileLiveness {
    fn heartbeat(&self) -> Result<(), LivenessError> {
        let touch = |path: &Path| -> io::Result<()> {
            let file: File = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path)?;
            file.set_modified(SystemTime::now())
        };
        touch(&self.path).map_err(|source| LivenessError::Touch {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Heartbeat is older than the threshold.
    Stale,
    /// No heartbeat was ever recorded, or it cannot be read.
    Missing,
}

impl HealthStatus {
    /// Process exit code for the health check: 0 healthy, 1 otherwise.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Stale | Self::Missing => 1,
        }
    }
}

/// Compare the age of the heartbeat file against `threshold`.
pub fn check_health(path: &Path, threshold: Duration) -> HealthStatus {
    let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
        return HealthStatus::Missing;
    };
    // A clock step backwards makes the heartbeat look fresh, not stale.
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age > threshold {
        HealthStatus::Stale
    } else {
        HealthStatus::Healthy
    }
}
