use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::callout::{Callout, CalloutError, CalloutOutcome};
use crate::host::HostId;

enum Scripted {
    Outcome(CalloutOutcome),
    Error(String),
}

/// One recorded invocation of the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub host: HostId,
    pub payload_path: PathBuf,
    pub dry_run: bool,
}

/// Mock callout for testing. Replays scripted results per host (one per
/// call, succeeding once the script runs out) and records every call.
#[derive(Default)]
pub struct MockCallout {
    scripts: Mutex<HashMap<HostId, VecDeque<Scripted>>>,
    invocations: Mutex<Vec<Invocation>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockCallout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `delay` so concurrent calls overlap.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn push_outcome(&self, host: &HostId, outcome: CalloutOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(host.clone())
            .or_default()
            .push_back(Scripted::Outcome(outcome));
    }

    /// Queue a failing outcome with the given exit code.
    pub fn push_failure(&self, host: &HostId, exit_code: i32) {
        self.push_outcome(
            host,
            CalloutOutcome::Failed {
                exit_code,
                output: vec![format!("fatal: host {host} unreachable")],
                error: "unreachable".to_string(),
            },
        );
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn push_error(&self, host: &HostId, message: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(host.clone())
            .or_default()
            .push_back(Scripted::Error(message.to_string()));
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of calls made for `host`.
    pub fn calls_for(&self, host: &HostId) -> usize {
        self.invocations()
            .iter()
            .filter(|inv| &inv.host == host)
            .count()
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Callout for MockCallout {
    async fn run(
        &self,
        cancel: &CancellationToken,
        host: &HostId,
        payload_path: &Path,
        dry_run: bool,
    ) -> Result<CalloutOutcome, CalloutError> {
        self.invocations.lock().unwrap().push(Invocation {
            host: host.clone(),
            payload_path: payload_path.to_path_buf(),
            dry_run,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let cancelled = match self.delay {
            Some(delay) => tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = cancel.cancelled() => true,
            },
            None => false,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Err(CalloutError::Cancelled);
        }

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(host)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Scripted::Outcome(outcome)) => Ok(outcome),
            Some(Scripted::Error(message)) => Err(CalloutError::Io(std::io::Error::other(message))),
            None => Ok(CalloutOutcome::Succeeded {
                output: vec![format!("ok: [{host}]")],
            }),
        }
    }
}
