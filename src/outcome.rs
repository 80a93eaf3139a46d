use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::host::HostId;

/// Per-host log lines gathered during one cycle.
///
/// Cloning is cheap and every clone feeds the same buffer, so parallel
/// dispatch tasks can each hold one. The controller clears it at the start
/// of every cycle.
#[derive(Debug, Clone, Default)]
pub struct LogCollector {
    lines: Arc<Mutex<HashMap<HostId, Vec<String>>>>,
}

impl LogCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger that attributes every line to `host`.
    pub fn for_host(&self, host: &HostId) -> HostLog {
        HostLog {
            host: host.clone(),
            collector: self.clone(),
        }
    }

    pub fn record(&self, host: &HostId, line: impl Into<String>) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.clone())
            .or_default()
            .push(line.into());
    }

    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drain everything collected so far.
    pub fn take(&self) -> HashMap<HostId, Vec<String>> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Log handle for one host: lines go both to the collector and to tracing.
#[derive(Debug, Clone)]
pub struct HostLog {
    host: HostId,
    collector: LogCollector,
}

impl HostLog {
    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        info!(host = %self.host, "{line}");
        self.collector.record(&self.host, line);
    }

    pub fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        warn!(host = %self.host, "{line}");
        self.collector.record(&self.host, line);
    }
}

/// Report of one completed reconciliation cycle, handed to the post-process
/// hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub cycle_id: String,
    pub dry_run: bool,
    pub changed: BTreeSet<HostId>,
    pub errors: BTreeMap<HostId, Vec<String>>,
    pub logs: BTreeMap<HostId, Vec<String>>,
}

impl CycleOutcome {
    /// Assemble the report from the changed set, per-host errors and the
    /// lines collected during dispatch. Hosts with an empty error list are
    /// dropped from `errors`.
    pub fn build(
        cycle_id: &str,
        dry_run: bool,
        changed: BTreeSet<HostId>,
        errors: HashMap<HostId, Vec<String>>,
        logs: HashMap<HostId, Vec<String>>,
    ) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            dry_run,
            changed,
            errors: errors
                .into_iter()
                .filter(|(_, errs)| !errs.is_empty())
                .collect(),
            logs: logs.into_iter().collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed_hosts(&self) -> impl Iterator<Item = &HostId> {
        self.errors.keys()
    }
}
