//! Progress reporting for migration runs.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::core::memory::lock;
use crate::error::MigrateError;
use crate::orchestrator::{MigrationResult, RunStatus};

/// Observer of a migration run.
///
/// Callbacks are synchronous and must not block; the orchestrator calls them
/// inline between batches.
pub trait ProgressReporter: Send + Sync {
    /// Called after every batch.
    fn on_progress(&self, current: usize, total: usize, message: &str);

    /// Called exactly once, with the finalized result.
    fn on_complete(&self, result: &MigrationResult);

    /// Called for every batch error and every fatal error.
    fn on_error(&self, error: &MigrateError);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_progress(&self, _current: usize, _total: usize, _message: &str) {}

    fn on_complete(&self, _result: &MigrationResult) {}

    fn on_error(&self, _error: &MigrateError) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn on_progress(&self, current: usize, total: usize, message: &str) {
        let pct = if total > 0 {
            current as f64 / total as f64 * 100.0
        } else {
            100.0
        };
        info!("[{}/{} {:.1}%] {}", current, total, pct, message);
    }

    fn on_complete(&self, result: &MigrationResult) {
        info!(
            "Migration {:?}: {}/{} records migrated, {} failed in {:.1}s",
            result.status,
            result.migrated_records,
            result.total_records,
            result.failed_records,
            result.duration_seconds
        );
    }

    fn on_error(&self, error: &MigrateError) {
        error!("{}", error);
    }
}

/// Event forwarded by [`ChannelReporter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        current: usize,
        total: usize,
        message: String,
    },
    Complete {
        run_id: String,
        status: RunStatus,
        migrated: usize,
        failed: usize,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn progress(current: usize, total: usize, message: &str) -> Self {
        ProgressEvent::Progress {
            current,
            total,
            message: message.to_string(),
        }
    }

    pub fn complete(result: &MigrationResult) -> Self {
        ProgressEvent::Complete {
            run_id: result.run_id.clone(),
            status: result.status,
            migrated: result.migrated_records,
            failed: result.failed_records,
        }
    }

    pub fn error(error: &MigrateError) -> Self {
        ProgressEvent::Error {
            message: error.to_string(),
        }
    }
}

/// Forwards events into a bounded channel.
///
/// Uses `try_send`, so a slow consumer loses events instead of stalling the
/// run.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Create a reporter with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn send(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_progress(&self, current: usize, total: usize, message: &str) {
        self.send(ProgressEvent::progress(current, total, message));
    }

    fn on_complete(&self, result: &MigrationResult) {
        self.send(ProgressEvent::complete(result));
    }

    fn on_error(&self, error: &MigrateError) {
        self.send(ProgressEvent::error(error));
    }
}

/// Writes each event as one JSON line.
pub struct JsonLinesReporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesReporter {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    fn emit(&self, event: ProgressEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        let mut out = lock(&self.out);
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

impl ProgressReporter for JsonLinesReporter {
    fn on_progress(&self, current: usize, total: usize, message: &str) {
        self.emit(ProgressEvent::progress(current, total, message));
    }

    fn on_complete(&self, result: &MigrationResult) {
        self.emit(ProgressEvent::complete(result));
    }

    fn on_error(&self, error: &MigrateError) {
        self.emit(ProgressEvent::error(error));
    }
}
