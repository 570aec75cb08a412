use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use conflux_core::types::WorkflowEvent;

/// JSONL run logger.
///
/// Consumes engine events and appends one JSON object per line to
/// `{log_dir}/{execution_id}.jsonl`. Resumed runs append to the same file,
/// so one file holds the whole life of an execution.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=per-node, 3=reflection rounds.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events until cancelled or the bus closes.
    ///
    /// Take the receiver with `EventBus::subscribe` before starting the run
    /// so no early event is missed.
    pub async fn run(self, mut rx: Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();
        loop {
            tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => {
                        let Some(entry) = self.event_to_entry(&event) else {
                            continue;
                        };
                        if let Err(e) = self.write(&mut writers, &entry).await {
                            error!(error = %e, execution_id = %entry.execution_id, "Failed to write log entry");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        for writer in writers.values_mut() {
            writer.flush().await.ok();
        }
    }

    async fn write(
        &self,
        writers: &mut HashMap<String, BufWriter<File>>,
        entry: &LogEntry,
    ) -> std::io::Result<()> {
        if !writers.contains_key(&entry.execution_id) {
            let file = open_append(&self.log_path(&entry.execution_id)).await?;
            writers.insert(entry.execution_id.clone(), BufWriter::new(file));
        }
        let Some(writer) = writers.get_mut(&entry.execution_id) else {
            return Ok(());
        };
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        // Flush each entry so a crash mid-run keeps every written line.
        writer.flush().await
    }

    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type, node_id: Option<&String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: event.execution_id().0.clone(),
            event_type,
            node_id: node_id.cloned(),
            detail,
        };

        match event {
            // L1: run summary
            WorkflowEvent::RunStarted { .. } => Some(entry("run_started", None, None)),
            WorkflowEvent::RunCompleted { messages, .. } => Some(entry(
                "run_completed",
                None,
                Some(serde_json::json!({ "messages": messages })),
            )),
            WorkflowEvent::RunFailed { error, .. } => Some(entry(
                "run_failed",
                None,
                Some(serde_json::json!({ "error": error })),
            )),
            WorkflowEvent::RunStopped { .. } => Some(entry("run_stopped", None, None)),
            WorkflowEvent::HumanInputRequired {
                node_id,
                prompt_title,
                ..
            } => Some(entry(
                "human_input_required",
                Some(node_id),
                Some(serde_json::json!({ "prompt_title": prompt_title })),
            )),

            // L2: per node
            WorkflowEvent::NodeStarted { node_id, .. } if self.level >= 2 => {
                Some(entry("node_started", Some(node_id), None))
            }
            WorkflowEvent::NodeCompleted {
                node_id, elapsed_ms, ..
            } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node_id),
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            )),

            // L3: reflection rounds
            WorkflowEvent::ReflectionRound {
                source,
                reviewer,
                iteration,
                ..
            } if self.level >= 3 => Some(entry(
                "reflection_round",
                Some(source),
                Some(serde_json::json!({ "reviewer": reviewer, "iteration": iteration })),
            )),

            _ => None,
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
