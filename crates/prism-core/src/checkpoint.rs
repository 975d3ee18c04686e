// ── Dashboard checkpointing ──
//
// Committed layout and shortcut changes are handed to a single background
// writer through a latest-wins slot. At most one write is in flight; a
// newer submission replaces whatever was waiting. Failed writes are
// retried with backoff until they succeed or a newer document arrives.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use prism_api::ReconnectConfig;
use prism_api::link::calculate_backoff;

use crate::error::CoreError;
use crate::model::{DashboardLayout, WidgetId};
use crate::shortcut::KeyCombo;

/// Everything about the dashboard that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardDocument {
    pub layout: DashboardLayout,
    #[serde(default)]
    pub shortcuts: BTreeMap<KeyCombo, WidgetId>,
}

/// Durable storage for the dashboard document. Called from a blocking
/// thread; implementations may do synchronous I/O.
pub trait DocumentSink: Send + Sync + 'static {
    fn persist(&self, document: &DashboardDocument) -> Result<(), CoreError>;
}

type Slot = Option<(u64, Arc<DashboardDocument>)>;

pub struct CheckpointWriter {
    slot: watch::Sender<Slot>,
    persisted: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl CheckpointWriter {
    pub fn spawn(
        sink: Arc<dyn DocumentSink>,
        retry: ReconnectConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let (slot, slot_rx) = watch::channel(None);
        let (persisted_tx, persisted) = watch::channel(0);
        let task = tokio::spawn(writer_task(
            sink,
            slot_rx,
            persisted_tx,
            retry,
            cancel.child_token(),
        ));
        Self {
            slot,
            persisted,
            task,
        }
    }

    /// Queue `document` for writing. Returns its generation.
    pub fn submit(&self, document: DashboardDocument) -> u64 {
        let mut generation = 0;
        self.slot.send_modify(|slot| {
            generation = slot.as_ref().map_or(1, |(g, _)| g + 1);
            *slot = Some((generation, Arc::new(document)));
        });
        tracing::trace!(generation, "Checkpoint submitted");
        generation
    }

    pub fn latest_generation(&self) -> u64 {
        self.slot.borrow().as_ref().map_or(0, |(g, _)| *g)
    }

    pub fn persisted_generation(&self) -> u64 {
        *self.persisted.borrow()
    }

    /// Wait until the latest submission is on disk.
    pub async fn flush(&self) -> Result<(), CoreError> {
        let target = self.latest_generation();
        let mut persisted = self.persisted.clone();
        persisted
            .wait_for(|g| *g >= target)
            .await
            .map(|_| ())
            .map_err(|_| CoreError::Persistence {
                message: "checkpoint writer stopped before the last save".into(),
            })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn writer_task(
    sink: Arc<dyn DocumentSink>,
    mut slot: watch::Receiver<Slot>,
    persisted: watch::Sender<u64>,
    retry: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut ready = false;
    loop {
        if !ready {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = slot.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        ready = false;

        let Some((generation, document)) = slot.borrow_and_update().clone() else {
            continue;
        };

        let mut attempt: u32 = 0;
        loop {
            match write(&sink, &document).await {
                Ok(()) => {
                    tracing::debug!(generation, "Dashboard saved");
                    persisted.send_replace(generation);
                    break;
                }
                Err(e) => {
                    let delay = calculate_backoff(attempt, &retry);
                    tracing::warn!(
                        generation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Saving dashboard failed, will retry"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        changed = slot.changed() => {
                            // A newer document supersedes this one.
                            ready = changed.is_ok();
                            break;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
    tracing::debug!("Checkpoint writer stopped");
}

async fn write(
    sink: &Arc<dyn DocumentSink>,
    document: &Arc<DashboardDocument>,
) -> Result<(), CoreError> {
    let sink = Arc::clone(sink);
    let document = Arc::clone(document);
    tokio::task::spawn_blocking(move || sink.persist(&document))
        .await
        .map_err(|e| CoreError::Internal(format!("checkpoint write panicked: {e}")))?
}
