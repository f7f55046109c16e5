//! Sequential bulk send of diary content with live progress events.
//!
//! One item is in flight at a time. A failed item is recorded and the run
//! moves on; only a lost session or a broken event channel ends a run early.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, instrument, warn};

use crate::model::{DiaryContentRecord, DispatchOutcome, DispatchSummary};

/// Events pushed to the progress channel, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DispatchEvent {
    /// Emitted before item `current` is sent. `outcome` is the result of the
    /// previous item, when there is one.
    #[serde(rename_all = "camelCase")]
    Progress {
        current: usize,
        total: usize,
        content_id: String,
        label: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<DispatchOutcome>,
    },
    Complete {
        results: Vec<DispatchOutcome>,
        succeeded: usize,
        failed: usize,
    },
    Error {
        message: String,
    },
}

impl DispatchEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchEvent::Progress { .. })
    }
}

/// Remote answer for one "fill in this class" write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum SendError {
    /// The remote session is gone; no further item can succeed.
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait ContentSender: Send + Sync {
    async fn send_one(&self, diary_id: &str, content_id: &str) -> Result<SendResponse, SendError>;
}

#[derive(Debug, Error)]
#[error("progress channel closed")]
pub struct SinkClosed;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: DispatchEvent) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for mpsc::Sender<DispatchEvent> {
    async fn emit(&self, event: DispatchEvent) -> Result<(), SinkClosed> {
        self.send(event).await.map_err(|_| SinkClosed)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no content to send")]
    Empty,
    #[error("a dispatch run is already active for diary {0}")]
    AlreadyRunning(String),
    #[error("session lost while sending {content_id}: {message}")]
    SessionLost { content_id: String, message: String },
    #[error(transparent)]
    Sink(#[from] SinkClosed),
}

/// Delay inserted between two consecutive sends.
pub trait Pacing: Send + Sync {
    fn next_delay(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl Pacing for NoDelay {
    fn next_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Uniformly random pause in `[min_ms, max_ms]`.
#[derive(Debug, Clone, Copy)]
pub struct RandomDelay {
    min_ms: u64,
    max_ms: u64,
}

impl RandomDelay {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: max_ms.max(min_ms),
        }
    }
}

impl Pacing for RandomDelay {
    fn next_delay(&self) -> Duration {
        if self.min_ms == self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

/// One entry of a dispatch run, in caller order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchItem {
    pub content_id: String,
    pub label: String,
}

impl From<&DiaryContentRecord> for DispatchItem {
    fn from(record: &DiaryContentRecord) -> Self {
        Self {
            content_id: record.content_id.clone(),
            label: record.label(),
        }
    }
}

impl From<String> for DispatchItem {
    fn from(content_id: String) -> Self {
        Self {
            label: content_id.clone(),
            content_id,
        }
    }
}

/// Shared flag to stop a run after the item currently in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Diaries with a run in progress. At most one run per diary.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunRegistry {
    pub fn try_acquire(&self, diary_id: &str) -> Option<RunGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(diary_id.to_string()) {
            return None;
        }
        Some(RunGuard {
            registry: self.clone(),
            diary_id: diary_id.to_string(),
        })
    }

    pub fn is_active(&self, diary_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(diary_id)
    }
}

/// Releases the diary's slot in the registry on drop.
#[derive(Debug)]
pub struct RunGuard {
    registry: RunRegistry,
    diary_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.diary_id);
    }
}

pub struct Dispatcher {
    sender: Arc<dyn ContentSender>,
    pacing: Arc<dyn Pacing>,
    registry: RunRegistry,
}

impl Dispatcher {
    pub fn new(sender: Arc<dyn ContentSender>) -> Self {
        Self {
            sender,
            pacing: Arc::new(NoDelay),
            registry: RunRegistry::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: Arc<dyn Pacing>) -> Self {
        self.pacing = pacing;
        self
    }

    /// Share a registry between dispatchers serving the same diaries.
    pub fn with_registry(mut self, registry: RunRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub async fn run(
        &self,
        diary_id: &str,
        items: Vec<DispatchItem>,
        sink: &dyn EventSink,
    ) -> Result<DispatchSummary, DispatchError> {
        self.run_cancellable(diary_id, items, sink, &CancelFlag::default())
            .await
    }

    /// Send `items` in order. Every run ends with exactly one `complete` or
    /// `error` event, unless the sink itself is closed.
    #[instrument(skip_all, fields(diary_id = %diary_id, total = items.len()))]
    pub async fn run_cancellable(
        &self,
        diary_id: &str,
        items: Vec<DispatchItem>,
        sink: &dyn EventSink,
        cancel: &CancelFlag,
    ) -> Result<DispatchSummary, DispatchError> {
        let result = self.execute(diary_id, items, sink, cancel).await;
        match &result {
            Ok(summary) => info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                "dispatch run completed"
            ),
            Err(DispatchError::Sink(_)) => warn!("progress channel closed; dispatch run abandoned"),
            Err(err) => {
                warn!(error = %err, "dispatch run aborted");
                let _ = sink
                    .emit(DispatchEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    async fn execute(
        &self,
        diary_id: &str,
        items: Vec<DispatchItem>,
        sink: &dyn EventSink,
        cancel: &CancelFlag,
    ) -> Result<DispatchSummary, DispatchError> {
        if items.is_empty() {
            return Err(DispatchError::Empty);
        }
        let _guard = self
            .registry
            .try_acquire(diary_id)
            .ok_or_else(|| DispatchError::AlreadyRunning(diary_id.to_string()))?;

        let total = items.len();
        let mut results: Vec<DispatchOutcome> = Vec::with_capacity(total);

        for (idx, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(sent = results.len(), "dispatch run cancelled");
                break;
            }
            if idx > 0 {
                let delay = self.pacing.next_delay();
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "pacing");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
            if cancel.is_cancelled() {
                info!(sent = results.len(), "dispatch run cancelled");
                break;
            }

            let current = idx + 1;
            sink.emit(DispatchEvent::Progress {
                current,
                total,
                content_id: item.content_id.clone(),
                label: item.label.clone(),
                message: format!("Sending {current}/{total}: {}", item.label),
                outcome: results.last().cloned(),
            })
            .await?;

            let outcome = match self.sender.send_one(diary_id, &item.content_id).await {
                Ok(resp) if resp.success => DispatchOutcome::ok(&item.content_id, resp.message),
                Ok(resp) => DispatchOutcome::failed(
                    &item.content_id,
                    resp.message
                        .unwrap_or_else(|| "rejected by remote system".to_string()),
                ),
                Err(SendError::SessionExpired(message)) => {
                    return Err(DispatchError::SessionLost {
                        content_id: item.content_id.clone(),
                        message,
                    });
                }
                Err(SendError::Other(err)) => DispatchOutcome::failed(&item.content_id, format!("{err:#}")),
            };
            if !outcome.success {
                warn!(
                    content_id = %item.content_id,
                    current,
                    reason = outcome.message.as_deref().unwrap_or_default(),
                    "item failed; continuing"
                );
            }
            results.push(outcome);
        }

        let summary = DispatchSummary::from_outcomes(results);
        sink.emit(DispatchEvent::Complete {
            results: summary.results.clone(),
            succeeded: summary.succeeded,
            failed: summary.failed,
        })
        .await?;
        Ok(summary)
    }
}

/// Run a dispatch on a background task and expose its events as a stream.
/// The stream ends after the terminal event.
pub fn dispatch_stream(
    dispatcher: Arc<Dispatcher>,
    diary_id: String,
    items: Vec<DispatchItem>,
) -> impl Stream<Item = DispatchEvent> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        if let Err(DispatchError::Sink(err)) = dispatcher.run(&diary_id, items, &tx).await {
            warn!(diary_id = %diary_id, error = %err, "event stream dropped; dispatch run abandoned");
        }
    });
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = DispatchEvent::Progress {
            current: 1,
            total: 2,
            content_id: "X1".into(),
            label: "01/03/2024 08:00-10:00".into(),
            message: "Sending 1/2: 01/03/2024 08:00-10:00".into(),
            outcome: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["contentId"], "X1");
        assert!(value.get("outcome").is_none());

        let value = serde_json::to_value(DispatchEvent::Error {
            message: "no content to send".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "error", "message": "no content to send"}));
    }

    #[test]
    fn registry_is_single_flight_per_diary() {
        let registry = RunRegistry::default();
        let guard = registry.try_acquire("d1").unwrap();
        assert!(registry.try_acquire("d1").is_none());
        assert!(registry.try_acquire("d2").is_some());
        drop(guard);
        assert!(!registry.is_active("d1"));
        assert!(registry.try_acquire("d1").is_some());
    }

    #[test]
    fn random_delay_stays_in_bounds() {
        let pacing = RandomDelay::new(20, 5);
        for _ in 0..50 {
            let d = pacing.next_delay();
            assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(20));
        }
        assert_eq!(NoDelay.next_delay(), Duration::ZERO);
    }
}
