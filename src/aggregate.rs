//! Consumer-side view of a dispatch run built from its event stream.

use std::collections::HashMap;

use serde::Serialize;

use crate::dispatch::DispatchEvent;
use crate::model::{summary_text, DispatchOutcome};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Reconnecting,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemResult {
    pub id: String,
    pub name: String,
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressView {
    pub status: SyncStatus,
    pub current: usize,
    pub total: usize,
    pub message: String,
    pub items: Vec<ItemResult>,
    #[serde(skip)]
    labels: HashMap<String, String>,
}

impl ProgressView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SyncStatus::Completed | SyncStatus::Error)
    }

    /// Fold one event into the view. Returns false when the run already ended
    /// and the event was ignored.
    pub fn apply(&mut self, event: &DispatchEvent) -> bool {
        if self.is_terminal() {
            return false;
        }
        match event {
            DispatchEvent::Progress {
                current,
                total,
                content_id,
                label,
                message,
                outcome,
            } => {
                self.status = SyncStatus::Syncing;
                self.current = *current;
                self.total = *total;
                self.message = message.clone();
                self.labels.insert(content_id.clone(), label.clone());
                if let Some(outcome) = outcome {
                    self.upsert(outcome);
                }
            }
            DispatchEvent::Complete { results, .. } => {
                self.status = SyncStatus::Completed;
                self.current = results.len();
                if self.total == 0 {
                    self.total = results.len();
                }
                self.items = results.iter().map(|o| self.item_for(o)).collect();
                self.message = self.summary_line();
            }
            DispatchEvent::Error { message } => {
                self.status = SyncStatus::Error;
                self.message = message.clone();
            }
        }
        true
    }

    /// The live connection dropped without a terminal event.
    pub fn connection_lost(&mut self) {
        if matches!(self.status, SyncStatus::Syncing) {
            self.status = SyncStatus::Reconnecting;
        }
    }

    pub fn connection_restored(&mut self) {
        if matches!(self.status, SyncStatus::Reconnecting) {
            self.status = SyncStatus::Syncing;
        }
    }

    /// Start over for a fresh run.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.success).count()
    }

    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| !i.success).count()
    }

    pub fn summary_line(&self) -> String {
        summary_text(self.succeeded(), self.failed())
    }

    fn item_for(&self, outcome: &DispatchOutcome) -> ItemResult {
        ItemResult {
            id: outcome.content_id.clone(),
            name: self
                .labels
                .get(&outcome.content_id)
                .cloned()
                .unwrap_or_else(|| outcome.content_id.clone()),
            success: outcome.success,
            message: outcome.message.clone(),
        }
    }

    fn upsert(&mut self, outcome: &DispatchOutcome) {
        let item = self.item_for(outcome);
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(current: usize, id: &str, outcome: Option<DispatchOutcome>) -> DispatchEvent {
        DispatchEvent::Progress {
            current,
            total: 2,
            content_id: id.into(),
            label: format!("aula {id}"),
            message: format!("Sending {current}/2: aula {id}"),
            outcome,
        }
    }

    #[test]
    fn progress_then_complete() {
        let mut view = ProgressView::new();
        assert!(view.apply(&progress(1, "X1", None)));
        assert_eq!(view.status, SyncStatus::Syncing);
        assert_eq!(view.message, "Sending 1/2: aula X1");

        view.apply(&progress(2, "X2", Some(DispatchOutcome::ok("X1", None))));
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].name, "aula X1");

        view.apply(&DispatchEvent::Complete {
            results: vec![
                DispatchOutcome::ok("X1", None),
                DispatchOutcome::failed("X2", "recusado"),
            ],
            succeeded: 1,
            failed: 1,
        });
        assert_eq!(view.status, SyncStatus::Completed);
        assert_eq!(view.items.len(), 2);
        assert_eq!(view.items[1].name, "aula X2");
        assert_eq!(view.failed(), 1);
        assert_eq!(view.summary_line(), "1 enviados, 1 falharam");
        assert_eq!(view.message, view.summary_line());
    }

    #[test]
    fn terminal_state_ignores_late_events() {
        let mut view = ProgressView::new();
        view.apply(&progress(1, "X1", None));
        assert!(view.apply(&DispatchEvent::Error {
            message: "session expired".into()
        }));
        assert!(!view.apply(&progress(2, "X2", None)));
        assert_eq!(view.status, SyncStatus::Error);
        assert_eq!(view.current, 1);

        view.reset();
        assert_eq!(view.status, SyncStatus::Idle);
        assert!(view.apply(&progress(1, "X1", None)));
    }

    #[test]
    fn connection_loss_is_recoverable() {
        let mut view = ProgressView::new();
        view.connection_lost();
        assert_eq!(view.status, SyncStatus::Idle);

        view.apply(&progress(1, "X1", None));
        view.connection_lost();
        assert_eq!(view.status, SyncStatus::Reconnecting);
        view.connection_restored();
        assert_eq!(view.status, SyncStatus::Syncing);
    }
}
