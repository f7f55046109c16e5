//! Glue between the upstream API, the local store and the dispatcher.

use anyhow::{anyhow, bail, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db;
use crate::dispatch::{CancelFlag, DispatchError, DispatchItem, Dispatcher, EventSink};
use crate::model::{DiaryContentRecord, DispatchSummary};
use crate::portal::{ContentEditor, DiarySource};
use crate::reconcile::{self, SlotEdit};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub stored: usize,
    pub rejected: usize,
    pub orphan_anticipations: usize,
}

/// Fetch a diary from `source` and store every record that passes validation.
#[instrument(skip_all, fields(diary_id = %diary_id))]
pub async fn pull_diary(
    pool: &SqlitePool,
    source: &dyn DiarySource,
    diary_id: &str,
) -> Result<PullReport> {
    let fetched = source.list_diary_content(diary_id).await?;
    let (valid, rejected): (Vec<_>, Vec<_>) =
        fetched.into_iter().partition(|r| match r.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "skipping malformed record");
                false
            }
        });

    let orphans = reconcile::find_orphan_anticipations(&valid);
    for orphan in &orphans {
        warn!(
            anticipation = %orphan.id,
            original_content_id = orphan.original_content_id.as_deref().unwrap_or_default(),
            "anticipation references a class that was not loaded"
        );
    }
    let orphan_anticipations = orphans.len();

    let stored = db::upsert_records(pool, diary_id, &valid).await?;
    info!(stored, rejected = rejected.len(), "diary pulled");
    Ok(PullReport {
        stored,
        rejected: rejected.len(),
        orphan_anticipations,
    })
}

/// Stored records in display order.
pub async fn load_reconciled(pool: &SqlitePool, diary_id: &str) -> Result<Vec<DiaryContentRecord>> {
    let records = db::list_diary_content(pool, diary_id).await?;
    Ok(reconcile::reconcile(&records).into_iter().cloned().collect())
}

/// Save edited texts for slots of one diary. Returns the ids of the slots
/// whose texts actually changed.
#[instrument(skip_all, fields(diary_id = %diary_id, edits = edits.len()))]
pub async fn edit_slots(pool: &SqlitePool, diary_id: &str, edits: &[SlotEdit]) -> Result<Vec<String>> {
    let ordered = load_reconciled(pool, diary_id).await?;
    if let Some(unknown) = edits
        .iter()
        .find(|e| !ordered.iter().any(|r| r.id == e.slot_id))
    {
        bail!("slot {} is not part of diary {diary_id}", unknown.slot_id);
    }

    let slots: Vec<&DiaryContentRecord> = ordered.iter().collect();
    let edited = reconcile::apply_edits(&slots, edits);
    let mut changed = Vec::new();
    for (before, after) in ordered.iter().zip(&edited) {
        if before.content == after.content && before.observations == after.observations {
            continue;
        }
        db::save_content_edit(pool, &after.id, &after.content, Some(&after.observations)).await?;
        changed.push(after.id.clone());
    }
    info!(changed = changed.len(), "slot texts saved locally");
    Ok(changed)
}

/// Move the text at display position `from` to position `to` (both zero
/// based). Slot dates and times stay where they are.
pub async fn move_slot_content(
    pool: &SqlitePool,
    diary_id: &str,
    from: usize,
    to: usize,
) -> Result<Vec<String>> {
    let ordered = load_reconciled(pool, diary_id).await?;
    let mut slots = ordered.clone();
    if !reconcile::move_content(&mut slots, from, to) {
        bail!(
            "cannot move slot {} to {}: diary has {} slots",
            from + 1,
            to + 1,
            ordered.len()
        );
    }
    let edits: Vec<SlotEdit> = ordered
        .iter()
        .zip(&slots)
        .filter(|(before, after)| {
            before.content != after.content || before.observations != after.observations
        })
        .map(|(_, after)| SlotEdit {
            slot_id: after.id.clone(),
            content: after.content.clone(),
            observations: Some(after.observations.clone()),
        })
        .collect();
    edit_slots(pool, diary_id, &edits).await
}

/// Push every pending local edit of the diary upstream. Fails if any edit is
/// still pending afterwards, so a send never goes out with stale texts.
#[instrument(skip_all, fields(diary_id = %diary_id))]
pub async fn push_pending_edits(
    pool: &SqlitePool,
    editor: &dyn ContentEditor,
    diary_id: &str,
) -> Result<usize> {
    let pending = db::list_pending_edits(pool, diary_id).await?;
    let mut pushed = 0;
    let mut failed = Vec::new();
    for record in &pending {
        match editor
            .update_content(diary_id, &record.id, &record.content, Some(&record.observations))
            .await
        {
            Ok(()) => {
                db::mark_edit_pushed(pool, &record.id).await?;
                pushed += 1;
            }
            Err(err) => {
                warn!(slot = %record.id, error = %format!("{err:#}"), "edit not pushed");
                failed.push(record.id.clone());
            }
        }
    }
    if !failed.is_empty() {
        bail!(
            "{} local edit(s) not pushed upstream: {}",
            failed.len(),
            failed.join(", ")
        );
    }
    if pushed > 0 {
        info!(pushed, "pending edits pushed");
    }
    Ok(pushed)
}

/// Build the item list for a run. With no explicit selection every record is
/// sent in display order; a selection is kept in the order given.
pub fn plan_items(ordered: &[DiaryContentRecord], selection: &[String]) -> Result<Vec<DispatchItem>> {
    if selection.is_empty() {
        return Ok(ordered.iter().map(DispatchItem::from).collect());
    }
    selection
        .iter()
        .map(|content_id| {
            ordered
                .iter()
                .find(|r| &r.content_id == content_id)
                .map(DispatchItem::from)
                .ok_or_else(|| anyhow!("content {content_id} is not part of this diary"))
        })
        .collect()
}

/// Run one dispatch and keep its summary in the store. The returned run id
/// is `None` when the run ended with an `error` event.
#[instrument(skip_all, fields(diary_id = %diary_id, items = items.len()))]
pub async fn send_diary(
    pool: &SqlitePool,
    dispatcher: &Dispatcher,
    diary_id: &str,
    items: Vec<DispatchItem>,
    sink: &dyn EventSink,
    cancel: &CancelFlag,
) -> Result<Option<(String, DispatchSummary)>> {
    match dispatcher
        .run_cancellable(diary_id, items, sink, cancel)
        .await
    {
        Ok(summary) => {
            let run_id = Uuid::new_v4().to_string();
            db::record_dispatch_run(pool, &run_id, diary_id, &summary).await?;
            info!(%run_id, "{}", summary.describe());
            Ok(Some((run_id, summary)))
        }
        Err(DispatchError::Sink(err)) => Err(err.into()),
        Err(err) => {
            warn!(%err, "dispatch run ended with an error event");
            Ok(None)
        }
    }
}
