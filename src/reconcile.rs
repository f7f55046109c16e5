//! Display ordering for diary content.
//!
//! Anticipated classes replace the session they were moved from. The
//! cancelled original is kept out of the chronological sort and placed right
//! below the anticipation that replaced it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ContentStats, DiaryContentRecord};

/// Order one diary's flat record list for display.
///
/// Active classes (regular sessions plus anticipations) are sorted by
/// `(date, time_range)`, comparing time ranges as plain strings. Each
/// anticipation is followed by the cancelled original it points to, when that
/// original is present in `records`.
pub fn reconcile(records: &[DiaryContentRecord]) -> Vec<&DiaryContentRecord> {
    let (anticipations, normal_classes): (Vec<_>, Vec<_>) =
        records.iter().partition(|r| r.is_anticipation());

    let anticipated_ids: HashSet<&str> = anticipations
        .iter()
        .filter_map(|a| a.original_content_id.as_deref())
        .collect();

    // Later duplicates of a content id win; upstream keeps ids unique per session.
    let mut cancelled: HashMap<&str, &DiaryContentRecord> = HashMap::new();
    let mut active: Vec<&DiaryContentRecord> = Vec::with_capacity(records.len());
    for class in normal_classes {
        if anticipated_ids.contains(class.content_id.as_str()) {
            cancelled.insert(class.content_id.as_str(), class);
        } else {
            active.push(class);
        }
    }
    active.extend(anticipations);

    // `sort_by` is stable: same-slot records keep their input order.
    active.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.time_range.cmp(&b.time_range))
    });

    let mut out = Vec::with_capacity(records.len());
    for item in active {
        out.push(item);
        if !item.is_anticipation() {
            continue;
        }
        if let Some(original_id) = item.original_content_id.as_deref() {
            match cancelled.get(original_id) {
                Some(original) => out.push(*original),
                None => debug!(
                    anticipation = %item.id,
                    original_content_id = original_id,
                    "original class not loaded; showing anticipation alone"
                ),
            }
        }
    }
    out
}

/// Count records by classification. Independent of input order.
pub fn compute_stats(records: &[DiaryContentRecord]) -> ContentStats {
    records.iter().fold(ContentStats::default(), |mut acc, r| {
        acc.total += 1;
        if r.is_anticipation() {
            acc.anticipations += 1;
        } else {
            acc.real_classes += 1;
        }
        acc
    })
}

/// Anticipations whose original class is not part of `records`.
pub fn find_orphan_anticipations(records: &[DiaryContentRecord]) -> Vec<&DiaryContentRecord> {
    let known: HashSet<&str> = records
        .iter()
        .filter(|r| !r.is_anticipation())
        .map(|r| r.content_id.as_str())
        .collect();
    records
        .iter()
        .filter(|r| r.is_anticipation())
        .filter(|r| {
            r.original_content_id
                .as_deref()
                .map_or(true, |id| !known.contains(id))
        })
        .collect()
}

/// Locally edited text for one slot, keyed by the slot's storage `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SlotEdit {
    pub slot_id: String,
    pub content: String,
    #[serde(default)]
    pub observations: Option<String>,
}

/// Pair reconciled slots with their edits. Identity, date, time range and
/// classification always come from the slot; only the texts are replaced.
pub fn apply_edits(ordered: &[&DiaryContentRecord], edits: &[SlotEdit]) -> Vec<DiaryContentRecord> {
    let by_slot: HashMap<&str, &SlotEdit> =
        edits.iter().map(|e| (e.slot_id.as_str(), e)).collect();
    ordered
        .iter()
        .map(|slot| {
            let mut record = (*slot).clone();
            if let Some(edit) = by_slot.get(slot.id.as_str()) {
                record.content = edit.content.clone();
                if let Some(obs) = &edit.observations {
                    record.observations = obs.clone();
                }
            }
            record
        })
        .collect()
}

/// Move the text of slot `from` to slot `to`, shifting the texts in between.
/// Slots keep their date and time; returns false when an index is out of range.
pub fn move_content(slots: &mut [DiaryContentRecord], from: usize, to: usize) -> bool {
    if from >= slots.len() || to >= slots.len() {
        return false;
    }
    if from == to {
        return true;
    }
    let mut texts: Vec<(String, String)> = slots
        .iter_mut()
        .map(|s| (std::mem::take(&mut s.content), std::mem::take(&mut s.observations)))
        .collect();
    let moved = texts.remove(from);
    texts.insert(to, moved);
    for (slot, (content, observations)) in slots.iter_mut().zip(texts) {
        slot.content = content;
        slot.observations = observations;
    }
    true
}
