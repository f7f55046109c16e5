//! Row views returned by repositories. Business logic lives in higher layers.

use chrono::NaiveDateTime;

use crate::model::DiaryContentRecord;

/// A stored record together with where it belongs and whether it was edited locally.
#[derive(Debug, Clone)]
pub struct StoredContent {
    pub diary_id: String,
    pub record: DiaryContentRecord,
    pub edited: bool,
}

#[derive(Debug, Clone)]
pub struct DispatchRunRow {
    pub id: String,
    pub diary_id: String,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub finished_at: NaiveDateTime,
}
