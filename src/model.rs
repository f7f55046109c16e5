use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static TIME_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,2}:\d{2}\s*-\s*\d{1,2}:\d{2}$").expect("valid time range regex"));

/// Classification of a class session, stored upstream as a single-letter code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContentType {
    #[serde(rename = "N")]
    Normal,
    #[serde(rename = "A")]
    Anticipation,
    #[serde(rename = "R")]
    Makeup,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Normal => "N",
            ContentType::Anticipation => "A",
            ContentType::Makeup => "R",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "N" => Some(ContentType::Normal),
            "A" => Some(ContentType::Anticipation),
            "R" => Some(ContentType::Makeup),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record {id:?} is missing required field `{field}`")]
    MissingField { id: String, field: &'static str },
    #[error("anticipation {0:?} has no original class reference")]
    AnticipationWithoutOriginal(String),
    #[error("record {0:?} is not an anticipation but references an original class")]
    UnexpectedOriginal(String),
    #[error("record {id:?} has malformed time range {value:?}")]
    InvalidTimeRange { id: String, value: String },
}

/// One scheduled class session of a diary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiaryContentRecord {
    pub id: String,
    pub content_id: String,
    pub date: NaiveDate,
    pub time_range: String,
    #[serde(rename = "type")]
    pub kind: ContentType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub observations: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_non_presential: bool,
}

impl DiaryContentRecord {
    pub fn is_anticipation(&self) -> bool {
        self.kind == ContentType::Anticipation
    }

    /// Human label used in progress messages, e.g. `01/03/2024 08:00-10:00`.
    pub fn label(&self) -> String {
        format!("{} {}", self.date.format("%d/%m/%Y"), self.time_range)
    }

    /// Check the linkage and shape invariants of a single record.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::MissingField {
                id: self.id.clone(),
                field: "id",
            });
        }
        if self.content_id.trim().is_empty() {
            return Err(RecordError::MissingField {
                id: self.id.clone(),
                field: "contentId",
            });
        }
        if self.time_range.trim().is_empty() {
            return Err(RecordError::MissingField {
                id: self.id.clone(),
                field: "timeRange",
            });
        }
        if !TIME_RANGE.is_match(self.time_range.trim()) {
            return Err(RecordError::InvalidTimeRange {
                id: self.id.clone(),
                value: self.time_range.clone(),
            });
        }

        let has_original = self.original_content_id.is_some() || self.original_date.is_some();
        if self.is_anticipation() {
            let linked = self
                .original_content_id
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
                && self.original_date.is_some();
            if !linked {
                return Err(RecordError::AnticipationWithoutOriginal(self.id.clone()));
            }
        } else if has_original {
            return Err(RecordError::UnexpectedOriginal(self.id.clone()));
        }
        Ok(())
    }
}

/// Result of sending one content record to the remote system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub content_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DispatchOutcome {
    pub fn ok(content_id: impl Into<String>, message: Option<String>) -> Self {
        Self {
            content_id: content_id.into(),
            success: true,
            message,
        }
    }

    pub fn failed(content_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            success: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<DispatchOutcome>,
}

impl DispatchSummary {
    pub fn from_outcomes(results: Vec<DispatchOutcome>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }

    /// Partial success is still a completed run; this is the line shown to the user.
    pub fn describe(&self) -> String {
        summary_text(self.succeeded, self.failed)
    }
}

/// "X enviados, Y falharam", shown for completed runs.
pub fn summary_text(succeeded: usize, failed: usize) -> String {
    format!("{succeeded} enviados, {failed} falharam")
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContentStats {
    pub total: usize,
    pub real_classes: usize,
    pub anticipations: usize,
}
