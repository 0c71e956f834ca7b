use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical moderation flag on a post. The older `marked-as-toxic` spelling is not read.
pub const FIELD_FLAGGED: &str = "flagged-as-toxic";
pub const FIELD_IS_TOXIC: &str = "is-toxic";
/// External correlation id forwarded with notifications.
pub const FIELD_POST_ID: &str = "post-id";

pub const FIELD_ORIGINAL_ID: &str = "original_id";
pub const FIELD_ORIGINAL_COLLECTION: &str = "original_collection";
pub const FIELD_PROCESSED_AT: &str = "processed_at";

/// A stored JSON object together with its id inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.data.get(field).and_then(Value::as_bool)
    }
}

/// Typed view of a post in the primary collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub id: String,
    pub flagged_as_toxic: bool,
    pub is_toxic: bool,
    pub post_id: Option<String>,
}

impl From<&Document> for PostRecord {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            flagged_as_toxic: doc.get_bool(FIELD_FLAGGED).unwrap_or(false),
            is_toxic: doc.get_bool(FIELD_IS_TOXIC).unwrap_or(false),
            post_id: doc.get_str(FIELD_POST_ID).map(str::to_owned),
        }
    }
}

/// Moderation status derived from the stored flag fields.
///
/// A rejected resolution stores the same fields as a never-flagged post, so
/// both read back as `Clean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationState {
    Clean,
    PendingReview,
    ConfirmedToxic,
}

impl PostRecord {
    pub fn state(&self) -> ModerationState {
        match (self.flagged_as_toxic, self.is_toxic) {
            (true, _) => ModerationState::PendingReview,
            (false, true) => ModerationState::ConfirmedToxic,
            (false, false) => ModerationState::Clean,
        }
    }
}

/// Row in the review queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: String,
    pub original_id: String,
    pub original_collection: String,
    pub processed_at: Option<DateTime<Utc>>,
    /// Full stored payload, including the copied post fields.
    pub data: Map<String, Value>,
}

impl From<Document> for QueueEntry {
    fn from(doc: Document) -> Self {
        let original_id = doc.get_str(FIELD_ORIGINAL_ID).unwrap_or_default().to_owned();
        let original_collection = doc
            .get_str(FIELD_ORIGINAL_COLLECTION)
            .unwrap_or_default()
            .to_owned();
        let processed_at = doc
            .get_str(FIELD_PROCESSED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Self {
            id: doc.id,
            original_id,
            original_collection,
            processed_at,
            data: doc.data,
        }
    }
}

/// Before/after snapshots of one write to a watched collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub document_id: String,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

impl ChangeEvent {
    pub fn is_deletion(&self) -> bool {
        self.after.is_none()
    }
}

/// Reviewer decision carried by the resolution path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Accept,
    Rejected,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Accept => "accept",
            Action::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(Action::Accept),
            "rejected" => Some(Action::Rejected),
            _ => None,
        }
    }

    /// Resulting `is-toxic` value after the resolution is applied.
    pub fn is_toxic(&self) -> bool {
        matches!(self, Action::Accept)
    }

    pub fn verdict(&self) -> &'static str {
        if self.is_toxic() {
            "toxic"
        } else {
            "not toxic"
        }
    }
}
