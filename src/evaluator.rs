use serde_json::Value;

use crate::model::{Document, FIELD_FLAGGED};

/// Whether a post currently requires review.
///
/// Only a JSON `true` under `flagged-as-toxic` counts; strings, numbers and
/// other spellings of the field are treated as unflagged.
pub fn evaluate(record: &Document) -> bool {
    matches!(record.get(FIELD_FLAGGED), Some(Value::Bool(true)))
}
