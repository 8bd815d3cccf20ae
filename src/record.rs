//! Record data structure.
//!
//! A [`Record`] is the unit application code saves and reads: a test result
//! keyed by its test code, a user profile, or a setting value. The payload is
//! opaque JSON so any assessment shape fits without a schema migration.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A locally persisted entity.
///
/// # Example
///
/// ```
/// use assessment_sync::Record;
/// use serde_json::json;
///
/// let record = Record::new("ABC123", json!({"mbti": "INFP"}));
///
/// assert_eq!(record.key, "ABC123");
/// assert_eq!(record.timestamp, record.last_modified);
/// assert!(record.has_unsynced_changes());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Primary key, unique within its partition (e.g. a test-result code)
    pub key: String,
    /// The actual payload
    pub payload: Value,
    /// Creation time (epoch millis). Preserved across overwrites.
    pub timestamp: i64,
    /// Last local write (epoch millis)
    pub last_modified: i64,
    /// Last time this version was confirmed by the remote (epoch millis).
    /// Local bookkeeping only; never sent as part of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<i64>,
}

impl Record {
    /// Create a new record stamped with the current time.
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        let now = now_millis();
        Self {
            key: key.into(),
            payload,
            timestamp: now,
            last_modified: now,
            synced_at: None,
        }
    }

    /// Build a record from any serializable payload.
    pub fn from_serializable<T: Serialize>(
        key: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(key, serde_json::to_value(payload)?))
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// True when the last local write has not been confirmed by the remote.
    #[must_use]
    pub fn has_unsynced_changes(&self) -> bool {
        self.synced_at.map_or(true, |synced| synced < self.last_modified)
    }

    /// Apply this record as an overwrite of `existing`: the creation
    /// timestamp carries over, everything else comes from `self`.
    #[must_use]
    pub fn overwriting(mut self, existing: Option<&Record>) -> Self {
        if let Some(existing) = existing {
            self.timestamp = existing.timestamp;
        }
        self
    }

    /// Apply this record as a local edit made at `now`: the creation
    /// timestamp carries over from `existing`, `last_modified` moves strictly
    /// past the previous write and any sync stamp is cleared.
    #[must_use]
    pub fn edited(mut self, existing: Option<&Record>, now: i64) -> Self {
        self.last_modified = match existing {
            Some(existing) => now.max(existing.last_modified + 1),
            None => now,
        };
        self.synced_at = None;
        self.overwriting(existing)
    }

    pub(crate) fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub(crate) fn from_document(doc: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record() {
        let record = Record::new("ABC123", json!({"mbti": "INFP"}));

        assert_eq!(record.key, "ABC123");
        assert_eq!(record.payload["mbti"], "INFP");
        assert!(record.timestamp > 0);
        assert_eq!(record.timestamp, record.last_modified);
        assert!(record.synced_at.is_none());
    }

    #[test]
    fn test_document_uses_camel_case() {
        let record = Record::new("k", json!(1));
        let doc = record.to_document().unwrap();

        assert!(doc.get("lastModified").is_some());
        assert!(doc.get("last_modified").is_none());
        // synced_at omitted until confirmed
        assert!(doc.get("syncedAt").is_none());
    }

    #[test]
    fn test_document_round_trip_keeps_synced_at() {
        let mut record = Record::new("k", json!({"a": [1, 2]}));
        record.synced_at = Some(record.last_modified);

        let back = Record::from_document(record.to_document().unwrap()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_overwriting_preserves_creation_time() {
        let mut original = Record::new("k", json!(1));
        original.timestamp = 1_000;

        let updated = Record::new("k", json!(2)).overwriting(Some(&original));
        assert_eq!(updated.timestamp, 1_000);
        assert_eq!(updated.payload, json!(2));
        assert!(updated.last_modified > 1_000);
    }

    #[test]
    fn test_edit_of_synced_record_is_unsynced() {
        let mut original = Record::new("k", json!({"v": 1}));
        original.timestamp = 1_000;
        original.last_modified = 2_000;
        original.synced_at = Some(3_000);

        // Read, modify, save: the caller hands back the stamps it read
        let mut edit = original.clone();
        edit.payload = json!({"v": 2});
        let stored = edit.edited(Some(&original), 1_500);

        assert_eq!(stored.timestamp, 1_000);
        assert_eq!(stored.last_modified, 2_001);
        assert_eq!(stored.synced_at, None);
        assert!(stored.has_unsynced_changes());
    }

    #[test]
    fn test_unsynced_changes() {
        let mut record = Record::new("k", json!(null));
        assert!(record.has_unsynced_changes());

        record.synced_at = Some(record.last_modified);
        assert!(!record.has_unsynced_changes());

        record.last_modified += 5;
        assert!(record.has_unsynced_changes());
    }

    #[test]
    fn test_typed_payload() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Mbti {
            mbti: String,
        }

        let record = Record::from_serializable("ABC", &Mbti { mbti: "INTJ".into() }).unwrap();
        let decoded: Mbti = record.payload_as().unwrap();
        assert_eq!(decoded.mbti, "INTJ");
    }
}
