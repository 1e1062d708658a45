use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Trait for types that can be read from the database by column name.
pub trait Entity: Serialize + DeserializeOwned {}

// Blanket implementation for any type that meets the requirements
impl<T> Entity for T where T: Serialize + DeserializeOwned {}

/// One audit snapshot of an entity mutation, the parent of its details.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub uuid: String,
    pub entity_type: String,
    pub entity_id: i64,
    /// Milliseconds since the Unix epoch.
    pub changed_at: i64,
    #[serde(skip)]
    pub details: Vec<HistoryDetail>,
}

/// One changed (update) or present (create) field of a [`HistoryRecord`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HistoryDetail {
    pub id: i64,
    pub history_record_id: i64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: String,
}
