use chrono::{DateTime, Utc};

use crate::value::Value;

/// Separator placed between tag values when building a fingerprint.
pub const FINGERPRINT_SEPARATOR: char = ',';

/// One data point as read from a source, before any type conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Destination table.
    pub table: String,
    /// Tag values, ordered as the schema declares the tag names.
    pub tags: Vec<String>,
    /// Raw field values, ordered as the schema declares the table fields.
    pub fields: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(
        table: &str,
        tags: Vec<String>,
        fields: Vec<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            table: table.to_owned(),
            tags,
            fields,
            timestamp,
        }
    }

    /// The tag used to route records of the same entity to the same worker.
    pub fn primary_tag(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or_default()
    }
}

/// The key identifying a combination of typed tag values, one per schema tag.
/// Values parsed from live records and values read back from a store produce the same key.
pub fn fingerprint(tags: &[Value]) -> String {
    let mut key = String::new();
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            key.push(FINGERPRINT_SEPARATOR);
        }
        key.push_str(&tag.to_string());
    }
    key
}
