//! Core data model.
//!
//! A work item is one unit of enrichment (a calendar event to classify, an
//! interaction to score, a contact to summarise). It has a stable id and a
//! content hash; the pair decides whether the work was already done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Something the batch orchestrator can send to a model.
pub trait WorkItem: Clone + Send + Sync + 'static {
    /// Stable identifier, unique within its item kind.
    fn item_id(&self) -> &str;

    /// Digest over the fields that define "same work".
    fn content_hash(&self) -> ContentHash;

    /// How the item is presented to the model. Must carry `id`.
    fn to_prompt_json(&self) -> serde_json::Value;
}

/// Hex SHA-256 over canonicalised item fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn builder() -> ContentHasher {
        ContentHasher {
            hasher: Sha256::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 12 hex chars
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Incremental builder for [`ContentHash`].
///
/// Every field is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub struct ContentHasher {
    hasher: Sha256,
}

impl ContentHasher {
    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.write(name);
        self.write(value);
        self
    }

    pub fn optional(self, name: &str, value: Option<&str>) -> Self {
        self.field(name, value.unwrap_or(""))
    }

    /// Unordered collection: trimmed, case-folded, sorted, de-duplicated.
    pub fn set<'a>(mut self, name: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut normalized: Vec<String> = values
            .into_iter()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();

        self.write(name);
        self.hasher.update((normalized.len() as u64).to_le_bytes());
        for value in &normalized {
            self.write(value);
        }
        self
    }

    /// Ordered collection: position matters.
    pub fn list<'a>(mut self, name: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        let values: Vec<&str> = values.into_iter().collect();
        self.write(name);
        self.hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            self.write(value);
        }
        self
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(format!("{:x}", self.hasher.finalize()))
    }

    fn write(&mut self, value: &str) {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
    }
}

/// A calendar event to classify as client-relevant or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl WorkItem for CalendarEvent {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn content_hash(&self) -> ContentHash {
        ContentHash::builder()
            .field("summary", self.summary.trim())
            .field("start", &self.start.to_rfc3339())
            .field("end", &self.end.to_rfc3339())
            .set("attendees", self.attendees.iter().map(String::as_str))
            .optional("location", self.location.as_deref().map(str::trim))
            .finish()
    }

    fn to_prompt_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "summary": self.summary,
            "description": self.description,
            "start": self.start.to_rfc3339(),
            "end": self.end.to_rfc3339(),
            "attendees": self.attendees,
            "location": self.location,
        })
    }
}

/// A message, call note or email exchanged with a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub contact_id: String,
    pub channel: String,
    pub text: String,
    pub occurred_at: DateTime<Utc>,
}

impl WorkItem for Interaction {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn content_hash(&self) -> ContentHash {
        ContentHash::builder()
            .field("contact_id", &self.contact_id)
            .field("channel", &self.channel.to_lowercase())
            .field("text", self.text.trim())
            .field("occurred_at", &self.occurred_at.to_rfc3339())
            .finish()
    }

    fn to_prompt_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "contact_id": self.contact_id,
            "channel": self.channel,
            "text": self.text,
            "occurred_at": self.occurred_at.to_rfc3339(),
        })
    }
}

/// A contact with enough history to generate an insight about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Most recent first.
    #[serde(default)]
    pub recent_interactions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkItem for ContactProfile {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn content_hash(&self) -> ContentHash {
        ContentHash::builder()
            .field("name", self.name.trim())
            .optional("company", self.company.as_deref())
            .optional("notes", self.notes.as_deref())
            .list(
                "recent_interactions",
                self.recent_interactions.iter().map(String::as_str),
            )
            .set("tags", self.tags.iter().map(String::as_str))
            .finish()
    }

    fn to_prompt_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "company": self.company,
            "notes": self.notes,
            "recent_interactions": self.recent_interactions,
            "tags": self.tags,
        })
    }
}

// ---------------------------------------------------------------------------
// Dedup ledger
// ---------------------------------------------------------------------------

/// Outcome of processing one item, keyed by `item_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub item_id: String,
    pub content_hash: ContentHash,
    pub processed_at: DateTime<Utc>,
    pub is_relevant: bool,
    pub analysis: serde_json::Value,
    pub model_used: String,
}

// ---------------------------------------------------------------------------
// Models and routing
// ---------------------------------------------------------------------------

/// Cost tier of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Low-cost or free-tier quota. The lowest tier; nothing to fall back to.
    Free,
    Premium,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelTier::Free => "free",
            ModelTier::Premium => "premium",
        };
        write!(f, "{s}")
    }
}

/// Which model to use for a workload, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRecommendation {
    pub model_id: String,
    pub tier: ModelTier,
    pub reasoning: String,
}

/// How one invocation should cope with rate limits. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStrategy {
    pub primary_model: String,
    pub fallback_model: Option<String>,
    pub max_wait: Duration,
    pub enable_backoff: bool,
}

impl RateLimitStrategy {
    pub fn new(primary_model: impl Into<String>) -> Self {
        Self {
            primary_model: primary_model.into(),
            fallback_model: None,
            max_wait: Duration::from_secs(60),
            enable_backoff: true,
        }
    }

    pub fn fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn backoff(mut self, enabled: bool) -> Self {
        self.enable_backoff = enabled;
        self
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Admission priority for queued operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Dequeue order, highest first.
    pub const ORDER: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(attendees: &[&str]) -> CalendarEvent {
        CalendarEvent {
            id: "evt-1".to_string(),
            summary: "Quarterly review".to_string(),
            description: None,
            start: Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 2, 16, 0, 0).unwrap(),
            attendees: attendees.iter().map(|a| a.to_string()).collect(),
            location: Some("Zoom".to_string()),
        }
    }

    #[test]
    fn attendee_order_does_not_change_hash() {
        let a = event(&["ana@example.com", "bo@example.com", "cy@example.com"]);
        let b = event(&["cy@example.com", "ana@example.com", "bo@example.com"]);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn attendee_case_and_duplicates_are_normalized() {
        let a = event(&["Ana@Example.com", "bo@example.com"]);
        let b = event(&["bo@example.com", "ana@example.com", "ana@example.com "]);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn semantic_change_changes_hash() {
        let a = event(&["ana@example.com"]);
        let mut b = a.clone();
        b.location = Some("Office".to_string());
        assert_ne!(a.content_hash(), b.content_hash());

        let mut c = a.clone();
        c.end = c.end + chrono::Duration::minutes(30);
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn description_is_not_part_of_identity() {
        let a = event(&[]);
        let mut b = a.clone();
        b.description = Some("agenda attached".to_string());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = ContentHash::builder().field("x", "ab").field("y", "c").finish();
        let b = ContentHash::builder().field("x", "a").field("y", "bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn interaction_history_order_matters_for_contacts() {
        let base = ContactProfile {
            id: "c-1".to_string(),
            name: "Dana".to_string(),
            company: None,
            notes: None,
            recent_interactions: vec!["called".to_string(), "emailed".to_string()],
            tags: vec!["vip".to_string(), "golf".to_string()],
        };
        let mut reordered = base.clone();
        reordered.recent_interactions.reverse();
        assert_ne!(base.content_hash(), reordered.content_hash());

        let mut retagged = base.clone();
        retagged.tags.reverse();
        assert_eq!(base.content_hash(), retagged.content_hash());
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
