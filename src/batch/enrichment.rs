//! Enrichment kinds: what a batch asks the model, and how one item's answer
//! is validated.

use serde_json::{Map, Value};

use crate::model::{CalendarEvent, ContactProfile, Interaction, WorkItem};

/// Confidence assumed when a kind's reply omits one.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// A validated per-item answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub is_relevant: bool,
    pub confidence: f64,
    /// The entry as returned, minus its `id`. Persisted in the dedup ledger.
    pub payload: Value,
}

/// One enrichment workload driven through the batch orchestrator.
pub trait Enrichment: Send + Sync + 'static {
    type Item: WorkItem;

    /// Short name used in logs, spans and metrics.
    fn kind(&self) -> &'static str;

    fn system_prompt(&self) -> &str;

    /// Human-readable list of the fields each result entry must carry.
    fn response_fields(&self) -> &str;

    /// Validate one entry of the model's reply. `Err` carries what was wrong.
    fn interpret(&self, entry: &Value) -> Result<Analysis, String>;
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn as_object(entry: &Value) -> Result<&Map<String, Value>, String> {
    entry
        .as_object()
        .ok_or_else(|| "entry is not a JSON object".to_string())
}

fn require_bool(obj: &Map<String, Value>, name: &str) -> Result<bool, String> {
    match obj.get(name) {
        Some(Value::Bool(b)) => Ok(*b),
        // Some models quote booleans.
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
        Some(_) => Err(format!("`{name}` is not a boolean")),
        None => Err(format!("missing `{name}`")),
    }
}

fn require_str<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a str, String> {
    match obj.get(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(Value::String(_)) => Err(format!("`{name}` is empty")),
        Some(_) => Err(format!("`{name}` is not a string")),
        None => Err(format!("missing `{name}`")),
    }
}

fn number_in(
    obj: &Map<String, Value>,
    name: &str,
    range: std::ops::RangeInclusive<f64>,
) -> Result<Option<f64>, String> {
    let Some(value) = obj.get(name) else {
        return Ok(None);
    };
    let n = value
        .as_f64()
        .ok_or_else(|| format!("`{name}` is not a number"))?;
    if !range.contains(&n) {
        return Err(format!(
            "`{name}` = {n} is outside {}..={}",
            range.start(),
            range.end()
        ));
    }
    Ok(Some(n))
}

fn confidence(obj: &Map<String, Value>) -> Result<Option<f64>, String> {
    number_in(obj, "confidence", 0.0..=1.0)
}

fn payload_without_id(obj: &Map<String, Value>) -> Value {
    let mut payload = obj.clone();
    payload.remove("id");
    Value::Object(payload)
}

// ---------------------------------------------------------------------------
// Calendar classification
// ---------------------------------------------------------------------------

/// Is this calendar event a client meeting worth tracking?
#[derive(Debug, Default, Clone, Copy)]
pub struct CalendarClassification;

impl Enrichment for CalendarClassification {
    type Item = CalendarEvent;

    fn kind(&self) -> &'static str {
        "calendar"
    }

    fn system_prompt(&self) -> &str {
        "You review calendar events for a relationship manager. For each event decide whether \
         it is a meeting with a client, prospect or professional contact (relevant) or an \
         internal, personal or logistical entry (not relevant). Pick a short category such as \
         \"client_meeting\", \"prospect_call\", \"internal\", \"personal\" or \"travel\"."
    }

    fn response_fields(&self) -> &str {
        "\"is_relevant\" (boolean), \"category\" (string), \"confidence\" (number 0..1), \
         optionally \"reason\" (string)"
    }

    fn interpret(&self, entry: &Value) -> Result<Analysis, String> {
        let obj = as_object(entry)?;
        let is_relevant = require_bool(obj, "is_relevant")?;
        require_str(obj, "category")?;
        let confidence = confidence(obj)?.ok_or_else(|| "missing `confidence`".to_string())?;
        Ok(Analysis {
            is_relevant,
            confidence,
            payload: payload_without_id(obj),
        })
    }
}

// ---------------------------------------------------------------------------
// Sentiment analysis
// ---------------------------------------------------------------------------

/// Tone of a single interaction with a contact.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentimentAnalysis;

impl Enrichment for SentimentAnalysis {
    type Item = Interaction;

    fn kind(&self) -> &'static str {
        "sentiment"
    }

    fn system_prompt(&self) -> &str {
        "You score the sentiment of messages exchanged with professional contacts. Score each \
         interaction from -1.0 (very negative) to 1.0 (very positive) and label it \
         \"positive\", \"neutral\" or \"negative\"."
    }

    fn response_fields(&self) -> &str {
        "\"sentiment\" (number -1..1), \"label\" (\"positive\" | \"neutral\" | \"negative\"), \
         optionally \"confidence\" (number 0..1)"
    }

    fn interpret(&self, entry: &Value) -> Result<Analysis, String> {
        let obj = as_object(entry)?;
        number_in(obj, "sentiment", -1.0..=1.0)?
            .ok_or_else(|| "missing `sentiment`".to_string())?;
        let label = require_str(obj, "label")?.to_ascii_lowercase();
        if !matches!(label.as_str(), "positive" | "neutral" | "negative") {
            return Err(format!("unknown label `{label}`"));
        }
        Ok(Analysis {
            is_relevant: label != "neutral",
            confidence: confidence(obj)?.unwrap_or(DEFAULT_CONFIDENCE),
            payload: payload_without_id(obj),
        })
    }
}

// ---------------------------------------------------------------------------
// Contact insight
// ---------------------------------------------------------------------------

/// A short relationship summary and a suggested next step for a contact.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContactInsight;

impl Enrichment for ContactInsight {
    type Item = ContactProfile;

    fn kind(&self) -> &'static str {
        "insight"
    }

    fn system_prompt(&self) -> &str {
        "You help a relationship manager keep in touch with their network. For each contact, \
         write a one or two sentence summary of the relationship and suggest one concrete next \
         action. Mark a contact not relevant only if there is nothing worth following up."
    }

    fn response_fields(&self) -> &str {
        "\"summary\" (string), \"next_action\" (string), optionally \"is_relevant\" (boolean) \
         and \"confidence\" (number 0..1)"
    }

    fn interpret(&self, entry: &Value) -> Result<Analysis, String> {
        let obj = as_object(entry)?;
        require_str(obj, "summary")?;
        require_str(obj, "next_action")?;
        let is_relevant = if obj.contains_key("is_relevant") {
            require_bool(obj, "is_relevant")?
        } else {
            true
        };
        Ok(Analysis {
            is_relevant,
            confidence: confidence(obj)?.unwrap_or(DEFAULT_CONFIDENCE),
            payload: payload_without_id(obj),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn calendar_requires_every_field() {
        let ok = CalendarClassification
            .interpret(&json!({"id": "e1", "is_relevant": true, "category": "client_meeting", "confidence": 0.9}))
            .unwrap();
        assert!(ok.is_relevant);
        assert_eq!(ok.confidence, 0.9);
        assert!(ok.payload.get("id").is_none());
        assert_eq!(ok.payload["category"], "client_meeting");

        let missing = CalendarClassification
            .interpret(&json!({"id": "e1", "is_relevant": true, "confidence": 0.9}))
            .unwrap_err();
        assert!(missing.contains("category"));

        let bad_conf = CalendarClassification
            .interpret(&json!({"id": "e1", "is_relevant": true, "category": "x", "confidence": 7}))
            .unwrap_err();
        assert!(bad_conf.contains("confidence"));
    }

    #[test]
    fn calendar_accepts_quoted_booleans() {
        let a = CalendarClassification
            .interpret(&json!({"id": "e1", "is_relevant": "False", "category": "personal", "confidence": 0.2}))
            .unwrap();
        assert!(!a.is_relevant);
    }

    #[test]
    fn neutral_sentiment_is_not_relevant() {
        let neutral = SentimentAnalysis
            .interpret(&json!({"id": "i1", "sentiment": 0.0, "label": "Neutral"}))
            .unwrap();
        assert!(!neutral.is_relevant);
        assert_eq!(neutral.confidence, DEFAULT_CONFIDENCE);

        let negative = SentimentAnalysis
            .interpret(&json!({"id": "i2", "sentiment": -0.7, "label": "negative", "confidence": 0.8}))
            .unwrap();
        assert!(negative.is_relevant);

        assert!(SentimentAnalysis
            .interpret(&json!({"id": "i3", "sentiment": 1.5, "label": "positive"}))
            .is_err());
        assert!(SentimentAnalysis
            .interpret(&json!({"id": "i4", "sentiment": 0.2, "label": "ecstatic"}))
            .is_err());
    }

    #[test]
    fn insight_defaults_to_relevant() {
        let a = ContactInsight
            .interpret(&json!({"id": "c1", "summary": "Met at a conference.", "next_action": "Send the deck."}))
            .unwrap();
        assert!(a.is_relevant);

        assert!(ContactInsight
            .interpret(&json!({"id": "c1", "summary": "", "next_action": "x"}))
            .is_err());
        assert!(ContactInsight.interpret(&json!(["not", "an", "object"])).is_err());
    }
}
