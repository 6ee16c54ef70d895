//! Request construction: one prompt covering every item in a batch.

use serde_json::json;

use crate::llm::Message;
use crate::model::WorkItem;

/// Build the messages for one batch.
///
/// The system message carries the enrichment's instructions and the reply
/// schema; the user message carries the items and any shared context.
pub fn build_messages<T: WorkItem>(
    system_prompt: &str,
    response_fields: &str,
    items: &[T],
    auxiliary_context: Option<&str>,
) -> Vec<Message> {
    let system = format!(
        "{system_prompt}\n\n\
         Reply with a JSON object of the form {{\"results\": [...]}} containing exactly one \
         entry per input item. Every entry must include the item's \"id\" exactly as given, \
         plus: {response_fields}."
    );

    let payload = json!({
        "items": items.iter().map(WorkItem::to_prompt_json).collect::<Vec<_>>(),
    });
    let mut user = String::new();
    if let Some(context) = auxiliary_context.filter(|c| !c.trim().is_empty()) {
        user.push_str("Context:\n");
        user.push_str(context.trim());
        user.push_str("\n\n");
    }
    user.push_str(&format!("Items ({}):\n{payload}", items.len()));

    vec![Message::system(system), Message::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::model::Interaction;
    use chrono::{TimeZone, Utc};

    fn interaction(id: &str) -> Interaction {
        Interaction {
            id: id.to_string(),
            contact_id: "c-1".to_string(),
            channel: "email".to_string(),
            text: "Thanks for the intro!".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap(),
        }
    }

    #[test]
    fn every_item_id_appears_in_the_prompt() {
        let items = vec![interaction("i-1"), interaction("i-2")];
        let messages = build_messages("Score sentiment.", "\"sentiment\"", &items, Some("VIP client"));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("\"results\""));
        let user = &messages[1].content;
        assert!(user.starts_with("Context:\nVIP client"));
        assert!(user.contains("\"i-1\"") && user.contains("\"i-2\""));
        assert!(user.contains("Items (2)"));
    }

    #[test]
    fn blank_context_is_omitted() {
        let messages = build_messages("x", "y", &[interaction("i-1")], Some("  "));
        assert!(!messages[1].content.contains("Context:"));
    }
}
