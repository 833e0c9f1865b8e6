//! Subscription import from a Google Takeout history dump.

use std::collections::HashSet;

use serde_json::Value;

use crate::models::Channel;

/// Unique channels referenced by the dump, in first-seen order.
///
/// An item counts only when `snippet.channelId` and `snippet.channelTitle`
/// are both non-empty strings; everything else is ignored.
pub fn extract_channels(items: &[Value]) -> Vec<Channel> {
    let mut seen = HashSet::new();
    let mut channels = Vec::new();

    for item in items {
        let Some(snippet) = item.get("snippet") else {
            continue;
        };
        let channel_id = snippet.get("channelId").and_then(Value::as_str);
        let title = snippet.get("channelTitle").and_then(Value::as_str);
        let (Some(channel_id), Some(title)) = (channel_id, title) else {
            continue;
        };
        if channel_id.is_empty() || title.is_empty() {
            continue;
        }
        if seen.insert(channel_id.to_string()) {
            channels.push(Channel {
                name: title.to_string(),
                ..Channel::from_id(channel_id)
            });
        }
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_occurrence_wins_and_order_is_kept() {
        let items = vec![
            json!({"snippet": {"channelId": "UC2", "channelTitle": "Second"}}),
            json!({"snippet": {"channelId": "UC1", "channelTitle": "First"}}),
            json!({"snippet": {"channelId": "UC2", "channelTitle": "Renamed"}}),
        ];
        let channels = extract_channels(&items);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].channel_id, "UC2");
        assert_eq!(channels[0].name, "Second");
        assert_eq!(channels[0].url, "https://www.youtube.com/channel/UC2");
        assert_eq!(channels[1].channel_id, "UC1");
    }

    #[test]
    fn incomplete_items_are_skipped() {
        let items = vec![
            json!({"title": "no snippet"}),
            json!({"snippet": {"channelId": "UC1"}}),
            json!({"snippet": {"channelTitle": "No id"}}),
            json!({"snippet": {"channelId": "", "channelTitle": "Empty"}}),
            json!({"snippet": {"channelId": 42, "channelTitle": "Numeric"}}),
            json!("just a string"),
            json!({"snippet": {"channelId": "UC9", "channelTitle": "Kept"}}),
        ];
        let channels = extract_channels(&items);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "Kept");
    }

    #[test]
    fn empty_dump_yields_nothing() {
        assert!(extract_channels(&[]).is_empty());
    }
}
