//! Item extraction port.
//!
//! Extraction is a pure parsing step between the dispatcher's raw payload
//! and the engine's accumulation loop. The default implementation handles
//! the normalized JSON shape the capture subsystem and direct transport
//! both emit; platform-specific extractors plug in behind the trait.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{CrawlError, CrawlResult};
use crate::models::{FeedItem, Page};

/// Turns a raw upstream payload into items plus the next cursor.
pub trait ItemExtractor: Send + Sync {
    fn extract(&self, raw: &Value) -> CrawlResult<Page>;
}

/// Extractor for the normalized payload shape:
/// `{"items": [{"id": ..., "author"?, "created_at"?, ...}], "next_cursor"?}`.
///
/// `created_at` may be an epoch number or an RFC 3339 string.
#[derive(Debug, Default)]
pub struct JsonItemExtractor;

fn parse_created_at(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

impl ItemExtractor for JsonItemExtractor {
    fn extract(&self, raw: &Value) -> CrawlResult<Page> {
        let obj = raw
            .as_object()
            .ok_or_else(|| CrawlError::DataExtraction("payload is not an object".into()))?;

        let raw_items = obj
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| CrawlError::DataExtraction("missing items array".into()))?;

        let mut items = Vec::with_capacity(raw_items.len());
        for entry in raw_items {
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| CrawlError::DataExtraction("item without id".into()))?;

            items.push(FeedItem {
                id: id.to_string(),
                author: entry
                    .get("author")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                created_at: entry.get("created_at").and_then(parse_created_at),
                data: entry.clone(),
            });
        }

        let next_cursor = obj
            .get("next_cursor")
            .or_else(|| obj.get("cursor"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Page { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_items_and_cursor() {
        let payload = json!({
            "items": [
                {"id": "a1", "author": "alice", "created_at": 1700000000},
                {"id": "a2", "created_at": "2024-03-05T12:00:00Z"},
            ],
            "next_cursor": "page-2",
        });

        let page = JsonItemExtractor.extract(&payload).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].author.as_deref(), Some("alice"));
        assert!(page.items[0].created_at.is_some());
        assert!(page.items[1].created_at.is_some());
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn empty_cursor_string_means_no_cursor() {
        let payload = json!({"items": [], "next_cursor": ""});
        let page = JsonItemExtractor.extract(&payload).unwrap();
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn missing_items_is_an_extraction_error() {
        let payload = json!({"next_cursor": "x"});
        let err = JsonItemExtractor.extract(&payload).unwrap_err();
        assert!(matches!(err, CrawlError::DataExtraction(_)));
    }

    #[test]
    fn item_without_id_is_rejected() {
        let payload = json!({"items": [{"author": "ghost"}]});
        assert!(JsonItemExtractor.extract(&payload).is_err());
    }
}
