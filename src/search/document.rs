//! Typed search hits.
//!
//! Shards return loosely shaped JSON. A hit becomes a [`Document`] only when
//! it carries a `hotitem` with a string `title` and a recognizable
//! `crawledat` timestamp; everything else on the hit is kept verbatim.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotItem {
    pub title: String,
    #[serde(
        rename = "crawledat",
        serialize_with = "serialize_time",
        deserialize_with = "deserialize_time"
    )]
    pub crawled_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub hotitem: HotItem,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    pub fn title(&self) -> &str {
        &self.hotitem.title
    }

    pub fn crawled_at(&self) -> DateTime<Utc> {
        self.hotitem.crawled_at
    }

    /// Validate one raw hit. Missing or mistyped title/timestamp yields `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut extra) = value else {
            return None;
        };
        let Value::Object(mut item) = extra.remove("hotitem")? else {
            return None;
        };
        let Value::String(title) = item.remove("title")? else {
            return None;
        };
        let crawled_at = parse_time(&item.remove("crawledat")?)?;
        Some(Self {
            hotitem: HotItem {
                title,
                crawled_at,
                extra: item,
            },
            extra,
        })
    }
}

/// Accepts RFC 3339 strings, epoch milliseconds, and `{"$date": ...}` extended JSON.
pub fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        Value::Object(map) => match map.get("$date")? {
            Value::Object(inner) => {
                let millis = inner.get("$numberLong")?.as_str()?.parse::<i64>().ok()?;
                Utc.timestamp_millis_opt(millis).single()
            }
            other => parse_time(other),
        },
        _ => None,
    }
}

fn serialize_time<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&at.to_rfc3339())
}

fn deserialize_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    parse_time(&value).ok_or_else(|| serde::de::Error::custom("unrecognized crawledat timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_rfc3339_and_keeps_extra_fields() {
        let doc = Document::from_value(json!({
            "source": "weibo",
            "hotitem": {"title": "storm", "crawledat": "2024-05-01T12:00:00Z", "rank": 3}
        }))
        .unwrap();
        assert_eq!(doc.title(), "storm");
        assert_eq!(doc.crawled_at().to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(doc.extra["source"], "weibo");
        assert_eq!(doc.hotitem.extra["rank"], 3);
    }

    #[test]
    fn parses_epoch_millis_and_extended_json() {
        let millis = json!({"hotitem": {"title": "a", "crawledat": 1714564800000_i64}});
        let extended = json!({"hotitem": {"title": "a", "crawledat": {"$date": {"$numberLong": "1714564800000"}}}});
        let extended_str = json!({"hotitem": {"title": "a", "crawledat": {"$date": "2024-05-01T12:00:00Z"}}});

        let expected = Utc.timestamp_millis_opt(1_714_564_800_000).unwrap();
        for raw in [millis, extended, extended_str] {
            assert_eq!(Document::from_value(raw).unwrap().crawled_at(), expected);
        }
    }

    #[test]
    fn rejects_missing_or_mistyped_fields() {
        for raw in [
            json!({"title": "no hotitem"}),
            json!({"hotitem": "not an object"}),
            json!({"hotitem": {"crawledat": "2024-05-01T12:00:00Z"}}),
            json!({"hotitem": {"title": 7, "crawledat": "2024-05-01T12:00:00Z"}}),
            json!({"hotitem": {"title": "t"}}),
            json!({"hotitem": {"title": "t", "crawledat": "yesterday"}}),
            json!([1, 2]),
        ] {
            assert!(Document::from_value(raw.clone()).is_none(), "{raw}");
        }
    }

    #[test]
    fn serialized_form_reads_back() {
        let doc = Document::from_value(json!({
            "hotitem": {"title": "storm", "crawledat": 1714564800000_i64}
        }))
        .unwrap();
        let encoded = serde_json::to_value(&doc).unwrap();
        assert_eq!(encoded["hotitem"]["crawledat"], "2024-05-01T12:00:00+00:00");
        let decoded: Document = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, doc);
    }
}
