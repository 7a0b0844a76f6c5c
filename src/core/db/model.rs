use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use crate::core::store::{Cents, MediaType};

/// Kind of remote media resource; selects the endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Receipt,
    Invoice,
    Photo,
    Video,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Receipt => "receipt",
            ResourceType::Invoice => "invoice",
            ResourceType::Photo => "photo",
            ResourceType::Video => "video",
        }
    }

    /// Lenient decode for values read back from the queue database.
    pub(crate) fn decode(value: &str) -> Self {
        match value {
            "receipt" => ResourceType::Receipt,
            "invoice" => ResourceType::Invoice,
            "photo" => ResourceType::Photo,
            "video" => ResourceType::Video,
            other => {
                warn!(value = other, "unknown resource type in queue, assuming photo");
                ResourceType::Photo
            }
        }
    }
}

pub(crate) fn decode_media_type(value: &str) -> MediaType {
    match value {
        "video" => MediaType::Video,
        "photo" => MediaType::Photo,
        other => {
            warn!(value = other, "unknown media type in queue, assuming photo");
            MediaType::Photo
        }
    }
}

pub(crate) fn format_timestamp(ts: OffsetDateTime) -> anyhow::Result<String> {
    Ok(ts.format(&Rfc3339)?)
}

/// Unparseable timestamps fall back to the Unix epoch rather than failing
/// the whole row.
pub(crate) fn decode_timestamp(value: &str) -> OffsetDateTime {
    OffsetDateTime::parse(value, &Rfc3339).unwrap_or_else(|e| {
        warn!(value, error = %e, "invalid timestamp in queue");
        OffsetDateTime::UNIX_EPOCH
    })
}

/// Accepts integers, floats (rounded) and numeric strings; anything else is
/// zero.
pub(crate) fn lenient_cents(value: &serde_json::Value) -> Cents {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

/// Decode a JSON array of strings, defaulting to empty.
pub(crate) fn lenient_string_list(text: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<serde_json::Value>>(text) {
        Ok(values) => values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Err(e) => {
            warn!(error = %e, "malformed id list in queue, treating as empty");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cents_decode_is_lenient() {
        assert_eq!(lenient_cents(&json!(1250)), 1250);
        assert_eq!(lenient_cents(&json!(99.6)), 100);
        assert_eq!(lenient_cents(&json!(" 42 ")), 42);
        assert_eq!(lenient_cents(&json!("12.4")), 12);
        assert_eq!(lenient_cents(&json!("abc")), 0);
        assert_eq!(lenient_cents(&json!(null)), 0);
        assert_eq!(lenient_cents(&json!({"amount": 3})), 0);
    }

    #[test]
    fn string_lists_default_to_empty() {
        assert_eq!(lenient_string_list(r#"["a","b"]"#), vec!["a", "b"]);
        assert_eq!(lenient_string_list(r#"["a",3]"#), vec!["a"]);
        assert!(lenient_string_list("not json").is_empty());
    }

    #[test]
    fn bad_timestamps_fall_back_to_epoch() {
        assert_eq!(decode_timestamp("yesterday"), OffsetDateTime::UNIX_EPOCH);
        let ts = decode_timestamp("2026-03-01T10:00:00Z");
        assert_eq!(ts.year(), 2026);
    }
}
