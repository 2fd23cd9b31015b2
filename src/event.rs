//! Object-created notifications and the handler response.
//!
//! A notification carries one or more records:
//!
//! ```json
//! { "Records": [ {
//!     "eventSource": "aws:s3",
//!     "s3": {
//!       "bucket": { "name": "b1" },
//!       "object": { "key": "reports/q3+report.pdf", "versionId": "3HL4kq" }
//!     }
//! } ] }
//! ```
//!
//! Keys arrive form-URL-encoded (`+` for space, `%XX` escapes) and are decoded
//! before use. Records from other event sources are ignored.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::DocumentEvent;

pub const S3_EVENT_SOURCE: &str = "aws:s3";

#[derive(Debug, Deserialize)]
pub struct Notification {
    #[serde(rename = "Records")]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "eventSource", default)]
    pub event_source: String,
    pub s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct S3Object {
    pub key: String,
    #[serde(rename = "versionId", default)]
    pub version_id: Option<String>,
}

/// Parse a notification document into the events it names, in order.
pub fn parse_notification(json: &str) -> Result<Vec<DocumentEvent>> {
    let notification: Notification =
        serde_json::from_str(json).context("Failed to parse notification")?;

    let mut events = Vec::new();
    for (i, record) in notification.records.into_iter().enumerate() {
        if record.event_source != S3_EVENT_SOURCE {
            tracing::debug!(index = i, source = %record.event_source, "ignoring record");
            continue;
        }
        let Some(s3) = record.s3 else {
            bail!("record {} has eventSource {} but no s3 entity", i, S3_EVENT_SOURCE);
        };
        let key = decode_key(&s3.object.key)
            .with_context(|| format!("record {} has a malformed object key", i))?;
        let version = s3.object.version_id.filter(|v| !v.is_empty() && v != "null");
        events.push(DocumentEvent::new(s3.bucket.name, key, version));
    }
    Ok(events)
}

/// Decode a form-URL-encoded object key: `+` is a space, `%XX` a byte.
pub fn decode_key(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).context("decoded key is not UTF-8")
}

/// Outcome of one record, as reported to the invoker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordResult {
    Processed {
        document_id: String,
        bucket: String,
        key: String,
        status: String,
        text_length: usize,
        summary_length: usize,
    },
    Error {
        bucket: String,
        key: String,
        status: String,
        error: String,
        error_kind: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Processed {
        message: String,
        results: Vec<RecordResult>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: ResponseBody,
}

impl HandlerResponse {
    pub fn processed(results: Vec<RecordResult>) -> Self {
        Self {
            status_code: 200,
            body: ResponseBody::Processed {
                message: "Documents processed successfully".to_string(),
                results,
            },
        }
    }

    pub fn error(err: &anyhow::Error) -> Self {
        Self {
            status_code: 500,
            body: ResponseBody::Error {
                error: format!("{:#}", err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plus_and_percent_escapes() {
        assert_eq!(decode_key("q3+report.pdf").unwrap(), "q3 report.pdf");
        assert_eq!(decode_key("a%2Fb%20c").unwrap(), "a/b c");
        assert_eq!(decode_key("caf%C3%A9.txt").unwrap(), "café.txt");
        assert_eq!(decode_key("100%").unwrap(), "100%");
        assert_eq!(decode_key("a%2Bb").unwrap(), "a+b");
    }

    #[test]
    fn parses_s3_records_and_skips_others() {
        let json = r#"{
            "Records": [
                { "eventSource": "aws:s3",
                  "s3": { "bucket": { "name": "b1" },
                          "object": { "key": "reports/q3+report.pdf", "versionId": "v7" } } },
                { "eventSource": "aws:sqs", "body": "ignored" },
                { "eventSource": "aws:s3",
                  "s3": { "bucket": { "name": "b1" }, "object": { "key": "notes.txt" } } }
            ]
        }"#;
        let events = parse_notification(json).unwrap();
        assert_eq!(
            events,
            vec![
                DocumentEvent::new("b1", "reports/q3 report.pdf", Some("v7".to_string())),
                DocumentEvent::new("b1", "notes.txt", None),
            ]
        );
    }

    #[test]
    fn rejects_document_without_records() {
        assert!(parse_notification(r#"{"foo": 1}"#).is_err());
        assert!(parse_notification("not json").is_err());
    }

    #[test]
    fn response_serializes_in_handler_shape() {
        let resp = HandlerResponse::processed(vec![
            RecordResult::Processed {
                document_id: "d".into(),
                bucket: "b".into(),
                key: "k".into(),
                status: "succeeded".into(),
                text_length: 10,
                summary_length: 3,
            },
            RecordResult::Error {
                bucket: "b".into(),
                key: "gone".into(),
                status: "error".into(),
                error: "object s3://b/gone not found".into(),
                error_kind: "not_found".into(),
            },
        ]);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status_code"], 200);
        assert_eq!(json["body"]["message"], "Documents processed successfully");
        assert_eq!(json["body"]["results"][0]["text_length"], 10);
        assert_eq!(json["body"]["results"][1]["error_kind"], "not_found");

        let err = HandlerResponse::error(&anyhow::anyhow!("bad input"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status_code"], 500);
        assert_eq!(json["body"]["error"], "bad input");
    }
}
