//! Wire payloads exchanged over the broker

use serde::{Deserialize, Serialize};

/// Download queue message: `{"url": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
}

/// Downstream embedding-stage event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingEvent {
    pub image_id: i64,
    pub image_url: String,
    pub image_path: String,
}

/// Parse a download request; blank URLs count as malformed.
pub fn parse_download_request(payload: &[u8]) -> Result<DownloadRequest, String> {
    let req: DownloadRequest =
        serde_json::from_slice(payload).map_err(|e| format!("invalid JSON: {e}"))?;
    if req.url.trim().is_empty() {
        return Err("empty url".to_string());
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_request_wire_format() {
        let body = serde_json::to_string(&DownloadRequest {
            url: "http://x/a.jpg".into(),
        })
        .unwrap();
        assert_eq!(body, r#"{"url":"http://x/a.jpg"}"#);
    }

    #[test]
    fn embedding_event_wire_format() {
        let event = EmbeddingEvent {
            image_id: 7,
            image_url: "http://x/a.jpg".into(),
            image_path: "/img/abc.jpg".into(),
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["image_id"], 7);
        assert_eq!(value["image_url"], "http://x/a.jpg");
        assert_eq!(value["image_path"], "/img/abc.jpg");
    }

    #[test]
    fn parse_accepts_extra_fields() {
        let req = parse_download_request(br#"{"url":"http://x/a.jpg","source":"corpus"}"#).unwrap();
        assert_eq!(req.url, "http://x/a.jpg");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse_download_request(b"not json").is_err());
        assert!(parse_download_request(br#"{"link":"http://x"}"#).is_err());
        assert!(parse_download_request(br#"{"url":42}"#).is_err());
        assert!(parse_download_request(br#"{"url":"  "}"#).is_err());
    }
}
