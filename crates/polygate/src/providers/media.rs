//! Base64 image externalization.
//!
//! Providers that want URLs instead of inline data get their messages
//! scanned for `data:image/...;base64,` fragments; each fragment is handed
//! to the external media uploader and replaced with the returned URL.
//! Uploads are cached by content hash so a retried or replayed conversation
//! never re-uploads the same image.

use crate::chat::{ChatMessage, ContentPart, MessageContent};
use crate::error::GatewayError;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Matches a full data URI up to a natural delimiter (quote, paren, space).
fn data_uri_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"data:image/[^;]+;base64,[^"\)\s>]+"#).expect("valid regex")
    })
}

#[derive(Deserialize)]
struct UploadReply {
    url: String,
}

pub struct MediaUploader {
    http: reqwest::Client,
    /// Endpoint of the external upload helper; `None` disables
    /// externalization and inline data passes through untouched.
    endpoint: Option<String>,
    uploaded: Mutex<HashMap<String, String>>,
}

impl MediaUploader {
    pub fn new(http: reqwest::Client, endpoint: Option<String>) -> Arc<Self> {
        Arc::new(MediaUploader {
            http,
            endpoint,
            uploaded: Mutex::new(HashMap::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Rewrites inline images in `messages` to uploaded URLs. A failed
    /// upload leaves the fragment in place; the provider gets to reject it.
    pub async fn externalize_messages(&self, messages: &mut [ChatMessage]) {
        if self.endpoint.is_none() {
            return;
        }
        for msg in messages.iter_mut() {
            let Some(content) = msg.content.take() else { continue };
            msg.content = Some(match content {
                MessageContent::Text(text) => self.externalize_text(text).await,
                MessageContent::Parts(parts) => {
                    let mut out = Vec::with_capacity(parts.len());
                    for part in parts {
                        out.push(self.externalize_part(part).await);
                    }
                    MessageContent::Parts(out)
                }
            });
        }
    }

    async fn externalize_part(&self, mut part: ContentPart) -> ContentPart {
        if part.kind == "image_url" {
            if let Some(image) = &part.image_url {
                if image.url.starts_with("data:image/") {
                    if let Some(url) = self.upload_data_uri(&image.url).await {
                        part = ContentPart::image(url);
                    }
                }
            }
            return part;
        }
        if let Some(text) = part.text.take() {
            part.text = Some(match self.externalize_text(text).await {
                MessageContent::Text(text) => text,
                // A text part that contained an image splits into prose +
                // URL reference.
                MessageContent::Parts(parts) => parts
                    .iter()
                    .filter_map(|p| {
                        p.text
                            .clone()
                            .or_else(|| p.image_url.as_ref().map(|i| i.url.clone()))
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            });
        }
        part
    }

    async fn externalize_text(&self, text: String) -> MessageContent {
        if !data_uri_pattern().is_match(&text) {
            return MessageContent::Text(text);
        }

        let mut parts: Vec<ContentPart> = Vec::new();
        let mut cursor = 0usize;
        let spans: Vec<(usize, usize, String)> = data_uri_pattern()
            .find_iter(&text)
            .map(|m| (m.start(), m.end(), m.as_str().to_string()))
            .collect();

        for (start, end, uri) in spans {
            let prefix = text[cursor..start].trim();
            if !prefix.is_empty() {
                parts.push(ContentPart::text(prefix));
            }
            match self.upload_data_uri(&uri).await {
                Some(url) => parts.push(ContentPart::image(url)),
                None => parts.push(ContentPart::text(uri)),
            }
            cursor = end;
        }
        let suffix = text[cursor..].trim();
        if !suffix.is_empty() {
            parts.push(ContentPart::text(suffix));
        }
        MessageContent::Parts(parts)
    }

    async fn upload_data_uri(&self, uri: &str) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?;
        let (header, data) = uri.split_once(',')?;
        let mime = header.strip_prefix("data:")?.split(';').next()?.to_string();

        let hash = hex::encode(Sha256::digest(data.as_bytes()));
        if let Some(url) = self.uploaded.lock().get(&hash) {
            debug!(hash = %hash, "media upload cache hit");
            return Some(url.clone());
        }

        let result = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({
                "content_type": mime,
                "data": data,
            }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        let reply = match result {
            Ok(resp) => resp.json::<UploadReply>().await,
            Err(e) => {
                warn!(error = %e, "media upload failed, leaving inline data");
                return None;
            }
        };
        match reply {
            Ok(reply) => {
                self.uploaded.lock().insert(hash, reply.url.clone());
                Some(reply.url)
            }
            Err(e) => {
                warn!(error = %e, "media upload reply malformed");
                None
            }
        }
    }
}

/// Splits a data URI into `(mime_type, base64_payload)`.
pub fn split_data_uri(uri: &str) -> Result<(String, String), GatewayError> {
    let (header, data) = uri
        .split_once(',')
        .ok_or_else(|| GatewayError::ParseError("malformed data URI".into()))?;
    let mime = header
        .strip_prefix("data:")
        .and_then(|h| h.split(';').next())
        .ok_or_else(|| GatewayError::ParseError("malformed data URI header".into()))?;
    Ok((mime.to_string(), data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_pattern_stops_at_delimiters() {
        let text = r#"see (data:image/png;base64,AAAA) and "data:image/jpeg;base64,BBBB" here"#;
        let found: Vec<&str> = data_uri_pattern().find_iter(text).map(|m| m.as_str()).collect();
        assert_eq!(
            found,
            vec!["data:image/png;base64,AAAA", "data:image/jpeg;base64,BBBB"]
        );
    }

    #[test]
    fn split_data_uri_extracts_mime() {
        let (mime, data) = split_data_uri("data:image/png;base64,AAAA").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "AAAA");
        assert!(split_data_uri("not-a-uri").is_err());
    }

    #[tokio::test]
    async fn disabled_uploader_passes_messages_through() {
        let uploader = MediaUploader::new(reqwest::Client::new(), None);
        let mut messages = vec![ChatMessage::user("data:image/png;base64,AAAA")];
        uploader.externalize_messages(&mut messages).await;
        assert_eq!(
            messages[0].content.as_ref().unwrap().as_text(),
            "data:image/png;base64,AAAA"
        );
    }
}
