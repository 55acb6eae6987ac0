use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::models::job::ImageMime;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One API key in the rotation. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: String,
    secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    /// Stable label used in logs and reports (`key-1`, `key-2`, ...).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Vec<Credential> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| Credential::new(format!("key-{}", i + 1), key.as_ref()))
            .collect()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Everything the recognition capability needs for one call.
pub struct RecognitionRequest<'a> {
    pub image: &'a [u8],
    pub mime: ImageMime,
    pub model: &'a str,
    pub credential: &'a Credential,
    pub prompt: &'a str,
    pub schema: &'a serde_json::Value,
}

/// Image bytes in, raw structured text out.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, request: RecognitionRequest<'_>) -> Result<String, RecognitionError>;
}

/// Client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl GeminiClient {
    pub fn new(timeout: Duration) -> Result<Self, RecognitionError> {
        Self::with_base_url(GEMINI_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, RecognitionError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Recognizer for GeminiClient {
    async fn recognize(&self, request: RecognitionRequest<'_>) -> Result<String, RecognitionError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);

        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    {
                        "inline_data": {
                            "mime_type": request.mime.to_string(),
                            "data": base64::engine::general_purpose::STANDARD.encode(request.image),
                        }
                    },
                    { "text": request.prompt }
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": request.schema,
            }
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", request.credential.secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RecognitionError::from_api_body(status.as_u16(), &text));
        }

        let reply: GenerateResponse = response.json().await?;
        reply_text(reply)
    }
}

/// Concatenated text of the first candidate.
fn reply_text(reply: GenerateResponse) -> Result<String, RecognitionError> {
    let candidate = reply.candidates.into_iter().next().ok_or_else(|| {
        RecognitionError::EmptyReply(match reply.prompt_feedback {
            Some(feedback) => format!("no candidates, prompt feedback: {feedback}"),
            None => "no candidates".to_string(),
        })
    })?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(RecognitionError::EmptyReply(format!(
            "candidate without text (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    Ok(text)
}

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Recognition API returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
        /// The 429 names a per-day quota rather than a per-minute rate.
        daily_quota: bool,
    },

    #[error("Recognition API returned no usable text: {0}")]
    EmptyReply(String),
}

impl RecognitionError {
    /// Build an API error from a non-2xx response body.
    pub fn from_api_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.chars().take(300).collect());
        let daily_quota = status == 429 && body.contains("PerDay");
        RecognitionError::Api {
            status,
            message,
            daily_quota,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_secret() {
        let creds = Credential::from_keys(&["AIza-secret-one", "AIza-secret-two"]);
        assert_eq!(creds[1].id(), "key-2");
        let debug = format!("{:?}", creds[0]);
        assert!(debug.contains("key-1"));
        assert!(!debug.contains("AIza"));
    }

    #[test]
    fn test_per_day_quota_detected() {
        let body = r#"{"error":{"code":429,"message":"You exceeded your current quota.","status":"RESOURCE_EXHAUSTED","details":[{"violations":[{"quotaId":"GenerateRequestsPerDayPerProjectPerModel-FreeTier"}]}]}}"#;
        match RecognitionError::from_api_body(429, body) {
            RecognitionError::Api {
                status,
                message,
                daily_quota,
            } => {
                assert_eq!(status, 429);
                assert_eq!(message, "You exceeded your current quota.");
                assert!(daily_quota);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_per_minute_rate_is_not_quota() {
        let body = r#"{"error":{"code":429,"message":"quota","details":[{"violations":[{"quotaId":"GenerateRequestsPerMinutePerProjectPerModel-FreeTier"}]}]}}"#;
        assert!(matches!(
            RecognitionError::from_api_body(429, body),
            RecognitionError::Api { daily_quota: false, .. }
        ));
    }

    #[test]
    fn test_non_json_body_is_kept() {
        match RecognitionError::from_api_body(502, "Bad Gateway") {
            RecognitionError::Api { message, .. } => assert_eq!(message, "Bad Gateway"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reply_text_joins_parts() {
        let reply: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"consumer_Bill_"},{"text":"Number\":\"110013196591\"}"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(
            reply_text(reply).unwrap(),
            r#"{"consumer_Bill_Number":"110013196591"}"#
        );
    }

    #[test]
    fn test_blocked_prompt_is_empty_reply() {
        let reply: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        match reply_text(reply) {
            Err(RecognitionError::EmptyReply(detail)) => assert!(detail.contains("SAFETY")),
            other => panic!("unexpected {other:?}"),
        }

        let reply: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#).unwrap();
        assert!(matches!(reply_text(reply), Err(RecognitionError::EmptyReply(_))));
    }
}
