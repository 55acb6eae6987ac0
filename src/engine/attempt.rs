use garde::Validate;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use strum::{AsRefStr, Display};

use crate::models::bill::{
    BillNumberReply, ExtractedIdentifier, IdentifierFormat, BILL_NUMBER_FIELD, NOT_FOUND_SENTINEL,
};
use crate::models::job::Job;
use crate::services::recognition::{Credential, RecognitionError, RecognitionRequest, Recognizer};

/// Raw replies are truncated to this many characters in failure reasons.
const RAW_EXCERPT_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum RetryableKind {
    /// Rate limited, overloaded, unavailable or timed out.
    Transient,
    MalformedOutput,
    /// The field is present but fails the format predicate.
    InvalidValue,
    /// The model explicitly reported that no bill number is visible.
    NotFound,
}

/// Which call produced an extracted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub model: String,
    pub credential: String,
    /// 1-based ordinal across every attempt made for the job.
    pub attempt: u32,
}

/// Classification of a single recognition call.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success {
        identifier: ExtractedIdentifier,
        provenance: Provenance,
    },
    Retryable {
        kind: RetryableKind,
        detail: String,
    },
    /// Not worth repeating with this (model, credential) pair.
    Permanent { detail: String },
    /// The account behind the credential is out of quota.
    FatalBatch { detail: String },
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::Retryable {
                kind: RetryableKind::Transient,
                ..
            } => "transient",
            AttemptOutcome::Retryable { .. } => "retryable",
            AttemptOutcome::Permanent { .. } => "permanent",
            AttemptOutcome::FatalBatch { .. } => "fatal_batch",
        }
    }

    /// Human-readable reason for anything but success.
    pub fn reason(&self) -> Option<String> {
        match self {
            AttemptOutcome::Success { .. } => None,
            AttemptOutcome::Retryable { kind, detail } => Some(format!("{kind}: {detail}")),
            AttemptOutcome::Permanent { detail } => Some(format!("permanent: {detail}")),
            AttemptOutcome::FatalBatch { detail } => Some(format!("quota_exhausted: {detail}")),
        }
    }
}

/// Immutable log entry for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub ordinal: u32,
    pub model: String,
    pub credential: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AttemptRecord {
    pub fn new(ordinal: u32, model: &str, credential: &Credential, outcome: &AttemptOutcome) -> Self {
        let value = match outcome {
            AttemptOutcome::Success { identifier, .. } => Some(identifier.to_string()),
            _ => None,
        };
        Self {
            ordinal,
            model: model.to_string(),
            credential: credential.id().to_string(),
            outcome: outcome.label(),
            value,
            detail: outcome.reason(),
        }
    }
}

/// Instruction sent with every image.
pub fn extraction_prompt(format: &IdentifierFormat) -> String {
    format!(
        "You are an expert OCR and data extraction system. Your sole task is to find and \
         extract the primary Consumer Bill Number from this electricity bill image. The \
         consumer number has exactly {digits} digits. If no consumer number is visible, set \
         {field} to \"{not_found}\". You must return only the JSON object defined by the schema.",
        digits = format.digits,
        field = BILL_NUMBER_FIELD,
        not_found = NOT_FOUND_SENTINEL,
    )
}

/// Output schema demanding the single bill number field.
pub fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "OBJECT",
        "properties": {
            BILL_NUMBER_FIELD: {
                "type": "STRING",
                "description": "The unique consumer account number extracted from the electricity bill image."
            }
        },
        "required": [BILL_NUMBER_FIELD]
    })
}

/// Performs one recognition call and classifies what came back.
pub struct AttemptExecutor {
    recognizer: Arc<dyn Recognizer>,
    format: IdentifierFormat,
    prompt: String,
    schema: serde_json::Value,
}

impl AttemptExecutor {
    pub fn new(recognizer: Arc<dyn Recognizer>, format: IdentifierFormat) -> Self {
        Self {
            recognizer,
            format,
            prompt: extraction_prompt(&format),
            schema: response_schema(),
        }
    }

    pub async fn attempt(
        &self,
        job: &Job,
        model: &str,
        credential: &Credential,
        ordinal: u32,
    ) -> AttemptOutcome {
        let Some(mime) = job.mime else {
            return AttemptOutcome::Permanent {
                detail: "unsupported image type".to_string(),
            };
        };

        let request = RecognitionRequest {
            image: &job.bytes,
            mime,
            model,
            credential,
            prompt: &self.prompt,
            schema: &self.schema,
        };

        let start = Instant::now();
        let result = self.recognizer.recognize(request).await;
        metrics::histogram!("bill_extract_recognition_seconds").record(start.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(text) => self.interpret(&text, model, credential, ordinal),
            Err(e) => classify_error(&e),
        };

        metrics::counter!("bill_extract_attempts_total", "outcome" => outcome.label()).increment(1);
        tracing::debug!(
            job = %job.name,
            model,
            credential = credential.id(),
            attempt = ordinal,
            outcome = outcome.label(),
            "Recognition attempt finished"
        );

        outcome
    }

    /// Validate a raw reply against the schema and the format predicate.
    pub fn interpret(
        &self,
        text: &str,
        model: &str,
        credential: &Credential,
        ordinal: u32,
    ) -> AttemptOutcome {
        let body = strip_code_fence(text);
        let reply: BillNumberReply = match serde_json::from_str(body) {
            Ok(reply) => reply,
            Err(e) => {
                return AttemptOutcome::Retryable {
                    kind: RetryableKind::MalformedOutput,
                    detail: format!("{e} (raw: {})", excerpt(body)),
                }
            }
        };

        if reply.is_not_found() {
            return AttemptOutcome::Retryable {
                kind: RetryableKind::NotFound,
                detail: "model reported no consumer number".to_string(),
            };
        }

        if let Err(report) = reply.validate_with(&self.format) {
            return AttemptOutcome::Retryable {
                kind: RetryableKind::InvalidValue,
                detail: report.to_string().trim().to_string(),
            };
        }

        match ExtractedIdentifier::parse(&reply.consumer_bill_number, &self.format) {
            Some(identifier) => AttemptOutcome::Success {
                identifier,
                provenance: Provenance {
                    model: model.to_string(),
                    credential: credential.id().to_string(),
                    attempt: ordinal,
                },
            },
            None => AttemptOutcome::Retryable {
                kind: RetryableKind::InvalidValue,
                detail: format!("rejected value {:?}", reply.consumer_bill_number),
            },
        }
    }
}

/// Map a failed call onto the outcome taxonomy.
pub fn classify_error(error: &RecognitionError) -> AttemptOutcome {
    match error {
        RecognitionError::Api {
            status: 429,
            message,
            daily_quota: true,
        } => AttemptOutcome::FatalBatch {
            detail: message.clone(),
        },
        RecognitionError::Api {
            status: 429 | 500 | 503 | 504,
            ..
        } => AttemptOutcome::Retryable {
            kind: RetryableKind::Transient,
            detail: error.to_string(),
        },
        RecognitionError::Api { .. } => AttemptOutcome::Permanent {
            detail: error.to_string(),
        },
        RecognitionError::Http(e) if e.is_timeout() || e.is_connect() => AttemptOutcome::Retryable {
            kind: RetryableKind::Transient,
            detail: error.to_string(),
        },
        RecognitionError::Http(e) if e.is_decode() => AttemptOutcome::Retryable {
            kind: RetryableKind::MalformedOutput,
            detail: error.to_string(),
        },
        RecognitionError::Http(_) => AttemptOutcome::Permanent {
            detail: error.to_string(),
        },
        RecognitionError::EmptyReply(_) => AttemptOutcome::Retryable {
            kind: RetryableKind::MalformedOutput,
            detail: error.to_string(),
        },
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(RAW_EXCERPT_CHARS).collect();
    if text.chars().count() > RAW_EXCERPT_CHARS {
        out.push('…');
    }
    out
}
