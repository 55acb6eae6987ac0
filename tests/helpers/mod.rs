//! Shared fixtures for batch engine tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bill_extract::engine::pacing::PacingPolicy;
use bill_extract::engine::retry::{BackoffPolicy, NotFoundPolicy};
use bill_extract::engine::{BatchEngine, EngineSettings};
use bill_extract::models::bill::IdentifierFormat;
use bill_extract::models::job::JobInput;
use bill_extract::services::recognition::{
    Credential, RecognitionError, RecognitionRequest, Recognizer,
};
use bill_extract::services::registry::DuplicateRegistry;
use bill_extract::services::storage::ImageStore;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// One canned reply from the fake recognition service.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Well-formed JSON carrying this value.
    Number(&'static str),
    /// Raw text returned as-is.
    Raw(&'static str),
    /// HTTP error status.
    Status(u16),
    /// 429 naming a per-day quota.
    DailyQuota,
}

impl Reply {
    fn to_result(&self) -> Result<String, RecognitionError> {
        match self {
            Reply::Number(n) => Ok(format!(r#"{{"consumer_Bill_Number":"{n}"}}"#)),
            Reply::Raw(text) => Ok(text.to_string()),
            Reply::Status(status) => Err(RecognitionError::Api {
                status: *status,
                message: format!("status {status}"),
                daily_quota: false,
            }),
            Reply::DailyQuota => Err(RecognitionError::Api {
                status: 429,
                message: "Quota exceeded for GenerateRequestsPerDayPerProjectPerModel".into(),
                daily_quota: true,
            }),
        }
    }
}

/// A recorded call: (image tag, model, credential id).
pub type Call = (String, String, String);

/// Recognition fake that answers per image. Each image has a queue of
/// replies; once it runs dry the image's last reply (or the default)
/// repeats.
pub struct ScriptedRecognizer {
    scripts: Mutex<HashMap<Vec<u8>, VecDeque<Reply>>>,
    sticky: Mutex<HashMap<Vec<u8>, Reply>>,
    default: Reply,
    latency: Duration,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(default: Reply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            default,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn script(self, tag: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(png(tag), replies.into_iter().collect());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, tag: &str) -> usize {
        self.calls().iter().filter(|(t, _, _)| t == tag).count()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn recognize(&self, request: RecognitionRequest<'_>) -> Result<String, RecognitionError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let tag = String::from_utf8_lossy(request.image.get(PNG_MAGIC.len()..).unwrap_or(&[])).to_string();
        self.calls.lock().unwrap().push((
            tag,
            request.model.to_string(),
            request.credential.id().to_string(),
        ));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let reply = {
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(request.image)
                .and_then(|queue| queue.pop_front());
            let mut sticky = self.sticky.lock().unwrap();
            match next {
                Some(reply) => {
                    sticky.insert(request.image.to_vec(), reply.clone());
                    reply
                }
                None => sticky
                    .get(request.image)
                    .cloned()
                    .unwrap_or_else(|| self.default.clone()),
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        reply.to_result()
    }
}

/// PNG-looking bytes that identify an image by `tag`.
pub fn png(tag: &str) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.extend_from_slice(tag.as_bytes());
    bytes
}

/// Input named `{tag}.png` carrying `png(tag)`.
pub fn input(tag: &str) -> JobInput {
    JobInput::new(format!("{tag}.png"), png(tag), Some("image/png".into()))
}

/// Two tiers, two rounds each, no pacing and no backoff.
pub fn fast_settings(concurrency: usize) -> EngineSettings {
    EngineSettings {
        model_tiers: vec!["primary".to_string(), "fallback".to_string()],
        max_retries: 2,
        concurrency,
        pacing: PacingPolicy::unpaced(),
        backoff: BackoffPolicy::none(),
        format: IdentifierFormat::default(),
        not_found_policy: NotFoundPolicy::Retry,
    }
}

pub fn engine(
    settings: EngineSettings,
    recognizer: Arc<ScriptedRecognizer>,
    keys: usize,
    registry: Arc<dyn DuplicateRegistry>,
    store: Arc<dyn ImageStore>,
) -> BatchEngine {
    let secrets: Vec<String> = (0..keys).map(|i| format!("secret-{i}")).collect();
    BatchEngine::new(
        settings,
        recognizer,
        Credential::from_keys(&secrets),
        registry,
        store,
    )
    .expect("valid engine settings")
}
