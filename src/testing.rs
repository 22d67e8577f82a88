//! Fakes shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Config;
use crate::llm::{CompletionRequest, LanguageModel, LlmError, Message};
use crate::signalwire::{SmsError, SmsGateway};
use crate::store::memory::MemoryStore;
use crate::AppState;

type Handler = dyn Fn(&CompletionRequest) -> Result<Message, LlmError> + Send + Sync;

/// Language model whose replies come from a closure.
pub struct ScriptedModel {
    handler: Box<Handler>,
    embedding: Option<Vec<f32>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(
        handler: impl Fn(&CompletionRequest) -> Result<Message, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            embedding: Some(vec![1.0, 0.0, 0.0]),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| Ok(Message::assistant(text.clone())))
    }

    pub fn failing() -> Self {
        let mut model = Self::new(|_| Err(LlmError::Api("503: unavailable".into())));
        model.embedding = None;
        model
    }

    /// Picks the reply by the first `(needle, reply)` whose needle occurs in
    /// the system prompt. Falls back to `default`.
    pub fn routed(routes: Vec<(&'static str, &'static str)>, default: &'static str) -> Self {
        Self::new(move |req| {
            let system = req
                .messages
                .iter()
                .find(|m| m.role == crate::llm::Role::System)
                .map(|m| m.text().to_string())
                .unwrap_or_default();
            let reply = routes
                .iter()
                .find(|(needle, _)| system.contains(needle))
                .map(|(_, reply)| *reply)
                .unwrap_or(default);
            Ok(Message::assistant(reply))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Message, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = (self.handler)(&request);
        self.requests.lock().unwrap().push(request);
        reply
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
        self.embedding.clone().ok_or(LlmError::Empty)
    }
}

/// SMS gateway that records every message instead of sending it.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingGateway {
    /// `(from, to, body)` in send order.
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsGateway for RecordingGateway {
    async fn send_message(&self, from: &str, to: &str, body: &str) -> Result<String, SmsError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((from.to_string(), to.to_string(), body.to_string()));
        Ok(format!("SM{}", sent.len()))
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub llm: Arc<ScriptedModel>,
    pub sms: Arc<RecordingGateway>,
}

/// App state over a memory store, a scripted model and a recording gateway.
/// Vendor clients point at `vendor_url` (usually a mockito server).
pub fn harness(llm: ScriptedModel, vendor_url: &str) -> Harness {
    harness_with_config(Config::default(), llm, vendor_url)
}

pub fn harness_with_config(config: Config, llm: ScriptedModel, vendor_url: &str) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let llm = Arc::new(llm);
    let sms = Arc::new(RecordingGateway::default());
    let state = AppState::with_parts(
        config,
        store.clone(),
        llm.clone(),
        sms.clone(),
        Some(vendor_url),
    );
    Harness {
        state,
        store,
        llm,
        sms,
    }
}
