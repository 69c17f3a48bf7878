//! Mock provider for testing.
//!
//! [`MockProvider`] is a queue-based fake: tests script exactly which
//! content items or errors each call yields, without touching the
//! network. It implements [`Provider`], so it works anywhere a real
//! adapter does — including behind the manager's decorator via the
//! [`DynProvider`](crate::DynProvider) blanket impl.
//!
//! # Why `MockError` instead of `LlxprtError`?
//!
//! [`LlxprtError`] contains boxed causes and is not `Clone`, so it
//! cannot sit in a queue. [`MockError`] mirrors the common variants in
//! a cloneable form and converts at dequeue time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::content::IContent;
use crate::error::LlxprtError;
use crate::provider::{
    ModelInfo, NormalizedGenerateChatOptions, Provider, ProviderCapabilities,
};
use crate::stream::ContentStream;

/// Cloneable error subset for mock queuing.
#[derive(Debug, Clone)]
pub enum MockError {
    /// Maps to [`LlxprtError::Auth`].
    Auth {
        /// Provider name.
        provider: String,
        /// Remediation hint.
        hint: String,
    },
    /// Maps to [`LlxprtError::Api`].
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },
    /// Maps to [`LlxprtError::StreamInterrupted`].
    StreamInterrupted(String),
    /// Maps to [`LlxprtError::Input`].
    Input(String),
}

impl MockError {
    fn into_error(self) -> LlxprtError {
        match self {
            Self::Auth { provider, hint } => LlxprtError::Auth { provider, hint },
            Self::Api { status, message } => LlxprtError::api(
                http::StatusCode::from_u16(status)
                    .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR),
                message,
            ),
            Self::StreamInterrupted(details) => LlxprtError::stream_interrupted(details),
            Self::Input(msg) => LlxprtError::Input(msg),
        }
    }
}

/// One scripted turn: items to yield, optionally followed by an error
/// terminating the stream (a partial prefix before an interruption).
#[derive(Debug, Clone, Default)]
pub struct MockTurn {
    /// Items yielded in order.
    pub items: Vec<IContent>,
    /// Error terminating the stream after `items`, if any.
    pub trailing_error: Option<MockError>,
}

impl MockTurn {
    /// A turn yielding `items` and ending cleanly.
    pub fn items(items: Vec<IContent>) -> Self {
        Self {
            items,
            trailing_error: None,
        }
    }

    /// A turn yielding `items` then failing with `error`.
    pub fn interrupted(items: Vec<IContent>, error: MockError) -> Self {
        Self {
            items,
            trailing_error: Some(error),
        }
    }
}

/// A queue-based mock provider.
///
/// Push turns with [`queue_turn`](Self::queue_turn) and call-level
/// errors with [`queue_error`](Self::queue_error). Each
/// `generate_chat_completion` call pops from the front. Every call
/// records its options for later assertion via
/// [`recorded_calls`](Self::recorded_calls).
///
/// # Panics
///
/// A call with an empty queue panics — scripting mismatches should
/// fail tests loudly.
pub struct MockProvider {
    name: String,
    turns: Mutex<VecDeque<Result<MockTurn, MockError>>>,
    calls: Arc<Mutex<Vec<NormalizedGenerateChatOptions>>>,
    cleared: Arc<Mutex<u32>>,
}

impl MockProvider {
    /// A mock registered under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            turns: Mutex::new(VecDeque::new()),
            calls: Arc::default(),
            cleared: Arc::default(),
        }
    }

    /// Enqueues a successful turn.
    pub fn queue_turn(&self, turn: MockTurn) {
        self.turns.lock().unwrap().push_back(Ok(turn));
    }

    /// Enqueues a call-level failure (the call itself errors before any
    /// item is yielded).
    pub fn queue_error(&self, error: MockError) {
        self.turns.lock().unwrap().push_back(Err(error));
    }

    /// Options recorded from every call, in order.
    pub fn recorded_calls(&self) -> Vec<NormalizedGenerateChatOptions> {
        self.calls.lock().unwrap().clone()
    }

    /// How many times `clear_state` ran.
    pub fn clear_count(&self) -> u32 {
        *self.cleared.lock().unwrap()
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_chat_completion(
        &self,
        options: NormalizedGenerateChatOptions,
    ) -> Result<ContentStream, LlxprtError> {
        self.calls.lock().unwrap().push(options);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .expect("MockProvider turn queue is empty");
        let turn = turn.map_err(MockError::into_error)?;

        let mut results: Vec<Result<IContent, LlxprtError>> =
            turn.items.into_iter().map(Ok).collect();
        if let Some(error) = turn.trailing_error {
            results.push(Err(error.into_error()));
        }
        Ok(Box::pin(futures::stream::iter(results)))
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "mock-model".into(),
            name: "Mock Model".into(),
            provider: self.name.clone(),
            supported_tool_formats: Vec::new(),
            context_window: 8192,
            max_output_tokens: 4096,
        }]
    }

    fn default_model(&self) -> String {
        "mock-model".into()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    fn clear_state(&self) {
        *self.cleared.lock().unwrap() += 1;
    }
}
