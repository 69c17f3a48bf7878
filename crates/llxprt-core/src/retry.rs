//! Retry engine with transient classification, `Retry-After` honoring,
//! and exponential backoff with jitter.
//!
//! Every HTTP call in llxprt is wrapped by this engine. The policy:
//!
//! - A 429 response with a parseable `Retry-After` header is honored
//!   exactly (the wait is `max(0, target - now)`) and resets the backoff
//!   progression.
//! - Other retryable failures wait `delay ± 30%` jitter, doubling the
//!   base delay up to the cap after each non-explicit wait.
//! - Every slept duration — explicit or backoff — is reported to the
//!   configured throttle tracker for session accumulation.
//! - Sleeps race against the call's cancellation token; cancellation
//!   aborts immediately without sleeping out the remaining delay.
//!
//! Transient classification recursively walks an error's `source()`
//! chain (with a visited-set cycle guard), collecting messages and
//! machine codes, and matches them against a fixed phrase set, a handful
//! of regexes, and a transient-code set. A
//! [`StreamInterrupted`](LlxprtError::StreamInterrupted) error always
//! classifies transient so mid-stream disconnects retry the whole call.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use rand::Rng;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LlxprtError;

/// Predicate deciding whether an error is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&LlxprtError) -> bool + Send + Sync>;

/// Callback receiving every slept duration for session accumulation.
pub type ThrottleTracker = Arc<dyn Fn(Duration) + Send + Sync>;

/// Configuration for [`retry`] and [`RetryState`].
#[derive(Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first. `1` means no retries.
    pub max_attempts: u32,
    /// Base delay before the first backoff wait.
    pub initial_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Jitter fraction applied to backoff waits (`0.3` = ±30%).
    pub jitter: f64,
    /// Overrides [`default_should_retry`] when set.
    pub should_retry: Option<RetryPredicate>,
    /// Receives every slept duration.
    pub throttle_tracker: Option<ThrottleTracker>,
    /// Cancels in-flight sleeps and further attempts.
    pub cancel: CancellationToken,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5000),
            max_delay: Duration::from_millis(30_000),
            jitter: 0.3,
            should_retry: None,
            throttle_tracker: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("has_should_retry", &self.should_retry.is_some())
            .field("has_throttle_tracker", &self.throttle_tracker.is_some())
            .finish()
    }
}

/// Runs `op` until it succeeds, the error stops being retryable, or
/// attempts are exhausted. On exhaustion the final error is returned
/// unchanged.
pub async fn retry<T, F, Fut>(options: &RetryOptions, mut op: F) -> Result<T, LlxprtError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlxprtError>>,
{
    let mut state = RetryState::new(options);
    loop {
        if options.cancel.is_cancelled() {
            return Err(LlxprtError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match state.next_delay(&err) {
                Some(delay) => {
                    debug!(
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    state.sleep(delay).await?;
                }
                None => return Err(err),
            },
        }
    }
}

/// Incremental retry bookkeeping for callers that drive their own loop
/// (streaming adapters retry the whole call from inside the stream).
pub struct RetryState<'a> {
    options: &'a RetryOptions,
    attempt: u32,
    delay: Duration,
}

impl<'a> RetryState<'a> {
    /// Starts a fresh progression from the configured initial delay.
    pub fn new(options: &'a RetryOptions) -> Self {
        Self {
            options,
            attempt: 1,
            delay: options.initial_delay,
        }
    }

    /// Decides whether `err` warrants another attempt. Returns the wait
    /// before the next attempt, or `None` to give up.
    ///
    /// A `Retry-After` hint on the error wins over backoff and resets
    /// the backoff progression; backoff waits double the base delay
    /// (capped) for the next round.
    pub fn next_delay(&mut self, err: &LlxprtError) -> Option<Duration> {
        if self.attempt >= self.options.max_attempts {
            return None;
        }
        let retryable = match &self.options.should_retry {
            Some(predicate) => predicate(err),
            None => default_should_retry(err),
        };
        if !retryable {
            return None;
        }
        self.attempt += 1;

        if let LlxprtError::Api {
            status,
            retry_after: Some(after),
            ..
        } = err
            && status.as_u16() == 429
        {
            self.delay = self.options.initial_delay;
            return Some(after.remaining(SystemTime::now()));
        }

        let wait = apply_jitter(self.delay, self.options.jitter);
        self.delay = (self.delay * 2).min(self.options.max_delay);
        Some(wait)
    }

    /// Sleeps for `delay`, racing the cancellation token, and reports
    /// the duration to the throttle tracker.
    pub async fn sleep(&self, delay: Duration) -> Result<(), LlxprtError> {
        if let Some(tracker) = &self.options.throttle_tracker {
            tracker(delay);
        }
        tokio::select! {
            () = self.options.cancel.cancelled() => Err(LlxprtError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Applies `delay * jitter * U(-1, 1)`, clamped to zero.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    let millis = delay.as_millis() as f64 * (1.0 + jitter * factor);
    Duration::from_millis(millis.max(0.0) as u64)
}

/// Default retryability: 429 and 5xx statuses, messages naming them,
/// stream interruptions, and transient-network error chains.
pub fn default_should_retry(err: &LlxprtError) -> bool {
    match err {
        LlxprtError::Api { status, message, .. } => {
            status.as_u16() == 429
                || status.is_server_error()
                || message_names_retryable_status(message)
        }
        LlxprtError::StreamInterrupted { .. } => true,
        LlxprtError::Auth { .. }
        | LlxprtError::Config(_)
        | LlxprtError::Input(_)
        | LlxprtError::TurnLimit { .. }
        | LlxprtError::ToolDisabled { .. }
        | LlxprtError::MissingProviderRuntime { .. }
        | LlxprtError::Cancelled => false,
        other => is_transient(other),
    }
}

fn message_names_retryable_status(message: &str) -> bool {
    message.contains("429") || status_5xx_regex().is_match(message)
}

// ── Transient classification ────────────────────────────────────────

/// Substrings (lowercased comparison) that mark a message as transient.
const TRANSIENT_PHRASES: &[&str] = &[
    "connection",
    "socket",
    "stream interrupted",
    "stream closed",
    "stream error",
    "premature close",
    "timeout",
    "timed out",
    "fetch failed",
    "request aborted",
    "error reading from the stream",
    "error writing to the stream",
    "network error",
    "dns error",
    "econnreset",
];

/// Uppercase machine codes that mark an error as transient.
const TRANSIENT_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "ETIMEDOUT",
    "EPIPE",
    "EAI_AGAIN",
    "UND_ERR_SOCKET",
    "UND_ERR_CONNECT",
    "UND_ERR_HEADERS_TIMEOUT",
    "UND_ERR_BODY_TIMEOUT",
    "STREAM_INTERRUPTED",
    crate::error::STREAM_INTERRUPTED_CODE,
];

fn transient_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            r"(?i)econn(reset|refused|aborted)",
            r"(?i)etimedout",
            r"(?i)und_err_(socket|connect|headers_timeout|body_timeout)",
            r"(?i)tcp connection.*(reset|closed)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("transient pattern is valid"))
        .collect()
    })
}

fn status_5xx_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"5\d{2}").expect("status pattern is valid"))
}

/// Classifies an error chain as transient by recursively walking
/// `source()` links. A visited set of node pointers guards against
/// cyclic chains.
pub fn is_transient(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut visited: HashSet<*const ()> = HashSet::new();
    let mut node: Option<&(dyn std::error::Error + 'static)> = Some(err);

    while let Some(current) = node {
        let ptr = std::ptr::from_ref(current).cast::<()>();
        if !visited.insert(ptr) {
            break;
        }

        if let Some(llx) = current.downcast_ref::<LlxprtError>() {
            if matches!(llx, LlxprtError::StreamInterrupted { .. }) {
                return true;
            }
            if let Some(code) = llx.code()
                && TRANSIENT_CODES.contains(&code)
            {
                return true;
            }
        }

        let message = current.to_string();
        if message_is_transient(&message) {
            return true;
        }

        node = current.source();
    }
    false
}

fn message_is_transient(message: &str) -> bool {
    let lowered = message.to_lowercase();
    if TRANSIENT_PHRASES.iter().any(|p| lowered.contains(p)) {
        return true;
    }
    if transient_regexes().iter().any(|re| re.is_match(message)) {
        return true;
    }
    let upper = message.to_uppercase();
    TRANSIENT_CODES.iter().any(|c| upper.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryAfter;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options() -> RetryOptions {
        RetryOptions {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            ..Default::default()
        }
    }

    fn transient_error() -> LlxprtError {
        LlxprtError::transport(std::io::Error::other("connection reset by peer"))
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let options = fast_options();
        let result = retry(&options, || async { Ok::<_, LlxprtError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failures() {
        let options = fast_options();
        let attempts = AtomicU32::new(0);
        let result = retry(&options, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient_error())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_final_error() {
        let options = RetryOptions {
            max_attempts: 3,
            ..fast_options()
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry(&options, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(transient_error()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_max_attempts_one_never_retries() {
        let options = RetryOptions {
            max_attempts: 1,
            ..fast_options()
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry(&options, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(transient_error()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let options = fast_options();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry(&options, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlxprtError::Auth {
                    provider: "openai".into(),
                    hint: "set OPENAI_API_KEY".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(LlxprtError::Auth { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_sleep() {
        let cancel = CancellationToken::new();
        let options = RetryOptions {
            initial_delay: Duration::from_secs(60),
            cancel: cancel.clone(),
            ..Default::default()
        };
        cancel.cancel();
        let result: Result<(), _> =
            retry(&options, || async { Err(transient_error()) }).await;
        assert!(matches!(result, Err(LlxprtError::Cancelled)));
    }

    #[tokio::test]
    async fn test_throttle_tracker_sees_every_wait() {
        let waits: Arc<Mutex<Vec<Duration>>> = Arc::default();
        let sink = Arc::clone(&waits);
        let options = RetryOptions {
            max_attempts: 3,
            throttle_tracker: Some(Arc::new(move |d| sink.lock().unwrap().push(d))),
            ..fast_options()
        };
        let _: Result<(), _> = retry(&options, || async { Err(transient_error()) }).await;
        assert_eq!(waits.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_retry_after_wins_and_resets_backoff() {
        let options = RetryOptions {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            jitter: 0.0,
            ..Default::default()
        };
        let mut state = RetryState::new(&options);

        // First: a plain transient error advances backoff (100 -> 200).
        let d1 = state.next_delay(&transient_error()).unwrap();
        assert_eq!(d1, Duration::from_millis(100));

        // Then a 429 with Retry-After: 2 — honored exactly, backoff reset.
        let throttled = LlxprtError::Api {
            status: http::StatusCode::TOO_MANY_REQUESTS,
            message: "rate limited".into(),
            retry_after: Some(RetryAfter::Seconds(2)),
        };
        let d2 = state.next_delay(&throttled).unwrap();
        assert!(d2 >= Duration::from_secs(2));

        // Next backoff wait restarts from the initial delay.
        let d3 = state.next_delay(&transient_error()).unwrap();
        assert_eq!(d3, Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = RetryOptions {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: 0.0,
            ..Default::default()
        };
        let mut state = RetryState::new(&options);
        let err = transient_error();
        assert_eq!(state.next_delay(&err).unwrap(), Duration::from_millis(100));
        assert_eq!(state.next_delay(&err).unwrap(), Duration::from_millis(200));
        // 400 clamps to the 250ms cap.
        assert_eq!(state.next_delay(&err).unwrap(), Duration::from_millis(250));
        assert_eq!(state.next_delay(&err).unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = apply_jitter(delay, 0.3);
            assert!(jittered >= Duration::from_millis(700));
            assert!(jittered <= Duration::from_millis(1300));
        }
    }

    #[test]
    fn test_custom_predicate_overrides_default() {
        let options = RetryOptions {
            should_retry: Some(Arc::new(|_| false)),
            ..fast_options()
        };
        let mut state = RetryState::new(&options);
        assert!(state.next_delay(&transient_error()).is_none());
    }

    #[test]
    fn test_default_should_retry_statuses() {
        assert!(default_should_retry(&LlxprtError::api(
            http::StatusCode::TOO_MANY_REQUESTS,
            "slow down"
        )));
        assert!(default_should_retry(&LlxprtError::api(
            http::StatusCode::SERVICE_UNAVAILABLE,
            "overloaded"
        )));
        assert!(!default_should_retry(&LlxprtError::api(
            http::StatusCode::NOT_FOUND,
            "missing"
        )));
    }

    #[test]
    fn test_default_should_retry_message_mentions_status() {
        assert!(default_should_retry(&LlxprtError::api(
            http::StatusCode::BAD_REQUEST,
            "upstream returned 503"
        )));
        assert!(default_should_retry(&LlxprtError::api(
            http::StatusCode::BAD_REQUEST,
            "got 429 from origin"
        )));
    }

    #[test]
    fn test_stream_interrupted_is_retryable() {
        assert!(default_should_retry(&LlxprtError::stream_interrupted(
            "eof"
        )));
    }

    #[test]
    fn test_is_transient_phrases() {
        for msg in [
            "connection reset by peer",
            "operation timed out",
            "fetch failed",
            "request aborted mid-flight",
            "socket hang up",
        ] {
            assert!(
                is_transient(&std::io::Error::other(msg.to_string())),
                "expected transient: {msg}"
            );
        }
    }

    #[test]
    fn test_is_transient_codes_in_message() {
        assert!(is_transient(&std::io::Error::other("ECONNRESET")));
        assert!(is_transient(&std::io::Error::other(
            "code UND_ERR_HEADERS_TIMEOUT raised"
        )));
        assert!(is_transient(&std::io::Error::other(
            "TCP connection to host was reset"
        )));
    }

    #[test]
    fn test_is_transient_walks_source_chain() {
        let root = std::io::Error::other("connection refused");
        let wrapped = LlxprtError::Unhandled(Box::new(root));
        assert!(is_transient(&wrapped));
    }

    #[test]
    fn test_is_transient_rejects_permanent() {
        assert!(!is_transient(&std::io::Error::other("invalid api key")));
        assert!(!is_transient(&LlxprtError::Config("bad key".into())));
    }
}
