//! Streaming response types.
//!
//! A chat call returns a [`ContentStream`]: a lazy sequence of typed
//! [`IContent`] items ending either cleanly or with a single error.
//! Text deltas arrive in provider order; a tool call is only yielded
//! after its arguments are fully received and parsed; a usage update
//! arrives as a metadata-only item near the end of the stream.
//!
//! Consume with [`StreamExt`](futures::StreamExt):
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use llxprt_core::{ContentStream, IContent};
//!
//! async fn print_stream(mut stream: ContentStream) {
//!     while let Some(item) = stream.next().await {
//!         match item {
//!             Ok(content) => {
//!                 if let Some(text) = content.text() {
//!                     print!("{text}");
//!                 }
//!             }
//!             Err(e) => eprintln!("stream error: {e}"),
//!         }
//!     }
//! }
//! ```

use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::content::IContent;
use crate::error::LlxprtError;

/// A pinned, boxed, `Send` stream of content items.
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<IContent, LlxprtError>> + Send>>;

/// Wraps an already-materialized item list as a [`ContentStream`].
///
/// Used by the non-streaming path, where the whole response is read
/// before any item is yielded.
pub fn stream_from_items(items: Vec<IContent>) -> ContentStream {
    Box::pin(futures::stream::iter(items.into_iter().map(Ok)))
}

/// Collects a stream to completion, failing on the first error.
pub async fn collect_stream(mut stream: ContentStream) -> Result<Vec<IContent>, LlxprtError> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
    }
    Ok(items)
}

/// Collects a stream, keeping items received before an error alongside
/// the error itself. Consumers reconciling a partial prefix after a
/// retry use this form.
pub async fn collect_stream_lossy(
    mut stream: ContentStream,
) -> (Vec<IContent>, Option<LlxprtError>) {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(content) => items.push(content),
            Err(err) => return (items, Some(err)),
        }
    }
    (items, None)
}
