//! Token usage extraction from an Anthropic event stream
//!
//! The relay forwards upstream bytes untouched. A copy of every chunk is
//! fed through a channel into an SSE parser that folds `message_start`
//! and `message_delta` usage into a [`TokenUsage`] total.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::body::Bytes;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt, stream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tollway_core::TokenUsage;

/// Usage counters as they appear on the wire, every field optional
#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    MessageDelta {
        #[serde(default)]
        usage: WireUsage,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

/// Running usage total for one streamed response
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsageAccumulator {
    usage: TokenUsage,
    completed: bool,
}

impl UsageAccumulator {
    /// Fold one SSE `data` payload into the total
    ///
    /// Payloads that are not JSON or carry no usage are ignored.
    pub fn observe(&mut self, data: &str) {
        let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
            return;
        };

        match event {
            StreamEvent::MessageStart { message } => {
                let wire = message.usage;
                self.usage = TokenUsage {
                    input_tokens: wire.input_tokens.unwrap_or_default(),
                    output_tokens: wire.output_tokens.unwrap_or_default(),
                    cache_creation_tokens: wire.cache_creation_input_tokens.unwrap_or_default(),
                    cache_read_tokens: wire.cache_read_input_tokens.unwrap_or_default(),
                };
            }
            // Delta counts are cumulative, so a present field replaces the start value
            StreamEvent::MessageDelta { usage } => {
                if let Some(n) = usage.input_tokens {
                    self.usage.input_tokens = n;
                }
                if let Some(n) = usage.output_tokens {
                    self.usage.output_tokens = n;
                }
                if let Some(n) = usage.cache_creation_input_tokens {
                    self.usage.cache_creation_tokens = n;
                }
                if let Some(n) = usage.cache_read_input_tokens {
                    self.usage.cache_read_tokens = n;
                }
            }
            StreamEvent::MessageStop => self.completed = true,
            StreamEvent::Other => {}
        }
    }

    pub const fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Usage worth billing: the stream reached `message_stop` and counted tokens
    pub const fn billable(&self) -> Option<TokenUsage> {
        if self.completed && !self.usage.is_empty() {
            Some(self.usage)
        } else {
            None
        }
    }
}

/// Why the tapped stream did not finish normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TapInterrupted {
    #[error("client disconnected before the upstream stream finished")]
    ClientGone,
    #[error("upstream stream failed")]
    Upstream,
}

/// How a tapped stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapOutcome {
    /// Every upstream byte reached the client
    Finished(UsageAccumulator),
    /// The relay stopped early; nothing may be billed
    Interrupted(TapInterrupted),
}

type TapItem = Result<Bytes, TapInterrupted>;

/// Forwards a byte stream while copying each chunk to the usage parser
///
/// Dropping it before the inner stream ends (a client disconnect) tells
/// the parser the response was cut short.
pub struct TappedStream<S> {
    inner: S,
    tap: mpsc::UnboundedSender<TapItem>,
    done: bool,
}

impl<S> TappedStream<S> {
    fn close(&mut self, reason: Option<TapInterrupted>) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(reason) = reason {
            let _ = self.tap.send(Err(reason));
        }
    }
}

impl<S, E> Stream for TappedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);

        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                if !self.done {
                    let _ = self.tap.send(Ok(chunk.clone()));
                }
            }
            Poll::Ready(Some(Err(_))) => self.close(Some(TapInterrupted::Upstream)),
            Poll::Ready(None) => self.close(None),
            Poll::Pending => {}
        }

        polled
    }
}

impl<S> Drop for TappedStream<S> {
    fn drop(&mut self) {
        self.close(Some(TapInterrupted::ClientGone));
    }
}

/// Receiving end of a tap, resolved once the tapped stream ends or is dropped
#[derive(Debug)]
pub struct UsageTap {
    rx: mpsc::UnboundedReceiver<TapItem>,
}

impl UsageTap {
    pub async fn outcome(self) -> TapOutcome {
        let chunks = stream::unfold(self.rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let mut events = std::pin::pin!(chunks.eventsource());
        let mut accumulator = UsageAccumulator::default();

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => accumulator.observe(event.data.trim()),
                Err(eventsource_stream::EventStreamError::Transport(reason)) => {
                    return TapOutcome::Interrupted(reason);
                }
                Err(e) => tracing::debug!(error = %e, "skipping malformed SSE data"),
            }
        }

        TapOutcome::Finished(accumulator)
    }
}

/// Wrap `inner` so its bytes are also parsed for usage
pub fn tap<S>(inner: S) -> (TappedStream<S>, UsageTap) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = TappedStream {
        inner,
        tap: tx,
        done: false,
    };

    (stream, UsageTap { rx })
}
