//! Pull-based event sequences shared by the model client and the pipeline.
//!
//! A background producer pushes events into a bounded channel; the consumer
//! asks for exactly one event at a time. A sequence whose producer went away
//! (cancellation) is exhausted and yields `None`, which is distinct from an
//! explicit `Done` event.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub const TOKEN_CHANNEL_CAPACITY: usize = 64;
pub const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// Sentinel percentage for progress updates without a known total.
pub const UNKNOWN_PERCENT: f64 = -1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Token(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PullUpdate {
    pub status: String,
    pub completed: Option<u64>,
    pub total: Option<u64>,
    pub error: Option<String>,
}

impl PullUpdate {
    pub fn status(status: impl Into<String>) -> Self {
        Self { status: status.into(), ..Default::default() }
    }

    pub fn bytes(status: impl Into<String>, completed: u64, total: u64) -> Self {
        Self { status: status.into(), completed: Some(completed), total: Some(total), error: None }
    }

    /// Fraction in `[0, 1]`, or [`UNKNOWN_PERCENT`] when the total is unknown.
    pub fn fraction(&self) -> f64 {
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => (done as f64 / total as f64).clamp(0.0, 1.0),
            (None, Some(total)) if total > 0 => 0.0,
            _ => UNKNOWN_PERCENT,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

/// Consumer half of a producer/consumer pair. Cloning shares the same
/// underlying receiver; reads are serialised.
pub struct EventSequence<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for EventSequence<T> {
    fn clone(&self) -> Self {
        Self { rx: Arc::clone(&self.rx) }
    }
}

impl<T> std::fmt::Debug for EventSequence<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSequence").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> EventSequence<T> {
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx: Arc::new(Mutex::new(rx)) })
    }

    /// Next event, or `None` once every producer has gone away.
    pub async fn next(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

pub type TokenSequence = EventSequence<TokenEvent>;
pub type ProgressSequence = EventSequence<PullUpdate>;

/// Send one event unless the token fires first. Returns false when the
/// producer should stop.
pub async fn forward<T>(tx: &mpsc::Sender<T>, cancel: &CancellationToken, event: T) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Holds the cancellation token for one logical activity.
#[derive(Debug, Default)]
pub struct CancellationController {
    token: Option<CancellationToken>,
}

impl CancellationController {
    /// Issue a fresh token. Any previous token must have been released first.
    pub fn begin(&mut self) -> CancellationToken {
        debug_assert!(self.token.is_none(), "previous cancellation token was not released");
        let token = CancellationToken::new();
        self.token = Some(token.clone());
        token
    }

    /// Fire and drop the current token. Safe to call with no token held.
    pub fn cancel(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the current token without firing it.
    pub fn release(&mut self) {
        self.token = None;
    }

    pub fn is_set(&self) -> bool {
        self.token.is_some()
    }
}

/// Incremental newline-delimited JSON decoder; tolerates lines split across
/// network chunks.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<serde_json::Result<T>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = trim_ascii(&line);
            if !line.is_empty() {
                out.push(serde_json::from_slice(line));
            }
        }
        out
    }

    /// Decode whatever is left once the body has ended without a newline.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Option<serde_json::Result<T>> {
        let rest = std::mem::take(&mut self.buf);
        let rest = trim_ascii(&rest);
        if rest.is_empty() { None } else { Some(serde_json::from_slice(rest)) }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Line {
        n: u32,
    }

    #[test]
    fn decoder_joins_lines_split_across_chunks() {
        let mut d = NdjsonDecoder::default();
        let first: Vec<serde_json::Result<Line>> = d.push(b"{\"n\":1}\n{\"n\"");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap(), &Line { n: 1 });
        let second: Vec<serde_json::Result<Line>> = d.push(b":2}\n\n");
        assert_eq!(second.into_iter().map(|r| r.unwrap().n).collect::<Vec<_>>(), vec![2]);
        assert!(d.finish::<Line>().is_none());
    }

    #[test]
    fn decoder_finishes_unterminated_line() {
        let mut d = NdjsonDecoder::default();
        let none: Vec<serde_json::Result<Line>> = d.push(b"{\"n\":7}");
        assert!(none.is_empty());
        assert_eq!(d.finish::<Line>().unwrap().unwrap(), Line { n: 7 });
    }

    #[test]
    fn fraction_handles_unknown_totals() {
        assert_eq!(PullUpdate::bytes("downloading", 25, 100).fraction(), 0.25);
        assert_eq!(PullUpdate::bytes("downloading", 0, 0).fraction(), UNKNOWN_PERCENT);
        assert_eq!(PullUpdate::status("pulling manifest").fraction(), UNKNOWN_PERCENT);
        assert!(PullUpdate::status("success").is_success());
    }

    #[test]
    fn controller_cancel_is_idempotent() {
        let mut c = CancellationController::default();
        assert!(!c.cancel());
        let token = c.begin();
        assert!(c.is_set());
        assert!(c.cancel());
        assert!(token.is_cancelled());
        assert!(!c.cancel());
        assert!(!c.is_set());
    }

    #[tokio::test]
    async fn closed_sequence_is_exhausted_not_done() {
        let (tx, seq) = TokenSequence::channel(4);
        tx.send(TokenEvent::Token("SELECT".into())).await.unwrap();
        drop(tx);
        assert_eq!(seq.next().await, Some(TokenEvent::Token("SELECT".into())));
        assert_eq!(seq.next().await, None);
    }

    #[tokio::test]
    async fn forward_stops_on_cancel() {
        let (tx, _seq) = TokenSequence::channel(1);
        let cancel = CancellationToken::new();
        assert!(forward(&tx, &cancel, TokenEvent::Token("a".into())).await);
        cancel.cancel();
        // channel is full; only cancellation can complete this
        assert!(!forward(&tx, &cancel, TokenEvent::Token("b".into())).await);
    }
}
