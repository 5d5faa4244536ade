//! In-memory, append-only event log addressed by cursor.
//!
//! Cursors start at 1 and are dense, so the envelope for cursor `n` always
//! lives at index `n - 1`. The log is intentionally not persisted: a sandbox
//! that restarts starts a fresh stream.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::events::{Envelope, StreamEvent};

#[derive(Debug, Clone, Copy, Default)]
struct LogSignal {
    last_cursor: u64,
    closed: bool,
}

#[derive(Debug)]
struct EventLogInner {
    entries: RwLock<Vec<Envelope>>,
    signal: watch::Sender<LogSignal>,
}

/// Cheaply clonable handle; all clones share the same log.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(LogSignal::default());
        Self {
            inner: Arc::new(EventLogInner {
                entries: RwLock::new(Vec::new()),
                signal,
            }),
        }
    }

    /// Appends an event and returns the envelope carrying its cursor.
    pub fn append(&self, event: impl Into<StreamEvent>) -> Envelope {
        let mut entries = self.inner.entries.write();
        let envelope = Envelope {
            cursor: entries.len() as u64 + 1,
            event: event.into(),
        };
        entries.push(envelope.clone());
        self.inner
            .signal
            .send_modify(|signal| signal.last_cursor = envelope.cursor);
        envelope
    }

    /// Envelopes with a cursor strictly greater than `cursor`, in order.
    pub fn since(&self, cursor: u64) -> Vec<Envelope> {
        let entries = self.inner.entries.read();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(entries.len());
        entries[start..].to_vec()
    }

    fn from_cursor(&self, cursor: u64) -> Vec<Envelope> {
        self.since(cursor.saturating_sub(1))
    }

    pub fn last_cursor(&self) -> u64 {
        self.inner.entries.read().len() as u64
    }

    /// Envelopes already buffered with cursor >= `cursor`; never waits.
    pub fn snapshot(&self, cursor: u64) -> BoxStream<'static, Envelope> {
        stream::iter(self.from_cursor(cursor)).boxed()
    }

    /// Replays envelopes with cursor >= `cursor`, then follows new appends
    /// until the stream is dropped or the log is closed.
    pub fn subscribe(&self, cursor: u64) -> BoxStream<'static, Envelope> {
        let state = FollowState {
            log: self.clone(),
            next_cursor: cursor.max(1),
            pending: VecDeque::new(),
            signal: self.inner.signal.subscribe(),
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(envelope) = state.pending.pop_front() {
                    state.next_cursor = envelope.cursor + 1;
                    return Some((envelope, state));
                }

                // Mark the current signal as seen before reading so an append
                // racing with this read still wakes `changed()` below.
                let closed = state.signal.borrow_and_update().closed;
                let batch = state.log.from_cursor(state.next_cursor);
                if !batch.is_empty() {
                    state.pending.extend(batch);
                    continue;
                }
                if closed {
                    return None;
                }
                if state.signal.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }

    /// Ends every live subscription once it has drained buffered envelopes.
    pub fn close(&self) {
        self.inner.signal.send_modify(|signal| signal.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.signal.borrow().closed
    }

    /// Number of live followers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.inner.signal.receiver_count()
    }
}

struct FollowState {
    log: EventLog,
    next_cursor: u64,
    pending: VecDeque<Envelope>,
    signal: watch::Receiver<LogSignal>,
}
