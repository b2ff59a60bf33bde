//! Append-only output log with multi-subscriber replay.
//!
//! Every job owns one [`LogBuffer`]. The launcher's two pipe readers are
//! the only appenders; any number of subscribers read concurrently, each
//! starting from byte zero regardless of when it joined. A subscriber is
//! a cursor plus a bounded channel fed by its own pump task, so a slow
//! consumer suspends only its own pump; the append path never waits on
//! anyone.
//!
//! History is kept in full for the lifetime of the job record, which
//! bounds memory at total process output.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Largest chunk handed to a subscriber in one message. Keeps a late
/// subscriber with a deep backlog from holding the history lock while
/// it copies everything at once.
const REPLAY_CHUNK: usize = 64 * 1024;

/// A subscriber fell too far behind the appender and was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscriber dropped {behind} bytes behind the log")]
pub struct LogLag {
    pub behind: u64,
}

/// Write position and end-of-stream flag, published to subscriber pumps.
#[derive(Debug, Clone, Copy, Default)]
struct LogTip {
    len: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct LogBuffer {
    history: Mutex<Vec<u8>>,
    tip: watch::Sender<LogTip>,
    subscriber_buffer: usize,
    lag_threshold: u64,
}

impl LogBuffer {
    pub fn new(subscriber_buffer: usize, lag_threshold: u64) -> Self {
        let (tip, _) = watch::channel(LogTip::default());
        Self {
            history: Mutex::new(Vec::new()),
            tip,
            subscriber_buffer: subscriber_buffer.max(1),
            lag_threshold,
        }
    }

    /// Append output bytes. Appends after close are discarded; the
    /// launcher closes only after both pipe readers hit EOF, so this
    /// path is unreachable in normal operation.
    pub async fn append(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut history = self.history.lock().await;
        if self.tip.borrow().closed {
            return;
        }
        history.extend_from_slice(chunk);
        let len = history.len() as u64;
        // Published while the history lock is held so the tip never runs
        // ahead of readable bytes.
        self.tip.send_modify(|tip| tip.len = len);
    }

    /// Mark end-of-stream. Idempotent.
    pub async fn close(&self) {
        let _history = self.history.lock().await;
        self.tip.send_modify(|tip| tip.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.tip.borrow().closed
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> u64 {
        self.tip.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a subscriber.
    ///
    /// The returned channel yields the full history from byte zero, then
    /// each live append, then closes once the buffer is closed and the
    /// subscriber has caught up. A subscriber that falls more than the
    /// lag threshold behind receives one final `Err(LogLag)` and is
    /// dropped. Cancelling the token or dropping the receiver removes
    /// the subscriber without affecting others.
    pub fn subscribe(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Bytes, LogLag>> {
        // One extra slot backs the reserved permit that guarantees a
        // LogLag notice can be delivered even to a full channel.
        let (tx, rx) = mpsc::channel(self.subscriber_buffer + 1);
        let buffer = Arc::clone(self);
        let tip = self.tip.subscribe();
        tokio::spawn(async move {
            buffer.pump(tx, tip, cancel).await;
        });
        rx
    }

    /// Per-subscriber delivery loop. May suspend in `send` (bounded
    /// channel) or waiting for new appends; never holds the history lock
    /// across either.
    ///
    /// Backlog alone never drops a subscriber: a late joiner replays any
    /// amount of history as fast as it drains its channel. The lag drop
    /// applies only to a subscriber whose channel stays full while the
    /// log keeps growing past the threshold.
    async fn pump(
        &self,
        tx: mpsc::Sender<Result<Bytes, LogLag>>,
        mut tip_rx: watch::Receiver<LogTip>,
        cancel: CancellationToken,
    ) {
        let lag_slot = match tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let mut cursor: u64 = 0;
        'replay: loop {
            let tip = *tip_rx.borrow_and_update();

            if tip.len > cursor {
                let chunk = {
                    let history = self.history.lock().await;
                    let end = (cursor as usize + REPLAY_CHUNK).min(history.len());
                    Bytes::copy_from_slice(&history[cursor as usize..end])
                };
                let chunk_len = chunk.len() as u64;
                let send = tx.send(Ok(chunk));
                tokio::pin!(send);
                loop {
                    tokio::select! {
                        sent = &mut send => {
                            if sent.is_err() {
                                // Receiver dropped; subscriber is gone.
                                return;
                            }
                            cursor += chunk_len;
                            continue 'replay;
                        }
                        _ = cancel.cancelled() => return,
                        changed = tip_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            let behind =
                                tip_rx.borrow_and_update().len.saturating_sub(cursor);
                            if behind > self.lag_threshold {
                                lag_slot.send(Err(LogLag { behind }));
                                return;
                            }
                        }
                    }
                }
            }

            if tip.closed {
                // Caught up on a closed log: dropping the sender closes
                // the channel, the subscriber's clean end-of-stream.
                return;
            }

            tokio::select! {
                changed = tip_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}
