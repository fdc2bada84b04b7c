//! Event scheduler.
//!
//! Change events and subscription-ready notices are buffered and handed to
//! the engine thread on every tick. The scheduler thread never touches rule,
//! registry or state; it only decides when buffered input is flushed.

use std::time::Duration;

use crossbeam_channel::{never, select, tick, Receiver, Sender};
use tracing::{debug, trace};

use crate::registry::SubReadyNotice;
use crate::source::ChangeEvent;

/// Input the scheduler hands to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Every change event buffered since the last flush, in arrival order.
    Transactions(Vec<ChangeEvent>),
    /// One subscription became ready.
    SubReady(SubReadyNotice),
}

/// Per-tick input buffer.
#[derive(Debug, Default)]
pub struct EventBuffer {
    transactions: Vec<ChangeEvent>,
    ready: Vec<SubReadyNotice>,
}

impl EventBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a change event for the next transaction batch.
    pub fn push_transaction(&mut self, event: ChangeEvent) {
        self.transactions.push(event);
    }

    /// Buffer a ready notice.
    pub fn push_ready(&mut self, notice: SubReadyNotice) {
        self.ready.push(notice);
    }

    /// True when nothing is waiting to be flushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.ready.is_empty()
    }

    /// Empty the buffer.
    ///
    /// Buffered transactions come out first, as a single batch, followed by
    /// each ready notice on its own. Both buffers are cleared.
    pub fn drain(&mut self) -> Vec<Input> {
        let mut out = Vec::with_capacity(1 + self.ready.len());
        if !self.transactions.is_empty() {
            out.push(Input::Transactions(std::mem::take(&mut self.transactions)));
        }
        out.extend(self.ready.drain(..).map(Input::SubReady));
        out
    }
}

/// Buffer input until each tick, then forward it to `batch_tx`.
///
/// Exits once `shutdown_rx` disconnects, after a final flush.
pub(crate) fn scheduler_loop(
    interval: Duration,
    events_rx: Receiver<ChangeEvent>,
    ready_rx: Receiver<SubReadyNotice>,
    shutdown_rx: Receiver<()>,
    batch_tx: Sender<Input>,
) {
    let ticker = tick(interval);
    let mut buffer = EventBuffer::new();
    let mut events_rx = events_rx;
    let mut ready_rx = ready_rx;

    loop {
        let mut events_closed = false;
        let mut ready_closed = false;

        select! {
            recv(events_rx) -> msg => match msg {
                Ok(event) => {
                    trace!(source = %event.source, op = %event.op, "buffered change event");
                    buffer.push_transaction(event);
                }
                Err(_) => events_closed = true,
            },
            recv(ready_rx) -> msg => match msg {
                Ok(notice) => buffer.push_ready(notice),
                Err(_) => ready_closed = true,
            },
            recv(ticker) -> _ => {
                if !flush(&mut buffer, &batch_tx) {
                    break;
                }
            }
            recv(shutdown_rx) -> _ => {
                while let Ok(event) = events_rx.try_recv() {
                    buffer.push_transaction(event);
                }
                while let Ok(notice) = ready_rx.try_recv() {
                    buffer.push_ready(notice);
                }
                flush(&mut buffer, &batch_tx);
                break;
            }
        }

        // A disconnected receiver is always ready; stop selecting on it.
        if events_closed {
            events_rx = never();
        }
        if ready_closed {
            ready_rx = never();
        }
    }
    debug!("scheduler stopped");
}

fn flush(buffer: &mut EventBuffer, batch_tx: &Sender<Input>) -> bool {
    if buffer.is_empty() {
        return true;
    }
    for input in buffer.drain() {
        if batch_tx.send(input).is_err() {
            return false;
        }
    }
    true
}
