//! Frame intake
//!
//! Camera frames arrive faster than inference can consume them. The intake is a
//! single-slot mailbox: a newly submitted frame replaces any frame still waiting,
//! so slow inference never builds up a backlog.

pub mod frame;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use uuid::Uuid;

pub use frame::{Frame, Rotation};

/// What happened to a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The slot was empty; the frame is waiting for the worker
    Queued,
    /// A stale pending frame was discarded in favour of this one
    Replaced { stale: Uuid },
    /// The consumer is gone
    Closed,
}

/// Latest-frame-wins single-slot queue
pub struct FrameSlot {
    sender: Sender<Frame>,
    receiver: Receiver<Frame>,
    dropped: AtomicU64,
    /// Serializes producers so an eviction and its refill are one step
    producer: Mutex<()>,
}

impl FrameSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        let (sender, receiver) = bounded(1);
        Self {
            sender,
            receiver,
            dropped: AtomicU64::new(0),
            producer: Mutex::new(()),
        }
    }

    /// Offer a frame, replacing whatever is still pending
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        let _producer = self.producer.lock();
        let mut frame = frame;
        let mut stale = None;

        // Only the consumer removes frames while the producer lock is held,
        // so a full slot is emptied at most once
        loop {
            match self.sender.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Disconnected(_)) => return SubmitOutcome::Closed,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    if let Ok(old) = self.receiver.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        stale = Some(old.id);
                    }
                }
            }
        }

        match stale {
            Some(stale) => {
                trace!("Replaced stale frame {}", stale);
                SubmitOutcome::Replaced { stale }
            }
            None => SubmitOutcome::Queued,
        }
    }

    /// Receiving end for the consumer
    pub fn receiver(&self) -> Receiver<Frame> {
        self.receiver.clone()
    }

    /// Whether a frame is waiting
    pub fn is_pending(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Number of frames discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
