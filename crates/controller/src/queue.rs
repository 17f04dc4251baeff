//! Bounded multi-index message queue.
//!
//! Incoming envelopes are decoded once on enqueue and indexed by
//! (identifier, height, message type, role) so consumers can cherry-pick:
//! the current height's consensus traffic drains first, then late commits
//! and post-consensus partial signatures for already-decided heights, then
//! sync bodies, then future heights.

use crate::metrics;
use dvq_messages::{MessageType, SignedMessage, SsvMessage, SsvMsgType};
use dvq_types::{Height, MessageId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::trace;

/// An enqueued envelope with its pre-decoded consensus payload.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub msg: SsvMessage,
    /// Present for `Consensus` and `Decided` envelopes that decoded cleanly.
    pub signed: Option<SignedMessage>,
}

impl QueuedMessage {
    fn height(&self) -> Option<Height> {
        self.signed.as_ref().map(|s| s.message.height)
    }

    fn consensus_type(&self) -> Option<MessageType> {
        self.signed.as_ref().map(|s| s.message.msg_type)
    }

    /// Aggregated commits are decided certificates regardless of the
    /// envelope they arrived in.
    fn is_decided_like(&self) -> bool {
        match self.msg.msg_type {
            SsvMsgType::Decided => true,
            SsvMsgType::Consensus => {
                self.consensus_type() == Some(MessageType::Commit)
                    && self.signed.as_ref().is_some_and(|s| s.signers.len() > 1)
            }
            _ => false,
        }
    }

    /// Smaller is served first.
    fn priority(&self, current: Height) -> u8 {
        match self.msg.msg_type {
            SsvMsgType::Consensus | SsvMsgType::Decided => match self.height() {
                Some(h) if h == current => 0,
                // Late commits for already-decided heights keep improving
                // stored certificates.
                Some(h) if h < current && self.consensus_type() == Some(MessageType::Commit) => 1,
                Some(h) if h < current => 4,
                _ => 3, // future heights
            },
            // Post-consensus partials for decided heights are next in line.
            SsvMsgType::PartialSignature => 1,
            SsvMsgType::Sync => 2,
        }
    }
}

/// Single-producer-multi-consumer bounded queue.
#[derive(Debug)]
pub struct MsgQueue {
    inner: Mutex<VecDeque<QueuedMessage>>,
    capacity: usize,
    notify: Notify,
}

impl MsgQueue {
    pub fn new(capacity: usize) -> MsgQueue {
        MsgQueue {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Non-blocking enqueue; returns false when the queue is full or the
    /// payload of a consensus envelope fails to decode.
    pub fn try_enqueue(&self, msg: SsvMessage) -> bool {
        let signed = match msg.msg_type {
            SsvMsgType::Consensus | SsvMsgType::Decided => match msg.signed_message() {
                Ok(s) => Some(s),
                Err(err) => {
                    trace!(%err, "dropping undecodable consensus envelope");
                    metrics::record_dropped();
                    return false;
                }
            },
            _ => None,
        };

        {
            let mut inner = self.inner.lock();
            if inner.len() >= self.capacity {
                metrics::record_dropped();
                return false;
            }
            inner.push_back(QueuedMessage { msg, signed });
            metrics::set_queue_depth(inner.len());
        }
        self.notify.notify_one();
        true
    }

    /// Pop the best message for the given consumer height, if any.
    ///
    /// While no instance is running, in-flight consensus traffic for the
    /// current height stays queued: it belongs to an instance the
    /// controller has yet to start. Decided certificates, stale and future
    /// messages flow regardless.
    pub fn pop(&self, current: Height, instance_running: bool) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();
        let best = inner
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                instance_running
                    || m.is_decided_like()
                    || m.height() != Some(current)
                    || m.msg.msg_type != SsvMsgType::Consensus
            })
            .min_by_key(|(i, m)| (m.priority(current), *i))
            .map(|(i, _)| i)?;
        let msg = inner.remove(best);
        metrics::set_queue_depth(inner.len());
        msg
    }

    /// Await the next message. Consumer state is re-read on every wakeup so
    /// priorities follow the controller's progress.
    pub async fn pop_wait(
        &self,
        current: &AtomicU64,
        instance_running: &AtomicBool,
    ) -> QueuedMessage {
        loop {
            let height = Height(current.load(Ordering::Acquire));
            if let Some(msg) = self.pop(height, instance_running.load(Ordering::Acquire)) {
                return msg;
            }
            // Held messages re-rank once an instance starts; poll rather
            // than requiring an explicit wakeup from the controller.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }
        }
    }

    /// Drop every message for `identifier` at or below `height`, keeping
    /// late-arrival commits for exactly that height and partial-signature
    /// messages. Applied when an instance exits undecided.
    pub fn purge(&self, identifier: &MessageId, height: Height) {
        let mut inner = self.inner.lock();
        inner.retain(|m| {
            if m.msg.msg_id != *identifier {
                return true;
            }
            if m.msg.msg_type == SsvMsgType::PartialSignature {
                return true;
            }
            match m.height() {
                Some(h) if h > height => true,
                Some(h) => h == height && m.consensus_type() == Some(MessageType::Commit),
                None => true,
            }
        });
        metrics::set_queue_depth(inner.len());
    }

    /// Remove and return every decided certificate currently queued.
    pub fn drain_decided(&self) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock();
        let mut decided = Vec::new();
        inner.retain(|m| {
            let is_decided = m.msg.msg_type == SsvMsgType::Decided;
            if is_decided {
                decided.push(m.clone());
            }
            !is_decided
        });
        metrics::set_queue_depth(inner.len());
        decided
    }

    /// Clear everything; returns how many messages were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.len();
        inner.clear();
        metrics::set_queue_depth(0);
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
