//! Correlates broker acknowledgements with the requests that caused them.
//!
//! `rumqttc` hands out packet ids only when a request leaves the event loop,
//! as an `Outgoing` event. Requests leave in the order they were queued, so
//! each `Outgoing` event claims the oldest queued handler of its kind and
//! parks it under the packet id until the matching ack arrives.

use std::collections::{HashMap, VecDeque};

use tracing::{trace, warn};

use super::error::TransferError;

/// Called once with the outcome of a publish, subscribe or unsubscribe.
pub type AckHandler = Box<dyn FnOnce(Result<(), TransferError>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

#[derive(Default)]
pub(crate) struct AckTracker {
    queued: HashMap<AckKind, VecDeque<AckHandler>>,
    inflight: HashMap<(AckKind, u16), AckHandler>,
}

impl AckTracker {
    /// Registers the handler of a request about to be queued.
    pub(crate) fn enqueue(&mut self, kind: AckKind, handler: AckHandler) {
        self.queued.entry(kind).or_default().push_back(handler);
    }

    /// Takes back the most recent handler of `kind`, when queueing its
    /// request failed.
    pub(crate) fn withdraw_last(&mut self, kind: AckKind) -> Option<AckHandler> {
        self.queued.get_mut(&kind).and_then(VecDeque::pop_back)
    }

    /// A request of `kind` left with packet id `pkid`. Packet id 0 is a
    /// QoS 0 publish: nothing will acknowledge it, so it completes now.
    pub(crate) fn sent(&mut self, kind: AckKind, pkid: u16) {
        let Some(handler) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            trace!("outgoing {:?} {} was not requested through this session", kind, pkid);
            return;
        };

        if pkid == 0 {
            handler(Ok(()));
        } else if let Some(previous) = self.inflight.insert((kind, pkid), handler) {
            warn!("packet id {} reused while still in flight", pkid);
            previous(Err(TransferError::ConnectionClosed));
        }
    }

    /// The broker acknowledged packet `pkid`.
    pub(crate) fn acknowledged(&mut self, kind: AckKind, pkid: u16, outcome: Result<(), TransferError>) {
        match self.inflight.remove(&(kind, pkid)) {
            Some(handler) => handler(outcome),
            None => trace!("{:?} ack for unknown packet id {}", kind, pkid),
        }
    }

    /// Fails everything still waiting. Used when the connection ends.
    pub(crate) fn fail_all(&mut self) {
        let queued = self.queued.drain().flat_map(|(_, handlers)| handlers);
        let inflight = self.inflight.drain().map(|(_, handler)| handler);
        for handler in queued.chain(inflight).collect::<Vec<_>>() {
            handler(Err(TransferError::ConnectionClosed));
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum::<usize>() + self.inflight.len()
    }
}
