//! Per-attribute serialization of GATT operations.
//!
//! Operations are queued under an [`OpKey`] (peripheral, target, kind). At
//! most one operation per key is handed to the native stack at a time;
//! operations on different keys run concurrently. Every operation carries a
//! globally increasing token so completions can be matched to the request
//! that is actually in flight, and so cancellation can resolve outstanding
//! operations in the order they were issued.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::ble::address::PeripheralId;
use crate::ble::gatt::Handle;
use crate::error::{Error, Result};

/// Category of a GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OpKind {
    DiscoverServices,
    DiscoverIncludedServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    Read,
    Write,
    /// Subscribe and unsubscribe share a queue so they apply in order.
    Notify,
}

/// What an operation acts upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    Peripheral,
    Attribute(Handle),
}

/// Serialization key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OpKey {
    pub peripheral: PeripheralId,
    pub target: Target,
    pub kind: OpKind,
}

impl OpKey {
    pub fn new(peripheral: PeripheralId, target: Target, kind: OpKind) -> Self {
        Self {
            peripheral,
            target,
            kind,
        }
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Target::Peripheral => write!(f, "{}/{:?}", self.peripheral, self.kind),
            Target::Attribute(handle) => {
                write!(f, "{}/{}/{:?}", self.peripheral, handle, self.kind)
            }
        }
    }
}

/// A queued operation.
#[derive(Debug)]
pub(crate) struct PendingOperation<R, O> {
    pub token: u64,
    pub request: R,
    reply: oneshot::Sender<Result<O>>,
    in_flight: Option<AbortHandle>,
}

impl<R, O> PendingOperation<R, O> {
    /// Deliver the result to the issuer. A dropped receiver is ignored.
    pub fn resolve(self, result: Result<O>) {
        let _ = self.reply.send(result);
    }
}

/// FIFO queues of pending operations, one per key.
#[derive(Debug)]
pub(crate) struct Dispatcher<R, O> {
    queues: HashMap<OpKey, VecDeque<PendingOperation<R, O>>>,
    next_token: u64,
}

impl<R, O> Default for Dispatcher<R, O> {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            next_token: 0,
        }
    }
}

impl<R: Clone, O> Dispatcher<R, O> {
    /// Queue an operation and return its token.
    pub fn enqueue(&mut self, key: OpKey, request: R, reply: oneshot::Sender<Result<O>>) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        let queue = self.queues.entry(key.clone()).or_default();
        queue.push_back(PendingOperation {
            token,
            request,
            reply,
            in_flight: None,
        });
        trace!("Queued operation {} on {} (depth {})", token, key, queue.len());
        token
    }

    /// The head of `key`'s queue, if it is waiting to be started.
    pub fn ready(&self, key: &OpKey) -> Option<(u64, R)> {
        let head = self.queues.get(key)?.front()?;
        if head.in_flight.is_some() {
            return None;
        }
        Some((head.token, head.request.clone()))
    }

    /// Record that the head of `key`'s queue was handed to the native stack.
    pub fn mark_in_flight(&mut self, key: &OpKey, token: u64, task: AbortHandle) {
        match self.queues.get_mut(key).and_then(|q| q.front_mut()) {
            Some(head) if head.token == token => head.in_flight = Some(task),
            _ => task.abort(),
        }
    }

    /// Remove the head of `key`'s queue if it carries `token`.
    ///
    /// Returns `None` for stale completions, e.g. of operations that were
    /// already cancelled.
    pub fn complete(&mut self, key: &OpKey, token: u64) -> Option<PendingOperation<R, O>> {
        let queue = self.queues.get_mut(key)?;
        if queue.front().map(|op| op.token) != Some(token) {
            debug!("Ignoring stale completion {} on {}", token, key);
            return None;
        }
        let op = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        op
    }

    /// Remove every operation of a peripheral, in issuance order.
    ///
    /// Native tasks still in flight are aborted; their completions will be
    /// ignored as stale.
    pub fn cancel_peripheral(&mut self, peripheral: &PeripheralId) -> Vec<PendingOperation<R, O>> {
        let keys: Vec<OpKey> = self
            .queues
            .keys()
            .filter(|key| &key.peripheral == peripheral)
            .cloned()
            .collect();

        let mut cancelled: Vec<PendingOperation<R, O>> = keys
            .iter()
            .filter_map(|key| self.queues.remove(key))
            .flatten()
            .collect();
        cancelled.sort_by_key(|op| op.token);

        for op in &mut cancelled {
            if let Some(task) = op.in_flight.take() {
                task.abort();
            }
        }
        if !cancelled.is_empty() {
            debug!(
                "Cancelled {} pending operations on {}",
                cancelled.len(),
                peripheral
            );
        }
        cancelled
    }

    /// Fail every operation of a peripheral with `error`, in issuance order.
    pub fn fail_peripheral(&mut self, peripheral: &PeripheralId, error: &Error) {
        for op in self.cancel_peripheral(peripheral) {
            op.resolve(Err(error.clone()));
        }
    }

    /// Number of pending operations for a peripheral.
    #[cfg(test)]
    pub fn pending(&self, peripheral: &PeripheralId) -> usize {
        self.queues
            .iter()
            .filter(|(key, _)| &key.peripheral == peripheral)
            .map(|(_, queue)| queue.len())
            .sum()
    }

    /// Peripherals with pending operations.
    pub fn peripherals(&self) -> Vec<PeripheralId> {
        let mut ids: Vec<PeripheralId> = self.queues.keys().map(|k| k.peripheral.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type TestDispatcher = Dispatcher<&'static str, u32>;

    fn key(kind: OpKind, handle: u32) -> OpKey {
        OpKey::new(
            PeripheralId::new("aabbccddeeff"),
            Target::Attribute(Handle::from_raw(handle)),
            kind,
        )
    }

    #[tokio::test]
    async fn test_fifo_per_key() {
        let mut dispatcher = TestDispatcher::default();
        let read = key(OpKind::Read, 1);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        let first = dispatcher.enqueue(read.clone(), "first", tx1);
        let second = dispatcher.enqueue(read.clone(), "second", tx2);
        assert!(first < second);

        assert_eq!(dispatcher.ready(&read), Some((first, "first")));
        let task = tokio::spawn(async {});
        dispatcher.mark_in_flight(&read, first, task.abort_handle());
        assert_eq!(dispatcher.ready(&read), None);

        let op = dispatcher.complete(&read, first).unwrap();
        assert_eq!(op.request, "first");
        assert_eq!(dispatcher.ready(&read), Some((second, "second")));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut dispatcher = TestDispatcher::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        dispatcher.enqueue(key(OpKind::Read, 1), "read", tx1);
        dispatcher.enqueue(key(OpKind::Write, 1), "write", tx2);

        assert!(dispatcher.ready(&key(OpKind::Read, 1)).is_some());
        assert!(dispatcher.ready(&key(OpKind::Write, 1)).is_some());
        assert_eq!(dispatcher.pending(&PeripheralId::new("aabbccddeeff")), 2);
    }

    #[test]
    fn test_stale_completion_ignored() {
        let mut dispatcher = TestDispatcher::default();
        let read = key(OpKind::Read, 1);
        let (tx, _rx) = oneshot::channel();
        let token = dispatcher.enqueue(read.clone(), "read", tx);

        assert!(dispatcher.complete(&read, token + 1).is_none());
        assert!(dispatcher.complete(&read, token).is_some());
        assert!(dispatcher.complete(&read, token).is_none());
    }

    #[tokio::test]
    async fn test_fail_peripheral_in_issuance_order() {
        let mut dispatcher = TestDispatcher::default();
        let peripheral = PeripheralId::new("aabbccddeeff");
        let mut receivers = Vec::new();

        for (i, kind) in [OpKind::Write, OpKind::Read, OpKind::Write, OpKind::Notify]
            .into_iter()
            .enumerate()
        {
            let (tx, rx) = oneshot::channel();
            dispatcher.enqueue(key(kind, i as u32 % 2 + 1), "op", tx);
            receivers.push(rx);
        }
        let (tx, other_rx) = oneshot::channel();
        dispatcher.enqueue(
            OpKey::new(PeripheralId::new("001122334455"), Target::Peripheral, OpKind::Read),
            "other",
            tx,
        );

        let cancelled = dispatcher.cancel_peripheral(&peripheral);
        let tokens: Vec<u64> = cancelled.iter().map(|op| op.token).collect();
        assert_eq!(tokens, vec![1, 2, 3, 4]);
        for op in cancelled {
            op.resolve(Err(Error::Disconnected));
        }

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(Error::Disconnected));
        }
        assert_eq!(dispatcher.pending(&peripheral), 0);
        assert_eq!(
            dispatcher.peripherals(),
            vec![PeripheralId::new("001122334455")]
        );
        drop(other_rx);
    }
}
