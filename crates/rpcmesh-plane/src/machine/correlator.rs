use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use rpcmesh_core::error::ErrorDescriptor;
use rpcmesh_core::protocol::{CallId, CallResult, Frame};

/// Pending-call table: call id -> waiting caller.
///
/// Contention is per key; there is no global lock on the hot path.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<DashMap<CallId, oneshot::Sender<CallResult>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self { pending: Arc::new(DashMap::new()) }
    }

    /// Start waiting for `call_id`. If the returned guard is dropped before a
    /// result arrives, the entry is removed and, when `cancel_to` is given, a
    /// `Cancel` frame is queued so the remote side can abandon the work.
    pub fn register(&self, call_id: CallId, cancel_to: Option<mpsc::Sender<Frame>>) -> Pending {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);
        Pending {
            call_id,
            rx,
            pending: Arc::clone(&self.pending),
            cancel_to,
            settled: false,
        }
    }

    /// Hand a result to its waiter. Returns false for unknown or late ids.
    pub fn resolve(&self, result: CallResult) -> bool {
        match self.pending.remove(&result.call_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter (connection lost).
    pub fn fail_all(&self, desc: &ErrorDescriptor) -> usize {
        let ids: Vec<CallId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                if tx.send(CallResult::err(id, desc.clone())).is_ok() {
                    failed += 1;
                }
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One outstanding call.
pub struct Pending {
    call_id: CallId,
    rx: oneshot::Receiver<CallResult>,
    pending: Arc<DashMap<CallId, oneshot::Sender<CallResult>>>,
    cancel_to: Option<mpsc::Sender<Frame>>,
    settled: bool,
}

impl Pending {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Wait for the result. `None` means the table was torn down.
    pub async fn wait(&mut self) -> Option<CallResult> {
        let res = (&mut self.rx).await.ok();
        self.settled = true;
        res
    }

    /// Give up on the call and tell the plane.
    pub fn cancel(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        if self.pending.remove(&self.call_id).is_some() {
            if let Some(tx) = &self.cancel_to {
                let _ = tx.try_send(Frame::Cancel { call_id: self.call_id });
            }
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmesh_core::protocol::Envelope;
    use bytes::Bytes;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let c = Correlator::new();
        let mut p = c.register(CallId(1), None);
        let res = CallResult::ok(CallId(1), Envelope::plain(Bytes::from_static(&[1])));
        assert!(c.resolve(res.clone()));
        assert!(!c.resolve(res.clone()));
        assert_eq!(p.wait().await, Some(res));
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn dropped_waiter_frees_slot_and_sends_cancel() {
        let c = Correlator::new();
        let (tx, mut rx) = mpsc::channel(4);
        let p = c.register(CallId(7), Some(tx));
        assert_eq!(c.len(), 1);
        drop(p);
        assert!(c.is_empty());
        assert_eq!(rx.recv().await, Some(Frame::Cancel { call_id: CallId(7) }));
    }

    #[tokio::test]
    async fn fail_all_unblocks_everyone() {
        let c = Correlator::new();
        let mut a = c.register(CallId(1), None);
        let mut b = c.register(CallId(2), None);
        let desc = ErrorDescriptor::new("TransportError", "gone");
        assert_eq!(c.fail_all(&desc), 2);
        assert_eq!(a.wait().await.map(|r| r.outcome), Some(Err(desc.clone())));
        assert_eq!(b.wait().await.map(|r| r.outcome), Some(Err(desc)));
    }
}
