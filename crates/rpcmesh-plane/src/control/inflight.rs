use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use rpcmesh_core::protocol::{CallId, ConnectionId};

/// Where a routed call came from and where it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inflight {
    pub caller: ConnectionId,
    pub target: ConnectionId,
}

/// Calls routed by the plane and not yet answered.
///
/// Every removal is atomic, so exactly one of "result arrived", "target
/// disconnected", or "caller cancelled" wins for a given call.
#[derive(Default)]
pub struct InflightTable {
    calls: DashMap<CallId, Inflight>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self { calls: DashMap::new() }
    }

    /// Record a routed call. An id already in flight keeps its entry and
    /// `false` is returned.
    pub fn insert(&self, call_id: CallId, entry: Inflight) -> bool {
        match self.calls.entry(call_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Take the entry if `target` is the machine it was routed to.
    pub fn complete(&self, call_id: CallId, target: ConnectionId) -> Option<Inflight> {
        self.calls
            .remove_if(&call_id, |_, e| e.target == target)
            .map(|(_, e)| e)
    }

    /// Take the entry if `caller` issued it.
    pub fn cancel(&self, call_id: CallId, caller: ConnectionId) -> Option<Inflight> {
        self.calls
            .remove_if(&call_id, |_, e| e.caller == caller)
            .map(|(_, e)| e)
    }

    /// Take every call routed to `target`: `(call_id, caller)`.
    pub fn drain_target(&self, target: ConnectionId) -> Vec<(CallId, ConnectionId)> {
        let ids: Vec<CallId> = self
            .calls
            .iter()
            .filter(|e| e.value().target == target)
            .map(|e| *e.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.complete(id, target).map(|e| (id, e.caller)))
            .collect()
    }

    /// Take every call issued by `caller`: `(call_id, target)`.
    pub fn drain_caller(&self, caller: ConnectionId) -> Vec<(CallId, ConnectionId)> {
        let ids: Vec<CallId> = self
            .calls
            .iter()
            .filter(|e| e.value().caller == caller)
            .map(|e| *e.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.cancel(id, caller).map(|e| (id, e.target)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_from_wrong_machine_is_ignored() {
        let t = InflightTable::new();
        let entry = Inflight { caller: ConnectionId(1), target: ConnectionId(2) };
        assert!(t.insert(CallId(10), entry));
        assert!(t.complete(CallId(10), ConnectionId(3)).is_none());
        assert_eq!(t.complete(CallId(10), ConnectionId(2)), Some(entry));
        assert!(t.complete(CallId(10), ConnectionId(2)).is_none());
    }

    #[test]
    fn duplicate_id_keeps_first_entry() {
        let t = InflightTable::new();
        let first = Inflight { caller: ConnectionId(1), target: ConnectionId(2) };
        assert!(t.insert(CallId(7), first));
        assert!(!t.insert(CallId(7), Inflight { caller: ConnectionId(5), target: ConnectionId(6) }));
        assert_eq!(t.len(), 1);
        assert_eq!(t.complete(CallId(7), ConnectionId(2)), Some(first));
    }

    #[test]
    fn drains_split_by_side() {
        let t = InflightTable::new();
        t.insert(CallId(1), Inflight { caller: ConnectionId(1), target: ConnectionId(2) });
        t.insert(CallId(2), Inflight { caller: ConnectionId(2), target: ConnectionId(3) });
        t.insert(CallId(3), Inflight { caller: ConnectionId(4), target: ConnectionId(2) });

        let mut hit = t.drain_target(ConnectionId(2));
        hit.sort_by_key(|(id, _)| id.0);
        assert_eq!(hit, vec![(CallId(1), ConnectionId(1)), (CallId(3), ConnectionId(4))]);

        assert_eq!(t.drain_caller(ConnectionId(2)), vec![(CallId(2), ConnectionId(3))]);
        assert!(t.is_empty());
    }
}
