use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use rpcmesh_core::protocol::{Call, ConnectionId, Frame};

/// One machine's outbound frame queue.
#[derive(Clone)]
pub struct Connection {
    pub tx: mpsc::Sender<Frame>,
}

/// Identity recorded at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub connection_id: ConnectionId,
    pub machine_id: String,
    pub machine_type: String,
    pub deployment_id: Option<String>,
    pub environment: String,
}

struct MachineEntry {
    info: Arc<MachineInfo>,
    conn: Connection,
    /// service -> offered function names
    services: DashMap<String, Arc<HashSet<String>>>,
}

impl MachineEntry {
    fn eligible(&self, call: &Call, environment: &str) -> bool {
        if self.info.environment != environment {
            return false;
        }
        if let Some(mt) = &call.machine_type {
            if *mt != self.info.machine_type {
                return false;
            }
        }
        if let Some(dep) = &call.deployment_id {
            if self.info.deployment_id.as_ref() != Some(dep) {
                return false;
            }
        }
        self.services
            .get(&call.service)
            .is_some_and(|fns| fns.contains(&call.function))
    }
}

/// Machine registry:
/// - `connection_id -> machine (identity, queue, services)`
/// - `service -> {connection_id...}`
/// - `routing class -> round-robin cursor`
#[derive(Default)]
pub struct MachineRegistry {
    machines: DashMap<ConnectionId, MachineEntry>,
    service_index: DashMap<String, DashSet<ConnectionId>>,
    cursors: DashMap<String, AtomicU64>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self {
            machines: DashMap::new(),
            service_index: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    pub fn insert(&self, info: MachineInfo, conn: Connection) {
        let id = info.connection_id;
        self.machines.insert(
            id,
            MachineEntry {
                info: Arc::new(info),
                conn,
                services: DashMap::new(),
            },
        );
    }

    /// Drop a machine and every service it offered.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<MachineInfo>> {
        let (_, entry) = self.machines.remove(&id)?;
        for svc in entry.services.iter() {
            self.unindex(svc.key(), id);
        }
        Some(entry.info)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.machines.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn info(&self, id: ConnectionId) -> Option<Arc<MachineInfo>> {
        self.machines.get(&id).map(|e| Arc::clone(&e.info))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.machines.get(&id).map(|e| e.conn.clone())
    }

    /// Offer (or re-offer) a service. Returns false if the machine is gone.
    pub fn add_service(&self, id: ConnectionId, service: &str, functions: Vec<String>) -> bool {
        let Some(entry) = self.machines.get(&id) else { return false; };
        entry
            .services
            .insert(service.to_string(), Arc::new(functions.into_iter().collect()));
        drop(entry);

        self.service_index
            .entry(service.to_string())
            .or_insert_with(DashSet::new)
            .insert(id);
        true
    }

    /// Withdraw a service. Returns whether it was offered.
    pub fn remove_service(&self, id: ConnectionId, service: &str) -> bool {
        let removed = self
            .machines
            .get(&id)
            .and_then(|e| e.services.remove(service))
            .is_some();
        self.unindex(service, id);
        removed
    }

    pub fn services_of(&self, id: ConnectionId) -> Vec<String> {
        let Some(entry) = self.machines.get(&id) else { return vec![]; };
        let mut out: Vec<String> = entry.services.iter().map(|s| s.key().clone()).collect();
        out.sort();
        out
    }

    /// Pick an eligible machine for `call`, rotating among candidates.
    ///
    /// Candidates are ordered by connection id and each routing class
    /// (environment, service, function, constraints) keeps its own cursor, so
    /// every eligible instance of a class is chosen in turn.
    pub fn select(&self, call: &Call, environment: &str) -> Option<ConnectionId> {
        let set = self.service_index.get(&call.service)?;
        let mut ids: Vec<ConnectionId> = set.iter().map(|c| *c.key()).collect();
        drop(set);

        ids.retain(|id| {
            self.machines
                .get(id)
                .is_some_and(|e| e.eligible(call, environment))
        });
        if ids.is_empty() {
            return None;
        }
        ids.sort();

        let class = format!(
            "{environment}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
            call.service,
            call.function,
            call.machine_type.as_deref().unwrap_or(""),
            call.deployment_id.as_deref().unwrap_or("")
        );
        let turn = self
            .cursors
            .entry(class)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        ids.get((turn % ids.len() as u64) as usize).copied()
    }

    fn unindex(&self, service: &str, id: ConnectionId) {
        if let Some(set) = self.service_index.get(service) {
            set.remove(&id);
            if set.is_empty() {
                drop(set);
                self.service_index.remove_if(service, |_, s| s.is_empty());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmesh_core::protocol::CallId;

    fn machine(reg: &MachineRegistry, id: u64, machine_type: &str, deployment: Option<&str>) {
        let (tx, _rx) = mpsc::channel(1);
        reg.insert(
            MachineInfo {
                connection_id: ConnectionId(id),
                machine_id: format!("m{id}"),
                machine_type: machine_type.into(),
                deployment_id: deployment.map(str::to_string),
                environment: "default".into(),
            },
            Connection { tx },
        );
    }

    fn call(service: &str, function: &str) -> Call {
        Call {
            call_id: CallId(1),
            service: service.into(),
            function: function.into(),
            args: vec![],
            machine_type: None,
            deployment_id: None,
        }
    }

    #[test]
    fn round_robin_visits_every_instance() {
        let reg = MachineRegistry::new();
        for id in 1..=3 {
            machine(&reg, id, "worker", None);
            assert!(reg.add_service(ConnectionId(id), "echo", vec!["echo".into()]));
        }
        let picks: Vec<_> = (0..6).filter_map(|_| reg.select(&call("echo", "echo"), "default")).collect();
        assert_eq!(picks.len(), 6);
        for id in 1..=3 {
            assert_eq!(picks.iter().filter(|p| **p == ConnectionId(id)).count(), 2);
        }
    }

    #[test]
    fn constraints_filter_candidates() {
        let reg = MachineRegistry::new();
        machine(&reg, 1, "greeter", Some("v1"));
        machine(&reg, 2, "counter", Some("v2"));
        reg.add_service(ConnectionId(1), "svc", vec!["f".into()]);
        reg.add_service(ConnectionId(2), "svc", vec!["f".into()]);

        let mut c = call("svc", "f");
        c.machine_type = Some("counter".into());
        for _ in 0..4 {
            assert_eq!(reg.select(&c, "default"), Some(ConnectionId(2)));
        }

        let mut c = call("svc", "f");
        c.deployment_id = Some("v1".into());
        assert_eq!(reg.select(&c, "default"), Some(ConnectionId(1)));

        assert_eq!(reg.select(&call("svc", "missing"), "default"), None);
        assert_eq!(reg.select(&call("svc", "f"), "staging"), None);
    }

    #[test]
    fn remove_clears_service_index() {
        let reg = MachineRegistry::new();
        machine(&reg, 1, "worker", None);
        reg.add_service(ConnectionId(1), "echo", vec!["echo".into()]);
        assert_eq!(reg.services_of(ConnectionId(1)), vec!["echo".to_string()]);

        assert!(reg.remove(ConnectionId(1)).is_some());
        assert_eq!(reg.select(&call("echo", "echo"), "default"), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn withdrawn_service_is_not_routed() {
        let reg = MachineRegistry::new();
        machine(&reg, 1, "worker", None);
        reg.add_service(ConnectionId(1), "echo", vec!["echo".into()]);
        assert!(reg.remove_service(ConnectionId(1), "echo"));
        assert!(!reg.remove_service(ConnectionId(1), "echo"));
        assert_eq!(reg.select(&call("echo", "echo"), "default"), None);
    }
}
