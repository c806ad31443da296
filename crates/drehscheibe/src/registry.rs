//! Broker-side service and worker tables.
//!
//! Pure bookkeeping, no I/O: the broker's event handlers mutate a
//! [`Registry`] behind a reader-writer lock and turn the returned decisions
//! into outgoing frames. Invariants maintained here:
//!
//! - worker identities are unique across all services
//! - every identity in a service's `waiting` queue also appears in its
//!   `workers` list, at most once
//! - `pending` is drained FIFO, and only grows while `waiting` is empty

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

// ── Records ──────────────────────────────────────────────────────────

/// Broker-side status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Working,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Working => "working",
        }
    }
}

/// One entry per connected worker, keyed by the hex form of its routing
/// identity.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub identity: String,
    pub identity_bytes: Vec<u8>,
    pub service: String,
    pub status: WorkerStatus,
    pub last_ping: Instant,
    pub expiry: Instant,
    pub liveness: u32,
    pub requests: u64,
}

/// A client request parked until a worker becomes available.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client_identity: Vec<u8>,
    pub message_id: String,
    pub service: String,
    pub body: String,
    pub overflow: Option<Vec<u8>>,
    pub enqueued_at: Instant,
}

/// A named routing target backed by zero or more workers.
#[derive(Debug, Default)]
pub struct Service {
    pub name: String,
    pub description: String,
    /// Identities of all workers offering this service, registration order.
    pub workers: Vec<String>,
    /// Idle workers awaiting dispatch, FIFO.
    pub waiting: VecDeque<String>,
    /// Requests awaiting a worker, FIFO. Client owns the timeout.
    pub pending: VecDeque<PendingRequest>,
}

// ── Snapshots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub description: String,
    pub workers: usize,
    pub waiting: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub identity: String,
    pub service: String,
    pub status: &'static str,
    pub requests: u64,
    pub last_ping_secs_ago: f64,
    /// Negative once the record is past its expiry deadline.
    pub expires_in_secs: f64,
}

// ── Registry ─────────────────────────────────────────────────────────

/// The broker's map-of-maps: services, workers, and known clients.
#[derive(Debug, Default)]
pub struct Registry {
    services: HashMap<String, Service>,
    workers: HashMap<String, WorkerRecord>,
    clients: HashMap<String, Vec<u8>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Workers ──────────────────────────────────────────────────

    /// Register a worker on READY: get-or-create the service, create or
    /// refresh the record, and append to both `workers` and `waiting`.
    pub fn register_worker(
        &mut self,
        identity: &str,
        identity_bytes: Vec<u8>,
        service: &str,
        expiry_window: Duration,
        liveness_budget: u32,
    ) {
        let now = Instant::now();
        self.workers.insert(
            identity.to_string(),
            WorkerRecord {
                identity: identity.to_string(),
                identity_bytes,
                service: service.to_string(),
                status: WorkerStatus::Ready,
                last_ping: now,
                expiry: now + expiry_window,
                liveness: liveness_budget,
                requests: 0,
            },
        );

        let entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| Service {
                name: service.to_string(),
                ..Service::default()
            });
        if !entry.workers.iter().any(|w| w == identity) {
            entry.workers.push(identity.to_string());
        }
        if !entry.waiting.iter().any(|w| w == identity) {
            entry.waiting.push_back(identity.to_string());
        }
    }

    /// Refresh a worker's liveness on HEARTBEAT / REPLY / REQUEST traffic.
    /// Returns false when the identity is unknown.
    pub fn refresh_worker(
        &mut self,
        identity: &str,
        expiry_window: Duration,
        liveness_budget: u32,
    ) -> bool {
        match self.workers.get_mut(identity) {
            Some(worker) => {
                let now = Instant::now();
                worker.last_ping = now;
                worker.expiry = now + expiry_window;
                worker.liveness = liveness_budget;
                true
            }
            None => false,
        }
    }

    /// Remove a worker from its service's `workers` and `waiting` queues and
    /// delete the record. Used by DISCONNECT and the liveness sweep.
    pub fn remove_worker(&mut self, identity: &str) -> Option<WorkerRecord> {
        let record = self.workers.remove(identity)?;
        if let Some(service) = self.services.get_mut(&record.service) {
            service.workers.retain(|w| w != identity);
            service.waiting.retain(|w| w != identity);
        }
        Some(record)
    }

    /// Return a worker to its service's waiting queue after a REPLY and mark
    /// it ready. No-op for identities already queued.
    pub fn worker_ready(&mut self, identity: &str) {
        let Some(worker) = self.workers.get_mut(identity) else {
            return;
        };
        worker.status = WorkerStatus::Ready;
        if let Some(service) = self.services.get_mut(&worker.service) {
            if !service.waiting.iter().any(|w| w == identity) {
                service.waiting.push_back(identity.to_string());
            }
        }
    }

    /// Pop the next idle worker for a queued-mode dispatch, marking it
    /// working and counting the request.
    pub fn next_waiting(&mut self, service: &str) -> Option<WorkerRecord> {
        let svc = self.services.get_mut(service)?;
        while let Some(identity) = svc.waiting.pop_front() {
            if let Some(worker) = self.workers.get_mut(&identity) {
                worker.status = WorkerStatus::Working;
                worker.requests += 1;
                return Some(worker.clone());
            }
            // Stale queue entry for an evicted worker; keep draining.
        }
        None
    }

    /// First ready worker in registration order, for direct-route dispatch.
    /// Does not change status: direct-route workers serve concurrently.
    pub fn first_ready(&mut self, service: &str) -> Option<WorkerRecord> {
        let svc = self.services.get(service)?;
        let identity = svc
            .workers
            .iter()
            .find(|id| {
                self.workers
                    .get(*id)
                    .map(|w| w.status == WorkerStatus::Ready)
                    .unwrap_or(false)
            })?
            .clone();
        let worker = self.workers.get_mut(&identity)?;
        worker.requests += 1;
        Some(worker.clone())
    }

    /// Workers whose expiry plus grace has elapsed. Eviction goes through
    /// [`Self::remove_worker`], the same path as DISCONNECT.
    pub fn expired_workers(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        self.workers
            .values()
            .filter(|w| now > w.expiry + grace)
            .map(|w| w.identity.clone())
            .collect()
    }

    pub fn worker(&self, identity: &str) -> Option<&WorkerRecord> {
        self.workers.get(identity)
    }

    // ── Pending requests ─────────────────────────────────────────

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn enqueue_pending(&mut self, request: PendingRequest) {
        let entry = self
            .services
            .entry(request.service.clone())
            .or_insert_with(|| Service {
                name: request.service.clone(),
                ..Service::default()
            });
        entry.pending.push_back(request);
    }

    pub fn pop_pending(&mut self, service: &str) -> Option<PendingRequest> {
        self.services.get_mut(service)?.pending.pop_front()
    }

    /// Return a popped request to the head of its queue, preserving FIFO
    /// order when no worker turned out to be available.
    pub fn requeue_front(&mut self, request: PendingRequest) {
        if let Some(svc) = self.services.get_mut(&request.service) {
            svc.pending.push_front(request);
        }
    }

    // ── Clients ──────────────────────────────────────────────────

    /// Remember a client's routing identity, refreshed on every REQ.
    pub fn record_client(&mut self, client_id: &str, identity_bytes: Vec<u8>) {
        self.clients.insert(client_id.to_string(), identity_bytes);
    }

    pub fn client_identity(&self, client_id: &str) -> Option<&Vec<u8>> {
        self.clients.get(client_id)
    }

    // ── Snapshots ────────────────────────────────────────────────

    pub fn service_snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut list: Vec<ServiceSnapshot> = self
            .services
            .values()
            .map(|s| ServiceSnapshot {
                name: s.name.clone(),
                description: s.description.clone(),
                workers: s.workers.len(),
                waiting: s.waiting.len(),
                pending: s.pending.len(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let mut list: Vec<WorkerSnapshot> = self
            .workers
            .values()
            .map(|w| WorkerSnapshot {
                identity: w.identity.clone(),
                service: w.service.clone(),
                status: w.status.as_str(),
                requests: w.requests,
                last_ping_secs_ago: now.duration_since(w.last_ping).as_secs_f64(),
                expires_in_secs: if w.expiry > now {
                    w.expiry.duration_since(now).as_secs_f64()
                } else {
                    -now.duration_since(w.expiry).as_secs_f64()
                },
            })
            .collect();
        list.sort_by(|a, b| a.identity.cmp(&b.identity));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(25_000);
    const BUDGET: u32 = 10;

    fn pending(service: &str, id: &str) -> PendingRequest {
        PendingRequest {
            client_identity: vec![9, 9],
            message_id: id.to_string(),
            service: service.to_string(),
            body: "{}".into(),
            overflow: None,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn register_creates_service_and_queues_worker() {
        let mut reg = Registry::new();
        reg.register_worker("aa01", vec![0xaa, 0x01], "echo", WINDOW, BUDGET);

        assert!(reg.has_service("echo"));
        let snap = &reg.service_snapshots()[0];
        assert_eq!((snap.workers, snap.waiting), (1, 1));
        assert_eq!(reg.worker("aa01").unwrap().status, WorkerStatus::Ready);
    }

    #[test]
    fn reregister_does_not_duplicate_queue_entries() {
        let mut reg = Registry::new();
        reg.register_worker("aa01", vec![0xaa, 0x01], "echo", WINDOW, BUDGET);
        reg.register_worker("aa01", vec![0xaa, 0x01], "echo", WINDOW, BUDGET);

        let snap = &reg.service_snapshots()[0];
        assert_eq!((snap.workers, snap.waiting), (1, 1));
    }

    #[test]
    fn dispatch_pops_fifo_and_marks_working() {
        let mut reg = Registry::new();
        reg.register_worker("w1", vec![1], "echo", WINDOW, BUDGET);
        reg.register_worker("w2", vec![2], "echo", WINDOW, BUDGET);

        let first = reg.next_waiting("echo").unwrap();
        assert_eq!(first.identity, "w1");
        assert_eq!(first.status, WorkerStatus::Working);
        assert_eq!(reg.next_waiting("echo").unwrap().identity, "w2");
        assert!(reg.next_waiting("echo").is_none());
    }

    #[test]
    fn worker_ready_requeues_at_most_once() {
        let mut reg = Registry::new();
        reg.register_worker("w1", vec![1], "echo", WINDOW, BUDGET);
        let _ = reg.next_waiting("echo");

        reg.worker_ready("w1");
        reg.worker_ready("w1");

        let snap = &reg.service_snapshots()[0];
        assert_eq!(snap.waiting, 1);
        assert_eq!(reg.worker("w1").unwrap().status, WorkerStatus::Ready);
    }

    #[test]
    fn remove_clears_both_queues() {
        let mut reg = Registry::new();
        reg.register_worker("w1", vec![1], "echo", WINDOW, BUDGET);
        let removed = reg.remove_worker("w1").unwrap();
        assert_eq!(removed.service, "echo");

        let snap = &reg.service_snapshots()[0];
        assert_eq!((snap.workers, snap.waiting), (0, 0));
        assert!(reg.remove_worker("w1").is_none());
    }

    #[test]
    fn pending_is_fifo() {
        let mut reg = Registry::new();
        reg.enqueue_pending(pending("slow", "m1"));
        reg.enqueue_pending(pending("slow", "m2"));

        assert_eq!(reg.pop_pending("slow").unwrap().message_id, "m1");
        assert_eq!(reg.pop_pending("slow").unwrap().message_id, "m2");
        assert!(reg.pop_pending("slow").is_none());
    }

    #[test]
    fn expiry_respects_grace_period() {
        let mut reg = Registry::new();
        reg.register_worker("w1", vec![1], "echo", Duration::ZERO, BUDGET);

        // Expired but still inside the grace window.
        assert!(reg.expired_workers(Duration::from_secs(60)).is_empty());
        // Grace elapsed.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(reg.expired_workers(Duration::ZERO), vec!["w1".to_string()]);
    }

    #[test]
    fn first_ready_skips_working_workers() {
        let mut reg = Registry::new();
        reg.register_worker("w1", vec![1], "hub.control", WINDOW, BUDGET);
        reg.register_worker("w2", vec![2], "hub.control", WINDOW, BUDGET);

        reg.workers.get_mut("w1").unwrap().status = WorkerStatus::Working;
        assert_eq!(reg.first_ready("hub.control").unwrap().identity, "w2");

        reg.workers.get_mut("w2").unwrap().status = WorkerStatus::Working;
        assert!(reg.first_ready("hub.control").is_none());
    }

    #[test]
    fn stale_waiting_entries_are_skipped() {
        let mut reg = Registry::new();
        reg.register_worker("w1", vec![1], "echo", WINDOW, BUDGET);
        reg.register_worker("w2", vec![2], "echo", WINDOW, BUDGET);
        // Evict w1 without going through the queue.
        reg.workers.remove("w1");

        assert_eq!(reg.next_waiting("echo").unwrap().identity, "w2");
    }

    #[test]
    fn records_latest_client_identity() {
        let mut reg = Registry::new();
        reg.record_client("ab01", vec![0xab, 0x01]);
        reg.record_client("ab01", vec![0xab, 0x02]);
        assert_eq!(reg.client_identity("ab01").unwrap(), &vec![0xab, 0x02]);
        assert!(reg.client_identity("unknown").is_none());
    }
}
