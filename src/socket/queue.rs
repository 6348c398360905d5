//! Per-origin bookkeeping: waiting calls and the connections serving them.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::http::call::Call;
use crate::socket::conn::{ConnCommand, ConnId};

/// Effective target of a call: the origin server, or the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OriginKey {
    pub host: String,
    pub port: u16,
}

impl OriginKey {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_lowercase(), port }
    }
}

/// Pipeline-side handle to one running connection driver.
pub(crate) struct ConnSlot {
    pub id: ConnId,
    pub tx: mpsc::UnboundedSender<ConnCommand>,
    /// Calls handed to the driver and not yet finished.
    pub assigned: usize,
    /// Still accepts new assignments (false once draining or closing).
    pub accepting: bool,
}

/// FIFO of pending calls for one `(host, port)` target plus its pool of
/// connections.
pub(crate) struct OriginQueue {
    pub key: OriginKey,
    pub via_proxy: bool,
    pub waiting: VecDeque<Box<Call>>,
    pub conns: Vec<ConnSlot>,
    /// Fresh connections burnt by consecutive failures.
    pub connect_failures: u32,
    /// Most recent connection error, reported when the budget overflows.
    pub last_error: Option<crate::base::NetError>,
}

impl OriginQueue {
    pub fn new(key: OriginKey, via_proxy: bool) -> Self {
        Self {
            key,
            via_proxy,
            waiting: VecDeque::new(),
            conns: Vec::new(),
            connect_failures: 0,
            last_error: None,
        }
    }

    /// The accepting connection with the smallest backlog.
    pub fn accepting_slot(&mut self) -> Option<&mut ConnSlot> {
        self.conns
            .iter_mut()
            .filter(|s| s.accepting)
            .min_by_key(|s| s.assigned)
    }

    pub fn slot_mut(&mut self, id: ConnId) -> Option<&mut ConnSlot> {
        self.conns.iter_mut().find(|s| s.id == id)
    }

    pub fn remove_slot(&mut self, id: ConnId) {
        self.conns.retain(|s| s.id != id);
    }

    /// Work this origin still owes: waiting plus assigned calls.
    pub fn outstanding(&self) -> usize {
        self.waiting.len() + self.conns.iter().map(|s| s.assigned).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: ConnId, assigned: usize, accepting: bool) -> ConnSlot {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnSlot { id, tx, assigned, accepting }
    }

    #[test]
    fn test_origin_key_case() {
        assert_eq!(OriginKey::new("Host", 80), OriginKey::new("host", 80));
    }

    #[test]
    fn test_accepting_slot_prefers_least_loaded() {
        let mut q = OriginQueue::new(OriginKey::new("h", 80), false);
        q.conns.push(slot(1, 4, true));
        q.conns.push(slot(2, 1, true));
        q.conns.push(slot(3, 0, false));

        assert_eq!(q.accepting_slot().unwrap().id, 2);
    }

    #[test]
    fn test_outstanding_counts_waiting_and_assigned() {
        let mut q = OriginQueue::new(OriginKey::new("h", 80), false);
        q.conns.push(slot(1, 2, true));
        q.waiting
            .push_back(Box::new(crate::http::Call::get("http://h/").unwrap()));
        assert_eq!(q.outstanding(), 3);
    }

    #[test]
    fn test_remove_slot() {
        let mut q = OriginQueue::new(OriginKey::new("h", 80), false);
        q.conns.push(slot(1, 0, true));
        q.conns.push(slot(2, 0, true));
        q.remove_slot(1);
        assert!(q.slot_mut(1).is_none());
        assert!(q.slot_mut(2).is_some());
    }
}
