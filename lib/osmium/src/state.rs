use ferrite::time::timestamp_secs;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-agent receive tallies.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct AgentCounters {
    pub ctrl: u64,
    pub evt: u64,
}

/// Run-wide counters for the ingestion core. Everything here is monotone except
/// `tcp_active`, which tracks the live connection gauge.
pub struct State {
    uptime: u64,
    recv_bytes: AtomicU64,
    send_bytes: AtomicU64,
    recv_ctrl: AtomicU64,
    recv_evt: AtomicU64,
    recv_ping: AtomicU64,
    recv_unknown: AtomicU64,
    recv_dequeued: AtomicU64,
    keys_reload: AtomicU64,
    tcp_active: AtomicU64,
    agents: Mutex<HashMap<String, AgentCounters>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct StateSnapshot {
    pub recv_bytes: u64,
    pub send_bytes: u64,
    pub recv_ctrl: u64,
    pub recv_evt: u64,
    pub recv_ping: u64,
    pub recv_unknown: u64,
    pub recv_dequeued: u64,
    pub keys_reload: u64,
    pub tcp_active: u64,
}

impl State {
    pub fn new() -> State {
        State {
            uptime: timestamp_secs(),
            recv_bytes: AtomicU64::new(0),
            send_bytes: AtomicU64::new(0),
            recv_ctrl: AtomicU64::new(0),
            recv_evt: AtomicU64::new(0),
            recv_ping: AtomicU64::new(0),
            recv_unknown: AtomicU64::new(0),
            recv_dequeued: AtomicU64::new(0),
            keys_reload: AtomicU64::new(0),
            tcp_active: AtomicU64::new(0),
            agents: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn uptime(&self) -> u64 {
        self.uptime
    }

    #[inline]
    pub fn add_recv(&self, bytes: u64) {
        self.recv_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_send(&self, bytes: u64) {
        self.send_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_ping(&self) {
        self.recv_ping.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unknown(&self) {
        self.recv_unknown.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dequeued(&self) {
        self.recv_dequeued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_keys_reload(&self) {
        self.keys_reload.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tcp(&self) {
        self.tcp_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_tcp(&self) {
        self.tcp_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn tcp_active(&self) -> u64 {
        self.tcp_active.load(Ordering::Relaxed)
    }

    pub fn inc_ctrl(&self, agent_id: &str) {
        self.recv_ctrl.fetch_add(1, Ordering::Relaxed);
        let mut agents = self.agents.lock().expect("agent counters lock poisoned");
        match agents.get_mut(agent_id) {
            Some(counters) => counters.ctrl += 1,
            None => {
                agents.insert(agent_id.to_string(), AgentCounters { ctrl: 1, evt: 0 });
            }
        }
    }

    pub fn inc_evt(&self, agent_id: &str) {
        self.recv_evt.fetch_add(1, Ordering::Relaxed);
        let mut agents = self.agents.lock().expect("agent counters lock poisoned");
        match agents.get_mut(agent_id) {
            Some(counters) => counters.evt += 1,
            None => {
                agents.insert(agent_id.to_string(), AgentCounters { ctrl: 0, evt: 1 });
            }
        }
    }

    pub fn agent(&self, agent_id: &str) -> AgentCounters {
        let agents = self.agents.lock().expect("agent counters lock poisoned");
        agents.get(agent_id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            send_bytes: self.send_bytes.load(Ordering::Relaxed),
            recv_ctrl: self.recv_ctrl.load(Ordering::Relaxed),
            recv_evt: self.recv_evt.load(Ordering::Relaxed),
            recv_ping: self.recv_ping.load(Ordering::Relaxed),
            recv_unknown: self.recv_unknown.load(Ordering::Relaxed),
            recv_dequeued: self.recv_dequeued.load(Ordering::Relaxed),
            keys_reload: self.keys_reload.load(Ordering::Relaxed),
            tcp_active: self.tcp_active.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let state = State::new();

        state.add_recv(10);
        state.add_recv(5);
        state.inc_ping();
        state.inc_unknown();
        state.inc_tcp();
        state.inc_tcp();
        state.dec_tcp();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.recv_bytes, 15);
        assert_eq!(snapshot.recv_ping, 1);
        assert_eq!(snapshot.recv_unknown, 1);
        assert_eq!(snapshot.tcp_active, 1);
    }

    #[test]
    fn test_per_agent_counters() {
        let state = State::new();

        state.inc_ctrl("001");
        state.inc_ctrl("001");
        state.inc_evt("001");
        state.inc_evt("002");

        assert_eq!(state.agent("001"), AgentCounters { ctrl: 2, evt: 1 });
        assert_eq!(state.agent("002"), AgentCounters { ctrl: 0, evt: 1 });
        assert_eq!(state.agent("003"), AgentCounters::default());

        let snapshot = state.snapshot();
        assert_eq!(snapshot.recv_ctrl, 2);
        assert_eq!(snapshot.recv_evt, 2);
    }
}
