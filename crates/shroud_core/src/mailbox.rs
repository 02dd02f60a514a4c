//! Mailbox transport contract and the in-memory reference substrate.
//!
//! The engines only ever call `send` and `recv`. The contract: per ordered
//! (sender, receiver) pair delivery is FIFO, duplicates are permitted, and
//! messages may be lost; the protocol's timeouts compensate. `recv` may
//! yield briefly when nothing is pending; it is the engines' only
//! suspension point.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::messages::{PeerId, WireMsg};
use crate::ProtocolError;

pub trait Mailbox {
    /// Enqueue `msg` for delivery to `to`. Returns once the transport has
    /// accepted the message; delivery itself is best-effort.
    fn send(&mut self, to: &str, msg: WireMsg) -> Result<(), ProtocolError>;

    /// Next message addressed to this endpoint, or `None` when the mailbox
    /// is currently empty.
    fn recv(&mut self) -> Option<(PeerId, WireMsg)>;
}

type FaultPredicate = Box<dyn Fn(&str, &str, &WireMsg) -> bool + Send>;

struct DropRule {
    remaining: usize,
    matches: FaultPredicate,
}

struct HoldRule {
    release_at: Instant,
    matches: FaultPredicate,
    held: Vec<(String, PeerId, WireMsg)>,
}

#[derive(Default)]
struct HubState {
    queues: HashMap<String, VecDeque<(PeerId, WireMsg)>>,
    drops: Vec<DropRule>,
    holds: Vec<HoldRule>,
}

impl HubState {
    fn release_due(&mut self, now: Instant) {
        for rule in &mut self.holds {
            if now >= rule.release_at {
                for (to, from, msg) in rule.held.drain(..) {
                    self.queues.entry(to).or_default().push_back((from, msg));
                }
            }
        }
        self.holds
            .retain(|r| now < r.release_at || !r.held.is_empty());
    }

    fn route(&mut self, from: &str, to: &str, msg: WireMsg) {
        for rule in &mut self.drops {
            if rule.remaining > 0 && (rule.matches)(from, to, &msg) {
                rule.remaining -= 1;
                debug!("hub: dropping message {from} -> {to}");
                return;
            }
        }
        let now = Instant::now();
        for rule in &mut self.holds {
            if now < rule.release_at && (rule.matches)(from, to, &msg) {
                debug!("hub: holding message {from} -> {to}");
                rule.held.push((to.to_string(), from.to_string(), msg));
                return;
            }
        }
        self.queues
            .entry(to.to_string())
            .or_default()
            .push_back((from.to_string(), msg));
    }
}

/// Process-local message hub. Endpoints share one locked queue table, which
/// makes the hub double as a fault injector: sends can be dropped or held
/// back to reproduce lossy and slow transports.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    poll_interval: Duration,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            poll_interval: Duration::from_micros(500),
        }
    }

    /// Create (or reattach to) the endpoint for `id`.
    pub fn endpoint(&self, id: &str) -> MemoryMailbox {
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(id.to_string())
            .or_default();
        MemoryMailbox {
            id: id.to_string(),
            state: Arc::clone(&self.state),
            poll_interval: self.poll_interval,
        }
    }

    /// Silently discard the next `count` sends matching the predicate
    /// `(sender, recipient, message)`.
    pub fn drop_next_matching(
        &self,
        count: usize,
        matches: impl Fn(&str, &str, &WireMsg) -> bool + Send + 'static,
    ) {
        self.state.lock().unwrap().drops.push(DropRule {
            remaining: count,
            matches: Box::new(matches),
        });
    }

    /// Hold back every matching send and deliver it only after `delay` has
    /// elapsed, simulating a slow path.
    pub fn hold_matching_for(
        &self,
        delay: Duration,
        matches: impl Fn(&str, &str, &WireMsg) -> bool + Send + 'static,
    ) {
        self.state.lock().unwrap().holds.push(HoldRule {
            release_at: Instant::now() + delay,
            matches: Box::new(matches),
            held: Vec::new(),
        });
    }
}

pub struct MemoryMailbox {
    id: String,
    state: Arc<Mutex<HubState>>,
    poll_interval: Duration,
}

impl MemoryMailbox {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Mailbox for MemoryMailbox {
    fn send(&mut self, to: &str, msg: WireMsg) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        state.release_due(Instant::now());
        state.route(&self.id, to, msg);
        Ok(())
    }

    fn recv(&mut self) -> Option<(PeerId, WireMsg)> {
        let popped = {
            let mut state = self.state.lock().unwrap();
            state.release_due(Instant::now());
            state.queues.get_mut(&self.id).and_then(VecDeque::pop_front)
        };
        if popped.is_none() {
            // Idle: yield outside the lock so other participants progress.
            std::thread::sleep(self.poll_interval);
        }
        popped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PeerMsg;

    fn request() -> WireMsg {
        WireMsg::Peer(PeerMsg::Request)
    }

    #[test]
    fn delivery_is_fifo_per_sender() {
        let hub = MemoryHub::new();
        let mut a = hub.endpoint("a");
        let mut b = hub.endpoint("b");
        for _ in 0..3 {
            a.send("b", request()).unwrap();
        }
        for _ in 0..3 {
            let (from, _) = b.recv().expect("message should be queued");
            assert_eq!(from, "a");
        }
        assert!(b.recv().is_none());
    }

    #[test]
    fn drop_rule_consumes_only_the_requested_count() {
        let hub = MemoryHub::new();
        hub.drop_next_matching(1, |_, _, _| true);
        let mut a = hub.endpoint("a");
        let mut b = hub.endpoint("b");
        a.send("b", request()).unwrap();
        a.send("b", request()).unwrap();
        assert!(b.recv().is_some());
        assert!(b.recv().is_none());
    }

    #[test]
    fn held_messages_are_released_after_the_delay() {
        let hub = MemoryHub::new();
        hub.hold_matching_for(Duration::from_millis(30), |_, _, _| true);
        let mut a = hub.endpoint("a");
        let mut b = hub.endpoint("b");
        a.send("b", request()).unwrap();
        assert!(b.recv().is_none());
        std::thread::sleep(Duration::from_millis(40));
        assert!(b.recv().is_some());
    }
}
