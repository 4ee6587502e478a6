//! Broadcast transports. The node only needs two primitives: publish a
//! multipart frame stack to every subscriber, and poll for inbound stacks.
//! Delivery of a node's own traffic back to itself is not the transport's
//! job; the node loops its messages back synchronously when it publishes.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

use net2::UdpBuilder;
use rand::Rng;

/// Broadcast-send plus polling receive.
pub trait Transport {
    fn publish(&mut self, frames: &[String]);

    /// Waits up to `timeout` for one inbound frame stack.
    fn recv_timeout(&mut self, timeout: Duration) -> Option<Vec<String>>;

    fn close(&mut self) {}
}

/// UDP multicast transport: one socket sends to the group, a second,
/// reuse-address socket joins the group and receives. The whole frame stack
/// rides in a single datagram as a JSON array of frames. Multicast
/// self-loop stays off because the node already hears its own messages.
pub struct UdpTransport {
    group: SocketAddrV4,
    sender: UdpSocket,
    receiver: UdpSocket,
}

impl UdpTransport {
    pub fn new(group: SocketAddrV4) -> Self {
        // The sending socket just needs any local port.
        let sender = UdpSocket::bind("0.0.0.0:0").expect("Could not bind the sending socket");
        sender
            .set_multicast_loop_v4(false)
            .expect("Could not configure multicast loopback");

        // Several processes on one host may join the same group, so the
        // receiving socket must share its address.
        let receiver = UdpBuilder::new_v4()
            .expect("Could not construct UdpBuilder")
            .reuse_address(true)
            .expect("Could not reuse address")
            .bind(&group)
            .expect("Could not bind the receiving socket");

        receiver
            .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
            .expect("Could not join multicast group");

        UdpTransport {
            group,
            sender,
            receiver,
        }
    }
}

impl Transport for UdpTransport {
    fn publish(&mut self, frames: &[String]) {
        let datagram =
            serde_json::to_vec(frames).expect("Could not serialize the frame stack");
        self.sender
            .send_to(&datagram, self.group)
            .expect("Could not send data");
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Option<Vec<String>> {
        self.receiver
            .set_read_timeout(Some(timeout))
            .expect("Could not set the read timeout");

        let mut datagram = vec![0; 65536];
        match self.receiver.recv_from(&mut datagram) {
            Ok((received, _source)) => match serde_json::from_slice(&datagram[..received]) {
                Ok(frames) => Some(frames),
                Err(err) => {
                    warn!("dropping an undecodable datagram: {}", err);
                    None
                }
            },
            Err(_) => None,
        }
    }
}

/// In-process broadcast hub for tests and single-machine simulation. Every
/// endpoint gets a FIFO of the stacks published by the others; endpoints
/// can be detached to simulate partitions, delivery can be made lossy, and
/// the hub keeps a transcript of everything published for assertions.
pub struct MemoryBus {
    hub: Rc<RefCell<Hub>>,
}

struct Hub {
    queues: HashMap<String, VecDeque<Vec<String>>>,
    detached: HashSet<String>,
    transcript: Vec<(String, Vec<String>)>,
    loss_rate: f64,
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus {
            hub: Rc::new(RefCell::new(Hub {
                queues: HashMap::new(),
                detached: HashSet::new(),
                transcript: Vec::new(),
                loss_rate: 0.0,
            })),
        }
    }

    /// Fraction of deliveries dropped on the floor.
    pub fn set_loss_rate(&self, loss_rate: f64) {
        self.hub.borrow_mut().loss_rate = loss_rate;
    }

    /// Registers an endpoint; the uid keys its inbound queue.
    pub fn endpoint(&self, uid: &str) -> BusEndpoint {
        self.hub
            .borrow_mut()
            .queues
            .insert(uid.to_string(), VecDeque::new());
        BusEndpoint {
            uid: uid.to_string(),
            hub: Rc::clone(&self.hub),
        }
    }

    /// Cuts an endpoint off in both directions until reattached.
    pub fn detach(&self, uid: &str) {
        self.hub.borrow_mut().detached.insert(uid.to_string());
    }

    pub fn reattach(&self, uid: &str) {
        self.hub.borrow_mut().detached.remove(uid);
    }

    /// Pops the next inbound stack queued for `uid`.
    pub fn take(&self, uid: &str) -> Option<Vec<String>> {
        self.hub
            .borrow_mut()
            .queues
            .get_mut(uid)
            .and_then(|queue| queue.pop_front())
    }

    /// Stacks still queued across all endpoints.
    pub fn pending(&self) -> usize {
        self.hub
            .borrow()
            .queues
            .values()
            .map(|queue| queue.len())
            .sum()
    }

    /// Everything published so far, as `(publisher_uid, frames)`.
    pub fn transcript(&self) -> Vec<(String, Vec<String>)> {
        self.hub.borrow().transcript.clone()
    }
}

/// One subscriber's handle on a [`MemoryBus`].
pub struct BusEndpoint {
    uid: String,
    hub: Rc<RefCell<Hub>>,
}

impl Transport for BusEndpoint {
    fn publish(&mut self, frames: &[String]) {
        let mut hub = self.hub.borrow_mut();
        hub.transcript.push((self.uid.clone(), frames.to_vec()));

        if hub.detached.contains(&self.uid) {
            return;
        }

        let loss_rate = hub.loss_rate;
        let receivers: Vec<String> = hub
            .queues
            .keys()
            .filter(|uid| **uid != self.uid && !hub.detached.contains(*uid))
            .cloned()
            .collect();

        for receiver in receivers {
            if loss_rate > 0.0 && rand::thread_rng().gen_bool(loss_rate) {
                continue;
            }
            hub.queues
                .get_mut(&receiver)
                .expect("receiver queue exists")
                .push_back(frames.to_vec());
        }
    }

    fn recv_timeout(&mut self, _timeout: Duration) -> Option<Vec<String>> {
        self.hub
            .borrow_mut()
            .queues
            .get_mut(&self.uid)
            .and_then(|queue| queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(text: &str) -> Vec<String> {
        vec!["zpax".to_string(), text.to_string()]
    }

    #[test]
    fn publish_reaches_everyone_but_the_publisher() {
        let bus = MemoryBus::new();
        let mut a = bus.endpoint("A");
        let _b = bus.endpoint("B");
        let _c = bus.endpoint("C");

        a.publish(&stack("hello"));

        assert_eq!(bus.take("A"), None);
        assert_eq!(bus.take("B"), Some(stack("hello")));
        assert_eq!(bus.take("C"), Some(stack("hello")));
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn delivery_is_fifo_per_receiver() {
        let bus = MemoryBus::new();
        let mut a = bus.endpoint("A");
        let _b = bus.endpoint("B");

        a.publish(&stack("one"));
        a.publish(&stack("two"));

        assert_eq!(bus.take("B"), Some(stack("one")));
        assert_eq!(bus.take("B"), Some(stack("two")));
    }

    #[test]
    fn detached_endpoints_neither_send_nor_receive() {
        let bus = MemoryBus::new();
        let mut a = bus.endpoint("A");
        let mut b = bus.endpoint("B");

        bus.detach("B");
        a.publish(&stack("to nobody home"));
        b.publish(&stack("from the void"));
        assert_eq!(bus.take("A"), None);
        assert_eq!(bus.take("B"), None);

        bus.reattach("B");
        a.publish(&stack("back"));
        assert_eq!(bus.take("B"), Some(stack("back")));
    }

    #[test]
    fn transcript_records_every_publish() {
        let bus = MemoryBus::new();
        let mut a = bus.endpoint("A");
        bus.detach("A");
        a.publish(&stack("lost"));

        let transcript = bus.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].0, "A");
    }
}
