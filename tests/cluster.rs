//! End-to-end cluster scenarios over the in-process bus with a hand-driven
//! clock: every run is deterministic, message by message and tick by tick.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use zpax::errors::ProposalError;
use zpax::node::{Application, Node};
use zpax::timer::ManualClock;
use zpax::transport::MemoryBus;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Default)]
struct Journal {
    resolutions: Vec<(u64, String)>,
    behind: Vec<u64>,
    others_behind: Vec<String>,
    acquired: usize,
    lost: usize,
    changes: Vec<(Option<String>, Option<String>)>,
    heartbeats: usize,
    shutdowns: usize,
}

#[derive(Clone, Default)]
struct Recorder {
    journal: Rc<RefCell<Journal>>,
}

impl Application<String> for Recorder {
    fn on_leadership_acquired(&mut self) {
        self.journal.borrow_mut().acquired += 1;
    }

    fn on_leadership_lost(&mut self) {
        self.journal.borrow_mut().lost += 1;
    }

    fn on_leadership_changed(&mut self, prev: Option<&str>, new: Option<&str>) {
        self.journal
            .borrow_mut()
            .changes
            .push((prev.map(str::to_string), new.map(str::to_string)));
    }

    fn on_behind_in_sequence(&mut self, seen_seq_num: u64) {
        self.journal.borrow_mut().behind.push(seen_seq_num);
    }

    fn on_other_node_behind_in_sequence(&mut self, node_uid: &str) {
        self.journal
            .borrow_mut()
            .others_behind
            .push(node_uid.to_string());
    }

    fn on_proposal_resolution(&mut self, instance_num: u64, value: &String) {
        self.journal
            .borrow_mut()
            .resolutions
            .push((instance_num, value.clone()));
    }

    fn on_heartbeat(&mut self, _data: &serde_json::Map<String, serde_json::Value>) {
        self.journal.borrow_mut().heartbeats += 1;
    }

    fn on_shutdown(&mut self) {
        self.journal.borrow_mut().shutdowns += 1;
    }
}

struct Cluster {
    bus: MemoryBus,
    clock: Rc<ManualClock>,
    uids: Vec<String>,
    nodes: Vec<Node<String, Recorder>>,
    journals: Vec<Rc<RefCell<Journal>>>,
}

impl Cluster {
    fn new(uids: &[&str], quorum_size: usize) -> Cluster {
        let bus = MemoryBus::new();
        let clock = Rc::new(ManualClock::new());

        let mut nodes = Vec::new();
        let mut journals = Vec::new();
        for uid in uids {
            let journal: Rc<RefCell<Journal>> = Rc::default();
            let app = Recorder {
                journal: Rc::clone(&journal),
            };
            nodes.push(Node::new(
                uid.to_string(),
                quorum_size,
                0,
                Box::new(bus.endpoint(uid)),
                clock.clone(),
                app,
            ));
            journals.push(journal);
        }

        Cluster {
            bus,
            clock,
            uids: uids.iter().map(|uid| uid.to_string()).collect(),
            nodes,
            journals,
        }
    }

    fn index(&self, uid: &str) -> usize {
        self.uids
            .iter()
            .position(|candidate| candidate == uid)
            .expect("unknown node uid")
    }

    fn node(&self, uid: &str) -> &Node<String, Recorder> {
        &self.nodes[self.index(uid)]
    }

    fn node_mut(&mut self, uid: &str) -> &mut Node<String, Recorder> {
        let index = self.index(uid);
        &mut self.nodes[index]
    }

    fn journal(&self, uid: &str) -> std::cell::Ref<Journal> {
        self.journals[self.index(uid)].borrow()
    }

    /// Delivers queued traffic round-robin until the bus is quiet.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for index in 0..self.nodes.len() {
                let uid = self.uids[index].clone();
                while let Some(frames) = self.bus.take(&uid) {
                    self.nodes[index].handle_frames(&frames);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Delivers a single queued message to `uid`, if one is waiting.
    fn pump_one(&mut self, uid: &str) -> bool {
        let index = self.index(uid);
        match self.bus.take(uid) {
            Some(frames) => {
                self.nodes[index].handle_frames(&frames);
                true
            }
            None => false,
        }
    }

    fn poll_node(&mut self, uid: &str) {
        self.node_mut(uid).poll_timers();
    }

    /// Advances time, fires everyone's due timers and drains the bus.
    fn tick(&mut self, by: Duration) {
        self.clock.advance(by);
        for node in self.nodes.iter_mut() {
            node.poll_timers();
        }
        self.pump();
    }

    /// Lets the first liveness window lapse for `uid` alone, so it opens the
    /// election round before anyone else looks.
    fn elect(&mut self, uid: &str) {
        self.clock.advance(ms(1600));
        self.poll_node(uid);
        self.pump();
        assert!(self.node(uid).have_leadership());
    }

    /// How many accept requests `uid` has published so far.
    fn accepts_from(&self, uid: &str) -> usize {
        self.bus
            .transcript()
            .iter()
            .filter(|(sender, frames)| {
                sender == uid
                    && frames.len() > 1
                    && serde_json::from_str::<serde_json::Value>(&frames[1])
                        .map(|header| header["type"] == "paxos_accept")
                        .unwrap_or(false)
            })
            .count()
    }

    /// Every pair of nodes that resolved an instance resolved it to the
    /// same value.
    fn assert_agreement(&self) {
        for (i, left) in self.journals.iter().enumerate() {
            for right in self.journals.iter().skip(i + 1) {
                for &(instance, ref value) in left.borrow().resolutions.iter() {
                    for &(other_instance, ref other_value) in right.borrow().resolutions.iter() {
                        if instance == other_instance {
                            assert_eq!(value, other_value, "instance {} diverged", instance);
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn single_node_cluster_resolves_within_one_turn() {
    let mut cluster = Cluster::new(&["A"], 1);
    cluster.elect("A");

    cluster
        .node_mut("A")
        .propose_value(0, "hello".to_string())
        .unwrap();

    // No pumping, no ticking: loopback alone carried the whole instance.
    assert_eq!(
        cluster.journal("A").resolutions,
        vec![(0, "hello".to_string())]
    );
    assert_eq!(cluster.node("A").sequence_number(), 1);
}

#[test]
fn three_nodes_resolve_with_a_single_accept_from_the_leader() {
    let mut cluster = Cluster::new(&["A", "B", "C"], 2);
    cluster.elect("A");
    assert_eq!(cluster.journal("A").acquired, 1);

    // The client talks to a follower; the leader hears the value through
    // its own subscription.
    cluster
        .node_mut("B")
        .propose_value(0, "X".to_string())
        .unwrap();
    cluster.pump();

    for uid in &["A", "B", "C"] {
        assert_eq!(
            cluster.journal(uid).resolutions,
            vec![(0, "X".to_string())],
            "{} resolutions",
            uid
        );
        assert_eq!(cluster.node(uid).sequence_number(), 1);
    }

    assert_eq!(cluster.accepts_from("A"), 1);
    assert_eq!(cluster.accepts_from("B"), 0);
    assert_eq!(cluster.accepts_from("C"), 0);
    cluster.assert_agreement();
}

#[test]
fn dueling_proposers_converge_on_the_higher_uid_value() {
    let mut cluster = Cluster::new(&["A", "B", "C"], 2);

    // Both proposals are in flight before either node hears the other's.
    cluster
        .node_mut("A")
        .propose_value(0, "alpha-value".to_string())
        .unwrap();
    cluster
        .node_mut("B")
        .propose_value(0, "bravo-value".to_string())
        .unwrap();

    // Both liveness windows lapse before any traffic is delivered, so both
    // nodes open round 1 concurrently.
    cluster.clock.advance(ms(1600));
    cluster.poll_node("A");
    cluster.poll_node("B");
    cluster.pump();

    for uid in &["A", "B", "C"] {
        assert_eq!(
            cluster.journal(uid).resolutions,
            vec![(0, "bravo-value".to_string())],
            "{} resolutions",
            uid
        );
        assert_eq!(cluster.node(uid).sequence_number(), 1);
    }
    cluster.assert_agreement();

    // A briefly believed it led and was demoted by B's greater heartbeat.
    assert!(cluster.journal("A").lost >= 1);
    assert!(cluster.node("B").have_leadership());
}

#[test]
fn a_lagging_node_signals_behind_then_slews_and_catches_up() {
    let mut cluster = Cluster::new(&["A", "B", "C"], 2);
    cluster.elect("A");

    // C goes dark while the others resolve instance 0.
    cluster.bus.detach("C");
    cluster
        .node_mut("A")
        .propose_value(0, "v0".to_string())
        .unwrap();
    cluster.pump();
    assert_eq!(cluster.node("A").sequence_number(), 1);
    assert_eq!(cluster.node("B").sequence_number(), 1);
    assert_eq!(cluster.node("C").sequence_number(), 0);
    assert!(cluster.journal("C").resolutions.is_empty());

    cluster.bus.reattach("C");
    cluster
        .node_mut("A")
        .propose_value(1, "v1".to_string())
        .unwrap();

    // C sees instance-1 traffic and reports that it is behind.
    cluster.pump_one("C");
    cluster.pump_one("C");
    assert_eq!(cluster.journal("C").behind, vec![1]);

    // The application reacts by slewing, and the instance then reaches C.
    cluster.node_mut("C").slew_sequence_number(1);
    assert_eq!(cluster.node("C").sequence_number(), 1);
    cluster.pump();

    assert_eq!(
        cluster.journal("C").resolutions,
        vec![(1, "v1".to_string())]
    );
    for uid in &["A", "B", "C"] {
        assert_eq!(cluster.node(uid).sequence_number(), 2);
    }
    cluster.assert_agreement();
}

#[test]
fn stale_sequence_numbers_are_refused_with_the_current_one() {
    let mut cluster = Cluster::new(&["A"], 1);
    cluster.elect("A");

    for round in 0..3 {
        cluster
            .node_mut("A")
            .propose_value(round, format!("v{}", round))
            .unwrap();
    }
    assert_eq!(cluster.node("A").sequence_number(), 3);

    assert_eq!(
        cluster.node_mut("A").propose_value(2, "x".to_string()),
        Err(ProposalError::SequenceMismatch(3))
    );
}

#[test]
fn a_second_value_for_an_open_instance_is_refused() {
    let mut cluster = Cluster::new(&["A", "B", "C"], 2);
    cluster.elect("A");

    cluster
        .node_mut("A")
        .propose_value(0, "first".to_string())
        .unwrap();

    // The instance is still in flight at A (one accepted vote of two).
    assert_eq!(
        cluster.node_mut("A").propose_value(0, "second".to_string()),
        Err(ProposalError::ValueAlreadyProposed)
    );

    // B has only seen the value proposal so far; its proposer latched it,
    // which is enough to refuse a competing value there too.
    cluster.pump_one("B");
    assert_eq!(
        cluster.node_mut("B").propose_value(0, "second".to_string()),
        Err(ProposalError::ValueAlreadyProposed)
    );

    cluster.pump();
    for uid in &["A", "B", "C"] {
        assert_eq!(
            cluster.journal(uid).resolutions,
            vec![(0, "first".to_string())]
        );
    }
}

#[test]
fn a_dead_leader_is_replaced_after_the_liveness_window() {
    let mut cluster = Cluster::new(&["A", "B", "C"], 2);
    cluster.elect("A");

    // One heartbeat round keeps everyone happy.
    cluster.tick(ms(500));
    assert!(cluster.journal("B").heartbeats >= 1);

    cluster.bus.detach("A");
    cluster.clock.advance(ms(1600));
    cluster.poll_node("B");
    cluster.pump();

    assert!(cluster.node("B").have_leadership());
    assert_eq!(cluster.journal("B").acquired, 1);
    assert!(cluster
        .journal("C")
        .changes
        .contains(&(Some("A".to_string()), Some("B".to_string()))));

    // The old leader rejoins, hears the greater regime and steps down.
    cluster.bus.reattach("A");
    cluster.tick(ms(500));
    assert!(!cluster.node("A").have_leadership());
    assert!(cluster.journal("A").lost >= 1);
    assert!(cluster
        .journal("A")
        .changes
        .contains(&(Some("A".to_string()), Some("B".to_string()))));
}

#[test]
fn resolutions_keep_flowing_under_the_new_leader() {
    let mut cluster = Cluster::new(&["A", "B", "C"], 2);
    cluster.elect("A");
    cluster
        .node_mut("A")
        .propose_value(0, "from-a".to_string())
        .unwrap();
    cluster.pump();

    cluster.bus.detach("A");
    cluster.clock.advance(ms(1600));
    cluster.poll_node("B");
    cluster.pump();
    assert!(cluster.node("B").have_leadership());

    cluster
        .node_mut("C")
        .propose_value(1, "from-c".to_string())
        .unwrap();
    cluster.pump();

    for uid in &["B", "C"] {
        assert_eq!(
            cluster.journal(uid).resolutions,
            vec![(0, "from-a".to_string()), (1, "from-c".to_string())]
        );
    }
    cluster.assert_agreement();
}

#[test]
fn shutdown_reports_once_and_stops_the_node() {
    let mut cluster = Cluster::new(&["A"], 1);
    cluster.elect("A");

    cluster.node_mut("A").shutdown();
    cluster.node_mut("A").shutdown();
    assert_eq!(cluster.journal("A").shutdowns, 1);
}
