//! Simulates a full three-node cluster on one machine, over the in-process
//! bus with lossy delivery. The clock is driven by hand, so the run is
//! reproducible turn by turn.
//!
//! Run this example as follows
//!     RUST_LOG=zpax=info cargo run --example simulate

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate zpax;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use zpax::node::{Application, Node};
use zpax::timer::ManualClock;
use zpax::transport::MemoryBus;

const UIDS: [&str; 3] = ["alpha", "bravo", "charlie"];
const QUORUM: usize = 2;

struct Printer {
    uid: &'static str,
    behind: Cell<Option<u64>>,
}

impl Application<String> for Printer {
    fn on_leadership_acquired(&mut self) {
        println!("[{}] became leader", self.uid);
    }

    fn on_leadership_lost(&mut self) {
        println!("[{}] lost leadership", self.uid);
    }

    fn on_proposal_resolution(&mut self, instance_num: u64, value: &String) {
        println!("[{}] instance {} = {}", self.uid, instance_num, value);
    }

    fn on_behind_in_sequence(&mut self, seen_seq_num: u64) {
        let known = self.behind.get().unwrap_or(0);
        self.behind.set(Some(known.max(seen_seq_num)));
    }
}

fn main() {
    env_logger::init();

    let bus = MemoryBus::new();
    let clock = Rc::new(ManualClock::new());

    let mut nodes: Vec<Node<String, Printer>> = UIDS
        .iter()
        .map(|&uid| {
            Node::new(
                uid.to_string(),
                QUORUM,
                0,
                Box::new(bus.endpoint(uid)),
                clock.clone(),
                Printer {
                    uid,
                    behind: Cell::new(None),
                },
            )
        })
        .collect();

    // Let the first liveness window lapse; alpha notices first and takes
    // leadership before the others even look.
    clock.advance(Duration::from_millis(1600));
    nodes[0].poll_timers();
    pump(&bus, &mut nodes);
    info!("alpha leads: {}", nodes[0].have_leadership());

    bus.set_loss_rate(0.10);

    for round in 0..5 {
        let seq = nodes[0].sequence_number();
        let value = format!("decision-{}", round);
        if let Err(err) = nodes[0].propose_value(seq, value) {
            println!("[alpha] proposal refused: {}", err);
            continue;
        }

        // Lost accepts come back on the retry timer; stragglers that spot a
        // newer sequence number in the leader's heartbeats slew forward. A
        // value proposal lost on its way to the leader is the client's
        // problem, so the round is abandoned after a while.
        let mut ticks = 0;
        while nodes.iter().any(|node| node.sequence_number() == seq) {
            ticks += 1;
            if ticks > 100 {
                println!("[simulate] giving up on round {}", round);
                break;
            }
            clock.advance(Duration::from_millis(250));
            for node in nodes.iter_mut() {
                node.poll_timers();
                if let Some(seen) = node.application().behind.take() {
                    if seen > node.sequence_number() {
                        node.slew_sequence_number(seen);
                    }
                }
            }
            pump(&bus, &mut nodes);
        }
    }

    for node in nodes.iter_mut() {
        node.shutdown();
    }
}

fn pump(bus: &MemoryBus, nodes: &mut [Node<String, Printer>]) {
    loop {
        let mut progressed = false;
        for (uid, node) in UIDS.iter().zip(nodes.iter_mut()) {
            while let Some(frames) = bus.take(uid) {
                node.handle_frames(&frames);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}
