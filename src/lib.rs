//! Replicated-decision nodes: a cluster of peers agrees on an ordered
//! sequence of values with Multi-Paxos, carried over a publish/subscribe
//! broadcast medium. Leadership is kept on one distinguished proposer with
//! heartbeats so that competing proposers do not livelock each other.

extern crate config;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate net2;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate thiserror;
extern crate uuid;

pub mod basic;
pub mod configurations;
pub mod errors;
pub mod heartbeat;
pub mod message;
pub mod multi;
pub mod node;
pub mod proposal;
pub mod store;
pub mod timer;
pub mod transport;
