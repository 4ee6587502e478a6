//! Starts one replicated node over UDP multicast. Each `key=value` line
//! typed on the standard input is proposed to the cluster, and every
//! resolution is committed into this node's key/value store, so restarting
//! the process resumes from the last committed sequence number.
//!
//! You can run this example as follows
//!     RUST_LOG=zpax=info cargo run --example start_node -- <node_uid> Config
//! where <node_uid> should be unique among all nodes; leave both arguments
//! out to get a random uid and the `Config` file at the crate root.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate text_io;
extern crate uuid;
extern crate zpax;

use std::env;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use zpax::configurations::get_config;
use zpax::node::{Application, Node};
use zpax::store::KvStore;
use zpax::timer::SystemClock;
use zpax::transport::UdpTransport;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct KvCommand {
    key: String,
    value: String,
}

struct KvApp {
    uid: String,
    store: KvStore<String>,
    behind: Option<u64>,
}

impl Application<KvCommand> for KvApp {
    fn on_leadership_acquired(&mut self) {
        println!("[{}] became leader", self.uid);
    }

    fn on_leadership_lost(&mut self) {
        println!("[{}] lost leadership", self.uid);
    }

    fn on_proposal_resolution(&mut self, instance_num: u64, command: &KvCommand) {
        match self
            .store
            .commit(&command.key, command.value.clone(), instance_num)
        {
            Ok(true) => println!(
                "[{}] instance {}: {} = {}",
                self.uid, instance_num, command.key, command.value
            ),
            Ok(false) => {}
            Err(err) => warn!("[{}] could not commit: {}", self.uid, err),
        }
    }

    fn on_behind_in_sequence(&mut self, seen_seq_num: u64) {
        let known = self.behind.unwrap_or(0);
        self.behind = Some(known.max(seen_seq_num));
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let (uid, config_file_name) = match args.len() {
        1 => (Uuid::new_v4().to_string(), "Config".to_string()),
        3 => (args[1].clone(), args[2].clone()),
        _ => panic!("Expected 0 or 2 arguments (excluding file name)"),
    };

    let settings = get_config(&config_file_name);
    info!("[{}] settings = {:?}", uid, settings);

    let store: KvStore<String> =
        KvStore::open(format!("{}.kv.json", uid)).expect("Could not open the store");
    // Resume one past the greatest committed sequence number.
    let sequence_number = store.get_last_proposal().map_or(0, |last| last + 1);

    let app = KvApp {
        uid: uid.clone(),
        store,
        behind: None,
    };

    let mut node = Node::new(
        uid,
        settings.quorum_size,
        sequence_number,
        Box::new(UdpTransport::new(settings.group)),
        Rc::new(SystemClock::new()),
        app,
    );

    let (lines_in, lines_out) = mpsc::channel();
    thread::spawn(move || loop {
        let line: String = read!("{}\n");
        if lines_in.send(line).is_err() {
            break;
        }
    });

    loop {
        node.poll(Duration::from_millis(50));

        if let Some(seen) = node.application_mut().behind.take() {
            if seen > node.sequence_number() {
                node.slew_sequence_number(seen);
            }
        }

        while let Ok(line) = lines_out.try_recv() {
            let line = line.trim();
            if line == "quit" {
                node.shutdown();
                return;
            }

            let mut parts = line.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) if !key.is_empty() => {
                    let command = KvCommand {
                        key: key.to_string(),
                        value: value.to_string(),
                    };
                    let seq = node.sequence_number();
                    if let Err(err) = node.propose_value(seq, command) {
                        eprintln!("proposal refused: {}", err);
                    }
                }
                _ => eprintln!("expected key=value (or quit)"),
            }
        }
    }
}
