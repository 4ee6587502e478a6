//! The replicated-decision node: wire framing, dispatch, retry timers and
//! pub/sub glue that turn the Paxos state machines into a working protocol
//! on a lossy broadcast medium.
//!
//! Everything runs single-threaded and to completion. Publishing a message
//! delivers it back to this node's own dispatcher before the publish call
//! returns, so handlers must not assume state is unchanged across a
//! publish.

use std::fmt::Debug;
use std::rc::Rc;
use std::time::Duration;

use log::Level;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::basic::{Directive, Messenger};
use crate::errors::{MessageError, ProposalError};
use crate::heartbeat::HeartbeatConfig;
use crate::message::{Envelope, Message};
use crate::multi::MultiPaxos;
use crate::proposal::ProposalId;
use crate::timer::{Clock, TimerId, TimerKind, Timers};
use crate::transport::Transport;

/// Implement this trait if you are a process which needs to run in an
/// infinite loop, receiving and reacting to messages.
pub trait Runnable {
    fn run(&mut self);
}

/// Application-side callbacks. Every method defaults to a no-op; implement
/// the ones the application cares about and hand the object to the node at
/// construction.
pub trait Application<T> {
    /// This node won Paxos leadership.
    fn on_leadership_acquired(&mut self) {}

    /// This node lost Paxos leadership.
    fn on_leadership_lost(&mut self) {}

    /// The believed leader changed, whoever the parties are.
    fn on_leadership_changed(
        &mut self,
        _prev_leader_uid: Option<&str>,
        _new_leader_uid: Option<&str>,
    ) {
    }

    /// This node's sequence number is behind the cluster; catching up (see
    /// `slew_sequence_number`) is the application's call.
    fn on_behind_in_sequence(&mut self, _seen_seq_num: u64) {}

    /// A peer is sending traffic for an already-closed instance.
    fn on_other_node_behind_in_sequence(&mut self, _node_uid: &str) {}

    /// The given instance agreed on a value.
    fn on_proposal_resolution(&mut self, _instance_num: u64, _value: &T) {}

    /// A leader heartbeat arrived; the map is its application data.
    fn on_heartbeat(&mut self, _data: &Map<String, Value>) {}

    /// Called immediately before the node shuts down.
    fn on_shutdown(&mut self) {}

    /// Application data to ride along on this node's own heartbeats.
    fn heartbeat_data(&mut self) -> Map<String, Value> {
        Map::new()
    }
}

/// For nodes that only relay and learn.
impl<T> Application<T> for () {}

/// One member of the replicated cluster.
pub struct Node<T, A: Application<T>> {
    node_uid: String,
    sequence_number: u64,
    mpax: MultiPaxos<T>,
    messenger: Messenger<T>,
    app: A,
    transport: Box<dyn Transport>,
    clock: Rc<dyn Clock>,
    timers: Timers,
    hb_config: HeartbeatConfig,
    accept_retry: Option<(TimerId, ProposalId, T)>,
    pulse_timer: Option<TimerId>,
    running: bool,
}

impl<T, A> Node<T, A>
where
    T: Serialize + DeserializeOwned + Clone + Debug + PartialEq,
    A: Application<T>,
{
    pub fn new(
        node_uid: String,
        quorum_size: usize,
        sequence_number: u64,
        transport: Box<dyn Transport>,
        clock: Rc<dyn Clock>,
        app: A,
    ) -> Self {
        Self::with_config(
            node_uid,
            quorum_size,
            sequence_number,
            transport,
            clock,
            app,
            HeartbeatConfig::default(),
        )
    }

    pub fn with_config(
        node_uid: String,
        quorum_size: usize,
        sequence_number: u64,
        transport: Box<dyn Transport>,
        clock: Rc<dyn Clock>,
        app: A,
        hb_config: HeartbeatConfig,
    ) -> Self {
        let messenger = Messenger::new();
        let now = clock.now();
        let mpax = MultiPaxos::new(
            &node_uid,
            quorum_size,
            sequence_number,
            &messenger,
            hb_config,
            now,
        );

        let mut timers = Timers::new();
        timers.schedule(now, hb_config.liveness_window, TimerKind::LivenessPoll);

        Node {
            node_uid,
            sequence_number,
            mpax,
            messenger,
            app,
            transport,
            clock,
            timers,
            hb_config,
            accept_retry: None,
            pulse_timer: None,
            running: true,
        }
    }

    pub fn node_uid(&self) -> &str {
        &self.node_uid
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn have_leadership(&self) -> bool {
        self.mpax.have_leadership()
    }

    pub fn application(&self) -> &A {
        &self.app
    }

    pub fn application_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Submits a value for the given slot. The value is broadcast so that
    /// every node, the leader included through its own subscription, can
    /// feed it to its proposer.
    pub fn propose_value(&mut self, sequence_number: u64, value: T) -> Result<(), ProposalError> {
        if sequence_number != self.sequence_number {
            return Err(ProposalError::SequenceMismatch(self.sequence_number));
        }
        if self.mpax.instance().proposer.proposed_value().is_some()
            || self.mpax.instance().acceptor.accepted_value().is_some()
        {
            return Err(ProposalError::ValueAlreadyProposed);
        }

        self.publish(Message::ValueProposal {
            value: value.clone(),
        });
        self.mpax.set_proposal(sequence_number, value);
        self.flush();
        Ok(())
    }

    /// Atomically advances the local sequence number for catch-up.
    /// Leadership, if held, is dropped first.
    pub fn slew_sequence_number(&mut self, new_sequence_number: u64) {
        assert!(
            new_sequence_number > self.sequence_number,
            "slew must move the sequence number forward"
        );

        if log_enabled!(Level::Info) {
            info!(
                "[{}] slewing sequence number {} -> {}",
                self.node_uid, self.sequence_number, new_sequence_number
            );
        }

        self.mpax.resign();
        self.flush();
        self.sequence_number = new_sequence_number;
        self.mpax.set_instance_number(new_sequence_number);
    }

    /// Stops every timer, closes the transport and reports the shutdown to
    /// the application. Publishing afterwards is a programming error.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.app.on_shutdown();

        if let Some((timer, _, _)) = self.accept_retry.take() {
            self.timers.cancel(timer);
        }
        if let Some(timer) = self.pulse_timer.take() {
            self.timers.cancel(timer);
        }
        self.timers.clear();
        self.transport.close();
        self.running = false;
    }

    /// The subscribe callback: decodes one inbound frame stack and routes
    /// it. Undecodable stacks are logged and dropped, never fatal.
    pub fn handle_frames(&mut self, frames: &[String]) {
        if !self.running {
            return;
        }
        match Envelope::decode(frames) {
            Ok(envelope) => self.dispatch(envelope),
            Err(MessageError::UnknownType(kind)) => {
                warn!("[{}] dropping message of unknown type `{}`", self.node_uid, kind);
            }
            Err(err) => {
                warn!("[{}] dropping malformed message: {}", self.node_uid, err);
            }
        }
    }

    /// Fires every timer whose deadline has passed.
    pub fn poll_timers(&mut self) {
        let now = self.clock.now();
        for (id, kind) in self.timers.expired(now) {
            self.handle_timer(id, kind, now);
        }
    }

    /// One receive-and-tick pass: waits for traffic no longer than
    /// `max_wait` (bounded by the next timer deadline), dispatches it, then
    /// fires due timers.
    pub fn poll(&mut self, max_wait: Duration) {
        let now = self.clock.now();
        let timeout = match self.timers.next_deadline() {
            Some(deadline) if deadline > now => max_wait.min(deadline - now),
            Some(_) => Duration::from_millis(1),
            None => max_wait,
        };
        if let Some(frames) = self.transport.recv_timeout(timeout) {
            self.handle_frames(&frames);
        }
        self.poll_timers();
    }

    fn handle_timer(&mut self, id: TimerId, kind: TimerKind, now: Duration) {
        match kind {
            TimerKind::LivenessPoll => {
                self.mpax.poll_liveness(now);
                self.flush();
                self.timers
                    .schedule(now, self.hb_config.liveness_window, TimerKind::LivenessPoll);
            }
            TimerKind::HeartbeatPulse => {
                if self.pulse_timer == Some(id) {
                    self.pulse_timer = None;
                }
                if self.mpax.have_leadership() {
                    self.mpax.pulse(now);
                    self.flush();
                    if self.mpax.have_leadership() && self.pulse_timer.is_none() {
                        self.pulse_timer = Some(self.timers.schedule(
                            now,
                            self.hb_config.period,
                            TimerKind::HeartbeatPulse,
                        ));
                    }
                }
            }
            TimerKind::AcceptRetry => {
                if let Some((_, proposal_id, value)) = self.accept_retry.take() {
                    self.send_accept(proposal_id, value);
                }
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope<T>) {
        let now = self.clock.now();
        let Envelope {
            node_uid: from_uid,
            seq_num,
            message,
        } = envelope;

        match message {
            Message::ValueProposal { value } => {
                if seq_num == self.sequence_number
                    && self.mpax.instance().acceptor.accepted_value().is_none()
                {
                    self.mpax.set_proposal(seq_num, value);
                    self.flush();
                }
            }
            // Heartbeats span instances, so the sequence check only feeds
            // the advisory callbacks and never gates the message itself.
            Message::Heartbeat {
                leader_proposal_id,
                data,
            } => {
                self.check_sequence(seq_num, &from_uid);
                self.mpax.recv_heartbeat(&leader_proposal_id, now);
                self.flush();
                self.app.on_heartbeat(&data);
            }
            Message::Prepare { proposal_id } => {
                if self.check_sequence(seq_num, &from_uid) {
                    if let Some((promised_id, prev_accepted_id, prev_accepted_value)) =
                        self.mpax.recv_prepare(seq_num, proposal_id)
                    {
                        self.publish(Message::Promise {
                            proposal_id: promised_id,
                            prev_accepted_id,
                            prev_accepted_value,
                        });
                    }
                }
            }
            Message::Promise {
                proposal_id,
                prev_accepted_id,
                prev_accepted_value,
            } => {
                if self.check_sequence(seq_num, &from_uid) {
                    self.mpax.recv_promise(
                        seq_num,
                        &from_uid,
                        &proposal_id,
                        prev_accepted_id,
                        prev_accepted_value,
                        now,
                    );
                    self.flush();
                }
            }
            Message::Accept { proposal_id, value } => {
                if self.check_sequence(seq_num, &from_uid) {
                    if let Some((accepted_id, accepted_value)) =
                        self.mpax.recv_accept_request(seq_num, proposal_id, value)
                    {
                        self.publish(Message::Accepted {
                            proposal_id: accepted_id,
                            value: accepted_value,
                        });
                    }
                }
            }
            Message::Accepted { proposal_id, value } => {
                if self.check_sequence(seq_num, &from_uid) {
                    if let Some((instance_num, resolved)) =
                        self.mpax.recv_accepted(seq_num, &from_uid, proposal_id, value)
                    {
                        self.complete_resolution(instance_num, resolved);
                    }
                }
            }
        }
    }

    // Signals sequence divergence in both directions; only equal-sequence
    // traffic may reach the open instance.
    fn check_sequence(&mut self, seq_num: u64, from_uid: &str) -> bool {
        if seq_num > self.sequence_number {
            self.app.on_behind_in_sequence(seq_num);
        } else if seq_num < self.sequence_number {
            self.app.on_other_node_behind_in_sequence(from_uid);
        }
        seq_num == self.sequence_number
    }

    fn complete_resolution(&mut self, instance_num: u64, value: T) {
        if let Some((timer, _, _)) = self.accept_retry.take() {
            self.timers.cancel(timer);
        }
        self.sequence_number = instance_num + 1;

        if log_enabled!(Level::Info) {
            info!(
                "[{}] instance {} resolved to {:?}",
                self.node_uid, instance_num, value
            );
        }
        self.app.on_proposal_resolution(instance_num, &value);
    }

    // Turns everything the proposer layer queued into published frames,
    // timers and application callbacks.
    fn flush(&mut self) {
        let now = self.clock.now();
        for directive in self.messenger.drain() {
            match directive {
                Directive::SendPrepare(proposal_id) => {
                    self.publish(Message::Prepare { proposal_id });
                }
                Directive::SendAccept(proposal_id, value) => {
                    self.send_accept(proposal_id, value);
                }
                Directive::SendHeartbeat(leader_proposal_id) => {
                    let data = self.app.heartbeat_data();
                    self.publish(Message::Heartbeat {
                        leader_proposal_id,
                        data,
                    });
                }
                Directive::LeadershipAcquired => {
                    if self.pulse_timer.is_none() {
                        self.pulse_timer = Some(self.timers.schedule(
                            now,
                            self.hb_config.period,
                            TimerKind::HeartbeatPulse,
                        ));
                    }
                    self.app.on_leadership_acquired();
                }
                Directive::LeadershipLost => {
                    if let Some((timer, _, _)) = self.accept_retry.take() {
                        self.timers.cancel(timer);
                    }
                    if let Some(timer) = self.pulse_timer.take() {
                        self.timers.cancel(timer);
                    }
                    self.app.on_leadership_lost();
                }
                Directive::LeadershipChanged {
                    prev_leader_uid,
                    new_leader_uid,
                } => {
                    self.app
                        .on_leadership_changed(prev_leader_uid.as_deref(), new_leader_uid.as_deref());
                }
            }
        }
    }

    /// Publishes an accept request and arms its retransmission. The request
    /// repeats every heartbeat period until the instance resolves or
    /// leadership is lost; both cancel the pending retry.
    fn send_accept(&mut self, proposal_id: ProposalId, value: T) {
        if !self.mpax.have_leadership() || self.accept_retry.is_some() {
            return;
        }
        // The retry is armed before the publish: loopback can resolve the
        // instance inside the publish call, and resolution cancels whatever
        // retry is pending at that moment.
        let timer = self
            .timers
            .schedule(self.clock.now(), self.hb_config.period, TimerKind::AcceptRetry);
        self.accept_retry = Some((timer, proposal_id.clone(), value.clone()));
        self.publish(Message::Accept { proposal_id, value });
    }

    /// Broadcasts one message and immediately delivers it to this node's
    /// own dispatcher.
    fn publish(&mut self, message: Message<T>) {
        assert!(self.running, "publish on a node after shutdown");
        let envelope = Envelope {
            node_uid: self.node_uid.clone(),
            seq_num: self.sequence_number,
            message,
        };
        let frames = envelope.encode();
        self.transport.publish(&frames);
        self.handle_frames(&frames);
    }
}

impl<T, A> Runnable for Node<T, A>
where
    T: Serialize + DeserializeOwned + Clone + Debug + PartialEq,
    A: Application<T>,
{
    fn run(&mut self) {
        while self.running {
            self.poll(self.hb_config.liveness_window);
        }
    }
}
