//! Chains single-decree Paxos instances into an agreed sequence of values.
//! Exactly one instance is open at a time; traffic for any other sequence
//! number is refused here and signalled upward by the node.

use std::fmt::Debug;
use std::time::Duration;

use log::Level;

use crate::basic::{Acceptor, Learner, Messenger};
use crate::heartbeat::{HeartbeatConfig, HeartbeatProposer};
use crate::proposal::ProposalId;

/// One sequence slot: a proposer, an acceptor and a learner working the
/// same instance number.
pub struct PaxosInstance<T> {
    pub proposer: HeartbeatProposer<T>,
    pub acceptor: Acceptor<T>,
    pub learner: Learner<T>,
}

impl<T> PaxosInstance<T>
where
    T: Clone + Debug,
{
    fn first(
        node_uid: &str,
        quorum_size: usize,
        messenger: &Messenger<T>,
        config: HeartbeatConfig,
        now: Duration,
    ) -> Self {
        PaxosInstance {
            proposer: HeartbeatProposer::new(
                node_uid.to_string(),
                quorum_size,
                messenger.clone(),
                config,
                now,
            ),
            acceptor: Acceptor::new(),
            learner: Learner::new(quorum_size),
        }
    }

    fn next(&self, quorum_size: usize) -> Self {
        PaxosInstance {
            proposer: self.proposer.successor(),
            acceptor: Acceptor::new(),
            learner: Learner::new(quorum_size),
        }
    }
}

/// The Multi-Paxos facade over the open instance.
pub struct MultiPaxos<T> {
    node_uid: String,
    quorum_size: usize,
    instance_number: u64,
    instance: PaxosInstance<T>,
}

impl<T> MultiPaxos<T>
where
    T: Clone + Debug,
{
    pub fn new(
        node_uid: &str,
        quorum_size: usize,
        sequence_number: u64,
        messenger: &Messenger<T>,
        config: HeartbeatConfig,
        now: Duration,
    ) -> Self {
        MultiPaxos {
            node_uid: node_uid.to_string(),
            quorum_size,
            instance_number: sequence_number,
            instance: PaxosInstance::first(node_uid, quorum_size, messenger, config, now),
        }
    }

    pub fn instance_number(&self) -> u64 {
        self.instance_number
    }

    pub fn instance(&self) -> &PaxosInstance<T> {
        &self.instance
    }

    /// Declares the open slot, dropping the previous instance. The proposer
    /// carries its rounds and leadership opinion into the new slot; callers
    /// that mean to give up leadership resign first.
    pub fn set_instance_number(&mut self, sequence_number: u64) {
        self.instance = self.instance.next(self.quorum_size);
        self.instance_number = sequence_number;
    }

    /// Forwards a client value to the open instance's proposer.
    pub fn set_proposal(&mut self, sequence_number: u64, value: T) {
        if sequence_number == self.instance_number {
            self.instance.proposer.set_proposal(value);
        }
    }

    pub fn recv_prepare(
        &mut self,
        sequence_number: u64,
        proposal_id: ProposalId,
    ) -> Option<(ProposalId, Option<ProposalId>, Option<T>)> {
        if sequence_number != self.instance_number {
            return None;
        }
        self.instance.proposer.observe_proposal(&proposal_id);
        self.instance.acceptor.recv_prepare(proposal_id)
    }

    pub fn recv_promise(
        &mut self,
        sequence_number: u64,
        from_uid: &str,
        proposal_id: &ProposalId,
        prev_accepted_id: Option<ProposalId>,
        prev_accepted_value: Option<T>,
        now: Duration,
    ) {
        if sequence_number == self.instance_number {
            self.instance.proposer.recv_promise(
                from_uid,
                proposal_id,
                prev_accepted_id,
                prev_accepted_value,
                now,
            );
        }
    }

    pub fn recv_accept_request(
        &mut self,
        sequence_number: u64,
        proposal_id: ProposalId,
        value: T,
    ) -> Option<(ProposalId, T)> {
        if sequence_number != self.instance_number {
            return None;
        }
        self.instance.proposer.observe_proposal(&proposal_id);
        self.instance.acceptor.recv_accept_request(proposal_id, value)
    }

    /// Routes one accepted vote to the learner. Local resolution closes the
    /// instance: the resolved pair is returned and the next slot opens with
    /// leadership carried forward.
    pub fn recv_accepted(
        &mut self,
        sequence_number: u64,
        from_uid: &str,
        proposal_id: ProposalId,
        value: T,
    ) -> Option<(u64, T)> {
        if sequence_number != self.instance_number {
            return None;
        }
        let resolved = self
            .instance
            .learner
            .recv_accepted(from_uid, proposal_id, value)?;

        let resolved_instance = self.instance_number;
        self.instance = self.instance.next(self.quorum_size);
        self.instance_number += 1;

        if log_enabled!(Level::Info) {
            info!(
                "[{}] instance {} resolved, advancing to {}",
                self.node_uid, resolved_instance, self.instance_number
            );
        }
        Some((resolved_instance, resolved))
    }

    pub fn recv_heartbeat(&mut self, leader_id: &ProposalId, now: Duration) {
        self.instance.proposer.recv_heartbeat(leader_id, now);
    }

    pub fn poll_liveness(&mut self, now: Duration) {
        self.instance.proposer.poll_liveness(now);
    }

    pub fn pulse(&mut self, now: Duration) {
        self.instance.proposer.pulse(now);
    }

    pub fn resign(&mut self) {
        self.instance.proposer.resign();
    }

    pub fn have_leadership(&self) -> bool {
        self.instance.proposer.is_leader()
    }
}
