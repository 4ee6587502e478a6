//! Single-instance Paxos: the Proposer, Acceptor and Learner state machines.
//! These are pure state transitions; everything a proposer wants sent or
//! announced goes through a [`Messenger`] queue that the owning node drains
//! after each transition.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::rc::Rc;

use log::Level;

use crate::proposal::ProposalId;

/// Outbound traffic and lifecycle notices emitted by the proposer layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive<T> {
    SendPrepare(ProposalId),
    SendAccept(ProposalId, T),
    SendHeartbeat(ProposalId),
    LeadershipAcquired,
    LeadershipLost,
    LeadershipChanged {
        prev_leader_uid: Option<String>,
        new_leader_uid: Option<String>,
    },
}

/// The narrow send capability handed to proposers. Cloning yields another
/// handle onto the same queue; the node drains it after every transition.
#[derive(Clone)]
pub struct Messenger<T> {
    queue: Rc<RefCell<VecDeque<Directive<T>>>>,
}

impl<T> Messenger<T> {
    pub fn new() -> Self {
        Messenger {
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn send_prepare(&self, proposal_id: ProposalId) {
        self.push(Directive::SendPrepare(proposal_id));
    }

    pub fn send_accept(&self, proposal_id: ProposalId, value: T) {
        self.push(Directive::SendAccept(proposal_id, value));
    }

    pub fn send_heartbeat(&self, leader_proposal_id: ProposalId) {
        self.push(Directive::SendHeartbeat(leader_proposal_id));
    }

    pub fn on_leadership_acquired(&self) {
        self.push(Directive::LeadershipAcquired);
    }

    pub fn on_leadership_lost(&self) {
        self.push(Directive::LeadershipLost);
    }

    pub fn on_leadership_change(
        &self,
        prev_leader_uid: Option<String>,
        new_leader_uid: Option<String>,
    ) {
        self.push(Directive::LeadershipChanged {
            prev_leader_uid,
            new_leader_uid,
        });
    }

    /// Takes everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<Directive<T>> {
        self.queue.borrow_mut().drain(..).collect()
    }

    fn push(&self, directive: Directive<T>) {
        self.queue.borrow_mut().push_back(directive);
    }
}

/// Per-instance acceptor state. Both receive rules compare with `>=`, not
/// `>`: a proposer holding a quorum of promises at its own id must be able
/// to get that same id accepted.
pub struct Acceptor<T> {
    promised_id: Option<ProposalId>,
    accepted_id: Option<ProposalId>,
    accepted_value: Option<T>,
}

impl<T: Clone> Acceptor<T> {
    pub fn new() -> Self {
        Acceptor {
            promised_id: None,
            accepted_id: None,
            accepted_value: None,
        }
    }

    /// Phase 1a. Promises the id and reports any previously accepted pair,
    /// or stays silent for an out-of-date id.
    pub fn recv_prepare(
        &mut self,
        proposal_id: ProposalId,
    ) -> Option<(ProposalId, Option<ProposalId>, Option<T>)> {
        if Some(&proposal_id) < self.promised_id.as_ref() {
            return None;
        }
        self.promised_id = Some(proposal_id.clone());
        Some((
            proposal_id,
            self.accepted_id.clone(),
            self.accepted_value.clone(),
        ))
    }

    /// Phase 2a. Accepts the pair and echoes it for the learners, or stays
    /// silent.
    pub fn recv_accept_request(
        &mut self,
        proposal_id: ProposalId,
        value: T,
    ) -> Option<(ProposalId, T)> {
        if Some(&proposal_id) < self.promised_id.as_ref() {
            return None;
        }
        self.promised_id = Some(proposal_id.clone());
        self.accepted_id = Some(proposal_id.clone());
        self.accepted_value = Some(value.clone());
        Some((proposal_id, value))
    }

    pub fn promised_id(&self) -> Option<&ProposalId> {
        self.promised_id.as_ref()
    }

    pub fn accepted_id(&self) -> Option<&ProposalId> {
        self.accepted_id.as_ref()
    }

    pub fn accepted_value(&self) -> Option<&T> {
        self.accepted_value.as_ref()
    }
}

/// Per-instance learner: counts distinct acceptors per proposal id and
/// resolves when any single id reaches quorum. A resolved learner ignores
/// all further input.
pub struct Learner<T> {
    quorum_size: usize,
    votes: HashMap<ProposalId, (HashSet<String>, T)>,
    final_id: Option<ProposalId>,
    final_value: Option<T>,
}

impl<T: Clone> Learner<T> {
    pub fn new(quorum_size: usize) -> Self {
        Learner {
            quorum_size,
            votes: HashMap::new(),
            final_id: None,
            final_value: None,
        }
    }

    /// Records one accepted vote. Returns the resolved value exactly when
    /// this vote completes a quorum; duplicates and post-resolution input
    /// return `None`.
    pub fn recv_accepted(
        &mut self,
        from_uid: &str,
        proposal_id: ProposalId,
        value: T,
    ) -> Option<T> {
        if self.final_value.is_some() {
            return None;
        }

        let resolved = {
            let entry = self
                .votes
                .entry(proposal_id.clone())
                .or_insert_with(move || (HashSet::new(), value));
            if !entry.0.insert(from_uid.to_string()) {
                return None;
            }
            if entry.0.len() >= self.quorum_size {
                Some(entry.1.clone())
            } else {
                None
            }
        };

        if let Some(value) = resolved {
            self.final_id = Some(proposal_id);
            self.final_value = Some(value.clone());
            return Some(value);
        }
        None
    }

    pub fn complete(&self) -> bool {
        self.final_value.is_some()
    }

    pub fn final_value(&self) -> Option<&T> {
        self.final_value.as_ref()
    }

    pub fn final_id(&self) -> Option<&ProposalId> {
        self.final_id.as_ref()
    }
}

/// Per-instance base proposer: issues prepares and accepts, collects
/// promises, and latches the value under proposal.
pub struct Proposer<T> {
    node_uid: String,
    quorum_size: usize,
    messenger: Messenger<T>,
    proposed_value: Option<T>,
    proposal_id: Option<ProposalId>,
    highest_round: u64,
    promises_received: HashSet<String>,
    highest_accepted: Option<(ProposalId, T)>,
    leader: bool,
    active: bool,
}

impl<T> Proposer<T>
where
    T: Clone + Debug,
{
    pub fn new(node_uid: String, quorum_size: usize, messenger: Messenger<T>) -> Self {
        Proposer {
            node_uid,
            quorum_size,
            messenger,
            proposed_value: None,
            proposal_id: None,
            highest_round: 0,
            promises_received: HashSet::new(),
            highest_accepted: None,
            leader: false,
            active: true,
        }
    }

    // Rebuilds a proposer for the next instance: per-instance promise state
    // resets while the round counter, the current id and leadership carry.
    pub(crate) fn resumed(
        node_uid: String,
        quorum_size: usize,
        messenger: Messenger<T>,
        proposal_id: Option<ProposalId>,
        highest_round: u64,
        leader: bool,
    ) -> Self {
        Proposer {
            node_uid,
            quorum_size,
            messenger,
            proposed_value: None,
            proposal_id,
            highest_round,
            promises_received: HashSet::new(),
            highest_accepted: None,
            leader,
            active: true,
        }
    }

    /// Latches the value under proposal; only the first call takes effect.
    /// A leader that already holds a promise quorum pushes the value
    /// straight to the accept phase.
    pub fn set_proposal(&mut self, value: T) {
        if self.proposed_value.is_some() {
            return;
        }
        self.proposed_value = Some(value.clone());
        if self.leader && self.active {
            if let Some(proposal_id) = self.proposal_id.clone() {
                self.messenger.send_accept(proposal_id, value);
            }
        }
    }

    /// Notes a proposal id seen anywhere in the protocol so that future
    /// rounds of ours sort above it.
    pub fn observe_proposal(&mut self, proposal_id: &ProposalId) {
        if proposal_id.round() > self.highest_round {
            self.highest_round = proposal_id.round();
        }
    }

    /// Phase 1a: opens a round strictly above every round seen and restarts
    /// promise collection.
    pub fn prepare(&mut self) -> ProposalId {
        self.highest_round += 1;
        let proposal_id = ProposalId::new(self.highest_round, self.node_uid.clone());

        if log_enabled!(Level::Info) {
            info!("[{}] opening round {:?}", self.node_uid, proposal_id);
        }

        self.leader = false;
        self.promises_received.clear();
        self.highest_accepted = None;
        self.proposal_id = Some(proposal_id.clone());

        if self.active {
            self.messenger.send_prepare(proposal_id.clone());
        }
        proposal_id
    }

    /// Phase 1b: records one promise for the current round. Reaching quorum
    /// unconditionally adopts the highest value any acceptor previously
    /// accepted and, with a value in hand, moves to the accept phase.
    pub fn recv_promise(
        &mut self,
        from_uid: &str,
        proposal_id: &ProposalId,
        prev_accepted_id: Option<ProposalId>,
        prev_accepted_value: Option<T>,
    ) {
        self.observe_proposal(proposal_id);

        if self.leader
            || Some(proposal_id) != self.proposal_id.as_ref()
            || self.promises_received.contains(from_uid)
        {
            return;
        }
        self.promises_received.insert(from_uid.to_string());

        if let (Some(prev_id), Some(prev_value)) = (prev_accepted_id, prev_accepted_value) {
            let supersedes = match &self.highest_accepted {
                Some((highest_id, _)) => prev_id > *highest_id,
                None => true,
            };
            if supersedes {
                self.highest_accepted = Some((prev_id, prev_value));
            }
        }

        if self.promises_received.len() < self.quorum_size {
            return;
        }

        self.leader = true;
        if let Some((_, value)) = self.highest_accepted.clone() {
            self.proposed_value = Some(value);
        }
        if let (Some(proposal_id), Some(value)) =
            (self.proposal_id.clone(), self.proposed_value.clone())
        {
            if self.active {
                self.messenger.send_accept(proposal_id, value);
            }
        }
    }

    pub fn node_uid(&self) -> &str {
        &self.node_uid
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn proposal_id(&self) -> Option<&ProposalId> {
        self.proposal_id.as_ref()
    }

    pub fn proposed_value(&self) -> Option<&T> {
        self.proposed_value.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub(crate) fn set_leader(&mut self, leader: bool) {
        self.leader = leader;
    }

    pub(crate) fn highest_round(&self) -> u64 {
        self.highest_round
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// An inactive proposer keeps observing the protocol but sends nothing.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}
