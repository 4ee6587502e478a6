//! Heartbeat-driven leader election layered over the base proposer.
//!
//! Leadership is an opinion used to keep one distinguished proposer active;
//! safety comes from the Paxos rules alone, so two nodes briefly believing
//! they lead can cost progress but never correctness. A silent leader is
//! presumed dead after the liveness window, at which point a follower opens
//! a round above everything the old regime used.

use std::fmt::Debug;
use std::time::Duration;

use log::Level;

use crate::basic::{Messenger, Proposer};
use crate::proposal::ProposalId;

/// Heartbeat cadence and the window after which a silent leader is presumed
/// dead. The window must exceed the period by a comfortable margin; the
/// defaults keep a 3x ratio.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub period: Duration,
    pub liveness_window: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            period: Duration::from_millis(500),
            liveness_window: Duration::from_millis(1500),
        }
    }
}

/// A base proposer plus the heartbeat bookkeeping: who we currently believe
/// leads, and when we last heard from them.
pub struct HeartbeatProposer<T> {
    core: Proposer<T>,
    config: HeartbeatConfig,
    messenger: Messenger<T>,
    leader_proposal_id: Option<ProposalId>,
    last_heartbeat: Duration,
}

impl<T> HeartbeatProposer<T>
where
    T: Clone + Debug,
{
    /// A fresh proposer with no leader opinion. `now` starts the liveness
    /// window, so a cluster gets one full window to elect before anyone
    /// starts dueling.
    pub fn new(
        node_uid: String,
        quorum_size: usize,
        messenger: Messenger<T>,
        config: HeartbeatConfig,
        now: Duration,
    ) -> Self {
        HeartbeatProposer {
            core: Proposer::new(node_uid, quorum_size, messenger.clone()),
            config,
            messenger,
            leader_proposal_id: None,
            last_heartbeat: now,
        }
    }

    /// The proposer for the next instance: per-instance state resets while
    /// the round counter, the current id, our leadership and the leader
    /// opinion all carry forward.
    pub fn successor(&self) -> HeartbeatProposer<T> {
        HeartbeatProposer {
            core: Proposer::resumed(
                self.core.node_uid().to_string(),
                self.core.quorum_size(),
                self.messenger.clone(),
                self.core.proposal_id().cloned(),
                self.core.highest_round(),
                self.core.is_leader(),
            ),
            config: self.config,
            messenger: self.messenger.clone(),
            leader_proposal_id: self.leader_proposal_id.clone(),
            last_heartbeat: self.last_heartbeat,
        }
    }

    /// Emits one leadership heartbeat. Only a leader pulses; its own pulse
    /// also refreshes its view of leader liveness.
    pub fn pulse(&mut self, now: Duration) {
        if !self.core.is_leader() {
            return;
        }
        if let Some(proposal_id) = self.core.proposal_id().cloned() {
            self.recv_heartbeat(&proposal_id, now);
            self.messenger.send_heartbeat(proposal_id);
        }
    }

    pub fn leader_is_alive(&self, now: Duration) -> bool {
        match now.checked_sub(self.last_heartbeat) {
            Some(age) => age <= self.config.liveness_window,
            None => true,
        }
    }

    /// Liveness check, run once per liveness window. A follower that has
    /// not heard from the leader within the window tries to seize
    /// leadership with a round above both its own and the silent leader's.
    pub fn poll_liveness(&mut self, now: Duration) {
        if self.core.is_leader() || self.leader_is_alive(now) {
            return;
        }
        if let Some(leader_id) = self.leader_proposal_id.clone() {
            self.core.observe_proposal(&leader_id);
        }
        if log_enabled!(Level::Info) {
            info!(
                "[{}] leader silent past the liveness window, preparing",
                self.core.node_uid()
            );
        }
        self.core.prepare();
    }

    /// Adopts heartbeats from proposal ids at least as great as the current
    /// leader's, refreshing the liveness clock. A strictly greater id is a
    /// leadership change; losing our own leadership this way is announced
    /// before the change notice.
    pub fn recv_heartbeat(&mut self, leader_id: &ProposalId, now: Duration) {
        let supersedes = match &self.leader_proposal_id {
            Some(current) => leader_id > current,
            None => true,
        };

        if supersedes {
            let prev_leader_uid = self
                .leader_proposal_id
                .as_ref()
                .map(|id| id.node_uid().to_string());

            self.core.observe_proposal(leader_id);
            self.leader_proposal_id = Some(leader_id.clone());
            self.last_heartbeat = now;

            if self.core.is_leader() && leader_id.node_uid() != self.core.node_uid() {
                self.core.set_leader(false);
                self.messenger.on_leadership_lost();
            }
            if prev_leader_uid.as_deref() != Some(leader_id.node_uid()) {
                self.messenger.on_leadership_change(
                    prev_leader_uid,
                    Some(leader_id.node_uid().to_string()),
                );
            }
        } else if self.leader_proposal_id.as_ref() == Some(leader_id) {
            self.last_heartbeat = now;
        }
    }

    /// Phase 1b with leadership accounting: completing a promise quorum at
    /// our own id is the moment leadership is acquired.
    pub fn recv_promise(
        &mut self,
        from_uid: &str,
        proposal_id: &ProposalId,
        prev_accepted_id: Option<ProposalId>,
        prev_accepted_value: Option<T>,
        now: Duration,
    ) {
        let was_leader = self.core.is_leader();
        self.core
            .recv_promise(from_uid, proposal_id, prev_accepted_id, prev_accepted_value);

        if self.core.is_leader() && !was_leader {
            let prev_leader_uid = self
                .leader_proposal_id
                .as_ref()
                .map(|id| id.node_uid().to_string());

            self.leader_proposal_id = self.core.proposal_id().cloned();
            self.last_heartbeat = now;

            if log_enabled!(Level::Info) {
                info!(
                    "[{}] promise quorum complete, leadership acquired",
                    self.core.node_uid()
                );
            }
            self.messenger.on_leadership_acquired();
            if prev_leader_uid.as_deref() != Some(self.core.node_uid()) {
                self.messenger.on_leadership_change(
                    prev_leader_uid,
                    Some(self.core.node_uid().to_string()),
                );
            }
            self.pulse(now);
        }
    }

    /// Drops our own claim to leadership without touching the opinion of
    /// who leads. Used when the application slews past the open instance.
    pub fn resign(&mut self) {
        if self.core.is_leader() {
            self.core.set_leader(false);
            self.messenger.on_leadership_lost();
        }
    }

    pub fn set_proposal(&mut self, value: T) {
        self.core.set_proposal(value);
    }

    pub fn observe_proposal(&mut self, proposal_id: &ProposalId) {
        self.core.observe_proposal(proposal_id);
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    pub fn node_uid(&self) -> &str {
        self.core.node_uid()
    }

    pub fn proposal_id(&self) -> Option<&ProposalId> {
        self.core.proposal_id()
    }

    pub fn proposed_value(&self) -> Option<&T> {
        self.core.proposed_value()
    }

    pub fn leader_proposal_id(&self) -> Option<&ProposalId> {
        self.leader_proposal_id.as_ref()
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    pub fn set_active(&mut self, active: bool) {
        self.core.set_active(active);
    }
}
