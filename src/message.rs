//! The wire messages nodes exchange and their multipart framing.
//!
//! Every broadcast frame stack is `["zpax", header, payload?]`: frame 0 is
//! the topic tag, frame 1 a JSON object carrying at least `type`,
//! `node_uid` and `seq_num`, and frame 2, when present, a JSON array of
//! Paxos fields. Proposal ids travel as `(round, node_uid)` tuples.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::MessageError;
use crate::proposal::ProposalId;

/// Topic tag prefixed to every frame stack on the bus.
pub const TOPIC: &str = "zpax";

/// The closed set of messages nodes exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    /// A client value submitted for the open instance. Any node may relay
    /// it; the leader picks it up through its own subscription.
    ValueProposal { value: T },

    /// Phase 1a: a proposer opens a round.
    Prepare { proposal_id: ProposalId },

    /// Phase 1b: an acceptor promises the round and reports what, if
    /// anything, it accepted before.
    Promise {
        proposal_id: ProposalId,
        prev_accepted_id: Option<ProposalId>,
        prev_accepted_value: Option<T>,
    },

    /// Phase 2a: the proposer asks the acceptors to accept a value.
    Accept { proposal_id: ProposalId, value: T },

    /// Phase 2b: an acceptor announces its vote to the learners.
    Accepted { proposal_id: ProposalId, value: T },

    /// Leader liveness announcement plus application-supplied data.
    Heartbeat {
        leader_proposal_id: ProposalId,
        data: Map<String, Value>,
    },
}

impl<T> Message<T> {
    /// The wire tag this message dispatches on.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ValueProposal { .. } => "value_proposal",
            Message::Prepare { .. } => "paxos_prepare",
            Message::Promise { .. } => "paxos_promise",
            Message::Accept { .. } => "paxos_accept",
            Message::Accepted { .. } => "paxos_accepted",
            Message::Heartbeat { .. } => "paxos_heartbeat",
        }
    }
}

/// One routed message: who sent it, at which sequence number, and the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub node_uid: String,
    pub seq_num: u64,
    pub message: Message<T>,
}

// Frame 1. Extra header fields (the value of a value_proposal, a
// heartbeat's application data) ride alongside the three fixed keys.
#[derive(Serialize, Deserialize)]
struct Header<T> {
    #[serde(rename = "type")]
    kind: String,
    node_uid: String,
    seq_num: u64,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    value: Option<T>,
    #[serde(flatten)]
    data: Map<String, Value>,
}

impl<T> Envelope<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Renders the multipart frame stack for the bus.
    pub fn encode(&self) -> Vec<String> {
        let mut header = Header {
            kind: self.message.kind().to_string(),
            node_uid: self.node_uid.clone(),
            seq_num: self.seq_num,
            value: None,
            data: Map::new(),
        };

        let payload = match &self.message {
            Message::ValueProposal { value } => {
                header.value = Some(value.clone());
                None
            }
            Message::Prepare { proposal_id } => Some(to_frame(&(proposal_id.clone(),))),
            Message::Promise {
                proposal_id,
                prev_accepted_id,
                prev_accepted_value,
            } => Some(to_frame(&(
                proposal_id.clone(),
                prev_accepted_id.clone(),
                prev_accepted_value.clone(),
            ))),
            Message::Accept { proposal_id, value } => {
                Some(to_frame(&(proposal_id.clone(), value.clone())))
            }
            Message::Accepted { proposal_id, value } => {
                Some(to_frame(&(proposal_id.clone(), value.clone())))
            }
            Message::Heartbeat {
                leader_proposal_id,
                data,
            } => {
                header.data = data.clone();
                Some(to_frame(&(leader_proposal_id.clone(),)))
            }
        };

        let mut frames = vec![TOPIC.to_string(), to_frame(&header)];
        if let Some(payload) = payload {
            frames.push(payload);
        }
        frames
    }

    /// Parses one inbound frame stack back into an envelope.
    pub fn decode(frames: &[String]) -> Result<Envelope<T>, MessageError> {
        if frames.len() < 2 || frames[0] != TOPIC {
            return Err(MessageError::Malformed(
                "expected a topic frame followed by a header frame".to_string(),
            ));
        }

        let header: Header<T> = serde_json::from_str(&frames[1])
            .map_err(|err| MessageError::Malformed(err.to_string()))?;
        let Header {
            kind,
            node_uid,
            seq_num,
            value,
            data,
        } = header;

        let message = match kind.as_str() {
            "value_proposal" => Message::ValueProposal {
                value: value.ok_or_else(|| {
                    MessageError::Malformed("value_proposal without a value".to_string())
                })?,
            },
            "paxos_prepare" => {
                let (proposal_id,): (ProposalId,) = payload_frame(frames)?;
                Message::Prepare { proposal_id }
            }
            "paxos_promise" => {
                let (proposal_id, prev_accepted_id, prev_accepted_value) = payload_frame(frames)?;
                Message::Promise {
                    proposal_id,
                    prev_accepted_id,
                    prev_accepted_value,
                }
            }
            "paxos_accept" => {
                let (proposal_id, value) = payload_frame(frames)?;
                Message::Accept { proposal_id, value }
            }
            "paxos_accepted" => {
                let (proposal_id, value) = payload_frame(frames)?;
                Message::Accepted { proposal_id, value }
            }
            "paxos_heartbeat" => {
                let (leader_proposal_id,): (ProposalId,) = payload_frame(frames)?;
                Message::Heartbeat {
                    leader_proposal_id,
                    data,
                }
            }
            _ => return Err(MessageError::UnknownType(kind)),
        };

        Ok(Envelope {
            node_uid,
            seq_num,
            message,
        })
    }
}

fn to_frame<S: Serialize>(value: &S) -> String {
    serde_json::to_string(value).expect("Could not serialize the frame")
}

fn payload_frame<P: DeserializeOwned>(frames: &[String]) -> Result<P, MessageError> {
    let frame = frames
        .get(2)
        .ok_or_else(|| MessageError::Malformed("missing the Paxos payload frame".to_string()))?;
    serde_json::from_str(frame).map_err(|err| MessageError::Malformed(err.to_string()))
}
