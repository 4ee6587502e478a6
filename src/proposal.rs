//! The totally-ordered proposal numbers that identify attempts within one
//! Paxos instance.

/// A proposal number: a round paired with the unique identifier of the node
/// that generated it. The derived ordering is lexicographic on
/// `(round, node_uid)`, so any two proposal numbers in the cluster are
/// comparable and ties between rounds break on the node identifier.
/// "No proposal yet" is `Option::<ProposalId>::None`.
///
/// On the wire a proposal id travels as a two-element `(round, node_uid)`
/// tuple.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(from = "(u64, String)", into = "(u64, String)")]
pub struct ProposalId {
    round: u64,
    node_uid: String,
}

impl ProposalId {
    pub fn new(round: u64, node_uid: String) -> Self {
        ProposalId { round, node_uid }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn node_uid(&self) -> &str {
        &self.node_uid
    }
}

impl From<(u64, String)> for ProposalId {
    fn from((round, node_uid): (u64, String)) -> Self {
        ProposalId { round, node_uid }
    }
}

impl From<ProposalId> for (u64, String) {
    fn from(id: ProposalId) -> Self {
        (id.round, id.node_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::ProposalId;

    fn id(round: u64, uid: &str) -> ProposalId {
        ProposalId::new(round, uid.to_string())
    }

    #[test]
    fn order_is_lexicographic_on_round_then_uid() {
        assert!(id(2, "B") > id(2, "A"));
        assert!(id(2, "A") > id(1, "Z"));
        assert!(id(1, "Z") < id(2, "A"));
        assert_eq!(id(3, "C"), id(3, "C"));
    }

    #[test]
    fn none_sorts_below_every_proposal() {
        let some = Some(id(0, ""));
        assert!(None < some);
    }

    #[test]
    fn encodes_as_a_two_element_tuple() {
        let encoded = serde_json::to_string(&id(7, "N3")).unwrap();
        assert_eq!(encoded, r#"[7,"N3"]"#);

        let decoded: ProposalId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, id(7, "N3"));
    }

    #[test]
    fn order_survives_the_wire() {
        let lo = serde_json::to_string(&id(2, "A")).unwrap();
        let hi = serde_json::to_string(&id(2, "B")).unwrap();
        let lo: ProposalId = serde_json::from_str(&lo).unwrap();
        let hi: ProposalId = serde_json::from_str(&hi).unwrap();
        assert!(hi > lo);
    }
}
