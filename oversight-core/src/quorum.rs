//! Pure quorum evaluation over a tier's responses.

use crate::types::{EscalationTier, QuorumPolicy, Request, Response};
use oversight_kms::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumOutcome {
    Met,
    Pending {
        approvals_so_far: usize,
        approvals_needed: usize,
    },
    Denied,
}

/// Evaluate the current tier's quorum against its recorded responses.
///
/// A DENY dominates regardless of how many approvals preceded or would
/// otherwise be concurrent with it: any single denier blocks.
/// `RequestMoreInfo` responses never count toward quorum in either
/// direction.
pub fn evaluate(tier: &EscalationTier, quorum: &QuorumPolicy, responses: &[&Response]) -> QuorumOutcome {
    if responses
        .iter()
        .any(|r| matches!(r.decision, Decision::Deny))
    {
        return QuorumOutcome::Denied;
    }

    let approvals = responses
        .iter()
        .filter(|r| matches!(r.decision, Decision::Approve))
        .count();

    let needed = match quorum {
        QuorumPolicy::Any => 1,
        QuorumPolicy::All => tier.eligible_approvers.len(),
        QuorumPolicy::Threshold { required } => *required,
    };

    if approvals >= needed {
        QuorumOutcome::Met
    } else {
        QuorumOutcome::Pending {
            approvals_so_far: approvals,
            approvals_needed: needed,
        }
    }
}

/// Convenience wrapper evaluating a `Request`'s current tier in place.
pub fn evaluate_request(request: &Request) -> QuorumOutcome {
    let tier = request.current_tier();
    let quorum = request.effective_quorum();
    let responses = request.decisive_responses_at_current_tier();
    evaluate(tier, quorum, &responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use oversight_kms::SignatureAlgorithm;

    fn tier(approvers: &[&str]) -> EscalationTier {
        EscalationTier {
            index: 0,
            eligible_approvers: approvers.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 3600,
            preferred_channels: vec!["slack".into()],
            quorum_override: None,
        }
    }

    fn response(subject: &str, decision: Decision) -> Response {
        Response {
            approver_subject: subject.to_string(),
            approver_name: subject.to_string(),
            approver_public_key: vec![],
            decision,
            reason: None,
            question: None,
            signature_algorithm: SignatureAlgorithm::Ed25519,
            signature_bytes: vec![],
            channel: "slack".to_string(),
            channel_metadata: serde_json::Value::Null,
            responded_at: Utc::now(),
            tier_index: 0,
        }
    }

    #[test]
    fn any_quorum_met_by_single_approval() {
        let t = tier(&["alice", "bob"]);
        let r = response("alice", Decision::Approve);
        assert_eq!(evaluate(&t, &QuorumPolicy::Any, &[&r]), QuorumOutcome::Met);
    }

    #[test]
    fn all_quorum_pending_until_every_approver_responds() {
        let t = tier(&["alice", "bob", "carol"]);
        let r1 = response("alice", Decision::Approve);
        let r2 = response("bob", Decision::Approve);
        assert_eq!(
            evaluate(&t, &QuorumPolicy::All, &[&r1, &r2]),
            QuorumOutcome::Pending {
                approvals_so_far: 2,
                approvals_needed: 3
            }
        );
    }

    #[test]
    fn deny_dominates_regardless_of_prior_approvals() {
        let t = tier(&["alice", "bob", "carol"]);
        let r1 = response("alice", Decision::Approve);
        let r2 = response("bob", Decision::Deny);
        assert_eq!(evaluate(&t, &QuorumPolicy::All, &[&r1, &r2]), QuorumOutcome::Denied);
    }

    #[test]
    fn threshold_equal_to_tier_size_behaves_as_all() {
        let t = tier(&["alice", "bob"]);
        let quorum = QuorumPolicy::Threshold { required: 2 };
        let r1 = response("alice", Decision::Approve);
        assert_eq!(
            evaluate(&t, &quorum, &[&r1]),
            QuorumOutcome::Pending {
                approvals_so_far: 1,
                approvals_needed: 2
            }
        );
        let r2 = response("bob", Decision::Approve);
        assert_eq!(evaluate(&t, &quorum, &[&r1, &r2]), QuorumOutcome::Met);
    }

    #[test]
    fn threshold_of_one_behaves_as_any() {
        let t = tier(&["alice", "bob", "carol"]);
        let quorum = QuorumPolicy::Threshold { required: 1 };
        let r1 = response("alice", Decision::Approve);
        assert_eq!(evaluate(&t, &quorum, &[&r1]), QuorumOutcome::Met);
    }

    #[test]
    fn request_more_info_does_not_count_toward_quorum() {
        let t = tier(&["alice", "bob"]);
        let r1 = response("alice", Decision::RequestMoreInfo);
        assert_eq!(
            evaluate(&t, &QuorumPolicy::Any, &[&r1]),
            QuorumOutcome::Pending {
                approvals_so_far: 0,
                approvals_needed: 1
            }
        );
    }
}
