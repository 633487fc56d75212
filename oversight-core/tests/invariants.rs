//! Property-based invariants over the Quorum Evaluator and State Machine,
//! generated rather than enumerated by hand.

use chrono::Utc;
use oversight_core::quorum::{evaluate, QuorumOutcome};
use oversight_core::state_machine::{apply, StateEvent};
use oversight_core::types::{ApprovalQuorum, EscalationTier, Request, RequestState, Response};
use oversight_config::FinalAction;
use oversight_kms::{Decision, SignatureAlgorithm};
use proptest::prelude::*;
use uuid::Uuid;

fn tier_with(n: usize) -> EscalationTier {
    EscalationTier {
        index: 0,
        eligible_approvers: (0..n).map(|i| format!("approver-{i}")).collect(),
        timeout_secs: 3600,
        preferred_channels: vec!["slack".into()],
        quorum_override: None,
    }
}

fn response_for(subject: &str, decision: Decision) -> Response {
    Response {
        approver_subject: subject.to_string(),
        approver_name: subject.to_string(),
        approver_public_key: vec![],
        decision,
        reason: None,
        question: None,
        signature_algorithm: SignatureAlgorithm::Ed25519,
        signature_bytes: vec![],
        channel: "slack".into(),
        channel_metadata: serde_json::Value::Null,
        responded_at: Utc::now(),
        tier_index: 0,
    }
}

fn base_request(tier: EscalationTier, quorum: ApprovalQuorum) -> Request {
    Request {
        id: Uuid::new_v4(),
        agent_id: "agent-1".into(),
        delegation_chain: vec!["human-1".into()],
        action: "deploy".into(),
        resource: "prod".into(),
        policy_reference: "policy-1".into(),
        action_summary: "Deploy to prod".into(),
        reasoning: None,
        risk_factors: vec![],
        escalation_chain: vec![tier],
        default_quorum: quorum,
        state: RequestState::Pending,
        current_tier: 0,
        responses: vec![],
        delivery_log: vec![],
        override_token: None,
        cancel_reason: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        resolved_at: None,
        version: 0,
        idempotency_key: None,
    }
}

proptest! {
    /// THRESHOLD{required: N} where N equals the tier's approver count
    /// always agrees with ALL, for any tier size and any subset of
    /// approvers responding APPROVE.
    #[test]
    fn threshold_equal_to_tier_size_matches_all(tier_size in 1usize..12, approvals in 0usize..12) {
        let approvals = approvals.min(tier_size);
        let tier = tier_with(tier_size);
        let responses: Vec<Response> = (0..approvals)
            .map(|i| response_for(&format!("approver-{i}"), Decision::Approve))
            .collect();
        let refs: Vec<&Response> = responses.iter().collect();

        let all_outcome = evaluate(&tier, &ApprovalQuorum::All, &refs);
        let threshold_outcome = evaluate(&tier, &ApprovalQuorum::Threshold { required: tier_size }, &refs);

        prop_assert_eq!(all_outcome, threshold_outcome);
    }

    /// THRESHOLD{required: 1} always agrees with ANY.
    #[test]
    fn threshold_of_one_matches_any(tier_size in 1usize..12, approvals in 0usize..12) {
        let approvals = approvals.min(tier_size);
        let tier = tier_with(tier_size);
        let responses: Vec<Response> = (0..approvals)
            .map(|i| response_for(&format!("approver-{i}"), Decision::Approve))
            .collect();
        let refs: Vec<&Response> = responses.iter().collect();

        let any_outcome = evaluate(&tier, &ApprovalQuorum::Any, &refs);
        let threshold_outcome = evaluate(&tier, &ApprovalQuorum::Threshold { required: 1 }, &refs);

        prop_assert_eq!(any_outcome, threshold_outcome);
    }

    /// A single DENY among any number of prior APPROVE responses always
    /// yields DENIED, regardless of tier size or quorum policy.
    #[test]
    fn deny_always_dominates(tier_size in 1usize..12, approvals_before_deny in 0usize..12) {
        let approvals_before_deny = approvals_before_deny.min(tier_size.saturating_sub(1).max(0));
        let tier = tier_with(tier_size);
        let mut responses: Vec<Response> = (0..approvals_before_deny)
            .map(|i| response_for(&format!("approver-{i}"), Decision::Approve))
            .collect();
        responses.push(response_for(&format!("approver-{tier_size}"), Decision::Deny));
        let refs: Vec<&Response> = responses.iter().collect();

        for quorum in [
            ApprovalQuorum::Any,
            ApprovalQuorum::All,
            ApprovalQuorum::Threshold { required: tier_size.max(1) },
        ] {
            prop_assert_eq!(evaluate(&tier, &quorum, &refs), QuorumOutcome::Denied);
        }
    }

    /// The state machine never accepts a second response from the same
    /// approver subject at the same tier: applying one response then
    /// attempting a second from the same subject always errors.
    #[test]
    fn duplicate_approver_response_is_always_rejected(subject_index in 0usize..5, tier_size in 1usize..6) {
        let tier_size = tier_size.max(subject_index + 1);
        let tier = tier_with(tier_size);
        let request = base_request(tier, ApprovalQuorum::All);
        let subject = format!("approver-{subject_index}");

        let first = apply(
            &request,
            StateEvent::ResponseReceived(response_for(&subject, Decision::Approve)),
            Utc::now(),
            FinalAction::AutoDeny,
        );
        prop_assert!(first.is_ok());
        let (after_first, _) = first.expect("first application succeeds");

        let second = apply(
            &after_first,
            StateEvent::ResponseReceived(response_for(&subject, Decision::Approve)),
            Utc::now(),
            FinalAction::AutoDeny,
        );
        prop_assert!(second.is_err());
    }

    /// A terminal request rejects every further event without mutating
    /// its recorded state.
    #[test]
    fn terminal_request_rejects_all_further_events(tier_size in 1usize..6) {
        let tier = tier_with(tier_size);
        let mut request = base_request(tier, ApprovalQuorum::Any);
        request.state = RequestState::Approved;

        let result = apply(
            &request,
            StateEvent::ResponseReceived(response_for("approver-0", Decision::Approve)),
            Utc::now(),
            FinalAction::AutoDeny,
        );
        prop_assert!(result.is_err());

        let cancel_result = apply(
            &request,
            StateEvent::CancelRequested {
                caller: "human-1".into(),
                reason: "late".into(),
            },
            Utc::now(),
            FinalAction::AutoDeny,
        );
        prop_assert!(cancel_result.is_err());
    }
}
