//! State Machine: the authoritative transition table. Pure with respect to
//! its inputs — `apply` takes a `Request` by reference and returns the next
//! `Request` plus a plan of side effects; it never mutates in place and
//! never touches the Checkpoint Store, Timer Wheel, or Audit Chainer
//! itself. The Request Manager applies the plan only after the returned
//! `Request` commits successfully.

use crate::error::{OversightError, OversightResult};
use crate::quorum::{evaluate, QuorumOutcome};
use crate::types::{Request, RequestState, Response};
use chrono::{DateTime, Utc};
use oversight_config::FinalAction;
use oversight_kms::{Decision, IssuedBy};

/// Events the state machine accepts.
pub enum StateEvent {
    ResponseReceived(Response),
    TierTimeout { tier_index: usize },
    CancelRequested { caller: String, reason: String },
}

/// Side effects the Request Manager must perform after a successful
/// commit of the returned `Request`.
#[derive(Debug, Default)]
pub struct TransitionEffects {
    pub audit: Option<AuditEffect>,
    pub cancel_timer: bool,
    pub arm_tier: Option<(usize, i64)>,
    pub notify_tier: Option<usize>,
    pub issue_token: Option<IssuedBy>,
    /// Set when this call is a no-op duplicate; the manager reports success
    /// without emitting any further effect.
    pub idempotent_duplicate: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum AuditEffect {
    ResponseReceived,
    Approved,
    Denied,
    Escalated { from_tier: usize, to_tier: usize },
    TimedOut,
    Cancelled,
}

/// Apply one event to `request`, returning the next state and the effect
/// plan. Does not mutate `request`.
pub fn apply(
    request: &Request,
    event: StateEvent,
    now: DateTime<Utc>,
    final_action: FinalAction,
) -> OversightResult<(Request, TransitionEffects)> {
    if request.state.is_terminal() {
        return Err(OversightError::RequestAlreadyResolved(request.id.to_string()));
    }

    match event {
        StateEvent::ResponseReceived(response) => apply_response(request, response, now),
        StateEvent::TierTimeout { tier_index } => apply_timeout(request, tier_index, now, final_action),
        StateEvent::CancelRequested { caller, reason } => apply_cancel(request, &caller, reason, now),
    }
}

fn apply_response(
    request: &Request,
    response: Response,
    now: DateTime<Utc>,
) -> OversightResult<(Request, TransitionEffects)> {
    let tier = request.current_tier();

    if !tier.eligible_approvers.contains(&response.approver_subject) {
        return Err(OversightError::ApproverNotEligible {
            subject: response.approver_subject,
            tier_index: request.current_tier,
        });
    }

    if request
        .responses
        .iter()
        .any(|r| r.tier_index == request.current_tier && r.approver_subject == response.approver_subject)
    {
        return Err(OversightError::DuplicateResponse {
            request_id: request.id.to_string(),
            subject: response.approver_subject,
        });
    }

    let mut next = request.clone();
    next.responses.push(response.clone());
    next.updated_at = now;
    next.version += 1;

    let mut effects = TransitionEffects {
        audit: Some(AuditEffect::ResponseReceived),
        ..Default::default()
    };

    if matches!(response.decision, Decision::Deny) {
        next.state = RequestState::Denied;
        next.resolved_at = Some(now);
        effects.audit = Some(AuditEffect::Denied);
        effects.cancel_timer = true;
        return Ok((next, effects));
    }

    if matches!(response.decision, Decision::RequestMoreInfo) {
        // Recorded for audit but never changes quorum state or the armed
        // timer.
        return Ok((next, effects));
    }

    let decisive = next.decisive_responses_at_current_tier();
    let outcome = evaluate(tier, next.effective_quorum(), &decisive);

    if outcome == QuorumOutcome::Met {
        next.state = RequestState::Approved;
        next.resolved_at = Some(now);
        effects.audit = Some(AuditEffect::Approved);
        effects.cancel_timer = true;
        effects.issue_token = Some(IssuedBy::Approver(response.approver_subject));
    }

    Ok((next, effects))
}

fn apply_timeout(
    request: &Request,
    tier_index: usize,
    now: DateTime<Utc>,
    final_action: FinalAction,
) -> OversightResult<(Request, TransitionEffects)> {
    if tier_index != request.current_tier {
        // Stale timer for a tier this request has already left; the
        // caller drops this event entirely.
        return Ok((request.clone(), TransitionEffects::default()));
    }

    let mut next = request.clone();
    next.updated_at = now;
    next.version += 1;

    let is_final_tier = request.current_tier + 1 >= request.escalation_chain.len();

    if !is_final_tier {
        let from_tier = next.current_tier;
        next.current_tier += 1;
        next.state = RequestState::Pending;
        let to_tier = next.current_tier;
        let next_timeout = next.escalation_chain[to_tier].timeout_secs;

        let effects = TransitionEffects {
            audit: Some(AuditEffect::Escalated { from_tier, to_tier }),
            arm_tier: Some((to_tier, next_timeout)),
            notify_tier: Some(to_tier),
            ..Default::default()
        };
        return Ok((next, effects));
    }

    next.state = RequestState::TimedOut;
    next.resolved_at = Some(now);

    let mut effects = TransitionEffects {
        audit: Some(AuditEffect::TimedOut),
        ..Default::default()
    };

    match final_action {
        FinalAction::AutoDeny | FinalAction::BlockIndefinitely => {}
        FinalAction::AutoApprove => {
            next.state = RequestState::Approved;
            effects.issue_token = Some(IssuedBy::System);
        }
    }

    Ok((next, effects))
}

fn apply_cancel(
    request: &Request,
    caller: &str,
    reason: String,
    now: DateTime<Utc>,
) -> OversightResult<(Request, TransitionEffects)> {
    if !request.is_authorized_to_cancel(caller) {
        return Err(OversightError::CallerNotAuthorized);
    }

    let mut next = request.clone();
    next.state = RequestState::Cancelled;
    next.cancel_reason = Some(reason);
    next.resolved_at = Some(now);
    next.updated_at = now;
    next.version += 1;

    let effects = TransitionEffects {
        audit: Some(AuditEffect::Cancelled),
        cancel_timer: true,
        ..Default::default()
    };

    Ok((next, effects))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalQuorum, EscalationTier};
    use oversight_kms::SignatureAlgorithm;
    use uuid::Uuid;

    fn base_request() -> Request {
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
            escalation_chain: vec![
                EscalationTier {
                    index: 0,
                    eligible_approvers: vec!["alice".into(), "bob".into()],
                    timeout_secs: 3600,
                    preferred_channels: vec!["slack".into()],
                    quorum_override: None,
                },
                EscalationTier {
                    index: 1,
                    eligible_approvers: vec!["cfo".into()],
                    timeout_secs: 7200,
                    preferred_channels: vec!["email".into()],
                    quorum_override: None,
                },
            ],
            default_quorum: ApprovalQuorum::Any,
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

    fn response(subject: &str, decision: Decision, tier_index: usize) -> Response {
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
            tier_index,
        }
    }

    #[test]
    fn any_quorum_approves_on_first_approval() {
        let request = base_request();
        let (next, effects) = apply(
            &request,
            StateEvent::ResponseReceived(response("alice", Decision::Approve, 0)),
            Utc::now(),
            FinalAction::AutoDeny,
        )
        .expect("apply");

        assert_eq!(next.state, RequestState::Approved);
        assert!(matches!(effects.issue_token, Some(IssuedBy::Approver(_))));
    }

    #[test]
    fn deny_short_circuits_immediately() {
        let request = base_request();
        let (next, _) = apply(
            &request,
            StateEvent::ResponseReceived(response("alice", Decision::Deny, 0)),
            Utc::now(),
            FinalAction::AutoDeny,
        )
        .expect("apply");

        assert_eq!(next.state, RequestState::Denied);
    }

    #[test]
    fn already_resolved_request_rejects_further_events() {
        let mut request = base_request();
        request.state = RequestState::Approved;

        let result = apply(
            &request,
            StateEvent::ResponseReceived(response("bob", Decision::Approve, 0)),
            Utc::now(),
            FinalAction::AutoDeny,
        );

        assert!(matches!(result, Err(OversightError::RequestAlreadyResolved(_))));
    }

    #[test]
    fn duplicate_response_from_same_approver_is_rejected() {
        let mut request = base_request();
        request.responses.push(response("alice", Decision::RequestMoreInfo, 0));

        let result = apply(
            &request,
            StateEvent::ResponseReceived(response("alice", Decision::Approve, 0)),
            Utc::now(),
            FinalAction::AutoDeny,
        );

        assert!(matches!(result, Err(OversightError::DuplicateResponse { .. })));
    }

    #[test]
    fn timeout_on_non_final_tier_escalates() {
        let request = base_request();
        let (next, effects) = apply(
            &request,
            StateEvent::TierTimeout { tier_index: 0 },
            Utc::now(),
            FinalAction::AutoDeny,
        )
        .expect("apply");

        assert_eq!(next.state, RequestState::Pending);
        assert_eq!(next.current_tier, 1);
        assert_eq!(effects.arm_tier, Some((1, 7200)));
    }

    #[test]
    fn timeout_on_final_tier_with_auto_deny_times_out() {
        let mut request = base_request();
        request.current_tier = 1;

        let (next, _) = apply(
            &request,
            StateEvent::TierTimeout { tier_index: 1 },
            Utc::now(),
            FinalAction::AutoDeny,
        )
        .expect("apply");

        assert_eq!(next.state, RequestState::TimedOut);
    }

    #[test]
    fn timeout_on_final_tier_with_auto_approve_issues_system_token() {
        let mut request = base_request();
        request.current_tier = 1;

        let (next, effects) = apply(
            &request,
            StateEvent::TierTimeout { tier_index: 1 },
            Utc::now(),
            FinalAction::AutoApprove,
        )
        .expect("apply");

        assert_eq!(next.state, RequestState::Approved);
        assert_eq!(effects.issue_token, Some(IssuedBy::System));
    }

    #[test]
    fn stale_timeout_for_superseded_tier_is_dropped() {
        let mut request = base_request();
        request.current_tier = 1;

        let (next, effects) = apply(
            &request,
            StateEvent::TierTimeout { tier_index: 0 },
            Utc::now(),
            FinalAction::AutoDeny,
        )
        .expect("apply");

        assert_eq!(next.current_tier, 1);
        assert!(effects.audit.is_none());
    }

    #[test]
    fn cancel_is_terminal_and_cancels_timer() {
        let request = base_request();
        let (next, effects) = apply(
            &request,
            StateEvent::CancelRequested {
                caller: "human-1".into(),
                reason: "no longer needed".into(),
            },
            Utc::now(),
            FinalAction::AutoDeny,
        )
        .expect("apply");

        assert_eq!(next.state, RequestState::Cancelled);
        assert!(effects.cancel_timer);
    }

    #[test]
    fn cancel_by_an_eligible_approver_is_allowed() {
        let request = base_request();
        let (next, _) = apply(
            &request,
            StateEvent::CancelRequested {
                caller: "alice".into(),
                reason: "mistaken request".into(),
            },
            Utc::now(),
            FinalAction::AutoDeny,
        )
        .expect("apply");

        assert_eq!(next.state, RequestState::Cancelled);
    }

    #[test]
    fn cancel_by_an_unrelated_caller_is_rejected() {
        let request = base_request();
        let result = apply(
            &request,
            StateEvent::CancelRequested {
                caller: "stranger".into(),
                reason: "no longer needed".into(),
            },
            Utc::now(),
            FinalAction::AutoDeny,
        );

        assert!(matches!(result, Err(OversightError::CallerNotAuthorized)));
    }
}
