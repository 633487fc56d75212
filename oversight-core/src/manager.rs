//! Request Manager: the orchestrator that ties together the Timer Wheel,
//! Signature Verifier, Audit Chainer, Checkpoint Store, Delivery Log,
//! Quorum Evaluator, State Machine, Override Token Issuer, and the
//! Await/Watch Facility into the public `create_request` /
//! `submit_response` / `cancel_request` surface, plus startup recovery.

use crate::delivery::DeliveryLog;
use crate::error::{OversightError, OversightResult};
use crate::quorum;
use crate::state_machine::{self, AuditEffect, StateEvent};
use crate::store::CheckpointStore;
use crate::timer::{ConsensusClock, TimerWheel};
use crate::types::{ApprovalQuorum, EscalationTier, OverrideTokenRecord, Request, RequestState, Response};
use crate::watch::WatchHub;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use oversight_config::OversightSettings;
use oversight_kms::{
    canonical_approval_message, Decision, IdentityRegistry, IssuedBy, OverrideToken,
    OverrideTokenIssuer, SignatureAlgorithm, SignatureVerifier,
};
use oversight_lockchain::{AuditChainer, AuditEventType};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Bounded retries on `ConcurrentModification` before giving up and
/// surfacing the conflict to the caller.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// An escalation chain longer than this is rejected at creation.
const MAX_ESCALATION_TIERS: usize = 10;

/// Everything needed to open a new approval request.
pub struct NewRequestInput {
    pub agent_id: String,
    pub delegation_chain: Vec<String>,
    pub action: String,
    pub resource: String,
    pub policy_reference: String,
    pub action_summary: String,
    pub reasoning: Option<String>,
    pub risk_factors: Vec<String>,
    pub escalation_chain: Vec<EscalationTier>,
    pub default_quorum: ApprovalQuorum,
    pub idempotency_key: Option<String>,
}

/// One approver's signed decision, as received over a channel adapter.
pub struct ResponseInput {
    pub approver_subject: String,
    pub approver_name: String,
    pub approver_public_key: Vec<u8>,
    pub decision: Decision,
    pub reason: Option<String>,
    pub question: Option<String>,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature_bytes: Vec<u8>,
    pub channel: String,
    pub channel_metadata: serde_json::Value,
}

pub struct RequestManager<C, S, R>
where
    C: ConsensusClock + 'static,
    S: CheckpointStore,
    R: IdentityRegistry,
{
    store: Arc<S>,
    timer: Arc<TimerWheel<C>>,
    delivery: Arc<DeliveryLog>,
    audit: Arc<AuditChainer>,
    verifier: Arc<SignatureVerifier<R>>,
    token_issuer: Arc<OverrideTokenIssuer>,
    watch_hub: Arc<WatchHub>,
    settings: OversightSettings,
}

impl<C, S, R> RequestManager<C, S, R>
where
    C: ConsensusClock + 'static,
    S: CheckpointStore,
    R: IdentityRegistry,
{
    pub fn new(
        store: Arc<S>,
        timer: Arc<TimerWheel<C>>,
        delivery: Arc<DeliveryLog>,
        audit: Arc<AuditChainer>,
        verifier: Arc<SignatureVerifier<R>>,
        token_issuer: Arc<OverrideTokenIssuer>,
        watch_hub: Arc<WatchHub>,
        settings: OversightSettings,
    ) -> Self {
        Self {
            store,
            timer,
            delivery,
            audit,
            verifier,
            token_issuer,
            watch_hub,
            settings,
        }
    }

    /// Absolute fire time for `tier_index`, derived from `created_at` plus
    /// the sum of every tier's timeout up to and including this one, so a
    /// process restart recomputes the same deadline instead of resetting
    /// the clock to the tier's full duration.
    fn tier_fire_at(request: &Request, tier_index: usize) -> DateTime<Utc> {
        request.created_at + ChronoDuration::seconds(request.elapsed_before_tier(tier_index + 1))
    }

    /// A tier's effective quorum (its own override, or the request's
    /// default) must be well-formed against its own approver set: a
    /// non-empty set, and a THRESHOLD requirement between 1 and the set's
    /// size inclusive.
    fn validate_tier_quorum(tier: &EscalationTier, default_quorum: &ApprovalQuorum) -> OversightResult<()> {
        if tier.eligible_approvers.is_empty() {
            return Err(OversightError::InvalidQuorumConfig(format!(
                "tier {} has no eligible approvers",
                tier.index
            )));
        }

        let quorum = tier.quorum_override.as_ref().unwrap_or(default_quorum);
        if let ApprovalQuorum::Threshold { required } = quorum {
            let tier_size = tier.eligible_approvers.len();
            if *required == 0 || *required > tier_size {
                return Err(OversightError::InvalidQuorumConfig(format!(
                    "tier {} threshold {required} must be between 1 and {tier_size}",
                    tier.index
                )));
            }
        }

        Ok(())
    }

    pub fn watch_hub(&self) -> &Arc<WatchHub> {
        &self.watch_hub
    }

    /// Save with a version guard, recording the Checkpoint Store's save
    /// latency regardless of outcome.
    fn save_checkpoint(&self, next: &Request, expected_version: u64) -> OversightResult<()> {
        let start = std::time::Instant::now();
        let result = self.store.save_if_version(next, expected_version);
        metrics::histogram!("oversight_checkpoint_save_seconds").record(start.elapsed().as_secs_f64());
        result
    }

    /// Spawn the background task that drains the Timer Wheel's fired-event
    /// channel into `handle_tier_timeout`. Callers own the `TimerWheel`'s
    /// receiver half (returned by `TimerWheel::new`) and hand it here once,
    /// after constructing the manager with the wheel's sender half.
    pub fn spawn_timer_driver(
        self: &Arc<Self>,
        mut timeouts: tokio::sync::mpsc::UnboundedReceiver<crate::timer::TierTimeout>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(fired) = timeouts.recv().await {
                if let Err(err) = manager.handle_tier_timeout(fired.request_id, fired.tier_index, Utc::now()) {
                    warn!(request_id = %fired.request_id, tier = fired.tier_index, error = %err, "tier timeout handling failed");
                }
            }
        })
    }

    /// Open a new approval request, arm its first tier's timer, and
    /// dispatch its first-tier notifications.
    #[tracing::instrument(skip(self, input), fields(agent_id = %input.agent_id, tiers = input.escalation_chain.len()))]
    pub fn create_request(&self, input: NewRequestInput, now: DateTime<Utc>) -> OversightResult<Request> {
        if input.escalation_chain.is_empty() {
            return Err(OversightError::EscalationChainEmpty);
        }
        if input.escalation_chain.len() > MAX_ESCALATION_TIERS {
            return Err(OversightError::EscalationChainTooLong {
                tier_count: input.escalation_chain.len(),
                max_tiers: MAX_ESCALATION_TIERS,
            });
        }
        for tier in &input.escalation_chain {
            if tier.timeout_secs < self.settings.tier_timeout_min_secs
                || tier.timeout_secs > self.settings.tier_timeout_max_secs
            {
                return Err(OversightError::TimeoutOutOfBounds {
                    given_secs: tier.timeout_secs,
                    min_secs: self.settings.tier_timeout_min_secs,
                    max_secs: self.settings.tier_timeout_max_secs,
                });
            }
            Self::validate_tier_quorum(tier, &input.default_quorum)?;
        }

        for subject in &input.delegation_chain {
            self.verifier
                .lookup_identity(subject, now)
                .map_err(OversightError::from)?;
        }

        if self.settings.consensus_clock_required {
            self.timer.check_source()?;
        }

        let request_id = Uuid::new_v4();

        if let Some(key) = &input.idempotency_key {
            let reserved = self.store.reserve_idempotency_key(key, request_id)?;
            if reserved != request_id {
                let existing = self
                    .store
                    .load(reserved)?
                    .ok_or_else(|| OversightError::RequestNotFound(reserved.to_string()))?;

                let same_payload = existing.action == input.action
                    && existing.resource == input.resource
                    && existing.policy_reference == input.policy_reference
                    && existing.action_summary == input.action_summary;

                if crate::store::requires_idempotency_conflict(existing.state, same_payload) {
                    return Err(OversightError::IdempotencyConflict { key: key.clone() });
                }

                // Same key, same payload: hand back the existing request
                // rather than creating a duplicate.
                return Ok(existing);
            }
        }

        let request = Request {
            id: request_id,
            agent_id: input.agent_id,
            delegation_chain: input.delegation_chain,
            action: input.action,
            resource: input.resource,
            policy_reference: input.policy_reference,
            action_summary: input.action_summary,
            reasoning: input.reasoning,
            risk_factors: input.risk_factors,
            escalation_chain: input.escalation_chain,
            default_quorum: input.default_quorum,
            state: RequestState::Pending,
            current_tier: 0,
            responses: vec![],
            delivery_log: vec![],
            override_token: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            version: 0,
            idempotency_key: input.idempotency_key,
        };

        self.store.save(&request)?;

        if let Err(err) = self.audit.append(
            request.id,
            AuditEventType::RequestCreated,
            &serde_json::to_vec(&request.action_summary).unwrap_or_default(),
            now,
        ) {
            warn!(request_id = %request.id, error = %err, "audit append failed");
        }

        self.timer.arm_absolute(request.id, 0, Self::tier_fire_at(&request, 0));
        self.watch_hub.publish(&request);
        self.dispatch_tier_notifications(&request, 0);

        metrics::counter!("oversight_requests_created_total").increment(1);

        Ok(request)
    }

    /// Verify and record one approver's response, advancing the state
    /// machine and, on quorum, issuing an override token.
    #[tracing::instrument(skip(self, input), fields(request_id = %request_id, subject = %input.approver_subject))]
    pub fn submit_response(
        &self,
        request_id: Uuid,
        input: ResponseInput,
        now: DateTime<Utc>,
    ) -> OversightResult<Request> {
        let mut current = self
            .store
            .load(request_id)?
            .ok_or_else(|| OversightError::RequestNotFound(request_id.to_string()))?;

        let message = canonical_approval_message(&request_id.to_string(), input.decision, now.timestamp());

        let verification = self.verifier.verify(
            &input.approver_subject,
            input.signature_algorithm,
            &input.approver_public_key,
            &message,
            &input.signature_bytes,
            now,
        );

        let verified = match verification {
            Ok(v) => v,
            Err(err) => {
                let _ = self.audit.append(
                    request_id,
                    AuditEventType::SignatureVerificationFailed,
                    input.approver_subject.as_bytes(),
                    now,
                );
                return Err(OversightError::from(err));
            }
        };

        let response = Response {
            approver_subject: input.approver_subject,
            approver_name: input.approver_name,
            approver_public_key: input.approver_public_key,
            decision: input.decision,
            reason: input.reason,
            question: input.question,
            signature_algorithm: verified.algorithm,
            signature_bytes: verified.signature_bytes.clone(),
            channel: input.channel,
            channel_metadata: input.channel_metadata,
            responded_at: now,
            tier_index: current.current_tier,
        };

        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let event = StateEvent::ResponseReceived(response.clone());
            let applied = state_machine::apply(&current, event, now, self.settings.final_action);

            let (mut next, effects) = match applied {
                Ok(pair) => pair,
                Err(OversightError::DuplicateResponse { .. }) => return Ok(current),
                Err(err) => return Err(err),
            };

            if let Some(issued_by) = effects.issue_token.clone() {
                let evidence = serde_json::to_vec(&response).unwrap_or_default();
                let token = self.token_issuer.issue(&request_id.to_string(), &evidence, issued_by, now);
                next.override_token = Some(Self::to_record(&token));
            }

            match self.save_checkpoint(&next, current.version) {
                Ok(_) => {
                    self.apply_effects(&next, &effects, now);
                    self.watch_hub.publish(&next);
                    return Ok(next);
                }
                Err(OversightError::ConcurrentModification { .. }) if attempt + 1 < MAX_COMMIT_ATTEMPTS => {
                    current = self
                        .store
                        .load(request_id)?
                        .ok_or_else(|| OversightError::RequestNotFound(request_id.to_string()))?;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(OversightError::ConcurrentModification {
            expected: current.version,
            found: current.version,
        })
    }

    /// Apply a fired tier-timeout event. Called from the background task
    /// draining the Timer Wheel's event channel.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, tier = tier_index))]
    pub fn handle_tier_timeout(&self, request_id: Uuid, tier_index: usize, now: DateTime<Utc>) -> OversightResult<Request> {
        let mut current = self
            .store
            .load(request_id)?
            .ok_or_else(|| OversightError::RequestNotFound(request_id.to_string()))?;

        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let event = StateEvent::TierTimeout { tier_index };
            let (mut next, effects) = state_machine::apply(&current, event, now, self.settings.final_action)?;

            if let Some(issued_by) = effects.issue_token.clone() {
                let evidence = serde_json::to_vec(&(request_id, tier_index)).unwrap_or_default();
                let token = self.token_issuer.issue(&request_id.to_string(), &evidence, issued_by, now);
                next.override_token = Some(Self::to_record(&token));
            }

            match self.save_checkpoint(&next, current.version) {
                Ok(_) => {
                    self.apply_effects(&next, &effects, now);
                    self.watch_hub.publish(&next);
                    return Ok(next);
                }
                Err(OversightError::ConcurrentModification { .. }) if attempt + 1 < MAX_COMMIT_ATTEMPTS => {
                    current = self
                        .store
                        .load(request_id)?
                        .ok_or_else(|| OversightError::RequestNotFound(request_id.to_string()))?;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(OversightError::ConcurrentModification {
            expected: current.version,
            found: current.version,
        })
    }

    #[tracing::instrument(skip(self, reason), fields(request_id = %request_id, caller = %caller))]
    pub fn cancel_request(
        &self,
        request_id: Uuid,
        caller: &str,
        reason: String,
        now: DateTime<Utc>,
    ) -> OversightResult<Request> {
        let mut current = self
            .store
            .load(request_id)?
            .ok_or_else(|| OversightError::RequestNotFound(request_id.to_string()))?;

        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let event = StateEvent::CancelRequested {
                caller: caller.to_string(),
                reason: reason.clone(),
            };
            let (next, effects) = state_machine::apply(&current, event, now, self.settings.final_action)?;

            match self.save_checkpoint(&next, current.version) {
                Ok(_) => {
                    self.apply_effects(&next, &effects, now);
                    self.watch_hub.publish(&next);
                    return Ok(next);
                }
                Err(OversightError::ConcurrentModification { .. }) if attempt + 1 < MAX_COMMIT_ATTEMPTS => {
                    current = self
                        .store
                        .load(request_id)?
                        .ok_or_else(|| OversightError::RequestNotFound(request_id.to_string()))?;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(OversightError::ConcurrentModification {
            expected: current.version,
            found: current.version,
        })
    }

    /// Validate and consume a token capability as presented by an external
    /// authorizer: only the nonce and the issuer's signature over it, never
    /// the full internal `OverrideToken`.
    #[tracing::instrument(skip(self, presented_signature))]
    pub fn consume_override_token(
        &self,
        token_nonce: [u8; 32],
        presented_signature: &[u8],
        now: DateTime<Utc>,
    ) -> OversightResult<()> {
        let result = self
            .token_issuer
            .consume(token_nonce, presented_signature, now)
            .map_err(OversightError::from);

        let outcome = match &result {
            Ok(_) => "ok",
            Err(OversightError::TokenExpired) => "expired",
            Err(OversightError::TokenAlreadyUsed) => "already_used",
            Err(OversightError::InvalidSignature) => "invalid_signature",
            Err(_) => "error",
        };
        metrics::counter!("oversight_token_consume_total", "outcome" => outcome).increment(1);

        result
    }

    /// Startup recovery: re-arm every non-terminal request's current-tier
    /// timer from its recomputed absolute fire time, rather than resetting
    /// it to the tier's full duration.
    #[tracing::instrument(skip(self))]
    pub fn recover(&self) -> OversightResult<usize> {
        let pending = self.store.scan_non_terminal()?;
        let count = pending.len();
        metrics::gauge!("oversight_recovered_requests").set(count as f64);

        for page in pending.chunks(self.settings.recovery_batch_size.max(1)) {
            for request in page {
                let fire_at = Self::tier_fire_at(request, request.current_tier);
                self.timer.arm_absolute(request.id, request.current_tier, fire_at);
                self.dispatch_tier_notifications(request, request.current_tier);
                info!(request_id = %request.id, tier = request.current_tier, "recovered request, timer re-armed");
            }
            info!(page_size = page.len(), "recovered one startup batch");
        }

        Ok(count)
    }

    fn apply_effects(&self, next: &Request, effects: &state_machine::TransitionEffects, now: DateTime<Utc>) {
        if let Some(audit_effect) = effects.audit {
            let event_type = match audit_effect {
                AuditEffect::ResponseReceived => AuditEventType::ResponseReceived,
                AuditEffect::Approved | AuditEffect::Denied => AuditEventType::StateTransition,
                AuditEffect::Escalated { .. } => AuditEventType::TierEscalation,
                AuditEffect::TimedOut => AuditEventType::FinalTimeout,
                AuditEffect::Cancelled => AuditEventType::RequestCancelled,
            };
            let transition_kind = match audit_effect {
                AuditEffect::ResponseReceived => "response_received",
                AuditEffect::Approved => "approved",
                AuditEffect::Denied => "denied",
                AuditEffect::Escalated { .. } => "escalated",
                AuditEffect::TimedOut => "timed_out",
                AuditEffect::Cancelled => "cancelled",
            };
            metrics::counter!("oversight_transitions_total", "kind" => transition_kind).increment(1);

            // Embed the override token's provenance (human approver vs.
            // system auto-approve) directly in the hashed payload so the
            // audit trail distinguishes it even though `AuditRecord` keeps
            // no dedicated field for it.
            let payload = serde_json::json!({
                "state": next.state,
                "issued_by": next.override_token.as_ref().map(|t| &t.issued_by),
            });
            let payload = serde_json::to_vec(&payload).unwrap_or_default();
            if let Err(err) = self.audit.append(next.id, event_type, &payload, now) {
                warn!(request_id = %next.id, error = %err, "audit append failed");
            }
        }

        if effects.cancel_timer {
            self.timer.cancel(next.id);
        }

        if let Some((tier_index, timeout_secs)) = effects.arm_tier {
            let _ = timeout_secs;
            self.timer.arm_absolute(next.id, tier_index, Self::tier_fire_at(next, tier_index));
        }

        if let Some(tier_index) = effects.notify_tier {
            self.dispatch_tier_notifications(next, tier_index);
        }

        if next.state.is_terminal() {
            self.watch_hub.forget(next.id);
        }
    }

    fn dispatch_tier_notifications(&self, request: &Request, tier_index: usize) {
        let tier = &request.escalation_chain[tier_index];
        let delivery = Arc::clone(&self.delivery);
        let audit = Arc::clone(&self.audit);
        let request_id = request.id;
        let recipients = tier.eligible_approvers.clone();
        let preferred_channels = tier.preferred_channels.clone();
        let summary = request.action_summary.clone();

        tokio::spawn(async move {
            for recipient in recipients {
                let attempts = delivery
                    .notify(request_id, tier_index, &recipient, &preferred_channels, &summary)
                    .await;
                let delivered = attempts.last().map(|a| a.status) == Some(crate::types::DeliveryStatus::Delivered);
                metrics::counter!("oversight_notifications_total", "outcome" => if delivered { "delivered" } else { "exhausted" }).increment(1);
                if !delivered {
                    error!(request_id = %request_id, recipient, "notification delivery exhausted all channels");
                }

                let payload = serde_json::to_vec(&attempts).unwrap_or_default();
                if let Err(err) = audit.append(request_id, AuditEventType::NotificationSent, &payload, Utc::now()) {
                    warn!(request_id = %request_id, error = %err, "audit append for notification failed");
                }
            }
        });
    }

    fn to_record(token: &OverrideToken) -> OverrideTokenRecord {
        OverrideTokenRecord {
            nonce_hex: token.nonce_hex(),
            issuer_signature_hex: token.issuer_signature_hex(),
            issued_by: token.issued_by.clone(),
            issued_at: token.issued_at,
            expires_at: token.expires_at,
        }
    }
}
