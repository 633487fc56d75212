//! Data model: Request, EscalationTier, ApprovalQuorum, Response,
//! DeliveryAttempt, and the lifecycle state they carry.

use chrono::{DateTime, Utc};
use oversight_kms::{Decision, IssuedBy, SignatureAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use oversight_config::QuorumPolicy;
pub use oversight_config::QuorumPolicy as ApprovalQuorum;

/// One tier of an escalation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTier {
    pub index: usize,
    pub eligible_approvers: Vec<String>,
    pub timeout_secs: i64,
    pub preferred_channels: Vec<String>,
    pub quorum_override: Option<ApprovalQuorum>,
}

/// One recorded decision from one approver on one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
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
    pub responded_at: DateTime<Utc>,
    pub tier_index: usize,
}

/// Status of one notification dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub tier_index: usize,
    pub channel: String,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub retry_count: u32,
    pub attempted_at: DateTime<Utc>,
}

/// Lifecycle state of a Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Approved,
    Denied,
    Escalated,
    TimedOut,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Approved
                | RequestState::Denied
                | RequestState::TimedOut
                | RequestState::Cancelled
        )
    }
}

/// The override token record embedded in a resolved Request, mirroring
/// `oversight_kms::OverrideToken` but kept independent of the KMS crate's
/// internal representation so the durable record is stable across KMS
/// refactors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideTokenRecord {
    pub nonce_hex: String,
    pub issuer_signature_hex: String,
    pub issued_by: IssuedBy,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A pending or resolved approval lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
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
    pub state: RequestState,
    pub current_tier: usize,
    pub responses: Vec<Response>,
    pub delivery_log: Vec<DeliveryAttempt>,
    pub override_token: Option<OverrideTokenRecord>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub idempotency_key: Option<String>,
}

impl Request {
    /// Sum of tier timeouts strictly before `tier_index`, used by the timer
    /// wheel to recompute an absolute fire time on restart.
    pub fn elapsed_before_tier(&self, tier_index: usize) -> i64 {
        self.escalation_chain[..tier_index]
            .iter()
            .map(|t| t.timeout_secs)
            .sum()
    }

    pub fn current_tier(&self) -> &EscalationTier {
        &self.escalation_chain[self.current_tier]
    }

    /// Responses recorded at the current tier, excluding
    /// `RequestMoreInfo` (which never counts toward quorum).
    pub fn decisive_responses_at_current_tier(&self) -> Vec<&Response> {
        self.responses
            .iter()
            .filter(|r| {
                r.tier_index == self.current_tier
                    && !matches!(r.decision, Decision::RequestMoreInfo)
            })
            .collect()
    }

    pub fn responded_subjects_at_current_tier(&self) -> BTreeMap<&str, &Response> {
        self.responses
            .iter()
            .filter(|r| r.tier_index == self.current_tier)
            .map(|r| (r.approver_subject.as_str(), r))
            .collect()
    }

    pub fn effective_quorum(&self) -> &ApprovalQuorum {
        self.current_tier()
            .quorum_override
            .as_ref()
            .unwrap_or(&self.default_quorum)
    }

    /// True if `caller` is either the request's owner (a link in its
    /// delegation chain, root human principal included) or an
    /// administrator (anyone eligible to approve it at any tier of its
    /// escalation chain).
    pub fn is_authorized_to_cancel(&self, caller: &str) -> bool {
        self.delegation_chain.iter().any(|subject| subject == caller)
            || self
                .escalation_chain
                .iter()
                .any(|tier| tier.eligible_approvers.iter().any(|subject| subject == caller))
    }
}
