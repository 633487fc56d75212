//! Await/Watch Facility: lets a caller block on a request's resolution
//! without polling the Checkpoint Store, and lets a second caller stream
//! every state change as it happens. Waiter registration happens before
//! the initial state read so a resolution racing the registration is
//! never missed.

use crate::error::{OversightError, OversightResult};
use crate::types::{Request, RequestState};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch as tokio_watch};
use uuid::Uuid;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Per-request broadcast channel plus the last known state, so a `watch`
/// call that arrives after resolution still gets one update immediately
/// instead of waiting forever on an already-closed story.
struct RequestChannel {
    sender: broadcast::Sender<Request>,
    latest: tokio_watch::Sender<Option<Request>>,
}

/// Fans out request updates to any number of waiters/watchers. The
/// Request Manager calls `publish` after every successful commit; this
/// facility never touches the Checkpoint Store itself.
pub struct WatchHub {
    channels: DashMap<Uuid, Arc<RequestChannel>>,
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn channel_for(&self, request_id: Uuid) -> Arc<RequestChannel> {
        self.channels
            .entry(request_id)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
                let (latest, _) = tokio_watch::channel(None);
                Arc::new(RequestChannel { sender, latest })
            })
            .clone()
    }

    /// Called by the Request Manager after every successful state commit.
    pub fn publish(&self, request: &Request) {
        let channel = self.channel_for(request.id);
        let _ = channel.sender.send(request.clone());
        let _ = channel.latest.send(Some(request.clone()));
    }

    /// Drop bookkeeping for a request once it is terminal and has no more
    /// active watchers, to avoid growing the channel map without bound.
    pub fn forget(&self, request_id: Uuid) {
        self.channels.remove(&request_id);
    }

    /// Wait until `request_id` resolves to a terminal state or `timeout`
    /// elapses. `current` must be the state read immediately before this
    /// call so a resolution between that read and registration here is
    /// still observed through the watch channel's buffered history.
    pub async fn await_resolution(
        &self,
        request_id: Uuid,
        current: Option<Request>,
        timeout: std::time::Duration,
    ) -> OversightResult<Request> {
        if let Some(request) = &current {
            if request.state.is_terminal() {
                return Ok(request.clone());
            }
        }

        let channel = self.channel_for(request_id);
        let mut receiver = channel.sender.subscribe();

        // A publish may have landed between the caller's read of `current`
        // and this subscribe; the watch channel always holds the latest
        // value, so check it before waiting on new broadcasts.
        let latest = channel.latest.borrow().clone();
        if let Some(request) = latest {
            if request.state.is_terminal() {
                return Ok(request);
            }
        }

        let wait = async {
            loop {
                match receiver.recv().await {
                    Ok(request) if request.state.is_terminal() => return Ok(request),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(OversightError::RequestNotFound(request_id.to_string()))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(OversightError::TimerSourceUnavailable),
        }
    }

    /// Subscribe to every update for `request_id`, terminal or not, as a
    /// stream. Replays the current state first if one is supplied.
    pub fn watch(&self, request_id: Uuid) -> broadcast::Receiver<Request> {
        self.channel_for(request_id).sender.subscribe()
    }

    pub fn latest(&self, request_id: Uuid) -> Option<Request> {
        self.channels
            .get(&request_id)
            .and_then(|c| c.latest.borrow().clone())
    }
}

#[allow(dead_code)]
fn terminal_state_reached(state: RequestState) -> bool {
    state.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalQuorum, EscalationTier};
    use chrono::Utc;

    fn sample_request(state: RequestState) -> Request {
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
            escalation_chain: vec![EscalationTier {
                index: 0,
                eligible_approvers: vec!["alice".into()],
                timeout_secs: 3600,
                preferred_channels: vec!["slack".into()],
                quorum_override: None,
            }],
            default_quorum: ApprovalQuorum::Any,
            state,
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

    #[tokio::test]
    async fn await_resolution_returns_immediately_for_terminal_current_state() {
        let hub = WatchHub::new();
        let request = sample_request(RequestState::Approved);

        let result = hub
            .await_resolution(request.id, Some(request.clone()), std::time::Duration::from_secs(1))
            .await
            .expect("resolved");

        assert_eq!(result.state, RequestState::Approved);
    }

    #[tokio::test]
    async fn await_resolution_wakes_on_publish() {
        let hub = Arc::new(WatchHub::new());
        let pending = sample_request(RequestState::Pending);
        let request_id = pending.id;

        let waiter = {
            let hub = Arc::clone(&hub);
            let pending = pending.clone();
            tokio::spawn(async move {
                hub.await_resolution(request_id, Some(pending), std::time::Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let mut approved = pending.clone();
        approved.state = RequestState::Approved;
        hub.publish(&approved);

        let result = waiter.await.expect("join").expect("resolved");
        assert_eq!(result.state, RequestState::Approved);
    }

    #[tokio::test]
    async fn await_resolution_times_out_while_still_pending() {
        let hub = WatchHub::new();
        let pending = sample_request(RequestState::Pending);

        let result = hub
            .await_resolution(pending.id, Some(pending), std::time::Duration::from_millis(30))
            .await;

        assert!(matches!(result, Err(OversightError::TimerSourceUnavailable)));
    }

    #[tokio::test]
    async fn watch_stream_replays_every_published_update() {
        let hub = WatchHub::new();
        let pending = sample_request(RequestState::Pending);
        let mut stream = hub.watch(pending.id);

        hub.publish(&pending);
        let mut escalated = pending.clone();
        escalated.state = RequestState::Pending;
        escalated.current_tier = 1;
        hub.publish(&escalated);

        let first = stream.recv().await.expect("first update");
        let second = stream.recv().await.expect("second update");
        assert_eq!(first.current_tier, 0);
        assert_eq!(second.current_tier, 1);
    }
}
