//! Oversight core: the Human-in-the-Loop approval orchestrator.
//!
//! Ties together the Clock & Timer Wheel, Signature Verifier, Audit
//! Chainer, Checkpoint Store, Delivery Log, Quorum Evaluator, State
//! Machine, Request Manager, Override Token Issuer, and Await/Watch
//! Facility behind the [`manager::RequestManager`] entry point.

pub mod delivery;
pub mod error;
pub mod manager;
pub mod quorum;
pub mod state_machine;
pub mod store;
pub mod timer;
pub mod types;
pub mod watch;

pub use error::{OversightError, OversightResult};
pub use manager::{NewRequestInput, RequestManager, ResponseInput};
pub use quorum::{evaluate, evaluate_request, QuorumOutcome};
pub use state_machine::{apply, AuditEffect, StateEvent, TransitionEffects};
pub use store::{CheckpointStore, InMemoryCheckpointStore, SledCheckpointStore};
pub use timer::{ConsensusClock, LocalClock, TierTimeout, TimerWheel};
pub use types::{
    ApprovalQuorum, DeliveryAttempt, DeliveryStatus, EscalationTier, OverrideTokenRecord, Request,
    RequestState, Response,
};
pub use watch::WatchHub;
