//! Agent-coordination substrate.
//!
//! This crate is the message-and-machinery layer under the concrete agent
//! roles: typed envelopes and payloads, the in-process dispatcher, blocking
//! effects, the generic FSM driver, crash-safe state snapshots, the
//! container runtime (registry, pinned images, atomic promotion), git
//! mirrors and per-story workspaces, and the demo subsystem.
//!
//! Errors across the crate carry a `kind()` string from a closed taxonomy
//! (`validation`, `transient_io`, `effect_timeout`,
//! `effect_payload_mismatch`, `budget_exceeded`, `health_check_failed`,
//! `pin_write_failed`, `merge_conflict`, `merge_failed`, `shutdown`) used in
//! logs and ERROR envelopes.

pub mod config;
pub mod container;
pub mod demo;
pub mod dispatch;
pub mod driver;
pub mod effects;
pub mod exec;
pub mod git;
pub mod messages;
pub mod runtime;
pub mod state;

pub use config::{DemoSettings, ProjectConfig};
pub use dispatch::{AgentChannels, DispatchError, Dispatcher};
pub use driver::{AgentDriver, BudgetConfig, DriverConfig, FsmState, Role, RoleError, RunOutcome, Step};
pub use effects::{
    ApprovalEffect, BudgetReviewEffect, CompletionEffect, Effect, EffectError, EffectKind,
    EffectOutcome, MergeEffect, MergeRoutes, QuestionEffect, Runtime, StatusRoutes,
};
pub use messages::{Envelope, EnvelopeError, MsgType, Payload};
pub use state::{AgentSnapshot, FileStateStore, InMemoryStateStore, StateData, StateStore};
