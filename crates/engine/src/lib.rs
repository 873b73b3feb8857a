//! The squidbot orchestration plane.
//!
//! Composes the per-session actor system, the tool-augmented turn loop,
//! the token-budget guard, the subagent pool, and the federation
//! client/server pair behind the [`Engine`] facade.

pub mod actor;
pub mod budget;
pub mod cancel;
pub mod engine;
pub mod federation;
pub mod handler;
pub mod ids;
pub mod metrics;
pub mod outbound;
pub mod state;
pub mod subagents;
pub mod telemetry;
pub mod tools_builtin;

pub use actor::{ActorHandler, ActorPayload, ActorSystem};
pub use budget::{BudgetGuard, BudgetReservation, CommitOutcome, SoftWarning};
pub use engine::{Engine, EngineBuilder};
pub use federation::{
    DelegationRequest, FederationClient, SpawnOptions, HEADER_IDEMPOTENCY_KEY, HEADER_NODE_ID,
};
pub use metrics::CountersSnapshot;
pub use state::{Shared, SystemPromptFn, ToolFactory};
pub use subagents::{SubagentPool, SubagentRequest};
