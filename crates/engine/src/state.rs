//! Shared services passed to every component of the plane.

use std::sync::Arc;

use sb_domain::config::Config;
use sb_domain::message::InboundMessage;
use sb_providers::LlmProvider;
use sb_store::Store;
use sb_tools::{Tool, ToolContext};

use crate::budget::BudgetGuard;
use crate::cancel::CancelMap;
use crate::ids::IdGenerator;
use crate::metrics::Counters;
use crate::outbound::OutboundQueue;

/// Collaborator: composes the system prompt for an inbound message.
/// Workspace file assembly lives outside the plane.
pub type SystemPromptFn = dyn Fn(&InboundMessage) -> String + Send + Sync;

/// Collaborator: contributes the host's file/exec/web tools to a
/// per-request registry.
pub type ToolFactory = dyn Fn(&ToolContext) -> Vec<Arc<dyn Tool>> + Send + Sync;

/// Service bundle composed once by the engine and shared by the handler,
/// the subagent pool, and the federation plane.
///
/// Fields are grouped by concern, mirroring how the engine wires them:
/// configuration and persistence first, then the provider, then the
/// plane-owned singletons (outbound queue, id generator, counters,
/// cancellation table).
pub struct Shared {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub provider: Arc<dyn LlmProvider>,
    pub budget: BudgetGuard,
    pub outbound: OutboundQueue,
    pub ids: IdGenerator,
    pub counters: Arc<Counters>,
    pub system_prompt: Arc<SystemPromptFn>,
    pub tool_factory: Option<Arc<ToolFactory>>,
    pub cancel: CancelMap,
}
