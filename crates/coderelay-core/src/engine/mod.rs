//! The execution engine: process registry, log broadcast hub, execution
//! coordinator, and fallback router.

pub mod command;
pub mod coordinator;
pub mod logs;
pub mod ratelimit;
pub mod registry;
pub mod router;

pub use command::{CommandSpec, extract_cost_microusd};
pub use coordinator::{CoordinatorConfig, ExecutionCoordinator, RunningExecution, StartRequest};
pub use logs::{LogEvent, LogHub, LogSubscription};
pub use ratelimit::{RateLimitMatcher, RateLimitSignal, RegexRateLimitMatcher};
pub use registry::{ProcessHandle, ProcessRegistry};
pub use router::{
    AgentCommandBuilder, CommandBuilder, DispatchSpec, FallbackRouter, RouterConfig, render_prompt,
};
