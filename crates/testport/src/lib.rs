//! Test-side half of the harness: launches a plugin server from a runtime
//! manifest and drives it through the in-process agent.

pub mod client;
pub mod framework;
pub mod handles;
pub mod process;
pub mod registry;
pub mod wait;

pub use client::{AgentClient, ClientError, MenuSnapshot, TickSpan};
pub use framework::{
    CommandSource, Framework, FrameworkError, FrameworkOptions, MethodScope, WorldSpec,
};
pub use handles::{MenuHandle, PlayerBuilder, PlayerHandle, WorldBuilder, WorldHandle};
pub use process::{LaunchSpec, ProcessError, ProcessState, ServerProcess, StopOutcome};
pub use registry::{CleanupReport, ResourceScope, ScopeRegistry};
pub use testport_core::{BlockPos, RuntimeManifest, WorldEnvironment, WorldType};
pub use wait::{wait_until, WaitError};
