//! In-process control endpoint embedded in a game server under test.
//!
//! The hosting server owns an [`Agent`] and calls [`Agent::tick`] once per
//! update; requests arriving on the Unix socket are marshaled onto that call.

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod host;
pub mod launch;
pub mod main_thread;
pub mod sim;
pub mod state;

use thiserror::Error;
use tracing::info;

pub use config::{properties_from_env, AgentConfig, AgentConfigError, Properties};
pub use dispatch::{DispatchError, RequestDispatcher};
pub use endpoint::{AgentEndpoint, EndpointError};
pub use host::{
    resolve_platform_adapter, AdapterStrategy, GameHost, HostError, MenuView, PlatformAdapter,
    SpawnedPlayer, UnsupportedPlatform, WorldCreateRequest,
};
pub use main_thread::{main_thread_channel, MainThreadHandle, MainThreadQueue, MarshalError, TickClock};
pub use state::{AgentState, PlayerSpawn};

#[derive(Debug, Error)]
pub enum AgentStartError {
    #[error(transparent)]
    Config(#[from] AgentConfigError),
    #[error(transparent)]
    UnsupportedPlatform(#[from] UnsupportedPlatform),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

pub struct Agent {
    endpoint: AgentEndpoint,
    queue: MainThreadQueue<AgentState>,
    state: AgentState,
    ticks: TickClock,
}

impl Agent {
    /// Resolves the platform adapter, then binds the control socket.
    pub fn start(
        config: AgentConfig,
        host: Box<dyn GameHost>,
        strategies: &[Box<dyn AdapterStrategy>],
    ) -> Result<Self, AgentStartError> {
        let server_version = host.version();
        let adapter = resolve_platform_adapter(strategies, &server_version)?;
        info!(adapter = adapter.name(), server_version = %server_version, "agent_adapter_resolved");

        let (handle, queue) = main_thread_channel();
        let ticks = TickClock::default();
        let socket_path = config.socket_path.clone();
        let dispatcher = RequestDispatcher::new(config, handle, ticks.clone(), server_version);
        let endpoint = AgentEndpoint::bind(&socket_path, dispatcher)?;

        Ok(Self {
            endpoint,
            queue,
            state: AgentState::new(host, adapter),
            ticks,
        })
    }

    /// Runs queued requests against the game state and advances the tick clock.
    pub fn tick(&mut self) -> u64 {
        self.queue.run_pending(&mut self.state);
        self.ticks.advance()
    }

    pub fn current_tick(&self) -> u64 {
        self.ticks.current()
    }

    pub fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    pub fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    pub fn shutdown(mut self) {
        self.endpoint.shutdown();
        self.queue.run_pending(&mut self.state);
        let removed = self.state.remove_all_players();
        info!(removed_players = removed, "agent_shutdown_complete");
    }
}
