//! Harness entry point: boots the server from a manifest, talks to its agent
//! and tears everything down again.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use testport_core::{BlockPos, ManifestError, RuntimeManifest, WorldEnvironment, WorldType};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{
    AgentClient, ClientError, CreatePlayerRequest, MenuSnapshot, DEFAULT_IO_TIMEOUT,
};
use crate::handles::{PlayerBuilder, PlayerHandle, WorldBuilder, WorldHandle};
use crate::process::{LaunchSpec, ProcessError, ProcessState, ServerProcess};
use crate::registry::{CleanupReport, ResourceScope, ScopeRegistry};
use crate::wait::{self, WaitError};

pub const MAX_PLAYER_NAME_LEN: usize = 16;
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Console,
    Player,
}

impl CommandSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Console => "CONSOLE",
            Self::Player => "PLAYER",
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkOptions {
    pub java: PathBuf,
    pub startup_timeout: Duration,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub client_io_timeout: Duration,
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for FrameworkOptions {
    fn default() -> Self {
        Self {
            java: default_java(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            client_io_timeout: DEFAULT_IO_TIMEOUT,
            diagnostics_dir: None,
        }
    }
}

/// `$JAVA_HOME/bin/java` when set, otherwise `java` from `PATH`.
pub fn default_java() -> PathBuf {
    match std::env::var_os("JAVA_HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join("bin").join("java"),
        _ => PathBuf::from("java"),
    }
}

#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("failed to configure agent connection: {0}")]
    ConfigureClient(#[source] io::Error),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("command source {command_source} is not supported; only CONSOLE commands can be executed")]
    UnsupportedSource { command_source: CommandSource },
    #[error("menu title mismatch: expected {expected:?}, found {actual:?}")]
    MenuTitleMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("framework is closed")]
    Closed,
}

/// A running server plus its agent connection.
pub struct Framework {
    manifest: RuntimeManifest,
    server_version: String,
    process: Mutex<ServerProcess>,
    client: AgentClient,
    registry: ScopeRegistry,
    shutdown_timeout: Duration,
    closed: AtomicBool,
}

impl Framework {
    pub fn start(manifest_path: &Path) -> Result<Self, FrameworkError> {
        Self::start_with(manifest_path, FrameworkOptions::default())
    }

    /// Anything acquired before a failing step is released again.
    pub fn start_with(manifest_path: &Path, options: FrameworkOptions) -> Result<Self, FrameworkError> {
        let manifest = RuntimeManifest::read(manifest_path)?;
        manifest.validate()?;
        info!(
            manifest = %manifest_path.display(),
            server_type = %manifest.server_type,
            server_version = %manifest.server_version,
            "framework_starting"
        );

        let mut process = ServerProcess::new(LaunchSpec::from_manifest(&manifest, &options.java));
        if let Some(dir) = &options.diagnostics_dir {
            process = process.with_diagnostics_root(dir.clone());
        }
        process.start(options.startup_timeout)?;

        let (client, server_version) = match connect_agent(&manifest, &options) {
            Ok(connected) => connected,
            Err(error) => {
                process.write_diagnostics("agent-connect-failure");
                if let Err(stop_error) = process.stop(options.shutdown_timeout) {
                    warn!(error = %stop_error, "framework_start_unwind_stop_failed");
                }
                return Err(error);
            }
        };

        let framework = Self {
            server_version,
            process: Mutex::new(process),
            client,
            registry: ScopeRegistry::new(),
            shutdown_timeout: options.shutdown_timeout,
            closed: AtomicBool::new(false),
            manifest,
        };
        if let Err(error) = framework.preload_worlds() {
            framework.close();
            return Err(error);
        }
        info!(server_version = %framework.server_version, "framework_ready");
        Ok(framework)
    }

    fn preload_worlds(&self) -> Result<(), FrameworkError> {
        for world in &self.manifest.preloaded_worlds {
            let created = self.client.new_world(
                &world.name,
                world.world_type,
                world.environment,
                world.seed,
            )?;
            info!(world = %created, "framework_world_preloaded");
        }
        Ok(())
    }

    pub fn manifest(&self) -> &RuntimeManifest {
        &self.manifest
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn process_state(&self) -> ProcessState {
        self.lock_process().state()
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.lock_process().pid()
    }

    pub fn server_output_tail(&self, count: usize) -> Vec<String> {
        self.lock_process().output_tail(count)
    }

    pub fn scope_of(&self, player: Uuid) -> Option<ResourceScope> {
        self.registry.scope_of(player)
    }

    pub fn main_world(&self) -> Result<WorldHandle<'_>, FrameworkError> {
        self.ensure_open()?;
        let name = self.client.main_world()?;
        Ok(WorldHandle::new(self, name))
    }

    pub fn new_world(&self, spec: &WorldSpec) -> Result<WorldHandle<'_>, FrameworkError> {
        self.ensure_open()?;
        require_non_blank("world name", &spec.name)?;
        let name = self
            .client
            .new_world(&spec.name, spec.world_type, spec.environment, spec.seed)?;
        Ok(WorldHandle::new(self, name))
    }

    /// Normal overworld with a generated name.
    pub fn new_world_default(&self) -> Result<WorldHandle<'_>, FrameworkError> {
        let simple = Uuid::new_v4().simple().to_string();
        self.new_world(&WorldSpec::new(format!("testport-{}", &simple[..12])))
    }

    pub fn world_builder(&self, name: impl Into<String>) -> WorldBuilder<'_> {
        WorldBuilder::new(self, name.into())
    }

    pub fn create_player(&self, name: &str, world: &WorldHandle<'_>) -> Result<PlayerHandle<'_>, FrameworkError> {
        self.build_player(name).world(world).build()
    }

    pub fn create_player_with_id(
        &self,
        name: &str,
        id: Uuid,
        world: &WorldHandle<'_>,
    ) -> Result<PlayerHandle<'_>, FrameworkError> {
        self.build_player(name).uuid(id).world(world).build()
    }

    /// Players built here live until the framework closes.
    pub fn build_player(&self, name: impl Into<String>) -> PlayerBuilder<'_> {
        PlayerBuilder::new(self, name.into(), ResourceScope::FrameworkScoped)
    }

    pub(crate) fn spawn_player(
        &self,
        mut request: CreatePlayerRequest,
        scope: ResourceScope,
    ) -> Result<PlayerHandle<'_>, FrameworkError> {
        self.ensure_open()?;
        validate_player_name(&request.name)?;
        if let Some(health) = request.health {
            if health.is_nan() || health <= 0.0 {
                return Err(FrameworkError::InvalidArgument(format!(
                    "health must be greater than 0, got {health}"
                )));
            }
        }
        if request.world.trim().is_empty() {
            request.world = self.client.main_world()?;
        }

        let created = self.client.create_player(&request)?;
        self.registry.register(created.uuid, scope);
        Ok(PlayerHandle::new(self, created.uuid, created.name, request.world))
    }

    pub fn execute_command(&self, source: CommandSource, command: &str) -> Result<bool, FrameworkError> {
        self.ensure_open()?;
        if source != CommandSource::Console {
            return Err(FrameworkError::UnsupportedSource {
                command_source: source,
            });
        }
        require_non_blank("command", command)?;
        Ok(self.client.execute_command(source.as_str(), command)?)
    }

    pub fn block_type(&self, world: &str, pos: BlockPos) -> Result<String, FrameworkError> {
        self.ensure_open()?;
        Ok(self.client.block_type(world, pos)?)
    }

    pub fn set_block(&self, world: &str, pos: BlockPos, material: &str) -> Result<String, FrameworkError> {
        self.ensure_open()?;
        require_non_blank("material", material)?;
        Ok(self.client.set_block(world, pos, material)?)
    }

    pub fn execute_player_command(&self, player: Uuid, command: &str) -> Result<bool, FrameworkError> {
        self.ensure_open()?;
        require_non_blank("command", command)?;
        Ok(self.client.execute_player_command(player, command)?)
    }

    pub fn place_player_block(
        &self,
        player: Uuid,
        material: &str,
        pos: BlockPos,
    ) -> Result<String, FrameworkError> {
        self.ensure_open()?;
        require_non_blank("material", material)?;
        Ok(self.client.place_player_block(player, material, pos)?)
    }

    pub fn menu_snapshot(&self, player: Uuid) -> Result<MenuSnapshot, FrameworkError> {
        self.ensure_open()?;
        Ok(self.client.open_menu(player)?)
    }

    pub fn click_menu_slot(&self, player: Uuid, slot: i64) -> Result<(), FrameworkError> {
        self.ensure_open()?;
        let slot = validate_slot(slot)?;
        Ok(self.client.click_menu_slot(player, slot)?)
    }

    pub fn drag_menu_slots(&self, player: Uuid, material: &str, slots: &[i64]) -> Result<(), FrameworkError> {
        self.ensure_open()?;
        require_non_blank("material", material)?;
        if slots.is_empty() {
            return Err(FrameworkError::InvalidArgument(
                "drag requires at least one slot".to_string(),
            ));
        }
        let slots = slots
            .iter()
            .map(|slot| validate_slot(*slot))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.client.drag_menu_slots(player, material, &slots)?)
    }

    /// Messages received since the previous call.
    pub fn player_messages(&self, player: Uuid) -> Result<Vec<String>, FrameworkError> {
        self.ensure_open()?;
        Ok(self.client.player_messages(player)?)
    }

    /// A player the agent failed to remove stays registered for `close`.
    pub fn remove_player(&self, player: Uuid) -> Result<(), FrameworkError> {
        self.ensure_open()?;
        self.client.remove_player(player)?;
        self.registry.unregister(player);
        Ok(())
    }

    /// Blocks until the server has advanced `ticks` ticks. Zero returns immediately.
    pub fn wait_ticks(&self, ticks: i64) -> Result<(), FrameworkError> {
        self.ensure_open()?;
        if ticks < 0 {
            return Err(FrameworkError::InvalidArgument(format!(
                "ticks must be >= 0, got {ticks}"
            )));
        }
        if ticks == 0 {
            return Ok(());
        }
        self.client.wait_ticks(ticks.unsigned_abs())?;
        Ok(())
    }

    pub fn server_tick(&self) -> Result<u64, FrameworkError> {
        self.ensure_open()?;
        Ok(self.client.server_tick()?)
    }

    pub fn wait_until<F>(&self, predicate: F, timeout: Duration) -> Result<(), FrameworkError>
    where
        F: FnMut() -> Result<bool, FrameworkError>,
    {
        Ok(wait::wait_until(predicate, timeout)?)
    }

    /// Players built through the returned guard are removed when it ends.
    pub fn begin_method_scope(&self) -> MethodScope<'_> {
        MethodScope {
            framework: self,
            ended: false,
        }
    }

    /// Removes every method-scoped player.
    pub fn end_method_scope(&self) -> CleanupReport {
        let report = self
            .registry
            .end_method_scope(|id| self.client.remove_player(id));
        if report.attempted() > 0 {
            info!(removed = report.removed, failed = report.failed, "method_scope_cleaned");
        }
        report
    }

    /// Removes remaining players, disconnects and stops the server. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let report = self
            .registry
            .cleanup_all(|id| self.client.remove_player(id));
        self.client.close();
        let outcome = self.lock_process().stop(self.shutdown_timeout);
        match outcome {
            Ok(outcome) => info!(
                ?outcome,
                removed_players = report.removed,
                failed_players = report.failed,
                "framework_closed"
            ),
            Err(error) => warn!(error = %error, "framework_stop_failed"),
        }
    }

    fn ensure_open(&self) -> Result<(), FrameworkError> {
        if self.is_closed() {
            return Err(FrameworkError::Closed);
        }
        Ok(())
    }

    fn lock_process(&self) -> MutexGuard<'_, ServerProcess> {
        match self.process.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_agent(
    manifest: &RuntimeManifest,
    options: &FrameworkOptions,
) -> Result<(AgentClient, String), FrameworkError> {
    let client = AgentClient::connect(&manifest.uds_socket_path, options.connect_timeout)?;
    if let Err(error) = client.set_io_timeout(options.client_io_timeout) {
        client.close();
        return Err(FrameworkError::ConfigureClient(error));
    }
    match client.handshake(
        &manifest.agent_auth_token,
        &manifest.runtime_protocol_version,
        manifest.expected_agent_digest(),
    ) {
        Ok(info) => {
            info!(
                protocol_version = %info.protocol_version,
                server_version = %info.server_version,
                "framework_handshake_complete"
            );
            Ok((client, info.server_version))
        }
        Err(error) => {
            client.close();
            Err(error.into())
        }
    }
}

/// Parameters of a world to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldSpec {
    pub name: String,
    pub world_type: WorldType,
    pub environment: WorldEnvironment,
    pub seed: i64,
}

impl WorldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            world_type: WorldType::Normal,
            environment: WorldEnvironment::Normal,
            seed: 0,
        }
    }
}

/// Method-level cleanup guard. Ends the scope on drop unless [`MethodScope::finish`] ran.
pub struct MethodScope<'a> {
    framework: &'a Framework,
    ended: bool,
}

impl<'a> MethodScope<'a> {
    pub fn build_player(&self, name: impl Into<String>) -> PlayerBuilder<'a> {
        PlayerBuilder::new(self.framework, name.into(), ResourceScope::MethodScoped)
    }

    pub fn create_player(&self, name: &str, world: &WorldHandle<'_>) -> Result<PlayerHandle<'a>, FrameworkError> {
        self.build_player(name).world(world).build()
    }

    pub fn create_player_with_id(
        &self,
        name: &str,
        id: Uuid,
        world: &WorldHandle<'_>,
    ) -> Result<PlayerHandle<'a>, FrameworkError> {
        self.build_player(name).uuid(id).world(world).build()
    }

    pub fn finish(mut self) -> CleanupReport {
        self.ended = true;
        self.framework.end_method_scope()
    }
}

impl Drop for MethodScope<'_> {
    fn drop(&mut self) {
        if !self.ended && !self.framework.is_closed() {
            self.framework.end_method_scope();
        }
    }
}

pub(crate) fn require_non_blank(what: &str, value: &str) -> Result<(), FrameworkError> {
    if value.trim().is_empty() {
        return Err(FrameworkError::InvalidArgument(format!("{what} must not be blank")));
    }
    Ok(())
}

pub fn validate_player_name(name: &str) -> Result<(), FrameworkError> {
    require_non_blank("player name", name)?;
    let length = name.chars().count();
    if length > MAX_PLAYER_NAME_LEN {
        return Err(FrameworkError::InvalidArgument(format!(
            "player name '{name}' is {length} characters; the limit is {MAX_PLAYER_NAME_LEN}"
        )));
    }
    Ok(())
}

fn validate_slot(slot: i64) -> Result<u32, FrameworkError> {
    u32::try_from(slot)
        .map_err(|_| FrameworkError::InvalidArgument(format!("slot must be >= 0, got {slot}")))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use testport_core::{string_map, Action, AgentResponse, ErrorCode};

    use super::*;
    use crate::client::tests::{FakeAgent, Responder};

    fn manifest_in(temp: &TempDir) -> RuntimeManifest {
        RuntimeManifest {
            server_type: "paper".to_string(),
            server_version: "1.21.4".to_string(),
            server_directory: temp.path().join("server"),
            server_jar: temp.path().join("server").join("server.jar"),
            uds_socket_path: temp.path().join("agent.sock"),
            agent_auth_token: "token".to_string(),
            runtime_protocol_version: "v1".to_string(),
            agent_jar: None,
            agent_jar_sha256: None,
            memory_mb: 512,
            preloaded_worlds: Vec::new(),
        }
    }

    /// Framework around a fake agent; the server process is never spawned.
    fn framework_over(agent: &FakeAgent, temp: &TempDir) -> Framework {
        let manifest = manifest_in(temp);
        let launch = LaunchSpec::from_manifest(&manifest, Path::new("java"));
        Framework {
            server_version: "1.21.4-TEST".to_string(),
            process: Mutex::new(ServerProcess::new(launch)),
            client: AgentClient::connect(&agent.socket_path, Duration::from_secs(2))
                .expect("connect fake agent"),
            registry: ScopeRegistry::new(),
            shutdown_timeout: Duration::from_secs(1),
            closed: AtomicBool::new(false),
            manifest,
        }
    }

    #[test]
    fn failed_removal_keeps_player_registered_for_close() {
        let temp = TempDir::new().expect("tempdir");
        let mut removals = 0;
        let responder: Responder = Box::new(move |request| {
            removals += 1;
            Some(if removals == 1 {
                AgentResponse::error(&request.request_id, ErrorCode::RequestFailed, "player is busy")
            } else {
                AgentResponse::ok(&request.request_id, string_map([("removed", "true")]))
            })
        });
        let agent = FakeAgent::start(responder);
        let framework = framework_over(&agent, &temp);
        let player = Uuid::new_v4();
        framework.registry.register(player, ResourceScope::FrameworkScoped);

        let error = framework.remove_player(player).expect_err("agent refused");
        match error {
            FrameworkError::Client(client) => {
                assert_eq!(client.remote_code(), Some(ErrorCode::RequestFailed))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(framework.scope_of(player), Some(ResourceScope::FrameworkScoped));

        framework.close();
        assert_eq!(framework.scope_of(player), None);
        assert_eq!(agent.actions(), vec![Action::RemovePlayer, Action::RemovePlayer]);
        assert_eq!(framework.process_state(), ProcessState::Idle);
        drop(framework);
        agent.join();
    }

    #[test]
    fn successful_removal_unregisters_player() {
        let temp = TempDir::new().expect("tempdir");
        let agent = FakeAgent::start(crate::client::tests::echo_ok(string_map([(
            "removed", "true",
        )])));
        let framework = framework_over(&agent, &temp);
        let player = Uuid::new_v4();
        framework.registry.register(player, ResourceScope::MethodScoped);

        framework.remove_player(player).expect("removed");
        assert_eq!(framework.scope_of(player), None);
        assert_eq!(framework.end_method_scope().attempted(), 0);

        framework.close();
        assert_eq!(agent.actions(), vec![Action::RemovePlayer]);
        drop(framework);
        agent.join();
    }

    #[test]
    fn player_names_are_bounded() {
        validate_player_name("Steve").expect("short name");
        validate_player_name("sixteen_chars_ok").expect("limit");
        assert!(matches!(
            validate_player_name("seventeen_chars_x"),
            Err(FrameworkError::InvalidArgument(_))
        ));
        assert!(validate_player_name("   ").is_err());
    }

    #[test]
    fn slots_must_be_non_negative() {
        assert_eq!(validate_slot(8).expect("slot"), 8);
        assert!(validate_slot(-1).is_err());
    }

    #[test]
    fn default_options_match_documented_timeouts() {
        let options = FrameworkOptions::default();
        assert_eq!(options.startup_timeout, Duration::from_secs(120));
        assert_eq!(options.connect_timeout, Duration::from_secs(45));
        assert_eq!(options.shutdown_timeout, Duration::from_secs(45));
        assert_eq!(options.client_io_timeout, DEFAULT_IO_TIMEOUT);
        assert!(options.java.ends_with("java"));
    }

    #[test]
    fn start_rejects_invalid_manifest_before_spawning() {
        let temp = TempDir::new().expect("tempdir");
        let manifest_path = temp.path().join("manifest.json");
        let manifest = RuntimeManifest {
            server_type: "paper".to_string(),
            server_version: "1.21.4".to_string(),
            server_directory: temp.path().join("missing-server"),
            server_jar: temp.path().join("missing-server").join("server.jar"),
            uds_socket_path: temp.path().join("agent.sock"),
            agent_auth_token: "token".to_string(),
            runtime_protocol_version: "v1".to_string(),
            agent_jar: None,
            agent_jar_sha256: None,
            memory_mb: 512,
            preloaded_worlds: Vec::new(),
        };
        manifest.write(&manifest_path).expect("write manifest");

        let error = Framework::start(&manifest_path).err().expect("invalid manifest");
        assert!(matches!(error, FrameworkError::Manifest(_)));
        assert!(!temp.path().join("testport-diagnostics").exists());
    }

    #[test]
    fn start_reports_missing_manifest() {
        let temp = TempDir::new().expect("tempdir");
        let error = Framework::start(&temp.path().join("nope.json"))
            .err()
            .expect("missing manifest");
        assert!(matches!(error, FrameworkError::Manifest(ManifestError::Read { .. })));
        assert!(fs::read_dir(temp.path()).expect("dir").next().is_none());
    }
}
