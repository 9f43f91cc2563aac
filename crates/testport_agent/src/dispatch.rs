use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use testport_core::hashing::digests_match;
use testport_core::{
    decode_request, normalize_material_key, string_map, Action, AgentRequest, AgentResponse,
    BlockPos, ErrorCode, Location, ResponseData, WorldEnvironment, WorldType, UNKNOWN_REQUEST_ID,
};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::host::{HostError, WorldCreateRequest};
use crate::main_thread::{MainThreadHandle, MarshalError, TickClock};
use crate::state::{AgentState, PlayerSpawn};

pub const WAIT_TICKS_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_TICKS_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Auth token mismatch.")]
    AuthFailed,
    #[error("Runtime protocol version mismatch: agent speaks {expected}, client sent {actual:?}.")]
    ProtocolMismatch { expected: String, actual: String },
    #[error("Agent SHA-256 mismatch.")]
    AgentShaMismatch,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Only CONSOLE command source is supported, got {0:?}.")]
    UnsupportedSource(String),
    #[error("Failed to create world '{0}'.")]
    WorldCreateFailed(String),
    #[error("Timed out waiting for {ticks} ticks. start={start} current={current} target={target}")]
    TickTimeout {
        ticks: u64,
        start: u64,
        current: u64,
        target: u64,
    },
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error("failed to encode response payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthFailed => ErrorCode::AuthFailed,
            Self::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            Self::AgentShaMismatch => ErrorCode::AgentShaMismatch,
            Self::InvalidArgument(_) | Self::Host(HostError::UnknownMaterial(_)) => {
                ErrorCode::InvalidArgument
            }
            Self::UnsupportedSource(_) => ErrorCode::UnsupportedSource,
            Self::WorldCreateFailed(_) => ErrorCode::WorldCreateFailed,
            Self::TickTimeout { .. } => ErrorCode::Timeout,
            Self::Host(_) | Self::Marshal(_) | Self::Encode(_) => ErrorCode::RequestFailed,
        }
    }
}

type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Clone)]
struct DispatchContext {
    config: AgentConfig,
    main_thread: MainThreadHandle<AgentState>,
    ticks: TickClock,
    server_version: String,
    wait_ticks_timeout: Duration,
}

/// Turns request lines into response values. Cheap to clone per connection.
#[derive(Clone)]
pub struct RequestDispatcher {
    context: Arc<DispatchContext>,
}

impl RequestDispatcher {
    pub fn new(
        config: AgentConfig,
        main_thread: MainThreadHandle<AgentState>,
        ticks: TickClock,
        server_version: String,
    ) -> Self {
        Self {
            context: Arc::new(DispatchContext {
                config,
                main_thread,
                ticks,
                server_version,
                wait_ticks_timeout: WAIT_TICKS_TIMEOUT,
            }),
        }
    }

    pub fn with_wait_ticks_timeout(mut self, timeout: Duration) -> Self {
        Arc::make_mut(&mut self.context).wait_ticks_timeout = timeout;
        self
    }

    pub fn handle_line(&self, line: &str) -> AgentResponse {
        match decode_request(line) {
            Ok(request) => self.dispatch(&request),
            Err(error) => {
                warn!(error = %error, "agent_request_malformed");
                AgentResponse::error(
                    UNKNOWN_REQUEST_ID,
                    ErrorCode::InvalidRequest,
                    format!("Invalid request: {error}"),
                )
            }
        }
    }

    pub fn dispatch(&self, request: &AgentRequest) -> AgentResponse {
        debug!(request_id = %request.request_id, action = %request.action, "agent_request");
        match self.route(request) {
            Ok(data) => AgentResponse::ok(&request.request_id, data),
            Err(error) => {
                let code = error.code();
                warn!(
                    request_id = %request.request_id,
                    action = %request.action,
                    code = %code,
                    error = %error,
                    "agent_request_failed"
                );
                AgentResponse::error(&request.request_id, code, error.to_string())
            }
        }
    }

    fn route(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        match request.action {
            Action::Handshake => self.handshake(request),
            Action::MainWorld => self.main_world(),
            Action::NewWorld => self.new_world(request),
            Action::ExecuteCommand => self.execute_command(request),
            Action::BlockType => self.block_type(request),
            Action::SetBlock => self.set_block(request),
            Action::CreatePlayer => self.create_player(request),
            Action::RemovePlayer => self.remove_player(request),
            Action::ExecutePlayerCommand => self.execute_player_command(request),
            Action::PlacePlayerBlock => self.place_player_block(request),
            Action::GetOpenMenu => self.open_menu(request),
            Action::ClickMenuSlot => self.click_menu_slot(request),
            Action::DragMenuSlots => self.drag_menu_slots(request),
            Action::GetPlayerMessages => self.player_messages(request),
            Action::WaitTicks => self.wait_ticks(request),
            Action::GetServerTick => Ok(string_map([(
                "tick",
                self.context.ticks.current().to_string(),
            )])),
        }
    }

    fn on_main_thread<T, F>(&self, task: F) -> DispatchResult<T>
    where
        F: FnOnce(&mut AgentState) -> DispatchResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.context
            .main_thread
            .call(self.context.config.sync_timeout, task)?
    }

    fn handshake(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let config = &self.context.config;
        if request.argument("token").unwrap_or("") != config.auth_token {
            return Err(DispatchError::AuthFailed);
        }
        let client_version = request.argument("protocolVersion").unwrap_or("");
        if client_version != config.protocol_version {
            return Err(DispatchError::ProtocolMismatch {
                expected: config.protocol_version.clone(),
                actual: client_version.to_string(),
            });
        }
        if let Some(expected) = &config.expected_agent_sha256 {
            let actual = request.argument("agentSha256").unwrap_or("");
            if !digests_match(expected, actual) {
                return Err(DispatchError::AgentShaMismatch);
            }
        }
        Ok(string_map([
            ("protocolVersion", config.protocol_version.clone()),
            ("serverVersion", self.context.server_version.clone()),
        ]))
    }

    fn main_world(&self) -> DispatchResult<ResponseData> {
        let world = self.on_main_thread(|state| {
            state
                .host()
                .main_world()
                .ok_or_else(|| HostError::Rejected("Server has no loaded worlds.".to_string()).into())
        })?;
        Ok(string_map([("worldName", world)]))
    }

    fn new_world(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let name = required_arg(request, "worldName")?;
        let world_type = parse_enum_arg(request, "worldType", WorldType::parse)?.unwrap_or_default();
        let environment =
            parse_enum_arg(request, "environment", WorldEnvironment::parse)?.unwrap_or_default();
        let seed = parse_arg::<i64>(request, "seed")?.unwrap_or(0);
        let create = WorldCreateRequest {
            name: name.clone(),
            world_type,
            environment,
            seed,
        };

        let created = self.on_main_thread(move |state| Ok(state.host_mut().create_world(&create)))?;
        let world = created.ok_or(DispatchError::WorldCreateFailed(name))?;
        Ok(string_map([("worldName", world)]))
    }

    fn execute_command(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let command = required_arg(request, "command")?;
        let source = request.argument("source").unwrap_or("CONSOLE").trim();
        if !source.eq_ignore_ascii_case("CONSOLE") {
            return Err(DispatchError::UnsupportedSource(source.to_string()));
        }
        let command = strip_command_slash(&command).to_string();
        let success =
            self.on_main_thread(move |state| Ok(state.host_mut().dispatch_console_command(&command)))?;
        Ok(string_map([("success", success.to_string())]))
    }

    fn block_type(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let world = required_arg(request, "worldName")?;
        let pos = block_pos_args(request)?;
        let material = self.on_main_thread(move |state| Ok(state.host().block_type(&world, pos)?))?;
        Ok(string_map([("material", material)]))
    }

    fn set_block(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let world = required_arg(request, "worldName")?;
        let raw_material = required_arg(request, "material")?;
        let pos = block_pos_args(request)?;
        let material = self.on_main_thread(move |state| {
            let host = state.host_mut();
            let material = resolve_material(host.resolve_material(&raw_material), &raw_material)?;
            host.set_block(&world, pos, &material)?;
            Ok(host.block_type(&world, pos)?)
        })?;
        Ok(string_map([("material", material)]))
    }

    fn create_player(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let name = required_arg(request, "name")?;
        let world = required_arg(request, "worldName")?;
        let id = match optional_arg(request, "uuid") {
            Some(raw) => parse_uuid(raw)?,
            None => Uuid::new_v4(),
        };
        let location = match (
            parse_arg::<f64>(request, "x")?,
            parse_arg::<f64>(request, "y")?,
            parse_arg::<f64>(request, "z")?,
        ) {
            (Some(x), Some(y), Some(z)) => Some(Location::new(x, y, z)),
            _ => None,
        };
        let health = parse_arg::<f64>(request, "health")?;
        if let Some(health) = health {
            if !health.is_finite() || health <= 0.0 {
                return Err(DispatchError::InvalidArgument(
                    "Argument 'health' must be > 0.".to_string(),
                ));
            }
        }
        let permissions = request
            .argument("permissions")
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|permission| !permission.is_empty())
            .map(str::to_string)
            .collect();

        let spawn = PlayerSpawn {
            id,
            name,
            world,
            location,
            health,
            permissions,
        };
        let player = self.on_main_thread(move |state| Ok(state.spawn_player(&spawn)?))?;
        Ok(string_map([
            ("uuid", player.id.to_string()),
            ("name", player.name),
        ]))
    }

    fn remove_player(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let id = uuid_arg(request)?;
        self.on_main_thread(move |state| {
            if state.remove_player(id)? {
                Ok(())
            } else {
                Err(HostError::UnknownPlayer(id).into())
            }
        })?;
        Ok(string_map([("removed", "true")]))
    }

    fn execute_player_command(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let id = uuid_arg(request)?;
        let command = required_arg(request, "command")?;
        let command = strip_command_slash(&command).to_string();
        let success = self.on_main_thread(move |state| {
            state.require_player(id)?;
            Ok(state.host_mut().dispatch_player_command(id, &command)?)
        })?;
        Ok(string_map([("success", success.to_string())]))
    }

    fn place_player_block(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let id = uuid_arg(request)?;
        let raw_material = required_arg(request, "material")?;
        let pos = block_pos_args(request)?;
        let material = self.on_main_thread(move |state| {
            state.require_player(id)?;
            let host = state.host_mut();
            let material = resolve_material(host.resolve_material(&raw_material), &raw_material)?;
            let world = host.player_world(id)?;
            host.set_block(&world, pos, &material)?;
            Ok(normalize_material_key(&host.block_type(&world, pos)?))
        })?;
        Ok(string_map([("material", material)]))
    }

    fn open_menu(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let id = uuid_arg(request)?;
        let menu = self.on_main_thread(move |state| {
            state.require_player(id)?;
            Ok(state.host().open_menu(id)?)
        })?;
        let Some(menu) = menu else {
            return Ok(string_map([("open", "false")]));
        };
        Ok(string_map([
            ("open", "true".to_string()),
            ("title", menu.title),
            ("itemsJson", serde_json::to_string(&menu.items)?),
        ]))
    }

    fn click_menu_slot(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let id = uuid_arg(request)?;
        let slot = parse_arg::<i64>(request, "slot")?.unwrap_or(-1);
        let slot = usize::try_from(slot).map_err(|_| {
            DispatchError::InvalidArgument("Argument 'slot' must be >= 0.".to_string())
        })?;
        self.on_main_thread(move |state| {
            state.require_player(id)?;
            Ok(state.host_mut().click_menu_slot(id, slot)?)
        })?;
        Ok(string_map([("clicked", "true")]))
    }

    fn drag_menu_slots(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let id = uuid_arg(request)?;
        let raw_material = required_arg(request, "material")?;
        let slots = parse_slot_list(&required_arg(request, "slots")?)?;
        self.on_main_thread(move |state| {
            state.require_player(id)?;
            let host = state.host_mut();
            let material = resolve_material(host.resolve_material(&raw_material), &raw_material)?;
            Ok(host.drag_menu_slots(id, &material, &slots)?)
        })?;
        Ok(string_map([("dragged", "true")]))
    }

    fn player_messages(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let id = uuid_arg(request)?;
        let messages = self.on_main_thread(move |state| Ok(state.drain_messages(id)?))?;
        Ok(string_map([("messagesJson", serde_json::to_string(&messages)?)]))
    }

    /// Polls the tick clock off the main thread so the update loop keeps running.
    fn wait_ticks(&self, request: &AgentRequest) -> DispatchResult<ResponseData> {
        let ticks = parse_arg::<i64>(request, "ticks")?.unwrap_or(0);
        let ticks = u64::try_from(ticks).map_err(|_| {
            DispatchError::InvalidArgument("Argument 'ticks' must be >= 0.".to_string())
        })?;
        let clock = &self.context.ticks;
        let start = clock.current();
        let target = start.saturating_add(ticks);
        let deadline = Instant::now() + self.context.wait_ticks_timeout;
        while clock.current() < target {
            if Instant::now() >= deadline {
                return Err(DispatchError::TickTimeout {
                    ticks,
                    start,
                    current: clock.current(),
                    target,
                });
            }
            thread::sleep(WAIT_TICKS_POLL);
        }
        Ok(string_map([
            ("startTick", start.to_string()),
            ("endTick", clock.current().to_string()),
        ]))
    }
}

fn optional_arg<'a>(request: &'a AgentRequest, key: &str) -> Option<&'a str> {
    request
        .argument(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn required_arg(request: &AgentRequest, key: &str) -> DispatchResult<String> {
    optional_arg(request, key)
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidArgument(format!("Argument '{key}' must not be blank.")))
}

fn parse_arg<T: std::str::FromStr>(request: &AgentRequest, key: &str) -> DispatchResult<Option<T>> {
    optional_arg(request, key)
        .map(|raw| {
            raw.parse::<T>().map_err(|_| {
                DispatchError::InvalidArgument(format!("Argument '{key}' has invalid value '{raw}'."))
            })
        })
        .transpose()
}

fn parse_enum_arg<T>(
    request: &AgentRequest,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> DispatchResult<Option<T>> {
    optional_arg(request, key)
        .map(|raw| {
            parse(raw).ok_or_else(|| {
                DispatchError::InvalidArgument(format!("Argument '{key}' has invalid value '{raw}'."))
            })
        })
        .transpose()
}

fn parse_uuid(raw: &str) -> DispatchResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| DispatchError::InvalidArgument(format!("Argument 'uuid' is not a UUID: '{raw}'.")))
}

fn uuid_arg(request: &AgentRequest) -> DispatchResult<Uuid> {
    parse_uuid(&required_arg(request, "uuid")?)
}

fn block_pos_args(request: &AgentRequest) -> DispatchResult<BlockPos> {
    Ok(BlockPos::new(
        parse_arg(request, "x")?.unwrap_or(0),
        parse_arg(request, "y")?.unwrap_or(0),
        parse_arg(request, "z")?.unwrap_or(0),
    ))
}

fn parse_slot_list(raw: &str) -> DispatchResult<Vec<usize>> {
    let slots = raw
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value.parse::<usize>().map_err(|_| {
                DispatchError::InvalidArgument(format!("Argument 'slots' has invalid slot '{value}'."))
            })
        })
        .collect::<DispatchResult<Vec<_>>>()?;
    if slots.is_empty() {
        return Err(DispatchError::InvalidArgument(
            "Argument 'slots' must not be blank.".to_string(),
        ));
    }
    Ok(slots)
}

fn resolve_material(resolved: Option<String>, raw: &str) -> DispatchResult<String> {
    resolved.ok_or_else(|| DispatchError::InvalidArgument(format!("Unknown material '{raw}'.")))
}

fn strip_command_slash(command: &str) -> &str {
    command.strip_prefix('/').unwrap_or(command)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::JoinHandle;

    use testport_core::{Arguments, MenuItemSnapshot, PROTOCOL_VERSION};

    use super::*;
    use crate::main_thread::main_thread_channel;
    use crate::sim::{SimHost, SimPlatformAdapter, SIM_SERVER_VERSION};

    struct Harness {
        dispatcher: RequestDispatcher,
        running: Arc<AtomicBool>,
        pump: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn new(expected_sha: Option<&str>) -> Self {
            let config = AgentConfig {
                socket_path: PathBuf::from("/unused.sock"),
                auth_token: "secret".to_string(),
                protocol_version: PROTOCOL_VERSION.to_string(),
                expected_agent_sha256: expected_sha.map(str::to_string),
                sync_timeout: Duration::from_secs(5),
            };
            let (handle, queue) = main_thread_channel::<AgentState>();
            let ticks = TickClock::default();
            let running = Arc::new(AtomicBool::new(true));
            let pump = {
                let ticks = ticks.clone();
                let running = Arc::clone(&running);
                thread::spawn(move || {
                    let mut state =
                        AgentState::new(Box::new(SimHost::default()), Box::new(SimPlatformAdapter));
                    while running.load(Ordering::Acquire) {
                        queue.run_pending(&mut state);
                        ticks.advance();
                        thread::sleep(Duration::from_millis(2));
                    }
                })
            };
            Self {
                dispatcher: RequestDispatcher::new(config, handle, ticks, SIM_SERVER_VERSION.to_string())
                    .with_wait_ticks_timeout(Duration::from_millis(300)),
                running,
                pump: Some(pump),
            }
        }

        fn send(&self, action: Action, arguments: &[(&str, &str)]) -> AgentResponse {
            let arguments: Arguments = string_map(arguments.iter().copied());
            self.dispatcher
                .dispatch(&AgentRequest::new("req-1", action, arguments))
        }

        fn ok(&self, action: Action, arguments: &[(&str, &str)]) -> ResponseData {
            let response = self.send(action, arguments);
            assert!(response.success, "{action} failed: {response:?}");
            response.data
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.running.store(false, Ordering::Release);
            if let Some(pump) = self.pump.take() {
                let _ = pump.join();
            }
        }
    }

    fn error_code(response: &AgentResponse) -> Option<&str> {
        response.error_code.as_deref()
    }

    #[test]
    fn handshake_checks_token_before_version_and_digest() {
        let harness = Harness::new(Some("ABCDEF"));
        let both_wrong = harness.send(
            Action::Handshake,
            &[("token", "nope"), ("protocolVersion", "v0")],
        );
        assert_eq!(error_code(&both_wrong), Some("AUTH_FAILED"));

        let wrong_version = harness.send(
            Action::Handshake,
            &[("token", "secret"), ("protocolVersion", "v0")],
        );
        assert_eq!(error_code(&wrong_version), Some("PROTOCOL_MISMATCH"));

        let wrong_sha = harness.send(
            Action::Handshake,
            &[("token", "secret"), ("protocolVersion", "v1"), ("agentSha256", "123")],
        );
        assert_eq!(error_code(&wrong_sha), Some("AGENT_SHA_MISMATCH"));

        let data = harness.ok(
            Action::Handshake,
            &[("token", "secret"), ("protocolVersion", "v1"), ("agentSha256", "abcdef")],
        );
        assert_eq!(data.get("protocolVersion").map(String::as_str), Some("v1"));
        assert_eq!(
            data.get("serverVersion").map(String::as_str),
            Some(SIM_SERVER_VERSION)
        );
    }

    #[test]
    fn malformed_line_gets_unknown_request_id() {
        let harness = Harness::new(None);
        let response = harness.dispatcher.handle_line("{not json}\n");
        assert_eq!(response.request_id, UNKNOWN_REQUEST_ID);
        assert_eq!(error_code(&response), Some("INVALID_REQUEST"));

        let response = harness
            .dispatcher
            .handle_line(r#"{"requestId":"4","action":"GET_SERVER_TICK"}"#);
        assert!(response.success);
        assert_eq!(response.request_id, "4");
    }

    #[test]
    fn block_round_trip_and_argument_validation() {
        let harness = Harness::new(None);
        let set = harness.ok(
            Action::SetBlock,
            &[("worldName", "world"), ("x", "1"), ("y", "100"), ("z", "0"), ("material", "minecraft:stone")],
        );
        assert_eq!(set.get("material").map(String::as_str), Some("STONE"));
        let get = harness.ok(
            Action::BlockType,
            &[("worldName", "world"), ("x", "1"), ("y", "100"), ("z", "0")],
        );
        assert_eq!(get.get("material").map(String::as_str), Some("STONE"));

        let blank = harness.send(Action::SetBlock, &[("worldName", "world"), ("material", " ")]);
        assert_eq!(error_code(&blank), Some("INVALID_ARGUMENT"));
        let unknown = harness.send(Action::SetBlock, &[("worldName", "world"), ("material", "mud_pie")]);
        assert_eq!(error_code(&unknown), Some("INVALID_ARGUMENT"));
        let bad_x = harness.send(Action::BlockType, &[("worldName", "world"), ("x", "one")]);
        assert_eq!(error_code(&bad_x), Some("INVALID_ARGUMENT"));
        let missing_world = harness.send(Action::BlockType, &[("worldName", "atlantis")]);
        assert_eq!(error_code(&missing_world), Some("REQUEST_FAILED"));
    }

    #[test]
    fn console_commands_reject_other_sources_and_strip_slash() {
        let harness = Harness::new(None);
        let rejected = harness.send(
            Action::ExecuteCommand,
            &[("source", "PLAYER"), ("command", "say hi")],
        );
        assert_eq!(error_code(&rejected), Some("UNSUPPORTED_SOURCE"));

        let data = harness.ok(Action::ExecuteCommand, &[("command", "/say hi")]);
        assert_eq!(data.get("success").map(String::as_str), Some("true"));
        let data = harness.ok(Action::ExecuteCommand, &[("command", "fly away")]);
        assert_eq!(data.get("success").map(String::as_str), Some("false"));
    }

    #[test]
    fn world_creation_reports_failure_code() {
        let harness = Harness::new(None);
        let data = harness.ok(
            Action::NewWorld,
            &[("worldName", "arena"), ("worldType", "flat"), ("seed", "7")],
        );
        assert_eq!(data.get("worldName").map(String::as_str), Some("arena"));

        let refused = harness.send(Action::NewWorld, &[("worldName", "no spaces")]);
        assert_eq!(error_code(&refused), Some("WORLD_CREATE_FAILED"));
        let bad_env = harness.send(
            Action::NewWorld,
            &[("worldName", "arena2"), ("environment", "moon")],
        );
        assert_eq!(error_code(&bad_env), Some("INVALID_ARGUMENT"));
    }

    #[test]
    fn player_menu_and_message_flow() {
        let harness = Harness::new(None);
        let created = harness.ok(
            Action::CreatePlayer,
            &[("name", "menu_bot"), ("worldName", "world"), ("health", "10"), ("permissions", "a.b, c.d ,")],
        );
        let uuid = created.get("uuid").cloned().expect("uuid");
        let uuid = uuid.as_str();
        assert_eq!(created.get("name").map(String::as_str), Some("menu_bot"));

        let closed = harness.ok(Action::GetOpenMenu, &[("uuid", uuid)]);
        assert_eq!(closed.get("open").map(String::as_str), Some("false"));

        harness.ok(Action::ExecutePlayerCommand, &[("uuid", uuid), ("command", "/testgui")]);
        harness.ok(Action::ClickMenuSlot, &[("uuid", uuid), ("slot", "0")]);
        harness.ok(
            Action::DragMenuSlots,
            &[("uuid", uuid), ("material", "minecraft:stone"), ("slots", "3,4")],
        );
        let menu = harness.ok(Action::GetOpenMenu, &[("uuid", uuid)]);
        assert_eq!(menu.get("title").map(String::as_str), Some("Sub Menu"));
        let items: Vec<MenuItemSnapshot> =
            serde_json::from_str(menu.get("itemsJson").expect("items")).expect("parse items");
        assert!(items
            .iter()
            .any(|item| item.slot == 3 && item.material_key == "minecraft:stone"));

        let negative = harness.send(Action::ClickMenuSlot, &[("uuid", uuid), ("slot", "-1")]);
        assert_eq!(error_code(&negative), Some("INVALID_ARGUMENT"));
        let empty = harness.send(
            Action::DragMenuSlots,
            &[("uuid", uuid), ("material", "stone"), ("slots", " , ")],
        );
        assert_eq!(error_code(&empty), Some("INVALID_ARGUMENT"));

        let messages = harness.ok(Action::GetPlayerMessages, &[("uuid", uuid)]);
        let messages: Vec<String> =
            serde_json::from_str(messages.get("messagesJson").expect("messages")).expect("parse");
        assert_eq!(messages, vec!["You clicked Button 1".to_string()]);

        let placed = harness.ok(
            Action::PlacePlayerBlock,
            &[("uuid", uuid), ("material", "GLASS"), ("x", "2"), ("y", "90"), ("z", "2")],
        );
        assert_eq!(placed.get("material").map(String::as_str), Some("minecraft:glass"));

        harness.ok(Action::RemovePlayer, &[("uuid", uuid)]);
        let gone = harness.send(Action::RemovePlayer, &[("uuid", uuid)]);
        assert_eq!(error_code(&gone), Some("REQUEST_FAILED"));
        let bad_health = harness.send(
            Action::CreatePlayer,
            &[("name", "x"), ("worldName", "world"), ("health", "0")],
        );
        assert_eq!(error_code(&bad_health), Some("INVALID_ARGUMENT"));
    }

    #[test]
    fn wait_ticks_advances_and_times_out() {
        let harness = Harness::new(None);
        let data = harness.ok(Action::WaitTicks, &[("ticks", "3")]);
        let start: u64 = data.get("startTick").expect("start").parse().expect("start tick");
        let end: u64 = data.get("endTick").expect("end").parse().expect("end tick");
        assert!(end >= start + 3);

        let zero = harness.ok(Action::WaitTicks, &[("ticks", "0")]);
        assert!(zero.contains_key("endTick"));
        let negative = harness.send(Action::WaitTicks, &[("ticks", "-2")]);
        assert_eq!(error_code(&negative), Some("INVALID_ARGUMENT"));
        let too_long = harness.send(Action::WaitTicks, &[("ticks", "1000000")]);
        assert_eq!(error_code(&too_long), Some("TIMEOUT"));
    }

    #[test]
    fn main_thread_stall_is_request_failed() {
        let config = AgentConfig {
            socket_path: PathBuf::from("/unused.sock"),
            auth_token: "secret".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            expected_agent_sha256: None,
            sync_timeout: Duration::from_millis(20),
        };
        let (handle, _queue) = main_thread_channel::<AgentState>();
        let dispatcher =
            RequestDispatcher::new(config, handle, TickClock::default(), "test".to_string());
        let response = dispatcher.dispatch(&AgentRequest::new("1", Action::MainWorld, Arguments::new()));
        assert_eq!(error_code(&response), Some("REQUEST_FAILED"));
    }
}
