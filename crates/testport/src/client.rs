use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use testport_core::{
    decode_response, encode_line, string_map, Action, AgentRequest, AgentResponse, Arguments,
    BlockPos, ErrorCode, MenuItemSnapshot, WorldEnvironment, WorldType,
};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to agent socket {path} within {timeout:?}: {last_error}")]
    Connect {
        path: PathBuf,
        timeout: Duration,
        last_error: String,
    },
    #[error("agent socket I/O failed during {action}: {source}")]
    Io {
        action: Action,
        #[source]
        source: io::Error,
    },
    #[error("agent closed the connection during {action}")]
    Closed { action: Action },
    #[error("agent connection was closed by the client")]
    ClientClosed,
    #[error("agent connection is unusable after an earlier protocol failure")]
    ConnectionPoisoned,
    #[error("failed to encode {action} request: {source}")]
    Encode {
        action: Action,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {action} response {line:?}: {source}")]
    Decode {
        action: Action,
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response id {actual:?} does not match request id {expected:?}")]
    ResponseIdMismatch { expected: String, actual: String },
    #[error("agent rejected {action} with {code}: {message}")]
    Remote {
        action: Action,
        code: String,
        message: String,
    },
    #[error("{action} response is missing field {field}")]
    MissingField { action: Action, field: &'static str },
    #[error("{action} response field {field} has invalid value {value:?}")]
    InvalidField {
        action: Action,
        field: &'static str,
        value: String,
    },
}

impl ClientError {
    /// Known error code of a remote failure.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote { code, .. } => ErrorCode::parse(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub protocol_version: String,
    pub server_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatePlayerRequest {
    pub name: String,
    pub uuid: Uuid,
    pub world: String,
    pub position: Option<(f64, f64, f64)>,
    pub health: Option<f64>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPlayer {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MenuSnapshot {
    pub open: bool,
    pub title: Option<String>,
    pub items: Vec<MenuItemSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSpan {
    pub start_tick: u64,
    pub end_tick: u64,
}

struct Session {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    poisoned: bool,
    closed: bool,
}

/// Blocking client for the agent socket. Calls are serialized; one request in flight.
pub struct AgentClient {
    socket_path: PathBuf,
    session: Mutex<Session>,
    next_request_id: AtomicU64,
}

impl AgentClient {
    /// Retries every [`CONNECT_RETRY_INTERVAL`] until the agent accepts or `timeout` passes.
    pub fn connect(socket_path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            let error = match UnixStream::connect(socket_path) {
                Ok(stream) => match Self::from_stream(socket_path, stream) {
                    Ok(client) => {
                        debug!(path = %socket_path.display(), attempts, "agent_client_connected");
                        return Ok(client);
                    }
                    Err(error) => error,
                },
                Err(error) => error,
            };
            if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
                return Err(ClientError::Connect {
                    path: socket_path.to_path_buf(),
                    timeout,
                    last_error: error.to_string(),
                });
            }
            thread::sleep(CONNECT_RETRY_INTERVAL);
        }
    }

    fn from_stream(socket_path: &Path, stream: UnixStream) -> io::Result<Self> {
        stream.set_read_timeout(Some(DEFAULT_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(DEFAULT_IO_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            session: Mutex::new(Session {
                writer: stream,
                reader,
                poisoned: false,
                closed: false,
            }),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bounds every blocking read and write of a call.
    pub fn set_io_timeout(&self, timeout: Duration) -> io::Result<()> {
        let session = self.lock_session();
        session.writer.set_read_timeout(Some(timeout))?;
        session.writer.set_write_timeout(Some(timeout))
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock_session().poisoned
    }

    /// Sends one request and returns the successful response.
    pub fn send(&self, action: Action, arguments: Arguments) -> Result<AgentResponse, ClientError> {
        let mut session = self.lock_session();
        if session.closed {
            return Err(ClientError::ClientClosed);
        }
        if session.poisoned {
            return Err(ClientError::ConnectionPoisoned);
        }

        let request_id = self
            .next_request_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let request = AgentRequest::new(request_id.clone(), action, arguments);
        let line =
            encode_line(&request).map_err(|source| ClientError::Encode { action, source })?;

        let exchanged = exchange_line(&mut session, &line, action);
        let raw = match exchanged {
            Ok(raw) => raw,
            Err(error) => {
                session.poisoned = true;
                return Err(error);
            }
        };
        let response = match decode_response(&raw) {
            Ok(response) => response,
            Err(source) => {
                session.poisoned = true;
                return Err(ClientError::Decode {
                    action,
                    line: raw,
                    source,
                });
            }
        };
        if response.request_id != request_id {
            session.poisoned = true;
            warn!(
                expected = %request_id,
                actual = %response.request_id,
                "agent_client_response_id_mismatch"
            );
            return Err(ClientError::ResponseIdMismatch {
                expected: request_id,
                actual: response.request_id,
            });
        }
        drop(session);

        if !response.success {
            return Err(ClientError::Remote {
                action,
                code: response
                    .error_code
                    .unwrap_or_else(|| ErrorCode::RequestFailed.as_str().to_string()),
                message: response.error_message.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    /// Idempotent; later calls fail with [`ClientError::ClientClosed`].
    pub fn close(&self) {
        let mut session = self.lock_session();
        if session.closed {
            return;
        }
        session.closed = true;
        let _ = session.writer.shutdown(std::net::Shutdown::Both);
        debug!(path = %self.socket_path.display(), "agent_client_closed");
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn handshake(
        &self,
        token: &str,
        protocol_version: &str,
        agent_sha256: &str,
    ) -> Result<HandshakeInfo, ClientError> {
        let response = self.send(
            Action::Handshake,
            string_map([
                ("token", token),
                ("protocolVersion", protocol_version),
                ("agentSha256", agent_sha256),
            ]),
        )?;
        Ok(HandshakeInfo {
            protocol_version: required_field(&response, Action::Handshake, "protocolVersion")?
                .to_string(),
            server_version: response
                .data_value("serverVersion")
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub fn main_world(&self) -> Result<String, ClientError> {
        let response = self.send(Action::MainWorld, Arguments::new())?;
        Ok(required_field(&response, Action::MainWorld, "worldName")?.to_string())
    }

    pub fn new_world(
        &self,
        name: &str,
        world_type: WorldType,
        environment: WorldEnvironment,
        seed: i64,
    ) -> Result<String, ClientError> {
        let response = self.send(
            Action::NewWorld,
            string_map([
                ("worldName", name.to_string()),
                ("worldType", world_type.as_str().to_string()),
                ("environment", environment.as_str().to_string()),
                ("seed", seed.to_string()),
            ]),
        )?;
        Ok(required_field(&response, Action::NewWorld, "worldName")?.to_string())
    }

    pub fn execute_command(&self, source: &str, command: &str) -> Result<bool, ClientError> {
        let response = self.send(
            Action::ExecuteCommand,
            string_map([("source", source), ("command", command)]),
        )?;
        parse_field(&response, Action::ExecuteCommand, "success")
    }

    pub fn block_type(&self, world: &str, pos: BlockPos) -> Result<String, ClientError> {
        let mut arguments = position_arguments(pos);
        arguments.insert("worldName".to_string(), world.to_string());
        let response = self.send(Action::BlockType, arguments)?;
        Ok(required_field(&response, Action::BlockType, "material")?.to_string())
    }

    pub fn set_block(&self, world: &str, pos: BlockPos, material: &str) -> Result<String, ClientError> {
        let mut arguments = position_arguments(pos);
        arguments.insert("worldName".to_string(), world.to_string());
        arguments.insert("material".to_string(), material.to_string());
        let response = self.send(Action::SetBlock, arguments)?;
        Ok(required_field(&response, Action::SetBlock, "material")?.to_string())
    }

    pub fn create_player(&self, request: &CreatePlayerRequest) -> Result<CreatedPlayer, ClientError> {
        let mut arguments = string_map([
            ("name", request.name.clone()),
            ("uuid", request.uuid.to_string()),
            ("worldName", request.world.clone()),
        ]);
        if let Some((x, y, z)) = request.position {
            arguments.insert("x".to_string(), x.to_string());
            arguments.insert("y".to_string(), y.to_string());
            arguments.insert("z".to_string(), z.to_string());
        }
        if let Some(health) = request.health {
            arguments.insert("health".to_string(), health.to_string());
        }
        if !request.permissions.is_empty() {
            arguments.insert("permissions".to_string(), request.permissions.join(","));
        }

        let response = self.send(Action::CreatePlayer, arguments)?;
        Ok(CreatedPlayer {
            uuid: parse_field(&response, Action::CreatePlayer, "uuid")?,
            name: required_field(&response, Action::CreatePlayer, "name")?.to_string(),
        })
    }

    pub fn remove_player(&self, uuid: Uuid) -> Result<(), ClientError> {
        self.send(Action::RemovePlayer, uuid_arguments(uuid))?;
        Ok(())
    }

    pub fn execute_player_command(&self, uuid: Uuid, command: &str) -> Result<bool, ClientError> {
        let mut arguments = uuid_arguments(uuid);
        arguments.insert("command".to_string(), command.to_string());
        let response = self.send(Action::ExecutePlayerCommand, arguments)?;
        parse_field(&response, Action::ExecutePlayerCommand, "success")
    }

    pub fn place_player_block(
        &self,
        uuid: Uuid,
        material: &str,
        pos: BlockPos,
    ) -> Result<String, ClientError> {
        let mut arguments = position_arguments(pos);
        arguments.insert("uuid".to_string(), uuid.to_string());
        arguments.insert("material".to_string(), material.to_string());
        let response = self.send(Action::PlacePlayerBlock, arguments)?;
        Ok(required_field(&response, Action::PlacePlayerBlock, "material")?.to_string())
    }

    pub fn open_menu(&self, uuid: Uuid) -> Result<MenuSnapshot, ClientError> {
        let action = Action::GetOpenMenu;
        let response = self.send(action, uuid_arguments(uuid))?;
        if !parse_field::<bool>(&response, action, "open")? {
            return Ok(MenuSnapshot::default());
        }
        let items = match response.data_value("itemsJson") {
            Some(raw) => serde_json::from_str(raw).map_err(|_| ClientError::InvalidField {
                action,
                field: "itemsJson",
                value: raw.to_string(),
            })?,
            None => Vec::new(),
        };
        Ok(MenuSnapshot {
            open: true,
            title: response.data_value("title").map(str::to_string),
            items,
        })
    }

    pub fn click_menu_slot(&self, uuid: Uuid, slot: u32) -> Result<(), ClientError> {
        let mut arguments = uuid_arguments(uuid);
        arguments.insert("slot".to_string(), slot.to_string());
        self.send(Action::ClickMenuSlot, arguments)?;
        Ok(())
    }

    pub fn drag_menu_slots(&self, uuid: Uuid, material: &str, slots: &[u32]) -> Result<(), ClientError> {
        let mut arguments = uuid_arguments(uuid);
        arguments.insert("material".to_string(), material.to_string());
        let slots = slots
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        arguments.insert("slots".to_string(), slots);
        self.send(Action::DragMenuSlots, arguments)?;
        Ok(())
    }

    pub fn player_messages(&self, uuid: Uuid) -> Result<Vec<String>, ClientError> {
        let action = Action::GetPlayerMessages;
        let response = self.send(action, uuid_arguments(uuid))?;
        let raw = required_field(&response, action, "messagesJson")?;
        serde_json::from_str(raw).map_err(|_| ClientError::InvalidField {
            action,
            field: "messagesJson",
            value: raw.to_string(),
        })
    }

    pub fn wait_ticks(&self, ticks: u64) -> Result<TickSpan, ClientError> {
        let action = Action::WaitTicks;
        let response = self.send(action, string_map([("ticks", ticks.to_string())]))?;
        Ok(TickSpan {
            start_tick: parse_field(&response, action, "startTick")?,
            end_tick: parse_field(&response, action, "endTick")?,
        })
    }

    pub fn server_tick(&self) -> Result<u64, ClientError> {
        let response = self.send(Action::GetServerTick, Arguments::new())?;
        parse_field(&response, Action::GetServerTick, "tick")
    }
}

fn exchange_line(session: &mut Session, line: &str, action: Action) -> Result<String, ClientError> {
    session
        .writer
        .write_all(line.as_bytes())
        .and_then(|()| session.writer.flush())
        .map_err(|source| ClientError::Io { action, source })?;

    let mut response = String::new();
    match session.reader.read_line(&mut response) {
        Ok(0) => Err(ClientError::Closed { action }),
        Ok(_) => Ok(response),
        Err(source) => Err(ClientError::Io { action, source }),
    }
}

fn required_field<'a>(
    response: &'a AgentResponse,
    action: Action,
    field: &'static str,
) -> Result<&'a str, ClientError> {
    response
        .data_value(field)
        .ok_or(ClientError::MissingField { action, field })
}

fn parse_field<T: FromStr>(
    response: &AgentResponse,
    action: Action,
    field: &'static str,
) -> Result<T, ClientError> {
    let raw = required_field(response, action, field)?;
    raw.trim().parse::<T>().map_err(|_| ClientError::InvalidField {
        action,
        field,
        value: raw.to_string(),
    })
}

fn position_arguments(pos: BlockPos) -> Arguments {
    string_map([
        ("x", pos.x.to_string()),
        ("y", pos.y.to_string()),
        ("z", pos.z.to_string()),
    ])
}

fn uuid_arguments(uuid: Uuid) -> Arguments {
    string_map([("uuid", uuid.to_string())])
}
