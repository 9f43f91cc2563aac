use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "v1";
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

pub const PROP_SOCKET_PATH: &str = "testport.agent.socketPath";
pub const PROP_AUTH_TOKEN: &str = "testport.agent.authToken";
pub const PROP_PROTOCOL_VERSION: &str = "testport.agent.protocolVersion";
pub const PROP_EXPECTED_SHA256: &str = "testport.agent.expectedSha256";
pub const PROP_SYNC_TIMEOUT_MS: &str = "testport.agent.syncTimeoutMs";

pub type Arguments = BTreeMap<String, String>;
pub type ResponseData = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Handshake,
    MainWorld,
    NewWorld,
    ExecuteCommand,
    BlockType,
    SetBlock,
    CreatePlayer,
    RemovePlayer,
    ExecutePlayerCommand,
    PlacePlayerBlock,
    GetOpenMenu,
    ClickMenuSlot,
    DragMenuSlots,
    GetPlayerMessages,
    WaitTicks,
    GetServerTick,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::MainWorld => "MAIN_WORLD",
            Self::NewWorld => "NEW_WORLD",
            Self::ExecuteCommand => "EXECUTE_COMMAND",
            Self::BlockType => "BLOCK_TYPE",
            Self::SetBlock => "SET_BLOCK",
            Self::CreatePlayer => "CREATE_PLAYER",
            Self::RemovePlayer => "REMOVE_PLAYER",
            Self::ExecutePlayerCommand => "EXECUTE_PLAYER_COMMAND",
            Self::PlacePlayerBlock => "PLACE_PLAYER_BLOCK",
            Self::GetOpenMenu => "GET_OPEN_MENU",
            Self::ClickMenuSlot => "CLICK_MENU_SLOT",
            Self::DragMenuSlots => "DRAG_MENU_SLOTS",
            Self::GetPlayerMessages => "GET_PLAYER_MESSAGES",
            Self::WaitTicks => "WAIT_TICKS",
            Self::GetServerTick => "GET_SERVER_TICK",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure classes carried in `errorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthFailed,
    ProtocolMismatch,
    AgentShaMismatch,
    InvalidRequest,
    InvalidArgument,
    UnsupportedSource,
    WorldCreateFailed,
    RequestFailed,
    Timeout,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        Self::AuthFailed,
        Self::ProtocolMismatch,
        Self::AgentShaMismatch,
        Self::InvalidRequest,
        Self::InvalidArgument,
        Self::UnsupportedSource,
        Self::WorldCreateFailed,
        Self::RequestFailed,
        Self::Timeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::ProtocolMismatch => "PROTOCOL_MISMATCH",
            Self::AgentShaMismatch => "AGENT_SHA_MISMATCH",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnsupportedSource => "UNSUPPORTED_SOURCE",
            Self::WorldCreateFailed => "WORLD_CREATE_FAILED",
            Self::RequestFailed => "REQUEST_FAILED",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == raw)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub request_id: String,
    pub action: Action,
    #[serde(default)]
    pub arguments: Arguments,
}

impl AgentRequest {
    pub fn new(request_id: impl Into<String>, action: Action, arguments: Arguments) -> Self {
        Self {
            request_id: request_id.into(),
            action,
            arguments,
        }
    }

    pub fn argument(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub data: ResponseData,
}

impl AgentResponse {
    pub fn ok(request_id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            error_code: None,
            error_message: None,
            data,
        }
    }

    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            error_code: Some(code.as_str().to_string()),
            error_message: Some(message.into()),
            data: ResponseData::new(),
        }
    }

    pub fn data_value(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_request(line: &str) -> Result<AgentRequest, serde_json::Error> {
    serde_json::from_str(trim_line_ending(line))
}

pub fn decode_response(line: &str) -> Result<AgentResponse, serde_json::Error> {
    serde_json::from_str(trim_line_ending(line))
}

pub fn trim_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Builds a flat argument or data map from string pairs.
pub fn string_map<K, V, I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}
