//! Wire contract and shared runtime data for the testport harness.

pub mod atomic_io;
pub mod hashing;
pub mod manifest;
pub mod protocol;
pub mod types;

pub use manifest::{ManifestError, PreloadedWorld, RuntimeManifest, DEFAULT_MEMORY_MB};
pub use protocol::{
    decode_request, decode_response, encode_line, string_map, Action, AgentRequest,
    AgentResponse, Arguments, ErrorCode, ResponseData, PROTOCOL_VERSION, UNKNOWN_REQUEST_ID,
};
pub use types::{
    normalize_material_key, BlockPos, Location, MenuItemSnapshot, WorldEnvironment, WorldType,
};
