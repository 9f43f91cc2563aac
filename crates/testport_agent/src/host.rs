//! Capabilities the agent needs from the game server it runs inside.

use testport_core::{BlockPos, Location, MenuItemSnapshot, WorldEnvironment, WorldType};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("World not found: {0}")]
    UnknownWorld(String),
    #[error("Player not found: {0}")]
    UnknownPlayer(Uuid),
    #[error("Unknown material: {0}")]
    UnknownMaterial(String),
    #[error("Player {0} has no open menu")]
    NoOpenMenu(Uuid),
    #[error("Slot {slot} is outside the open menu of {size} slots")]
    SlotOutOfRange { slot: usize, size: usize },
    #[error("Player already exists: {0}")]
    DuplicatePlayer(Uuid),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldCreateRequest {
    pub name: String,
    pub world_type: WorldType,
    pub environment: WorldEnvironment,
    pub seed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuView {
    pub title: String,
    pub size: usize,
    pub items: Vec<MenuItemSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedPlayer {
    pub id: Uuid,
    pub name: String,
}

/// Game-state operations. Every method is called on the server's main thread.
pub trait GameHost: Send {
    fn version(&self) -> String;
    fn main_world(&self) -> Option<String>;
    /// Returns the created world's name, or `None` when the server refused.
    fn create_world(&mut self, request: &WorldCreateRequest) -> Option<String>;
    fn spawn_location(&self, world: &str) -> Result<Location, HostError>;
    /// Canonical material name for a raw name or namespaced key.
    fn resolve_material(&self, raw: &str) -> Option<String>;
    fn block_type(&self, world: &str, pos: BlockPos) -> Result<String, HostError>;
    fn set_block(&mut self, world: &str, pos: BlockPos, material: &str) -> Result<(), HostError>;
    fn dispatch_console_command(&mut self, command: &str) -> bool;
    fn dispatch_player_command(&mut self, player: Uuid, command: &str) -> Result<bool, HostError>;

    fn join_player(
        &mut self,
        player: &SpawnedPlayer,
        world: &str,
        location: Location,
    ) -> Result<(), HostError>;
    fn leave_player(&mut self, player: Uuid) -> Result<(), HostError>;
    fn player_world(&self, player: Uuid) -> Result<String, HostError>;
    fn set_player_health(&mut self, player: Uuid, health: f64) -> Result<(), HostError>;
    fn grant_permissions(&mut self, player: Uuid, permissions: &[String]) -> Result<(), HostError>;
    /// Chat lines the server sent to the player since the last call.
    fn take_outbound_chat(&mut self, player: Uuid) -> Vec<String>;

    fn open_menu(&self, player: Uuid) -> Result<Option<MenuView>, HostError>;
    fn click_menu_slot(&mut self, player: Uuid, slot: usize) -> Result<(), HostError>;
    fn drag_menu_slots(
        &mut self,
        player: Uuid,
        material: &str,
        slots: &[usize],
    ) -> Result<(), HostError>;
}

/// Version-specific synthetic player plumbing.
pub trait PlatformAdapter: Send {
    fn name(&self) -> &str;
    fn spawn_player(
        &mut self,
        host: &mut dyn GameHost,
        id: Uuid,
        name: &str,
        world: &str,
        location: Location,
    ) -> Result<SpawnedPlayer, HostError>;
    fn remove_player(
        &mut self,
        host: &mut dyn GameHost,
        player: &SpawnedPlayer,
    ) -> Result<(), HostError>;
    fn drain_received_messages(&mut self, host: &mut dyn GameHost, id: Uuid) -> Vec<String>;
}

pub trait AdapterStrategy {
    fn name(&self) -> &'static str;
    fn supports(&self, host_version: &str) -> bool;
    fn create(&self) -> Box<dyn PlatformAdapter>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no platform adapter supports server version {version} (tried: {})", .tried.join(", "))]
pub struct UnsupportedPlatform {
    pub version: String,
    pub tried: Vec<&'static str>,
}

/// Picks the first strategy that supports the host version.
pub fn resolve_platform_adapter(
    strategies: &[Box<dyn AdapterStrategy>],
    host_version: &str,
) -> Result<Box<dyn PlatformAdapter>, UnsupportedPlatform> {
    strategies
        .iter()
        .find(|strategy| strategy.supports(host_version))
        .map(|strategy| strategy.create())
        .ok_or_else(|| UnsupportedPlatform {
            version: host_version.to_string(),
            tried: strategies.iter().map(|strategy| strategy.name()).collect(),
        })
}
