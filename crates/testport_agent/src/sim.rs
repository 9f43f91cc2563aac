//! In-memory game server used by the `sim_server` binary and by tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use testport_core::{
    normalize_material_key, BlockPos, Location, MenuItemSnapshot, WorldEnvironment, WorldType,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::host::{
    AdapterStrategy, GameHost, HostError, MenuView, PlatformAdapter, SpawnedPlayer,
    WorldCreateRequest,
};

pub const SIM_SERVER_VERSION: &str = "1.21.4-R0.1-SIM";
pub const MAIN_WORLD_NAME: &str = "world";
pub const MAIN_MENU_TITLE: &str = "Main Menu";
pub const SUB_MENU_TITLE: &str = "Sub Menu";
const MENU_SIZE: usize = 9;
const MAX_HEALTH: f64 = 20.0;

const MATERIALS: [&str; 20] = [
    "AIR",
    "BARRIER",
    "BEDROCK",
    "COBBLESTONE",
    "DIAMOND_BLOCK",
    "DIAMOND_SWORD",
    "DIRT",
    "EMERALD",
    "GLASS",
    "GOLD_BLOCK",
    "GRASS_BLOCK",
    "IRON_BLOCK",
    "OAK_LOG",
    "OAK_PLANKS",
    "OBSIDIAN",
    "REDSTONE_BLOCK",
    "SAND",
    "STONE",
    "TORCH",
    "WHITE_WOOL",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuKind {
    Main,
    Sub,
}

#[derive(Debug, Clone)]
struct SimMenu {
    kind: MenuKind,
    items: BTreeMap<usize, String>,
}

impl SimMenu {
    fn main() -> Self {
        Self {
            kind: MenuKind::Main,
            items: BTreeMap::from([(0, "STONE".to_string()), (2, "DIAMOND_SWORD".to_string())]),
        }
    }

    fn sub() -> Self {
        Self {
            kind: MenuKind::Sub,
            items: BTreeMap::from([
                (0, "BARRIER".to_string()),
                (2, "DIAMOND_SWORD".to_string()),
            ]),
        }
    }

    fn title(&self) -> &'static str {
        match self.kind {
            MenuKind::Main => MAIN_MENU_TITLE,
            MenuKind::Sub => SUB_MENU_TITLE,
        }
    }

    fn view(&self) -> MenuView {
        MenuView {
            title: self.title().to_string(),
            size: MENU_SIZE,
            items: self
                .items
                .iter()
                .map(|(slot, material)| MenuItemSnapshot {
                    slot: *slot as i32,
                    material_key: normalize_material_key(material),
                    display_name: None,
                    lore: Vec::new(),
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
struct SimWorld {
    world_type: WorldType,
    environment: WorldEnvironment,
    seed: i64,
    blocks: HashMap<BlockPos, String>,
}

impl SimWorld {
    fn new(world_type: WorldType, environment: WorldEnvironment, seed: i64) -> Self {
        Self {
            world_type,
            environment,
            seed,
            blocks: HashMap::new(),
        }
    }

    fn generated_block(&self, pos: BlockPos) -> &'static str {
        match (self.world_type, pos.y) {
            (_, -64) => "BEDROCK",
            (WorldType::Flat, -63..=-62) => "DIRT",
            (WorldType::Flat, -61) => "GRASS_BLOCK",
            (WorldType::Normal, y) if y < 60 => "STONE",
            _ => "AIR",
        }
    }

    fn spawn_location(&self) -> Location {
        match self.world_type {
            WorldType::Flat => Location::new(0.5, -60.0, 0.5),
            WorldType::Normal => Location::new(0.5, 60.0, 0.5),
        }
    }
}

#[derive(Debug)]
struct SimPlayer {
    name: String,
    world: String,
    location: Location,
    health: f64,
    permissions: BTreeSet<String>,
    outbound_chat: Vec<String>,
    menu: Option<SimMenu>,
}

/// Deterministic world/player/menu model standing in for a real server.
#[derive(Debug)]
pub struct SimHost {
    version: String,
    worlds: BTreeMap<String, SimWorld>,
    world_order: Vec<String>,
    players: HashMap<Uuid, SimPlayer>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new(SIM_SERVER_VERSION)
    }
}

impl SimHost {
    pub fn new(version: &str) -> Self {
        let mut host = Self {
            version: version.to_string(),
            worlds: BTreeMap::new(),
            world_order: Vec::new(),
            players: HashMap::new(),
        };
        host.insert_world(
            MAIN_WORLD_NAME.to_string(),
            SimWorld::new(WorldType::Normal, WorldEnvironment::Normal, 0),
        );
        host
    }

    pub fn world_names(&self) -> &[String] {
        &self.world_order
    }

    pub fn player_location(&self, player: Uuid) -> Option<Location> {
        self.players.get(&player).map(|state| state.location)
    }

    pub fn player_health(&self, player: Uuid) -> Option<f64> {
        self.players.get(&player).map(|state| state.health)
    }

    pub fn has_permission(&self, player: Uuid, permission: &str) -> bool {
        self.players
            .get(&player)
            .is_some_and(|state| state.permissions.contains(permission))
    }

    fn insert_world(&mut self, name: String, world: SimWorld) {
        info!(
            world = %name,
            world_type = world.world_type.as_str(),
            environment = world.environment.as_str(),
            seed = world.seed,
            "sim_world_loaded"
        );
        self.world_order.push(name.clone());
        self.worlds.insert(name, world);
    }

    fn world(&self, name: &str) -> Result<&SimWorld, HostError> {
        self.worlds
            .get(name)
            .ok_or_else(|| HostError::UnknownWorld(name.to_string()))
    }

    fn world_mut(&mut self, name: &str) -> Result<&mut SimWorld, HostError> {
        self.worlds
            .get_mut(name)
            .ok_or_else(|| HostError::UnknownWorld(name.to_string()))
    }

    fn player(&self, id: Uuid) -> Result<&SimPlayer, HostError> {
        self.players.get(&id).ok_or(HostError::UnknownPlayer(id))
    }

    fn player_mut(&mut self, id: Uuid) -> Result<&mut SimPlayer, HostError> {
        self.players.get_mut(&id).ok_or(HostError::UnknownPlayer(id))
    }

    fn broadcast(&mut self, line: &str) {
        info!(line, "sim_chat_broadcast");
        for player in self.players.values_mut() {
            player.outbound_chat.push(line.to_string());
        }
    }

    fn run_setblock(&mut self, args: &[&str]) -> bool {
        let [x, y, z, material] = args else {
            return false;
        };
        let (Ok(x), Ok(y), Ok(z)) = (x.parse(), y.parse(), z.parse()) else {
            return false;
        };
        let Some(material) = self.resolve_material(material) else {
            return false;
        };
        self.set_block(MAIN_WORLD_NAME, BlockPos::new(x, y, z), &material)
            .is_ok()
    }
}

fn split_command(command: &str) -> (String, Vec<&str>) {
    let mut parts = command.split_whitespace();
    let label = parts.next().unwrap_or_default().to_ascii_lowercase();
    (label, parts.collect())
}

fn is_valid_world_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
}

impl GameHost for SimHost {
    fn version(&self) -> String {
        self.version.clone()
    }

    fn main_world(&self) -> Option<String> {
        self.world_order.first().cloned()
    }

    fn create_world(&mut self, request: &WorldCreateRequest) -> Option<String> {
        if !is_valid_world_name(&request.name) {
            return None;
        }
        if !self.worlds.contains_key(&request.name) {
            self.insert_world(
                request.name.clone(),
                SimWorld::new(request.world_type, request.environment, request.seed),
            );
        }
        Some(request.name.clone())
    }

    fn spawn_location(&self, world: &str) -> Result<Location, HostError> {
        Ok(self.world(world)?.spawn_location())
    }

    fn resolve_material(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        let name = trimmed
            .strip_prefix(testport_core::types::MINECRAFT_NAMESPACE)
            .unwrap_or(trimmed)
            .to_ascii_uppercase();
        MATERIALS
            .iter()
            .find(|known| **known == name)
            .map(|known| known.to_string())
    }

    fn block_type(&self, world: &str, pos: BlockPos) -> Result<String, HostError> {
        let world = self.world(world)?;
        Ok(world
            .blocks
            .get(&pos)
            .cloned()
            .unwrap_or_else(|| world.generated_block(pos).to_string()))
    }

    fn set_block(&mut self, world: &str, pos: BlockPos, material: &str) -> Result<(), HostError> {
        let material = self
            .resolve_material(material)
            .ok_or_else(|| HostError::UnknownMaterial(material.to_string()))?;
        self.world_mut(world)?.blocks.insert(pos, material);
        Ok(())
    }

    fn dispatch_console_command(&mut self, command: &str) -> bool {
        let (label, args) = split_command(command);
        debug!(command, "sim_console_command");
        match label.as_str() {
            "say" if !args.is_empty() => {
                self.broadcast(&format!("[Server] {}", args.join(" ")));
                true
            }
            "setblock" => self.run_setblock(&args),
            "list" => {
                info!(players = self.players.len(), "sim_player_list");
                true
            }
            _ => false,
        }
    }

    fn dispatch_player_command(&mut self, player: Uuid, command: &str) -> Result<bool, HostError> {
        let (label, args) = split_command(command);
        let name = self.player(player)?.name.clone();
        match label.as_str() {
            "testgui" | "testport:testgui" => {
                self.player_mut(player)?.menu = Some(SimMenu::main());
                Ok(true)
            }
            "say" if !args.is_empty() => {
                self.broadcast(&format!("[{name}] {}", args.join(" ")));
                Ok(true)
            }
            "checkperm" => {
                let [node] = args.as_slice() else {
                    return Ok(false);
                };
                let state = self.player_mut(player)?;
                let verdict = if state.permissions.contains(*node) {
                    "granted"
                } else {
                    "denied"
                };
                state.outbound_chat.push(format!("Permission {node}: {verdict}"));
                Ok(true)
            }
            _ => {
                self.player_mut(player)?
                    .outbound_chat
                    .push("Unknown or incomplete command".to_string());
                Ok(false)
            }
        }
    }

    fn join_player(
        &mut self,
        player: &SpawnedPlayer,
        world: &str,
        location: Location,
    ) -> Result<(), HostError> {
        self.world(world)?;
        if self.players.contains_key(&player.id) {
            return Err(HostError::DuplicatePlayer(player.id));
        }
        self.players.insert(
            player.id,
            SimPlayer {
                name: player.name.clone(),
                world: world.to_string(),
                location,
                health: MAX_HEALTH,
                permissions: BTreeSet::new(),
                outbound_chat: Vec::new(),
                menu: None,
            },
        );
        Ok(())
    }

    fn leave_player(&mut self, player: Uuid) -> Result<(), HostError> {
        self.players
            .remove(&player)
            .map(|_| ())
            .ok_or(HostError::UnknownPlayer(player))
    }

    fn player_world(&self, player: Uuid) -> Result<String, HostError> {
        Ok(self.player(player)?.world.clone())
    }

    fn set_player_health(&mut self, player: Uuid, health: f64) -> Result<(), HostError> {
        if !health.is_finite() || health <= 0.0 {
            return Err(HostError::Rejected(format!("Invalid health {health}")));
        }
        self.player_mut(player)?.health = health.min(MAX_HEALTH);
        Ok(())
    }

    fn grant_permissions(&mut self, player: Uuid, permissions: &[String]) -> Result<(), HostError> {
        self.player_mut(player)?
            .permissions
            .extend(permissions.iter().cloned());
        Ok(())
    }

    fn take_outbound_chat(&mut self, player: Uuid) -> Vec<String> {
        self.players
            .get_mut(&player)
            .map(|state| std::mem::take(&mut state.outbound_chat))
            .unwrap_or_default()
    }

    fn open_menu(&self, player: Uuid) -> Result<Option<MenuView>, HostError> {
        Ok(self.player(player)?.menu.as_ref().map(SimMenu::view))
    }

    fn click_menu_slot(&mut self, player: Uuid, slot: usize) -> Result<(), HostError> {
        let state = self.player_mut(player)?;
        let kind = state
            .menu
            .as_ref()
            .map(|menu| menu.kind)
            .ok_or(HostError::NoOpenMenu(player))?;
        if slot >= MENU_SIZE {
            return Err(HostError::SlotOutOfRange {
                slot,
                size: MENU_SIZE,
            });
        }
        match (kind, slot) {
            (MenuKind::Main, 0) => {
                state.outbound_chat.push("You clicked Button 1".to_string());
                state.menu = Some(SimMenu::sub());
            }
            (MenuKind::Sub, 0) => state.menu = Some(SimMenu::main()),
            (MenuKind::Sub, 2) => state.menu = None,
            _ => {}
        }
        Ok(())
    }

    fn drag_menu_slots(
        &mut self,
        player: Uuid,
        material: &str,
        slots: &[usize],
    ) -> Result<(), HostError> {
        let material = self
            .resolve_material(material)
            .ok_or_else(|| HostError::UnknownMaterial(material.to_string()))?;
        let state = self.player_mut(player)?;
        let menu = state.menu.as_mut().ok_or(HostError::NoOpenMenu(player))?;
        if let Some(slot) = slots.iter().copied().find(|slot| *slot >= MENU_SIZE) {
            return Err(HostError::SlotOutOfRange {
                slot,
                size: MENU_SIZE,
            });
        }
        for slot in slots {
            menu.items.insert(*slot, material.clone());
        }
        Ok(())
    }
}

/// Adapter for the simulated server: players join the in-memory model directly.
#[derive(Debug, Default)]
pub struct SimPlatformAdapter;

impl PlatformAdapter for SimPlatformAdapter {
    fn name(&self) -> &str {
        "sim"
    }

    fn spawn_player(
        &mut self,
        host: &mut dyn GameHost,
        id: Uuid,
        name: &str,
        world: &str,
        location: Location,
    ) -> Result<SpawnedPlayer, HostError> {
        let player = SpawnedPlayer {
            id,
            name: name.to_string(),
        };
        host.join_player(&player, world, location)?;
        Ok(player)
    }

    fn remove_player(
        &mut self,
        host: &mut dyn GameHost,
        player: &SpawnedPlayer,
    ) -> Result<(), HostError> {
        host.leave_player(player.id)
    }

    fn drain_received_messages(&mut self, host: &mut dyn GameHost, id: Uuid) -> Vec<String> {
        host.take_outbound_chat(id)
    }
}

pub struct SimAdapterStrategy;

impl AdapterStrategy for SimAdapterStrategy {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn supports(&self, host_version: &str) -> bool {
        host_version.ends_with("-SIM")
    }

    fn create(&self) -> Box<dyn PlatformAdapter> {
        Box::new(SimPlatformAdapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AgentState, PlayerSpawn};

    fn spawn(name: &str) -> PlayerSpawn {
        PlayerSpawn {
            id: Uuid::new_v4(),
            name: name.to_string(),
            world: MAIN_WORLD_NAME.to_string(),
            location: None,
            health: None,
            permissions: Vec::new(),
        }
    }

    #[test]
    fn generated_terrain_and_overrides() {
        let mut host = SimHost::default();
        assert_eq!(host.block_type("world", BlockPos::new(0, 100, 0)).expect("air"), "AIR");
        assert_eq!(host.block_type("world", BlockPos::new(0, 10, 0)).expect("stone"), "STONE");

        host.set_block("world", BlockPos::new(1, 100, 0), "minecraft:glass")
            .expect("set");
        assert_eq!(host.block_type("world", BlockPos::new(1, 100, 0)).expect("glass"), "GLASS");
        assert_eq!(
            host.set_block("world", BlockPos::new(0, 0, 0), "unobtainium"),
            Err(HostError::UnknownMaterial("unobtainium".to_string()))
        );
        assert!(matches!(
            host.block_type("nether", BlockPos::default()),
            Err(HostError::UnknownWorld(_))
        ));
    }

    #[test]
    fn world_creation_refuses_invalid_names_and_reuses_existing() {
        let mut host = SimHost::default();
        let request = WorldCreateRequest {
            name: "flatland".to_string(),
            world_type: WorldType::Flat,
            environment: WorldEnvironment::Normal,
            seed: 42,
        };
        assert_eq!(host.create_world(&request), Some("flatland".to_string()));
        assert_eq!(host.create_world(&request), Some("flatland".to_string()));
        assert_eq!(host.world_names(), ["world", "flatland"]);
        assert_eq!(
            host.block_type("flatland", BlockPos::new(0, -61, 0)).expect("grass"),
            "GRASS_BLOCK"
        );

        let invalid = WorldCreateRequest {
            name: "bad name/".to_string(),
            ..request
        };
        assert_eq!(host.create_world(&invalid), None);
    }

    #[test]
    fn test_menu_navigation_matches_button_layout() {
        let mut state = AgentState::new(Box::new(SimHost::default()), Box::new(SimPlatformAdapter));
        let player = state.spawn_player(&spawn("menu_bot")).expect("spawn");
        let host = state.host_mut();

        assert!(host.dispatch_player_command(player.id, "testgui").expect("command"));
        let menu = host.open_menu(player.id).expect("menu").expect("open");
        assert_eq!(menu.title, MAIN_MENU_TITLE);
        assert_eq!(menu.items[0].material_key, "minecraft:stone");

        host.click_menu_slot(player.id, 0).expect("click button");
        let menu = host.open_menu(player.id).expect("menu").expect("open");
        assert_eq!(menu.title, SUB_MENU_TITLE);

        host.drag_menu_slots(player.id, "minecraft:stone", &[3, 4, 5])
            .expect("drag");
        let menu = host.open_menu(player.id).expect("menu").expect("open");
        let slots: Vec<i32> = menu.items.iter().map(|item| item.slot).collect();
        assert_eq!(slots, vec![0, 2, 3, 4, 5]);

        host.click_menu_slot(player.id, 2).expect("close");
        assert!(host.open_menu(player.id).expect("menu").is_none());
        assert_eq!(
            state.drain_messages(player.id).expect("messages"),
            vec!["You clicked Button 1".to_string()]
        );
        assert!(state.drain_messages(player.id).expect("drained").is_empty());
    }

    #[test]
    fn spawn_applies_health_and_permissions_and_cleanup_removes_all() {
        let mut state = AgentState::new(Box::new(SimHost::default()), Box::new(SimPlatformAdapter));
        let mut profile = spawn("perm_bot");
        profile.health = Some(50.0);
        profile.permissions = vec!["minecraft.command.time".to_string()];
        let player = state.spawn_player(&profile).expect("spawn");
        state.spawn_player(&spawn("other_bot")).expect("spawn other");

        assert!(state
            .host_mut()
            .dispatch_player_command(player.id, "checkperm minecraft.command.time")
            .expect("checkperm"));
        assert_eq!(
            state.drain_messages(player.id).expect("messages"),
            vec!["Permission minecraft.command.time: granted".to_string()]
        );
        assert_eq!(state.spawn_player(&profile), Err(HostError::DuplicatePlayer(player.id)));

        assert_eq!(state.remove_all_players(), 2);
        assert_eq!(state.synthetic_player_count(), 0);
        assert!(matches!(
            state.host().player_world(player.id),
            Err(HostError::UnknownPlayer(_))
        ));
    }

    #[test]
    fn console_say_reaches_every_player() {
        let mut state = AgentState::new(Box::new(SimHost::default()), Box::new(SimPlatformAdapter));
        let first = state.spawn_player(&spawn("first")).expect("spawn");
        let second = state.spawn_player(&spawn("second")).expect("spawn");

        assert!(state.host_mut().dispatch_console_command("say hello there"));
        assert!(!state.host_mut().dispatch_console_command("teleport everyone"));
        for id in [first.id, second.id] {
            assert_eq!(
                state.drain_messages(id).expect("messages"),
                vec!["[Server] hello there".to_string()]
            );
        }
    }
}
